use chrono::NaiveDate;
use serde::Serialize;
use ulid::Ulid;

use crate::limits::ADMIN_PAGE_SIZE;
use crate::model::*;

use super::Engine;

/// One page of a listing, numbered from 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: usize,
    pub total_pages: usize,
    pub total: usize,
}

impl<T> Page<T> {
    /// Slice `all` into pages of `size`. Out-of-range page numbers are clamped.
    pub fn of(all: Vec<T>, page: usize, size: usize) -> Self {
        let total = all.len();
        let total_pages = total.div_ceil(size).max(1);
        let page = page.clamp(1, total_pages);
        let items = all
            .into_iter()
            .skip((page - 1) * size)
            .take(size)
            .collect();
        Self {
            items,
            page,
            total_pages,
            total,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub tables: usize,
    pub bookings: usize,
    pub cover_images: usize,
}

/// Newest first: date descending, then start time descending.
fn newest_first(bookings: &mut [Booking]) {
    bookings.sort_by(|a, b| b.date.cmp(&a.date).then(b.time.cmp(&a.time)));
}

impl Engine {
    pub async fn list_tables(&self) -> Vec<Table> {
        self.tables.read().await.clone()
    }

    /// Tables with the given ids, ascending by number. Deleted tables are skipped.
    pub async fn tables_by_ids(&self, ids: &[Ulid]) -> Vec<Table> {
        self.tables
            .read()
            .await
            .iter()
            .filter(|t| ids.contains(&t.id))
            .cloned()
            .collect()
    }

    pub async fn list_cover_images(&self) -> Vec<CoverImage> {
        self.cover_images.read().await.clone()
    }

    pub async fn get_booking(&self, id: &Ulid) -> Option<Booking> {
        let date = self.booking_date(id).ok()?;
        let day = self.get_day(&date)?;
        let guard = day.read().await;
        guard.get(id).cloned()
    }

    /// Bookings on one date in start-time order.
    pub async fn bookings_on(&self, date: NaiveDate) -> Vec<Booking> {
        match self.get_day(&date) {
            Some(day) => day.read().await.bookings.clone(),
            None => Vec::new(),
        }
    }

    async fn collect_bookings(&self, keep: impl Fn(&Booking) -> bool) -> Vec<Booking> {
        let days: Vec<_> = self.days.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for day in days {
            let guard = day.read().await;
            out.extend(guard.bookings.iter().filter(|b| keep(b)).cloned());
        }
        newest_first(&mut out);
        out
    }

    /// A customer's bookings, newest first.
    pub async fn bookings_for_customer(&self, customer_user: &str) -> Vec<Booking> {
        self.collect_bookings(|b| b.customer_user.as_deref() == Some(customer_user))
            .await
    }

    /// Every booking, newest first.
    pub async fn all_bookings(&self) -> Vec<Booking> {
        self.collect_bookings(|_| true).await
    }

    /// [`Engine::all_bookings`], `ADMIN_PAGE_SIZE` per page.
    pub async fn all_bookings_page(&self, page: usize) -> Page<Booking> {
        Page::of(self.all_bookings().await, page, ADMIN_PAGE_SIZE)
    }

    pub async fn stats(&self) -> EngineStats {
        EngineStats {
            tables: self.tables.read().await.len(),
            bookings: self.booking_dates.len(),
            cover_images: self.cover_images.read().await.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_slicing() {
        let p = Page::of((1..=23).collect::<Vec<_>>(), 3, 10);
        assert_eq!(p.items, vec![21, 22, 23]);
        assert_eq!((p.page, p.total_pages, p.total), (3, 3, 23));
    }

    #[test]
    fn page_clamps_out_of_range() {
        let p = Page::of((1..=5).collect::<Vec<_>>(), 9, 10);
        assert_eq!(p.page, 1);
        assert_eq!(p.items.len(), 5);

        let empty: Page<u32> = Page::of(Vec::new(), 0, 10);
        assert_eq!((empty.page, empty.total_pages, empty.total), (1, 1, 0));
        assert!(empty.items.is_empty());
    }
}
