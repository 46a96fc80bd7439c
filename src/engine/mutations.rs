use std::time::Instant;

use chrono::{NaiveDate, NaiveTime};
use tokio::sync::{OwnedRwLockWriteGuard, oneshot};
use tracing::{debug, error, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{
    ALLOCATION_DURATION_SECONDS, BOOKINGS_CANCELLED_TOTAL, BOOKINGS_COMMITTED_TOTAL,
    BOOKINGS_REJECTED_TOTAL,
};

use super::availability::free_tables;
use super::conflict::{
    check_horizon, check_not_past, check_time_grid, now, validate_contact, validate_customer,
};
use super::planner::tables_needed;
use super::{Engine, EngineError, WalCommand, apply_cover_event, apply_table_event};

/// A booking to place: slot, party, contact, and optionally the exact tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationRequest {
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub guests: u32,
    pub contact: Contact,
    pub customer_user: Option<String>,
    /// Table numbers chosen by the caller. Empty lets the packing policy choose.
    pub tables: Vec<u32>,
}

impl ReservationRequest {
    /// Stateless checks. The past check runs first and wins over every other problem.
    fn check(&self) -> Result<(), EngineError> {
        let now = now();
        check_not_past(self.date, self.time, now)?;
        check_time_grid(self.time)?;
        check_horizon(self.date, now)?;
        tables_needed(self.guests)?;
        validate_contact(&self.contact)?;
        validate_customer(self.customer_user.as_deref())?;
        if self.tables.len() > MAX_TABLES {
            return Err(EngineError::LimitExceeded("too many tables requested"));
        }
        Ok(())
    }
}

/// Explicitly requested tables: each must exist and be free, and together they must
/// seat the party.
fn pick_requested(
    all: &[Table],
    free: &[Table],
    numbers: &[u32],
    guests: u32,
) -> Result<Vec<Table>, EngineError> {
    let mut numbers = numbers.to_vec();
    numbers.sort_unstable();
    numbers.dedup();

    let mut chosen = Vec::with_capacity(numbers.len());
    for n in numbers {
        if !all.iter().any(|t| t.number == n) {
            return Err(EngineError::invalid("tables", format!("Table {n} does not exist.")));
        }
        match free.iter().find(|t| t.number == n) {
            Some(t) => chosen.push(t.clone()),
            None => return Err(EngineError::TableUnavailable(n)),
        }
    }
    let seats: u32 = chosen.iter().map(|t| t.capacity).sum();
    if seats < guests {
        return Err(EngineError::invalid(
            "tables",
            format!("Selected tables seat {seats}, fewer than {guests} guests."),
        ));
    }
    Ok(chosen)
}

fn record_outcome<T>(kind: &'static str, result: &Result<T, EngineError>, started: Instant) {
    metrics::histogram!(ALLOCATION_DURATION_SECONDS, "kind" => kind)
        .record(started.elapsed().as_secs_f64());
    match result {
        Ok(_) => metrics::counter!(BOOKINGS_COMMITTED_TOTAL, "kind" => kind).increment(1),
        Err(e) => {
            metrics::counter!(BOOKINGS_REJECTED_TOTAL, "reason" => e.reason()).increment(1);
            match e {
                EngineError::WalError(_) => error!(kind, "allocation failed: {e}"),
                _ => debug!(kind, reason = e.reason(), "allocation rejected: {e}"),
            }
        }
    }
}

fn check_capacity(capacity: u32) -> Result<(), EngineError> {
    if !(MIN_TABLE_CAPACITY..=MAX_TABLE_CAPACITY).contains(&capacity) {
        return Err(EngineError::InvalidCapacity(capacity));
    }
    Ok(())
}

fn check_number(number: u32) -> Result<(), EngineError> {
    if number == 0 {
        return Err(EngineError::invalid("number", "Table number must be positive."));
    }
    Ok(())
}

impl Engine {
    /// Tables for `req` given the locked day and registry.
    fn choose_tables(
        &self,
        day: &DayState,
        tables: &[Table],
        req: &ReservationRequest,
        exclude: Option<Ulid>,
    ) -> Result<Vec<Table>, EngineError> {
        let candidate = Slot::standard(req.date, req.time);
        let free = free_tables(Some(day), tables, &candidate, self.policy.overlap, exclude);
        if req.tables.is_empty() {
            self.policy.packing.plan(&free, req.guests)
        } else {
            pick_requested(tables, &free, &req.tables, req.guests)
        }
    }

    /// Reservation Allocator. Validates, then resolves and commits under the date's write
    /// lock, so overlapping attempts are linearized. The booking and its table links are
    /// one WAL record.
    pub async fn allocate(&self, req: ReservationRequest) -> Result<Booking, EngineError> {
        let started = Instant::now();
        let date = req.date;
        let result = self.allocate_inner(req).await;
        if result.is_err() {
            self.release_day(date);
        }
        record_outcome("new", &result, started);
        result
    }

    async fn allocate_inner(&self, req: ReservationRequest) -> Result<Booking, EngineError> {
        req.check()?;

        let _gate = self.commit_gate.read().await;
        let day = self.day_or_create(req.date);
        let mut day = day.write().await;
        if day.bookings.len() >= MAX_BOOKINGS_PER_DAY {
            return Err(EngineError::LimitExceeded("too many bookings on this date"));
        }
        let tables = self.tables.read().await;
        let chosen = self.choose_tables(&day, &tables, &req, None)?;

        let booking = Booking {
            id: Ulid::new(),
            date: req.date,
            time: req.time,
            duration_secs: BOOKING_DURATION_SECS,
            guests: req.guests,
            contact: req.contact,
            customer_user: req.customer_user,
            table_ids: chosen.iter().map(|t| t.id).collect(),
        };
        let event = Event::BookingCommitted {
            booking: booking.clone(),
        };
        self.wal_append(&event).await?;
        day.insert_booking(booking.clone());
        self.link(&booking);
        drop(tables);
        drop(day);

        self.feed.send(&event);
        self.outbox.booking_confirmed(&booking);
        info!(
            booking = %booking.id,
            date = %booking.date,
            time = %booking.time,
            guests = booking.guests,
            tables = ?chosen.iter().map(|t| t.number).collect::<Vec<_>>(),
            "booking committed"
        );
        Ok(booking)
    }

    /// Write-lock two dates in ascending order. The second guard is `None` when the
    /// dates are equal.
    async fn lock_dates(
        &self,
        current: NaiveDate,
        target: NaiveDate,
    ) -> (
        OwnedRwLockWriteGuard<DayState>,
        Option<OwnedRwLockWriteGuard<DayState>>,
    ) {
        let current_day = self.day_or_create(current);
        if current == target {
            return (current_day.write_owned().await, None);
        }
        let target_day = self.day_or_create(target);
        if current < target {
            let a = current_day.write_owned().await;
            let b = target_day.write_owned().await;
            (a, Some(b))
        } else {
            let b = target_day.write_owned().await;
            let a = current_day.write_owned().await;
            (a, Some(b))
        }
    }

    /// Move a booking to a new slot and/or party. Its own tables don't count against it.
    pub async fn reschedule(&self, id: Ulid, req: ReservationRequest) -> Result<Booking, EngineError> {
        let started = Instant::now();
        let from = self.booking_date(&id).ok();
        let to = req.date;
        let result = self.reschedule_inner(id, req).await;
        for date in from.into_iter().chain([to]) {
            self.release_day(date);
        }
        record_outcome("reschedule", &result, started);
        result
    }

    async fn reschedule_inner(&self, id: Ulid, req: ReservationRequest) -> Result<Booking, EngineError> {
        req.check()?;

        let _gate = self.commit_gate.read().await;
        let mut date = self.booking_date(&id)?;
        loop {
            let (mut current_day, mut target_day) = self.lock_dates(date, req.date).await;
            let Some(current) = current_day.get(&id).cloned() else {
                // Moved or cancelled while we waited for the locks.
                let now_on = self.booking_date(&id)?;
                if now_on == date {
                    return Err(EngineError::NotFound(id));
                }
                date = now_on;
                continue;
            };
            if let Some(target) = &target_day
                && target.bookings.len() >= MAX_BOOKINGS_PER_DAY
            {
                return Err(EngineError::LimitExceeded("too many bookings on this date"));
            }

            let tables = self.tables.read().await;
            let target: &DayState = match &target_day {
                Some(g) => g,
                None => &current_day,
            };
            let chosen = self.choose_tables(target, &tables, &req, Some(id))?;

            let booking = Booking {
                id,
                date: req.date,
                time: req.time,
                duration_secs: current.duration_secs,
                guests: req.guests,
                contact: req.contact,
                customer_user: current.customer_user.clone().or(req.customer_user),
                table_ids: chosen.iter().map(|t| t.id).collect(),
            };
            let event = Event::BookingRescheduled {
                previous_date: date,
                booking: booking.clone(),
            };
            self.wal_append(&event).await?;
            current_day.remove_booking(id);
            self.unlink(&current);
            match target_day.as_mut() {
                Some(g) => g.insert_booking(booking.clone()),
                None => current_day.insert_booking(booking.clone()),
            }
            self.link(&booking);
            drop(tables);
            drop(target_day);
            drop(current_day);

            self.feed.send(&event);
            info!(
                booking = %id,
                from = %date,
                to = %booking.date,
                time = %booking.time,
                "booking rescheduled"
            );
            return Ok(booking);
        }
    }

    /// Delete a booking. Its tables are free again for that slot.
    pub async fn cancel_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let booking = self.cancel_inner(id).await?;
        self.release_day(booking.date);
        Ok(booking)
    }

    async fn cancel_inner(&self, id: Ulid) -> Result<Booking, EngineError> {
        let _gate = self.commit_gate.read().await;
        loop {
            let date = self.booking_date(&id)?;
            let day = self.get_day(&date).ok_or(EngineError::NotFound(id))?;
            let mut day = day.write().await;
            let Some(booking) = day.get(&id).cloned() else {
                if self.booking_date(&id)? == date {
                    return Err(EngineError::NotFound(id));
                }
                continue;
            };

            let event = Event::BookingCancelled { id, date };
            self.wal_append(&event).await?;
            day.remove_booking(id);
            self.unlink(&booking);
            drop(day);

            self.feed.send(&event);
            metrics::counter!(BOOKINGS_CANCELLED_TOTAL).increment(1);
            info!(booking = %id, date = %date, "booking cancelled");
            return Ok(booking);
        }
    }

    // ── Table registry ───────────────────────────────────

    /// True if a booking today or later references the table.
    /// Reliable only while the registry write lock is held.
    fn table_in_use(&self, table_id: &Ulid) -> bool {
        let today = now().date_naive();
        self.table_bookings.get(table_id).is_some_and(|ids| {
            ids.iter().any(|b| {
                self.booking_dates
                    .get(b)
                    .is_some_and(|d| *d.value() >= today)
            })
        })
    }

    pub async fn create_table(&self, number: u32, capacity: u32) -> Result<Table, EngineError> {
        check_number(number)?;
        check_capacity(capacity)?;
        let mut tables = self.tables.write().await;
        if tables.len() >= MAX_TABLES {
            return Err(EngineError::LimitExceeded("too many tables"));
        }
        if tables.iter().any(|t| t.number == number) {
            return Err(EngineError::DuplicateTableNumber(number));
        }
        let table = Table {
            id: Ulid::new(),
            number,
            capacity,
        };
        let event = Event::TableCreated {
            table: table.clone(),
        };
        self.wal_append(&event).await?;
        apply_table_event(&mut tables, &event);
        drop(tables);
        self.feed.send(&event);
        info!(table = %table.id, number, capacity, "table created");
        Ok(table)
    }

    /// Renumber or resize a table. Shrinking a table that upcoming bookings rely on is refused.
    pub async fn update_table(&self, id: Ulid, number: u32, capacity: u32) -> Result<Table, EngineError> {
        check_number(number)?;
        check_capacity(capacity)?;
        let mut tables = self.tables.write().await;
        let current = tables
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        if tables.iter().any(|t| t.number == number && t.id != id) {
            return Err(EngineError::DuplicateTableNumber(number));
        }
        if capacity < current.capacity && self.table_in_use(&id) {
            return Err(EngineError::TableInUse(id));
        }
        let table = Table { id, number, capacity };
        let event = Event::TableUpdated {
            table: table.clone(),
        };
        self.wal_append(&event).await?;
        apply_table_event(&mut tables, &event);
        drop(tables);
        self.feed.send(&event);
        info!(table = %id, number, capacity, "table updated");
        Ok(table)
    }

    pub async fn delete_table(&self, id: Ulid) -> Result<(), EngineError> {
        // The write lock waits out every in-flight allocation, so the index is settled.
        let mut tables = self.tables.write().await;
        if !tables.iter().any(|t| t.id == id) {
            return Err(EngineError::NotFound(id));
        }
        if self.table_in_use(&id) {
            return Err(EngineError::TableInUse(id));
        }
        let event = Event::TableDeleted { id };
        self.wal_append(&event).await?;
        apply_table_event(&mut tables, &event);
        drop(tables);
        self.feed.send(&event);
        info!(table = %id, "table deleted");
        Ok(())
    }

    // ── Cover images ─────────────────────────────────────

    pub async fn add_cover_image(&self, title: String, image: String) -> Result<CoverImage, EngineError> {
        let title = title.trim().to_string();
        let image = image.trim().to_string();
        if title.is_empty() {
            return Err(EngineError::invalid("title", "This field is required."));
        }
        if title.chars().count() > MAX_TITLE_LEN {
            return Err(EngineError::invalid(
                "title",
                format!("Title must be at most {MAX_TITLE_LEN} characters."),
            ));
        }
        if image.is_empty() {
            return Err(EngineError::invalid("image", "This field is required."));
        }
        if image.len() > MAX_IMAGE_PATH_LEN {
            return Err(EngineError::LimitExceeded("image path too long"));
        }
        let mut images = self.cover_images.write().await;
        if images.len() >= MAX_COVER_IMAGES {
            return Err(EngineError::LimitExceeded("too many cover images"));
        }
        let cover = CoverImage {
            id: Ulid::new(),
            title,
            image,
        };
        let event = Event::CoverImageAdded {
            image: cover.clone(),
        };
        self.wal_append(&event).await?;
        apply_cover_event(&mut images, &event);
        drop(images);
        self.feed.send(&event);
        Ok(cover)
    }

    pub async fn remove_cover_image(&self, id: Ulid) -> Result<(), EngineError> {
        let mut images = self.cover_images.write().await;
        if !images.iter().any(|i| i.id == id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::CoverImageRemoved { id };
        self.wal_append(&event).await?;
        apply_cover_event(&mut images, &event);
        drop(images);
        self.feed.send(&event);
        Ok(())
    }

    // ── WAL maintenance ──────────────────────────────────

    /// Rewrite the WAL as the minimal record set for the current state.
    ///
    /// Booking commits are shut out by the commit gate, every date is read-locked
    /// (ascending) and the table registry write-locked while the snapshot is taken and
    /// swapped in, so no commit can land between the two.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;
        let mut dates: Vec<_> = self.days.iter().map(|e| *e.key()).collect();
        dates.sort();
        let mut day_guards = Vec::with_capacity(dates.len());
        for date in &dates {
            if let Some(day) = self.get_day(date) {
                day_guards.push(day.read_owned().await);
            }
        }
        let tables = self.tables.write().await;
        let images = self.cover_images.read().await;

        let mut events: Vec<Event> = Vec::new();
        events.extend(tables.iter().map(|t| Event::TableCreated { table: t.clone() }));
        events.extend(images.iter().map(|i| Event::CoverImageAdded { image: i.clone() }));
        for day in &day_guards {
            events.extend(day.bookings.iter().map(|b| Event::BookingCommitted { booking: b.clone() }));
        }
        let records = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        info!(records, "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
