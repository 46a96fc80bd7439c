use chrono::{NaiveDate, NaiveTime};
use ulid::Ulid;

use crate::model::*;

use super::planner::tables_needed;
use super::{Engine, EngineError};

/// Free tables for a slot and how many the party needs under the pairs heuristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Availability {
    /// Ascending by table number.
    pub tables: Vec<Table>,
    pub needed: usize,
}

impl Availability {
    pub fn is_sufficient(&self) -> bool {
        self.tables.len() >= self.needed
    }
}

/// All tables minus those held by bookings conflicting with `candidate`.
/// `tables` must be ascending by number; the order is kept.
pub fn free_tables(
    day: Option<&DayState>,
    tables: &[Table],
    candidate: &Slot,
    rule: OverlapRule,
    exclude: Option<Ulid>,
) -> Vec<Table> {
    let Some(day) = day else {
        return tables.to_vec();
    };
    let reserved = day.reserved_tables(candidate, rule, exclude);
    tables
        .iter()
        .filter(|t| !reserved.contains(&t.id))
        .cloned()
        .collect()
}

/// Free tables that seat the whole party on their own.
pub fn count_fitting(free: &[Table], guests: u32) -> usize {
    free.iter().filter(|t| t.capacity >= guests).count()
}

impl Engine {
    /// Free tables for `(date, time)` read from live state under read locks.
    /// `exclude` ignores one booking's own tables, for rescheduling.
    pub async fn free_tables_at(
        &self,
        date: NaiveDate,
        time: NaiveTime,
        exclude: Option<Ulid>,
    ) -> Vec<Table> {
        let candidate = Slot::standard(date, time);
        // Date lock before the table registry, like every writer.
        match self.get_day(&date) {
            Some(day) => {
                let day = day.read().await;
                let tables = self.tables.read().await;
                free_tables(Some(&day), &tables, &candidate, self.policy.overlap, exclude)
            }
            None => self.tables.read().await.clone(),
        }
    }

    /// Availability Resolver: free tables for the slot plus the pairs-heuristic count.
    pub async fn resolve(
        &self,
        date: NaiveDate,
        time: NaiveTime,
        guests: u32,
        exclude: Option<Ulid>,
    ) -> Result<Availability, EngineError> {
        let needed = tables_needed(guests)?;
        let tables = self.free_tables_at(date, time, exclude).await;
        Ok(Availability { tables, needed })
    }

    /// Count shown before submission: free tables that each seat `guests`.
    /// Stricter than what the allocator needs, which combines tables.
    pub async fn available_table_count(&self, date: NaiveDate, time: NaiveTime, guests: u32) -> usize {
        let free = self.free_tables_at(date, time, None).await;
        count_fitting(&free, guests)
    }
}
