use std::collections::HashSet;
use std::str::FromStr;

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::limits::BOOKING_DURATION_SECS;

/// Interval `[start, end)` a booking occupies. `end` may fall on the next calendar day;
/// `date` is the day the booking belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub date: NaiveDate,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl Slot {
    pub fn new(date: NaiveDate, time: NaiveTime, duration_secs: u32) -> Self {
        debug_assert!(duration_secs > 0, "Slot duration must be positive");
        let start = date.and_time(time);
        Self {
            date,
            start,
            end: start + Duration::seconds(i64::from(duration_secs)),
        }
    }

    /// Slot with the house booking duration.
    pub fn standard(date: NaiveDate, time: NaiveTime) -> Self {
        Self::new(date, time, BOOKING_DURATION_SECS)
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Slot) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// True if `other` starts inside `self`.
    pub fn contains_start_of(&self, other: &Slot) -> bool {
        self.start <= other.start && other.start < self.end
    }
}

/// How an existing booking is tested against a candidate slot. Bookings on different
/// dates never conflict under either rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OverlapRule {
    /// Existing booking conflicts only if it starts inside the candidate window.
    /// A booking that started earlier and is still running is NOT a conflict.
    #[default]
    StartWithin,
    /// Half-open interval intersection.
    Symmetric,
}

impl OverlapRule {
    pub fn conflicts(self, existing: &Slot, candidate: &Slot) -> bool {
        if existing.date != candidate.date {
            return false;
        }
        match self {
            OverlapRule::StartWithin => candidate.contains_start_of(existing),
            OverlapRule::Symmetric => existing.overlaps(candidate),
        }
    }
}

impl FromStr for OverlapRule {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "start_within" | "start-within" | "legacy" => Ok(OverlapRule::StartWithin),
            "symmetric" => Ok(OverlapRule::Symmetric),
            other => Err(format!("unknown overlap rule: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    pub id: Ulid,
    /// Display label, unique in the hall.
    pub number: u32,
    pub capacity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub name: String,
    pub email: String,
    pub phone_number: String,
    pub comments: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub duration_secs: u32,
    pub guests: u32,
    pub contact: Contact,
    /// Owning account, when booked through the public site.
    pub customer_user: Option<String>,
    /// Assigned tables, ascending by table number.
    pub table_ids: Vec<Ulid>,
}

impl Booking {
    pub fn slot(&self) -> Slot {
        Slot::new(self.date, self.time, self.duration_secs)
    }

    pub fn start(&self) -> NaiveDateTime {
        self.date.and_time(self.time)
    }

    pub fn uses_table(&self, table_id: &Ulid) -> bool {
        self.table_ids.contains(table_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverImage {
    pub id: Ulid,
    pub title: String,
    /// Path or URL of the image asset.
    pub image: String,
}

/// All bookings of one calendar day, sorted by start time.
#[derive(Debug, Clone)]
pub struct DayState {
    pub date: NaiveDate,
    pub bookings: Vec<Booking>,
}

impl DayState {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            bookings: Vec::new(),
        }
    }

    /// Insert keeping start-time order; equal start times keep arrival order.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self.bookings.partition_point(|b| b.time <= booking.time);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn get(&self, id: &Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == *id)
    }

    /// Bookings that conflict with `candidate` under `rule`.
    /// Anything starting at or after `candidate.end` is skipped by binary search.
    pub fn conflicting<'a>(
        &'a self,
        candidate: &'a Slot,
        rule: OverlapRule,
    ) -> impl Iterator<Item = &'a Booking> + 'a {
        let right = self
            .bookings
            .partition_point(|b| self.date.and_time(b.time) < candidate.end);
        self.bookings[..right]
            .iter()
            .filter(move |b| rule.conflicts(&b.slot(), candidate))
    }

    /// Table ids held by bookings conflicting with `candidate`, ignoring `exclude`.
    pub fn reserved_tables(
        &self,
        candidate: &Slot,
        rule: OverlapRule,
        exclude: Option<Ulid>,
    ) -> HashSet<Ulid> {
        self.conflicting(candidate, rule)
            .filter(|b| Some(b.id) != exclude)
            .flat_map(|b| b.table_ids.iter().copied())
            .collect()
    }
}

/// WAL record format. One record is one atomic state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    TableCreated {
        table: Table,
    },
    TableUpdated {
        table: Table,
    },
    TableDeleted {
        id: Ulid,
    },
    /// A booking together with its table links.
    BookingCommitted {
        booking: Booking,
    },
    BookingRescheduled {
        previous_date: NaiveDate,
        booking: Booking,
    },
    BookingCancelled {
        id: Ulid,
        date: NaiveDate,
    },
    CoverImageAdded {
        image: CoverImage,
    },
    CoverImageRemoved {
        id: Ulid,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::TableCreated { .. } => "table_created",
            Event::TableUpdated { .. } => "table_updated",
            Event::TableDeleted { .. } => "table_deleted",
            Event::BookingCommitted { .. } => "booking_committed",
            Event::BookingRescheduled { .. } => "booking_rescheduled",
            Event::BookingCancelled { .. } => "booking_cancelled",
            Event::CoverImageAdded { .. } => "cover_image_added",
            Event::CoverImageRemoved { .. } => "cover_image_removed",
        }
    }

    pub fn touches_tables(&self) -> bool {
        matches!(
            self,
            Event::TableCreated { .. } | Event::TableUpdated { .. } | Event::TableDeleted { .. }
        )
    }

    pub fn touches_cover_images(&self) -> bool {
        matches!(
            self,
            Event::CoverImageAdded { .. } | Event::CoverImageRemoved { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn t(s: &str) -> NaiveTime {
        NaiveTime::parse_from_str(s, "%H:%M").unwrap()
    }

    fn booking_at(date: &str, time: &str, tables: Vec<Ulid>) -> Booking {
        Booking {
            id: Ulid::new(),
            date: d(date),
            time: t(time),
            duration_secs: BOOKING_DURATION_SECS,
            guests: 2,
            contact: Contact {
                name: "Anna".into(),
                email: "anna@example.com".into(),
                phone_number: "+79990001122".into(),
                comments: None,
            },
            customer_user: None,
            table_ids: tables,
        }
    }

    #[test]
    fn slot_basics() {
        let s = Slot::standard(d("2024-01-01"), t("20:00"));
        assert_eq!(s.duration(), Duration::hours(2));
        assert_eq!(s.end, d("2024-01-01").and_time(t("22:00")));
    }

    #[test]
    fn slot_end_rolls_into_next_day() {
        let s = Slot::standard(d("2024-01-01"), t("23:00"));
        assert_eq!(s.end, d("2024-01-02").and_time(t("01:00")));
        assert_eq!(s.date, d("2024-01-01"));
    }

    #[test]
    fn slot_overlap_is_half_open() {
        let a = Slot::standard(d("2024-01-01"), t("18:00"));
        let b = Slot::standard(d("2024-01-01"), t("19:00"));
        let c = Slot::standard(d("2024-01-01"), t("20:00"));
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent
    }

    #[test]
    fn start_within_flags_later_start_inside_window() {
        let candidate = Slot::standard(d("2024-01-01"), t("20:00"));
        let existing = Slot::standard(d("2024-01-01"), t("21:00"));
        assert!(OverlapRule::StartWithin.conflicts(&existing, &candidate));
    }

    #[test]
    fn start_within_ignores_earlier_running_booking() {
        // 19:00-21:00 is still running at 20:00, but it started before the window.
        let candidate = Slot::standard(d("2024-01-01"), t("20:00"));
        let existing = Slot::standard(d("2024-01-01"), t("19:00"));
        assert!(!OverlapRule::StartWithin.conflicts(&existing, &candidate));
        assert!(OverlapRule::Symmetric.conflicts(&existing, &candidate));
    }

    #[test]
    fn start_within_includes_equal_start_excludes_end() {
        let candidate = Slot::standard(d("2024-01-01"), t("20:00"));
        let same = Slot::standard(d("2024-01-01"), t("20:00"));
        let at_end = Slot::standard(d("2024-01-01"), t("22:00"));
        assert!(OverlapRule::StartWithin.conflicts(&same, &candidate));
        assert!(!OverlapRule::StartWithin.conflicts(&at_end, &candidate));
    }

    #[test]
    fn different_dates_never_conflict() {
        // 23:00 runs past midnight but the next day's 00:00 booking belongs to another date.
        let late = Slot::standard(d("2024-01-01"), t("23:00"));
        let early = Slot::standard(d("2024-01-02"), t("00:00"));
        assert!(!OverlapRule::Symmetric.conflicts(&late, &early));
        assert!(!OverlapRule::StartWithin.conflicts(&early, &late));
    }

    #[test]
    fn late_candidate_window_does_not_wrap() {
        let candidate = Slot::standard(d("2024-01-01"), t("23:00"));
        let existing = Slot::standard(d("2024-01-01"), t("23:30"));
        assert!(OverlapRule::StartWithin.conflicts(&existing, &candidate));
    }

    #[test]
    fn overlap_rule_from_str() {
        assert_eq!("symmetric".parse::<OverlapRule>(), Ok(OverlapRule::Symmetric));
        assert_eq!("start_within".parse::<OverlapRule>(), Ok(OverlapRule::StartWithin));
        assert!("sideways".parse::<OverlapRule>().is_err());
    }

    #[test]
    fn day_keeps_bookings_sorted() {
        let mut day = DayState::new(d("2024-01-01"));
        day.insert_booking(booking_at("2024-01-01", "21:00", vec![]));
        day.insert_booking(booking_at("2024-01-01", "18:00", vec![]));
        day.insert_booking(booking_at("2024-01-01", "19:30", vec![]));
        let times: Vec<_> = day.bookings.iter().map(|b| b.time).collect();
        assert_eq!(times, vec![t("18:00"), t("19:30"), t("21:00")]);
    }

    #[test]
    fn day_remove_preserves_order() {
        let mut day = DayState::new(d("2024-01-01"));
        let a = booking_at("2024-01-01", "18:00", vec![]);
        let b = booking_at("2024-01-01", "19:00", vec![]);
        let c = booking_at("2024-01-01", "20:00", vec![]);
        let (ida, idb, idc) = (a.id, b.id, c.id);
        day.insert_booking(a);
        day.insert_booking(b);
        day.insert_booking(c);
        assert_eq!(day.remove_booking(idb).map(|b| b.id), Some(idb));
        assert!(day.remove_booking(Ulid::new()).is_none());
        let ids: Vec<_> = day.bookings.iter().map(|b| b.id).collect();
        assert_eq!(ids, vec![ida, idc]);
    }

    #[test]
    fn reserved_tables_collects_conflicting_links() {
        let (t1, t2, t3) = (Ulid::new(), Ulid::new(), Ulid::new());
        let mut day = DayState::new(d("2024-01-01"));
        day.insert_booking(booking_at("2024-01-01", "19:00", vec![t1]));
        day.insert_booking(booking_at("2024-01-01", "20:30", vec![t2]));
        day.insert_booking(booking_at("2024-01-01", "22:00", vec![t3]));

        let candidate = Slot::standard(d("2024-01-01"), t("20:00"));
        let legacy = day.reserved_tables(&candidate, OverlapRule::StartWithin, None);
        assert_eq!(legacy, HashSet::from([t2]));

        let symmetric = day.reserved_tables(&candidate, OverlapRule::Symmetric, None);
        assert_eq!(symmetric, HashSet::from([t1, t2]));
    }

    #[test]
    fn reserved_tables_skips_excluded_booking() {
        let t1 = Ulid::new();
        let mut day = DayState::new(d("2024-01-01"));
        let own = booking_at("2024-01-01", "20:00", vec![t1]);
        let own_id = own.id;
        day.insert_booking(own);
        let candidate = Slot::standard(d("2024-01-01"), t("20:00"));
        assert!(day
            .reserved_tables(&candidate, OverlapRule::StartWithin, Some(own_id))
            .is_empty());
    }

    #[test]
    fn event_helpers() {
        let table = Table {
            id: Ulid::new(),
            number: 1,
            capacity: 4,
        };
        let created = Event::TableCreated { table };
        assert!(created.touches_tables());
        assert!(!created.touches_cover_images());
        assert_eq!(created.name(), "table_created");
    }

    #[test]
    fn booking_event_survives_bincode() {
        let event = Event::BookingCommitted {
            booking: booking_at("2024-01-01", "20:00", vec![Ulid::new(), Ulid::new()]),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
