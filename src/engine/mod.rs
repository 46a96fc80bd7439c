mod availability;
mod conflict;
mod error;
mod mutations;
mod planner;
mod queries;
mod validator;
#[cfg(test)]
mod tests;

pub use availability::{Availability, count_fitting, free_tables};
pub use error::EngineError;
pub use mutations::ReservationRequest;
pub use planner::{EnginePolicy, PackingPolicy, tables_needed};
pub use queries::{EngineStats, Page};
pub use validator::{ContactMessage, ContactMessageForm, ReservationForm, ValidationErrors};
pub(crate) use validator::{parse_date, parse_table_numbers, parse_time};

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::feed::BookingFeed;
use crate::mailer::Outbox;
use crate::model::*;
use crate::observability::{WAL_FLUSH_BATCH_SIZE, WAL_FLUSH_DURATION_SECONDS};
use crate::wal::Wal;

pub type SharedDay = Arc<RwLock<DayState>>;

// ── Group-commit WAL channel ─────────────────────────────

type Reply = oneshot::Sender<io::Result<()>>;

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: Reply,
    },
    Compact {
        events: Vec<Event>,
        response: Reply,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Owns the WAL. Appends that queue up while one is being written share a single fsync;
/// nobody is answered before their record is on disk.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }
        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<(Event, Reply)>) {
    metrics::histogram!(WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();
    let (events, replies): (Vec<Event>, Vec<Reply>) = batch.into_iter().unzip();
    let result = wal.append_batch(&events);
    metrics::histogram!(WAL_FLUSH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!(records = events.len(), "WAL commit failed: {e}");
    }
    for tx in replies {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => commit_batch(wal, vec![(event, response)]),
    }
}

// ── State ────────────────────────────────────────────────

pub struct Engine {
    /// Held shared by every booking commit and exclusively by compaction, so a snapshot
    /// never misses a booking on a date it didn't know about. Taken before any date lock.
    pub(super) commit_gate: RwLock<()>,
    /// Bookings partitioned by calendar date. Each date is its own lock domain.
    pub(super) days: DashMap<NaiveDate, SharedDay>,
    /// Table registry, ascending by number. Locked after any date lock, never before.
    pub(super) tables: RwLock<Vec<Table>>,
    pub(super) cover_images: RwLock<Vec<CoverImage>>,
    /// booking id → date
    pub(super) booking_dates: DashMap<Ulid, NaiveDate>,
    /// table id → bookings that reference it
    pub(super) table_bookings: DashMap<Ulid, HashSet<Ulid>>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub feed: Arc<BookingFeed>,
    pub(super) outbox: Outbox,
    pub(super) policy: EnginePolicy,
}

/// Plain state rebuilt from the log before any lock exists.
#[derive(Default)]
struct Replayed {
    days: HashMap<NaiveDate, DayState>,
    tables: Vec<Table>,
    cover_images: Vec<CoverImage>,
}

impl Replayed {
    fn day(&mut self, date: NaiveDate) -> &mut DayState {
        self.days.entry(date).or_insert_with(|| DayState::new(date))
    }

    fn apply(&mut self, event: &Event) {
        match event {
            Event::TableCreated { .. } | Event::TableUpdated { .. } | Event::TableDeleted { .. } => {
                apply_table_event(&mut self.tables, event);
            }
            Event::CoverImageAdded { .. } | Event::CoverImageRemoved { .. } => {
                apply_cover_event(&mut self.cover_images, event);
            }
            Event::BookingCommitted { booking } => {
                self.day(booking.date).insert_booking(booking.clone());
            }
            Event::BookingRescheduled {
                previous_date,
                booking,
            } => {
                if let Some(day) = self.days.get_mut(previous_date) {
                    day.remove_booking(booking.id);
                }
                self.day(booking.date).insert_booking(booking.clone());
            }
            Event::BookingCancelled { id, date } => {
                if let Some(day) = self.days.get_mut(date) {
                    day.remove_booking(*id);
                }
            }
        }
    }
}

fn insert_by_number(tables: &mut Vec<Table>, table: Table) {
    let pos = tables.partition_point(|t| t.number < table.number);
    tables.insert(pos, table);
}

/// Apply a table registry event (caller holds the registry write lock).
pub(super) fn apply_table_event(tables: &mut Vec<Table>, event: &Event) {
    match event {
        Event::TableCreated { table } => insert_by_number(tables, table.clone()),
        Event::TableUpdated { table } => {
            tables.retain(|t| t.id != table.id);
            insert_by_number(tables, table.clone());
        }
        Event::TableDeleted { id } => tables.retain(|t| t.id != *id),
        _ => {}
    }
}

pub(super) fn apply_cover_event(images: &mut Vec<CoverImage>, event: &Event) {
    match event {
        Event::CoverImageAdded { image } => images.push(image.clone()),
        Event::CoverImageRemoved { id } => images.retain(|i| i.id != *id),
        _ => {}
    }
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        feed: Arc<BookingFeed>,
        outbox: Outbox,
        policy: EnginePolicy,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let mut replayed = Replayed::default();
        for event in &events {
            replayed.apply(event);
        }

        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            commit_gate: RwLock::new(()),
            days: DashMap::new(),
            tables: RwLock::new(replayed.tables),
            cover_images: RwLock::new(replayed.cover_images),
            booking_dates: DashMap::new(),
            table_bookings: DashMap::new(),
            wal_tx,
            feed,
            outbox,
            policy,
        };
        for (date, day) in replayed.days {
            if day.bookings.is_empty() {
                continue;
            }
            for booking in &day.bookings {
                engine.link(booking);
            }
            engine.days.insert(date, Arc::new(RwLock::new(day)));
        }
        tracing::info!(
            path = %wal_path.display(),
            records = events.len(),
            bookings = engine.booking_dates.len(),
            "engine state restored"
        );
        Ok(engine)
    }

    pub fn policy(&self) -> EnginePolicy {
        self.policy
    }

    /// Write one record through the group-commit writer and wait for fsync.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub(super) fn get_day(&self, date: &NaiveDate) -> Option<SharedDay> {
        self.days.get(date).map(|e| e.value().clone())
    }

    pub(super) fn day_or_create(&self, date: NaiveDate) -> SharedDay {
        self.days
            .entry(date)
            .or_insert_with(|| Arc::new(RwLock::new(DayState::new(date))))
            .value()
            .clone()
    }

    /// Drop a date that holds no bookings and that nobody else has a handle to.
    pub(super) fn release_day(&self, date: NaiveDate) {
        self.days.remove_if(&date, |_, day| {
            Arc::strong_count(day) == 1 && day.try_read().is_ok_and(|d| d.bookings.is_empty())
        });
    }

    pub(super) fn booking_date(&self, id: &Ulid) -> Result<NaiveDate, EngineError> {
        self.booking_dates
            .get(id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(*id))
    }

    /// Index a booking. Caller holds the booking's date write lock.
    pub(super) fn link(&self, booking: &Booking) {
        self.booking_dates.insert(booking.id, booking.date);
        for table_id in &booking.table_ids {
            self.table_bookings
                .entry(*table_id)
                .or_default()
                .insert(booking.id);
        }
    }

    pub(super) fn unlink(&self, booking: &Booking) {
        self.booking_dates.remove(&booking.id);
        for table_id in &booking.table_ids {
            if let Some(mut ids) = self.table_bookings.get_mut(table_id) {
                ids.remove(&booking.id);
            }
        }
    }
}
