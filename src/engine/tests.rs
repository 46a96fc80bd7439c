use super::*;
use crate::limits::*;

use chrono::{Duration, Local, NaiveTime};
use tokio_test::{assert_err, assert_ok};

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("parkking_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn engine_with(path: PathBuf, policy: EnginePolicy) -> Engine {
    Engine::new(path, Arc::new(BookingFeed::new()), Outbox::disabled(), policy).unwrap()
}

fn new_engine(name: &str) -> Engine {
    engine_with(test_wal_path(name), EnginePolicy::default())
}

fn days_ahead(n: i64) -> NaiveDate {
    Local::now().date_naive() + Duration::days(n)
}

fn t(s: &str) -> NaiveTime {
    NaiveTime::parse_from_str(s, "%H:%M").unwrap()
}

fn contact(name: &str) -> Contact {
    Contact {
        name: name.into(),
        email: format!("{}@example.com", name.to_lowercase()),
        phone_number: "+79990000000".into(),
        comments: None,
    }
}

fn request(date: NaiveDate, time: &str, guests: u32) -> ReservationRequest {
    ReservationRequest {
        date,
        time: t(time),
        guests,
        contact: contact("Guest"),
        customer_user: None,
        tables: Vec::new(),
    }
}

async fn hall(engine: &Engine, capacities: &[u32]) -> Vec<Table> {
    let mut out = Vec::new();
    for (i, &cap) in capacities.iter().enumerate() {
        out.push(engine.create_table(i as u32 + 1, cap).await.unwrap());
    }
    out
}

fn ids(tables: &[Table]) -> Vec<Ulid> {
    tables.iter().map(|t| t.id).collect()
}

// ── Capacity planner ─────────────────────────────────────

#[test]
fn tables_needed_matches_pairs_heuristic() {
    for guests in MIN_GUESTS..=MAX_GUESTS {
        assert_eq!(tables_needed(guests).unwrap(), guests.div_ceil(2) as usize);
    }
    assert_eq!(tables_needed(1).unwrap(), 1);
    assert_eq!(tables_needed(4).unwrap(), 2);
    assert_eq!(tables_needed(5).unwrap(), 3);
}

// ── Allocation ───────────────────────────────────────────

#[tokio::test]
async fn four_guests_take_two_lowest_tables() {
    let engine = new_engine("four_guests.wal");
    let tables = hall(&engine, &[4, 4, 4, 4, 4]).await;
    let date = days_ahead(3);

    let booking = engine.allocate(request(date, "20:00", 4)).await.unwrap();

    assert_eq!(booking.table_ids, ids(&tables[..2]));
    assert_eq!(booking.duration_secs, BOOKING_DURATION_SECS);
    assert_eq!(engine.get_booking(&booking.id).await, Some(booking.clone()));
    assert_eq!(engine.bookings_on(date).await.len(), 1);
}

#[tokio::test]
async fn full_slot_is_rejected_without_a_booking() {
    let engine = new_engine("full_slot.wal");
    hall(&engine, &[4, 4, 4, 4, 4]).await;
    let date = days_ahead(3);

    let first = engine.allocate(request(date, "20:00", 10)).await.unwrap();
    assert_eq!(first.table_ids.len(), 5);

    let second = engine.allocate(request(date, "20:00", 4)).await;
    match second {
        Err(EngineError::InsufficientCapacity { available, needed }) => {
            assert_eq!((available, needed), (0, 2));
        }
        other => panic!("expected InsufficientCapacity, got {other:?}"),
    }
    assert_eq!(engine.bookings_on(date).await.len(), 1);
    assert_eq!(engine.stats().await.bookings, 1);
}

#[tokio::test]
async fn yesterday_is_past_whatever_else_is_wrong() {
    let engine = new_engine("yesterday.wal");
    hall(&engine, &[4]).await;

    let mut req = request(days_ahead(-1), "20:00", 0);
    req.contact.phone_number = "not a phone".into();
    req.contact.name = "R2D2".into();
    assert!(matches!(engine.allocate(req).await, Err(EngineError::PastDateTime)));
}

#[tokio::test]
async fn today_but_earlier_is_past() {
    let engine = new_engine("earlier_today.wal");
    hall(&engine, &[4]).await;
    let now = Local::now();
    if now.time() < t("00:30") {
        return; // no earlier slot today
    }
    let req = request(now.date_naive(), "00:00", 2);
    assert!(matches!(engine.allocate(req).await, Err(EngineError::PastDateTime)));
}

#[tokio::test]
async fn invalid_fields_are_rejected() {
    let engine = new_engine("invalid_fields.wal");
    hall(&engine, &[4]).await;
    let date = days_ahead(2);

    let err = engine.allocate(request(date, "20:00", 41)).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidPartySize(41)));

    let mut bad_phone = request(date, "20:00", 2);
    bad_phone.contact.phone_number = "8 (999) 000".into();
    let err = engine.allocate(bad_phone).await.unwrap_err();
    assert_eq!(err.field(), Some("phone_number"));

    let mut digits = request(date, "20:00", 2);
    digits.contact.name = "Agent 007".into();
    let err = engine.allocate(digits).await.unwrap_err();
    assert_eq!(err.field(), Some("name"));

    let err = engine.allocate(request(date, "20:10", 2)).await.unwrap_err();
    assert_eq!(err.field(), Some("time"));

    assert_eq!(engine.stats().await.bookings, 0);
}

#[tokio::test]
async fn resolver_is_idempotent() {
    let engine = new_engine("resolver_idempotent.wal");
    hall(&engine, &[2, 4, 6]).await;
    let date = days_ahead(5);
    engine.allocate(request(date, "19:00", 2)).await.unwrap();

    let a = engine.resolve(date, t("19:30"), 3, None).await.unwrap();
    let b = engine.resolve(date, t("19:30"), 3, None).await.unwrap();
    assert_eq!(a, b);
    assert_eq!(a.needed, 2);
}

#[tokio::test]
async fn later_start_inside_window_conflicts() {
    let engine = new_engine("later_start.wal");
    let tables = hall(&engine, &[4, 4]).await;
    let date = days_ahead(4);
    engine.allocate(request(date, "21:00", 2)).await.unwrap();

    let free = engine.resolve(date, t("20:00"), 2, None).await.unwrap();
    assert_eq!(ids(&free.tables), vec![tables[1].id]);
}

#[tokio::test]
async fn earlier_running_booking_is_ignored_by_default_rule() {
    // 19:00-21:00 overlaps 20:00, but started before the candidate window.
    let engine = new_engine("earlier_running.wal");
    let tables = hall(&engine, &[4]).await;
    let date = days_ahead(4);
    engine.allocate(request(date, "19:00", 2)).await.unwrap();

    let free = engine.resolve(date, t("20:00"), 2, None).await.unwrap();
    assert_eq!(ids(&free.tables), ids(&tables));
    assert_ok!(engine.allocate(request(date, "20:00", 2)).await);
}

#[tokio::test]
async fn symmetric_rule_sees_earlier_running_booking() {
    let policy = EnginePolicy {
        overlap: OverlapRule::Symmetric,
        ..Default::default()
    };
    let engine = engine_with(test_wal_path("symmetric.wal"), policy);
    hall(&engine, &[4]).await;
    let date = days_ahead(4);
    engine.allocate(request(date, "19:00", 2)).await.unwrap();

    let free = engine.resolve(date, t("20:00"), 2, None).await.unwrap();
    assert!(free.tables.is_empty());
    assert_err!(engine.allocate(request(date, "20:00", 2)).await);
    assert_ok!(engine.allocate(request(date, "21:00", 2)).await);
}

#[tokio::test]
async fn other_dates_do_not_conflict() {
    let engine = new_engine("other_dates.wal");
    hall(&engine, &[4]).await;
    let date = days_ahead(6);
    engine.allocate(request(date, "23:30", 2)).await.unwrap();

    // 23:30 starts inside the 23:00-01:00 window.
    assert_err!(engine.allocate(request(date, "23:00", 2)).await);
    // The late window runs into the next day instead of wrapping onto this morning.
    assert_ok!(engine.allocate(request(date, "00:30", 2)).await);
    // The next date is its own day.
    assert_ok!(engine.allocate(request(days_ahead(7), "00:00", 2)).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_attempts_for_last_table_linearize() {
    let engine = Arc::new(new_engine("race_last_table.wal"));
    hall(&engine, &[2]).await;
    let date = days_ahead(8);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine.allocate(request(date, "19:00", 2)).await
        }));
    }

    let mut ok = 0;
    let mut insufficient = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(EngineError::InsufficientCapacity { .. }) => insufficient += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(insufficient, 7);
    assert_eq!(engine.bookings_on(date).await.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_bookings_never_share_a_table() {
    let engine = Arc::new(new_engine("race_many.wal"));
    hall(&engine, &[2, 2, 2, 2, 2, 2]).await;
    let date = days_ahead(9);

    let mut handles = Vec::new();
    for _ in 0..12 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine.allocate(request(date, "20:00", 3)).await
        }));
    }
    let mut committed = Vec::new();
    for h in handles {
        if let Ok(b) = h.await.unwrap() {
            committed.push(b);
        }
    }
    assert_eq!(committed.len(), 3);
    let mut used: Vec<Ulid> = committed.iter().flat_map(|b| b.table_ids.clone()).collect();
    let before = used.len();
    used.sort();
    used.dedup();
    assert_eq!(used.len(), before, "a table was assigned twice");
}

// ── Packing and explicit tables ──────────────────────────

#[tokio::test]
async fn capacity_fit_uses_real_capacities() {
    let policy = EnginePolicy {
        packing: PackingPolicy::CapacityFit,
        ..Default::default()
    };
    let engine = engine_with(test_wal_path("capacity_fit.wal"), policy);
    let tables = hall(&engine, &[2, 2, 6]).await;
    let date = days_ahead(2);

    let booking = engine.allocate(request(date, "18:00", 6)).await.unwrap();
    assert_eq!(booking.table_ids, vec![tables[2].id]);

    let booking = engine.allocate(request(date, "18:00", 4)).await.unwrap();
    assert_eq!(booking.table_ids, ids(&tables[..2]));
}

#[tokio::test]
async fn explicit_tables_must_be_free_and_big_enough() {
    let engine = new_engine("explicit_tables.wal");
    let tables = hall(&engine, &[2, 4, 6]).await;
    let date = days_ahead(2);

    let mut req = request(date, "19:00", 5);
    req.tables = vec![3];
    let booking = engine.allocate(req).await.unwrap();
    assert_eq!(booking.table_ids, vec![tables[2].id]);

    let mut taken = request(date, "18:30", 2);
    taken.tables = vec![3];
    assert!(matches!(
        engine.allocate(taken).await,
        Err(EngineError::TableUnavailable(3))
    ));

    let mut too_small = request(date, "19:00", 5);
    too_small.tables = vec![1];
    assert_eq!(engine.allocate(too_small).await.unwrap_err().field(), Some("tables"));

    let mut missing = request(date, "19:00", 2);
    missing.tables = vec![42];
    assert_eq!(engine.allocate(missing).await.unwrap_err().field(), Some("tables"));
}

#[tokio::test]
async fn availability_counts_tables_seating_whole_party() {
    let engine = new_engine("availability_count.wal");
    hall(&engine, &[2, 4, 6]).await;
    let date = days_ahead(3);

    assert_eq!(engine.available_table_count(date, t("20:00"), 4).await, 2);
    assert_eq!(engine.available_table_count(date, t("20:00"), 6).await, 1);

    let mut req = request(date, "20:00", 6);
    req.tables = vec![3];
    engine.allocate(req).await.unwrap();
    assert_eq!(engine.available_table_count(date, t("20:00"), 4).await, 1);
    assert_eq!(engine.available_table_count(date, t("20:00"), 6).await, 0);
}

// ── Reschedule and cancel ────────────────────────────────

#[tokio::test]
async fn reschedule_ignores_own_tables() {
    let engine = new_engine("reschedule_own.wal");
    let tables = hall(&engine, &[2]).await;
    let date = days_ahead(3);
    let booking = engine.allocate(request(date, "19:30", 2)).await.unwrap();

    let moved = engine
        .reschedule(booking.id, request(date, "19:00", 2))
        .await
        .unwrap();
    assert_eq!(moved.id, booking.id);
    assert_eq!(moved.time, t("19:00"));
    assert_eq!(moved.table_ids, ids(&tables));
    assert_eq!(engine.bookings_on(date).await.len(), 1);
}

#[tokio::test]
async fn reschedule_moves_between_dates() {
    let engine = new_engine("reschedule_dates.wal");
    hall(&engine, &[4, 4]).await;
    let (from, to) = (days_ahead(3), days_ahead(10));
    let mut req = request(from, "19:00", 2);
    req.customer_user = Some("olga".into());
    let booking = engine.allocate(req).await.unwrap();

    let moved = engine.reschedule(booking.id, request(to, "20:00", 3)).await.unwrap();
    assert_eq!(moved.date, to);
    assert_eq!(moved.guests, 3);
    assert_eq!(moved.customer_user.as_deref(), Some("olga"));
    assert!(engine.bookings_on(from).await.is_empty());
    assert_eq!(engine.bookings_on(to).await, vec![moved]);
}

#[tokio::test]
async fn failed_reschedule_keeps_original() {
    let engine = new_engine("reschedule_full.wal");
    hall(&engine, &[2]).await;
    let date = days_ahead(3);
    let mine = engine.allocate(request(date, "18:00", 2)).await.unwrap();
    engine.allocate(request(date, "21:00", 2)).await.unwrap();

    let err = engine.reschedule(mine.id, request(date, "20:00", 2)).await;
    assert!(matches!(err, Err(EngineError::InsufficientCapacity { .. })));
    assert_eq!(engine.get_booking(&mine.id).await, Some(mine));
}

#[tokio::test]
async fn reschedule_unknown_booking() {
    let engine = new_engine("reschedule_unknown.wal");
    let err = engine.reschedule(Ulid::new(), request(days_ahead(1), "19:00", 2)).await;
    assert!(matches!(err, Err(EngineError::NotFound(_))));
}

#[tokio::test]
async fn cancel_frees_tables() {
    let engine = new_engine("cancel_frees.wal");
    hall(&engine, &[2]).await;
    let date = days_ahead(3);
    let booking = engine.allocate(request(date, "19:00", 2)).await.unwrap();
    assert_err!(engine.allocate(request(date, "19:00", 2)).await);

    let cancelled = engine.cancel_booking(booking.id).await.unwrap();
    assert_eq!(cancelled.id, booking.id);
    assert!(engine.get_booking(&booking.id).await.is_none());
    assert_ok!(engine.allocate(request(date, "19:00", 2)).await);

    assert!(matches!(
        engine.cancel_booking(booking.id).await,
        Err(EngineError::NotFound(_))
    ));
}

// ── Table administration ─────────────────────────────────

#[tokio::test]
async fn table_invariants() {
    let engine = new_engine("table_invariants.wal");
    engine.create_table(1, 4).await.unwrap();

    assert!(matches!(engine.create_table(1, 2).await, Err(EngineError::DuplicateTableNumber(1))));
    assert!(matches!(engine.create_table(2, 7).await, Err(EngineError::InvalidCapacity(7))));
    assert!(matches!(engine.create_table(2, 1).await, Err(EngineError::InvalidCapacity(1))));
    assert_eq!(engine.create_table(0, 2).await.unwrap_err().field(), Some("number"));

    engine.create_table(3, 2).await.unwrap();
    engine.create_table(2, 6).await.unwrap();
    let numbers: Vec<u32> = engine.list_tables().await.iter().map(|t| t.number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
}

#[tokio::test]
async fn referenced_table_cannot_be_deleted() {
    let engine = new_engine("table_in_use.wal");
    let tables = hall(&engine, &[4, 4]).await;
    let booking = engine.allocate(request(days_ahead(2), "19:00", 2)).await.unwrap();
    let used = booking.table_ids[0];

    assert!(matches!(engine.delete_table(used).await, Err(EngineError::TableInUse(_))));
    assert_ok!(engine.delete_table(tables[1].id).await);

    engine.cancel_booking(booking.id).await.unwrap();
    assert_ok!(engine.delete_table(used).await);
    assert!(engine.list_tables().await.is_empty());
    assert!(matches!(engine.delete_table(used).await, Err(EngineError::NotFound(_))));
}

#[tokio::test]
async fn shrinking_a_table_in_use_is_refused() {
    let engine = new_engine("table_shrink.wal");
    let tables = hall(&engine, &[6]).await;
    let id = tables[0].id;
    let mut req = request(days_ahead(2), "19:00", 6);
    req.tables = vec![1];
    engine.allocate(req).await.unwrap();

    assert!(matches!(engine.update_table(id, 1, 4).await, Err(EngineError::TableInUse(_))));
    let renumbered = engine.update_table(id, 9, 6).await.unwrap();
    assert_eq!(renumbered.number, 9);
    assert_eq!(engine.list_tables().await, vec![renumbered]);
}

// ── Cover images ─────────────────────────────────────────

#[tokio::test]
async fn cover_images_add_and_remove() {
    let engine = new_engine("cover_images.wal");
    let cover = engine
        .add_cover_image("Summer terrace".into(), "covers/terrace.jpg".into())
        .await
        .unwrap();
    assert_eq!(engine.list_cover_images().await, vec![cover.clone()]);

    let err = engine
        .add_cover_image("x".repeat(MAX_TITLE_LEN + 1), "covers/a.jpg".into())
        .await
        .unwrap_err();
    assert_eq!(err.field(), Some("title"));

    engine.remove_cover_image(cover.id).await.unwrap();
    assert!(engine.list_cover_images().await.is_empty());
    assert!(matches!(
        engine.remove_cover_image(cover.id).await,
        Err(EngineError::NotFound(_))
    ));
}

// ── Listings ─────────────────────────────────────────────

#[tokio::test]
async fn customer_listing_is_newest_first() {
    let engine = new_engine("customer_listing.wal");
    hall(&engine, &[4, 4]).await;
    let mine = |date, time| {
        let mut r = request(date, time, 2);
        r.customer_user = Some("ivan".into());
        r
    };
    engine.allocate(mine(days_ahead(2), "18:00")).await.unwrap();
    engine.allocate(mine(days_ahead(5), "12:00")).await.unwrap();
    engine.allocate(mine(days_ahead(2), "21:00")).await.unwrap();
    engine.allocate(request(days_ahead(3), "19:00", 2)).await.unwrap();

    let list = engine.bookings_for_customer("ivan").await;
    let keys: Vec<_> = list.iter().map(|b| (b.date, b.time)).collect();
    assert_eq!(
        keys,
        vec![
            (days_ahead(5), t("12:00")),
            (days_ahead(2), t("21:00")),
            (days_ahead(2), t("18:00")),
        ]
    );
    assert!(engine.bookings_for_customer("nobody").await.is_empty());
}

#[tokio::test]
async fn admin_listing_pages_by_ten() {
    let engine = new_engine("admin_pages.wal");
    hall(&engine, &[2]).await;
    for d in 1..=12 {
        engine.allocate(request(days_ahead(d), "19:00", 1)).await.unwrap();
    }
    let first = engine.all_bookings_page(1).await;
    assert_eq!(first.items.len(), ADMIN_PAGE_SIZE);
    assert_eq!((first.total, first.total_pages), (12, 2));
    assert_eq!(first.items[0].date, days_ahead(12));

    let second = engine.all_bookings_page(2).await;
    assert_eq!(second.items.len(), 2);
    assert_eq!(second.items[1].date, days_ahead(1));
}

// ── Side effects ─────────────────────────────────────────

#[tokio::test]
async fn commit_enqueues_two_mails() {
    let (outbox, mut rx) = Outbox::channel(8, Some("staff@parkking.test".into()));
    let engine = Engine::new(
        test_wal_path("mails.wal"),
        Arc::new(BookingFeed::new()),
        outbox,
        EnginePolicy::default(),
    )
    .unwrap();
    hall(&engine, &[4]).await;

    engine.allocate(request(days_ahead(2), "19:00", 2)).await.unwrap();
    let customer = rx.try_recv().unwrap();
    let operator = rx.try_recv().unwrap();
    assert_eq!(customer.recipients, vec!["guest@example.com".to_string()]);
    assert_eq!(operator.recipients, vec!["staff@parkking.test".to_string()]);

    // Rejections send nothing.
    assert_err!(engine.allocate(request(days_ahead(2), "19:00", 4)).await);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn feed_sees_committed_booking() {
    let engine = new_engine("feed.wal");
    hall(&engine, &[4]).await;
    let mut rx = engine.feed.subscribe();

    let booking = engine.allocate(request(days_ahead(2), "19:00", 2)).await.unwrap();
    match rx.recv().await.unwrap() {
        Event::BookingCommitted { booking: seen } => assert_eq!(seen, booking),
        other => panic!("unexpected event {other:?}"),
    }
}

// ── Conflict validator ───────────────────────────────────

fn form(date: NaiveDate, time: &str, guests: &str) -> ReservationForm {
    ReservationForm {
        date: Some(date.format("%Y-%m-%d").to_string()),
        time: Some(time.into()),
        guests: Some(guests.into()),
        name: Some("Anna".into()),
        email: Some("anna@example.com".into()),
        phone_number: Some("+79991112233".into()),
        comments: Some(String::new()),
        tables: None,
    }
}

#[tokio::test]
async fn validator_accepts_good_form() {
    let engine = new_engine("validator_ok.wal");
    hall(&engine, &[4, 4]).await;
    let date = days_ahead(2);

    let req = engine
        .validate_reservation(&form(date, "19:30", "3"), Some("anna".into()), None)
        .await
        .unwrap();
    assert_eq!(req.date, date);
    assert_eq!(req.guests, 3);
    assert_eq!(req.contact.comments, None);
    assert_eq!(req.customer_user.as_deref(), Some("anna"));
    assert_ok!(engine.allocate(req).await);
}

#[tokio::test]
async fn validator_reports_fields_and_form_errors() {
    let engine = new_engine("validator_errors.wal");
    hall(&engine, &[4]).await;

    let mut bad = form(days_ahead(-1), "19:15", "0");
    bad.phone_number = Some("call me".into());
    let errors = engine.validate_reservation(&bad, None, None).await.unwrap_err();
    for field in ["date", "time", "guests", "phone_number"] {
        assert!(errors.has_field(field), "missing {field}: {errors:?}");
    }

    let date = days_ahead(2);
    engine.allocate(request(date, "19:00", 2)).await.unwrap();
    let errors = engine
        .validate_reservation(&form(date, "19:00", "2"), None, None)
        .await
        .unwrap_err();
    assert!(errors.field_errors.is_empty());
    assert_eq!(
        errors.non_field_errors,
        vec!["Not enough free tables for the selected time.".to_string()]
    );
}

#[tokio::test]
async fn validator_flags_taken_explicit_table() {
    let engine = new_engine("validator_tables.wal");
    hall(&engine, &[4, 4]).await;
    let date = days_ahead(2);
    let mut req = request(date, "19:00", 2);
    req.tables = vec![1];
    engine.allocate(req).await.unwrap();

    let mut f = form(date, "19:00", "2");
    f.tables = Some("1".into());
    let errors = engine.validate_reservation(&f, None, None).await.unwrap_err();
    assert!(errors.has_field("tables"));

    f.tables = Some("2".into());
    assert_ok!(engine.validate_reservation(&f, None, None).await);
}

#[tokio::test]
async fn validator_ignores_booking_being_edited() {
    let engine = new_engine("validator_editing.wal");
    hall(&engine, &[2]).await;
    let date = days_ahead(2);
    let booking = engine.allocate(request(date, "19:30", 2)).await.unwrap();

    let f = form(date, "19:00", "2");
    assert_err!(engine.validate_reservation(&f, None, None).await);
    let req = engine
        .validate_reservation(&f, None, Some(booking.id))
        .await
        .unwrap();
    assert_ok!(engine.reschedule(booking.id, req).await);
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn state_survives_restart() {
    let path = test_wal_path("restart.wal");
    let date = days_ahead(4);
    let (kept, moved, tables) = {
        let engine = engine_with(path.clone(), EnginePolicy::default());
        let tables = hall(&engine, &[2, 4, 6]).await;
        engine
            .add_cover_image("Hall".into(), "covers/hall.jpg".into())
            .await
            .unwrap();
        let kept = engine.allocate(request(date, "19:00", 4)).await.unwrap();
        let moved = engine.allocate(request(date, "20:00", 2)).await.unwrap();
        let gone = engine.allocate(request(date, "21:00", 2)).await.unwrap();
        let moved = engine
            .reschedule(moved.id, request(days_ahead(6), "18:00", 2))
            .await
            .unwrap();
        engine.cancel_booking(gone.id).await.unwrap();
        (kept, moved, tables)
    };

    let engine = engine_with(path, EnginePolicy::default());
    assert_eq!(engine.list_tables().await, tables);
    assert_eq!(engine.list_cover_images().await.len(), 1);
    assert_eq!(engine.bookings_on(date).await, vec![kept.clone()]);
    assert_eq!(engine.bookings_on(days_ahead(6)).await, vec![moved]);
    assert_eq!(engine.stats().await.bookings, 2);

    // Rebuilt indexes still guard tables and slots.
    assert!(matches!(
        engine.delete_table(kept.table_ids[0]).await,
        Err(EngineError::TableInUse(_))
    ));
    let free = engine.resolve(date, t("19:00"), 2, None).await.unwrap();
    assert_eq!(free.tables.len(), 1);
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compact.wal");
    let date = days_ahead(4);
    let survivor = {
        let engine = engine_with(path.clone(), EnginePolicy::default());
        hall(&engine, &[4, 4]).await;
        for _ in 0..10 {
            let b = engine.allocate(request(date, "18:00", 2)).await.unwrap();
            engine.cancel_booking(b.id).await.unwrap();
        }
        let survivor = engine.allocate(request(date, "20:00", 3)).await.unwrap();
        assert!(engine.wal_appends_since_compact().await >= 21);

        let before = std::fs::metadata(&path).unwrap().len();
        engine.compact_wal().await.unwrap();
        let after = std::fs::metadata(&path).unwrap().len();
        assert!(after < before, "compaction should shrink the log: {after} < {before}");
        assert_eq!(engine.wal_appends_since_compact().await, 0);

        // Appends continue after the swap.
        engine.create_table(3, 2).await.unwrap();
        survivor
    };

    let engine = engine_with(path, EnginePolicy::default());
    assert_eq!(engine.list_tables().await.len(), 3);
    assert_eq!(engine.bookings_on(date).await, vec![survivor]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn compaction_keeps_booking_on_a_new_date() {
    let path = test_wal_path("compact_new_date.wal");
    let (known, fresh) = (days_ahead(2), days_ahead(3));
    let booking = {
        let engine = Arc::new(engine_with(path.clone(), EnginePolicy::default()));
        hall(&engine, &[4, 4]).await;
        engine.allocate(request(known, "19:00", 2)).await.unwrap();

        // Compaction stalls on the known date while a booking arrives for a date
        // its snapshot never listed.
        let held = engine.get_day(&known).unwrap().write_owned().await;
        let compacting = tokio::spawn({
            let engine = engine.clone();
            async move { engine.compact_wal().await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let booking = tokio::spawn({
            let engine = engine.clone();
            async move { engine.allocate(request(fresh, "19:00", 2)).await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        drop(held);

        compacting.await.unwrap().unwrap();
        booking.await.unwrap().unwrap()
    };

    let engine = engine_with(path, EnginePolicy::default());
    assert_eq!(engine.get_booking(&booking.id).await, Some(booking));
    assert_eq!(engine.all_bookings().await.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_compaction_loses_no_commits() {
    let path = test_wal_path("compact_concurrent.wal");
    let engine = Arc::new(engine_with(path.clone(), EnginePolicy::default()));
    hall(&engine, &[4]).await;

    let mut writers = Vec::new();
    for n in 1..=40 {
        let engine = engine.clone();
        writers.push(tokio::spawn(async move {
            let booking = engine.allocate(request(days_ahead(n), "19:00", 2)).await.unwrap();
            if n % 3 == 0 {
                engine.cancel_booking(booking.id).await.unwrap();
                return None;
            }
            Some(booking.id)
        }));
    }
    let compactor = tokio::spawn({
        let engine = engine.clone();
        async move {
            for _ in 0..10 {
                engine.compact_wal().await.unwrap();
                tokio::task::yield_now().await;
            }
        }
    });

    let mut committed = HashSet::new();
    for w in writers {
        committed.extend(w.await.unwrap());
    }
    compactor.await.unwrap();
    assert_eq!(committed.len(), 27);

    let engine = engine_with(path, EnginePolicy::default());
    let restored: HashSet<Ulid> = engine.all_bookings().await.iter().map(|b| b.id).collect();
    assert_eq!(restored, committed);
}

#[tokio::test]
async fn failed_group_commit_fails_every_caller_and_leaves_no_record() {
    let path = test_wal_path("failed_commit.wal");
    let table = |number| Event::TableCreated {
        table: Table {
            id: Ulid::new(),
            number,
            capacity: 2,
        },
    };
    let mut wal = Wal::open(&path).unwrap();

    let first = table(1);
    let (tx, rx) = oneshot::channel();
    commit_batch(&mut wal, vec![(first.clone(), tx)]);
    assert_ok!(rx.await.unwrap());

    wal.fail_at(1);
    let (tx_a, rx_a) = oneshot::channel();
    let (tx_b, rx_b) = oneshot::channel();
    commit_batch(&mut wal, vec![(table(2), tx_a), (table(3), tx_b)]);
    assert_err!(rx_a.await.unwrap());
    assert_err!(rx_b.await.unwrap());

    let later = table(4);
    let (tx, rx) = oneshot::channel();
    commit_batch(&mut wal, vec![(later.clone(), tx)]);
    assert_ok!(rx.await.unwrap());
    drop(wal);

    assert_eq!(Wal::replay(&path).unwrap(), vec![first, later]);
    let engine = engine_with(path, EnginePolicy::default());
    let numbers: Vec<u32> = engine.list_tables().await.iter().map(|t| t.number).collect();
    assert_eq!(numbers, vec![1, 4]);
}

#[tokio::test]
async fn rejected_booking_leaves_no_empty_date() {
    let engine = new_engine("no_empty_date.wal");
    hall(&engine, &[2]).await;
    let date = days_ahead(5);

    assert_err!(engine.allocate(request(date, "19:00", 6)).await);
    assert!(!engine.days.contains_key(&date));

    let booking = engine.allocate(request(date, "19:00", 2)).await.unwrap();
    assert!(engine.days.contains_key(&date));
    engine.cancel_booking(booking.id).await.unwrap();
    assert!(!engine.days.contains_key(&date));
}

#[tokio::test]
async fn reschedule_releases_emptied_dates() {
    let engine = new_engine("reschedule_release.wal");
    hall(&engine, &[2]).await;
    let (from, to, nowhere) = (days_ahead(5), days_ahead(6), days_ahead(7));
    let booking = engine.allocate(request(from, "19:00", 2)).await.unwrap();

    assert_err!(engine.reschedule(booking.id, request(nowhere, "19:00", 6)).await);
    assert!(!engine.days.contains_key(&nowhere));
    assert!(engine.days.contains_key(&from));

    engine.reschedule(booking.id, request(to, "19:00", 2)).await.unwrap();
    assert!(!engine.days.contains_key(&from));
    assert!(engine.days.contains_key(&to));
}
