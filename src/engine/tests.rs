use std::path::PathBuf;
use std::sync::Arc;

use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;

use super::{Engine, EngineError};

fn test_wal_path() -> PathBuf {
    let dir = std::env::temp_dir().join("valet_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    dir.join(format!("{}.wal", Ulid::new()))
}

fn new_engine(path: &PathBuf) -> Arc<Engine> {
    Arc::new(Engine::new(path.clone(), Arc::new(NotifyHub::new())).unwrap())
}

struct Fixture {
    engine: Arc<Engine>,
    wal_path: PathBuf,
    lot: Ulid,
    spot: Ulid,
    vehicle: Ulid,
}

/// Engine with one lot, one AVAILABLE spot, and one vehicle owned by
/// `user`.
async fn fixture(user: &str) -> Fixture {
    let wal_path = test_wal_path();
    let engine = new_engine(&wal_path);
    let (lot, spot, vehicle) = (Ulid::new(), Ulid::new(), Ulid::new());
    engine.create_lot(lot, "North Garage".into()).await.unwrap();
    engine
        .create_spot(spot, lot, "L1".into(), "A-01".into())
        .await
        .unwrap();
    engine
        .register_vehicle(vehicle, user, format!("KA-{}", &vehicle.to_string()[..8]), "car".into())
        .await
        .unwrap();
    Fixture {
        engine,
        wal_path,
        lot,
        spot,
        vehicle,
    }
}

async fn spot_status(engine: &Engine, spot: &Ulid) -> SpotStatus {
    engine.get_spot(spot).unwrap().read().await.status
}

/// status == OCCUPIED ⟺ exactly one open booking references the spot.
async fn assert_spot_invariant(engine: &Engine, spot: Ulid) {
    let status = spot_status(engine, &spot).await;
    let open_rows: Vec<Booking> = engine
        .ledger
        .all()
        .into_iter()
        .filter(|b| b.spot_id == spot && b.is_open())
        .collect();
    match status {
        SpotStatus::Occupied => {
            assert_eq!(open_rows.len(), 1, "occupied spot must have one open booking");
            assert_eq!(engine.ledger.open_for_spot(&spot), Some(open_rows[0].id));
        }
        SpotStatus::Available => {
            assert!(open_rows.is_empty(), "available spot must have no open booking");
            assert!(engine.ledger.open_for_spot(&spot).is_none());
        }
    }
}

// ── Book ─────────────────────────────────────────────────────────

#[tokio::test]
async fn book_occupies_spot_and_opens_booking() {
    let f = fixture("alice").await;
    let booking_id = Ulid::new();

    let started_at = f
        .engine
        .book(booking_id, "alice", f.vehicle, f.spot)
        .await
        .unwrap();
    assert!(started_at > 0);

    assert_eq!(spot_status(&f.engine, &f.spot).await, SpotStatus::Occupied);
    let row = f.engine.ledger.get(&booking_id).unwrap();
    assert!(row.is_open());
    assert_eq!(row.user_id, "alice");
    assert_eq!(row.started_at, started_at);
    assert_spot_invariant(&f.engine, f.spot).await;
}

#[tokio::test]
async fn book_unknown_spot_fails() {
    let f = fixture("alice").await;
    let err = f
        .engine
        .book(Ulid::new(), "alice", f.vehicle, Ulid::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::SpotNotFound(_)));
}

#[tokio::test]
async fn book_unknown_vehicle_fails() {
    let f = fixture("alice").await;
    let err = f
        .engine
        .book(Ulid::new(), "alice", Ulid::new(), f.spot)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::VehicleNotFound(_)));
    assert_eq!(spot_status(&f.engine, &f.spot).await, SpotStatus::Available);
}

#[tokio::test]
async fn book_unowned_vehicle_fails() {
    let f = fixture("alice").await;
    let err = f
        .engine
        .book(Ulid::new(), "bob", f.vehicle, f.spot)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::VehicleNotOwned(_)));
    assert_spot_invariant(&f.engine, f.spot).await;
}

#[tokio::test]
async fn book_occupied_spot_fails() {
    let f = fixture("alice").await;
    f.engine
        .book(Ulid::new(), "alice", f.vehicle, f.spot)
        .await
        .unwrap();

    let other_vehicle = Ulid::new();
    f.engine
        .register_vehicle(other_vehicle, "bob", "MH-99-0001".into(), "car".into())
        .await
        .unwrap();
    let err = f
        .engine
        .book(Ulid::new(), "bob", other_vehicle, f.spot)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::SpotNotAvailable(_)));
    assert_spot_invariant(&f.engine, f.spot).await;
}

#[tokio::test]
async fn vehicle_cannot_hold_two_open_bookings() {
    let f = fixture("alice").await;
    let second_spot = Ulid::new();
    f.engine
        .create_spot(second_spot, f.lot, "L1".into(), "A-02".into())
        .await
        .unwrap();

    f.engine
        .book(Ulid::new(), "alice", f.vehicle, f.spot)
        .await
        .unwrap();
    // Same vehicle, different spot: the spot row lock cannot exclude this,
    // only the ledger's vehicle claim can.
    let err = f
        .engine
        .book(Ulid::new(), "alice", f.vehicle, second_spot)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::BookingConflict(_)));
    assert_eq!(
        spot_status(&f.engine, &second_spot).await,
        SpotStatus::Available
    );
}

#[tokio::test]
async fn duplicate_booking_id_rejected() {
    let f = fixture("alice").await;
    let booking_id = Ulid::new();
    f.engine
        .book(booking_id, "alice", f.vehicle, f.spot)
        .await
        .unwrap();
    f.engine.release("alice", f.spot).await.unwrap();

    let err = f
        .engine
        .book(booking_id, "alice", f.vehicle, f.spot)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AlreadyExists(_)));
}

// ── Concurrency ──────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_books_on_one_spot_exactly_one_wins() {
    let f = fixture("alice").await;

    let mut handles = Vec::new();
    for i in 0..8 {
        let user = format!("user{i}");
        let vehicle = Ulid::new();
        f.engine
            .register_vehicle(vehicle, &user, format!("PL-{i:04}"), "car".into())
            .await
            .unwrap();
        let engine = f.engine.clone();
        let spot = f.spot;
        handles.push(tokio::spawn(async move {
            engine.book(Ulid::new(), &user, vehicle, spot).await
        }));
    }

    let mut wins = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => wins += 1,
            Err(EngineError::SpotNotAvailable(_)) | Err(EngineError::BookingConflict(_)) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    assert_eq!(wins, 1, "exactly one concurrent Book must succeed");
    assert_eq!(spot_status(&f.engine, &f.spot).await, SpotStatus::Occupied);
    assert_spot_invariant(&f.engine, f.spot).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_books_same_vehicle_two_spots_single_win() {
    let f = fixture("alice").await;
    let second_spot = Ulid::new();
    f.engine
        .create_spot(second_spot, f.lot, "L1".into(), "A-02".into())
        .await
        .unwrap();

    let a = {
        let engine = f.engine.clone();
        let (vehicle, spot) = (f.vehicle, f.spot);
        tokio::spawn(async move { engine.book(Ulid::new(), "alice", vehicle, spot).await })
    };
    let b = {
        let engine = f.engine.clone();
        let (vehicle, spot) = (f.vehicle, second_spot);
        tokio::spawn(async move { engine.book(Ulid::new(), "alice", vehicle, spot).await })
    };

    let results = [a.await.unwrap(), b.await.unwrap()];
    let wins = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(wins, 1, "one vehicle can win at most one spot");
    for r in results {
        if let Err(e) = r {
            assert!(matches!(e, EngineError::BookingConflict(_)));
        }
    }
    assert!(f.engine.ledger.open_for_vehicle(&f.vehicle).is_some());
    assert_spot_invariant(&f.engine, f.spot).await;
    assert_spot_invariant(&f.engine, second_spot).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn book_release_churn_keeps_invariant() {
    let f = fixture("alice").await;

    let mut handles = Vec::new();
    for i in 0..6 {
        let user = format!("churn{i}");
        let vehicle = Ulid::new();
        f.engine
            .register_vehicle(vehicle, &user, format!("CH-{i:04}"), "car".into())
            .await
            .unwrap();
        let engine = f.engine.clone();
        let spot = f.spot;
        handles.push(tokio::spawn(async move {
            for _ in 0..20 {
                if engine.book(Ulid::new(), &user, vehicle, spot).await.is_ok() {
                    engine.release(&user, spot).await.unwrap();
                }
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    assert_spot_invariant(&f.engine, f.spot).await;
    // every booking that opened was closed
    assert_eq!(f.engine.ledger.open_count(), 0);
    assert!(f.engine.ledger.all().iter().all(|b| !b.is_open()));
}

// ── Release ──────────────────────────────────────────────────────

#[tokio::test]
async fn release_frees_spot_and_closes_booking() {
    let f = fixture("alice").await;
    let booking_id = Ulid::new();
    let started_at = f
        .engine
        .book(booking_id, "alice", f.vehicle, f.spot)
        .await
        .unwrap();

    let ended_at = f.engine.release("alice", f.spot).await.unwrap();
    assert!(ended_at >= started_at);

    assert_eq!(spot_status(&f.engine, &f.spot).await, SpotStatus::Available);
    let row = f.engine.ledger.get(&booking_id).unwrap();
    assert_eq!(row.ended_at, Some(ended_at));
    assert_spot_invariant(&f.engine, f.spot).await;

    // the spot and the vehicle are both bookable again
    f.engine
        .book(Ulid::new(), "alice", f.vehicle, f.spot)
        .await
        .unwrap();
}

#[tokio::test]
async fn release_twice_fails_the_second_time() {
    let f = fixture("alice").await;
    f.engine
        .book(Ulid::new(), "alice", f.vehicle, f.spot)
        .await
        .unwrap();

    f.engine.release("alice", f.spot).await.unwrap();
    let err = f.engine.release("alice", f.spot).await.unwrap_err();
    assert!(matches!(err, EngineError::NoActiveBooking(_)));
}

#[tokio::test]
async fn release_by_non_owner_reveals_nothing() {
    let f = fixture("alice").await;
    f.engine
        .book(Ulid::new(), "alice", f.vehicle, f.spot)
        .await
        .unwrap();

    // Same error whether the booking is someone else's, the spot has no
    // booking, or the spot does not exist at all.
    let not_owner = f.engine.release("mallory", f.spot).await.unwrap_err();
    assert!(matches!(not_owner, EngineError::NoActiveBooking(_)));
    let no_spot = f.engine.release("mallory", Ulid::new()).await.unwrap_err();
    assert!(matches!(no_spot, EngineError::NoActiveBooking(_)));

    // alice's booking is untouched
    assert_eq!(spot_status(&f.engine, &f.spot).await, SpotStatus::Occupied);
    assert_spot_invariant(&f.engine, f.spot).await;
}

// ── Full scenario ────────────────────────────────────────────────

#[tokio::test]
async fn book_contend_release_history_scenario() {
    let f = fixture("alice").await;
    let vehicle_b = Ulid::new();
    f.engine
        .register_vehicle(vehicle_b, "bob", "TN-10-2222".into(), "bike".into())
        .await
        .unwrap();

    // alice books spot S with vehicle V1
    let booking_id = Ulid::new();
    f.engine
        .book(booking_id, "alice", f.vehicle, f.spot)
        .await
        .unwrap();
    assert_eq!(spot_status(&f.engine, &f.spot).await, SpotStatus::Occupied);

    // bob immediately tries the same spot
    let err = f
        .engine
        .book(Ulid::new(), "bob", vehicle_b, f.spot)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::SpotNotAvailable(_)));

    // alice releases; the spot frees up
    f.engine.release("alice", f.spot).await.unwrap();
    assert_eq!(spot_status(&f.engine, &f.spot).await, SpotStatus::Available);

    // alice's history shows one COMPLETED entry
    let history = f.engine.history("alice");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, booking_id);
    assert_eq!(history[0].status_label(), "COMPLETED");

    // bob's failed attempt left no trace
    assert!(f.engine.history("bob").is_empty());
}

#[tokio::test]
async fn history_is_newest_first() {
    let f = fixture("alice").await;
    for _ in 0..3 {
        f.engine
            .book(Ulid::new(), "alice", f.vehicle, f.spot)
            .await
            .unwrap();
        f.engine.release("alice", f.spot).await.unwrap();
    }
    let history = f.engine.history("alice");
    assert_eq!(history.len(), 3);
    assert!(
        history
            .windows(2)
            .all(|w| w[0].started_at >= w[1].started_at)
    );
}

// ── Spot deletion boundary ───────────────────────────────────────

#[tokio::test]
async fn delete_occupied_spot_rejected() {
    let f = fixture("alice").await;
    f.engine
        .book(Ulid::new(), "alice", f.vehicle, f.spot)
        .await
        .unwrap();

    let err = f.engine.delete_spot(f.spot).await.unwrap_err();
    assert!(matches!(err, EngineError::SpotOccupied(_)));

    // once released, deletion goes through
    f.engine.release("alice", f.spot).await.unwrap();
    f.engine.delete_spot(f.spot).await.unwrap();
    assert!(f.engine.get_spot(&f.spot).is_none());

    let err = f
        .engine
        .book(Ulid::new(), "alice", f.vehicle, f.spot)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::SpotNotFound(_)));
}

#[tokio::test]
async fn delete_unknown_spot_fails() {
    let f = fixture("alice").await;
    let err = f.engine.delete_spot(Ulid::new()).await.unwrap_err();
    assert!(matches!(err, EngineError::SpotNotFound(_)));
}

// ── Entity CRUD validation ───────────────────────────────────────

#[tokio::test]
async fn create_spot_requires_existing_lot() {
    let wal_path = test_wal_path();
    let engine = new_engine(&wal_path);
    let err = engine
        .create_spot(Ulid::new(), Ulid::new(), "L1".into(), "A-01".into())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::LotNotFound(_)));
}

#[tokio::test]
async fn duplicate_lot_name_rejected() {
    let f = fixture("alice").await;
    let err = f
        .engine
        .create_lot(Ulid::new(), "North Garage".into())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AlreadyExists(_)));
}

#[tokio::test]
async fn duplicate_plate_rejected() {
    let f = fixture("alice").await;
    let plate = f.engine.vehicles.get(&f.vehicle).unwrap().plate.clone();
    let err = f
        .engine
        .register_vehicle(Ulid::new(), "bob", plate, "car".into())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AlreadyExists(_)));
}

#[tokio::test]
async fn vehicle_limit_per_user() {
    let f = fixture("alice").await;
    // fixture already registered one vehicle for alice
    for i in 1..crate::limits::MAX_VEHICLES_PER_USER {
        f.engine
            .register_vehicle(Ulid::new(), "alice", format!("LIM-{i:04}"), "car".into())
            .await
            .unwrap();
    }
    let err = f
        .engine
        .register_vehicle(Ulid::new(), "alice", "LIM-9999".into(), "car".into())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::LimitExceeded(_)));
}

#[tokio::test]
async fn empty_names_rejected() {
    let f = fixture("alice").await;
    assert!(matches!(
        f.engine.create_lot(Ulid::new(), "".into()).await,
        Err(EngineError::LimitExceeded(_))
    ));
    assert!(matches!(
        f.engine
            .create_spot(Ulid::new(), f.lot, "".into(), "A-02".into())
            .await,
        Err(EngineError::LimitExceeded(_))
    ));
    assert!(matches!(
        f.engine
            .register_vehicle(Ulid::new(), "alice", "".into(), "car".into())
            .await,
        Err(EngineError::LimitExceeded(_))
    ));
}

// ── Read models ──────────────────────────────────────────────────

#[tokio::test]
async fn occupancy_counts_and_rate() {
    let f = fixture("alice").await;
    for n in 2..4 {
        f.engine
            .create_spot(Ulid::new(), f.lot, "L1".into(), format!("A-{n:02}"))
            .await
            .unwrap();
    }

    let empty = f.engine.occupancy();
    assert_eq!(empty.total_spots, 3);
    assert_eq!(empty.available, 3);
    assert_eq!(empty.occupied, 0);
    assert_eq!(empty.occupancy_rate, 0.0);

    f.engine
        .book(Ulid::new(), "alice", f.vehicle, f.spot)
        .await
        .unwrap();
    let one = f.engine.occupancy();
    assert_eq!(one.occupied, 1);
    assert_eq!(one.available, 2);
    assert!((one.occupancy_rate - 1.0 / 3.0).abs() < 1e-9);
}

#[tokio::test]
async fn occupancy_rate_degrades_to_zero_without_spots() {
    let wal_path = test_wal_path();
    let engine = new_engine(&wal_path);
    let summary = engine.occupancy();
    assert_eq!(summary.total_spots, 0);
    assert_eq!(summary.occupancy_rate, 0.0);
}

#[tokio::test]
async fn active_bookings_lists_only_open() {
    let f = fixture("alice").await;
    let second_spot = Ulid::new();
    f.engine
        .create_spot(second_spot, f.lot, "L2".into(), "B-01".into())
        .await
        .unwrap();
    let vehicle_b = Ulid::new();
    f.engine
        .register_vehicle(vehicle_b, "bob", "AC-11-3333".into(), "car".into())
        .await
        .unwrap();

    f.engine
        .book(Ulid::new(), "alice", f.vehicle, f.spot)
        .await
        .unwrap();
    f.engine
        .book(Ulid::new(), "bob", vehicle_b, second_spot)
        .await
        .unwrap();
    f.engine.release("alice", f.spot).await.unwrap();

    let active = f.engine.active_bookings();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].user_id, "bob");
}

#[tokio::test]
async fn list_spots_filters_by_lot() {
    let f = fixture("alice").await;
    let other_lot = Ulid::new();
    f.engine
        .create_lot(other_lot, "South Garage".into())
        .await
        .unwrap();
    f.engine
        .create_spot(Ulid::new(), other_lot, "L1".into(), "S-01".into())
        .await
        .unwrap();

    assert_eq!(f.engine.list_spots(None).await.len(), 2);
    let filtered = f.engine.list_spots(Some(other_lot)).await;
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0].number, "S-01");
}

// ── Notifications ────────────────────────────────────────────────

#[tokio::test]
async fn booking_events_are_published_per_spot() {
    let f = fixture("alice").await;
    let mut rx = f.engine.notify.subscribe(f.spot);

    let booking_id = Ulid::new();
    f.engine
        .book(booking_id, "alice", f.vehicle, f.spot)
        .await
        .unwrap();
    match rx.recv().await.unwrap() {
        Event::BookingOpened { id, spot_id, .. } => {
            assert_eq!(id, booking_id);
            assert_eq!(spot_id, f.spot);
        }
        other => panic!("expected BookingOpened, got {other:?}"),
    }

    f.engine.release("alice", f.spot).await.unwrap();
    assert!(matches!(
        rx.recv().await.unwrap(),
        Event::BookingClosed { id, .. } if id == booking_id
    ));
}

// ── WAL replay ───────────────────────────────────────────────────

#[tokio::test]
async fn replay_restores_open_booking_and_status() {
    let f = fixture("alice").await;
    let booking_id = Ulid::new();
    f.engine
        .book(booking_id, "alice", f.vehicle, f.spot)
        .await
        .unwrap();

    let replayed = new_engine(&f.wal_path);
    assert_eq!(spot_status(&replayed, &f.spot).await, SpotStatus::Occupied);
    assert!(replayed.ledger.get(&booking_id).unwrap().is_open());
    assert_spot_invariant(&replayed, f.spot).await;

    // claims survive replay: the vehicle still cannot double-book
    let second_spot = Ulid::new();
    replayed
        .create_spot(second_spot, f.lot, "L9".into(), "R-01".into())
        .await
        .unwrap();
    let err = replayed
        .book(Ulid::new(), "alice", f.vehicle, second_spot)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::BookingConflict(_)));

    // and the original booking is releasable
    replayed.release("alice", f.spot).await.unwrap();
    assert_eq!(spot_status(&replayed, &f.spot).await, SpotStatus::Available);
}

#[tokio::test]
async fn replay_after_release_is_available() {
    let f = fixture("alice").await;
    f.engine
        .book(Ulid::new(), "alice", f.vehicle, f.spot)
        .await
        .unwrap();
    f.engine.release("alice", f.spot).await.unwrap();

    let replayed = new_engine(&f.wal_path);
    assert_eq!(spot_status(&replayed, &f.spot).await, SpotStatus::Available);
    assert_eq!(replayed.ledger.open_count(), 0);
    assert_eq!(replayed.history("alice").len(), 1);
}

#[tokio::test]
async fn replay_keeps_history_of_deleted_spot() {
    let f = fixture("alice").await;
    f.engine
        .book(Ulid::new(), "alice", f.vehicle, f.spot)
        .await
        .unwrap();
    f.engine.release("alice", f.spot).await.unwrap();
    f.engine.delete_spot(f.spot).await.unwrap();

    let replayed = new_engine(&f.wal_path);
    assert!(replayed.get_spot(&f.spot).is_none());
    let history = replayed.history("alice");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status_label(), "COMPLETED");
}

#[tokio::test]
async fn compaction_preserves_ledger_and_open_booking() {
    let f = fixture("alice").await;
    let open_id = Ulid::new();
    // one completed session, one still open
    f.engine
        .book(Ulid::new(), "alice", f.vehicle, f.spot)
        .await
        .unwrap();
    f.engine.release("alice", f.spot).await.unwrap();
    f.engine
        .book(open_id, "alice", f.vehicle, f.spot)
        .await
        .unwrap();

    f.engine.compact_wal().await.unwrap();

    let replayed = new_engine(&f.wal_path);
    assert_eq!(spot_status(&replayed, &f.spot).await, SpotStatus::Occupied);
    assert_eq!(replayed.history("alice").len(), 2);
    assert!(replayed.ledger.get(&open_id).unwrap().is_open());
    assert_spot_invariant(&replayed, f.spot).await;

    // the open booking is still releasable after compact + replay
    replayed.release("alice", f.spot).await.unwrap();
}
