mod error;
mod mutations;
mod queries;
mod store;
#[cfg(test)]
mod tests;

pub use error::EngineError;
pub use store::{ClaimGuard, Ledger};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

/// A spot row. The write guard on this lock is the row-level lock: holding
/// it serializes every Book/Release/Delete on the spot.
pub type SharedSpot = Arc<RwLock<Spot>>;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as Ms
}

// ── Group-commit WAL channel ─────────────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task owning the WAL. Batches appends for group commit:
/// buffer the first append, drain whatever else is immediately queued,
/// fsync once, answer every waiter with the batch result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &mut [PendingAppend]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even on append error so partially buffered bytes don't leak
    // into the next batch (these waiters are told the batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

// ── Engine ───────────────────────────────────────────────────────

/// One facility's state: lots, spots, vehicles, and the booking ledger,
/// all rebuilt from the WAL on startup.
pub struct Engine {
    pub lots: DashMap<Ulid, Lot>,
    pub spots: DashMap<Ulid, SharedSpot>,
    pub vehicles: DashMap<Ulid, Vehicle>,
    /// Unique plate index.
    pub(super) plates: DashMap<String, Ulid>,
    /// Unique lot-name index.
    pub(super) lot_names: DashMap<String, Ulid>,
    pub(super) vehicles_by_user: DashMap<String, Vec<Ulid>>,
    pub ledger: Ledger,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("lots", &self.lots.len())
            .field("spots", &self.spots.len())
            .field("vehicles", &self.vehicles.len())
            .finish_non_exhaustive()
    }
}

/// Apply a booking event. `spot` is the locked row when the caller holds
/// the guard (live path) or when replay found the row; it is None only for
/// replayed history of since-deleted spots, where just the ledger matters.
fn apply_booking(spot: Option<&mut Spot>, ledger: &Ledger, event: &Event) {
    match event {
        Event::BookingOpened {
            id,
            user_id,
            vehicle_id,
            spot_id,
            started_at,
        } => {
            ledger.open(Booking {
                id: *id,
                user_id: user_id.clone(),
                vehicle_id: *vehicle_id,
                spot_id: *spot_id,
                started_at: *started_at,
                ended_at: None,
            });
            if let Some(spot) = spot {
                spot.status = SpotStatus::Occupied;
            }
        }
        Event::BookingClosed { id, ended_at, .. } => {
            ledger.close(*id, *ended_at);
            if let Some(spot) = spot {
                spot.status = SpotStatus::Available;
            }
        }
        _ => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            lots: DashMap::new(),
            spots: DashMap::new(),
            vehicles: DashMap::new(),
            plates: DashMap::new(),
            lot_names: DashMap::new(),
            vehicles_by_user: DashMap::new(),
            ledger: Ledger::new(),
            wal_tx,
            notify,
        };

        // Replay. We are the sole owner of every spot Arc here, so
        // try_write always succeeds; never block inside this constructor
        // (it may run in an async context via lazy facility creation).
        for event in &events {
            match event {
                Event::LotCreated { id, name } => {
                    engine.lot_names.insert(name.clone(), *id);
                    engine.lots.insert(
                        *id,
                        Lot {
                            id: *id,
                            name: name.clone(),
                        },
                    );
                }
                Event::SpotCreated {
                    id,
                    lot_id,
                    level,
                    number,
                } => {
                    engine.spots.insert(
                        *id,
                        Arc::new(RwLock::new(Spot {
                            id: *id,
                            lot_id: *lot_id,
                            level: level.clone(),
                            number: number.clone(),
                            status: SpotStatus::Available,
                        })),
                    );
                }
                Event::SpotDeleted { id } => {
                    engine.spots.remove(id);
                }
                Event::VehicleRegistered {
                    id,
                    user_id,
                    plate,
                    vtype,
                } => {
                    engine.plates.insert(plate.clone(), *id);
                    engine
                        .vehicles_by_user
                        .entry(user_id.clone())
                        .or_default()
                        .push(*id);
                    engine.vehicles.insert(
                        *id,
                        Vehicle {
                            id: *id,
                            user_id: user_id.clone(),
                            plate: plate.clone(),
                            vtype: vtype.clone(),
                        },
                    );
                }
                Event::BookingOpened { spot_id, .. } | Event::BookingClosed { spot_id, .. } => {
                    match engine.spots.get(spot_id).map(|e| e.value().clone()) {
                        Some(row) => {
                            let mut guard =
                                row.try_write().expect("replay: uncontended write");
                            apply_booking(Some(&mut guard), &engine.ledger, event);
                        }
                        // History of a spot deleted after the booking
                        // closed; only the ledger needs it.
                        None => apply_booking(None, &engine.ledger, event),
                    }
                }
            }
        }

        Ok(engine)
    }

    /// Write an event to the WAL via the group-commit writer and wait for
    /// the fsync acknowledgment.
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

    pub fn get_spot(&self, id: &Ulid) -> Option<SharedSpot> {
        self.spots.get(id).map(|e| e.value().clone())
    }

    /// Ownership verifier: does `vehicle_id` belong to `user_id`?
    /// Runs inside the Book critical section so check and insert are
    /// consistent; vehicles are immutable after registration.
    pub(super) fn vehicle_owned_by(
        &self,
        vehicle_id: &Ulid,
        user_id: &str,
    ) -> Result<(), EngineError> {
        let vehicle = self
            .vehicles
            .get(vehicle_id)
            .ok_or(EngineError::VehicleNotFound(*vehicle_id))?;
        if vehicle.user_id != user_id {
            return Err(EngineError::VehicleNotOwned(*vehicle_id));
        }
        Ok(())
    }

    /// WAL-append + apply + notify for a booking event, with the spot row
    /// guard held by the caller. On WAL failure nothing is applied.
    pub(super) async fn persist_booking(
        &self,
        spot: &mut Spot,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        let spot_id = spot.id;
        apply_booking(Some(spot), &self.ledger, event);
        self.notify.send(spot_id, event);
        Ok(())
    }
}
