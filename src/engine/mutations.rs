use std::sync::Arc;

use tokio::sync::{RwLock, oneshot};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError, WalCommand, now_ms};

impl Engine {
    // ── Entity CRUD boundary ─────────────────────────────────

    pub async fn create_lot(&self, id: Ulid, name: String) -> Result<(), EngineError> {
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("lot name length"));
        }
        if self.lots.len() >= MAX_LOTS_PER_FACILITY {
            return Err(EngineError::LimitExceeded("too many lots"));
        }
        if self.lots.contains_key(&id) || self.lot_names.contains_key(&name) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::LotCreated {
            id,
            name: name.clone(),
        };
        self.wal_append(&event).await?;
        self.lot_names.insert(name.clone(), id);
        self.lots.insert(id, Lot { id, name });
        Ok(())
    }

    pub async fn create_spot(
        &self,
        id: Ulid,
        lot_id: Ulid,
        level: String,
        number: String,
    ) -> Result<(), EngineError> {
        if level.is_empty() || level.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("spot level length"));
        }
        if number.is_empty() || number.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("spot number length"));
        }
        if self.spots.len() >= MAX_SPOTS_PER_FACILITY {
            return Err(EngineError::LimitExceeded("too many spots"));
        }
        if !self.lots.contains_key(&lot_id) {
            return Err(EngineError::LotNotFound(lot_id));
        }
        if self.spots.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::SpotCreated {
            id,
            lot_id,
            level: level.clone(),
            number: number.clone(),
        };
        self.wal_append(&event).await?;
        self.spots.insert(
            id,
            Arc::new(RwLock::new(Spot {
                id,
                lot_id,
                level,
                number,
                status: SpotStatus::Available,
            })),
        );
        Ok(())
    }

    /// Delete a spot. Refused while OCCUPIED; the check runs under the
    /// spot row lock so it cannot race a concurrent Book.
    pub async fn delete_spot(&self, id: Ulid) -> Result<(), EngineError> {
        let row = self.get_spot(&id).ok_or(EngineError::SpotNotFound(id))?;
        let guard = row.write().await;
        // Re-check after the lock: the row may have been deleted while we
        // were waiting for a contending transaction.
        if !self.spots.contains_key(&id) {
            return Err(EngineError::SpotNotFound(id));
        }
        if guard.status == SpotStatus::Occupied {
            return Err(EngineError::SpotOccupied(id));
        }

        let event = Event::SpotDeleted { id };
        self.wal_append(&event).await?;
        self.spots.remove(&id);
        self.notify.send(id, &event);
        self.notify.remove(&id);
        Ok(())
    }

    pub async fn register_vehicle(
        &self,
        id: Ulid,
        user_id: &str,
        plate: String,
        vtype: String,
    ) -> Result<(), EngineError> {
        if plate.is_empty() || plate.len() > MAX_PLATE_LEN {
            return Err(EngineError::LimitExceeded("plate length"));
        }
        if vtype.is_empty() || vtype.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("vehicle type length"));
        }
        let owned = self
            .vehicles_by_user
            .get(user_id)
            .map(|v| v.len())
            .unwrap_or(0);
        if owned >= MAX_VEHICLES_PER_USER {
            return Err(EngineError::LimitExceeded("too many vehicles for user"));
        }
        if self.vehicles.contains_key(&id) || self.plates.contains_key(&plate) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::VehicleRegistered {
            id,
            user_id: user_id.to_string(),
            plate: plate.clone(),
            vtype: vtype.clone(),
        };
        self.wal_append(&event).await?;
        self.plates.insert(plate.clone(), id);
        self.vehicles_by_user
            .entry(user_id.to_string())
            .or_default()
            .push(id);
        self.vehicles.insert(
            id,
            Vehicle {
                id,
                user_id: user_id.to_string(),
                plate,
                vtype,
            },
        );
        Ok(())
    }

    // ── Booking transaction engine ───────────────────────────

    /// Book `spot_id` for the caller's `vehicle_id`.
    ///
    /// The spot row lock is acquired first and held across check, WAL
    /// append, and apply; the status check therefore happens strictly
    /// after lock acquisition and no contending transaction can flip the
    /// status underneath it. The ledger claim is the uniqueness backstop
    /// for the one race the row lock does not cover: the same vehicle
    /// booking a different spot concurrently.
    ///
    /// Returns the server-assigned start time.
    pub async fn book(
        &self,
        booking_id: Ulid,
        user_id: &str,
        vehicle_id: Ulid,
        spot_id: Ulid,
    ) -> Result<Ms, EngineError> {
        let row = self
            .get_spot(&spot_id)
            .ok_or(EngineError::SpotNotFound(spot_id))?;
        let mut guard = row.write().await;
        // Re-check after the lock: the row may have been deleted while we
        // were waiting for a contending transaction.
        if !self.spots.contains_key(&spot_id) {
            return Err(EngineError::SpotNotFound(spot_id));
        }
        if guard.status != SpotStatus::Available {
            metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            return Err(EngineError::SpotNotAvailable(spot_id));
        }

        self.vehicle_owned_by(&vehicle_id, user_id)?;

        if self.ledger.get(&booking_id).is_some() {
            return Err(EngineError::AlreadyExists(booking_id));
        }
        let claim = match self.ledger.claim(spot_id, vehicle_id, booking_id) {
            Ok(claim) => claim,
            Err(e) => {
                metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
                return Err(e);
            }
        };

        let started_at = now_ms();
        let event = Event::BookingOpened {
            id: booking_id,
            user_id: user_id.to_string(),
            vehicle_id,
            spot_id,
            started_at,
        };
        // On WAL failure the claim guard drops and rolls back; nothing
        // else was touched.
        self.persist_booking(&mut guard, &event).await?;
        claim.commit();

        metrics::counter!(crate::observability::BOOKINGS_OPENED_TOTAL).increment(1);
        Ok(started_at)
    }

    /// Close the caller's open booking on `spot_id`, freeing the spot.
    ///
    /// Wrong spot, no open booking, and someone else's booking are all the
    /// same `NoActiveBooking`; callers learn nothing about bookings they
    /// do not own. Returns the server-assigned end time.
    pub async fn release(&self, user_id: &str, spot_id: Ulid) -> Result<Ms, EngineError> {
        let Some(row) = self.get_spot(&spot_id) else {
            return Err(EngineError::NoActiveBooking(spot_id));
        };
        let mut guard = row.write().await;

        let booking = self
            .ledger
            .open_for_spot(&spot_id)
            .and_then(|id| self.ledger.get(&id))
            .ok_or(EngineError::NoActiveBooking(spot_id))?;
        if booking.user_id != user_id {
            return Err(EngineError::NoActiveBooking(spot_id));
        }

        let ended_at = now_ms();
        let event = Event::BookingClosed {
            id: booking.id,
            spot_id,
            ended_at,
        };
        self.persist_booking(&mut guard, &event).await?;

        metrics::counter!(crate::observability::BOOKINGS_CLOSED_TOTAL).increment(1);
        Ok(ended_at)
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL as the minimal event sequence recreating current
    /// state. The full booking ledger is preserved: closed bookings are
    /// emitted as adjacent open/close pairs, history is never dropped.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();

        for entry in self.lots.iter() {
            events.push(Event::LotCreated {
                id: entry.id,
                name: entry.name.clone(),
            });
        }

        let rows: Vec<_> = self.spots.iter().map(|e| e.value().clone()).collect();
        for row in rows {
            let spot = row.read().await;
            events.push(Event::SpotCreated {
                id: spot.id,
                lot_id: spot.lot_id,
                level: spot.level.clone(),
                number: spot.number.clone(),
            });
        }

        for entry in self.vehicles.iter() {
            events.push(Event::VehicleRegistered {
                id: entry.id,
                user_id: entry.user_id.clone(),
                plate: entry.plate.clone(),
                vtype: entry.vtype.clone(),
            });
        }

        let mut bookings = self.ledger.all();
        bookings.sort_by_key(|b| (b.started_at, b.id));
        for b in bookings {
            events.push(Event::BookingOpened {
                id: b.id,
                user_id: b.user_id.clone(),
                vehicle_id: b.vehicle_id,
                spot_id: b.spot_id,
                started_at: b.started_at,
            });
            if let Some(ended_at) = b.ended_at {
                events.push(Event::BookingClosed {
                    id: b.id,
                    spot_id: b.spot_id,
                    ended_at,
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
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
