use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use ulid::Ulid;

use crate::limits::HISTORY_PAGE_SIZE;
use crate::model::{Booking, Ms};

use super::EngineError;

/// The booking ledger: every booking session ever opened, plus the two
/// open-booking claim maps.
///
/// The claim maps are the store-level uniqueness constraints: at most one
/// open booking per spot and per vehicle. `claim` is the only gate that
/// admits a new open booking, and it is atomic per map, so it backstops
/// races the spot row lock does not exclude (same vehicle, two different
/// spots). Rows are never deleted; closing sets `ended_at` exactly once.
pub struct Ledger {
    bookings: DashMap<Ulid, Booking>,
    /// Per-user booking ids in open order (open order == start order,
    /// starts are server-assigned).
    by_user: DashMap<String, Vec<Ulid>>,
    open_by_spot: DashMap<Ulid, Ulid>,
    open_by_vehicle: DashMap<Ulid, Ulid>,
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

impl Ledger {
    pub fn new() -> Self {
        Self {
            bookings: DashMap::new(),
            by_user: DashMap::new(),
            open_by_spot: DashMap::new(),
            open_by_vehicle: DashMap::new(),
        }
    }

    // ── Uniqueness constraints ───────────────────────────────

    /// Atomically reserve the open-booking slots for `spot_id` and
    /// `vehicle_id`. Fails with `BookingConflict` if either slot is taken,
    /// leaving no residue. The returned guard rolls the reservation back
    /// on drop unless `commit` is called, so a WAL failure or a caller
    /// dropped mid-await cannot leak a claim.
    pub fn claim(
        &self,
        spot_id: Ulid,
        vehicle_id: Ulid,
        booking_id: Ulid,
    ) -> Result<ClaimGuard<'_>, EngineError> {
        match self.open_by_vehicle.entry(vehicle_id) {
            Entry::Occupied(existing) => return Err(EngineError::BookingConflict(*existing.get())),
            Entry::Vacant(slot) => {
                slot.insert(booking_id);
            }
        }
        match self.open_by_spot.entry(spot_id) {
            Entry::Occupied(existing) => {
                let conflict = *existing.get();
                drop(existing);
                self.open_by_vehicle.remove(&vehicle_id);
                Err(EngineError::BookingConflict(conflict))
            }
            Entry::Vacant(slot) => {
                slot.insert(booking_id);
                Ok(ClaimGuard {
                    ledger: self,
                    spot_id,
                    vehicle_id,
                    committed: false,
                })
            }
        }
    }

    // ── Row lifecycle ────────────────────────────────────────

    /// Record an open booking. Claims are (re)inserted idempotently so the
    /// same path serves live apply and WAL replay.
    pub fn open(&self, booking: Booking) {
        debug_assert!(booking.is_open());
        self.open_by_spot.insert(booking.spot_id, booking.id);
        self.open_by_vehicle.insert(booking.vehicle_id, booking.id);
        self.by_user
            .entry(booking.user_id.clone())
            .or_default()
            .push(booking.id);
        self.bookings.insert(booking.id, booking);
    }

    /// Close a booking: set `ended_at` and drop its claims. No-op if the
    /// row is missing or already closed.
    pub fn close(&self, booking_id: Ulid, ended_at: Ms) {
        let Some(mut row) = self.bookings.get_mut(&booking_id) else {
            return;
        };
        if !row.is_open() {
            return;
        }
        row.ended_at = Some(ended_at);
        let (spot_id, vehicle_id) = (row.spot_id, row.vehicle_id);
        drop(row);
        self.open_by_spot.remove(&spot_id);
        self.open_by_vehicle.remove(&vehicle_id);
    }

    // ── Reads ────────────────────────────────────────────────

    pub fn get(&self, booking_id: &Ulid) -> Option<Booking> {
        self.bookings.get(booking_id).map(|b| b.clone())
    }

    pub fn open_for_spot(&self, spot_id: &Ulid) -> Option<Ulid> {
        self.open_by_spot.get(spot_id).map(|e| *e.value())
    }

    pub fn open_for_vehicle(&self, vehicle_id: &Ulid) -> Option<Ulid> {
        self.open_by_vehicle.get(vehicle_id).map(|e| *e.value())
    }

    pub fn open_count(&self) -> usize {
        self.open_by_spot.len()
    }

    /// A user's bookings, newest first, bounded to the fixed page size.
    pub fn history_for(&self, user_id: &str) -> Vec<Booking> {
        let Some(ids) = self.by_user.get(user_id) else {
            return Vec::new();
        };
        ids.iter()
            .rev()
            .take(HISTORY_PAGE_SIZE)
            .filter_map(|id| self.bookings.get(id).map(|b| b.clone()))
            .collect()
    }

    /// All currently open bookings, newest first.
    pub fn active(&self) -> Vec<Booking> {
        let mut open: Vec<Booking> = self
            .open_by_spot
            .iter()
            .filter_map(|e| self.bookings.get(e.value()).map(|b| b.clone()))
            .collect();
        open.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        open
    }

    /// All rows, unordered. Compaction input.
    pub fn all(&self) -> Vec<Booking> {
        self.bookings.iter().map(|e| e.value().clone()).collect()
    }
}

/// Reservation of the two open-booking slots, pending apply. Rolls back
/// on drop unless committed.
pub struct ClaimGuard<'a> {
    ledger: &'a Ledger,
    spot_id: Ulid,
    vehicle_id: Ulid,
    committed: bool,
}

impl std::fmt::Debug for ClaimGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimGuard")
            .field("spot_id", &self.spot_id)
            .field("vehicle_id", &self.vehicle_id)
            .field("committed", &self.committed)
            .finish()
    }
}

impl ClaimGuard<'_> {
    /// The booking row was applied; the claims now belong to it.
    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.ledger.open_by_spot.remove(&self.spot_id);
            self.ledger.open_by_vehicle.remove(&self.vehicle_id);
        }
    }
}
