use ulid::Ulid;

use crate::model::*;

use super::Engine;

impl Engine {
    /// The caller's bookings, newest first, bounded to the fixed history
    /// page size. Plain read; no locking beyond the ledger's own.
    pub fn history(&self, user_id: &str) -> Vec<Booking> {
        self.ledger.history_for(user_id)
    }

    /// Facility-wide occupancy counts. Derived from the spot count and the
    /// open-booking claim map (occupied ⟺ open booking), so it needs no
    /// row locks; the rate degrades to 0.0 for an empty facility.
    pub fn occupancy(&self) -> OccupancySummary {
        let total_spots = self.spots.len() as u64;
        let occupied = (self.ledger.open_count() as u64).min(total_spots);
        let available = total_spots - occupied;
        let occupancy_rate = if total_spots == 0 {
            0.0
        } else {
            occupied as f64 / total_spots as f64
        };
        OccupancySummary {
            total_spots,
            available,
            occupied,
            occupancy_rate,
        }
    }

    /// All currently open bookings, newest first.
    pub fn active_bookings(&self) -> Vec<Booking> {
        self.ledger.active()
    }

    /// List spots, optionally restricted to one lot, ordered by
    /// (level, number).
    pub async fn list_spots(&self, lot_id: Option<Ulid>) -> Vec<Spot> {
        let rows: Vec<_> = self.spots.iter().map(|e| e.value().clone()).collect();
        let mut spots = Vec::with_capacity(rows.len());
        for row in rows {
            let spot = row.read().await;
            if lot_id.is_none_or(|l| spot.lot_id == l) {
                spots.push(spot.clone());
            }
        }
        spots.sort_by(|a, b| (&a.level, &a.number).cmp(&(&b.level, &b.number)));
        spots
    }
}
