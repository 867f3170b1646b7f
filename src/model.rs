use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type in storage and on the WAL.
pub type Ms = i64;

/// Binary occupancy state of a spot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpotStatus {
    Available,
    Occupied,
}

impl SpotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpotStatus::Available => "AVAILABLE",
            SpotStatus::Occupied => "OCCUPIED",
        }
    }
}

/// A parking lot. Names are unique within a facility.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lot {
    pub id: Ulid,
    pub name: String,
}

/// A single parking spot.
///
/// Invariant: `status == Occupied` iff exactly one open booking references
/// this spot. Only the book/release paths mutate `status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Spot {
    pub id: Ulid,
    pub lot_id: Ulid,
    pub level: String,
    pub number: String,
    pub status: SpotStatus,
}

/// A registered vehicle. Immutable once registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vehicle {
    pub id: Ulid,
    pub user_id: String,
    pub plate: String,
    pub vtype: String,
}

/// A booking session. Open while `ended_at` is unset; closed exactly once,
/// never deleted, never reopened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Booking {
    pub id: Ulid,
    pub user_id: String,
    pub vehicle_id: Ulid,
    pub spot_id: Ulid,
    pub started_at: Ms,
    pub ended_at: Option<Ms>,
}

impl Booking {
    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }

    pub fn status_label(&self) -> &'static str {
        if self.is_open() { "ACTIVE" } else { "COMPLETED" }
    }
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    LotCreated {
        id: Ulid,
        name: String,
    },
    SpotCreated {
        id: Ulid,
        lot_id: Ulid,
        level: String,
        number: String,
    },
    SpotDeleted {
        id: Ulid,
    },
    VehicleRegistered {
        id: Ulid,
        user_id: String,
        plate: String,
        vtype: String,
    },
    BookingOpened {
        id: Ulid,
        user_id: String,
        vehicle_id: Ulid,
        spot_id: Ulid,
        started_at: Ms,
    },
    BookingClosed {
        id: Ulid,
        spot_id: Ulid,
        ended_at: Ms,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct OccupancySummary {
    pub total_spots: u64,
    pub available: u64,
    pub occupied: u64,
    /// occupied / total; 0.0 when the facility has no spots.
    pub occupancy_rate: f64,
}

// ── Display-time formatting ──────────────────────────────────────

/// Render a timestamp at a fixed UTC offset, RFC 3339 style
/// (`2026-08-06T14:30:05+05:30`). Stateless; the offset lives in config
/// and is applied only at the wire boundary. Storage keeps raw `Ms`.
pub fn format_at_offset(t: Ms, offset_min: i32) -> String {
    let shifted = t + (offset_min as i64) * 60_000;
    let days = shifted.div_euclid(86_400_000);
    let rem = shifted.rem_euclid(86_400_000);
    let (year, month, day) = civil_from_days(days);
    let secs = rem / 1000;
    let (hh, mm, ss) = (secs / 3600, (secs / 60) % 60, secs % 60);
    let (sign, off) = if offset_min < 0 {
        ('-', -offset_min)
    } else {
        ('+', offset_min)
    };
    format!(
        "{year:04}-{month:02}-{day:02}T{hh:02}:{mm:02}:{ss:02}{sign}{:02}:{:02}",
        off / 60,
        off % 60
    )
}

/// Days since 1970-01-01 to (year, month, day), proleptic Gregorian.
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let year = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = if month <= 2 { year + 1 } else { year };
    (year, month, day)
}
