//! Hard bounds. Everything a client can grow is capped; exceeding a cap is
//! a validation error, never an allocation hazard.

/// Max facilities (databases) a single server will materialize.
pub const MAX_FACILITIES: usize = 1024;

/// Max length of a facility (database) name.
pub const MAX_FACILITY_NAME_LEN: usize = 256;

/// Max lots per facility.
pub const MAX_LOTS_PER_FACILITY: usize = 1_000;

/// Max spots per facility.
pub const MAX_SPOTS_PER_FACILITY: usize = 100_000;

/// Max vehicles a single user may register.
pub const MAX_VEHICLES_PER_USER: usize = 32;

/// Max length of lot names, spot levels/numbers, and vehicle type strings.
pub const MAX_NAME_LEN: usize = 128;

/// Max length of a vehicle plate.
pub const MAX_PLATE_LEN: usize = 16;

/// Fixed page size for booking history reads.
pub const HISTORY_PAGE_SIZE: usize = 100;
