use ulid::Ulid;

/// Engine failure taxonomy. Every variant carries a stable machine code
/// (`code()`) alongside the human message; the wire layer maps codes to
/// SQLSTATE classes.
#[derive(Debug)]
pub enum EngineError {
    /// No spot row with this id.
    SpotNotFound(Ulid),
    /// No lot row with this id.
    LotNotFound(Ulid),
    /// No vehicle row with this id.
    VehicleNotFound(Ulid),
    /// Spot exists but is not AVAILABLE; observed under the row lock.
    SpotNotAvailable(Ulid),
    /// Vehicle exists but belongs to someone else.
    VehicleNotOwned(Ulid),
    /// Ledger uniqueness constraint fired: the spot or the vehicle already
    /// has an open booking.
    BookingConflict(Ulid),
    /// No open booking matches (spot, caller). Wrong spot, already closed,
    /// and not-yours are deliberately indistinguishable.
    NoActiveBooking(Ulid),
    /// Spot cannot be deleted while OCCUPIED.
    SpotOccupied(Ulid),
    /// A row with this id (or unique name/plate) already exists.
    AlreadyExists(Ulid),
    LimitExceeded(&'static str),
    /// WAL append/compact failure. Nothing was applied; safe to retry.
    WalError(String),
}

impl EngineError {
    /// Stable machine-readable kind, mirrored to clients verbatim.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::SpotNotFound(_) => "SPOT_NOT_FOUND",
            EngineError::LotNotFound(_) => "LOT_NOT_FOUND",
            EngineError::VehicleNotFound(_) => "VEHICLE_NOT_FOUND",
            EngineError::SpotNotAvailable(_) => "SPOT_NOT_AVAILABLE",
            EngineError::VehicleNotOwned(_) => "VEHICLE_NOT_OWNED",
            EngineError::BookingConflict(_) => "BOOKING_CONFLICT",
            EngineError::NoActiveBooking(_) => "NO_ACTIVE_BOOKING",
            EngineError::SpotOccupied(_) => "SPOT_OCCUPIED",
            EngineError::AlreadyExists(_) => "ALREADY_EXISTS",
            EngineError::LimitExceeded(_) => "LIMIT_EXCEEDED",
            EngineError::WalError(_) => "INTERNAL",
        }
    }

    /// True for infrastructure failures where the operation did not apply
    /// and the caller may retry as-is. Domain conflicts are not retryable;
    /// they reflect real state.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::WalError(_))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::SpotNotFound(id) => write!(f, "spot does not exist: {id}"),
            EngineError::LotNotFound(id) => write!(f, "lot does not exist: {id}"),
            EngineError::VehicleNotFound(id) => write!(f, "vehicle does not exist: {id}"),
            EngineError::SpotNotAvailable(id) => write!(f, "spot is not available: {id}"),
            EngineError::VehicleNotOwned(id) => {
                write!(f, "vehicle does not belong to caller: {id}")
            }
            EngineError::BookingConflict(id) => {
                write!(f, "active booking exists for spot or vehicle: {id}")
            }
            EngineError::NoActiveBooking(spot) => {
                write!(f, "no active booking found for this spot and user: {spot}")
            }
            EngineError::SpotOccupied(id) => {
                write!(f, "cannot delete an occupied spot: {id}")
            }
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
