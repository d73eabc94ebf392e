use ulid::Ulid;

use crate::model::{Ms, ReservationStatus};

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    UserNotFound(Ulid),
    SpotNotFound(Ulid),
    SpotInactive(Ulid),
    InvalidInterval {
        start: Ms,
        end: Ms,
    },
    PastStartTime {
        start: Ms,
        now: Ms,
    },
    /// An overlapping active reservation already holds the window.
    SlotConflict(Ulid),
    /// Status transition attempted on a reservation that is no longer active.
    AlreadyFinalized {
        id: Ulid,
        status: ReservationStatus,
    },
    DuplicateEmail(String),
    DuplicateSpotNumber {
        lot_id: Ulid,
        spot_number: String,
    },
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::UserNotFound(id) => write!(f, "user not found: {id}"),
            EngineError::SpotNotFound(id) => write!(f, "spot not found: {id}"),
            EngineError::SpotInactive(id) => write!(f, "spot inactive: {id}"),
            EngineError::InvalidInterval { start, end } => {
                write!(f, "invalid interval: start {start} must be before end {end}")
            }
            EngineError::PastStartTime { start, now } => {
                write!(f, "start time {start} is not after now ({now})")
            }
            EngineError::SlotConflict(id) => {
                write!(f, "slot conflict with active reservation: {id}")
            }
            EngineError::AlreadyFinalized { id, status } => {
                write!(f, "reservation {id} is already {}", status.as_str())
            }
            EngineError::DuplicateEmail(email) => write!(f, "email already registered: {email}"),
            EngineError::DuplicateSpotNumber { lot_id, spot_number } => {
                write!(f, "spot number {spot_number} already exists in lot {lot_id}")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
