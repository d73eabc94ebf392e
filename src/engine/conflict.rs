use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

/// Validate a raw (start, end) pair into a reservation window.
/// Ordering is checked before limits so `InvalidInterval` always wins.
pub(crate) fn validate_window(start: Ms, end: Ms) -> Result<Span, EngineError> {
    use crate::limits::*;
    if start >= end {
        return Err(EngineError::InvalidInterval { start, end });
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    let window = Span::new(start, end);
    if window.duration_ms() > MAX_WINDOW_DURATION_MS {
        return Err(EngineError::LimitExceeded("window too wide"));
    }
    Ok(window)
}

/// Validate an availability/query window (wider cap than a single reservation).
pub(crate) fn validate_query_window(start: Ms, end: Ms) -> Result<Span, EngineError> {
    use crate::limits::*;
    if start >= end {
        return Err(EngineError::InvalidInterval { start, end });
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if end - start > MAX_QUERY_WINDOW_MS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(Span::new(start, end))
}

/// The admission scan: any active reservation overlapping the window is a
/// conflict. Cancelled/completed rows never block. Callers hold the spot's
/// write lock, so the conclusion stays valid through the following insert.
pub(crate) fn check_no_conflict(rs: &SpotState, window: &Span) -> Result<(), EngineError> {
    for reservation in rs.overlapping(window) {
        if reservation.is_active() {
            return Err(EngineError::SlotConflict(reservation.id));
        }
    }
    Ok(())
}
