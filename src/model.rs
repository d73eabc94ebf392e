use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// The one overlap predicate. Touching spans do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpotKind {
    Compact,
    Regular,
    Ev,
}

impl SpotKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpotKind::Compact => "compact",
            SpotKind::Regular => "regular",
            SpotKind::Ev => "ev",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "compact" => Some(SpotKind::Compact),
            "regular" => Some(SpotKind::Regular),
            "ev" => Some(SpotKind::Ev),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationStatus {
    Active,
    Cancelled,
    Completed,
}

impl ReservationStatus {
    /// The allowed-transition table. Active is the only non-terminal state;
    /// cancelled and completed reject every further transition.
    pub fn can_become(self, next: ReservationStatus) -> bool {
        matches!(
            (self, next),
            (ReservationStatus::Active, ReservationStatus::Cancelled)
                | (ReservationStatus::Active, ReservationStatus::Completed)
        )
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, ReservationStatus::Active)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Active => "active",
            ReservationStatus::Cancelled => "cancelled",
            ReservationStatus::Completed => "completed",
        }
    }
}

/// A reservation as stored inside its spot's state. Rows are never removed;
/// terminal statuses stay in place so history survives compaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub user_id: Ulid,
    pub window: Span,
    pub status: ReservationStatus,
}

impl Reservation {
    pub fn is_active(&self) -> bool {
        self.status == ReservationStatus::Active
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lot {
    pub id: Ulid,
    pub name: String,
    pub address: String,
    /// Advisory opening hours, minutes since midnight. Never consulted by admission.
    pub open_minute: u16,
    pub close_minute: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Ulid,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub phone: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SpotState {
    pub id: Ulid,
    pub lot_id: Ulid,
    /// Unique within the lot.
    pub spot_number: String,
    pub kind: SpotKind,
    pub is_active: bool,
    /// All reservations ever admitted on this spot, sorted by `window.start`.
    pub reservations: Vec<Reservation>,
}

impl SpotState {
    pub fn new(id: Ulid, lot_id: Ulid, spot_number: String, kind: SpotKind, is_active: bool) -> Self {
        Self {
            id,
            lot_id,
            spot_number,
            kind,
            is_active,
            reservations: Vec::new(),
        }
    }

    /// Insert maintaining sort order by window.start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .binary_search_by_key(&reservation.window.start, |r| r.window.start)
            .unwrap_or_else(|e| e);
        self.reservations.insert(pos, reservation);
    }

    pub fn reservation(&self, id: Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    pub fn reservation_mut(&mut self, id: Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == id)
    }

    /// Return only reservations whose window overlaps the query window.
    /// Uses binary search to skip reservations starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        // Everything at index >= right_bound starts at or after query.end → can't overlap.
        let right_bound = self
            .reservations
            .partition_point(|r| r.window.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.window.end > query.start)
    }
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    LotCreated {
        id: Ulid,
        name: String,
        address: String,
        open_minute: u16,
        close_minute: u16,
    },
    LotDeleted {
        id: Ulid,
    },
    SpotCreated {
        id: Ulid,
        lot_id: Ulid,
        spot_number: String,
        kind: SpotKind,
        is_active: bool,
    },
    SpotDeleted {
        id: Ulid,
        lot_id: Ulid,
    },
    UserCreated {
        id: Ulid,
        email: String,
        first_name: String,
        last_name: String,
        phone: Option<String>,
    },
    ReservationCreated {
        id: Ulid,
        spot_id: Ulid,
        user_id: Ulid,
        window: Span,
    },
    ReservationStatusChanged {
        id: Ulid,
        spot_id: Ulid,
        status: ReservationStatus,
    },
}

impl Event {
    /// The spot a notification for this event is published on.
    /// Lot/user registry events have no spot channel.
    pub fn spot_id(&self) -> Option<Ulid> {
        match self {
            Event::SpotCreated { id, .. } | Event::SpotDeleted { id, .. } => Some(*id),
            Event::ReservationCreated { spot_id, .. }
            | Event::ReservationStatusChanged { spot_id, .. } => Some(*spot_id),
            Event::LotCreated { .. } | Event::LotDeleted { .. } | Event::UserCreated { .. } => None,
        }
    }
}

// ── Time-of-day helpers (advisory lot hours) ─────────────────────

/// Parse "HH:MM" into minutes since midnight.
pub fn parse_hhmm(s: &str) -> Option<u16> {
    let (h, m) = s.split_once(':')?;
    let h: u16 = h.parse().ok()?;
    let m: u16 = m.parse().ok()?;
    if h > 23 || m > 59 {
        return None;
    }
    Some(h * 60 + m)
}

pub fn format_hhmm(minute: u16) -> String {
    format!("{:02}:{:02}", minute / 60, minute % 60)
}

// ── Read-side projections (query-time joins, never stored) ───────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LotSummary {
    pub id: Ulid,
    pub name: String,
    pub address: String,
}

impl From<&Lot> for LotSummary {
    fn from(lot: &Lot) -> Self {
        Self {
            id: lot.id,
            name: lot.name.clone(),
            address: lot.address.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserSummary {
    pub id: Ulid,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
}

impl From<&User> for UserSummary {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            email: user.email.clone(),
            first_name: user.first_name.clone(),
            last_name: user.last_name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpotInfo {
    pub id: Ulid,
    pub lot_id: Ulid,
    pub spot_number: String,
    pub kind: SpotKind,
    pub is_active: bool,
    pub lot: LotSummary,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpotSummary {
    pub id: Ulid,
    pub spot_number: String,
    pub kind: SpotKind,
    pub lot: LotSummary,
}

/// A reservation enriched with user/spot/lot summaries for the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationDetail {
    pub id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub status: ReservationStatus,
    pub user: UserSummary,
    pub spot: SpotSummary,
}
