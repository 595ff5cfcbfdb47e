use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds.
pub type Ms = i64;

pub type UserId = Ulid;
pub type ItemId = Ulid;
pub type ReservationId = Ulid;
pub type CommentId = Ulid;

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

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Closed on both ends: a rental is still running at the instant it ends.
    pub fn is_current_at(&self, now: Ms) -> bool {
        self.start <= now && now <= self.end
    }
}

// ── Reservation ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Waiting,
    Approved,
    Rejected,
}

impl Status {
    /// Next status for an owner decision. Terminal statuses have no successor.
    pub fn decide(self, approve: bool) -> Option<Status> {
        match self {
            Status::Waiting if approve => Some(Status::Approved),
            Status::Waiting => Some(Status::Rejected),
            Status::Approved | Status::Rejected => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self != Status::Waiting
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Waiting => "WAITING",
            Status::Approved => "APPROVED",
            Status::Rejected => "REJECTED",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "WAITING" => Ok(Status::Waiting),
            "APPROVED" => Ok(Status::Approved),
            "REJECTED" => Ok(Status::Rejected),
            _ => Err(format!("unknown status: {s}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub item_id: ItemId,
    pub booker_id: UserId,
    pub span: Span,
    pub status: Status,
}

/// All reservations of one item, sorted by `span.start`.
/// The per-item write lock around this is the serialization point for
/// overlap checks and status transitions.
#[derive(Debug, Clone)]
pub struct ItemLedger {
    pub item_id: ItemId,
    pub reservations: Vec<Reservation>,
}

impl ItemLedger {
    pub fn new(item_id: ItemId) -> Self {
        Self {
            item_id,
            reservations: Vec::new(),
        }
    }

    /// Insert maintaining sort order by span.start.
    pub fn insert(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .partition_point(|r| r.span.start <= reservation.span.start);
        self.reservations.insert(pos, reservation);
    }

    pub fn get(&self, id: &ReservationId) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == *id)
    }

    pub fn get_mut(&mut self, id: &ReservationId) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == *id)
    }

    /// Reservations whose window overlaps `query`.
    /// Binary search skips everything starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.span.end > query.start)
    }

    /// First APPROVED reservation overlapping `span`, other than `except`.
    pub fn approved_overlap(&self, span: &Span, except: Option<ReservationId>) -> Option<ReservationId> {
        self.overlapping(span)
            .find(|r| r.status == Status::Approved && Some(r.id) != except)
            .map(|r| r.id)
    }
}

// ── Directory records ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    pub owner_id: UserId,
    pub name: String,
    pub description: String,
    pub available: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: CommentId,
    pub item_id: ItemId,
    pub author_id: UserId,
    pub text: String,
    pub created: Ms,
}

/// WAL record format. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    UserRegistered {
        id: UserId,
        name: String,
        email: String,
    },
    ItemListed {
        id: ItemId,
        owner_id: UserId,
        name: String,
        description: String,
        available: bool,
    },
    ReservationCreated {
        id: ReservationId,
        item_id: ItemId,
        booker_id: UserId,
        span: Span,
    },
    ReservationDecided {
        id: ReservationId,
        item_id: ItemId,
        from: Status,
        to: Status,
    },
    CommentRecorded {
        id: CommentId,
        item_id: ItemId,
        author_id: UserId,
        text: String,
        created: Ms,
    },
}

// ── Query result types ───────────────────────────────────────────

/// Owner-facing annotations of an item detail view.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemBookings {
    pub last: Option<Reservation>,
    pub next: Option<Reservation>,
}

/// A reservation with its booker and item resolved. Either lookup may have
/// failed, in which case the field is empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReservationView {
    pub reservation: Reservation,
    pub booker: Option<User>,
    pub item: Option<Item>,
}
