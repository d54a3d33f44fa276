use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
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

    /// Build a span without the ordering assertion. Used where the window comes
    /// from user input and is validated afterwards.
    pub fn unchecked(start: Ms, end: Ms) -> Self {
        Self { start, end }
    }

    pub fn is_valid(&self) -> bool {
        self.start < self.end
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// A calendar event. Its window is the effective window of every allocation
/// pointing at it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: Ulid,
    pub title: String,
    pub span: Span,
    pub description: Option<String>,
}

/// A bookable thing: a room, a projector, a person.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: Ulid,
    pub name: String,
    /// Free-form category tag ("room", "equipment", ...).
    pub kind: String,
}

/// Binds one resource to one event for the event's duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: Ulid,
    pub event_id: Ulid,
    pub resource_id: Ulid,
}

/// Two allocations on the same resource whose windows overlap.
/// `first < second` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Conflict {
    pub first: Ulid,
    pub second: Ulid,
    pub resource_id: Ulid,
}

impl Conflict {
    pub fn new(a: Ulid, b: Ulid, resource_id: Ulid) -> Self {
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        Self {
            first,
            second,
            resource_id,
        }
    }
}

/// State changes, flat with no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Change {
    EventCreated(Event),
    EventUpdated(Event),
    EventDeleted { id: Ulid },
    ResourceCreated(Resource),
    ResourceUpdated(Resource),
    ResourceDeleted { id: Ulid },
    AllocationCreated(Allocation),
    /// A batch insert, logged as one record so it replays whole or not at all.
    AllocationsCreated(Vec<Allocation>),
    AllocationUpdated(Allocation),
    AllocationDeleted { id: Ulid },
}

// ── Query result types ───────────────────────────────────────────

/// A conflict ready for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictRow {
    pub conflict: Conflict,
    pub resource_name: String,
    pub first_title: String,
    pub second_title: String,
}

/// One allocation joined with its event and resource. Missing sides are `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportRow {
    pub allocation_id: Ulid,
    pub event_id: Ulid,
    pub resource_id: Ulid,
    pub event_title: Option<String>,
    pub span: Option<Span>,
    pub resource_name: Option<String>,
    pub resource_kind: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dashboard {
    pub total_events: usize,
    pub total_resources: usize,
    pub total_allocations: usize,
    pub upcoming: Vec<Event>,
}
