use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
///
/// Ordering is not asserted here: callers go through
/// `overlap::validate_span`, which turns an inverted span into a
/// `Validation` error instead of a panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

/// Why a range is blocked — a closed tag set, not a free string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockReason {
    /// Installed by the booking lifecycle; owned by it.
    Booking,
    /// Owner blocked the range by hand.
    Manual,
    /// Owner marked the range unavailable (vacation, maintenance).
    Unavailable,
}

impl BlockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockReason::Booking => "booking",
            BlockReason::Manual => "manual",
            BlockReason::Unavailable => "unavailable",
        }
    }

    /// Parse a wire tag. Unknown tags are the caller's problem.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "booking" => Some(BlockReason::Booking),
            "manual" => Some(BlockReason::Manual),
            "unavailable" => Some(BlockReason::Unavailable),
            _ => None,
        }
    }
}

/// One blocked range on a resource's calendar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub span: Span,
    pub reason: BlockReason,
    /// Present iff `reason == Booking`.
    pub booking_ref: Option<Ulid>,
    pub notes: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Block {
    pub fn is_booking(&self) -> bool {
        self.reason == BlockReason::Booking
    }
}

/// Who asked. Opaque to the engine — authorization lives in the host
/// system; this only flows into logs so mutations are attributable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerId(pub String);

impl CallerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for CallerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-resource calendar: all blocks, sorted by `span.start`.
///
/// Resources are implicit — the first write (or query) for an unknown
/// id materializes an empty calendar.
#[derive(Debug, Clone)]
pub struct Calendar {
    pub id: Ulid,
    pub blocks: Vec<Block>,
}

impl Calendar {
    pub fn new(id: Ulid) -> Self {
        Self { id, blocks: Vec::new() }
    }

    /// Insert a block maintaining sort order by span.start.
    pub fn insert_block(&mut self, block: Block) {
        let pos = self
            .blocks
            .binary_search_by_key(&block.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        self.blocks.insert(pos, block);
    }

    /// Remove a block by id.
    pub fn remove_block(&mut self, id: Ulid) -> Option<Block> {
        if let Some(pos) = self.blocks.iter().position(|b| b.id == id) {
            Some(self.blocks.remove(pos))
        } else {
            None
        }
    }

    pub fn find(&self, id: Ulid) -> Option<&Block> {
        self.blocks.iter().find(|b| b.id == id)
    }

    /// Return only blocks whose span overlaps the query window.
    /// Uses binary search to skip blocks starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Block> {
        // Everything at index >= right_bound starts at or after query.end → can't overlap.
        let right_bound = self.blocks.partition_point(|b| b.span.start < query.end);
        self.blocks[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }
}

/// The event types. Flat, no nesting. This is the WAL record format.
///
/// Mutation events carry their wall-clock instants so that
/// `created_at`/`updated_at` replay byte-identically. `BlockCreated`
/// carries both because compaction re-emits live blocks as creations
/// and must not reset their update history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BlockCreated {
        id: Ulid,
        resource_id: Ulid,
        span: Span,
        reason: BlockReason,
        booking_ref: Option<Ulid>,
        notes: Option<String>,
        created_at: Ms,
        updated_at: Ms,
    },
    BlockUpdated {
        id: Ulid,
        resource_id: Ulid,
        span: Span,
        reason: BlockReason,
        notes: Option<String>,
        at: Ms,
    },
    BlockDeleted {
        id: Ulid,
        resource_id: Ulid,
    },
    /// Removes every block carrying this booking ref, atomically.
    BookingReleased {
        booking_ref: Ulid,
    },
}

/// Partial update for a manual block. `None` leaves a field untouched;
/// for notes, `Some(None)` clears the text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockPatch {
    pub span: Option<Span>,
    pub reason: Option<BlockReason>,
    pub notes: Option<Option<String>>,
}

impl BlockPatch {
    pub fn is_empty(&self) -> bool {
        self.span.is_none() && self.reason.is_none() && self.notes.is_none()
    }
}

// ── Query result types ───────────────────────────────────────────

/// A conflicting block, as reported inside `EngineError::Conflict`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictRef {
    pub id: Ulid,
    pub span: Span,
}

/// Derived, never persisted: one UTC day and whether any instant in it
/// is blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvailabilityDay {
    pub date: NaiveDate,
    pub available: bool,
}

/// A bookable slot within a single day's working hours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaySlot {
    pub span: Span,
    pub available: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(span: Span) -> Block {
        Block {
            id: Ulid::new(),
            resource_id: Ulid::new(),
            span,
            reason: BlockReason::Manual,
            booking_ref: None,
            notes: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
    }

    #[test]
    fn reason_tags_round_trip() {
        for reason in [BlockReason::Booking, BlockReason::Manual, BlockReason::Unavailable] {
            assert_eq!(BlockReason::from_tag(reason.as_str()), Some(reason));
        }
        assert_eq!(BlockReason::from_tag("vacation"), None);
        assert_eq!(BlockReason::from_tag("Booking"), None); // tags are lowercase
    }

    #[test]
    fn block_ordering() {
        let mut cal = Calendar::new(Ulid::new());
        cal.insert_block(block(Span::new(300, 400)));
        cal.insert_block(block(Span::new(100, 200)));
        cal.insert_block(block(Span::new(200, 300)));
        assert_eq!(cal.blocks[0].span.start, 100);
        assert_eq!(cal.blocks[1].span.start, 200);
        assert_eq!(cal.blocks[2].span.start, 300);
    }

    #[test]
    fn block_remove() {
        let mut cal = Calendar::new(Ulid::new());
        let b = block(Span::new(100, 200));
        let id = b.id;
        cal.insert_block(b);
        assert_eq!(cal.blocks.len(), 1);
        cal.remove_block(id);
        assert!(cal.blocks.is_empty());
    }

    #[test]
    fn remove_nonexistent_returns_none() {
        let mut cal = Calendar::new(Ulid::new());
        cal.insert_block(block(Span::new(100, 200)));
        let result = cal.remove_block(Ulid::new());
        assert!(result.is_none());
        assert_eq!(cal.blocks.len(), 1); // original still there
    }

    #[test]
    fn remove_middle_preserves_order() {
        let mut cal = Calendar::new(Ulid::new());
        let blocks: Vec<Block> = (0..3)
            .map(|i| block(Span::new((i as Ms) * 100, (i as Ms) * 100 + 50)))
            .collect();
        let ids: Vec<Ulid> = blocks.iter().map(|b| b.id).collect();
        for b in blocks {
            cal.insert_block(b);
        }
        cal.remove_block(ids[1]); // remove middle
        assert_eq!(cal.blocks.len(), 2);
        assert_eq!(cal.blocks[0].id, ids[0]);
        assert_eq!(cal.blocks[1].id, ids[2]);
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let mut cal = Calendar::new(Ulid::new());
        cal.insert_block(block(Span::new(100, 200)));
        cal.insert_block(block(Span::new(450, 600)));
        cal.insert_block(block(Span::new(1000, 1100)));

        let query = Span::new(500, 800);
        let hits: Vec<_> = cal.overlapping(&query).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(450, 600));
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        // Block ending exactly at query.start is NOT overlapping (half-open)
        let mut cal = Calendar::new(Ulid::new());
        cal.insert_block(block(Span::new(100, 200)));
        let query = Span::new(200, 300);
        assert!(cal.overlapping(&query).next().is_none());
    }

    #[test]
    fn overlapping_large_block_spanning_query() {
        let mut cal = Calendar::new(Ulid::new());
        cal.insert_block(block(Span::new(0, 10000)));
        let query = Span::new(500, 600);
        let hits: Vec<_> = cal.overlapping(&query).collect();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn overlapping_empty_calendar() {
        let cal = Calendar::new(Ulid::new());
        let query = Span::new(0, 1000);
        assert!(cal.overlapping(&query).next().is_none());
    }

    #[test]
    fn overlapping_single_ms_overlap() {
        let mut cal = Calendar::new(Ulid::new());
        // Block [100, 201) overlaps query [200, 300) by exactly 1ms
        cal.insert_block(block(Span::new(100, 201)));
        let query = Span::new(200, 300);
        let hits: Vec<_> = cal.overlapping(&query).collect();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::BlockCreated {
            id: Ulid::new(),
            resource_id: Ulid::new(),
            span: Span::new(100, 200),
            reason: BlockReason::Booking,
            booking_ref: Some(Ulid::new()),
            notes: Some("Automatically blocked by booking".into()),
            created_at: 1733000000000,
            updated_at: 1733000000000,
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
