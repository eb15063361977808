use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

use super::SharedCalendar;
use std::sync::Arc;

/// Calendar map plus the secondary indexes. Live writes and WAL replay
/// go through the same `apply_event`/`remove_applied` so the two paths
/// cannot drift apart.
pub(super) struct CalendarStore {
    calendars: DashMap<Ulid, SharedCalendar>,
    /// Reverse lookup: block id → resource id.
    block_to_resource: DashMap<Ulid, Ulid>,
    /// booking ref → ids of the blocks it owns.
    booking_blocks: DashMap<Ulid, Vec<Ulid>>,
}

impl CalendarStore {
    pub fn new() -> Self {
        Self {
            calendars: DashMap::new(),
            block_to_resource: DashMap::new(),
            booking_blocks: DashMap::new(),
        }
    }

    pub fn calendar_count(&self) -> usize {
        self.calendars.len()
    }

    pub fn contains(&self, id: &Ulid) -> bool {
        self.calendars.contains_key(id)
    }

    pub fn get(&self, id: &Ulid) -> Option<SharedCalendar> {
        self.calendars.get(id).map(|e| e.value().clone())
    }

    /// Resources are implicit: the first write materializes the calendar.
    pub fn get_or_create(&self, id: Ulid) -> SharedCalendar {
        self.calendars
            .entry(id)
            .or_insert_with(|| Arc::new(RwLock::new(Calendar::new(id))))
            .clone()
    }

    pub fn resource_ids(&self) -> Vec<Ulid> {
        self.calendars.iter().map(|e| *e.key()).collect()
    }

    pub fn resource_for_block(&self, block_id: &Ulid) -> Option<Ulid> {
        self.block_to_resource.get(block_id).map(|e| *e.value())
    }

    pub fn blocks_for_booking(&self, booking_ref: &Ulid) -> Vec<Ulid> {
        self.booking_blocks
            .get(booking_ref)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    /// Apply a single-calendar event (caller holds the write lock).
    /// `BookingReleased` spans calendars and is driven by its caller via
    /// `remove_applied`.
    pub fn apply_event(&self, cal: &mut Calendar, event: &Event) {
        match event {
            Event::BlockCreated {
                id,
                resource_id,
                span,
                reason,
                booking_ref,
                notes,
                created_at,
                updated_at,
            } => {
                cal.insert_block(Block {
                    id: *id,
                    resource_id: *resource_id,
                    span: *span,
                    reason: *reason,
                    booking_ref: *booking_ref,
                    notes: notes.clone(),
                    created_at: *created_at,
                    updated_at: *updated_at,
                });
                self.block_to_resource.insert(*id, *resource_id);
                if let Some(bref) = booking_ref {
                    self.booking_blocks.entry(*bref).or_default().push(*id);
                }
            }
            Event::BlockUpdated { id, span, reason, notes, at, .. } => {
                // Remove + reinsert: the span change can move the sort position.
                if let Some(mut b) = cal.remove_block(*id) {
                    b.span = *span;
                    b.reason = *reason;
                    b.notes = notes.clone();
                    b.updated_at = *at;
                    cal.insert_block(b);
                }
            }
            Event::BlockDeleted { id, .. } => {
                self.remove_applied(cal, *id);
            }
            Event::BookingReleased { .. } => {}
        }
    }

    /// Remove one block and unindex it. Returns false if it was already gone.
    pub fn remove_applied(&self, cal: &mut Calendar, id: Ulid) -> bool {
        match cal.remove_block(id) {
            Some(b) => {
                self.block_to_resource.remove(&id);
                if let Some(bref) = b.booking_ref {
                    let now_empty = match self.booking_blocks.get_mut(&bref) {
                        Some(mut ids) => {
                            ids.retain(|x| *x != id);
                            ids.is_empty()
                        }
                        None => false,
                    };
                    if now_empty {
                        self.booking_blocks.remove_if(&bref, |_, v| v.is_empty());
                    }
                }
                true
            }
            None => false,
        }
    }
}
