use std::collections::HashMap;

use tokio::sync::oneshot;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::overlap::{
    check_no_conflict, now_ms, validate_notes, validate_reason_ref, validate_span,
};
use super::{Engine, EngineError, WalCommand};

/// Notes auto-attached to blocks installed by the booking lifecycle.
pub const BOOKING_BLOCK_NOTES: &str = "Automatically blocked by booking";

impl Engine {
    /// Manual block creation (owner-driven). Booking blocks never enter
    /// here — they come from the lifecycle via `block_for_booking`.
    pub async fn create_block(
        &self,
        resource_id: Ulid,
        span: Span,
        reason: BlockReason,
        notes: Option<String>,
        caller: &CallerId,
    ) -> Result<Block, EngineError> {
        if reason == BlockReason::Booking {
            return Err(EngineError::Validation(
                "booking blocks are created by the booking lifecycle",
            ));
        }
        let block = self
            .insert_block_inner(resource_id, span, reason, None, notes)
            .await?;
        tracing::debug!(%caller, resource = %resource_id, block = %block.id, "manual block created");
        Ok(block)
    }

    /// Lifecycle-owned creation: reason is Booking, notes are auto-filled,
    /// a ConflictError propagates unchanged to reject the confirmation.
    pub async fn block_for_booking(
        &self,
        resource_id: Ulid,
        booking_ref: Ulid,
        span: Span,
    ) -> Result<Block, EngineError> {
        let block = self
            .insert_block_inner(
                resource_id,
                span,
                BlockReason::Booking,
                Some(booking_ref),
                Some(BOOKING_BLOCK_NOTES.to_string()),
            )
            .await?;
        tracing::debug!(
            resource = %resource_id,
            booking = %booking_ref,
            block = %block.id,
            "booking block installed"
        );
        Ok(block)
    }

    /// Validate → lock → conflict-check → WAL → apply. The write lock is
    /// held from the conflict scan through the in-memory apply, so no
    /// concurrent writer can slip a conflicting block in between.
    async fn insert_block_inner(
        &self,
        resource_id: Ulid,
        span: Span,
        reason: BlockReason,
        booking_ref: Option<Ulid>,
        notes: Option<String>,
    ) -> Result<Block, EngineError> {
        validate_span(&span)?;
        validate_reason_ref(reason, &booking_ref)?;
        validate_notes(&notes)?;

        let cal = self.calendar_for_write(resource_id)?;
        let mut guard = cal.write_owned().await;
        if guard.blocks.len() >= MAX_BLOCKS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many blocks on resource"));
        }

        if let Err(e) = check_no_conflict(&guard, &span, None) {
            metrics::counter!(crate::observability::BLOCK_CONFLICTS_TOTAL).increment(1);
            return Err(e);
        }

        let now = now_ms();
        let block = Block {
            id: Ulid::new(),
            resource_id,
            span,
            reason,
            booking_ref,
            notes,
            created_at: now,
            updated_at: now,
        };
        let event = Event::BlockCreated {
            id: block.id,
            resource_id,
            span,
            reason,
            booking_ref,
            notes: block.notes.clone(),
            created_at: now,
            updated_at: now,
        };
        self.persist_and_apply(resource_id, &mut guard, &event).await?;
        Ok(block)
    }

    /// Partial update of a manual block. Booking blocks are immutable
    /// here; a span change re-checks conflicts against all *other* blocks.
    pub async fn update_block(
        &self,
        id: Ulid,
        patch: BlockPatch,
        caller: &CallerId,
    ) -> Result<Block, EngineError> {
        if patch.is_empty() {
            return Err(EngineError::Validation("empty patch"));
        }
        if patch.reason == Some(BlockReason::Booking) {
            return Err(EngineError::Validation("blocks cannot be retagged as booking"));
        }
        let (resource_id, mut guard) = self.resolve_block_write(&id).await?;
        // Re-check under the lock: the block may have raced away.
        let existing = guard.find(id).cloned().ok_or(EngineError::NotFound(id))?;
        if existing.is_booking() {
            return Err(EngineError::BookingOwned(id));
        }

        let span = patch.span.unwrap_or(existing.span);
        validate_span(&span)?;
        let reason = patch.reason.unwrap_or(existing.reason);
        let notes = match patch.notes {
            Some(n) => n,
            None => existing.notes.clone(),
        };
        validate_notes(&notes)?;

        if span != existing.span
            && let Err(e) = check_no_conflict(&guard, &span, Some(id))
        {
            metrics::counter!(crate::observability::BLOCK_CONFLICTS_TOTAL).increment(1);
            return Err(e);
        }

        let now = now_ms();
        let event = Event::BlockUpdated {
            id,
            resource_id,
            span,
            reason,
            notes: notes.clone(),
            at: now,
        };
        self.persist_and_apply(resource_id, &mut guard, &event).await?;
        tracing::debug!(%caller, resource = %resource_id, block = %id, "block updated");
        Ok(Block {
            id,
            resource_id,
            span,
            reason,
            booking_ref: existing.booking_ref,
            notes,
            created_at: existing.created_at,
            updated_at: now,
        })
    }

    /// Idempotent delete: Ok(false) when the id is unknown. Booking
    /// blocks refuse direct deletion so the calendar and its booking
    /// cannot diverge.
    pub async fn delete_block(&self, id: Ulid, caller: &CallerId) -> Result<bool, EngineError> {
        let (resource_id, mut guard) = match self.resolve_block_write(&id).await {
            Ok(found) => found,
            Err(EngineError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        let Some(existing) = guard.find(id) else {
            return Ok(false);
        };
        if existing.is_booking() {
            return Err(EngineError::BookingOwned(id));
        }

        let event = Event::BlockDeleted { id, resource_id };
        self.persist_and_apply(resource_id, &mut guard, &event).await?;
        tracing::debug!(%caller, resource = %resource_id, block = %id, "block deleted");
        Ok(true)
    }

    /// Remove every block owned by `booking_ref`. Zero matches is Ok(0);
    /// the removal itself is one WAL record, so replay can never leave a
    /// partial release behind.
    pub async fn release_for_booking(&self, booking_ref: Ulid) -> Result<usize, EngineError> {
        let block_ids = self.store.blocks_for_booking(&booking_ref);
        if block_ids.is_empty() {
            return Ok(0);
        }

        let mut by_resource: HashMap<Ulid, Vec<Ulid>> = HashMap::new();
        for block_id in block_ids {
            if let Some(rid) = self.store.resource_for_block(&block_id) {
                by_resource.entry(rid).or_default().push(block_id);
            }
        }

        // Acquire write locks in sorted order to prevent deadlocks.
        let mut resource_ids: Vec<Ulid> = by_resource.keys().copied().collect();
        resource_ids.sort();

        let mut guards = Vec::with_capacity(resource_ids.len());
        for rid in &resource_ids {
            if let Some(cal) = self.get_calendar(rid) {
                guards.push((*rid, cal.write_owned().await));
            }
        }

        let event = Event::BookingReleased { booking_ref };
        self.wal_append(&event).await?;

        let mut removed = 0usize;
        for (rid, guard) in guards.iter_mut() {
            if let Some(ids) = by_resource.get(rid) {
                for id in ids {
                    if self.store.remove_applied(guard, *id) {
                        removed += 1;
                    }
                }
            }
            self.notify.send(*rid, &event);
        }
        tracing::debug!(booking = %booking_ref, removed, "booking released");
        Ok(removed)
    }

    /// Compact the WAL by rewriting it with only the events needed to
    /// recreate the current state.
    ///
    /// Every calendar's read lock is held until the compact command is
    /// queued: a write acked before the snapshot is in the snapshot, and
    /// a write that was still waiting on its lock queues behind the
    /// compact and lands in the rewritten file.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        // Same lock order as release_for_booking.
        let mut resource_ids = self.store.resource_ids();
        resource_ids.sort();

        let mut guards = Vec::with_capacity(resource_ids.len());
        for id in &resource_ids {
            if let Some(cal) = self.get_calendar(id) {
                guards.push(cal.read_owned().await);
            }
        }

        let mut events = Vec::new();
        for guard in &guards {
            for b in &guard.blocks {
                events.push(Event::BlockCreated {
                    id: b.id,
                    resource_id: b.resource_id,
                    span: b.span,
                    reason: b.reason,
                    booking_ref: b.booking_ref,
                    notes: b.notes.clone(),
                    created_at: b.created_at,
                    updated_at: b.updated_at,
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        drop(guards);
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
