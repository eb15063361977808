mod availability;
mod bridge;
mod error;
mod mutations;
mod overlap;
mod queries;
mod store;

pub use availability::{merge_overlapping, subtract_intervals, DayAvailability, SlotOptions};
pub use bridge::BridgeError;
pub use error::EngineError;
pub use mutations::BOOKING_BLOCK_NOTES;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

use store::CalendarStore;

pub type SharedCalendar = Arc<RwLock<Calendar>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                                .record(batch.len() as f64);
                            let flush_start = std::time::Instant::now();
                            let result = flush_batch(&mut wal, &mut batch);
                            metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                                .record(flush_start.elapsed().as_secs_f64());
                            respond_batch(&mut batch, &result);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                        .record(batch.len() as f64);
                    let flush_start = std::time::Instant::now();
                    let result = flush_batch(&mut wal, &mut batch);
                    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                        .record(flush_start.elapsed().as_secs_f64());
                    respond_batch(&mut batch, &result);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &mut [(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

pub struct Engine {
    pub(super) store: CalendarStore,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
}

/// Resource a single-calendar event belongs to. `BookingReleased` can
/// span calendars and is resolved through the booking index instead.
fn event_resource_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::BlockCreated { resource_id, .. }
        | Event::BlockUpdated { resource_id, .. }
        | Event::BlockDeleted { resource_id, .. } => Some(*resource_id),
        Event::BookingReleased { .. } => None,
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> std::io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            store: CalendarStore::new(),
            wal_tx,
            notify,
        };

        // Replay events — we're the sole owner of these Arcs, so try_write
        // always succeeds instantly (no contention). Never use blocking_write
        // here because this may run inside an async context (e.g. lazy tenant
        // creation).
        for event in &events {
            match event {
                Event::BookingReleased { booking_ref } => {
                    for block_id in engine.store.blocks_for_booking(booking_ref) {
                        if let Some(rid) = engine.store.resource_for_block(&block_id)
                            && let Some(cal) = engine.store.get(&rid)
                        {
                            let mut guard =
                                cal.try_write().expect("replay: uncontended write");
                            engine.store.remove_applied(&mut guard, block_id);
                        }
                    }
                }
                other => {
                    if let Some(resource_id) = event_resource_id(other) {
                        let cal = engine.store.get_or_create(resource_id);
                        let mut guard = cal.try_write().expect("replay: uncontended write");
                        engine.store.apply_event(&mut guard, other);
                    }
                }
            }
        }

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub(super) fn get_calendar(&self, id: &Ulid) -> Option<SharedCalendar> {
        self.store.get(id)
    }

    /// Calendars materialize on first write; the per-tenant cap applies
    /// only to that first materialization.
    pub(super) fn calendar_for_write(&self, id: Ulid) -> Result<SharedCalendar, EngineError> {
        if !self.store.contains(&id)
            && self.store.calendar_count() >= crate::limits::MAX_RESOURCES_PER_TENANT
        {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        Ok(self.store.get_or_create(id))
    }

    pub fn resource_count(&self) -> usize {
        self.store.calendar_count()
    }

    /// WAL-append + apply + notify in one call. Eliminates the repeated 3-line pattern.
    pub(super) async fn persist_and_apply(
        &self,
        resource_id: Ulid,
        cal: &mut Calendar,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.store.apply_event(cal, event);
        self.notify.send(resource_id, event);
        Ok(())
    }

    /// Lookup block → resource, get calendar, acquire write lock.
    pub(super) async fn resolve_block_write(
        &self,
        block_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<Calendar>), EngineError> {
        let resource_id = self
            .store
            .resource_for_block(block_id)
            .ok_or(EngineError::NotFound(*block_id))?;
        let cal = self
            .get_calendar(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = cal.write_owned().await;
        Ok((resource_id, guard))
    }
}
