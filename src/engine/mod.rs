mod availability;
mod catalog;
mod conflict;
mod error;
mod mutations;
mod queries;
mod store;

pub use availability::{is_available, is_unavailable};
pub use error::{EngineError, Entity};
pub use store::{InMemoryStore, SharedWorkgroupState};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use ulid::Ulid;

use crate::clock::Clock;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

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
    #[cfg(test)]
    FailNextFlush,
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit:
/// take the first append, drain whatever else is already queued, write the
/// whole batch with one fsync, then answer every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        commit_batch(&mut wal, batch);
        if let Some(other) = deferred {
            handle_non_append(&mut wal, other);
        }
    }
}

fn commit_batch(wal: &mut Wal, mut batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, &batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for batch of {}: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let append_result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    let result = append_result.and_then(|()| wal.flush_sync());
    if result.is_err() {
        // Every caller of this batch is told it failed, so none of it may
        // survive a replay.
        if let Err(e) = wal.rollback() {
            tracing::error!("WAL rollback failed, refusing further appends: {e}");
        }
    }
    result
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
        #[cfg(test)]
        WalCommand::FailNextFlush => wal.inject_flush_failure(),
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

/// The allocation engine for one tenant.
///
/// Admission (`create_workgroup`, `add_workstation`) runs its conflict check
/// and write under `allocator`. Everything else works without it: removals and
/// sharing toggles serialize on the target workgroup's own lock, reads take
/// read locks only.
///
/// `commit_gate` is held shared by every writer across its WAL append and
/// apply, and exclusively by compaction. It is always taken first.
/// `catalog_lock` serializes catalog creates from their uniqueness checks
/// through apply; it is never held together with `allocator`.
pub struct Engine {
    pub store: InMemoryStore,
    pub notify: Arc<NotifyHub>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) allocator: Mutex<()>,
    pub(super) catalog_lock: Mutex<()>,
    pub(super) commit_gate: RwLock<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, clock: Arc<dyn Clock>) -> io::Result<Self> {
        let events = Wal::recover(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            store: InMemoryStore::new(),
            notify,
            clock,
            allocator: Mutex::new(()),
            catalog_lock: Mutex::new(()),
            commit_gate: RwLock::new(()),
            wal_tx,
        };

        // Sole owner of every Arc during replay, so try_write always succeeds.
        // Never block here: this can run inside an async context.
        for event in &events {
            match event.workgroup_id() {
                Some(wg) if !matches!(event, Event::WorkgroupCreated { .. }) => {
                    if let Some(shared) = engine.store.workgroup(&wg) {
                        let mut guard = shared.try_write().map_err(io::Error::other)?;
                        engine.store.apply_to_workgroup(&mut guard, event);
                    }
                }
                _ => engine.store.apply_event(event),
            }
        }
        tracing::debug!(
            "replayed {} events from {}",
            events.len(),
            wal_path.display()
        );

        Ok(engine)
    }

    pub fn now(&self) -> Ms {
        self.clock.now_ms()
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
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

    /// WAL-append, apply to the guarded workgroup, notify subscribers.
    pub(super) async fn persist_and_apply(
        &self,
        state: &mut WorkgroupState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.store.apply_to_workgroup(state, event);
        self.notify.send(state.workgroup.id, event);
        Ok(())
    }

    /// WAL-append then apply a catalog or workgroup-creation event.
    pub(super) async fn persist_and_insert(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.store.apply_event(event);
        if let Some(wg) = event.workgroup_id() {
            self.notify.send(wg, event);
        }
        Ok(())
    }

    /// Commit a catalog event under the shared commit gate.
    pub(super) async fn persist_catalog(&self, event: &Event) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        self.persist_and_insert(event).await
    }

    pub fn get_workgroup_state(&self, id: &Ulid) -> Option<SharedWorkgroupState> {
        self.store.workgroup(id)
    }

    pub(super) fn require_workgroup(&self, id: &Ulid) -> Result<SharedWorkgroupState, EngineError> {
        self.store
            .workgroup(id)
            .ok_or(EngineError::NotFound(Entity::Workgroup, *id))
    }

    pub fn subscribe(&self, workgroup_id: Ulid) -> tokio::sync::broadcast::Receiver<Event> {
        self.notify.subscribe(workgroup_id)
    }
}
