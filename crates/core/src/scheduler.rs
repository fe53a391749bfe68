//! Debounced persistence of open notes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::events::EngineEvent;
use crate::registry::OpenNoteRegistry;
use crate::store::{RecordStore, SaveOutcome};
use crate::sync::RemoteSyncBridge;

struct Pending {
    generation: u64,
    cancel: CancellationToken,
}

#[derive(Default)]
struct SchedulerState {
    pending: HashMap<String, Pending>,
    next_generation: u64,
}

/// Coalesces bursts of edits into a single write per note.
///
/// Every `schedule` restarts the note's quiet-period timer. When it fires,
/// the registered copy is saved through the record store; at most one save
/// per note is in flight at a time.
pub struct SaveScheduler {
    store: Arc<RecordStore>,
    registry: Arc<OpenNoteRegistry>,
    bridge: Option<Arc<RemoteSyncBridge>>,
    events: broadcast::Sender<EngineEvent>,
    debounce: Duration,
    state: Mutex<SchedulerState>,
    gates: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SaveScheduler {
    pub fn new(
        store: Arc<RecordStore>,
        registry: Arc<OpenNoteRegistry>,
        bridge: Option<Arc<RemoteSyncBridge>>,
        events: broadcast::Sender<EngineEvent>,
        debounce: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            bridge,
            events,
            debounce,
            state: Mutex::new(SchedulerState::default()),
            gates: Mutex::new(HashMap::new()),
        }
    }

    /// (Re)starts the quiet-period timer for a note.
    pub fn schedule(self: &Arc<Self>, note_id: &str) {
        let cancel = CancellationToken::new();
        let generation = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.next_generation += 1;
            let generation = state.next_generation;
            let previous = state.pending.insert(
                note_id.to_string(),
                Pending {
                    generation,
                    cancel: cancel.clone(),
                },
            );
            if let Some(previous) = previous {
                previous.cancel.cancel();
            }
            generation
        };

        let this = Arc::clone(self);
        let note_id = note_id.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(this.debounce) => {}
            }

            if !this.take_pending(&note_id, Some(generation)) {
                return;
            }
            if let Err(e) = this.persist(&note_id).await
                && !e.is_conflict()
            {
                warn!(note_id = %note_id, error = %e, "debounced save failed");
            }
        });
    }

    /// Removes the pending entry. With a generation, only that exact timer is taken.
    fn take_pending(&self, note_id: &str, generation: Option<u64>) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match state.pending.get(note_id) {
            Some(pending) if generation.is_none_or(|g| g == pending.generation) => {
                if let Some(pending) = state.pending.remove(note_id) {
                    pending.cancel.cancel();
                }
                true
            }
            _ => false,
        }
    }

    /// Persists a pending change right away. Returns `None` if nothing was pending.
    pub async fn flush(&self, note_id: &str) -> Result<Option<SaveOutcome>> {
        if !self.take_pending(note_id, None) {
            return Ok(None);
        }
        self.persist(note_id).await.map(Some)
    }

    /// Flushes every pending note. Failures are logged and do not stop the others.
    pub async fn flush_all(&self) -> usize {
        let ids: Vec<String> = {
            let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.pending.keys().cloned().collect()
        };

        let mut flushed = 0;
        for id in ids {
            match self.flush(&id).await {
                Ok(Some(_)) => flushed += 1,
                Ok(None) => {}
                Err(e) => warn!(note_id = %id, error = %e, "failed to flush pending save"),
            }
        }
        flushed
    }

    /// Drops a pending save without writing. Returns true if one was pending.
    pub fn cancel(&self, note_id: &str) -> bool {
        let cancelled = self.take_pending(note_id, None);
        if cancelled {
            debug!(note_id, "cancelled pending save");
        }
        cancelled
    }

    pub fn cancel_all(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        for (_, pending) in state.pending.drain() {
            pending.cancel.cancel();
        }
    }

    pub fn has_pending(&self, note_id: &str) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.pending.contains_key(note_id)
    }

    /// Forgets a note entirely, e.g. after it was deleted.
    pub fn forget(&self, note_id: &str) {
        self.cancel(note_id);
        let mut gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
        gates.remove(note_id);
    }

    fn gate(&self, note_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(gates.entry(note_id.to_string()).or_default())
    }

    async fn persist(&self, note_id: &str) -> Result<SaveOutcome> {
        let gate = self.gate(note_id);
        let _gate = gate.lock().await;

        let Some(shared) = self.registry.get(note_id) else {
            return Err(Error::NotFound(format!("note {} is not open", note_id)));
        };
        let mut snapshot = shared.lock().await.clone();

        match self.store.save_note(&mut snapshot).await {
            Ok(outcome) => {
                shared.lock().await.last_write_marker = snapshot.last_write_marker;
                if outcome == SaveOutcome::Written
                    && let Some(bridge) = &self.bridge
                {
                    let bridge = Arc::clone(bridge);
                    tokio::spawn(async move {
                        bridge.push_note(&snapshot).await;
                    });
                }
                Ok(outcome)
            }
            Err(e) if e.is_conflict() => {
                warn!(note_id, "save conflict, reloading note from storage");
                let _ = self.events.send(EngineEvent::SaveConflict {
                    note_id: note_id.to_string(),
                });
                match self.store.load_note(note_id).await {
                    Some(fresh) => {
                        self.registry.replace(fresh).await;
                    }
                    None => {
                        self.registry.remove(note_id);
                    }
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::config::Settings;
    use crate::notes::Note;
    use std::time::SystemTime;
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        store: Arc<RecordStore>,
        registry: Arc<OpenNoteRegistry>,
        scheduler: Arc<SaveScheduler>,
        events: broadcast::Receiver<EngineEvent>,
        clock: Arc<ManualClock>,
    }

    fn harness(debounce: Duration) -> Harness {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(RecordStore::open(&Settings::with_root(dir.path()), clock.clone()).unwrap());
        let registry = Arc::new(OpenNoteRegistry::new());
        let (tx, rx) = broadcast::channel(32);
        let scheduler = Arc::new(SaveScheduler::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            None,
            tx,
            debounce,
        ));
        Harness {
            _dir: dir,
            store,
            registry,
            scheduler,
            events: rx,
            clock,
        }
    }

    #[tokio::test]
    async fn test_burst_of_edits_is_written_once() {
        let h = harness(Duration::from_millis(80));
        let note = Note::new("burst", h.clock.now());
        let id = note.id.clone();
        let shared = h.registry.register(note);

        for i in 0..5 {
            shared.lock().await.add_item(format!("item {}", i), h.clock.now());
            h.scheduler.schedule(&id);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(h.scheduler.has_pending(&id));

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!h.scheduler.has_pending(&id));
        assert_eq!(h.store.list_snapshots(&id).await.unwrap().len(), 1);
        assert_eq!(h.store.load_note(&id).await.unwrap().items.len(), 5);

        // The marker was written back into the shared copy
        assert!(shared.lock().await.last_write_marker.is_some());
    }

    #[tokio::test]
    async fn test_flush_persists_immediately() {
        let h = harness(Duration::from_secs(60));
        let note = Note::new("flush me", h.clock.now());
        let id = note.id.clone();
        h.registry.register(note);

        assert_eq!(h.scheduler.flush(&id).await.unwrap(), None);

        h.scheduler.schedule(&id);
        assert_eq!(h.scheduler.flush(&id).await.unwrap(), Some(SaveOutcome::Written));
        assert!(!h.scheduler.has_pending(&id));
        assert!(h.store.load_note(&id).await.is_some());
    }

    #[tokio::test]
    async fn test_cancel_drops_pending_save() {
        let h = harness(Duration::from_millis(30));
        let note = Note::new("never", h.clock.now());
        let id = note.id.clone();
        h.registry.register(note);

        h.scheduler.schedule(&id);
        assert!(h.scheduler.cancel(&id));
        assert!(!h.scheduler.cancel(&id));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(h.store.load_note(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_flush_all() {
        let h = harness(Duration::from_secs(60));
        let mut ids = Vec::new();
        for title in ["a", "b"] {
            let note = Note::new(title, h.clock.now());
            ids.push(note.id.clone());
            h.registry.register(note);
            h.scheduler.schedule(ids.last().unwrap());
        }

        assert_eq!(h.scheduler.flush_all().await, 2);
        for id in &ids {
            assert!(h.store.load_note(id).await.is_some());
        }
    }

    #[tokio::test]
    async fn test_conflict_reloads_registered_note() {
        let mut h = harness(Duration::from_secs(60));
        let mut note = Note::new("mine", h.clock.now());
        h.store.save_note(&mut note).await.unwrap();
        let id = note.id.clone();
        let shared = h.registry.register(note.clone());

        let mut theirs = note.clone();
        theirs.title = "theirs".to_string();
        let path = h.store.fs().note_path(&id);
        std::fs::write(&path, serde_json::to_vec_pretty(&theirs).unwrap()).unwrap();
        std::fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(SystemTime::now() + Duration::from_secs(30))
            .unwrap();

        shared.lock().await.set_title("mine, edited", h.clock.now());
        h.scheduler.schedule(&id);
        let err = h.scheduler.flush(&id).await.unwrap_err();
        assert!(err.is_conflict());

        assert_eq!(
            h.events.recv().await.unwrap(),
            EngineEvent::SaveConflict { note_id: id.clone() }
        );
        assert_eq!(shared.lock().await.title, "theirs");
        assert_eq!(h.store.load_note(&id).await.unwrap().title, "theirs");
    }

    #[tokio::test]
    async fn test_save_of_deleted_note_drops_open_copy() {
        let mut h = harness(Duration::from_secs(60));
        let mut note = Note::new("gone soon", h.clock.now());
        h.store.save_note(&mut note).await.unwrap();
        let id = note.id.clone();
        let shared = h.registry.register(note);

        std::fs::remove_file(h.store.fs().note_path(&id)).unwrap();
        shared.lock().await.add_item("late edit", h.clock.now());
        h.scheduler.schedule(&id);

        assert!(h.scheduler.flush(&id).await.unwrap_err().is_conflict());
        assert_eq!(
            h.events.recv().await.unwrap(),
            EngineEvent::SaveConflict { note_id: id.clone() }
        );
        assert!(!h.registry.is_open(&id));
        assert!(h.store.load_note(&id).await.is_none());
    }
}
