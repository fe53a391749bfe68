use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{Notify, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::events::EngineEvent;
use crate::filesystem::{FileStat, NoteFilesystem, note_id_from_path};

/// Externally caused change to a note record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherEvent {
    Created(String),
    Changed(String),
    Deleted(String),
}

impl WatcherEvent {
    pub fn note_id(&self) -> &str {
        match self {
            WatcherEvent::Created(id) | WatcherEvent::Changed(id) | WatcherEvent::Deleted(id) => id,
        }
    }
}

impl From<WatcherEvent> for EngineEvent {
    fn from(event: WatcherEvent) -> Self {
        match event {
            WatcherEvent::Created(note_id) => EngineEvent::NoteCreated { note_id },
            WatcherEvent::Changed(note_id) => EngineEvent::NoteChanged { note_id },
            WatcherEvent::Deleted(note_id) => EngineEvent::NoteDeleted { note_id },
        }
    }
}

#[derive(Debug, Default)]
struct SelfWritesInner {
    in_flight: HashMap<String, usize>,
    written: HashMap<String, FileStat>,
    deleted: HashSet<String>,
}

/// Tags for writes this process made itself, so the watcher does not report
/// them back as external changes.
#[derive(Debug, Default)]
pub struct SelfWrites {
    inner: Mutex<SelfWritesInner>,
}

impl SelfWrites {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a write to `note_id` as in progress until the guard drops.
    pub fn begin(self: &Arc<Self>, note_id: &str) -> OperationGuard {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        *inner.in_flight.entry(note_id.to_string()).or_insert(0) += 1;
        OperationGuard {
            writes: Arc::clone(self),
            note_id: note_id.to_string(),
        }
    }

    pub fn is_in_flight(&self, note_id: &str) -> bool {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.in_flight.contains_key(note_id)
    }

    /// Consumes a matching self-write tag.
    ///
    /// `observed` is the record's current stat, or `None` if it is gone.
    /// Returns true if the observation is explained by our own write or delete.
    pub fn absorb(&self, note_id: &str, observed: Option<FileStat>) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        match observed {
            Some(stat) => match inner.written.remove(note_id) {
                Some(tagged) => tagged == stat,
                None => false,
            },
            None => inner.deleted.remove(note_id),
        }
    }

    fn record_write(&self, note_id: &str, stat: FileStat) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.deleted.remove(note_id);
        inner.written.insert(note_id.to_string(), stat);
    }

    fn record_delete(&self, note_id: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.written.remove(note_id);
        inner.deleted.insert(note_id.to_string());
    }

    fn end(&self, note_id: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = inner.in_flight.get_mut(note_id) {
            *count -= 1;
            if *count == 0 {
                inner.in_flight.remove(note_id);
            }
        }
    }
}

/// RAII guard that marks a note as being written by this process and
/// clears the mark on drop.
pub struct OperationGuard {
    writes: Arc<SelfWrites>,
    note_id: String,
}

impl OperationGuard {
    /// Records the fingerprint our write left on the medium.
    pub fn wrote(&self, stat: FileStat) {
        self.writes.record_write(&self.note_id, stat);
    }

    pub fn deleted(&self) {
        self.writes.record_delete(&self.note_id);
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.writes.end(&self.note_id);
    }
}

/// Detects creations, modifications and deletions of note records made by
/// other processes.
///
/// Native filesystem notifications only wake the loop early; the periodic
/// scan is what actually produces events, because sync clients do not always
/// trigger native notifications.
pub struct ChangeWatcher {
    fs: NoteFilesystem,
    self_writes: Arc<SelfWrites>,
    events: broadcast::Sender<EngineEvent>,
    poll_interval: Duration,
    known: Mutex<HashMap<String, FileStat>>,
}

/// Extra wait after a native notification so multi-step external writes settle.
const SETTLE_DELAY: Duration = Duration::from_millis(150);

impl ChangeWatcher {
    pub fn new(
        fs: NoteFilesystem,
        self_writes: Arc<SelfWrites>,
        events: broadcast::Sender<EngineEvent>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            fs,
            self_writes,
            events,
            poll_interval,
            known: Mutex::new(HashMap::new()),
        }
    }

    /// Seeds the cache with what is on disk now, without raising events.
    pub async fn prime(&self) -> Result<()> {
        let on_disk = self.fs.scan_all().await?;
        let mut known = self.known.lock().unwrap_or_else(PoisonError::into_inner);
        known.clear();
        for meta in on_disk {
            known.insert(meta.id, meta.stat);
        }
        debug!(count = known.len(), "primed change watcher");
        Ok(())
    }

    /// Compares the medium against the cache and emits events for external changes.
    pub async fn scan(&self) -> Result<Vec<WatcherEvent>> {
        let on_disk = self.fs.scan_all().await?;
        let mut events = Vec::new();

        {
            let mut known = self.known.lock().unwrap_or_else(PoisonError::into_inner);
            let mut seen = HashSet::new();

            for meta in on_disk {
                seen.insert(meta.id.clone());

                // Revisit on the next scan once our own write has finished
                if self.self_writes.is_in_flight(&meta.id) {
                    continue;
                }

                let previous = known.get(&meta.id).copied();
                if previous == Some(meta.stat) {
                    continue;
                }

                let ours = self.self_writes.absorb(&meta.id, Some(meta.stat));
                known.insert(meta.id.clone(), meta.stat);
                if ours {
                    continue;
                }

                events.push(match previous {
                    None => WatcherEvent::Created(meta.id),
                    Some(_) => WatcherEvent::Changed(meta.id),
                });
            }

            let gone: Vec<String> = known
                .keys()
                .filter(|id| !seen.contains(*id))
                .cloned()
                .collect();

            for id in gone {
                if self.self_writes.is_in_flight(&id) {
                    continue;
                }
                known.remove(&id);
                if self.self_writes.absorb(&id, None) {
                    continue;
                }
                events.push(WatcherEvent::Deleted(id));
            }
        }

        for event in &events {
            info!(note_id = event.note_id(), ?event, "external change detected");
            // No subscribers is fine
            let _ = self.events.send(event.clone().into());
        }

        Ok(events)
    }

    /// Runs the poll loop until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let wake = Arc::new(Notify::new());

        // Kept alive for the duration of the loop; dropping it stops notifications
        let _native = match self.native_watcher(Arc::clone(&wake)) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!(error = %e, "native file notifications unavailable, polling only");
                None
            }
        };

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        info!(dir = %self.fs.notes_dir().display(), "change watcher started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
                _ = wake.notified() => {
                    tokio::time::sleep(SETTLE_DELAY).await;
                }
            }

            if let Err(e) = self.scan().await {
                warn!(error = %e, "change scan failed");
            }
        }

        info!("change watcher stopped");
    }

    fn native_watcher(&self, wake: Arc<Notify>) -> Result<RecommendedWatcher> {
        let mut watcher = notify::recommended_watcher(
            move |result: std::result::Result<Event, notify::Error>| match result {
                Ok(event) => {
                    if event.paths.iter().any(|p| note_id_from_path(p).is_some()) {
                        wake.notify_one();
                    }
                }
                Err(e) => warn!(error = %e, "filesystem watcher error"),
            },
        )?;
        watcher.watch(&self.fs.notes_dir(), RecursiveMode::NonRecursive)?;
        Ok(watcher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup(temp_dir: &TempDir) -> (ChangeWatcher, NoteFilesystem, Arc<SelfWrites>) {
        let fs = NoteFilesystem::new(temp_dir.path()).unwrap();
        let self_writes = Arc::new(SelfWrites::new());
        let (tx, _rx) = broadcast::channel(16);
        let watcher = ChangeWatcher::new(
            fs.clone(),
            Arc::clone(&self_writes),
            tx,
            Duration::from_millis(20),
        );
        (watcher, fs, self_writes)
    }

    #[tokio::test]
    async fn test_detects_external_create_change_delete() {
        let temp_dir = TempDir::new().unwrap();
        let (watcher, fs, _) = setup(&temp_dir);
        watcher.prime().await.unwrap();

        fs.write_note("a", b"one").await.unwrap();
        assert_eq!(
            watcher.scan().await.unwrap(),
            vec![WatcherEvent::Created("a".to_string())]
        );

        // Size change is enough even if the mtime resolution is coarse
        fs.write_note("a", b"one two").await.unwrap();
        assert_eq!(
            watcher.scan().await.unwrap(),
            vec![WatcherEvent::Changed("a".to_string())]
        );

        fs.delete_note("a").await.unwrap();
        let events = watcher.scan().await.unwrap();
        assert_eq!(events, vec![WatcherEvent::Deleted("a".to_string())]);
        assert_eq!(events[0].note_id(), "a");

        assert!(watcher.scan().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_prime_does_not_emit() {
        let temp_dir = TempDir::new().unwrap();
        let (watcher, fs, _) = setup(&temp_dir);

        fs.write_note("existing", b"x").await.unwrap();
        watcher.prime().await.unwrap();
        assert!(watcher.scan().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_self_writes_are_suppressed() {
        let temp_dir = TempDir::new().unwrap();
        let (watcher, fs, self_writes) = setup(&temp_dir);
        watcher.prime().await.unwrap();

        {
            let guard = self_writes.begin("mine");
            fs.write_note("mine", b"content").await.unwrap();
            // Still in flight: nothing reported, nothing cached
            assert!(watcher.scan().await.unwrap().is_empty());
            guard.wrote(fs.stat_note("mine").await.unwrap().unwrap());
        }
        assert!(watcher.scan().await.unwrap().is_empty());

        {
            let guard = self_writes.begin("mine");
            fs.delete_note("mine").await.unwrap();
            guard.deleted();
        }
        assert!(watcher.scan().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_external_change_after_self_write_is_reported() {
        let temp_dir = TempDir::new().unwrap();
        let (watcher, fs, self_writes) = setup(&temp_dir);
        watcher.prime().await.unwrap();

        {
            let guard = self_writes.begin("n");
            fs.write_note("n", b"ours").await.unwrap();
            guard.wrote(fs.stat_note("n").await.unwrap().unwrap());
        }
        fs.write_note("n", b"theirs, longer").await.unwrap();

        assert_eq!(
            watcher.scan().await.unwrap(),
            vec![WatcherEvent::Created("n".to_string())]
        );
    }

    #[tokio::test]
    async fn test_events_are_broadcast() {
        let temp_dir = TempDir::new().unwrap();
        let fs = NoteFilesystem::new(temp_dir.path()).unwrap();
        let (tx, mut rx) = broadcast::channel(16);
        let watcher = ChangeWatcher::new(
            fs.clone(),
            Arc::new(SelfWrites::new()),
            tx,
            Duration::from_millis(20),
        );
        watcher.prime().await.unwrap();

        fs.write_note("b", b"x").await.unwrap();
        watcher.scan().await.unwrap();

        assert_eq!(
            rx.recv().await.unwrap(),
            EngineEvent::NoteCreated {
                note_id: "b".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_run_loop_picks_up_changes_and_stops() {
        let temp_dir = TempDir::new().unwrap();
        let fs = NoteFilesystem::new(temp_dir.path()).unwrap();
        let (tx, mut rx) = broadcast::channel(16);
        let watcher = Arc::new(ChangeWatcher::new(
            fs.clone(),
            Arc::new(SelfWrites::new()),
            tx,
            Duration::from_millis(20),
        ));
        watcher.prime().await.unwrap();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&watcher).run(cancel.clone()));

        fs.write_note("c", b"x").await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            EngineEvent::NoteCreated {
                note_id: "c".to_string()
            }
        );

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
