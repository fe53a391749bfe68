//! Wires the record store, watcher, lock coordinator, save scheduler and
//! optional remote bridge into one handle for the UI layer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backup::Snapshot;
use crate::clock::Clock;
use crate::config::{DeviceIdentity, Settings, SettingsProvider};
use crate::error::{Error, Result};
use crate::events::EngineEvent;
use crate::lock::{AcquireOutcome, ForceOutcome, LockCoordinator, LockState};
use crate::notes::Note;
use crate::registry::{OpenNoteRegistry, SharedNote};
use crate::remote::open_backend;
use crate::scheduler::SaveScheduler;
use crate::store::{RecordStore, SaveOutcome};
use crate::sync::{PullReport, RemoteSyncBridge};
use crate::watcher::ChangeWatcher;

const EVENT_CAPACITY: usize = 256;

pub struct Engine {
    settings: Settings,
    clock: Arc<dyn Clock>,
    store: Arc<RecordStore>,
    registry: Arc<OpenNoteRegistry>,
    scheduler: Arc<SaveScheduler>,
    locks: Arc<LockCoordinator>,
    watcher: Arc<ChangeWatcher>,
    bridge: Option<Arc<RemoteSyncBridge>>,
    events: broadcast::Sender<EngineEvent>,
    cancel: CancellationToken,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Builds every component and primes the change watcher. Background
    /// loops are not running until `start` is called.
    pub async fn open(settings: Settings, clock: Arc<dyn Clock>) -> Result<Arc<Self>> {
        settings.validate()?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let store = Arc::new(RecordStore::open(&settings, Arc::clone(&clock))?);
        let registry = Arc::new(OpenNoteRegistry::new());

        let bridge = match &settings.remote {
            Some(remote) => Some(Arc::new(RemoteSyncBridge::new(
                open_backend(remote)?,
                Arc::clone(&store),
                events.clone(),
            ))),
            None => None,
        };

        let scheduler = Arc::new(SaveScheduler::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            bridge.clone(),
            events.clone(),
            settings.timings.debounce(),
        ));

        let locks = Arc::new(LockCoordinator::new(
            store.fs().clone(),
            settings.device.clone(),
            Arc::clone(&clock),
            &settings.timings,
            events.clone(),
        ));

        let watcher = Arc::new(ChangeWatcher::new(
            store.fs().clone(),
            Arc::clone(store.self_writes()),
            events.clone(),
            settings.timings.poll_interval(),
        ));
        watcher.prime().await?;

        info!(
            root = %settings.storage_root.display(),
            device = %settings.device.name,
            remote = bridge.is_some(),
            "engine opened"
        );

        Ok(Arc::new(Self {
            settings,
            clock,
            store,
            registry,
            scheduler,
            locks,
            watcher,
            bridge,
            events,
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    pub async fn open_with_provider(provider: &dyn SettingsProvider, clock: Arc<dyn Clock>) -> Result<Arc<Self>> {
        Self::open(provider.settings()?, clock).await
    }

    /// Spawns the change watcher, the periodic pull and the event reaction
    /// loop. Calling it again has no effect. The loops run until `shutdown`.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);

        tasks.push(tokio::spawn(
            Arc::clone(&self.watcher).run(self.cancel.child_token()),
        ));

        // Subscribe before spawning so no early event is missed
        let receiver = self.events.subscribe();
        tasks.push(tokio::spawn(
            Arc::clone(self).react(receiver, self.cancel.child_token()),
        ));

        if self.bridge.is_some() {
            tasks.push(tokio::spawn(
                Arc::clone(self).pull_loop(self.cancel.child_token()),
            ));
        }

        info!("engine started");
    }

    async fn react(self: Arc<Self>, mut receiver: broadcast::Receiver<EngineEvent>, cancel: CancellationToken) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = receiver.recv() => event,
            };

            match event {
                Ok(EngineEvent::NoteChanged { note_id }) => self.on_external_change(&note_id).await,
                Ok(EngineEvent::NoteDeleted { note_id }) => self.on_external_delete(&note_id),
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "event reaction fell behind, reloading open notes");
                    for id in self.registry.ids() {
                        self.on_external_change(&id).await;
                    }
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!("event reaction loop stopped");
    }

    async fn pull_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.timings.pull_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.pull_now().await {
                debug!(error = %e, "periodic pull failed");
            }
        }
        debug!("pull loop stopped");
    }

    /// Brings an open note in line with storage after someone else wrote it.
    ///
    /// Skipped when the open copy already reflects the stored record. If the
    /// record cannot be read the in-memory copy is kept.
    async fn on_external_change(&self, note_id: &str) {
        let Some(shared) = self.registry.get(note_id) else {
            return;
        };
        let Some(fresh) = self.store.load_note(note_id).await else {
            warn!(note_id, "changed note could not be reloaded, keeping open copy");
            return;
        };
        if shared.lock().await.last_write_marker == fresh.last_write_marker {
            return;
        }

        self.scheduler.cancel(note_id);
        *shared.lock().await = fresh;
        debug!(note_id, "reloaded open note after external change");
    }

    /// Drops every local trace of a note removed elsewhere, so a later edit
    /// of the stale copy cannot recreate it.
    fn on_external_delete(&self, note_id: &str) {
        self.scheduler.cancel(note_id);
        self.locks.halt_heartbeat(note_id);
        if self.registry.remove(note_id).is_some() {
            debug!(note_id, "closed open note after external delete");
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn device(&self) -> &DeviceIdentity {
        &self.settings.device
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    pub fn locks(&self) -> &Arc<LockCoordinator> {
        &self.locks
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    fn spawn_push(&self, note: Note) {
        if let Some(bridge) = &self.bridge {
            let bridge = Arc::clone(bridge);
            tokio::spawn(async move {
                bridge.push_note(&note).await;
            });
        }
    }

    fn spawn_push_order(&self, ids: Vec<String>) {
        if let Some(bridge) = &self.bridge {
            let bridge = Arc::clone(bridge);
            tokio::spawn(async move {
                bridge.push_order(&ids).await;
            });
        }
    }

    // Records

    pub async fn load_all(&self) -> Result<Vec<Note>> {
        self.store.load_all().await
    }

    pub async fn load_note(&self, note_id: &str) -> Option<Note> {
        self.store.load_note(note_id).await
    }

    /// Saves a note that is not managed through `open_note`/`mutate`.
    pub async fn save_note(&self, note: &mut Note) -> Result<SaveOutcome> {
        let outcome = self.store.save_note(note).await?;
        if outcome == SaveOutcome::Written {
            self.spawn_push(note.clone());
        }
        Ok(outcome)
    }

    /// Creates, persists and lists a new empty note.
    pub async fn create_note(&self, title: &str) -> Result<Note> {
        let mut note = Note::new(title, self.clock.now());
        self.store.save_note(&mut note).await?;
        self.store.add_to_manifest(&note.id).await?;
        info!(note_id = %note.id, "created note");

        self.spawn_push(note.clone());
        self.spawn_push_order(self.store.load_manifest().await);
        Ok(note)
    }

    pub async fn delete_note(&self, note_id: &str) -> Result<()> {
        self.scheduler.forget(note_id);
        self.locks.halt_heartbeat(note_id);
        self.registry.remove(note_id);
        self.store.delete_note(note_id).await?;

        if let Some(bridge) = &self.bridge {
            let bridge = Arc::clone(bridge);
            let note_id = note_id.to_string();
            tokio::spawn(async move {
                bridge.push_delete(&note_id).await;
            });
        }
        Ok(())
    }

    pub async fn save_manifest(&self, ids: &[String]) -> Result<()> {
        self.store.save_manifest(ids).await?;
        self.spawn_push_order(ids.to_vec());
        Ok(())
    }

    // Open notes

    /// Registers a note as open and returns the shared copy edits go through.
    pub async fn open_note(&self, note_id: &str) -> Result<SharedNote> {
        if let Some(shared) = self.registry.reopen(note_id) {
            return Ok(shared);
        }
        let note = self
            .store
            .load_note(note_id)
            .await
            .ok_or_else(|| Error::NotFound(note_id.to_string()))?;
        Ok(self.registry.register(note))
    }

    /// Flushes any pending edit and drops one registration of the note.
    pub async fn close_note(&self, note_id: &str) -> Result<()> {
        let flushed = self.scheduler.flush(note_id).await;
        if self.registry.unregister(note_id) {
            self.scheduler.cancel(note_id);
        }
        flushed.map(|_| ())
    }

    /// Applies a local edit to an open note and schedules a debounced save.
    pub async fn mutate<F, R>(&self, note_id: &str, edit: F) -> Result<R>
    where
        F: FnOnce(&mut Note) -> R,
    {
        let shared = self
            .registry
            .get(note_id)
            .ok_or_else(|| Error::NotFound(format!("note {} is not open", note_id)))?;
        let result = {
            let mut note = shared.lock().await;
            edit(&mut note)
        };
        self.scheduler.schedule(note_id);
        Ok(result)
    }

    pub fn has_pending_save(&self, note_id: &str) -> bool {
        self.scheduler.has_pending(note_id)
    }

    // Locks

    pub async fn try_acquire(&self, note_id: &str, request_takeover: bool) -> Result<AcquireOutcome> {
        self.locks.try_acquire(note_id, request_takeover).await
    }

    pub async fn wait_for_lock(&self, note_id: &str, timeout: Duration, poll_delay: Duration) -> Result<bool> {
        self.locks.wait_for_lock(note_id, timeout, poll_delay).await
    }

    /// Forces a takeover once this device's request has aged past the
    /// configured minimum.
    pub async fn force_takeover(&self, note_id: &str) -> Result<ForceOutcome> {
        self.locks
            .force_takeover(note_id, self.settings.timings.takeover_min_age())
            .await
    }

    /// Persists pending edits, then hands the note to the takeover requester.
    pub async fn yield_note(&self, note_id: &str) -> Result<()> {
        if let Err(e) = self.scheduler.flush(note_id).await {
            warn!(note_id, error = %e, "flush before yield failed");
        }
        self.scheduler.cancel(note_id);
        self.locks.yield_lock(note_id);
        Ok(())
    }

    pub async fn release_lock(&self, note_id: &str) -> Result<()> {
        self.locks.release(note_id).await
    }

    pub fn start_heartbeat(&self, note_id: &str) {
        self.locks.start_heartbeat(note_id);
    }

    pub fn stop_heartbeat(&self, note_id: &str) {
        self.locks.stop_heartbeat(note_id);
    }

    pub fn lock_state(&self, note_id: &str) -> LockState {
        self.locks.state(note_id)
    }

    // Backups

    pub async fn list_snapshots(&self, note_id: &str) -> Result<Vec<Snapshot>> {
        self.store.list_snapshots(note_id).await
    }

    /// Restores a snapshot as the current note and refreshes any open copy.
    pub async fn restore_snapshot(&self, snapshot: &Snapshot) -> Result<Note> {
        self.scheduler.cancel(&snapshot.note_id);
        let note = self.store.restore_snapshot(snapshot).await?;
        self.registry.replace(note.clone()).await;

        let _ = self.events.send(EngineEvent::NoteChanged {
            note_id: note.id.clone(),
        });
        self.spawn_push(note.clone());
        Ok(note)
    }

    // Remote

    /// Pulls the remote now and applies the outcome to open notes.
    /// Without a remote this is a no-op.
    pub async fn pull_now(&self) -> Result<PullReport> {
        let Some(bridge) = &self.bridge else {
            return Ok(PullReport::default());
        };

        let report = bridge.pull().await?;

        for id in &report.changed {
            self.on_external_change(id).await;
        }
        for id in &report.deleted {
            self.on_external_delete(id);
        }

        for id in &report.created {
            let _ = self.events.send(EngineEvent::NoteCreated { note_id: id.clone() });
        }
        for id in &report.changed {
            let _ = self.events.send(EngineEvent::NoteChanged { note_id: id.clone() });
        }
        for id in &report.deleted {
            let _ = self.events.send(EngineEvent::NoteDeleted { note_id: id.clone() });
        }
        Ok(report)
    }

    /// Uploads every local note and the manifest. Used to seed an empty remote.
    pub async fn push_all(&self) -> Result<usize> {
        let Some(bridge) = &self.bridge else {
            return Ok(0);
        };

        let notes = self.store.load_all().await?;
        let mut pushed = 0;
        for note in &notes {
            if bridge.push_note(note).await {
                pushed += 1;
            }
        }
        let ids: Vec<String> = notes.into_iter().map(|note| note.id).collect();
        bridge.push_order(&ids).await;

        info!(pushed, total = ids.len(), "pushed local notes to remote");
        Ok(pushed)
    }

    /// Flushes pending saves, releases owned locks and stops background loops.
    pub async fn shutdown(&self) {
        let flushed = self.scheduler.flush_all().await;
        self.scheduler.cancel_all();

        self.locks.halt_all_heartbeats();
        for note_id in self.locks.owned_notes() {
            if let Err(e) = self.locks.release(&note_id).await {
                warn!(note_id = %note_id, error = %e, "failed to release lock on shutdown");
            }
        }

        self.cancel.cancel();
        let tasks = {
            let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *tasks)
        };
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }

        info!(flushed, "engine shut down");
    }
}
