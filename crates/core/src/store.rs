use std::collections::HashSet;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::backup::{BackupStore, Snapshot};
use crate::clock::Clock;
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::filesystem::{NoteFilesystem, is_valid_id, remove_if_exists, write_atomic};
use crate::notes::Note;
use crate::watcher::SelfWrites;

/// Result of a successful `save_note`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Written,
    /// Stored content was already byte-identical; nothing was written.
    Unchanged,
}

/// Durable note storage: one JSON document per note plus an ordering manifest.
pub struct RecordStore {
    fs: NoteFilesystem,
    backups: BackupStore,
    self_writes: Arc<SelfWrites>,
    conflict_tolerance: Duration,
    use_trash: bool,
    /// Serializes read-modify-write cycles on the manifest.
    manifest_lock: Mutex<()>,
}

impl RecordStore {
    /// Opens (and lays out, if needed) the storage root named in `settings`.
    pub fn open(settings: &Settings, clock: Arc<dyn Clock>) -> Result<Self> {
        let fs = NoteFilesystem::new(&settings.storage_root)?;
        let backups = BackupStore::new(fs.clone(), clock, settings.retention.clone());

        Ok(Self {
            fs,
            backups,
            self_writes: Arc::new(SelfWrites::new()),
            conflict_tolerance: settings.timings.conflict_tolerance(),
            use_trash: settings.use_trash,
            manifest_lock: Mutex::new(()),
        })
    }

    pub fn fs(&self) -> &NoteFilesystem {
        &self.fs
    }

    pub fn backups(&self) -> &BackupStore {
        &self.backups
    }

    /// Self-write tags shared with the change watcher.
    pub fn self_writes(&self) -> &Arc<SelfWrites> {
        &self.self_writes
    }

    fn within_tolerance(&self, stored: DateTime<Utc>, observed: DateTime<Utc>) -> bool {
        let drift = (stored - observed).num_milliseconds().unsigned_abs();
        drift <= self.conflict_tolerance.as_millis() as u64
    }

    /// Persists the note and its items as one document.
    ///
    /// When `note.last_write_marker` is set, the record must still exist and
    /// its current marker must match within the conflict tolerance,
    /// otherwise nothing is written and `Error::Conflict` is returned. On
    /// success the note's marker is refreshed from the medium.
    pub async fn save_note(&self, note: &mut Note) -> Result<SaveOutcome> {
        if !is_valid_id(&note.id) {
            return Err(Error::InvalidId(note.id.clone()));
        }

        note.renumber_items();
        let content = serde_json::to_vec_pretty(&*note)?;

        let guard = self.self_writes.begin(&note.id);
        let current = self.fs.stat_note(&note.id).await?;

        match (current, note.last_write_marker) {
            (Some(current), Some(observed)) if !self.within_tolerance(current.marker, observed) => {
                warn!(
                    note_id = %note.id,
                    stored = %current.marker,
                    observed = %observed,
                    "refusing to overwrite externally modified note"
                );
                return Err(Error::Conflict {
                    note_id: note.id.clone(),
                    stored: Some(current.marker),
                    observed: Some(observed),
                });
            }
            // Observed once, gone now: deleted elsewhere, do not bring it back
            (None, Some(observed)) => {
                warn!(note_id = %note.id, observed = %observed, "refusing to recreate externally deleted note");
                return Err(Error::Conflict {
                    note_id: note.id.clone(),
                    stored: None,
                    observed: Some(observed),
                });
            }
            _ => {}
        }

        if let Some(current) = current {
            match self.fs.read_note(&note.id).await {
                Ok(existing) if existing == content => {
                    note.last_write_marker = Some(current.marker);
                    debug!(note_id = %note.id, "note unchanged, skipping write");
                    return Ok(SaveOutcome::Unchanged);
                }
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        self.fs.write_note(&note.id, &content).await?;
        if let Some(stat) = self.fs.stat_note(&note.id).await? {
            guard.wrote(stat);
            note.last_write_marker = Some(stat.marker);
        }
        drop(guard);

        if let Err(e) = self.backups.snapshot(&note.id, &content).await {
            warn!(note_id = %note.id, error = %e, "failed to snapshot note");
        }

        debug!(note_id = %note.id, bytes = content.len(), "saved note");
        Ok(SaveOutcome::Written)
    }

    /// Loads a single note. Unreadable or malformed records are logged and
    /// reported as absent.
    pub async fn load_note(&self, id: &str) -> Option<Note> {
        if !is_valid_id(id) {
            return None;
        }

        // Stat first so the marker is never newer than the content we read
        let stat = match self.fs.stat_note(id).await {
            Ok(Some(stat)) => stat,
            Ok(None) => return None,
            Err(e) => {
                warn!(note_id = id, error = %e, "failed to stat note");
                return None;
            }
        };

        let bytes = match self.fs.read_note(id).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(note_id = id, error = %e, "failed to read note");
                return None;
            }
        };

        let mut note: Note = match serde_json::from_slice(&bytes) {
            Ok(note) => note,
            Err(e) => {
                warn!(note_id = id, error = %e, "skipping malformed note");
                return None;
            }
        };

        if note.id != id {
            warn!(note_id = id, stored_id = %note.id, "note id does not match file name");
            return None;
        }

        note.last_write_marker = Some(stat.marker);
        Some(note)
    }

    /// Loads every note in manifest order.
    ///
    /// Manifest entries without a record are dropped and records missing from
    /// the manifest are appended in file-name order. The healed manifest is
    /// written back when it differs.
    pub async fn load_all(&self) -> Result<Vec<Note>> {
        let order = {
            let _manifest = self.manifest_lock.lock().await;
            let manifest = self.load_manifest().await;
            let on_disk = self.fs.scan_all().await?;
            let disk_ids: HashSet<&str> = on_disk.iter().map(|m| m.id.as_str()).collect();

            let mut seen = HashSet::new();
            let mut order = Vec::with_capacity(on_disk.len());
            for id in &manifest {
                if disk_ids.contains(id.as_str()) && seen.insert(id.clone()) {
                    order.push(id.clone());
                }
            }
            for meta in &on_disk {
                if seen.insert(meta.id.clone()) {
                    order.push(meta.id.clone());
                }
            }

            if order != manifest {
                info!(
                    manifest = manifest.len(),
                    healed = order.len(),
                    "manifest out of sync with records, rewriting"
                );
                if let Err(e) = self.write_manifest(&order).await {
                    warn!(error = %e, "failed to persist healed manifest");
                }
            }
            order
        };

        let mut notes = Vec::with_capacity(order.len());
        for id in &order {
            if let Some(note) = self.load_note(id).await {
                notes.push(note);
            }
        }
        Ok(notes)
    }

    /// Reads the manifest. A missing or unreadable manifest is empty and
    /// malformed entries are skipped one by one.
    pub async fn load_manifest(&self) -> Vec<String> {
        let bytes = match tokio::fs::read(self.fs.manifest_path()).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!(error = %e, "failed to read manifest");
                return Vec::new();
            }
        };

        let value: serde_json::Value = match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "malformed manifest, treating as empty");
                return Vec::new();
            }
        };

        let Some(entries) = value.as_array() else {
            warn!("manifest is not a list, treating as empty");
            return Vec::new();
        };

        entries
            .iter()
            .filter_map(|entry| match entry.as_str() {
                Some(id) if is_valid_id(id) => Some(id.to_string()),
                _ => {
                    warn!(%entry, "skipping malformed manifest entry");
                    None
                }
            })
            .collect()
    }

    /// Persists the display order of notes.
    pub async fn save_manifest(&self, ids: &[String]) -> Result<()> {
        let _manifest = self.manifest_lock.lock().await;
        self.write_manifest(ids).await
    }

    /// Appends `id` to the manifest if it is not listed yet.
    pub async fn add_to_manifest(&self, id: &str) -> Result<()> {
        let _manifest = self.manifest_lock.lock().await;
        let mut ids = self.load_manifest().await;
        if ids.iter().any(|existing| existing == id) {
            return Ok(());
        }
        ids.push(id.to_string());
        self.write_manifest(&ids).await
    }

    async fn write_manifest(&self, ids: &[String]) -> Result<()> {
        let content = serde_json::to_vec_pretty(ids)?;
        write_atomic(&self.fs.manifest_path(), &content).await?;
        debug!(count = ids.len(), "saved manifest");
        Ok(())
    }

    /// Removes a note together with its backups, lock record and manifest entry.
    pub async fn delete_note(&self, id: &str) -> Result<()> {
        if !is_valid_id(id) {
            return Err(Error::InvalidId(id.to_string()));
        }

        {
            let guard = self.self_writes.begin(id);
            let removed = if self.use_trash {
                match self.fs.trash_note(id).await {
                    Ok(()) => true,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => false,
                    Err(e) => return Err(Error::Trash(e.to_string())),
                }
            } else {
                self.fs.delete_note(id).await?
            };
            if removed {
                guard.deleted();
            }
        }

        self.backups.delete_all_for_note(id).await?;
        remove_if_exists(&self.fs.lock_path(id)).await?;

        let _manifest = self.manifest_lock.lock().await;
        let mut ids = self.load_manifest().await;
        let before = ids.len();
        ids.retain(|existing| existing != id);
        if ids.len() != before {
            self.write_manifest(&ids).await?;
        }

        info!(note_id = id, trashed = self.use_trash, "deleted note");
        Ok(())
    }

    pub async fn list_snapshots(&self, id: &str) -> Result<Vec<Snapshot>> {
        self.backups.list_snapshots(id).await
    }

    /// Writes a snapshot's content back as the current note.
    ///
    /// The restore is an explicit user choice, so it overwrites without a
    /// conflict check. The note is re-added to the manifest if missing.
    pub async fn restore_snapshot(&self, snapshot: &Snapshot) -> Result<Note> {
        let bytes = self.backups.read_snapshot(snapshot).await?;
        let mut note: Note = serde_json::from_slice(&bytes)?;
        if note.id != snapshot.note_id {
            return Err(Error::NotFound(format!(
                "snapshot {} does not belong to note {}",
                snapshot.path.display(),
                snapshot.note_id
            )));
        }

        note.last_write_marker = None;
        self.save_note(&mut note).await?;
        self.add_to_manifest(&note.id).await?;

        info!(note_id = %note.id, taken_at = %snapshot.taken_at, "restored note from snapshot");
        Ok(note)
    }

    /// Ids of every note record on the medium.
    pub async fn note_ids(&self) -> Result<Vec<String>> {
        Ok(self.fs.scan_all().await?.into_iter().map(|m| m.id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::notes::{ItemFlag, WindowGeometry};
    use pretty_assertions::assert_eq;
    use std::time::SystemTime;
    use tempfile::TempDir;

    fn setup(temp_dir: &TempDir) -> (RecordStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let store = RecordStore::open(&Settings::with_root(temp_dir.path()), clock.clone()).unwrap();
        (store, clock)
    }

    /// Rewrites a record behind the store's back with a modification time
    /// `ahead` in the future.
    fn write_externally(store: &RecordStore, id: &str, content: &[u8], ahead: Duration) {
        let path = store.fs().note_path(id);
        std::fs::write(&path, content).unwrap();
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::now() + ahead).unwrap();
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let (store, clock) = setup(&temp_dir);
        let now = clock.now();

        let mut note = Note::new("Groceries", now);
        let milk = note.add_item("buy milk", now);
        note.add_item("Dairy", now);
        note.toggle_item_flag(&milk, ItemFlag::Completed, now);
        note.items[1].heading = true;
        note.items[0].attachment = Some("2 litres".to_string());
        note.items[0].due = Some(now + chrono::Duration::hours(3));
        note.set_geometry(WindowGeometry {
            left: 10.5,
            top: 20.0,
            width: 300.0,
            height: 240.25,
        });
        note.set_pinned(true, now);

        assert_eq!(store.save_note(&mut note).await.unwrap(), SaveOutcome::Written);
        assert!(note.last_write_marker.is_some());

        let loaded = store.load_note(&note.id).await.unwrap();
        assert_eq!(loaded, note);
    }

    #[tokio::test]
    async fn test_unchanged_save_writes_once() {
        let temp_dir = TempDir::new().unwrap();
        let (store, clock) = setup(&temp_dir);

        let mut note = Note::new("same", clock.now());
        assert_eq!(store.save_note(&mut note).await.unwrap(), SaveOutcome::Written);
        assert_eq!(store.save_note(&mut note).await.unwrap(), SaveOutcome::Unchanged);

        assert_eq!(store.list_snapshots(&note.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_conflict_when_modified_externally() {
        let temp_dir = TempDir::new().unwrap();
        let (store, clock) = setup(&temp_dir);

        let mut note = Note::new("mine", clock.now());
        store.save_note(&mut note).await.unwrap();

        let mut theirs = note.clone();
        theirs.title = "theirs".to_string();
        let external = serde_json::to_vec_pretty(&theirs).unwrap();
        write_externally(&store, &note.id, &external, Duration::from_secs(10));

        note.set_title("mine, edited", clock.now());
        let err = store.save_note(&mut note).await.unwrap_err();
        assert!(err.is_conflict());

        // Nothing was overwritten
        assert_eq!(store.fs().read_note(&note.id).await.unwrap(), external);
        assert_eq!(store.load_note(&note.id).await.unwrap().title, "theirs");
    }

    #[tokio::test]
    async fn test_conflict_when_deleted_externally() {
        let temp_dir = TempDir::new().unwrap();
        let (store, clock) = setup(&temp_dir);

        let mut note = Note::new("mine", clock.now());
        store.save_note(&mut note).await.unwrap();
        std::fs::remove_file(store.fs().note_path(&note.id)).unwrap();

        note.add_item("still here?", clock.now());
        match store.save_note(&mut note).await.unwrap_err() {
            Error::Conflict { stored, observed, .. } => {
                assert_eq!(stored, None);
                assert_eq!(observed, note.last_write_marker);
            }
            other => panic!("expected conflict, got {:?}", other),
        }
        assert!(!store.fs().note_path(&note.id).exists());
    }

    #[tokio::test]
    async fn test_marker_drift_within_tolerance_is_accepted() {
        let temp_dir = TempDir::new().unwrap();
        let (store, clock) = setup(&temp_dir);

        let mut note = Note::new("a", clock.now());
        store.save_note(&mut note).await.unwrap();

        let marker = note.last_write_marker.unwrap();
        note.last_write_marker = Some(marker - chrono::Duration::milliseconds(1500));
        note.set_title("b", clock.now());
        assert_eq!(store.save_note(&mut note).await.unwrap(), SaveOutcome::Written);
    }

    #[tokio::test]
    async fn test_save_without_marker_skips_conflict_check() {
        let temp_dir = TempDir::new().unwrap();
        let (store, clock) = setup(&temp_dir);

        let mut note = Note::new("a", clock.now());
        store.save_note(&mut note).await.unwrap();
        write_externally(&store, &note.id, b"{}", Duration::from_secs(60));

        note.last_write_marker = None;
        assert_eq!(store.save_note(&mut note).await.unwrap(), SaveOutcome::Written);
        assert_eq!(store.load_note(&note.id).await.unwrap().title, "a");
    }

    #[tokio::test]
    async fn test_save_rejects_invalid_id() {
        let temp_dir = TempDir::new().unwrap();
        let (store, clock) = setup(&temp_dir);

        let mut note = Note::new("x", clock.now());
        note.id = "../escape".to_string();
        assert!(matches!(
            store.save_note(&mut note).await,
            Err(Error::InvalidId(_))
        ));
    }

    #[tokio::test]
    async fn test_load_all_heals_manifest() {
        let temp_dir = TempDir::new().unwrap();
        let (store, clock) = setup(&temp_dir);

        let mut ids = Vec::new();
        for title in ["a", "b", "c"] {
            let mut note = Note::new(title, clock.now());
            note.id = format!("note-{}", title);
            store.save_note(&mut note).await.unwrap();
            ids.push(note.id);
        }

        store
            .save_manifest(&[
                "note-c".to_string(),
                "ghost".to_string(),
                "note-a".to_string(),
                "note-c".to_string(),
            ])
            .await
            .unwrap();

        let notes = store.load_all().await.unwrap();
        let titles: Vec<_> = notes.iter().map(|n| n.title.as_str()).collect();
        assert_eq!(titles, vec!["c", "a", "b"]);

        assert_eq!(
            store.load_manifest().await,
            vec!["note-c".to_string(), "note-a".to_string(), "note-b".to_string()]
        );
    }

    #[tokio::test]
    async fn test_malformed_note_is_absent() {
        let temp_dir = TempDir::new().unwrap();
        let (store, clock) = setup(&temp_dir);

        let mut good = Note::new("good", clock.now());
        store.save_note(&mut good).await.unwrap();
        std::fs::write(store.fs().note_path("broken"), b"{ not json").unwrap();

        assert!(store.load_note("broken").await.is_none());
        assert!(store.load_note("missing").await.is_none());

        let notes = store.load_all().await.unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].id, good.id);
    }

    #[tokio::test]
    async fn test_manifest_skips_malformed_entries() {
        let temp_dir = TempDir::new().unwrap();
        let (store, _clock) = setup(&temp_dir);
        let path = store.fs().manifest_path();

        assert!(store.load_manifest().await.is_empty());

        std::fs::write(&path, br#"["a", 5, null, "../x", "b"]"#).unwrap();
        assert_eq!(store.load_manifest().await, vec!["a".to_string(), "b".to_string()]);

        std::fs::write(&path, b"not a manifest").unwrap();
        assert!(store.load_manifest().await.is_empty());
    }

    #[tokio::test]
    async fn test_delete_removes_record_backups_lock_and_manifest_entry() {
        let temp_dir = TempDir::new().unwrap();
        let (store, clock) = setup(&temp_dir);

        let mut keep = Note::new("keep", clock.now());
        let mut doomed = Note::new("doomed", clock.now());
        store.save_note(&mut keep).await.unwrap();
        store.save_note(&mut doomed).await.unwrap();
        store.save_manifest(&[keep.id.clone(), doomed.id.clone()]).await.unwrap();
        std::fs::write(store.fs().lock_path(&doomed.id), b"{}").unwrap();

        store.delete_note(&doomed.id).await.unwrap();

        assert!(store.load_note(&doomed.id).await.is_none());
        assert!(store.list_snapshots(&doomed.id).await.unwrap().is_empty());
        assert!(!store.fs().lock_path(&doomed.id).exists());
        assert_eq!(store.load_manifest().await, vec![keep.id.clone()]);
        assert_eq!(store.note_ids().await.unwrap(), vec![keep.id.clone()]);

        // Deleting twice is not an error
        store.delete_note(&doomed.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_restore_snapshot() {
        let temp_dir = TempDir::new().unwrap();
        let (store, clock) = setup(&temp_dir);

        let mut note = Note::new("first", clock.now());
        store.save_note(&mut note).await.unwrap();
        clock.advance(chrono::Duration::minutes(1));
        note.set_title("second", clock.now());
        store.save_note(&mut note).await.unwrap();

        let snapshots = store.list_snapshots(&note.id).await.unwrap();
        assert_eq!(snapshots.len(), 2);

        clock.advance(chrono::Duration::minutes(1));
        let restored = store.restore_snapshot(&snapshots[1]).await.unwrap();
        assert_eq!(restored.title, "first");
        assert_eq!(store.load_note(&note.id).await.unwrap().title, "first");
        assert_eq!(store.load_manifest().await, vec![note.id.clone()]);
    }
}
