//! Tiered snapshots of every note write.
//!
//! Retention, evaluated newest-first after every snapshot:
//! - the newest `keep_recent` snapshots are always kept
//! - older snapshots younger than `max_age_hours` keep at most one per UTC hour
//! - anything older than `max_age_hours` is removed

use std::collections::HashSet;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Duration, NaiveDateTime, Timelike, Utc};
use regex::Regex;
use tokio::fs;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::Retention;
use crate::error::Result;
use crate::filesystem::{NoteFilesystem, write_atomic};

const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

/// A stored snapshot, identified by note id and timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub note_id: String,
    pub taken_at: DateTime<Utc>,
    pub path: PathBuf,
}

fn snapshot_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?P<id>[A-Za-z0-9_-]+)_(?P<date>\d{8}-\d{6})-(?P<millis>\d{3})\.json$")
            .expect("snapshot name pattern is valid")
    })
}

/// Formats the file name for a snapshot. Names sort chronologically.
pub fn snapshot_file_name(note_id: &str, taken_at: DateTime<Utc>) -> String {
    format!("{}_{}.json", note_id, taken_at.format("%Y%m%d-%H%M%S-%3f"))
}

/// Parses `<id>_<YYYYMMDD-HHMMSS-mmm>.json`.
pub fn parse_snapshot_file_name(name: &str) -> Option<(String, DateTime<Utc>)> {
    let caps = snapshot_name_regex().captures(name)?;
    let naive = NaiveDateTime::parse_from_str(&caps["date"], TIMESTAMP_FORMAT).ok()?;
    let millis: i64 = caps["millis"].parse().ok()?;
    let taken_at = naive.and_utc() + Duration::milliseconds(millis);
    Some((caps["id"].to_string(), taken_at))
}

pub struct BackupStore {
    fs: NoteFilesystem,
    clock: Arc<dyn Clock>,
    retention: Retention,
}

impl BackupStore {
    pub fn new(fs: NoteFilesystem, clock: Arc<dyn Clock>, retention: Retention) -> Self {
        Self {
            fs,
            clock,
            retention,
        }
    }

    /// Writes a snapshot of `content` for the note and applies retention.
    pub async fn snapshot(&self, note_id: &str, content: &[u8]) -> Result<Snapshot> {
        let dir = self.fs.backup_dir(note_id);
        fs::create_dir_all(&dir).await?;

        let now = self.clock.now();
        let mut taken_at = DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now);
        let mut path = dir.join(snapshot_file_name(note_id, taken_at));

        // Two writes inside the same millisecond get distinct names
        while fs::try_exists(&path).await? {
            taken_at += Duration::milliseconds(1);
            path = dir.join(snapshot_file_name(note_id, taken_at));
        }

        write_atomic(&path, content).await?;
        debug!(note_id, path = %path.display(), "wrote snapshot");

        if let Err(e) = self.prune(note_id).await {
            warn!(note_id, error = %e, "snapshot retention failed");
        }

        Ok(Snapshot {
            note_id: note_id.to_string(),
            taken_at,
            path,
        })
    }

    /// Lists snapshots for a note, newest first. Unparseable names are skipped.
    pub async fn list_snapshots(&self, note_id: &str) -> Result<Vec<Snapshot>> {
        let dir = self.fs.backup_dir(note_id);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut snapshots = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            match parse_snapshot_file_name(name) {
                Some((id, taken_at)) if id == note_id => snapshots.push(Snapshot {
                    note_id: id,
                    taken_at,
                    path: entry.path(),
                }),
                _ => {
                    if !name.ends_with(".tmp") {
                        debug!(note_id, name, "skipping unrecognised backup entry");
                    }
                }
            }
        }

        snapshots.sort_by(|a, b| b.taken_at.cmp(&a.taken_at));
        Ok(snapshots)
    }

    pub async fn read_snapshot(&self, snapshot: &Snapshot) -> Result<Vec<u8>> {
        Ok(fs::read(&snapshot.path).await?)
    }

    /// Applies the retention tiers. Returns the number of snapshots removed.
    pub async fn prune(&self, note_id: &str) -> Result<usize> {
        let now = self.clock.now();
        let max_age = Duration::hours(self.retention.max_age_hours);
        let snapshots = self.list_snapshots(note_id).await?;

        let mut buckets = HashSet::new();
        let mut removed = 0;

        for (index, snapshot) in snapshots.iter().enumerate() {
            if index < self.retention.keep_recent {
                continue;
            }

            let expired = now - snapshot.taken_at > max_age;
            let bucket = (snapshot.taken_at.date_naive(), snapshot.taken_at.hour());
            if expired || !buckets.insert(bucket) {
                match fs::remove_file(&snapshot.path).await {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => warn!(note_id, path = %snapshot.path.display(), error = %e, "failed to remove snapshot"),
                }
            }
        }

        if removed > 0 {
            debug!(note_id, removed, "pruned snapshots");
        }
        Ok(removed)
    }

    /// Removes every snapshot of a note.
    pub async fn delete_all_for_note(&self, note_id: &str) -> Result<()> {
        match fs::remove_dir_all(self.fs.backup_dir(note_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn setup(temp_dir: &TempDir, start: DateTime<Utc>) -> (BackupStore, Arc<ManualClock>) {
        let fs = NoteFilesystem::new(temp_dir.path()).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let store = BackupStore::new(fs, clock.clone(), Retention::default());
        (store, clock)
    }

    #[test]
    fn test_file_name_round_trip() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap() + Duration::milliseconds(42);
        let name = snapshot_file_name("note_1", ts);
        assert_eq!(name, "note_1_20240309-070501-042.json");

        let (id, parsed) = parse_snapshot_file_name(&name).unwrap();
        assert_eq!(id, "note_1");
        assert_eq!(parsed, ts);

        assert!(parse_snapshot_file_name("garbage.json").is_none());
        assert!(parse_snapshot_file_name("a_20241399-000000-000.json").is_none());
    }

    #[test]
    fn test_file_names_sort_chronologically() {
        let early = Utc.with_ymd_and_hms(2024, 1, 31, 23, 59, 59).unwrap();
        let late = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        assert!(snapshot_file_name("n", early) < snapshot_file_name("n", late));
    }

    #[tokio::test]
    async fn test_snapshot_and_list() {
        let temp_dir = TempDir::new().unwrap();
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let (store, clock) = setup(&temp_dir, start);

        store.snapshot("n1", b"one").await.unwrap();
        clock.advance(Duration::minutes(1));
        store.snapshot("n1", b"two").await.unwrap();

        let snapshots = store.list_snapshots("n1").await.unwrap();
        assert_eq!(snapshots.len(), 2);
        assert!(snapshots[0].taken_at > snapshots[1].taken_at);
        assert_eq!(store.read_snapshot(&snapshots[0]).await.unwrap(), b"two");
    }

    #[tokio::test]
    async fn test_same_millisecond_snapshots_get_distinct_names() {
        let temp_dir = TempDir::new().unwrap();
        let (store, _clock) = setup(&temp_dir, Utc::now());

        let a = store.snapshot("n1", b"a").await.unwrap();
        let b = store.snapshot("n1", b"b").await.unwrap();
        assert_ne!(a.path, b.path);
    }

    #[tokio::test]
    async fn test_keeps_recent_and_one_per_hour() {
        let temp_dir = TempDir::new().unwrap();
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let (store, clock) = setup(&temp_dir, start);

        // Six snapshots ten minutes apart, all within the 10:00 hour
        for i in 0..6 {
            store.snapshot("n1", format!("v{}", i).as_bytes()).await.unwrap();
            clock.advance(Duration::minutes(10));
        }

        // Three recent ones plus a single survivor for the hour bucket
        let snapshots = store.list_snapshots("n1").await.unwrap();
        assert_eq!(snapshots.len(), 4);
        assert_eq!(store.read_snapshot(&snapshots[3]).await.unwrap(), b"v2");
    }

    #[tokio::test]
    async fn test_expired_snapshots_removed_beyond_recent() {
        let temp_dir = TempDir::new().unwrap();
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let (store, clock) = setup(&temp_dir, start);

        for _ in 0..5 {
            store.snapshot("n1", b"x").await.unwrap();
            clock.advance(Duration::hours(2));
        }
        clock.advance(Duration::hours(100));
        store.prune("n1").await.unwrap();

        // Everything is expired, so only the newest three survive
        assert_eq!(store.list_snapshots("n1").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_retention_bound_over_long_history() {
        let temp_dir = TempDir::new().unwrap();
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let (store, clock) = setup(&temp_dir, start);

        // Hourly-plus writes across 72 hours
        for i in 0..70 {
            store.snapshot("n1", format!("{}", i).as_bytes()).await.unwrap();
            clock.advance(Duration::minutes(61));
        }

        let count = store.list_snapshots("n1").await.unwrap().len();
        assert!(count <= 3 + 48, "kept {} snapshots", count);
        assert!(count >= 3);
    }

    #[tokio::test]
    async fn test_malformed_entries_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let (store, _clock) = setup(&temp_dir, Utc::now());

        store.snapshot("n1", b"x").await.unwrap();
        let dir = temp_dir.path().join("backups").join("n1");
        std::fs::write(dir.join("not-a-snapshot.json"), b"?").unwrap();

        assert_eq!(store.list_snapshots("n1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_all_for_note() {
        let temp_dir = TempDir::new().unwrap();
        let (store, _clock) = setup(&temp_dir, Utc::now());

        store.snapshot("n1", b"x").await.unwrap();
        store.delete_all_for_note("n1").await.unwrap();
        assert!(store.list_snapshots("n1").await.unwrap().is_empty());

        // Deleting again is fine
        store.delete_all_for_note("n1").await.unwrap();
    }
}
