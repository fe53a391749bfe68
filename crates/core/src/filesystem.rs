use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Write marker and size of a stored record, as reported by the medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub marker: DateTime<Utc>,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct FSNoteMetadata {
    pub id: String,
    pub stat: FileStat,
}

/// Returns true if `id` can be used as a file name on every platform we store on.
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && id != ".."
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// On-disk layout of the storage root.
///
/// ```text
/// notes/<id>.json
/// manifest.json
/// locks/<id>.json
/// backups/<id>/<id>_<timestamp>.json
/// ```
#[derive(Debug, Clone)]
pub struct NoteFilesystem {
    root_path: PathBuf,
}

impl NoteFilesystem {
    pub fn new<P: AsRef<Path>>(root_path: P) -> io::Result<Self> {
        let root_path = root_path.as_ref().to_path_buf();
        std::fs::create_dir_all(root_path.join("notes"))?;
        std::fs::create_dir_all(root_path.join("locks"))?;
        std::fs::create_dir_all(root_path.join("backups"))?;
        Ok(Self { root_path })
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    pub fn notes_dir(&self) -> PathBuf {
        self.root_path.join("notes")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.root_path.join("locks")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.root_path.join("backups")
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root_path.join("manifest.json")
    }

    pub fn note_path(&self, id: &str) -> PathBuf {
        self.notes_dir().join(format!("{}.json", id))
    }

    pub fn lock_path(&self, id: &str) -> PathBuf {
        self.locks_dir().join(format!("{}.json", id))
    }

    pub fn backup_dir(&self, id: &str) -> PathBuf {
        self.backups_dir().join(id)
    }

    pub async fn read_note(&self, id: &str) -> io::Result<Vec<u8>> {
        fs::read(self.note_path(id)).await
    }

    pub async fn write_note(&self, id: &str, content: &[u8]) -> io::Result<()> {
        write_atomic(&self.note_path(id), content).await
    }

    /// Returns the note's write marker and size, or `None` if it does not exist.
    pub async fn stat_note(&self, id: &str) -> io::Result<Option<FileStat>> {
        stat(&self.note_path(id)).await
    }

    /// Removes a note record. Returns false if it was already gone.
    pub async fn delete_note(&self, id: &str) -> io::Result<bool> {
        remove_if_exists(&self.note_path(id)).await
    }

    pub async fn trash_note(&self, id: &str) -> io::Result<()> {
        let path = self.note_path(id);
        if !fs::try_exists(&path).await? {
            return Err(io::Error::new(io::ErrorKind::NotFound, "Note does not exist"));
        }
        tokio::task::spawn_blocking(move || trash::delete(&path))
            .await
            .map_err(io::Error::other)?
            .map_err(|e| io::Error::other(format!("Failed to move note to trash: {}", e)))
    }

    /// Lists every note record on the medium with its marker and size.
    ///
    /// Temp files and anything that is not `<id>.json` are ignored.
    pub async fn scan_all(&self) -> io::Result<Vec<FSNoteMetadata>> {
        let mut notes = Vec::new();
        let mut entries = fs::read_dir(self.notes_dir()).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(id) = note_id_from_path(&path) else {
                continue;
            };

            // The file may vanish between listing and stat
            let metadata = match entry.metadata().await {
                Ok(m) if m.is_file() => m,
                _ => continue,
            };

            notes.push(FSNoteMetadata {
                id,
                stat: FileStat {
                    marker: DateTime::<Utc>::from(metadata.modified()?),
                    size: metadata.len(),
                },
            });
        }

        notes.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(notes)
    }
}

/// Extracts the note id from `notes/<id>.json`.
pub fn note_id_from_path(path: &Path) -> Option<String> {
    if path.extension().and_then(|e| e.to_str()) != Some("json") {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    is_valid_id(stem).then(|| stem.to_string())
}

pub(crate) async fn stat(path: &Path) -> io::Result<Option<FileStat>> {
    match fs::metadata(path).await {
        Ok(metadata) => Ok(Some(FileStat {
            marker: DateTime::<Utc>::from(metadata.modified()?),
            size: metadata.len(),
        })),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

pub(crate) async fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Writes `content` to a temp file beside `path` and renames it into place,
/// so readers never observe a partially written record.
pub(crate) async fn write_atomic(path: &Path, content: &[u8]) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
    fs::create_dir_all(parent).await?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("record");
    let temp_path = parent.join(format!(".{}.{}.tmp", file_name, Uuid::new_v4().simple()));

    let mut file = fs::File::create(&temp_path).await?;
    file.write_all(content).await?;
    file.sync_all().await?;
    drop(file);

    if let Err(e) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_and_read_note() {
        let temp_dir = TempDir::new().unwrap();
        let fs = NoteFilesystem::new(temp_dir.path()).unwrap();

        fs.write_note("abc", b"Hello, World!").await.unwrap();
        let content = fs.read_note("abc").await.unwrap();
        assert_eq!(content, b"Hello, World!");
    }

    #[tokio::test]
    async fn test_layout_created() {
        let temp_dir = TempDir::new().unwrap();
        let _fs = NoteFilesystem::new(temp_dir.path()).unwrap();

        assert!(temp_dir.path().join("notes").is_dir());
        assert!(temp_dir.path().join("locks").is_dir());
        assert!(temp_dir.path().join("backups").is_dir());
    }

    #[tokio::test]
    async fn test_delete_note() {
        let temp_dir = TempDir::new().unwrap();
        let fs = NoteFilesystem::new(temp_dir.path()).unwrap();

        fs.write_note("abc", b"x").await.unwrap();
        assert!(fs.delete_note("abc").await.unwrap());
        assert!(fs.read_note("abc").await.is_err());
        assert!(!fs.delete_note("abc").await.unwrap());
    }

    #[tokio::test]
    async fn test_scan_all_ignores_temp_and_foreign_files() {
        let temp_dir = TempDir::new().unwrap();
        let fs = NoteFilesystem::new(temp_dir.path()).unwrap();

        fs.write_note("one", b"1").await.unwrap();
        fs.write_note("two", b"22").await.unwrap();
        std::fs::write(fs.notes_dir().join(".one.json.1234.tmp"), b"partial").unwrap();
        std::fs::write(fs.notes_dir().join("readme.txt"), b"hi").unwrap();

        let notes = fs.scan_all().await.unwrap();
        let ids: Vec<_> = notes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["one", "two"]);
        assert_eq!(notes[1].stat.size, 2);
    }

    #[tokio::test]
    async fn test_stat_missing_note() {
        let temp_dir = TempDir::new().unwrap();
        let fs = NoteFilesystem::new(temp_dir.path()).unwrap();

        assert!(fs.stat_note("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_atomic_write_leaves_no_temp_files() {
        let temp_dir = TempDir::new().unwrap();
        let fs = NoteFilesystem::new(temp_dir.path()).unwrap();

        fs.write_note("abc", b"first").await.unwrap();
        fs.write_note("abc", b"second").await.unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(fs.notes_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
        assert_eq!(fs.read_note("abc").await.unwrap(), b"second");
    }

    #[test]
    fn test_valid_ids() {
        assert!(is_valid_id("3f2b6c1e-8a7d-4f1e-9a53-1c2d3e4f5a6b"));
        assert!(is_valid_id("note_1"));
        assert!(!is_valid_id(""));
        assert!(!is_valid_id(".."));
        assert!(!is_valid_id("a/b"));
        assert!(!is_valid_id(".hidden"));
    }
}
