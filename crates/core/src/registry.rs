use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::notes::Note;

/// A note shared between the UI layer and the save scheduler.
pub type SharedNote = Arc<tokio::sync::Mutex<Note>>;

struct OpenEntry {
    note: SharedNote,
    opens: usize,
}

/// Notes currently open in a window, keyed by id.
///
/// A note opened twice shares one in-memory copy and stays registered until
/// it has been closed as many times.
#[derive(Default)]
pub struct OpenNoteRegistry {
    entries: Mutex<HashMap<String, OpenEntry>>,
}

impl OpenNoteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `note` and returns the shared handle. If the note is already
    /// open the existing handle is returned and `note` is discarded.
    pub fn register(&self, note: Note) -> SharedNote {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.entry(note.id.clone()).or_insert_with(|| OpenEntry {
            note: Arc::new(tokio::sync::Mutex::new(note)),
            opens: 0,
        });
        entry.opens += 1;
        Arc::clone(&entry.note)
    }

    /// Registers another open of an already open note.
    pub fn reopen(&self, note_id: &str) -> Option<SharedNote> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.get_mut(note_id)?;
        entry.opens += 1;
        Some(Arc::clone(&entry.note))
    }

    /// Drops one registration. Returns true once the note is no longer open.
    pub fn unregister(&self, note_id: &str) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = entries.get_mut(note_id) else {
            return true;
        };
        entry.opens = entry.opens.saturating_sub(1);
        if entry.opens == 0 {
            entries.remove(note_id);
            return true;
        }
        false
    }

    /// Removes the note regardless of how many times it was opened.
    pub fn remove(&self, note_id: &str) -> Option<SharedNote> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.remove(note_id).map(|entry| entry.note)
    }

    pub fn get(&self, note_id: &str) -> Option<SharedNote> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.get(note_id).map(|entry| Arc::clone(&entry.note))
    }

    pub fn is_open(&self, note_id: &str) -> bool {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.contains_key(note_id)
    }

    pub fn ids(&self) -> Vec<String> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<String> = entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Swaps in a freshly loaded copy of an open note. Returns false if the
    /// note is not open.
    pub async fn replace(&self, note: Note) -> bool {
        let Some(shared) = self.get(&note.id) else {
            return false;
        };
        *shared.lock().await = note;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn test_register_shares_one_copy() {
        let registry = OpenNoteRegistry::new();
        let note = Note::new("shared", Utc::now());
        let id = note.id.clone();

        let first = registry.register(note.clone());
        let second = registry.register(Note::new("ignored", Utc::now()));
        // Different id, so it is a separate entry
        assert_eq!(registry.ids().len(), 2);

        let again = registry.register(note);
        assert!(Arc::ptr_eq(&first, &again));
        assert!(!Arc::ptr_eq(&first, &second));

        first.lock().await.title = "edited".to_string();
        assert_eq!(registry.get(&id).unwrap().lock().await.title, "edited");
    }

    #[test]
    fn test_unregister_counts_opens() {
        let registry = OpenNoteRegistry::new();
        let note = Note::new("n", Utc::now());
        let id = note.id.clone();

        registry.register(note.clone());
        registry.register(note);

        assert!(!registry.unregister(&id));
        assert!(registry.is_open(&id));
        assert!(registry.unregister(&id));
        assert!(!registry.is_open(&id));
        assert!(registry.unregister(&id));
    }

    #[tokio::test]
    async fn test_replace_only_touches_open_notes() {
        let registry = OpenNoteRegistry::new();
        let note = Note::new("before", Utc::now());
        let handle = registry.register(note.clone());

        let mut fresh = note.clone();
        fresh.title = "after".to_string();
        assert!(registry.replace(fresh).await);
        assert_eq!(handle.lock().await.title, "after");

        assert!(!registry.replace(Note::new("closed", Utc::now())).await);
    }
}
