//! Optional remote store mirroring notes as three tables: notes, items and
//! manifest order.

mod rest;
mod sqlite;

pub use rest::RestBackend;
pub use sqlite::SqliteBackend;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::RemoteSettings;
use crate::error::Result;
use crate::notes::{Item, Note, WindowGeometry};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteRow {
    pub id: String,
    pub title: String,
    pub color: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    /// Window geometry as JSON text.
    pub geometry: Option<String>,
    pub pinned: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemRow {
    pub id: String,
    pub note_id: String,
    pub text: String,
    pub completed: bool,
    pub heading: bool,
    pub important: bool,
    pub attachment: Option<String>,
    pub due: Option<DateTime<Utc>>,
    pub alarm_dismissed: bool,
    pub snooze_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub position: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRow {
    pub note_id: String,
    pub position: u32,
}

impl NoteRow {
    pub fn from_note(note: &Note) -> Self {
        let geometry = note
            .geometry
            .as_ref()
            .and_then(|g| serde_json::to_string(g).ok());
        Self {
            id: note.id.clone(),
            title: note.title.clone(),
            color: note.color.clone(),
            created_at: note.created_at,
            modified_at: note.modified_at,
            geometry,
            pinned: note.pinned,
        }
    }
}

impl ItemRow {
    pub fn from_item(note_id: &str, item: &Item) -> Self {
        Self {
            id: item.id.clone(),
            note_id: note_id.to_string(),
            text: item.text.clone(),
            completed: item.completed,
            heading: item.heading,
            important: item.important,
            attachment: item.attachment.clone(),
            due: item.due,
            alarm_dismissed: item.alarm_dismissed,
            snooze_until: item.snooze_until,
            created_at: item.created_at,
            updated_at: item.updated_at,
            deleted_at: item.deleted_at,
            position: item.position,
        }
    }

    pub fn into_item(self) -> Item {
        Item {
            id: self.id,
            text: self.text,
            completed: self.completed,
            heading: self.heading,
            important: self.important,
            attachment: self.attachment,
            due: self.due,
            alarm_dismissed: self.alarm_dismissed,
            snooze_until: self.snooze_until,
            created_at: self.created_at,
            updated_at: self.updated_at,
            deleted_at: self.deleted_at,
            position: self.position,
        }
    }
}

/// Splits a note into its remote rows.
pub fn rows_from_note(note: &Note) -> (NoteRow, Vec<ItemRow>) {
    let items = note
        .items
        .iter()
        .map(|item| ItemRow::from_item(&note.id, item))
        .collect();
    (NoteRow::from_note(note), items)
}

/// Rebuilds a note from its remote rows. Items are ordered by position and
/// renumbered.
pub fn note_from_rows(row: NoteRow, mut items: Vec<ItemRow>) -> Note {
    let geometry = row.geometry.as_deref().and_then(|raw| {
        serde_json::from_str::<WindowGeometry>(raw)
            .inspect_err(|e| warn!(note_id = %row.id, error = %e, "ignoring malformed remote geometry"))
            .ok()
    });

    items.sort_by_key(|item| item.position);
    let mut note = Note {
        id: row.id,
        title: row.title,
        color: row.color,
        items: items.into_iter().map(ItemRow::into_item).collect(),
        created_at: row.created_at,
        modified_at: row.modified_at,
        geometry,
        pinned: row.pinned,
        last_write_marker: None,
    };
    note.renumber_items();
    note
}

/// Manifest order as rows.
pub fn order_rows(ids: &[String]) -> Vec<OrderRow> {
    ids.iter()
        .enumerate()
        .map(|(position, id)| OrderRow {
            note_id: id.clone(),
            position: position as u32,
        })
        .collect()
}

/// Table-level access to a remote store.
///
/// Upserts insert or update by primary key. Calls are independent; no
/// transaction spans more than one of them.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    async fn upsert_notes(&self, rows: &[NoteRow]) -> Result<()>;
    async fn upsert_items(&self, rows: &[ItemRow]) -> Result<()>;
    async fn upsert_order(&self, rows: &[OrderRow]) -> Result<()>;

    /// Deletes the note's item rows whose id is not in `keep`.
    async fn delete_items_except(&self, note_id: &str, keep: &[String]) -> Result<()>;

    /// Deletes the note row, its item rows and its order row.
    async fn delete_note(&self, note_id: &str) -> Result<()>;

    async fn fetch_notes(&self) -> Result<Vec<NoteRow>>;
    async fn fetch_items(&self) -> Result<Vec<ItemRow>>;
    async fn fetch_order(&self) -> Result<Vec<OrderRow>>;
}

/// Opens the backend described by `settings`.
pub fn open_backend(settings: &RemoteSettings) -> Result<Arc<dyn RemoteBackend>> {
    match settings {
        RemoteSettings::Rest {
            base_url,
            api_key,
            table_prefix,
        } => Ok(Arc::new(RestBackend::new(base_url, api_key, table_prefix)?)),
        RemoteSettings::Sqlite { path } => Ok(Arc::new(SqliteBackend::open(path)?)),
    }
}
