//! Remote tables kept in a SQLite database file, typically on a share that
//! several devices can reach.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, params, params_from_iter};
use tracing::debug;

use super::{ItemRow, NoteRow, OrderRow, RemoteBackend};
use crate::error::{Error, Result};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS notes (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    color TEXT NOT NULL,
    created_at TEXT NOT NULL,
    modified_at TEXT NOT NULL,
    geometry TEXT,
    pinned INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS items (
    id TEXT PRIMARY KEY,
    note_id TEXT NOT NULL,
    text TEXT NOT NULL,
    completed INTEGER NOT NULL DEFAULT 0,
    heading INTEGER NOT NULL DEFAULT 0,
    important INTEGER NOT NULL DEFAULT 0,
    attachment TEXT,
    due TEXT,
    alarm_dismissed INTEGER NOT NULL DEFAULT 0,
    snooze_until TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    deleted_at TEXT,
    position INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_items_note_id ON items(note_id);

CREATE TABLE IF NOT EXISTS note_order (
    note_id TEXT PRIMARY KEY,
    position INTEGER NOT NULL
);
";

pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBackend {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` against the connection on the blocking pool.
    async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut conn)
        })
        .await
        .map_err(|e| Error::Remote(format!("database task failed: {}", e)))?
    }
}

fn to_text(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn parse_ts(column: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e)))
}

fn parse_opt_ts(column: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|raw| parse_ts(column, raw)).transpose()
}

#[async_trait]
impl RemoteBackend for SqliteBackend {
    async fn upsert_notes(&self, rows: &[NoteRow]) -> Result<()> {
        let rows = rows.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO notes (id, title, color, created_at, modified_at, geometry, pinned)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT(id) DO UPDATE SET
                        title = excluded.title,
                        color = excluded.color,
                        created_at = excluded.created_at,
                        modified_at = excluded.modified_at,
                        geometry = excluded.geometry,
                        pinned = excluded.pinned",
                )?;
                for row in &rows {
                    stmt.execute(params![
                        row.id,
                        row.title,
                        row.color,
                        to_text(&row.created_at),
                        to_text(&row.modified_at),
                        row.geometry,
                        row.pinned,
                    ])?;
                }
            }
            tx.commit()?;
            debug!(rows = rows.len(), "upserted note rows");
            Ok(())
        })
        .await
    }

    async fn upsert_items(&self, rows: &[ItemRow]) -> Result<()> {
        let rows = rows.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO items (id, note_id, text, completed, heading, important, attachment,
                                        due, alarm_dismissed, snooze_until, created_at, updated_at,
                                        deleted_at, position)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                     ON CONFLICT(id) DO UPDATE SET
                        note_id = excluded.note_id,
                        text = excluded.text,
                        completed = excluded.completed,
                        heading = excluded.heading,
                        important = excluded.important,
                        attachment = excluded.attachment,
                        due = excluded.due,
                        alarm_dismissed = excluded.alarm_dismissed,
                        snooze_until = excluded.snooze_until,
                        created_at = excluded.created_at,
                        updated_at = excluded.updated_at,
                        deleted_at = excluded.deleted_at,
                        position = excluded.position",
                )?;
                for row in &rows {
                    stmt.execute(params![
                        row.id,
                        row.note_id,
                        row.text,
                        row.completed,
                        row.heading,
                        row.important,
                        row.attachment,
                        row.due.as_ref().map(to_text),
                        row.alarm_dismissed,
                        row.snooze_until.as_ref().map(to_text),
                        to_text(&row.created_at),
                        to_text(&row.updated_at),
                        row.deleted_at.as_ref().map(to_text),
                        row.position,
                    ])?;
                }
            }
            tx.commit()?;
            debug!(rows = rows.len(), "upserted item rows");
            Ok(())
        })
        .await
    }

    async fn upsert_order(&self, rows: &[OrderRow]) -> Result<()> {
        let rows = rows.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO note_order (note_id, position) VALUES (?1, ?2)
                     ON CONFLICT(note_id) DO UPDATE SET position = excluded.position",
                )?;
                for row in &rows {
                    stmt.execute(params![row.note_id, row.position])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn delete_items_except(&self, note_id: &str, keep: &[String]) -> Result<()> {
        let note_id = note_id.to_string();
        let keep = keep.to_vec();
        self.with_conn(move |conn| {
            let removed = if keep.is_empty() {
                conn.execute("DELETE FROM items WHERE note_id = ?1", params![note_id])?
            } else {
                let placeholders = vec!["?"; keep.len()].join(", ");
                let sql = format!(
                    "DELETE FROM items WHERE note_id = ? AND id NOT IN ({})",
                    placeholders
                );
                conn.execute(&sql, params_from_iter(std::iter::once(&note_id).chain(keep.iter())))?
            };
            if removed > 0 {
                debug!(note_id = %note_id, removed, "deleted stale item rows");
            }
            Ok(())
        })
        .await
    }

    async fn delete_note(&self, note_id: &str) -> Result<()> {
        let note_id = note_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM items WHERE note_id = ?1", params![note_id])?;
            tx.execute("DELETE FROM note_order WHERE note_id = ?1", params![note_id])?;
            tx.execute("DELETE FROM notes WHERE id = ?1", params![note_id])?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn fetch_notes(&self) -> Result<Vec<NoteRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, title, color, created_at, modified_at, geometry, pinned FROM notes",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(NoteRow {
                        id: row.get(0)?,
                        title: row.get(1)?,
                        color: row.get(2)?,
                        created_at: parse_ts(3, row.get(3)?)?,
                        modified_at: parse_ts(4, row.get(4)?)?,
                        geometry: row.get(5)?,
                        pinned: row.get(6)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    async fn fetch_items(&self) -> Result<Vec<ItemRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, note_id, text, completed, heading, important, attachment, due,
                        alarm_dismissed, snooze_until, created_at, updated_at, deleted_at, position
                 FROM items",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(ItemRow {
                        id: row.get(0)?,
                        note_id: row.get(1)?,
                        text: row.get(2)?,
                        completed: row.get(3)?,
                        heading: row.get(4)?,
                        important: row.get(5)?,
                        attachment: row.get(6)?,
                        due: parse_opt_ts(7, row.get(7)?)?,
                        alarm_dismissed: row.get(8)?,
                        snooze_until: parse_opt_ts(9, row.get(9)?)?,
                        created_at: parse_ts(10, row.get(10)?)?,
                        updated_at: parse_ts(11, row.get(11)?)?,
                        deleted_at: parse_opt_ts(12, row.get(12)?)?,
                        position: row.get(13)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    async fn fetch_order(&self) -> Result<Vec<OrderRow>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT note_id, position FROM note_order ORDER BY position")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(OrderRow {
                        note_id: row.get(0)?,
                        position: row.get(1)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }
}
