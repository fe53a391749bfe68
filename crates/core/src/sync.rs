//! Mirrors local notes to an optional remote backend.
//!
//! Pushes are best effort and never block local writes. Pulls replace local
//! contents wholesale, except when the remote has no notes at all, which is
//! treated as "nothing there yet" rather than "everything was deleted".

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{RwLock, broadcast};
use tracing::{info, warn};

use crate::error::Result;
use crate::events::{EngineEvent, SyncStatus};
use crate::filesystem::is_valid_id;
use crate::notes::Note;
use crate::remote::{ItemRow, RemoteBackend, note_from_rows, order_rows, rows_from_note};
use crate::store::{RecordStore, SaveOutcome};

/// Note ids touched by a pull.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullReport {
    pub created: Vec<String>,
    pub changed: Vec<String>,
    pub deleted: Vec<String>,
    /// The remote was empty and nothing was applied.
    pub skipped_empty: bool,
}

impl PullReport {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.changed.is_empty() && self.deleted.is_empty()
    }
}

pub struct RemoteSyncBridge {
    backend: Arc<dyn RemoteBackend>,
    store: Arc<RecordStore>,
    events: broadcast::Sender<EngineEvent>,
    /// Pushes share it, a pull takes it exclusively so it never reads the
    /// remote halfway through one of our own pushes.
    gate: RwLock<()>,
}

impl RemoteSyncBridge {
    pub fn new(
        backend: Arc<dyn RemoteBackend>,
        store: Arc<RecordStore>,
        events: broadcast::Sender<EngineEvent>,
    ) -> Self {
        Self {
            backend,
            store,
            events,
            gate: RwLock::new(()),
        }
    }

    fn report(&self, status: SyncStatus) {
        let _ = self.events.send(EngineEvent::SyncStatus(status));
    }

    fn push_failed(&self, note_id: Option<&str>, error: &crate::error::Error) {
        warn!(note_id, error = %error, "remote push failed");
        self.report(SyncStatus::PushFailed {
            note_id: note_id.map(str::to_string),
            message: error.to_string(),
        });
    }

    /// Upserts the note and its items and drops remote items it no longer has.
    /// Returns false if the push failed; the failure is already reported.
    pub async fn push_note(&self, note: &Note) -> bool {
        let _gate = self.gate.read().await;
        let (row, items) = rows_from_note(note);
        let keep: Vec<String> = items.iter().map(|item| item.id.clone()).collect();

        let result = async {
            self.backend.upsert_notes(&[row]).await?;
            self.backend.upsert_items(&items).await?;
            self.backend.delete_items_except(&note.id, &keep).await
        }
        .await;

        match result {
            Ok(()) => true,
            Err(e) => {
                self.push_failed(Some(&note.id), &e);
                false
            }
        }
    }

    pub async fn push_order(&self, ids: &[String]) -> bool {
        let _gate = self.gate.read().await;
        match self.backend.upsert_order(&order_rows(ids)).await {
            Ok(()) => true,
            Err(e) => {
                self.push_failed(None, &e);
                false
            }
        }
    }

    pub async fn push_delete(&self, note_id: &str) -> bool {
        let _gate = self.gate.read().await;
        match self.backend.delete_note(note_id).await {
            Ok(()) => true,
            Err(e) => {
                self.push_failed(Some(note_id), &e);
                false
            }
        }
    }

    /// Replaces local contents with the remote's.
    pub async fn pull(&self) -> Result<PullReport> {
        let _gate = self.gate.write().await;
        match self.apply_remote().await {
            Ok(report) => {
                if report.skipped_empty {
                    self.report(SyncStatus::PullSkippedEmpty);
                }
                Ok(report)
            }
            Err(e) => {
                warn!(error = %e, "remote pull failed");
                self.report(SyncStatus::PullFailed {
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn apply_remote(&self) -> Result<PullReport> {
        let mut report = PullReport::default();

        let note_rows = self.backend.fetch_notes().await?;
        if note_rows.is_empty() {
            info!("remote has no notes, leaving local data untouched");
            report.skipped_empty = true;
            return Ok(report);
        }
        let item_rows = self.backend.fetch_items().await?;
        let mut order = self.backend.fetch_order().await?;

        let mut items_by_note: HashMap<String, Vec<ItemRow>> = HashMap::new();
        for item in item_rows {
            items_by_note.entry(item.note_id.clone()).or_default().push(item);
        }

        let local_ids: HashSet<String> = self.store.note_ids().await?.into_iter().collect();
        let mut remote_ids = Vec::with_capacity(note_rows.len());

        for row in note_rows {
            if !is_valid_id(&row.id) {
                warn!(note_id = %row.id, "skipping remote note with unusable id");
                continue;
            }
            let id = row.id.clone();
            let items = items_by_note.remove(&id).unwrap_or_default();
            let mut note = note_from_rows(row, items);

            match self.store.save_note(&mut note).await {
                Ok(SaveOutcome::Written) if local_ids.contains(&id) => report.changed.push(id.clone()),
                Ok(SaveOutcome::Written) => report.created.push(id.clone()),
                Ok(SaveOutcome::Unchanged) => {}
                Err(e) => warn!(note_id = %id, error = %e, "failed to apply remote note"),
            }
            remote_ids.push(id);
        }

        let remote_set: HashSet<&str> = remote_ids.iter().map(String::as_str).collect();
        let mut stale: Vec<&String> = local_ids
            .iter()
            .filter(|id| !remote_set.contains(id.as_str()))
            .collect();
        stale.sort();
        for id in stale {
            match self.store.delete_note(id).await {
                Ok(()) => report.deleted.push(id.clone()),
                Err(e) => warn!(note_id = %id, error = %e, "failed to delete note missing from remote"),
            }
        }

        order.sort_by_key(|row| row.position);
        let mut seen = HashSet::new();
        let mut manifest: Vec<String> = order
            .into_iter()
            .map(|row| row.note_id)
            .filter(|id| remote_set.contains(id.as_str()) && seen.insert(id.clone()))
            .collect();
        let mut unordered: Vec<&String> = remote_ids.iter().filter(|id| !seen.contains(*id)).collect();
        unordered.sort();
        manifest.extend(unordered.into_iter().cloned());
        self.store.save_manifest(&manifest).await?;

        info!(
            created = report.created.len(),
            changed = report.changed.len(),
            deleted = report.deleted.len(),
            "pulled remote notes"
        );
        self.report(SyncStatus::PullCompleted {
            notes: remote_ids.len(),
        });
        Ok(report)
    }
}
