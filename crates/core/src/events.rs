use crate::config::DeviceIdentity;

/// Outcome of remote sync activity, reported to the UI as a status line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncStatus {
    PushFailed { note_id: Option<String>, message: String },
    PullFailed { message: String },
    /// The remote returned no notes; local data was left untouched.
    PullSkippedEmpty,
    PullCompleted { notes: usize },
}

/// Notifications raised by the engine's background tasks.
///
/// Delivery is asynchronous and per-note ordering is not guaranteed, so
/// consumers should treat a reload as idempotent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    NoteCreated { note_id: String },
    NoteChanged { note_id: String },
    NoteDeleted { note_id: String },
    /// Another device asked the local owner to yield the note.
    TakeoverRequested {
        note_id: String,
        requester: DeviceIdentity,
    },
    /// This device is no longer the recorded lock owner.
    LockLost {
        note_id: String,
        owner: Option<DeviceIdentity>,
    },
    /// A debounced save hit a conflict; the note was reloaded from storage.
    SaveConflict { note_id: String },
    SyncStatus(SyncStatus),
}

impl EngineEvent {
    pub fn note_id(&self) -> Option<&str> {
        match self {
            EngineEvent::NoteCreated { note_id }
            | EngineEvent::NoteChanged { note_id }
            | EngineEvent::NoteDeleted { note_id }
            | EngineEvent::TakeoverRequested { note_id, .. }
            | EngineEvent::LockLost { note_id, .. }
            | EngineEvent::SaveConflict { note_id } => Some(note_id),
            EngineEvent::SyncStatus(SyncStatus::PushFailed { note_id, .. }) => note_id.as_deref(),
            EngineEvent::SyncStatus(_) => None,
        }
    }
}
