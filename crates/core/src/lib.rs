pub mod backup;
pub mod clock;
pub mod config;
pub mod default_paths;
pub mod engine;
pub mod error;
pub mod events;
pub mod filesystem;
pub mod lock;
pub mod logging;
pub mod notes;
pub mod registry;
pub mod remote;
pub mod scheduler;
pub mod store;
pub mod sync;
pub mod watcher;

// Re-export main types for convenience
pub use backup::{BackupStore, Snapshot};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{DeviceIdentity, JsonSettingsFile, RemoteSettings, Retention, Settings, SettingsProvider, Timings};
pub use default_paths::{default_settings_path, default_storage_root};
pub use engine::Engine;
pub use error::{Error, Result};
pub use events::{EngineEvent, SyncStatus};
pub use filesystem::{FSNoteMetadata, FileStat, NoteFilesystem};
pub use lock::{AcquireOutcome, ForceOutcome, LockCoordinator, LockRecord, LockState};
pub use notes::{Item, ItemFlag, Note, WindowGeometry};
pub use registry::{OpenNoteRegistry, SharedNote};
pub use remote::{RemoteBackend, RestBackend, SqliteBackend};
pub use scheduler::SaveScheduler;
pub use store::{RecordStore, SaveOutcome};
pub use sync::{PullReport, RemoteSyncBridge};
pub use watcher::{ChangeWatcher, WatcherEvent};
