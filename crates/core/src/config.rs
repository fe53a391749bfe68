//! Engine configuration and the settings provider seam.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Identity of this device as recorded in lock records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub id: String,
    pub name: String,
}

impl DeviceIdentity {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }

    /// Generates a fresh identity named after the host.
    pub fn generate() -> Self {
        let name = std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("COMPUTERNAME"))
            .unwrap_or_else(|_| "device".to_string());
        Self::new(Uuid::new_v4().to_string(), name)
    }
}

impl Default for DeviceIdentity {
    fn default() -> Self {
        Self::generate()
    }
}

/// Timer and tolerance knobs. These are empirical values, not proven bounds
/// against clock skew between devices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timings {
    /// Allowed difference between the stored and observed write marker.
    pub conflict_tolerance_ms: u64,
    /// Heartbeat age after which a lock is considered abandoned.
    pub lock_stale_secs: u64,
    pub heartbeat_interval_ms: u64,
    /// Fallback poll interval of the change watcher.
    pub poll_interval_ms: u64,
    /// Quiet period before a burst of local edits is persisted.
    pub debounce_ms: u64,
    pub pull_interval_secs: u64,
    /// Minimum age of a takeover request before it may be forced.
    pub takeover_min_age_secs: u64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            conflict_tolerance_ms: 2000,
            lock_stale_secs: 20,
            heartbeat_interval_ms: 4000,
            poll_interval_ms: 3000,
            debounce_ms: 1200,
            pull_interval_secs: 30,
            takeover_min_age_secs: 8,
        }
    }
}

impl Timings {
    pub fn conflict_tolerance(&self) -> Duration {
        Duration::from_millis(self.conflict_tolerance_ms)
    }

    pub fn lock_stale_after(&self) -> Duration {
        Duration::from_secs(self.lock_stale_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn pull_interval(&self) -> Duration {
        Duration::from_secs(self.pull_interval_secs)
    }

    pub fn takeover_min_age(&self) -> Duration {
        Duration::from_secs(self.takeover_min_age_secs)
    }
}

/// Backup retention policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Retention {
    /// Newest snapshots that are always kept.
    pub keep_recent: usize,
    /// Snapshots older than this are discarded (beyond `keep_recent`).
    pub max_age_hours: i64,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            keep_recent: 3,
            max_age_hours: 48,
        }
    }
}

/// Optional remote backend. Credentials are expected to be provisioned already.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RemoteSettings {
    /// PostgREST-style HTTP API.
    Rest {
        base_url: String,
        api_key: String,
        #[serde(default)]
        table_prefix: String,
    },
    /// A SQLite database file shared between devices.
    Sqlite { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub storage_root: PathBuf,
    pub device: DeviceIdentity,
    pub timings: Timings,
    pub retention: Retention,
    /// Send deleted note records to the OS trash instead of unlinking them.
    pub use_trash: bool,
    pub remote: Option<RemoteSettings>,
}

impl Default for Settings {
    fn default() -> Self {
        let storage_root = crate::default_paths::default_storage_root(cfg!(debug_assertions))
            .unwrap_or_else(|| PathBuf::from("tack-data"));
        Self {
            storage_root,
            device: DeviceIdentity::generate(),
            timings: Timings::default(),
            retention: Retention::default(),
            use_trash: false,
            remote: None,
        }
    }
}

impl Settings {
    /// Settings rooted at `storage_root` with defaults for everything else.
    pub fn with_root<P: AsRef<Path>>(storage_root: P) -> Self {
        Self {
            storage_root: storage_root.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.device.id.trim().is_empty() {
            return Err(Error::Config("device id must not be empty".to_string()));
        }
        if self.timings.heartbeat_interval_ms == 0 || self.timings.poll_interval_ms == 0 {
            return Err(Error::Config(
                "heartbeat and poll intervals must be non-zero".to_string(),
            ));
        }
        if self.timings.heartbeat_interval() >= self.timings.lock_stale_after() {
            return Err(Error::Config(
                "heartbeat interval must be shorter than lock staleness".to_string(),
            ));
        }
        Ok(())
    }
}

/// Supplies settings to the engine. Implemented by the host application.
pub trait SettingsProvider: Send + Sync {
    fn settings(&self) -> Result<Settings>;
}

impl SettingsProvider for Settings {
    fn settings(&self) -> Result<Settings> {
        Ok(self.clone())
    }
}

/// Settings persisted as a JSON file.
///
/// On first load the file is created with defaults, so the generated device
/// id stays stable across restarts.
#[derive(Debug, Clone)]
pub struct JsonSettingsFile {
    path: PathBuf,
}

impl JsonSettingsFile {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Settings> {
        if !self.path.exists() {
            let settings = Settings::default();
            self.save(&settings)?;
            return Ok(settings);
        }

        let raw = std::fs::read_to_string(&self.path)?;
        let value: serde_json::Value = serde_json::from_str(&raw)?;
        let has_device = value.get("device").is_some();
        let settings: Settings = serde_json::from_value(value)?;

        // Persist the generated identity so it does not change on every start
        if !has_device {
            self.save(&settings)?;
        }

        settings.validate()?;
        Ok(settings)
    }

    pub fn save(&self, settings: &Settings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(settings)?;
        std::fs::write(&self.path, data)?;
        Ok(())
    }
}

impl SettingsProvider for JsonSettingsFile {
    fn settings(&self) -> Result<Settings> {
        self.load()
    }
}
