//! Advisory per-note locks shared through the storage medium.
//!
//! Several devices can mirror the same folder without any central lock
//! service, so ownership is approximated with a lock record per note, a
//! heartbeat, a staleness threshold and a takeover handshake. Nothing stops
//! a misbehaving peer from writing anyway.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::{DeviceIdentity, Timings};
use crate::error::Result;
use crate::events::EngineEvent;
use crate::filesystem::{NoteFilesystem, remove_if_exists, write_atomic};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TakeoverRequest {
    pub requester: DeviceIdentity,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub note_id: String,
    pub owner: DeviceIdentity,
    pub heartbeat: DateTime<Utc>,
    #[serde(default)]
    pub takeover: Option<TakeoverRequest>,
}

/// What this process believes about a note's lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    OwnedLocal,
    OwnedByOther,
    TakeoverRequestedByMe,
    TakeoverRequestedByOther,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired,
    NotAcquired { owner: DeviceIdentity },
    TakeoverRequested { owner: DeviceIdentity },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForceOutcome {
    Taken,
    /// This device is not the recorded takeover requester.
    NotRequester,
    RequestTooRecent { age: Duration },
}

struct Heartbeat {
    refs: usize,
    generation: u64,
    cancel: CancellationToken,
}

pub struct LockCoordinator {
    fs: NoteFilesystem,
    device: DeviceIdentity,
    clock: Arc<dyn Clock>,
    stale_after: Duration,
    heartbeat_interval: Duration,
    events: broadcast::Sender<EngineEvent>,
    states: Mutex<HashMap<String, LockState>>,
    heartbeats: Mutex<HashMap<String, Heartbeat>>,
    next_generation: Mutex<u64>,
}

impl LockCoordinator {
    pub fn new(
        fs: NoteFilesystem,
        device: DeviceIdentity,
        clock: Arc<dyn Clock>,
        timings: &Timings,
        events: broadcast::Sender<EngineEvent>,
    ) -> Self {
        Self {
            fs,
            device,
            clock,
            stale_after: timings.lock_stale_after(),
            heartbeat_interval: timings.heartbeat_interval(),
            events,
            states: Mutex::new(HashMap::new()),
            heartbeats: Mutex::new(HashMap::new()),
            next_generation: Mutex::new(0),
        }
    }

    pub fn device(&self) -> &DeviceIdentity {
        &self.device
    }

    pub fn state(&self, note_id: &str) -> LockState {
        let states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        states.get(note_id).copied().unwrap_or(LockState::Unlocked)
    }

    fn set_state(&self, note_id: &str, state: LockState) {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        if state == LockState::Unlocked {
            states.remove(note_id);
        } else {
            states.insert(note_id.to_string(), state);
        }
    }

    /// Reads the lock record. Unreadable records are treated as absent so a
    /// corrupt file can never block acquisition forever.
    pub async fn read_record(&self, note_id: &str) -> Option<LockRecord> {
        let path = self.fs.lock_path(note_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(note_id, error = %e, "failed to read lock record, treating as unlocked");
                return None;
            }
        };
        match serde_json::from_slice::<LockRecord>(&bytes) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(note_id, error = %e, "malformed lock record, treating as unlocked");
                None
            }
        }
    }

    async fn write_record(&self, record: &LockRecord) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(record)?;
        write_atomic(&self.fs.lock_path(&record.note_id), &bytes).await?;
        Ok(())
    }

    fn is_mine(&self, device: &DeviceIdentity) -> bool {
        device.id == self.device.id
    }

    fn is_stale(&self, record: &LockRecord, now: DateTime<Utc>) -> bool {
        match (now - record.heartbeat).to_std() {
            Ok(age) => age > self.stale_after,
            // Heartbeat in the future: another device's clock is ahead
            Err(_) => false,
        }
    }

    /// Tries to become the owner of a note's lock.
    ///
    /// Succeeds when the note is unlocked, the record is stale, or this
    /// device already owns it. Otherwise optionally records a takeover
    /// request on the existing record without changing its owner.
    pub async fn try_acquire(&self, note_id: &str, request_takeover: bool) -> Result<AcquireOutcome> {
        let now = self.clock.now();

        let record = match self.read_record(note_id).await {
            None => return Ok(self.claim(note_id, None).await),
            Some(record) => record,
        };

        if self.is_mine(&record.owner) {
            // Keep a pending request from another device; it has not been answered yet
            return Ok(self.claim(note_id, record.takeover).await);
        }

        if self.is_stale(&record, now) {
            info!(
                note_id,
                owner = %record.owner.name,
                heartbeat = %record.heartbeat,
                "taking over stale lock"
            );
            return Ok(self.claim(note_id, None).await);
        }

        let requested_by_me = record
            .takeover
            .as_ref()
            .is_some_and(|t| self.is_mine(&t.requester));

        if !request_takeover {
            let state = if requested_by_me {
                LockState::TakeoverRequestedByMe
            } else {
                LockState::OwnedByOther
            };
            self.set_state(note_id, state);
            return Ok(AcquireOutcome::NotAcquired {
                owner: record.owner,
            });
        }

        let mut record = record;
        if !requested_by_me {
            record.takeover = Some(TakeoverRequest {
                requester: self.device.clone(),
                requested_at: now,
            });
            self.write_record(&record).await?;
            info!(note_id, owner = %record.owner.name, "requested lock takeover");
        }

        self.set_state(note_id, LockState::TakeoverRequestedByMe);
        Ok(AcquireOutcome::TakeoverRequested {
            owner: record.owner,
        })
    }

    /// Writes a fresh record naming this device and verifies it by reading it back.
    async fn claim(&self, note_id: &str, takeover: Option<TakeoverRequest>) -> AcquireOutcome {
        let record = LockRecord {
            note_id: note_id.to_string(),
            owner: self.device.clone(),
            heartbeat: self.clock.now(),
            takeover,
        };

        if let Err(e) = self.write_record(&record).await {
            // Fail open: an unwritable lock must not block editing
            warn!(note_id, error = %e, "failed to write lock record, proceeding as owner");
            self.set_state(note_id, LockState::OwnedLocal);
            return AcquireOutcome::Acquired;
        }

        if let Some(current) = self.read_record(note_id).await
            && !self.is_mine(&current.owner)
        {
            debug!(note_id, owner = %current.owner.name, "lost lock race");
            self.set_state(note_id, LockState::OwnedByOther);
            return AcquireOutcome::NotAcquired {
                owner: current.owner,
            };
        }

        self.set_state(note_id, LockState::OwnedLocal);
        AcquireOutcome::Acquired
    }

    /// Polls `try_acquire` every `poll_delay` until it succeeds or `timeout` elapses.
    pub async fn wait_for_lock(&self, note_id: &str, timeout: Duration, poll_delay: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.try_acquire(note_id, false).await? == AcquireOutcome::Acquired {
                return Ok(true);
            }
            if Instant::now() + poll_delay > deadline {
                return Ok(false);
            }
            tokio::time::sleep(poll_delay).await;
        }
    }

    /// Overwrites the lock record with this device as owner.
    ///
    /// Only allowed for the recorded takeover requester once the request is
    /// at least `min_request_age` old. This is the way out when the owner
    /// has crashed or gone offline without going stale on disk.
    pub async fn force_takeover(&self, note_id: &str, min_request_age: Duration) -> Result<ForceOutcome> {
        let now = self.clock.now();

        let record = match self.read_record(note_id).await {
            None => {
                self.claim(note_id, None).await;
                return Ok(ForceOutcome::Taken);
            }
            Some(record) => record,
        };

        if self.is_mine(&record.owner) {
            self.claim(note_id, None).await;
            return Ok(ForceOutcome::Taken);
        }

        let request = match record.takeover {
            Some(request) if self.is_mine(&request.requester) => request,
            _ => return Ok(ForceOutcome::NotRequester),
        };

        let age = (now - request.requested_at).to_std().unwrap_or_default();
        if age < min_request_age {
            return Ok(ForceOutcome::RequestTooRecent { age });
        }

        let fresh = LockRecord {
            note_id: note_id.to_string(),
            owner: self.device.clone(),
            heartbeat: now,
            takeover: None,
        };
        self.write_record(&fresh).await?;
        self.set_state(note_id, LockState::OwnedLocal);
        info!(note_id, previous_owner = %record.owner.name, "forced lock takeover");
        Ok(ForceOutcome::Taken)
    }

    /// Stops heartbeating and hands the note over to the takeover requester.
    ///
    /// The record's ownership fields are left as they are; the requester
    /// still has to acquire it.
    pub fn yield_lock(&self, note_id: &str) {
        self.halt_heartbeat(note_id);
        self.set_state(note_id, LockState::OwnedByOther);
        info!(note_id, "yielded lock");
    }

    /// Stops heartbeating and removes the record if this device owns it.
    pub async fn release(&self, note_id: &str) -> Result<()> {
        self.halt_heartbeat(note_id);
        if let Some(record) = self.read_record(note_id).await
            && self.is_mine(&record.owner)
        {
            remove_if_exists(&self.fs.lock_path(note_id)).await?;
            debug!(note_id, "released lock");
        }
        self.set_state(note_id, LockState::Unlocked);
        Ok(())
    }

    /// Adds a reference to the note's heartbeat, starting the timer on the first one.
    pub fn start_heartbeat(self: &Arc<Self>, note_id: &str) {
        let mut heartbeats = self.heartbeats.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(heartbeat) = heartbeats.get_mut(note_id) {
            heartbeat.refs += 1;
            return;
        }

        let generation = {
            let mut next = self.next_generation.lock().unwrap_or_else(PoisonError::into_inner);
            *next += 1;
            *next
        };
        let cancel = CancellationToken::new();
        heartbeats.insert(
            note_id.to_string(),
            Heartbeat {
                refs: 1,
                generation,
                cancel: cancel.clone(),
            },
        );

        let this = Arc::clone(self);
        let note_id = note_id.to_string();
        tokio::spawn(async move { this.heartbeat_loop(note_id, generation, cancel).await });
    }

    /// Drops a reference; the timer stops when none are left.
    pub fn stop_heartbeat(&self, note_id: &str) {
        let mut heartbeats = self.heartbeats.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(heartbeat) = heartbeats.get_mut(note_id) {
            heartbeat.refs = heartbeat.refs.saturating_sub(1);
            if heartbeat.refs == 0 {
                heartbeat.cancel.cancel();
                heartbeats.remove(note_id);
            }
        }
    }

    pub fn heartbeat_refs(&self, note_id: &str) -> usize {
        let heartbeats = self.heartbeats.lock().unwrap_or_else(PoisonError::into_inner);
        heartbeats.get(note_id).map_or(0, |h| h.refs)
    }

    /// Stops the heartbeat regardless of how many references remain.
    pub fn halt_heartbeat(&self, note_id: &str) {
        let mut heartbeats = self.heartbeats.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(heartbeat) = heartbeats.remove(note_id) {
            heartbeat.cancel.cancel();
        }
    }

    /// Notes this device currently believes it owns.
    pub fn owned_notes(&self) -> Vec<String> {
        let states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<String> = states
            .iter()
            .filter(|(_, state)| {
                matches!(
                    state,
                    LockState::OwnedLocal | LockState::TakeoverRequestedByOther
                )
            })
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn halt_all_heartbeats(&self) {
        let mut heartbeats = self.heartbeats.lock().unwrap_or_else(PoisonError::into_inner);
        for (_, heartbeat) in heartbeats.drain() {
            heartbeat.cancel.cancel();
        }
    }

    fn forget_heartbeat(&self, note_id: &str, generation: u64) {
        let mut heartbeats = self.heartbeats.lock().unwrap_or_else(PoisonError::into_inner);
        if heartbeats.get(note_id).is_some_and(|h| h.generation == generation) {
            heartbeats.remove(note_id);
        }
    }

    async fn heartbeat_loop(self: Arc<Self>, note_id: String, generation: u64, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        let mut announced: Option<DateTime<Utc>> = None;
        debug!(note_id = %note_id, "heartbeat started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if !self.beat(&note_id, &mut announced).await {
                self.forget_heartbeat(&note_id, generation);
                break;
            }
        }

        debug!(note_id = %note_id, "heartbeat stopped");
    }

    /// Drops the lock of a note that no longer exists, removing our record
    /// if one is still there.
    async fn drop_deleted(&self, note_id: &str) {
        if let Some(record) = self.read_record(note_id).await
            && self.is_mine(&record.owner)
            && let Err(e) = remove_if_exists(&self.fs.lock_path(note_id)).await
        {
            warn!(note_id, error = %e, "failed to remove lock of deleted note");
        }
        self.set_state(note_id, LockState::Unlocked);
        info!(note_id, "note was deleted, dropping its lock");
    }

    /// Writes `record` back with a new heartbeat and returns what was written.
    ///
    /// The record is re-read first so a takeover request that landed since
    /// `record` was read survives. A request written between that re-read
    /// and the write is still lost; the requester then sees `NotRequester`
    /// and has to ask again.
    async fn refresh(&self, mut record: LockRecord, now: DateTime<Utc>) -> LockRecord {
        if let Some(latest) = self.read_record(&record.note_id).await
            && self.is_mine(&latest.owner)
        {
            record.takeover = latest.takeover;
        }
        record.heartbeat = now;
        if let Err(e) = self.write_record(&record).await {
            warn!(note_id = %record.note_id, error = %e, "failed to refresh heartbeat");
        }
        record
    }

    /// Refreshes the heartbeat. Returns false once this device is no longer the
    /// owner or the note is gone.
    async fn beat(&self, note_id: &str, announced: &mut Option<DateTime<Utc>>) -> bool {
        let now = self.clock.now();

        if let Ok(None) = self.fs.stat_note(note_id).await {
            self.drop_deleted(note_id).await;
            return false;
        }

        let mut record = match self.read_record(note_id).await {
            Some(record) => record,
            None => {
                // Gone or unreadable while we hold it locally: put it back
                self.claim(note_id, None).await;
                return true;
            }
        };

        if !self.is_mine(&record.owner) {
            warn!(note_id, owner = %record.owner.name, "lock taken by another device");
            self.set_state(note_id, LockState::OwnedByOther);
            let _ = self.events.send(EngineEvent::LockLost {
                note_id: note_id.to_string(),
                owner: Some(record.owner),
            });
            return false;
        }

        if now > record.heartbeat {
            record = self.refresh(record, now).await;
        }

        if let Some(request) = &record.takeover
            && !self.is_mine(&request.requester)
            && *announced != Some(request.requested_at)
        {
            *announced = Some(request.requested_at);
            self.set_state(note_id, LockState::TakeoverRequestedByOther);
            info!(note_id, requester = %request.requester.name, "takeover requested");
            let _ = self.events.send(EngineEvent::TakeoverRequested {
                note_id: note_id.to_string(),
                requester: request.requester.clone(),
            });
        }

        true
    }
}
