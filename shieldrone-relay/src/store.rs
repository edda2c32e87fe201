/*!
 * SESSION STATE STORE - Drone assignment persistence
 *
 * ROLE :
 * Keeps the current drone assignment and its 10-minute timer across restarts.
 * Two records only: `droneState` (assignment JSON) and `assignmentStartTime`
 * (epoch millis).
 *
 * RULES :
 * - merge = overwrite-if-present, absent fields keep the stored value
 * - assignment and timer are written and removed together (one `apply` batch)
 * - all mutations go through one writer lock
 * - `is_expired()` never writes
 */

use crate::models::{DroneAssignmentState, MatchStatus};
use crate::state::{new_state, Shared};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

pub const KEY_DRONE_STATE: &str = "droneState";
pub const KEY_ASSIGNMENT_START: &str = "assignmentStartTime";

pub const DEFAULT_ASSIGNMENT_TTL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Corrupt record '{key}': {reason}")]
    Corrupt { key: String, reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    Put { key: String, value: String },
    Remove(String),
}

impl StoreOp {
    pub fn put(key: &str, value: impl Into<String>) -> Self {
        StoreOp::Put { key: key.to_string(), value: value.into() }
    }

    pub fn remove(key: &str) -> Self {
        StoreOp::Remove(key.to_string())
    }
}

fn apply_ops(records: &mut BTreeMap<String, String>, ops: &[StoreOp]) {
    for op in ops {
        match op {
            StoreOp::Put { key, value } => {
                records.insert(key.clone(), value.clone());
            }
            StoreOp::Remove(key) => {
                records.remove(key);
            }
        }
    }
}

/// String-keyed persistence. `apply` commits the whole batch or nothing.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    fn apply(&self, ops: &[StoreOp]) -> Result<(), StoreError>;
}

/// JSON file store, loaded into a cache at open time.
pub struct FileStore {
    path: PathBuf,
    cache: Mutex<BTreeMap<String, String>>,
}

impl FileStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let records = if path.exists() {
            let content = fs::read_to_string(&path)?;
            if content.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&content)?
            }
        } else {
            BTreeMap::new()
        };

        info!("[store] opened {:?} ({} records)", path, records.len());
        Ok(Self { path, cache: Mutex::new(records) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_file(&self, records: &BTreeMap<String, String>) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(records)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.cache.lock().get(key).cloned())
    }

    fn apply(&self, ops: &[StoreOp]) -> Result<(), StoreError> {
        let mut cache = self.cache.lock();
        let mut next = cache.clone();
        apply_ops(&mut next, ops);
        // the cache only moves once the file is on disk
        self.write_file(&next)?;
        *cache = next;
        Ok(())
    }
}

#[derive(Default)]
struct MemoryRecords {
    records: BTreeMap<String, String>,
    read_fault: Option<String>,
    write_fault: Option<String>,
    batches: usize,
}

/// In-process store with read/write fault injection.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Shared<MemoryRecords>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self { inner: new_state(MemoryRecords::default()) }
    }

    pub fn fail_reads(&self, reason: Option<&str>) {
        self.inner.lock().read_fault = reason.map(str::to_string);
    }

    pub fn fail_writes(&self, reason: Option<&str>) {
        self.inner.lock().write_fault = reason.map(str::to_string);
    }

    /// Raw record, bypassing read faults.
    pub fn raw(&self, key: &str) -> Option<String> {
        self.inner.lock().records.get(key).cloned()
    }

    pub fn insert_raw(&self, key: &str, value: &str) {
        self.inner.lock().records.insert(key.to_string(), value.to_string());
    }

    /// Number of committed batches.
    pub fn batches(&self) -> usize {
        self.inner.lock().batches
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let inner = self.inner.lock();
        match &inner.read_fault {
            Some(reason) => Err(StoreError::Io(std::io::Error::other(reason.clone()))),
            None => Ok(inner.records.get(key).cloned()),
        }
    }

    fn apply(&self, ops: &[StoreOp]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if let Some(reason) = &inner.write_fault {
            return Err(StoreError::Io(std::io::Error::other(reason.clone())));
        }
        apply_ops(&mut inner.records, ops);
        inner.batches += 1;
        Ok(())
    }
}

/// Wall clock in epoch milliseconds.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(start_millis: i64) -> Self {
        Self { now: Arc::new(AtomicI64::new(start_millis)) }
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }

    pub fn set(&self, millis: i64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// What an inbound assignment update did to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionChange {
    /// New assignment cycle, timer (re)started.
    Started(DroneAssignmentState),
    Updated(DroneAssignmentState),
    /// Completed or canceled, record and timer removed.
    Ended(DroneAssignmentState),
}

pub struct SessionStore {
    kv: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    writer: Mutex<()>,
}

impl SessionStore {
    pub fn new(kv: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self { kv, clock, ttl, writer: Mutex::new(()) }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn now_millis(&self) -> i64 {
        self.clock.now_millis()
    }

    pub fn get(&self) -> Result<Option<DroneAssignmentState>, StoreError> {
        match self.kv.get(KEY_DRONE_STATE)? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub fn started_at(&self) -> Result<Option<i64>, StoreError> {
        match self.kv.get(KEY_ASSIGNMENT_START)? {
            Some(raw) => raw.trim().parse::<i64>().map(Some).map_err(|e| StoreError::Corrupt {
                key: KEY_ASSIGNMENT_START.to_string(),
                reason: e.to_string(),
            }),
            None => Ok(None),
        }
    }

    /// Stored assignment for a read-modify-write. An unreadable record is
    /// logged and treated as absent so the update can replace it.
    fn stored_for_update(&self) -> Option<DroneAssignmentState> {
        self.get().unwrap_or_else(|e| {
            warn!("[store] stored assignment unreadable, overwriting: {}", e);
            None
        })
    }

    /// Field-level merge of `update` into the stored assignment.
    pub fn merge(&self, update: &DroneAssignmentState) -> Result<DroneAssignmentState, StoreError> {
        let _writer = self.writer.lock();
        let next = match self.stored_for_update() {
            Some(stored) => stored.merged_with(update),
            None => update.clone(),
        };
        self.kv.apply(&[StoreOp::put(KEY_DRONE_STATE, serde_json::to_string(&next)?)])?;
        Ok(next)
    }

    /// Removes assignment and timer as one unit.
    pub fn clear(&self) -> Result<(), StoreError> {
        let _writer = self.writer.lock();
        self.kv.apply(&[StoreOp::remove(KEY_DRONE_STATE), StoreOp::remove(KEY_ASSIGNMENT_START)])?;
        debug!("[store] assignment cleared");
        Ok(())
    }

    pub fn start_timer(&self) -> Result<i64, StoreError> {
        let _writer = self.writer.lock();
        let now = self.clock.now_millis();
        self.kv.apply(&[StoreOp::put(KEY_ASSIGNMENT_START, now.to_string())])?;
        Ok(now)
    }

    /// True once `ttl` has elapsed since `start_timer()`. No timer, no expiry.
    /// Read faults count as not expired.
    pub fn is_expired(&self) -> bool {
        match self.started_at() {
            Ok(Some(start)) => self.clock.now_millis().saturating_sub(start) >= self.ttl.as_millis() as i64,
            Ok(None) => false,
            Err(e) => {
                warn!("[store] cannot read assignment timer: {}", e);
                false
            }
        }
    }

    /// Clears the assignment if its timer ran out, returning what was removed.
    pub fn expire_if_due(&self) -> Result<Option<DroneAssignmentState>, StoreError> {
        let _writer = self.writer.lock();
        if !self.is_expired() {
            return Ok(None);
        }
        let expired = self.get().unwrap_or_else(|e| {
            warn!("[store] expired assignment unreadable: {}", e);
            None
        });
        self.kv.apply(&[StoreOp::remove(KEY_DRONE_STATE), StoreOp::remove(KEY_ASSIGNMENT_START)])?;
        info!("[store] assignment timer expired after {:?}", self.ttl);
        Ok(expired)
    }

    /// Applies an assignment update received from upstream.
    ///
    /// `ASSIGNED` for a new drone, or with no running timer, starts a new cycle.
    /// `COMPLETED` and `CANCELED` end it. Everything else merges.
    pub fn apply_update(&self, update: &DroneAssignmentState) -> Result<SessionChange, StoreError> {
        let _writer = self.writer.lock();
        let stored = self.stored_for_update();

        if update.match_status.is_terminal() {
            let last = match &stored {
                Some(stored) => stored.merged_with(update),
                None => update.clone(),
            };
            self.kv.apply(&[StoreOp::remove(KEY_DRONE_STATE), StoreOp::remove(KEY_ASSIGNMENT_START)])?;
            info!("[store] drone {} {:?}, assignment closed", last.drone_id, last.match_status);
            return Ok(SessionChange::Ended(last));
        }

        let (next, fresh) = match stored {
            Some(stored) if stored.drone_id == update.drone_id => (stored.merged_with(update), false),
            Some(stored) if update.match_status == MatchStatus::Assigned => {
                debug!("[store] drone {} replaces drone {}", update.drone_id, stored.drone_id);
                (update.clone(), true)
            }
            Some(stored) => (stored.merged_with(update), false),
            None => (update.clone(), true),
        };
        let json = serde_json::to_string(&next)?;
        let timer_running = match self.started_at() {
            Ok(start) => start.is_some(),
            Err(e) => {
                warn!("[store] assignment timer unreadable, restarting it: {}", e);
                false
            }
        };
        let restart = update.match_status == MatchStatus::Assigned && (fresh || !timer_running);

        if restart {
            let now = self.clock.now_millis();
            self.kv.apply(&[
                StoreOp::put(KEY_DRONE_STATE, json),
                StoreOp::put(KEY_ASSIGNMENT_START, now.to_string()),
            ])?;
            info!("[store] drone {} assigned, timer started at {}", next.drone_id, now);
            Ok(SessionChange::Started(next))
        } else {
            self.kv.apply(&[StoreOp::put(KEY_DRONE_STATE, json)])?;
            Ok(SessionChange::Updated(next))
        }
    }
}
