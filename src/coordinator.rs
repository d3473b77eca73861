//! In-memory preference map with coalesced, off-thread durability.
//!
//! Mutations update the map under one lock and return. The first mutation
//! after an idle period starts a flush worker; mutations that land while it
//! runs only set the dirty flag, and the worker keeps taking fresh snapshots
//! until the flag stays clear. At most one flush runs per coordinator.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::StorageConfig;
use crate::storage::sql::DriverRegistry;
use crate::storage::{
    self, BackendKind, FlushBatch, PreferenceRecord, StorageBackend, StorageError,
};

#[derive(Error, Debug)]
pub enum FlushError {
    #[error("Flush did not finish within {0:?}")]
    TimedOut(Duration),
    #[error("Could not start flush worker: {0}")]
    Worker(#[from] std::io::Error),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Counters across the coordinator's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushStats {
    /// Snapshots handed to the backend.
    pub passes: u64,
    /// Backend write operations reported by successful passes.
    pub writes: u64,
    pub failures: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub loaded: usize,
    /// Records whose user id did not parse.
    pub skipped: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct StorageInfo {
    pub kind: BackendKind,
    pub location: String,
    /// Why the configured backend was replaced by the flat file, if it was.
    pub degraded: Option<String>,
    pub records: usize,
    pub stats: FlushStats,
}

#[derive(Default)]
struct State {
    records: HashMap<Uuid, PreferenceRecord>,
    /// Users to upsert on the next flush.
    changed: HashSet<Uuid>,
    /// Users to delete on the next flush.
    deleted: HashSet<Uuid>,
    dirty: bool,
    in_flight: bool,
    stats: FlushStats,
    /// Error from the most recent pass, cleared by the next successful one.
    last_error: Option<StorageError>,
}

impl State {
    /// Mark dirty; returns true when the caller must start a worker.
    fn request_flush(&mut self) -> bool {
        self.dirty = true;
        if self.in_flight {
            false
        } else {
            self.in_flight = true;
            true
        }
    }

    fn has_pending(&self) -> bool {
        self.dirty || !self.changed.is_empty() || !self.deleted.is_empty()
    }

    fn take_batch(&mut self) -> FlushBatch {
        self.dirty = false;
        let mut snapshot: Vec<PreferenceRecord> = self.records.values().cloned().collect();
        snapshot.sort_by_key(|r| r.user);
        let upserts = self
            .changed
            .drain()
            .filter_map(|user| self.records.get(&user).cloned())
            .collect();
        let deletes = self.deleted.drain().collect();
        FlushBatch {
            snapshot,
            upserts,
            deletes,
        }
    }

    /// Put a failed batch's work back without re-arming a flush; the next
    /// mutation (or shutdown) retries it. Later mutations take precedence.
    fn requeue(&mut self, batch: &FlushBatch) {
        for r in &batch.upserts {
            if self.records.contains_key(&r.user) {
                self.changed.insert(r.user);
            }
        }
        for user in &batch.deletes {
            if !self.records.contains_key(user) {
                self.deleted.insert(*user);
            }
        }
    }
}

struct Shared {
    backend: Box<dyn StorageBackend>,
    degraded: Option<String>,
    state: Mutex<State>,
    idle: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Flush until no new mutations arrived during the last pass, then
    /// release the single-flight slot.
    fn drain(&self) {
        loop {
            let batch = {
                let mut st = self.lock();
                if !st.dirty {
                    st.in_flight = false;
                    self.idle.notify_all();
                    return;
                }
                st.take_batch()
            };
            self.write(&batch);
        }
    }

    fn write(&self, batch: &FlushBatch) {
        let result = self.backend.apply(batch);
        let mut st = self.lock();
        st.stats.passes += 1;
        match result {
            Ok(ops) => {
                st.stats.writes += ops as u64;
                st.last_error = None;
                log::debug!(
                    "Saved player data ({} upserts, {} deletes, {} ops)",
                    batch.upserts.len(),
                    batch.deletes.len(),
                    ops
                );
            }
            Err(e) => {
                st.stats.failures += 1;
                st.requeue(batch);
                log::error!("Failed to save player data to {}: {e}", self.backend.describe());
                st.last_error = Some(e);
            }
        }
    }
}

/// Sole owner and writer of the preference map.
pub struct PersistenceCoordinator {
    shared: Arc<Shared>,
    clock: Arc<dyn Clock>,
}

impl PersistenceCoordinator {
    pub fn new(backend: Box<dyn StorageBackend>, clock: Arc<dyn Clock>) -> Self {
        Self::with_degraded(backend, None, clock)
    }

    fn with_degraded(
        backend: Box<dyn StorageBackend>,
        degraded: Option<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                backend,
                degraded,
                state: Mutex::new(State::default()),
                idle: Condvar::new(),
            }),
            clock,
        }
    }

    /// Open the configured backend (degrading to the flat file if a SQL
    /// backend is unusable) and load existing records.
    ///
    /// Unreadable stored data is moved aside before starting empty, so the
    /// first flush cannot overwrite it. Fails when the flat file cannot be
    /// created or unreadable data cannot be moved.
    pub fn open(
        config: &StorageConfig,
        data_dir: &Path,
        drivers: &DriverRegistry,
        clock: Arc<dyn Clock>,
    ) -> storage::Result<Self> {
        let opened = storage::open_backend(config, data_dir, drivers)?;
        let coordinator = Self::with_degraded(opened.backend, opened.degraded, clock);
        if let Err(e) = coordinator.load_from_backend() {
            log::error!("Failed to load player data, starting empty: {e}");
            let stamp = coordinator.clock.now();
            if let Some(moved) = coordinator.shared.backend.set_aside_unreadable(stamp)? {
                log::error!("Moved unreadable player data to {}", moved.display());
            }
        }
        Ok(coordinator)
    }

    /// Populate the map from storage. Unparseable user ids are skipped.
    pub fn load_from_backend(&self) -> storage::Result<LoadSummary> {
        let stored = self.shared.backend.load_all()?;
        let mut summary = LoadSummary::default();
        let mut st = self.shared.lock();
        for raw in stored {
            match raw.parse() {
                Ok(record) => {
                    st.records.insert(record.user, record);
                    summary.loaded += 1;
                }
                Err(bad) => {
                    log::warn!("Invalid UUID in player data: {bad}");
                    summary.skipped += 1;
                }
            }
        }
        log::info!(
            "Loaded data for {} players from {}",
            summary.loaded,
            self.shared.backend.kind()
        );
        if summary.skipped > 0 {
            log::warn!("Skipped {} malformed player records", summary.skipped);
        }
        Ok(summary)
    }

    /// Selected signal id. Reads memory only.
    pub fn get(&self, user: &Uuid) -> Option<String> {
        self.shared
            .lock()
            .records
            .get(user)
            .and_then(|r| r.signal.clone())
    }

    pub fn record(&self, user: &Uuid) -> Option<PreferenceRecord> {
        self.shared.lock().records.get(user).cloned()
    }

    pub fn snapshot(&self) -> Vec<PreferenceRecord> {
        let mut records: Vec<PreferenceRecord> =
            self.shared.lock().records.values().cloned().collect();
        records.sort_by_key(|r| r.user);
        records
    }

    pub fn len(&self) -> usize {
        self.shared.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_degraded(&self) -> bool {
        self.shared.degraded.is_some()
    }

    pub fn stats(&self) -> FlushStats {
        self.shared.lock().stats
    }

    pub fn storage_info(&self) -> StorageInfo {
        let st = self.shared.lock();
        StorageInfo {
            kind: self.shared.backend.kind(),
            location: self.shared.backend.describe(),
            degraded: self.shared.degraded.clone(),
            records: st.records.len(),
            stats: st.stats,
        }
    }

    /// Store a selection and stamp the change time. Returns immediately.
    pub fn set(&self, user: Uuid, signal: &str) {
        self.mutate(|st, now| {
            let record = st
                .records
                .entry(user)
                .or_insert_with(|| PreferenceRecord::new(user));
            record.signal = Some(signal.to_string());
            record.last_change = Some(now);
            st.changed.insert(user);
            st.deleted.remove(&user);
            true
        });
    }

    /// Drop the user's record and schedule its deletion. Returns whether one existed.
    pub fn remove(&self, user: &Uuid) -> bool {
        self.mutate(|st, _| {
            if st.records.remove(user).is_none() {
                return false;
            }
            st.changed.remove(user);
            st.deleted.insert(*user);
            true
        })
    }

    /// Stamp the last connect-time playback. No-op for unknown users.
    pub fn mark_triggered(&self, user: &Uuid) {
        self.mutate(|st, now| match st.records.get_mut(user) {
            Some(record) => {
                record.last_triggered = Some(now);
                st.changed.insert(*user);
                true
            }
            None => false,
        });
    }

    /// Apply `f` under the lock; a `true` result schedules a flush.
    fn mutate(&self, f: impl FnOnce(&mut State, i64) -> bool) -> bool {
        let now = self.clock.now();
        let (changed, start_worker) = {
            let mut st = self.shared.lock();
            let changed = f(&mut st, now);
            (changed, changed && st.request_flush())
        };
        if start_worker {
            // failure is logged; the work stays queued for the next flush
            let _ = self.spawn_worker();
        }
        changed
    }

    /// Start the worker for a slot the caller has already marked in flight.
    fn spawn_worker(&self) -> std::io::Result<()> {
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("joinsignal-flush".to_string())
            .spawn(move || shared.drain());
        if let Err(e) = spawned {
            log::error!("Could not start flush worker: {e}");
            let mut st = self.shared.lock();
            st.in_flight = false;
            self.shared.idle.notify_all();
            return Err(e);
        }
        Ok(())
    }

    /// Wait for any in-flight flush, bounded by `timeout`.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.wait_idle_until(Instant::now() + timeout)
    }

    fn wait_idle_until(&self, deadline: Instant) -> bool {
        let mut st = self.shared.lock();
        while st.in_flight {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            st = match self.shared.idle.wait_timeout(st, remaining) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }

    /// Blocking flush for shutdown, bounded by `timeout` as a whole.
    ///
    /// Anything still pending is handed to the worker; the caller only
    /// waits. If the deadline passes the worker is left running and the
    /// call returns `TimedOut`.
    pub fn flush_now(&self, timeout: Duration) -> Result<FlushStats, FlushError> {
        let deadline = Instant::now() + timeout;
        let start_worker = {
            let mut st = self.shared.lock();
            if !st.in_flight && !st.has_pending() {
                return Ok(st.stats);
            }
            if st.has_pending() {
                // a failed pass requeues without re-arming; re-arm it here
                st.request_flush()
            } else {
                false
            }
        };
        if start_worker {
            self.spawn_worker()?;
        }

        if !self.wait_idle_until(deadline) {
            log::error!("Flush still running after {timeout:?}; unsaved player data may be lost");
            return Err(FlushError::TimedOut(timeout));
        }
        let mut st = self.shared.lock();
        if st.has_pending() {
            if let Some(e) = st.last_error.take() {
                return Err(FlushError::Storage(e));
            }
        }
        Ok(st.stats)
    }
}
