// src/bot/persistence.rs - Snapshot storage and the background flusher

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};

use crate::bot::analytics::StatsCounters;
use crate::bot::users::UserProfile;
use crate::config::PersistenceConfig;
use crate::types::{Report, UserId};

const USERS_FILE: &str = "users.json";
const STATS_FILE: &str = "stats.json";
const REPORTS_FILE: &str = "reports.json";

/// Everything that survives a restart. The waiting queue is not persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub users: HashMap<UserId, UserProfile>,
    pub stats: Option<StatsCounters>,
    pub reports: Vec<Report>,
}

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Missing data is an empty state, unreadable data is an error
    async fn load(&self) -> Result<PersistedState>;

    async fn save(&self, state: &PersistedState) -> Result<()>;

    fn describe(&self) -> String;
}

/// Three JSON files in one directory, each rewritten wholesale
pub struct JsonFileStore {
    data_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    async fn read_json<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        let path = self.data_dir.join(name);
        if !path.exists() {
            debug!("{} not found, starting empty", path.display());
            return Ok(None);
        }

        let content = fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let value = serde_json::from_str(&content)
            .with_context(|| format!("Invalid JSON in {}", path.display()))?;
        Ok(Some(value))
    }

    /// Write to a temp file, then rename over the target
    async fn write_json<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let path = self.data_dir.join(name);
        let tmp_path = self.data_dir.join(format!("{}.tmp", name));

        let json = serde_json::to_string_pretty(value)
            .with_context(|| format!("Failed to serialize {}", name))?;
        fs::write(&tmp_path, json)
            .await
            .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &path)
            .await
            .with_context(|| format!("Failed to replace {}", path.display()))
    }
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn load(&self) -> Result<PersistedState> {
        let users: HashMap<UserId, UserProfile> = self.read_json(USERS_FILE).await?.unwrap_or_default();
        let stats = self.read_json(STATS_FILE).await?;
        let reports: Vec<Report> = self.read_json(REPORTS_FILE).await?.unwrap_or_default();

        info!(
            "Loaded {} users and {} reports from {}",
            users.len(),
            reports.len(),
            self.data_dir.display()
        );
        Ok(PersistedState { users, stats, reports })
    }

    async fn save(&self, state: &PersistedState) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        fs::create_dir_all(&self.data_dir)
            .await
            .with_context(|| format!("Failed to create data directory {}", self.data_dir.display()))?;

        self.write_json(USERS_FILE, &state.users).await?;
        if let Some(stats) = &state.stats {
            self.write_json(STATS_FILE, stats).await?;
        }
        self.write_json(REPORTS_FILE, &state.reports).await?;

        debug!("Saved state to {}", self.data_dir.display());
        Ok(())
    }

    fn describe(&self) -> String {
        format!("json:{}", self.data_dir.display())
    }
}

/// Keeps the last saved state in memory; used by tests and dry runs
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<PersistedState>,
    saves: AtomicUsize,
    attempts: AtomicUsize,
    failures_left: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: PersistedState) -> Self {
        Self {
            state: Mutex::new(state),
            ..Self::default()
        }
    }

    /// Make the next `count` saves fail
    pub fn fail_next(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub async fn current(&self) -> PersistedState {
        self.state.lock().await.clone()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load(&self) -> Result<PersistedState> {
        Ok(self.state.lock().await.clone())
    }

    async fn save(&self, state: &PersistedState) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(anyhow::anyhow!("simulated storage failure"));
        }

        *self.state.lock().await = state.clone();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

/// Supplies the state the flusher writes
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// The current revision and a snapshot of it, or `None` if nothing changed after `saved`
    async fn snapshot_since(&self, saved: u64) -> Option<(u64, PersistedState)>;
}

#[derive(Debug, Clone, Copy)]
pub struct FlushPolicy {
    pub retry_initial: Duration,
    pub retry_max: Duration,
    /// Changes nobody signalled are picked up at this interval
    pub activity_interval: Duration,
}

impl From<&PersistenceConfig> for FlushPolicy {
    fn from(config: &PersistenceConfig) -> Self {
        Self {
            retry_initial: Duration::from_millis(config.retry_initial_ms),
            retry_max: Duration::from_millis(config.retry_max_ms),
            activity_interval: Duration::from_secs(config.activity_flush_seconds),
        }
    }
}

/// Handle to the background flusher.
///
/// Callers only signal a revision number; the flusher takes the snapshot itself, so a
/// burst of changes costs a single clone and a single write.
pub struct PersistHandle {
    store: Arc<dyn StateStore>,
    sender: watch::Sender<u64>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PersistHandle {
    pub fn spawn(store: Arc<dyn StateStore>, source: Arc<dyn SnapshotSource>, policy: FlushPolicy) -> Self {
        let (sender, receiver) = watch::channel(0);
        let task = tokio::spawn(run_flusher(Arc::clone(&store), source, receiver, policy));
        info!("Persistence flusher started ({})", store.describe());

        Self {
            store,
            sender,
            task: Mutex::new(Some(task)),
        }
    }

    /// Ask for the state at `revision` (or later) to be written soon
    pub fn mark_dirty(&self, revision: u64) {
        if self.sender.send(revision).is_err() {
            warn!("Persistence flusher is gone, revision {} not scheduled", revision);
        }
    }

    /// Write synchronously, bypassing the flusher
    pub async fn save_now(&self, state: &PersistedState) -> Result<()> {
        self.store.save(state).await
    }

    /// Stop the flusher and write the final state. An error here means data loss.
    pub async fn shutdown(&self, state: PersistedState) -> Result<()> {
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
            let _ = task.await;
        }

        self.store
            .save(&state)
            .await
            .with_context(|| format!("Final flush to {} failed", self.store.describe()))?;
        info!("Final state flushed to {}", self.store.describe());
        Ok(())
    }
}

async fn run_flusher(
    store: Arc<dyn StateStore>,
    source: Arc<dyn SnapshotSource>,
    mut receiver: watch::Receiver<u64>,
    policy: FlushPolicy,
) {
    // Revision 0 is the state that was just loaded
    let mut saved = 0;
    let mut ticker = interval_at(Instant::now() + policy.activity_interval, policy.activity_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            changed = receiver.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = ticker.tick() => {}
        }

        let mut delay = policy.retry_initial;
        while let Some((revision, state)) = source.snapshot_since(saved).await {
            match store.save(&state).await {
                Ok(()) => {
                    saved = revision;
                    debug!("Revision {} flushed to {}", revision, store.describe());
                }
                Err(e) => {
                    error!("Failed to persist state to {}: {:#}", store.describe(), e);
                    warn!("Retrying persistence in {:?}", delay);
                    // The retry takes a fresh snapshot, so newer changes are included
                    sleep(delay).await;
                    delay = (delay * 2).min(policy.retry_max);
                }
            }
        }
    }
    debug!("Persistence flusher stopped");
}
