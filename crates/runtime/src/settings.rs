//! Scheduler tunables and their persistence.
//!
//! Tunables are loaded once at startup (TOML file, `STELLWERK_*` env
//! overrides) and stay mutable at runtime: every setter persists through
//! the [`SettingsStore`] *before* applying, so a persistence failure
//! leaves the prior value in effect.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::RuntimeError;

// ── Values ───────────────────────────────────────────────────────────

/// On-disk form of the scheduler tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunableValues {
    /// Upper bound on concurrently running processor units.
    #[serde(default = "default_max_threads")]
    pub max_threads: usize,

    /// Dispatcher ticks of non-decreasing ready depth before a processor is added.
    #[serde(default = "default_creation_threshold")]
    pub creation_threshold: u32,

    /// Consecutive idle ticks before a processor (or the whole pool) retires.
    #[serde(default = "default_termination_threshold")]
    pub termination_threshold: u32,

    /// Pause between iterations of a repeatable unit, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// How long a stopping host waits for its units before aborting them.
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
}

fn default_max_threads() -> usize {
    4
}

fn default_creation_threshold() -> u32 {
    3
}

fn default_termination_threshold() -> u32 {
    5
}

fn default_poll_interval_ms() -> u64 {
    20
}

fn default_stop_timeout_ms() -> u64 {
    2_000
}

impl Default for TunableValues {
    fn default() -> Self {
        Self {
            max_threads: default_max_threads(),
            creation_threshold: default_creation_threshold(),
            termination_threshold: default_termination_threshold(),
            poll_interval_ms: default_poll_interval_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
        }
    }
}

impl TunableValues {
    /// Parse from a TOML string, then apply env overrides and validate.
    pub fn from_toml(toml_str: &str) -> Result<Self, RuntimeError> {
        let mut values: Self = toml::from_str(toml_str)?;
        values.apply_env_overrides();
        values.validate()?;
        Ok(values)
    }

    /// Load from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, RuntimeError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Apply environment variable overrides.
    ///
    /// Convention: `STELLWERK_KEY` overrides `key`. Examples:
    /// - `STELLWERK_MAX_THREADS` -> `max_threads`
    /// - `STELLWERK_POLL_INTERVAL_MS` -> `poll_interval_ms`
    pub(crate) fn apply_env_overrides(&mut self) {
        if let Some(v) = env_parse::<usize>("STELLWERK_MAX_THREADS") {
            self.max_threads = v;
        }
        if let Some(v) = env_parse::<u32>("STELLWERK_CREATION_THRESHOLD") {
            self.creation_threshold = v;
        }
        if let Some(v) = env_parse::<u32>("STELLWERK_TERMINATION_THRESHOLD") {
            self.termination_threshold = v;
        }
        if let Some(v) = env_parse::<u64>("STELLWERK_POLL_INTERVAL_MS") {
            self.poll_interval_ms = v;
        }
        if let Some(v) = env_parse::<u64>("STELLWERK_STOP_TIMEOUT_MS") {
            self.stop_timeout_ms = v;
        }
    }

    /// Reject values the scheduler cannot operate with.
    pub fn validate(&self) -> Result<(), RuntimeError> {
        if self.max_threads == 0 {
            return Err(RuntimeError::Config("max_threads must be at least 1".into()));
        }
        if self.creation_threshold == 0 || self.termination_threshold == 0 {
            return Err(RuntimeError::Config(
                "creation_threshold and termination_threshold must be at least 1".into(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(RuntimeError::Config("poll_interval_ms must be at least 1".into()));
        }
        if self.stop_timeout_ms < self.poll_interval_ms {
            return Err(RuntimeError::Config(
                "stop_timeout_ms must not be shorter than poll_interval_ms".into(),
            ));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

// ── Store ────────────────────────────────────────────────────────────

/// Backing key/value store for the tunables.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// Load the persisted values, `None` if nothing was persisted yet.
    async fn load(&self) -> Result<Option<TunableValues>, RuntimeError>;

    /// Persist the values. Must complete before a new value takes effect.
    async fn persist(&self, values: &TunableValues) -> Result<(), RuntimeError>;
}

/// TOML-file-backed store.
pub struct TomlSettingsStore {
    path: PathBuf,
}

impl TomlSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SettingsStore for TomlSettingsStore {
    async fn load(&self) -> Result<Option<TunableValues>, RuntimeError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = tokio::fs::read_to_string(&self.path).await?;
        let values: TunableValues = toml::from_str(&content)?;
        Ok(Some(values))
    }

    async fn persist(&self, values: &TunableValues) -> Result<(), RuntimeError> {
        let content =
            toml::to_string_pretty(values).map_err(|e| RuntimeError::Persist(e.to_string()))?;
        tokio::fs::write(&self.path, content).await?;
        Ok(())
    }
}

/// In-memory store, for tests and hosts without a writable config dir.
#[derive(Default)]
pub struct MemorySettingsStore {
    values: std::sync::Mutex<Option<TunableValues>>,
    fail_persist: std::sync::atomic::AtomicBool,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `persist` call fail.
    pub fn fail_persistence(&self, fail: bool) {
        self.fail_persist
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn persisted(&self) -> Option<TunableValues> {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl SettingsStore for MemorySettingsStore {
    async fn load(&self) -> Result<Option<TunableValues>, RuntimeError> {
        Ok(self.persisted())
    }

    async fn persist(&self, values: &TunableValues) -> Result<(), RuntimeError> {
        if self.fail_persist.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(RuntimeError::Persist("store unavailable".into()));
        }
        *self.values.lock().unwrap_or_else(|e| e.into_inner()) = Some(values.clone());
        Ok(())
    }
}

// ── Runtime-mutable view ─────────────────────────────────────────────

/// Live tunables shared by the scheduler and task hosts.
///
/// Reads are cheap and always see the current values; setters validate,
/// persist, then apply, in that order.
pub struct Tunables {
    store: Arc<dyn SettingsStore>,
    values: RwLock<TunableValues>,
}

impl Tunables {
    /// Load from the store, falling back to defaults, with env overrides.
    pub async fn load(store: Arc<dyn SettingsStore>) -> Result<Arc<Self>, RuntimeError> {
        let mut values = store.load().await?.unwrap_or_default();
        values.apply_env_overrides();
        values.validate()?;
        debug!(?values, "tunables loaded");
        Ok(Arc::new(Self {
            store,
            values: RwLock::new(values),
        }))
    }

    /// Fixed values over an in-memory store. Mostly for tests and embedders.
    pub fn fixed(values: TunableValues) -> Arc<Self> {
        Arc::new(Self {
            store: Arc::new(MemorySettingsStore::new()),
            values: RwLock::new(values),
        })
    }

    pub fn snapshot(&self) -> TunableValues {
        self.read().clone()
    }

    pub fn max_threads(&self) -> usize {
        self.read().max_threads
    }

    pub fn creation_threshold(&self) -> u32 {
        self.read().creation_threshold
    }

    pub fn termination_threshold(&self) -> u32 {
        self.read().termination_threshold
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.read().poll_interval_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.read().stop_timeout_ms)
    }

    pub async fn set_max_threads(&self, value: usize) -> Result<(), RuntimeError> {
        self.update(|v| v.max_threads = value).await
    }

    pub async fn set_creation_threshold(&self, value: u32) -> Result<(), RuntimeError> {
        self.update(|v| v.creation_threshold = value).await
    }

    pub async fn set_termination_threshold(&self, value: u32) -> Result<(), RuntimeError> {
        self.update(|v| v.termination_threshold = value).await
    }

    pub async fn set_poll_interval_ms(&self, value: u64) -> Result<(), RuntimeError> {
        self.update(|v| v.poll_interval_ms = value).await
    }

    pub async fn set_stop_timeout_ms(&self, value: u64) -> Result<(), RuntimeError> {
        self.update(|v| v.stop_timeout_ms = value).await
    }

    async fn update(
        &self,
        apply: impl FnOnce(&mut TunableValues),
    ) -> Result<(), RuntimeError> {
        let mut next = self.snapshot();
        apply(&mut next);
        next.validate()?;
        // Persist first: on failure the prior value stays in effect.
        self.store.persist(&next).await?;
        *self.values.write().unwrap_or_else(|e| e.into_inner()) = next;
        Ok(())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, TunableValues> {
        self.values.read().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let values = TunableValues::default();
        values.validate().unwrap();
        assert_eq!(values.max_threads, 4);
    }

    #[test]
    fn parses_partial_toml_with_defaults() {
        let values = TunableValues::from_toml("max_threads = 8\npoll_interval_ms = 5\n").unwrap();
        assert_eq!(values.max_threads, 8);
        assert_eq!(values.poll_interval_ms, 5);
        assert_eq!(values.creation_threshold, default_creation_threshold());
    }

    #[test]
    fn rejects_zero_max_threads() {
        let result = TunableValues::from_toml("max_threads = 0\n");
        assert!(matches!(result, Err(RuntimeError::Config(_))));
    }

    #[test]
    fn rejects_stop_timeout_below_poll_interval() {
        let result = TunableValues::from_toml("poll_interval_ms = 100\nstop_timeout_ms = 50\n");
        assert!(matches!(result, Err(RuntimeError::Config(_))));
    }

    #[tokio::test]
    async fn setter_persists_before_applying() {
        let store = Arc::new(MemorySettingsStore::new());
        let tunables = Tunables::load(store.clone() as Arc<dyn SettingsStore>)
            .await
            .unwrap();

        tunables.set_max_threads(9).await.unwrap();
        assert_eq!(tunables.max_threads(), 9);
        assert_eq!(store.persisted().unwrap().max_threads, 9);
    }

    #[tokio::test]
    async fn persistence_failure_keeps_prior_value() {
        let store = Arc::new(MemorySettingsStore::new());
        let tunables = Tunables::load(store.clone() as Arc<dyn SettingsStore>)
            .await
            .unwrap();

        store.fail_persistence(true);
        let result = tunables.set_max_threads(16).await;
        assert!(matches!(result, Err(RuntimeError::Persist(_))));
        assert_eq!(tunables.max_threads(), default_max_threads());
    }

    #[tokio::test]
    async fn invalid_setter_value_is_rejected_without_persisting() {
        let store = Arc::new(MemorySettingsStore::new());
        let tunables = Tunables::load(store.clone() as Arc<dyn SettingsStore>)
            .await
            .unwrap();

        let result = tunables.set_max_threads(0).await;
        assert!(matches!(result, Err(RuntimeError::Config(_))));
        assert!(store.persisted().is_none());
    }
}
