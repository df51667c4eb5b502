//! Task host: gives units of work a managed lifecycle.
//!
//! A [`TaskHost`] owns a set of concurrently running units, each bound to
//! one dedicated task. Stopping is cooperative: units observe the stop
//! signal and exit their repeat loop; whatever survives the stop timeout
//! is aborted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::RuntimeError;
use crate::settings::Tunables;
use crate::task::{Flow, Task, TaskState};

// ── Lifecycle ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// How a [`TaskHost::stop`] call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The host was not running in the first place.
    Idle,
    /// Every unit exited within the stop timeout.
    Graceful,
    /// At least one unit had to be aborted.
    Forced,
}

/// Lifecycle hooks for components built on a host.
///
/// All hooks are best-effort: a failing `startup`/`shutdown` is logged,
/// never fatal.
#[async_trait]
pub trait HostHooks: Send + Sync {
    /// Register the host's first units. Called at the start of `start()`.
    async fn initialise(&self, _host: &Arc<TaskHost>) {}

    /// Called after `initialise`, before units are spawned.
    async fn startup(&self) -> Result<(), RuntimeError> {
        Ok(())
    }

    /// Called once the active-unit count reaches zero.
    async fn shutdown(&self) -> Result<(), RuntimeError> {
        Ok(())
    }
}

// ── TaskHost ─────────────────────────────────────────────────────────

struct ActiveUnit {
    state: Arc<TaskState>,
    handle: Option<JoinHandle<()>>,
}

/// Named component owning a set of concurrently running units.
pub struct TaskHost {
    name: String,
    tunables: Arc<Tunables>,
    hooks: Option<Arc<dyn HostHooks>>,
    state: Mutex<HostState>,
    /// Serializes start/stop: only one transition may be in flight.
    lifecycle: Mutex<()>,
    /// Units registered while not running; spawned on the next `start()`.
    registered: Mutex<Vec<Arc<TaskState>>>,
    active: Mutex<HashMap<Uuid, ActiveUnit>>,
    active_count: AtomicUsize,
    /// Wakes repeat pauses when the host begins stopping.
    stop_signal: Notify,
    /// Fired when the active-unit count reaches zero.
    drained: Notify,
}

impl TaskHost {
    pub fn new(name: impl Into<String>, tunables: Arc<Tunables>) -> Arc<Self> {
        Self::build(name, tunables, None)
    }

    pub fn with_hooks(
        name: impl Into<String>,
        tunables: Arc<Tunables>,
        hooks: Arc<dyn HostHooks>,
    ) -> Arc<Self> {
        Self::build(name, tunables, Some(hooks))
    }

    fn build(
        name: impl Into<String>,
        tunables: Arc<Tunables>,
        hooks: Option<Arc<dyn HostHooks>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            tunables,
            hooks,
            state: Mutex::new(HostState::Stopped),
            lifecycle: Mutex::new(()),
            registered: Mutex::new(Vec::new()),
            active: Mutex::new(HashMap::new()),
            active_count: AtomicUsize::new(0),
            stop_signal: Notify::new(),
            drained: Notify::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn state(&self) -> HostState {
        *self.state.lock().await
    }

    /// Number of currently active units. Safe to call concurrently.
    pub fn task_count(&self) -> usize {
        self.active_count.load(Ordering::SeqCst)
    }

    /// Start the host: run hooks, then spawn one task per registered unit.
    ///
    /// No-op when already starting or running. A host with zero registered
    /// units logs a warning and stays idle; that is not an error.
    pub async fn start(self: &Arc<Self>) -> Result<(), RuntimeError> {
        let _guard = self.lifecycle.lock().await;
        {
            let mut state = self.state.lock().await;
            match *state {
                HostState::Starting | HostState::Running => return Ok(()),
                HostState::Stopping => {
                    return Err(RuntimeError::HostNotRunning(self.name.clone()))
                }
                HostState::Stopped => *state = HostState::Starting,
            }
        }

        if let Some(hooks) = self.hooks.clone() {
            hooks.initialise(self).await;
            if let Err(e) = hooks.startup().await {
                warn!(host = %self.name, error = %e, "startup hook failed");
            }
        }

        let pending: Vec<Arc<TaskState>> = {
            let mut registered = self.registered.lock().await;
            registered.drain(..).collect()
        };
        if pending.is_empty() {
            warn!(host = %self.name, "no units registered, host stays idle");
            *self.state.lock().await = HostState::Stopped;
            return Ok(());
        }

        // Reserve every unit before spawning any, so an early finisher
        // cannot drain the host mid-start.
        {
            let mut active = self.active.lock().await;
            for unit in &pending {
                unit.promise.mark_started();
                self.active_count.fetch_add(1, Ordering::SeqCst);
                active.insert(
                    unit.task.id,
                    ActiveUnit {
                        state: Arc::clone(unit),
                        handle: None,
                    },
                );
            }
        }
        *self.state.lock().await = HostState::Running;
        for unit in pending {
            self.spawn_reserved(unit).await;
        }
        info!(host = %self.name, units = self.task_count(), "host started");
        Ok(())
    }

    /// Register a unit. While running it is spawned immediately; otherwise
    /// it is only recorded and will start on the next `start()`. Returns
    /// the unit's state immediately in both cases.
    pub async fn register_task(self: &Arc<Self>, task: Task) -> Arc<TaskState> {
        let unit = TaskState::new(task);
        // The running check and the reservation happen under both locks:
        // a concurrent drain checks the active count while holding the
        // state lock, so it either sees this unit or has already stopped.
        let reserved = {
            let mut active = self.active.lock().await;
            let state = self.state.lock().await;
            if *state == HostState::Running {
                unit.promise.mark_started();
                self.active_count.fetch_add(1, Ordering::SeqCst);
                active.insert(
                    unit.task.id,
                    ActiveUnit {
                        state: Arc::clone(&unit),
                        handle: None,
                    },
                );
                true
            } else {
                false
            }
        };
        if reserved {
            self.spawn_reserved(Arc::clone(&unit)).await;
        } else {
            self.registered.lock().await.push(Arc::clone(&unit));
            debug!(host = %self.name, unit = %unit.task.label, "unit recorded for next start");
        }
        unit
    }

    /// Stop the host: cooperative wait, then forced abort of survivors.
    ///
    /// No-op unless running. The shutdown hook runs once the active-unit
    /// count reaches zero, from whichever task detects it first.
    pub async fn stop(self: &Arc<Self>) -> Result<StopOutcome, RuntimeError> {
        let _guard = self.lifecycle.lock().await;
        {
            let mut state = self.state.lock().await;
            if *state != HostState::Running {
                return Ok(StopOutcome::Idle);
            }
            *state = HostState::Stopping;
        }
        let stop_timeout = self.tunables.stop_timeout();
        info!(host = %self.name, timeout = ?stop_timeout, "stopping host");
        self.stop_signal.notify_waiters();

        let mut outcome = StopOutcome::Graceful;
        if !self.wait_drained(stop_timeout).await {
            outcome = StopOutcome::Forced;
            let survivors: Vec<ActiveUnit> = {
                let mut active = self.active.lock().await;
                let drained: Vec<ActiveUnit> = active.drain().map(|(_, unit)| unit).collect();
                self.active_count.fetch_sub(drained.len(), Ordering::SeqCst);
                drained
            };
            warn!(
                host = %self.name,
                still_running = survivors.len(),
                "stop timed out, aborting units"
            );
            for unit in survivors {
                if let Some(handle) = &unit.handle {
                    handle.abort();
                }
                unit.state
                    .promise
                    .reject(Arc::new(RuntimeError::Canceled(unit.state.task.label.clone())));
                if let Some(handle) = unit.handle {
                    let _ = handle.await;
                }
            }
            self.drained.notify_waiters();
        }

        self.finish_idle().await;
        info!(host = %self.name, outcome = ?outcome, "host stopped");
        Ok(outcome)
    }

    // ── Internals ────────────────────────────────────────────────────

    /// Spawn the run loop for a unit already reserved in `active`.
    async fn spawn_reserved(self: &Arc<Self>, unit: Arc<TaskState>) {
        let id = unit.task.id;
        let host = Arc::clone(self);
        let handle = tokio::spawn(async move {
            host.run_unit(unit).await;
        });
        if let Some(entry) = self.active.lock().await.get_mut(&id) {
            entry.handle = Some(handle);
        }
    }

    async fn run_unit(self: Arc<Self>, unit: Arc<TaskState>) {
        let label = unit.task.label.clone();
        debug!(host = %self.name, unit = %label, "unit started");

        let result = loop {
            match unit.task.run_once().await {
                Ok(Flow::Done) => break Ok(()),
                Ok(Flow::Continue) => {
                    if !unit.task.repeat {
                        break Ok(());
                    }
                    // Interruptible pause between iterations.
                    let stopping = tokio::select! {
                        _ = tokio::time::sleep(self.tunables.poll_interval()) => {
                            self.state().await == HostState::Stopping
                        }
                        _ = self.stop_signal.notified() => true,
                    };
                    if stopping {
                        debug!(host = %self.name, unit = %label, "unit observed stop");
                        break Ok(());
                    }
                }
                Err(e) => {
                    warn!(host = %self.name, unit = %label, error = %e, "unit failed");
                    break Err(e);
                }
            }
        };

        match result {
            Ok(()) => {
                unit.promise.resolve(());
            }
            Err(e) => {
                unit.promise.reject(Arc::new(e));
            }
        }
        self.retire_unit(unit.task.id).await;
    }

    async fn retire_unit(&self, id: Uuid) {
        let remaining = {
            let mut active = self.active.lock().await;
            if active.remove(&id).is_none() {
                return; // already force-drained by stop()
            }
            self.active_count.fetch_sub(1, Ordering::SeqCst) - 1
        };
        if remaining == 0 {
            self.drained.notify_waiters();
            self.finish_idle().await;
        }
    }

    /// Mark the host stopped and fire the shutdown hook exactly once.
    ///
    /// A host with zero active units is, by definition, stopped — this
    /// also covers a running host whose last unit finished naturally.
    async fn finish_idle(&self) {
        let transitioned = {
            let mut state = self.state.lock().await;
            if *state == HostState::Stopped || self.task_count() > 0 {
                false
            } else {
                *state = HostState::Stopped;
                true
            }
        };
        if transitioned {
            if let Some(hooks) = &self.hooks {
                if let Err(e) = hooks.shutdown().await {
                    warn!(host = %self.name, error = %e, "shutdown hook failed");
                }
            }
        }
    }

    async fn wait_drained(&self, limit: std::time::Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.drained.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.active_count.load(Ordering::SeqCst) == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(limit, wait).await.is_ok()
    }
}

// ── Tests ────────────────────────────────────────────────────────────
