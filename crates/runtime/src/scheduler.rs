//! Adaptive pool scheduler: one dispatcher unit plus a self-scaling set
//! of processor units, all hosted on a single [`TaskHost`].
//!
//! Queued units sit in a pending set until their not-before timestamp
//! elapses, then move to a strict-FIFO ready queue consumed by 0 to
//! `max_threads` processors. The pool grows when the ready depth keeps
//! up, shrinks when processors sit idle, and shuts down entirely when
//! there is nothing left to do — the next `queue` call restarts it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::RuntimeError;
use crate::host::{HostState, StopOutcome, TaskHost};
use crate::settings::Tunables;
use crate::task::{Flow, Task, TaskState};

/// Upper bound on how long a `queue` call waits for the dispatcher to
/// come up before giving up.
const DISPATCHER_START_TIMEOUT: Duration = Duration::from_secs(5);

struct Inner {
    /// Units whose not-before timestamp has not elapsed, in submission order.
    pending: Mutex<Vec<(Arc<TaskState>, Instant)>>,
    /// Units due for execution. Strict FIFO.
    ready: Mutex<VecDeque<Arc<TaskState>>>,
    /// Currently alive processor units.
    processors: AtomicUsize,
    /// Monotonic label counter for spawned processors.
    processor_seq: AtomicUsize,
    /// True while a dispatcher unit is ticking.
    dispatcher_alive: watch::Sender<bool>,
    /// Bumped on every pool start; lets a stale idle-shutdown recognize
    /// that the pool was restarted underneath it.
    epoch: AtomicUsize,
    /// Serializes pool start against the idle shutdown.
    start_lock: tokio::sync::Mutex<()>,
}

/// Bounded, adaptively sized pool multiplexing queued units over a
/// [`TaskHost`].
pub struct Scheduler {
    name: String,
    tunables: Arc<Tunables>,
    host: Arc<TaskHost>,
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(name: impl Into<String>, tunables: Arc<Tunables>) -> Arc<Self> {
        let name = name.into();
        let host = TaskHost::new(format!("{name}-pool"), Arc::clone(&tunables));
        Arc::new(Self {
            name,
            tunables,
            host,
            inner: Arc::new(Inner {
                pending: Mutex::new(Vec::new()),
                ready: Mutex::new(VecDeque::new()),
                processors: AtomicUsize::new(0),
                processor_seq: AtomicUsize::new(0),
                dispatcher_alive: watch::Sender::new(false),
                epoch: AtomicUsize::new(0),
                start_lock: tokio::sync::Mutex::new(()),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host(&self) -> &Arc<TaskHost> {
        &self.host
    }

    /// Currently alive processor units.
    pub fn processor_count(&self) -> usize {
        self.inner.processors.load(Ordering::SeqCst)
    }

    pub fn ready_depth(&self) -> usize {
        lock(&self.inner.ready).len()
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    pub async fn is_running(&self) -> bool {
        self.host.state().await == HostState::Running
    }

    /// Enqueue a unit directly into the ready queue and return its state
    /// without waiting for completion. Starts the pool if it is stopped.
    pub async fn queue(self: &Arc<Self>, task: Task) -> Result<Arc<TaskState>, RuntimeError> {
        let unit = TaskState::new(task);
        lock(&self.inner.ready).push_back(Arc::clone(&unit));
        self.ensure_running().await?;
        Ok(unit)
    }

    /// Enqueue a unit that must not run before `not_before`.
    pub async fn queue_delayed(
        self: &Arc<Self>,
        task: Task,
        not_before: Instant,
    ) -> Result<Arc<TaskState>, RuntimeError> {
        let unit = TaskState::new(task);
        lock(&self.inner.pending).push((Arc::clone(&unit), not_before));
        self.ensure_running().await?;
        Ok(unit)
    }

    /// Stop the pool host. Queued-but-unexecuted units stay queued and run
    /// after the next restart.
    pub async fn shutdown(&self) -> Result<StopOutcome, RuntimeError> {
        self.host.stop().await
    }

    /// Start the pool if needed and wait until the dispatcher is ticking.
    async fn ensure_running(self: &Arc<Self>) -> Result<(), RuntimeError> {
        let mut alive_rx = self.inner.dispatcher_alive.subscribe();
        if !(self.host.state().await == HostState::Running && *alive_rx.borrow()) {
            let _guard = self.inner.start_lock.lock().await;
            // Re-check under the lock; another caller may have started us.
            let state = self.host.state().await;
            let alive = *alive_rx.borrow();
            if !(state == HostState::Running && alive) {
                if state != HostState::Stopped {
                    // The dispatcher initiated its idle shutdown; finish
                    // that stop before starting a fresh pool.
                    let _ = self.host.stop().await;
                }
                self.inner.processors.store(0, Ordering::SeqCst);
                self.inner.dispatcher_alive.send_replace(false);
                self.inner.epoch.fetch_add(1, Ordering::SeqCst);
                self.host.register_task(self.dispatcher_task()).await;
                self.host.start().await?;
            }
        }

        tokio::time::timeout(DISPATCHER_START_TIMEOUT, alive_rx.wait_for(|alive| *alive))
            .await
            .map_err(|_| RuntimeError::Timeout(DISPATCHER_START_TIMEOUT))?
            .map_err(|_| RuntimeError::Task("scheduler dispatcher went away".into()))?;
        Ok(())
    }

    /// Build the repeatable dispatcher unit.
    ///
    /// Each tick: promote due pending units (submission order preserved),
    /// grow the pool when the ready depth keeps up or no processor is
    /// alive, and initiate a full shutdown once everything has drained.
    fn dispatcher_task(self: &Arc<Self>) -> Task {
        let scheduler = Arc::clone(self);
        let last_depth = Arc::new(AtomicUsize::new(0));
        let growth_streak = Arc::new(AtomicU32::new(0));
        let idle_streak = Arc::new(AtomicU32::new(0));

        Task::repeating(format!("{}-dispatcher", self.name), move || {
            let scheduler = Arc::clone(&scheduler);
            let last_depth = Arc::clone(&last_depth);
            let growth_streak = Arc::clone(&growth_streak);
            let idle_streak = Arc::clone(&idle_streak);
            async move {
                scheduler.inner.dispatcher_alive.send_replace(true);

                let now = Instant::now();
                let (due, pending_empty) = {
                    let mut pending = lock(&scheduler.inner.pending);
                    let mut due = Vec::new();
                    let mut later = Vec::with_capacity(pending.len());
                    for (unit, not_before) in pending.drain(..) {
                        if not_before <= now {
                            due.push(unit);
                        } else {
                            later.push((unit, not_before));
                        }
                    }
                    *pending = later;
                    (due, pending.is_empty())
                };
                let depth = {
                    let mut ready = lock(&scheduler.inner.ready);
                    for unit in due {
                        ready.push_back(unit);
                    }
                    ready.len()
                };

                let processors = scheduler.inner.processors.load(Ordering::SeqCst);
                let previous_depth = last_depth.swap(depth, Ordering::SeqCst);

                if depth > 0 {
                    idle_streak.store(0, Ordering::SeqCst);
                    let streak = if depth >= previous_depth {
                        growth_streak.fetch_add(1, Ordering::SeqCst) + 1
                    } else {
                        growth_streak.store(0, Ordering::SeqCst);
                        0
                    };
                    let wants_processor =
                        processors == 0 || streak >= scheduler.tunables.creation_threshold();
                    if wants_processor && processors < scheduler.tunables.max_threads() {
                        growth_streak.store(0, Ordering::SeqCst);
                        scheduler.spawn_processor().await;
                    }
                    return Ok(Flow::Continue);
                }

                growth_streak.store(0, Ordering::SeqCst);
                if pending_empty && processors <= 1 {
                    let idle = idle_streak.fetch_add(1, Ordering::SeqCst) + 1;
                    if idle >= scheduler.tunables.termination_threshold() {
                        info!(scheduler = %scheduler.name, "pool idle, shutting down");
                        scheduler.inner.dispatcher_alive.send_replace(false);
                        let epoch = scheduler.inner.epoch.load(Ordering::SeqCst);
                        let stopper = Arc::clone(&scheduler);
                        tokio::spawn(async move {
                            let _guard = stopper.inner.start_lock.lock().await;
                            if stopper.inner.epoch.load(Ordering::SeqCst) != epoch {
                                return; // pool was restarted in the meantime
                            }
                            if let Err(e) = stopper.host.stop().await {
                                warn!(scheduler = %stopper.name, error = %e, "idle shutdown failed");
                            }
                        });
                        return Ok(Flow::Done);
                    }
                } else {
                    idle_streak.store(0, Ordering::SeqCst);
                }
                Ok(Flow::Continue)
            }
        })
    }

    async fn spawn_processor(self: &Arc<Self>) {
        let seq = self.inner.processor_seq.fetch_add(1, Ordering::SeqCst);
        self.inner.processors.fetch_add(1, Ordering::SeqCst);
        debug!(scheduler = %self.name, processor = seq, "spawning processor");

        let scheduler = Arc::clone(self);
        let idle_streak = Arc::new(AtomicU32::new(0));
        let task = Task::repeating(format!("{}-processor-{seq}", self.name), move || {
            let scheduler = Arc::clone(&scheduler);
            let idle_streak = Arc::clone(&idle_streak);
            async move {
                let next = lock(&scheduler.inner.ready).pop_front();
                match next {
                    Some(unit) => {
                        idle_streak.store(0, Ordering::SeqCst);
                        scheduler.execute(unit).await;
                        Ok(Flow::Continue)
                    }
                    None => {
                        let idle = idle_streak.fetch_add(1, Ordering::SeqCst) + 1;
                        if idle >= scheduler.tunables.termination_threshold() {
                            scheduler.inner.processors.fetch_sub(1, Ordering::SeqCst);
                            debug!(scheduler = %scheduler.name, "idle processor exiting");
                            Ok(Flow::Done)
                        } else {
                            Ok(Flow::Continue)
                        }
                    }
                }
            }
        });
        self.host.register_task(task).await;
    }

    /// Run one queued unit to completion, resolving its promise either way.
    ///
    /// The guard settles the promise as canceled if the processor task is
    /// aborted mid-execution, so waiters are never stranded by a forced
    /// pool shutdown.
    async fn execute(&self, unit: Arc<TaskState>) {
        unit.promise.mark_started();
        let mut guard = AbandonGuard {
            unit: Arc::clone(&unit),
            armed: true,
        };
        let result = unit.task.run_once().await;
        guard.armed = false;
        match result {
            Ok(_) => {
                unit.promise.resolve(());
            }
            Err(e) => {
                warn!(
                    scheduler = %self.name,
                    unit = %unit.task.label,
                    error = %e,
                    "queued unit failed"
                );
                unit.promise.reject(Arc::new(e));
            }
        }
    }
}

struct AbandonGuard {
    unit: Arc<TaskState>,
    armed: bool,
}

impl Drop for AbandonGuard {
    fn drop(&mut self) {
        if self.armed {
            self.unit
                .promise
                .reject(Arc::new(RuntimeError::Canceled(self.unit.task.label.clone())));
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;
    use crate::settings::TunableValues;

    fn quick_tunables(max_threads: usize) -> Arc<Tunables> {
        Tunables::fixed(TunableValues {
            max_threads,
            creation_threshold: 1,
            termination_threshold: 3,
            poll_interval_ms: 5,
            stop_timeout_ms: 500,
        })
    }

    #[tokio::test]
    async fn queued_unit_executes() {
        let scheduler = Scheduler::new("basic", quick_tunables(2));
        let hits = Arc::new(AtomicU32::new(0));
        let hits2 = Arc::clone(&hits);

        let unit = scheduler
            .queue(Task::oneshot("hit", move || {
                let hits = Arc::clone(&hits2);
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }))
            .await
            .unwrap();

        unit.promise
            .wait_timeout(Duration::from_secs(2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        let _ = scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn delayed_unit_waits_for_its_timestamp() {
        let scheduler = Scheduler::new("delayed", quick_tunables(2));
        let queued_at = Instant::now();
        let delay = Duration::from_millis(80);

        let ran_at = Arc::new(Mutex::new(None::<Instant>));
        let ran_at2 = Arc::clone(&ran_at);
        let unit = scheduler
            .queue_delayed(
                Task::oneshot("later", move || {
                    let ran_at = Arc::clone(&ran_at2);
                    async move {
                        *lock(&ran_at) = Some(Instant::now());
                        Ok(())
                    }
                }),
                queued_at + delay,
            )
            .await
            .unwrap();

        unit.promise
            .wait_timeout(Duration::from_secs(2))
            .await
            .unwrap()
            .unwrap();
        let executed = lock(&ran_at).expect("unit should have run");
        assert!(executed.duration_since(queued_at) >= delay);
        let _ = scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn failing_unit_does_not_stop_the_pool() {
        let scheduler = Scheduler::new("resilient", quick_tunables(1));
        let bad = scheduler
            .queue(Task::oneshot("bad", || async {
                Err(RuntimeError::Task("nope".into()))
            }))
            .await
            .unwrap();
        let good = scheduler
            .queue(Task::oneshot("good", || async { Ok(()) }))
            .await
            .unwrap();

        assert!(bad
            .promise
            .wait_timeout(Duration::from_secs(2))
            .await
            .unwrap()
            .is_err());
        good.promise
            .wait_timeout(Duration::from_secs(2))
            .await
            .unwrap()
            .unwrap();
        let _ = scheduler.shutdown().await;
    }
}
