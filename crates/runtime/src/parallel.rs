//! Facade over one scheduler and one long-lived task host.
//!
//! Constructed once at process start and passed to whatever needs to
//! submit work — there is deliberately no global singleton, so tests can
//! run isolated instances side by side.

use std::sync::Arc;
use std::time::Instant;

use tracing::warn;

use crate::error::RuntimeError;
use crate::host::{HostState, TaskHost};
use crate::scheduler::Scheduler;
use crate::settings::Tunables;
use crate::task::{Flow, Payload, Task, TaskState};

/// Entry point for scheduled and long-lived background work.
pub struct Parallel {
    tunables: Arc<Tunables>,
    scheduler: Arc<Scheduler>,
    host: Arc<TaskHost>,
}

impl Parallel {
    pub fn new(tunables: Arc<Tunables>) -> Arc<Self> {
        let scheduler = Scheduler::new("parallel", Arc::clone(&tunables));
        let host = TaskHost::new("parallel-longlived", Arc::clone(&tunables));
        Arc::new(Self {
            tunables,
            scheduler,
            host,
        })
    }

    pub fn tunables(&self) -> &Arc<Tunables> {
        &self.tunables
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// The host carrying explicitly started long-lived units.
    pub fn host(&self) -> &Arc<TaskHost> {
        &self.host
    }

    /// Fire-and-forget: run the unit on the pool as soon as a processor
    /// picks it up.
    pub async fn queue(&self, task: Task) -> Result<Arc<TaskState>, RuntimeError> {
        self.scheduler.queue(task).await
    }

    /// Fire-and-forget with a not-before timestamp.
    pub async fn queue_delayed(
        &self,
        task: Task,
        not_before: Instant,
    ) -> Result<Arc<TaskState>, RuntimeError> {
        self.scheduler.queue_delayed(task, not_before).await
    }

    /// Run a (typically repeatable) unit on the long-lived host, starting
    /// the host if it is idle.
    pub async fn start(&self, task: Task) -> Result<Arc<TaskState>, RuntimeError> {
        let unit = self.host.register_task(task).await;
        if self.host.state().await != HostState::Running {
            self.host.start().await?;
        }
        Ok(unit)
    }

    /// Parallel for over an integer range, fork/join style: one pool unit
    /// per index, caller resumes once every iteration finished.
    pub async fn for_range<F, Fut>(&self, from: i64, to: i64, body: F) -> Result<(), RuntimeError>
    where
        F: Fn(i64) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let body = Arc::new(body);
        self.for_each((from..to).collect(), move |index: Arc<i64>| {
            let body = Arc::clone(&body);
            async move { body(*index).await }
        })
        .await
    }

    /// Submit one pool unit per element and wait for all of them.
    ///
    /// Completion is observed through each unit's promise, so iterations
    /// aborted by a pool shutdown still settle the wait. Cancelling the
    /// caller abandons the wait but never stops iterations that are
    /// already queued.
    pub async fn for_each<T, F, Fut>(&self, items: Vec<T>, body: F) -> Result<(), RuntimeError>
    where
        T: Send + Sync + 'static,
        F: Fn(Arc<T>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        if items.is_empty() {
            return Ok(());
        }
        let body = Arc::new(body);

        let mut units = Vec::with_capacity(items.len());
        for item in items {
            let run = {
                let body = Arc::clone(&body);
                move |payload: Payload| {
                    let body = Arc::clone(&body);
                    async move {
                        match payload.downcast::<T>() {
                            Ok(item) => body(item).await,
                            Err(_) => warn!("for_each payload had an unexpected type"),
                        }
                        Ok(Flow::Done)
                    }
                }
            };
            units.push(
                self.scheduler
                    .queue(Task::new("parallel-for", Arc::new(item), false, run))
                    .await?,
            );
        }

        let mut first_failure = None;
        for unit in units {
            if let Err(e) = unit.promise.wait().await {
                first_failure.get_or_insert(e);
            }
        }
        match first_failure {
            None => Ok(()),
            Some(e) => Err(RuntimeError::Canceled(format!("for_each: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::error::RuntimeError;
    use crate::settings::TunableValues;

    fn facade() -> Arc<Parallel> {
        Parallel::new(Tunables::fixed(TunableValues {
            max_threads: 2,
            creation_threshold: 1,
            termination_threshold: 5,
            poll_interval_ms: 5,
            stop_timeout_ms: 500,
        }))
    }

    #[tokio::test]
    async fn for_range_visits_every_index() {
        let parallel = facade();
        let sum = Arc::new(AtomicU64::new(0));
        let sum2 = Arc::clone(&sum);

        parallel
            .for_range(0, 10, move |i| {
                let sum = Arc::clone(&sum2);
                async move {
                    sum.fetch_add(i as u64, Ordering::SeqCst);
                }
            })
            .await
            .unwrap();

        assert_eq!(sum.load(Ordering::SeqCst), 45);
        let _ = parallel.scheduler().shutdown().await;
    }

    #[tokio::test]
    async fn for_each_over_values() {
        let parallel = facade();
        let total_len = Arc::new(AtomicU64::new(0));
        let total_len2 = Arc::clone(&total_len);

        let items = vec!["ab".to_string(), "cde".to_string(), "f".to_string()];
        parallel
            .for_each(items, move |item: Arc<String>| {
                let total_len = Arc::clone(&total_len2);
                async move {
                    total_len.fetch_add(item.len() as u64, Ordering::SeqCst);
                }
            })
            .await
            .unwrap();

        assert_eq!(total_len.load(Ordering::SeqCst), 6);
        let _ = parallel.scheduler().shutdown().await;
    }

    #[tokio::test]
    async fn for_each_with_no_items_returns_immediately() {
        let parallel = facade();
        parallel
            .for_each(Vec::<u32>::new(), |_item| async {})
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn forced_pool_shutdown_settles_for_each() {
        let parallel = Parallel::new(Tunables::fixed(TunableValues {
            max_threads: 2,
            creation_threshold: 1,
            termination_threshold: 20,
            poll_interval_ms: 5,
            stop_timeout_ms: 50,
        }));

        let call = tokio::spawn({
            let parallel = Arc::clone(&parallel);
            async move {
                parallel
                    .for_each(vec![1u32, 2], |_item| async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                    })
                    .await
            }
        });

        // Let both iterations occupy the pool, then abort them.
        tokio::time::sleep(Duration::from_millis(80)).await;
        let _ = parallel.scheduler().shutdown().await;

        let result = tokio::time::timeout(Duration::from_secs(2), call)
            .await
            .expect("for_each must settle once its units are aborted")
            .unwrap();
        assert!(matches!(result, Err(RuntimeError::Canceled(_))));
    }

    #[tokio::test]
    async fn start_runs_long_lived_unit() {
        let parallel = facade();
        let beats = Arc::new(AtomicU64::new(0));
        let beats2 = Arc::clone(&beats);

        parallel
            .start(Task::repeating("heartbeat", move || {
                let beats = Arc::clone(&beats2);
                async move {
                    beats.fetch_add(1, Ordering::SeqCst);
                    Ok(Flow::Continue)
                }
            }))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(beats.load(Ordering::SeqCst) >= 2);
        parallel.host().stop().await.unwrap();
    }
}
