//! Process-wide start/stop entry point.
//!
//! A [`Lifecycle`] owns the long-lived hosts of an application plus its
//! [`Parallel`] facade, starts them together and stops them symmetrically
//! with bounded waits, reporting which components had to be forced.

use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use crate::host::{StopOutcome, TaskHost};
use crate::parallel::Parallel;

/// Result of a [`Lifecycle::stop_all`] sweep.
#[derive(Debug, Clone, Default)]
pub struct StopReport {
    /// Components that stopped within their deadline (or were idle).
    pub stopped: Vec<String>,
    /// Components whose units had to be aborted.
    pub timed_out: Vec<String>,
}

impl StopReport {
    pub fn is_clean(&self) -> bool {
        self.timed_out.is_empty()
    }
}

/// Coordinates startup and shutdown of all long-lived components.
pub struct Lifecycle {
    parallel: Arc<Parallel>,
    hosts: Mutex<Vec<Arc<TaskHost>>>,
}

impl Lifecycle {
    pub fn new(parallel: Arc<Parallel>) -> Self {
        Self {
            parallel,
            hosts: Mutex::new(Vec::new()),
        }
    }

    pub fn parallel(&self) -> &Arc<Parallel> {
        &self.parallel
    }

    /// Put a host under lifecycle management.
    pub fn manage(&self, host: Arc<TaskHost>) {
        self.lock_hosts().push(host);
    }

    /// Start every managed host. Individual failures are logged and do not
    /// prevent the remaining hosts from starting.
    pub async fn start_all(&self) {
        let hosts = self.lock_hosts().clone();
        info!(hosts = hosts.len(), "starting managed hosts");
        for host in hosts {
            if let Err(e) = host.start().await {
                warn!(host = %host.name(), error = %e, "host failed to start");
            }
        }
    }

    /// Stop every managed host, the facade's long-lived host, and the
    /// scheduler pool, each with its bounded wait.
    pub async fn stop_all(&self) -> StopReport {
        let mut report = StopReport::default();
        let mut targets = self.lock_hosts().clone();
        targets.push(Arc::clone(self.parallel.host()));
        targets.push(Arc::clone(self.parallel.scheduler().host()));

        for host in targets {
            let name = host.name().to_string();
            match host.stop().await {
                Ok(StopOutcome::Forced) => {
                    warn!(host = %name, "host missed its stop deadline");
                    report.timed_out.push(name);
                }
                Ok(_) => report.stopped.push(name),
                Err(e) => {
                    warn!(host = %name, error = %e, "host stop failed");
                    report.timed_out.push(name);
                }
            }
        }
        info!(
            stopped = report.stopped.len(),
            timed_out = report.timed_out.len(),
            "shutdown sweep complete"
        );
        report
    }

    fn lock_hosts(&self) -> std::sync::MutexGuard<'_, Vec<Arc<TaskHost>>> {
        self.hosts.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::settings::{TunableValues, Tunables};
    use crate::task::{Flow, Task};

    fn tunables(stop_timeout_ms: u64) -> Arc<Tunables> {
        Tunables::fixed(TunableValues {
            poll_interval_ms: 5,
            stop_timeout_ms,
            ..TunableValues::default()
        })
    }

    #[tokio::test]
    async fn clean_stop_reports_no_timeouts() {
        let tunables = tunables(500);
        let lifecycle = Lifecycle::new(Parallel::new(Arc::clone(&tunables)));

        let host = TaskHost::new("svc-a", tunables);
        host.register_task(Task::repeating("tick", || async { Ok(Flow::Continue) }))
            .await;
        lifecycle.manage(Arc::clone(&host));

        lifecycle.start_all().await;
        assert_eq!(host.task_count(), 1);

        let report = lifecycle.stop_all().await;
        assert!(report.is_clean());
        assert!(report.stopped.contains(&"svc-a".to_string()));
    }

    #[tokio::test]
    async fn stuck_host_is_named_in_the_report() {
        let tunables = tunables(50);
        let lifecycle = Lifecycle::new(Parallel::new(Arc::clone(&tunables)));

        let host = TaskHost::new("svc-stuck", tunables);
        host.register_task(Task::oneshot("hang", || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }))
        .await;
        lifecycle.manage(Arc::clone(&host));

        lifecycle.start_all().await;
        let report = lifecycle.stop_all().await;
        assert!(report.timed_out.contains(&"svc-stuck".to_string()));
    }
}
