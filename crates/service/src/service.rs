//! Coalescing dispatcher wrapped around a single [`Handler`].
//!
//! Every request is fingerprinted; the first caller for a fingerprint
//! becomes the execution's owner, later equal-fingerprint callers attach
//! to the owner's promise. Completed executions stay attachable for the
//! handler's cache window, then the slot is evicted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use stellwerk_runtime::{Parallel, Promise, Task};

use crate::error::ServiceError;
use crate::handler::Handler;

/// Promise shared by every caller attached to one coalesced execution.
pub type ResponsePromise<H> = Promise<<H as Handler>::Response, Arc<ServiceError>>;

/// How a caller's response was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// This caller owned the execution.
    Executed,
    /// Attached to an execution that was still in flight.
    Coalesced,
    /// Served by a completed execution inside its cache window.
    Cached,
}

struct ExecutionSlot<H: Handler> {
    /// Identifies one ownership generation of the slot, so a delayed
    /// eviction never removes a successor execution under the same
    /// fingerprint.
    epoch: Uuid,
    /// The request that claimed the slot; handed to attached callers.
    request: H::Request,
    promise: Arc<ResponsePromise<H>>,
}

enum Claim<H: Handler> {
    Owner {
        promise: Arc<ResponsePromise<H>>,
        epoch: Uuid,
    },
    Attached {
        promise: Arc<ResponsePromise<H>>,
        origin: Origin,
        origin_request: H::Request,
    },
}

/// Settles and frees a claimed slot if the owning future is dropped
/// before the execution could settle it, so attached callers are never
/// left waiting on an execution nobody is running.
struct SlotGuard<H: Handler> {
    service: Arc<Service<H>>,
    fingerprint: i64,
    epoch: Uuid,
    promise: Arc<ResponsePromise<H>>,
    armed: bool,
}

impl<H: Handler> Drop for SlotGuard<H> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let reason = Arc::new(ServiceError::Canceled(format!(
            "{}: owner abandoned the execution",
            self.service.name
        )));
        self.promise.reject(reason);
        self.service.evict(self.fingerprint, self.epoch);
    }
}

/// One settled dispatch: the response plus the request that actually
/// drove the execution (for coalesced and cached callers that request
/// is the owner's, not their own).
pub struct Dispatched<H: Handler> {
    pub response: H::Response,
    pub origin_request: H::Request,
    pub origin: Origin,
}

impl<H: Handler> std::fmt::Debug for Dispatched<H>
where
    H::Response: std::fmt::Debug,
    H::Request: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatched")
            .field("response", &self.response)
            .field("origin_request", &self.origin_request)
            .field("origin", &self.origin)
            .finish()
    }
}

/// Point-in-time counters for one service.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub id: u64,
    pub name: String,
    pub aliases: Vec<String>,
    /// Requests accepted, including coalesced and cached ones.
    pub invocations: u64,
    /// Handler executions actually performed.
    pub executions: u64,
    pub total_execution_ms: u64,
    /// Fingerprints with an execution currently running.
    pub in_flight: usize,
    pub captured_at: DateTime<Utc>,
}

/// A registered handler plus its coalescing and caching state.
pub struct Service<H: Handler> {
    id: u64,
    name: String,
    handler: Arc<H>,
    parallel: Arc<Parallel>,
    execution_timeout: Option<Duration>,
    slots: Mutex<HashMap<i64, ExecutionSlot<H>>>,
    invoked: AtomicU64,
    executed: AtomicU64,
    execution_ms: AtomicU64,
}

impl<H: Handler> Service<H> {
    pub(crate) fn new(
        id: u64,
        handler: Arc<H>,
        parallel: Arc<Parallel>,
        execution_timeout: Option<Duration>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            name: handler.name(),
            handler,
            parallel,
            execution_timeout,
            slots: Mutex::new(HashMap::new()),
            invoked: AtomicU64::new(0),
            executed: AtomicU64::new(0),
            execution_ms: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Dispatch a request and wait for its response.
    pub async fn process(
        self: &Arc<Self>,
        request: H::Request,
    ) -> Result<Dispatched<H>, ServiceError> {
        self.invoked.fetch_add(1, Ordering::SeqCst);
        let fingerprint = self
            .handler
            .fingerprint(&request)
            .map_err(|e| ServiceError::NotProceeded(e.to_string()))?;

        match self.claim(fingerprint, &request) {
            Claim::Owner { promise, epoch } => {
                let response = self
                    .execute_owned(fingerprint, epoch, request.clone(), promise)
                    .await?;
                Ok(Dispatched {
                    response,
                    origin_request: request,
                    origin: Origin::Executed,
                })
            }
            Claim::Attached {
                promise,
                origin,
                origin_request,
            } => match promise.wait().await {
                Ok(response) => Ok(Dispatched {
                    response,
                    origin_request,
                    origin,
                }),
                Err(error) => Err(ServiceError::Shared(error)),
            },
        }
    }

    /// Dispatch a request on the background pool and return the shared
    /// promise immediately. Coalesced callers receive the exact same
    /// promise instance as the owner.
    pub async fn process_async(
        self: &Arc<Self>,
        request: H::Request,
    ) -> Result<Arc<ResponsePromise<H>>, ServiceError> {
        self.invoked.fetch_add(1, Ordering::SeqCst);
        let fingerprint = self
            .handler
            .fingerprint(&request)
            .map_err(|e| ServiceError::NotProceeded(e.to_string()))?;

        match self.claim(fingerprint, &request) {
            Claim::Attached { promise, .. } => Ok(promise),
            Claim::Owner { promise, epoch } => {
                let service = Arc::clone(self);
                let owned = Arc::clone(&promise);
                let submitted = self
                    .parallel
                    .queue(Task::oneshot(format!("service-{}", self.name), move || {
                        let service = Arc::clone(&service);
                        let owned = Arc::clone(&owned);
                        let request = request.clone();
                        async move {
                            let _ = service
                                .execute_owned(fingerprint, epoch, request, owned)
                                .await;
                            Ok(())
                        }
                    }))
                    .await;
                if let Err(e) = submitted {
                    // A submission failure must settle the slot, or the
                    // fingerprint stays wedged for every later caller.
                    let reason = self.fail_slot(
                        fingerprint,
                        epoch,
                        &promise,
                        ServiceError::NotProceeded(e.to_string()),
                    );
                    return Err(ServiceError::Shared(reason));
                }
                Ok(promise)
            }
        }
    }

    /// Reject a claimed slot's promise and free the slot.
    fn fail_slot(
        &self,
        fingerprint: i64,
        epoch: Uuid,
        promise: &ResponsePromise<H>,
        error: ServiceError,
    ) -> Arc<ServiceError> {
        let shared = Arc::new(error);
        promise.reject(Arc::clone(&shared));
        self.evict(fingerprint, epoch);
        shared
    }

    pub fn stats(&self) -> ServiceStats {
        let in_flight = self
            .lock_slots()
            .values()
            .filter(|slot| !slot.promise.is_complete())
            .count();
        ServiceStats {
            id: self.id,
            name: self.name.clone(),
            aliases: self.handler.aliases(),
            invocations: self.invoked.load(Ordering::SeqCst),
            executions: self.executed.load(Ordering::SeqCst),
            total_execution_ms: self.execution_ms.load(Ordering::SeqCst),
            in_flight,
            captured_at: Utc::now(),
        }
    }

    /// Attach to the slot for `fingerprint`, or become its owner.
    fn claim(&self, fingerprint: i64, request: &H::Request) -> Claim<H> {
        let mut slots = self.lock_slots();
        if let Some(slot) = slots.get(&fingerprint) {
            let origin = if slot.promise.is_complete() {
                Origin::Cached
            } else {
                Origin::Coalesced
            };
            return Claim::Attached {
                promise: Arc::clone(&slot.promise),
                origin,
                origin_request: slot.request.clone(),
            };
        }
        let promise = Arc::new(ResponsePromise::<H>::new());
        let epoch = Uuid::new_v4();
        slots.insert(
            fingerprint,
            ExecutionSlot {
                epoch,
                request: request.clone(),
                promise: Arc::clone(&promise),
            },
        );
        Claim::Owner { promise, epoch }
    }

    /// Run the handler as the slot's owner and settle the shared promise.
    async fn execute_owned(
        self: &Arc<Self>,
        fingerprint: i64,
        epoch: Uuid,
        request: H::Request,
        promise: Arc<ResponsePromise<H>>,
    ) -> Result<H::Response, ServiceError> {
        self.executed.fetch_add(1, Ordering::SeqCst);
        promise.mark_started();
        let mut guard = SlotGuard {
            service: Arc::clone(self),
            fingerprint,
            epoch,
            promise: Arc::clone(&promise),
            armed: true,
        };
        let started = Instant::now();

        let result = match self.execution_timeout {
            Some(limit) => {
                match tokio::time::timeout(limit, self.handler.execute(request.clone())).await {
                    Ok(result) => result,
                    Err(_) => Err(ServiceError::Timeout(limit)),
                }
            }
            None => self.handler.execute(request.clone()).await,
        };
        self.execution_ms
            .fetch_add(started.elapsed().as_millis() as u64, Ordering::SeqCst);
        guard.armed = false;

        match result {
            Ok(response) => {
                promise.resolve(response.clone());
                let window = self.handler.cache_window(&request, &response);
                if window.is_zero() {
                    self.evict(fingerprint, epoch);
                } else {
                    let service = Arc::clone(self);
                    tokio::spawn(async move {
                        tokio::time::sleep(window).await;
                        service.evict(fingerprint, epoch);
                    });
                }
                Ok(response)
            }
            Err(error) => {
                warn!(service = %self.name, error = %error, "execution failed");
                let shared = Arc::new(error);
                promise.reject(Arc::clone(&shared));
                // Failures are never cached.
                self.evict(fingerprint, epoch);
                Err(ServiceError::Shared(shared))
            }
        }
    }

    /// Remove the slot if it still belongs to `epoch`.
    fn evict(&self, fingerprint: i64, epoch: Uuid) {
        let mut slots = self.lock_slots();
        if slots
            .get(&fingerprint)
            .is_some_and(|slot| slot.epoch == epoch)
        {
            slots.remove(&fingerprint);
            debug!(service = %self.name, fingerprint, "slot evicted");
        }
    }

    fn lock_slots(&self) -> std::sync::MutexGuard<'_, HashMap<i64, ExecutionSlot<H>>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }
}
