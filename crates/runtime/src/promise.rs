//! Single-assignment completion cell with multicast callback delivery.
//!
//! A [`Promise`] is created when an asynchronous operation is issued and
//! resolved exactly once by whoever completes the operation. Any number of
//! waiters can attach callbacks or await the terminal outcome; each waiter
//! observes the same state exactly once.

use std::sync::Mutex;

use tokio::sync::Notify;

use crate::error::{RuntimeError, TaskError};

/// Terminal outcome delivered to every waiter.
pub type Outcome<T, E = TaskError> = Result<T, E>;

type Callback<T, E> = Box<dyn FnOnce(&Outcome<T, E>) + Send>;

enum State<T, E> {
    Waiting,
    Succeeded(T),
    Failed(E),
}

struct Inner<T, E> {
    state: State<T, E>,
    started: bool,
    waiters: Vec<Callback<T, E>>,
}

/// Single-assignment completion cell.
///
/// State transitions only `Waiting → {Succeeded, Failed}`, exactly once:
/// the first `resolve`/`reject` wins and every later call is a no-op.
/// Callbacks are drained and invoked *outside* the internal lock, so a
/// waiter can neither observe a half-updated state nor re-enter the lock.
pub struct Promise<T, E = TaskError> {
    inner: Mutex<Inner<T, E>>,
    done: Notify,
}

impl<T, E> Default for Promise<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> Promise<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: State::Waiting,
                started: false,
                waiters: Vec::new(),
            }),
            done: Notify::new(),
        }
    }

    /// Register a callback for the terminal outcome.
    ///
    /// If the promise is already complete the callback fires synchronously
    /// on the calling thread; otherwise it is appended and fires exactly
    /// once when the promise completes. Multiple registrations are allowed.
    pub fn on_complete<F>(&self, callback: F)
    where
        F: FnOnce(&Outcome<T, E>) + Send + 'static,
    {
        let pending = {
            let mut inner = self.lock();
            if let Some(outcome) = Self::outcome_of(&inner.state) {
                Some((callback, outcome))
            } else {
                inner.waiters.push(Box::new(callback));
                None
            }
        };
        if let Some((callback, outcome)) = pending {
            callback(&outcome);
        }
    }

    /// Simplified registration: success delivers the value, any failure
    /// delivers `fallback` instead.
    pub fn on_success<F>(&self, callback: F, fallback: T)
    where
        F: FnOnce(T) + Send + 'static,
    {
        self.on_complete(move |outcome| match outcome {
            Ok(value) => callback(value.clone()),
            Err(_) => callback(fallback),
        });
    }

    /// Flip the not-yet-running flag. No-op once the promise is terminal.
    pub fn mark_started(&self) {
        let mut inner = self.lock();
        if matches!(inner.state, State::Waiting) {
            inner.started = true;
        }
    }

    /// The unit has started but not yet reached a terminal state.
    pub fn is_running(&self) -> bool {
        let inner = self.lock();
        inner.started && matches!(inner.state, State::Waiting)
    }

    pub fn is_complete(&self) -> bool {
        !matches!(self.lock().state, State::Waiting)
    }

    /// Terminal outcome, if any.
    pub fn outcome(&self) -> Option<Outcome<T, E>> {
        Self::outcome_of(&self.lock().state)
    }

    /// Complete with a value. Returns `true` if this call won the
    /// transition, `false` if the promise was already terminal.
    pub fn resolve(&self, value: T) -> bool {
        self.complete(State::Succeeded(value))
    }

    /// Complete with a failure. First caller wins, same as [`resolve`].
    ///
    /// [`resolve`]: Promise::resolve
    pub fn reject(&self, error: E) -> bool {
        self.complete(State::Failed(error))
    }

    /// Await the terminal outcome.
    pub async fn wait(&self) -> Outcome<T, E> {
        loop {
            let notified = self.done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(outcome) = self.outcome() {
                return outcome;
            }
            notified.await;
        }
    }

    /// Await the terminal outcome, giving up after `limit`.
    pub async fn wait_timeout(
        &self,
        limit: std::time::Duration,
    ) -> Result<Outcome<T, E>, RuntimeError> {
        tokio::time::timeout(limit, self.wait())
            .await
            .map_err(|_| RuntimeError::Timeout(limit))
    }

    fn complete(&self, terminal: State<T, E>) -> bool {
        let outcome = match &terminal {
            State::Waiting => return false,
            State::Succeeded(value) => Ok(value.clone()),
            State::Failed(error) => Err(error.clone()),
        };
        let waiters = {
            let mut inner = self.lock();
            if !matches!(inner.state, State::Waiting) {
                return false;
            }
            inner.state = terminal;
            inner.started = true;
            std::mem::take(&mut inner.waiters)
        };
        for waiter in waiters {
            waiter(&outcome);
        }
        self.done.notify_waiters();
        true
    }

    fn outcome_of(state: &State<T, E>) -> Option<Outcome<T, E>> {
        match state {
            State::Waiting => None,
            State::Succeeded(value) => Some(Ok(value.clone())),
            State::Failed(error) => Some(Err(error.clone())),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<T, E>> {
        // Waiter callbacks run outside the critical section, so a poisoned
        // lock can only mean a panic between plain field updates; the state
        // itself is still coherent.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
