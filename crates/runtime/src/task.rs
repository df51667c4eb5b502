//! Unit-of-work model: type-erased task functions and their run state.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{RuntimeError, TaskError};
use crate::promise::Promise;

/// Untyped payload handed to a unit of work on every run.
pub type Payload = Arc<dyn Any + Send + Sync>;

/// What a repeatable unit wants after one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Run again after the host's poll interval (only if the task is repeatable).
    Continue,
    /// The unit is finished; resolve its promise.
    Done,
}

/// Boxed async function run by a task host or a scheduler processor.
pub type TaskFn = Arc<
    dyn Fn(Payload) -> Pin<Box<dyn Future<Output = Result<Flow, RuntimeError>> + Send>>
        + Send
        + Sync,
>;

/// The smallest schedulable item: a function plus payload, optionally repeatable.
pub struct Task {
    pub id: Uuid,
    pub label: String,
    pub repeat: bool,
    run: TaskFn,
    payload: Payload,
}

impl Task {
    pub fn new<F, Fut>(label: impl Into<String>, payload: Payload, repeat: bool, run: F) -> Self
    where
        F: Fn(Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Flow, RuntimeError>> + Send + 'static,
    {
        Self {
            id: Uuid::new_v4(),
            label: label.into(),
            repeat,
            run: Arc::new(move |payload| Box::pin(run(payload))),
            payload,
        }
    }

    /// One-shot unit with no payload.
    pub fn oneshot<F, Fut>(label: impl Into<String>, run: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), RuntimeError>> + Send + 'static,
    {
        Self::new(label, Arc::new(()), false, move |_| {
            let fut = run();
            async move { fut.await.map(|_| Flow::Done) }
        })
    }

    /// Repeatable unit with no payload; runs until it returns [`Flow::Done`],
    /// fails, or its host stops.
    pub fn repeating<F, Fut>(label: impl Into<String>, run: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Flow, RuntimeError>> + Send + 'static,
    {
        Self::new(label, Arc::new(()), true, move |_| run())
    }

    /// Run one iteration of the unit.
    pub(crate) async fn run_once(&self) -> Result<Flow, RuntimeError> {
        (self.run)(Arc::clone(&self.payload)).await
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("repeat", &self.repeat)
            .finish_non_exhaustive()
    }
}

/// Promise type carried by every scheduled unit.
pub type TaskPromise = Promise<(), TaskError>;

/// Binds a [`Task`] to the promise observing its completion.
pub struct TaskState {
    pub task: Task,
    pub promise: TaskPromise,
    pub created_at: DateTime<Utc>,
}

impl TaskState {
    pub fn new(task: Task) -> Arc<Self> {
        Arc::new(Self {
            task,
            promise: TaskPromise::new(),
            created_at: Utc::now(),
        })
    }

    /// The unit has started and has not yet completed.
    pub fn is_running(&self) -> bool {
        self.promise.is_running()
    }
}

impl fmt::Debug for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskState")
            .field("task", &self.task)
            .field("created_at", &self.created_at)
            .field("running", &self.is_running())
            .finish()
    }
}
