//! stellwerk-runtime: bounded, adaptive in-process background execution.
//!
//! The building blocks, leaf to root:
//! - [`Promise`] — single-assignment completion cell with multicast callbacks
//! - [`TaskHost`] — managed lifecycle for concurrently running units
//! - [`Scheduler`] — self-scaling pool of processor units over one host
//! - [`Parallel`] — facade combining one pool and one long-lived host
//! - [`Lifecycle`] — process-wide start/stop of all long-lived components

pub mod error;
pub mod host;
pub mod lifecycle;
pub mod parallel;
pub mod promise;
pub mod scheduler;
pub mod settings;
pub mod task;

pub use error::{RuntimeError, TaskError};
pub use host::{HostHooks, HostState, StopOutcome, TaskHost};
pub use lifecycle::{Lifecycle, StopReport};
pub use parallel::Parallel;
pub use promise::{Outcome, Promise};
pub use scheduler::Scheduler;
pub use settings::{
    MemorySettingsStore, SettingsStore, TomlSettingsStore, TunableValues, Tunables,
};
pub use task::{Flow, Payload, Task, TaskFn, TaskPromise, TaskState};
