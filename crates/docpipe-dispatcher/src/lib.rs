//! Docpipe Dispatcher
//!
//! The coordination layer for document-processing jobs. Producers submit
//! fetch-emit tuples through a bounded intake queue; the enqueuer assigns
//! each tuple to a worker child process and persists it in the task store;
//! the assignment manager reassigns work when workers die and rebalances
//! long queues; supervisors own the worker child lifecycles; and the batched
//! emitter aggregates worker output into size/time windowed flushes to
//! downstream sinks.
//!
//! [`Pipeline`] wires the pieces together and owns the shutdown
//! choreography.

pub mod assignment;
pub mod emitter;
pub mod enqueuer;
pub mod hooks;
pub mod intake;
pub mod pipeline;
pub mod supervisor;

pub use assignment::AssignmentManager;
pub use emitter::BatchEmitter;
pub use enqueuer::Enqueuer;
pub use hooks::EmitHook;
pub use intake::{IntakeItem, IntakeQueue};
pub use pipeline::{Pipeline, PipelineStatus};
pub use supervisor::WorkerSupervisor;
