//! Docpipe Worker
//!
//! The worker child process. Each worker claims tasks assigned to its id,
//! fetches and parses the document, compresses the result into an emit
//! payload row, and deletes the task. Workers run out of process so that a
//! crash or out-of-memory abort in parsing cannot corrupt the dispatcher;
//! the supervisor reads the exit code to classify what happened.

pub mod env;
pub mod payload;
pub mod run;

pub use env::WorkerEnv;
pub use payload::{decode_emit_payload, encode_emit_payload};
pub use run::{run_worker, WorkerContext, WorkerFailure};
