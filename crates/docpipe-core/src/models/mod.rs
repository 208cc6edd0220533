pub mod emit;
pub mod error_log;
pub mod task;
pub mod tuple;
pub mod worker;

pub use emit::{EmitData, EmitPayloadRecord, EmitStatus};
pub use error_log::{exit_code, ErrorCode, ErrorLogRecord};
pub use task::{ClaimedTask, TaskRecord, TaskStatus};
pub use tuple::{EmitKey, FetchEmitTuple, FetchKey, Metadata, ParseExceptionPolicy};
pub use worker::{WorkerRecord, WorkerStatus};
