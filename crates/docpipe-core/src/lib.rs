//! Docpipe Core Library
//!
//! This crate provides the domain models, configuration, and error types that
//! are shared across all Docpipe components: the fetch-emit tuple wire format,
//! task/worker/emit-payload records and their status enums, the error-log
//! taxonomy, and the pipeline configuration.

pub mod config;
pub mod error;
pub mod models;

// Re-export commonly used types
pub use config::PipelineConfig;
pub use error::PipelineError;
pub use models::{
    EmitData, EmitKey, EmitPayloadRecord, EmitStatus, ErrorCode, ErrorLogRecord, FetchEmitTuple,
    FetchKey, Metadata, ParseExceptionPolicy, TaskRecord, TaskStatus, WorkerRecord, WorkerStatus,
};
