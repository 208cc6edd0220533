use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use docpipe_core::models::{
    ClaimedTask, EmitPayloadRecord, ErrorCode, ErrorLogRecord, TaskRecord, WorkerRecord,
    WorkerStatus,
};

/// Shared handle to a task store. Passed explicitly into each component's
/// constructor; no process-wide singleton exists.
pub type SharedStore = Arc<dyn TaskStore>;

/// The strictly prepared set of operations every backend must provide.
///
/// Each operation is a single statement or a short transaction. Task-row
/// state transitions are serialized per row by the backend (row locks on SQL
/// backends, a single state lock in memory), which is what makes the claim
/// and reset operations safe to call from concurrent workers.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Create the four tables if they do not exist. Idempotent.
    async fn create_schema(&self) -> Result<()>;

    // --- tasks ---

    /// Insert a new task row, status AVAILABLE, retry 0. Returns the
    /// monotonic task id assigned at insert.
    async fn insert_task(&self, json: &str, worker_id: i64) -> Result<i64>;

    /// Atomically claim the oldest AVAILABLE row assigned to `worker_id`,
    /// flipping it to IN_PROCESS. Returns `None` when the worker's queue is
    /// empty. No two callers can claim the same row.
    async fn claim_next_task_for_worker(&self, worker_id: i64) -> Result<Option<ClaimedTask>>;

    /// Remove a task row. Terminal acknowledgement for both processed tasks
    /// and tasks dropped by policy after their failure was logged.
    async fn mark_task_processed(&self, task_id: i64) -> Result<()>;

    /// Return a row to AVAILABLE and increment its retry count by one.
    async fn reset_task_to_available(&self, task_id: i64) -> Result<()>;

    /// Rows currently IN_PROCESS for a worker, oldest first. Used for crash
    /// recovery.
    async fn list_in_process_for_worker(&self, worker_id: i64) -> Result<Vec<TaskRecord>>;

    /// Ids of AVAILABLE rows assigned to a worker, oldest first. The
    /// rebalancer samples from this list.
    async fn list_available_ids_for_worker(&self, worker_id: i64) -> Result<Vec<i64>>;

    /// Re-stamp the given AVAILABLE rows onto another worker. Rows that have
    /// been claimed since listing are skipped. Returns the number moved.
    async fn reassign_tasks(&self, task_ids: &[i64], to_worker: i64) -> Result<u64>;

    /// Re-stamp all AVAILABLE rows of one worker onto another. Returns the
    /// number moved.
    async fn reassign_available(&self, from_worker: i64, to_worker: i64) -> Result<u64>;

    /// Reset IN_PROCESS rows whose owner is absent from the worker registry,
    /// incrementing retry. Recovers rows left behind by a forced shutdown.
    async fn reset_orphaned_in_process(&self) -> Result<u64>;

    async fn count_available(&self) -> Result<i64>;

    async fn count_tasks(&self) -> Result<i64>;

    /// `(worker_id, available_count)` pairs for workers owning AVAILABLE
    /// rows, count descending, worker id ascending on ties.
    async fn available_counts(&self) -> Result<Vec<(i64, i64)>>;

    // --- workers ---

    async fn upsert_worker(&self, worker_id: i64, status: WorkerStatus) -> Result<()>;

    async fn get_worker(&self, worker_id: i64) -> Result<Option<WorkerRecord>>;

    async fn list_workers(&self) -> Result<Vec<WorkerRecord>>;

    /// Ids of workers eligible for new assignments: ACTIVE only, never
    /// SHOULD_SHUTDOWN.
    async fn list_active_workers(&self) -> Result<Vec<i64>>;

    /// Remove a worker registration entirely. Used when a worker is
    /// abandoned so its queue becomes visible to crash recovery.
    async fn delete_worker(&self, worker_id: i64) -> Result<()>;

    /// Distinct task owners that are absent from the worker registry.
    async fn find_missing_workers(&self) -> Result<Vec<i64>>;

    /// Flip every ACTIVE worker to SHOULD_SHUTDOWN. Returns the number
    /// flipped.
    async fn set_active_workers_should_shutdown(&self) -> Result<u64>;

    // --- error log ---

    async fn insert_error_log(
        &self,
        task_id: i64,
        fetch_key: &str,
        retry_count: i64,
        code: ErrorCode,
    ) -> Result<()>;

    async fn list_error_log(&self) -> Result<Vec<ErrorLogRecord>>;

    // --- emit payloads ---

    /// Insert a compressed emit payload, status READY. Returns its id.
    async fn insert_emit_payload(
        &self,
        worker_id: i64,
        uncompressed_size: i64,
        bytes: &[u8],
    ) -> Result<i64>;

    /// Atomically claim up to `max` of the oldest READY rows for an emitter,
    /// flipping them to EMITTING.
    async fn claim_emit_batch(&self, worker_id: i64, max: i64) -> Result<Vec<EmitPayloadRecord>>;

    /// Revert every EMITTING row held by an emitter back to READY. Used when
    /// an emitter crashes or is restarted.
    async fn reset_emits_for_worker(&self, worker_id: i64) -> Result<u64>;

    /// Revert every EMITTING row regardless of owner. Startup recovery after
    /// a forced shutdown, when the previous emitters are all gone.
    async fn reset_stale_emitting(&self) -> Result<u64>;

    /// Revert specific rows back to READY so a later flush retries them.
    async fn reset_emits(&self, emit_ids: &[i64]) -> Result<u64>;

    /// Delete a row. This is the acknowledgement of durable emission.
    async fn delete_emit(&self, emit_id: i64) -> Result<()>;

    async fn count_emits(&self) -> Result<i64>;
}
