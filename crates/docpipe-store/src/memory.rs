//! In-memory backend.
//!
//! Keeps the full store contract behind a single state lock so the
//! dispatcher's concurrency behavior can be exercised in tests without a
//! database file. Claim atomicity holds because every operation runs under
//! the lock.

use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;

use docpipe_core::models::{
    ClaimedTask, EmitPayloadRecord, EmitStatus, ErrorCode, ErrorLogRecord, TaskRecord, TaskStatus,
    WorkerRecord, WorkerStatus,
};

use crate::store::TaskStore;

#[derive(Default)]
struct State {
    next_task_id: i64,
    next_emit_id: i64,
    tasks: BTreeMap<i64, TaskRecord>,
    workers: BTreeMap<i64, WorkerStatus>,
    errors: Vec<ErrorLogRecord>,
    emits: BTreeMap<i64, EmitPayloadRecord>,
}

#[derive(Default)]
pub struct MemoryTaskStore {
    state: Mutex<State>,
    /// When set, every operation fails. Lets tests exercise the
    /// store-unreachable paths.
    fail: std::sync::atomic::AtomicBool,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail (or recover when `false`).
    pub fn set_unreachable(&self, unreachable: bool) {
        self.fail
            .store(unreachable, std::sync::atomic::Ordering::SeqCst);
    }

    fn state(&self) -> Result<std::sync::MutexGuard<'_, State>> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            bail!("task store unreachable");
        }
        Ok(self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()))
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn create_schema(&self) -> Result<()> {
        self.state()?;
        Ok(())
    }

    async fn insert_task(&self, json: &str, worker_id: i64) -> Result<i64> {
        let mut state = self.state()?;
        state.next_task_id += 1;
        let id = state.next_task_id;
        state.tasks.insert(
            id,
            TaskRecord {
                id,
                status: TaskStatus::Available,
                worker_id,
                retry_count: 0,
                updated_at: Utc::now(),
                json: json.to_string(),
            },
        );
        Ok(id)
    }

    async fn claim_next_task_for_worker(&self, worker_id: i64) -> Result<Option<ClaimedTask>> {
        let mut state = self.state()?;
        let candidate = state
            .tasks
            .values()
            .filter(|task| task.worker_id == worker_id && task.status == TaskStatus::Available)
            .min_by_key(|task| (task.updated_at, task.id))
            .map(|task| task.id);

        let Some(task) = candidate.and_then(|id| state.tasks.get_mut(&id)) else {
            return Ok(None);
        };
        task.status = TaskStatus::InProcess;
        task.updated_at = Utc::now();
        Ok(Some(ClaimedTask {
            id: task.id,
            retry_count: task.retry_count,
            json: task.json.clone(),
        }))
    }

    async fn mark_task_processed(&self, task_id: i64) -> Result<()> {
        self.state()?.tasks.remove(&task_id);
        Ok(())
    }

    async fn reset_task_to_available(&self, task_id: i64) -> Result<()> {
        let mut state = self.state()?;
        if let Some(task) = state.tasks.get_mut(&task_id) {
            task.status = TaskStatus::Available;
            task.retry_count += 1;
            task.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn list_in_process_for_worker(&self, worker_id: i64) -> Result<Vec<TaskRecord>> {
        let state = self.state()?;
        let mut rows: Vec<TaskRecord> = state
            .tasks
            .values()
            .filter(|task| task.worker_id == worker_id && task.status == TaskStatus::InProcess)
            .cloned()
            .collect();
        rows.sort_by_key(|task| (task.updated_at, task.id));
        Ok(rows)
    }

    async fn list_available_ids_for_worker(&self, worker_id: i64) -> Result<Vec<i64>> {
        let state = self.state()?;
        let mut rows: Vec<(chrono::DateTime<Utc>, i64)> = state
            .tasks
            .values()
            .filter(|task| task.worker_id == worker_id && task.status == TaskStatus::Available)
            .map(|task| (task.updated_at, task.id))
            .collect();
        rows.sort();
        Ok(rows.into_iter().map(|(_, id)| id).collect())
    }

    async fn reassign_tasks(&self, task_ids: &[i64], to_worker: i64) -> Result<u64> {
        let mut state = self.state()?;
        let mut moved = 0;
        for id in task_ids {
            if let Some(task) = state.tasks.get_mut(id) {
                if task.status == TaskStatus::Available {
                    task.worker_id = to_worker;
                    task.updated_at = Utc::now();
                    moved += 1;
                }
            }
        }
        Ok(moved)
    }

    async fn reassign_available(&self, from_worker: i64, to_worker: i64) -> Result<u64> {
        let mut state = self.state()?;
        let mut moved = 0;
        for task in state.tasks.values_mut() {
            if task.worker_id == from_worker && task.status == TaskStatus::Available {
                task.worker_id = to_worker;
                task.updated_at = Utc::now();
                moved += 1;
            }
        }
        Ok(moved)
    }

    async fn reset_orphaned_in_process(&self) -> Result<u64> {
        let mut state = self.state()?;
        let registered: Vec<i64> = state.workers.keys().copied().collect();
        let mut reset = 0;
        for task in state.tasks.values_mut() {
            if task.status == TaskStatus::InProcess && !registered.contains(&task.worker_id) {
                task.status = TaskStatus::Available;
                task.retry_count += 1;
                task.updated_at = Utc::now();
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn count_available(&self) -> Result<i64> {
        let state = self.state()?;
        Ok(state
            .tasks
            .values()
            .filter(|task| task.status == TaskStatus::Available)
            .count() as i64)
    }

    async fn count_tasks(&self) -> Result<i64> {
        Ok(self.state()?.tasks.len() as i64)
    }

    async fn available_counts(&self) -> Result<Vec<(i64, i64)>> {
        let state = self.state()?;
        let mut counts: BTreeMap<i64, i64> = BTreeMap::new();
        for task in state.tasks.values() {
            if task.status == TaskStatus::Available {
                *counts.entry(task.worker_id).or_default() += 1;
            }
        }
        let mut rows: Vec<(i64, i64)> = counts.into_iter().collect();
        rows.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        Ok(rows)
    }

    async fn upsert_worker(&self, worker_id: i64, status: WorkerStatus) -> Result<()> {
        self.state()?.workers.insert(worker_id, status);
        Ok(())
    }

    async fn get_worker(&self, worker_id: i64) -> Result<Option<WorkerRecord>> {
        Ok(self
            .state()?
            .workers
            .get(&worker_id)
            .map(|status| WorkerRecord {
                worker_id,
                status: *status,
            }))
    }

    async fn list_workers(&self) -> Result<Vec<WorkerRecord>> {
        Ok(self
            .state()?
            .workers
            .iter()
            .map(|(worker_id, status)| WorkerRecord {
                worker_id: *worker_id,
                status: *status,
            })
            .collect())
    }

    async fn list_active_workers(&self) -> Result<Vec<i64>> {
        Ok(self
            .state()?
            .workers
            .iter()
            .filter(|(_, status)| **status == WorkerStatus::Active)
            .map(|(worker_id, _)| *worker_id)
            .collect())
    }

    async fn delete_worker(&self, worker_id: i64) -> Result<()> {
        self.state()?.workers.remove(&worker_id);
        Ok(())
    }

    async fn find_missing_workers(&self) -> Result<Vec<i64>> {
        let state = self.state()?;
        let mut missing: Vec<i64> = state
            .tasks
            .values()
            .map(|task| task.worker_id)
            .filter(|worker_id| !state.workers.contains_key(worker_id))
            .collect();
        missing.sort_unstable();
        missing.dedup();
        Ok(missing)
    }

    async fn set_active_workers_should_shutdown(&self) -> Result<u64> {
        let mut state = self.state()?;
        let mut flipped = 0;
        for status in state.workers.values_mut() {
            if *status == WorkerStatus::Active {
                *status = WorkerStatus::ShouldShutdown;
                flipped += 1;
            }
        }
        Ok(flipped)
    }

    async fn insert_error_log(
        &self,
        task_id: i64,
        fetch_key: &str,
        retry_count: i64,
        code: ErrorCode,
    ) -> Result<()> {
        self.state()?.errors.push(ErrorLogRecord {
            task_id,
            fetch_key: fetch_key.to_string(),
            retry_count,
            error_code: code,
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn list_error_log(&self) -> Result<Vec<ErrorLogRecord>> {
        Ok(self.state()?.errors.clone())
    }

    async fn insert_emit_payload(
        &self,
        worker_id: i64,
        uncompressed_size: i64,
        bytes: &[u8],
    ) -> Result<i64> {
        let mut state = self.state()?;
        state.next_emit_id += 1;
        let id = state.next_emit_id;
        state.emits.insert(
            id,
            EmitPayloadRecord {
                id,
                status: EmitStatus::Ready,
                worker_id,
                updated_at: Utc::now(),
                uncompressed_size,
                bytes: bytes.to_vec(),
            },
        );
        Ok(id)
    }

    async fn claim_emit_batch(&self, worker_id: i64, max: i64) -> Result<Vec<EmitPayloadRecord>> {
        let mut state = self.state()?;
        let mut ready: Vec<(chrono::DateTime<Utc>, i64)> = state
            .emits
            .values()
            .filter(|row| row.status == EmitStatus::Ready)
            .map(|row| (row.updated_at, row.id))
            .collect();
        ready.sort();
        ready.truncate(max.max(0) as usize);

        let mut claimed = Vec::with_capacity(ready.len());
        for (_, id) in ready {
            if let Some(row) = state.emits.get_mut(&id) {
                row.status = EmitStatus::Emitting;
                row.worker_id = worker_id;
                row.updated_at = Utc::now();
                claimed.push(row.clone());
            }
        }
        Ok(claimed)
    }

    async fn reset_emits_for_worker(&self, worker_id: i64) -> Result<u64> {
        let mut state = self.state()?;
        let mut reset = 0;
        for row in state.emits.values_mut() {
            if row.worker_id == worker_id && row.status == EmitStatus::Emitting {
                row.status = EmitStatus::Ready;
                row.updated_at = Utc::now();
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn reset_stale_emitting(&self) -> Result<u64> {
        let mut state = self.state()?;
        let mut reset = 0;
        for row in state.emits.values_mut() {
            if row.status == EmitStatus::Emitting {
                row.status = EmitStatus::Ready;
                row.updated_at = Utc::now();
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn reset_emits(&self, emit_ids: &[i64]) -> Result<u64> {
        let mut state = self.state()?;
        let mut reset = 0;
        for id in emit_ids {
            if let Some(row) = state.emits.get_mut(id) {
                row.status = EmitStatus::Ready;
                row.updated_at = Utc::now();
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn delete_emit(&self, emit_id: i64) -> Result<()> {
        self.state()?.emits.remove(&emit_id);
        Ok(())
    }

    async fn count_emits(&self) -> Result<i64> {
        Ok(self.state()?.emits.len() as i64)
    }
}
