//! Embedded SQL backend.
//!
//! SQLite serializes writers, so the claim operations are expressed as
//! single `UPDATE ... WHERE id IN (SELECT ...) RETURNING ...` statements:
//! the select-and-flip happens atomically and no two callers can claim the
//! same row. Transient `SQLITE_BUSY` lock errors are absorbed in place by
//! the connection's busy timeout.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

use docpipe_core::models::{
    ClaimedTask, EmitPayloadRecord, EmitStatus, ErrorCode, ErrorLogRecord, TaskRecord, TaskStatus,
    WorkerRecord, WorkerStatus,
};

use crate::store::TaskStore;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_CONNECTIONS: u32 = 8;

#[derive(Clone)]
pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    /// Open (creating if missing) the store at the given connection URL,
    /// e.g. `sqlite:///var/lib/docpipe/tasks.db`.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("invalid store url: {url}"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await
            .context("failed to open task store")?;

        Ok(Self { pool })
    }

    /// Connection URL for an embedded store file under `dir`.
    pub fn file_url(dir: &Path) -> String {
        format!("sqlite://{}", dir.join("docpipe.db").display())
    }

    /// Close the underlying pool. Required before an embedded store's
    /// directory can be removed on some platforms.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn create_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                status INTEGER NOT NULL,
                worker_id INTEGER NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL,
                json TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create tasks table")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_tasks_claim ON tasks (worker_id, status, updated_at)",
        )
        .execute(&self.pool)
        .await
        .context("failed to create tasks index")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workers (
                worker_id INTEGER PRIMARY KEY,
                status INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create workers table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS errors (
                task_id INTEGER NOT NULL,
                fetch_key TEXT NOT NULL,
                retry_count INTEGER NOT NULL,
                error_code INTEGER NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create errors table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS emits (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                status INTEGER NOT NULL,
                worker_id INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL,
                uncompressed_size INTEGER NOT NULL,
                bytes BLOB NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create emits table")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_emits_ready ON emits (status, updated_at)")
            .execute(&self.pool)
            .await
            .context("failed to create emits index")?;

        Ok(())
    }

    #[tracing::instrument(skip(self, json))]
    async fn insert_task(&self, json: &str, worker_id: i64) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO tasks (status, worker_id, retry_count, updated_at, json)
            VALUES (?1, ?2, 0, ?3, ?4)
            RETURNING id
            "#,
        )
        .bind(TaskStatus::Available)
        .bind(worker_id)
        .bind(Utc::now())
        .bind(json)
        .fetch_one(&self.pool)
        .await
        .context("failed to insert task")?;

        tracing::debug!(task_id = id, worker_id, "task inserted");
        Ok(id)
    }

    #[tracing::instrument(skip(self))]
    async fn claim_next_task_for_worker(&self, worker_id: i64) -> Result<Option<ClaimedTask>> {
        let claimed: Option<ClaimedTask> = sqlx::query_as(
            r#"
            UPDATE tasks
            SET status = ?1, updated_at = ?2
            WHERE id = (
                SELECT id FROM tasks
                WHERE worker_id = ?3 AND status = ?4
                ORDER BY updated_at ASC, id ASC
                LIMIT 1
            )
            RETURNING id, retry_count, json
            "#,
        )
        .bind(TaskStatus::InProcess)
        .bind(Utc::now())
        .bind(worker_id)
        .bind(TaskStatus::Available)
        .fetch_optional(&self.pool)
        .await
        .context("failed to claim next task")?;

        if let Some(ref task) = claimed {
            tracing::debug!(task_id = task.id, worker_id, "task claimed");
        }
        Ok(claimed)
    }

    #[tracing::instrument(skip(self))]
    async fn mark_task_processed(&self, task_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM tasks WHERE id = ?1")
            .bind(task_id)
            .execute(&self.pool)
            .await
            .context("failed to delete processed task")?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn reset_task_to_available(&self, task_id: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE tasks
            SET status = ?1, retry_count = retry_count + 1, updated_at = ?2
            WHERE id = ?3
            "#,
        )
        .bind(TaskStatus::Available)
        .bind(Utc::now())
        .bind(task_id)
        .execute(&self.pool)
        .await
        .context("failed to reset task to available")?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn list_in_process_for_worker(&self, worker_id: i64) -> Result<Vec<TaskRecord>> {
        sqlx::query_as(
            r#"
            SELECT id, status, worker_id, retry_count, updated_at, json
            FROM tasks
            WHERE worker_id = ?1 AND status = ?2
            ORDER BY updated_at ASC, id ASC
            "#,
        )
        .bind(worker_id)
        .bind(TaskStatus::InProcess)
        .fetch_all(&self.pool)
        .await
        .context("failed to list in-process tasks")
    }

    #[tracing::instrument(skip(self))]
    async fn list_available_ids_for_worker(&self, worker_id: i64) -> Result<Vec<i64>> {
        sqlx::query_scalar(
            r#"
            SELECT id FROM tasks
            WHERE worker_id = ?1 AND status = ?2
            ORDER BY updated_at ASC, id ASC
            "#,
        )
        .bind(worker_id)
        .bind(TaskStatus::Available)
        .fetch_all(&self.pool)
        .await
        .context("failed to list available task ids")
    }

    #[tracing::instrument(skip(self, task_ids))]
    async fn reassign_tasks(&self, task_ids: &[i64], to_worker: i64) -> Result<u64> {
        if task_ids.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; task_ids.len()].join(",");
        let sql = format!(
            "UPDATE tasks SET worker_id = ?, updated_at = ? WHERE status = ? AND id IN ({placeholders})"
        );
        let mut query = sqlx::query(&sql)
            .bind(to_worker)
            .bind(Utc::now())
            .bind(TaskStatus::Available);
        for id in task_ids {
            query = query.bind(id);
        }
        let result = query
            .execute(&self.pool)
            .await
            .context("failed to reassign tasks")?;
        Ok(result.rows_affected())
    }

    #[tracing::instrument(skip(self))]
    async fn reassign_available(&self, from_worker: i64, to_worker: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET worker_id = ?1, updated_at = ?2
            WHERE worker_id = ?3 AND status = ?4
            "#,
        )
        .bind(to_worker)
        .bind(Utc::now())
        .bind(from_worker)
        .bind(TaskStatus::Available)
        .execute(&self.pool)
        .await
        .context("failed to reassign available tasks")?;

        let moved = result.rows_affected();
        if moved > 0 {
            tracing::info!(from_worker, to_worker, moved, "reassigned task queue");
        }
        Ok(moved)
    }

    #[tracing::instrument(skip(self))]
    async fn reset_orphaned_in_process(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = ?1, retry_count = retry_count + 1, updated_at = ?2
            WHERE status = ?3
              AND worker_id NOT IN (SELECT worker_id FROM workers)
            "#,
        )
        .bind(TaskStatus::Available)
        .bind(Utc::now())
        .bind(TaskStatus::InProcess)
        .execute(&self.pool)
        .await
        .context("failed to reset orphaned in-process tasks")?;
        Ok(result.rows_affected())
    }

    async fn count_available(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM tasks WHERE status = ?1")
            .bind(TaskStatus::Available)
            .fetch_one(&self.pool)
            .await
            .context("failed to count available tasks")
    }

    async fn count_tasks(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM tasks")
            .fetch_one(&self.pool)
            .await
            .context("failed to count tasks")
    }

    async fn available_counts(&self) -> Result<Vec<(i64, i64)>> {
        sqlx::query_as(
            r#"
            SELECT worker_id, COUNT(*) AS cnt
            FROM tasks
            WHERE status = ?1
            GROUP BY worker_id
            ORDER BY cnt DESC, worker_id ASC
            "#,
        )
        .bind(TaskStatus::Available)
        .fetch_all(&self.pool)
        .await
        .context("failed to read available counts")
    }

    #[tracing::instrument(skip(self))]
    async fn upsert_worker(&self, worker_id: i64, status: WorkerStatus) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workers (worker_id, status)
            VALUES (?1, ?2)
            ON CONFLICT (worker_id) DO UPDATE SET status = excluded.status
            "#,
        )
        .bind(worker_id)
        .bind(status)
        .execute(&self.pool)
        .await
        .context("failed to upsert worker")?;

        tracing::debug!(worker_id, %status, "worker status updated");
        Ok(())
    }

    async fn get_worker(&self, worker_id: i64) -> Result<Option<WorkerRecord>> {
        sqlx::query_as("SELECT worker_id, status FROM workers WHERE worker_id = ?1")
            .bind(worker_id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to fetch worker")
    }

    async fn list_workers(&self) -> Result<Vec<WorkerRecord>> {
        sqlx::query_as("SELECT worker_id, status FROM workers ORDER BY worker_id ASC")
            .fetch_all(&self.pool)
            .await
            .context("failed to list workers")
    }

    async fn list_active_workers(&self) -> Result<Vec<i64>> {
        sqlx::query_scalar("SELECT worker_id FROM workers WHERE status = ?1 ORDER BY worker_id")
            .bind(WorkerStatus::Active)
            .fetch_all(&self.pool)
            .await
            .context("failed to list active workers")
    }

    #[tracing::instrument(skip(self))]
    async fn delete_worker(&self, worker_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM workers WHERE worker_id = ?1")
            .bind(worker_id)
            .execute(&self.pool)
            .await
            .context("failed to delete worker")?;
        Ok(())
    }

    async fn find_missing_workers(&self) -> Result<Vec<i64>> {
        sqlx::query_scalar(
            r#"
            SELECT DISTINCT worker_id FROM tasks
            WHERE worker_id NOT IN (SELECT worker_id FROM workers)
            ORDER BY worker_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to find missing workers")
    }

    #[tracing::instrument(skip(self))]
    async fn set_active_workers_should_shutdown(&self) -> Result<u64> {
        let result = sqlx::query("UPDATE workers SET status = ?1 WHERE status = ?2")
            .bind(WorkerStatus::ShouldShutdown)
            .bind(WorkerStatus::Active)
            .execute(&self.pool)
            .await
            .context("failed to signal worker shutdown")?;
        Ok(result.rows_affected())
    }

    #[tracing::instrument(skip(self))]
    async fn insert_error_log(
        &self,
        task_id: i64,
        fetch_key: &str,
        retry_count: i64,
        code: ErrorCode,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO errors (task_id, fetch_key, retry_count, error_code, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(task_id)
        .bind(fetch_key)
        .bind(retry_count)
        .bind(code)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("failed to append error log")?;

        tracing::warn!(task_id, fetch_key, retry_count, %code, "task failure logged");
        Ok(())
    }

    async fn list_error_log(&self) -> Result<Vec<ErrorLogRecord>> {
        sqlx::query_as(
            r#"
            SELECT task_id, fetch_key, retry_count, error_code, created_at
            FROM errors
            ORDER BY created_at ASC, task_id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to list error log")
    }

    #[tracing::instrument(skip(self, bytes))]
    async fn insert_emit_payload(
        &self,
        worker_id: i64,
        uncompressed_size: i64,
        bytes: &[u8],
    ) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO emits (status, worker_id, updated_at, uncompressed_size, bytes)
            VALUES (?1, ?2, ?3, ?4, ?5)
            RETURNING id
            "#,
        )
        .bind(EmitStatus::Ready)
        .bind(worker_id)
        .bind(Utc::now())
        .bind(uncompressed_size)
        .bind(bytes)
        .fetch_one(&self.pool)
        .await
        .context("failed to insert emit payload")?;

        tracing::debug!(emit_id = id, worker_id, uncompressed_size, "emit payload buffered");
        Ok(id)
    }

    #[tracing::instrument(skip(self))]
    async fn claim_emit_batch(&self, worker_id: i64, max: i64) -> Result<Vec<EmitPayloadRecord>> {
        sqlx::query_as(
            r#"
            UPDATE emits
            SET status = ?1, worker_id = ?2, updated_at = ?3
            WHERE id IN (
                SELECT id FROM emits
                WHERE status = ?4
                ORDER BY updated_at ASC, id ASC
                LIMIT ?5
            )
            RETURNING id, status, worker_id, updated_at, uncompressed_size, bytes
            "#,
        )
        .bind(EmitStatus::Emitting)
        .bind(worker_id)
        .bind(Utc::now())
        .bind(EmitStatus::Ready)
        .bind(max)
        .fetch_all(&self.pool)
        .await
        .context("failed to claim emit batch")
    }

    #[tracing::instrument(skip(self))]
    async fn reset_emits_for_worker(&self, worker_id: i64) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE emits SET status = ?1, updated_at = ?2 WHERE worker_id = ?3 AND status = ?4",
        )
        .bind(EmitStatus::Ready)
        .bind(Utc::now())
        .bind(worker_id)
        .bind(EmitStatus::Emitting)
        .execute(&self.pool)
        .await
        .context("failed to reset emits for worker")?;
        Ok(result.rows_affected())
    }

    #[tracing::instrument(skip(self))]
    async fn reset_stale_emitting(&self) -> Result<u64> {
        let result = sqlx::query("UPDATE emits SET status = ?1, updated_at = ?2 WHERE status = ?3")
            .bind(EmitStatus::Ready)
            .bind(Utc::now())
            .bind(EmitStatus::Emitting)
            .execute(&self.pool)
            .await
            .context("failed to reset stale emitting rows")?;
        Ok(result.rows_affected())
    }

    #[tracing::instrument(skip(self, emit_ids))]
    async fn reset_emits(&self, emit_ids: &[i64]) -> Result<u64> {
        if emit_ids.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; emit_ids.len()].join(",");
        let sql = format!(
            "UPDATE emits SET status = ?, updated_at = ? WHERE id IN ({placeholders})"
        );
        let mut query = sqlx::query(&sql).bind(EmitStatus::Ready).bind(Utc::now());
        for id in emit_ids {
            query = query.bind(id);
        }
        let result = query
            .execute(&self.pool)
            .await
            .context("failed to reset emits")?;
        Ok(result.rows_affected())
    }

    #[tracing::instrument(skip(self))]
    async fn delete_emit(&self, emit_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM emits WHERE id = ?1")
            .bind(emit_id)
            .execute(&self.pool)
            .await
            .context("failed to delete emit")?;
        Ok(())
    }

    async fn count_emits(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM emits")
            .fetch_one(&self.pool)
            .await
            .context("failed to count emits")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docpipe_core::models::{EmitKey, FetchEmitTuple, FetchKey};

    async fn open_store() -> SqliteTaskStore {
        // A single shared in-memory database keeps the pool's connections on
        // the same data.
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .unwrap()
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .unwrap();
        let store = SqliteTaskStore { pool };
        store.create_schema().await.unwrap();
        store
    }

    fn tuple_json() -> String {
        FetchEmitTuple::new(FetchKey::new("fs", "a.txt"), EmitKey::new("stdout", "a.txt"))
            .to_json()
            .unwrap()
    }

    #[tokio::test]
    async fn insert_and_claim() {
        let store = open_store().await;
        let id = store.insert_task(&tuple_json(), 1).await.unwrap();
        assert!(id > 0);

        let claimed = store.claim_next_task_for_worker(1).await.unwrap().unwrap();
        assert_eq!(claimed.id, id);
        assert_eq!(claimed.retry_count, 0);

        // Claimed row is IN_PROCESS; a second claim finds nothing.
        assert!(store.claim_next_task_for_worker(1).await.unwrap().is_none());
        let in_process = store.list_in_process_for_worker(1).await.unwrap();
        assert_eq!(in_process.len(), 1);
        assert_eq!(in_process[0].status, TaskStatus::InProcess);
    }

    #[tokio::test]
    async fn claim_respects_worker_assignment() {
        let store = open_store().await;
        store.insert_task(&tuple_json(), 1).await.unwrap();
        assert!(store.claim_next_task_for_worker(2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reset_increments_retry_and_reclaims_same_json() {
        let store = open_store().await;
        let json = tuple_json();
        let id = store.insert_task(&json, 1).await.unwrap();
        let first = store.claim_next_task_for_worker(1).await.unwrap().unwrap();

        store.reset_task_to_available(first.id).await.unwrap();
        let second = store.claim_next_task_for_worker(1).await.unwrap().unwrap();
        assert_eq!(second.id, id);
        assert_eq!(second.json, json);
        assert_eq!(second.retry_count, first.retry_count + 1);
    }

    #[tokio::test]
    async fn schema_creation_is_idempotent() {
        let store = open_store().await;
        store.create_schema().await.unwrap();
        store.create_schema().await.unwrap();
    }

    #[tokio::test]
    async fn missing_workers_and_reassignment() {
        let store = open_store().await;
        store.upsert_worker(2, WorkerStatus::Active).await.unwrap();
        store.insert_task(&tuple_json(), 1).await.unwrap();
        store.insert_task(&tuple_json(), 1).await.unwrap();

        assert_eq!(store.find_missing_workers().await.unwrap(), vec![1]);
        assert_eq!(store.reassign_available(1, 2).await.unwrap(), 2);
        assert!(store.find_missing_workers().await.unwrap().is_empty());
        assert_eq!(
            store.list_available_ids_for_worker(2).await.unwrap().len(),
            2
        );
    }

    #[tokio::test]
    async fn emit_batch_claim_and_delete() {
        let store = open_store().await;
        let first = store.insert_emit_payload(1, 10, b"aaaa").await.unwrap();
        let second = store.insert_emit_payload(1, 20, b"bbbb").await.unwrap();

        let batch = store.claim_emit_batch(100, 10).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].id, first);
        assert!(batch.iter().all(|row| row.status == EmitStatus::Emitting));

        // Claimed rows are invisible to another emitter.
        assert!(store.claim_emit_batch(101, 10).await.unwrap().is_empty());

        store.delete_emit(first).await.unwrap();
        store.delete_emit(second).await.unwrap();
        assert_eq!(store.count_emits().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn emitter_crash_reverts_claimed_rows() {
        let store = open_store().await;
        store.insert_emit_payload(1, 10, b"aaaa").await.unwrap();
        let batch = store.claim_emit_batch(100, 10).await.unwrap();
        assert_eq!(batch.len(), 1);

        assert_eq!(store.reset_emits_for_worker(100).await.unwrap(), 1);
        assert_eq!(store.claim_emit_batch(101, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn orphaned_in_process_rows_are_recovered() {
        let store = open_store().await;
        store.insert_task(&tuple_json(), 1).await.unwrap();
        store.claim_next_task_for_worker(1).await.unwrap().unwrap();

        // Worker 1 never registered (e.g. forced shutdown wiped the
        // registry), so its in-flight row is an orphan.
        assert_eq!(store.reset_orphaned_in_process().await.unwrap(), 1);
        let claimed = store.claim_next_task_for_worker(1).await.unwrap().unwrap();
        assert_eq!(claimed.retry_count, 1);
    }
}
