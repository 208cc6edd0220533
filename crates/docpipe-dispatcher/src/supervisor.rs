//! Worker supervisor: owns one worker child process.
//!
//! Spawns the child with its store handle and id in the environment, waits
//! on it with a heartbeat, and on a crash stamps every row the child held
//! with the error code derived from the exit code before resetting it and
//! respawning. Process isolation is what keeps a parser crash or OOM from
//! touching the dispatcher.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use docpipe_core::config::{
    ENV_FETCH_ROOT, ENV_PARSER_CONFIG, ENV_STORE_URL, ENV_WORKER_ID,
};
use docpipe_core::models::{ErrorCode, FetchEmitTuple, WorkerStatus};
use docpipe_core::PipelineConfig;
use docpipe_store::{SharedStore, TaskStore as _};

/// How often a still-running child is logged while waited on.
const HEARTBEAT: Duration = Duration::from_secs(60);

/// How long a killed child gets to die before the supervisor gives up on it.
const KILL_WAIT: Duration = Duration::from_secs(60);

/// Fetch-key stand-in for rows whose persisted tuple cannot be parsed.
const UNPARSEABLE_KEY: &str = "<unparseable>";

pub struct WorkerSupervisor {
    worker_id: i64,
    store: SharedStore,
    store_url: String,
    program: Option<PathBuf>,
    parser_config_path: Option<PathBuf>,
    fetch_root: Option<PathBuf>,
    max_restarts: u32,
    restarts: Arc<AtomicU32>,
}

impl WorkerSupervisor {
    pub fn new(
        worker_id: i64,
        store: SharedStore,
        store_url: String,
        config: &PipelineConfig,
        restarts: Arc<AtomicU32>,
    ) -> Self {
        Self {
            worker_id,
            store,
            store_url,
            program: config.worker_program.clone(),
            parser_config_path: config.parser_config_path.clone(),
            fetch_root: config.fetch_root.clone(),
            max_restarts: config.max_restarts,
            restarts,
        }
    }

    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let worker_id = self.worker_id;
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            let mut child = self.spawn_child()?;
            tracing::info!(worker_id, pid = child.id(), "worker child spawned");

            let Some(status) = self.wait_for_exit(&mut child, &cancel).await? else {
                // Forced shutdown; the child was killed, rows recover later.
                return Ok(());
            };

            if status.success() {
                // The child marks its own row SHUTDOWN before a clean exit;
                // make sure the registry agrees even if it could not.
                self.store
                    .upsert_worker(worker_id, WorkerStatus::Shutdown)
                    .await?;
                tracing::info!(worker_id, "worker child exited cleanly");
                return Ok(());
            }

            let exit_code = status.code().unwrap_or(-1);
            tracing::error!(worker_id, exit_code, "worker child crashed");
            recover_crashed_worker(&self.store, worker_id, exit_code).await?;

            let restarts = self.restarts.fetch_add(1, Ordering::SeqCst) + 1;
            if self.max_restarts > 0 && restarts > self.max_restarts {
                // Abandon: dropping the registration makes the queue visible
                // to crash recovery, which hands it to surviving workers.
                tracing::error!(worker_id, restarts, "restart ceiling exceeded, abandoning worker");
                self.store.delete_worker(worker_id).await?;
                return Ok(());
            }
            tracing::info!(worker_id, restarts, "respawning worker child");
        }
    }

    fn spawn_child(&self) -> Result<Child> {
        let program = match &self.program {
            Some(program) => program.clone(),
            None => default_worker_program()?,
        };
        let mut command = Command::new(&program);
        command
            .env(ENV_STORE_URL, &self.store_url)
            .env(ENV_WORKER_ID, self.worker_id.to_string())
            .kill_on_drop(true);
        if let Some(path) = &self.parser_config_path {
            command.env(ENV_PARSER_CONFIG, path);
        }
        if let Some(root) = &self.fetch_root {
            command.env(ENV_FETCH_ROOT, root);
        }
        command
            .spawn()
            .with_context(|| format!("failed to spawn worker child {}", program.display()))
    }

    /// Wait for the child to exit. `Ok(None)` means the wait was cancelled
    /// and the child killed.
    async fn wait_for_exit(
        &self,
        child: &mut Child,
        cancel: &CancellationToken,
    ) -> Result<Option<std::process::ExitStatus>> {
        let mut heartbeat = tokio::time::interval_at(
            tokio::time::Instant::now() + HEARTBEAT,
            HEARTBEAT,
        );
        loop {
            tokio::select! {
                status = child.wait() => {
                    return Ok(Some(status.context("failed waiting on worker child")?));
                }
                _ = heartbeat.tick() => {
                    tracing::debug!(worker_id = self.worker_id, "worker child still running");
                }
                _ = cancel.cancelled() => {
                    tracing::info!(worker_id = self.worker_id, "killing worker child");
                    child.start_kill().ok();
                    let _ = tokio::time::timeout(KILL_WAIT, child.wait()).await;
                    return Ok(None);
                }
            }
        }
    }
}

/// Flip the worker to RESTARTING, stamp each row it held with the error code
/// derived from the exit code, and return the rows to AVAILABLE.
pub async fn recover_crashed_worker(
    store: &SharedStore,
    worker_id: i64,
    exit_code: i32,
) -> Result<()> {
    store
        .upsert_worker(worker_id, WorkerStatus::Restarting)
        .await?;

    let code = ErrorCode::from_exit_code(exit_code);
    let in_flight = store.list_in_process_for_worker(worker_id).await?;
    for task in &in_flight {
        let fetch_key = FetchEmitTuple::from_json(&task.json)
            .map(|tuple| tuple.fetch_key.to_string())
            .unwrap_or_else(|_| UNPARSEABLE_KEY.to_string());
        store
            .insert_error_log(task.id, &fetch_key, task.retry_count, code)
            .await?;
        store.reset_task_to_available(task.id).await?;
    }

    if !in_flight.is_empty() {
        tracing::warn!(
            worker_id,
            recovered = in_flight.len(),
            %code,
            "reset in-flight rows of crashed worker"
        );
    }
    Ok(())
}

fn default_worker_program() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("cannot locate current executable")?;
    let dir = exe
        .parent()
        .context("current executable has no parent directory")?;
    Ok(dir.join("docpipe-worker"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use docpipe_core::models::{exit_code, EmitKey, FetchKey, TaskStatus};
    use docpipe_store::{MemoryTaskStore, TaskStore};

    fn tuple_json(key: &str) -> String {
        FetchEmitTuple::new(FetchKey::new("fs", key), EmitKey::new("stdout", key))
            .to_json()
            .unwrap()
    }

    #[tokio::test]
    async fn crash_recovery_resets_only_in_flight_rows() {
        let store: SharedStore = Arc::new(MemoryTaskStore::new());
        store.upsert_worker(1, WorkerStatus::Active).await.unwrap();
        for n in 0..5 {
            store
                .insert_task(&tuple_json(&format!("{n}.txt")), 1)
                .await
                .unwrap();
        }
        let claimed = store.claim_next_task_for_worker(1).await.unwrap().unwrap();

        recover_crashed_worker(&store, 1, exit_code::UNKNOWN)
            .await
            .unwrap();

        // The one in-flight row is AVAILABLE again with retry bumped.
        assert_eq!(store.count_available().await.unwrap(), 5);
        let ids = store.list_available_ids_for_worker(1).await.unwrap();
        assert!(ids.contains(&claimed.id));

        let errors = store.list_error_log().await.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].task_id, claimed.id);
        assert_eq!(errors[0].error_code, ErrorCode::UnknownParse);
        assert_eq!(errors[0].fetch_key, "fs:0.txt");

        assert_eq!(
            store.get_worker(1).await.unwrap().unwrap().status,
            WorkerStatus::Restarting
        );
    }

    #[tokio::test]
    async fn crash_with_no_tasks_logs_nothing() {
        let store: SharedStore = Arc::new(MemoryTaskStore::new());
        store.upsert_worker(1, WorkerStatus::Active).await.unwrap();

        recover_crashed_worker(&store, 1, exit_code::UNKNOWN)
            .await
            .unwrap();
        assert!(store.list_error_log().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn exit_codes_map_to_specific_error_codes() {
        for (exit, expected) in [
            (exit_code::OOM, ErrorCode::Oom),
            (exit_code::TIMEOUT, ErrorCode::Timeout),
            (exit_code::SECURITY, ErrorCode::Security),
            (86, ErrorCode::UnknownParse),
        ] {
            let store: SharedStore = Arc::new(MemoryTaskStore::new());
            store.insert_task(&tuple_json("a.txt"), 1).await.unwrap();
            store.claim_next_task_for_worker(1).await.unwrap().unwrap();

            recover_crashed_worker(&store, 1, exit).await.unwrap();
            let errors = store.list_error_log().await.unwrap();
            assert_eq!(errors[0].error_code, expected);
        }
    }

    #[tokio::test]
    async fn recovered_rows_are_claimable_again() {
        let store: SharedStore = Arc::new(MemoryTaskStore::new());
        let json = tuple_json("a.txt");
        store.insert_task(&json, 1).await.unwrap();
        store.claim_next_task_for_worker(1).await.unwrap().unwrap();

        recover_crashed_worker(&store, 1, exit_code::UNKNOWN)
            .await
            .unwrap();

        let reclaimed = store.claim_next_task_for_worker(1).await.unwrap().unwrap();
        assert_eq!(reclaimed.retry_count, 1);
        assert_eq!(reclaimed.json, json);

        let rows = store.list_in_process_for_worker(1).await.unwrap();
        assert_eq!(rows[0].status, TaskStatus::InProcess);
    }
}
