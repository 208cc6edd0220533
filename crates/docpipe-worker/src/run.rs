//! The worker claim-parse-emit loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use docpipe_core::models::{
    exit_code, ClaimedTask, EmitData, ErrorCode, FetchEmitTuple, ParseExceptionPolicy, WorkerStatus,
};
use docpipe_plugins::{FetcherRegistry, Parser};
use docpipe_store::{SharedStore, TaskStore as _};

use crate::payload::encode_emit_payload;

/// How long an idle worker sleeps between claim attempts.
const EMPTY_POLL: Duration = Duration::from_millis(100);

/// Attempts per store operation before the worker gives up and exits.
const STORE_ATTEMPTS: u32 = 3;
const STORE_BACKOFF: Duration = Duration::from_millis(200);

/// Fetch-key stand-in for rows whose persisted tuple cannot be parsed.
const UNPARSEABLE_KEY: &str = "<unparseable>";

/// Failures that terminate the worker process. The exit code tells the
/// supervisor how to stamp the rows left in process.
#[derive(Debug, thiserror::Error)]
pub enum WorkerFailure {
    #[error("task {task_id} exceeded the parse timeout")]
    ParseTimeout { task_id: i64 },

    #[error("task store unavailable: {0}")]
    StoreUnavailable(String),
}

impl WorkerFailure {
    pub fn exit_code(&self) -> i32 {
        match self {
            WorkerFailure::ParseTimeout { .. } => exit_code::TIMEOUT,
            WorkerFailure::StoreUnavailable(_) => exit_code::UNKNOWN,
        }
    }
}

/// Everything a worker loop needs; handed in explicitly, no globals.
pub struct WorkerContext {
    pub worker_id: i64,
    pub store: SharedStore,
    pub fetchers: FetcherRegistry,
    pub parser: Arc<dyn Parser>,
    pub max_retries: i64,
    pub parse_timeout: Duration,
}

/// Run the claim loop until the worker's own registry row flips to
/// SHOULD_SHUTDOWN (clean exit), the token is cancelled, or a fatal failure
/// occurs. The caller maps a [`WorkerFailure`] to the matching process exit
/// code.
pub async fn run_worker(
    ctx: WorkerContext,
    cancel: CancellationToken,
) -> Result<(), WorkerFailure> {
    let worker_id = ctx.worker_id;
    store_retry(|| ctx.store.upsert_worker(worker_id, WorkerStatus::Active)).await?;
    tracing::info!(worker_id, "worker registered");

    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }

        let claimed = store_retry(|| ctx.store.claim_next_task_for_worker(worker_id)).await?;
        match claimed {
            Some(task) => process_task(&ctx, task).await?,
            None => {
                let worker = store_retry(|| ctx.store.get_worker(worker_id)).await?;
                if worker.map(|w| w.status) == Some(WorkerStatus::ShouldShutdown) {
                    store_retry(|| ctx.store.upsert_worker(worker_id, WorkerStatus::Shutdown))
                        .await?;
                    tracing::info!(worker_id, "worker shutting down");
                    return Ok(());
                }
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = sleep(EMPTY_POLL) => {}
                }
            }
        }
    }
}

async fn process_task(ctx: &WorkerContext, task: ClaimedTask) -> Result<(), WorkerFailure> {
    let worker_id = ctx.worker_id;

    let tuple = match FetchEmitTuple::from_json(&task.json) {
        Ok(tuple) => tuple,
        Err(err) => {
            // A row whose tuple no longer parses can never make progress.
            tracing::error!(task_id = task.id, error = %err, "persisted tuple is unreadable");
            store_retry(|| {
                ctx.store.insert_error_log(
                    task.id,
                    UNPARSEABLE_KEY,
                    task.retry_count,
                    ErrorCode::UnknownParse,
                )
            })
            .await?;
            store_retry(|| ctx.store.mark_task_processed(task.id)).await?;
            return Ok(());
        }
    };

    let fetch_key = tuple.fetch_key.to_string();
    let data = match fetch(ctx, &task, &tuple).await? {
        Some(data) => data,
        // The fetch failure was already accounted for (retry or terminal).
        None => return Ok(()),
    };

    let parse = tokio::time::timeout(
        ctx.parse_timeout,
        ctx.parser.parse(&data, &tuple.metadata),
    )
    .await;

    let records = match parse {
        Err(_) => {
            // Leave the row in process; the supervisor resets it once this
            // process exits with the timeout code.
            tracing::error!(task_id = task.id, %fetch_key, "parse timed out");
            return Err(WorkerFailure::ParseTimeout { task_id: task.id });
        }
        Ok(Err(err)) => {
            tracing::warn!(task_id = task.id, %fetch_key, error = %err, "parse failed");
            match tuple.on_parse_exception {
                ParseExceptionPolicy::Skip => {
                    store_retry(|| {
                        ctx.store.insert_error_log(
                            task.id,
                            &fetch_key,
                            task.retry_count,
                            ErrorCode::UnknownParse,
                        )
                    })
                    .await?;
                    store_retry(|| ctx.store.mark_task_processed(task.id)).await?;
                    return Ok(());
                }
                ParseExceptionPolicy::EmitEmpty => Vec::new(),
            }
        }
        Ok(Ok(records)) => records,
    };

    let emit_data = EmitData::new(tuple.emit_key.clone(), records);
    let (uncompressed_size, bytes) = encode_emit_payload(&emit_data)
        .map_err(|err| WorkerFailure::StoreUnavailable(err.to_string()))?;

    store_retry(|| {
        ctx.store
            .insert_emit_payload(worker_id, uncompressed_size, &bytes)
    })
    .await?;
    store_retry(|| ctx.store.mark_task_processed(task.id)).await?;

    tracing::debug!(task_id = task.id, emit_key = %tuple.emit_key, "task processed");
    Ok(())
}

/// Fetch the source bytes. `Ok(None)` means the failure was handled here:
/// the task was reset for another attempt or terminally dropped.
async fn fetch(
    ctx: &WorkerContext,
    task: &ClaimedTask,
    tuple: &FetchEmitTuple,
) -> Result<Option<Vec<u8>>, WorkerFailure> {
    let fetch_key = tuple.fetch_key.to_string();

    let Some(fetcher) = ctx.fetchers.get(&tuple.fetch_key.fetcher_id) else {
        tracing::error!(task_id = task.id, %fetch_key, "no fetcher registered for id");
        terminal_fetch_failure(ctx, task, &fetch_key).await?;
        return Ok(None);
    };

    match fetcher.fetch(&tuple.fetch_key.key).await {
        Ok(data) => Ok(Some(data)),
        Err(err) if err.is_transient() && task.retry_count < ctx.max_retries => {
            tracing::warn!(
                task_id = task.id,
                %fetch_key,
                retry_count = task.retry_count,
                error = %err,
                "fetch failed, retrying"
            );
            store_retry(|| ctx.store.reset_task_to_available(task.id)).await?;
            Ok(None)
        }
        Err(err) => {
            tracing::error!(task_id = task.id, %fetch_key, error = %err, "fetch failed terminally");
            terminal_fetch_failure(ctx, task, &fetch_key).await?;
            Ok(None)
        }
    }
}

async fn terminal_fetch_failure(
    ctx: &WorkerContext,
    task: &ClaimedTask,
    fetch_key: &str,
) -> Result<(), WorkerFailure> {
    store_retry(|| {
        ctx.store.insert_error_log(
            task.id,
            fetch_key,
            task.retry_count,
            ErrorCode::UnreachableFetch,
        )
    })
    .await?;
    store_retry(|| ctx.store.mark_task_processed(task.id)).await?;
    Ok(())
}

/// Retry a store operation in place with a small backoff; surface a fatal
/// failure once the attempts are spent.
async fn store_retry<T, F, Fut>(mut op: F) -> Result<T, WorkerFailure>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<T>>,
{
    let mut last_error = None;
    for attempt in 0..STORE_ATTEMPTS {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                tracing::warn!(attempt, error = %err, "store operation failed");
                last_error = Some(err);
                sleep(STORE_BACKOFF).await;
            }
        }
    }
    Err(WorkerFailure::StoreUnavailable(
        last_error
            .map(|err| err.to_string())
            .unwrap_or_else(|| "unknown".to_string()),
    ))
}
