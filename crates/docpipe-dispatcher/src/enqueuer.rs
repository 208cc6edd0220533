//! Enqueuer: moves tuples from the intake queue into the task store.
//!
//! Each tuple is assigned to a uniformly random ACTIVE worker at insert
//! time. Random assignment keeps this loop fast and lock-free on the worker
//! registry; the assignment manager corrects any skew asynchronously.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use rand::rngs::StdRng;
use rand::Rng;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use docpipe_core::models::FetchEmitTuple;
use docpipe_store::{SharedStore, TaskStore as _};

use crate::intake::{IntakeItem, IntakeQueue};

/// How long one intake poll waits before re-checking for cancellation.
const INTAKE_POLL: Duration = Duration::from_secs(1);

/// How often the worker registry is re-read while no worker is ACTIVE.
const WORKER_POLL: Duration = Duration::from_millis(100);

/// Attempts per task insert before the store is declared gone.
const INSERT_ATTEMPTS: u32 = 5;
const INSERT_BACKOFF: Duration = Duration::from_millis(200);

pub struct Enqueuer {
    store: SharedStore,
    intake: Arc<IntakeQueue>,
    completed_tx: watch::Sender<bool>,
    rng: StdRng,
    worker_wait_timeout: Duration,
}

impl Enqueuer {
    pub fn new(
        store: SharedStore,
        intake: Arc<IntakeQueue>,
        completed_tx: watch::Sender<bool>,
        rng: StdRng,
        worker_wait_timeout: Duration,
    ) -> Self {
        Self {
            store,
            intake,
            completed_tx,
            rng,
            worker_wait_timeout,
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        tracing::info!("enqueuer started");
        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                item = self.intake.poll(INTAKE_POLL) => item,
            };

            match item {
                None => continue,
                Some(IntakeItem::Completed) => {
                    // Visible to the assignment manager, which begins the
                    // shutdown sequence once the store drains.
                    let _ = self.completed_tx.send(true);
                    tracing::info!("enqueuer observed end of producer");
                    return Ok(());
                }
                Some(IntakeItem::Tuple(tuple)) => {
                    let Some(worker_id) = self.pick_worker(&cancel).await? else {
                        return Ok(());
                    };
                    self.insert(tuple, worker_id).await?;
                }
            }
        }
    }

    /// Choose a random ACTIVE worker, waiting for one to appear if the pool
    /// is still starting. `Ok(None)` means cancellation interrupted the wait.
    async fn pick_worker(&mut self, cancel: &CancellationToken) -> Result<Option<i64>> {
        let deadline = Instant::now() + self.worker_wait_timeout;
        let mut logged_waiting = false;
        loop {
            let workers = self
                .store
                .list_active_workers()
                .await
                .context("enqueuer failed to read worker registry")?;
            if !workers.is_empty() {
                let chosen = workers[self.rng.random_range(0..workers.len())];
                return Ok(Some(chosen));
            }

            if Instant::now() >= deadline {
                bail!(
                    "no worker became active within {:?}; startup failed",
                    self.worker_wait_timeout
                );
            }
            if !logged_waiting {
                tracing::warn!("no active workers yet, waiting");
                logged_waiting = true;
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = sleep(WORKER_POLL) => {}
            }
        }
    }

    async fn insert(&mut self, tuple: FetchEmitTuple, worker_id: i64) -> Result<()> {
        let json = tuple
            .to_json()
            .context("failed to serialize tuple for persistence")?;

        let mut last_error = None;
        for attempt in 0..INSERT_ATTEMPTS {
            match self.store.insert_task(&json, worker_id).await {
                Ok(task_id) => {
                    tracing::debug!(task_id, worker_id, "tuple enqueued");
                    return Ok(());
                }
                Err(err) => {
                    tracing::warn!(attempt, worker_id, error = %err, "task insert failed");
                    last_error = Some(err);
                    sleep(INSERT_BACKOFF).await;
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| anyhow::anyhow!("task insert failed"))
            .context("task store unavailable while enqueuing"))
    }
}
