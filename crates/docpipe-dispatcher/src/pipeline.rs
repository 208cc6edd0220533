//! Pipeline: wires the components together and owns shutdown.
//!
//! `close` is cooperative: the intake sentinel reaches the enqueuer, the
//! assignment manager drains the store and flips workers to
//! SHOULD_SHUTDOWN, workers exit cleanly, and the emitters drain the
//! remaining payloads before the embedded store is removed. `shutdown_now`
//! cancels everything and kills worker children; rows left in flight look
//! exactly like a worker crash and recover on the next startup.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tempfile::TempDir;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use docpipe_core::models::FetchEmitTuple;
use docpipe_core::{PipelineConfig, PipelineError};
use docpipe_plugins::EmitterRegistry;
use docpipe_store::{SharedStore, SqliteTaskStore, TaskStore as _};

use crate::assignment::AssignmentManager;
use crate::emitter::BatchEmitter;
use crate::enqueuer::Enqueuer;
use crate::hooks::EmitHook;
use crate::intake::IntakeQueue;
use crate::supervisor::WorkerSupervisor;

/// Emitter loops stamp emit rows with ids offset from worker ids.
const EMITTER_ID_BASE: i64 = 1000;

/// Poll period while close waits for in-flight tasks to finish.
const DRAIN_POLL: Duration = Duration::from_millis(100);

/// How long shutdown_now waits for each component before abandoning it.
const FORCED_WAIT: Duration = Duration::from_secs(10);

/// Counts reported to the embedder.
#[derive(Debug, Clone)]
pub struct PipelineStatus {
    pub tasks: i64,
    pub available: i64,
    pub emit_payloads: i64,
    /// `(worker_id, restart_count)` per supervised worker.
    pub worker_restarts: Vec<(i64, u32)>,
}

struct NamedHandle {
    name: String,
    handle: JoinHandle<Result<()>>,
}

impl NamedHandle {
    fn spawn(name: impl Into<String>, future: impl std::future::Future<Output = Result<()>> + Send + 'static) -> Self {
        Self {
            name: name.into(),
            handle: tokio::spawn(future),
        }
    }
}

pub struct Pipeline {
    intake: Arc<IntakeQueue>,
    store: SharedStore,
    sqlite: Option<SqliteTaskStore>,
    cancel: CancellationToken,
    enqueuer: Option<NamedHandle>,
    assignment: Option<NamedHandle>,
    supervisors: Vec<NamedHandle>,
    emitters: Vec<NamedHandle>,
    drain_tx: watch::Sender<bool>,
    temp_dir: Option<TempDir>,
    temp_path: Option<PathBuf>,
    restart_counters: Vec<(i64, Arc<AtomicU32>)>,
    fatal: Option<String>,
    closed: bool,
}

impl Pipeline {
    /// Open (or create) the embedded store described by the configuration
    /// and start every component.
    pub async fn start(
        config: PipelineConfig,
        emitters: EmitterRegistry,
        hooks: Vec<Arc<dyn EmitHook>>,
    ) -> Result<Self> {
        let (store_url, temp_dir, temp_path) = resolve_store_location(&config)?;
        let sqlite = SqliteTaskStore::connect(&store_url)
            .await
            .context("failed to open the task store")?;
        let store: SharedStore = Arc::new(sqlite.clone());
        Self::start_inner(
            config,
            store,
            Some(sqlite),
            store_url,
            temp_dir,
            temp_path,
            emitters,
            hooks,
        )
        .await
    }

    /// Start against an externally provided store backend. Worker child
    /// processes are only usable when the backend is also reachable via
    /// `config.store_url`; in-process test workers attach directly.
    pub async fn start_with_store(
        config: PipelineConfig,
        store: SharedStore,
        emitters: EmitterRegistry,
        hooks: Vec<Arc<dyn EmitHook>>,
    ) -> Result<Self> {
        let store_url = config.store_url.clone().unwrap_or_default();
        Self::start_inner(config, store, None, store_url, None, None, emitters, hooks).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn start_inner(
        config: PipelineConfig,
        store: SharedStore,
        sqlite: Option<SqliteTaskStore>,
        store_url: String,
        temp_dir: Option<TempDir>,
        temp_path: Option<PathBuf>,
        emitter_registry: EmitterRegistry,
        hooks: Vec<Arc<dyn EmitHook>>,
    ) -> Result<Self> {
        store.create_schema().await.context("schema creation failed")?;

        // Rows left behind by a forced shutdown look like worker crashes;
        // recover them before anything claims work.
        let orphans = store.reset_orphaned_in_process().await?;
        let stale_emits = store.reset_stale_emitting().await?;
        if orphans > 0 || stale_emits > 0 {
            tracing::warn!(orphans, stale_emits, "recovered state from a previous run");
        }

        let intake = Arc::new(IntakeQueue::new(config.queue_size));
        let cancel = CancellationToken::new();
        let (completed_tx, completed_rx) = watch::channel(false);
        let (drain_tx, drain_rx) = watch::channel(false);

        let enqueuer = NamedHandle::spawn(
            "enqueuer",
            Enqueuer::new(
                store.clone(),
                intake.clone(),
                completed_tx,
                seeded_rng(config.rng_seed, 0),
                Duration::from_millis(config.worker_wait_timeout_ms),
            )
            .run(cancel.clone()),
        );

        let assignment = NamedHandle::spawn(
            "assignment-manager",
            AssignmentManager::new(
                store.clone(),
                completed_rx,
                seeded_rng(config.rng_seed, 1),
                Duration::from_millis(config.assignment_tick_ms),
            )
            .run(cancel.clone()),
        );

        let mut supervisors = Vec::with_capacity(config.max_workers);
        let mut restart_counters = Vec::with_capacity(config.max_workers);
        for worker_id in 1..=config.max_workers as i64 {
            let restarts = Arc::new(AtomicU32::new(0));
            restart_counters.push((worker_id, restarts.clone()));
            supervisors.push(NamedHandle::spawn(
                format!("worker-supervisor-{worker_id}"),
                WorkerSupervisor::new(
                    worker_id,
                    store.clone(),
                    store_url.clone(),
                    &config,
                    restarts,
                )
                .run(cancel.clone()),
            ));
        }

        let mut emitters = Vec::with_capacity(config.num_emitters);
        for index in 0..config.num_emitters as i64 {
            emitters.push(NamedHandle::spawn(
                format!("batch-emitter-{index}"),
                BatchEmitter::new(
                    EMITTER_ID_BASE + index,
                    store.clone(),
                    emitter_registry.clone(),
                    hooks.clone(),
                    Duration::from_millis(config.emit_within_ms),
                    config.emit_max_bytes,
                    config.emit_retry_on_failure,
                    drain_rx.clone(),
                )
                .run(cancel.clone()),
            ));
        }

        tracing::info!(
            workers = config.max_workers,
            emitters = config.num_emitters,
            queue_size = config.queue_size,
            "pipeline started"
        );

        Ok(Self {
            intake,
            store,
            sqlite,
            cancel,
            enqueuer: Some(enqueuer),
            assignment: Some(assignment),
            supervisors,
            emitters,
            drain_tx,
            temp_dir,
            temp_path,
            restart_counters,
            fatal: None,
            closed: false,
        })
    }

    /// Forward one tuple to the intake queue. Returns false on timeout or
    /// while the pipeline is shutting down.
    pub async fn offer(&self, tuple: FetchEmitTuple, timeout: Duration) -> bool {
        if self.closed || self.cancel.is_cancelled() {
            return false;
        }
        self.intake.offer(tuple, timeout).await
    }

    /// All-or-nothing batch admit; see [`IntakeQueue::offer_batch`].
    pub async fn offer_batch(&self, tuples: Vec<FetchEmitTuple>, timeout: Duration) -> bool {
        if self.closed || self.cancel.is_cancelled() {
            return false;
        }
        self.intake.offer_batch(tuples, timeout).await
    }

    /// Drain finished components and report whether any are still running.
    /// Surfaces the first fatal component error; embedders poll this.
    pub async fn check_active(&mut self) -> Result<bool, PipelineError> {
        if let Some(message) = &self.fatal {
            return Err(PipelineError::component("pipeline", message));
        }

        let mut finished = Vec::new();
        if self
            .enqueuer
            .as_ref()
            .is_some_and(|named| named.handle.is_finished())
        {
            finished.extend(self.enqueuer.take());
        }
        if self
            .assignment
            .as_ref()
            .is_some_and(|named| named.handle.is_finished())
        {
            finished.extend(self.assignment.take());
        }
        for list in [&mut self.supervisors, &mut self.emitters] {
            let mut index = 0;
            while index < list.len() {
                if list[index].handle.is_finished() {
                    finished.push(list.remove(index));
                } else {
                    index += 1;
                }
            }
        }

        for named in finished {
            // Already finished, so this await resolves immediately.
            if let Some(err) = join_handle(Some(named)).await {
                let message = format!("{err:#}");
                self.fatal = Some(message.clone());
                return Err(PipelineError::component("pipeline", message));
            }
        }

        let running = self.enqueuer.is_some()
            || self.assignment.is_some()
            || !self.supervisors.is_empty()
            || !self.emitters.is_empty();
        Ok(running)
    }

    /// Cooperative shutdown: inject the end-of-producer sentinel, wait for
    /// every component to finish, drain the emit payloads, then delete the
    /// embedded store.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        tracing::info!("pipeline closing");
        self.intake.complete();

        fn record(failure: &mut Option<anyhow::Error>, outcome: Option<anyhow::Error>) {
            if let Some(err) = outcome {
                failure.get_or_insert(err);
            }
        }
        let mut failure: Option<anyhow::Error> = None;

        record(&mut failure, join_handle(self.enqueuer.take()).await);
        record(&mut failure, join_handle(self.assignment.take()).await);
        for supervisor in self.supervisors.drain(..) {
            record(&mut failure, join_handle(Some(supervisor)).await);
        }

        // Let stragglers finish their in-flight task before the emitters are
        // told to drain; a worker insert after drain-exit would be stranded.
        while failure.is_none() {
            match self.store.count_tasks().await {
                Ok(0) => break,
                Ok(_) => sleep(DRAIN_POLL).await,
                Err(err) => {
                    record(&mut failure, Some(err));
                    break;
                }
            }
        }

        let _ = self.drain_tx.send(true);
        for emitter in self.emitters.drain(..) {
            record(&mut failure, join_handle(Some(emitter)).await);
        }

        if let Some(sqlite) = self.sqlite.take() {
            sqlite.close().await;
        }
        if let Some(temp_dir) = self.temp_dir.take() {
            if let Err(err) = temp_dir.close() {
                tracing::warn!(error = %err, "failed to remove embedded store directory");
            }
        }
        if let Some(path) = self.temp_path.take() {
            if let Err(err) = tokio::fs::remove_dir_all(&path).await {
                tracing::warn!(error = %err, path = %path.display(), "failed to remove store directory");
            }
        }

        match failure {
            None => {
                tracing::info!("pipeline closed");
                Ok(())
            }
            Some(err) => Err(err),
        }
    }

    /// Forced stop: cancel every component, kill worker children, return
    /// without draining. The store directory is kept so the next startup can
    /// recover in-flight rows.
    pub async fn shutdown_now(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        tracing::warn!("pipeline forced shutdown");
        self.cancel.cancel();

        let handles = self
            .enqueuer
            .take()
            .into_iter()
            .chain(self.assignment.take())
            .chain(self.supervisors.drain(..))
            .chain(self.emitters.drain(..));
        for named in handles {
            let mut handle = named.handle;
            if tokio::time::timeout(FORCED_WAIT, &mut handle).await.is_err() {
                handle.abort();
                tracing::warn!(component = %named.name, "component did not stop in time");
            }
        }

        if let Some(sqlite) = self.sqlite.take() {
            sqlite.close().await;
        }
        if let Some(temp_dir) = self.temp_dir.take() {
            let kept = temp_dir.keep();
            tracing::info!(path = %kept.display(), "embedded store kept for recovery");
        }
        Ok(())
    }

    /// Counts for embedder dashboards and tests.
    pub async fn status(&self) -> Result<PipelineStatus> {
        Ok(PipelineStatus {
            tasks: self.store.count_tasks().await?,
            available: self.store.count_available().await?,
            emit_payloads: self.store.count_emits().await?,
            worker_restarts: self
                .restart_counters
                .iter()
                .map(|(worker_id, restarts)| (*worker_id, restarts.load(Ordering::SeqCst)))
                .collect(),
        })
    }

    pub fn store(&self) -> SharedStore {
        self.store.clone()
    }
}

fn seeded_rng(seed: Option<u64>, stream: u64) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(stream)),
        None => StdRng::from_os_rng(),
    }
}

fn resolve_store_location(
    config: &PipelineConfig,
) -> Result<(String, Option<TempDir>, Option<PathBuf>)> {
    if let Some(url) = &config.store_url {
        return Ok((url.clone(), None, None));
    }
    if let Some(dir) = &config.temp_store_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("cannot create store directory {}", dir.display()))?;
        return Ok((SqliteTaskStore::file_url(dir), None, Some(dir.clone())));
    }
    let temp_dir = TempDir::new().context("cannot create temp store directory")?;
    let url = SqliteTaskStore::file_url(temp_dir.path());
    Ok((url, Some(temp_dir), None))
}

async fn join_handle(named: Option<NamedHandle>) -> Option<anyhow::Error> {
    let named = named?;
    match named.handle.await {
        Ok(Ok(())) => {
            tracing::debug!(component = %named.name, "component finished");
            None
        }
        Ok(Err(err)) => Some(err.context(named.name)),
        Err(err) => Some(anyhow::anyhow!("{} panicked: {err}", named.name)),
    }
}
