//! Pipeline configuration.
//!
//! All options can be supplied programmatically or read from `DOCPIPE_*`
//! environment variables. Worker children receive their slice of this
//! configuration through the environment (see the variable names below).

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

// Environment variable names shared with worker children.
pub const ENV_STORE_URL: &str = "DOCPIPE_STORE_URL";
pub const ENV_WORKER_ID: &str = "DOCPIPE_WORKER_ID";
pub const ENV_PARSER_CONFIG: &str = "DOCPIPE_PARSER_CONFIG";
pub const ENV_FETCH_ROOT: &str = "DOCPIPE_FETCH_ROOT";

const DEFAULT_QUEUE_SIZE: usize = 1000;
const DEFAULT_EMIT_WITHIN_MS: u64 = 1000;
const DEFAULT_EMIT_MAX_BYTES: usize = 10_000_000;
const DEFAULT_MAX_RETRIES: i64 = 3;
const DEFAULT_PARSE_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_WORKER_WAIT_TIMEOUT_MS: u64 = 600_000;
const DEFAULT_ASSIGNMENT_TICK_MS: u64 = 200;

/// Configuration for a [`Pipeline`] and its worker children.
///
/// [`Pipeline`]: https://docs.rs/docpipe-dispatcher
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Capacity of the in-memory intake queue.
    pub queue_size: usize,
    /// Number of worker child processes.
    pub max_workers: usize,
    /// Store location. When unset, an embedded store is created under
    /// `temp_store_dir` and removed on clean close.
    pub store_url: Option<String>,
    /// Directory for an embedded store. When unset a fresh temp directory is
    /// used.
    pub temp_store_dir: Option<PathBuf>,
    /// Passed to each worker child in its environment.
    pub parser_config_path: Option<PathBuf>,
    /// Base directory handed to the filesystem fetcher in worker children.
    pub fetch_root: Option<PathBuf>,
    /// Batched emitter time trigger.
    pub emit_within_ms: u64,
    /// Batched emitter size trigger, in estimated uncompressed bytes.
    pub emit_max_bytes: usize,
    /// Ceiling on a task's retry count before it is terminally failed.
    pub max_retries: i64,
    /// Per-task parse timeout enforced inside the worker child.
    pub parse_timeout_ms: u64,
    /// Restart ceiling per worker; 0 means unbounded. A worker that exceeds
    /// it is abandoned and its queue reassigned.
    pub max_restarts: u32,
    /// Number of batched emitter loops.
    pub num_emitters: usize,
    /// Seed for worker assignment and rebalancing randomness. Unset uses OS
    /// entropy; tests inject a fixed seed.
    pub rng_seed: Option<u64>,
    /// Worker child executable. Defaults to `docpipe-worker` next to the
    /// current executable.
    pub worker_program: Option<PathBuf>,
    /// How long the enqueuer waits for a first ACTIVE worker before aborting
    /// startup.
    pub worker_wait_timeout_ms: u64,
    /// Assignment manager control-loop period.
    pub assignment_tick_ms: u64,
    /// Whether an emitter failure leaves rows for a later retry (true) or
    /// drops them terminally (false).
    pub emit_retry_on_failure: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_size: DEFAULT_QUEUE_SIZE,
            max_workers: default_max_workers(),
            store_url: None,
            temp_store_dir: None,
            parser_config_path: None,
            fetch_root: None,
            emit_within_ms: DEFAULT_EMIT_WITHIN_MS,
            emit_max_bytes: DEFAULT_EMIT_MAX_BYTES,
            max_retries: DEFAULT_MAX_RETRIES,
            parse_timeout_ms: DEFAULT_PARSE_TIMEOUT_MS,
            max_restarts: 0,
            num_emitters: 1,
            rng_seed: None,
            worker_program: None,
            worker_wait_timeout_ms: DEFAULT_WORKER_WAIT_TIMEOUT_MS,
            assignment_tick_ms: DEFAULT_ASSIGNMENT_TICK_MS,
            emit_retry_on_failure: true,
        }
    }
}

impl PipelineConfig {
    /// Build a configuration from `DOCPIPE_*` environment variables, falling
    /// back to defaults for anything unset.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            queue_size: env_parse("DOCPIPE_QUEUE_SIZE", defaults.queue_size),
            max_workers: env_parse("DOCPIPE_MAX_WORKERS", defaults.max_workers),
            store_url: env::var(ENV_STORE_URL).ok(),
            temp_store_dir: env::var("DOCPIPE_TEMP_STORE_DIR").ok().map(PathBuf::from),
            parser_config_path: env::var(ENV_PARSER_CONFIG).ok().map(PathBuf::from),
            fetch_root: env::var(ENV_FETCH_ROOT).ok().map(PathBuf::from),
            emit_within_ms: env_parse("DOCPIPE_EMIT_WITHIN_MS", defaults.emit_within_ms),
            emit_max_bytes: env_parse("DOCPIPE_EMIT_MAX_BYTES", defaults.emit_max_bytes),
            max_retries: env_parse("DOCPIPE_MAX_RETRIES", defaults.max_retries),
            parse_timeout_ms: env_parse("DOCPIPE_PARSE_TIMEOUT_MS", defaults.parse_timeout_ms),
            max_restarts: env_parse("DOCPIPE_MAX_RESTARTS", defaults.max_restarts),
            num_emitters: env_parse("DOCPIPE_NUM_EMITTERS", defaults.num_emitters),
            rng_seed: env::var("DOCPIPE_RNG_SEED")
                .ok()
                .and_then(|v| v.parse().ok()),
            worker_program: env::var("DOCPIPE_WORKER_PROGRAM").ok().map(PathBuf::from),
            worker_wait_timeout_ms: env_parse(
                "DOCPIPE_WORKER_WAIT_TIMEOUT_MS",
                defaults.worker_wait_timeout_ms,
            ),
            assignment_tick_ms: env_parse(
                "DOCPIPE_ASSIGNMENT_TICK_MS",
                defaults.assignment_tick_ms,
            ),
            emit_retry_on_failure: env_parse(
                "DOCPIPE_EMIT_RETRY_ON_FAILURE",
                defaults.emit_retry_on_failure,
            ),
        }
    }
}

fn default_max_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
