//! Worker child environment.
//!
//! The supervisor passes everything a worker needs through environment
//! variables; the child reads them once at startup.

use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};

use docpipe_core::config::{ENV_FETCH_ROOT, ENV_PARSER_CONFIG, ENV_STORE_URL, ENV_WORKER_ID};

#[derive(Debug, Clone)]
pub struct WorkerEnv {
    pub store_url: String,
    pub worker_id: i64,
    pub parser_config_path: Option<PathBuf>,
    pub fetch_root: Option<PathBuf>,
}

impl WorkerEnv {
    pub fn from_env() -> Result<Self> {
        let store_url =
            env::var(ENV_STORE_URL).with_context(|| format!("{ENV_STORE_URL} is not set"))?;
        let worker_id = env::var(ENV_WORKER_ID)
            .with_context(|| format!("{ENV_WORKER_ID} is not set"))?
            .parse()
            .with_context(|| format!("{ENV_WORKER_ID} is not an integer"))?;

        Ok(Self {
            store_url,
            worker_id,
            parser_config_path: env::var(ENV_PARSER_CONFIG).ok().map(PathBuf::from),
            fetch_root: env::var(ENV_FETCH_ROOT).ok().map(PathBuf::from),
        })
    }
}
