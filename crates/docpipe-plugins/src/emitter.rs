//! Emitter abstraction.
//!
//! An emitter delivers a batch of `(emit key, metadata list)` pairs to a
//! downstream sink. Emission is synchronous from the batched emitter's point
//! of view: `emit` returns only once the batch is durable (or fails). Within
//! one batch the metadata order of each item is preserved.

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

use docpipe_core::models::EmitData;

#[derive(Debug, Error)]
pub enum EmitError {
    #[error("sink unreachable: {0}")]
    Unreachable(String),

    #[error("invalid emit key: {0}")]
    InvalidKey(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub type EmitResult<T> = Result<T, EmitError>;

#[async_trait]
pub trait Emitter: Send + Sync {
    /// The id this emitter is registered under.
    fn id(&self) -> &str;

    /// Deliver a batch. Items in the batch all carry this emitter's id.
    async fn emit(&self, batch: &[EmitData]) -> EmitResult<()>;
}

/// Writes each emission as a JSON file under a base directory, named after
/// the emit key.
pub struct FileSystemEmitter {
    id: String,
    base_dir: PathBuf,
}

impl FileSystemEmitter {
    pub fn new(id: impl Into<String>, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            base_dir: base_dir.into(),
        }
    }
}

#[async_trait]
impl Emitter for FileSystemEmitter {
    fn id(&self) -> &str {
        &self.id
    }

    async fn emit(&self, batch: &[EmitData]) -> EmitResult<()> {
        tokio::fs::create_dir_all(&self.base_dir).await?;
        for item in batch {
            if item.emit_key.key.contains("..") {
                return Err(EmitError::InvalidKey(item.emit_key.to_string()));
            }
            let sanitized = item.emit_key.key.replace(['/', '\\'], "_");
            let path = self.base_dir.join(format!("{sanitized}.json"));
            let body = serde_json::to_vec_pretty(&item.metadata)?;
            tokio::fs::write(&path, body).await?;
            tracing::debug!(emit_key = %item.emit_key, path = %path.display(), "emitted");
        }
        Ok(())
    }
}

/// Prints each emission as a JSON line. Useful for smoke tests and demos.
pub struct StdoutEmitter {
    id: String,
}

impl StdoutEmitter {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

#[async_trait]
impl Emitter for StdoutEmitter {
    fn id(&self) -> &str {
        &self.id
    }

    async fn emit(&self, batch: &[EmitData]) -> EmitResult<()> {
        for item in batch {
            let line = serde_json::to_string(item)?;
            println!("{line}");
        }
        Ok(())
    }
}
