use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{EmitKey, Metadata};

/// Lifecycle status of a buffered emit payload.
///
/// READY rows wait for a batched emitter; EMITTING rows are owned by exactly
/// one emitter and revert to READY if that emitter crashes. Deletion of the
/// row is the acknowledgement of durable emission.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[repr(i32)]
#[serde(rename_all = "snake_case")]
pub enum EmitStatus {
    Ready = 1,
    Emitting = 2,
    Done = 3,
}

impl EmitStatus {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            1 => Some(EmitStatus::Ready),
            2 => Some(EmitStatus::Emitting),
            3 => Some(EmitStatus::Done),
            _ => None,
        }
    }
}

/// One persisted emit payload row. `bytes` holds the compressed serialized
/// [`EmitData`]; `uncompressed_size` records the decompressed length so any
/// codec with a recorded size is admissible.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EmitPayloadRecord {
    pub id: i64,
    pub status: EmitStatus,
    pub worker_id: i64,
    pub updated_at: DateTime<Utc>,
    pub uncompressed_size: i64,
    pub bytes: Vec<u8>,
}

/// What a worker produces per task: the destination key and the parsed
/// metadata records, in parse order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmitData {
    pub emit_key: EmitKey,
    pub metadata: Vec<Metadata>,
}

impl EmitData {
    pub fn new(emit_key: EmitKey, metadata: Vec<Metadata>) -> Self {
        Self { emit_key, metadata }
    }

    /// An emission carrying no metadata records, used by the EMIT_EMPTY
    /// parse-exception policy.
    pub fn empty(emit_key: EmitKey) -> Self {
        Self {
            emit_key,
            metadata: Vec::new(),
        }
    }
}
