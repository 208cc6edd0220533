use std::fmt::{Display, Formatter, Result as FmtResult};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Exit codes a worker child uses to report why it stopped. Anything outside
/// this set is treated as an unknown parse failure.
pub mod exit_code {
    pub const CLEAN: i32 = 0;
    pub const UNKNOWN: i32 = 10;
    pub const OOM: i32 = 11;
    pub const TIMEOUT: i32 = 12;
    pub const SECURITY: i32 = 13;
}

/// Terminal failure categories recorded in the append-only error log.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[repr(i32)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    UnknownParse = 1,
    Oom = 2,
    Timeout = 3,
    UnreachableFetch = 4,
    UnreachableEmit = 5,
    Security = 6,
}

impl ErrorCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            1 => Some(ErrorCode::UnknownParse),
            2 => Some(ErrorCode::Oom),
            3 => Some(ErrorCode::Timeout),
            4 => Some(ErrorCode::UnreachableFetch),
            5 => Some(ErrorCode::UnreachableEmit),
            6 => Some(ErrorCode::Security),
            _ => None,
        }
    }

    /// Map a worker-child exit code to the error code stamped on the rows it
    /// left in process.
    pub fn from_exit_code(code: i32) -> Self {
        match code {
            exit_code::OOM => ErrorCode::Oom,
            exit_code::TIMEOUT => ErrorCode::Timeout,
            exit_code::SECURITY => ErrorCode::Security,
            _ => ErrorCode::UnknownParse,
        }
    }

    /// The exit code a worker child uses to surface this failure category.
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorCode::Oom => exit_code::OOM,
            ErrorCode::Timeout => exit_code::TIMEOUT,
            ErrorCode::Security => exit_code::SECURITY,
            _ => exit_code::UNKNOWN,
        }
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            ErrorCode::UnknownParse => write!(f, "unknown_parse"),
            ErrorCode::Oom => write!(f, "oom"),
            ErrorCode::Timeout => write!(f, "timeout"),
            ErrorCode::UnreachableFetch => write!(f, "unreachable_fetch"),
            ErrorCode::UnreachableEmit => write!(f, "unreachable_emit"),
            ErrorCode::Security => write!(f, "security"),
        }
    }
}

/// One append-only error log row. A task that exhausts retries appears here
/// exactly once with its terminal code.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ErrorLogRecord {
    pub task_id: i64,
    pub fetch_key: String,
    pub retry_count: i64,
    pub error_code: ErrorCode,
    pub created_at: DateTime<Utc>,
}
