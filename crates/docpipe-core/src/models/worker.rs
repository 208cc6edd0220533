use std::fmt::{Display, Formatter, Result as FmtResult};

use serde::{Deserialize, Serialize};

/// Lifecycle status of a worker registration.
///
/// ACTIVE and RESTARTING workers have a live child process (or one being
/// spawned). A worker flipped to SHOULD_SHUTDOWN receives no new assignments
/// and is expected to observe the flag and exit cleanly.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[repr(i32)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Active = 1,
    Restarting = 2,
    ShouldShutdown = 3,
    Shutdown = 4,
}

impl WorkerStatus {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            1 => Some(WorkerStatus::Active),
            2 => Some(WorkerStatus::Restarting),
            3 => Some(WorkerStatus::ShouldShutdown),
            4 => Some(WorkerStatus::Shutdown),
            _ => None,
        }
    }
}

impl Display for WorkerStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            WorkerStatus::Active => write!(f, "active"),
            WorkerStatus::Restarting => write!(f, "restarting"),
            WorkerStatus::ShouldShutdown => write!(f, "should_shutdown"),
            WorkerStatus::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// One row in the worker registry.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WorkerRecord {
    pub worker_id: i64,
    pub status: WorkerStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trip() {
        for status in [
            WorkerStatus::Active,
            WorkerStatus::Restarting,
            WorkerStatus::ShouldShutdown,
            WorkerStatus::Shutdown,
        ] {
            assert_eq!(WorkerStatus::from_i32(status.as_i32()), Some(status));
        }
        assert_eq!(WorkerStatus::from_i32(7), None);
    }
}
