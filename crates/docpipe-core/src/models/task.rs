use std::fmt::{Display, Formatter, Result as FmtResult};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a task row.
///
/// AVAILABLE rows are owned by nobody and may be claimed by the worker they
/// are assigned to. IN_PROCESS rows are held by exactly one live worker; a
/// worker crash returns them to AVAILABLE before anyone else may claim them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[repr(i32)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Available = 1,
    InProcess = 2,
    Processed = 3,
    Failed = 4,
}

impl TaskStatus {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            1 => Some(TaskStatus::Available),
            2 => Some(TaskStatus::InProcess),
            3 => Some(TaskStatus::Processed),
            4 => Some(TaskStatus::Failed),
            _ => None,
        }
    }
}

impl Display for TaskStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            TaskStatus::Available => write!(f, "available"),
            TaskStatus::InProcess => write!(f, "in_process"),
            TaskStatus::Processed => write!(f, "processed"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One persisted task row. `json` is the serialized [`FetchEmitTuple`];
/// the dispatcher never interprets it beyond the emitter id and policy.
///
/// [`FetchEmitTuple`]: crate::models::FetchEmitTuple
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TaskRecord {
    pub id: i64,
    pub status: TaskStatus,
    pub worker_id: i64,
    pub retry_count: i64,
    pub updated_at: DateTime<Utc>,
    pub json: String,
}

impl TaskRecord {
    pub fn can_retry(&self, max_retries: i64) -> bool {
        self.retry_count < max_retries
    }
}

/// The slice of a task row a worker receives when it claims work.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ClaimedTask {
    pub id: i64,
    pub retry_count: i64,
    pub json: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trip() {
        for status in [
            TaskStatus::Available,
            TaskStatus::InProcess,
            TaskStatus::Processed,
            TaskStatus::Failed,
        ] {
            assert_eq!(TaskStatus::from_i32(status.as_i32()), Some(status));
        }
        assert_eq!(TaskStatus::from_i32(0), None);
        assert_eq!(TaskStatus::from_i32(99), None);
    }

    #[test]
    fn status_display() {
        assert_eq!(TaskStatus::Available.to_string(), "available");
        assert_eq!(TaskStatus::InProcess.to_string(), "in_process");
    }

    #[test]
    fn can_retry_below_ceiling() {
        let task = TaskRecord {
            id: 1,
            status: TaskStatus::Available,
            worker_id: 0,
            retry_count: 2,
            updated_at: Utc::now(),
            json: String::new(),
        };
        assert!(task.can_retry(3));
        assert!(!task.can_retry(2));
        assert!(!task.can_retry(1));
    }
}
