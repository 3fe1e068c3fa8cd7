//! Task records and admission outcomes.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::registry::QueryParams;

pub type TaskId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerKind {
    Scheduled,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskOutcome {
    Pending,
    Running,
    Succeeded,
    Failed,
    Rejected,
}

impl TaskOutcome {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskOutcome::Succeeded | TaskOutcome::Failed | TaskOutcome::Rejected)
    }
}

/// Reason code attached to every refused admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectReason {
    Paused,
    PriorityExcluded,
    ConcurrencyLimit,
}

impl RejectReason {
    pub const fn code(self) -> &'static str {
        match self {
            RejectReason::Paused => "PAUSED",
            RejectReason::PriorityExcluded => "PRIORITY_EXCLUDED",
            RejectReason::ConcurrencyLimit => "CONCURRENCY_LIMIT",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Admission {
    /// `concurrency_cap` is the per-source limit the decision was made
    /// against; cleanups are uncapped and report 0.
    Admitted { degraded: bool, concurrency_cap: usize },
    Rejected { reason: RejectReason },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted { .. })
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Admission::Admitted { degraded: true, .. })
    }

    pub fn reject_reason(&self) -> Option<RejectReason> {
        match self {
            Admission::Rejected { reason } => Some(*reason),
            Admission::Admitted { .. } => None,
        }
    }
}

/// What a trigger hands back to its caller. Manual triggers return this
/// immediately; they never wait for the task to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TriggerOutcome {
    pub task_id: TaskId,
    pub admission: Admission,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskKind {
    Scrape { source: String },
    Cleanup { retention_days: u32 },
}

/// Bookkeeping for one scrape or cleanup task. Terminal state is set once.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    #[serde(flatten)]
    pub kind: TaskKind,
    pub trigger: TriggerKind,
    pub requested_at: DateTime<Utc>,
    pub admitted: bool,
    pub degraded: bool,
    pub outcome: TaskOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reject_reason: Option<RejectReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskRecord {
    pub(crate) fn new(kind: TaskKind, trigger: TriggerKind, admission: &Admission) -> Self {
        let admitted = admission.is_admitted();
        Self {
            task_id: Uuid::new_v4(),
            kind,
            trigger,
            requested_at: Utc::now(),
            admitted,
            degraded: admission.is_degraded(),
            outcome: if admitted { TaskOutcome::Pending } else { TaskOutcome::Rejected },
            reject_reason: admission.reject_reason(),
            finished_at: if admitted { None } else { Some(Utc::now()) },
            count: None,
            error: None,
        }
    }

    pub fn source_name(&self) -> Option<&str> {
        match self.kind {
            TaskKind::Scrape { ref source } => Some(source),
            TaskKind::Cleanup { .. } => None,
        }
    }
}

/// Terminal result reported back by the task queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskResult {
    Succeeded { count: usize },
    Failed { error: String },
}

/// Unit of work handed to the task queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueuedTask {
    Scrape { task_id: TaskId, source: String, query: QueryParams },
    Cleanup { task_id: TaskId, retention_days: u32 },
}

impl QueuedTask {
    pub fn task_id(&self) -> TaskId {
        match self {
            QueuedTask::Scrape { task_id, .. } | QueuedTask::Cleanup { task_id, .. } => *task_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejected_record_is_terminal_from_the_start() {
        let record = TaskRecord::new(
            TaskKind::Scrape { source: "tavily".into() },
            TriggerKind::Manual,
            &Admission::Rejected { reason: RejectReason::Paused },
        );
        assert!(!record.admitted);
        assert_eq!(record.outcome, TaskOutcome::Rejected);
        assert!(record.outcome.is_terminal());
        assert_eq!(record.reject_reason, Some(RejectReason::Paused));
        assert_eq!(record.source_name(), Some("tavily"));
    }

    #[test]
    fn test_record_json_shape() {
        let record = TaskRecord::new(
            TaskKind::Cleanup { retention_days: 30 },
            TriggerKind::Scheduled,
            &Admission::Admitted { degraded: false, concurrency_cap: 1 },
        );
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["kind"], "cleanup");
        assert_eq!(json["retention_days"], 30);
        assert_eq!(json["outcome"], "PENDING");
        assert_eq!(json["trigger"], "SCHEDULED");
        assert!(json.get("reject_reason").is_none());
    }

    #[test]
    fn test_reason_codes() {
        assert_eq!(RejectReason::Paused.code(), "PAUSED");
        assert_eq!(
            serde_json::to_string(&RejectReason::ConcurrencyLimit).unwrap(),
            "\"CONCURRENCY_LIMIT\""
        );
        assert_eq!(RejectReason::PriorityExcluded.to_string(), "PRIORITY_EXCLUDED");
    }
}
