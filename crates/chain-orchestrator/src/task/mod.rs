//! Task model and the priority queue that holds submitted tasks.

mod priority;
mod queue;

pub use priority::{ParsePriorityError, TaskPriority};
pub use queue::{TaskQueue, TaskStats};

use crate::error::ErrorKind;
use crate::executor::{RetryPolicy, TransactionRequest};
use crate::types::{AgentId, TaskId, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Task status
///
/// `Pending -> Queued -> Scheduled -> Running -> {Completed | Failed | Cancelled | Timeout}`.
/// `Queued` is also where a task lands when dispatch finds no eligible agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Accepted, waiting for the scheduler
    #[default]
    Pending,
    /// Waiting again after a dispatch attempt found no agent
    Queued,
    /// Claimed by `get_next_task`, not yet running
    Scheduled,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Queued => "queued",
            TaskStatus::Scheduled => "scheduled",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Timeout => "timeout",
        }
    }

    /// Eligible to be handed out by the queue
    pub fn is_ready(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Queued)
    }

    /// Check if this is a terminal status
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Timeout
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a task does when it runs. Externally tagged: `{"transaction": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPayload {
    /// Send a transaction from the executing agent's key.
    Transaction(TransactionRequest),
    /// Opaque action for callers that extend the orchestrator.
    Custom {
        action: String,
        #[serde(default)]
        params: serde_json::Value,
    },
}

impl TaskPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            TaskPayload::Transaction(_) => "transaction",
            TaskPayload::Custom { .. } => "custom",
        }
    }
}

/// A unit of schedulable work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub priority: TaskPriority,
    pub payload: TaskPayload,
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    /// Upper bound on a single dispatch.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Overrides the executor's retry defaults for this task's transaction.
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
    pub created_at: Timestamp,
    #[serde(default)]
    pub started_at: Option<Timestamp>,
    #[serde(default)]
    pub completed_at: Option<Timestamp>,
}

impl Task {
    pub fn new(id: impl Into<TaskId>, name: impl Into<String>, payload: TaskPayload) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            priority: TaskPriority::default(),
            payload,
            dependencies: Vec::new(),
            timeout_ms: None,
            retry_policy: None,
            created_at: Timestamp::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<TaskId>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Outcome of one execution of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub task_id: TaskId,
    pub agent_id: Option<AgentId>,
    pub status: TaskStatus,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    /// Transaction retries consumed before the final outcome.
    pub retries: u32,
    pub started_at: Timestamp,
    pub completed_at: Timestamp,
}

impl TaskResult {
    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Completed
    }

    pub fn duration_ms(&self) -> u64 {
        self.completed_at.millis_since(self.started_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_and_ready_states_do_not_overlap() {
        let all = [
            TaskStatus::Pending,
            TaskStatus::Queued,
            TaskStatus::Scheduled,
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
            TaskStatus::Timeout,
        ];
        for status in all {
            assert!(!(status.is_ready() && status.is_terminal()), "{status}");
        }
        assert!(TaskStatus::Queued.is_ready());
        assert!(!TaskStatus::Scheduled.is_ready());
        assert!(TaskStatus::Timeout.is_terminal());
    }

    #[test]
    fn payload_serializes_with_variant_key() {
        let payload = TaskPayload::Custom {
            action: "rebalance".into(),
            params: serde_json::json!({ "pool": "eth-usdc" }),
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["custom"]["action"], "rebalance");
        assert_eq!(value["custom"]["params"]["pool"], "eth-usdc");
        assert_eq!(payload.kind(), "custom");
    }

    #[test]
    fn builder_sets_optional_fields() {
        let task = Task::new("t1", "noop", TaskPayload::Custom {
            action: "noop".into(),
            params: serde_json::Value::Null,
        })
        .with_priority(TaskPriority::High)
        .with_dependencies(vec![TaskId::from("t0")])
        .with_timeout(Duration::from_secs(5));

        assert_eq!(task.priority, TaskPriority::High);
        assert_eq!(task.dependencies, vec![TaskId::from("t0")]);
        assert_eq!(task.timeout(), Some(Duration::from_secs(5)));
        assert!(task.retry_policy.is_none());
    }
}
