//! A scheduling unit wrapping one signing identity.

use crate::chain::{KeyHandle, NetworkId};
use crate::error::{Error, Result};
use crate::events::{AgentEvent, EventBus, TaskEvent};
use crate::executor::{ExecutionOptions, TransactionExecutor, TransactionParams};
use crate::task::{Task, TaskPayload, TaskResult, TaskStatus};
use crate::types::{AgentId, TaskId, Timestamp};
use alloy_primitives::Address;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const DEFAULT_MAX_CONCURRENT_TASKS: usize = 3;

fn default_max_concurrent_tasks() -> usize {
    DEFAULT_MAX_CONCURRENT_TASKS
}

/// Agent status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Idle,
    Busy,
    Offline,
    Error,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Busy => "busy",
            AgentStatus::Offline => "offline",
            AgentStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registration parameters for an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    pub id: AgentId,
    pub name: String,
    pub network: NetworkId,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
}

impl AgentConfig {
    pub fn new(id: impl Into<AgentId>, network: NetworkId) -> Self {
        let id = id.into();
        Self {
            name: id.to_string(),
            id,
            network,
            capabilities: Vec::new(),
            max_concurrent_tasks: DEFAULT_MAX_CONCURRENT_TASKS,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_max_concurrent_tasks(mut self, max: usize) -> Self {
        self.max_concurrent_tasks = max;
        self
    }
}

/// Point-in-time view of an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInfo {
    pub id: AgentId,
    pub name: String,
    pub address: Address,
    pub network: NetworkId,
    pub capabilities: Vec<String>,
    pub status: AgentStatus,
    pub current_tasks: usize,
    pub max_concurrent_tasks: usize,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
}

#[derive(Default)]
struct AgentState {
    status: AgentStatus,
    running: HashSet<TaskId>,
    completed: u64,
    failed: u64,
}

/// Wraps one signing key and runs tasks with it.
pub struct ChainAgent {
    config: AgentConfig,
    key: KeyHandle,
    executor: Arc<TransactionExecutor>,
    options: ExecutionOptions,
    state: Mutex<AgentState>,
    agent_events: EventBus<AgentEvent>,
    task_events: EventBus<TaskEvent>,
}

impl ChainAgent {
    pub fn new(
        config: AgentConfig,
        key: KeyHandle,
        executor: Arc<TransactionExecutor>,
        options: ExecutionOptions,
        agent_events: EventBus<AgentEvent>,
        task_events: EventBus<TaskEvent>,
    ) -> Self {
        Self {
            config,
            key,
            executor,
            options,
            state: Mutex::new(AgentState::default()),
            agent_events,
            task_events,
        }
    }

    pub fn id(&self) -> &AgentId {
        &self.config.id
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn key(&self) -> &KeyHandle {
        &self.key
    }

    pub fn address(&self) -> Address {
        self.key.address
    }

    pub fn status(&self) -> AgentStatus {
        self.state.lock().status
    }

    pub fn current_task_count(&self) -> usize {
        self.state.lock().running.len()
    }

    pub fn info(&self) -> AgentInfo {
        let state = self.state.lock();
        AgentInfo {
            id: self.config.id.clone(),
            name: self.config.name.clone(),
            address: self.key.address,
            network: self.key.network,
            capabilities: self.config.capabilities.clone(),
            status: state.status,
            current_tasks: state.running.len(),
            max_concurrent_tasks: self.config.max_concurrent_tasks,
            completed_tasks: state.completed,
            failed_tasks: state.failed,
        }
    }

    /// Idle and below the concurrency cap.
    pub fn is_available(&self) -> bool {
        let state = self.state.lock();
        Self::available(&state, self.config.max_concurrent_tasks)
    }

    /// Available, and none of the task's dependencies is running on this agent.
    pub fn can_execute_task(&self, task: &Task) -> bool {
        let state = self.state.lock();
        self.executable(&state, task)
    }

    fn available(state: &AgentState, max: usize) -> bool {
        state.status == AgentStatus::Idle && state.running.len() < max
    }

    fn executable(&self, state: &AgentState, task: &Task) -> bool {
        Self::available(state, self.config.max_concurrent_tasks)
            && !task.dependencies.iter().any(|dep| state.running.contains(dep))
    }

    /// Take the agent out of rotation or bring it back.
    pub fn set_status(&self, status: AgentStatus) {
        let previous = {
            let mut state = self.state.lock();
            std::mem::replace(&mut state.status, status)
        };
        self.emit_status_change(previous, status);
    }

    /// Run `task` to completion. Fails only when the agent can't take it;
    /// execution failures are reported in the returned [`TaskResult`].
    pub async fn execute_task(&self, task: &Task) -> Result<TaskResult> {
        let previous = {
            let mut state = self.state.lock();
            if !self.executable(&state, task) {
                return Err(Error::TaskSchedulingFailed {
                    task_id: task.id.clone(),
                    agent_id: self.config.id.clone(),
                });
            }
            state.running.insert(task.id.clone());
            std::mem::replace(&mut state.status, AgentStatus::Busy)
        };
        self.emit_status_change(previous, AgentStatus::Busy);

        let started_at = Timestamp::now();
        self.task_events.emit(&TaskEvent::Assigned {
            task_id: task.id.clone(),
            agent_id: self.config.id.clone(),
            timestamp: started_at,
        });
        debug!(agent_id = %self.config.id, task_id = %task.id, "Task started");

        let outcome = match task.timeout() {
            Some(limit) => match tokio::time::timeout(limit, self.run_payload(task)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(Error::TaskTimedOut {
                    task_id: task.id.clone(),
                    timeout_ms: task.timeout_ms.unwrap_or_default(),
                }),
            },
            None => self.run_payload(task).await,
        };
        let completed_at = Timestamp::now();

        let (previous, now_status) = {
            let mut state = self.state.lock();
            state.running.remove(&task.id);
            match outcome {
                Ok(_) => state.completed += 1,
                Err(_) => state.failed += 1,
            }
            let previous = state.status;
            if state.running.is_empty() && state.status == AgentStatus::Busy {
                state.status = AgentStatus::Idle;
            }
            (previous, state.status)
        };
        self.emit_status_change(previous, now_status);

        let result = match outcome {
            Ok(PayloadOutput { output, retries }) => {
                info!(agent_id = %self.config.id, task_id = %task.id, "Task completed");
                self.task_events.emit(&TaskEvent::Completed {
                    task_id: task.id.clone(),
                    agent_id: self.config.id.clone(),
                    duration_ms: completed_at.millis_since(started_at),
                    timestamp: completed_at,
                });
                TaskResult {
                    task_id: task.id.clone(),
                    agent_id: Some(self.config.id.clone()),
                    status: TaskStatus::Completed,
                    output: Some(output),
                    error: None,
                    error_kind: None,
                    retries,
                    started_at,
                    completed_at,
                }
            }
            Err(err) => {
                warn!(agent_id = %self.config.id, task_id = %task.id, error = %err, "Task failed");
                self.task_events.emit(&TaskEvent::Failed {
                    task_id: task.id.clone(),
                    agent_id: Some(self.config.id.clone()),
                    error: err.to_string(),
                    timestamp: completed_at,
                });
                let status = match err {
                    Error::TaskTimedOut { .. } => TaskStatus::Timeout,
                    _ => TaskStatus::Failed,
                };
                let retries = match &err {
                    Error::RetryLimitExceeded { retries, .. } => *retries,
                    _ => 0,
                };
                TaskResult {
                    task_id: task.id.clone(),
                    agent_id: Some(self.config.id.clone()),
                    status,
                    output: None,
                    error: Some(err.to_string()),
                    error_kind: Some(err.kind()),
                    retries,
                    started_at,
                    completed_at,
                }
            }
        };
        Ok(result)
    }

    async fn run_payload(&self, task: &Task) -> Result<PayloadOutput> {
        match &task.payload {
            TaskPayload::Transaction(request) => {
                let params = TransactionParams {
                    network: self.key.network,
                    from: self.key.address,
                    request: request.clone(),
                };
                let mut options = self.options;
                if let Some(policy) = task.retry_policy {
                    options.retry = policy;
                }
                let outcome = self.executor.execute_transaction(&params, &options).await?;
                Ok(PayloadOutput {
                    retries: outcome.retries,
                    output: serde_json::to_value(&outcome)?,
                })
            }
            TaskPayload::Custom { action, .. } => Err(Error::TaskExecutionFailed {
                task_id: task.id.clone(),
                reason: format!("custom action '{action}' is not supported"),
            }),
        }
    }

    fn emit_status_change(&self, from: AgentStatus, to: AgentStatus) {
        if from == to {
            return;
        }
        self.agent_events.emit(&AgentEvent::StatusChanged {
            agent_id: self.config.id.clone(),
            from,
            to,
            timestamp: Timestamp::now(),
        });
    }
}

struct PayloadOutput {
    output: serde_json::Value,
    retries: u32,
}
