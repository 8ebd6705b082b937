//! Agent registry, task submission and the background scheduling loop.

use crate::agent::{AgentConfig, AgentInfo, AgentStatus, ChainAgent};
use crate::approval::ApprovalGate;
use crate::chain::{ChainClient, ChainDirectory, SigningService};
use crate::config::OrchestratorConfig;
use crate::error::{Error, Result};
use crate::events::{AgentEvent, EventBus, Subscription, TaskEvent, TransactionEvent};
use crate::executor::{
    ExecutionOptions, TransactionExecutor, TransactionOutcome, TransactionParams, TransactionStatus,
};
use crate::rate_limit::TransactionRateLimiter;
use crate::task::{Task, TaskQueue, TaskResult, TaskStats, TaskStatus};
use crate::types::{AgentId, TaskId, Timestamp};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const RATE_LIMIT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Per-status agent counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStats {
    pub total: usize,
    pub idle: usize,
    pub busy: usize,
    pub offline: usize,
    pub error: usize,
}

/// Snapshot returned by [`AgentManager::get_stats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorStats {
    pub agents: AgentStats,
    pub tasks: TaskStats,
    pub scheduler_running: bool,
    pub uptime_ms: u64,
}

struct Scheduler {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct ManagerInner {
    config: OrchestratorConfig,
    options: ExecutionOptions,
    signer: Arc<dyn SigningService>,
    directory: Arc<dyn ChainDirectory>,
    executor: Arc<TransactionExecutor>,
    approvals: ApprovalGate,
    /// Registration order; first-fit dispatch walks it front to back.
    agents: RwLock<Vec<Arc<ChainAgent>>>,
    queue: TaskQueue,
    agent_events: EventBus<AgentEvent>,
    task_events: EventBus<TaskEvent>,
    scheduler: Mutex<Option<Scheduler>>,
    shut_down: AtomicBool,
    started: Instant,
}

/// Top-level coordinator: owns the agents and the task queue.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct AgentManager {
    inner: Arc<ManagerInner>,
}

impl AgentManager {
    pub fn new(
        config: OrchestratorConfig,
        signer: Arc<dyn SigningService>,
        chain: Arc<dyn ChainClient>,
        directory: Arc<dyn ChainDirectory>,
    ) -> Self {
        let mut executor = TransactionExecutor::new(signer.clone(), chain, directory.clone())
            .with_limits(config.execution.validation.clone());
        if config.rate_limits.enabled {
            executor = executor.with_rate_limiter(Arc::new(TransactionRateLimiter::new(
                config.rate_limits.transactions.clone(),
            )));
        }

        Self {
            inner: Arc::new(ManagerInner {
                options: config.execution.options(),
                approvals: ApprovalGate::new(config.approval.clone()),
                config,
                signer,
                directory,
                executor: Arc::new(executor),
                agents: RwLock::new(Vec::new()),
                queue: TaskQueue::new(),
                agent_events: EventBus::new("agent"),
                task_events: EventBus::new("task"),
                scheduler: Mutex::new(None),
                shut_down: AtomicBool::new(false),
                started: Instant::now(),
            }),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub fn executor(&self) -> &Arc<TransactionExecutor> {
        &self.inner.executor
    }

    pub fn approvals(&self) -> &ApprovalGate {
        &self.inner.approvals
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(Error::ShutDown);
        }
        Ok(())
    }

    // Agents

    /// Register an agent, provisioning a fresh signing key on its network.
    pub async fn add_agent(&self, mut config: AgentConfig) -> Result<AgentInfo> {
        self.ensure_open()?;
        if self.find_agent(&config.id).is_some() {
            return Err(Error::AgentAlreadyExists {
                agent_id: config.id,
            });
        }
        self.inner.directory.resolve(config.network)?;
        if config.max_concurrent_tasks == 0 {
            config.max_concurrent_tasks = self.inner.config.scheduler.default_max_concurrent_tasks;
        }

        let key = self.inner.signer.generate_key(config.network).await?;
        let agent = Arc::new(ChainAgent::new(
            config,
            key,
            self.inner.executor.clone(),
            self.inner.options,
            self.inner.agent_events.clone(),
            self.inner.task_events.clone(),
        ));

        {
            // Re-check: another registration may have won while the key was generated.
            let mut agents = self.inner.agents.write();
            if agents.iter().any(|existing| existing.id() == agent.id()) {
                return Err(Error::AgentAlreadyExists {
                    agent_id: agent.id().clone(),
                });
            }
            agents.push(agent.clone());
        }

        let info = agent.info();
        info!(
            agent_id = %info.id,
            address = %info.address,
            network = info.network,
            "Agent registered"
        );
        self.inner.agent_events.emit(&AgentEvent::Created {
            agent_id: info.id.clone(),
            address: info.address.to_string(),
            network: info.network,
            timestamp: Timestamp::now(),
        });
        Ok(info)
    }

    /// Detach an agent. A task it is running finishes on the detached agent
    /// and its result is still recorded.
    pub fn remove_agent(&self, agent_id: &AgentId) -> Result<AgentInfo> {
        let agent = {
            let mut agents = self.inner.agents.write();
            let index = agents
                .iter()
                .position(|agent| agent.id() == agent_id)
                .ok_or_else(|| Error::AgentNotFound {
                    agent_id: agent_id.clone(),
                })?;
            agents.remove(index)
        };

        let info = agent.info();
        if info.current_tasks > 0 {
            warn!(
                agent_id = %agent_id,
                in_flight = info.current_tasks,
                "Removed agent still has tasks in flight"
            );
        }
        info!(agent_id = %agent_id, "Agent removed");
        self.inner.agent_events.emit(&AgentEvent::Removed {
            agent_id: agent_id.clone(),
            timestamp: Timestamp::now(),
        });
        Ok(info)
    }

    fn find_agent(&self, agent_id: &AgentId) -> Option<Arc<ChainAgent>> {
        self.inner
            .agents
            .read()
            .iter()
            .find(|agent| agent.id() == agent_id)
            .cloned()
    }

    pub fn get_agent(&self, agent_id: &AgentId) -> Option<AgentInfo> {
        self.find_agent(agent_id).map(|agent| agent.info())
    }

    pub fn list_agents(&self) -> Vec<AgentInfo> {
        self.inner.agents.read().iter().map(|agent| agent.info()).collect()
    }

    /// Put an agent in or out of rotation.
    pub fn set_agent_status(&self, agent_id: &AgentId, status: AgentStatus) -> Result<()> {
        let agent = self.find_agent(agent_id).ok_or_else(|| Error::AgentNotFound {
            agent_id: agent_id.clone(),
        })?;
        agent.set_status(status);
        Ok(())
    }

    // Tasks

    /// Queue a task. When `assign_to_agent` is given the agent must exist and be
    /// able to take the task now; dispatch still happens through the scheduler
    /// or [`AgentManager::execute_task`].
    pub fn schedule_task(&self, task: Task, assign_to_agent: Option<&AgentId>) -> Result<TaskId> {
        self.ensure_open()?;
        let queue = &self.inner.queue;
        if queue.contains(&task.id) {
            return Err(Error::TaskAlreadyExists { task_id: task.id });
        }
        if let Some(dependency) = task.dependencies.iter().find(|dep| !queue.contains(dep)) {
            return Err(Error::InvalidTaskDependency {
                task_id: task.id.clone(),
                dependency: dependency.clone(),
            });
        }
        if let Some(agent_id) = assign_to_agent {
            let agent = self.find_agent(agent_id).ok_or_else(|| Error::AgentNotFound {
                agent_id: agent_id.clone(),
            })?;
            if !agent.can_execute_task(&task) {
                return Err(Error::TaskSchedulingFailed {
                    task_id: task.id.clone(),
                    agent_id: agent_id.clone(),
                });
            }
        }

        let task_id = task.id.clone();
        let priority = task.priority;
        queue.add_task(task)?;
        debug!(task_id = %task_id, priority = %priority, "Task queued");
        self.inner.task_events.emit(&TaskEvent::Queued {
            task_id: task_id.clone(),
            priority,
            timestamp: Timestamp::now(),
        });
        Ok(task_id)
    }

    /// Dispatch a task now on the first agent that can take it.
    pub async fn execute_task(&self, task_id: &TaskId) -> Result<TaskResult> {
        self.ensure_open()?;
        let queue = &self.inner.queue;
        let task = queue.claim(task_id)?;
        let Some(agent) = self.first_eligible_agent(&task, &HashSet::new()) else {
            queue.update_task_status(task_id, TaskStatus::Queued)?;
            return Err(Error::NoAvailableAgents {
                task_id: task_id.clone(),
            });
        };
        self.run_on_agent(agent, task).await
    }

    fn first_eligible_agent(&self, task: &Task, skip: &HashSet<AgentId>) -> Option<Arc<ChainAgent>> {
        self.inner
            .agents
            .read()
            .iter()
            .find(|agent| !skip.contains(agent.id()) && agent.can_execute_task(task))
            .cloned()
    }

    async fn run_on_agent(&self, agent: Arc<ChainAgent>, task: Task) -> Result<TaskResult> {
        let result = match agent.execute_task(&task).await {
            Ok(result) => result,
            Err(err) => {
                // Lost a race for the agent; back to the queue.
                self.requeue(&task.id);
                return Err(err);
            }
        };
        self.record_result(&result);
        Ok(result)
    }

    fn requeue(&self, task_id: &TaskId) {
        if let Err(err) = self.inner.queue.update_task_status(task_id, TaskStatus::Queued) {
            debug!(task_id = %task_id, error = %err, "Task vanished before requeue");
        }
    }

    fn record_result(&self, result: &TaskResult) {
        let queue = &self.inner.queue;
        if queue.get_status(&result.task_id) == Some(TaskStatus::Cancelled) {
            debug!(task_id = %result.task_id, "Task was cancelled while running, result dropped");
            return;
        }
        if let Err(err) = queue.set_result(result.clone()) {
            debug!(task_id = %result.task_id, error = %err, "Task removed before its result arrived");
        }
    }

    /// Cancel a task that has not finished. A running task keeps running on its
    /// agent, but its result is discarded.
    pub fn cancel_task(&self, task_id: &TaskId) -> Result<()> {
        let queue = &self.inner.queue;
        let status = queue.get_status(task_id).ok_or_else(|| Error::TaskNotFound {
            task_id: task_id.clone(),
        })?;
        if status.is_terminal() {
            return Err(Error::TaskNotRunnable {
                task_id: task_id.clone(),
                status,
            });
        }
        queue.update_task_status(task_id, TaskStatus::Cancelled)?;
        info!(task_id = %task_id, previous = %status, "Task cancelled");
        self.inner.task_events.emit(&TaskEvent::Cancelled {
            task_id: task_id.clone(),
            timestamp: Timestamp::now(),
        });
        Ok(())
    }

    /// Remove finished tasks from the queue. Returns how many were removed.
    pub fn cleanup_finished_tasks(&self) -> usize {
        let removed = self.inner.queue.remove_terminal();
        if removed > 0 {
            debug!(removed, "Cleaned up finished tasks");
        }
        removed
    }

    pub fn get_task(&self, task_id: &TaskId) -> Option<Task> {
        self.inner.queue.get_task(task_id)
    }

    pub fn get_task_status(&self, task_id: &TaskId) -> Option<TaskStatus> {
        self.inner.queue.get_status(task_id)
    }

    pub fn get_task_result(&self, task_id: &TaskId) -> Option<TaskResult> {
        self.inner.queue.get_result(task_id)
    }

    // Approvals

    /// Execute an approved transaction from `agent_id`'s key and record the
    /// outcome on the approval gate. The approval is claimed before signing,
    /// so concurrent callers cannot run it twice.
    pub async fn execute_approved_transaction(
        &self,
        approval_id: &str,
        agent_id: &AgentId,
    ) -> Result<TransactionOutcome> {
        self.ensure_open()?;
        let approvals = &self.inner.approvals;
        let pending = approvals
            .get_transaction(approval_id)
            .ok_or_else(|| Error::ApprovalNotFound {
                id: approval_id.to_string(),
            })?;
        let agent = self.find_agent(agent_id).ok_or_else(|| Error::AgentNotFound {
            agent_id: agent_id.clone(),
        })?;
        let key = agent.key();
        if key.address != pending.from || key.network != pending.network {
            return Err(Error::InvalidKey {
                key_id: crate::chain::key_id(pending.network, &pending.from),
            });
        }

        let claimed = approvals.begin_execution(approval_id)?;
        let params = TransactionParams {
            network: claimed.network,
            from: claimed.from,
            request: claimed.to_request(),
        };
        match self
            .inner
            .executor
            .execute_transaction(&params, &self.inner.options)
            .await
        {
            Ok(outcome) => {
                if let Err(err) = approvals.mark_executed(approval_id, outcome.tx_hash.clone()) {
                    warn!(
                        id = approval_id,
                        tx_hash = %outcome.tx_hash,
                        error = %err,
                        "Executed transaction could not be recorded"
                    );
                }
                Ok(outcome)
            }
            Err(err) => {
                if let Err(record_err) = approvals.mark_failed(approval_id, err.to_string()) {
                    warn!(id = approval_id, error = %record_err, "Failed transaction could not be recorded");
                }
                Err(err)
            }
        }
    }

    // Events

    pub fn subscribe_agent_events<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&AgentEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner.agent_events.subscribe(handler)
    }

    pub fn subscribe_task_events<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&TaskEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner.task_events.subscribe(handler)
    }

    pub fn subscribe_transaction_events<F>(
        &self,
        status: Option<TransactionStatus>,
        handler: F,
    ) -> Subscription
    where
        F: Fn(&TransactionEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner.executor.subscribe(status, handler)
    }

    // Stats

    pub fn get_stats(&self) -> OrchestratorStats {
        let mut agents = AgentStats::default();
        for agent in self.inner.agents.read().iter() {
            agents.total += 1;
            match agent.status() {
                AgentStatus::Idle => agents.idle += 1,
                AgentStatus::Busy => agents.busy += 1,
                AgentStatus::Offline => agents.offline += 1,
                AgentStatus::Error => agents.error += 1,
            }
        }
        OrchestratorStats {
            agents,
            tasks: self.inner.queue.get_stats(),
            scheduler_running: self.is_running(),
            uptime_ms: u64::try_from(self.inner.started.elapsed().as_millis()).unwrap_or(u64::MAX),
        }
    }

    // Scheduling loop

    pub fn is_running(&self) -> bool {
        self.inner.scheduler.lock().is_some()
    }

    /// Start the background scheduling loop. Calling it again while running
    /// does nothing. Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<()> {
        self.ensure_open()?;
        let mut scheduler = self.inner.scheduler.lock();
        if scheduler.is_some() {
            return Ok(());
        }

        let (shutdown, mut stopped) = watch::channel(false);
        let manager = self.clone();
        let tick = self.inner.config.scheduler.tick_interval();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut sweep = tokio::time::interval(RATE_LIMIT_SWEEP_INTERVAL);
            sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        manager.dispatch_ready();
                    }
                    _ = sweep.tick() => {
                        manager.sweep_rate_limits();
                    }
                    _ = stopped.changed() => break,
                }
            }
            debug!("Scheduling loop stopped");
        });

        info!(tick_ms = tick.as_millis() as u64, "Scheduling loop started");
        *scheduler = Some(Scheduler { shutdown, handle });
        Ok(())
    }

    /// Stop the scheduling loop. Stopping a stopped loop does nothing.
    pub async fn stop(&self) {
        let scheduler = self.inner.scheduler.lock().take();
        if let Some(Scheduler { shutdown, handle }) = scheduler {
            let _ = shutdown.send(true);
            if let Err(err) = handle.await {
                warn!(error = %err, "Scheduling loop ended abnormally");
            }
        }
    }

    /// One scheduling pass: hand ready tasks to eligible agents until either runs out.
    pub fn dispatch_ready(&self) -> usize {
        let mut claimed: HashSet<AgentId> = HashSet::new();
        let mut dispatched = 0;

        while let Some(task) = self.inner.queue.get_next_task() {
            let Some(agent) = self.first_eligible_agent(&task, &claimed) else {
                self.requeue(&task.id);
                break;
            };
            if let Err(err) = self.inner.queue.claim(&task.id) {
                debug!(task_id = %task.id, error = %err, "Task claimed elsewhere before dispatch");
                continue;
            }
            claimed.insert(agent.id().clone());
            dispatched += 1;

            let manager = self.clone();
            tokio::spawn(async move {
                let task_id = task.id.clone();
                let agent_id = agent.id().clone();
                if let Err(err) = manager.run_on_agent(agent, task).await {
                    error!(task_id = %task_id, agent_id = %agent_id, error = %err, "Background dispatch failed");
                }
            });
        }
        dispatched
    }

    /// Drop rate-limit windows that no longer hold any request.
    pub fn sweep_rate_limits(&self) -> usize {
        let Some(limiter) = self.inner.executor.rate_limiter() else {
            return 0;
        };
        let removed = limiter.cleanup();
        if removed > 0 {
            debug!(removed, "Evicted idle rate-limit windows");
        }
        removed
    }

    /// Stop the loop and drop all agents, tasks and subscribers. Idempotent.
    pub async fn shutdown(&self) {
        self.stop().await;
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.agents.write().clear();
        self.inner.queue.clear();
        self.inner.agent_events.clear();
        self.inner.task_events.clear();
        self.inner.executor.events().clear();
        info!("Agent manager shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::ApprovalStatus;
    use crate::chain::{InMemorySigner, MockChainClient, StaticChainDirectory};
    use crate::error::ErrorKind;
    use crate::executor::TransactionRequest;
    use crate::task::{TaskPayload, TaskPriority};
    use alloy_primitives::U256;
    use std::time::Duration;

    fn manager_with(chain: Arc<MockChainClient>) -> AgentManager {
        AgentManager::new(
            OrchestratorConfig::default(),
            Arc::new(InMemorySigner::new()),
            chain,
            Arc::new(StaticChainDirectory::default()),
        )
    }

    fn manager() -> AgentManager {
        manager_with(Arc::new(MockChainClient::new()))
    }

    fn transfer(id: &str) -> Task {
        Task::new(
            id,
            "transfer",
            TaskPayload::Transaction(TransactionRequest::transfer(
                "0x5555555555555555555555555555555555555555",
                U256::from(10u64),
            )),
        )
    }

    #[tokio::test]
    async fn duplicate_agent_is_rejected() {
        let manager = manager();
        manager.add_agent(AgentConfig::new("a1", 1)).await.unwrap();
        let err = manager.add_agent(AgentConfig::new("a1", 1)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateEntity);
        assert!(err.to_string().contains("Agent already exists"));
        assert_eq!(manager.list_agents().len(), 1);
    }

    #[tokio::test]
    async fn agent_on_unknown_network_is_rejected() {
        let manager = manager();
        let err = manager.add_agent(AgentConfig::new("a1", 4242)).await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedNetwork { network_id: 4242 }));
    }

    #[tokio::test]
    async fn unknown_dependency_fails_submission() {
        let manager = manager();
        let err = manager
            .schedule_task(transfer("t2").with_dependencies(vec![TaskId::from("t1")]), None)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTaskDependency { .. }));
        assert!(manager.get_task(&TaskId::from("t2")).is_none());

        manager.schedule_task(transfer("t1"), None).unwrap();
        manager
            .schedule_task(transfer("t2").with_dependencies(vec![TaskId::from("t1")]), None)
            .unwrap();
    }

    #[tokio::test]
    async fn assign_to_agent_is_validated_eagerly() {
        let manager = manager();
        let err = manager
            .schedule_task(transfer("t"), Some(&AgentId::from("ghost")))
            .unwrap_err();
        assert!(matches!(err, Error::AgentNotFound { .. }));

        manager.add_agent(AgentConfig::new("a1", 1)).await.unwrap();
        manager
            .schedule_task(transfer("t"), Some(&AgentId::from("a1")))
            .unwrap();
        assert_eq!(
            manager.get_task_status(&TaskId::from("t")),
            Some(TaskStatus::Pending)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn execute_task_runs_on_first_fit_agent() {
        let manager = manager();
        manager.add_agent(AgentConfig::new("a1", 1)).await.unwrap();
        manager.add_agent(AgentConfig::new("a2", 1)).await.unwrap();
        let id = manager.schedule_task(transfer("t"), None).unwrap();

        let result = manager.execute_task(&id).await.unwrap();
        assert!(result.is_success());
        assert_eq!(result.agent_id, Some(AgentId::from("a1")));
        assert_eq!(manager.get_task_status(&id), Some(TaskStatus::Completed));
        assert_eq!(manager.get_task_result(&id), Some(result));

        let err = manager.execute_task(&id).await.unwrap_err();
        assert!(matches!(err, Error::TaskNotRunnable { .. }));
    }

    #[tokio::test]
    async fn no_agents_reverts_task_to_queued() {
        let manager = manager();
        let id = manager.schedule_task(transfer("t"), None).unwrap();
        let err = manager.execute_task(&id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unavailable);
        assert_eq!(manager.get_task_status(&id), Some(TaskStatus::Queued));
    }

    #[tokio::test]
    async fn cancel_and_cleanup() {
        let manager = manager();
        let id = manager.schedule_task(transfer("t"), None).unwrap();
        manager.schedule_task(transfer("other"), None).unwrap();

        manager.cancel_task(&id).unwrap();
        assert_eq!(manager.get_task_status(&id), Some(TaskStatus::Cancelled));
        assert!(matches!(
            manager.cancel_task(&id),
            Err(Error::TaskNotRunnable { .. })
        ));

        assert_eq!(manager.cleanup_finished_tasks(), 1);
        assert!(manager.get_task(&id).is_none());
        assert_eq!(manager.get_stats().tasks.total, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn scheduling_loop_drains_queue_by_priority() {
        let manager = manager();
        manager
            .add_agent(AgentConfig::new("a1", 1).with_max_concurrent_tasks(1))
            .await
            .unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let sink = order.clone();
        manager.subscribe_task_events(move |event| {
            if let TaskEvent::Assigned { task_id, .. } = event {
                sink.lock().push(task_id.to_string());
            }
            Ok(())
        });

        manager
            .schedule_task(transfer("T1").with_priority(TaskPriority::Low), None)
            .unwrap();
        manager
            .schedule_task(transfer("T2").with_priority(TaskPriority::Critical), None)
            .unwrap();
        manager
            .schedule_task(transfer("T3").with_priority(TaskPriority::Normal), None)
            .unwrap();

        manager.start().unwrap();
        manager.start().unwrap();
        assert!(manager.is_running());

        tokio::time::sleep(Duration::from_secs(10)).await;
        manager.stop().await;
        manager.stop().await;
        assert!(!manager.is_running());

        assert_eq!(*order.lock(), vec!["T2", "T3", "T1"]);
        assert_eq!(manager.get_stats().tasks.completed, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn removed_agent_still_records_in_flight_result() {
        let chain = Arc::new(MockChainClient::new());
        chain.set_receipt_delay(Duration::from_secs(2));
        let manager = manager_with(chain);
        manager.add_agent(AgentConfig::new("a1", 1)).await.unwrap();
        let id = manager.schedule_task(transfer("t"), None).unwrap();

        let runner = manager.clone();
        let task_id = id.clone();
        let running = tokio::spawn(async move { runner.execute_task(&task_id).await });
        tokio::task::yield_now().await;

        manager.remove_agent(&AgentId::from("a1")).unwrap();
        assert!(manager.list_agents().is_empty());

        assert!(running.await.unwrap().unwrap().is_success());
        assert_eq!(manager.get_task_status(&id), Some(TaskStatus::Completed));
    }

    #[tokio::test(start_paused = true)]
    async fn approved_transaction_executes_once() {
        let manager = manager();
        let agent = manager.add_agent(AgentConfig::new("a1", 1)).await.unwrap();
        let request = TransactionRequest::transfer(
            "0x6666666666666666666666666666666666666666",
            U256::from(1u64),
        );
        let prepared = manager
            .approvals()
            .prepare_transaction(1, agent.address, &request)
            .unwrap();

        let err = manager
            .execute_approved_transaction(&prepared.id, &agent.id)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ApprovalNotPending { status: ApprovalStatus::Pending, .. }));

        manager
            .approvals()
            .authorize_transaction(&prepared.id, &prepared.approval_token)
            .unwrap();
        let outcome = manager
            .execute_approved_transaction(&prepared.id, &agent.id)
            .await
            .unwrap();
        let recorded = manager.approvals().get_transaction(&prepared.id).unwrap();
        assert_eq!(recorded.status, ApprovalStatus::Executed);
        assert_eq!(recorded.tx_hash, Some(outcome.tx_hash));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_approved_executions_broadcast_once() {
        let chain = Arc::new(MockChainClient::new());
        chain.set_receipt_delay(Duration::from_millis(10));
        let manager = manager_with(chain.clone());
        let agent = manager.add_agent(AgentConfig::new("a1", 1)).await.unwrap();
        let request = TransactionRequest::transfer(
            "0x6666666666666666666666666666666666666666",
            U256::from(1u64),
        );
        let prepared = manager
            .approvals()
            .prepare_transaction(1, agent.address, &request)
            .unwrap();
        manager
            .approvals()
            .authorize_transaction(&prepared.id, &prepared.approval_token)
            .unwrap();

        let (first, second) = tokio::join!(
            manager.execute_approved_transaction(&prepared.id, &agent.id),
            manager.execute_approved_transaction(&prepared.id, &agent.id),
        );
        let (winner, loser) = match (first, second) {
            (Ok(outcome), Err(err)) | (Err(err), Ok(outcome)) => (outcome, err),
            other => panic!("expected exactly one execution, got {other:?}"),
        };
        assert!(matches!(
            loser,
            Error::ApprovalNotPending {
                status: ApprovalStatus::Executing,
                ..
            }
        ));
        assert_eq!(chain.broadcast_count(), 1);

        let recorded = manager.approvals().get_transaction(&prepared.id).unwrap();
        assert_eq!(recorded.status, ApprovalStatus::Executed);
        assert_eq!(recorded.tx_hash, Some(winner.tx_hash));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_rate_limit_windows_are_swept() {
        let manager = manager();
        manager.add_agent(AgentConfig::new("a1", 1)).await.unwrap();
        let id = manager.schedule_task(transfer("t"), None).unwrap();
        manager.execute_task(&id).await.unwrap();

        let limiter = manager.executor().rate_limiter().unwrap();
        assert_eq!(limiter.limiter().tracked_identifiers(), 5);
        // Windows still hold the request.
        assert_eq!(manager.sweep_rate_limits(), 0);
        assert_eq!(limiter.limiter().tracked_identifiers(), 5);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_final() {
        let manager = manager();
        manager.add_agent(AgentConfig::new("a1", 1)).await.unwrap();
        manager.schedule_task(transfer("t"), None).unwrap();
        manager.start().unwrap();

        manager.shutdown().await;
        manager.shutdown().await;

        let stats = manager.get_stats();
        assert_eq!(stats.agents.total, 0);
        assert_eq!(stats.tasks.total, 0);
        assert!(!stats.scheduler_running);
        assert!(matches!(
            manager.schedule_task(transfer("late"), None),
            Err(Error::ShutDown)
        ));
        assert!(matches!(manager.start(), Err(Error::ShutDown)));
    }
}
