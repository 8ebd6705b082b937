//! End-to-end flows through the public API with in-memory collaborators.

use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::U256;
use chain_orchestrator::{
    AgentConfig, AgentId, AgentManager, ApprovalConfig, ApprovalGate, ApprovalStatus, Error,
    ErrorKind, InMemorySigner, ManualClock, MockChainClient, OrchestratorConfig, RateLimitConfig,
    RateLimiter, StaticChainDirectory, Task, TaskId, TaskPayload, TaskPriority, TaskQueue,
    TaskStatus, Timestamp, TransactionRequest, TransactionStatus,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;

fn transfer(id: &str, priority: TaskPriority) -> Task {
    Task::new(
        id,
        id,
        TaskPayload::Transaction(TransactionRequest::transfer(
            "0x7777777777777777777777777777777777777777",
            U256::from(42u64),
        )),
    )
    .with_priority(priority)
}

fn manager(chain: Arc<MockChainClient>) -> AgentManager {
    AgentManager::new(
        OrchestratorConfig::default(),
        Arc::new(InMemorySigner::new()),
        chain,
        Arc::new(StaticChainDirectory::default()),
    )
}

#[test]
fn queue_drains_by_priority_then_fifo() {
    let queue = TaskQueue::new();
    queue.add_task(transfer("T1", TaskPriority::Low)).unwrap();
    queue.add_task(transfer("T2", TaskPriority::Critical)).unwrap();
    queue.add_task(transfer("T3", TaskPriority::Normal)).unwrap();

    let order: Vec<String> = std::iter::from_fn(|| queue.get_next_task())
        .map(|task| task.id.to_string())
        .collect();
    assert_eq!(order, vec!["T2", "T3", "T1"]);
    assert_eq!(queue.get_stats().scheduled, 3);
}

#[tokio::test(start_paused = true)]
async fn scheduled_transfers_complete_with_lifecycle_events() {
    let chain = Arc::new(MockChainClient::new());
    let manager = manager(chain.clone());
    manager.add_agent(AgentConfig::new("a1", 1)).await.unwrap();
    manager.add_agent(AgentConfig::new("a2", 8_453)).await.unwrap();

    let confirmed = Arc::new(Mutex::new(0usize));
    let counter = confirmed.clone();
    manager.subscribe_transaction_events(Some(TransactionStatus::Confirmed), move |_| {
        *counter.lock() += 1;
        Ok(())
    });

    for index in 0..4 {
        manager
            .schedule_task(transfer(&format!("t{index}"), TaskPriority::Normal), None)
            .unwrap();
    }

    manager.start().unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    manager.shutdown().await;

    assert_eq!(*confirmed.lock(), 4);
    assert_eq!(chain.broadcast_count(), 4);
}

#[tokio::test(start_paused = true)]
async fn retried_task_reports_retries_in_result() {
    let chain = Arc::new(MockChainClient::new());
    chain.fail_next_broadcasts(1, "network unreachable");
    let manager = manager(chain);
    manager.add_agent(AgentConfig::new("a1", 1)).await.unwrap();
    let id = manager
        .schedule_task(transfer("t", TaskPriority::High), None)
        .unwrap();

    let result = manager.execute_task(&id).await.unwrap();
    assert_eq!(result.status, TaskStatus::Completed);
    assert_eq!(result.retries, 1);
    assert_eq!(result.output.unwrap()["retries"], 1);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_fail_the_task() {
    let chain = Arc::new(MockChainClient::new());
    chain.fail_all_broadcasts(Some("connection refused"));
    let manager = manager(chain);
    manager.add_agent(AgentConfig::new("a1", 1)).await.unwrap();
    let id = manager
        .schedule_task(transfer("t", TaskPriority::High), None)
        .unwrap();

    let result = manager.execute_task(&id).await.unwrap();
    assert_eq!(result.status, TaskStatus::Failed);
    assert_eq!(result.error_kind, Some(ErrorKind::RetryLimitExceeded));
    assert_eq!(result.retries, 3);
    assert_eq!(manager.get_agent(&AgentId::from("a1")).unwrap().failed_tasks, 1);
}

#[tokio::test]
async fn duplicate_agents_and_tasks_are_rejected() {
    let manager = manager(Arc::new(MockChainClient::new()));
    manager.add_agent(AgentConfig::new("a1", 1)).await.unwrap();
    let err = manager.add_agent(AgentConfig::new("a1", 1)).await.unwrap_err();
    assert_eq!(err.to_string(), "Agent already exists: a1");

    manager
        .schedule_task(transfer("t", TaskPriority::Low), None)
        .unwrap();
    let err = manager
        .schedule_task(transfer("t", TaskPriority::Low), None)
        .unwrap_err();
    assert!(matches!(err, Error::TaskAlreadyExists { .. }));
    assert_eq!(manager.get_task_status(&TaskId::from("t")), Some(TaskStatus::Pending));
}

#[test]
fn approval_window_is_enforced() {
    let clock = Arc::new(ManualClock::new(Timestamp::from_millis(0)));
    let gate = ApprovalGate::with_clock(
        ApprovalConfig {
            ttl_ms: 300_000,
            ..ApprovalConfig::default()
        },
        clock.clone(),
    );
    let request = TransactionRequest::transfer(
        "0x8888888888888888888888888888888888888888",
        U256::from(1u64),
    );
    let late = gate
        .prepare_transaction(1, Default::default(), &request)
        .unwrap();
    let timely = gate
        .prepare_transaction(1, Default::default(), &request)
        .unwrap();

    clock.set(Timestamp::from_millis(299_000));
    gate.authorize_transaction(&timely.id, &timely.approval_token)
        .unwrap();

    clock.set(Timestamp::from_millis(301_000));
    let err = gate
        .authorize_transaction(&late.id, &late.approval_token)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Expired);
    assert!(err.to_string().contains("Transaction has expired"));
    assert_eq!(
        gate.get_transaction(&late.id).unwrap().status,
        ApprovalStatus::Expired
    );
    assert_eq!(
        gate.get_transaction(&timely.id).unwrap().status,
        ApprovalStatus::Approved
    );
    assert!(gate.get_pending_transactions().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_rate_limit_checks_admit_exactly_n() {
    let limiter = Arc::new(RateLimiter::new());
    let config = RateLimitConfig::new(5, 60_000);

    let handles: Vec<_> = (0..50)
        .map(|_| {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.check_limit("agent:hot", config).allowed })
        })
        .collect();

    let mut allowed = 0;
    for handle in handles {
        if handle.await.unwrap() {
            allowed += 1;
        }
    }
    assert_eq!(allowed, 5);
    assert_eq!(limiter.usage("agent:hot", 60_000), 5);
}
