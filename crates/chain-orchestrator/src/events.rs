//! Typed publish/subscribe for agent, task and transaction lifecycle events.
//!
//! Dispatch is synchronous on the emitter's stack. Each subscriber runs inside
//! its own `catch_unwind`; an `Err` return or a panic is logged and counted but
//! never reaches the emitter and never stops delivery to later subscribers.

use crate::agent::AgentStatus;
use crate::chain::{NetworkId, TxHash};
use crate::executor::TransactionStatus;
use crate::task::TaskPriority;
use crate::types::{AgentId, TaskId, Timestamp};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

type Handler<E> = Arc<dyn Fn(&E) -> anyhow::Result<()> + Send + Sync>;

/// Identifier of a registered subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

trait Unsubscribe: Send + Sync {
    fn remove(&self, id: SubscriptionId) -> bool;
}

/// Handle returned by [`EventBus::subscribe`]. Dropping it keeps the
/// subscription alive; call [`Subscription::unsubscribe`] to detach.
pub struct Subscription {
    id: SubscriptionId,
    bus: Weak<dyn Unsubscribe>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Detach the subscriber. Returns false if the bus is gone or it was already removed.
    pub fn unsubscribe(self) -> bool {
        match self.bus.upgrade() {
            Some(bus) => bus.remove(self.id),
            None => false,
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

struct BusInner<E> {
    category: &'static str,
    subscribers: RwLock<Vec<(SubscriptionId, Handler<E>)>>,
    next_id: AtomicU64,
    failures: AtomicU64,
}

impl<E: Send + Sync + 'static> Unsubscribe for BusInner<E> {
    fn remove(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|(existing, _)| *existing != id);
        subscribers.len() != before
    }
}

/// Publish/subscribe channel for one event category.
pub struct EventBus<E> {
    inner: Arc<BusInner<E>>,
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: Send + Sync + 'static> EventBus<E> {
    pub fn new(category: &'static str) -> Self {
        Self {
            inner: Arc::new(BusInner {
                category,
                subscribers: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
                failures: AtomicU64::new(0),
            }),
        }
    }

    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&E) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        self.inner.subscribers.write().push((id, Arc::new(handler)));
        let inner: Arc<dyn Unsubscribe> = self.inner.clone();
        Subscription {
            id,
            bus: Arc::downgrade(&inner),
        }
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.remove(id)
    }

    /// Deliver `event` to every subscriber. Returns how many handled it cleanly.
    pub fn emit(&self, event: &E) -> usize {
        // Snapshot so handlers may subscribe/unsubscribe without deadlocking.
        let handlers: Vec<(SubscriptionId, Handler<E>)> = self.inner.subscribers.read().clone();

        let mut delivered = 0;
        for (id, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(error)) => {
                    self.inner.failures.fetch_add(1, Ordering::SeqCst);
                    tracing::warn!(
                        category = self.inner.category,
                        subscriber = id.0,
                        error = %error,
                        "Event subscriber returned an error"
                    );
                }
                Err(payload) => {
                    self.inner.failures.fetch_add(1, Ordering::SeqCst);
                    tracing::warn!(
                        category = self.inner.category,
                        subscriber = id.0,
                        panic = %panic_message(payload.as_ref()),
                        "Event subscriber panicked"
                    );
                }
            }
        }
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }

    /// Subscriber errors and panics caught since creation.
    pub fn failure_count(&self) -> u64 {
        self.inner.failures.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.inner.subscribers.write().clear();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Agent registry events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    Created {
        agent_id: AgentId,
        address: String,
        network: NetworkId,
        timestamp: Timestamp,
    },
    Removed {
        agent_id: AgentId,
        timestamp: Timestamp,
    },
    StatusChanged {
        agent_id: AgentId,
        from: AgentStatus,
        to: AgentStatus,
        timestamp: Timestamp,
    },
}

impl AgentEvent {
    pub fn name(&self) -> &'static str {
        match self {
            AgentEvent::Created { .. } => "agent_created",
            AgentEvent::Removed { .. } => "agent_removed",
            AgentEvent::StatusChanged { .. } => "agent_status_changed",
        }
    }

    pub fn agent_id(&self) -> &AgentId {
        match self {
            AgentEvent::Created { agent_id, .. }
            | AgentEvent::Removed { agent_id, .. }
            | AgentEvent::StatusChanged { agent_id, .. } => agent_id,
        }
    }
}

/// Task lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    Queued {
        task_id: TaskId,
        priority: TaskPriority,
        timestamp: Timestamp,
    },
    Assigned {
        task_id: TaskId,
        agent_id: AgentId,
        timestamp: Timestamp,
    },
    Completed {
        task_id: TaskId,
        agent_id: AgentId,
        duration_ms: u64,
        timestamp: Timestamp,
    },
    Failed {
        task_id: TaskId,
        agent_id: Option<AgentId>,
        error: String,
        timestamp: Timestamp,
    },
    Cancelled {
        task_id: TaskId,
        timestamp: Timestamp,
    },
}

impl TaskEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TaskEvent::Queued { .. } => "task_queued",
            TaskEvent::Assigned { .. } => "task_assigned",
            TaskEvent::Completed { .. } => "task_completed",
            TaskEvent::Failed { .. } => "task_failed",
            TaskEvent::Cancelled { .. } => "task_cancelled",
        }
    }

    pub fn task_id(&self) -> &TaskId {
        match self {
            TaskEvent::Queued { task_id, .. }
            | TaskEvent::Assigned { task_id, .. }
            | TaskEvent::Completed { task_id, .. }
            | TaskEvent::Failed { task_id, .. }
            | TaskEvent::Cancelled { task_id, .. } => task_id,
        }
    }
}

/// Emitted at every transition of a transaction's execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionEvent {
    /// [`TxHash::pending`] until the broadcast returns a real hash.
    pub tx_hash: TxHash,
    pub status: TransactionStatus,
    pub network: NetworkId,
    pub attempt: u32,
    pub timestamp: Timestamp,
    pub error: Option<String>,
}
