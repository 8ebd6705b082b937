//! Scheduling and reliable execution of agent blockchain transactions.
//!
//! An [`AgentManager`] owns a registry of [`ChainAgent`]s, each wrapping one
//! signing identity, and a priority [`TaskQueue`]. Transaction tasks run through
//! the [`TransactionExecutor`], which signs, broadcasts and waits for
//! confirmation with capped exponential retry. A [`TransactionRateLimiter`]
//! caps volume per sender, network and destination, and the [`ApprovalGate`]
//! holds proposed transactions until they are authorized with a one-time token.
//!
//! Key material and network access stay behind the [`SigningService`],
//! [`ChainClient`] and [`ChainDirectory`] traits. [`chain::memory`] provides
//! in-process implementations.

pub mod agent;
pub mod approval;
pub mod chain;
pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod manager;
pub mod rate_limit;
pub mod task;
pub mod types;

pub use agent::{AgentConfig, AgentInfo, AgentStatus, ChainAgent};
pub use approval::{ApprovalConfig, ApprovalGate, ApprovalStatus, PendingTransaction, PreparedTransaction};
pub use chain::{
    ChainClient, ChainDirectory, InMemorySigner, KeyHandle, MockChainClient, NetworkId,
    NetworkInfo, Receipt, SigningService, StaticChainDirectory, TxHash,
};
pub use config::OrchestratorConfig;
pub use error::{Error, ErrorKind, Result};
pub use events::{AgentEvent, EventBus, Subscription, SubscriptionId, TaskEvent, TransactionEvent};
pub use executor::{
    ExecutionOptions, RetryPolicy, TransactionExecutor, TransactionOutcome, TransactionParams,
    TransactionRequest, TransactionStatus, ValidationLimits,
};
pub use manager::{AgentManager, AgentStats, OrchestratorStats};
pub use rate_limit::{
    RateLimitConfig, RateLimitResult, RateLimiter, TransactionLimits, TransactionRateLimiter,
};
pub use task::{Task, TaskPayload, TaskPriority, TaskQueue, TaskResult, TaskStats, TaskStatus};
pub use types::{AgentId, Clock, ManualClock, SystemClock, TaskId, Timestamp};
