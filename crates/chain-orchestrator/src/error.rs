use crate::approval::ApprovalStatus;
use crate::chain::TxHash;
use crate::task::TaskStatus;
use crate::types::{AgentId, TaskId, Timestamp};
use alloy_primitives::U256;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error markers that mark an unclassified failure as transient.
const TRANSIENT_MARKERS: &[&str] = &["network", "timeout", "connection"];

/// Error markers that mark a failure as permanent even when it looks transient.
const PERMANENT_MARKERS: &[&str] = &["invalid signature", "nonce too low", "insufficient funds"];

/// Machine-readable classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Agent or task already registered.
    DuplicateEntity,
    /// Agent, task, key or pending transaction absent.
    NotFound,
    /// Malformed transaction, bad dependency, unsupported network.
    InvalidInput,
    /// No eligible agent right now; resubmit later.
    Unavailable,
    /// Caller exceeded a sliding-window limit.
    RateLimited,
    /// Broadcast, confirmation or network failure.
    Transient,
    /// Deadline elapsed; the transaction may still land.
    Timeout,
    /// Transient failures outlasted the retry policy.
    RetryLimitExceeded,
    /// Approval window elapsed.
    Expired,
    /// Approval token did not match.
    TokenMismatch,
    /// Operation not valid in the entity's current state.
    InvalidState,
    /// Configuration, IO or serialization failure.
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::DuplicateEntity => "duplicate_entity",
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Transient => "transient",
            ErrorKind::Timeout => "timeout",
            ErrorKind::RetryLimitExceeded => "retry_limit_exceeded",
            ErrorKind::Expired => "expired",
            ErrorKind::TokenMismatch => "token_mismatch",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::Internal => "internal",
        }
    }
}

/// Orchestrator error types
#[derive(Error, Debug)]
pub enum Error {
    /// Agent id already registered
    #[error("Agent already exists: {agent_id}")]
    AgentAlreadyExists { agent_id: AgentId },

    /// Task id already queued
    #[error("Task already exists: {task_id}")]
    TaskAlreadyExists { task_id: TaskId },

    #[error("Agent not found: {agent_id}")]
    AgentNotFound { agent_id: AgentId },

    #[error("Task not found: {task_id}")]
    TaskNotFound { task_id: TaskId },

    /// No signing key for the composite `network:address` identifier
    #[error("Invalid key: no signing key for {key_id}")]
    InvalidKey { key_id: String },

    /// Declared dependency is unknown to the queue
    #[error("Invalid task dependency: {task_id} depends on unknown task {dependency}")]
    InvalidTaskDependency { task_id: TaskId, dependency: TaskId },

    /// Transaction failed shape validation
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error("Unsupported network: {network_id}")]
    UnsupportedNetwork { network_id: u64 },

    /// No registered agent can take the task right now
    #[error("No available agents for task {task_id}")]
    NoAvailableAgents { task_id: TaskId },

    /// Agent is not in a state to accept the task
    #[error("Task scheduling failed: agent {agent_id} cannot execute task {task_id}")]
    TaskSchedulingFailed { task_id: TaskId, agent_id: AgentId },

    /// Task is running or finished and can't be dispatched or cancelled
    #[error("Task {task_id} is {status}")]
    TaskNotRunnable { task_id: TaskId, status: TaskStatus },

    #[error("Task execution failed for {task_id}: {reason}")]
    TaskExecutionFailed { task_id: TaskId, reason: String },

    /// Task exceeded its own timeout
    #[error("Task {task_id} timed out after {timeout_ms}ms")]
    TaskTimedOut { task_id: TaskId, timeout_ms: u64 },

    /// Sliding-window limit hit
    #[error("Rate limit exceeded for {identifier}, resets at {reset_at}")]
    RateLimited {
        identifier: String,
        reset_at: Timestamp,
    },

    /// Signing service failure
    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("Broadcast failed: {0}")]
    BroadcastFailed(String),

    #[error("Confirmation failed: {0}")]
    ConfirmationFailed(String),

    /// Unclassified chain client failure
    #[error("Chain client error: {0}")]
    Chain(String),

    /// Receipt did not arrive before the confirmation deadline
    #[error("Transaction {tx_hash} not confirmed within {timeout_ms}ms")]
    ConfirmationTimeout { tx_hash: TxHash, timeout_ms: u64 },

    #[error("Retry limit exceeded after {retries} retries: {last_error}")]
    RetryLimitExceeded { retries: u32, last_error: String },

    /// Unknown pending transaction id
    #[error("Transaction not found: {id}")]
    ApprovalNotFound { id: String },

    #[error("Transaction is already {status}")]
    ApprovalNotPending { id: String, status: ApprovalStatus },

    #[error("Transaction has expired (expired at {expires_at})")]
    ApprovalExpired { id: String, expires_at: Timestamp },

    #[error("Invalid approval token for transaction {id}")]
    InvalidApprovalToken { id: String },

    #[error("Transaction value {value} exceeds maximum {max}")]
    TransactionTooLarge { value: U256, max: U256 },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Manager was shut down
    #[error("Orchestrator has been shut down")]
    ShutDown,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create an invalid transaction error
    pub fn invalid_transaction(msg: impl Into<String>) -> Self {
        Error::InvalidTransaction(msg.into())
    }

    /// Create a signing error
    pub fn signing(msg: impl Into<String>) -> Self {
        Error::Signing(msg.into())
    }

    /// Create a broadcast failure
    pub fn broadcast(msg: impl Into<String>) -> Self {
        Error::BroadcastFailed(msg.into())
    }

    /// Create a confirmation failure
    pub fn confirmation(msg: impl Into<String>) -> Self {
        Error::ConfirmationFailed(msg.into())
    }

    /// Create an unclassified chain client error
    pub fn chain(msg: impl Into<String>) -> Self {
        Error::Chain(msg.into())
    }

    /// Create an invalid configuration error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Error::InvalidConfig(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::AgentAlreadyExists { .. } | Error::TaskAlreadyExists { .. } => {
                ErrorKind::DuplicateEntity
            }
            Error::AgentNotFound { .. }
            | Error::TaskNotFound { .. }
            | Error::InvalidKey { .. }
            | Error::ApprovalNotFound { .. } => ErrorKind::NotFound,
            Error::InvalidTaskDependency { .. }
            | Error::InvalidTransaction(_)
            | Error::UnsupportedNetwork { .. }
            | Error::TransactionTooLarge { .. }
            | Error::TaskExecutionFailed { .. } => ErrorKind::InvalidInput,
            Error::NoAvailableAgents { .. } => ErrorKind::Unavailable,
            Error::TaskSchedulingFailed { .. }
            | Error::TaskNotRunnable { .. }
            | Error::ApprovalNotPending { .. }
            | Error::ShutDown => ErrorKind::InvalidState,
            Error::RateLimited { .. } => ErrorKind::RateLimited,
            Error::Signing(_)
            | Error::BroadcastFailed(_)
            | Error::ConfirmationFailed(_)
            | Error::Chain(_) => ErrorKind::Transient,
            Error::TaskTimedOut { .. } | Error::ConfirmationTimeout { .. } => ErrorKind::Timeout,
            Error::RetryLimitExceeded { .. } => ErrorKind::RetryLimitExceeded,
            Error::ApprovalExpired { .. } => ErrorKind::Expired,
            Error::InvalidApprovalToken { .. } => ErrorKind::TokenMismatch,
            Error::InvalidConfig(_) | Error::Io(_) | Error::Json(_) => ErrorKind::Internal,
        }
    }

    /// Whether a transaction attempt that failed with this error may be retried.
    ///
    /// Broadcast and confirmation failures always qualify. Unclassified signing
    /// and chain client errors qualify when their message carries a transient
    /// marker and no permanent one. Everything else is terminal.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::BroadcastFailed(_) | Error::ConfirmationFailed(_) => true,
            Error::Signing(message) | Error::Chain(message) => message_is_transient(message),
            _ => false,
        }
    }
}

fn message_is_transient(message: &str) -> bool {
    let lower = message.to_lowercase();
    if PERMANENT_MARKERS.iter().any(|marker| lower.contains(marker)) {
        return false;
    }
    TRANSIENT_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Result type for orchestrator operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_kinds_classify_without_text_inspection() {
        assert!(Error::broadcast("nonce too low").is_retryable());
        assert!(Error::confirmation("receipt missing").is_retryable());
        assert!(!Error::invalid_transaction("network timeout").is_retryable());
        assert!(
            !Error::InvalidKey {
                key_id: "1:0xabc".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn unclassified_errors_fall_back_to_markers() {
        assert!(Error::chain("Network unreachable").is_retryable());
        assert!(Error::chain("connection reset by peer").is_retryable());
        assert!(Error::signing("remote signer timeout").is_retryable());
        assert!(!Error::chain("network says: nonce too low").is_retryable());
        assert!(!Error::chain("insufficient funds for gas * price + value").is_retryable());
        assert!(!Error::signing("invalid signature").is_retryable());
        assert!(!Error::chain("execution reverted").is_retryable());
    }

    #[test]
    fn timeouts_are_distinct_from_transient_failures() {
        let timeout = Error::ConfirmationTimeout {
            tx_hash: TxHash::new("0x01"),
            timeout_ms: 60_000,
        };
        assert_eq!(timeout.kind(), ErrorKind::Timeout);
        assert!(!timeout.is_retryable());
        assert_eq!(Error::broadcast("x").kind(), ErrorKind::Transient);
    }

    #[test]
    fn duplicate_agent_message_names_the_entity() {
        let err = Error::AgentAlreadyExists {
            agent_id: AgentId::from("a1"),
        };
        assert_eq!(err.kind(), ErrorKind::DuplicateEntity);
        assert!(err.to_string().contains("Agent already exists"));
    }
}
