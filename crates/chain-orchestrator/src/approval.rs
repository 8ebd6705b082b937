//! Two-phase approval for transactions: prepare, then authorize with the issued
//! token before anything is executed.
//!
//! The gate never executes transactions itself. Callers run the approved
//! transaction through the executor and record the outcome with
//! [`ApprovalGate::mark_executed`] or [`ApprovalGate::mark_failed`].

use crate::chain::{NetworkId, TxHash};
use crate::error::{Error, Result};
use crate::executor::TransactionRequest;
use crate::executor::validation::parse_address;
use crate::types::{Clock, SystemClock, Timestamp};
use alloy_primitives::{Address, U256};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Gate settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApprovalConfig {
    /// How long a prepared transaction waits for authorization.
    pub ttl_ms: u64,
    /// Values above this are refused before a transaction is prepared.
    pub max_value: U256,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 300_000,
            // 100 ETH
            max_value: U256::from(10u64).pow(U256::from(20u64)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    /// Claimed by one executor; no other caller may run it.
    Executing,
    Expired,
    Executed,
    Failed,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Executing => "executing",
            ApprovalStatus::Expired => "expired",
            ApprovalStatus::Executed => "executed",
            ApprovalStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ApprovalStatus::Expired | ApprovalStatus::Executed | ApprovalStatus::Failed
        )
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A proposed transaction waiting on, or past, authorization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingTransaction {
    pub id: String,
    pub network: NetworkId,
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub data: Option<String>,
    pub gas_limit: Option<u64>,
    pub gas_price: Option<u128>,
    #[serde(skip_serializing, default)]
    pub approval_token: String,
    pub status: ApprovalStatus,
    pub created_at: Timestamp,
    pub expires_at: Timestamp,
    pub approved_at: Option<Timestamp>,
    pub tx_hash: Option<TxHash>,
    pub error: Option<String>,
}

impl PendingTransaction {
    /// Rebuild the request for execution once approved.
    pub fn to_request(&self) -> TransactionRequest {
        TransactionRequest {
            to: self.to.to_string(),
            value: self.value,
            data: self.data.clone(),
            gas_limit: self.gas_limit,
            gas_price: self.gas_price,
        }
    }
}

/// Returned by [`ApprovalGate::prepare_transaction`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreparedTransaction {
    pub id: String,
    pub approval_token: String,
    pub expires_at: Timestamp,
}

pub struct ApprovalGate {
    config: ApprovalConfig,
    clock: Arc<dyn Clock>,
    transactions: Mutex<HashMap<String, PendingTransaction>>,
}

impl ApprovalGate {
    pub fn new(config: ApprovalConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: ApprovalConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            transactions: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ApprovalConfig {
        &self.config
    }

    /// Refuse values above the configured ceiling.
    pub fn check_transaction_size(&self, value: U256) -> Result<()> {
        if value > self.config.max_value {
            return Err(Error::TransactionTooLarge {
                value,
                max: self.config.max_value,
            });
        }
        Ok(())
    }

    /// Store a proposed transaction and issue its approval token.
    pub fn prepare_transaction(
        &self,
        network: NetworkId,
        from: Address,
        request: &TransactionRequest,
    ) -> Result<PreparedTransaction> {
        self.check_transaction_size(request.value)?;
        let to = parse_address(&request.to)?;

        let now = self.clock.now();
        let pending = PendingTransaction {
            id: uuid::Uuid::new_v4().to_string(),
            network,
            from,
            to,
            value: request.value,
            data: request.data.clone(),
            gas_limit: request.gas_limit,
            gas_price: request.gas_price,
            approval_token: generate_token(),
            status: ApprovalStatus::Pending,
            created_at: now,
            expires_at: now.saturating_add(Duration::from_millis(self.config.ttl_ms)),
            approved_at: None,
            tx_hash: None,
            error: None,
        };
        let prepared = PreparedTransaction {
            id: pending.id.clone(),
            approval_token: pending.approval_token.clone(),
            expires_at: pending.expires_at,
        };

        info!(
            id = %prepared.id,
            network,
            expires_at = %prepared.expires_at,
            "Transaction prepared for approval"
        );
        self.transactions.lock().insert(pending.id.clone(), pending);
        Ok(prepared)
    }

    /// Expire overdue entries, then list those still awaiting authorization.
    pub fn get_pending_transactions(&self) -> Vec<PendingTransaction> {
        let now = self.clock.now();
        let mut transactions = self.transactions.lock();
        let mut pending: Vec<PendingTransaction> = transactions
            .values_mut()
            .filter_map(|tx| {
                expire_if_due(tx, now);
                (tx.status == ApprovalStatus::Pending).then(|| tx.clone())
            })
            .collect();
        pending.sort_by_key(|tx| tx.created_at);
        pending
    }

    pub fn get_transaction(&self, id: &str) -> Option<PendingTransaction> {
        let now = self.clock.now();
        let mut transactions = self.transactions.lock();
        let tx = transactions.get_mut(id)?;
        expire_if_due(tx, now);
        Some(tx.clone())
    }

    /// Approve a pending transaction with its token. Succeeds at most once.
    pub fn authorize_transaction(&self, id: &str, token: &str) -> Result<PendingTransaction> {
        let now = self.clock.now();
        let mut transactions = self.transactions.lock();
        let tx = transactions
            .get_mut(id)
            .ok_or_else(|| Error::ApprovalNotFound { id: id.to_string() })?;

        if tx.status != ApprovalStatus::Pending {
            return Err(Error::ApprovalNotPending {
                id: id.to_string(),
                status: tx.status,
            });
        }
        if expire_if_due(tx, now) {
            return Err(Error::ApprovalExpired {
                id: id.to_string(),
                expires_at: tx.expires_at,
            });
        }
        if !tokens_match(&tx.approval_token, token) {
            debug!(id, "Approval token mismatch");
            return Err(Error::InvalidApprovalToken { id: id.to_string() });
        }

        tx.status = ApprovalStatus::Approved;
        tx.approved_at = Some(now);
        info!(id, "Transaction approved");
        Ok(tx.clone())
    }

    /// Move an approved transaction to `Executing` and return it. Only one
    /// caller wins; the rest see `ApprovalNotPending` before anything is signed.
    pub fn begin_execution(&self, id: &str) -> Result<PendingTransaction> {
        let mut claimed = None;
        self.transition(id, &[ApprovalStatus::Approved], |tx| {
            tx.status = ApprovalStatus::Executing;
            claimed = Some(tx.clone());
        })?;
        claimed.ok_or_else(|| Error::ApprovalNotFound { id: id.to_string() })
    }

    /// Record that an approved transaction was executed.
    pub fn mark_executed(&self, id: &str, tx_hash: TxHash) -> Result<()> {
        let from = [ApprovalStatus::Approved, ApprovalStatus::Executing];
        self.transition(id, &from, |tx| {
            tx.status = ApprovalStatus::Executed;
            tx.tx_hash = Some(tx_hash);
        })
    }

    /// Record a failure for a pending, approved or executing transaction.
    pub fn mark_failed(&self, id: &str, message: impl Into<String>) -> Result<()> {
        let message = message.into();
        self.transition(
            id,
            &[
                ApprovalStatus::Pending,
                ApprovalStatus::Approved,
                ApprovalStatus::Executing,
            ],
            |tx| {
                tx.status = ApprovalStatus::Failed;
                tx.error = Some(message);
            },
        )
    }

    fn transition(
        &self,
        id: &str,
        from: &[ApprovalStatus],
        apply: impl FnOnce(&mut PendingTransaction),
    ) -> Result<()> {
        let mut transactions = self.transactions.lock();
        let tx = transactions
            .get_mut(id)
            .ok_or_else(|| Error::ApprovalNotFound { id: id.to_string() })?;
        if !from.contains(&tx.status) {
            return Err(Error::ApprovalNotPending {
                id: id.to_string(),
                status: tx.status,
            });
        }
        apply(tx);
        debug!(id, status = %tx.status, "Approval status changed");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.transactions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Flip a pending entry past its expiry. Returns true when it is expired.
fn expire_if_due(tx: &mut PendingTransaction, now: Timestamp) -> bool {
    if tx.status == ApprovalStatus::Pending && now > tx.expires_at {
        tx.status = ApprovalStatus::Expired;
        debug!(id = %tx.id, "Pending transaction expired");
    }
    tx.status == ApprovalStatus::Expired
}

/// 32 random bytes, hex encoded. Independent of the transaction id.
fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    hex::encode(bytes)
}

fn tokens_match(expected: &str, provided: &str) -> bool {
    let (expected, provided) = (expected.as_bytes(), provided.as_bytes());
    expected.len() == provided.len()
        && expected
            .iter()
            .zip(provided)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}
