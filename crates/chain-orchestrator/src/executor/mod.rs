//! Transaction execution state machine.
//!
//! `Pending -> Signed -> Broadcasted -> Confirmed`, or `Failed` from any state.
//! Transient failures are retried on a capped exponential schedule; validation,
//! key, network and rate-limit failures are terminal on the first attempt.

mod backoff;
pub mod validation;

pub use backoff::{ExponentialBackoff, RetryPolicy};
pub use validation::{ValidatedTransaction, ValidationLimits};

use crate::chain::{
    ChainClient, ChainDirectory, KeyHandle, NetworkId, Receipt, SigningService, TxHash,
    UnsignedTransaction,
};
use crate::error::{Error, Result};
use crate::events::{EventBus, Subscription, SubscriptionId, TransactionEvent};
use crate::rate_limit::TransactionRateLimiter;
use crate::types::Timestamp;
use alloy_primitives::{Address, U256};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Lifecycle status of one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Signed,
    Broadcasted,
    Confirmed,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Signed => "signed",
            TransactionStatus::Broadcasted => "broadcasted",
            TransactionStatus::Confirmed => "confirmed",
            TransactionStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(TransactionStatus::Pending),
            "signed" => Ok(TransactionStatus::Signed),
            "broadcasted" => Ok(TransactionStatus::Broadcasted),
            "confirmed" => Ok(TransactionStatus::Confirmed),
            "failed" => Ok(TransactionStatus::Failed),
            other => Err(Error::invalid_transaction(format!(
                "unknown transaction status '{other}'"
            ))),
        }
    }
}

/// What a caller wants sent. Sender and network come from [`TransactionParams`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRequest {
    /// 0x-prefixed recipient address.
    pub to: String,
    #[serde(default)]
    pub value: U256,
    /// 0x-prefixed calldata.
    #[serde(default)]
    pub data: Option<String>,
    /// Estimated through the chain client when absent.
    #[serde(default)]
    pub gas_limit: Option<u64>,
    /// Queried from the chain client when absent.
    #[serde(default)]
    pub gas_price: Option<u128>,
}

impl TransactionRequest {
    pub fn transfer(to: impl Into<String>, value: U256) -> Self {
        Self {
            to: to.into(),
            value,
            data: None,
            gas_limit: None,
            gas_price: None,
        }
    }

    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.data = Some(data.into());
        self
    }

    pub fn with_gas_limit(mut self, gas_limit: u64) -> Self {
        self.gas_limit = Some(gas_limit);
        self
    }

    pub fn with_gas_price(mut self, gas_price: u128) -> Self {
        self.gas_price = Some(gas_price);
        self
    }
}

/// A request bound to a sender on a network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionParams {
    pub network: NetworkId,
    pub from: Address,
    #[serde(flatten)]
    pub request: TransactionRequest,
}

/// Per-call execution knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutionOptions {
    pub retry: RetryPolicy,
    pub confirmations: u64,
    pub confirmation_timeout_ms: u64,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            confirmations: 1,
            confirmation_timeout_ms: 60_000,
        }
    }
}

impl ExecutionOptions {
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_millis(self.confirmation_timeout_ms)
    }
}

/// A confirmed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionOutcome {
    pub tx_hash: TxHash,
    pub network: NetworkId,
    pub block_number: u64,
    pub gas_used: u64,
    pub effective_gas_price: u128,
    /// Retries consumed before confirmation.
    pub retries: u32,
}

/// Runs transactions through sign, broadcast and confirm with retry.
pub struct TransactionExecutor {
    signer: Arc<dyn SigningService>,
    chain: Arc<dyn ChainClient>,
    directory: Arc<dyn ChainDirectory>,
    limits: ValidationLimits,
    rate_limiter: Option<Arc<TransactionRateLimiter>>,
    events: EventBus<TransactionEvent>,
}

impl TransactionExecutor {
    pub fn new(
        signer: Arc<dyn SigningService>,
        chain: Arc<dyn ChainClient>,
        directory: Arc<dyn ChainDirectory>,
    ) -> Self {
        Self {
            signer,
            chain,
            directory,
            limits: ValidationLimits::default(),
            rate_limiter: None,
            events: EventBus::new("transaction"),
        }
    }

    pub fn with_limits(mut self, limits: ValidationLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<TransactionRateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn limits(&self) -> &ValidationLimits {
        &self.limits
    }

    pub fn rate_limiter(&self) -> Option<&Arc<TransactionRateLimiter>> {
        self.rate_limiter.as_ref()
    }

    pub fn signer(&self) -> &Arc<dyn SigningService> {
        &self.signer
    }

    pub fn directory(&self) -> &Arc<dyn ChainDirectory> {
        &self.directory
    }

    pub fn events(&self) -> &EventBus<TransactionEvent> {
        &self.events
    }

    /// Subscribe to lifecycle events, optionally only those with `status`.
    pub fn subscribe<F>(&self, status: Option<TransactionStatus>, handler: F) -> Subscription
    where
        F: Fn(&TransactionEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.events.subscribe(move |event| match status {
            Some(wanted) if wanted != event.status => Ok(()),
            _ => handler(event),
        })
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    /// Execute one transaction, retrying transient failures per `options.retry`.
    pub async fn execute_transaction(
        &self,
        params: &TransactionParams,
        options: &ExecutionOptions,
    ) -> Result<TransactionOutcome> {
        self.directory.resolve(params.network)?;

        let tx = match validation::validate(&params.request, &self.limits) {
            Ok(tx) => tx,
            Err(err) => {
                self.emit(&TxHash::pending(), TransactionStatus::Failed, params.network, 1, Some(&err));
                return Err(err);
            }
        };

        if let Some(limiter) = &self.rate_limiter {
            limiter
                .check_transaction(params.network, &params.from, &tx.to)
                .into_result()?;
        }

        let mut backoff = options.retry.backoff();
        loop {
            let attempt = backoff.attempt() + 1;
            match self.attempt(params, &tx, options, attempt).await {
                Ok((tx_hash, receipt)) => {
                    info!(
                        tx_hash = %tx_hash,
                        network = params.network,
                        block = receipt.block_number,
                        retries = backoff.attempt(),
                        "Transaction confirmed"
                    );
                    return Ok(TransactionOutcome {
                        tx_hash,
                        network: params.network,
                        block_number: receipt.block_number,
                        gas_used: receipt.gas_used,
                        effective_gas_price: receipt.effective_gas_price,
                        retries: backoff.attempt(),
                    });
                }
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) => match backoff.next_delay() {
                    Some(delay) => {
                        warn!(
                            attempt,
                            max_retries = options.retry.max_retries,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "Transaction attempt failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        error!(
                            retries = backoff.attempt(),
                            error = %err,
                            "Transaction retries exhausted"
                        );
                        return Err(Error::RetryLimitExceeded {
                            retries: backoff.attempt(),
                            last_error: err.to_string(),
                        });
                    }
                },
            }
        }
    }

    async fn attempt(
        &self,
        params: &TransactionParams,
        tx: &ValidatedTransaction,
        options: &ExecutionOptions,
        attempt: u32,
    ) -> Result<(TxHash, Receipt)> {
        let network = params.network;
        let mut tx_hash = TxHash::pending();

        let result = async {
            let key = self.resolve_key(params).await?;
            let unsigned = self.build(params, tx).await?;
            self.emit(&tx_hash, TransactionStatus::Pending, network, attempt, None);

            let signed = self.signer.sign(&key, &unsigned).await?;
            self.emit(&tx_hash, TransactionStatus::Signed, network, attempt, None);

            tx_hash = self.chain.broadcast(&signed).await?;
            debug!(tx_hash = %tx_hash, network, attempt, "Transaction broadcasted");
            self.emit(&tx_hash, TransactionStatus::Broadcasted, network, attempt, None);

            let receipt = self.wait_for_confirmation(network, &tx_hash, options).await?;
            self.emit(&tx_hash, TransactionStatus::Confirmed, network, attempt, None);
            Ok::<_, Error>((tx_hash.clone(), receipt))
        }
        .await;

        if let Err(err) = &result {
            self.emit(&tx_hash, TransactionStatus::Failed, network, attempt, Some(err));
        }
        result
    }

    async fn resolve_key(&self, params: &TransactionParams) -> Result<KeyHandle> {
        self.signer
            .get_key(&params.from, params.network)
            .await?
            .ok_or_else(|| Error::InvalidKey {
                key_id: crate::chain::key_id(params.network, &params.from),
            })
    }

    /// Fill in gas from the chain client where the caller left it open.
    async fn build(
        &self,
        params: &TransactionParams,
        tx: &ValidatedTransaction,
    ) -> Result<UnsignedTransaction> {
        let mut unsigned = UnsignedTransaction {
            network: params.network,
            from: params.from,
            to: tx.to,
            value: tx.value,
            data: tx.data.clone(),
            gas_limit: tx.gas_limit.unwrap_or_default(),
            gas_price: tx.gas_price.unwrap_or_default(),
        };
        if tx.gas_limit.is_none() {
            let estimate = self.chain.estimate_gas(params.network, &unsigned).await?;
            validation::check_gas_limit(estimate, &self.limits)?;
            unsigned.gas_limit = estimate;
        }
        if tx.gas_price.is_none() {
            unsigned.gas_price = self.chain.get_gas_price(params.network).await?;
        }
        Ok(unsigned)
    }

    /// Race the receipt against the confirmation deadline. The receipt future is
    /// dropped when the deadline wins.
    async fn wait_for_confirmation(
        &self,
        network: NetworkId,
        tx_hash: &TxHash,
        options: &ExecutionOptions,
    ) -> Result<Receipt> {
        let wait = self
            .chain
            .wait_for_receipt(network, tx_hash, options.confirmations);
        match tokio::time::timeout(options.confirmation_timeout(), wait).await {
            Ok(receipt) => receipt,
            Err(_) => Err(Error::ConfirmationTimeout {
                tx_hash: tx_hash.clone(),
                timeout_ms: options.confirmation_timeout_ms,
            }),
        }
    }

    fn emit(
        &self,
        tx_hash: &TxHash,
        status: TransactionStatus,
        network: NetworkId,
        attempt: u32,
        error: Option<&Error>,
    ) {
        self.events.emit(&TransactionEvent {
            tx_hash: tx_hash.clone(),
            status,
            network,
            attempt,
            timestamp: Timestamp::now(),
            error: error.map(ToString::to_string),
        });
    }
}
