//! Collaborator contracts: signing service, chain client, chain directory.
//!
//! The orchestrator never holds key material and never talks to a network
//! directly. Everything that touches keys or RPC endpoints goes through the
//! traits in this module. [`memory`] ships in-process implementations used by
//! tests and the demo binary.

pub mod memory;

use crate::error::Result;
use alloy_primitives::{Address, U256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use memory::{InMemorySigner, MockChainClient, StaticChainDirectory};

/// Numeric chain identifier (EIP-155 chain id).
pub type NetworkId = u64;

/// Composite key identifier used by the signing service: `"{network}:{address}"`.
pub fn key_id(network: NetworkId, address: &Address) -> String {
    format!("{}:0x{}", network, hex::encode(address.as_slice()))
}

/// Reference to a key held by the signing service. Carries no key material.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyHandle {
    pub address: Address,
    pub network: NetworkId,
}

impl KeyHandle {
    pub fn new(address: Address, network: NetworkId) -> Self {
        Self { address, network }
    }

    /// Composite `network:address` identifier.
    pub fn key_id(&self) -> String {
        key_id(self.network, &self.address)
    }
}

/// Transaction hash returned by the chain client.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxHash(String);

impl TxHash {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Placeholder carried by lifecycle events before broadcast.
    pub fn pending() -> Self {
        Self(format!("0x{}", "0".repeat(64)))
    }

    pub fn is_pending(&self) -> bool {
        *self == Self::pending()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fully resolved transaction handed to the signing service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedTransaction {
    pub network: NetworkId,
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub data: Vec<u8>,
    pub gas_limit: u64,
    pub gas_price: u128,
}

/// Signed payload ready for broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPayload {
    pub network: NetworkId,
    pub from: Address,
    pub raw: Vec<u8>,
}

/// Inclusion receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub block_number: u64,
    pub gas_used: u64,
    pub effective_gas_price: u128,
}

/// Network metadata returned by the chain directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInfo {
    pub id: NetworkId,
    pub name: String,
    pub native_symbol: String,
    pub testnet: bool,
}

/// Key generation and signing. Implementations keep private keys to themselves.
#[async_trait]
pub trait SigningService: Send + Sync {
    /// Provision a fresh key on `network`.
    async fn generate_key(&self, network: NetworkId) -> Result<KeyHandle>;

    /// Look up an existing key, `None` if the service does not hold it.
    async fn get_key(&self, address: &Address, network: NetworkId) -> Result<Option<KeyHandle>>;

    /// Sign a transaction with the referenced key.
    async fn sign(&self, key: &KeyHandle, tx: &UnsignedTransaction) -> Result<SignedPayload>;
}

/// Network access keyed by network id.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn estimate_gas(&self, network: NetworkId, tx: &UnsignedTransaction) -> Result<u64>;

    async fn get_gas_price(&self, network: NetworkId) -> Result<u128>;

    /// Submit a signed payload, returning its hash.
    async fn broadcast(&self, payload: &SignedPayload) -> Result<TxHash>;

    /// Resolve once `tx_hash` has `confirmations` confirmations. May never resolve;
    /// callers bound it with their own deadline.
    async fn wait_for_receipt(
        &self,
        network: NetworkId,
        tx_hash: &TxHash,
        confirmations: u64,
    ) -> Result<Receipt>;
}

/// Catalog of supported networks.
pub trait ChainDirectory: Send + Sync {
    /// Metadata for `network`, or [`crate::Error::UnsupportedNetwork`].
    fn resolve(&self, network: NetworkId) -> Result<NetworkInfo>;
}
