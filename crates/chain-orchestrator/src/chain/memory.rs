//! In-process collaborators for tests, simulations and the demo binary.

use super::{
    ChainClient, ChainDirectory, KeyHandle, NetworkId, NetworkInfo, Receipt, SignedPayload,
    SigningService, TxHash, UnsignedTransaction, key_id,
};
use crate::error::{Error, Result};
use alloy_primitives::Address;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Stub signer with deterministic sha2-derived addresses and signatures.
#[derive(Default)]
pub struct InMemorySigner {
    keys: RwLock<HashMap<String, KeyHandle>>,
    generated: AtomicU64,
}

impl InMemorySigner {
    pub fn new() -> Self {
        Self::default()
    }

    fn derive_address(network: NetworkId, index: u64) -> Address {
        let mut hasher = Sha256::new();
        hasher.update(network.to_be_bytes());
        hasher.update(index.to_be_bytes());
        let digest = hasher.finalize();
        Address::from_slice(&digest[12..])
    }

    /// Number of keys held.
    pub fn key_count(&self) -> usize {
        self.keys.read().len()
    }
}

#[async_trait]
impl SigningService for InMemorySigner {
    async fn generate_key(&self, network: NetworkId) -> Result<KeyHandle> {
        let index = self.generated.fetch_add(1, Ordering::SeqCst);
        let handle = KeyHandle::new(Self::derive_address(network, index), network);
        self.keys.write().insert(handle.key_id(), handle.clone());
        Ok(handle)
    }

    async fn get_key(&self, address: &Address, network: NetworkId) -> Result<Option<KeyHandle>> {
        Ok(self.keys.read().get(&key_id(network, address)).cloned())
    }

    async fn sign(&self, key: &KeyHandle, tx: &UnsignedTransaction) -> Result<SignedPayload> {
        if !self.keys.read().contains_key(&key.key_id()) {
            return Err(Error::InvalidKey {
                key_id: key.key_id(),
            });
        }
        let encoded = serde_json::to_vec(tx)?;
        let mut hasher = Sha256::new();
        hasher.update(key.address.as_slice());
        hasher.update(&encoded);
        let signature = hasher.finalize();

        let mut raw = encoded;
        raw.extend_from_slice(&signature);
        Ok(SignedPayload {
            network: tx.network,
            from: tx.from,
            raw,
        })
    }
}

#[derive(Default)]
struct MockChainState {
    broadcast_failures: VecDeque<String>,
    receipt_failures: VecDeque<String>,
    fail_all_broadcasts: Option<String>,
    broadcasts: Vec<TxHash>,
    next_block: u64,
}

/// Scriptable chain client.
///
/// Broadcast hashes are the sha256 of the signed payload. Receipts resolve
/// after `receipt_delay`, which tests drive with a paused tokio clock.
pub struct MockChainClient {
    state: Mutex<MockChainState>,
    receipt_delay: Mutex<Duration>,
    gas_estimate: u64,
    gas_price: u128,
}

impl MockChainClient {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockChainState {
                next_block: 1,
                ..Default::default()
            }),
            receipt_delay: Mutex::new(Duration::from_millis(10)),
            gas_estimate: 21_000,
            gas_price: 1_000_000_000,
        }
    }

    pub fn with_gas(mut self, estimate: u64, price: u128) -> Self {
        self.gas_estimate = estimate;
        self.gas_price = price;
        self
    }

    /// Fail the next `count` broadcasts with `message`.
    pub fn fail_next_broadcasts(&self, count: usize, message: &str) {
        let mut state = self.state.lock();
        for _ in 0..count {
            state.broadcast_failures.push_back(message.to_string());
        }
    }

    /// Fail every broadcast until cleared with `None`.
    pub fn fail_all_broadcasts(&self, message: Option<&str>) {
        self.state.lock().fail_all_broadcasts = message.map(str::to_string);
    }

    /// Fail the next `count` receipt waits with `message`.
    pub fn fail_next_receipts(&self, count: usize, message: &str) {
        let mut state = self.state.lock();
        for _ in 0..count {
            state.receipt_failures.push_back(message.to_string());
        }
    }

    pub fn set_receipt_delay(&self, delay: Duration) {
        *self.receipt_delay.lock() = delay;
    }

    /// Hashes of every accepted broadcast, in order.
    pub fn broadcasts(&self) -> Vec<TxHash> {
        self.state.lock().broadcasts.clone()
    }

    pub fn broadcast_count(&self) -> usize {
        self.state.lock().broadcasts.len()
    }
}

impl Default for MockChainClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChainClient for MockChainClient {
    async fn estimate_gas(&self, _network: NetworkId, _tx: &UnsignedTransaction) -> Result<u64> {
        Ok(self.gas_estimate)
    }

    async fn get_gas_price(&self, _network: NetworkId) -> Result<u128> {
        Ok(self.gas_price)
    }

    async fn broadcast(&self, payload: &SignedPayload) -> Result<TxHash> {
        let mut state = self.state.lock();
        if let Some(message) = &state.fail_all_broadcasts {
            return Err(Error::broadcast(message.clone()));
        }
        if let Some(message) = state.broadcast_failures.pop_front() {
            return Err(Error::broadcast(message));
        }

        let mut hasher = Sha256::new();
        hasher.update(&payload.raw);
        hasher.update(state.broadcasts.len().to_be_bytes());
        let hash = TxHash::new(format!("0x{}", hex::encode(hasher.finalize())));
        state.broadcasts.push(hash.clone());
        Ok(hash)
    }

    async fn wait_for_receipt(
        &self,
        _network: NetworkId,
        tx_hash: &TxHash,
        confirmations: u64,
    ) -> Result<Receipt> {
        let delay = *self.receipt_delay.lock();
        tokio::time::sleep(delay).await;

        let mut state = self.state.lock();
        if let Some(message) = state.receipt_failures.pop_front() {
            return Err(Error::confirmation(message));
        }
        if !state.broadcasts.contains(tx_hash) {
            return Err(Error::confirmation(format!("unknown transaction {tx_hash}")));
        }
        let block_number = state.next_block;
        state.next_block += confirmations.max(1);
        Ok(Receipt {
            block_number,
            gas_used: self.gas_estimate,
            effective_gas_price: self.gas_price,
        })
    }
}

/// Fixed network catalog.
pub struct StaticChainDirectory {
    networks: HashMap<NetworkId, NetworkInfo>,
}

impl StaticChainDirectory {
    pub fn empty() -> Self {
        Self {
            networks: HashMap::new(),
        }
    }

    pub fn with_network(mut self, info: NetworkInfo) -> Self {
        self.networks.insert(info.id, info);
        self
    }
}

impl Default for StaticChainDirectory {
    /// Ethereum mainnet, Sepolia, Base and Polygon.
    fn default() -> Self {
        let known = [
            (1, "Ethereum", "ETH", false),
            (11_155_111, "Sepolia", "ETH", true),
            (8_453, "Base", "ETH", false),
            (137, "Polygon", "POL", false),
        ];
        known
            .into_iter()
            .fold(Self::empty(), |directory, (id, name, symbol, testnet)| {
                directory.with_network(NetworkInfo {
                    id,
                    name: name.to_string(),
                    native_symbol: symbol.to_string(),
                    testnet,
                })
            })
    }
}

impl ChainDirectory for StaticChainDirectory {
    fn resolve(&self, network: NetworkId) -> Result<NetworkInfo> {
        self.networks
            .get(&network)
            .cloned()
            .ok_or(Error::UnsupportedNetwork {
                network_id: network,
            })
    }
}
