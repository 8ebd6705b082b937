//! Shape checks run before a transaction reaches the signing service.

use super::TransactionRequest;
use crate::error::{Error, Result};
use alloy_primitives::{Address, U256};
use serde::{Deserialize, Serialize};

pub const MAX_GAS_LIMIT: u64 = 30_000_000;
/// Maximum calldata size in hex characters, excluding the `0x` prefix.
pub const MAX_DATA_LENGTH: usize = 131_072;

/// 10^30 wei.
pub fn max_value() -> U256 {
    U256::from(10u64).pow(U256::from(30u64))
}

/// Bounds applied by [`validate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ValidationLimits {
    pub max_gas_limit: u64,
    pub max_value: U256,
    pub max_data_length: usize,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            max_gas_limit: MAX_GAS_LIMIT,
            max_value: max_value(),
            max_data_length: MAX_DATA_LENGTH,
        }
    }
}

/// A request that passed validation, with the recipient and calldata decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedTransaction {
    pub to: Address,
    pub value: U256,
    pub data: Vec<u8>,
    pub gas_limit: Option<u64>,
    pub gas_price: Option<u128>,
}

pub fn validate(request: &TransactionRequest, limits: &ValidationLimits) -> Result<ValidatedTransaction> {
    let to = parse_address(&request.to)?;

    if let Some(gas_limit) = request.gas_limit {
        check_gas_limit(gas_limit, limits)?;
    }

    if request.value > limits.max_value {
        return Err(Error::invalid_transaction(format!(
            "value {} exceeds maximum {}",
            request.value, limits.max_value
        )));
    }

    let data = match request.data.as_deref() {
        Some(raw) => parse_data(raw, limits.max_data_length)?,
        None => Vec::new(),
    };

    Ok(ValidatedTransaction {
        to,
        value: request.value,
        data,
        gas_limit: request.gas_limit,
        gas_price: request.gas_price,
    })
}

/// Gas limit must lie in `(0, max_gas_limit]`.
pub fn check_gas_limit(gas_limit: u64, limits: &ValidationLimits) -> Result<()> {
    if gas_limit == 0 {
        return Err(Error::invalid_transaction("gas limit must be greater than zero"));
    }
    if gas_limit > limits.max_gas_limit {
        return Err(Error::invalid_transaction(format!(
            "gas limit {gas_limit} exceeds maximum {}",
            limits.max_gas_limit
        )));
    }
    Ok(())
}

/// Parse a 0x-prefixed 20-byte hex address.
pub fn parse_address(raw: &str) -> Result<Address> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(Error::invalid_transaction("recipient address is required"));
    }
    let valid = trimmed.len() == 42
        && (trimmed.starts_with("0x") || trimmed.starts_with("0X"))
        && trimmed.as_bytes()[2..].iter().all(|byte| byte.is_ascii_hexdigit());
    if !valid {
        return Err(Error::invalid_transaction(format!(
            "invalid recipient address '{trimmed}': expected 0x-prefixed 20-byte hex"
        )));
    }
    let bytes = hex::decode(&trimmed[2..])
        .map_err(|err| Error::invalid_transaction(format!("invalid recipient address: {err}")))?;
    Ok(Address::from_slice(&bytes))
}

fn parse_data(raw: &str, max_length: usize) -> Result<Vec<u8>> {
    let trimmed = raw.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    if digits.len() > max_length {
        return Err(Error::invalid_transaction(format!(
            "data length {} exceeds maximum {max_length}",
            digits.len()
        )));
    }
    if digits.len() % 2 != 0 {
        return Err(Error::invalid_transaction("data hex length must be even"));
    }
    hex::decode(digits).map_err(|err| Error::invalid_transaction(format!("data must be valid hex: {err}")))
}
