//! Sliding-window rate limiting keyed by caller-chosen identifiers.
//!
//! Each identifier owns its own timestamp window behind its own mutex, so
//! concurrent checks on one identifier serialize while unrelated identifiers
//! never contend. Checks spanning several identifiers lock them in sorted
//! order and only record the request when every window allows it.

use crate::chain::{NetworkId, key_id};
use crate::types::{Clock, SystemClock, Timestamp};
use alloy_primitives::Address;
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

const HOUR_MS: u64 = 60 * 60 * 1000;
const DAY_MS: u64 = 24 * HOUR_MS;

/// `max_requests` per trailing `window_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window_ms: u64,
}

impl RateLimitConfig {
    pub fn new(max_requests: u32, window_ms: u64) -> Self {
        Self {
            max_requests,
            window_ms,
        }
    }

    pub fn per_minute(max_requests: u32) -> Self {
        Self::new(max_requests, 60_000)
    }

    pub fn per_hour(max_requests: u32) -> Self {
        Self::new(max_requests, HOUR_MS)
    }

    pub fn per_day(max_requests: u32) -> Self {
        Self::new(max_requests, DAY_MS)
    }
}

/// Outcome of a check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitResult {
    pub allowed: bool,
    /// Identifier whose window produced this result.
    pub identifier: String,
    /// Requests left in the window after this check.
    pub remaining: u32,
    /// When the oldest request in the window falls out of it.
    pub reset_at: Timestamp,
}

impl RateLimitResult {
    /// Convert a denial into [`crate::Error::RateLimited`].
    pub fn into_result(self) -> crate::Result<Self> {
        if self.allowed {
            Ok(self)
        } else {
            Err(crate::Error::RateLimited {
                identifier: self.identifier,
                reset_at: self.reset_at,
            })
        }
    }

    /// Pick the binding result of two: any denial beats an allowance; between
    /// denials the later reset wins; between allowances the lower remaining wins.
    fn most_restrictive(self, other: Self) -> Self {
        match (self.allowed, other.allowed) {
            (true, false) => other,
            (false, true) => self,
            (false, false) if other.reset_at > self.reset_at => other,
            (true, true) if other.remaining < self.remaining => other,
            _ => self,
        }
    }
}

#[derive(Default)]
struct WindowState {
    timestamps: VecDeque<u64>,
    /// Set when the window is evicted from the map. A check that cloned the
    /// handle before eviction must fetch the live window and retry.
    retired: bool,
}

type Window = Arc<Mutex<WindowState>>;

/// Per-identifier sliding-window counter.
pub struct RateLimiter {
    windows: DashMap<String, Window>,
    clock: Arc<dyn Clock>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: DashMap::new(),
            clock,
        }
    }

    fn window(&self, identifier: &str) -> Window {
        if let Some(existing) = self.windows.get(identifier) {
            return Arc::clone(existing.value());
        }
        Arc::clone(
            self.windows
                .entry(identifier.to_string())
                .or_default()
                .value(),
        )
    }

    /// Record one request against `identifier` if its window has room.
    pub fn check_limit(&self, identifier: &str, config: RateLimitConfig) -> RateLimitResult {
        self.check_all(&[(identifier.to_string(), config)])
    }

    /// Check several windows as one request. The request is recorded in every
    /// window only if all of them allow it; the most restrictive result is returned.
    pub fn check_all(&self, checks: &[(String, RateLimitConfig)]) -> RateLimitResult {
        let now = self.clock.now().as_millis();

        let mut ordered: Vec<&(String, RateLimitConfig)> = checks.iter().collect();
        ordered.sort_by(|a, b| a.0.cmp(&b.0));
        ordered.dedup_by(|a, b| a.0 == b.0);

        loop {
            let handles: Vec<Window> = ordered.iter().map(|(id, _)| self.window(id)).collect();
            let mut guards: Vec<_> = handles.iter().map(|window| window.lock()).collect();
            if guards.iter().any(|window| window.retired) {
                continue;
            }
            return Self::evaluate(&ordered, &mut guards, now);
        }
    }

    fn evaluate(
        ordered: &[&(String, RateLimitConfig)],
        guards: &mut [MutexGuard<'_, WindowState>],
        now: u64,
    ) -> RateLimitResult {
        let mut verdict: Option<RateLimitResult> = None;
        for ((identifier, config), window) in ordered.iter().zip(guards.iter_mut()) {
            let timestamps = &mut window.timestamps;
            prune(timestamps, now, config.window_ms);
            let count = timestamps.len() as u64;
            let oldest = timestamps.front().copied().unwrap_or(now);
            let result = if count >= u64::from(config.max_requests) {
                RateLimitResult {
                    allowed: false,
                    identifier: identifier.clone(),
                    remaining: 0,
                    reset_at: Timestamp::from_millis(oldest.saturating_add(config.window_ms)),
                }
            } else {
                RateLimitResult {
                    allowed: true,
                    identifier: identifier.clone(),
                    remaining: config.max_requests.saturating_sub(count as u32 + 1),
                    reset_at: Timestamp::from_millis(oldest.saturating_add(config.window_ms)),
                }
            };
            verdict = Some(match verdict {
                Some(current) => current.most_restrictive(result),
                None => result,
            });
        }

        let Some(verdict) = verdict else {
            return RateLimitResult {
                allowed: true,
                identifier: String::new(),
                remaining: u32::MAX,
                reset_at: Timestamp::from_millis(now),
            };
        };

        if verdict.allowed {
            for window in guards.iter_mut() {
                window.timestamps.push_back(now);
            }
        } else {
            tracing::debug!(
                identifier = %verdict.identifier,
                reset_at = %verdict.reset_at,
                "Rate limit exceeded"
            );
        }
        verdict
    }

    /// Requests currently counted in `identifier`'s window, without recording one.
    pub fn usage(&self, identifier: &str, window_ms: u64) -> u32 {
        let Some(window) = self.windows.get(identifier).map(|w| Arc::clone(w.value())) else {
            return 0;
        };
        let mut window = window.lock();
        prune(&mut window.timestamps, self.clock.now().as_millis(), window_ms);
        window.timestamps.len() as u32
    }

    pub fn reset(&self, identifier: &str) {
        if let Some((_, window)) = self.windows.remove(identifier) {
            window.lock().retired = true;
        }
    }

    /// Drop windows with no request newer than `max_window_ms`.
    pub fn cleanup(&self, max_window_ms: u64) -> usize {
        let now = self.clock.now().as_millis();
        let before = self.windows.len();
        self.windows.retain(|_, window| {
            let mut window = window.lock();
            prune(&mut window.timestamps, now, max_window_ms);
            window.retired = window.timestamps.is_empty();
            !window.retired
        });
        before - self.windows.len()
    }

    pub fn tracked_identifiers(&self) -> usize {
        self.windows.len()
    }
}

fn prune(timestamps: &mut VecDeque<u64>, now: u64, window_ms: u64) {
    let cutoff = now.saturating_sub(window_ms);
    while timestamps.front().is_some_and(|&ts| ts <= cutoff) {
        timestamps.pop_front();
    }
}

/// Windows applied to every transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransactionLimits {
    /// Short window per sending agent `(network, address)`.
    pub per_agent: Option<RateLimitConfig>,
    /// Across all senders on one network.
    pub per_network: Option<RateLimitConfig>,
    /// Per recipient address on one network.
    pub per_destination: Option<RateLimitConfig>,
    pub hourly_per_address: u32,
    pub daily_per_address: u32,
}

impl Default for TransactionLimits {
    fn default() -> Self {
        Self {
            per_agent: Some(RateLimitConfig::per_minute(10)),
            per_network: Some(RateLimitConfig::per_minute(100)),
            per_destination: Some(RateLimitConfig::per_minute(20)),
            hourly_per_address: 100,
            daily_per_address: 1_000,
        }
    }
}

/// Transaction-specific limiter: hourly and daily caps per `(network, address)`
/// plus optional per-agent, per-network and per-destination windows.
pub struct TransactionRateLimiter {
    limiter: RateLimiter,
    limits: TransactionLimits,
}

impl TransactionRateLimiter {
    pub fn new(limits: TransactionLimits) -> Self {
        Self::with_clock(limits, Arc::new(SystemClock))
    }

    pub fn with_clock(limits: TransactionLimits, clock: Arc<dyn Clock>) -> Self {
        Self {
            limiter: RateLimiter::with_clock(clock),
            limits,
        }
    }

    pub fn limits(&self) -> &TransactionLimits {
        &self.limits
    }

    /// Hourly and daily caps only.
    pub fn check_address(&self, network: NetworkId, address: &Address) -> RateLimitResult {
        self.limiter.check_all(&self.address_checks(network, address))
    }

    /// Every configured window for one transaction from `from` to `to`.
    pub fn check_transaction(
        &self,
        network: NetworkId,
        from: &Address,
        to: &Address,
    ) -> RateLimitResult {
        let mut checks = self.address_checks(network, from);
        let sender = key_id(network, from);
        if let Some(config) = self.limits.per_agent {
            checks.push((format!("agent:{sender}"), config));
        }
        if let Some(config) = self.limits.per_network {
            checks.push((format!("network:{network}"), config));
        }
        if let Some(config) = self.limits.per_destination {
            checks.push((format!("destination:{}", key_id(network, to)), config));
        }
        self.limiter.check_all(&checks)
    }

    fn address_checks(&self, network: NetworkId, address: &Address) -> Vec<(String, RateLimitConfig)> {
        let id = key_id(network, address);
        vec![
            (
                format!("hourly:{id}"),
                RateLimitConfig::per_hour(self.limits.hourly_per_address),
            ),
            (
                format!("daily:{id}"),
                RateLimitConfig::per_day(self.limits.daily_per_address),
            ),
        ]
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Drop windows with nothing left inside the longest configured window.
    pub fn cleanup(&self) -> usize {
        let longest = [
            self.limits.per_agent,
            self.limits.per_network,
            self.limits.per_destination,
        ]
        .into_iter()
        .flatten()
        .map(|config| config.window_ms)
        .fold(DAY_MS, u64::max);
        self.limiter.cleanup(longest)
    }
}
