//! Proxy rotation with per-proxy health tracking.
//!
//! # Health States
//!
//! ```text
//! HEALTHY --[1 failure]--> SUSPECT --[threshold consecutive failures]--> BANNED
//!    ^                        |                                            |
//!    +-------[success]--------+            [reset / recovery timeout]      |
//!                             ^--------------------------------------------+
//! ```
//!
//! `next()` rotates round-robin over healthy proxies, falls back to suspect
//! ones, and returns [`AppError::NoProxyAvailable`] once every proxy is
//! banned. A pool built without addresses is a pass-through that always
//! yields a direct connection.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::AppError;

/// Health of a single proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyHealth {
    Healthy,
    Suspect,
    Banned,
}

impl fmt::Display for ProxyHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyHealth::Healthy => write!(f, "healthy"),
            ProxyHealth::Suspect => write!(f, "suspect"),
            ProxyHealth::Banned => write!(f, "banned"),
        }
    }
}

/// Configuration for proxy health transitions.
#[derive(Debug, Clone)]
pub struct ProxyPoolConfig {
    /// Consecutive failures after which a proxy is banned.
    pub ban_threshold: u32,

    /// When set, a banned proxy becomes suspect again after this long
    /// without being used. `None` means only a manual reset revives it.
    pub recovery_timeout: Option<Duration>,
}

impl Default for ProxyPoolConfig {
    fn default() -> Self {
        Self {
            ban_threshold: 3,
            recovery_timeout: None,
        }
    }
}

/// A proxy handed out by [`ProxyPool::next`]; report its outcome back.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProxyEndpoint {
    index: usize,
    address: String,
}

impl ProxyEndpoint {
    pub fn address(&self) -> &str {
        &self.address
    }
}

impl fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

/// Point-in-time view of one proxy, for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyRecord {
    pub address: String,
    pub health: ProxyHealth,
    pub consecutive_failures: u32,
    pub last_used: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct ProxyState {
    health: ProxyHealth,
    consecutive_failures: u32,
    last_used: Option<DateTime<Utc>>,
    last_failure: Option<Instant>,
}

#[derive(Debug)]
struct ProxySlot {
    address: String,
    state: Mutex<ProxyState>,
}

/// Thread-safe proxy rotation. Each proxy has its own lock; there is no
/// pool-wide lock.
#[derive(Debug)]
pub struct ProxyPool {
    slots: Vec<ProxySlot>,
    cursor: AtomicUsize,
    config: ProxyPoolConfig,
}

impl ProxyPool {
    pub fn new<I, S>(addresses: I, config: ProxyPoolConfig) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let slots = addresses
            .into_iter()
            .map(|address| ProxySlot {
                address: address.into(),
                state: Mutex::new(ProxyState {
                    health: ProxyHealth::Healthy,
                    consecutive_failures: 0,
                    last_used: None,
                    last_failure: None,
                }),
            })
            .collect();
        Self {
            slots,
            cursor: AtomicUsize::new(0),
            config,
        }
    }

    /// A pool that never proxies.
    pub fn direct() -> Self {
        Self::new(Vec::<String>::new(), ProxyPoolConfig::default())
    }

    pub fn is_direct(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn lock_slot(&self, index: usize) -> MutexGuard<'_, ProxyState> {
        let slot = &self.slots[index];
        slot.state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(proxy = %slot.address, "Recovered from poisoned mutex");
            poisoned.into_inner()
        })
    }

    /// Pick the proxy for the next request.
    ///
    /// Returns `Ok(None)` for a direct connection when the pool is empty.
    pub fn next(&self) -> Result<Option<ProxyEndpoint>, AppError> {
        let n = self.slots.len();
        if n == 0 {
            return Ok(None);
        }

        let start = self.cursor.load(Ordering::Relaxed) % n;
        let mut fallback = None;

        for offset in 0..n {
            let index = (start + offset) % n;
            let mut state = self.lock_slot(index);
            self.maybe_recover(index, &mut state);
            match state.health {
                ProxyHealth::Healthy => {
                    state.last_used = Some(Utc::now());
                    return Ok(Some(self.claim(index)));
                }
                ProxyHealth::Suspect if fallback.is_none() => fallback = Some(index),
                _ => {}
            }
        }

        if let Some(index) = fallback {
            let mut state = self.lock_slot(index);
            if state.health != ProxyHealth::Banned {
                state.last_used = Some(Utc::now());
                tracing::debug!(proxy = %self.slots[index].address, "No healthy proxy, using suspect one");
                return Ok(Some(self.claim(index)));
            }
        }

        Err(AppError::NoProxyAvailable { proxies: n })
    }

    fn claim(&self, index: usize) -> ProxyEndpoint {
        self.cursor
            .store((index + 1) % self.slots.len(), Ordering::Relaxed);
        ProxyEndpoint {
            index,
            address: self.slots[index].address.clone(),
        }
    }

    /// Record the outcome of a request made through `proxy`.
    pub fn report_outcome(&self, proxy: &ProxyEndpoint, success: bool) {
        if proxy.index >= self.slots.len() {
            return;
        }
        let mut state = self.lock_slot(proxy.index);

        if success {
            state.consecutive_failures = 0;
            if state.health == ProxyHealth::Suspect {
                tracing::info!(proxy = %proxy, "Proxy recovered");
                state.health = ProxyHealth::Healthy;
            }
            return;
        }

        state.consecutive_failures += 1;
        state.last_failure = Some(Instant::now());

        if state.health == ProxyHealth::Banned {
            return;
        }
        if state.consecutive_failures >= self.config.ban_threshold.max(1) {
            tracing::warn!(
                proxy = %proxy,
                failures = state.consecutive_failures,
                "Proxy banned after {} consecutive failures",
                state.consecutive_failures
            );
            state.health = ProxyHealth::Banned;
        } else if state.health == ProxyHealth::Healthy {
            tracing::debug!(proxy = %proxy, "Proxy marked suspect");
            state.health = ProxyHealth::Suspect;
        }
    }

    /// Restore one proxy to healthy. Returns false if the address is unknown.
    pub fn reset(&self, address: &str) -> bool {
        let Some(index) = self.slots.iter().position(|s| s.address == address) else {
            return false;
        };
        let mut state = self.lock_slot(index);
        tracing::info!(proxy = %address, "Proxy health manually reset");
        state.health = ProxyHealth::Healthy;
        state.consecutive_failures = 0;
        state.last_failure = None;
        true
    }

    pub fn reset_all(&self) {
        for slot in &self.slots {
            self.reset(&slot.address);
        }
    }

    pub fn health(&self, address: &str) -> Option<ProxyHealth> {
        let index = self.slots.iter().position(|s| s.address == address)?;
        let mut state = self.lock_slot(index);
        self.maybe_recover(index, &mut state);
        Some(state.health)
    }

    pub fn snapshot(&self) -> Vec<ProxyRecord> {
        (0..self.slots.len())
            .map(|index| {
                let mut state = self.lock_slot(index);
                self.maybe_recover(index, &mut state);
                ProxyRecord {
                    address: self.slots[index].address.clone(),
                    health: state.health,
                    consecutive_failures: state.consecutive_failures,
                    last_used: state.last_used,
                }
            })
            .collect()
    }

    fn maybe_recover(&self, index: usize, state: &mut ProxyState) {
        if state.health == ProxyHealth::Banned
            && let Some(timeout) = self.config.recovery_timeout
            && let Some(last_failure) = state.last_failure
            && last_failure.elapsed() >= timeout
        {
            tracing::info!(
                proxy = %self.slots[index].address,
                "Banned proxy eligible again after recovery timeout"
            );
            state.health = ProxyHealth::Suspect;
            state.consecutive_failures = self.config.ban_threshold.saturating_sub(1);
        }
    }
}
