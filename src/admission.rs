//! IP-level admission guard.
//!
//! Tracks authorization failures per client and blocks clients that fail too
//! often. State is in-memory, bounded, and decays with time:
//!
//! ```text
//! Clean ──fail──▶ Accumulating(count < max) ──fail (count = max)──▶ Blocked(until)
//!   ▲                    │ (no failure for block_duration)              │
//!   └────────────────────┴──────────────── expiry / unblock ◀───────────┘
//! ```
//!
//! - [`AdmissionGuard::is_blocked`]: pre-dispatch check; sweeps expired
//!   entries at most once per `cleanup_interval`.
//! - [`AdmissionGuard::record_failed_attempt`]: failure hook.
//! - [`AdmissionGuard::block_info`]: live remaining time for `Retry-After`.
//! - [`AdmissionGuard::unblock`] / [`blocklist`](AdmissionGuard::blocklist) /
//!   [`status`](AdmissionGuard::status): administrative surface.
//!
//! All operations run under one mutex, so every check-then-modify sequence is
//! atomic with respect to other callers. None of them fail.
//!
//! # Blocklist overflow
//!
//! When more than `max_blocked_ips` entries survive a sweep, the ones closest
//! to expiry are evicted first, so the longest bans are the ones kept.

use crate::adaptive::DynamicConfig;
use crate::clock::{Clock, MonotonicClock};
use crate::config::AdmissionConfig;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

pub mod middleware;
pub use middleware::{AdmissionLayer, AdmissionService};

/// Identity the guard tracks, normally the textual client IP.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ClientKey(String);

impl ClientKey {
    /// Reserved key for callers whose address cannot be determined. They share
    /// one failure budget rather than bypassing the guard.
    pub const UNKNOWN: &'static str = "unknown";

    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn unknown() -> Self {
        Self(Self::UNKNOWN.to_string())
    }

    /// Resolve a peer address, falling back to [`ClientKey::UNKNOWN`].
    pub fn from_peer(peer: Option<IpAddr>) -> Self {
        peer.map_or_else(Self::unknown, Self::from)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Deref for ClientKey {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<IpAddr> for ClientKey {
    fn from(ip: IpAddr) -> Self {
        Self(ip.to_string())
    }
}

impl From<SocketAddr> for ClientKey {
    fn from(addr: SocketAddr) -> Self {
        Self::from(addr.ip())
    }
}

impl From<&str> for ClientKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for ClientKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// Result of [`AdmissionGuard::record_failed_attempt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Failure counted; the client may keep trying.
    NotBlocked { attempts: u32 },
    /// The failure threshold was reached; the block starts (or restarts) now.
    Blocked { attempts: u32, blocked_for: Duration },
}

impl AttemptOutcome {
    pub fn is_blocked(&self) -> bool {
        matches!(self, AttemptOutcome::Blocked { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            AttemptOutcome::NotBlocked { attempts } | AttemptOutcome::Blocked { attempts, .. } => {
                *attempts
            }
        }
    }
}

/// Live view of one key's block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockInfo {
    pub blocked: bool,
    pub remaining_seconds: u64,
    /// Wall-clock estimate of when the block lifts.
    pub unblock_at: Option<SystemTime>,
}

/// Administrative status for one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientStatus {
    pub key: ClientKey,
    pub blocked: bool,
    pub remaining_seconds: u64,
    pub unblock_at: Option<SystemTime>,
    pub failed_attempts: u32,
}

/// One row of [`AdmissionGuard::blocklist`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockListing {
    pub key: ClientKey,
    pub remaining_seconds: u64,
    pub failed_attempts: u32,
}

/// What a sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Blocks past their expiry.
    pub expired: usize,
    /// Live blocks evicted to respect `max_blocked_ips`.
    pub evicted: usize,
    /// Stale failure records dropped.
    pub decayed: usize,
}

#[derive(Debug, Clone, Copy)]
struct FailureRecord {
    count: u32,
    last_failure_ms: u64,
}

#[derive(Debug, Default)]
struct GuardState {
    failures: HashMap<String, FailureRecord>,
    blocked: HashMap<String, u64>,
    last_cleanup_ms: u64,
}

/// Failure tracker and blocklist. Clones share the same state.
#[derive(Debug, Clone)]
pub struct AdmissionGuard {
    state: Arc<Mutex<GuardState>>,
    config: DynamicConfig<AdmissionConfig>,
    clock: Arc<dyn Clock>,
}

impl Default for AdmissionGuard {
    fn default() -> Self {
        Self::new(AdmissionConfig::default())
    }
}

impl AdmissionGuard {
    pub fn new(config: AdmissionConfig) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::default());
        let state = GuardState { last_cleanup_ms: clock.now_millis(), ..GuardState::default() };
        Self { state: Arc::new(Mutex::new(state)), config: DynamicConfig::new(config), clock }
    }

    /// Override the clock (useful for deterministic tests). The cleanup
    /// cadence restarts from the new clock's current time.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        let now = self.clock.now_millis();
        self.lock().last_cleanup_ms = now;
        self
    }

    /// Current parameters.
    pub fn config(&self) -> Arc<AdmissionConfig> {
        self.config.get()
    }

    /// Swap parameters at runtime. Existing blocks keep their expiry; new
    /// thresholds apply from the next call.
    pub fn reconfigure(&self, config: AdmissionConfig) {
        debug!(target: "holdfast::admission", ?config, "admission guard reconfigured");
        self.config.set(config);
    }

    /// Count a failure for `key`, blocking it once `max_failed_attempts` is reached.
    ///
    /// A failure more than `block_duration` after the previous one starts the
    /// count over. Failures while already blocked extend the block.
    pub fn record_failed_attempt(&self, key: &str) -> AttemptOutcome {
        let cfg = self.config.get();
        let block_ms = millis(cfg.block_duration());
        let now = self.clock.now_millis();
        let mut state = self.lock();

        let record = state
            .failures
            .entry(key.to_owned())
            .or_insert(FailureRecord { count: 0, last_failure_ms: now });
        if now.saturating_sub(record.last_failure_ms) > block_ms {
            record.count = 0;
        }
        record.count = record.count.saturating_add(1);
        record.last_failure_ms = now;
        let attempts = record.count;

        if attempts < cfg.max_failed_attempts() {
            return AttemptOutcome::NotBlocked { attempts };
        }

        let newly = state.blocked.insert(key.to_owned(), now.saturating_add(block_ms)).is_none();
        if newly {
            warn!(
                target: "holdfast::admission",
                key,
                attempts,
                block_secs = cfg.block_duration().as_secs(),
                "client blocked after repeated failures"
            );
        } else {
            debug!(target: "holdfast::admission", key, attempts, "block extended");
        }
        AttemptOutcome::Blocked { attempts, blocked_for: cfg.block_duration() }
    }

    /// Whether `key` is currently blocked.
    ///
    /// Sweeps expired entries first if `cleanup_interval` has passed since the
    /// last sweep. An expired block found here is removed and its failure count
    /// reset.
    pub fn is_blocked(&self, key: &str) -> bool {
        let cfg = self.config.get();
        let now = self.clock.now_millis();
        let mut state = self.lock();

        if now.saturating_sub(state.last_cleanup_ms) >= millis(cfg.cleanup_interval()) {
            sweep(&mut state, now, &cfg);
        }

        match state.blocked.get(key).copied() {
            Some(until) if now < until => true,
            Some(_) => {
                state.blocked.remove(key);
                state.failures.remove(key);
                debug!(target: "holdfast::admission", key, "block expired");
                false
            }
            None => false,
        }
    }

    /// Sweep now, regardless of `cleanup_interval`.
    ///
    /// Afterwards no expired block remains and at most `max_blocked_ips` are kept.
    pub fn cleanup_expired(&self) -> CleanupReport {
        let cfg = self.config.get();
        let now = self.clock.now_millis();
        let mut state = self.lock();
        sweep(&mut state, now, &cfg)
    }

    /// Live block status, independent of the sweep cadence. Never mutates.
    pub fn block_info(&self, key: &str) -> BlockInfo {
        let now = self.clock.now_millis();
        let state = self.lock();
        block_info_at(state.blocked.get(key).copied(), now)
    }

    /// Lift a block by hand and forget the key's failures. Returns whether the
    /// key was blocked.
    pub fn unblock(&self, key: &str) -> bool {
        let mut state = self.lock();
        let was_blocked = state.blocked.remove(key).is_some();
        state.failures.remove(key);
        if was_blocked {
            debug!(target: "holdfast::admission", key, "client unblocked by operator");
        }
        was_blocked
    }

    /// Block info plus the current failure count.
    pub fn status(&self, key: &str) -> ClientStatus {
        let now = self.clock.now_millis();
        let state = self.lock();
        let info = block_info_at(state.blocked.get(key).copied(), now);
        ClientStatus {
            key: ClientKey::from(key),
            blocked: info.blocked,
            remaining_seconds: info.remaining_seconds,
            unblock_at: info.unblock_at,
            failed_attempts: state.failures.get(key).map_or(0, |r| r.count),
        }
    }

    /// Every block entry (including any expired one not yet swept), sorted by key.
    pub fn blocklist(&self) -> Vec<BlockListing> {
        let now = self.clock.now_millis();
        let state = self.lock();
        let mut rows: Vec<BlockListing> = state
            .blocked
            .iter()
            .map(|(key, &until)| BlockListing {
                key: ClientKey::from(key.as_str()),
                remaining_seconds: until.saturating_sub(now) / 1000,
                failed_attempts: state.failures.get(key).map_or(0, |r| r.count),
            })
            .collect();
        rows.sort_by(|a, b| a.key.cmp(&b.key));
        rows
    }

    /// Number of block entries held.
    pub fn blocked_count(&self) -> usize {
        self.lock().blocked.len()
    }

    /// Number of keys with a failure record.
    pub fn tracked_count(&self) -> usize {
        self.lock().failures.len()
    }

    fn lock(&self) -> MutexGuard<'_, GuardState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn sweep(state: &mut GuardState, now: u64, cfg: &AdmissionConfig) -> CleanupReport {
    state.last_cleanup_ms = now;
    let mut report = CleanupReport::default();

    let mut expired = Vec::new();
    state.blocked.retain(|key, &mut until| {
        let keep = until > now;
        if !keep {
            expired.push(key.clone());
        }
        keep
    });
    for key in &expired {
        state.failures.remove(key);
    }
    report.expired = expired.len();

    let max = cfg.max_blocked_ips();
    if state.blocked.len() > max {
        let mut by_expiry: Vec<(u64, String)> =
            state.blocked.iter().map(|(key, &until)| (until, key.clone())).collect();
        by_expiry.sort_unstable();
        let excess = by_expiry.len() - max;
        for (_, key) in by_expiry.into_iter().take(excess) {
            state.blocked.remove(&key);
        }
        report.evicted = excess;
        warn!(
            target: "holdfast::admission",
            evicted = excess,
            max_blocked_ips = max,
            "blocklist over capacity; evicted entries nearest expiry"
        );
    }

    let block_ms = millis(cfg.block_duration());
    let before = state.failures.len();
    let blocked = &state.blocked;
    state.failures.retain(|key, record| {
        blocked.contains_key(key) || now.saturating_sub(record.last_failure_ms) <= block_ms
    });
    report.decayed = before - state.failures.len();

    debug!(
        target: "holdfast::admission",
        expired = report.expired,
        evicted = report.evicted,
        decayed = report.decayed,
        "admission sweep"
    );
    report
}

fn block_info_at(until: Option<u64>, now: u64) -> BlockInfo {
    match until {
        Some(until) if until > now => {
            let remaining = until - now;
            BlockInfo {
                blocked: true,
                remaining_seconds: remaining / 1000,
                unblock_at: SystemTime::now().checked_add(Duration::from_millis(remaining)),
            }
        }
        _ => BlockInfo { blocked: false, remaining_seconds: 0, unblock_at: None },
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
