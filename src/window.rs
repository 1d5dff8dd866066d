//! Fixed-window accounting state and the admission rule.
//!
//! A window lives for `window_secs` from the first request that observed it.
//! Once `now >= reset_at` the whole state is discarded; there is no sliding
//! carry-over between windows.

use serde::{Deserialize, Serialize};

/// Per-tenant rate policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantLimitConfig {
    pub hourly_limit: u64,
    pub burst_allowance: u64,
}

impl Default for TenantLimitConfig {
    fn default() -> Self {
        Self {
            hourly_limit: 1000,
            burst_allowance: 50,
        }
    }
}

/// Mutable accounting state for one (tenant, endpoint) key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageWindow {
    pub count: u64,
    pub reset_at: i64,
    pub burst_used: u64,
}

/// Outcome of applying the admission rule to a window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Under the hourly limit
    Within,
    /// Over the hourly limit, absorbed by the burst allowance
    Burst,
    Rejected,
}

impl Admission {
    pub fn is_allowed(self) -> bool {
        !matches!(self, Admission::Rejected)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Admission::Within => "allowed",
            Admission::Burst => "burst",
            Admission::Rejected => "rejected",
        }
    }
}

impl UsageWindow {
    /// A new, empty window starting at `now`
    pub fn fresh(now: i64, window_secs: u64) -> Self {
        Self {
            count: 0,
            reset_at: now + window_secs as i64,
            burst_used: 0,
        }
    }

    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.reset_at
    }

    /// Resolve the window in effect at `now` from whatever was stored
    pub fn current(stored: Option<Self>, now: i64, window_secs: u64) -> Self {
        match stored {
            Some(window) if !window.is_expired(now) => window,
            _ => Self::fresh(now, window_secs),
        }
    }

    /// Apply the admission rule, updating counters only when admitted
    pub fn admit(&mut self, limits: &TenantLimitConfig) -> Admission {
        if self.count < limits.hourly_limit {
            self.count += 1;
            Admission::Within
        } else if self.burst_used < limits.burst_allowance {
            self.burst_used += 1;
            self.count += 1;
            Admission::Burst
        } else {
            Admission::Rejected
        }
    }

    /// Take back an admission that was never served
    pub fn release(&mut self, admission: Admission) {
        match admission {
            Admission::Within => self.count = self.count.saturating_sub(1),
            Admission::Burst => {
                self.count = self.count.saturating_sub(1);
                self.burst_used = self.burst_used.saturating_sub(1);
            }
            Admission::Rejected => {}
        }
    }

    /// Whether the next request would be admitted, without consuming quota
    pub fn would_admit(&self, limits: &TenantLimitConfig) -> bool {
        self.count < limits.hourly_limit || self.burst_used < limits.burst_allowance
    }

    pub fn remaining(&self, limits: &TenantLimitConfig) -> u64 {
        limits.hourly_limit.saturating_sub(self.count)
    }

    pub fn burst_remaining(&self, limits: &TenantLimitConfig) -> u64 {
        limits.burst_allowance.saturating_sub(self.burst_used)
    }

    /// Seconds the cached copy should live: until the window resets, at least 1
    pub fn ttl_secs(&self, now: i64) -> u64 {
        (self.reset_at - now).max(1) as u64
    }
}
