use chrono::{DateTime, TimeZone, Utc};
use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc,
};

/// Time utilities for rate limiting calculations
///
/// The system source reads the wall clock. The manual source starts at a
/// fixed instant and only moves when [`TimeSource::advance`] is called, which
/// lets window expiry be exercised without sleeping.
#[derive(Debug, Clone)]
pub struct TimeSource {
    manual: Option<Arc<AtomicI64>>,
}

impl TimeSource {
    pub fn new() -> Self {
        Self { manual: None }
    }

    /// A clock frozen at `unix_secs` until advanced
    pub fn manual(unix_secs: i64) -> Self {
        Self {
            manual: Some(Arc::new(AtomicI64::new(unix_secs))),
        }
    }

    /// Move a manual clock forward. No-op on the system clock.
    pub fn advance(&self, secs: i64) {
        if let Some(now) = &self.manual {
            now.fetch_add(secs, Ordering::SeqCst);
        }
    }

    /// Get the current Unix timestamp in seconds
    pub fn unix_now(&self) -> i64 {
        match &self.manual {
            Some(now) => now.load(Ordering::SeqCst),
            None => Utc::now().timestamp(),
        }
    }

    /// Get the current time as a DateTime<Utc>
    pub fn utc_now(&self) -> DateTime<Utc> {
        match &self.manual {
            Some(_) => Utc
                .timestamp_opt(self.unix_now(), 0)
                .single()
                .unwrap_or_else(Utc::now),
            None => Utc::now(),
        }
    }
}

impl Default for TimeSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Cache key for a tenant's usage window, optionally scoped to one endpoint
pub fn window_key(tenant_id: u64, endpoint: Option<&str>) -> String {
    match endpoint {
        Some(endpoint) if !endpoint.is_empty() => format!("rate_limit:{}:{}", tenant_id, endpoint),
        _ => format!("rate_limit:{}", tenant_id),
    }
}

/// Cache key for a tenant's resolved limit configuration
pub fn limits_key(tenant_id: u64) -> String {
    format!("tenant_limits:{}", tenant_id)
}

/// Cache key for a tenant's block record
pub fn blocked_key(tenant_id: u64) -> String {
    format!("tenant_blocked:{}", tenant_id)
}

/// Apply an optional deployment-wide prefix to a cache key
pub fn prefixed(prefix: &str, key: String) -> String {
    if prefix.is_empty() {
        key
    } else {
        format!("{}:{}", prefix, key)
    }
}
