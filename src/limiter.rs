use moka::future::Cache;
use serde::{Deserialize, Serialize};
use std::{future::Future, sync::Arc, time::Duration};
use tokio::{
    sync::{Mutex, OwnedMutexGuard},
    time::Instant,
};
use tracing::{debug, info, warn};

use crate::{
    cache::{KeyValueCache, MemoryCache, RedisCache},
    config::{CacheBackend, LimiterSettings, Settings, StoreBackend},
    error::{RateLimitError, Result},
    metrics::Metrics,
    redis::RedisClient,
    sql::SqliteUsageStore,
    store::{MemoryUsageStore, UsagePeriod, UsageRecord, UsageStats, UsageStore},
    utils::{blocked_key, limits_key, prefixed, window_key, TimeSource},
    window::{Admission, TenantLimitConfig, UsageWindow},
};

pub const RATE_LIMIT_EXCEEDED: &str = "Rate limit exceeded";
pub const CHECK_TIMED_OUT: &str = "Rate limit check timed out";

/// Caller details recorded with each admitted request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// Outcome of a rate limit check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub allowed: bool,
    pub reason: Option<String>,
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: i64,
    pub burst_remaining: u64,
}

impl Decision {
    fn from_window(allowed: bool, window: &UsageWindow, limits: &TenantLimitConfig) -> Self {
        Self {
            allowed,
            reason: (!allowed).then(|| RATE_LIMIT_EXCEEDED.to_string()),
            limit: limits.hourly_limit,
            remaining: window.remaining(limits),
            reset_at: window.reset_at,
            burst_remaining: window.burst_remaining(limits),
        }
    }

    /// Header values for the response to the request this decision was made for
    pub fn headers(&self) -> RateLimitHeaders {
        RateLimitHeaders {
            limit: self.limit,
            remaining: self.remaining,
            reset_at: self.reset_at,
        }
    }
}

/// Quota values conventionally attached to an HTTP response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitHeaders {
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: i64,
}

impl RateLimitHeaders {
    pub const LIMIT: &'static str = "X-RateLimit-Limit";
    pub const REMAINING: &'static str = "X-RateLimit-Remaining";
    pub const RESET: &'static str = "X-RateLimit-Reset";

    pub fn to_pairs(&self) -> [(&'static str, String); 3] {
        [
            (Self::LIMIT, self.limit.to_string()),
            (Self::REMAINING, self.remaining.to_string()),
            (Self::RESET, self.reset_at.to_string()),
        ]
    }
}

/// Stored form of an administrative block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub blocked: bool,
    pub reason: String,
    pub blocked_at: i64,
}

/// Result of [`RateLimiter::is_blocked`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockStatus {
    pub blocked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_at: Option<i64>,
}

impl BlockStatus {
    pub fn unblocked() -> Self {
        Self {
            blocked: false,
            reason: None,
            blocked_at: None,
        }
    }
}

impl From<BlockRecord> for BlockStatus {
    fn from(record: BlockRecord) -> Self {
        Self {
            blocked: record.blocked,
            reason: Some(record.reason),
            blocked_at: Some(record.blocked_at),
        }
    }
}

/// A window decided under its key lock and not yet written back
struct PendingWindow {
    guard: OwnedMutexGuard<()>,
    admission: Admission,
    window: UsageWindow,
}

/// Per-tenant hourly limiter with burst allowance and usage tracking
pub struct RateLimiter {
    cache: Arc<dyn KeyValueCache>,
    store: Arc<dyn UsageStore>,
    settings: LimiterSettings,
    key_prefix: String,
    time_source: TimeSource,
    metrics: Arc<Metrics>,
    // serializes read-decide-write per window key when the cache has no atomic admission
    key_locks: Cache<String, Arc<Mutex<()>>>,
}

impl RateLimiter {
    /// Create a new rate limiter over the given cache and store
    pub fn new(
        cache: Arc<dyn KeyValueCache>,
        store: Arc<dyn UsageStore>,
        settings: LimiterSettings,
    ) -> Self {
        let key_locks = Cache::builder()
            .time_to_idle(Duration::from_secs(settings.key_lock_idle_secs.max(1)))
            .build();

        Self {
            cache,
            store,
            settings,
            key_prefix: String::new(),
            time_source: TimeSource::new(),
            metrics: Arc::new(Metrics::default()),
            key_locks,
        }
    }

    /// Build the cache and store backends named in `settings`
    pub async fn from_settings(settings: &Settings, metrics: Arc<Metrics>) -> Result<Self> {
        settings.limiter.validate()?;

        let cache: Arc<dyn KeyValueCache> = match settings.cache.backend {
            CacheBackend::Memory => Arc::new(MemoryCache::new(settings.cache.local_capacity)),
            CacheBackend::Redis => {
                let client = RedisClient::new(settings.cache.redis.clone()).await?;
                Arc::new(RedisCache::new(client))
            }
        };

        let store: Arc<dyn UsageStore> = match settings.store.backend {
            StoreBackend::Memory => Arc::new(MemoryUsageStore::new()),
            StoreBackend::Sqlite => {
                let store = SqliteUsageStore::connect(
                    &settings.store.database_url,
                    settings.store.max_connections,
                )
                .await?;
                store.ensure_schema().await?;
                Arc::new(store)
            }
        };

        info!(
            cache = ?settings.cache.backend,
            store = ?settings.store.backend,
            "Rate limiter backends ready"
        );

        Ok(Self::new(cache, store, settings.limiter.clone())
            .with_key_prefix(settings.cache.key_prefix.clone())
            .with_metrics(metrics))
    }

    pub fn with_time_source(mut self, time_source: TimeSource) -> Self {
        self.time_source = time_source;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_key_prefix(mut self, key_prefix: impl Into<String>) -> Self {
        self.key_prefix = key_prefix.into();
        self
    }

    pub fn settings(&self) -> &LimiterSettings {
        &self.settings
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    fn key(&self, key: String) -> String {
        prefixed(&self.key_prefix, key)
    }

    /// Decide whether one request for `tenant_id` (scoped to `endpoint` when
    /// given) is admitted, consuming one unit of quota if so.
    ///
    /// The configured check timeout bounds limit resolution and the window
    /// read. Once a request is admitted its usage record and window write run
    /// to completion, so a timed-out check never consumes quota.
    pub async fn check_limit(
        &self,
        tenant_id: u64,
        endpoint: Option<&str>,
        ctx: &RequestContext,
    ) -> Result<Decision> {
        validate_tenant(tenant_id)?;
        let _timer = self.metrics.start_check_timer();
        let deadline = self
            .settings
            .check_timeout()
            .map(|timeout| Instant::now() + timeout);

        let Some(limits) = within(deadline, self.tenant_limits(tenant_id)).await? else {
            return Ok(self.timed_out(tenant_id, endpoint, &self.settings.default_limits()));
        };
        let key = self.key(window_key(tenant_id, endpoint));

        let atomic = self
            .cache
            .admit_atomic(&key, &limits, self.time_source.unix_now(), self.settings.window_secs)
            .await?;
        let (admission, window) = match atomic {
            Some((admission, window)) => {
                if admission.is_allowed() {
                    if let Err(err) = self.record_usage(tenant_id, endpoint, ctx).await {
                        self.release_atomic(&key, admission, &window).await;
                        return Err(err);
                    }
                }
                (admission, window)
            }
            None => {
                let Some(pending) = within(deadline, self.lock_window(&key, &limits)).await? else {
                    return Ok(self.timed_out(tenant_id, endpoint, &limits));
                };
                self.commit_locked(&key, pending, tenant_id, endpoint, ctx).await?
            }
        };

        self.metrics.record_admission(admission);

        if admission.is_allowed() {
            debug!(
                tenant_id,
                endpoint,
                count = window.count,
                burst_used = window.burst_used,
                outcome = admission.as_str(),
                "Request admitted"
            );
        } else {
            warn!(
                tenant_id,
                endpoint,
                limit = limits.hourly_limit,
                reset_at = window.reset_at,
                "Rate limit exceeded"
            );
        }

        Ok(Decision::from_window(admission.is_allowed(), &window, &limits))
    }

    /// Read and decide a window under its key lock. Nothing is written yet.
    async fn lock_window(&self, key: &str, limits: &TenantLimitConfig) -> Result<PendingWindow> {
        let lock = self
            .key_locks
            .get_with(key.to_string(), async { Arc::new(Mutex::new(())) })
            .await;
        let guard = lock.lock_owned().await;

        let now = self.time_source.unix_now();
        let stored = self.load_window(key).await?;
        let mut window = UsageWindow::current(stored, now, self.settings.window_secs);
        let admission = window.admit(limits);

        Ok(PendingWindow {
            guard,
            admission,
            window,
        })
    }

    /// Persist an admitted window: usage record first, so a failed record
    /// leaves the window as it was.
    async fn commit_locked(
        &self,
        key: &str,
        pending: PendingWindow,
        tenant_id: u64,
        endpoint: Option<&str>,
        ctx: &RequestContext,
    ) -> Result<(Admission, UsageWindow)> {
        let PendingWindow {
            guard,
            admission,
            window,
        } = pending;

        if admission.is_allowed() {
            let value = serde_json::to_string(&window)?;
            self.record_usage(tenant_id, endpoint, ctx).await?;

            let ttl = Duration::from_secs(window.ttl_secs(self.time_source.unix_now()));
            self.cache.set(key, &value, ttl).await?;
        }

        drop(guard);
        Ok((admission, window))
    }

    async fn release_atomic(&self, key: &str, admission: Admission, window: &UsageWindow) {
        match self.cache.release_atomic(key, admission, window.reset_at).await {
            Ok(released) => debug!(key, released, "Admission released after failed usage write"),
            Err(err) => warn!(key, error = %err, "Failed to release admission"),
        }
    }

    fn timed_out(&self, tenant_id: u64, endpoint: Option<&str>, limits: &TenantLimitConfig) -> Decision {
        warn!(
            tenant_id,
            endpoint,
            timeout_ms = ?self.settings.check_timeout_ms,
            "Rate limit check timed out, rejecting"
        );
        self.metrics.record_timeout();

        Decision {
            allowed: false,
            reason: Some(CHECK_TIMED_OUT.to_string()),
            limit: limits.hourly_limit,
            remaining: 0,
            reset_at: self.time_source.unix_now() + self.settings.window_secs as i64,
            burst_remaining: 0,
        }
    }

    async fn load_window(&self, key: &str) -> Result<Option<UsageWindow>> {
        match self.cache.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn record_usage(
        &self,
        tenant_id: u64,
        endpoint: Option<&str>,
        ctx: &RequestContext,
    ) -> Result<()> {
        let record = UsageRecord {
            tenant_id,
            endpoint: endpoint.filter(|e| !e.is_empty()).map(str::to_string),
            timestamp: self.time_source.utc_now(),
            ip_address: ctx.ip_address.clone(),
            user_agent: ctx.user_agent.clone(),
        };
        self.store.record_usage(&record).await?;
        self.metrics.record_usage_record();
        Ok(())
    }

    /// Effective limits for a tenant: cache, then store, then defaults
    pub async fn tenant_limits(&self, tenant_id: u64) -> Result<TenantLimitConfig> {
        validate_tenant(tenant_id)?;
        let key = self.key(limits_key(tenant_id));

        if let Some(raw) = self.cache.get(&key).await? {
            self.metrics.record_config_cache(true);
            return Ok(serde_json::from_str(&raw)?);
        }
        self.metrics.record_config_cache(false);

        let defaults = self.settings.default_limits();
        let limits = match self.store.tenant_limits(tenant_id).await? {
            Some(row) => TenantLimitConfig {
                hourly_limit: row
                    .api_rate_limit
                    .filter(|limit| *limit > 0)
                    .unwrap_or(defaults.hourly_limit),
                burst_allowance: row.api_burst_limit.unwrap_or(defaults.burst_allowance),
            },
            None => {
                debug!(tenant_id, "No tenant row, using default limits");
                defaults
            }
        };

        self.cache
            .set(
                &key,
                &serde_json::to_string(&limits)?,
                Duration::from_secs(self.settings.config_cache_ttl_secs),
            )
            .await?;

        Ok(limits)
    }

    /// Current quota without consuming any. `allowed` tells whether the next
    /// request would be admitted.
    pub async fn peek(&self, tenant_id: u64, endpoint: Option<&str>) -> Result<Decision> {
        validate_tenant(tenant_id)?;
        let limits = self.tenant_limits(tenant_id).await?;
        let key = self.key(window_key(tenant_id, endpoint));

        let now = self.time_source.unix_now();
        let window = UsageWindow::current(self.load_window(&key).await?, now, self.settings.window_secs);

        Ok(Decision::from_window(window.would_admit(&limits), &window, &limits))
    }

    /// Rate limit header values for a tenant, read without consuming quota.
    ///
    /// To decorate the response of a request that was just checked, use
    /// [`Decision::headers`] on that check's result instead.
    pub async fn rate_limit_headers(
        &self,
        tenant_id: u64,
        endpoint: Option<&str>,
    ) -> Result<RateLimitHeaders> {
        Ok(self.peek(tenant_id, endpoint).await?.headers())
    }

    /// Aggregate the tenant's admitted traffic over `period`
    pub async fn usage_stats(&self, tenant_id: u64, period: UsagePeriod) -> Result<UsageStats> {
        validate_tenant(tenant_id)?;
        let since = self.time_source.utc_now() - period.duration();
        let summary = self.store.usage_summary(tenant_id, since).await?;
        Ok(UsageStats { summary, period })
    }

    /// Persist new limits and drop the cached copy; `false` when the tenant
    /// does not exist. In-flight windows are left alone.
    pub async fn update_limits(
        &self,
        tenant_id: u64,
        hourly_limit: u64,
        burst_allowance: u64,
    ) -> Result<bool> {
        validate_tenant(tenant_id)?;
        if hourly_limit == 0 {
            return Err(RateLimitError::InvalidLimits(
                "hourly_limit must be positive".to_string(),
            ));
        }
        if i64::try_from(hourly_limit).is_err() || i64::try_from(burst_allowance).is_err() {
            return Err(RateLimitError::InvalidLimits(format!(
                "limits must not exceed {}",
                i64::MAX
            )));
        }

        let updated = self
            .store
            .update_limits(tenant_id, hourly_limit, burst_allowance)
            .await?;

        if updated {
            self.cache.delete(&self.key(limits_key(tenant_id))).await?;
            self.metrics.record_admin_action("update_limits");
            info!(tenant_id, hourly_limit, burst_allowance, "Tenant limits updated");
        } else {
            warn!(tenant_id, "Limit update matched no tenant");
        }

        Ok(updated)
    }

    /// Drop a window outright; the next check starts a fresh one
    pub async fn reset_limit(&self, tenant_id: u64, endpoint: Option<&str>) -> Result<bool> {
        validate_tenant(tenant_id)?;
        let removed = self.cache.delete(&self.key(window_key(tenant_id, endpoint))).await?;
        self.metrics.record_admin_action("reset_limit");
        info!(tenant_id, endpoint, removed, "Rate limit window reset");
        Ok(removed)
    }

    pub async fn block_tenant(&self, tenant_id: u64, reason: &str) -> Result<bool> {
        validate_tenant(tenant_id)?;
        let record = BlockRecord {
            blocked: true,
            reason: reason.to_string(),
            blocked_at: self.time_source.unix_now(),
        };

        self.cache
            .set(
                &self.key(blocked_key(tenant_id)),
                &serde_json::to_string(&record)?,
                Duration::from_secs(self.settings.block_ttl_secs),
            )
            .await?;

        self.metrics.record_admin_action("block");
        warn!(tenant_id, reason, "Tenant API access blocked");
        Ok(true)
    }

    /// Lift a block; `false` when none was in place
    pub async fn unblock_tenant(&self, tenant_id: u64) -> Result<bool> {
        validate_tenant(tenant_id)?;
        let removed = self.cache.delete(&self.key(blocked_key(tenant_id))).await?;
        self.metrics.record_admin_action("unblock");
        info!(tenant_id, removed, "Tenant API access unblocked");
        Ok(removed)
    }

    /// Block state for a tenant. Independent of [`RateLimiter::check_limit`];
    /// callers consult both.
    pub async fn is_blocked(&self, tenant_id: u64) -> Result<BlockStatus> {
        validate_tenant(tenant_id)?;
        match self.cache.get(&self.key(blocked_key(tenant_id))).await? {
            Some(raw) => Ok(serde_json::from_str::<BlockRecord>(&raw)?.into()),
            None => Ok(BlockStatus::unblocked()),
        }
    }

    /// Health check for the limiter's collaborators
    pub async fn health_check(&self) -> Result<()> {
        self.cache.health_check().await?;
        self.store.health_check().await
    }
}

/// Run `operation` until `deadline`; `None` when the deadline passed first
async fn within<T>(
    deadline: Option<Instant>,
    operation: impl Future<Output = Result<T>>,
) -> Result<Option<T>> {
    let Some(deadline) = deadline else {
        return operation.await.map(Some);
    };

    match tokio::time::timeout_at(deadline, operation).await {
        Ok(result) => result.map(Some),
        Err(_) => Ok(None),
    }
}

fn validate_tenant(tenant_id: u64) -> Result<()> {
    if tenant_id == 0 {
        return Err(RateLimitError::InvalidTenant(tenant_id));
    }
    Ok(())
}
