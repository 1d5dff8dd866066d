//! Tenant Rate Limit
//!
//! Per-tenant API rate limiting with an hourly fixed window, a bounded burst
//! allowance and usage tracking. Windows, resolved limits and block records
//! live in a key-value cache (in-process or Redis); usage records and tenant
//! limit columns live in a durable store (in-process or SQLite).

pub mod cache;
pub mod config;
pub mod error;
pub mod limiter;
pub mod metrics;
pub mod redis;
pub mod service;
pub mod sql;
pub mod store;
pub mod utils;
pub mod window;

// Re-export main types
pub use cache::{KeyValueCache, MemoryCache, RedisCache};
pub use config::{LimiterSettings, Settings};
pub use error::{RateLimitError, Result};
pub use limiter::{BlockStatus, Decision, RateLimitHeaders, RateLimiter, RequestContext};
pub use store::{MemoryUsageStore, UsagePeriod, UsageStats, UsageStore};
pub use window::{TenantLimitConfig, UsageWindow};
