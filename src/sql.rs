use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions},
    FromRow,
};
use std::str::FromStr;
use tracing::info;

use crate::{
    error::{RateLimitError, Result},
    store::{
        EndpointCount, HourlyCount, StoredLimits, UsageRecord, UsageStore, UsageSummary,
        TOP_ENDPOINTS,
    },
};

/// Timestamps are stored as sortable text so range filters compare lexically
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const SCHEMA: [&str; 3] = [
    "CREATE TABLE IF NOT EXISTS tenants (
        id INTEGER PRIMARY KEY,
        api_rate_limit INTEGER,
        api_burst_limit INTEGER
    )",
    "CREATE TABLE IF NOT EXISTS api_usage (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tenant_id INTEGER NOT NULL,
        endpoint TEXT,
        timestamp TEXT NOT NULL,
        ip_address TEXT,
        user_agent TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_api_usage_tenant_time ON api_usage (tenant_id, timestamp)",
];

#[derive(Debug, FromRow)]
struct TenantRow {
    api_rate_limit: Option<i64>,
    api_burst_limit: Option<i64>,
}

impl From<TenantRow> for StoredLimits {
    fn from(row: TenantRow) -> Self {
        Self {
            api_rate_limit: row.api_rate_limit.map(|v| v.max(0) as u64),
            api_burst_limit: row.api_burst_limit.map(|v| v.max(0) as u64),
        }
    }
}

/// SQLite-backed usage store
#[derive(Clone)]
pub struct SqliteUsageStore {
    pool: SqlitePool,
}

impl SqliteUsageStore {
    /// Open a pool against `database_url`, creating the database file if needed
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        info!("Connecting usage store at {}", database_url);
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the `tenants` and `api_usage` tables if they are missing
    pub async fn ensure_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Create or replace a tenant row
    pub async fn insert_tenant(&self, tenant_id: u64, limits: StoredLimits) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO tenants (id, api_rate_limit, api_burst_limit) VALUES (?, ?, ?)",
        )
        .bind(tenant_id as i64)
        .bind(limits.api_rate_limit.map(limit_column).transpose()?)
        .bind(limits.api_burst_limit.map(limit_column).transpose()?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Limit columns are signed; values past `i64::MAX` would wrap
fn limit_column(value: u64) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| RateLimitError::InvalidLimits(format!("limit {} exceeds {}", value, i64::MAX)))
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

#[async_trait]
impl UsageStore for SqliteUsageStore {
    async fn tenant_limits(&self, tenant_id: u64) -> Result<Option<StoredLimits>> {
        let row: Option<TenantRow> =
            sqlx::query_as("SELECT api_rate_limit, api_burst_limit FROM tenants WHERE id = ?")
                .bind(tenant_id as i64)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(StoredLimits::from))
    }

    async fn update_limits(&self, tenant_id: u64, hourly_limit: u64, burst_allowance: u64) -> Result<bool> {
        let result =
            sqlx::query("UPDATE tenants SET api_rate_limit = ?, api_burst_limit = ? WHERE id = ?")
                .bind(limit_column(hourly_limit)?)
                .bind(limit_column(burst_allowance)?)
                .bind(tenant_id as i64)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_usage(&self, record: &UsageRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO api_usage (tenant_id, endpoint, timestamp, ip_address, user_agent) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(record.tenant_id as i64)
        .bind(record.endpoint.as_deref())
        .bind(format_timestamp(&record.timestamp))
        .bind(record.ip_address.as_deref())
        .bind(record.user_agent.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn usage_summary(&self, tenant_id: u64, since: DateTime<Utc>) -> Result<UsageSummary> {
        let tenant_id = tenant_id as i64;
        let since = format_timestamp(&since);

        let (total_requests, unique_endpoints, unique_ips): (i64, i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COUNT(DISTINCT endpoint), COUNT(DISTINCT ip_address)
             FROM api_usage
             WHERE tenant_id = ? AND timestamp >= ?",
        )
        .bind(tenant_id)
        .bind(since.as_str())
        .fetch_one(&self.pool)
        .await?;

        let top: Vec<(Option<String>, i64)> = sqlx::query_as(
            "SELECT endpoint, COUNT(*) AS count
             FROM api_usage
             WHERE tenant_id = ? AND timestamp >= ?
             GROUP BY endpoint
             ORDER BY count DESC, endpoint ASC
             LIMIT ?",
        )
        .bind(tenant_id)
        .bind(since.as_str())
        .bind(TOP_ENDPOINTS as i64)
        .fetch_all(&self.pool)
        .await?;

        let hourly: Vec<(String, i64)> = sqlx::query_as(
            "SELECT strftime('%Y-%m-%d %H:00:00', timestamp) AS hour, COUNT(*) AS requests
             FROM api_usage
             WHERE tenant_id = ? AND timestamp >= ?
             GROUP BY hour
             ORDER BY hour ASC",
        )
        .bind(tenant_id)
        .bind(since.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(UsageSummary {
            total_requests: total_requests as u64,
            unique_endpoints: unique_endpoints as u64,
            unique_ips: unique_ips as u64,
            top_endpoints: top
                .into_iter()
                .map(|(endpoint, count)| EndpointCount {
                    endpoint,
                    count: count as u64,
                })
                .collect(),
            hourly_breakdown: hourly
                .into_iter()
                .map(|(hour, requests)| HourlyCount {
                    hour,
                    requests: requests as u64,
                })
                .collect(),
        })
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    async fn memory_store() -> SqliteUsageStore {
        // a single connection keeps one shared in-memory database
        let store = SqliteUsageStore::connect("sqlite::memory:", 1).await.unwrap();
        store.ensure_schema().await.unwrap();
        store
    }

    fn record(endpoint: Option<&str>, ip: Option<&str>, timestamp: DateTime<Utc>) -> UsageRecord {
        UsageRecord {
            tenant_id: 42,
            endpoint: endpoint.map(str::to_string),
            timestamp,
            ip_address: ip.map(str::to_string),
            user_agent: Some("curl/8.0".to_string()),
        }
    }

    #[tokio::test]
    async fn test_tenant_limits_roundtrip() {
        let store = memory_store().await;
        assert_eq!(store.tenant_limits(42).await.unwrap(), None);

        store.insert_tenant(42, StoredLimits::default()).await.unwrap();
        assert_eq!(store.tenant_limits(42).await.unwrap(), Some(StoredLimits::default()));

        assert!(store.update_limits(42, 500, 20).await.unwrap());
        assert_eq!(
            store.tenant_limits(42).await.unwrap(),
            Some(StoredLimits {
                api_rate_limit: Some(500),
                api_burst_limit: Some(20),
            })
        );

        assert!(!store.update_limits(7, 500, 20).await.unwrap());
    }

    #[tokio::test]
    async fn test_oversized_limits_are_rejected() {
        let store = memory_store().await;
        store.insert_tenant(42, StoredLimits::default()).await.unwrap();

        assert!(matches!(
            store.update_limits(42, u64::MAX, 20).await,
            Err(RateLimitError::InvalidLimits(_))
        ));
        assert!(matches!(
            store.update_limits(42, 500, i64::MAX as u64 + 1).await,
            Err(RateLimitError::InvalidLimits(_))
        ));
        assert_eq!(store.tenant_limits(42).await.unwrap(), Some(StoredLimits::default()));

        assert!(store.update_limits(42, i64::MAX as u64, 0).await.unwrap());
        assert_eq!(
            store.tenant_limits(42).await.unwrap().and_then(|l| l.api_rate_limit),
            Some(i64::MAX as u64)
        );
    }

    #[tokio::test]
    async fn test_usage_summary_queries() {
        let store = memory_store().await;
        let base = Utc.with_ymd_and_hms(2026, 5, 4, 9, 30, 0).unwrap();

        store.record_usage(&record(Some("/a"), Some("1.1.1.1"), base)).await.unwrap();
        store
            .record_usage(&record(Some("/a"), Some("1.1.1.2"), base + Duration::minutes(10)))
            .await
            .unwrap();
        store
            .record_usage(&record(Some("/b"), None, base + Duration::minutes(45)))
            .await
            .unwrap();
        store
            .record_usage(&record(Some("/stale"), None, base - Duration::days(3)))
            .await
            .unwrap();

        let summary = store.usage_summary(42, base - Duration::hours(1)).await.unwrap();
        assert_eq!(summary.total_requests, 3);
        assert_eq!(summary.unique_endpoints, 2);
        assert_eq!(summary.unique_ips, 2);
        assert_eq!(summary.top_endpoints[0].endpoint.as_deref(), Some("/a"));
        assert_eq!(summary.top_endpoints[0].count, 2);
        assert_eq!(
            summary.hourly_breakdown,
            vec![
                HourlyCount {
                    hour: "2026-05-04 09:00:00".to_string(),
                    requests: 2,
                },
                HourlyCount {
                    hour: "2026-05-04 10:00:00".to_string(),
                    requests: 1,
                },
            ]
        );

        let empty = store.usage_summary(43, base - Duration::hours(1)).await.unwrap();
        assert_eq!(empty, UsageSummary::default());
    }

    #[tokio::test]
    async fn test_health_check() {
        let store = memory_store().await;
        store.health_check().await.unwrap();
    }
}
