//! Durable collaborator: tenant limit columns and the `api_usage` log.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::RwLock;

use crate::error::Result;

/// Format of an hourly bucket label
pub const HOUR_BUCKET_FORMAT: &str = "%Y-%m-%d %H:00:00";

/// Maximum number of entries in `top_endpoints`
pub const TOP_ENDPOINTS: usize = 10;

/// One admitted request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub tenant_id: u64,
    pub endpoint: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// Limit columns of a tenant row; either may be unset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredLimits {
    pub api_rate_limit: Option<u64>,
    pub api_burst_limit: Option<u64>,
}

/// Lookback period for usage statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum UsagePeriod {
    #[serde(rename = "1h")]
    Hour,
    #[default]
    #[serde(rename = "24h")]
    Day,
    #[serde(rename = "7d")]
    Week,
    #[serde(rename = "30d")]
    Month,
}

impl UsagePeriod {
    /// Parse a period label; anything unrecognized means 24 hours
    pub fn parse(label: &str) -> Self {
        match label {
            "1h" => UsagePeriod::Hour,
            "7d" => UsagePeriod::Week,
            "30d" => UsagePeriod::Month,
            _ => UsagePeriod::Day,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UsagePeriod::Hour => "1h",
            UsagePeriod::Day => "24h",
            UsagePeriod::Week => "7d",
            UsagePeriod::Month => "30d",
        }
    }

    pub fn duration(self) -> Duration {
        match self {
            UsagePeriod::Hour => Duration::hours(1),
            UsagePeriod::Day => Duration::hours(24),
            UsagePeriod::Week => Duration::days(7),
            UsagePeriod::Month => Duration::days(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointCount {
    pub endpoint: Option<String>,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourlyCount {
    pub hour: String,
    pub requests: u64,
}

/// Aggregates over a tenant's usage records since some instant
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub total_requests: u64,
    /// Distinct non-null endpoints
    pub unique_endpoints: u64,
    /// Distinct non-null caller IPs
    pub unique_ips: u64,
    pub top_endpoints: Vec<EndpointCount>,
    pub hourly_breakdown: Vec<HourlyCount>,
}

/// Usage statistics for one period
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageStats {
    #[serde(flatten)]
    pub summary: UsageSummary,
    pub period: UsagePeriod,
}

#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Limit columns for a tenant, `None` when the tenant row does not exist
    async fn tenant_limits(&self, tenant_id: u64) -> Result<Option<StoredLimits>>;

    /// Overwrite a tenant's limit columns; `false` when no such tenant
    async fn update_limits(&self, tenant_id: u64, hourly_limit: u64, burst_allowance: u64) -> Result<bool>;

    async fn record_usage(&self, record: &UsageRecord) -> Result<()>;

    async fn usage_summary(&self, tenant_id: u64, since: DateTime<Utc>) -> Result<UsageSummary>;

    async fn health_check(&self) -> Result<()>;
}

/// In-process store for tests and single-node demos
#[derive(Default)]
pub struct MemoryUsageStore {
    tenants: RwLock<HashMap<u64, StoredLimits>>,
    records: RwLock<Vec<UsageRecord>>,
}

impl MemoryUsageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace a tenant row
    pub async fn insert_tenant(&self, tenant_id: u64, limits: StoredLimits) {
        self.tenants.write().await.insert(tenant_id, limits);
    }

    /// Snapshot of every stored record, oldest first
    pub async fn records(&self) -> Vec<UsageRecord> {
        self.records.read().await.clone()
    }
}

#[async_trait]
impl UsageStore for MemoryUsageStore {
    async fn tenant_limits(&self, tenant_id: u64) -> Result<Option<StoredLimits>> {
        Ok(self.tenants.read().await.get(&tenant_id).copied())
    }

    async fn update_limits(&self, tenant_id: u64, hourly_limit: u64, burst_allowance: u64) -> Result<bool> {
        let mut tenants = self.tenants.write().await;
        match tenants.get_mut(&tenant_id) {
            Some(row) => {
                row.api_rate_limit = Some(hourly_limit);
                row.api_burst_limit = Some(burst_allowance);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn record_usage(&self, record: &UsageRecord) -> Result<()> {
        self.records.write().await.push(record.clone());
        Ok(())
    }

    async fn usage_summary(&self, tenant_id: u64, since: DateTime<Utc>) -> Result<UsageSummary> {
        let records = self.records.read().await;
        Ok(summarize(
            records
                .iter()
                .filter(|r| r.tenant_id == tenant_id && r.timestamp >= since),
        ))
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

fn summarize<'a>(records: impl Iterator<Item = &'a UsageRecord>) -> UsageSummary {
    let mut total_requests = 0;
    let mut endpoints: HashSet<&str> = HashSet::new();
    let mut ips: HashSet<&str> = HashSet::new();
    let mut per_endpoint: HashMap<Option<&str>, u64> = HashMap::new();
    let mut per_hour: BTreeMap<String, u64> = BTreeMap::new();

    for record in records {
        total_requests += 1;
        if let Some(endpoint) = &record.endpoint {
            endpoints.insert(endpoint);
        }
        if let Some(ip) = &record.ip_address {
            ips.insert(ip);
        }
        *per_endpoint.entry(record.endpoint.as_deref()).or_default() += 1;
        *per_hour
            .entry(record.timestamp.format(HOUR_BUCKET_FORMAT).to_string())
            .or_default() += 1;
    }

    let mut top_endpoints: Vec<EndpointCount> = per_endpoint
        .into_iter()
        .map(|(endpoint, count)| EndpointCount {
            endpoint: endpoint.map(str::to_string),
            count,
        })
        .collect();
    top_endpoints.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.endpoint.cmp(&b.endpoint)));
    top_endpoints.truncate(TOP_ENDPOINTS);

    UsageSummary {
        total_requests,
        unique_endpoints: endpoints.len() as u64,
        unique_ips: ips.len() as u64,
        top_endpoints,
        hourly_breakdown: per_hour
            .into_iter()
            .map(|(hour, requests)| HourlyCount { hour, requests })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(tenant_id: u64, endpoint: Option<&str>, ip: Option<&str>, ts: DateTime<Utc>) -> UsageRecord {
        UsageRecord {
            tenant_id,
            endpoint: endpoint.map(str::to_string),
            timestamp: ts,
            ip_address: ip.map(str::to_string),
            user_agent: None,
        }
    }

    #[test]
    fn test_period_parsing() {
        assert_eq!(UsagePeriod::parse("1h"), UsagePeriod::Hour);
        assert_eq!(UsagePeriod::parse("24h"), UsagePeriod::Day);
        assert_eq!(UsagePeriod::parse("7d"), UsagePeriod::Week);
        assert_eq!(UsagePeriod::parse("30d"), UsagePeriod::Month);
        assert_eq!(UsagePeriod::parse("fortnight"), UsagePeriod::Day);
        assert_eq!(UsagePeriod::parse(""), UsagePeriod::Day);
        assert_eq!(UsagePeriod::Week.duration(), Duration::days(7));
        assert_eq!(serde_json::to_string(&UsagePeriod::Month).unwrap(), "\"30d\"");
    }

    #[tokio::test]
    async fn test_update_limits_requires_tenant() {
        let store = MemoryUsageStore::new();
        assert!(!store.update_limits(1, 10, 1).await.unwrap());

        store.insert_tenant(1, StoredLimits::default()).await;
        assert!(store.update_limits(1, 10, 1).await.unwrap());
        assert_eq!(
            store.tenant_limits(1).await.unwrap(),
            Some(StoredLimits {
                api_rate_limit: Some(10),
                api_burst_limit: Some(1),
            })
        );
        assert_eq!(store.tenant_limits(2).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_usage_summary() {
        let store = MemoryUsageStore::new();
        let base = Utc.with_ymd_and_hms(2026, 3, 1, 10, 15, 0).unwrap();

        store.record_usage(&record(1, Some("/orders"), Some("10.0.0.1"), base)).await.unwrap();
        store
            .record_usage(&record(1, Some("/orders"), Some("10.0.0.2"), base + Duration::minutes(5)))
            .await
            .unwrap();
        store
            .record_usage(&record(1, Some("/items"), Some("10.0.0.1"), base + Duration::hours(1)))
            .await
            .unwrap();
        store
            .record_usage(&record(1, None, None, base + Duration::hours(1)))
            .await
            .unwrap();
        // other tenant and too old
        store.record_usage(&record(2, Some("/orders"), None, base)).await.unwrap();
        store
            .record_usage(&record(1, Some("/old"), None, base - Duration::days(2)))
            .await
            .unwrap();

        let summary = store.usage_summary(1, base - Duration::hours(1)).await.unwrap();
        assert_eq!(summary.total_requests, 4);
        assert_eq!(summary.unique_endpoints, 2);
        assert_eq!(summary.unique_ips, 2);
        assert_eq!(
            summary.top_endpoints[0],
            EndpointCount {
                endpoint: Some("/orders".to_string()),
                count: 2,
            }
        );
        assert_eq!(summary.top_endpoints.len(), 3);
        assert_eq!(
            summary.hourly_breakdown,
            vec![
                HourlyCount {
                    hour: "2026-03-01 10:00:00".to_string(),
                    requests: 2,
                },
                HourlyCount {
                    hour: "2026-03-01 11:00:00".to_string(),
                    requests: 2,
                },
            ]
        );
    }

    #[test]
    fn test_top_endpoints_capped() {
        let base = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let records: Vec<UsageRecord> = (0..15)
            .map(|i| record(1, Some(&format!("/e{}", i)), None, base))
            .collect();
        let summary = summarize(records.iter());
        assert_eq!(summary.top_endpoints.len(), TOP_ENDPOINTS);
        assert_eq!(summary.unique_endpoints, 15);
    }
}
