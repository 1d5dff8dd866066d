use redis::{aio::ConnectionManager, AsyncCommands, Script};
use serde::{Deserialize, Serialize};
use std::{future::Future, time::Duration};
use tracing::{info, warn};

use crate::{
    error::{RateLimitError, Result},
    window::{Admission, TenantLimitConfig, UsageWindow},
};

/// Window admission evaluated server-side so the read, the decision and the
/// write back cannot interleave with another request for the same key.
/// Mirrors `UsageWindow::current` + `UsageWindow::admit`.
const ADMIT_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local window_secs = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
local burst = tonumber(ARGV[4])

local w = nil
local raw = redis.call('GET', KEYS[1])
if raw then
  w = cjson.decode(raw)
end
if (not w) or now >= tonumber(w.reset_at) then
  w = { count = 0, reset_at = now + window_secs, burst_used = 0 }
end

local outcome = 0
if w.count < limit then
  w.count = w.count + 1
elseif w.burst_used < burst then
  w.burst_used = w.burst_used + 1
  w.count = w.count + 1
  outcome = 1
else
  outcome = 2
end

if outcome < 2 then
  local ttl = w.reset_at - now
  if ttl < 1 then ttl = 1 end
  redis.call('SET', KEYS[1], cjson.encode(w), 'EX', ttl)
end
return { outcome, w.count, w.reset_at, w.burst_used }
"#;

/// Takes back one admission from a window, provided the window that granted
/// it is still the live one. The remaining TTL is kept.
const RELEASE_SCRIPT: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then return 0 end
local w = cjson.decode(raw)
if tonumber(w.reset_at) ~= tonumber(ARGV[1]) then return 0 end

if w.count > 0 then w.count = w.count - 1 end
if ARGV[2] == '1' and w.burst_used > 0 then w.burst_used = w.burst_used - 1 end

local ttl = redis.call('TTL', KEYS[1])
if ttl < 1 then ttl = 1 end
redis.call('SET', KEYS[1], cjson.encode(w), 'EX', ttl)
return 1
"#;

/// Redis client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    #[serde(with = "duration_secs")]
    pub connection_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub command_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            connection_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(1),
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

/// Redis client wrapper for rate limiting operations
#[derive(Clone)]
pub struct RedisClient {
    connection: ConnectionManager,
    config: RedisConfig,
    admit_script: Script,
    release_script: Script,
}

impl RedisClient {
    /// Create a new Redis client
    pub async fn new(config: RedisConfig) -> Result<Self> {
        info!("Creating Redis client for URL: {}", config.url);

        let client = redis::Client::open(config.url.clone()).map_err(|e| {
            warn!("Failed to create Redis client: {}", e);
            RateLimitError::Redis(e)
        })?;

        let connection_result =
            tokio::time::timeout(config.connection_timeout, client.get_connection_manager()).await;

        let connection = match connection_result {
            Ok(Ok(conn)) => {
                info!("Connection manager established successfully");
                conn
            }
            Ok(Err(e)) => {
                warn!("Failed to create connection manager: {}", e);
                return Err(RateLimitError::Redis(e));
            }
            Err(_) => {
                warn!(
                    "Timeout while creating connection manager ({}s)",
                    config.connection_timeout.as_secs()
                );
                return Err(RateLimitError::Service(
                    "Timeout while creating Redis connection manager".to_string(),
                ));
            }
        };

        let redis_client = Self {
            connection,
            config,
            admit_script: Script::new(ADMIT_SCRIPT),
            release_script: Script::new(RELEASE_SCRIPT),
        };
        redis_client.health_check().await?;

        info!("Redis client initialized successfully");
        Ok(redis_client)
    }

    async fn timed<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.config.command_timeout, fut).await {
            Ok(result) => result.map_err(RateLimitError::Redis),
            Err(_) => {
                warn!(
                    "Redis {} timeout ({}ms)",
                    operation,
                    self.config.command_timeout.as_millis()
                );
                Err(RateLimitError::Cache(format!("Redis {} timed out", operation)))
            }
        }
    }

    /// Get a string value
    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection.clone();
        self.timed("GET", async move { conn.get::<_, Option<String>>(key).await })
            .await
    }

    /// Set a string value with an expiry in seconds
    pub async fn set_ex(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<()> {
        let mut conn = self.connection.clone();
        let ttl_seconds = ttl_seconds.max(1);
        self.timed("SET", async move {
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("EX")
                .arg(ttl_seconds)
                .query_async::<_, ()>(&mut conn)
                .await
        })
        .await
    }

    /// Delete a key, reporting whether it existed
    pub async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection.clone();
        let removed: i64 = self
            .timed("DEL", async move { conn.del::<_, i64>(key).await })
            .await?;
        Ok(removed > 0)
    }

    /// Run the admission script against one window key
    pub async fn admit_window(
        &self,
        key: &str,
        limits: &TenantLimitConfig,
        now: i64,
        window_secs: u64,
    ) -> Result<(Admission, UsageWindow)> {
        let mut conn = self.connection.clone();
        let mut invocation = self.admit_script.key(key);
        invocation
            .arg(now)
            .arg(window_secs)
            .arg(limits.hourly_limit)
            .arg(limits.burst_allowance);

        let reply: Vec<i64> = self
            .timed("EVALSHA", async move { invocation.invoke_async(&mut conn).await })
            .await?;

        parse_admit_reply(&reply)
    }

    /// Undo one admission granted by the window that resets at `reset_at`.
    /// Returns whether the window was still live.
    pub async fn release_window(&self, key: &str, admission: Admission, reset_at: i64) -> Result<bool> {
        let mut conn = self.connection.clone();
        let mut invocation = self.release_script.key(key);
        invocation
            .arg(reset_at)
            .arg(u8::from(admission == Admission::Burst));

        let released: i64 = self
            .timed("EVALSHA", async move { invocation.invoke_async(&mut conn).await })
            .await?;

        Ok(released == 1)
    }

    /// Check if the connection is healthy
    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        self.timed("PING", async move {
            redis::cmd("PING").query_async::<_, ()>(&mut conn).await
        })
        .await
    }
}

fn parse_admit_reply(reply: &[i64]) -> Result<(Admission, UsageWindow)> {
    let [outcome, count, reset_at, burst_used] = reply else {
        return Err(RateLimitError::Redis(redis::RedisError::from((
            redis::ErrorKind::TypeError,
            "Unexpected admission script response",
        ))));
    };

    let admission = match *outcome {
        0 => Admission::Within,
        1 => Admission::Burst,
        _ => Admission::Rejected,
    };

    Ok((
        admission,
        UsageWindow {
            count: (*count).max(0) as u64,
            reset_at: *reset_at,
            burst_used: (*burst_used).max(0) as u64,
        },
    ))
}
