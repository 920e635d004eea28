//! Redis-backed key-value store
//!
//! Connections come from a deadpool pool. Compare-and-swap and multi-key
//! commits run as Lua scripts so the read-compare-write happens atomically
//! on the server.

use std::collections::HashMap;

use async_trait::async_trait;
use deadpool_redis::{Config as PoolSettings, Connection, Pool, PoolConfig, Runtime};
use tracing::info;

use super::{HashWrite, KvBackend};
use crate::config::RedisConfig;
use crate::error::StoreError;

/// KEYS[1] = hash, ARGV = field, expected, has_expected, new, has_new
const CAS_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], ARGV[1])
if ARGV[3] == '1' then
    if current ~= ARGV[2] then
        return 0
    end
elseif current then
    return 0
end
if ARGV[5] == '1' then
    redis.call('HSET', KEYS[1], ARGV[1], ARGV[4])
else
    redis.call('HDEL', KEYS[1], ARGV[1])
end
return 1
"#;

/// KEYS[i] = hash of write i, ARGV[5(i-1)+1..5i] = its field, expected,
/// has_expected, new, has_new. Every expectation is checked before any write.
const COMMIT_SCRIPT: &str = r#"
for i = 1, #KEYS do
    local base = (i - 1) * 5
    local current = redis.call('HGET', KEYS[i], ARGV[base + 1])
    if ARGV[base + 3] == '1' then
        if current ~= ARGV[base + 2] then
            return 0
        end
    elseif current then
        return 0
    end
end
for i = 1, #KEYS do
    local base = (i - 1) * 5
    if ARGV[base + 5] == '1' then
        redis.call('HSET', KEYS[i], ARGV[base + 1], ARGV[base + 4])
    else
        redis.call('HDEL', KEYS[i], ARGV[base + 1])
    end
end
return 1
"#;

/// Key-value backend on a Redis server
pub struct RedisBackend {
    pool: Pool,
    cas: ::redis::Script,
    commit: ::redis::Script,
}

impl RedisBackend {
    /// Create the pool. No connection is opened until first use.
    pub fn new(config: &RedisConfig) -> Result<Self, StoreError> {
        let url = config.url();
        let mut settings = PoolSettings::from_url(&url);
        settings.pool = Some(PoolConfig::new(config.pool_size));

        let pool = settings
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| StoreError::Unavailable(format!("Failed to create Redis pool: {}", e)))?;

        info!(url = %url, pool_size = config.pool_size, "Redis pool created");

        Ok(Self {
            pool,
            cas: ::redis::Script::new(CAS_SCRIPT),
            commit: ::redis::Script::new(COMMIT_SCRIPT),
        })
    }

    async fn conn(&self) -> Result<Connection, StoreError> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Unavailable(format!("Failed to get Redis connection: {}", e)))
    }
}

fn unavailable(context: &str, err: ::redis::RedisError) -> StoreError {
    StoreError::Unavailable(format!("{}: {}", context, err))
}

#[async_trait]
impl KvBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn().await?;
        ::redis::cmd("GET")
            .arg(key)
            .query_async::<_, Option<String>>(&mut conn)
            .await
            .map_err(|e| unavailable("GET failed", e))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        ::redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| unavailable("SET failed", e))
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn().await?;
        ::redis::cmd("HGET")
            .arg(key)
            .arg(field)
            .query_async::<_, Option<String>>(&mut conn)
            .await
            .map_err(|e| unavailable("HGET failed", e))
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut conn = self.conn().await?;
        ::redis::cmd("HGETALL")
            .arg(key)
            .query_async::<_, HashMap<String, String>>(&mut conn)
            .await
            .map_err(|e| unavailable("HGETALL failed", e))
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        ::redis::cmd("HSET")
            .arg(key)
            .arg(field)
            .arg(value)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| unavailable("HSET failed", e))
    }

    async fn hset_multiple(&self, key: &str, fields: &[(&str, &str)]) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let mut cmd = ::redis::cmd("HSET");
        cmd.arg(key);
        for (field, value) in fields {
            cmd.arg(*field).arg(*value);
        }
        cmd.query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| unavailable("HSET failed", e))
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        ::redis::cmd("HDEL")
            .arg(key)
            .arg(field)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| unavailable("HDEL failed", e))
    }

    async fn hcompare_and_swap(
        &self,
        key: &str,
        field: &str,
        expected: Option<&str>,
        new: Option<&str>,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let swapped = self
            .cas
            .key(key)
            .arg(field)
            .arg(expected.unwrap_or(""))
            .arg(if expected.is_some() { "1" } else { "0" })
            .arg(new.unwrap_or(""))
            .arg(if new.is_some() { "1" } else { "0" })
            .invoke_async::<_, i32>(&mut conn)
            .await
            .map_err(|e| unavailable("Compare-and-swap failed", e))?;
        Ok(swapped == 1)
    }

    async fn hcommit(&self, writes: &[HashWrite]) -> Result<bool, StoreError> {
        if writes.is_empty() {
            return Ok(true);
        }
        let mut conn = self.conn().await?;
        let mut invocation = self.commit.prepare_invoke();
        for write in writes {
            invocation
                .key(&write.key)
                .arg(&write.field)
                .arg(write.expected.as_deref().unwrap_or(""))
                .arg(if write.expected.is_some() { "1" } else { "0" })
                .arg(write.new.as_deref().unwrap_or(""))
                .arg(if write.new.is_some() { "1" } else { "0" });
        }
        let committed = invocation
            .invoke_async::<_, i32>(&mut conn)
            .await
            .map_err(|e| unavailable("Commit failed", e))?;
        Ok(committed == 1)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        ::redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(|e| unavailable("Redis health check failed", e))?;
        Ok(())
    }
}
