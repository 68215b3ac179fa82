//! [`FarCache`] over a deadpool-managed Redis connection pool.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Connection, Pool, PoolError};
use redis::{AsyncCommands, RedisError};

use hcache_core::{FarCache, TierError};

/// Keys requested per SCAN round trip.
const SCAN_COUNT: usize = 100;

/// Redis far cache.
///
/// Entries with a TTL are written with `PSETEX`; entries without one with a
/// plain `SET`. Prefix deletes walk the keyspace with `SCAN`, so they never
/// block the server the way `KEYS` would. Parameter index sets are plain
/// Redis sets; one registration is a single `MULTI` pipeline of `SADD`s.
#[derive(Clone)]
pub struct RedisFarCache {
    pool: Pool,
}

impl std::fmt::Debug for RedisFarCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = self.pool.status();
        f.debug_struct("RedisFarCache")
            .field("pool_size", &status.size)
            .field("pool_available", &status.available)
            .finish()
    }
}

impl RedisFarCache {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    async fn conn(&self) -> Result<Connection, TierError> {
        self.pool.get().await.map_err(pool_error)
    }
}

fn pool_error(e: PoolError) -> TierError {
    TierError::l2_unreachable(format!("failed to get Redis connection: {e}"))
}

fn command_error(e: RedisError) -> TierError {
    if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout() {
        TierError::l2_unreachable(e.to_string())
    } else {
        TierError::l2_protocol(e.to_string())
    }
}

/// Millisecond TTL for PSETEX/PEXPIRE. Redis rejects zero, so sub-millisecond
/// lifetimes round up to one.
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Escape glob metacharacters so a literal prefix can be used with `MATCH`.
pub(crate) fn glob_escape(literal: &str) -> String {
    let mut escaped = String::with_capacity(literal.len());
    for c in literal.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[async_trait]
impl FarCache for RedisFarCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, TierError> {
        let mut conn = self.conn().await?;
        conn.get::<_, Option<Vec<u8>>>(key)
            .await
            .map_err(command_error)
    }

    async fn put(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), TierError> {
        let mut conn = self.conn().await?;
        match ttl {
            Some(ttl) => conn.pset_ex::<_, _, ()>(key, value, ttl_millis(ttl)).await,
            None => conn.set::<_, _, ()>(key, value).await,
        }
        .map_err(command_error)
    }

    async fn delete(&self, key: &str) -> Result<bool, TierError> {
        let mut conn = self.conn().await?;
        let removed: u64 = conn.del(key).await.map_err(command_error)?;
        Ok(removed > 0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, TierError> {
        let mut conn = self.conn().await?;
        let updated: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;
        Ok(updated == 1)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, TierError> {
        let mut conn = self.conn().await?;
        let pattern = format!("{}*", glob_escape(prefix));
        let mut cursor: u64 = 0;
        let mut total_deleted: u64 = 0;

        loop {
            let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await
                .map_err(command_error)?;

            if !keys.is_empty() {
                let deleted: u64 = conn.del(&keys).await.map_err(command_error)?;
                total_deleted += deleted;
            }

            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }

        tracing::debug!(prefix = %prefix, deleted = total_deleted, "Redis prefix delete");
        Ok(total_deleted)
    }

    async fn index_add(&self, indexes: &[String], member: &str) -> Result<(), TierError> {
        if indexes.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        for index in indexes {
            pipe.sadd(index, member).ignore();
        }
        let () = pipe.query_async(&mut conn).await.map_err(command_error)?;
        Ok(())
    }

    async fn index_members(&self, index: &str) -> Result<Vec<String>, TierError> {
        let mut conn = self.conn().await?;
        conn.smembers::<_, Vec<String>>(index)
            .await
            .map_err(command_error)
    }

    async fn index_remove(&self, index: &str, members: &[String]) -> Result<u64, TierError> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn().await?;
        conn.srem::<_, _, u64>(index, members)
            .await
            .map_err(command_error)
    }

    async fn ping(&self) -> Result<(), TierError> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}
