use super::SharedStore;
use crate::error::{RelayError, RelayResult};
use ::redis::aio::ConnectionManager;
use async_trait::async_trait;
use std::time::Duration;

/// Deletes KEYS[1] only when it holds ARGV[1].
const DELETE_IF_EQUALS: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

/// Redis-backed store shared by every gateway instance.
///
/// `SET NX PX` gives the single-winner semantics the lock relies on and
/// `GETEX PX` the sliding expiry used by the reply cache. Lock release is a
/// server-side script so the ownership check and the delete cannot be
/// interleaved with another holder's acquisition.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> RelayResult<Self> {
        let client =
            ::redis::Client::open(url).map_err(|err| RelayError::store("open", url, err))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|err| RelayError::store("connect", url, err))?;
        Ok(Self { conn })
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl SharedStore for RedisStore {
    fn name(&self) -> &str {
        "redis"
    }

    async fn get(&self, key: &str) -> RelayResult<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = ::redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|err| RelayError::store("get", key, err))?;
        Ok(value)
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> RelayResult<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = ::redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|err| RelayError::store("set_if_absent", key, err))?;
        Ok(reply.is_some())
    }

    async fn get_and_refresh_ttl(&self, key: &str, ttl: Duration) -> RelayResult<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = ::redis::cmd("GETEX")
            .arg(key)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|err| RelayError::store("get_and_refresh_ttl", key, err))?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> RelayResult<()> {
        let mut conn = self.conn.clone();
        let _removed: i64 = ::redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|err| RelayError::store("delete", key, err))?;
        Ok(())
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> RelayResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = ::redis::cmd("EVAL")
            .arg(DELETE_IF_EQUALS)
            .arg(1)
            .arg(key)
            .arg(expected)
            .query_async(&mut conn)
            .await
            .map_err(|err| RelayError::store("delete_if_equals", key, err))?;
        Ok(removed == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_is_sent_in_whole_milliseconds() {
        assert_eq!(ttl_millis(Duration::from_secs(15)), 15_000);
        assert_eq!(ttl_millis(Duration::ZERO), 1);
    }
}
