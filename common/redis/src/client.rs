use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, RedisError};
use std::collections::HashMap;
use std::time::Duration;

use crate::{Client, CustomRedisError, WriteOp};

const PEXPIRE_IF_EQ_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
    return 0
end
"#;

const DEL_IF_EQ_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

pub struct RedisClient {
    connection: MultiplexedConnection,
}

impl RedisClient {
    /// Create a new RedisClient without timeouts (blocks indefinitely).
    pub async fn new(addr: String) -> Result<RedisClient, CustomRedisError> {
        Self::with_config(addr, None, None).await
    }

    /// Create a new RedisClient with optional response and connection timeouts.
    ///
    /// # Errors
    /// Returns `CustomRedisError::InvalidConfiguration` if `Some(Duration::ZERO)` is passed - use `None` for no timeout instead.
    pub async fn with_config(
        addr: String,
        response_timeout: Option<Duration>,
        connection_timeout: Option<Duration>,
    ) -> Result<RedisClient, CustomRedisError> {
        let client = redis::Client::open(addr)?;

        if let Some(timeout) = response_timeout {
            if timeout.is_zero() {
                return Err(CustomRedisError::InvalidConfiguration(
                    "Redis response timeout cannot be Duration::ZERO - use None for no timeout"
                        .to_string(),
                ));
            }
        }
        if let Some(timeout) = connection_timeout {
            if timeout.is_zero() {
                return Err(CustomRedisError::InvalidConfiguration(
                    "Redis connection timeout cannot be Duration::ZERO - use None for no timeout"
                        .to_string(),
                ));
            }
        }

        let mut config = redis::AsyncConnectionConfig::new();

        if let Some(timeout) = response_timeout {
            config = config.set_response_timeout(timeout);
        }

        if let Some(timeout) = connection_timeout {
            config = config.set_connection_timeout(timeout);
        }

        let connection = client
            .get_multiplexed_async_connection_with_config(&config)
            .await?;

        Ok(RedisClient { connection })
    }
}

#[async_trait]
impl Client for RedisClient {
    async fn get(&self, k: String) -> Result<String, CustomRedisError> {
        let mut conn = self.connection.clone();
        let result: Option<String> = conn.get(k).await?;

        result.ok_or(CustomRedisError::NotFound)
    }

    async fn set(&self, k: String, v: String) -> Result<(), CustomRedisError> {
        let mut conn = self.connection.clone();
        conn.set::<_, _, ()>(k, v).await?;
        Ok(())
    }

    async fn setex(&self, k: String, v: String, seconds: u64) -> Result<(), CustomRedisError> {
        let mut conn = self.connection.clone();
        conn.set_ex::<_, _, ()>(k, v, seconds).await?;
        Ok(())
    }

    async fn psetex(&self, k: String, v: String, millis: u64) -> Result<(), CustomRedisError> {
        let mut conn = self.connection.clone();
        redis::cmd("PSETEX")
            .arg(&k)
            .arg(millis)
            .arg(&v)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn del(&self, k: String) -> Result<(), CustomRedisError> {
        let mut conn = self.connection.clone();
        conn.del::<_, ()>(k).await?;
        Ok(())
    }

    async fn expire(&self, k: String, seconds: u64) -> Result<(), CustomRedisError> {
        let mut conn = self.connection.clone();
        redis::cmd("EXPIRE")
            .arg(&k)
            .arg(seconds)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_nx_px(
        &self,
        k: String,
        v: String,
        millis: u64,
    ) -> Result<bool, CustomRedisError> {
        let mut conn = self.connection.clone();

        let result: Result<Option<String>, RedisError> = redis::cmd("SET")
            .arg(&k)
            .arg(&v)
            .arg("PX")
            .arg(millis)
            .arg("NX")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(Some(_)) => Ok(true), // Key was set successfully
            Ok(None) => Ok(false),   // Key already existed
            Err(e) => Err(e.into()),
        }
    }

    async fn pexpire_if_eq(
        &self,
        k: String,
        expected: String,
        millis: u64,
    ) -> Result<bool, CustomRedisError> {
        let mut conn = self.connection.clone();
        let updated: i64 = redis::Script::new(PEXPIRE_IF_EQ_SCRIPT)
            .key(&k)
            .arg(&expected)
            .arg(millis)
            .invoke_async(&mut conn)
            .await?;
        Ok(updated == 1)
    }

    async fn del_if_eq(&self, k: String, expected: String) -> Result<bool, CustomRedisError> {
        let mut conn = self.connection.clone();
        let deleted: i64 = redis::Script::new(DEL_IF_EQ_SCRIPT)
            .key(&k)
            .arg(&expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn sadd_expire(
        &self,
        k: String,
        member: String,
        seconds: u64,
    ) -> Result<bool, CustomRedisError> {
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("SADD")
            .arg(&k)
            .arg(&member)
            .cmd("EXPIRE")
            .arg(&k)
            .arg(seconds)
            .ignore();

        let mut conn = self.connection.clone();
        let (added,): (i64,) = pipe.query_async(&mut conn).await?;
        Ok(added == 1)
    }

    async fn sismember(&self, k: String, member: String) -> Result<bool, CustomRedisError> {
        let mut conn = self.connection.clone();
        let result: bool = conn.sismember(k, member).await?;
        Ok(result)
    }

    async fn scard(&self, k: String) -> Result<u64, CustomRedisError> {
        let mut conn = self.connection.clone();
        let result = conn.scard(k).await?;
        Ok(result)
    }

    async fn hgetall(&self, k: String) -> Result<HashMap<String, String>, CustomRedisError> {
        let mut conn = self.connection.clone();
        let result: HashMap<String, String> = conn.hgetall(k).await?;
        Ok(result)
    }

    async fn atomic_write(&self, ops: Vec<WriteOp>) -> Result<(), CustomRedisError> {
        if ops.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in ops {
            match op {
                WriteOp::SetEx {
                    key,
                    value,
                    seconds,
                } => {
                    pipe.cmd("SETEX").arg(key).arg(seconds).arg(value).ignore();
                }
                WriteOp::LPushExpire {
                    key,
                    value,
                    seconds,
                } => {
                    pipe.cmd("LPUSH").arg(&key).arg(value).ignore();
                    pipe.cmd("EXPIRE").arg(key).arg(seconds).ignore();
                }
                WriteOp::HIncrByExpire {
                    key,
                    increments,
                    seconds,
                } => {
                    for (field, by) in increments {
                        pipe.cmd("HINCRBY").arg(&key).arg(field).arg(by).ignore();
                    }
                    pipe.cmd("EXPIRE").arg(key).arg(seconds).ignore();
                }
            }
        }

        let mut conn = self.connection.clone();
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn lrange(
        &self,
        k: String,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, CustomRedisError> {
        let mut conn = self.connection.clone();
        let result: Vec<String> = conn.lrange(k, start, stop).await?;
        Ok(result)
    }

    async fn zadd(&self, k: String, member: String, score: f64) -> Result<(), CustomRedisError> {
        let mut conn = self.connection.clone();
        conn.zadd::<_, _, _, ()>(k, member, score).await?;
        Ok(())
    }

    async fn zrevrange_withscores(
        &self,
        k: String,
        start: isize,
        stop: isize,
    ) -> Result<Vec<(String, f64)>, CustomRedisError> {
        let mut conn = self.connection.clone();
        let result: Vec<(String, f64)> = conn.zrevrange_withscores(k, start, stop).await?;
        Ok(result)
    }

    async fn zrevrank(&self, k: String, member: String) -> Result<Option<u64>, CustomRedisError> {
        let mut conn = self.connection.clone();
        let result: Option<u64> = conn.zrevrank(k, member).await?;
        Ok(result)
    }

    async fn zscore(&self, k: String, member: String) -> Result<Option<f64>, CustomRedisError> {
        let mut conn = self.connection.clone();
        let result: Option<f64> = conn.zscore(k, member).await?;
        Ok(result)
    }

    async fn zremrangebyrank(
        &self,
        k: String,
        start: isize,
        stop: isize,
    ) -> Result<u64, CustomRedisError> {
        let mut conn = self.connection.clone();
        let removed: u64 = conn.zremrangebyrank(k, start, stop).await?;
        Ok(removed)
    }
}
