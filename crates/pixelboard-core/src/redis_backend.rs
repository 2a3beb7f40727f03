//! Redis-backed storage (for production).
//!
//! Images and attribution logs are plain strings mutated with `BITFIELD`,
//! cooldowns use `SET NX PX`, compound edits run inside `MULTI/EXEC`, and live
//! updates use Redis pub/sub so every server process sees every edit.

use crate::backend::{Backend, BitField, PayloadStream, WriteBatch, WriteOp};
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use redis::aio::MultiplexedConnection;
use std::time::Duration;
use tracing::{debug, info};

/// Backend talking to a Redis server.
///
/// One multiplexed connection is shared by every caller; each subscription
/// opens its own pub/sub connection.
pub struct RedisBackend {
    client: redis::Client,
    connection: MultiplexedConnection,
}

impl RedisBackend {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the server is unreachable.
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let connection = client.get_multiplexed_async_connection().await?;

        info!("Connected to Redis backend");

        Ok(Self { client, connection })
    }

    /// Round-trip a `PING`.
    ///
    /// # Errors
    ///
    /// Returns an error if the server does not answer.
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl Backend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let mut conn = self.connection.clone();
        let data: Option<Vec<u8>> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(data.map(Bytes::from))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection.clone();
        let exists: i64 = redis::cmd("EXISTS").arg(key).query_async(&mut conn).await?;
        Ok(exists > 0)
    }

    async fn strlen(&self, key: &str) -> Result<usize> {
        let mut conn = self.connection.clone();
        let len: usize = redis::cmd("STRLEN").arg(key).query_async(&mut conn).await?;
        Ok(len)
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let mut conn = self.connection.clone();

        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(&value[..]).arg("NX");
        if let Some(ttl) = ttl {
            // PX rejects zero.
            let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
            cmd.arg("PX").arg(millis);
        }

        let reply: Option<String> = cmd.query_async(&mut conn).await?;
        Ok(reply.is_some())
    }

    async fn bitfield_get(&self, key: &str, fields: &[BitField]) -> Result<Vec<u64>> {
        if fields.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.connection.clone();

        let mut cmd = redis::cmd("BITFIELD");
        cmd.arg(key);
        for field in fields {
            cmd.arg("GET").arg(field.type_name()).arg(field.position());
        }

        let values: Vec<u64> = cmd.query_async(&mut conn).await?;
        Ok(values)
    }

    async fn commit(&self, batch: WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut conn = self.connection.clone();

        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in batch.ops() {
            match op {
                WriteOp::SetBits { key, field, value } => {
                    pipe.cmd("BITFIELD")
                        .arg(key)
                        .arg("SET")
                        .arg(field.type_name())
                        .arg(field.position())
                        .arg(*value)
                        .ignore();
                }
                WriteOp::Publish { channel, payload } => {
                    pipe.cmd("PUBLISH").arg(channel).arg(&payload[..]).ignore();
                }
            }
        }

        pipe.query_async::<()>(&mut conn).await?;
        debug!(ops = batch.len(), "Committed batch");
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<usize> {
        let mut conn = self.connection.clone();
        let receivers: usize = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(&payload[..])
            .query_async(&mut conn)
            .await?;
        Ok(receivers)
    }

    async fn subscribe(&self, channel: &str) -> Result<PayloadStream> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;

        debug!(channel = %channel, "Subscribed to Redis channel");

        let stream = pubsub
            .into_on_message()
            .map(|msg| Bytes::copy_from_slice(msg.get_payload_bytes()));
        Ok(stream.boxed())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
