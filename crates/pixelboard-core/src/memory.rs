//! In-process backend.
//!
//! Holds the whole keyspace in one map and fans out publishes through tokio
//! broadcast channels. Suitable for a single server process, development, and
//! tests. Multi-process deployments need [`RedisBackend`](crate::RedisBackend).

use crate::backend::{Backend, BitField, PayloadStream, WriteBatch, WriteOp};
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::StreamExt;
use pixelboard_protocol::bits::{read_bits, write_bits};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Default broadcast capacity per channel.
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Expired keys that are never touched again are dropped at most this often.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug)]
struct Keyspace {
    entries: HashMap<String, Entry>,
    next_sweep: Instant,
}

impl Keyspace {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            next_sweep: Instant::now() + SWEEP_INTERVAL,
        }
    }

    /// Drop every expired entry once the sweep interval has elapsed.
    fn sweep_if_due(&mut self, now: Instant) {
        if now < self.next_sweep {
            return;
        }
        self.next_sweep = now + SWEEP_INTERVAL;

        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let swept = before - self.entries.len();
        if swept > 0 {
            debug!(swept, remaining = self.entries.len(), "Swept expired keys");
        }
    }

    /// Live entry for `key`, evicting it first if it has expired.
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let now = Instant::now();
        if self.entries.get(key).is_some_and(|e| e.is_expired(now)) {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }
}

/// Backend that lives entirely in memory.
#[derive(Debug)]
pub struct MemoryBackend {
    /// Keyspace. Locked only for the duration of a synchronous operation.
    keyspace: Mutex<Keyspace>,
    /// Broadcast senders indexed by channel name.
    channels: DashMap<String, broadcast::Sender<Bytes>>,
    channel_capacity: usize,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a backend whose channels buffer up to `channel_capacity` payloads
    /// per lagging subscriber.
    #[must_use]
    pub fn with_capacity(channel_capacity: usize) -> Self {
        Self {
            keyspace: Mutex::new(Keyspace::new()),
            channels: DashMap::new(),
            channel_capacity: channel_capacity.max(1),
        }
    }

    /// Number of live channels.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    fn keyspace(&self) -> MutexGuard<'_, Keyspace> {
        let mut keyspace = self.keyspace.lock().unwrap_or_else(PoisonError::into_inner);
        keyspace.sweep_if_due(Instant::now());
        keyspace
    }

    /// Send on a channel, dropping the channel once nobody listens.
    fn send(&self, channel: &str, payload: Bytes) -> usize {
        let delivered = match self.channels.get(channel) {
            Some(sender) => sender.send(payload).unwrap_or_default(),
            None => 0,
        };

        if delivered == 0
            && self
                .channels
                .remove_if(channel, |_, s| s.receiver_count() == 0)
                .is_some()
        {
            debug!(channel = %channel, "Deleted empty channel");
        }

        trace!(channel = %channel, recipients = delivered, "Published payload");
        delivered
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let mut keyspace = self.keyspace();
        Ok(keyspace.live(key).map(|e| Bytes::copy_from_slice(&e.value)))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut keyspace = self.keyspace();
        Ok(keyspace.live(key).is_some())
    }

    async fn strlen(&self, key: &str) -> Result<usize> {
        let mut keyspace = self.keyspace();
        Ok(keyspace.live(key).map_or(0, |e| e.value.len()))
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let mut keyspace = self.keyspace();
        if keyspace.live(key).is_some() {
            return Ok(false);
        }

        keyspace.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn bitfield_get(&self, key: &str, fields: &[BitField]) -> Result<Vec<u64>> {
        let mut keyspace = self.keyspace();
        let values = match keyspace.live(key) {
            Some(entry) => fields
                .iter()
                .map(|f| read_bits(&entry.value, f.bit_offset(), f.width))
                .collect(),
            None => vec![0; fields.len()],
        };
        Ok(values)
    }

    async fn commit(&self, batch: WriteBatch) -> Result<()> {
        let mut keyspace = self.keyspace();

        // Publishing under the keyspace lock keeps channel order equal to
        // commit order.
        for op in batch.ops() {
            match op {
                WriteOp::SetBits { key, field, value } => {
                    if keyspace.live(key).is_none() {
                        keyspace.entries.insert(
                            key.clone(),
                            Entry {
                                value: Vec::new(),
                                expires_at: None,
                            },
                        );
                    }
                    if let Some(entry) = keyspace.entries.get_mut(key) {
                        write_bits(&mut entry.value, field.bit_offset(), field.width, *value);
                    }
                }
                WriteOp::Publish { channel, payload } => {
                    self.send(channel, payload.clone());
                }
            }
        }

        Ok(())
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<usize> {
        // Serialize with commits so a standalone publish never overtakes one.
        let _keyspace = self.keyspace();
        Ok(self.send(channel, payload))
    }

    async fn subscribe(&self, channel: &str) -> Result<PayloadStream> {
        let receiver = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| {
                debug!(channel = %channel, "Creating new channel");
                broadcast::channel(self.channel_capacity).0
            })
            .subscribe();

        let name = channel.to_string();
        let stream = futures_util::stream::unfold(receiver, move |mut rx| {
            let name = name.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(payload) => return Some((payload, rx)),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(channel = %name, skipped, "Subscriber lagged, dropping updates");
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(stream.boxed())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_if_absent() {
        let backend = MemoryBackend::new();

        assert!(backend.set_if_absent("k", Bytes::from_static(b"one"), None).await.unwrap());
        assert!(!backend.set_if_absent("k", Bytes::from_static(b"two"), None).await.unwrap());
        assert_eq!(backend.get("k").await.unwrap().unwrap(), Bytes::from_static(b"one"));
        assert_eq!(backend.strlen("k").await.unwrap(), 3);
        assert_eq!(backend.strlen("missing").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let backend = MemoryBackend::new();
        let ttl = Some(Duration::from_secs(10));

        assert!(backend.set_if_absent("k", Bytes::from_static(b"1"), ttl).await.unwrap());
        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(backend.exists("k").await.unwrap());
        assert!(!backend.set_if_absent("k", Bytes::from_static(b"1"), ttl).await.unwrap());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!backend.exists("k").await.unwrap());
        assert!(backend.set_if_absent("k", Bytes::from_static(b"1"), ttl).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_untouched_expired_keys_are_swept() {
        let backend = MemoryBackend::new();
        let ttl = Some(Duration::from_secs(1));

        for i in 0..10_000 {
            let key = format!("canvas:1:user:token-{}", i);
            assert!(backend.set_if_absent(&key, Bytes::from_static(b"1"), ttl).await.unwrap());
        }
        backend.set_if_absent("image", Bytes::from_static(b"img"), None).await.unwrap();
        assert_eq!(backend.keyspace().entries.len(), 10_001);

        tokio::time::advance(Duration::from_secs(3600)).await;

        // Any access past the sweep interval drops what nobody reads again.
        assert!(backend.get("unrelated").await.unwrap().is_none());
        let keyspace = backend.keyspace();
        assert_eq!(keyspace.entries.len(), 1);
        assert!(keyspace.entries.contains_key("image"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_waits_for_interval() {
        let backend = MemoryBackend::new();
        let ttl = Some(Duration::from_secs(1));
        backend.set_if_absent("a", Bytes::from_static(b"1"), ttl).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        backend.get("unrelated").await.unwrap();
        assert_eq!(backend.keyspace().entries.len(), 1);

        tokio::time::advance(SWEEP_INTERVAL).await;
        backend.get("unrelated").await.unwrap();
        assert!(backend.keyspace().entries.is_empty());
    }

    #[tokio::test]
    async fn test_commit_bitfields() {
        let backend = MemoryBackend::new();

        let mut batch = WriteBatch::new();
        batch
            .set_bits("img", BitField::u8(2), 0xAB)
            .set_bits("log", BitField::u32(1), 0xDEAD_BEEF);
        backend.commit(batch).await.unwrap();

        assert_eq!(backend.get("img").await.unwrap().unwrap(), Bytes::from_static(&[0, 0, 0xAB]));
        let values = backend
            .bitfield_get("log", &[BitField::u32(0), BitField::u32(1), BitField::u32(9)])
            .await
            .unwrap();
        assert_eq!(values, vec![0, 0xDEAD_BEEF, 0]);
    }

    #[tokio::test]
    async fn test_bitfield_get_missing_key() {
        let backend = MemoryBackend::new();
        let values = backend.bitfield_get("nope", &[BitField::u8(100)]).await.unwrap();
        assert_eq!(values, vec![0]);
    }

    #[tokio::test]
    async fn test_commit_publishes_in_order() {
        let backend = MemoryBackend::new();
        let mut stream = backend.subscribe("chan").await.unwrap();

        for i in 0..3u8 {
            let mut batch = WriteBatch::new();
            batch
                .set_bits("img", BitField::u8(0), u64::from(i))
                .publish("chan", vec![i]);
            backend.commit(batch).await.unwrap();
        }

        for i in 0..3u8 {
            assert_eq!(stream.next().await.unwrap(), Bytes::from(vec![i]));
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let backend = MemoryBackend::new();
        assert_eq!(backend.publish("chan", Bytes::from_static(b"x")).await.unwrap(), 0);

        let stream = backend.subscribe("chan").await.unwrap();
        assert_eq!(backend.channel_count(), 1);
        assert_eq!(backend.publish("chan", Bytes::from_static(b"x")).await.unwrap(), 1);

        // Once the last subscriber is gone the channel is cleaned up.
        drop(stream);
        assert_eq!(backend.publish("chan", Bytes::from_static(b"x")).await.unwrap(), 0);
        assert_eq!(backend.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_set_if_absent_single_winner() {
        let backend = std::sync::Arc::new(MemoryBackend::new());
        let mut handles = Vec::new();
        for i in 0..16u8 {
            let backend = backend.clone();
            handles.push(tokio::spawn(async move {
                backend.set_if_absent("k", Bytes::from(vec![i]), None).await.unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
