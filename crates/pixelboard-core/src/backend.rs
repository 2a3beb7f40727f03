//! Key-value backend abstraction.
//!
//! The canvas components never talk to Redis directly. They speak to a
//! [`Backend`], which offers exactly the primitives the engine relies on:
//! set-if-absent with optional expiry, bit-field reads, atomic write batches,
//! and publish/subscribe.

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use std::time::Duration;

/// A stream of raw payloads published on one channel.
pub type PayloadStream = BoxStream<'static, Bytes>;

/// An unsigned bit field addressed by index, like `BITFIELD ... u<width> #<index>`.
///
/// The field starts at bit `index * width`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitField {
    pub width: u8,
    pub index: u64,
}

impl BitField {
    #[must_use]
    pub const fn new(width: u8, index: u64) -> Self {
        Self { width, index }
    }

    /// Byte-wide field at byte `index`.
    #[must_use]
    pub const fn u8(index: u64) -> Self {
        Self::new(8, index)
    }

    /// 32-bit field at slot `index`.
    #[must_use]
    pub const fn u32(index: u64) -> Self {
        Self::new(32, index)
    }

    #[must_use]
    pub fn bit_offset(&self) -> u64 {
        self.index * u64::from(self.width)
    }

    /// Type argument for `BITFIELD`, e.g. `u8`.
    #[must_use]
    pub fn type_name(&self) -> String {
        format!("u{}", self.width)
    }

    /// Offset argument for `BITFIELD`, e.g. `#12`.
    #[must_use]
    pub fn position(&self) -> String {
        format!("#{}", self.index)
    }
}

/// One operation inside a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// Overwrite a bit field.
    SetBits {
        key: String,
        field: BitField,
        value: u64,
    },
    /// Publish a payload on a channel.
    Publish { channel: String, payload: Bytes },
}

/// A group of writes that commit together or not at all.
///
/// Publishes inside a batch are delivered in batch order, after the writes
/// before them are visible and before any later batch commits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a bit-field write.
    pub fn set_bits(&mut self, key: impl Into<String>, field: BitField, value: u64) -> &mut Self {
        self.ops.push(WriteOp::SetBits {
            key: key.into(),
            field,
            value,
        });
        self
    }

    /// Queue a publish.
    pub fn publish(&mut self, channel: impl Into<String>, payload: impl Into<Bytes>) -> &mut Self {
        self.ops.push(WriteOp::Publish {
            channel: channel.into(),
            payload: payload.into(),
        });
        self
    }

    #[must_use]
    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

/// Storage and messaging primitives shared by every canvas component.
///
/// Implementations must tolerate arbitrary concurrent callers.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Get a value.
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Whether a key exists.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Length of a value in bytes, zero if absent.
    async fn strlen(&self, key: &str) -> Result<usize>;

    /// Store `value` only if `key` is absent, optionally expiring after `ttl`.
    ///
    /// Returns `true` if the value was stored. Check and store are one atomic
    /// step.
    async fn set_if_absent(&self, key: &str, value: Bytes, ttl: Option<Duration>)
        -> Result<bool>;

    /// Read bit fields. Missing keys and bits past the end read as zero.
    async fn bitfield_get(&self, key: &str, fields: &[BitField]) -> Result<Vec<u64>>;

    /// Apply a batch atomically.
    async fn commit(&self, batch: WriteBatch) -> Result<()>;

    /// Publish a payload. Returns how many subscribers received it.
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<usize>;

    /// Subscribe to a channel.
    ///
    /// The subscription is active once this returns: anything published
    /// afterwards appears on the stream, in publish order.
    async fn subscribe(&self, channel: &str) -> Result<PayloadStream>;

    /// Backend name for logs.
    fn name(&self) -> &'static str;
}
