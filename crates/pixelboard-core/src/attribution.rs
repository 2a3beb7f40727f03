//! Per-pixel attribution log.
//!
//! Each pixel owns one 64-bit slot holding the id of the last user who edited
//! it, stored as two big-endian u32 halves (high first). A zero slot means the
//! pixel was never edited. Missing logs read as all zeros.

use crate::backend::{Backend, BitField, WriteBatch};
use crate::error::{Result, StoreError};
use crate::keys::CanvasKeys;
use crate::types::{CanvasGeometry, CanvasId, UserId};
use std::sync::Arc;

/// Last-editor lookup and recording.
#[derive(Clone)]
pub struct AttributionLog {
    backend: Arc<dyn Backend>,
    geometry: Arc<CanvasGeometry>,
}

impl AttributionLog {
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>, geometry: Arc<CanvasGeometry>) -> Self {
        Self { backend, geometry }
    }

    /// Last user who edited `(x, y)`, or `None` if nobody has.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub async fn get_owner(&self, canvas: CanvasId, x: u16, y: u16) -> Result<Option<UserId>> {
        let key = CanvasKeys::new(canvas).log();
        let (high, low) = self.fields(canvas, x, y);

        let values = self.backend.bitfield_get(&key, &[high, low]).await?;
        let &[high, low] = values.as_slice() else {
            return Err(StoreError::Unexpected {
                key,
                reason: format!("expected 2 bit fields, got {}", values.len()),
            });
        };

        let high = half(&key, high)?;
        let low = half(&key, low)?;
        Ok(UserId::from_halves(high, low))
    }

    /// Record `user` as the owner of `(x, y)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub async fn set_owner(&self, canvas: CanvasId, x: u16, y: u16, user: UserId) -> Result<()> {
        let mut batch = WriteBatch::new();
        self.stage_owner(&mut batch, canvas, x, y, user);
        self.backend.commit(batch).await
    }

    /// Add the owner write for `(x, y)` to a batch.
    pub fn stage_owner(
        &self,
        batch: &mut WriteBatch,
        canvas: CanvasId,
        x: u16,
        y: u16,
        user: UserId,
    ) {
        let key = CanvasKeys::new(canvas).log();
        let (high_field, low_field) = self.fields(canvas, x, y);
        let (high, low) = user.split();

        batch
            .set_bits(key.clone(), high_field, u64::from(high))
            .set_bits(key, low_field, u64::from(low));
    }

    fn fields(&self, canvas: CanvasId, x: u16, y: u16) -> (BitField, BitField) {
        let offset = self.geometry.header(canvas).offset(x, y);
        (BitField::u32(2 * offset), BitField::u32(2 * offset + 1))
    }
}

fn half(key: &str, value: u64) -> Result<u32> {
    u32::try_from(value).map_err(|_| StoreError::Unexpected {
        key: key.to_string(),
        reason: format!("owner half {value} does not fit in 32 bits"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use crate::types::Dimensions;

    fn log() -> (Arc<MemoryBackend>, AttributionLog) {
        let backend = Arc::new(MemoryBackend::new());
        let geometry = Arc::new(CanvasGeometry::uniform(Dimensions::new(100, 50)));
        (backend.clone(), AttributionLog::new(backend, geometry))
    }

    #[tokio::test]
    async fn test_unedited_pixel_has_no_owner() {
        let (_, log) = log();
        assert_eq!(log.get_owner(CanvasId(1), 5, 5).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_owner_roundtrip() {
        let (_, log) = log();
        let user = UserId::new(0x0123_4567_89AB_CDEF).unwrap();

        log.set_owner(CanvasId(1), 10, 20, user).await.unwrap();
        assert_eq!(log.get_owner(CanvasId(1), 10, 20).await.unwrap(), Some(user));
        assert_eq!(log.get_owner(CanvasId(1), 11, 20).await.unwrap(), None);
        assert_eq!(log.get_owner(CanvasId(2), 10, 20).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_later_edit_wins() {
        let (_, log) = log();
        let first = UserId::new(u64::MAX).unwrap();
        let second = UserId::new(3).unwrap();

        log.set_owner(CanvasId(1), 0, 0, first).await.unwrap();
        log.set_owner(CanvasId(1), 0, 0, second).await.unwrap();
        assert_eq!(log.get_owner(CanvasId(1), 0, 0).await.unwrap(), Some(second));
    }

    #[tokio::test]
    async fn test_slot_layout() {
        let (backend, log) = log();
        let user = UserId::new(0x0000_0001_0000_0002).unwrap();

        // (3, 1) on a 100-wide canvas is slot 103: bytes 824..832.
        log.set_owner(CanvasId(7), 3, 1, user).await.unwrap();

        let raw = backend.get("canvas:7:log").await.unwrap().unwrap();
        assert_eq!(raw.len(), 832);
        assert_eq!(&raw[824..832], &[0, 0, 0, 1, 0, 0, 0, 2]);
        assert!(raw[..824].iter().all(|b| *b == 0));
    }
}
