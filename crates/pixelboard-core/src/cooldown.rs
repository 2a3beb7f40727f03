//! Per-credential edit cooldowns.
//!
//! A cooldown is a marker key with an expiry. Arming it is a single
//! set-if-absent, so two concurrent edits by the same credential can never
//! both get through.

use crate::backend::Backend;
use crate::error::Result;
use crate::keys::CanvasKeys;
use crate::types::CanvasId;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

const MARKER: &[u8] = b"1";

/// Rate limiter for edits.
#[derive(Clone)]
pub struct CooldownGate {
    backend: Arc<dyn Backend>,
    duration: Duration,
}

impl CooldownGate {
    /// A zero `duration` disables cooldowns.
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>, duration: Duration) -> Self {
        Self { backend, duration }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        !self.duration.is_zero()
    }

    /// Returns `true` if `user_key` is on cooldown for `canvas`.
    ///
    /// Otherwise arms the cooldown and returns `false`: the caller may edit.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub async fn check_and_arm(&self, canvas: CanvasId, user_key: &str) -> Result<bool> {
        if !self.is_enabled() {
            return Ok(false);
        }

        let key = CanvasKeys::new(canvas).user(user_key);
        let armed = self
            .backend
            .set_if_absent(&key, Bytes::from_static(MARKER), Some(self.duration))
            .await?;

        trace!(canvas = %canvas, on_cooldown = !armed, "Checked cooldown");
        Ok(!armed)
    }

    /// Whether `user_key` is on cooldown, without arming anything.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub async fn is_active(&self, canvas: CanvasId, user_key: &str) -> Result<bool> {
        if !self.is_enabled() {
            return Ok(false);
        }
        self.backend.exists(&CanvasKeys::new(canvas).user(user_key)).await
    }
}
