//! Canvas service facade.
//!
//! [`CanvasService`] is what the server talks to. It owns one of each canvas
//! component and composes them; submitting an edit is the only operation that
//! touches more than one.

use crate::attribution::AttributionLog;
use crate::backend::{Backend, WriteBatch};
use crate::broadcaster::{
    Broadcaster, BroadcasterStats, PixelStream, SubscriptionHandle, DEFAULT_SUBSCRIBER_BUFFER,
};
use crate::cooldown::CooldownGate;
use crate::error::StoreError;
use crate::store::CanvasStore;
use crate::types::{CanvasGeometry, CanvasId, EditOutcome, RejectReason, UserId};
use bytes::Bytes;
use pixelboard_protocol::{Pixel, Rgb, DEFAULT_PALETTE};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Service errors.
#[derive(Debug, Error)]
pub enum CanvasError {
    /// Coordinates outside the canvas.
    #[error("({x}, {y}) is outside canvas {canvas}")]
    OutOfBounds { canvas: CanvasId, x: u16, y: u16 },

    /// The backend failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Dimensions of every canvas.
    pub geometry: CanvasGeometry,
    /// Minimum time between two edits by the same credential on one canvas.
    /// Zero disables the limit.
    pub cooldown: Duration,
    /// Palette seeded into new canvases.
    pub palette: Vec<Rgb>,
    /// Updates buffered per live session.
    pub subscriber_buffer: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            geometry: CanvasGeometry::default(),
            cooldown: Duration::ZERO,
            palette: DEFAULT_PALETTE.to_vec(),
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
        }
    }
}

/// Entry point for every canvas operation.
pub struct CanvasService {
    backend: Arc<dyn Backend>,
    geometry: Arc<CanvasGeometry>,
    store: CanvasStore,
    log: AttributionLog,
    cooldown: CooldownGate,
    broadcaster: Broadcaster,
}

impl CanvasService {
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>, config: ServiceConfig) -> Self {
        info!(
            backend = backend.name(),
            cooldown_ms = config.cooldown.as_millis() as u64,
            "Creating canvas service"
        );

        let geometry = Arc::new(config.geometry);
        Self {
            store: CanvasStore::new(backend.clone(), geometry.clone())
                .with_palette(&config.palette),
            log: AttributionLog::new(backend.clone(), geometry.clone()),
            cooldown: CooldownGate::new(backend.clone(), config.cooldown),
            broadcaster: Broadcaster::with_buffer(backend.clone(), config.subscriber_buffer),
            backend,
            geometry,
        }
    }

    /// Current image of `canvas`: header followed by one palette index per pixel.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub async fn get_image(&self, canvas: CanvasId) -> Result<Bytes, CanvasError> {
        Ok(self.store.get_image(canvas).await?)
    }

    /// Current palette of `canvas`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub async fn get_palette(&self, canvas: CanvasId) -> Result<Vec<Rgb>, CanvasError> {
        Ok(self.store.get_palette(canvas).await?)
    }

    /// Last user who edited `(x, y)`.
    ///
    /// # Errors
    ///
    /// Returns [`CanvasError::OutOfBounds`] for coordinates outside the canvas.
    pub async fn get_pixel_owner(
        &self,
        canvas: CanvasId,
        x: u16,
        y: u16,
    ) -> Result<Option<UserId>, CanvasError> {
        if !self.geometry.header(canvas).contains(x, y) {
            return Err(CanvasError::OutOfBounds { canvas, x, y });
        }
        Ok(self.log.get_owner(canvas, x, y).await?)
    }

    /// Whether `user_key` is currently on cooldown for `canvas`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub async fn check_cooldown(
        &self,
        canvas: CanvasId,
        user_key: &str,
    ) -> Result<bool, CanvasError> {
        Ok(self.cooldown.is_active(canvas, user_key).await?)
    }

    /// Apply an edit on behalf of `user`.
    ///
    /// Checks run in order: bounds, cooldown, palette. A pixel outside the
    /// canvas is dropped before any backend access; an edit rejected for its
    /// color still consumes the cooldown. An accepted edit writes the pixel,
    /// records the owner, and publishes the update as one atomic batch.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails. The batch is then not applied,
    /// though the cooldown may already be armed.
    pub async fn submit_edit(
        &self,
        canvas: CanvasId,
        user_key: &str,
        user: UserId,
        pixel: Pixel,
    ) -> Result<EditOutcome, CanvasError> {
        if !self.geometry.header(canvas).contains(pixel.x, pixel.y) {
            debug!(canvas = %canvas, x = pixel.x, y = pixel.y, "Dropping out-of-bounds edit");
            return Ok(EditOutcome::Rejected(RejectReason::OutOfBounds));
        }

        if self.cooldown.check_and_arm(canvas, user_key).await? {
            debug!(canvas = %canvas, user = %user, "Edit rejected by cooldown");
            return Ok(EditOutcome::Rejected(RejectReason::OnCooldown));
        }

        if let Some(reason) = self.store.validate(canvas, pixel).await? {
            return Ok(EditOutcome::Rejected(reason));
        }

        let mut batch = WriteBatch::new();
        self.store.stage_pixel(&mut batch, canvas, pixel);
        self.log.stage_owner(&mut batch, canvas, pixel.x, pixel.y, user);
        self.broadcaster.stage_publish(&mut batch, canvas, pixel);
        self.backend.commit(batch).await?;

        debug!(
            canvas = %canvas,
            user = %user,
            x = pixel.x,
            y = pixel.y,
            color = pixel.color,
            "Edit applied"
        );
        Ok(EditOutcome::Accepted)
    }

    /// Subscribe to live updates of `canvas`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend subscription fails.
    pub async fn open_session(
        &self,
        canvas: CanvasId,
    ) -> Result<(SubscriptionHandle, PixelStream), CanvasError> {
        Ok(self.broadcaster.subscribe(canvas).await?)
    }

    /// End a subscription opened with [`open_session`](Self::open_session).
    ///
    /// Safe to call more than once.
    pub fn close_session(&self, handle: &SubscriptionHandle) -> bool {
        self.broadcaster.unsubscribe(handle)
    }

    #[must_use]
    pub fn stats(&self) -> BroadcasterStats {
        self.broadcaster.stats()
    }

    #[must_use]
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }
}
