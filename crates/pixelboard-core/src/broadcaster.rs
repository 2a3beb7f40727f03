//! Live pixel update fan-out.
//!
//! Every canvas has one backend channel. Each open session gets its own
//! backend subscription, drained by a forwarding task into a bounded queue
//! that the session reads from. Publishing goes through the backend, so a
//! subscriber on one server process sees edits committed by any other.

use crate::backend::{Backend, WriteBatch};
use crate::error::Result;
use crate::keys::CanvasKeys;
use crate::types::CanvasId;
use dashmap::DashMap;
use futures_util::{Stream, StreamExt};
use pixelboard_protocol::Pixel;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Default number of updates buffered per subscriber.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 1024;

/// Identifies one live subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: u64,
    canvas: CanvasId,
}

impl SubscriptionHandle {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn canvas(&self) -> CanvasId {
        self.canvas
    }
}

/// Pixel updates for one subscription, in publish order.
///
/// Ends once the subscription is cancelled or the backend channel closes.
#[derive(Debug)]
pub struct PixelStream {
    canvas: CanvasId,
    rx: mpsc::Receiver<Pixel>,
}

impl PixelStream {
    #[must_use]
    pub fn canvas(&self) -> CanvasId {
        self.canvas
    }

    /// Next update, or `None` once the subscription has ended.
    pub async fn recv(&mut self) -> Option<Pixel> {
        self.rx.recv().await
    }
}

impl Stream for PixelStream {
    type Item = Pixel;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Pixel>> {
        self.rx.poll_recv(cx)
    }
}

struct SubscriptionEntry {
    canvas: CanvasId,
    task: JoinHandle<()>,
}

/// Publishes pixel updates and manages live subscriptions.
pub struct Broadcaster {
    backend: Arc<dyn Backend>,
    /// Live subscriptions indexed by id.
    subscriptions: DashMap<u64, SubscriptionEntry>,
    next_id: AtomicU64,
    buffer: usize,
}

impl Broadcaster {
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self::with_buffer(backend, DEFAULT_SUBSCRIBER_BUFFER)
    }

    /// Create a broadcaster buffering up to `buffer` updates per subscriber.
    #[must_use]
    pub fn with_buffer(backend: Arc<dyn Backend>, buffer: usize) -> Self {
        Self {
            backend,
            subscriptions: DashMap::new(),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
        }
    }

    /// Start receiving every update published on `canvas` from now on.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend subscription fails.
    pub async fn subscribe(&self, canvas: CanvasId) -> Result<(SubscriptionHandle, PixelStream)> {
        let channel = CanvasKeys::new(canvas).pubsub();
        let mut payloads = self.backend.subscribe(&channel).await?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer);

        let task = tokio::spawn(async move {
            while let Some(payload) = payloads.next().await {
                match Pixel::decode(&payload) {
                    Ok(pixel) => {
                        if tx.send(pixel).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(canvas = %canvas, error = %e, "Skipping malformed update");
                    }
                }
            }
            trace!(canvas = %canvas, subscription = id, "Forwarder finished");
        });

        self.subscriptions.insert(id, SubscriptionEntry { canvas, task });

        debug!(
            canvas = %canvas,
            subscription = id,
            subscribers = self.subscriber_count(canvas),
            "Subscribed"
        );

        Ok((SubscriptionHandle { id, canvas }, PixelStream { canvas, rx }))
    }

    /// Stop a subscription. Its stream ends after any buffered updates.
    ///
    /// Returns `false` if it was already stopped.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        match self.subscriptions.remove(&handle.id) {
            Some((_, entry)) => {
                entry.task.abort();
                debug!(
                    canvas = %entry.canvas,
                    subscription = handle.id,
                    "Unsubscribed"
                );
                true
            }
            None => false,
        }
    }

    /// Publish an update outside of an edit.
    ///
    /// Returns how many subscribers received it.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub async fn publish(&self, canvas: CanvasId, pixel: Pixel) -> Result<usize> {
        let channel = CanvasKeys::new(canvas).pubsub();
        let count = self.backend.publish(&channel, pixel.encode()).await?;
        trace!(canvas = %canvas, recipients = count, "Published update");
        Ok(count)
    }

    /// Add the publish for `pixel` to a batch.
    pub fn stage_publish(&self, batch: &mut WriteBatch, canvas: CanvasId, pixel: Pixel) {
        batch.publish(CanvasKeys::new(canvas).pubsub(), pixel.encode());
    }

    /// Live subscriptions on `canvas` held by this process.
    #[must_use]
    pub fn subscriber_count(&self, canvas: CanvasId) -> usize {
        self.subscriptions
            .iter()
            .filter(|e| e.value().canvas == canvas)
            .count()
    }

    #[must_use]
    pub fn stats(&self) -> BroadcasterStats {
        let mut canvases: Vec<CanvasId> =
            self.subscriptions.iter().map(|e| e.value().canvas).collect();
        canvases.sort_unstable();
        canvases.dedup();

        BroadcasterStats {
            subscription_count: self.subscriptions.len(),
            canvas_count: canvases.len(),
        }
    }
}

impl Drop for Broadcaster {
    fn drop(&mut self) {
        for entry in self.subscriptions.iter() {
            entry.value().task.abort();
        }
    }
}

/// Broadcaster statistics.
#[derive(Debug, Clone)]
pub struct BroadcasterStats {
    /// Number of live subscriptions.
    pub subscription_count: usize,
    /// Number of canvases with at least one subscription.
    pub canvas_count: usize,
}
