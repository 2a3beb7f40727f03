//! # pixelboard-core
//!
//! Canvas state and live updates for the pixelboard engine.
//!
//! This crate provides the building blocks behind every canvas:
//!
//! - **CanvasStore** - Image and palette, created lazily per canvas
//! - **AttributionLog** - Last editor of every pixel
//! - **CooldownGate** - Per-credential edit rate limit
//! - **Broadcaster** - Live pixel update fan-out
//! - **IdentityProvider** - Credential to canvases and user id
//! - **CanvasService** - Facade composing all of the above
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌───────────────┐     ┌─────────────┐
//! │   Session   │────▶│ CanvasService │────▶│ CanvasStore │
//! └─────────────┘     └───────────────┘     └─────────────┘
//!                        │    │    │               │
//!          ┌─────────────┘    │    └────────┐      │
//!          ▼                  ▼             ▼      ▼
//!   ┌─────────────┐   ┌──────────────┐  ┌───────────────┐
//!   │ Broadcaster │   │ CooldownGate │  │AttributionLog │
//!   └─────────────┘   └──────────────┘  └───────────────┘
//!          │                  │                │
//!          └──────────────────┴────────────────┘
//!                             ▼
//!                     ┌──────────────┐
//!                     │   Backend    │  (Redis or in-memory)
//!                     └──────────────┘
//! ```

pub mod attribution;
pub mod backend;
pub mod broadcaster;
pub mod cooldown;
pub mod error;
pub mod identity;
pub mod keys;
pub mod memory;
pub mod redis_backend;
pub mod service;
pub mod store;
pub mod types;

pub use attribution::AttributionLog;
pub use backend::{Backend, BitField, WriteBatch, WriteOp};
pub use broadcaster::{Broadcaster, BroadcasterStats, PixelStream, SubscriptionHandle};
pub use cooldown::CooldownGate;
pub use error::StoreError;
pub use identity::{CachePolicy, CachedIdentity, IdentityError, IdentityProvider, StaticIdentity};
pub use keys::CanvasKeys;
pub use memory::MemoryBackend;
pub use redis_backend::RedisBackend;
pub use service::{CanvasError, CanvasService, ServiceConfig};
pub use store::CanvasStore;
pub use types::{CanvasGeometry, CanvasId, Dimensions, EditOutcome, RejectReason, UserId};
