//! # Pixelboard Server
//!
//! Shared pixel canvas server: one canvas per community, edited one pixel at
//! a time and streamed live to every connected client.
//!
//! ## Usage
//!
//! ```bash
//! # Run with an in-memory store and the default config search path
//! pixelboard
//!
//! # Run against Redis
//! REDIS_HOST=127.0.0.1 REDIS_PORT=6379 pixelboard
//!
//! # Bind elsewhere
//! PIXELBOARD_PORT=8080 PIXELBOARD_HOST=0.0.0.0 pixelboard
//! ```

mod config;
mod discord;
mod handlers;
mod metrics;
mod session;

use anyhow::{Context, Result};
use config::{BackendKind, Config, IdentityConfig, ProviderKind};
use discord::DiscordIdentity;
use handlers::AppState;
use pixelboard_core::{
    Backend, CachedIdentity, CanvasService, IdentityProvider, MemoryBackend, RedisBackend,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pixelboard=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::load()?;

    info!("Starting pixelboard server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    let backend = connect_backend(&config).await?;
    let service = Arc::new(CanvasService::new(backend, config.service_config()));

    let shutdown = CancellationToken::new();
    let identity = identity_provider(&config.identity, &shutdown)?;

    let token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
        token.cancel();
    });

    let state = Arc::new(AppState {
        service,
        identity,
        config,
        shutdown,
    });

    // Start the server
    handlers::run_server(state).await?;

    Ok(())
}

async fn connect_backend(config: &Config) -> Result<Arc<dyn Backend>> {
    match config.storage.backend {
        BackendKind::Memory => {
            info!("Using in-memory storage; canvases are lost on restart");
            Ok(Arc::new(MemoryBackend::new()))
        }
        BackendKind::Redis => {
            let redis = &config.storage.redis;
            let backend = RedisBackend::connect(&redis.url())
                .await
                .with_context(|| {
                    format!("Failed to connect to Redis at {}:{}", redis.host, redis.port)
                })?;
            backend.ping().await.context("Redis did not answer PING")?;
            Ok(Arc::new(backend))
        }
    }
}

fn identity_provider(
    config: &IdentityConfig,
    shutdown: &CancellationToken,
) -> Result<Arc<dyn IdentityProvider>> {
    match config.provider {
        ProviderKind::Discord => {
            let discord = DiscordIdentity::new(config.api_base.clone())
                .context("Failed to build identity HTTP client")?;
            info!(api_base = %config.api_base, "Using Discord identity");
            Ok(cached_identity(discord, config, shutdown))
        }
        ProviderKind::Static => {
            let provider = config.static_identity()?;
            info!(tokens = provider.len(), "Using static identity");
            Ok(Arc::new(provider))
        }
    }
}

/// Wrap `provider` in a cache and purge expired entries until shutdown.
fn cached_identity<P>(
    provider: P,
    config: &IdentityConfig,
    shutdown: &CancellationToken,
) -> Arc<dyn IdentityProvider>
where
    P: IdentityProvider + 'static,
{
    let cached = Arc::new(CachedIdentity::with_policy(provider, config.cache_policy()));

    let purge_every = Duration::from_secs(config.purge_interval_secs.max(1));
    let weak = Arc::downgrade(&cached);
    let token = shutdown.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(purge_every);
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = interval.tick() => {
                    let Some(cache) = weak.upgrade() else { break };
                    let purged = cache.purge_expired();
                    if purged > 0 {
                        debug!(purged, remaining = cache.len(), "Purged identity cache");
                    }
                }
            }
        }
    });

    cached
}
