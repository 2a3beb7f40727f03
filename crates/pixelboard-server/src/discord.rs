//! Discord-backed identity.
//!
//! A canvas is a Discord guild: callers may edit the canvases of the guilds
//! they belong to, and edits are credited to their Discord user id. The
//! bearer credential is forwarded to the Discord REST API as-is.

use async_trait::async_trait;
use pixelboard_core::{CanvasId, IdentityError, IdentityProvider, UserId};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct Guild {
    id: String,
}

#[derive(Debug, Deserialize)]
struct User {
    id: String,
}

/// Identity provider calling the Discord API.
pub struct DiscordIdentity {
    client: reqwest::Client,
    api_base: String,
}

impl DiscordIdentity {
    /// Create a provider for the API at `api_base`, e.g. `https://discord.com`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(api_base: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("pixelboard/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
        })
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        credential: &str,
    ) -> Result<T, IdentityError> {
        let url = format!("{}{}", self.api_base, path);
        let response = self
            .client
            .get(&url)
            .bearer_auth(credential)
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, path, "Identity request failed");
                IdentityError::Upstream(e.to_string())
            })?;

        match response.status() {
            StatusCode::TOO_MANY_REQUESTS => {
                debug!(path, "Identity service rate limited us");
                Err(IdentityError::RateLimited)
            }
            status if !status.is_success() => {
                debug!(path, status = status.as_u16(), "Credential rejected");
                Err(IdentityError::Unauthorized)
            }
            _ => response
                .json::<T>()
                .await
                .map_err(|e| {
                    IdentityError::Upstream(format!("invalid response from {}: {}", path, e))
                }),
        }
    }
}

fn parse_id(id: &str) -> Result<u64, IdentityError> {
    id.parse()
        .map_err(|_| IdentityError::Upstream(format!("invalid snowflake {:?}", id)))
}

fn guild_canvases(guilds: &[Guild]) -> Result<HashSet<CanvasId>, IdentityError> {
    guilds.iter().map(|g| parse_id(&g.id).map(CanvasId)).collect()
}

fn user_id(user: &User) -> Result<UserId, IdentityError> {
    UserId::new(parse_id(&user.id)?)
        .ok_or_else(|| IdentityError::Upstream("user id 0".to_string()))
}

#[async_trait]
impl IdentityProvider for DiscordIdentity {
    async fn caller_canvases(&self, credential: &str) -> Result<HashSet<CanvasId>, IdentityError> {
        let guilds: Vec<Guild> = self.get("/api/users/@me/guilds", credential).await?;
        guild_canvases(&guilds)
    }

    async fn caller_id(&self, credential: &str) -> Result<UserId, IdentityError> {
        let user: User = self.get("/api/users/@me", credential).await?;
        user_id(&user)
    }
}
