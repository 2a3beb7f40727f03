//! HTTP and WebSocket handlers for the pixelboard server.
//!
//! Every route is scoped to a canvas and requires a bearer credential that
//! grants access to it. The WebSocket route also accepts the credential
//! in-band, as the first message after the upgrade.

use crate::config::Config;
use crate::metrics::{self, SessionMetricsGuard};
use crate::session::{Session, SessionError};
use anyhow::Result;
use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, WebSocketUpgrade},
        ConnectInfo, Path, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use pixelboard_core::{CanvasError, CanvasId, CanvasService, IdentityError, IdentityProvider};
use pixelboard_protocol::encode_palette;
use pixelboard_transport::{Connection, WebSocketConfig, WebSocketConnection};
use serde::Serialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// Canvas operations.
    pub service: Arc<CanvasService>,
    /// Credential resolution.
    pub identity: Arc<dyn IdentityProvider>,
    /// Server configuration.
    pub config: Config,
    /// Cancelled on shutdown; every session holds a child token.
    pub shutdown: CancellationToken,
}

/// Errors returned to HTTP callers.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Unauthorized")]
    Unauthorized,

    #[error("Rate limited, retry later")]
    RateLimited,

    #[error("{0}")]
    BadRequest(String),

    #[error("Internal server error")]
    Internal(String),
}

impl From<IdentityError> for ApiError {
    fn from(e: IdentityError) -> Self {
        match e {
            IdentityError::Unauthorized => ApiError::Unauthorized,
            IdentityError::RateLimited => ApiError::RateLimited,
            IdentityError::Upstream(reason) => ApiError::Internal(reason),
        }
    }
}

impl From<CanvasError> for ApiError {
    fn from(e: CanvasError) -> Self {
        match e {
            CanvasError::OutOfBounds { .. } => ApiError::BadRequest(e.to_string()),
            CanvasError::Store(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(reason) => {
                error!(reason = %reason, "Request failed");
                metrics::record_error("http");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/canvases/:id/image", get(image_handler))
        .route("/canvases/:id/palette", get(palette_handler))
        .route("/canvases/:id/pixels/:x/:y", get(pixel_handler))
        .route("/canvases/:id/cooldown", get(cooldown_handler))
        .route("/canvases/:id/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP/WebSocket server until the shutdown token fires.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(state: Arc<AppState>) -> Result<()> {
    let config = &state.config;

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    // Bind and serve
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("pixelboard server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}/canvases/{{id}}/ws", addr);

    let shutdown = state.shutdown.clone();
    let app = router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await?;

    info!("pixelboard server stopped");
    Ok(())
}

/// Credential from an `Authorization: Bearer <token>` header.
fn bearer(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme == "Bearer" && !token.is_empty()).then_some(token)
}

/// Check that the bearer credential may access `canvas` and return it.
async fn check_access<'h>(
    state: &AppState,
    headers: &'h HeaderMap,
    canvas: CanvasId,
) -> Result<&'h str, ApiError> {
    let credential = bearer(headers).ok_or(ApiError::Unauthorized)?;
    if !state.identity.caller_canvases(credential).await?.contains(&canvas) {
        return Err(ApiError::Unauthorized);
    }
    Ok(credential)
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.service.stats();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "backend": state.service.backend_name(),
        "subscriptions": stats.subscription_count,
        "canvases": stats.canvas_count,
    }))
}

fn octet_stream(body: impl Into<axum::body::Body>) -> Response {
    ([(header::CONTENT_TYPE, "application/octet-stream")], body.into()).into_response()
}

async fn image_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let canvas = CanvasId(id);
    check_access(&state, &headers, canvas).await?;

    let image = state.service.get_image(canvas).await?;
    Ok(octet_stream(image))
}

async fn palette_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let canvas = CanvasId(id);
    check_access(&state, &headers, canvas).await?;

    let palette = state.service.get_palette(canvas).await?;
    Ok(octet_stream(encode_palette(&palette)))
}

#[derive(Debug, Serialize)]
struct PixelOwner {
    x: u16,
    y: u16,
    /// Decimal string; user ids do not fit in a JSON number.
    owner: Option<String>,
}

async fn pixel_handler(
    State(state): State<Arc<AppState>>,
    Path((id, x, y)): Path<(u64, u16, u16)>,
    headers: HeaderMap,
) -> Result<Json<PixelOwner>, ApiError> {
    let canvas = CanvasId(id);
    check_access(&state, &headers, canvas).await?;

    let owner = state.service.get_pixel_owner(canvas, x, y).await?;
    Ok(Json(PixelOwner {
        x,
        y,
        owner: owner.map(|user| user.to_string()),
    }))
}

async fn cooldown_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let canvas = CanvasId(id);
    let credential = check_access(&state, &headers, canvas).await?;

    let on_cooldown = state.service.check_cooldown(canvas, credential).await?;
    Ok(Json(json!({ "on_cooldown": on_cooldown })))
}

/// WebSocket upgrade handler.
///
/// With an `Authorization` header the caller is authorized before the
/// upgrade, so a denied caller gets a plain 401/429 and no socket. Without
/// one, the first message must carry the credential.
async fn ws_handler(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let canvas = CanvasId(id);
    let mut session = Session::new(
        state.service.clone(),
        state.identity.clone(),
        canvas,
        state.shutdown.child_token(),
    );

    if let Some(credential) = bearer(&headers) {
        let user = state.identity.authorize(credential, canvas).await?;
        session = session.authorized(credential.to_string(), user);
    }

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return Ok(rejection.into_response()),
    };

    let config = WebSocketConfig {
        max_message_size: state.config.limits.max_message_size,
    };
    let remote_addr = connect_info.map(|ConnectInfo(addr)| addr);

    Ok(ws
        .max_message_size(config.max_message_size)
        .on_upgrade(move |socket| {
            let conn = WebSocketConnection::new(socket, remote_addr, &config);
            handle_session(session, Box::new(conn))
        }))
}

/// Run a session to completion and record how it ended.
async fn handle_session(session: Session, conn: Box<dyn Connection>) {
    let _metrics_guard = SessionMetricsGuard::new();
    let connection = conn.id().clone();

    debug!(
        connection = %connection,
        remote = conn.remote_addr().as_deref().unwrap_or("unknown"),
        "WebSocket connected"
    );

    match session.run(conn).await {
        Ok(()) => debug!(connection = %connection, "WebSocket disconnected"),
        Err(e) => {
            metrics::record_error(e.kind());
            match e {
                SessionError::Storage(_) | SessionError::Identity(_) => {
                    error!(connection = %connection, error = %e, "Session failed");
                }
                SessionError::Transport(_) => {
                    debug!(connection = %connection, error = %e, "Connection lost");
                }
                _ => warn!(connection = %connection, error = %e, "Session rejected"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use pixelboard_core::{
        CanvasGeometry, Dimensions, MemoryBackend, ServiceConfig, StaticIdentity, UserId,
    };
    use async_trait::async_trait;
    use futures_util::{SinkExt, StreamExt};
    use pixelboard_protocol::{Pixel, IMAGE_HEADER_SIZE};
    use std::collections::HashSet;
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::{self, client::IntoClientRequest, Message};
    use tower::ServiceExt;

    /// Static grants, except that the identity service throttles "busy".
    struct Throttled(StaticIdentity);

    #[async_trait]
    impl IdentityProvider for Throttled {
        async fn caller_canvases(
            &self,
            credential: &str,
        ) -> Result<HashSet<CanvasId>, IdentityError> {
            if credential == "busy" {
                return Err(IdentityError::RateLimited);
            }
            self.0.caller_canvases(credential).await
        }

        async fn caller_id(&self, credential: &str) -> Result<UserId, IdentityError> {
            if credential == "busy" {
                return Err(IdentityError::RateLimited);
            }
            self.0.caller_id(credential).await
        }
    }

    fn state() -> Arc<AppState> {
        let service = CanvasService::new(
            Arc::new(MemoryBackend::new()),
            ServiceConfig {
                geometry: CanvasGeometry::uniform(Dimensions::new(8, 4)),
                cooldown: Duration::from_secs(60),
                ..ServiceConfig::default()
            },
        );
        let identity =
            StaticIdentity::new().with_grant("alice", UserId::new(12).unwrap(), [CanvasId(1)]);

        Arc::new(AppState {
            service: Arc::new(service),
            identity: Arc::new(Throttled(identity)),
            config: Config::default(),
            shutdown: CancellationToken::new(),
        })
    }

    async fn get(state: Arc<AppState>, uri: &str, token: Option<&str>) -> (StatusCode, Vec<u8>) {
        let mut request = Request::builder().uri(uri);
        if let Some(token) = token {
            request = request.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }

        let response = router(state)
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    #[test]
    fn test_bearer_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer(&headers), None);

        headers.insert(header::AUTHORIZATION, "Bearer abc".parse().unwrap());
        assert_eq!(bearer(&headers), Some("abc"));

        headers.insert(header::AUTHORIZATION, "Basic abc".parse().unwrap());
        assert_eq!(bearer(&headers), None);

        headers.insert(header::AUTHORIZATION, "Bearer ".parse().unwrap());
        assert_eq!(bearer(&headers), None);
    }

    #[tokio::test]
    async fn test_image_requires_access() {
        let state = state();

        let (status, body) = get(state.clone(), "/canvases/1/image", Some("alice")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.len(), IMAGE_HEADER_SIZE + 32);
        assert_eq!(&body[..IMAGE_HEADER_SIZE], &[0, 8, 0, 4]);

        let (status, _) = get(state.clone(), "/canvases/1/image", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = get(state.clone(), "/canvases/2/image", Some("alice")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = get(state, "/canvases/1/image", Some("mallory")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_palette() {
        let (status, body) = get(state(), "/canvases/1/palette", Some("alice")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.len(), 16 * 3);
        assert_eq!(&body[..3], &[0xFF, 0xFF, 0xFF]);
    }

    #[tokio::test]
    async fn test_pixel_owner() {
        let state = state();
        state
            .service
            .submit_edit(CanvasId(1), "alice", UserId::new(12).unwrap(), Pixel::new(3, 2, 5))
            .await
            .unwrap();

        let (status, body) = get(state.clone(), "/canvases/1/pixels/3/2", Some("alice")).await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json, json!({ "x": 3, "y": 2, "owner": "12" }));

        let (_, body) = get(state.clone(), "/canvases/1/pixels/0/0", Some("alice")).await;
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["owner"], serde_json::Value::Null);

        let (status, _) = get(state, "/canvases/1/pixels/8/0", Some("alice")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_cooldown_status() {
        let state = state();

        let (_, body) = get(state.clone(), "/canvases/1/cooldown", Some("alice")).await;
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json, json!({ "on_cooldown": false }));

        state
            .service
            .submit_edit(CanvasId(1), "alice", UserId::new(12).unwrap(), Pixel::new(0, 0, 1))
            .await
            .unwrap();

        let (_, body) = get(state, "/canvases/1/cooldown", Some("alice")).await;
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json, json!({ "on_cooldown": true }));
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = get(state(), "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["backend"], "memory");
    }

    fn upgrade_request(uri: &str, token: Option<&str>) -> Request<Body> {
        let mut request = Request::builder()
            .uri(uri)
            .header(header::CONNECTION, "upgrade")
            .header(header::UPGRADE, "websocket")
            .header(header::SEC_WEBSOCKET_VERSION, "13")
            .header(header::SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==");
        if let Some(token) = token {
            request = request.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        request.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_ws_header_credential_checked_before_upgrade() {
        for (token, expected) in [
            ("mallory", StatusCode::UNAUTHORIZED),
            ("busy", StatusCode::TOO_MANY_REQUESTS),
        ] {
            let response = router(state())
                .oneshot(upgrade_request("/canvases/1/ws", Some(token)))
                .await
                .unwrap();
            assert_eq!(response.status(), expected, "token {}", token);
            assert_ne!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
        }

        // Valid for some canvas, but not this one.
        let response = router(state())
            .oneshot(upgrade_request("/canvases/2/ws", Some("alice")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_ws_without_header_defers_authorization() {
        // No credential to check up front, so the request reaches the upgrade
        // itself, which a non-upgradable in-process request cannot complete.
        let response = router(state())
            .oneshot(upgrade_request("/canvases/1/ws", None))
            .await
            .unwrap();
        assert_ne!(response.status(), StatusCode::UNAUTHORIZED);
        assert_ne!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    /// Serve the router on an ephemeral port and return its address.
    async fn serve(state: Arc<AppState>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    async fn next_message<S>(socket: &mut S) -> Message
    where
        S: futures_util::Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("no message within 5s")
            .expect("socket closed")
            .unwrap()
    }

    #[tokio::test]
    async fn test_ws_in_band_token_then_edit() {
        let state = state();
        let addr = serve(state.clone()).await;

        let (mut socket, response) =
            tokio_tungstenite::connect_async(format!("ws://{}/canvases/1/ws", addr))
                .await
                .unwrap();
        assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);

        socket
            .send(Message::Text(r#"{"type":"token","token":"alice"}"#.to_string()))
            .await
            .unwrap();
        socket.send(Message::Binary(vec![0, 1, 0, 2, 3])).await.unwrap();

        assert_eq!(next_message(&mut socket).await, Message::Binary(vec![0, 1, 0, 2, 3]));
        assert_eq!(
            state.service.get_pixel_owner(CanvasId(1), 1, 2).await.unwrap(),
            UserId::new(12)
        );
    }

    #[tokio::test]
    async fn test_ws_in_band_token_denied() {
        let addr = serve(state()).await;

        let (mut socket, _) =
            tokio_tungstenite::connect_async(format!("ws://{}/canvases/1/ws", addr))
                .await
                .unwrap();
        socket
            .send(Message::Text(r#"{"type":"token","token":"mallory"}"#.to_string()))
            .await
            .unwrap();

        let Message::Text(text) = next_message(&mut socket).await else {
            panic!("expected a text notice");
        };
        let notice: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(notice, json!({ "type": "unauthorized" }));
    }

    #[tokio::test]
    async fn test_ws_header_denied_over_network() {
        let addr = serve(state()).await;

        let mut request = format!("ws://{}/canvases/1/ws", addr)
            .into_client_request()
            .unwrap();
        request
            .headers_mut()
            .insert(header::AUTHORIZATION, "Bearer busy".parse().unwrap());

        match tokio_tungstenite::connect_async(request).await {
            Err(tungstenite::Error::Http(response)) => {
                assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
            }
            other => panic!("expected a refused upgrade, got {:?}", other.map(|(_, r)| r.status())),
        }
    }

    #[test]
    fn test_error_mapping() {
        assert_eq!(
            ApiError::from(IdentityError::RateLimited).into_response().status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ApiError::from(CanvasError::OutOfBounds { canvas: CanvasId(1), x: 9, y: 9 })
                .into_response()
                .status(),
            StatusCode::BAD_REQUEST
        );
    }
}
