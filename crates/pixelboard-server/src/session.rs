//! Live canvas sessions.
//!
//! A session moves through `Connected → Authorizing → Streaming → Closing →
//! Closed`. While streaming, inbound edits and outbound updates run as two
//! concurrently polled halves sharing one cancellation token: whichever half
//! finishes first cancels the other.

use crate::metrics;
use pixelboard_core::{
    CanvasError, CanvasId, CanvasService, EditOutcome, IdentityError, IdentityProvider, PixelStream,
    RejectReason, SubscriptionHandle, UserId,
};
use pixelboard_protocol::{ClientFrame, Notice, ServerFrame};
use pixelboard_transport::{Connection, ConnectionId, FrameReceiver, FrameSender, TransportError};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Notices waiting to be sent. Extra cooldown notices are dropped.
const NOTICE_BUFFER: usize = 16;

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Authorizing,
    Streaming,
    Closing,
    Closed,
}

/// Reasons a session ended abnormally.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Unauthorized")]
    Unauthorized,

    #[error("Rate limited by identity service")]
    RateLimited,

    #[error("Malformed input: {0}")]
    MalformedInput(String),

    #[error("Identity service error: {0}")]
    Identity(String),

    #[error("Storage error: {0}")]
    Storage(#[from] CanvasError),

    #[error("Transport error: {0}")]
    Transport(TransportError),
}

impl SessionError {
    /// Notice to send the client before closing, if any.
    #[must_use]
    pub fn notice(&self) -> Option<Notice> {
        match self {
            SessionError::Unauthorized => Some(Notice::Unauthorized),
            SessionError::RateLimited => Some(Notice::RateLimited),
            _ => None,
        }
    }

    /// Label for logs and metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::Unauthorized => "unauthorized",
            SessionError::RateLimited => "rate_limited",
            SessionError::MalformedInput(_) => "malformed_input",
            SessionError::Identity(_) => "identity",
            SessionError::Storage(_) => "storage",
            SessionError::Transport(_) => "transport",
        }
    }
}

impl From<IdentityError> for SessionError {
    fn from(e: IdentityError) -> Self {
        match e {
            IdentityError::Unauthorized => SessionError::Unauthorized,
            IdentityError::RateLimited => SessionError::RateLimited,
            IdentityError::Upstream(reason) => SessionError::Identity(reason),
        }
    }
}

impl From<TransportError> for SessionError {
    fn from(e: TransportError) -> Self {
        if e.is_malformed() {
            SessionError::MalformedInput(e.to_string())
        } else {
            SessionError::Transport(e)
        }
    }
}

/// Closes the subscription when dropped, on every exit path.
struct SubscriptionGuard {
    service: Arc<CanvasService>,
    handle: SubscriptionHandle,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.service.close_session(&self.handle);
        metrics::set_active_subscriptions(self.service.stats().subscription_count);
    }
}

/// One client watching and editing one canvas.
pub struct Session {
    service: Arc<CanvasService>,
    identity: Arc<dyn IdentityProvider>,
    canvas: CanvasId,
    /// Credential taken from the upgrade request, if any.
    credential: Option<String>,
    /// Set when the credential was already checked before the upgrade.
    user: Option<UserId>,
    cancel: CancellationToken,
    state: SessionState,
}

impl Session {
    /// Create a session on `canvas`. It ends early once `cancel` fires.
    #[must_use]
    pub fn new(
        service: Arc<CanvasService>,
        identity: Arc<dyn IdentityProvider>,
        canvas: CanvasId,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            service,
            identity,
            canvas,
            credential: None,
            user: None,
            cancel,
            state: SessionState::Connected,
        }
    }

    /// Skip in-band authorization: `credential` was already resolved to `user`.
    #[must_use]
    pub fn authorized(mut self, credential: String, user: UserId) -> Self {
        self.credential = Some(credential);
        self.user = Some(user);
        self
    }

    fn transition(&mut self, connection: &ConnectionId, next: SessionState) {
        trace!(connection = %connection, from = ?self.state, to = ?next, "Session state");
        self.state = next;
    }

    /// Drive the session until the client leaves, an error occurs, or the
    /// session is cancelled. The connection is closed on return.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the session. A clean close by either side
    /// or cancellation is not an error.
    pub async fn run(mut self, conn: Box<dyn Connection>) -> Result<(), SessionError> {
        let id = conn.id().clone();
        let (mut sender, mut receiver) = conn.split();

        let result = self.drive(&id, sender.as_mut(), receiver.as_mut()).await;

        self.transition(&id, SessionState::Closing);
        if let Some(notice) = result.as_ref().err().and_then(SessionError::notice) {
            // Best effort: the client may already be gone.
            let _ = sender.send(ServerFrame::Notice(notice)).await;
        }
        if let Err(e) = sender.close().await {
            debug!(connection = %id, error = %e, "Close failed");
        }
        self.transition(&id, SessionState::Closed);

        result
    }

    /// Take the credential from the upgrade request, or else wait for the
    /// first frame to carry it. `None` when the client leaves or the session
    /// is cancelled first.
    async fn await_credential(
        &mut self,
        id: &ConnectionId,
        receiver: &mut dyn FrameReceiver,
    ) -> Result<Option<String>, SessionError> {
        let credential = match self.credential.take() {
            Some(credential) => credential,
            None => {
                let frame = tokio::select! {
                    _ = self.cancel.cancelled() => return Ok(None),
                    frame = receiver.recv() => frame?,
                };
                match frame {
                    Some(ClientFrame::Token(token)) => token,
                    Some(ClientFrame::Edit(_)) => {
                        return Err(SessionError::MalformedInput(
                            "expected a token frame first".to_string(),
                        ));
                    }
                    None => return Ok(None),
                }
            }
        };

        self.transition(id, SessionState::Authorizing);
        Ok(Some(credential))
    }

    async fn drive(
        &mut self,
        id: &ConnectionId,
        sender: &mut dyn FrameSender,
        receiver: &mut dyn FrameReceiver,
    ) -> Result<(), SessionError> {
        let Some(credential) = self.await_credential(id, receiver).await? else {
            return Ok(());
        };

        let user = match self.user {
            Some(user) => user,
            None => self.identity.authorize(&credential, self.canvas).await?,
        };

        let (handle, updates) = self.service.open_session(self.canvas).await?;
        let _subscription = SubscriptionGuard {
            service: self.service.clone(),
            handle,
        };
        metrics::set_active_subscriptions(self.service.stats().subscription_count);

        self.transition(id, SessionState::Streaming);
        debug!(connection = %id, canvas = %self.canvas, user = %user, "Session streaming");

        let (notice_tx, notice_rx) = mpsc::channel(NOTICE_BUFFER);
        let editor = Editor {
            service: &self.service,
            canvas: self.canvas,
            credential: &credential,
            user,
        };

        let (inbound, outbound) = tokio::join!(
            inbound(editor, receiver, notice_tx, self.cancel.clone()),
            outbound(sender, updates, notice_rx, self.cancel.clone()),
        );

        debug!(connection = %id, canvas = %self.canvas, "Session ended");
        inbound.and(outbound)
    }
}

/// Everything the inbound half needs to submit edits.
struct Editor<'a> {
    service: &'a CanvasService,
    canvas: CanvasId,
    credential: &'a str,
    user: UserId,
}

async fn inbound(
    editor: Editor<'_>,
    receiver: &mut dyn FrameReceiver,
    notices: mpsc::Sender<Notice>,
    cancel: CancellationToken,
) -> Result<(), SessionError> {
    let _cancel_on_exit = cancel.clone().drop_guard();

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            frame = receiver.recv() => frame?,
        };

        match frame {
            Some(ClientFrame::Edit(pixel)) => {
                let start = Instant::now();
                let outcome = editor
                    .service
                    .submit_edit(editor.canvas, editor.credential, editor.user, pixel)
                    .await?;
                metrics::record_edit(outcome.as_str(), start.elapsed().as_secs_f64());

                if outcome == EditOutcome::Rejected(RejectReason::OnCooldown) {
                    // Never wait on a slow client here.
                    let _ = notices.try_send(Notice::Cooldown);
                }
            }
            Some(ClientFrame::Token(_)) => {
                trace!(canvas = %editor.canvas, "Ignoring token frame after authorization");
            }
            None => return Ok(()),
        }
    }
}

async fn outbound(
    sender: &mut dyn FrameSender,
    mut updates: PixelStream,
    mut notices: mpsc::Receiver<Notice>,
    cancel: CancellationToken,
) -> Result<(), SessionError> {
    let _cancel_on_exit = cancel.clone().drop_guard();

    loop {
        let frame = tokio::select! {
            biased;

            _ = cancel.cancelled() => return Ok(()),
            Some(notice) = notices.recv() => ServerFrame::Notice(notice),
            update = updates.recv() => match update {
                Some(pixel) => ServerFrame::Pixel(pixel),
                None => {
                    debug!(canvas = %updates.canvas(), "Update stream ended");
                    return Ok(());
                }
            },
        };

        match sender.send(frame).await {
            Ok(()) => {
                if matches!(frame, ServerFrame::Pixel(_)) {
                    metrics::record_update_sent();
                }
            }
            Err(TransportError::ConnectionClosed) => return Ok(()),
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pixelboard_core::{CanvasGeometry, Dimensions, MemoryBackend, ServiceConfig, StaticIdentity};
    use pixelboard_protocol::{Pixel, WireMessage};
    use pixelboard_transport::{ChannelConnection, ChannelPeer};
    use std::collections::HashSet;
    use std::time::Duration;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn user(id: u64) -> UserId {
        UserId::new(id).unwrap()
    }

    fn service(cooldown: Duration) -> Arc<CanvasService> {
        let config = ServiceConfig {
            geometry: CanvasGeometry::uniform(Dimensions::new(16, 16)),
            cooldown,
            ..ServiceConfig::default()
        };
        Arc::new(CanvasService::new(Arc::new(MemoryBackend::new()), config))
    }

    fn identity() -> Arc<dyn IdentityProvider> {
        Arc::new(
            StaticIdentity::new()
                .with_grant("alice", user(1), [CanvasId(1)])
                .with_grant("bob", user(2), [CanvasId(1)]),
        )
    }

    fn new_session(service: Arc<CanvasService>, canvas: CanvasId) -> Session {
        Session::new(service, identity(), canvas, CancellationToken::new())
    }

    fn spawn(session: Session) -> (ChannelPeer, JoinHandle<Result<(), SessionError>>) {
        let (conn, peer) = ChannelConnection::pair();
        let task = tokio::spawn(session.run(Box::new(conn)));
        (peer, task)
    }

    async fn next(peer: &mut ChannelPeer) -> Option<ServerFrame> {
        timeout(WAIT, peer.recv()).await.unwrap().unwrap()
    }

    /// Wait until `service` has `n` live subscriptions.
    async fn subscribed(service: &CanvasService, n: usize) {
        timeout(WAIT, async {
            while service.stats().subscription_count != n {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_authorizing_starts_when_token_arrives() {
        let mut session = new_session(service(Duration::ZERO), CanvasId(1));
        let (conn, peer) = ChannelConnection::pair();
        let id = conn.id().clone();
        let (_sender, mut receiver) = Box::new(conn).split();

        // Nothing sent yet: still waiting for a credential.
        let pending = timeout(
            Duration::from_millis(50),
            session.await_credential(&id, receiver.as_mut()),
        )
        .await;
        assert!(pending.is_err());
        assert_eq!(session.state, SessionState::Connected);

        peer.send(ClientFrame::token("alice")).await.unwrap();
        let credential = session.await_credential(&id, receiver.as_mut()).await.unwrap();
        assert_eq!(credential.as_deref(), Some("alice"));
        assert_eq!(session.state, SessionState::Authorizing);
    }

    #[tokio::test]
    async fn test_header_credential_skips_waiting() {
        let mut session = new_session(service(Duration::ZERO), CanvasId(1))
            .authorized("alice".to_string(), user(1));
        let (conn, _peer) = ChannelConnection::pair();
        let id = conn.id().clone();
        let (_sender, mut receiver) = Box::new(conn).split();

        let credential = session.await_credential(&id, receiver.as_mut()).await.unwrap();
        assert_eq!(credential.as_deref(), Some("alice"));
        assert_eq!(session.state, SessionState::Authorizing);
    }

    #[tokio::test]
    async fn test_in_band_token_then_edit() {
        let service = service(Duration::ZERO);
        let session = new_session(service.clone(), CanvasId(1));
        let (mut peer, task) = spawn(session);

        peer.send(ClientFrame::token("alice")).await.unwrap();
        subscribed(&service, 1).await;
        peer.send(ClientFrame::Edit(Pixel::new(2, 3, 4))).await.unwrap();

        assert_eq!(next(&mut peer).await, Some(ServerFrame::Pixel(Pixel::new(2, 3, 4))));
        assert_eq!(
            service.get_pixel_owner(CanvasId(1), 2, 3).await.unwrap(),
            Some(user(1))
        );

        peer.close();
        assert!(task.await.unwrap().is_ok());
        assert_eq!(next(&mut peer).await, None);
        assert_eq!(service.stats().subscription_count, 0);
    }

    #[tokio::test]
    async fn test_updates_from_other_sessions() {
        let service = service(Duration::ZERO);
        let (mut watcher, _t1) = spawn(new_session(service.clone(), CanvasId(1)));
        let (mut painter, _t2) = spawn(new_session(service.clone(), CanvasId(1)));

        watcher.send(ClientFrame::token("alice")).await.unwrap();
        painter.send(ClientFrame::token("bob")).await.unwrap();
        subscribed(&service, 2).await;

        for i in 0..5u16 {
            painter.send(ClientFrame::Edit(Pixel::new(i, 0, 1))).await.unwrap();
        }
        for i in 0..5u16 {
            assert_eq!(next(&mut watcher).await, Some(ServerFrame::Pixel(Pixel::new(i, 0, 1))));
        }
    }

    #[tokio::test]
    async fn test_cooldown_notice() {
        let service = service(Duration::from_secs(60));
        let session = new_session(service.clone(), CanvasId(1))
            .authorized("alice".to_string(), user(1));
        let (mut peer, _task) = spawn(session);
        subscribed(&service, 1).await;

        peer.send(ClientFrame::Edit(Pixel::new(0, 0, 1))).await.unwrap();
        peer.send(ClientFrame::Edit(Pixel::new(1, 0, 1))).await.unwrap();

        // Notices and updates travel on separate queues, so either may come first.
        let frames = [next(&mut peer).await, next(&mut peer).await];
        assert!(frames.contains(&Some(ServerFrame::Pixel(Pixel::new(0, 0, 1)))));
        assert!(frames.contains(&Some(ServerFrame::Notice(Notice::Cooldown))));
        assert_eq!(
            service.get_pixel_owner(CanvasId(1), 1, 0).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_rejected_edits_keep_session_open() {
        let service = service(Duration::ZERO);
        let session = new_session(service.clone(), CanvasId(1))
            .authorized("alice".to_string(), user(1));
        let (mut peer, _task) = spawn(session);
        subscribed(&service, 1).await;

        // Out of range and out of bounds are dropped without a word.
        peer.send(ClientFrame::Edit(Pixel::new(0, 0, 99))).await.unwrap();
        peer.send(ClientFrame::Edit(Pixel::new(16, 0, 1))).await.unwrap();
        peer.send(ClientFrame::Edit(Pixel::new(5, 5, 5))).await.unwrap();

        assert_eq!(next(&mut peer).await, Some(ServerFrame::Pixel(Pixel::new(5, 5, 5))));
    }

    #[tokio::test]
    async fn test_unauthorized_token() {
        let service = service(Duration::ZERO);
        let session = new_session(service.clone(), CanvasId(2));
        let (mut peer, task) = spawn(session);

        peer.send(ClientFrame::token("alice")).await.unwrap();

        assert_eq!(next(&mut peer).await, Some(ServerFrame::Notice(Notice::Unauthorized)));
        assert_eq!(next(&mut peer).await, None);
        assert!(matches!(task.await.unwrap(), Err(SessionError::Unauthorized)));
        assert_eq!(service.stats().subscription_count, 0);
    }

    #[tokio::test]
    async fn test_rate_limited_identity() {
        struct Throttled;

        #[async_trait]
        impl IdentityProvider for Throttled {
            async fn caller_canvases(&self, _: &str) -> Result<HashSet<CanvasId>, IdentityError> {
                Err(IdentityError::RateLimited)
            }

            async fn caller_id(&self, _: &str) -> Result<UserId, IdentityError> {
                Err(IdentityError::RateLimited)
            }
        }

        let session = Session::new(
            service(Duration::ZERO),
            Arc::new(Throttled),
            CanvasId(1),
            CancellationToken::new(),
        );
        let (mut peer, task) = spawn(session);

        peer.send(ClientFrame::token("alice")).await.unwrap();

        assert_eq!(next(&mut peer).await, Some(ServerFrame::Notice(Notice::RateLimited)));
        assert!(matches!(task.await.unwrap(), Err(SessionError::RateLimited)));
    }

    #[tokio::test]
    async fn test_edit_before_token_is_malformed() {
        let session = new_session(service(Duration::ZERO), CanvasId(1));
        let (mut peer, task) = spawn(session);

        peer.send(ClientFrame::Edit(Pixel::new(0, 0, 1))).await.unwrap();

        assert!(matches!(task.await.unwrap(), Err(SessionError::MalformedInput(_))));
        assert_eq!(next(&mut peer).await, None);
    }

    #[tokio::test]
    async fn test_malformed_frame_ends_streaming() {
        let service = service(Duration::ZERO);
        let session = new_session(service.clone(), CanvasId(1))
            .authorized("alice".to_string(), user(1));
        let (peer, task) = spawn(session);
        subscribed(&service, 1).await;

        peer.send_raw(WireMessage::Binary(vec![1, 2, 3].into())).await.unwrap();

        assert!(matches!(task.await.unwrap(), Err(SessionError::MalformedInput(_))));
        assert_eq!(service.stats().subscription_count, 0);
    }

    #[tokio::test]
    async fn test_cancellation_closes_session() {
        let service = service(Duration::ZERO);
        let shutdown = CancellationToken::new();
        let session = Session::new(service.clone(), identity(), CanvasId(1), shutdown.child_token())
            .authorized("alice".to_string(), user(1));
        let (mut peer, task) = spawn(session);
        subscribed(&service, 1).await;

        shutdown.cancel();

        assert!(timeout(WAIT, task).await.unwrap().unwrap().is_ok());
        assert_eq!(next(&mut peer).await, None);
        assert_eq!(service.stats().subscription_count, 0);
    }

    #[tokio::test]
    async fn test_client_gone_before_token() {
        let session = new_session(service(Duration::ZERO), CanvasId(1));
        let (mut peer, task) = spawn(session);

        peer.close();
        assert!(task.await.unwrap().is_ok());
    }
}
