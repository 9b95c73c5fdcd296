//! The server-side HTTP/2 transport: accept loop and per-stream dispatch.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use super::ping::{BdpSignal, PingDriver, PingOutcome};
use super::{RecvHalf, SendHalf, StreamLifecycle};
use crate::credentials::{AuthInfo, BoxIo};
use crate::transport::{Http2Settings, DEFAULT_WINDOW_SIZE};
use crate::Status;

/// Receives each accepted stream; implemented by the server's method
/// dispatcher.
#[async_trait]
pub(crate) trait InboundHandler: Send + Sync + 'static {
    async fn handle_stream(self: Arc<Self>, stream: ServerStream);
}

/// One inbound RPC stream, as handed to the dispatcher.
pub(crate) struct ServerStream {
    parts: http::request::Parts,
    recv: Option<RecvHalf>,
    respond: h2::server::SendResponse<Bytes>,
    headers_sent: bool,
    auth_info: AuthInfo,
}

impl ServerStream {
    pub(crate) fn path(&self) -> &str {
        self.parts.uri.path()
    }

    /// Takes the receive half; panics if taken twice.
    pub(crate) fn take_recv(&mut self) -> RecvHalf {
        self.recv.take().expect("receive half already taken")
    }

    /// Marks `canceller` done when the peer resets or abandons the
    /// stream.
    pub(crate) fn set_canceller(&mut self, canceller: crate::context::ContextCanceller) {
        if let Some(recv) = &mut self.recv {
            recv.set_canceller(canceller);
        }
    }

    pub(crate) fn method(&self) -> &http::Method {
        &self.parts.method
    }

    /// The `:authority` pseudo-header of the request.
    pub(crate) fn authority(&self) -> Option<&str> {
        self.parts.uri.authority().map(|a| a.as_str())
    }

    pub(crate) fn headers(&self) -> &HeaderMap {
        &self.parts.headers
    }

    pub(crate) fn auth_info(&self) -> &AuthInfo {
        &self.auth_info
    }

    pub(crate) fn headers_sent(&self) -> bool {
        self.headers_sent
    }

    /// Sends the response headers, exactly once, and yields the send half
    /// for response messages.
    pub(crate) fn send_headers(
        &mut self,
        response: http::Response<()>,
    ) -> Result<SendHalf, Status> {
        if self.headers_sent {
            return Err(Status::internal("response headers already sent"));
        }
        self.headers_sent = true;
        let stream = self
            .respond
            .send_response(response, false)
            .map_err(|e| Status::from_h2_error(&e))?;
        Ok(SendHalf::new(stream, None))
    }

    /// Sends a Trailers-Only response: one HEADERS frame carrying the
    /// status, ending the stream.
    pub(crate) fn send_trailers_only(
        &mut self,
        response: http::Response<()>,
    ) -> Result<(), Status> {
        if self.headers_sent {
            return Err(Status::internal("response headers already sent"));
        }
        self.headers_sent = true;
        self.respond
            .send_response(response, true)
            .map_err(|e| Status::from_h2_error(&e))?;
        Ok(())
    }

    pub(crate) fn send_reset(&mut self, reason: h2::Reason) {
        self.respond.send_reset(reason);
    }
}

struct ActiveGuard {
    active: Arc<AtomicUsize>,
}

impl StreamLifecycle for ActiveGuard {}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }
}

enum Event {
    Accepted(
        Option<
            Result<(http::Request<h2::RecvStream>, h2::server::SendResponse<Bytes>), h2::Error>,
        >,
    ),
    Shutdown,
    Window(u32),
    PingDead,
}

/// Serves one accepted connection until the peer goes away or shutdown
/// drains it. Individual stream failures never take the connection down.
pub(crate) async fn serve_connection<H>(
    io: BoxIo,
    settings: Http2Settings,
    auth_info: AuthInfo,
    handler: Arc<H>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), crate::Error>
where
    H: InboundHandler,
{
    let mut builder = h2::server::Builder::new();
    builder.initial_window_size(
        settings
            .initial_stream_window_size
            .unwrap_or(DEFAULT_WINDOW_SIZE),
    );
    builder.initial_connection_window_size(
        settings
            .initial_connection_window_size
            .unwrap_or(DEFAULT_WINDOW_SIZE),
    );
    if let Some(max) = settings.max_frame_size {
        builder.max_frame_size(max);
    }
    if let Some(max) = settings.max_header_list_size {
        builder.max_header_list_size(max);
    }
    if let Some(max) = settings.max_concurrent_streams {
        builder.max_concurrent_streams(max);
    }

    let mut conn = builder.handshake::<_, Bytes>(io).await?;

    let active = Arc::new(AtomicUsize::new(0));
    let bdp = settings
        .adaptive_window()
        .then(|| Arc::new(BdpSignal::default()));
    let (window_tx, mut window_rx) = mpsc::unbounded_channel::<u32>();
    let (dead_tx, mut dead_rx) = mpsc::unbounded_channel::<()>();

    if let Some(ping_pong) = conn.ping_pong() {
        let driver = PingDriver::new(
            ping_pong,
            settings.keepalive.clone(),
            bdp.clone(),
            Box::new({
                let active = active.clone();
                move || active.load(Ordering::Relaxed) > 0
            }),
            window_tx.clone(),
        );
        if driver.is_enabled() {
            tokio::spawn(async move {
                if driver.run().await == PingOutcome::KeepaliveTimeout {
                    warn!("client stopped answering pings; closing connection");
                    let _ = dead_tx.send(());
                }
            });
        }
    }

    let mut draining = false;
    loop {
        let event = tokio::select! {
            accepted = conn.accept() => Event::Accepted(accepted),
            changed = shutdown.changed(), if !draining => {
                if changed.is_err() || *shutdown.borrow() {
                    Event::Shutdown
                } else {
                    continue;
                }
            }
            Some(window) = window_rx.recv() => Event::Window(window),
            Some(()) = dead_rx.recv() => Event::PingDead,
        };

        match event {
            Event::Accepted(Some(Ok((request, respond)))) => {
                trace!("accepted stream for {}", request.uri().path());
                active.fetch_add(1, Ordering::Relaxed);
                let guard = Arc::new(ActiveGuard {
                    active: active.clone(),
                });
                let (parts, body) = request.into_parts();
                let stream = ServerStream {
                    parts,
                    recv: Some(RecvHalf::new(body, bdp.clone(), Some(guard))),
                    respond,
                    headers_sent: false,
                    auth_info: auth_info.clone(),
                };
                tokio::spawn(handler.clone().handle_stream(stream));
            }
            Event::Accepted(Some(Err(e))) => {
                if e.is_go_away() || e.is_io() {
                    debug!("connection terminated: {}", e);
                    return Ok(());
                }
                return Err(e.into());
            }
            Event::Accepted(None) => return Ok(()),
            Event::Shutdown => {
                debug!("draining connection (GOAWAY)");
                conn.graceful_shutdown();
                draining = true;
            }
            Event::Window(window) => {
                conn.set_target_window_size(window);
                if let Err(e) = conn.set_initial_window_size(window) {
                    debug!("error growing stream windows: {}", e);
                }
            }
            Event::PingDead => {
                return Err("keepalive timeout".into());
            }
        }
    }
}
