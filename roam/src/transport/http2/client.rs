//! The client-side HTTP/2 transport: one connection, many RPC streams.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use super::ping::{BdpSignal, PingDriver, PingOutcome};
use super::{RecvHalf, SendHalf};
use crate::credentials::{AuthInfo, BoxIo};
use crate::transport::{Http2Settings, DEFAULT_WINDOW_SIZE};
use crate::Status;

/// Lifecycle of a transport, observable by the owning subchannel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransportState {
    /// Accepting new streams.
    Serving,
    /// No new streams admitted; in-flight streams are finishing.
    Draining,
    /// The connection is gone.
    Closed,
}

/// Why a new stream could not be opened. Both cases are safe to retry on
/// another transport: the request was never sent.
#[derive(Debug)]
pub(crate) enum NewStreamError {
    /// The transport is draining (stream-id space exhausted, GOAWAY seen,
    /// or closing).
    Draining,
    /// The framing layer refused the stream.
    Failed(h2::Error),
}

impl NewStreamError {
    pub(crate) fn into_status(self) -> Status {
        match self {
            NewStreamError::Draining => {
                Status::unavailable("transport is draining; stream refused")
            }
            NewStreamError::Failed(e) => {
                let inner = Status::from_h2_error(&e);
                Status::new(
                    inner.code(),
                    format!("{}; stream refused", inner.message()),
                )
            }
        }
    }
}

struct StreamTable {
    /// The id the next local stream would take; odd, advancing by two.
    next_stream_id: u32,
    active: u32,
    draining: bool,
}

/// One HTTP/2 connection to one peer.
pub(crate) struct ClientTransport {
    send_request: h2::client::SendRequest<Bytes>,
    state: watch::Sender<TransportState>,
    streams: Arc<Mutex<StreamTable>>,
    max_stream_id: u32,
    bdp: Option<Arc<BdpSignal>>,
    close_tx: mpsc::UnboundedSender<()>,
    // Keeps the window-update channel open for the connection driver even
    // when no ping driver runs.
    _window_tx: mpsc::UnboundedSender<u32>,
    auth_info: AuthInfo,
}

impl ClientTransport {
    /// Performs the HTTP/2 handshake over an established (and
    /// credential-wrapped) connection, and spawns the connection driver
    /// and ping tasks.
    pub(crate) async fn connect(
        io: BoxIo,
        settings: &Http2Settings,
        auth_info: AuthInfo,
    ) -> Result<Arc<Self>, crate::Error> {
        let mut builder = h2::client::Builder::new();
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

        let (send_request, mut conn) = builder.handshake::<_, Bytes>(io).await?;

        let (state_tx, _) = watch::channel(TransportState::Serving);
        let (window_tx, mut window_rx) = mpsc::unbounded_channel::<u32>();
        let (close_tx, mut close_rx) = mpsc::unbounded_channel::<()>();

        let bdp = settings
            .adaptive_window()
            .then(|| Arc::new(BdpSignal::default()));

        let streams = Arc::new(Mutex::new(StreamTable {
            next_stream_id: 1,
            active: 0,
            draining: false,
        }));

        let ping_pong = conn.ping_pong();
        if let Some(ping_pong) = ping_pong {
            let driver = PingDriver::new(
                ping_pong,
                settings.keepalive.clone(),
                bdp.clone(),
                Box::new({
                    let streams = streams.clone();
                    move || streams.lock().active > 0
                }),
                window_tx.clone(),
            );
            if driver.is_enabled() {
                let close_tx = close_tx.clone();
                tokio::spawn(async move {
                    if driver.run().await == PingOutcome::KeepaliveTimeout {
                        warn!("keepalive timeout; tearing down transport");
                        let _ = close_tx.send(());
                    }
                });
            }
        }

        let state = state_tx.clone();
        tokio::spawn(async move {
            let result = loop {
                tokio::select! {
                    r = &mut conn => break r,
                    Some(window) = window_rx.recv() => {
                        conn.set_target_window_size(window);
                        if let Err(e) = conn.set_initial_window_size(window) {
                            debug!("error growing stream windows: {}", e);
                        }
                    }
                    _ = close_rx.recv() => break Ok(()),
                }
            };
            if let Err(e) = result {
                debug!("connection terminated: {}", e);
            }
            state.send_replace(TransportState::Closed);
        });

        Ok(Arc::new(ClientTransport {
            send_request,
            state: state_tx,
            streams,
            max_stream_id: settings.max_stream_id,
            bdp,
            close_tx,
            _window_tx: window_tx,
            auth_info,
        }))
    }

    /// Opens a new RPC stream carrying `request`'s headers.
    ///
    /// Stream ids are tracked locally: when the next id would pass the
    /// configured cap the transport stops admitting streams, finishes the
    /// ones in flight, and closes. The subchannel observes the `Draining`
    /// state and brings up a successor connection.
    pub(crate) async fn new_stream(
        self: &Arc<Self>,
        request: http::Request<()>,
    ) -> Result<(SendHalf, ResponseHandle), NewStreamError> {
        let just_drained = {
            let mut table = self.streams.lock();
            if table.draining || *self.state.borrow() != TransportState::Serving {
                return Err(NewStreamError::Draining);
            }
            trace!("admitting stream id {}", table.next_stream_id);
            table.active += 1;
            table.next_stream_id = table.next_stream_id.saturating_add(2);
            table.draining = table.next_stream_id > self.max_stream_id;
            table.draining
        };
        if just_drained {
            debug!("stream id space exhausted; transport draining");
            self.state.send_replace(TransportState::Draining);
        }

        // Accounting is undone by the guard if stream setup fails below.
        // The guard holds the transport strongly: a draining transport
        // stays alive until its last stream finishes, even after the
        // subchannel has moved on to a successor.
        let guard = Arc::new(StreamGuard {
            transport: self.clone(),
        });

        let mut ready = match self.send_request.clone().ready().await {
            Ok(ready) => ready,
            Err(e) => return Err(NewStreamError::Failed(e)),
        };
        let (response, send_stream) = match ready.send_request(request, false) {
            Ok(pair) => pair,
            Err(e) => return Err(NewStreamError::Failed(e)),
        };

        Ok((
            SendHalf::new(send_stream, Some(guard.clone())),
            ResponseHandle {
                response,
                bdp: self.bdp.clone(),
                guard,
            },
        ))
    }

    /// Stops admitting streams and closes once in-flight streams finish.
    pub(crate) fn graceful_close(&self) {
        let close_now = {
            let mut table = self.streams.lock();
            table.draining = true;
            table.active == 0
        };
        self.state.send_replace(TransportState::Draining);
        if close_now {
            let _ = self.close_tx.send(());
        }
    }

    /// Closes the connection immediately, failing in-flight streams.
    pub(crate) fn close(&self) {
        let _ = self.close_tx.send(());
    }

    pub(crate) fn state(&self) -> TransportState {
        *self.state.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<TransportState> {
        self.state.subscribe()
    }

    pub(crate) fn auth_info(&self) -> &AuthInfo {
        &self.auth_info
    }

    fn stream_finished(&self) {
        let close_now = {
            let mut table = self.streams.lock();
            table.active = table.active.saturating_sub(1);
            table.draining && table.active == 0
        };
        if close_now {
            debug!("last stream finished on draining transport; closing");
            let _ = self.close_tx.send(());
        }
    }
}

/// Keeps the per-transport active-stream count honest: one guard per
/// stream, shared by its halves.
pub(crate) struct StreamGuard {
    transport: Arc<ClientTransport>,
}

impl super::StreamLifecycle for StreamGuard {}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.transport.stream_finished();
    }
}

/// The pending response side of a freshly opened stream.
pub(crate) struct ResponseHandle {
    response: h2::client::ResponseFuture,
    bdp: Option<Arc<BdpSignal>>,
    guard: Arc<StreamGuard>,
}

impl ResponseHandle {
    /// Awaits response headers, yielding the header parts and the body
    /// half.
    pub(crate) async fn into_response(
        self,
    ) -> Result<(http::response::Parts, RecvHalf), Status> {
        let response = self
            .response
            .await
            .map_err(|e| Status::from_h2_error(&e))?;
        let (parts, body) = response.into_parts();
        Ok((parts, RecvHalf::new(body, self.bdp, Some(self.guard))))
    }
}
