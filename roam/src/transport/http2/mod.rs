//! Connection-level plumbing shared by the client and server transports:
//! stream send/receive halves, and the keepalive/BDP ping driver.

pub(crate) mod client;
pub(crate) mod ping;
pub(crate) mod server;

use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::future;
use http::HeaderMap;
use tracing::trace;

use crate::codec::DataSource;
use crate::context::{ContextCanceller, DoneReason};
use crate::Status;

use self::ping::BdpSignal;
use std::sync::Arc;

/// Marker for per-stream lifecycle guards; a guard's `Drop` updates the
/// owning transport's stream accounting.
pub(crate) trait StreamLifecycle: Send + Sync {}

/// The sending half of one HTTP/2 stream.
///
/// Writes are cooperative with flow control: a message larger than the
/// currently granted stream/connection capacity is written in chunks,
/// waiting for WINDOW_UPDATE credit between them.
pub(crate) struct SendHalf {
    stream: h2::SendStream<Bytes>,
    _guard: Option<Arc<dyn StreamLifecycle>>,
}

impl SendHalf {
    pub(crate) fn new(
        stream: h2::SendStream<Bytes>,
        guard: Option<Arc<dyn StreamLifecycle>>,
    ) -> Self {
        SendHalf {
            stream,
            _guard: guard,
        }
    }

    /// Sends one framed message, optionally half-closing the stream after
    /// it.
    pub(crate) async fn send_message(
        &mut self,
        mut data: Bytes,
        end_of_stream: bool,
    ) -> Result<(), Status> {
        if data.is_empty() {
            return self
                .stream
                .send_data(data, end_of_stream)
                .map_err(|e| Status::from_h2_error(&e));
        }

        while !data.is_empty() {
            self.stream.reserve_capacity(data.len());
            let available = loop {
                match future::poll_fn(|cx| self.stream.poll_capacity(cx)).await {
                    None => {
                        return Err(Status::unavailable("connection closed while sending message"))
                    }
                    Some(Ok(0)) => continue,
                    Some(Ok(n)) => break n,
                    Some(Err(e)) => return Err(Status::from_h2_error(&e)),
                }
            };

            let chunk = data.split_to(available.min(data.len()));
            let eos = end_of_stream && data.is_empty();
            trace!("sending {} bytes (eos: {})", chunk.len(), eos);
            self.stream
                .send_data(chunk, eos)
                .map_err(|e| Status::from_h2_error(&e))?;
        }

        // Hand any over-granted capacity back to the connection.
        self.stream.reserve_capacity(0);
        Ok(())
    }

    /// Half-closes the stream without sending more data.
    pub(crate) fn close(&mut self) -> Result<(), Status> {
        self.stream
            .send_data(Bytes::new(), true)
            .map_err(|e| Status::from_h2_error(&e))
    }

    /// Sends the trailer frame, ending the stream (server side).
    pub(crate) fn send_trailers(&mut self, trailers: HeaderMap) -> Result<(), Status> {
        self.stream
            .send_trailers(trailers)
            .map_err(|e| Status::from_h2_error(&e))
    }

    /// Resets the stream.
    pub(crate) fn send_reset(&mut self, reason: h2::Reason) {
        self.stream.send_reset(reason);
    }

    /// Resolves when the peer resets the stream; lets a server notice an
    /// abandoned call while it is not otherwise touching the stream.
    pub(crate) fn poll_reset(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Result<h2::Reason, h2::Error>> {
        self.stream.poll_reset(cx)
    }
}

/// The receiving half of one HTTP/2 stream. Consumed chunks are released
/// back to flow control immediately and counted toward BDP estimation.
pub(crate) struct RecvHalf {
    stream: h2::RecvStream,
    bdp: Option<Arc<BdpSignal>>,
    canceller: Option<ContextCanceller>,
    _guard: Option<Arc<dyn StreamLifecycle>>,
}

impl RecvHalf {
    pub(crate) fn new(
        stream: h2::RecvStream,
        bdp: Option<Arc<BdpSignal>>,
        guard: Option<Arc<dyn StreamLifecycle>>,
    ) -> Self {
        RecvHalf {
            stream,
            bdp,
            canceller: None,
            _guard: guard,
        }
    }

    /// Marks `canceller` done when the peer resets or abandons the stream
    /// (server side).
    pub(crate) fn set_canceller(&mut self, canceller: ContextCanceller) {
        self.canceller = Some(canceller);
    }

    fn observe_error(&self, _status: &Status) {
        // Any peer-induced stream failure means the caller went away.
        if let Some(canceller) = &self.canceller {
            canceller.cancel(DoneReason::Cancelled);
        }
    }
}

impl DataSource for RecvHalf {
    fn poll_data(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<Bytes, Status>>> {
        match futures_util::ready!(self.stream.poll_data(cx)) {
            Some(Ok(bytes)) => {
                // Credit the sender right away; backpressure is applied by
                // the decode layer not polling.
                let _ = self
                    .stream
                    .flow_control()
                    .release_capacity(bytes.len());
                if let Some(bdp) = &self.bdp {
                    bdp.record(bytes.len());
                }
                Poll::Ready(Some(Ok(bytes)))
            }
            Some(Err(e)) => {
                let status = Status::from_h2_error(&e);
                self.observe_error(&status);
                Poll::Ready(Some(Err(status)))
            }
            None => Poll::Ready(None),
        }
    }

    fn poll_trailers(&mut self, cx: &mut Context<'_>) -> Poll<Result<Option<HeaderMap>, Status>> {
        match futures_util::ready!(self.stream.poll_trailers(cx)) {
            Ok(trailers) => Poll::Ready(Ok(trailers)),
            Err(e) => {
                let status = Status::from_h2_error(&e);
                self.observe_error(&status);
                Poll::Ready(Err(status))
            }
        }
    }
}
