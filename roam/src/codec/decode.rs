use std::{
    fmt,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{Buf, BufMut, BytesMut};
use futures_core::Stream;
use futures_util::{future, ready};
use http::HeaderMap;
use tracing::{debug, trace};

use super::compression::{decompress, CompressionEncoding};
use super::{DecodeBuf, Decoder, DEFAULT_MAX_RECV_MESSAGE_SIZE, HEADER_SIZE};
use crate::metadata::MetadataMap;
use crate::status::infer_grpc_status;
use crate::Status;

const BUFFER_SIZE: usize = 8 * 1024;

/// The byte source a [`Streaming`] decodes from. Implemented by the
/// transport's receive half; handing out a chunk implies the implementation
/// has released the corresponding flow-control credit.
pub(crate) trait DataSource: Send {
    fn poll_data(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<bytes::Bytes, Status>>>;

    /// Polls the trailer frame. Only called after `poll_data` returned
    /// `None`.
    fn poll_trailers(&mut self, cx: &mut Context<'_>) -> Poll<Result<Option<HeaderMap>, Status>>;
}

/// Which end of the RPC this stream decodes for; used to finalize the
/// stream and to phrase protocol errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamDirection {
    /// Server side, decoding request messages. Ends at end-of-stream.
    Request,
    /// Client side, decoding response messages. Ends at the status trailer.
    Response,
}

/// A stream of inbound RPC messages, decoded and decompressed as polled.
pub struct Streaming<T> {
    decoder: Box<dyn Decoder<Item = T, Error = Status> + Send + 'static>,
    source: Box<dyn DataSource + 'static>,
    state: State,
    direction: StreamDirection,
    buf: BytesMut,
    trailers: Option<MetadataMap>,
    decompress_buf: BytesMut,
    encoding: Option<CompressionEncoding>,
    max_message_size: usize,
    deadline: Option<Pin<Box<tokio::time::Sleep>>>,
    completion: Option<Box<dyn FnOnce(&Status) + Send + Sync>>,
}

impl<T> Unpin for Streaming<T> {}

#[derive(Debug)]
enum State {
    ReadHeader,
    ReadBody { compressed: bool, len: usize },
    /// Clean end of data; the trailer frame has not been consumed yet.
    Eos,
    /// The stream produced its final item.
    Done,
}

impl<T> Streaming<T> {
    pub(crate) fn new<D, S>(
        decoder: D,
        source: S,
        direction: StreamDirection,
        encoding: Option<CompressionEncoding>,
        max_message_size: Option<usize>,
    ) -> Self
    where
        D: Decoder<Item = T, Error = Status> + Send + 'static,
        S: DataSource + 'static,
    {
        Self {
            decoder: Box::new(decoder),
            source: Box::new(source),
            state: State::ReadHeader,
            direction,
            buf: BytesMut::with_capacity(BUFFER_SIZE),
            trailers: None,
            decompress_buf: BytesMut::new(),
            encoding,
            max_message_size: max_message_size.unwrap_or(DEFAULT_MAX_RECV_MESSAGE_SIZE),
            deadline: None,
            completion: None,
        }
    }

    /// Bounds the whole stream by an absolute deadline: once it passes,
    /// the next poll fails with `DeadlineExceeded`.
    pub(crate) fn set_deadline(&mut self, deadline: Option<tokio::time::Instant>) {
        self.deadline = deadline.map(|d| Box::pin(tokio::time::sleep_until(d)));
    }

    /// Registers a callback invoked once with the stream's final status.
    pub(crate) fn set_completion(&mut self, completion: Box<dyn FnOnce(&Status) + Send + Sync>) {
        self.completion = Some(completion);
    }

    fn finish(&mut self, status: &Status) {
        self.state = State::Done;
        if let Some(completion) = self.completion.take() {
            completion(status);
        }
    }

    /// Fetch the next message from the stream, or `None` once the stream
    /// has ended with an OK outcome.
    pub async fn message(&mut self) -> Result<Option<T>, Status> {
        match future::poll_fn(|cx| Pin::new(&mut *self).poll_next(cx)).await {
            Some(Ok(m)) => Ok(Some(m)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    /// Fetch the trailing metadata, draining any remaining messages first.
    pub async fn trailers(&mut self) -> Result<Option<MetadataMap>, Status> {
        if let Some(trailers) = self.trailers.take() {
            return Ok(Some(trailers));
        }

        while self.message().await?.is_some() {}

        if let Some(trailers) = self.trailers.take() {
            return Ok(Some(trailers));
        }

        let trailers = future::poll_fn(|cx| self.source.poll_trailers(cx)).await?;
        Ok(trailers.map(MetadataMap::from_headers))
    }

    fn decode_chunk(&mut self) -> Result<Option<T>, Status> {
        if let State::ReadHeader = self.state {
            if self.buf.remaining() < HEADER_SIZE {
                return Ok(None);
            }

            let compressed = match self.buf.get_u8() {
                0 => false,
                1 => {
                    if self.encoding.is_some() {
                        true
                    } else {
                        // A set compressed-flag without a negotiated
                        // grpc-encoding is a protocol violation.
                        return Err(Status::internal(
                            "protocol error: received message with compressed-flag but no \
                             grpc-encoding was specified",
                        ));
                    }
                }
                flag => {
                    trace!("unexpected compression flag");
                    return Err(Status::internal(format!(
                        "protocol error: received message with invalid compression flag: {flag} \
                         (valid flags are 0 and 1)"
                    )));
                }
            };

            let len = self.buf.get_u32() as usize;
            if len > self.max_message_size {
                return Err(Status::resource_exhausted(format!(
                    "received message of {len} bytes exceeding the limit of {} bytes",
                    self.max_message_size
                )));
            }
            self.buf.reserve(len);

            self.state = State::ReadBody { compressed, len };
        }

        if let State::ReadBody { len, compressed } = self.state {
            if self.buf.remaining() < len {
                return Ok(None);
            }

            let decode_result = if compressed {
                self.decompress_buf.clear();

                let encoding = self.encoding.expect("compressed message without encoding");
                if let Err(err) = decompress(
                    encoding,
                    &mut self.buf,
                    &mut self.decompress_buf,
                    len,
                    self.max_message_size,
                ) {
                    return Err(Status::internal(format!("error decompressing: {err}")));
                }

                let decompressed_len = self.decompress_buf.len();
                if decompressed_len > self.max_message_size {
                    return Err(Status::resource_exhausted(format!(
                        "message decompressed past the limit of {} bytes",
                        self.max_message_size
                    )));
                }
                self.decoder.decode(&mut DecodeBuf::new(
                    &mut self.decompress_buf,
                    decompressed_len,
                ))
            } else {
                self.decoder.decode(&mut DecodeBuf::new(&mut self.buf, len))
            };

            return match decode_result {
                Ok(Some(msg)) => {
                    self.state = State::ReadHeader;
                    Ok(Some(msg))
                }
                Ok(None) => Ok(None),
                Err(e) => Err(e),
            };
        }

        Ok(None)
    }
}

impl<T> Stream for Streaming<T> {
    type Item = Result<T, Status>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if !matches!(self.state, State::Done) {
            if let Some(deadline) = &mut self.deadline {
                if deadline.as_mut().poll(cx).is_ready() {
                    let status = Status::deadline_exceeded("deadline exceeded");
                    self.finish(&status);
                    return Poll::Ready(Some(Err(status)));
                }
            }
        }

        loop {
            match self.state {
                State::Done => return Poll::Ready(None),
                State::Eos => {
                    if self.direction == StreamDirection::Request {
                        self.finish(&Status::ok());
                        return Poll::Ready(None);
                    }

                    // Client side: the stream resolves at the status trailer.
                    let trailers = match ready!(self.source.poll_trailers(cx)) {
                        Ok(trailers) => trailers,
                        Err(status) => {
                            debug!("error polling trailers: {}", status);
                            self.finish(&status);
                            return Poll::Ready(Some(Err(status)));
                        }
                    };
                    return match infer_grpc_status(trailers.as_ref(), true) {
                        Ok(()) => {
                            self.trailers = trailers.map(|mut t| {
                                crate::status::strip_reserved(&mut t);
                                MetadataMap::from_headers(t)
                            });
                            self.finish(&Status::ok());
                            Poll::Ready(None)
                        }
                        Err(status) => {
                            self.finish(&status);
                            Poll::Ready(Some(Err(status)))
                        }
                    };
                }
                _ => {}
            }

            match self.decode_chunk() {
                Ok(Some(item)) => return Poll::Ready(Some(Ok(item))),
                Ok(None) => {}
                Err(status) => {
                    self.finish(&status);
                    return Poll::Ready(Some(Err(status)));
                }
            }

            match ready!(self.source.poll_data(cx)) {
                Some(Ok(data)) => self.buf.put(data),
                Some(Err(status)) => {
                    debug!("stream error while decoding: {}", status);
                    self.finish(&status);
                    return Poll::Ready(Some(Err(status)));
                }
                None => {
                    if self.buf.has_remaining() || matches!(self.state, State::ReadBody { .. }) {
                        // End of stream in the middle of a message.
                        trace!("unexpected EOF decoding stream");
                        let status =
                            Status::unavailable("stream ended in the middle of a message");
                        self.finish(&status);
                        return Poll::Ready(Some(Err(status)));
                    }
                    self.state = State::Eos;
                }
            }
        }
    }
}

impl<T> fmt::Debug for Streaming<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Streaming").finish()
    }
}


#[cfg(test)]
static_assertions::assert_impl_all!(Streaming<()>: Send);
