//! Dynamic service registration and the per-shape request drivers.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures_core::Stream;
use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use tracing::{debug, trace};

use super::ServerConfig;
use crate::codec::compression::SingleMessageCompressionOverride;
use crate::codec::{
    encode_message, Codec, CompressionEncoding, DecodeBuf, Decoder, EncodeBuf, Encoder,
    StreamDirection, Streaming,
};
use crate::context::{CallContext, ContextCanceller, DoneReason};
use crate::interceptor::{MethodInfo, ServerStreamNext, ServerUnaryNext};
use crate::metadata::MetadataMap;
use crate::request::CallOptions;
use crate::transport::http2::server::ServerStream;
use crate::transport::http2::SendHalf;
use crate::{Extensions, Request, Response, Status};

/// A stream of response messages produced by server-streaming handlers.
pub type ResponseStream<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send>>;

/// A named service: a set of methods registered under
/// `/<service-name>/<method-name>`, looked up case-sensitively.
pub struct Service {
    name: String,
    methods: HashMap<String, Arc<MethodHandler>>,
}

impl Service {
    /// Starts a service named `name` (fully qualified, e.g.
    /// `echo.Echo`).
    pub fn new(name: impl Into<String>) -> Self {
        Service {
            name: name.into(),
            methods: HashMap::new(),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn into_methods(self) -> impl Iterator<Item = (String, Arc<MethodHandler>)> {
        let name = self.name;
        self.methods
            .into_iter()
            .map(move |(method, handler)| (format!("/{name}/{method}"), handler))
    }

    /// Registers a unary method.
    pub fn unary<C, F, Fut>(mut self, method: &str, codec: C, handler: F) -> Self
    where
        C: Codec + Clone + Send + Sync + 'static,
        F: Fn(Request<C::Decode>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response<C::Encode>, Status>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.insert(method, move |call: ServerCall| {
            let codec = codec.clone();
            let handler = handler.clone();
            Box::pin(run_unary(call, codec, handler))
        });
        self
    }

    /// Registers a client-streaming method.
    pub fn client_streaming<C, F, Fut>(mut self, method: &str, codec: C, handler: F) -> Self
    where
        C: Codec + Clone + Send + Sync + 'static,
        F: Fn(Request<Streaming<C::Decode>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response<C::Encode>, Status>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.insert(method, move |call: ServerCall| {
            let codec = codec.clone();
            let handler = handler.clone();
            Box::pin(run_client_streaming(call, codec, handler))
        });
        self
    }

    /// Registers a server-streaming method.
    pub fn server_streaming<C, F, Fut>(mut self, method: &str, codec: C, handler: F) -> Self
    where
        C: Codec + Clone + Send + Sync + 'static,
        F: Fn(Request<C::Decode>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response<ResponseStream<C::Encode>>, Status>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.insert(method, move |call: ServerCall| {
            let codec = codec.clone();
            let handler = handler.clone();
            Box::pin(run_server_streaming(call, codec, handler))
        });
        self
    }

    /// Registers a bidirectional-streaming method.
    pub fn streaming<C, F, Fut>(mut self, method: &str, codec: C, handler: F) -> Self
    where
        C: Codec + Clone + Send + Sync + 'static,
        F: Fn(Request<Streaming<C::Decode>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response<ResponseStream<C::Encode>>, Status>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.insert(method, move |call: ServerCall| {
            let codec = codec.clone();
            let handler = handler.clone();
            Box::pin(run_streaming(call, codec, handler))
        });
        self
    }

    fn insert(
        &mut self,
        method: &str,
        handler: impl Fn(ServerCall) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    ) {
        self.methods.insert(
            method.to_string(),
            Arc::new(MethodHandler {
                run: Box::new(handler),
            }),
        );
    }
}

/// The type-erased entry point for one registered method.
pub(crate) struct MethodHandler {
    run: Box<dyn Fn(ServerCall) -> BoxFuture<'static, ()> + Send + Sync>,
}

impl MethodHandler {
    pub(crate) fn run(&self, call: ServerCall) -> BoxFuture<'static, ()> {
        (self.run)(call)
    }
}

/// Everything a method driver needs about one inbound stream.
pub(crate) struct ServerCall {
    pub(crate) stream: ServerStream,
    pub(crate) context: CallContext,
    pub(crate) canceller: ContextCanceller,
    pub(crate) metadata: MetadataMap,
    pub(crate) info: MethodInfo,
    pub(crate) authority: Option<String>,
    pub(crate) request_encoding: Option<CompressionEncoding>,
    pub(crate) response_encoding: Option<CompressionEncoding>,
    pub(crate) config: Arc<ServerConfig>,
}

impl ServerCall {
    /// Extensions every handler request carries: the call context and
    /// the addressed authority.
    fn base_extensions(&self) -> Extensions {
        let mut extensions = Extensions::new();
        extensions.insert(self.context.clone());
        if let Some(authority) = &self.authority {
            extensions.insert(super::CallAuthority(authority.clone()));
        }
        extensions
    }
}

/// The HEADERS frame of a normal (non-Trailers-Only) response.
fn response_headers(
    metadata: MetadataMap,
    encoding: Option<CompressionEncoding>,
) -> http::Response<()> {
    let mut response = http::Response::new(());
    *response.status_mut() = http::StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/grpc"),
    );
    if let Some(encoding) = encoding {
        headers.insert(
            crate::codec::compression::ENCODING_HEADER,
            encoding.into_header_value(),
        );
    }
    headers.extend(metadata.into_sanitized_headers());
    response
}

/// Ends the stream with `status`, either as trailers or, when headers
/// were never sent, as a Trailers-Only response.
pub(crate) fn finish_with_status(
    stream: &mut ServerStream,
    send: Option<&mut SendHalf>,
    status: &Status,
) {
    let trailers = match status.to_header_map() {
        Ok(trailers) => trailers,
        Err(err) => {
            debug!("unencodable status {:?}: {}", status, err);
            match Status::internal("failed to encode status").to_header_map() {
                Ok(trailers) => trailers,
                Err(_) => return,
            }
        }
    };

    match send {
        Some(send) => {
            let _ = send.send_trailers(trailers);
        }
        None => {
            let mut response = http::Response::new(());
            *response.status_mut() = http::StatusCode::OK;
            response.headers_mut().insert(
                http::header::CONTENT_TYPE,
                http::HeaderValue::from_static("application/grpc"),
            );
            response.headers_mut().extend(trailers);
            let _ = stream.send_trailers_only(response);
        }
    }
}

struct FramerBufs {
    buf: BytesMut,
    scratch: BytesMut,
}

impl FramerBufs {
    fn new() -> Self {
        FramerBufs {
            buf: BytesMut::new(),
            scratch: BytesMut::new(),
        }
    }
}

async fn run_unary<C, F, Fut>(mut call: ServerCall, mut codec: C, handler: Arc<F>)
where
    C: Codec + Clone + Send + Sync + 'static,
    F: Fn(Request<C::Decode>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response<C::Encode>, Status>> + Send + 'static,
{
    // Read the single request message at the framing level; decoding
    // happens inside the interceptor chain's terminal.
    let mut request_stream = Streaming::<Bytes>::new(
        RawDecoder,
        call.stream.take_recv(),
        StreamDirection::Request,
        call.request_encoding,
        call.config.max_recv_message_size,
    );
    let payload = match request_stream.message().await {
        Ok(Some(payload)) => payload,
        Ok(None) => {
            finish_with_status(
                &mut call.stream,
                None,
                &Status::internal("missing request message"),
            );
            return;
        }
        Err(status) => {
            finish_with_status(&mut call.stream, None, &status);
            return;
        }
    };

    let request = Request::from_parts(
        call.metadata.clone(),
        call.base_extensions(),
        CallOptions::default(),
        payload,
    );

    let chain = call.config.unary_interceptors.clone();
    let decode_codec = codec.clone();
    let context = call.context.clone();
    let terminal = move |req: Request<Bytes>| -> BoxFuture<'static, Result<Response<Bytes>, Status>> {
        let mut codec = decode_codec.clone();
        let handler = handler.clone();
        Box::pin(async move {
            let (metadata, extensions, options, payload) = req.into_parts();
            let message = decode_plain(&mut codec.decoder(), payload)?;
            let typed = Request::from_parts(metadata, extensions, options, message);
            let response = handler(typed).await?;
            let (metadata, extensions, message) = response.into_parts();
            let payload = encode_plain(&mut codec.encoder(), message)?;
            Ok(Response::from_parts(metadata, extensions, payload))
        })
    };

    let result = ServerUnaryNext::new(&chain, &call.info, &terminal)
        .run(request)
        .await;

    match result {
        Ok(response) => {
            // A deadline or cancellation that fired during the handler
            // invalidates the response; the write is dropped.
            if context.is_done() {
                trace!("dropping response for finished context");
                return;
            }
            let (metadata, _extensions, payload) = response.into_parts();
            let mut bufs = FramerBufs::new();
            let framed = match encode_message(
                &mut RawEncoder,
                payload,
                call.response_encoding,
                SingleMessageCompressionOverride::Inherit,
                call.config.max_send_message_size,
                &mut bufs.buf,
                &mut bufs.scratch,
            ) {
                Ok(framed) => framed,
                Err(status) => {
                    finish_with_status(&mut call.stream, None, &status);
                    return;
                }
            };
            let mut send =
                match call
                    .stream
                    .send_headers(response_headers(metadata, call.response_encoding))
                {
                    Ok(send) => send,
                    Err(status) => {
                        debug!("error sending response headers: {}", status);
                        return;
                    }
                };
            if send.send_message(framed, false).await.is_err() {
                return;
            }
            finish_with_status(&mut call.stream, Some(&mut send), &Status::ok());
        }
        Err(status) => finish_with_status(&mut call.stream, None, &status),
    }
}

async fn run_client_streaming<C, F, Fut>(call: ServerCall, codec: C, handler: Arc<F>)
where
    C: Codec + Clone + Send + Sync + 'static,
    F: Fn(Request<Streaming<C::Decode>>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response<C::Encode>, Status>> + Send + 'static,
{
    run_stream_shape(call, codec, move |slot: CallSlot, codec: C| {
        let handler = handler.clone();
        Box::pin(async move {
            let mut call = take_call(&slot)?;
            let result = async {
                let mut codec = codec;
                let request = typed_request_stream(&mut call, &mut codec);
                let response = handler(request).await?;
                let (metadata, _extensions, message) = response.into_parts();
                let payload = encode_plain(&mut codec.encoder(), message)?;
                send_single_response(&mut call, metadata, payload).await
            }
            .await;
            put_back_on_error(&slot, call, result)
        })
    })
    .await;
}

async fn run_server_streaming<C, F, Fut>(call: ServerCall, codec: C, handler: Arc<F>)
where
    C: Codec + Clone + Send + Sync + 'static,
    F: Fn(Request<C::Decode>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response<ResponseStream<C::Encode>>, Status>> + Send + 'static,
{
    run_stream_shape(call, codec, move |slot: CallSlot, codec: C| {
        let handler = handler.clone();
        Box::pin(async move {
            let mut call = take_call(&slot)?;
            let result = async {
                let mut codec = codec;
                // Single request message, decoded directly.
                let mut request_stream = typed_request_stream(&mut call, &mut codec).into_inner();
                let message = request_stream
                    .message()
                    .await?
                    .ok_or_else(|| Status::internal("missing request message"))?;
                let request = Request::from_parts(
                    call.metadata.clone(),
                    call.base_extensions(),
                    CallOptions::default(),
                    message,
                );
                let response = handler(request).await?;
                let (metadata, _extensions, stream) = response.into_parts();
                pump_response_stream(&mut call, &mut codec, metadata, stream).await
            }
            .await;
            put_back_on_error(&slot, call, result)
        })
    })
    .await;
}

async fn run_streaming<C, F, Fut>(call: ServerCall, codec: C, handler: Arc<F>)
where
    C: Codec + Clone + Send + Sync + 'static,
    F: Fn(Request<Streaming<C::Decode>>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response<ResponseStream<C::Encode>>, Status>> + Send + 'static,
{
    run_stream_shape(call, codec, move |slot: CallSlot, codec: C| {
        let handler = handler.clone();
        Box::pin(async move {
            let mut call = take_call(&slot)?;
            let result = async {
                let mut codec = codec;
                let request = typed_request_stream(&mut call, &mut codec);
                let response = handler(request).await?;
                let (metadata, _extensions, stream) = response.into_parts();
                pump_response_stream(&mut call, &mut codec, metadata, stream).await
            }
            .await;
            put_back_on_error(&slot, call, result)
        })
    })
    .await;
}

type CallSlot = Arc<parking_lot::Mutex<Option<ServerCall>>>;

fn take_call(slot: &CallSlot) -> Result<ServerCall, Status> {
    slot.lock()
        .take()
        .ok_or_else(|| Status::internal("stream already consumed"))
}

/// On error the call goes back into the slot so the surrounding chain
/// can finalize the stream with the failing status.
fn put_back_on_error(
    slot: &CallSlot,
    call: ServerCall,
    result: Result<(), Status>,
) -> Result<(), Status> {
    if result.is_err() {
        *slot.lock() = Some(call);
    }
    result
}

/// Shared scaffolding for the three streaming shapes: runs the stream
/// interceptor chain around `drive`, then finalizes errors.
async fn run_stream_shape<C>(
    call: ServerCall,
    codec: C,
    drive: impl Fn(CallSlot, C) -> BoxFuture<'static, Result<(), Status>> + Send + Sync + 'static,
) where
    C: Codec + Clone + Send + Sync + 'static,
{
    let chain = call.config.stream_interceptors.clone();
    let info = call.info.clone();
    let metadata = call.metadata.clone();
    let context = call.context.clone();

    let slot: CallSlot = Arc::new(parking_lot::Mutex::new(Some(call)));
    let terminal = {
        let slot = slot.clone();
        move || -> BoxFuture<'static, Result<(), Status>> {
            drive(slot.clone(), codec.clone())
        }
    };

    let result = ServerStreamNext::new(&chain, &info, &metadata, &terminal)
        .run()
        .await;

    if let Err(status) = result {
        if context.is_done() {
            return;
        }
        if let Some(mut call) = slot.lock().take() {
            finish_with_status(&mut call.stream, None, &status);
        }
    }
}

/// Builds the typed request message stream for a call, wiring in the
/// request encoding, size limits and deadline.
fn typed_request_stream<C>(call: &mut ServerCall, codec: &mut C) -> Request<Streaming<C::Decode>>
where
    C: Codec,
{
    let mut streaming = Streaming::new(
        codec.decoder(),
        call.stream.take_recv(),
        StreamDirection::Request,
        call.request_encoding,
        call.config.max_recv_message_size,
    );
    streaming.set_deadline(call.context.deadline());
    Request::from_parts(
        call.metadata.clone(),
        call.base_extensions(),
        CallOptions::default(),
        streaming,
    )
}

/// Sends headers, one message and OK trailers.
async fn send_single_response(
    call: &mut ServerCall,
    metadata: MetadataMap,
    payload: Bytes,
) -> Result<(), Status> {
    if call.context.is_done() {
        return Ok(());
    }
    let mut bufs = FramerBufs::new();
    let framed = encode_message(
        &mut RawEncoder,
        payload,
        call.response_encoding,
        SingleMessageCompressionOverride::Inherit,
        call.config.max_send_message_size,
        &mut bufs.buf,
        &mut bufs.scratch,
    )?;
    let mut send = call
        .stream
        .send_headers(response_headers(metadata, call.response_encoding))?;
    send.send_message(framed, false).await?;
    finish_with_status(&mut call.stream, Some(&mut send), &Status::ok());
    Ok(())
}

/// Sends headers, then every message of `stream`, then the final
/// trailers. A stream error becomes the trailer status; once headers are
/// out the error travels on the trailer frame.
async fn pump_response_stream<C>(
    call: &mut ServerCall,
    codec: &mut C,
    metadata: MetadataMap,
    mut stream: ResponseStream<C::Encode>,
) -> Result<(), Status>
where
    C: Codec,
{
    let mut send = call
        .stream
        .send_headers(response_headers(metadata, call.response_encoding))?;
    let mut encoder = codec.encoder();
    let mut bufs = FramerBufs::new();

    enum Next<T> {
        Item(Option<T>),
        ContextDone,
        PeerReset,
    }

    loop {
        let next = tokio::select! {
            item = stream.next() => Next::Item(item),
            _ = call.context.done() => Next::ContextDone,
            _ = futures_util::future::poll_fn(|cx| send.poll_reset(cx)) => Next::PeerReset,
        };
        let item = match next {
            Next::Item(item) => item,
            Next::ContextDone => {
                trace!("context finished; dropping remaining response messages");
                return Ok(());
            }
            Next::PeerReset => {
                trace!("peer reset the stream");
                call.canceller.cancel(DoneReason::Cancelled);
                return Ok(());
            }
        };
        match item {
            Some(Ok(message)) => {
                let framed = match encode_message(
                    &mut encoder,
                    message,
                    call.response_encoding,
                    SingleMessageCompressionOverride::Inherit,
                    call.config.max_send_message_size,
                    &mut bufs.buf,
                    &mut bufs.scratch,
                ) {
                    Ok(framed) => framed,
                    Err(status) => {
                        finish_with_status(&mut call.stream, Some(&mut send), &status);
                        return Ok(());
                    }
                };
                if send.send_message(framed, false).await.is_err() {
                    return Ok(());
                }
            }
            Some(Err(status)) => {
                // The handler's status wins; it rides the trailer frame.
                finish_with_status(&mut call.stream, Some(&mut send), &status);
                return Ok(());
            }
            None => {
                finish_with_status(&mut call.stream, Some(&mut send), &Status::ok());
                return Ok(());
            }
        }
    }
}

/// Passes frame payloads through untouched (request side of the unary
/// driver).
struct RawDecoder;

impl Decoder for RawDecoder {
    type Item = Bytes;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Bytes>, Status> {
        Ok(Some(src.copy_to_bytes(src.remaining())))
    }
}

struct RawEncoder;

impl Encoder for RawEncoder {
    type Item = Bytes;
    type Error = Status;

    fn encode(&mut self, item: Bytes, dst: &mut EncodeBuf<'_>) -> Result<(), Status> {
        dst.put_slice(&item);
        Ok(())
    }
}

fn encode_plain<T>(
    encoder: &mut dyn Encoder<Item = T, Error = Status>,
    message: T,
) -> Result<Bytes, Status> {
    let mut buf = BytesMut::with_capacity(1024);
    encoder
        .encode(message, &mut EncodeBuf::new(&mut buf))
        .map_err(|err| Status::internal(format!("error encoding message: {err}")))?;
    Ok(buf.freeze())
}

fn decode_plain<T>(
    decoder: &mut dyn Decoder<Item = T, Error = Status>,
    payload: Bytes,
) -> Result<T, Status> {
    let mut buf = BytesMut::from(&payload[..]);
    let len = buf.len();
    decoder
        .decode(&mut DecodeBuf::new(&mut buf, len))?
        .ok_or_else(|| Status::internal("decoder produced no message"))
}

