//! The client call pipeline: option resolution, the picker loop, stream
//! attachment, retries and the four RPC shapes.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures_util::future::BoxFuture;
use futures_util::{future, stream, Stream, StreamExt};
use http::HeaderMap;
use parking_lot::Mutex;
use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::channel::{Channel, ChannelCtx, ChannelInner, PickerSnapshot, WorkItem};
use super::load_balancing::{launder_control_plane_status, PickInfo, PickResult};
use super::subchannel::SubchannelHandle;
use super::ConnectivityState;
use crate::codec::compression::{
    response_encoding, SingleMessageCompressionOverride, ACCEPT_ENCODING_HEADER, ENCODING_HEADER,
};
use crate::codec::{
    encode_message, Codec, CompressionEncoding, DataSource, DecodeBuf, Decoder,
    EnabledCompressionEncodings, EncodeBuf, Encoder, StreamDirection, Streaming,
};
use crate::credentials::check_per_rpc_security;
use crate::interceptor::{ClientStreamNext, ClientUnaryNext, MethodInfo};
use crate::metadata::{timeout::encode_timeout, MetadataMap, GRPC_TIMEOUT_HEADER};
use crate::request::CallOptions;
use crate::service_config::{RetryPolicy, RetryThrottler};
use crate::transport::http2::client::ClientTransport;
use crate::transport::http2::SendHalf;
use crate::{Code, Extensions, Request, Response, Status};

/// Everything a call attempt needs, resolved from per-call options, the
/// method config and channel defaults.
struct CallSetup {
    info: MethodInfo,
    deadline: Option<Instant>,
    wait_for_ready: bool,
    compression: Option<CompressionEncoding>,
    accept: EnabledCompressionEncodings,
    max_send_message_size: Option<usize>,
    max_recv_message_size: Option<usize>,
    retry_policy: Option<RetryPolicy>,
    throttler: Option<Arc<RetryThrottler>>,
    metadata: MetadataMap,
    credentials: Option<Arc<dyn crate::credentials::PerRpcCredentials>>,
    user_agent: String,
}

impl CallSetup {
    fn prepare(
        channel: &Channel,
        info: MethodInfo,
        metadata: MetadataMap,
        options: CallOptions,
    ) -> CallSetup {
        let ctx = &channel.inner.ctx;
        let config = channel.inner.config_rx.borrow().clone();
        let method_config = config
            .config
            .as_ref()
            .and_then(|c| c.method_config(&info.service, &info.method))
            .cloned()
            .unwrap_or_default();

        // The effective deadline is the tighter of the caller's and the
        // method config's.
        let config_deadline = method_config.timeout.map(|t| Instant::now() + t);
        let deadline = match (options.deadline, config_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        CallSetup {
            info,
            deadline,
            wait_for_ready: options
                .wait_for_ready
                .or(method_config.wait_for_ready)
                .unwrap_or(false),
            compression: options.compression.or(ctx.options.send_compression),
            accept: ctx.options.accept_compression,
            max_send_message_size: min_limit(
                ctx.options.max_send_message_size,
                method_config.max_request_message_bytes,
            ),
            max_recv_message_size: min_limit(
                ctx.options.max_recv_message_size,
                method_config.max_response_message_bytes,
            ),
            retry_policy: method_config.retry_policy.clone(),
            throttler: config.throttler.clone(),
            metadata,
            credentials: options.credentials.clone(),
            user_agent: ctx
                .options
                .user_agent
                .clone()
                .map(|ua| format!("{ua} roam/{}", env!("CARGO_PKG_VERSION")))
                .unwrap_or_else(|| format!("roam/{}", env!("CARGO_PKG_VERSION"))),
        }
    }
}

fn min_limit(a: Option<usize>, b: Option<usize>) -> Option<usize> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Keeps the channel's active-call count (and idle clock) honest.
struct CallGuard {
    ctx: Arc<ChannelCtx>,
}

impl CallGuard {
    fn new(ctx: &Arc<ChannelCtx>) -> Self {
        ctx.active_calls.fetch_add(1, Ordering::Relaxed);
        *ctx.last_activity.lock() = Instant::now();
        CallGuard { ctx: ctx.clone() }
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.ctx.active_calls.fetch_sub(1, Ordering::Relaxed);
        *self.ctx.last_activity.lock() = Instant::now();
    }
}

/// A call attached to a transport stream.
struct Attached {
    send: SendHalf,
    response: crate::transport::http2::client::ResponseHandle,
    on_complete: Option<Box<dyn FnOnce(&Status) + Send + Sync>>,
}

impl Channel {
    /// Performs a unary RPC: one request message, one response message.
    pub async fn unary<C: Codec>(
        &self,
        path: &str,
        request: Request<C::Encode>,
        mut codec: C,
    ) -> Result<Response<C::Decode>, Status> {
        let info = MethodInfo::parse(path)?;
        let _guard = CallGuard::new(&self.inner.ctx);

        let (metadata, extensions, options, message) = request.into_parts();
        let mut encoder = codec.encoder();
        let payload = encode_plain(&mut encoder, message)?;
        let raw_request = Request::from_parts(metadata, extensions, options, payload);

        let chain = self.inner.ctx.options.unary_interceptors.clone();
        let channel = self.clone();
        let terminal_info = info.clone();
        let terminal = move |req: Request<Bytes>| -> BoxFuture<'static, Result<Response<Bytes>, Status>> {
            let channel = channel.clone();
            let info = terminal_info.clone();
            Box::pin(async move { channel.unary_raw(info, req).await })
        };
        let next = ClientUnaryNext::new(&chain, &info, &terminal);
        let response = next.run(raw_request).await?;

        let (metadata, extensions, payload) = response.into_parts();
        let mut decoder = codec.decoder();
        let message = decode_plain(&mut decoder, payload)?;
        Ok(Response::from_parts(metadata, extensions, message))
    }

    /// Performs a client-streaming RPC: a request message stream, one
    /// response message.
    pub async fn client_streaming<C, S>(
        &self,
        path: &str,
        request: Request<S>,
        codec: C,
    ) -> Result<Response<C::Decode>, Status>
    where
        C: Codec,
        S: Stream<Item = C::Encode> + Send + 'static,
    {
        let response = self.streaming(path, request, codec).await?;
        let (mut metadata, extensions, mut stream) = response.into_parts();
        let message = stream
            .message()
            .await?
            .ok_or_else(|| Status::internal("missing response message"))?;
        if let Some(trailers) = stream.trailers().await? {
            metadata.merge(trailers);
        }
        Ok(Response::from_parts(metadata, extensions, message))
    }

    /// Performs a server-streaming RPC: one request message, a response
    /// message stream.
    pub async fn server_streaming<C: Codec>(
        &self,
        path: &str,
        request: Request<C::Encode>,
        codec: C,
    ) -> Result<Response<Streaming<C::Decode>>, Status> {
        self.streaming(
            path,
            request.map(|message| stream::once(future::ready(message))),
            codec,
        )
        .await
    }

    /// Performs a bidirectional-streaming RPC.
    pub async fn streaming<C, S>(
        &self,
        path: &str,
        request: Request<S>,
        mut codec: C,
    ) -> Result<Response<Streaming<C::Decode>>, Status>
    where
        C: Codec,
        S: Stream<Item = C::Encode> + Send + 'static,
    {
        let info = MethodInfo::parse(path)?;
        let guard = CallGuard::new(&self.inner.ctx);
        let (metadata, extensions, options, message_stream) = request.into_parts();

        // The stream interceptor chain runs around call establishment;
        // the terminal parks the attached stream in `slot`.
        let slot: Arc<Mutex<Option<(Attached, CallSetup)>>> = Arc::new(Mutex::new(None));
        let chain = self.inner.ctx.options.stream_interceptors.clone();
        let channel = self.clone();
        let terminal_info = info.clone();
        let terminal = {
            let slot = slot.clone();
            move |req: Request<()>| -> BoxFuture<'static, Result<(), Status>> {
                let slot = slot.clone();
                let channel = channel.clone();
                let info = terminal_info.clone();
                Box::pin(async move {
                    let (metadata, _extensions, options, ()) = req.into_parts();
                    let setup = CallSetup::prepare(&channel, info, metadata, options);
                    let attached = attach(&channel.inner, &setup).await?;
                    *slot.lock() = Some((attached, setup));
                    Ok(())
                })
            }
        };
        let establishment = Request::from_parts(metadata, extensions, options, ());
        ClientStreamNext::new(&chain, &info, &terminal)
            .run(establishment)
            .await?;
        let (attached, setup) = slot
            .lock()
            .take()
            .ok_or_else(|| Status::internal("interceptor chain completed without attaching"))?;
        let Attached {
            send,
            response,
            on_complete,
        } = attached;

        spawn_sender(
            send,
            message_stream,
            codec.encoder(),
            setup.compression,
            setup.max_send_message_size,
            setup.deadline,
        );

        let headers = response.into_response();
        let (parts, recv) = match setup.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, headers)
                .await
                .map_err(|_| Status::deadline_exceeded("deadline exceeded"))??,
            None => headers.await?,
        };

        // Trailers-Only: the status arrived on the header frame.
        let trailers_only = parts.headers.contains_key(crate::status::GRPC_STATUS_HEADER);
        if trailers_only {
            if let Some(status) = Status::from_header_map(&parts.headers) {
                if status.code() != Code::Ok {
                    return Err(status);
                }
            }
        }

        let encoding = response_encoding(&parts.headers, setup.accept);
        let mut streaming = if trailers_only {
            // Zero response messages; the trailer data is already here.
            Streaming::new(
                codec.decoder(),
                TrailersOnlySource {
                    trailers: Some(parts.headers.clone()),
                },
                StreamDirection::Response,
                None,
                setup.max_recv_message_size,
            )
        } else {
            Streaming::new(
                codec.decoder(),
                recv,
                StreamDirection::Response,
                encoding,
                setup.max_recv_message_size,
            )
        };
        streaming.set_deadline(setup.deadline);
        streaming.set_completion(Box::new(move |status: &Status| {
            if let Some(on_complete) = on_complete {
                on_complete(status);
            }
            drop(guard);
        }));

        Ok(Response::from_parts(
            response_metadata(parts.headers),
            Extensions::new(),
            streaming,
        ))
    }

    /// The unary exchange under the interceptor chain: attach (with
    /// retries), send, receive, finalize.
    async fn unary_raw(
        &self,
        info: MethodInfo,
        request: Request<Bytes>,
    ) -> Result<Response<Bytes>, Status> {
        let (metadata, _extensions, options, payload) = request.into_parts();
        let setup = CallSetup::prepare(self, info, metadata, options);

        let mut attempt = 0u32;
        let mut next_backoff = setup
            .retry_policy
            .as_ref()
            .map(|p| p.initial_backoff)
            .unwrap_or_default();
        loop {
            attempt += 1;
            let mut received_headers = false;
            let result = self
                .unary_attempt(&setup, payload.clone(), &mut received_headers)
                .await;

            let status = match result {
                Ok(response) => {
                    if let Some(throttler) = &setup.throttler {
                        throttler.on_success();
                    }
                    return Ok(response);
                }
                Err(status) => status,
            };

            let Some(policy) = &setup.retry_policy else {
                return Err(status);
            };
            if !policy.retryable_status_codes.contains(&status.code()) {
                return Err(status);
            }
            if let Some(throttler) = &setup.throttler {
                if !throttler.on_failure() {
                    debug!("retries throttled");
                    return Err(status);
                }
            }
            // A committed attempt (response under way) is never retried.
            if received_headers || attempt >= policy.max_attempts {
                return Err(status);
            }

            let delay = rand::thread_rng().gen_range(Duration::ZERO..=next_backoff);
            next_backoff = Duration::from_secs_f64(
                (next_backoff.as_secs_f64() * policy.backoff_multiplier)
                    .min(policy.max_backoff.as_secs_f64()),
            );
            if let Some(deadline) = setup.deadline {
                if Instant::now() + delay >= deadline {
                    return Err(status);
                }
            }
            trace!(
                "retrying {} (attempt {}) after {:?}: {}",
                setup.info.path,
                attempt,
                delay,
                status
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn unary_attempt(
        &self,
        setup: &CallSetup,
        payload: Bytes,
        received_headers: &mut bool,
    ) -> Result<Response<Bytes>, Status> {
        let Attached {
            mut send,
            response,
            on_complete,
        } = attach(&self.inner, setup).await?;

        let mut buf = BytesMut::new();
        let mut scratch = BytesMut::new();
        let framed = encode_message(
            &mut IdentityEncoder,
            payload,
            setup.compression,
            SingleMessageCompressionOverride::Inherit,
            setup.max_send_message_size,
            &mut buf,
            &mut scratch,
        )?;

        let exchange = async {
            send.send_message(framed, true).await?;

            let (parts, recv) = response.into_response().await?;

            if parts.headers.contains_key(crate::status::GRPC_STATUS_HEADER) {
                // Trailers-Only response: nothing was delivered, so the
                // attempt stays retryable.
                if let Some(status) = Status::from_header_map(&parts.headers) {
                    if status.code() != Code::Ok {
                        return Err(status);
                    }
                }
                return Err(Status::internal("missing response message"));
            }
            *received_headers = true;

            let encoding = response_encoding(&parts.headers, setup.accept);
            let mut streaming = Streaming::<Bytes>::new(
                IdentityDecoder,
                recv,
                StreamDirection::Response,
                encoding,
                setup.max_recv_message_size,
            );
            let message = streaming
                .message()
                .await?
                .ok_or_else(|| Status::internal("missing response message"))?;

            let mut metadata = response_metadata(parts.headers);
            if let Some(trailers) = streaming.trailers().await? {
                metadata.merge(trailers);
            }
            Ok(Response::from_parts(metadata, Extensions::new(), message))
        };

        let result = match setup.deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, exchange).await {
                Ok(result) => result,
                Err(_elapsed) => Err(Status::deadline_exceeded("deadline exceeded")),
            },
            None => exchange.await,
        };

        if let Some(on_complete) = on_complete {
            match &result {
                Ok(_) => on_complete(&Status::ok()),
                Err(status) => on_complete(status),
            }
        }
        result
    }
}

/// Runs the picker loop until the call is attached to a transport
/// stream. Queued picks wait for the next picker publication, bounded by
/// the deadline; refused streams re-enter the loop transparently.
async fn attach(channel: &Arc<ChannelInner>, setup: &CallSetup) -> Result<Attached, Status> {
    let mut picker_rx = channel.picker_rx.clone();
    if *channel.connectivity_rx.borrow() == ConnectivityState::Idle {
        let _ = channel.ctx.work_tx.send(WorkItem::Connect);
    }

    let pick_info = PickInfo {
        path: setup.info.path.clone(),
        wait_for_ready: setup.wait_for_ready,
    };

    loop {
        let snapshot: PickerSnapshot = picker_rx.borrow_and_update().clone();
        if snapshot.state == ConnectivityState::Shutdown {
            return Err(Status::cancelled("channel is shut down"));
        }
        if snapshot.state == ConnectivityState::Idle {
            // A pending call drives the channel (and its policy) out of
            // idle.
            let _ = channel.ctx.work_tx.send(WorkItem::Connect);
        }
        let Some(picker) = snapshot.picker.clone() else {
            wait_for_picker(&mut picker_rx, setup.deadline).await?;
            continue;
        };

        match picker.pick(&pick_info) {
            PickResult::Pick(pick) => {
                let subchannel = pick
                    .subchannel
                    .as_any()
                    .downcast_ref::<SubchannelHandle>()
                    .map(|h| h.inner.clone());
                let transport = subchannel.as_ref().and_then(|sc| sc.transport());
                let (Some(subchannel), Some(transport)) = (subchannel, transport) else {
                    // The picker is stale: its subchannel already lost
                    // the transport.
                    wait_for_picker(&mut picker_rx, setup.deadline).await?;
                    continue;
                };

                let authority = subchannel.authority().to_string();
                let secure = transport.auth_info().security_level
                    == crate::credentials::SecurityLevel::PrivacyAndIntegrity;

                let credentials_metadata = match &setup.credentials {
                    Some(credentials) => {
                        check_per_rpc_security(credentials.as_ref(), transport.auth_info())?;
                        let uri = format!(
                            "{}://{}{}",
                            if secure { "https" } else { "http" },
                            authority,
                            setup.info.path
                        );
                        credentials.get_request_metadata(&uri).await?
                    }
                    None => MetadataMap::new(),
                };

                let request =
                    build_http_request(setup, &authority, secure, &pick.metadata, credentials_metadata)?;
                match attach_stream(&transport, request).await {
                    Ok((send, response)) => {
                        return Ok(Attached {
                            send,
                            response,
                            on_complete: pick.on_complete,
                        })
                    }
                    Err(status) => {
                        // The request never left: safe to retry on the
                        // next picker.
                        trace!("stream attach refused: {}", status);
                        wait_for_picker(&mut picker_rx, setup.deadline).await?;
                    }
                }
            }
            PickResult::Queue => wait_for_picker(&mut picker_rx, setup.deadline).await?,
            PickResult::Fail(status) => {
                if setup.wait_for_ready {
                    wait_for_picker(&mut picker_rx, setup.deadline).await?;
                } else {
                    return Err(launder_control_plane_status(status));
                }
            }
            PickResult::Drop(status) => return Err(launder_control_plane_status(status)),
        }
    }
}

async fn attach_stream(
    transport: &Arc<ClientTransport>,
    request: http::Request<()>,
) -> Result<(SendHalf, crate::transport::http2::client::ResponseHandle), Status> {
    transport
        .new_stream(request)
        .await
        .map_err(|e| e.into_status())
}

async fn wait_for_picker(
    picker_rx: &mut tokio::sync::watch::Receiver<PickerSnapshot>,
    deadline: Option<Instant>,
) -> Result<(), Status> {
    let changed = picker_rx.changed();
    let result = match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, changed)
            .await
            .map_err(|_| {
                Status::deadline_exceeded("deadline exceeded while waiting for connection")
            })?,
        None => changed.await,
    };
    result.map_err(|_| Status::cancelled("channel is shut down"))
}

/// Assembles the HEADERS frame content for a call.
fn build_http_request(
    setup: &CallSetup,
    authority: &str,
    secure: bool,
    picker_metadata: &MetadataMap,
    credentials_metadata: MetadataMap,
) -> Result<http::Request<()>, Status> {
    let scheme = if secure { "https" } else { "http" };
    let uri = format!("{scheme}://{authority}{}", setup.info.path);
    let mut request = http::Request::builder()
        .method(http::Method::POST)
        .uri(&uri)
        .version(http::Version::HTTP_2)
        .body(())
        .map_err(|e| Status::internal(format!("invalid request for {uri}: {e}")))?;

    let headers = request.headers_mut();
    headers.insert(http::header::TE, http::HeaderValue::from_static("trailers"));
    headers.insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/grpc"),
    );
    if let Ok(user_agent) = http::HeaderValue::from_str(&setup.user_agent) {
        headers.insert(http::header::USER_AGENT, user_agent);
    }
    if let Some(deadline) = setup.deadline {
        let remaining = deadline.saturating_duration_since(Instant::now());
        headers.insert(GRPC_TIMEOUT_HEADER, encode_timeout(remaining));
    }
    if let Some(compression) = setup.compression {
        headers.insert(ENCODING_HEADER, compression.into_header_value());
    }
    if let Some(accept) = setup.accept.into_accept_encoding_header_value() {
        headers.insert(ACCEPT_ENCODING_HEADER, accept);
    }

    // Picker metadata first, then call credentials, then application
    // metadata; reserved names never come from the application.
    for (name, value) in picker_metadata.clone().into_headers() {
        if let Some(name) = name {
            headers.append(name, value);
        }
    }
    append_all(headers, credentials_metadata.into_sanitized_headers());
    append_all(headers, setup.metadata.clone().into_sanitized_headers());

    Ok(request)
}

fn append_all(headers: &mut HeaderMap, from: HeaderMap) {
    let mut last_name = None;
    for (name, value) in from {
        let name = name.or_else(|| last_name.clone());
        if let Some(name) = name {
            last_name = Some(name.clone());
            headers.append(name, value);
        }
    }
}

/// Initial response headers, minus the transport-level entries.
fn response_metadata(mut headers: HeaderMap) -> MetadataMap {
    headers.remove(http::header::CONTENT_TYPE);
    headers.remove(ENCODING_HEADER);
    headers.remove(ACCEPT_ENCODING_HEADER);
    MetadataMap::from_headers(headers)
}

fn spawn_sender<T, E>(
    mut send: SendHalf,
    source: impl Stream<Item = T> + Send + 'static,
    mut encoder: E,
    compression: Option<CompressionEncoding>,
    max_send_message_size: Option<usize>,
    deadline: Option<Instant>,
) where
    T: Send + 'static,
    E: Encoder<Item = T, Error = Status> + Send + 'static,
{
    tokio::spawn(async move {
        futures_util::pin_mut!(source);
        let mut buf = BytesMut::new();
        let mut scratch = BytesMut::new();
        loop {
            let item = tokio::select! {
                item = source.next() => item,
                _ = sleep_until_or_forever(deadline) => {
                    send.send_reset(h2::Reason::CANCEL);
                    return;
                }
            };
            match item {
                Some(item) => {
                    let framed = match encode_message(
                        &mut encoder,
                        item,
                        compression,
                        SingleMessageCompressionOverride::Inherit,
                        max_send_message_size,
                        &mut buf,
                        &mut scratch,
                    ) {
                        Ok(framed) => framed,
                        Err(status) => {
                            debug!("error encoding outbound message: {}", status);
                            send.send_reset(h2::Reason::INTERNAL_ERROR);
                            return;
                        }
                    };
                    if send.send_message(framed, false).await.is_err() {
                        return;
                    }
                }
                None => {
                    let _ = send.close();
                    return;
                }
            }
        }
    });
}

async fn sleep_until_or_forever(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Passes already-encoded message bytes through the framing layer.
struct IdentityEncoder;

impl Encoder for IdentityEncoder {
    type Item = Bytes;
    type Error = Status;

    fn encode(&mut self, item: Bytes, dst: &mut EncodeBuf<'_>) -> Result<(), Status> {
        dst.put_slice(&item);
        Ok(())
    }
}

/// Yields the raw (decompressed) message bytes of each frame.
struct IdentityDecoder;

impl Decoder for IdentityDecoder {
    type Item = Bytes;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Bytes>, Status> {
        Ok(Some(src.copy_to_bytes(src.remaining())))
    }
}

/// A data source for Trailers-Only responses: no data, the headers frame
/// doubles as the trailer frame.
struct TrailersOnlySource {
    trailers: Option<HeaderMap>,
}

impl DataSource for TrailersOnlySource {
    fn poll_data(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Result<Bytes, Status>>> {
        std::task::Poll::Ready(None)
    }

    fn poll_trailers(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<Option<HeaderMap>, Status>> {
        std::task::Poll::Ready(Ok(self.trailers.take()))
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
