//! The server: listeners, per-connection transports and method dispatch.
//!
//! Handlers receive the peer's metadata on the [`Request`] and can read
//! the call's [`CallContext`] (deadline and cancellation) from the
//! request extensions.
//!
//! [`Request`]: crate::Request
//! [`CallContext`]: crate::context::CallContext

pub(crate) mod service;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_core::Stream;
use futures_util::StreamExt;
use http::HeaderMap;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::codec::{CompressionEncoding, EnabledCompressionEncodings};
use crate::context::{self, DoneReason};
use crate::credentials::{InsecureCredentials, Io, TransportCredentials};
use crate::interceptor::{MethodInfo, ServerStreamInterceptor, ServerUnaryInterceptor};
use crate::metadata::timeout::try_parse_timeout;
use crate::metadata::{MetadataMap, GRPC_TIMEOUT_HEADER};
use crate::transport::http2::server::{serve_connection, InboundHandler, ServerStream};
use crate::transport::{Http2Settings, KeepaliveEnforcement};
use crate::Status;

pub use service::{ResponseStream, Service};

/// The `:authority` a call was addressed to; available to handlers via
/// the request extensions.
#[derive(Debug, Clone)]
pub struct CallAuthority(pub String);

use self::service::{finish_with_status, MethodHandler, ServerCall};

/// Shared per-server settings consulted by the method drivers.
pub(crate) struct ServerConfig {
    pub(crate) accept_compression: EnabledCompressionEncodings,
    pub(crate) send_compression: EnabledCompressionEncodings,
    pub(crate) max_recv_message_size: Option<usize>,
    pub(crate) max_send_message_size: Option<usize>,
    pub(crate) unary_interceptors: Vec<Arc<dyn ServerUnaryInterceptor>>,
    pub(crate) stream_interceptors: Vec<Arc<dyn ServerStreamInterceptor>>,
}

/// Configures and builds a [`Server`].
pub struct ServerBuilder {
    http2: Http2Settings,
    keepalive_enforcement: KeepaliveEnforcement,
    credentials: Option<Arc<dyn TransportCredentials>>,
    accept_compression: EnabledCompressionEncodings,
    send_compression: EnabledCompressionEncodings,
    max_recv_message_size: Option<usize>,
    max_send_message_size: Option<usize>,
    unary_interceptors: Vec<Arc<dyn ServerUnaryInterceptor>>,
    stream_interceptors: Vec<Arc<dyn ServerStreamInterceptor>>,
    methods: HashMap<String, Arc<MethodHandler>>,
}

impl ServerBuilder {
    /// Registers every method of `service`. Methods are dispatched by
    /// `/<service>/<method>`, case-sensitively.
    pub fn add_service(mut self, service: Service) -> Self {
        debug!("registering service {}", service.name());
        for (path, handler) in service.into_methods() {
            self.methods.insert(path, handler);
        }
        self
    }

    /// Applies transport settings to every accepted connection.
    pub fn http2_settings(mut self, settings: Http2Settings) -> Self {
        self.http2 = settings;
        self
    }

    /// Policy on client keepalive pings. Accounting below what the
    /// framing layer exposes is enforced by it.
    pub fn keepalive_enforcement(mut self, policy: KeepaliveEnforcement) -> Self {
        self.keepalive_enforcement = policy;
        self
    }

    /// Transport security for accepted connections; plaintext when
    /// unset.
    pub fn credentials(mut self, credentials: Arc<dyn TransportCredentials>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Accepts request messages compressed with `encoding`.
    pub fn accept_compression(mut self, encoding: CompressionEncoding) -> Self {
        self.accept_compression.enable(encoding);
        self
    }

    /// Allows responses to be compressed with `encoding` when the client
    /// accepts it.
    pub fn send_compression(mut self, encoding: CompressionEncoding) -> Self {
        self.send_compression.enable(encoding);
        self
    }

    pub fn max_recv_message_size(mut self, limit: usize) -> Self {
        self.max_recv_message_size = Some(limit);
        self
    }

    pub fn max_send_message_size(mut self, limit: usize) -> Self {
        self.max_send_message_size = Some(limit);
        self
    }

    /// Adds a unary interceptor; interceptors run outermost-first in
    /// registration order.
    pub fn unary_interceptor(mut self, interceptor: Arc<dyn ServerUnaryInterceptor>) -> Self {
        self.unary_interceptors.push(interceptor);
        self
    }

    /// Adds a streaming interceptor; interceptors run outermost-first in
    /// registration order.
    pub fn stream_interceptor(mut self, interceptor: Arc<dyn ServerStreamInterceptor>) -> Self {
        self.stream_interceptors.push(interceptor);
        self
    }

    pub fn build(self) -> Server {
        let (shutdown_tx, _) = watch::channel(false);
        Server {
            dispatcher: Arc::new(Dispatcher {
                methods: self.methods,
                config: Arc::new(ServerConfig {
                    accept_compression: self.accept_compression,
                    send_compression: self.send_compression,
                    max_recv_message_size: self.max_recv_message_size,
                    max_send_message_size: self.max_send_message_size,
                    unary_interceptors: self.unary_interceptors,
                    stream_interceptors: self.stream_interceptors,
                }),
            }),
            http2: self.http2,
            keepalive_enforcement: self.keepalive_enforcement,
            credentials: self
                .credentials
                .unwrap_or_else(|| Arc::new(InsecureCredentials) as Arc<_>),
            shutdown: shutdown_tx,
        }
    }
}

/// An RPC server: accepts connections, dispatches inbound streams to
/// registered method handlers.
#[derive(Clone)]
pub struct Server {
    dispatcher: Arc<Dispatcher>,
    http2: Http2Settings,
    #[allow(dead_code)]
    keepalive_enforcement: KeepaliveEnforcement,
    credentials: Arc<dyn TransportCredentials>,
    shutdown: watch::Sender<bool>,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder {
            http2: Http2Settings::default(),
            keepalive_enforcement: KeepaliveEnforcement::default(),
            credentials: None,
            accept_compression: EnabledCompressionEncodings::default(),
            send_compression: EnabledCompressionEncodings::default(),
            max_recv_message_size: None,
            max_send_message_size: None,
            unary_interceptors: Vec::new(),
            stream_interceptors: Vec::new(),
            methods: HashMap::new(),
        }
    }

    /// Serves connections accepted from `listener` until [`shutdown`] is
    /// called.
    ///
    /// [`shutdown`]: Server::shutdown
    pub async fn serve(&self, listener: tokio::net::TcpListener) -> Result<(), crate::Error> {
        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        debug!("accepted connection from {}", peer);
                        let _ = socket.set_nodelay(true);
                        let server = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = server.serve_connection(socket).await {
                                debug!("connection from {} ended with error: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        warn!("accept failed: {}", e);
                    }
                },
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Serves connections produced by `incoming`; useful for custom
    /// listeners and in-process transports.
    pub async fn serve_with_incoming<I, IO>(&self, incoming: I) -> Result<(), crate::Error>
    where
        I: Stream<Item = Result<IO, crate::Error>> + Send,
        IO: Io + 'static,
    {
        let mut shutdown_rx = self.shutdown.subscribe();
        futures_util::pin_mut!(incoming);
        loop {
            tokio::select! {
                accepted = incoming.next() => match accepted {
                    Some(Ok(io)) => {
                        let server = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = server.serve_connection(io).await {
                                debug!("connection ended with error: {}", e);
                            }
                        });
                    }
                    Some(Err(e)) => warn!("incoming stream error: {}", e),
                    None => return Ok(()),
                },
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Serves a single established connection to completion.
    pub async fn serve_connection<IO>(&self, io: IO) -> Result<(), crate::Error>
    where
        IO: Io + 'static,
    {
        let (io, auth_info) = self.credentials.server_handshake(Box::new(io)).await?;
        serve_connection(
            io,
            self.http2.clone(),
            auth_info,
            self.dispatcher.clone(),
            self.shutdown.subscribe(),
        )
        .await
    }

    /// Begins graceful shutdown: listeners stop accepting and every
    /// connection sends GOAWAY, letting in-flight streams finish.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Routes accepted streams to registered methods.
struct Dispatcher {
    methods: HashMap<String, Arc<MethodHandler>>,
    config: Arc<ServerConfig>,
}

#[async_trait]
impl InboundHandler for Dispatcher {
    async fn handle_stream(self: Arc<Self>, mut stream: ServerStream) {
        let path = stream.path().to_string();

        if *stream.method() != http::Method::POST {
            let message = format!("invalid method {}", stream.method());
            finish_with_status(&mut stream, None, &Status::internal(message));
            return;
        }
        let content_type_ok = stream
            .headers()
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| {
                ct == "application/grpc"
                    || ct.starts_with("application/grpc+")
                    || ct.starts_with("application/grpc;")
            })
            .unwrap_or(false);
        if !content_type_ok {
            finish_with_status(
                &mut stream,
                None,
                &Status::internal("invalid content-type"),
            );
            return;
        }

        let info = match MethodInfo::parse(&path) {
            Ok(info) => info,
            Err(_) => {
                finish_with_status(
                    &mut stream,
                    None,
                    &Status::unimplemented(format!("malformed method path {path:?}")),
                );
                return;
            }
        };
        let Some(handler) = self.methods.get(&path).cloned() else {
            finish_with_status(
                &mut stream,
                None,
                &Status::unimplemented(format!("unknown method {path:?}")),
            );
            return;
        };

        // Request-compression negotiation: unsupported encodings are
        // rejected with our accept list attached.
        let request_encoding = match CompressionEncoding::from_encoding_header(
            stream.headers(),
            self.config.accept_compression,
        ) {
            Ok(encoding) => encoding,
            Err(status) => {
                finish_with_status(&mut stream, None, &status);
                return;
            }
        };
        let response_encoding = CompressionEncoding::from_accept_encoding_header(
            stream.headers(),
            self.config.send_compression,
        );

        // The deadline arrives as grpc-timeout, relative to now.
        let deadline = stream
            .headers()
            .get(GRPC_TIMEOUT_HEADER)
            .and_then(try_parse_timeout)
            .map(|timeout| tokio::time::Instant::now() + timeout);
        let (call_context, canceller) = context::with_deadline(deadline);
        stream.set_canceller(canceller.clone());
        let deadline_timer = deadline.map(|deadline| {
            let canceller = canceller.clone();
            tokio::spawn(async move {
                tokio::time::sleep_until(deadline).await;
                canceller.cancel(DoneReason::DeadlineExceeded);
            })
        });

        let metadata = request_metadata(stream.headers().clone());
        let authority = stream.authority().map(|a| a.to_string());
        let call = ServerCall {
            stream,
            context: call_context,
            canceller,
            metadata,
            info,
            authority,
            request_encoding,
            response_encoding,
            config: self.config.clone(),
        };
        handler.run(call).await;

        if let Some(timer) = deadline_timer {
            timer.abort();
        }
    }
}

/// The caller-visible request metadata: everything except the transport
/// and protocol headers.
fn request_metadata(mut headers: HeaderMap) -> MetadataMap {
    headers.remove(http::header::CONTENT_TYPE);
    headers.remove(http::header::TE);
    headers.remove(GRPC_TIMEOUT_HEADER);
    headers.remove(crate::codec::compression::ENCODING_HEADER);
    headers.remove(crate::codec::compression::ACCEPT_ENCODING_HEADER);
    MetadataMap::from_headers(headers)
}
