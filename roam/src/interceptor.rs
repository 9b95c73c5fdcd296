//! Interceptors: middleware composed around calls on both client and
//! server.
//!
//! Chains compose outermost-first: the first interceptor configured sees
//! the call first. The continuation (`Next`) is consumed by value, so an
//! interceptor cannot invoke the rest of the chain twice.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::BoxFuture;

use crate::metadata::MetadataMap;
use crate::{Request, Response, Status};

/// Identifies the method a call targets.
#[derive(Debug, Clone)]
pub struct MethodInfo {
    /// Full path, `/Service/Method`.
    pub path: String,
    /// The fully qualified service name.
    pub service: String,
    /// The bare method name.
    pub method: String,
}

impl MethodInfo {
    pub(crate) fn parse(path: &str) -> Result<MethodInfo, Status> {
        let mut parts = path
            .strip_prefix('/')
            .ok_or_else(|| Status::invalid_argument(format!("malformed method path {path:?}")))?
            .splitn(2, '/');
        let service = parts.next().unwrap_or_default();
        let method = parts.next().unwrap_or_default();
        if service.is_empty() || method.is_empty() {
            return Err(Status::invalid_argument(format!(
                "malformed method path {path:?}"
            )));
        }
        Ok(MethodInfo {
            path: path.to_string(),
            service: service.to_string(),
            method: method.to_string(),
        })
    }
}

/// A client interceptor around unary calls. Sees the serialized request
/// message and the complete response (including trailers merged into its
/// metadata); retries run inside `next`.
#[async_trait]
pub trait ClientUnaryInterceptor: Send + Sync {
    async fn call(
        &self,
        request: Request<Bytes>,
        info: &MethodInfo,
        next: ClientUnaryNext<'_>,
    ) -> Result<Response<Bytes>, Status>;
}

/// The rest of a client unary chain.
pub struct ClientUnaryNext<'a> {
    chain: &'a [Arc<dyn ClientUnaryInterceptor>],
    info: &'a MethodInfo,
    terminal: &'a (dyn Fn(Request<Bytes>) -> BoxFuture<'static, Result<Response<Bytes>, Status>>
             + Send
             + Sync),
}

impl<'a> ClientUnaryNext<'a> {
    pub(crate) fn new(
        chain: &'a [Arc<dyn ClientUnaryInterceptor>],
        info: &'a MethodInfo,
        terminal: &'a (dyn Fn(Request<Bytes>) -> BoxFuture<'static, Result<Response<Bytes>, Status>>
                 + Send
                 + Sync),
    ) -> Self {
        ClientUnaryNext {
            chain,
            info,
            terminal,
        }
    }

    /// Invokes the remainder of the chain.
    pub async fn run(mut self, request: Request<Bytes>) -> Result<Response<Bytes>, Status> {
        match self.chain.split_first() {
            Some((head, rest)) => {
                self.chain = rest;
                head.call(request, self.info, self).await
            }
            None => (self.terminal)(request).await,
        }
    }
}

/// A client interceptor around streaming call establishment. Sees the
/// request metadata and options; message flow is untouched.
#[async_trait]
pub trait ClientStreamInterceptor: Send + Sync {
    async fn call(
        &self,
        request: Request<()>,
        info: &MethodInfo,
        next: ClientStreamNext<'_>,
    ) -> Result<(), Status>;
}

/// The rest of a client streaming chain; its terminal attaches the call
/// to a transport stream.
pub struct ClientStreamNext<'a> {
    chain: &'a [Arc<dyn ClientStreamInterceptor>],
    info: &'a MethodInfo,
    terminal: &'a (dyn Fn(Request<()>) -> BoxFuture<'static, Result<(), Status>> + Send + Sync),
}

impl<'a> ClientStreamNext<'a> {
    pub(crate) fn new(
        chain: &'a [Arc<dyn ClientStreamInterceptor>],
        info: &'a MethodInfo,
        terminal: &'a (dyn Fn(Request<()>) -> BoxFuture<'static, Result<(), Status>> + Send + Sync),
    ) -> Self {
        ClientStreamNext {
            chain,
            info,
            terminal,
        }
    }

    pub async fn run(mut self, request: Request<()>) -> Result<(), Status> {
        match self.chain.split_first() {
            Some((head, rest)) => {
                self.chain = rest;
                head.call(request, self.info, self).await
            }
            None => (self.terminal)(request).await,
        }
    }
}

/// A server interceptor around unary handlers. Sees the serialized
/// request and response messages.
#[async_trait]
pub trait ServerUnaryInterceptor: Send + Sync {
    async fn call(
        &self,
        request: Request<Bytes>,
        info: &MethodInfo,
        next: ServerUnaryNext<'_>,
    ) -> Result<Response<Bytes>, Status>;
}

/// The rest of a server unary chain; its terminal decodes the request and
/// invokes the registered handler.
pub struct ServerUnaryNext<'a> {
    chain: &'a [Arc<dyn ServerUnaryInterceptor>],
    info: &'a MethodInfo,
    terminal: &'a (dyn Fn(Request<Bytes>) -> BoxFuture<'static, Result<Response<Bytes>, Status>>
             + Send
             + Sync),
}

impl<'a> ServerUnaryNext<'a> {
    pub(crate) fn new(
        chain: &'a [Arc<dyn ServerUnaryInterceptor>],
        info: &'a MethodInfo,
        terminal: &'a (dyn Fn(Request<Bytes>) -> BoxFuture<'static, Result<Response<Bytes>, Status>>
                 + Send
                 + Sync),
    ) -> Self {
        ServerUnaryNext {
            chain,
            info,
            terminal,
        }
    }

    pub async fn run(mut self, request: Request<Bytes>) -> Result<Response<Bytes>, Status> {
        match self.chain.split_first() {
            Some((head, rest)) => {
                self.chain = rest;
                head.call(request, self.info, self).await
            }
            None => (self.terminal)(request).await,
        }
    }
}

/// A server interceptor around streaming handlers. Sees the request
/// metadata and the handler's final status; `next` runs the handler.
#[async_trait]
pub trait ServerStreamInterceptor: Send + Sync {
    async fn call(
        &self,
        metadata: &MetadataMap,
        info: &MethodInfo,
        next: ServerStreamNext<'_>,
    ) -> Result<(), Status>;
}

/// The rest of a server streaming chain.
pub struct ServerStreamNext<'a> {
    chain: &'a [Arc<dyn ServerStreamInterceptor>],
    info: &'a MethodInfo,
    metadata: &'a MetadataMap,
    terminal: &'a (dyn Fn() -> BoxFuture<'static, Result<(), Status>> + Send + Sync),
}

impl<'a> ServerStreamNext<'a> {
    pub(crate) fn new(
        chain: &'a [Arc<dyn ServerStreamInterceptor>],
        info: &'a MethodInfo,
        metadata: &'a MetadataMap,
        terminal: &'a (dyn Fn() -> BoxFuture<'static, Result<(), Status>> + Send + Sync),
    ) -> Self {
        ServerStreamNext {
            chain,
            info,
            metadata,
            terminal,
        }
    }

    pub async fn run(mut self) -> Result<(), Status> {
        match self.chain.split_first() {
            Some((head, rest)) => {
                self.chain = rest;
                let metadata = self.metadata;
                let info = self.info;
                head.call(metadata, info, self).await
            }
            None => (self.terminal)().await,
        }
    }
}
