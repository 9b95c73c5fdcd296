use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::codec::CompressionEncoding;
use crate::credentials::PerRpcCredentials;
use crate::metadata::MetadataMap;
use crate::Extensions;

/// An RPC request: the message (or message stream) plus metadata and
/// per-call options.
#[derive(Debug)]
pub struct Request<T> {
    metadata: MetadataMap,
    message: T,
    extensions: Extensions,
    options: CallOptions,
}

/// Options resolved at call start, combining per-call settings with channel
/// and method-config defaults.
#[derive(Clone, Default)]
pub struct CallOptions {
    pub(crate) deadline: Option<Instant>,
    pub(crate) wait_for_ready: Option<bool>,
    pub(crate) compression: Option<CompressionEncoding>,
    pub(crate) credentials: Option<Arc<dyn PerRpcCredentials>>,
}

impl std::fmt::Debug for CallOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallOptions")
            .field("deadline", &self.deadline)
            .field("wait_for_ready", &self.wait_for_ready)
            .finish()
    }
}

impl<T> Request<T> {
    /// Create a new request with empty metadata and default options.
    pub fn new(message: T) -> Self {
        Request {
            metadata: MetadataMap::new(),
            message,
            extensions: Extensions::new(),
            options: CallOptions::default(),
        }
    }

    /// Get a reference to the message.
    pub fn get_ref(&self) -> &T {
        &self.message
    }

    /// Get a mutable reference to the message.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.message
    }

    /// Get a reference to the custom request metadata.
    pub fn metadata(&self) -> &MetadataMap {
        &self.metadata
    }

    /// Get a mutable reference to the request metadata.
    pub fn metadata_mut(&mut self) -> &mut MetadataMap {
        &mut self.metadata
    }

    /// Consumes `self`, returning the message.
    pub fn into_inner(self) -> T {
        self.message
    }

    pub fn into_parts(self) -> (MetadataMap, Extensions, CallOptions, T) {
        (self.metadata, self.extensions, self.options, self.message)
    }

    pub fn from_parts(
        metadata: MetadataMap,
        extensions: Extensions,
        options: CallOptions,
        message: T,
    ) -> Self {
        Request {
            metadata,
            message,
            extensions,
            options,
        }
    }

    /// Map the message with `f`, keeping metadata, extensions and options.
    pub fn map<F, U>(self, f: F) -> Request<U>
    where
        F: FnOnce(T) -> U,
    {
        Request {
            metadata: self.metadata,
            message: f(self.message),
            extensions: self.extensions,
            options: self.options,
        }
    }

    /// Set an absolute deadline for the call.
    pub fn set_deadline(&mut self, deadline: Instant) {
        self.options.deadline = Some(deadline);
    }

    /// Set the deadline as a timeout relative to now.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.options.deadline = Some(Instant::now() + timeout);
    }

    /// Defer failure while the channel has no connection ready, bounded only
    /// by the deadline. With no deadline set, such a call blocks
    /// indefinitely; bounding it is the caller's responsibility.
    pub fn set_wait_for_ready(&mut self, wait_for_ready: bool) {
        self.options.wait_for_ready = Some(wait_for_ready);
    }

    /// Compress request messages with `encoding`, overriding the channel
    /// default. The encoding must be enabled on the channel.
    pub fn set_compression(&mut self, encoding: CompressionEncoding) {
        self.options.compression = Some(encoding);
    }

    /// Attach call credentials, adding their metadata to this call.
    pub fn set_credentials(&mut self, credentials: Arc<dyn PerRpcCredentials>) {
        self.options.credentials = Some(credentials);
    }

    /// Get a reference to the request extensions.
    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    /// Get a mutable reference to the request extensions.
    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    pub(crate) fn options(&self) -> &CallOptions {
        &self.options
    }
}

impl<T> From<T> for Request<T> {
    fn from(message: T) -> Self {
        Request::new(message)
    }
}
