//! A general-purpose RPC framework over HTTP/2.
//!
//! `roam` transports typed request/response messages as HTTP/2 streams
//! and offers the four RPC shapes (unary, client-streaming,
//! server-streaming, bidirectional) with per-call deadlines,
//! cancellation, custom metadata, pluggable transport security, pluggable
//! message encoding and compression, and client-side routing across a
//! dynamic set of backends.
//!
//! # Getting started
//!
//! On the client, a [`Channel`] is a virtual connection to a target name.
//! The target's scheme selects a name resolver (`dns`, `unix`,
//! `passthrough`, ...), whose address updates feed a load-balancing
//! policy (`pick_first` by default) that maintains connections and routes
//! each call:
//!
//! ```no_run
//! # async fn example() -> Result<(), roam::Error> {
//! use roam::{Channel, ChannelOptions, Request};
//!
//! let channel = Channel::new("dns:///echo.example.com:443", None, ChannelOptions::default())?;
//! # Ok(())
//! # }
//! ```
//!
//! On the server, methods are registered dynamically under
//! `/Service/Method` paths and dispatched per inbound HTTP/2 stream; see
//! [`server::Service`].
//!
//! Pluggability is pervasive: resolvers, load balancers, codecs,
//! compressors and transport credentials all register into process-wide
//! registries consulted at channel and server construction.

#![warn(missing_debug_implementations, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod attributes;
pub mod client;
pub mod codec;
pub mod context;
pub mod credentials;
mod extensions;
pub mod inmemory;
pub mod interceptor;
pub mod metadata;
mod request;
mod response;
pub mod server;
pub mod service_config;
mod status;
pub mod transport;

pub use async_trait::async_trait;
pub use client::{Channel, ChannelOptions, ConnectivityState};
pub use codec::Streaming;
pub use extensions::Extensions;
pub use interceptor::MethodInfo;
pub use request::Request;
pub use response::Response;
pub use server::{Server, Service};
pub use service_config::ServiceConfig;
pub use status::{Code, Status};

/// A boxed error, used on fallible non-RPC paths (connection
/// establishment, configuration).
pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;
