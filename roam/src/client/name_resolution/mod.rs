/*
 *
 * Copyright 2026 roam authors.
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to
 * deal in the Software without restriction, including without limitation the
 * rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
 * sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
 * IN THE SOFTWARE.
 *
 */

//! Name resolution: turning a target string into a stream of address
//! lists and service configuration.

pub(crate) mod dns;
mod passthrough;
mod registry;
mod unix;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use percent_encoding::{percent_encode, AsciiSet, NON_ALPHANUMERIC};
use url::Url;

use crate::attributes::Attributes;
use crate::service_config::ServiceConfig;
use crate::Status;

pub use registry::{ResolverRegistry, GLOBAL_RESOLVER_REGISTRY};

pub(crate) use passthrough::OneShotResolver;

/// Address type for plain TCP/IP addresses (`host:port`).
pub static TCP_ADDRESS_TYPE: &str = "tcp";
/// Address type for UNIX domain socket paths. Abstract-namespace names
/// carry a leading NUL byte.
pub static UNIX_ADDRESS_TYPE: &str = "unix";

/// Byte set percent-encoded when an endpoint is used as an `:authority`
/// value; everything outside pchar (minus `%`) is escaped, notably `/`.
const AUTHORITY_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~')
    .remove(b'!')
    .remove(b'$')
    .remove(b'&')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')')
    .remove(b'*')
    .remove(b'+')
    .remove(b',')
    .remove(b';')
    .remove(b'=')
    .remove(b':')
    .remove(b'@');

/// A parsed target string, `scheme://[authority]/endpoint`.
#[derive(Debug, Clone)]
pub struct Target {
    uri: Url,
}

impl Target {
    /// Parses a target. Strings without a recognized scheme should be
    /// wrapped by the caller (the channel falls back to its default
    /// scheme).
    pub fn parse(s: &str) -> Result<Target, crate::Error> {
        let uri = Url::parse(s).map_err(|e| format!("invalid target {s:?}: {e}"))?;
        Ok(Target { uri })
    }

    /// The scheme, which selects the resolver.
    pub fn scheme(&self) -> &str {
        self.uri.scheme()
    }

    /// The authority component between `//` and the path, if present.
    pub fn authority_part(&self) -> Option<&str> {
        self.uri.host_str().filter(|h| !h.is_empty())
    }

    /// The endpoint: everything after the scheme (and authority).
    pub fn endpoint(&self) -> &str {
        if self.uri.cannot_be_a_base() {
            self.uri.path()
        } else {
            self.uri.path().strip_prefix('/').unwrap_or(self.uri.path())
        }
    }

    /// The raw path component, leading slash preserved. Used by schemes
    /// (like `unix`) whose endpoint is a filesystem path.
    pub fn path(&self) -> &str {
        self.uri.path()
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uri)
    }
}

/// Percent-encodes an endpoint for use as an authority, the way
/// `passthrough` targets advertise themselves.
pub(crate) fn encode_authority(endpoint: &str) -> String {
    percent_encode(endpoint.as_bytes(), AUTHORITY_ENCODE_SET).to_string()
}

/// An address a subchannel can connect to.
#[derive(Debug, Clone, Default)]
pub struct Address {
    /// Selects the connector used to reach the address.
    pub transport_type: String,
    /// The address itself, in the connector's format.
    pub addr: String,
    /// Overrides the channel's authority when talking to this address.
    pub server_name_override: Option<String>,
    /// Data for the load balancer.
    pub attributes: Attributes,
    /// Data for the transport layer (e.g. metadata to add per call).
    pub balancer_attributes: Attributes,
}

impl Address {
    /// Identity for subchannel pooling: type and address, ignoring
    /// attributes.
    pub(crate) fn key(&self) -> (String, String) {
        (self.transport_type.clone(), self.addr.clone())
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.transport_type == other.transport_type && self.addr == other.addr
    }
}

impl Eq for Address {}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.transport_type, self.addr)
    }
}

/// One logical host, possibly reachable at several addresses.
#[derive(Debug, Clone, Default)]
pub struct Endpoint {
    pub addresses: Vec<Address>,
    pub attributes: Attributes,
}

/// The state a resolver pushes to its channel.
#[derive(Debug, Clone, Default)]
pub struct ResolverState {
    /// Flat list of resolved addresses.
    pub addresses: Vec<Address>,
    /// Optional grouping of addresses into logical endpoints; balancers
    /// that understand endpoints prefer this over `addresses`.
    pub endpoints: Option<Vec<Endpoint>>,
    /// Service config carried by the resolver, or the error encountered
    /// parsing it.
    pub service_config: Option<Result<ServiceConfig, String>>,
    /// Additional resolver data.
    pub attributes: Attributes,
}

impl ResolverState {
    /// The endpoint view of this state: explicit endpoints if present,
    /// otherwise one endpoint per address.
    pub fn effective_endpoints(&self) -> Vec<Endpoint> {
        match &self.endpoints {
            Some(endpoints) => endpoints.clone(),
            None => self
                .addresses
                .iter()
                .map(|address| Endpoint {
                    addresses: vec![address.clone()],
                    attributes: Attributes::new(),
                })
                .collect(),
        }
    }
}

/// Operations a resolver may perform on the channel that built it.
/// Updates are serialized by the channel's work serializer.
#[async_trait]
pub trait ChannelController: Send + Sync {
    /// Delivers a new resolver state. An error return tells the resolver
    /// the state was rejected (e.g. by the balancer) and it should
    /// re-resolve with backoff.
    async fn update(&self, state: ResolverState) -> Result<(), String>;

    /// Reports a resolution failure. The channel fails fast only when no
    /// previously usable state exists.
    fn report_error(&self, error: Status);

    /// Parses a service config JSON document with the channel's parser.
    fn parse_service_config(&self, json: &str) -> Result<ServiceConfig, String>;
}

/// A built resolver instance. Dropping it releases all resolution
/// resources.
pub trait Resolver: Send {
    /// Hint to re-resolve now, e.g. after connection failures. Resolvers
    /// throttle these.
    fn resolve_now(&mut self);
}

/// Data handed to a [`ResolverBuilder`].
pub struct ResolverOptions {
    /// The authority the channel will use by default.
    pub authority: String,
    /// The channel half the resolver pushes updates into.
    pub controller: Arc<dyn ChannelController>,
}

/// A factory producing resolvers for one URI scheme.
pub trait ResolverBuilder: Send + Sync {
    /// The scheme this builder handles, e.g. `dns`.
    fn scheme(&self) -> &'static str;

    /// Builds a resolver for `target`. Must not fail: a misconfigured
    /// target yields a resolver that reports an error.
    fn build(&self, target: &Target, options: ResolverOptions) -> Box<dyn Resolver>;

    /// The authority used for channels with this scheme unless
    /// overridden: by default the endpoint, verbatim.
    fn default_authority(&self, target: &Target) -> String {
        target.endpoint().to_string()
    }
}
