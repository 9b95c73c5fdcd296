//! The HTTP/2 transport layer: connection establishment, framing, flow
//! control, keepalive and connection lifecycle.

pub(crate) mod connect;
pub(crate) mod http2;

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::client::name_resolution::Address;
use crate::credentials::BoxIo;

/// Default HTTP/2 stream and connection window: 64 KiB - 1, the protocol
/// initial.
pub const DEFAULT_WINDOW_SIZE: u32 = 65_535;

/// Ceiling for the adaptive (BDP-estimated) receive window.
pub(crate) const MAX_WINDOW_SIZE: u32 = 16 * 1024 * 1024;

/// Highest stream identifier a client transport will allocate before it
/// drains itself and hands over to a successor connection.
pub(crate) const DEFAULT_MAX_STREAM_ID: u32 = (1 << 31) - 1;

/// Client-side keepalive configuration.
#[derive(Debug, Clone)]
pub struct KeepaliveConfig {
    /// Idle time after which a PING is sent.
    pub interval: Duration,
    /// How long to wait for the PING ack before tearing the connection
    /// down.
    pub timeout: Duration,
    /// Whether to ping while no call is in flight. When false, an idle
    /// connection sends no pings.
    pub permit_without_calls: bool,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        KeepaliveConfig {
            interval: Duration::from_secs(2 * 60 * 60),
            timeout: Duration::from_secs(20),
            permit_without_calls: false,
        }
    }
}

/// Server-side policy on client keepalive behavior.
///
/// Clients pinging more often than `min_ping_interval` are considered
/// abusive and are told to go away (`ENHANCE_YOUR_CALM`). PING-frame
/// accounting below what the framing layer exposes is delegated to it.
#[derive(Debug, Clone)]
pub struct KeepaliveEnforcement {
    /// Minimum allowed interval between client pings.
    pub min_ping_interval: Duration,
    /// Whether pings are acceptable while the client has no active calls.
    pub permit_without_calls: bool,
}

impl Default for KeepaliveEnforcement {
    fn default() -> Self {
        KeepaliveEnforcement {
            min_ping_interval: Duration::from_secs(5 * 60),
            permit_without_calls: false,
        }
    }
}

/// Knobs applied to each HTTP/2 connection.
#[derive(Debug, Clone)]
pub struct Http2Settings {
    /// Initial per-stream flow-control window. Setting this pins the
    /// window and disables BDP estimation.
    pub initial_stream_window_size: Option<u32>,
    /// Initial connection flow-control window. Setting this pins the
    /// window and disables BDP estimation.
    pub initial_connection_window_size: Option<u32>,
    /// Largest frame payload to accept.
    pub max_frame_size: Option<u32>,
    /// Largest header list to accept.
    pub max_header_list_size: Option<u32>,
    /// Server bound on concurrently open streams per connection.
    pub max_concurrent_streams: Option<u32>,
    /// Client keepalive; `None` disables pings.
    pub keepalive: Option<KeepaliveConfig>,
    /// Client cap on allocated stream ids, after which the transport
    /// drains. Tests lower this to force transport turnover.
    pub max_stream_id: u32,
}

impl Default for Http2Settings {
    fn default() -> Self {
        Http2Settings {
            initial_stream_window_size: None,
            initial_connection_window_size: None,
            max_frame_size: None,
            max_header_list_size: None,
            max_concurrent_streams: None,
            keepalive: None,
            max_stream_id: DEFAULT_MAX_STREAM_ID,
        }
    }
}

impl Http2Settings {
    /// Whether the adaptive window estimator should run: only when the
    /// user has not pinned static windows.
    pub(crate) fn adaptive_window(&self) -> bool {
        self.initial_stream_window_size.is_none() && self.initial_connection_window_size.is_none()
    }
}

/// Establishes raw byte streams to resolved addresses. One connector is
/// registered per address type (`tcp`, `unix`, ...).
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, address: &Address) -> Result<BoxIo, crate::Error>;
}

/// A registry of connectors indexed by address type.
pub struct ConnectorRegistry {
    m: Mutex<HashMap<String, Arc<dyn Connector>>>,
}

impl ConnectorRegistry {
    fn new() -> Self {
        let registry = ConnectorRegistry {
            m: Mutex::new(HashMap::new()),
        };
        registry.add(
            crate::client::name_resolution::TCP_ADDRESS_TYPE,
            connect::TcpConnector::default(),
        );
        #[cfg(unix)]
        {
            registry.add(
                crate::client::name_resolution::UNIX_ADDRESS_TYPE,
                connect::UdsConnector::default(),
            );
        }
        registry
    }

    /// Register a connector for an address type, replacing any previous
    /// one.
    pub fn add(&self, address_type: &str, connector: impl Connector + 'static) {
        self.m
            .lock()
            .insert(address_type.to_string(), Arc::new(connector));
    }

    /// Retrieve the connector for an address type.
    pub fn get(&self, address_type: &str) -> Option<Arc<dyn Connector>> {
        self.m.lock().get(address_type).cloned()
    }
}

/// The process-wide connector registry, consulted when subchannels dial.
pub static GLOBAL_CONNECTOR_REGISTRY: LazyLock<ConnectorRegistry> =
    LazyLock::new(ConnectorRegistry::new);
