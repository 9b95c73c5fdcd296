//! The client: channels, subchannels, name resolution and load
//! balancing.

pub mod backoff;
pub(crate) mod call;
pub mod channel;
pub mod load_balancing;
pub mod name_resolution;
pub(crate) mod subchannel;

use std::fmt;

pub use channel::{Channel, ChannelOptions};

/// The connectivity state of a channel or subchannel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    /// No connection, and none being established.
    Idle,
    /// A connection attempt is in progress.
    Connecting,
    /// A connection is established and usable.
    Ready,
    /// Recent attempts failed; waiting out the backoff.
    TransientFailure,
    /// Closed for good. Terminal.
    Shutdown,
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectivityState::Idle => "IDLE",
            ConnectivityState::Connecting => "CONNECTING",
            ConnectivityState::Ready => "READY",
            ConnectivityState::TransientFailure => "TRANSIENT_FAILURE",
            ConnectivityState::Shutdown => "SHUTDOWN",
        };
        f.write_str(s)
    }
}
