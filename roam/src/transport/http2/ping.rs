//! The ping driver: HTTP/2 keepalive and BDP-based receive-window growth.
//!
//! A single PING serves both purposes. Keepalive pings are sent after the
//! configured idle interval and the connection is torn down when the ack
//! does not arrive in time. When the adaptive window is enabled, received
//! bytes are sampled between a ping and its ack; a sample exceeding a
//! quarter of the current window doubles the window, up to a ceiling.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::transport::{KeepaliveConfig, DEFAULT_WINDOW_SIZE, MAX_WINDOW_SIZE};

/// Shared byte counter the receive paths feed; wakes the ping driver so a
/// BDP sample can be taken.
#[derive(Debug, Default)]
pub(crate) struct BdpSignal {
    bytes: AtomicUsize,
    notify: Notify,
}

impl BdpSignal {
    pub(crate) fn record(&self, n: usize) {
        self.bytes.fetch_add(n, Ordering::Relaxed);
        self.notify.notify_one();
    }

    fn take(&self) -> usize {
        self.bytes.swap(0, Ordering::Relaxed)
    }
}

/// Why the ping driver stopped.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum PingOutcome {
    /// The connection went away underneath us.
    ConnectionClosed,
    /// A keepalive ack did not arrive in time; the connection must be torn
    /// down and all its streams failed.
    KeepaliveTimeout,
}

pub(crate) struct PingDriver {
    ping_pong: h2::PingPong,
    keepalive: Option<KeepaliveConfig>,
    bdp: Option<BdpEstimator>,
    /// Reports whether the transport currently has active streams; gates
    /// keepalive when pings without calls are not permitted.
    has_active_streams: Box<dyn Fn() -> bool + Send>,
    /// Window growth commands applied to the connection by its driver
    /// task.
    window_tx: mpsc::UnboundedSender<u32>,
}

struct BdpEstimator {
    signal: Arc<BdpSignal>,
    window: u32,
    ceiling: u32,
}

enum PingReason {
    Keepalive,
    Bdp,
}

impl PingDriver {
    pub(crate) fn new(
        ping_pong: h2::PingPong,
        keepalive: Option<KeepaliveConfig>,
        bdp_signal: Option<Arc<BdpSignal>>,
        has_active_streams: Box<dyn Fn() -> bool + Send>,
        window_tx: mpsc::UnboundedSender<u32>,
    ) -> Self {
        PingDriver {
            ping_pong,
            keepalive,
            bdp: bdp_signal.map(|signal| BdpEstimator {
                signal,
                window: DEFAULT_WINDOW_SIZE,
                ceiling: MAX_WINDOW_SIZE,
            }),
            has_active_streams,
            window_tx,
        }
    }

    /// Whether a driver task is needed at all.
    pub(crate) fn is_enabled(&self) -> bool {
        self.keepalive.is_some() || self.bdp.is_some()
    }

    pub(crate) async fn run(mut self) -> PingOutcome {
        loop {
            let keepalive_interval = self.keepalive.as_ref().map(|k| k.interval);
            let bdp_notify = self.bdp.as_ref().map(|b| b.signal.clone());

            let reason = tokio::select! {
                _ = sleep_or_forever(keepalive_interval) => PingReason::Keepalive,
                _ = notified_or_forever(bdp_notify) => PingReason::Bdp,
            };

            if let PingReason::Keepalive = reason {
                let permitted = self
                    .keepalive
                    .as_ref()
                    .map(|k| k.permit_without_calls)
                    .unwrap_or(false);
                if !permitted && !(self.has_active_streams)() {
                    trace!("skipping keepalive ping on idle connection");
                    continue;
                }
            }

            if self.ping_pong.send_ping(h2::Ping::opaque()).is_err() {
                return PingOutcome::ConnectionClosed;
            }
            let sent_at = tokio::time::Instant::now();

            let pong = future::poll_fn(|cx| self.ping_pong.poll_pong(cx));
            let result = match (&reason, &self.keepalive) {
                (PingReason::Keepalive, Some(config)) => {
                    match tokio::time::timeout(config.timeout, pong).await {
                        Ok(result) => result,
                        Err(_elapsed) => {
                            debug!("keepalive ping timed out");
                            return PingOutcome::KeepaliveTimeout;
                        }
                    }
                }
                _ => pong.await,
            };

            if result.is_err() {
                return PingOutcome::ConnectionClosed;
            }

            if let Some(bdp) = &mut self.bdp {
                let rtt = sent_at.elapsed();
                let sample = bdp.signal.take();
                trace!("bdp sample: {} bytes in {:?}", sample, rtt);
                if (sample as u64) * 4 >= bdp.window as u64 && bdp.window < bdp.ceiling {
                    bdp.window = bdp.window.saturating_mul(2).min(bdp.ceiling);
                    debug!("growing http2 windows to {}", bdp.window);
                    if self.window_tx.send(bdp.window).is_err() {
                        return PingOutcome::ConnectionClosed;
                    }
                }
            }
        }
    }
}

async fn sleep_or_forever(interval: Option<Duration>) {
    match interval {
        Some(interval) => tokio::time::sleep(interval).await,
        None => std::future::pending().await,
    }
}

async fn notified_or_forever(signal: Option<Arc<BdpSignal>>) {
    match signal {
        Some(signal) => signal.notify.notified().await,
        None => std::future::pending().await,
    }
}
