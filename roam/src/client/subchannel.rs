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

//! Subchannels: the intent to maintain one transport to one address.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::backoff::{ExponentialBackoff, BACKOFF_READY_RESET_PERIOD, DEFAULT_BACKOFF_CONFIG};
use super::channel::{WorkItem, WorkQueueTx};
use super::load_balancing::{HealthListener, Subchannel, SubchannelState};
use super::name_resolution::Address;
use super::ConnectivityState;
use crate::credentials::TransportCredentials;
use crate::transport::http2::client::{ClientTransport, TransportState};
use crate::transport::Http2Settings;
use crate::Status;

/// Hard ceiling on a single dial+handshake attempt.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

pub(crate) struct InternalSubchannel {
    id: u64,
    address: Address,
    /// The `:authority` used on this connection; the address's
    /// server-name override beats the channel default.
    authority: String,
    credentials: Arc<dyn TransportCredentials>,
    settings: Http2Settings,
    connect_timeout: Duration,
    work_tx: WorkQueueTx,
    backoff: ExponentialBackoff,
    inner: Mutex<SubchannelCore>,
}

struct SubchannelCore {
    state: ConnectivityState,
    transport: Option<Arc<ClientTransport>>,
    /// The in-flight connect attempt, transport watcher, or backoff
    /// timer. At most one of these exists at a time.
    task: Option<tokio::task::JoinHandle<()>>,
    shutdown: bool,
    health_listener: Option<HealthListener>,
    ready_at: Option<Instant>,
}

impl InternalSubchannel {
    pub(crate) fn new(
        id: u64,
        address: Address,
        default_authority: &str,
        credentials: Arc<dyn TransportCredentials>,
        settings: Http2Settings,
        work_tx: WorkQueueTx,
    ) -> Arc<Self> {
        let authority = address
            .server_name_override
            .clone()
            .unwrap_or_else(|| default_authority.to_string());
        Arc::new(InternalSubchannel {
            id,
            address,
            authority,
            credentials,
            settings,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            work_tx,
            backoff: ExponentialBackoff::new(DEFAULT_BACKOFF_CONFIG.clone())
                .expect("default backoff config is valid"),
            inner: Mutex::new(SubchannelCore {
                state: ConnectivityState::Idle,
                transport: None,
                task: None,
                shutdown: false,
                health_listener: None,
                ready_at: None,
            }),
        })
    }

    pub(crate) fn authority(&self) -> &str {
        &self.authority
    }

    pub(crate) fn address(&self) -> &Address {
        &self.address
    }

    /// The live transport, if the subchannel is READY.
    pub(crate) fn transport(&self) -> Option<Arc<ClientTransport>> {
        self.inner.lock().transport.clone()
    }

    /// Begins a connection attempt. Acts from IDLE; a manual connect
    /// during TRANSIENT_FAILURE skips the remaining backoff wait. A
    /// single attempt is in flight at any time.
    pub(crate) fn connect(self: &Arc<Self>) {
        {
            let mut core = self.inner.lock();
            if core.shutdown {
                return;
            }
            match core.state {
                ConnectivityState::Idle => {}
                ConnectivityState::TransientFailure => {
                    // Cancel the pending backoff timer.
                    if let Some(task) = core.task.take() {
                        task.abort();
                    }
                }
                _ => return,
            }
            core.state = ConnectivityState::Connecting;
            let sc = self.clone();
            core.task = Some(tokio::spawn(async move { sc.attempt().await }));
        }
        self.notify(ConnectivityState::Connecting, None);
    }

    async fn attempt(self: Arc<Self>) {
        trace!("subchannel {} dialing {}", self.id, self.address);
        let connect = async {
            let connector = crate::transport::GLOBAL_CONNECTOR_REGISTRY
                .get(&self.address.transport_type)
                .ok_or_else(|| {
                    crate::Error::from(format!(
                        "no connector registered for address type {:?}",
                        self.address.transport_type
                    ))
                })?;
            let io = connector.connect(&self.address).await?;
            let (io, auth_info) = self
                .credentials
                .client_handshake(&self.authority, io)
                .await?;
            ClientTransport::connect(io, &self.settings, auth_info).await
        };
        match tokio::time::timeout(self.connect_timeout, connect).await {
            Ok(Ok(transport)) => self.on_connected(transport),
            Ok(Err(e)) => self.on_connect_failure(Status::unavailable(e.to_string())),
            Err(_) => {
                self.on_connect_failure(Status::unavailable("connection attempt timed out"))
            }
        }
    }

    fn on_connected(self: &Arc<Self>, transport: Arc<ClientTransport>) {
        {
            let mut core = self.inner.lock();
            if core.shutdown {
                transport.close();
                return;
            }
            core.state = ConnectivityState::Ready;
            core.ready_at = Some(Instant::now());
            core.transport = Some(transport.clone());

            let sc = self.clone();
            core.task = Some(tokio::spawn(async move {
                let mut states = transport.subscribe();
                while *states.borrow_and_update() == TransportState::Serving {
                    if states.changed().await.is_err() {
                        break;
                    }
                }
                sc.on_disconnected();
            }));
        }
        debug!("subchannel {} ready ({})", self.id, self.address);
        self.notify(ConnectivityState::Ready, None);
    }

    fn on_disconnected(self: &Arc<Self>) {
        {
            let mut core = self.inner.lock();
            if core.shutdown {
                return;
            }
            // A connection that stayed up long enough proves the address
            // healthy again; restart the backoff schedule.
            if let Some(ready_at) = core.ready_at.take() {
                if ready_at.elapsed() >= BACKOFF_READY_RESET_PERIOD {
                    self.backoff.reset();
                }
            }
            core.transport = None;
            core.task = None;
            core.state = ConnectivityState::Idle;
        }
        debug!("subchannel {} lost its transport", self.id);
        self.notify(ConnectivityState::Idle, None);
    }

    fn on_connect_failure(self: &Arc<Self>, error: Status) {
        let error = Arc::new(error);
        {
            let mut core = self.inner.lock();
            if core.shutdown {
                return;
            }
            core.state = ConnectivityState::TransientFailure;
            let wait = self.backoff.backoff_duration();
            trace!(
                "subchannel {} connect failed; next attempt in {:?}",
                self.id,
                wait
            );
            let sc = self.clone();
            core.task = Some(tokio::spawn(async move {
                tokio::time::sleep(wait).await;
                sc.on_backoff_expired();
            }));
        }
        self.notify(ConnectivityState::TransientFailure, Some(error));
    }

    fn on_backoff_expired(self: &Arc<Self>) {
        {
            let mut core = self.inner.lock();
            if core.shutdown || core.state != ConnectivityState::TransientFailure {
                return;
            }
            core.state = ConnectivityState::Idle;
            core.task = None;
        }
        self.notify(ConnectivityState::Idle, None);
    }

    /// Shuts the subchannel down, letting in-flight streams on its
    /// transport finish (balancer-initiated teardown). Exactly one final
    /// Shutdown update is delivered; nothing follows it.
    pub(crate) fn shutdown(self: &Arc<Self>) {
        self.shutdown_inner(true);
    }

    /// Shuts the subchannel down and closes its transport immediately,
    /// failing in-flight streams (channel close).
    pub(crate) fn shutdown_now(self: &Arc<Self>) {
        self.shutdown_inner(false);
    }

    fn shutdown_inner(self: &Arc<Self>, graceful: bool) {
        {
            let mut core = self.inner.lock();
            if core.shutdown {
                return;
            }
            core.shutdown = true;
            if let Some(task) = core.task.take() {
                task.abort();
            }
            if let Some(transport) = core.transport.take() {
                if graceful {
                    transport.graceful_close();
                } else {
                    transport.close();
                }
            }
            core.state = ConnectivityState::Shutdown;
            core.health_listener = None;
        }
        debug!("subchannel {} shut down", self.id);
        self.notify(ConnectivityState::Shutdown, None);
    }

    pub(crate) fn register_health_listener(&self, listener: Option<HealthListener>) {
        let mut core = self.inner.lock();
        if core.shutdown {
            return;
        }
        // Replacing the listener silences the previous one for good.
        core.health_listener = listener;
        if core.state == ConnectivityState::Ready {
            // Replay the current health state to the new listener. With
            // no health service configured, health follows connectivity.
            if let Some(listener) = &core.health_listener {
                listener(&SubchannelState {
                    connectivity_state: ConnectivityState::Ready,
                    last_connection_error: None,
                });
            }
        }
    }

    fn notify(self: &Arc<Self>, state: ConnectivityState, error: Option<Arc<Status>>) {
        let update = SubchannelState {
            connectivity_state: state,
            last_connection_error: error,
        };

        {
            let core = self.inner.lock();
            if let Some(listener) = &core.health_listener {
                listener(&update);
            }
        }

        let _ = self
            .work_tx
            .send(WorkItem::SubchannelUpdate(self.id, update));
    }
}

/// The handle LB policies hold; cloned freely, pooled by the channel.
#[derive(Clone)]
pub(crate) struct SubchannelHandle {
    pub(crate) inner: Arc<InternalSubchannel>,
}

impl Subchannel for SubchannelHandle {
    fn connect(&self) {
        self.inner.connect();
    }

    fn shutdown(&self) {
        self.inner.shutdown();
    }

    fn address(&self) -> Address {
        self.inner.address.clone()
    }

    fn register_health_listener(&self, listener: Option<HealthListener>) {
        self.inner.register_health_listener(listener);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl fmt::Debug for SubchannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subchannel")
            .field("id", &self.inner.id)
            .field("address", &self.inner.address)
            .finish()
    }
}
