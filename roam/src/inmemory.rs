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

//! An in-process transport: channels connect to servers over in-memory
//! duplex pipes. Used heavily by tests; also usable for wiring a client
//! to a server in the same process without a socket.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{LazyLock, Once};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;

use crate::client::name_resolution::{
    Address, Resolver, ResolverBuilder, ResolverOptions, ResolverState, Target,
    GLOBAL_RESOLVER_REGISTRY,
};
use crate::credentials::BoxIo;
use crate::transport::{Connector, GLOBAL_CONNECTOR_REGISTRY};

static ADDRESS_TYPE: &str = "inmemory";
static SCHEME: &str = "inmemory";

/// Pipe capacity of each direction of an in-memory connection.
const PIPE_BUFFER: usize = 1024 * 1024;

static ACCEPT_QUEUES: LazyLock<Mutex<HashMap<String, mpsc::UnboundedSender<BoxIo>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

static REGISTER: Once = Once::new();

/// Registers the `inmemory` scheme and connector. Idempotent; invoked
/// automatically when a listener is created.
pub fn register() {
    REGISTER.call_once(|| {
        GLOBAL_RESOLVER_REGISTRY.add_builder(InMemoryResolverBuilder);
        GLOBAL_CONNECTOR_REGISTRY.add(ADDRESS_TYPE, InMemoryConnector);
    });
}

/// An in-process listener. Channels reach it through the target returned
/// by [`Listener::target`].
pub struct Listener {
    id: String,
    accept_rx: AsyncMutex<mpsc::UnboundedReceiver<BoxIo>>,
}

impl Listener {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        register();
        let id = NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed).to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        ACCEPT_QUEUES.lock().insert(id.clone(), tx);
        Listener {
            id,
            accept_rx: AsyncMutex::new(rx),
        }
    }

    /// The target string channels use to connect to this listener.
    pub fn target(&self) -> String {
        format!("{SCHEME}:///{}", self.id)
    }

    /// Accepts the next inbound connection, or `None` once the listener
    /// is gone.
    pub async fn accept(&self) -> Option<BoxIo> {
        self.accept_rx.lock().await.recv().await
    }

    /// Adapts the listener into the stream shape
    /// [`Server::serve_with_incoming`] expects.
    ///
    /// [`Server::serve_with_incoming`]: crate::server::Server::serve_with_incoming
    pub fn incoming(self) -> impl futures_core::Stream<Item = Result<BoxIo, crate::Error>> {
        futures_util::stream::unfold(self, |listener| async move {
            let io = listener.accept().await?;
            Some((Ok(io), listener))
        })
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        ACCEPT_QUEUES.lock().remove(&self.id);
    }
}

struct InMemoryConnector;

#[async_trait]
impl Connector for InMemoryConnector {
    async fn connect(&self, address: &Address) -> Result<BoxIo, crate::Error> {
        let accept_tx = ACCEPT_QUEUES
            .lock()
            .get(&address.addr)
            .cloned()
            .ok_or_else(|| format!("no in-memory listener for {:?}", address.addr))?;
        let (client, server) = tokio::io::duplex(PIPE_BUFFER);
        accept_tx
            .send(Box::new(server))
            .map_err(|_| "in-memory listener is gone")?;
        Ok(Box::new(client))
    }
}

struct InMemoryResolverBuilder;

impl ResolverBuilder for InMemoryResolverBuilder {
    fn scheme(&self) -> &'static str {
        SCHEME
    }

    fn build(&self, target: &Target, options: ResolverOptions) -> Box<dyn Resolver> {
        let state = ResolverState {
            addresses: vec![Address {
                transport_type: ADDRESS_TYPE.to_string(),
                addr: target.endpoint().to_string(),
                ..Default::default()
            }],
            ..Default::default()
        };
        Box::new(crate::client::name_resolution::OneShotResolver::new(
            state,
            options.controller,
        ))
    }
}
