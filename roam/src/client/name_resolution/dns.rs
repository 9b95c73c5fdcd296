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

//! The `dns` resolver: A/AAAA lookups through the runtime's host
//! resolver, with throttled re-resolution.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, trace};

use super::{
    Address, ChannelController, Resolver, ResolverBuilder, ResolverOptions, ResolverState, Target,
    TCP_ADDRESS_TYPE,
};
use crate::client::backoff::{ExponentialBackoff, DEFAULT_BACKOFF_CONFIG};
use crate::Status;

/// Port assumed when the target does not carry one.
const DEFAULT_PORT: u16 = 443;

/// Minimum spacing between consecutive resolutions, however often
/// re-resolution is requested.
const MIN_RESOLUTION_INTERVAL: Duration = Duration::from_secs(30);

pub(super) struct DnsResolverBuilder;

impl ResolverBuilder for DnsResolverBuilder {
    fn scheme(&self) -> &'static str {
        "dns"
    }

    fn build(&self, target: &Target, options: ResolverOptions) -> Box<dyn Resolver> {
        let endpoint = target.endpoint().to_string();
        let rerequest = Arc::new(Notify::new());
        let task = tokio::spawn(resolve_loop(
            endpoint,
            options.controller,
            rerequest.clone(),
        ));
        Box::new(DnsResolver { rerequest, task })
    }
}

struct DnsResolver {
    rerequest: Arc<Notify>,
    task: tokio::task::JoinHandle<()>,
}

impl Resolver for DnsResolver {
    fn resolve_now(&mut self) {
        self.rerequest.notify_one();
    }
}

impl Drop for DnsResolver {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Splits `endpoint` into host and port, defaulting the port. Bracketed
/// IPv6 literals are unwrapped.
fn split_host_port(endpoint: &str) -> Result<(String, u16), Status> {
    if endpoint.is_empty() {
        return Err(Status::invalid_argument("dns target has an empty endpoint"));
    }
    if let Some(rest) = endpoint.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| Status::invalid_argument("unmatched '[' in dns target"))?;
        let port = match rest.strip_prefix(':') {
            Some(port) => port
                .parse()
                .map_err(|_| Status::invalid_argument("invalid port in dns target"))?,
            None => DEFAULT_PORT,
        };
        return Ok((host.to_string(), port));
    }
    match endpoint.rsplit_once(':') {
        // A second ':' means an unbracketed IPv6 literal, not a port.
        Some((host, port)) if !host.contains(':') => {
            let port = port
                .parse()
                .map_err(|_| Status::invalid_argument("invalid port in dns target"))?;
            Ok((host.to_string(), port))
        }
        _ => Ok((endpoint.to_string(), DEFAULT_PORT)),
    }
}

async fn resolve_loop(
    endpoint: String,
    controller: Arc<dyn ChannelController>,
    rerequest: Arc<Notify>,
) {
    let (host, port) = match split_host_port(&endpoint) {
        Ok(parts) => parts,
        Err(status) => {
            controller.report_error(status);
            return;
        }
    };

    let backoff = ExponentialBackoff::new(DEFAULT_BACKOFF_CONFIG.clone())
        .expect("default backoff config is valid");

    loop {
        let started = tokio::time::Instant::now();
        let outcome = tokio::net::lookup_host((host.as_str(), port)).await;

        let failed = match outcome {
            Ok(addrs) => {
                let addresses: Vec<Address> = addrs
                    .map(|addr| Address {
                        transport_type: TCP_ADDRESS_TYPE.to_string(),
                        addr: addr.to_string(),
                        ..Default::default()
                    })
                    .collect();
                trace!("dns resolved {} to {} addresses", host, addresses.len());
                let state = ResolverState {
                    addresses,
                    ..Default::default()
                };
                controller.update(state).await.is_err()
            }
            Err(err) => {
                debug!("dns resolution of {} failed: {}", host, err);
                controller.report_error(Status::unavailable(format!(
                    "dns resolution failed for {host}: {err}"
                )));
                true
            }
        };

        if failed {
            // Retry on our own schedule after a failed or rejected
            // resolution.
            tokio::time::sleep(backoff.backoff_duration()).await;
        } else {
            backoff.reset();
            rerequest.notified().await;
        }

        // Throttle however the next resolution was triggered.
        let elapsed = started.elapsed();
        if elapsed < MIN_RESOLUTION_INTERVAL {
            tokio::time::sleep(MIN_RESOLUTION_INTERVAL - elapsed).await;
        }
    }
}
