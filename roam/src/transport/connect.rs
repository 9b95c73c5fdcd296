//! Built-in connectors for TCP and UNIX domain socket addresses.

use async_trait::async_trait;
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tracing::trace;

use super::Connector;
use crate::client::name_resolution::Address;
use crate::credentials::BoxIo;

/// Dials TCP addresses, with nodelay set; RPC framing does its own
/// batching.
#[derive(Debug, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, address: &Address) -> Result<BoxIo, crate::Error> {
        trace!("dialing tcp {}", address.addr);
        let stream = TcpStream::connect(&*address.addr).await?;
        stream.set_nodelay(true)?;

        let sock = socket2::SockRef::from(&stream);
        sock.set_keepalive(true)?;

        Ok(Box::new(stream))
    }
}

/// Dials UNIX domain sockets. Abstract-namespace names are prefixed with a
/// NUL byte by the resolver.
#[cfg(unix)]
#[derive(Debug, Default)]
pub struct UdsConnector;

#[cfg(unix)]
#[async_trait]
impl Connector for UdsConnector {
    async fn connect(&self, address: &Address) -> Result<BoxIo, crate::Error> {
        trace!("dialing unix socket {:?}", address.addr);
        if let Some(name) = address.addr.strip_prefix('\0') {
            // Abstract sockets have no filesystem presence; connect via a
            // std socket address and convert.
            #[cfg(target_os = "linux")]
            {
                use std::os::linux::net::SocketAddrExt;
                let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
                let std_stream = std::os::unix::net::UnixStream::connect_addr(&addr)?;
                std_stream.set_nonblocking(true)?;
                let stream = UnixStream::from_std(std_stream)?;
                return Ok(Box::new(stream));
            }
            #[cfg(not(target_os = "linux"))]
            {
                let _ = name;
                return Err("abstract unix sockets are only supported on linux".into());
            }
        }
        let stream = UnixStream::connect(&*address.addr).await?;
        Ok(Box::new(stream))
    }
}
