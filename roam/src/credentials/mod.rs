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

//! Transport and per-RPC credentials.
//!
//! Transport credentials wrap the raw connection with a security handshake
//! and report the achieved [`SecurityLevel`]; per-RPC credentials attach
//! call metadata and may demand a secure transport underneath.

mod insecure;
mod local;
#[cfg(feature = "tls")]
mod tls;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::metadata::MetadataMap;
use crate::Status;

pub use insecure::InsecureCredentials;
pub use local::LocalCredentials;
#[cfg(feature = "tls")]
pub use tls::{TlsClientCredentials, TlsServerCredentials};

/// A boxed bidirectional byte stream, as produced by connectors and
/// credential handshakes.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

#[allow(missing_docs)]
pub type BoxIo = Box<dyn Io>;

/// How much protection the transport provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SecurityLevel {
    /// The connection is neither authenticated nor encrypted.
    NoSecurity,
    /// Messages are integrity-protected but not encrypted.
    IntegrityOnly,
    /// Messages are private and integrity-protected.
    PrivacyAndIntegrity,
}

/// Peer information established by the transport handshake.
#[derive(Debug, Clone)]
pub struct AuthInfo {
    /// The security protocol name, e.g. `insecure` or `tls`.
    pub protocol: &'static str,
    /// The protection level the handshake achieved.
    pub security_level: SecurityLevel,
    /// The verified peer server name, when the protocol authenticates one.
    pub server_name: Option<String>,
}

/// Pluggable transport security.
///
/// Implementations are shared behind an `Arc` and must be usable for many
/// concurrent handshakes.
#[async_trait]
pub trait TransportCredentials: Send + Sync + fmt::Debug {
    /// Performs the client-side handshake for a connection to `authority`.
    async fn client_handshake(
        &self,
        authority: &str,
        io: BoxIo,
    ) -> Result<(BoxIo, AuthInfo), crate::Error>;

    /// Performs the server-side handshake on an accepted connection.
    async fn server_handshake(&self, io: BoxIo) -> Result<(BoxIo, AuthInfo), crate::Error>;

    /// The security protocol implemented, e.g. `tls`.
    fn protocol(&self) -> &'static str;

    /// Overrides the server name used to verify the peer, returning a new
    /// credentials instance. Implementations without a notion of server
    /// name return themselves unchanged.
    fn with_server_name_override(self: Arc<Self>, _server_name: &str) -> Arc<dyn TransportCredentials>
    where
        Self: Sized + 'static,
    {
        self
    }
}

/// Credentials attached to individual RPCs, e.g. bearer tokens.
#[async_trait]
pub trait PerRpcCredentials: Send + Sync {
    /// Produces the metadata to attach to a call to `uri`.
    async fn get_request_metadata(&self, uri: &str) -> Result<MetadataMap, Status>;

    /// Whether these credentials may only travel over a transport with
    /// privacy and integrity. Attaching such credentials to an insecure
    /// transport fails the RPC with `Unauthenticated`.
    fn require_transport_security(&self) -> bool;
}

/// Validates that `creds` are allowed on a transport with `auth_info`.
pub(crate) fn check_per_rpc_security(
    creds: &dyn PerRpcCredentials,
    auth_info: &AuthInfo,
) -> Result<(), Status> {
    if creds.require_transport_security()
        && auth_info.security_level < SecurityLevel::PrivacyAndIntegrity
    {
        return Err(Status::unauthenticated(
            "credentials require transport security but the connection is insecure",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Token;

    #[async_trait]
    impl PerRpcCredentials for Token {
        async fn get_request_metadata(&self, _uri: &str) -> Result<MetadataMap, Status> {
            let mut md = MetadataMap::new();
            md.insert("authorization", "Bearer xyz").unwrap();
            Ok(md)
        }

        fn require_transport_security(&self) -> bool {
            true
        }
    }

    #[test]
    fn secure_credentials_rejected_on_insecure_transport() {
        let auth = AuthInfo {
            protocol: "insecure",
            security_level: SecurityLevel::NoSecurity,
            server_name: None,
        };
        let err = check_per_rpc_security(&Token, &auth).unwrap_err();
        assert_eq!(err.code(), crate::Code::Unauthenticated);

        let auth = AuthInfo {
            protocol: "tls",
            security_level: SecurityLevel::PrivacyAndIntegrity,
            server_name: None,
        };
        assert!(check_per_rpc_security(&Token, &auth).is_ok());
    }
}
