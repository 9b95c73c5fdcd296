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

use std::sync::Arc;

use async_trait::async_trait;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use super::{AuthInfo, BoxIo, SecurityLevel, TransportCredentials};

const ALPN_H2: &[u8] = b"h2";

/// TLS client credentials, optionally with a client identity for mutual
/// TLS.
pub struct TlsClientCredentials {
    connector: TlsConnector,
    server_name_override: Option<String>,
}

impl std::fmt::Debug for TlsClientCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsClientCredentials")
            .field("server_name_override", &self.server_name_override)
            .finish()
    }
}

fn parse_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, crate::Error> {
    rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(Into::into)
}

fn parse_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, crate::Error> {
    rustls_pemfile::private_key(&mut &pem[..])?
        .ok_or_else(|| crate::Error::from("no private key found in PEM"))
}

impl TlsClientCredentials {
    /// Builds client credentials trusting the CA certificates in
    /// `ca_cert_pem`. `identity` is an optional `(certificate chain, key)`
    /// PEM pair enabling mutual TLS.
    pub fn new(ca_cert_pem: &[u8], identity: Option<(&[u8], &[u8])>) -> Result<Self, crate::Error> {
        let mut roots = RootCertStore::empty();
        for cert in parse_certs(ca_cert_pem)? {
            roots.add(cert)?;
        }

        let builder = ClientConfig::builder().with_root_certificates(roots);
        let mut config = match identity {
            Some((cert_pem, key_pem)) => {
                builder.with_client_auth_cert(parse_certs(cert_pem)?, parse_key(key_pem)?)?
            }
            None => builder.with_no_client_auth(),
        };
        config.alpn_protocols = vec![ALPN_H2.to_vec()];

        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
            server_name_override: None,
        })
    }
}

#[async_trait]
impl TransportCredentials for TlsClientCredentials {
    async fn client_handshake(
        &self,
        authority: &str,
        io: BoxIo,
    ) -> Result<(BoxIo, AuthInfo), crate::Error> {
        let name = self
            .server_name_override
            .clone()
            .unwrap_or_else(|| authority.to_string());
        // Strip any port before server-name verification.
        let host = name.rsplit_once(':').map(|(h, _)| h).unwrap_or(&name);
        let server_name = ServerName::try_from(host.to_string())?;

        let stream = self.connector.connect(server_name, io).await?;
        let auth_info = AuthInfo {
            protocol: "tls",
            security_level: SecurityLevel::PrivacyAndIntegrity,
            server_name: Some(host.to_string()),
        };
        Ok((Box::new(stream), auth_info))
    }

    async fn server_handshake(&self, _io: BoxIo) -> Result<(BoxIo, AuthInfo), crate::Error> {
        Err("client TLS credentials cannot accept connections".into())
    }

    fn protocol(&self) -> &'static str {
        "tls"
    }

    fn with_server_name_override(
        self: Arc<Self>,
        server_name: &str,
    ) -> Arc<dyn TransportCredentials> {
        Arc::new(TlsClientCredentials {
            connector: self.connector.clone(),
            server_name_override: Some(server_name.to_string()),
        })
    }
}

/// TLS server credentials, optionally requiring client certificates.
pub struct TlsServerCredentials {
    acceptor: TlsAcceptor,
}

impl std::fmt::Debug for TlsServerCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsServerCredentials").finish()
    }
}

impl TlsServerCredentials {
    /// Builds server credentials from a PEM certificate chain and key.
    /// When `client_ca_pem` is set, clients must present a certificate
    /// signed by one of those CAs (mutual TLS).
    pub fn new(
        cert_pem: &[u8],
        key_pem: &[u8],
        client_ca_pem: Option<&[u8]>,
    ) -> Result<Self, crate::Error> {
        let certs = parse_certs(cert_pem)?;
        let key = parse_key(key_pem)?;

        let builder = match client_ca_pem {
            Some(ca_pem) => {
                let mut roots = RootCertStore::empty();
                for cert in parse_certs(ca_pem)? {
                    roots.add(cert)?;
                }
                let verifier =
                    tokio_rustls::rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
                        .build()?;
                ServerConfig::builder().with_client_cert_verifier(verifier)
            }
            None => ServerConfig::builder().with_no_client_auth(),
        };
        let mut config = builder.with_single_cert(certs, key)?;
        config.alpn_protocols = vec![ALPN_H2.to_vec()];

        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(config)),
        })
    }
}

#[async_trait]
impl TransportCredentials for TlsServerCredentials {
    async fn client_handshake(
        &self,
        _authority: &str,
        _io: BoxIo,
    ) -> Result<(BoxIo, AuthInfo), crate::Error> {
        Err("server TLS credentials cannot initiate connections".into())
    }

    async fn server_handshake(&self, io: BoxIo) -> Result<(BoxIo, AuthInfo), crate::Error> {
        let stream = self.acceptor.accept(io).await?;
        let auth_info = AuthInfo {
            protocol: "tls",
            security_level: SecurityLevel::PrivacyAndIntegrity,
            server_name: None,
        };
        Ok((Box::new(stream), auth_info))
    }

    fn protocol(&self) -> &'static str {
        "tls"
    }
}
