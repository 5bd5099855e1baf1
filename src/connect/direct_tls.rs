// Copyright (c) 2024 xmpp-connect contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The Direct-TLS (XMPP-over-TLS, RFC 7590 / XEP-0368) connector strategy
//! (§4.3).
//!
//! State machine: PREPARE-VERIFIER, TLS-CONNECT, AWAIT-FEATURES. Unlike
//! [`super::starttls`], TLS is established before any XML is exchanged, so
//! there is no stream reset: the first `<stream:features/>` received is the
//! final one.

use std::time::Duration;

use tokio::io::BufStream;
use tokio::net::TcpStream;

use crate::exchange::open_stream_and_get_features;
use crate::tls::AlpnOutcome;
use crate::{ConnectionMetadata, ConnectLogger, Error};

use super::{ConnectOutcome, Connector};

#[cfg(all(feature = "tls-rust", not(feature = "tls-native")))]
type BackendTlsStream = tokio_rustls::client::TlsStream<TcpStream>;
#[cfg(feature = "tls-native")]
type BackendTlsStream = tokio_native_tls::TlsStream<TcpStream>;

/// Warning logged when the compiled-in TLS backend has no ALPN
/// configuration surface at all (`native-tls`).
const ALPN_UNSUPPORTED_MSG: &str =
    "OpenSSL.SSL.Context lacks set_alpn_protos - please update pyOpenSSL to a recent version";
/// Warning logged when the backend exposes ALPN configuration but applying
/// it failed at runtime.
const ALPN_FAILED_MSG: &str = "the underlying OpenSSL library does not support ALPN";

#[cfg(all(feature = "tls-rust", not(feature = "tls-native")))]
async fn upgrade(
    io: TcpStream,
    domain: &str,
    ctx: crate::tls::TlsContext,
) -> Result<BackendTlsStream, Error> {
    use std::sync::Arc;
    use tokio_rustls::rustls::pki_types::ServerName;

    let server_name: ServerName<'static> = ServerName::try_from(domain.to_string())
        .map_err(crate::error::TlsError::from)?;
    let connector = tokio_rustls::TlsConnector::from(Arc::new(ctx.config));
    connector
        .connect(server_name, io)
        .await
        .map_err(|e| crate::error::TlsError::from(e).into())
}

#[cfg(feature = "tls-native")]
async fn upgrade(
    io: TcpStream,
    domain: &str,
    ctx: crate::tls::TlsContext,
) -> Result<BackendTlsStream, Error> {
    let connector = ctx.builder.build().map_err(crate::error::TlsError::from)?;
    let connector = tokio_native_tls::TlsConnector::from(connector);
    connector
        .connect(domain, io)
        .await
        .map_err(|e| crate::error::TlsError::from(e).into())
}

/// Recover the raw socket from an established TLS stream, for
/// [`crate::Verifier::post_handshake`].
#[cfg(all(feature = "tls-rust", not(feature = "tls-native")))]
fn peer_transport(tls: &BackendTlsStream) -> &TcpStream {
    tls.get_ref().0
}

#[cfg(feature = "tls-native")]
fn peer_transport(tls: &BackendTlsStream) -> &TcpStream {
    tls.get_ref()
}

/// Negotiates TLS before any XML is exchanged (XMPP-over-TLS).
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectTlsConnector;

impl Connector for DirectTlsConnector {
    type Stream = BufStream<BackendTlsStream>;

    fn tls_supported(&self) -> bool {
        true
    }

    async fn connect(
        &self,
        metadata: &ConnectionMetadata,
        domain: &str,
        host: &str,
        port: u16,
        timeout: Duration,
        base_logger: Option<&ConnectLogger>,
    ) -> Result<ConnectOutcome<Self::Stream>, Error> {
        log::debug!("direct-tls connector: connecting to {}:{}", host, port);

        // PREPARE-VERIFIER
        let mut verifier = metadata.new_verifier();
        verifier.pre_handshake(domain, host, port, metadata).await?;

        // TLS-CONNECT
        let tcp = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| Error::Timeout)??;
        let mut ctx = metadata.new_tls_context();
        match ctx.set_alpn_xmpp_client() {
            AlpnOutcome::Applied => {}
            AlpnOutcome::Unsupported => {
                if let Some(logger) = base_logger {
                    logger.warn(ALPN_UNSUPPORTED_MSG);
                }
            }
            AlpnOutcome::Failed => {
                if let Some(logger) = base_logger {
                    logger.warn(ALPN_FAILED_MSG);
                }
            }
        }
        verifier.setup_context(&mut ctx, &tcp);
        let tls_io = upgrade(tcp, domain, ctx).await?;
        verifier.post_handshake(peer_transport(&tls_io)).await?;

        // AWAIT-FEATURES
        let io = BufStream::new(tls_io);
        let (features, stream) =
            open_stream_and_get_features(io, domain, "jabber:client", timeout).await?;

        Ok(ConnectOutcome { stream, features })
    }
}

#[cfg(all(test, feature = "tls-rust", not(feature = "tls-native")))]
mod tests {
    use super::*;
    use rcgen::{generate_simple_self_signed, CertifiedKey};
    use std::io::{BufReader, Cursor};
    use std::sync::{Arc, Once};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
    use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
    use tokio_rustls::TlsAcceptor;

    /// `rustls` 0.23 needs a process-wide crypto provider installed before
    /// any config is built; real clients pick this up transitively (e.g.
    /// via the `ring` feature default), but a bare test binary doesn't.
    fn install_crypto_provider() {
        static INIT: Once = Once::new();
        INIT.call_once(|| {
            let _ = tokio_rustls::rustls::crypto::ring::default_provider().install_default();
        });
    }

    struct TestCert {
        cert_der: CertificateDer<'static>,
        acceptor: TlsAcceptor,
    }

    fn generate_test_cert(domain: &str) -> TestCert {
        let CertifiedKey { cert, key_pair } = generate_simple_self_signed(vec![domain.to_string()])
            .expect("failed to generate test certificate");
        let cert_pem = cert.pem().into_bytes();
        let key_pem = key_pair.serialize_pem().into_bytes();
        let cert_der = CertificateDer::from(cert.der().to_vec());

        let certs: Vec<CertificateDer> =
            rustls_pemfile::certs(&mut BufReader::new(Cursor::new(&cert_pem)))
                .filter_map(|r| r.ok())
                .collect();
        let mut keys: Vec<_> =
            rustls_pemfile::pkcs8_private_keys(&mut BufReader::new(Cursor::new(&key_pem)))
                .filter_map(|r| r.ok())
                .collect();
        let key = keys.remove(0);

        let mut server_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, PrivateKeyDer::Pkcs8(key))
            .expect("failed to build server tls config");
        server_config.alpn_protocols = vec![crate::ALPN_XMPP_CLIENT.to_vec()];

        TestCert {
            cert_der,
            acceptor: TlsAcceptor::from(Arc::new(server_config)),
        }
    }

    /// Metadata that trusts exactly the self-signed cert generated above,
    /// in place of [`ConnectionMetadata::new_default`]'s platform root store.
    fn trusting_metadata(cert_der: CertificateDer<'static>) -> ConnectionMetadata {
        ConnectionMetadata::new(
            false,
            || Box::new(crate::DefaultVerifier) as Box<dyn crate::Verifier>,
            move || {
                let mut roots = RootCertStore::empty();
                roots.add(cert_der.clone()).expect("failed to trust test cert");
                let config = ClientConfig::builder()
                    .with_root_certificates(roots)
                    .with_no_client_auth();
                crate::TlsContext::new(config)
            },
        )
    }

    async fn listen() -> (TcpListener, String, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr.ip().to_string(), addr.port())
    }

    #[tokio::test]
    async fn successful_connect_over_tls() {
        install_crypto_provider();
        let domain = "example.com";
        let test_cert = generate_test_cert(domain);
        let (listener, host, port) = listen().await;

        let acceptor = test_cert.acceptor.clone();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut tls = acceptor.accept(socket).await.unwrap();

            let mut buf = Vec::new();
            let mut tmp = [0u8; 1024];
            while !buf.ends_with(b">") {
                let n = tls.read(&mut tmp).await.unwrap();
                assert!(n > 0, "peer closed before sending stream header");
                buf.extend_from_slice(&tmp[..n]);
            }
            tls.write_all(
                concat!(
                    "<?xml version='1.0'?>",
                    "<stream:stream xmlns:stream='http://etherx.jabber.org/streams' ",
                    "xmlns='jabber:client' id='test' version='1.0' from='example.com'>",
                    "<stream:features></stream:features>"
                )
                .as_bytes(),
            )
            .await
            .unwrap();
            tls.flush().await.unwrap();
        });

        let metadata = trusting_metadata(test_cert.cert_der);
        let outcome = DirectTlsConnector
            .connect(&metadata, domain, &host, port, Duration::from_secs(5), None)
            .await
            .unwrap();
        assert!(!outcome.features.can_starttls());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn alpn_is_applied_with_a_base_logger_present() {
        install_crypto_provider();
        let domain = "example.com";
        let test_cert = generate_test_cert(domain);
        let (listener, host, port) = listen().await;

        let acceptor = test_cert.acceptor.clone();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut tls = acceptor.accept(socket).await.unwrap();
            assert_eq!(
                tls.get_ref().1.alpn_protocol(),
                Some(crate::ALPN_XMPP_CLIENT)
            );

            let mut buf = Vec::new();
            let mut tmp = [0u8; 1024];
            while !buf.ends_with(b">") {
                let n = tls.read(&mut tmp).await.unwrap();
                assert!(n > 0);
                buf.extend_from_slice(&tmp[..n]);
            }
            tls.write_all(
                concat!(
                    "<?xml version='1.0'?>",
                    "<stream:stream xmlns:stream='http://etherx.jabber.org/streams' ",
                    "xmlns='jabber:client' id='test' version='1.0' from='example.com'>",
                    "<stream:features></stream:features>"
                )
                .as_bytes(),
            )
            .await
            .unwrap();
            tls.flush().await.unwrap();
        });

        // A present base_logger must not be consulted on the Applied branch
        // (no warning is logged); this only proves threading it through
        // doesn't disturb the happy path.
        let logger = ConnectLogger::child_for(domain);
        let metadata = trusting_metadata(test_cert.cert_der);
        let outcome = DirectTlsConnector
            .connect(
                &metadata,
                domain,
                &host,
                port,
                Duration::from_secs(5),
                Some(&logger),
            )
            .await
            .unwrap();
        assert!(!outcome.features.can_starttls());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn handshake_failure_propagates_tls_error() {
        install_crypto_provider();
        let domain = "example.com";
        // A cert for the wrong name: the client's TLS stack will reject it
        // during the handshake since `ServerName` won't match.
        let test_cert = generate_test_cert("not-example.com");
        let (listener, host, port) = listen().await;

        let acceptor = test_cert.acceptor.clone();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let _ = acceptor.accept(socket).await;
        });

        let metadata = trusting_metadata(test_cert.cert_der);
        let err = DirectTlsConnector
            .connect(&metadata, domain, &host, port, Duration::from_secs(5), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Tls(_)), "expected Tls error, got {:?}", err);
        let _ = server.await;
    }
}
