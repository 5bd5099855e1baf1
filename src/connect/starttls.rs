// Copyright (c) 2024 xmpp-connect contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The in-band STARTTLS connector strategy (§4.2).
//!
//! State machine: OPEN-STREAM, DECIDE, STARTTLS-REQUEST, TLS-UPGRADE,
//! RESET-STREAM.

use std::time::Duration;

use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, BufStream, ReadBuf};
use tokio::net::TcpStream;

use xmpp_parsers::{starttls::Request, stream_error::ReceivedStreamError};

use crate::error::ProtocolError;
use crate::exchange::{open_stream_and_get_features, send_and_wait_for, send_stream_error_and_close};
use crate::xmlstream::{ConnectorStreamElement, StartTlsReply};
use crate::{ConnectionMetadata, ConnectLogger, Error};

use super::{ConnectOutcome, Connector};

#[cfg(all(feature = "tls-rust", not(feature = "tls-native")))]
type BackendTlsStream = tokio_rustls::client::TlsStream<TcpStream>;
#[cfg(feature = "tls-native")]
type BackendTlsStream = tokio_native_tls::TlsStream<TcpStream>;

pin_project! {
    /// The transport produced by [`StartTlsConnector`]: either still plain
    /// TCP (TLS was not required and the server did not offer it) or
    /// upgraded in place after a successful `<starttls/>` exchange.
    #[project = TlsStreamProj]
    pub enum TlsStream {
        Plain { #[pin] io: TcpStream },
        Tls { #[pin] io: BackendTlsStream },
    }
}

impl AsyncRead for TlsStream {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.project() {
            TlsStreamProj::Plain { io } => io.poll_read(cx, buf),
            TlsStreamProj::Tls { io } => io.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TlsStream {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        match self.project() {
            TlsStreamProj::Plain { io } => io.poll_write(cx, buf),
            TlsStreamProj::Tls { io } => io.poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.project() {
            TlsStreamProj::Plain { io } => io.poll_flush(cx),
            TlsStreamProj::Tls { io } => io.poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.project() {
            TlsStreamProj::Plain { io } => io.poll_shutdown(cx),
            TlsStreamProj::Tls { io } => io.poll_shutdown(cx),
        }
    }
}

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

/// The two fixed messages this strategy reports under [`Error::TlsUnavailable`].
const NOT_OFFERED: &str = "STARTTLS not supported by server, but required by client";
const FAILED: &str = "server failed to STARTTLS";

/// Negotiates TLS in-band via `<starttls/>`, per RFC 6120 §5.
#[derive(Debug, Default, Clone, Copy)]
pub struct StartTlsConnector;

impl Connector for StartTlsConnector {
    type Stream = BufStream<TlsStream>;

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
        _base_logger: Option<&ConnectLogger>,
    ) -> Result<ConnectOutcome<Self::Stream>, Error> {
        log::debug!("starttls connector: connecting to {}:{}", host, port);

        // OPEN-STREAM
        let tcp = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| Error::Timeout)??;
        let io = BufStream::new(TlsStream::Plain { io: tcp });
        let (features, mut stream) =
            open_stream_and_get_features(io, domain, "jabber:client", timeout).await?;

        // DECIDE
        if !features.can_starttls() {
            if metadata.tls_required {
                stream.abort();
                return Err(Error::TlsUnavailable(NOT_OFFERED));
            }
            log::debug!("server does not offer starttls, continuing in plaintext");
            return Ok(ConnectOutcome { stream, features });
        }

        // STARTTLS-REQUEST
        let reply = send_and_wait_for(
            &mut stream,
            &ConnectorStreamElement::StartTlsRequest(Request),
            timeout,
        )
        .await;

        match reply {
            Ok(ConnectorStreamElement::StartTls(StartTlsReply::Proceed(_))) => {}
            Ok(ConnectorStreamElement::StartTls(StartTlsReply::Failure(_))) => {
                if metadata.tls_required {
                    send_stream_error_and_close(
                        stream,
                        xmpp_parsers::stream_error::DefinedCondition::PolicyViolation,
                        FAILED,
                    )
                    .await?;
                    return Err(Error::TlsUnavailable(FAILED));
                }
                log::debug!("server failed starttls, continuing in plaintext");
                return Ok(ConnectOutcome { stream, features });
            }
            Ok(_other) => {
                stream.abort();
                return Err(Error::Protocol(ProtocolError::UnexpectedElement));
            }
            Err(Error::Protocol(ProtocolError::ReceivedStreamError(ReceivedStreamError(e))))
                if metadata.tls_required
                    && matches!(
                        e.condition,
                        xmpp_parsers::stream_error::DefinedCondition::UnsupportedStanzaType
                    ) =>
            {
                return Err(Error::TlsUnavailable(NOT_OFFERED));
            }
            Err(e) => return Err(e),
        }

        // TLS-UPGRADE
        let io = stream.into_inner();
        let tcp = match io.into_inner() {
            TlsStream::Plain { io } => io,
            TlsStream::Tls { .. } => unreachable!("stream was not yet upgraded"),
        };

        let mut verifier = metadata.new_verifier();
        verifier.pre_handshake(domain, host, port, metadata).await?;
        let mut ctx = metadata.new_tls_context();
        verifier.setup_context(&mut ctx, &tcp);
        let tls_io = upgrade(tcp, domain, ctx).await?;
        verifier.post_handshake(peer_transport(&tls_io)).await?;

        // RESET-STREAM
        let io = BufStream::new(TlsStream::Tls { io: tls_io });
        let (features, stream) =
            open_stream_and_get_features(io, domain, "jabber:client", timeout).await?;

        Ok(ConnectOutcome { stream, features })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream as TokioTcpStream};

    /// Reads a client stream header off `socket` and replies with a matching
    /// header and `<stream:features>{features_body}</stream:features>`.
    async fn fake_server(mut socket: TokioTcpStream, features_body: &str) {
        let mut buf = Vec::new();
        let mut tmp = [0u8; 1024];
        while !buf.ends_with(b">") {
            let n = socket.read(&mut tmp).await.unwrap();
            assert!(n > 0, "peer closed before sending stream header");
            buf.extend_from_slice(&tmp[..n]);
        }

        socket
            .write_all(
                concat!(
                    "<?xml version='1.0'?>",
                    "<stream:stream xmlns:stream='http://etherx.jabber.org/streams' ",
                    "xmlns='jabber:client' id='test' version='1.0' from='example.com'>"
                )
                .as_bytes(),
            )
            .await
            .unwrap();
        socket
            .write_all(format!("<stream:features>{}</stream:features>", features_body).as_bytes())
            .await
            .unwrap();
        socket.flush().await.unwrap();
    }

    async fn listen() -> (TcpListener, String, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr.ip().to_string(), addr.port())
    }

    #[tokio::test]
    async fn plaintext_fallback_when_starttls_not_required() {
        let (listener, host, port) = listen().await;
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            fake_server(socket, "").await;
        });

        let metadata = ConnectionMetadata::new_default(false);
        let outcome = StartTlsConnector
            .connect(&metadata, "example.com", &host, port, Duration::from_secs(5), None)
            .await
            .unwrap();
        assert!(!outcome.features.can_starttls());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn error_when_starttls_required_but_not_offered() {
        let (listener, host, port) = listen().await;
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            fake_server(socket, "").await;
        });

        let metadata = ConnectionMetadata::new_default(true);
        let err = StartTlsConnector
            .connect(&metadata, "example.com", &host, port, Duration::from_secs(5), None)
            .await
            .unwrap_err();
        match err {
            Error::TlsUnavailable(msg) => assert_eq!(msg, NOT_OFFERED),
            other => panic!("expected TlsUnavailable, got {:?}", other),
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn plaintext_fallback_when_starttls_fails_and_not_required() {
        let (listener, host, port) = listen().await;
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut tmp = [0u8; 1024];
            while !buf.ends_with(b">") {
                let n = socket.read(&mut tmp).await.unwrap();
                assert!(n > 0);
                buf.extend_from_slice(&tmp[..n]);
            }
            socket
                .write_all(
                    concat!(
                        "<?xml version='1.0'?>",
                        "<stream:stream xmlns:stream='http://etherx.jabber.org/streams' ",
                        "xmlns='jabber:client' id='test' version='1.0' from='example.com'>",
                        "<stream:features>",
                        "<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>",
                        "</stream:features>"
                    )
                    .as_bytes(),
                )
                .await
                .unwrap();
            socket.flush().await.unwrap();

            let mut buf = Vec::new();
            while !buf.ends_with(b"/>") && !buf.ends_with(b"</starttls>") {
                let n = socket.read(&mut tmp).await.unwrap();
                assert!(n > 0, "peer closed before sending <starttls/>");
                buf.extend_from_slice(&tmp[..n]);
            }
            socket
                .write_all(b"<failure xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>")
                .await
                .unwrap();
            socket.flush().await.unwrap();
        });

        let metadata = ConnectionMetadata::new_default(false);
        let outcome = StartTlsConnector
            .connect(&metadata, "example.com", &host, port, Duration::from_secs(5), None)
            .await
            .unwrap();
        assert!(outcome.features.can_starttls());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn policy_violation_when_starttls_fails_and_required() {
        let (listener, host, port) = listen().await;
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut tmp = [0u8; 1024];
            while !buf.ends_with(b">") {
                let n = socket.read(&mut tmp).await.unwrap();
                assert!(n > 0);
                buf.extend_from_slice(&tmp[..n]);
            }
            socket
                .write_all(
                    concat!(
                        "<?xml version='1.0'?>",
                        "<stream:stream xmlns:stream='http://etherx.jabber.org/streams' ",
                        "xmlns='jabber:client' id='test' version='1.0' from='example.com'>",
                        "<stream:features>",
                        "<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>",
                        "</stream:features>"
                    )
                    .as_bytes(),
                )
                .await
                .unwrap();
            socket.flush().await.unwrap();

            let mut buf = Vec::new();
            while !buf.ends_with(b"/>") && !buf.ends_with(b"</starttls>") {
                let n = socket.read(&mut tmp).await.unwrap();
                assert!(n > 0, "peer closed before sending <starttls/>");
                buf.extend_from_slice(&tmp[..n]);
            }
            socket
                .write_all(b"<failure xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>")
                .await
                .unwrap();
            socket.flush().await.unwrap();

            // the client must now send a stream error before closing
            let mut buf = Vec::new();
            while !buf.ends_with(b">") {
                let n = socket.read(&mut tmp).await.unwrap();
                assert!(n > 0, "peer closed before sending stream error");
                buf.extend_from_slice(&tmp[..n]);
            }
            let text = String::from_utf8_lossy(&buf);
            assert!(text.contains("policy-violation"), "got: {text}");
        });

        let metadata = ConnectionMetadata::new_default(true);
        let err = StartTlsConnector
            .connect(&metadata, "example.com", &host, port, Duration::from_secs(5), None)
            .await
            .unwrap_err();
        match err {
            Error::TlsUnavailable(msg) => assert_eq!(msg, FAILED),
            other => panic!("expected TlsUnavailable, got {:?}", other),
        }
        server.await.unwrap();
    }
}
