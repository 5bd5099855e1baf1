// Copyright (c) 2024 xmpp-connect contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::borrow::Cow;
use std::pin::Pin;

use futures::StreamExt;
use tokio::io::BufStream;

use xmpp_parsers::{
    starttls::{Proceed, Request},
    stream_features::{StartTls, StreamFeatures},
};

use super::common::{send_xso, ReadXso, RawXmlStream, Timeouts};
use super::element::{ConnectorStreamElement, StartTlsReply};
use super::{initiate_stream, ReadError, StreamHeader};

/// Drives the "server" side of header exchange by hand: receive the header,
/// send one back, then send `<stream:features/>`. Returns the still-open
/// raw stream so the caller can continue the conversation.
async fn fake_server_negotiate<Io: tokio::io::AsyncBufRead + tokio::io::AsyncWrite + Unpin>(
    io: Io,
    features: StreamFeatures,
) -> RawXmlStream<Io> {
    let mut raw = RawXmlStream::new(io, "jabber:client", Timeouts::tight());
    let header = StreamHeader::recv(Pin::new(&mut raw)).await.unwrap();
    assert_eq!(header.to.as_deref(), Some("example.com"));
    StreamHeader {
        to: None,
        from: Some(Cow::Borrowed("example.com")),
        id: Some(Cow::Borrowed("stream-1")),
    }
    .send(Pin::new(&mut raw))
    .await
    .unwrap();
    send_xso(Pin::new(&mut raw), &features).await.unwrap();
    raw
}

#[tokio::test]
async fn header_exchange_and_features_roundtrip() {
    let (a, b) = tokio::io::duplex(4096);

    let client = tokio::spawn(async move {
        let a = BufStream::new(a);
        let pending = initiate_stream(
            a,
            "jabber:client",
            StreamHeader {
                to: Some(Cow::Borrowed("example.com")),
                from: None,
                id: None,
            },
            Timeouts::tight(),
        )
        .await
        .unwrap();
        let (features, _stream) = pending
            .recv_features::<ConnectorStreamElement>()
            .await
            .unwrap();
        assert!(features.can_starttls());
    });

    let server = tokio::spawn(async move {
        let mut features = StreamFeatures::default();
        features.starttls = Some(StartTls { required: None });
        fake_server_negotiate(BufStream::new(b), features).await;
    });

    client.await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn starttls_request_and_proceed_roundtrip() {
    let (a, b) = tokio::io::duplex(4096);

    let client = tokio::spawn(async move {
        let a = BufStream::new(a);
        let pending = initiate_stream(
            a,
            "jabber:client",
            StreamHeader {
                to: Some(Cow::Borrowed("example.com")),
                from: None,
                id: None,
            },
            Timeouts::tight(),
        )
        .await
        .unwrap();
        let (_features, mut stream) = pending
            .recv_features::<ConnectorStreamElement>()
            .await
            .unwrap();

        futures::SinkExt::send(
            &mut stream,
            &ConnectorStreamElement::StartTlsRequest(Request),
        )
        .await
        .unwrap();

        match stream.next().await {
            Some(Ok(ConnectorStreamElement::StartTls(StartTlsReply::Proceed(_)))) => (),
            other => panic!("expected Proceed, got {:?}", other),
        }
    });

    let server = tokio::spawn(async move {
        let mut features = StreamFeatures::default();
        features.starttls = Some(StartTls { required: None });
        let mut raw = fake_server_negotiate(BufStream::new(b), features).await;

        let request: ConnectorStreamElement = ReadXso::read_from(Pin::new(&mut raw))
            .await
            .unwrap_or_else(|_| panic!("failed to read starttls request"));
        match request {
            ConnectorStreamElement::StartTlsRequest(_) => (),
            other => panic!("expected StartTlsRequest, got {:?}", other),
        }

        send_xso(
            Pin::new(&mut raw),
            &ConnectorStreamElement::StartTls(StartTlsReply::Proceed(Proceed)),
        )
        .await
        .unwrap();
    });

    client.await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn header_exchange_fails_when_peer_vanishes() {
    let (a, b) = tokio::io::duplex(4096);
    drop(b);
    let a = BufStream::new(a);
    let pending = initiate_stream(
        a,
        "jabber:client",
        StreamHeader {
            to: Some(Cow::Borrowed("example.com")),
            from: None,
            id: None,
        },
        Timeouts::tight(),
    )
    .await;
    assert!(pending.is_err());
}

#[allow(dead_code)]
fn assert_read_error_is_send_sync() {
    fn check<T: Send + Sync>() {}
    check::<ReadError>();
}
