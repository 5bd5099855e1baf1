//! Stream-level exchange helpers consumed by both connector strategies.
//!
//! These correspond to the narrow collaborator interfaces the connector
//! strategies are built against: send-and-await-reply, the "give up and
//! tell the peer why" path, and opening the initial plaintext half of a
//! stream. The RESET-STREAM step after a STARTTLS upgrade doesn't get its
//! own helper here: it needs a new transport value (`TlsStream::Plain` ->
//! `TlsStream::Tls`), not just fresh parser state on the same one, so
//! `StartTlsConnector` goes through `open_stream_and_get_features` again
//! instead (see `connect/starttls.rs`).

use std::borrow::Cow;
use std::time::Duration;

use futures::{SinkExt, StreamExt};

use tokio::io::{AsyncBufRead, AsyncWrite};

use xmpp_parsers::{
    stream_error::{DefinedCondition, StreamError},
    stream_features::StreamFeatures,
};

use crate::xmlstream::{
    initiate_stream, ConnectorStream, ConnectorStreamElement, ReadError, StreamHeader, Timeouts,
};
use crate::Error;

/// Send `outgoing` and wait for the next stream-level element, bounded by
/// `timeout`.
///
/// Stream errors from the peer are surfaced as [`Error::Protocol`]; the
/// caller is responsible for checking whether the returned element is one
/// of the types it was actually expecting (this crate's recognized element
/// set is narrow enough — §4.4 — that "wrong element" and "schema
/// mismatch" collapse to the same outcome).
pub async fn send_and_wait_for<Io>(
    stream: &mut ConnectorStream<Io>,
    outgoing: &ConnectorStreamElement,
    timeout: Duration,
) -> Result<ConnectorStreamElement, Error>
where
    Io: AsyncBufRead + AsyncWrite + Unpin,
{
    log::debug!("sending stream-level element and awaiting reply");
    stream.send(outgoing).await?;
    stream.flush().await?;

    loop {
        let next = tokio::time::timeout(timeout, stream.next())
            .await
            .map_err(|_| Error::Timeout)?;
        match next {
            None => return Err(Error::Disconnected),
            Some(Ok(ConnectorStreamElement::StreamError(e))) => {
                return Err(xmpp_parsers::stream_error::ReceivedStreamError(e).into())
            }
            Some(Ok(other)) => return Ok(other),
            Some(Err(ReadError::SoftTimeout)) => continue,
            Some(Err(ReadError::HardError(e))) => return Err(e.into()),
            Some(Err(ReadError::ParseError(e))) => return Err(e.into()),
            Some(Err(ReadError::StreamFooterReceived)) => return Err(Error::Disconnected),
        }
    }
}

/// Emit a `<stream:error>` with the given condition and human-readable text,
/// then tear the stream down.
///
/// Used by the STARTTLS strategy when the server's refusal to negotiate TLS
/// violates local policy (`tls_required`).
pub async fn send_stream_error_and_close<Io>(
    mut stream: ConnectorStream<Io>,
    condition: DefinedCondition,
    text: &str,
) -> Result<(), Error>
where
    Io: AsyncWrite + Unpin,
{
    log::debug!("sending stream error and closing: {}", condition);
    let error = StreamError {
        condition,
        text: Some((None, text.to_string())),
        application_specific: Vec::new(),
    };
    let element = ConnectorStreamElement::StreamError(error);
    stream.send(&element).await?;
    SinkExt::close(&mut stream).await?;
    stream.abort();
    Ok(())
}

/// Build the initial, plaintext half of the stream for a connector strategy:
/// open the stream header exchange and await `<stream:features/>`.
pub async fn open_stream_and_get_features<Io>(
    io: Io,
    to: &str,
    stream_ns: &'static str,
    timeout: Duration,
) -> Result<(StreamFeatures, ConnectorStream<Io>), Error>
where
    Io: AsyncBufRead + AsyncWrite + Unpin,
{
    log::debug!("opening stream to {}", to);
    let pending = initiate_stream(
        io,
        stream_ns,
        StreamHeader {
            to: Some(Cow::Borrowed(to)),
            from: None,
            id: None,
        },
        Timeouts::default(),
    )
    .await?;

    tokio::time::timeout(timeout, pending.recv_features::<ConnectorStreamElement>())
        .await
        .map_err(|_| Error::Timeout)?
        .map_err(Error::from)
}
