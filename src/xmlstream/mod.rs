// Copyright (c) 2024 xmpp-connect contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! RFC 6120 XML stream framing, initiator side only.
//!
//! This is a deliberately narrow slice of the full XML-stream state machine:
//! it is used exclusively to drive the connector's own negotiation
//! (stream-header exchange, `<stream:features/>`, `<starttls/>`), never to
//! carry authenticated stanza traffic. The typestate chain mirrors the shape
//! used by the teacher crate this workspace is descended from:
//!
//! 1. [`initiate_stream`] sends the outbound header and receives the peer's,
//!    returning [`PendingFeaturesRecv`].
//! 2. [`PendingFeaturesRecv::recv_features`] receives `<stream:features/>`
//!    and returns the usable [`XmlStream`].
//! 3. [`XmlStream::initiate_reset`] discards all parser/writer state after a
//!    TLS upgrade, producing a fresh [`InitiatingStream`] to go through the
//!    same dance again.

mod common;
mod element;

use core::fmt;
use core::pin::Pin;
use core::task::{Context, Poll};
use std::borrow::Cow;
use std::io;

use futures::{ready, Sink, SinkExt, Stream};

use tokio::io::{AsyncBufRead, AsyncWrite};

use xso::{AsXml, FromXml, Item};

use xmpp_parsers::stream_features::StreamFeatures;

use self::common::{RawXmlStream, ReadXso, ReadXsoError, ReadXsoState};

pub use self::element::{ConnectorStreamElement, StartTlsReply};

/// Convenience alias for an XML stream carrying [`ConnectorStreamElement`].
pub type ConnectorStream<Io> = XmlStream<Io, ConnectorStreamElement>;

/// Error surfaced from [`XmlStream`]'s `Stream` implementation.
#[derive(Debug)]
pub enum ReadError {
    /// A non-recoverable I/O or well-formedness error. The stream is dead.
    HardError(io::Error),
    /// The read timeout elapsed while waiting for the next element.
    ///
    /// Recoverable: callers may keep polling, bounded by their own
    /// higher-level timeout.
    SoftTimeout,
    /// The element didn't match the expected schema. Recoverable: the
    /// parser is back at the same nesting depth it started at.
    ParseError(xso::error::Error),
    /// The stream footer (`</stream:stream>`) was received.
    StreamFooterReceived,
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadError::HardError(e) => write!(f, "{}", e),
            ReadError::SoftTimeout => write!(f, "read timeout"),
            ReadError::ParseError(e) => write!(f, "{}", e),
            ReadError::StreamFooterReceived => write!(f, "stream footer received"),
        }
    }
}

impl std::error::Error for ReadError {}

impl From<ReadXsoError> for ReadError {
    fn from(other: ReadXsoError) -> Self {
        match other {
            ReadXsoError::Hard(e) => Self::HardError(e),
            ReadXsoError::SoftTimeout => Self::SoftTimeout,
            ReadXsoError::Parse(e) => Self::ParseError(e),
            ReadXsoError::Footer => Self::StreamFooterReceived,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteState {
    Open,
    SendElementFoot,
    FooterSent,
    Failed,
}

impl WriteState {
    fn check_writable(&self) -> io::Result<()> {
        match self {
            WriteState::Open => Ok(()),
            WriteState::SendElementFoot | WriteState::FooterSent => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "stream footer already sent",
            )),
            WriteState::Failed => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "stream is in a failed state",
            )),
        }
    }

    fn check_ok(&self) -> io::Result<()> {
        match self {
            WriteState::Failed => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "stream is in a failed state",
            )),
            _ => Ok(()),
        }
    }
}

/// Initiate an XML stream on a freshly-connected transport.
///
/// Sends the outbound stream header and parses the peer's in response.
/// `stream_ns` is the default XML namespace declared on the header (e.g.
/// `jabber:client`).
pub async fn initiate_stream<Io: AsyncBufRead + AsyncWrite + Unpin>(
    io: Io,
    stream_ns: &'static str,
    stream_header: StreamHeader<'_>,
    timeouts: common::Timeouts,
) -> io::Result<PendingFeaturesRecv<Io>> {
    let stream = InitiatingStream(RawXmlStream::new(io, stream_ns, timeouts));
    stream.send_header(stream_header).await
}

/// Type state for an initiator stream which has not yet sent its stream
/// header.
pub struct InitiatingStream<Io>(RawXmlStream<Io>);

impl<Io: AsyncBufRead + AsyncWrite + Unpin> InitiatingStream<Io> {
    /// Send the stream header and receive the peer's.
    pub async fn send_header(
        self,
        header: StreamHeader<'_>,
    ) -> io::Result<PendingFeaturesRecv<Io>> {
        let Self(mut stream) = self;
        header.send(Pin::new(&mut stream)).await?;
        stream.flush().await?;
        let header = StreamHeader::recv(Pin::new(&mut stream)).await?;
        Ok(PendingFeaturesRecv { stream, header })
    }
}

/// Type state for an initiator stream which has exchanged stream headers
/// but not yet received `<stream:features/>`.
pub struct PendingFeaturesRecv<Io> {
    stream: RawXmlStream<Io>,
    header: StreamHeader<'static>,
}

impl<Io> PendingFeaturesRecv<Io> {
    /// The stream header contents as sent by the peer.
    pub fn header(&self) -> StreamHeader<'_> {
        StreamHeader {
            from: self.header.from.as_ref().map(|x| Cow::Borrowed(&**x)),
            to: self.header.to.as_ref().map(|x| Cow::Borrowed(&**x)),
            id: self.header.id.as_ref().map(|x| Cow::Borrowed(&**x)),
        }
    }
}

impl<Io: AsyncBufRead + AsyncWrite + Unpin> PendingFeaturesRecv<Io> {
    /// Receive the peer's stream features, yielding the usable stream.
    pub async fn recv_features<T: FromXml + AsXml>(
        self,
    ) -> io::Result<(StreamFeatures, XmlStream<Io, T>)> {
        let Self {
            mut stream,
            header: _,
        } = self;
        let features = ReadXso::read_from(Pin::new(&mut stream))
            .await
            .map_err(|e| match e {
                ReadXsoError::Hard(e) => e,
                ReadXsoError::SoftTimeout => {
                    io::Error::new(io::ErrorKind::TimedOut, "timed out awaiting stream features")
                }
                ReadXsoError::Parse(e) => io::Error::new(io::ErrorKind::InvalidData, e),
                ReadXsoError::Footer => {
                    io::Error::new(io::ErrorKind::UnexpectedEof, "stream closed before features")
                }
            })?;
        Ok((features, XmlStream::wrap(stream)))
    }
}

pin_project_lite::pin_project! {
    /// A negotiated XML stream, ready to exchange stream-level elements of
    /// type `T`.
    pub struct XmlStream<Io, T: FromXml> {
        #[pin]
        inner: RawXmlStream<Io>,
        read_state: Option<ReadXsoState<T>>,
        write_state: WriteState,
    }
}

impl<Io, T: FromXml> XmlStream<Io, T> {
    /// Obtain a reference to the underlying transport.
    pub fn get_stream(&self) -> &Io {
        self.inner.get_stream()
    }

    /// Discard this stream without attempting a clean XML-level shutdown.
    ///
    /// Every `XmlStream` constructed by a connector strategy must either be
    /// returned in a successful outcome or have `abort` called on it before
    /// the error propagates. Calling this is equivalent to simply dropping
    /// the stream: the underlying transport's own `Drop` impl closes the
    /// socket, so `abort` exists to make that discipline visible at the
    /// call site rather than relying on an implicit drop deep in a `?`
    /// chain. This also means a stream that is dropped without an explicit
    /// `abort()` call (e.g. because the connect future itself was dropped)
    /// tears the transport down all the same.
    pub fn abort(self) {
        drop(self);
    }
}

impl<Io: AsyncBufRead, T: FromXml + AsXml> XmlStream<Io, T> {
    fn wrap(inner: RawXmlStream<Io>) -> Self {
        Self {
            inner,
            read_state: Some(ReadXsoState::default()),
            write_state: WriteState::Open,
        }
    }

    fn assert_retypable(&self) {
        match self.read_state {
            Some(ReadXsoState::PreData) => (),
            Some(_) => panic!("cannot reset stream: element parsing in progress!"),
            None => panic!("cannot reset stream: stream footer received!"),
        }
        self.write_state
            .check_writable()
            .unwrap_or_else(|e| panic!("cannot reset stream: {}", e));
    }
}

impl<Io: AsyncBufRead + AsyncWrite + Unpin, T: FromXml + AsXml + fmt::Debug> XmlStream<Io, T> {
    /// Discard all XML parser/writer state and return an `InitiatingStream`
    /// ready to send a fresh `<stream:stream>` header.
    ///
    /// # Panics
    ///
    /// Panics if an element is mid-parse, or the stream has already been
    /// closed or errored. Under normal connector use this can only be
    /// reached right after `recv_features`, so neither condition applies.
    pub fn initiate_reset(self) -> InitiatingStream<Io> {
        self.assert_retypable();
        let mut stream = self.inner;
        Pin::new(&mut stream).reset_state();
        InitiatingStream(stream)
    }

    /// Discard all XML state and return the inner transport.
    pub fn into_inner(self) -> Io {
        self.assert_retypable();
        self.inner.into_inner()
    }
}

impl<Io: AsyncBufRead, T: FromXml + AsXml + fmt::Debug> Stream for XmlStream<Io, T> {
    type Item = Result<T, ReadError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let result = match this.read_state.as_mut() {
            None => return Poll::Ready(Some(Err(ReadError::StreamFooterReceived))),
            Some(read_state) => ready!(read_state.poll_advance(this.inner, cx)),
        };
        let result = match result {
            Ok(v) => Poll::Ready(Some(Ok(v))),
            Err(ReadXsoError::Footer) => {
                *this.read_state = None;
                Poll::Ready(Some(Err(ReadError::StreamFooterReceived)))
            }
            Err(e) => Poll::Ready(Some(Err(e.into()))),
        };
        if this.read_state.is_some() {
            *this.read_state = Some(ReadXsoState::default());
        }
        result
    }
}

impl<'x, Io: AsyncWrite, T: FromXml + AsXml + fmt::Debug> Sink<&'x T> for XmlStream<Io, T> {
    type Error = io::Error;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let this = self.project();
        this.write_state.check_writable()?;
        this.inner.poll_ready(cx)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let this = self.project();
        this.write_state.check_writable()?;
        this.inner.poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let mut this = self.project();
        this.write_state.check_ok()?;
        loop {
            match this.write_state {
                WriteState::Open => {
                    *this.write_state = WriteState::SendElementFoot;
                }
                WriteState::SendElementFoot => {
                    match ready!(this.inner.as_mut().poll_ready(cx))
                        .and_then(|_| this.inner.as_mut().start_send(Item::ElementFoot))
                    {
                        Ok(()) => (),
                        Err(e) => {
                            *this.write_state = WriteState::Failed;
                            return Poll::Ready(Err(e));
                        }
                    }
                    *this.write_state = WriteState::FooterSent;
                }
                WriteState::FooterSent => break,
                WriteState::Failed => unreachable!(),
            }
        }
        this.inner.poll_close(cx)
    }

    fn start_send(self: Pin<&mut Self>, item: &'x T) -> Result<(), Self::Error> {
        let this = self.project();
        this.write_state.check_writable()?;
        this.inner.start_send_xso(item)
    }
}

pub use common::{StreamHeader, Timeouts};

#[cfg(test)]
mod tests;
