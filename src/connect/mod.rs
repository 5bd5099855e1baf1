//! The shared `Connector` contract and its two strategies.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};

use xmpp_parsers::stream_features::StreamFeatures;

use crate::xmlstream::ConnectorStream;
use crate::{ConnectionMetadata, ConnectLogger, Error};

pub mod direct_tls;
pub mod starttls;

/// Marker trait for any transport usable as the underlying I/O of a
/// [`ConnectorStream`].
pub trait AsyncReadAndWrite: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncReadAndWrite for T {}

/// The result of a successful connect attempt.
///
/// The specification's data model describes this as the triple
/// `(transport, xml_stream, features)`; here the transport is not a
/// separate field because the [`ConnectorStream`] already owns it
/// exclusively (§5: "the connector holds no separate socket handle") — call
/// [`ConnectorStream::get_stream`] on `stream` for a reference to it (e.g.
/// for TLS channel-binding export in a higher layer).
pub struct ConnectOutcome<Io> {
    /// The negotiated XML stream, ready for the next layer (SASL, stanza
    /// routing) to take over.
    pub stream: ConnectorStream<Io>,
    /// The features observed on the stream the caller should act on: the
    /// post-TLS-reset features if a TLS upgrade occurred, otherwise the
    /// initial features (§3: `ConnectOutcome`).
    pub features: StreamFeatures,
}

/// Shared contract implemented by each connector strategy (§4.1).
///
/// A connector attempts exactly one TCP endpoint per `connect` call; DNS/SRV
/// resolution and retry loops are the caller's responsibility.
pub trait Connector: Send + Sync {
    /// The concrete transport type this strategy produces.
    type Stream: AsyncReadAndWrite;

    /// Whether this strategy is able to negotiate TLS at all.
    ///
    /// Both strategies in this crate return `true`; the property exists so
    /// that future non-TLS-capable strategies (e.g. a plaintext-only debug
    /// connector) can opt out of the TLS-required policy check up front.
    fn tls_supported(&self) -> bool;

    /// Connect to `host:port`, negotiate the stream (and TLS, per the
    /// strategy and `metadata.tls_required`), and return the usable stream.
    ///
    /// `domain` is the XMPP service name: used as the stream-header `to`
    /// attribute and, where applicable, as the TLS server name. `host`/`port`
    /// are the resolved endpoint. `timeout` bounds each individual
    /// protocol wait, not the call as a whole. `base_logger`, when supplied,
    /// scopes the handful of attempt-specific warnings (currently only the
    /// Direct-TLS ALPN warnings) to a child target derived from `domain`;
    /// when `None` those warnings are skipped entirely rather than falling
    /// back to the crate's ambient `log` target.
    ///
    /// On any failure after a stream has been constructed, the stream is
    /// aborted before the error is returned.
    fn connect(
        &self,
        metadata: &ConnectionMetadata,
        domain: &str,
        host: &str,
        port: u16,
        timeout: Duration,
        base_logger: Option<&ConnectLogger>,
    ) -> impl std::future::Future<Output = Result<ConnectOutcome<Self::Stream>, Error>> + Send;
}
