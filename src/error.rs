//! Error types for the connector core.

use std::error::Error as StdError;
use std::fmt;
use std::io::Error as IoError;

#[cfg(all(feature = "tls-rust", not(feature = "tls-native")))]
use tokio_rustls::rustls::pki_types::InvalidDnsNameError;
#[cfg(all(feature = "tls-rust", not(feature = "tls-native")))]
use tokio_rustls::rustls::Error as RustlsError;

#[cfg(feature = "tls-native")]
use native_tls::Error as NativeTlsError;

use xmpp_parsers::stream_error::{ReceivedStreamError, SentStreamError};

/// Top-level error type.
#[derive(Debug)]
pub enum Error {
    /// I/O error, bubbled up unchanged from the transport or the XML parser.
    Io(IoError),
    /// A protocol-level problem while negotiating the stream.
    Protocol(ProtocolError),
    /// TLS could not be established even though it was required.
    ///
    /// The two messages used by this crate are fixed by the negotiation
    /// contract: `"STARTTLS not supported by server, but required by
    /// client"` and `"server failed to STARTTLS"`.
    TlsUnavailable(&'static str),
    /// TLS handshake or context setup failed.
    Tls(TlsError),
    /// A suspension point exceeded its timeout.
    Timeout,
    /// The peer closed the stream.
    Disconnected,
    /// XML/XSO schema mismatch while parsing a stream-level element.
    Xso(xso::error::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(e) => write!(fmt, "I/O error: {}", e),
            Error::Protocol(e) => write!(fmt, "protocol error: {}", e),
            Error::TlsUnavailable(msg) => write!(fmt, "TLS unavailable: {}", msg),
            Error::Tls(e) => write!(fmt, "TLS error: {}", e),
            Error::Timeout => write!(fmt, "timed out waiting for peer"),
            Error::Disconnected => write!(fmt, "disconnected"),
            Error::Xso(e) => write!(fmt, "error with expected stanza schema: {}", e),
        }
    }
}

impl StdError for Error {}

impl From<IoError> for Error {
    fn from(e: IoError) -> Self {
        Error::Io(e)
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Error::Protocol(e)
    }
}

impl From<TlsError> for Error {
    fn from(e: TlsError) -> Self {
        Error::Tls(e)
    }
}

impl From<xso::error::Error> for Error {
    fn from(e: xso::error::Error) -> Self {
        Error::Xso(e)
    }
}

impl From<ReceivedStreamError> for Error {
    fn from(e: ReceivedStreamError) -> Self {
        Error::Protocol(ProtocolError::ReceivedStreamError(e))
    }
}

/// XMPP stream-negotiation-level error.
#[derive(Debug)]
pub enum ProtocolError {
    /// The peer sent a `<stream:error>`.
    ReceivedStreamError(ReceivedStreamError),
    /// We sent a `<stream:error>` and tore the stream down ourselves.
    SentStreamError(SentStreamError),
    /// A stream-level element arrived that was not one of the types the
    /// caller was waiting for.
    UnexpectedElement,
    /// The stream header was missing or malformed.
    InvalidStreamHeader,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProtocolError::ReceivedStreamError(e) => write!(fmt, "{}", e),
            ProtocolError::SentStreamError(e) => write!(fmt, "{}", e),
            ProtocolError::UnexpectedElement => {
                write!(fmt, "unexpected stream-level element during negotiation")
            }
            ProtocolError::InvalidStreamHeader => write!(fmt, "invalid stream header"),
        }
    }
}

impl StdError for ProtocolError {}

/// TLS-backend-specific error, gated on whichever of `tls-rust` /
/// `tls-native` is compiled in.
#[derive(Debug)]
pub enum TlsError {
    /// Error from the TLS library itself (handshake failure, alert, ...).
    #[cfg(all(feature = "tls-rust", not(feature = "tls-native")))]
    Rustls(RustlsError),
    /// Error from the TLS library itself (handshake failure, alert, ...).
    #[cfg(feature = "tls-native")]
    Native(NativeTlsError),
    /// `domain` could not be turned into a valid TLS server name.
    #[cfg(all(feature = "tls-rust", not(feature = "tls-native")))]
    InvalidDnsName(InvalidDnsNameError),
}

impl fmt::Display for TlsError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            #[cfg(all(feature = "tls-rust", not(feature = "tls-native")))]
            TlsError::Rustls(e) => write!(fmt, "{}", e),
            #[cfg(feature = "tls-native")]
            TlsError::Native(e) => write!(fmt, "{}", e),
            #[cfg(all(feature = "tls-rust", not(feature = "tls-native")))]
            TlsError::InvalidDnsName(e) => write!(fmt, "{}", e),
        }
    }
}

impl StdError for TlsError {}

#[cfg(all(feature = "tls-rust", not(feature = "tls-native")))]
impl From<RustlsError> for TlsError {
    fn from(e: RustlsError) -> Self {
        TlsError::Rustls(e)
    }
}

#[cfg(all(feature = "tls-rust", not(feature = "tls-native")))]
impl From<InvalidDnsNameError> for TlsError {
    fn from(e: InvalidDnsNameError) -> Self {
        TlsError::InvalidDnsName(e)
    }
}

#[cfg(feature = "tls-native")]
impl From<NativeTlsError> for TlsError {
    fn from(e: NativeTlsError) -> Self {
        TlsError::Native(e)
    }
}
