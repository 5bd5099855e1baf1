//! The certificate-verifier policy object.

use core::future::Future;
use core::pin::Pin;

use tokio::net::TcpStream;

use crate::tls::TlsContext;
use crate::{ConnectionMetadata, Error};

/// A boxed future, used to keep [`Verifier`] object-safe.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Policy object consulted by both connector strategies around the TLS
/// handshake.
///
/// A fresh verifier is constructed by [`crate::ConnectionMetadata`] for
/// every connect attempt; none of its methods are called more than the
/// connect attempt requires (see the per-strategy call order in the crate
/// documentation).
pub trait Verifier: Send {
    /// Run before any TLS handshake is attempted.
    ///
    /// May perform out-of-band preparation (DANE/DNSSEC lookups and
    /// similar). Failing here aborts the connect attempt before any TLS
    /// context is built. `metadata` is the bundle this verifier was itself
    /// constructed from, handed back in case a verifier needs to read
    /// sibling policy (e.g. `tls_required`) alongside the peer it's checking.
    fn pre_handshake<'a>(
        &'a mut self,
        domain: &'a str,
        host: &'a str,
        port: u16,
        metadata: &'a ConnectionMetadata,
    ) -> BoxFuture<'a, Result<(), Error>>;

    /// Mutate the TLS context for this peer before the handshake starts.
    ///
    /// Called after ALPN has been configured on the Direct-TLS path (§4.3),
    /// and right before `starttls`/the TLS connect on both paths. `transport`
    /// is the already-connected socket the handshake is about to run over
    /// (DANE/SNI-dependent policy needs the real peer address, not just the
    /// domain string).
    fn setup_context(&mut self, ctx: &mut TlsContext, transport: &TcpStream);

    /// Run after the TLS handshake completes, before the connector treats
    /// the connection as usable.
    ///
    /// Failing here aborts the handshake result even though the TLS library
    /// itself accepted the peer's certificate chain. `transport` is the same
    /// socket passed to `setup_context`, recovered from the now-upgraded TLS
    /// stream.
    fn post_handshake<'a>(&'a mut self, transport: &'a TcpStream) -> BoxFuture<'a, Result<(), Error>>;
}

/// A [`Verifier`] that accepts whatever the TLS backend's default
/// certificate validation already decided, performing no extra checks.
///
/// This is the verifier most callers reach for: it runs no DANE/DNSSEC
/// preparation and defers entirely to the root store baked into the
/// `TlsContext`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultVerifier;

impl Verifier for DefaultVerifier {
    fn pre_handshake<'a>(
        &'a mut self,
        _domain: &'a str,
        _host: &'a str,
        _port: u16,
        _metadata: &'a ConnectionMetadata,
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async { Ok(()) })
    }

    fn setup_context(&mut self, _ctx: &mut TlsContext, _transport: &TcpStream) {}

    fn post_handshake<'a>(&'a mut self, _transport: &'a TcpStream) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async { Ok(()) })
    }
}
