//! TLS context plumbing shared by the STARTTLS and Direct-TLS strategies.
//!
//! Exactly one of the `tls-rust` / `tls-native` features is compiled in
//! (enforced in `lib.rs`), so `TlsContext` has a single concrete backend per
//! build rather than being an enum over both.

/// The ALPN protocol advertised for XMPP-over-TLS (direct TLS) connections.
pub const ALPN_XMPP_CLIENT: &[u8] = b"xmpp-client";

/// Outcome of attempting to configure ALPN on a [`TlsContext`].
///
/// The two non-`Applied` variants exist to drive the two distinct warnings
/// the Direct-TLS strategy must log: `Unsupported` covers a context type
/// that never exposes ALPN configuration at all, `Failed` covers one that
/// exposes the call but the underlying library rejects it at runtime. With
/// the TLS backends this crate ships, only `rustls` reaches `Applied` and
/// only `native-tls` reaches `Unsupported`; `Failed` is kept for backends
/// (or platform-specific native-tls builds) whose ALPN support is
/// best-effort, and is exercised directly in tests via a fake context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlpnOutcome {
    /// ALPN protocols were recorded on the context and will be offered
    /// during the handshake.
    Applied,
    /// This context type has no ALPN configuration surface.
    Unsupported,
    /// This context type has an ALPN configuration surface, but applying it
    /// failed.
    Failed,
}

#[cfg(all(feature = "tls-rust", not(feature = "tls-native")))]
mod backend {
    use super::{AlpnOutcome, ALPN_XMPP_CLIENT};
    use tokio_rustls::rustls::ClientConfig;

    /// A TLS client context, backed by `rustls`.
    pub struct TlsContext {
        pub(crate) config: ClientConfig,
    }

    impl TlsContext {
        /// Build a context from a root certificate store.
        pub fn new(config: ClientConfig) -> Self {
            Self { config }
        }

        /// Attempt to restrict the handshake to exactly the
        /// [`ALPN_XMPP_CLIENT`] protocol.
        pub fn set_alpn_xmpp_client(&mut self) -> AlpnOutcome {
            self.config.alpn_protocols = vec![ALPN_XMPP_CLIENT.to_vec()];
            AlpnOutcome::Applied
        }
    }
}

#[cfg(feature = "tls-native")]
mod backend {
    use super::AlpnOutcome;
    use native_tls::TlsConnectorBuilder;

    /// A TLS client context, backed by `native-tls`.
    pub struct TlsContext {
        pub(crate) builder: TlsConnectorBuilder,
    }

    impl TlsContext {
        /// Build a context from a connector builder.
        pub fn new(builder: TlsConnectorBuilder) -> Self {
            Self { builder }
        }

        /// `native-tls` does not expose ALPN configuration on its
        /// connector builder, so this always reports [`AlpnOutcome::Unsupported`].
        pub fn set_alpn_xmpp_client(&mut self) -> AlpnOutcome {
            AlpnOutcome::Unsupported
        }
    }
}

pub use backend::TlsContext;
