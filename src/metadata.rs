//! [`ConnectionMetadata`]: the policy bundle supplied to a connect attempt.

use crate::tls::TlsContext;
use crate::verifier::{DefaultVerifier, Verifier};

/// Policy inputs for a single connect attempt.
///
/// A `ConnectionMetadata` is reusable across many connect attempts (it holds
/// no per-call mutable state); the factories it wraps are invoked at most
/// once per attempt, and only when TLS will actually be attempted (§3,
/// invariant 3).
pub struct ConnectionMetadata {
    /// If TLS cannot be established, connect must fail rather than fall
    /// back to a plaintext stream.
    pub tls_required: bool,
    verifier_factory: Box<dyn Fn() -> Box<dyn Verifier> + Send + Sync>,
    context_factory: Box<dyn Fn() -> TlsContext + Send + Sync>,
}

impl ConnectionMetadata {
    /// Build a new metadata bundle.
    ///
    /// `verifier_factory` and `context_factory` construct one fresh
    /// `Verifier`/`TlsContext` per connect attempt; neither is called
    /// eagerly here.
    pub fn new(
        tls_required: bool,
        verifier_factory: impl Fn() -> Box<dyn Verifier> + Send + Sync + 'static,
        context_factory: impl Fn() -> TlsContext + Send + Sync + 'static,
    ) -> Self {
        Self {
            tls_required,
            verifier_factory: Box::new(verifier_factory),
            context_factory: Box::new(context_factory),
        }
    }

    /// Construct a fresh [`Verifier`] for the connect attempt in progress.
    pub fn new_verifier(&self) -> Box<dyn Verifier> {
        (self.verifier_factory)()
    }

    /// Construct a fresh [`TlsContext`] for the connect attempt in progress.
    pub fn new_tls_context(&self) -> TlsContext {
        (self.context_factory)()
    }

    /// Build metadata using [`DefaultVerifier`] and a `TlsContext` seeded
    /// from whichever root-certificate source is enabled
    /// (`rustls-native-certs` / `webpki-roots` for the `tls-rust` backend;
    /// the platform store for `tls-native`).
    pub fn new_default(tls_required: bool) -> Self {
        Self::new(
            tls_required,
            || Box::new(DefaultVerifier) as Box<dyn Verifier>,
            default_tls_context,
        )
    }
}

#[cfg(all(feature = "tls-rust", not(feature = "tls-native")))]
fn default_tls_context() -> TlsContext {
    use tokio_rustls::rustls::{ClientConfig, RootCertStore};

    let mut roots = RootCertStore::empty();
    #[cfg(feature = "rustls-native-certs")]
    {
        let loaded = rustls_native_certs::load_native_certs();
        roots.add_parsable_certificates(loaded.certs);
    }
    #[cfg(feature = "webpki-roots")]
    {
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsContext::new(config)
}

#[cfg(feature = "tls-native")]
fn default_tls_context() -> TlsContext {
    TlsContext::new(native_tls::TlsConnector::builder())
}

impl core::fmt::Debug for ConnectionMetadata {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ConnectionMetadata")
            .field("tls_required", &self.tls_required)
            .finish_non_exhaustive()
    }
}
