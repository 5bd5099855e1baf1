//! A per-connect-attempt logging handle.
//!
//! `log`'s macros are a stateless global facade, so there is nothing to
//! "pass" by default — the ambient `log::debug!`/`log::warn!` calls
//! throughout `connect/*.rs` stay exactly as they are. This type exists only
//! for the handful of warnings the specification ties to an optional,
//! caller-supplied logger (the ALPN-configuration warnings on the Direct-TLS
//! path): when no `ConnectLogger` is supplied, those specific warnings are
//! skipped rather than falling back to the global logger.

/// A named logging target scoped to one connect attempt, built once per
/// [`crate::connect::Connector::connect`] call.
#[derive(Debug, Clone)]
pub struct ConnectLogger {
    target: String,
}

impl ConnectLogger {
    /// Build a logger scoped to `domain`.
    pub fn child_for(domain: &str) -> Self {
        Self {
            target: format!("xmpp_connect::connect::{domain}"),
        }
    }

    pub(crate) fn warn(&self, msg: &str) {
        log::warn!(target: self.target.as_str(), "{}", msg);
    }
}
