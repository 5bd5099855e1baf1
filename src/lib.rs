// Copyright (c) 2024 xmpp-connect contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! XMPP client connector core.
//!
//! This crate negotiates the plumbing an XMPP client needs before handing
//! off to SASL and stanza routing: opening the XML stream, reaching TLS
//! (in-band via `<starttls/>` or up front via Direct-TLS/XEP-0368), and
//! returning a usable transport plus the stream features the peer
//! advertised. It does not resolve DNS/SRV records, authenticate, or route
//! stanzas — those are the caller's concern.
//!
//! The two entry points are [`connect::starttls::StartTlsConnector`] and
//! [`connect::direct_tls::DirectTlsConnector`], both implementing
//! [`connect::Connector`]. Callers supply a [`ConnectionMetadata`] describing
//! their TLS policy (required or opportunistic) and how to build a
//! [`Verifier`] and [`TlsContext`] for each attempt.

#![deny(unsafe_code)]

extern crate alloc;

#[cfg(all(feature = "tls-rust", feature = "tls-native"))]
compile_error!("features \"tls-rust\" and \"tls-native\" are mutually exclusive");
#[cfg(not(any(feature = "tls-rust", feature = "tls-native")))]
compile_error!("exactly one of features \"tls-rust\" or \"tls-native\" must be enabled");

pub mod connect;
mod error;
mod exchange;
mod logger;
mod metadata;
mod tls;
mod verifier;
mod xmlstream;

pub use connect::{AsyncReadAndWrite, ConnectOutcome, Connector};
pub use error::{Error, ProtocolError, TlsError};
pub use logger::ConnectLogger;
pub use metadata::ConnectionMetadata;
pub use tls::{AlpnOutcome, TlsContext, ALPN_XMPP_CLIENT};
pub use verifier::{BoxFuture, DefaultVerifier, Verifier};
pub use xmlstream::{
    ConnectorStream, ConnectorStreamElement, ReadError, StartTlsReply, StreamHeader, Timeouts,
};
