// Copyright (c) 2024 xmpp-connect contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The narrow set of stream-level elements the connector itself recognizes.
//!
//! Stanza routing (IQ/message/presence) and SASL live entirely outside this
//! crate; the connector only ever needs to recognize the STARTTLS nonzas and
//! stream-level errors exchanged during negotiation.

use xso::{AsXml, FromXml};

use xmpp_parsers::{
    ns,
    starttls::{Proceed, Request},
    stream_error::StreamError,
};

/// `<failure/>` in the STARTTLS namespace: the server declines to negotiate
/// TLS after a `<starttls/>` request.
///
/// RFC 6120 §5.4.2.3 defines this element, but the upstream stanza crate
/// this workspace depends on has not modeled it yet (only `Request` and
/// `Proceed` are present there) — it is added here rather than left
/// unrepresentable, following the same derive shape as its siblings.
#[derive(FromXml, AsXml, PartialEq, Debug, Clone)]
#[xml(namespace = ns::TLS, name = "failure")]
pub struct Failure;

/// Any element that can appear in reply to `<starttls/>`.
#[derive(FromXml, AsXml, Debug, Clone)]
#[xml()]
pub enum StartTlsReply {
    /// `<proceed/>`: the server will begin the TLS handshake.
    #[xml(transparent)]
    Proceed(Proceed),
    /// `<failure/>`: the server declines.
    #[xml(transparent)]
    Failure(Failure),
}

/// Any stream-level element the connector may receive during negotiation.
#[derive(FromXml, AsXml, Debug)]
#[xml()]
pub enum ConnectorStreamElement {
    /// Request to start TLS, as echoed back by a loopback test peer; the
    /// connector itself never expects to *receive* this, only send it, but
    /// it is part of the same nonza family and tests exercise both
    /// directions over one duplex pipe.
    #[xml(transparent)]
    StartTlsRequest(Request),

    /// Reply to a `<starttls/>` request.
    #[xml(transparent)]
    StartTls(StartTlsReply),

    /// A `<stream:error>` sent by the peer.
    #[xml(transparent)]
    StreamError(StreamError),
}
