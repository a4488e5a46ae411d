//! The signaling collaborator (spec.md §6): SIP transport, parsing, the
//! transaction layer, and the dialog factory are all out of scope for this
//! crate. This module defines the interface the session core needs from
//! them, mirroring the shape `ezk-sip-ua`'s `invite` module uses against
//! `ezk-sip-core` (`Dialog`, `Usage`, `ClientInvTsx`, `ServerInvTsx`) but
//! reduced to exactly what spec.md §6 lists. A concrete SIP stack plugs in
//! by implementing these traits; none is implemented here.

use bytes::Bytes;
use bytesstr::BytesStr;
use sip_types::{Code, Method};
use std::fmt;
use thiserror::Error;

/// An extra header as a raw name/value pair, the form `extraHeaders` options
/// take throughout spec.md §6.
pub type Header = (BytesStr, BytesStr);

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("request timed out")]
    Timeout,
    #[error("dialog construction failed: {0}")]
    DialogConstruction(String),
}

/// Common accessors shared by incoming requests and responses
/// (spec.md §6: "Incoming request/response objects with: ... call_id,
/// from_tag, to_tag, body, getHeader(name), hasHeader(name)").
pub trait SipMessage {
    fn call_id(&self) -> &BytesStr;
    fn from_tag(&self) -> &BytesStr;
    fn to_tag(&self) -> Option<&BytesStr>;
    fn body(&self) -> Option<&Bytes>;
    fn get_header(&self, name: &str) -> Option<&BytesStr>;
    fn has_header(&self, name: &str) -> bool {
        self.get_header(name).is_some()
    }
    fn content_type(&self) -> Option<&BytesStr> {
        self.get_header("Content-Type")
    }
}

/// An inbound SIP request delivered to the session (INVITE, CANCEL, ACK,
/// BYE, INFO, re-INVITE).
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    pub method: Method,
    pub call_id: BytesStr,
    pub from_tag: BytesStr,
    pub to_tag: Option<BytesStr>,
    pub headers: Vec<Header>,
    pub body: Option<Bytes>,
}

impl SipMessage for IncomingRequest {
    fn call_id(&self) -> &BytesStr {
        &self.call_id
    }
    fn from_tag(&self) -> &BytesStr {
        &self.from_tag
    }
    fn to_tag(&self) -> Option<&BytesStr> {
        self.to_tag.as_ref()
    }
    fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }
    fn get_header(&self, name: &str) -> Option<&BytesStr> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }
}

/// An inbound SIP response to the initial INVITE (spec.md §4.2).
#[derive(Debug, Clone)]
pub struct IncomingResponse {
    pub status_code: Code,
    pub call_id: BytesStr,
    pub from_tag: BytesStr,
    pub to_tag: Option<BytesStr>,
    pub headers: Vec<Header>,
    pub body: Option<Bytes>,
}

impl SipMessage for IncomingResponse {
    fn call_id(&self) -> &BytesStr {
        &self.call_id
    }
    fn from_tag(&self) -> &BytesStr {
        &self.from_tag
    }
    fn to_tag(&self) -> Option<&BytesStr> {
        self.to_tag.as_ref()
    }
    fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }
    fn get_header(&self, name: &str) -> Option<&BytesStr> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }
}

/// A dialog identifier: `call_id ⧺ local_tag ⧺ remote_tag` (spec.md §3).
///
/// Early dialogs share `call_id`/`local_tag` but differ in `remote_tag`
/// (forking).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialogId {
    pub call_id: BytesStr,
    pub local_tag: BytesStr,
    pub remote_tag: BytesStr,
}

impl fmt::Display for DialogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};{};{}", self.call_id, self.local_tag, self.remote_tag)
    }
}

/// A confirmed or early dialog (spec.md §6: "Dialog factory").
///
/// `ezk-sip-ua`'s `Dialog` (see `dialog/mod.rs`) is the concrete analogue;
/// this trait keeps only the operations the session core drives directly.
#[async_trait::async_trait]
pub trait Dialog: Send + Sync + fmt::Debug {
    fn id(&self) -> DialogId;

    /// Build and send an in-dialog request (`ACK`, `BYE`, re-INVITE),
    /// optionally carrying a body and extra headers. Returns the final
    /// response for requests that expect one; `ACK` sends-and-forgets.
    async fn send_request(
        &self,
        method: Method,
        extra_headers: Vec<Header>,
        body: Option<Bytes>,
    ) -> Result<Option<IncomingResponse>, SignalingError>;

    /// Build (but do not send) a response to `request` carrying `code`,
    /// optional reason phrase, extra headers and body.
    async fn create_response(
        &self,
        request: &IncomingRequest,
        code: Code,
        reason: Option<BytesStr>,
        extra_headers: Vec<Header>,
        body: Option<Bytes>,
    ) -> Result<OutgoingResponse, SignalingError>;

    /// Tear the dialog down. Idempotent.
    async fn terminate(&self);
}

/// A response built via [`Dialog::create_response`], ready to be handed to a
/// [`ServerTransaction`].
#[derive(Debug, Clone)]
pub struct OutgoingResponse {
    pub code: Code,
    pub reason: Option<BytesStr>,
    pub headers: Vec<Header>,
    pub body: Option<Bytes>,
}

/// The server-side transaction for a single inbound request (spec.md §6:
/// "access to a server transaction that emits `stateChanged` with terminal
/// state `TERMINATED`").
#[async_trait::async_trait]
pub trait ServerTransaction: Send + Sync {
    /// Send `response` on this transaction. For an INVITE transaction
    /// responding with a provisional or 2xx, the transaction itself is
    /// responsible for retransmission per the transport's own rules; this
    /// crate's `invite2xxTimer` exists because the INVITE server
    /// transaction is destroyed after the first 2xx (RFC 3261 §13.3.1.4) and
    /// must be retransmitted at the application level instead.
    async fn respond(&self, response: OutgoingResponse) -> Result<(), SignalingError>;

    /// Resolves once the transaction reaches its terminal state. Used by the
    /// deferred-BYE race (spec.md §4.1) as one of its two triggers.
    async fn wait_terminated(&self);
}

/// The outgoing-request builder and sender (spec.md §6: "Outgoing request
/// builder taking (method, target, UA, params, headers); exposes
/// `cancel(reason)` and `send()` via a request sender").
#[async_trait::async_trait]
pub trait RequestSender: Send + Sync {
    /// Send the initial INVITE (or a stand-alone request such as CANCEL) and
    /// wait for the next response. Returns `None` once the underlying
    /// transaction is exhausted (no more responses will arrive).
    async fn send(&mut self) -> Result<(), SignalingError>;

    /// Cancel the pending request (only meaningful for an INVITE client
    /// transaction that has received at least a provisional response).
    async fn cancel(&mut self, reason: Option<BytesStr>) -> Result<(), SignalingError>;
}

/// Constructs dialogs and extracts dialog identity from freshly-received
/// messages. The out-of-scope analogue of `ezk-sip-ua`'s
/// `ClientDialogBuilder`/`Dialog::new_server`.
#[async_trait::async_trait]
pub trait DialogFactory: Send + Sync {
    /// Build the confirmed (or early) dialog implied by a UAC receiving
    /// `response` to the initial INVITE.
    async fn dialog_from_response(
        &self,
        response: &IncomingResponse,
    ) -> Result<Box<dyn Dialog>, SignalingError>;

    /// Build the dialog implied by a UAS receiving the initial INVITE.
    async fn dialog_from_request(
        &self,
        request: &IncomingRequest,
        local_tag: &BytesStr,
    ) -> Result<Box<dyn Dialog>, SignalingError>;

    /// Build a transient, throwaway dialog for a forked 2xx that must be
    /// politely ACKed then BYEd (spec.md §4.2, "accept-and-terminate").
    async fn throwaway_dialog(
        &self,
        response: &IncomingResponse,
    ) -> Result<Box<dyn Dialog>, SignalingError>;
}
