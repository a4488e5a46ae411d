//! Cause constants surfaced on `ended`/`failed` events.
//!
//! Mirrors the taxonomy of spec.md §7: user-initiated, protocol-level and
//! system-level causes, plus the reason-phrase lookup required by §6.

use sip_types::Code;
use std::fmt;

/// Why a session ended or failed.
///
/// Carried on [`crate::events::Event::Ended`] and [`crate::events::Event::Failed`].
/// `failed` and `ended` are mutually exclusive (spec.md invariant 6), but both
/// use the same cause vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cause {
    // --- User ---
    /// The local user denied access to the media device.
    UserDeniedMediaAccess,
    /// The peer (or we, via `terminate`) explicitly rejected the session.
    Rejected,
    /// The session was cancelled before it was established.
    Canceled,

    // --- Protocol ---
    /// 486 Busy Here / 600 Busy Everywhere.
    Busy,
    /// 480 Temporarily Unavailable (or transport-level unreachability).
    Unavailable,
    /// Peer sent BYE.
    Bye,
    /// UAS received no `answer()` within `no_answer_timeout`.
    NoAnswer,
    /// Inbound `Expires` header elapsed before `answer()`.
    Expires,
    /// No ACK received within `TIMER_H` of a 2xx.
    NoAck,
    /// SDP offer/answer failed (missing body, rejected by media handler).
    BadMediaDescription,

    // --- System ---
    /// The underlying transport reported an error.
    ConnectionError,
    /// A request timed out at the transaction layer.
    RequestTimeout,
    /// The media handler reported an internal error.
    WebrtcError,
    /// Dialog construction failed.
    DialogError,
    /// Any other internal invariant violation.
    InternalError,
}

impl Cause {
    /// Maps a final SIP response code to a cause, per spec.md §4.2 ("map
    /// status to a cause").
    pub fn from_response_code(code: Code) -> Self {
        match code.into_u16() {
            486 | 600 => Cause::Busy,
            480 | 410 | 404 => Cause::Unavailable,
            487 => Cause::Canceled,
            488 | 606 => Cause::BadMediaDescription,
            408 => Cause::RequestTimeout,
            300..=699 => Cause::Rejected,
            _ => Cause::InternalError,
        }
    }

    /// The reason phrase used in an outgoing `Reason` header
    /// (`SIP ;cause=<n>; text="<phrase>"`, spec.md §6) for causes that carry
    /// an equivalent SIP status code.
    pub fn reason_phrase(self) -> &'static str {
        match self {
            Cause::UserDeniedMediaAccess => "Media Access Denied",
            Cause::Rejected => "Rejected",
            Cause::Canceled => "Request Terminated",
            Cause::Busy => "Busy Here",
            Cause::Unavailable => "Temporarily Unavailable",
            Cause::Bye => "Normal Call Clearing",
            Cause::NoAnswer => "Request Timeout",
            Cause::Expires => "Request Terminated",
            Cause::NoAck => "No ACK Received",
            Cause::BadMediaDescription => "Not Acceptable Here",
            Cause::ConnectionError => "Connection Error",
            Cause::RequestTimeout => "Request Timeout",
            Cause::WebrtcError => "Media Error",
            Cause::DialogError => "Dialog Error",
            Cause::InternalError => "Internal Error",
        }
    }

    /// The SIP status code a `Reason` header built from this cause should
    /// carry, matching the status codes §6/§7 associate with each cause.
    pub fn status_code(self) -> u16 {
        match self {
            Cause::UserDeniedMediaAccess => 480,
            Cause::Rejected => 603,
            Cause::Canceled => 487,
            Cause::Busy => 486,
            Cause::Unavailable => 480,
            Cause::Bye => 200,
            Cause::NoAnswer => 408,
            Cause::Expires => 487,
            Cause::NoAck => 700,
            Cause::BadMediaDescription => 488,
            Cause::ConnectionError => 500,
            Cause::RequestTimeout => 408,
            Cause::WebrtcError => 500,
            Cause::DialogError => 500,
            Cause::InternalError => 500,
        }
    }
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reason_phrase())
    }
}
