//! Typed option records (spec.md §9 redesign flag: "Dynamic `extraHeaders`
//! arrays, ad-hoc options objects → typed option records with defaults;
//! validation at construction").

use crate::error::{Result, SessionError};
use crate::media::{MediaConstraints, MediaStreamHandle};
use crate::signaling::Header;
use bytesstr::BytesStr;
use std::time::Duration;

/// Who the session identifies as in outgoing requests (spec.md §6:
/// `anonymous` connect option).
#[derive(Debug, Clone)]
pub enum Identity {
    /// Use the user agent's configured address-of-record.
    Public { display_name: Option<BytesStr> },
    /// Overrides `From` with `sip:anonymous@anonymous.invalid`, display name
    /// `Anonymous`, and asks the signaling collaborator to add
    /// `P-Preferred-Identity`/`Privacy: id` headers.
    Anonymous,
}

impl Default for Identity {
    fn default() -> Self {
        Identity::Public { display_name: None }
    }
}

/// Options for [`crate::session::Session::connect`] (UAC init, spec.md §4.1).
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    pub identity: Identity,
    pub media_constraints: MediaConstraints,
    /// Caller-provided stream; bypasses `getUserMedia` when set.
    pub media_stream: Option<MediaStreamHandle>,
    pub extra_headers: Vec<Header>,
    /// Opaque constraints forwarded to peer-connection construction; the
    /// core does not interpret them.
    pub rtc_constraints: Vec<(BytesStr, BytesStr)>,
}

/// Options for [`crate::session::Session::answer`] (UAS accept, spec.md §4.1).
#[derive(Debug, Clone, Default)]
pub struct AnswerOptions {
    pub media_constraints: MediaConstraints,
    pub media_stream: Option<MediaStreamHandle>,
    pub extra_headers: Vec<Header>,
}

/// Options for [`crate::session::Session::terminate`] (spec.md §4.1).
///
/// `status_code` validation depends on role and current state: the UAC path
/// accepts `[200,700)` or none, the UAS reject path requires `[300,700)`
/// (spec.md §4.1, "Status-code validation").
#[derive(Debug, Clone, Default)]
pub struct TerminateOptions {
    pub status_code: Option<u16>,
    pub reason_phrase: Option<BytesStr>,
    pub cause: Option<crate::causes::Cause>,
    pub extra_headers: Vec<Header>,
    pub body: Option<bytes::Bytes>,
}

impl TerminateOptions {
    pub(crate) fn validate_uac(&self) -> Result<()> {
        if let Some(code) = self.status_code {
            if !(200..700).contains(&code) {
                return Err(SessionError::InvalidArgument(
                    "terminate status_code must be in [200,700)",
                ));
            }
        }
        Ok(())
    }

    pub(crate) fn validate_uas_reject(&self) -> Result<()> {
        if let Some(code) = self.status_code {
            if !(300..700).contains(&code) {
                return Err(SessionError::InvalidArgument(
                    "reject status_code must be in [300,700)",
                ));
            }
        }
        Ok(())
    }
}

/// DTMF tone duration/spacing defaults and clamps (spec.md §4.5, values
/// unspecified there; taken from the JsSIP `RTCSession.DTMF` this spec
/// distills).
pub const DEFAULT_DURATION: Duration = Duration::from_millis(100);
pub const DEFAULT_INTER_TONE_GAP: Duration = Duration::from_millis(70);
pub const MIN_DURATION: Duration = Duration::from_millis(70);
pub const MAX_DURATION: Duration = Duration::from_millis(6000);
pub const MIN_INTER_TONE_GAP: Duration = Duration::from_millis(50);
pub const MAX_INTER_TONE_GAP: Duration = Duration::from_millis(6000);
/// The comma pause is a fixed, non-clamped delay (spec.md §4.5).
pub const COMMA_PAUSE: Duration = Duration::from_millis(2000);

/// Options for [`crate::session::Session::send_dtmf`] (spec.md §4.5).
#[derive(Debug, Clone)]
pub struct SendDtmfOptions {
    pub duration: Duration,
    pub inter_tone_gap: Duration,
}

impl Default for SendDtmfOptions {
    fn default() -> Self {
        Self {
            duration: DEFAULT_DURATION,
            inter_tone_gap: DEFAULT_INTER_TONE_GAP,
        }
    }
}

impl SendDtmfOptions {
    /// Clamp `duration`/`inter_tone_gap` into `[MIN, MAX]`, logging when a
    /// clamp occurs (spec.md §8: "DTMF duration below MIN is clamped up and
    /// logged; above MAX clamped down").
    pub(crate) fn clamp(&self) -> Self {
        let duration = clamp_logged("duration", self.duration, MIN_DURATION, MAX_DURATION);
        let inter_tone_gap = clamp_logged(
            "interToneGap",
            self.inter_tone_gap,
            MIN_INTER_TONE_GAP,
            MAX_INTER_TONE_GAP,
        );

        Self {
            duration,
            inter_tone_gap,
        }
    }

    /// Must be positive decimals per spec.md §4.5.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.duration.is_zero() || self.inter_tone_gap.is_zero() {
            return Err(SessionError::InvalidArgument(
                "duration and interToneGap must be positive",
            ));
        }
        Ok(())
    }
}

fn clamp_logged(name: &str, value: Duration, min: Duration, max: Duration) -> Duration {
    if value < min {
        tracing::debug!(param = name, ?value, ?min, "clamping DTMF parameter up to minimum");
        min
    } else if value > max {
        tracing::debug!(param = name, ?value, ?max, "clamping DTMF parameter down to maximum");
        max
    } else {
        value
    }
}

/// User-configurable session-wide timeouts (spec.md §4.4 constants + the
/// UAS-only `no_answer_timeout`).
#[derive(Debug, Clone, Copy)]
pub struct TimerConfig {
    /// RFC 3261 initial retransmit interval (T1), typically 500ms.
    pub t1: Duration,
    /// RFC 3261 retransmit cap (T2), typically 4s.
    pub t2: Duration,
    /// `invite2xxTimer`/`ackTimer` ceiling, `TIMER_H ≈ 64·T1`.
    pub timer_h: Duration,
    /// UAS inactivity guard before replying 408 (spec.md §4.4). JsSIP's
    /// `RTCSession` default is 60 seconds.
    pub no_answer_timeout: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        let t1 = Duration::from_millis(500);
        Self {
            t1,
            t2: Duration::from_millis(4000),
            timer_h: t1 * 64,
            no_answer_timeout: Duration::from_secs(60),
        }
    }
}
