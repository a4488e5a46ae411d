//! C1: the session state machine (spec.md §3, §4.1).
//!
//! Owns `status`/`direction`, the confirmed and early dialogs, the timer
//! set, the DTMF scheduler and the media handler; gates every public
//! operation and every inbound event on the current `Status`. Modeled on
//! `ezk-sip-ua`'s `invite::session::Session` (see `invite/session.rs`),
//! generalized from a session-timer-refresh state machine into the full
//! direction-aware INVITE lifecycle spec.md §3 describes.

pub mod uac;
pub mod uas;

#[cfg(test)]
mod tests;

use crate::causes::Cause;
use crate::dtmf::{DtmfReceiver, DtmfScheduler};
use crate::error::{Result, SessionError};
use crate::events::{Event, EventSink, ListenerKey, Originator};
use crate::media::MediaHandler;
use crate::options::{
    ConnectOptions, Identity, SendDtmfOptions, TerminateOptions, TimerConfig,
};
use crate::registry::SessionRegistry;
use crate::signaling::{
    Dialog, DialogFactory, Header, IncomingRequest, OutgoingResponse, RequestSender,
    ServerTransaction, SignalingError,
};
use crate::timers::{TimerEvent, TimerSet};
use crate::util::random_string;
use bytesstr::BytesStr;
use sip_types::{Code, Method};
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::Instrument;
use std::time::Instant;

/// spec.md §3's Status enum and its legal transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Null,
    InviteSent,
    OneXxReceived,
    InviteReceived,
    WaitingForAnswer,
    Answered,
    WaitingForAck,
    Confirmed,
    Canceled,
    Terminated,
}

impl Status {
    /// spec.md invariant 1: `TERMINATED` is absorbing.
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Terminated)
    }
}

/// Which side of the initial INVITE this session is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// Deferred-BYE bookkeeping for spec.md §4.1's UAS `terminate()` in
/// `WAITING_FOR_ACK`: two mutually-exclusive one-shot triggers (next ACK,
/// or the INVITE server transaction reaching `TERMINATED`) race to send the
/// actual BYE. Whichever fires first consumes this via `Option::take`; the
/// other becomes a no-op because it is already gone.
struct DeferredBye {
    options: TerminateOptions,
}

/// The per-call session core (spec.md §3 "Session. The root entity.").
pub struct Session {
    id: BytesStr,
    direction: Direction,
    status: Status,
    identity: Identity,

    call_id: BytesStr,
    local_tag: BytesStr,

    dialog_factory: Arc<dyn DialogFactory>,
    registry: Arc<dyn SessionRegistry>,

    /// UAC-only: the sender for the initial INVITE, held only while a
    /// CANCEL might still need to go out (spec.md §4.1 `terminate()` table).
    request_sender: Option<Box<dyn RequestSender>>,

    confirmed_dialog: Option<Box<dyn Dialog>>,
    /// Early dialogs keyed by remote tag (spec.md §3: "early dialogs share
    /// call-id/local-tag but differ in remote-tag").
    early_dialogs: HashMap<BytesStr, Box<dyn Dialog>>,

    /// UAS-only: the original INVITE and its server transaction, kept for
    /// 2xx (re)transmission and the deferred-BYE race.
    uas_invite: Option<IncomingRequest>,
    uas_tsx: Option<Box<dyn ServerTransaction>>,
    /// The cached 200 response body, replayed verbatim by `invite2xxTimer`
    /// (spec.md §4.4).
    cached_2xx: Option<OutgoingResponse>,

    media: Box<dyn MediaHandler>,
    timers: TimerSet,
    dtmf: DtmfScheduler,
    dtmf_receiver: DtmfReceiver,

    events: EventSink,

    /// Latched by `terminate()` before the INVITE transaction has a
    /// provisional response (spec.md §4.1: "the pipeline will cancel before
    /// sending" / "else latch `isCanceled`").
    is_canceled: bool,
    cancel_options: Option<TerminateOptions>,
    /// Latches once a `100 Trying` is received (spec.md §4.2).
    received_100: bool,

    deferred_bye: Option<DeferredBye>,

    start_time: Option<Instant>,
    end_time: Option<Instant>,
    /// spec.md invariant 6: `failed`/`ended` each emit at most once, and are
    /// mutually exclusive.
    failed_emitted: bool,
    ended_emitted: bool,

    /// Opaque per-session bag (spec.md §3: "an opaque user-data bag").
    user_data: Option<Box<dyn Any + Send + Sync>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("status", &self.status)
            .finish()
    }
}

impl Session {
    pub fn id(&self) -> &BytesStr {
        &self.id
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// The initial INVITE (spec.md §3: "the initial INVITE (as UAC:
    /// outgoing; as UAS: incoming)"). `None` for a UAC session, which never
    /// keeps its own outgoing INVITE around once sent.
    pub fn initial_invite(&self) -> Option<&IncomingRequest> {
        self.uas_invite.as_ref()
    }

    pub fn start_time(&self) -> Option<Instant> {
        self.start_time
    }

    pub fn end_time(&self) -> Option<Instant> {
        self.end_time
    }

    pub fn local_streams(&self) -> Vec<crate::media::MediaStreamHandle> {
        self.media.local_streams()
    }

    pub fn remote_streams(&self) -> Vec<crate::media::MediaStreamHandle> {
        self.media.remote_streams()
    }

    pub fn set_user_data(&mut self, data: impl Any + Send + Sync) {
        self.user_data = Some(Box::new(data));
    }

    pub fn user_data<T: Any>(&self) -> Option<&T> {
        self.user_data.as_deref().and_then(|d| d.downcast_ref())
    }

    pub fn subscribe(&mut self, listener: impl FnMut(&Event) + Send + 'static) -> ListenerKey {
        self.events.subscribe(listener)
    }

    pub fn unsubscribe(&mut self, key: ListenerKey) {
        self.events.unsubscribe(key);
    }

    /// Guard helper for every asynchronous continuation (spec.md §5: "every
    /// asynchronous continuation checks `status === TERMINATED`").
    fn check_not_terminated(&self) -> Result<()> {
        if self.status.is_terminal() {
            Err(SessionError::InvalidState("session is terminated"))
        } else {
            Ok(())
        }
    }

    fn emit(&mut self, event: Event) {
        self.events.emit(event);
    }

    /// The per-session span every public event-handling entry point runs
    /// inside of (SPEC_FULL.md §2.2), matching `ezk-sip-ua`'s
    /// `info_span!("usage", name = %usage.name())` around inbound dispatch
    /// (`dialog/layer.rs`).
    fn span(&self) -> tracing::Span {
        tracing::info_span!("session", id = %self.id)
    }

    // ---- UAC constructor -------------------------------------------------

    /// `connect(target, options)` (spec.md §4.1, UAC init).
    ///
    /// Preconditions are the caller's responsibility to have checked before
    /// constructing `request_sender` (target resolvability, media subsystem
    /// support are properties of the signaling/media collaborators, out of
    /// scope here per spec.md §6). This constructor itself can only fail
    /// synchronously with a `SessionError`.
    #[allow(clippy::too_many_arguments)]
    pub async fn connect(
        call_id: BytesStr,
        dialog_factory: Arc<dyn DialogFactory>,
        registry: Arc<dyn SessionRegistry>,
        mut media: Box<dyn MediaHandler>,
        mut request_sender: Box<dyn RequestSender>,
        options: ConnectOptions,
        timer_config: TimerConfig,
    ) -> Result<Self> {
        let local_tag = random_string();
        let id = BytesStr::from(format!("{call_id};{local_tag}"));
        let span = tracing::info_span!("session", id = %id);

        async move {
            if !media.is_supported() {
                return Err(SessionError::NotSupported(
                    "media subsystem does not support this session",
                ));
            }

            if let Some(stream) = options.media_stream.clone() {
                media
                    .add_stream(stream)
                    .await
                    .map_err(|e| SessionError::Dialog(e.to_string()))?;
            } else {
                let stream = media
                    .get_user_media(options.media_constraints)
                    .await
                    .map_err(|e| SessionError::Dialog(e.to_string()))?;
                media
                    .add_stream(stream)
                    .await
                    .map_err(|e| SessionError::Dialog(e.to_string()))?;
            }

            let mut session = Self {
                id: id.clone(),
                direction: Direction::Outgoing,
                status: Status::Null,
                identity: options.identity.clone(),
                call_id,
                local_tag,
                dialog_factory,
                registry,
                request_sender: None,
                confirmed_dialog: None,
                early_dialogs: HashMap::new(),
                uas_invite: None,
                uas_tsx: None,
                cached_2xx: None,
                media,
                timers: TimerSet::new(timer_config),
                dtmf: DtmfScheduler::new(),
                dtmf_receiver: DtmfReceiver,
                events: EventSink::new(),
                is_canceled: false,
                cancel_options: None,
                received_100: false,
                deferred_bye: None,
                start_time: None,
                end_time: None,
                failed_emitted: false,
                ended_emitted: false,
                user_data: None,
            };

            session.registry.register(&session.id);
            session.emit(Event::NewSession {
                direction: Direction::Outgoing,
            });

            request_sender
                .send()
                .await
                .map_err(SessionError::Signaling)?;

            session.request_sender = Some(request_sender);
            session.status = Status::InviteSent;
            session.emit(Event::Connecting);

            Ok(session)
        }
        .instrument(span)
        .await
    }

    // ---- terminate() (spec.md §4.1) --------------------------------------

    /// `terminate(options)`. Role- and state-dependent per spec.md §4.1's
    /// table.
    pub async fn terminate(&mut self, options: TerminateOptions) -> Result<()> {
        let span = self.span();
        async move {
        match (self.status, self.direction) {
            (Status::Terminated, _) => Err(SessionError::InvalidState("session is terminated")),

            (Status::Null, Direction::Outgoing) => {
                options.validate_uac()?;
                self.is_canceled = true;
                self.cancel_options = Some(options);
                Ok(())
            }

            (Status::InviteSent, Direction::Outgoing) => {
                options.validate_uac()?;
                if self.received_100 {
                    self.send_cancel(options).await
                } else {
                    self.is_canceled = true;
                    self.cancel_options = Some(options);
                    Ok(())
                }
            }

            (Status::OneXxReceived, Direction::Outgoing) => {
                options.validate_uac()?;
                self.send_cancel(options).await
            }

            (Status::WaitingForAnswer, Direction::Incoming)
            | (Status::Answered, Direction::Incoming) => {
                options.validate_uas_reject()?;
                let code = options.status_code.unwrap_or(480);
                self.reply_invite(Code::from(code), options.reason_phrase.clone())
                    .await?;
                self.fail(Originator::Local, Cause::Rejected).await;
                Ok(())
            }

            (Status::WaitingForAck, Direction::Incoming) => {
                // Deferred BYE (spec.md §4.1): RFC 3261 §15 forbids a BYE on
                // a confirmed dialog before the 2xx has been ACKed.
                self.deferred_bye = Some(DeferredBye { options });
                // Re-register so the eventual ACK can still be routed here;
                // `close()` has not run yet, the dialog stays referenced.
                self.registry.register(&self.id);
                self.emit_ended_without_close(Originator::Local, Cause::Bye);
                Ok(())
            }

            (Status::WaitingForAck, Direction::Outgoing)
            | (Status::Confirmed, _) => self.send_bye(options).await,

            _ => Err(SessionError::InvalidState(
                "terminate() not valid in current status",
            )),
        }
        }
        .instrument(span)
        .await
    }

    async fn send_cancel(&mut self, options: TerminateOptions) -> Result<()> {
        if let Some(sender) = self.request_sender.as_mut() {
            sender
                .cancel(options.reason_phrase.clone())
                .await
                .map_err(SessionError::Signaling)?;
        }
        self.cancel_options = Some(options);
        Ok(())
    }

    async fn send_bye(&mut self, options: TerminateOptions) -> Result<()> {
        let dialog = self
            .confirmed_dialog
            .as_ref()
            .ok_or(SessionError::InvalidState("no confirmed dialog to BYE"))?;

        let mut headers: Vec<Header> = options.extra_headers.clone();
        if let Some(cause) = options.cause {
            headers.push(reason_header(cause));
        }

        dialog
            .send_request(Method::BYE, headers, options.body.clone())
            .await
            .map_err(SessionError::Signaling)?;

        self.close(Originator::Local, Cause::Bye).await;
        Ok(())
    }

    /// spec.md §4.1's deferred-BYE case emits `ended(local)` immediately but
    /// explicitly does *not* run `close()` yet — the dialog and timers stay
    /// alive until the ACK or server-transaction-terminated trigger fires.
    fn emit_ended_without_close(&mut self, originator: Originator, cause: Cause) {
        if self.ended_emitted || self.failed_emitted {
            return;
        }
        self.ended_emitted = true;
        self.end_time = Some(Instant::now());
        self.emit(Event::Ended { originator, cause });
    }

    /// Runs the actual deferred BYE once its trigger fires (next ACK, or the
    /// UAS INVITE server transaction reaching `TERMINATED`). Idempotent: a
    /// second call after the first trigger already consumed `deferred_bye`
    /// is a no-op, realizing the "whichever fires first wins" rule.
    async fn run_deferred_bye(&mut self) {
        let Some(deferred) = self.deferred_bye.take() else {
            return;
        };

        if let Some(dialog) = self.confirmed_dialog.as_ref() {
            let mut headers: Vec<Header> = deferred.options.extra_headers.clone();
            if let Some(cause) = deferred.options.cause {
                headers.push(reason_header(cause));
            }
            if let Err(e) = dialog
                .send_request(Method::BYE, headers, deferred.options.body.clone())
                .await
            {
                tracing::warn!(error = %e, "failed to send deferred BYE");
            }
        }

        self.status = Status::Terminated;
        self.timers.cancel_all();
        self.dtmf.clear();
        self.media.close().await;
        if let Some(dialog) = self.confirmed_dialog.take() {
            dialog.terminate().await;
        }
        self.registry.deregister(&self.id);
    }

    /// Resolves once the deferred-BYE trigger tied to the UAS INVITE server
    /// transaction fires. Never resolves outside the deferred-BYE window, so
    /// it can be freely `select!`ed alongside everything else (spec.md §5).
    pub async fn select_deferred_bye_tsx(&self) {
        match (&self.uas_tsx, &self.deferred_bye) {
            (Some(tsx), Some(_)) => tsx.wait_terminated().await,
            _ => std::future::pending().await,
        }
    }

    /// Drive the server-transaction-terminated trigger of the deferred-BYE
    /// race (spec.md §4.1). A no-op if the ACK trigger already ran.
    pub async fn handle_deferred_bye_tsx_terminated(&mut self) {
        self.run_deferred_bye().await;
    }

    // ---- close() (spec.md §4.6) ------------------------------------------

    /// Idempotent shutdown. `ended(...)`/`failed(...)` both call this before
    /// emitting, so no observer can re-enter the session after notification
    /// (spec.md §4.6) — except the deferred-BYE carve-out in `terminate()`,
    /// which intentionally emits first and closes later.
    async fn close(&mut self, originator: Originator, cause: Cause) {
        if self.status.is_terminal() {
            return;
        }

        self.media.close().await;
        self.timers.cancel_all();
        self.dtmf.clear();

        if let Some(dialog) = self.confirmed_dialog.take() {
            dialog.terminate().await;
        }
        for (_, dialog) in self.early_dialogs.drain() {
            dialog.terminate().await;
        }

        self.status = Status::Terminated;
        self.registry.deregister(&self.id);

        let was_established = self.start_time.is_some();
        if !self.ended_emitted && !self.failed_emitted {
            self.end_time = Some(Instant::now());
            if was_established {
                self.ended_emitted = true;
                self.emit(Event::Ended { originator, cause });
            } else {
                self.failed_emitted = true;
                self.emit(Event::Failed { originator, cause });
            }
        }
    }

    /// Public `close()` entry point (spec.md §4.6), used when the owner of
    /// the session wants to tear it down without a specific protocol cause
    /// (e.g. process shutdown).
    pub async fn shutdown(&mut self) {
        self.close(Originator::Local, Cause::InternalError).await;
    }

    async fn fail(&mut self, originator: Originator, cause: Cause) {
        self.close(originator, cause).await;
    }

    // ---- timers (C4, spec.md §4.4) ---------------------------------------

    /// Wait for whichever armed timer fires next, for the caller's own
    /// `select!` loop (spec.md §5's concurrency model: the session never
    /// owns its own event loop task, since the transport event loop is out
    /// of scope).
    pub async fn select_timer(&mut self) -> TimerEvent {
        self.timers.select().await
    }

    /// Process a timer firing. Re-checks `status` first, per spec.md §5's
    /// suspension-point invariant.
    pub async fn handle_timer(&mut self, event: TimerEvent) -> Result<()> {
        let span = self.span();
        async move {
            self.check_not_terminated()?;

            match event {
                TimerEvent::Invite2xx => self.handle_invite_2xx_timer().await,
                TimerEvent::Ack => self.handle_ack_timer().await,
                TimerEvent::UserNoAnswer => self.handle_user_no_answer_timer().await,
                TimerEvent::Expires => self.handle_expires_timer().await,
            }
        }
        .instrument(span)
        .await
    }

    async fn handle_invite_2xx_timer(&mut self) -> Result<()> {
        if self.status != Status::WaitingForAck {
            return Ok(());
        }

        if let (Some(tsx), Some(response)) = (&self.uas_tsx, self.cached_2xx.clone()) {
            if let Err(e) = tsx.respond(response).await {
                tracing::warn!(error = %e, "failed to retransmit 2xx");
            }
        }
        self.timers.rearm_invite_2xx_backoff();
        Ok(())
    }

    async fn handle_ack_timer(&mut self) -> Result<()> {
        if self.status != Status::WaitingForAck {
            return Ok(());
        }

        self.timers.cancel_invite_2xx();
        if let Some(dialog) = &self.confirmed_dialog {
            let _ = dialog.send_request(Method::BYE, Vec::new(), None).await;
        }
        self.close(Originator::Remote, Cause::NoAck).await;
        Ok(())
    }

    async fn handle_user_no_answer_timer(&mut self) -> Result<()> {
        if self.status != Status::WaitingForAnswer {
            return Ok(());
        }
        self.reply_invite(Code::REQUEST_TIMEOUT, None).await?;
        self.fail(Originator::Local, Cause::NoAnswer).await;
        Ok(())
    }

    async fn handle_expires_timer(&mut self) -> Result<()> {
        if self.status != Status::WaitingForAnswer {
            return Ok(());
        }
        self.reply_invite(Code::REQUEST_TERMINATED, None).await?;
        self.fail(Originator::Local, Cause::Expires).await;
        Ok(())
    }

    /// Helper used by the UAS failure paths to reply to the still-pending
    /// initial INVITE.
    async fn reply_invite(&mut self, code: Code, reason: Option<BytesStr>) -> Result<()> {
        let Some(tsx) = self.uas_tsx.as_ref() else {
            return Ok(());
        };

        let response = OutgoingResponse {
            code,
            reason,
            headers: Vec::new(),
            body: None,
        };
        tsx.respond(response).await.map_err(SessionError::Signaling)
    }

    // ---- DTMF (C5, spec.md §4.5) ------------------------------------------

    /// `sendDTMF(tones, options)` (spec.md §4.5).
    pub fn send_dtmf(&mut self, tones: &str, options: SendDtmfOptions) -> Result<()> {
        if !matches!(self.status, Status::Confirmed | Status::WaitingForAck) {
            return Err(SessionError::InvalidState(
                "sendDTMF requires CONFIRMED or WAITING_FOR_ACK",
            ));
        }
        self.dtmf.enqueue(tones, &options)
    }

    /// Wait for the next due DTMF tone, for the caller's `select!` loop.
    /// Returns the tone together with its clamped duration, matching
    /// [`Session::handle_dtmf_tick`]'s expected argument.
    pub async fn select_dtmf(&mut self) -> (char, std::time::Duration) {
        self.dtmf.select().await
    }

    /// Send the tone that became due: emits `newDTMF` and relays it via an
    /// in-dialog INFO (spec.md §4.5 and §1: "DTMF *transport* is out of
    /// scope; DTMF *scheduling* is in scope").
    pub async fn handle_dtmf_tick(&mut self, (tone, duration): (char, std::time::Duration)) {
        if self.check_not_terminated().is_err() {
            return;
        }

        self.emit(Event::NewDtmf {
            originator: Originator::Local,
            tone,
            duration,
        });

        if let Some(dialog) = &self.confirmed_dialog {
            let body = format!("Signal={tone}\r\nDuration={}\r\n", duration.as_millis());
            let headers = vec![(
                BytesStr::from_static("Content-Type"),
                BytesStr::from_static("application/dtmf-relay"),
            )];
            if let Err(e) = dialog
                .send_request(
                    Method::from("INFO"),
                    headers,
                    Some(bytes::Bytes::from(body)),
                )
                .await
            {
                tracing::warn!(error = %e, "failed to send DTMF INFO, clearing queue");
                self.dtmf.clear();
            }
        }
    }

    /// Handle inbound `INFO` carrying `application/dtmf-relay` (spec.md
    /// §4.3, and §9's Open Question resolved per SPEC_FULL.md: emit
    /// `newDTMF` from the receive path too).
    fn handle_dtmf_info(&mut self, request: &IncomingRequest) {
        let Some(body) = request.body.as_ref() else {
            return;
        };
        if let Some(tone) = DtmfReceiver::parse(body) {
            let _ = &self.dtmf_receiver;
            self.emit(Event::NewDtmf {
                originator: Originator::Remote,
                tone: tone.tone,
                duration: tone.duration,
            });
        }
    }
}

/// Builds the `Reason: SIP ;cause=<n>; text="<phrase>"` header spec.md §6
/// requires on coded terminations.
fn reason_header(cause: Cause) -> Header {
    let value = BytesStr::from(format!(
        "SIP ;cause={}; text=\"{}\"",
        cause.status_code(),
        cause.reason_phrase()
    ));
    (BytesStr::from_static("Reason"), value)
}
