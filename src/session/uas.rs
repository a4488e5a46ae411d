//! C3: the UAS request handler (spec.md §4.3).
//!
//! [`Session::init_incoming`] is the entry point for a fresh INVITE and
//! doubles as this module's constructor; [`Session::answer`] is the UAS
//! accept path (spec.md §4.1); [`Session::receive_request`] dispatches
//! everything else arriving in-dialog (CANCEL, ACK, BYE, re-INVITE, INFO).

use super::{Session, Status};
use crate::causes::Cause;
use crate::dtmf::DtmfReceiver;
use crate::error::{Result, SessionError};
use crate::events::{Event, Originator};
use crate::media::{MediaHandler, SdpKind};
use crate::options::{AnswerOptions, TimerConfig};
use crate::registry::SessionRegistry;
use crate::signaling::{
    Dialog, DialogFactory, Header, IncomingRequest, OutgoingResponse, ServerTransaction,
    SipMessage,
};
use bytesstr::BytesStr;
use sdp_types::SessionDescription;
use sip_types::{Code, Method};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::Instrument;

use super::Direction;

impl Session {
    /// `init_incoming(request)` (spec.md §4.3). Requires a body and
    /// `Content-Type: application/sdp`, else replies 415 and returns an
    /// error without constructing a session (there is nothing to attach the
    /// error to yet).
    #[allow(clippy::too_many_arguments)]
    pub async fn init_incoming(
        request: IncomingRequest,
        tsx: Box<dyn ServerTransaction>,
        dialog_factory: Arc<dyn DialogFactory>,
        registry: Arc<dyn SessionRegistry>,
        mut media: Box<dyn MediaHandler>,
        timer_config: TimerConfig,
        local_contact: Header,
    ) -> Result<Self> {
        let has_sdp = request
            .content_type()
            .map(|ct| ct.eq_ignore_ascii_case("application/sdp"))
            .unwrap_or(false);

        if !has_sdp || request.body.is_none() {
            let _ = tsx
                .respond(OutgoingResponse {
                    code: Code::UNSUPPORTED_MEDIA_TYPE,
                    reason: None,
                    headers: Vec::new(),
                    body: None,
                })
                .await;
            return Err(SessionError::InvalidArgument(
                "INVITE missing SDP body or Content-Type: application/sdp",
            ));
        }

        let from_tag = request.from_tag.clone();
        let to_tag = crate::util::random_string();
        let id = BytesStr::from(format!("{};{}", request.call_id, from_tag));
        let span = tracing::info_span!("session", id = %id);

        async move {

        let early_dialog = dialog_factory
            .dialog_from_request(&request, &to_tag)
            .await
            .map_err(|e| SessionError::Dialog(e.to_string()))?;

        let mut session = Self {
            id: id.clone(),
            direction: Direction::Incoming,
            status: Status::InviteReceived,
            identity: Default::default(),
            call_id: request.call_id.clone(),
            local_tag: to_tag,
            dialog_factory,
            registry,
            request_sender: None,
            confirmed_dialog: None,
            early_dialogs: HashMap::new(),
            uas_invite: Some(request.clone()),
            uas_tsx: Some(tsx),
            cached_2xx: None,
            media,
            timers: crate::timers::TimerSet::new(timer_config),
            dtmf: crate::dtmf::DtmfScheduler::new(),
            dtmf_receiver: DtmfReceiver,
            events: crate::events::EventSink::new(),
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
        session
            .early_dialogs
            .insert(session.local_tag.clone(), early_dialog);

        session.registry.register(&session.id);
        session.emit(Event::NewSession {
            direction: Direction::Incoming,
        });

        let body = request.body.clone().expect("checked above");
        let sdp_text = BytesStr::from_utf8(body)
            .map_err(|_| SessionError::InvalidArgument("SDP offer was not valid UTF-8"))?;
        let offer = match SessionDescription::parse(&sdp_text) {
            Ok(sdp) => sdp,
            Err(e) => {
                session
                    .reply_invite(Code::NOT_ACCEPTABLE_HERE, Some(BytesStr::from(e.to_string())))
                    .await?;
                session.fail(Originator::Local, Cause::BadMediaDescription).await;
                return Ok(session);
            }
        };

        if let Err(e) = session.media.on_remote_sdp(SdpKind::Offer, offer).await {
            tracing::debug!(error = %e, "media handler rejected SDP offer");
            session
                .reply_invite(Code::NOT_ACCEPTABLE_HERE, None)
                .await?;
            session.fail(Originator::Local, Cause::BadMediaDescription).await;
            return Ok(session);
        }

        let response = OutgoingResponse {
            code: Code::RINGING,
            reason: None,
            headers: vec![local_contact],
            body: None,
        };
        if let Some(tsx) = &session.uas_tsx {
            tsx.respond(response)
                .await
                .map_err(SessionError::Signaling)?;
        }

        session.status = Status::WaitingForAnswer;
        session.timers.arm_user_no_answer();

        if let Some(expires) = request
            .get_header("Expires")
            .and_then(|v| v.parse::<u32>().ok())
        {
            session.timers.arm_expires(expires);
        }

        Ok(session)
        }
        .instrument(span)
        .await
    }

    /// `answer(options)` (spec.md §4.1, UAS accept).
    pub async fn answer(&mut self, options: AnswerOptions) -> Result<()> {
        let span = self.span();
        async move {
        if self.direction != Direction::Incoming || self.status != Status::WaitingForAnswer {
            return Err(SessionError::InvalidState(
                "answer() requires an incoming session WAITING_FOR_ANSWER",
            ));
        }

        self.status = Status::Answered;

        let dialog = match self.promote_confirmed_dialog_from_early() {
            Some(dialog) => dialog,
            None => {
                self.reply_invite(Code::SERVER_INTERNAL_ERROR, None).await?;
                self.fail(Originator::Local, Cause::DialogError).await;
                return Ok(());
            }
        };
        self.confirmed_dialog = Some(dialog);

        self.timers.cancel_user_no_answer();
        self.timers.cancel_expires();

        if let Some(stream) = options.media_stream.clone() {
            if let Err(e) = self.media.add_stream(stream).await {
                self.reply_invite(Code::TEMPORARILY_UNAVAILABLE, None).await?;
                self.fail(Originator::Local, Cause::UserDeniedMediaAccess).await;
                let _ = e;
                return Ok(());
            }
        } else {
            match self.media.get_user_media(options.media_constraints).await {
                Ok(stream) => {
                    if let Err(e) = self.media.add_stream(stream).await {
                        tracing::warn!(error = %e, "failed to attach acquired media stream");
                        self.reply_invite(Code::TEMPORARILY_UNAVAILABLE, None).await?;
                        self.fail(Originator::Local, Cause::WebrtcError).await;
                        return Ok(());
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "getUserMedia failed");
                    self.reply_invite(Code::TEMPORARILY_UNAVAILABLE, None).await?;
                    self.fail(Originator::Local, Cause::UserDeniedMediaAccess).await;
                    return Ok(());
                }
            }
        }

        self.emit(Event::Connecting);

        let answer = match self.media.create_answer().await {
            Ok(sdp) => sdp,
            Err(e) => {
                tracing::warn!(error = %e, "failed to create SDP answer");
                self.reply_invite(Code::TEMPORARILY_UNAVAILABLE, None).await?;
                self.fail(Originator::Local, Cause::WebrtcError).await;
                return Ok(());
            }
        };

        let body = bytes::Bytes::from(answer.to_string());
        let response = OutgoingResponse {
            code: Code::OK,
            reason: None,
            headers: options.extra_headers.clone(),
            body: Some(body),
        };

        let Some(tsx) = self.uas_tsx.as_ref() else {
            return Err(SessionError::InvalidState("no INVITE transaction to answer"));
        };

        if let Err(e) = tsx.respond(response.clone()).await {
            self.fail(Originator::Local, Cause::ConnectionError).await;
            return Err(SessionError::Signaling(e));
        }

        self.cached_2xx = Some(response);
        self.status = Status::WaitingForAck;
        self.start_time = Some(std::time::Instant::now());
        self.timers.arm_invite_2xx();
        self.timers.arm_ack();

        self.emit(Event::Started {
            originator: Originator::Local,
            local_streams: self.media.local_streams(),
            remote_streams: self.media.remote_streams(),
        });

        Ok(())
        }
        .instrument(span)
        .await
    }

    fn promote_confirmed_dialog_from_early(&mut self) -> Option<Box<dyn Dialog>> {
        let key = self.local_tag.clone();
        self.early_dialogs.remove(&key)
    }

    /// `receiveRequest(request)` (spec.md §4.3): in-dialog and CANCEL
    /// dispatch.
    pub async fn receive_request(&mut self, request: IncomingRequest) -> Result<()> {
        let span = self.span();
        async move {
        self.check_not_terminated()?;

        if request.method == Method::CANCEL {
            self.handle_cancel(request).await
        } else if request.method == Method::ACK {
            self.handle_ack(request).await
        } else if request.method == Method::BYE {
            self.handle_bye(request).await
        } else if request.method == Method::INVITE {
            self.handle_reinvite(request).await
        } else if request.method == Method::from("INFO") {
            self.handle_info(request).await
        } else {
            Ok(())
        }
        }
        .instrument(span)
        .await
    }

    async fn handle_cancel(&mut self, _request: IncomingRequest) -> Result<()> {
        if self.status != Status::WaitingForAnswer {
            // Too late: the CANCEL lost the race against a final response.
            return Ok(());
        }

        self.status = Status::Canceled;
        self.reply_invite(Code::REQUEST_TERMINATED, None).await?;
        self.fail(Originator::Remote, Cause::Canceled).await;
        Ok(())
    }

    async fn handle_ack(&mut self, _request: IncomingRequest) -> Result<()> {
        if self.deferred_bye.is_some() {
            self.run_deferred_bye().await;
            return Ok(());
        }

        if self.status != Status::WaitingForAck {
            return Ok(());
        }

        self.timers.cancel_ack();
        self.timers.cancel_invite_2xx();
        self.status = Status::Confirmed;
        Ok(())
    }

    async fn handle_bye(&mut self, _request: IncomingRequest) -> Result<()> {
        if self.status != Status::Confirmed {
            return Ok(());
        }

        if let Some(tsx) = &self.uas_tsx {
            let _ = tsx
                .respond(OutgoingResponse {
                    code: Code::OK,
                    reason: None,
                    headers: Vec::new(),
                    body: None,
                })
                .await;
        }

        // `start_time` is always set by the time a BYE can arrive
        // (CONFIRMED requires it), so `close()` emits `ended`, never
        // `failed` (spec.md §5: "`failed` never follows `started`").
        self.close(Originator::Remote, Cause::Bye).await;
        Ok(())
    }

    async fn handle_reinvite(&mut self, _request: IncomingRequest) -> Result<()> {
        if self.status != Status::Confirmed {
            return Ok(());
        }
        // spec.md §4.3 / Open Question: acknowledge receipt via log only,
        // no renegotiation in this core.
        tracing::info!(session = %self.id, "received re-INVITE, ignoring (no renegotiation)");
        self.emit(Event::ReInvite);
        Ok(())
    }

    async fn handle_info(&mut self, request: IncomingRequest) -> Result<()> {
        if !matches!(self.status, Status::Confirmed | Status::WaitingForAck) {
            return Ok(());
        }

        let is_dtmf = request
            .content_type()
            .map(|ct| ct.eq_ignore_ascii_case("application/dtmf-relay"))
            .unwrap_or(false);

        if is_dtmf {
            self.handle_dtmf_info(&request);
        }
        Ok(())
    }
}
