//! C2: the UAC response handler (spec.md §4.2).
//!
//! Entry point: [`Session::receive_response`], called by the owner's event
//! loop for every response to the initial INVITE. Dispatch follows spec.md
//! §4.2's numbered rules in order: forked/retransmitted 2xx first (works
//! regardless of `status`), then the `status` gate, then the cancel race,
//! then dispatch by response class.

use super::{Session, Status};
use crate::causes::Cause;
use crate::error::{Result, SessionError};
use crate::events::{Event, Originator};
use crate::media::SdpKind;
use crate::signaling::{IncomingResponse, SipMessage};
use bytesstr::BytesStr;
use sdp_types::SessionDescription;
use sip_types::{CodeKind, Method};
use tracing::Instrument;

impl Session {
    /// `receiveResponse(response)` (spec.md §4.2).
    pub async fn receive_response(&mut self, response: IncomingResponse) -> Result<()> {
        let span = self.span();
        async move {
        self.check_not_terminated()?;

        // Rule 1: 2xx retransmission / forked 2xx — evaluated before the
        // status gate because it applies even after CONFIRMED.
        if response.status_code.kind() == CodeKind::Success {
            if let Some(dialog) = &self.confirmed_dialog {
                if dialog.id().remote_tag == response.to_tag().cloned().unwrap_or_default() {
                    // Retransmission of the 2xx we already confirmed: ACK it
                    // again and stop (spec.md §8 testable property 3).
                    dialog
                        .send_request(Method::ACK, Vec::new(), None)
                        .await
                        .map_err(SessionError::Signaling)?;
                    return Ok(());
                }

                // A secondary, forked 2xx: politely end it without touching
                // the primary session's state.
                self.accept_and_terminate_forked(&response).await;
                return Ok(());
            }
        }

        // Rule 2: drop anything once we are no longer awaiting the initial
        // INVITE's final response.
        if !matches!(self.status, Status::InviteSent | Status::OneXxReceived) {
            return Ok(());
        }

        // Rule 3: cancel race.
        if self.is_canceled {
            match response.status_code.kind() {
                CodeKind::Provisional => {
                    if let Some(sender) = self.request_sender.as_mut() {
                        let reason = self
                            .cancel_options
                            .as_ref()
                            .and_then(|o| o.reason_phrase.clone());
                        let _ = sender.cancel(reason).await;
                    }
                }
                CodeKind::Success => {
                    self.accept_and_terminate(&response, Cause::Canceled).await?;
                }
                _ => {}
            }
            return Ok(());
        }

        match response.status_code.into_u16() {
            100 => {
                self.received_100 = true;
                Ok(())
            }
            101..=199 => self.handle_provisional(response).await,
            200..=299 => self.handle_success(response).await,
            _ => self.handle_failure(response).await,
        }
        }
        .instrument(span)
        .await
    }

    async fn handle_provisional(&mut self, response: IncomingResponse) -> Result<()> {
        let Some(_to_tag) = response.to_tag().cloned() else {
            // 1xx without a To-tag is ignored (spec.md §4.2).
            return Ok(());
        };

        if response.has_header("Contact") {
            self.create_or_update_early_dialog(&response).await?;
        }

        self.status = Status::OneXxReceived;
        self.emit(Event::Progress {
            originator: Originator::Remote,
        });
        Ok(())
    }

    async fn create_or_update_early_dialog(&mut self, response: &IncomingResponse) -> Result<()> {
        let Some(to_tag) = response.to_tag().cloned() else {
            return Ok(());
        };

        if self.early_dialogs.contains_key(&to_tag) {
            return Ok(());
        }

        let dialog = self
            .dialog_factory
            .dialog_from_response(response)
            .await
            .map_err(|e| SessionError::Dialog(e.to_string()))?;

        self.early_dialogs.insert(to_tag, dialog);
        Ok(())
    }

    async fn handle_success(&mut self, response: IncomingResponse) -> Result<()> {
        let Some(body) = response.body().cloned() else {
            self.accept_and_terminate(&response, Cause::BadMediaDescription)
                .await?;
            return Ok(());
        };

        let dialog = self.promote_or_build_dialog(&response).await?;

        let sdp_text = BytesStr::from_utf8(body).map_err(|_| {
            SessionError::InvalidArgument("SDP answer body was not valid UTF-8")
        })?;
        let sdp = SessionDescription::parse(&sdp_text)
            .map_err(|e| SessionError::Dialog(format!("invalid SDP answer: {e}")))?;

        let negotiated = self.media.on_remote_sdp(SdpKind::Answer, sdp).await;

        match negotiated {
            Ok(()) => {
                dialog
                    .send_request(Method::ACK, Vec::new(), None)
                    .await
                    .map_err(SessionError::Signaling)?;

                self.confirmed_dialog = Some(dialog);
                self.early_dialogs.clear();
                self.status = Status::Confirmed;
                self.start_time = Some(std::time::Instant::now());

                self.emit(Event::SdpNegotiated {
                    kind: SdpKind::Answer,
                });
                self.emit(Event::Started {
                    originator: Originator::Remote,
                    local_streams: self.media.local_streams(),
                    remote_streams: self.media.remote_streams(),
                });
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "media handler rejected SDP answer");
                let ack_bye_dialog = dialog;
                let _ = ack_bye_dialog
                    .send_request(Method::ACK, Vec::new(), None)
                    .await;
                let _ = ack_bye_dialog
                    .send_request(
                        Method::BYE,
                        vec![super::reason_header(Cause::BadMediaDescription)],
                        None,
                    )
                    .await;
                self.fail(Originator::Local, Cause::BadMediaDescription)
                    .await;
                Ok(())
            }
        }
    }

    /// Promote a matching early dialog to confirmed, or build a fresh one if
    /// no early dialog preceded this 2xx (spec.md §3 invariant 2).
    async fn promote_or_build_dialog(
        &mut self,
        response: &IncomingResponse,
    ) -> Result<Box<dyn crate::signaling::Dialog>> {
        if let Some(to_tag) = response.to_tag() {
            if let Some(dialog) = self.early_dialogs.remove(to_tag) {
                return Ok(dialog);
            }
        }

        self.dialog_factory
            .dialog_from_response(response)
            .await
            .map_err(|e| SessionError::Dialog(e.to_string()))
    }

    async fn handle_failure(&mut self, response: IncomingResponse) -> Result<()> {
        // A final failure arriving after we've put our own CANCEL on the
        // wire is the expected outcome of that cancellation, not an
        // independently remote-originated failure (spec.md §8 scenario 2).
        if self.cancel_options.is_some() {
            self.fail(Originator::Local, Cause::Canceled).await;
            return Ok(());
        }

        let cause = Cause::from_response_code(response.status_code);
        self.fail(Originator::Remote, cause).await;
        Ok(())
    }

    /// `acceptAndTerminate` (spec.md §4.2): build (or reuse) a dialog from a
    /// 2xx we want to reject, ACK it, then BYE it with a `Reason` header
    /// carrying `cause`. This is the only way to reject media after a dialog
    /// has been created; used both for the cancel race (`Canceled`) and the
    /// absent-SDP-body path (`BadMediaDescription`).
    async fn accept_and_terminate(
        &mut self,
        response: &IncomingResponse,
        cause: Cause,
    ) -> Result<()> {
        let dialog = self.promote_or_build_dialog(response).await?;

        dialog
            .send_request(Method::ACK, Vec::new(), None)
            .await
            .map_err(SessionError::Signaling)?;
        dialog
            .send_request(Method::BYE, vec![super::reason_header(cause)], None)
            .await
            .map_err(SessionError::Signaling)?;

        self.fail(Originator::Local, cause).await;
        Ok(())
    }

    /// Forked-2xx variant of `acceptAndTerminate`: builds a throwaway
    /// dialog, sends ACK then BYE, and swallows any transport error so the
    /// primary session is never affected (spec.md §7: "Forked-branch
    /// errors").
    async fn accept_and_terminate_forked(&mut self, response: &IncomingResponse) {
        let throwaway = match self.dialog_factory.throwaway_dialog(response).await {
            Ok(dialog) => dialog,
            Err(e) => {
                tracing::debug!(error = %e, "failed to build throwaway dialog for forked 2xx");
                return;
            }
        };

        if let Err(e) = throwaway.send_request(Method::ACK, Vec::new(), None).await {
            tracing::debug!(error = %e, "ACK on forked 2xx failed, swallowed");
            return;
        }
        if let Err(e) = throwaway
            .send_request(
                Method::BYE,
                vec![super::reason_header(Cause::Rejected)],
                None,
            )
            .await
        {
            tracing::debug!(error = %e, "BYE on forked 2xx failed, swallowed");
        }
    }
}
