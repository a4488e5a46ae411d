//! In-crate fake signaling/media collaborators (SPEC_FULL.md §2.4): hand
//! rolled test doubles in the spirit of the explicit fakes already visible
//! across the corpus, rather than a mocking framework. Every fake shares its
//! recorded state through an `Arc`-wrapped inner struct so a test can keep a
//! cheap `Clone` of the handle it gave to a [`crate::session::Session`] and
//! inspect it afterwards.

use crate::media::{MediaConstraints, MediaError, MediaHandler, MediaStreamHandle, SdpKind};
use crate::registry::SessionRegistry;
use crate::signaling::{
    Dialog, DialogFactory, DialogId, Header, IncomingRequest, IncomingResponse, OutgoingResponse,
    RequestSender, ServerTransaction, SignalingError,
};
use bytes::Bytes;
use bytesstr::BytesStr;
use parking_lot::Mutex;
use sdp_types::SessionDescription;
use sip_types::{Code, Method};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// A minimal, syntactically valid SDP body: just enough for
/// `SessionDescription::parse` to succeed (origin, name and time are the
/// only mandatory fields).
pub fn sample_sdp_text() -> BytesStr {
    BytesStr::from_static("v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n")
}

pub fn sample_sdp_body() -> Bytes {
    Bytes::from(sample_sdp_text().to_string())
}

pub fn sample_sdp() -> SessionDescription {
    SessionDescription::parse(&sample_sdp_text()).expect("sample SDP parses")
}

// ---------------------------------------------------------------------
// Message builders
// ---------------------------------------------------------------------

fn bstr(s: &str) -> BytesStr {
    BytesStr::from(s.to_owned())
}

/// A fresh inbound INVITE carrying `body` as `application/sdp` (or no body
/// at all, to exercise the 415 path).
pub fn incoming_invite(call_id: &str, from_tag: &str, body: Option<Bytes>) -> IncomingRequest {
    let mut headers = Vec::new();
    if body.is_some() {
        headers.push((bstr("Content-Type"), bstr("application/sdp")));
    }
    IncomingRequest {
        method: Method::INVITE,
        call_id: bstr(call_id),
        from_tag: bstr(from_tag),
        to_tag: None,
        headers,
        body,
    }
}

/// An in-dialog or CANCEL request (no body, no special headers).
pub fn incoming_request(
    method: Method,
    call_id: &str,
    from_tag: &str,
    to_tag: Option<&str>,
) -> IncomingRequest {
    IncomingRequest {
        method,
        call_id: bstr(call_id),
        from_tag: bstr(from_tag),
        to_tag: to_tag.map(bstr),
        headers: Vec::new(),
        body: None,
    }
}

/// A response to the initial INVITE. `from_tag` is always ours (spec.md §6:
/// the UAC's own tag appears in the response's From header); `to_tag` is the
/// remote party's, present from the first 1xx/2xx that establishes a dialog.
#[allow(clippy::too_many_arguments)]
pub fn incoming_response(
    call_id: &str,
    from_tag: &str,
    to_tag: Option<&str>,
    code: u16,
    with_contact: bool,
    body: Option<Bytes>,
) -> IncomingResponse {
    let mut headers = Vec::new();
    if with_contact {
        headers.push((bstr("Contact"), bstr("<sip:bob@127.0.0.1:5060>")));
    }
    IncomingResponse {
        status_code: Code::from(code),
        call_id: bstr(call_id),
        from_tag: bstr(from_tag),
        to_tag: to_tag.map(bstr),
        headers,
        body,
    }
}

// ---------------------------------------------------------------------
// Dialog / DialogFactory
// ---------------------------------------------------------------------

/// One request sent on a [`FakeDialog`], recorded for test assertions.
#[derive(Debug, Clone)]
pub struct SentRequest {
    pub method: Method,
    pub headers: Vec<Header>,
    pub body: Option<Bytes>,
}

/// Shared wire log every [`FakeDialog`] produced by one [`FakeDialogFactory`]
/// writes into. Tests read it back without needing a handle to each
/// individual (possibly throwaway) dialog instance.
#[derive(Debug, Default)]
pub struct WireLog {
    sent: Mutex<Vec<SentRequest>>,
    terminated_dialogs: Mutex<u32>,
}

impl WireLog {
    pub fn sent(&self) -> Vec<SentRequest> {
        self.sent.lock().clone()
    }

    pub fn methods(&self) -> Vec<Method> {
        self.sent.lock().iter().map(|r| r.method.clone()).collect()
    }

    pub fn terminated_dialogs(&self) -> u32 {
        *self.terminated_dialogs.lock()
    }
}

#[derive(Debug)]
struct FakeDialog {
    id: DialogId,
    log: Arc<WireLog>,
}

#[async_trait::async_trait]
impl Dialog for FakeDialog {
    fn id(&self) -> DialogId {
        self.id.clone()
    }

    async fn send_request(
        &self,
        method: Method,
        extra_headers: Vec<Header>,
        body: Option<Bytes>,
    ) -> Result<Option<IncomingResponse>, SignalingError> {
        self.log.sent.lock().push(SentRequest {
            method,
            headers: extra_headers,
            body,
        });
        Ok(None)
    }

    async fn create_response(
        &self,
        _request: &IncomingRequest,
        code: Code,
        reason: Option<BytesStr>,
        extra_headers: Vec<Header>,
        body: Option<Bytes>,
    ) -> Result<OutgoingResponse, SignalingError> {
        Ok(OutgoingResponse {
            code,
            reason,
            headers: extra_headers,
            body,
        })
    }

    async fn terminate(&self) {
        *self.log.terminated_dialogs.lock() += 1;
    }
}

/// Builds [`FakeDialog`]s that all share one [`WireLog`]; never fails.
#[derive(Debug, Default, Clone)]
pub struct FakeDialogFactory {
    pub log: Arc<WireLog>,
}

#[async_trait::async_trait]
impl DialogFactory for FakeDialogFactory {
    async fn dialog_from_response(
        &self,
        response: &IncomingResponse,
    ) -> Result<Box<dyn Dialog>, SignalingError> {
        Ok(Box::new(FakeDialog {
            id: DialogId {
                call_id: response.call_id.clone(),
                local_tag: response.from_tag.clone(),
                remote_tag: response.to_tag.clone().unwrap_or_default(),
            },
            log: self.log.clone(),
        }))
    }

    async fn dialog_from_request(
        &self,
        request: &IncomingRequest,
        local_tag: &BytesStr,
    ) -> Result<Box<dyn Dialog>, SignalingError> {
        Ok(Box::new(FakeDialog {
            id: DialogId {
                call_id: request.call_id.clone(),
                local_tag: local_tag.clone(),
                remote_tag: request.from_tag.clone(),
            },
            log: self.log.clone(),
        }))
    }

    async fn throwaway_dialog(
        &self,
        response: &IncomingResponse,
    ) -> Result<Box<dyn Dialog>, SignalingError> {
        self.dialog_from_response(response).await
    }
}

// ---------------------------------------------------------------------
// ServerTransaction
// ---------------------------------------------------------------------

#[derive(Debug, Default)]
struct ServerTsxState {
    responses: Mutex<Vec<OutgoingResponse>>,
    terminated: Notify,
}

/// A server transaction whose `wait_terminated()` only resolves once the
/// test calls [`FakeServerTransaction::terminate`] — the second trigger of
/// the deferred-BYE race (spec.md §4.1). `Clone`s share the same state, so a
/// test can keep a handle after boxing one clone into a `Session`.
#[derive(Debug, Default, Clone)]
pub struct FakeServerTransaction(Arc<ServerTsxState>);

impl FakeServerTransaction {
    /// Drive the transaction to its terminal state.
    pub fn terminate(&self) {
        self.0.terminated.notify_waiters();
    }

    pub fn responses(&self) -> Vec<OutgoingResponse> {
        self.0.responses.lock().clone()
    }

    pub fn last_response(&self) -> Option<OutgoingResponse> {
        self.0.responses.lock().last().cloned()
    }
}

#[async_trait::async_trait]
impl ServerTransaction for FakeServerTransaction {
    async fn respond(&self, response: OutgoingResponse) -> Result<(), SignalingError> {
        self.0.responses.lock().push(response);
        Ok(())
    }

    async fn wait_terminated(&self) {
        self.0.terminated.notified().await;
    }
}

// ---------------------------------------------------------------------
// RequestSender
// ---------------------------------------------------------------------

#[derive(Debug, Default)]
struct RequestSenderState {
    sends: Mutex<u32>,
    cancels: Mutex<Vec<Option<BytesStr>>>,
}

/// The sender for the initial INVITE. `send()` always succeeds immediately;
/// responses are delivered to the session separately via
/// `receive_response()`, matching how the real transaction layer would
/// dispatch them out of band.
#[derive(Debug, Default, Clone)]
pub struct FakeRequestSender(Arc<RequestSenderState>);

impl FakeRequestSender {
    pub fn send_count(&self) -> u32 {
        *self.0.sends.lock()
    }

    pub fn cancels(&self) -> Vec<Option<BytesStr>> {
        self.0.cancels.lock().clone()
    }
}

#[async_trait::async_trait]
impl RequestSender for FakeRequestSender {
    async fn send(&mut self) -> Result<(), SignalingError> {
        *self.0.sends.lock() += 1;
        Ok(())
    }

    async fn cancel(&mut self, reason: Option<BytesStr>) -> Result<(), SignalingError> {
        self.0.cancels.lock().push(reason);
        Ok(())
    }
}

// ---------------------------------------------------------------------
// MediaHandler
// ---------------------------------------------------------------------

#[derive(Debug, Default)]
struct MediaState {
    local: Mutex<Vec<MediaStreamHandle>>,
    remote: Mutex<Vec<MediaStreamHandle>>,
    closed: AtomicBool,
    reject_remote_sdp: AtomicBool,
}

/// A media handler that always succeeds unless told otherwise via
/// [`FakeMediaHandler::set_reject_remote_sdp`], used to exercise the
/// `BAD_MEDIA_DESCRIPTION` paths without a real offer/answer engine.
#[derive(Debug, Default, Clone)]
pub struct FakeMediaHandler(Arc<MediaState>);

impl FakeMediaHandler {
    pub fn set_reject_remote_sdp(&self, reject: bool) {
        self.0.reject_remote_sdp.store(reject, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.0.closed.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl MediaHandler for FakeMediaHandler {
    async fn get_user_media(
        &mut self,
        _constraints: MediaConstraints,
    ) -> Result<MediaStreamHandle, MediaError> {
        Ok(MediaStreamHandle("local-mic".to_owned()))
    }

    async fn add_stream(&mut self, stream: MediaStreamHandle) -> Result<(), MediaError> {
        self.0.local.lock().push(stream);
        Ok(())
    }

    async fn create_offer(&mut self) -> Result<SessionDescription, MediaError> {
        Ok(sample_sdp())
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, MediaError> {
        Ok(sample_sdp())
    }

    async fn on_remote_sdp(
        &mut self,
        kind: SdpKind,
        _sdp: SessionDescription,
    ) -> Result<(), MediaError> {
        if self.0.reject_remote_sdp.load(Ordering::SeqCst) {
            return Err(MediaError::Rejected("test-configured rejection".to_owned()));
        }
        self.0
            .remote
            .lock()
            .push(MediaStreamHandle(format!("remote-{kind:?}")));
        Ok(())
    }

    async fn close(&mut self) {
        self.0.closed.store(true, Ordering::SeqCst);
    }

    fn local_streams(&self) -> Vec<MediaStreamHandle> {
        self.0.local.lock().clone()
    }

    fn remote_streams(&self) -> Vec<MediaStreamHandle> {
        self.0.remote.lock().clone()
    }
}

// ---------------------------------------------------------------------
// SessionRegistry
// ---------------------------------------------------------------------

#[derive(Debug, Default)]
struct RegistryState {
    registered: Mutex<Vec<String>>,
    deregistered: Mutex<Vec<String>>,
}

/// Records every `register`/`deregister` call instead of actually routing
/// anything, so tests can assert spec.md invariant 4 (registration lifetime).
#[derive(Debug, Default, Clone)]
pub struct RecordingRegistry(Arc<RegistryState>);

impl RecordingRegistry {
    pub fn is_currently_registered(&self, id: &str) -> bool {
        let registered = self.0.registered.lock();
        let deregistered = self.0.deregistered.lock();
        let last_register = registered.iter().rposition(|s| s == id);
        let last_deregister = deregistered.iter().rposition(|s| s == id);
        match (last_register, last_deregister) {
            (Some(_), None) => true,
            (Some(r), Some(d)) => r > d,
            _ => false,
        }
    }

    pub fn deregister_count(&self, id: &str) -> usize {
        self.0.deregistered.lock().iter().filter(|s| *s == id).count()
    }
}

impl SessionRegistry for RecordingRegistry {
    fn register(&self, session_id: &str) {
        self.0.registered.lock().push(session_id.to_owned());
    }

    fn deregister(&self, session_id: &str) {
        self.0.deregistered.lock().push(session_id.to_owned());
    }
}
