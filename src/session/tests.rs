//! End-to-end session-core scenarios (spec.md §8's testable properties),
//! driven through the fakes in [`crate::test_support`] instead of a real
//! transport or media engine.

use super::*;
use crate::causes::Cause;
use crate::events::{Event, Originator};
use crate::options::{AnswerOptions, ConnectOptions, TerminateOptions, TimerConfig};
use crate::test_support::*;
use bytesstr::BytesStr;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Shared `Vec<Event>` a test subscribes to the session under test, so
/// assertions can inspect the full emitted sequence afterwards.
#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<Event>>>);

impl Recorder {
    fn attach(&self, session: &mut Session) {
        let sink = self.0.clone();
        session.subscribe(move |event| sink.lock().push(event.clone()));
    }

    fn events(&self) -> Vec<Event> {
        self.0.lock().clone()
    }

    fn last(&self) -> Option<Event> {
        self.0.lock().last().cloned()
    }
}

fn local_contact() -> Header {
    (
        BytesStr::from_static("Contact"),
        BytesStr::from_static("<sip:alice@127.0.0.1:5060>"),
    )
}

#[tokio::test]
async fn uac_happy_path() {
    let log = Arc::new(WireLog::default());
    let factory: Arc<dyn DialogFactory> = Arc::new(FakeDialogFactory { log: log.clone() });
    let registry: Arc<dyn SessionRegistry> = Arc::new(RecordingRegistry::default());
    let media = FakeMediaHandler::default();
    let sender = FakeRequestSender::default();

    let mut session = Session::connect(
        BytesStr::from_static("call-1"),
        factory,
        registry,
        Box::new(media.clone()),
        Box::new(sender.clone()),
        ConnectOptions::default(),
        TimerConfig::default(),
    )
    .await
    .expect("connect succeeds");

    assert_eq!(session.status(), Status::InviteSent);
    assert_eq!(sender.send_count(), 1);

    let recorder = Recorder::default();
    recorder.attach(&mut session);

    session
        .receive_response(incoming_response("call-1", "uac-tag", None, 100, false, None))
        .await
        .unwrap();
    assert_eq!(session.status(), Status::InviteSent);

    session
        .receive_response(incoming_response(
            "call-1",
            "uac-tag",
            Some("uas-tag"),
            180,
            true,
            None,
        ))
        .await
        .unwrap();
    assert_eq!(session.status(), Status::OneXxReceived);

    session
        .receive_response(incoming_response(
            "call-1",
            "uac-tag",
            Some("uas-tag"),
            200,
            true,
            Some(sample_sdp_body()),
        ))
        .await
        .unwrap();

    assert_eq!(session.status(), Status::Confirmed);
    assert!(session.start_time().is_some());
    assert!(!session.remote_streams().is_empty());
    assert_eq!(log.methods(), vec![Method::ACK]);

    let events = recorder.events();
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::Progress { originator: Originator::Remote })));
    assert!(events.iter().any(|e| matches!(e, Event::Started { .. })));
}

#[tokio::test]
async fn uac_cancel_before_answer() {
    let log = Arc::new(WireLog::default());
    let factory: Arc<dyn DialogFactory> = Arc::new(FakeDialogFactory { log: log.clone() });
    let registry: Arc<dyn SessionRegistry> = Arc::new(RecordingRegistry::default());
    let media = FakeMediaHandler::default();
    let sender = FakeRequestSender::default();

    let mut session = Session::connect(
        BytesStr::from_static("call-2"),
        factory,
        registry,
        Box::new(media),
        Box::new(sender.clone()),
        ConnectOptions::default(),
        TimerConfig::default(),
    )
    .await
    .unwrap();

    session
        .receive_response(incoming_response(
            "call-2",
            "uac-tag",
            Some("uas-tag"),
            180,
            true,
            None,
        ))
        .await
        .unwrap();
    assert_eq!(session.status(), Status::OneXxReceived);

    let recorder = Recorder::default();
    recorder.attach(&mut session);

    session.terminate(TerminateOptions::default()).await.unwrap();
    assert_eq!(sender.cancels().len(), 1);

    session
        .receive_response(incoming_response(
            "call-2",
            "uac-tag",
            Some("uas-tag"),
            487,
            false,
            None,
        ))
        .await
        .unwrap();

    assert_eq!(session.status(), Status::Terminated);
    match recorder.last() {
        Some(Event::Failed { originator, cause }) => {
            assert_eq!(originator, Originator::Local);
            assert_eq!(cause, Cause::Canceled);
        }
        other => panic!("expected Failed(local, Canceled), got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn uas_no_answer_times_out() {
    let log = Arc::new(WireLog::default());
    let factory: Arc<dyn DialogFactory> = Arc::new(FakeDialogFactory { log });
    let registry: Arc<dyn SessionRegistry> = Arc::new(RecordingRegistry::default());
    let media = FakeMediaHandler::default();
    let tsx = FakeServerTransaction::default();

    let mut timer_config = TimerConfig::default();
    timer_config.no_answer_timeout = Duration::from_secs(30);

    let mut session = Session::init_incoming(
        incoming_invite("call-3", "uac-tag", Some(sample_sdp_body())),
        Box::new(tsx.clone()),
        factory,
        registry,
        Box::new(media),
        timer_config,
        local_contact(),
    )
    .await
    .unwrap();

    assert_eq!(session.status(), Status::WaitingForAnswer);
    assert_eq!(tsx.last_response().map(|r| r.code), Some(Code::RINGING));

    let recorder = Recorder::default();
    recorder.attach(&mut session);

    let event = session.select_timer().await;
    session.handle_timer(event).await.unwrap();

    assert_eq!(session.status(), Status::Terminated);
    assert_eq!(tsx.last_response().map(|r| r.code), Some(Code::REQUEST_TIMEOUT));
    match recorder.last() {
        Some(Event::Failed { originator, cause }) => {
            assert_eq!(originator, Originator::Local);
            assert_eq!(cause, Cause::NoAnswer);
        }
        other => panic!("expected Failed(local, NoAnswer), got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn uas_missing_ack_retransmits_then_times_out() {
    let log = Arc::new(WireLog::default());
    let factory: Arc<dyn DialogFactory> = Arc::new(FakeDialogFactory { log: log.clone() });
    let registry: Arc<dyn SessionRegistry> = Arc::new(RecordingRegistry::default());
    let media = FakeMediaHandler::default();
    let tsx = FakeServerTransaction::default();

    let config = TimerConfig::default();

    let mut session = Session::init_incoming(
        incoming_invite("call-4", "uac-tag", Some(sample_sdp_body())),
        Box::new(tsx.clone()),
        factory,
        registry,
        Box::new(media),
        config,
        local_contact(),
    )
    .await
    .unwrap();

    session.answer(AnswerOptions::default()).await.unwrap();
    assert_eq!(session.status(), Status::WaitingForAck);
    assert_eq!(tsx.responses().len(), 2); // 180 then 200

    let recorder = Recorder::default();
    recorder.attach(&mut session);

    // T1, 2T1, min(4T1, T2) retransmissions, all still WAITING_FOR_ACK.
    for _ in 0..3 {
        let event = session.select_timer().await;
        assert_eq!(event, TimerEvent::Invite2xx);
        session.handle_timer(event).await.unwrap();
        assert_eq!(session.status(), Status::WaitingForAck);
    }
    assert_eq!(tsx.responses().len(), 5);

    // No ACK ever arrives: TIMER_H fires, BYE goes out, ended(remote, NoAck).
    loop {
        let event = session.select_timer().await;
        session.handle_timer(event).await.unwrap();
        if event == TimerEvent::Ack {
            break;
        }
    }

    assert_eq!(session.status(), Status::Terminated);
    assert!(log.methods().contains(&Method::BYE));
    match recorder.last() {
        Some(Event::Ended { originator, cause }) => {
            assert_eq!(originator, Originator::Remote);
            assert_eq!(cause, Cause::NoAck);
        }
        other => panic!("expected Ended(remote, NoAck), got {other:?}"),
    }
}

#[tokio::test]
async fn uac_missing_sdp_answer_is_bad_media_description_not_canceled() {
    let log = Arc::new(WireLog::default());
    let factory: Arc<dyn DialogFactory> = Arc::new(FakeDialogFactory { log: log.clone() });
    let registry: Arc<dyn SessionRegistry> = Arc::new(RecordingRegistry::default());
    let media = FakeMediaHandler::default();
    let sender = FakeRequestSender::default();

    let mut session = Session::connect(
        BytesStr::from_static("call-7"),
        factory,
        registry,
        Box::new(media),
        Box::new(sender),
        ConnectOptions::default(),
        TimerConfig::default(),
    )
    .await
    .unwrap();

    let recorder = Recorder::default();
    recorder.attach(&mut session);

    // A 200 with no body at all: acceptAndTerminate must run with
    // BadMediaDescription, not the hardcoded Canceled it used to carry.
    session
        .receive_response(incoming_response(
            "call-7",
            "uac-tag",
            Some("uas-tag"),
            200,
            true,
            None,
        ))
        .await
        .unwrap();

    assert_eq!(session.status(), Status::Terminated);
    match recorder.last() {
        Some(Event::Failed { originator, cause }) => {
            assert_eq!(originator, Originator::Local);
            assert_eq!(cause, Cause::BadMediaDescription);
        }
        other => panic!("expected Failed(local, BadMediaDescription), got {other:?}"),
    }

    let bye = log
        .sent()
        .into_iter()
        .find(|r| r.method == Method::BYE)
        .expect("BYE was sent");
    let reason = bye
        .headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("Reason"))
        .expect("Reason header present");
    assert!(reason.1.contains("cause=488"));
}

#[tokio::test]
async fn uac_rejected_sdp_answer_is_bad_media_description() {
    let log = Arc::new(WireLog::default());
    let factory: Arc<dyn DialogFactory> = Arc::new(FakeDialogFactory { log: log.clone() });
    let registry: Arc<dyn SessionRegistry> = Arc::new(RecordingRegistry::default());
    let media = FakeMediaHandler::default();
    media.set_reject_remote_sdp(true);
    let sender = FakeRequestSender::default();

    let mut session = Session::connect(
        BytesStr::from_static("call-8"),
        factory,
        registry,
        Box::new(media),
        Box::new(sender),
        ConnectOptions::default(),
        TimerConfig::default(),
    )
    .await
    .unwrap();

    let recorder = Recorder::default();
    recorder.attach(&mut session);

    session
        .receive_response(incoming_response(
            "call-8",
            "uac-tag",
            Some("uas-tag"),
            200,
            true,
            Some(sample_sdp_body()),
        ))
        .await
        .unwrap();

    assert_eq!(session.status(), Status::Terminated);
    match recorder.last() {
        Some(Event::Failed { originator, cause }) => {
            assert_eq!(originator, Originator::Local);
            assert_eq!(cause, Cause::BadMediaDescription);
        }
        other => panic!("expected Failed(local, BadMediaDescription), got {other:?}"),
    }
    assert!(log.methods().contains(&Method::BYE));
}

#[tokio::test]
async fn registry_reflects_session_lifetime() {
    let log = Arc::new(WireLog::default());
    let factory: Arc<dyn DialogFactory> = Arc::new(FakeDialogFactory { log });
    let registry = Arc::new(RecordingRegistry::default());
    let media = FakeMediaHandler::default();
    let sender = FakeRequestSender::default();

    let session = Session::connect(
        BytesStr::from_static("call-9"),
        factory,
        registry.clone() as Arc<dyn SessionRegistry>,
        Box::new(media),
        Box::new(sender),
        ConnectOptions::default(),
        TimerConfig::default(),
    )
    .await
    .unwrap();

    let id = session.id().to_string();
    assert!(registry.is_currently_registered(&id));
    assert_eq!(registry.deregister_count(&id), 0);

    let mut session = session;
    session.shutdown().await;

    assert!(!registry.is_currently_registered(&id));
    assert_eq!(registry.deregister_count(&id), 1);
}

#[tokio::test]
async fn session_dtmf_tick_emits_event_and_sends_info() {
    let log = Arc::new(WireLog::default());
    let factory: Arc<dyn DialogFactory> = Arc::new(FakeDialogFactory { log: log.clone() });
    let registry: Arc<dyn SessionRegistry> = Arc::new(RecordingRegistry::default());
    let media = FakeMediaHandler::default();
    let sender = FakeRequestSender::default();

    let mut session = Session::connect(
        BytesStr::from_static("call-10"),
        factory,
        registry,
        Box::new(media),
        Box::new(sender),
        ConnectOptions::default(),
        TimerConfig::default(),
    )
    .await
    .unwrap();

    session
        .receive_response(incoming_response(
            "call-10",
            "uac-tag",
            Some("uas-tag"),
            200,
            true,
            Some(sample_sdp_body()),
        ))
        .await
        .unwrap();
    assert_eq!(session.status(), Status::Confirmed);

    let recorder = Recorder::default();
    recorder.attach(&mut session);

    session
        .send_dtmf("1", crate::options::SendDtmfOptions::default())
        .unwrap();

    let due = session.select_dtmf().await;
    assert_eq!(due.0, '1');
    session.handle_dtmf_tick(due).await;

    match recorder.last() {
        Some(Event::NewDtmf { originator, tone, .. }) => {
            assert_eq!(originator, Originator::Local);
            assert_eq!(tone, '1');
        }
        other => panic!("expected NewDtmf(local, '1'), got {other:?}"),
    }

    let info = log
        .sent()
        .into_iter()
        .find(|r| r.method == Method::from("INFO"))
        .expect("INFO was sent");
    let body = info.body.expect("INFO carries a body");
    assert!(std::str::from_utf8(&body).unwrap().contains("Signal=1"));
}

#[tokio::test]
async fn forked_2xx_is_rejected_without_touching_primary_session() {
    let log = Arc::new(WireLog::default());
    let factory: Arc<dyn DialogFactory> = Arc::new(FakeDialogFactory { log: log.clone() });
    let registry: Arc<dyn SessionRegistry> = Arc::new(RecordingRegistry::default());
    let media = FakeMediaHandler::default();
    let sender = FakeRequestSender::default();

    let mut session = Session::connect(
        BytesStr::from_static("call-5"),
        factory,
        registry,
        Box::new(media),
        Box::new(sender),
        ConnectOptions::default(),
        TimerConfig::default(),
    )
    .await
    .unwrap();

    let recorder = Recorder::default();
    recorder.attach(&mut session);

    session
        .receive_response(incoming_response(
            "call-5",
            "uac-tag",
            Some("branch-a"),
            200,
            true,
            Some(sample_sdp_body()),
        ))
        .await
        .unwrap();
    assert_eq!(session.status(), Status::Confirmed);
    let started_count = recorder
        .events()
        .iter()
        .filter(|e| matches!(e, Event::Started { .. }))
        .count();
    assert_eq!(started_count, 1);

    // A second, forked 2xx with a different remote tag arrives later.
    session
        .receive_response(incoming_response(
            "call-5",
            "uac-tag",
            Some("branch-b"),
            200,
            true,
            Some(sample_sdp_body()),
        ))
        .await
        .unwrap();

    assert_eq!(session.status(), Status::Confirmed);
    let started_count_after = recorder
        .events()
        .iter()
        .filter(|e| matches!(e, Event::Started { .. }))
        .count();
    assert_eq!(started_count_after, 1, "forked 2xx must not re-trigger started");

    // ACK then BYE went out on the throwaway dialog (and the ACK on the
    // primary dialog from the first 2xx), leaving at least one BYE.
    assert!(log.methods().contains(&Method::BYE));
}

#[tokio::test]
async fn deferred_bye_after_terminate_in_waiting_for_ack() {
    let log = Arc::new(WireLog::default());
    let factory: Arc<dyn DialogFactory> = Arc::new(FakeDialogFactory { log: log.clone() });
    let registry: Arc<dyn SessionRegistry> = Arc::new(RecordingRegistry::default());
    let media = FakeMediaHandler::default();
    let tsx = FakeServerTransaction::default();

    let mut session = Session::init_incoming(
        incoming_invite("call-6", "uac-tag", Some(sample_sdp_body())),
        Box::new(tsx.clone()),
        factory,
        registry,
        Box::new(media),
        TimerConfig::default(),
        local_contact(),
    )
    .await
    .unwrap();

    session.answer(AnswerOptions::default()).await.unwrap();
    assert_eq!(session.status(), Status::WaitingForAck);

    let recorder = Recorder::default();
    recorder.attach(&mut session);

    session.terminate(TerminateOptions::default()).await.unwrap();
    // `ended` fires immediately, but no BYE yet and the session is not torn
    // down: the ACK/server-transaction race hasn't resolved.
    assert!(!log.methods().contains(&Method::BYE));
    assert_eq!(session.status(), Status::WaitingForAck);
    match recorder.last() {
        Some(Event::Ended { originator, cause }) => {
            assert_eq!(originator, Originator::Local);
            assert_eq!(cause, Cause::Bye);
        }
        other => panic!("expected Ended(local, Bye), got {other:?}"),
    }

    session
        .receive_request(incoming_request(Method::ACK, "call-6", "uac-tag", None))
        .await
        .unwrap();

    assert_eq!(session.status(), Status::Terminated);
    assert!(log.methods().contains(&Method::BYE));
    assert_eq!(log.terminated_dialogs(), 1);

    let ended_count = recorder
        .events()
        .iter()
        .filter(|e| matches!(e, Event::Ended { .. }))
        .count();
    assert_eq!(ended_count, 1, "ended must fire exactly once");

    // The server-transaction-terminated trigger is now a no-op.
    tsx.terminate();
    session.handle_deferred_bye_tsx_terminated().await;
    assert_eq!(log.methods().iter().filter(|m| **m == Method::BYE).count(), 1);
}
