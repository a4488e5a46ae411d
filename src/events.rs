//! Observable events (spec.md §2, §3): replaces the distilled source's
//! inherited-mixin event emitter with a typed observer registry, per spec.md
//! §9's redesign flag ("Event emission via inherited mixin → replace with a
//! typed observer registry per event name; events carry structured
//! payloads").

use crate::causes::Cause;
use crate::media::{MediaStreamHandle, SdpKind};
use crate::session::Direction;
use slotmap::{new_key_type, SlotMap};

new_key_type! {
    /// Handle returned by [`EventSink::subscribe`], used to
    /// [`EventSink::unsubscribe`] later.
    pub struct ListenerKey;
}

/// Whether an event was caused by the local side or the remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Originator {
    Local,
    Remote,
    System,
}

/// Structured event payloads (spec.md §2's event surface:
/// `newRTCSession → connecting? → progress* → started → (newDTMF*) →
/// ended` for success; `connecting? → progress* → failed` otherwise).
#[derive(Debug, Clone)]
pub enum Event {
    /// A new session object was created, before any signaling (UAC) or
    /// right after accepting an INVITE (UAS).
    NewSession { direction: Direction },
    /// The session began sending its initial request (UAC only).
    Connecting,
    /// A provisional response/early dialog was received or sent.
    Progress { originator: Originator },
    /// The session reached `CONFIRMED`.
    Started {
        originator: Originator,
        local_streams: Vec<MediaStreamHandle>,
        remote_streams: Vec<MediaStreamHandle>,
    },
    /// An out-of-band DTMF tone was sent or received (spec.md §9's Open
    /// Question: "implementers should emit it from the DTMF receiver").
    NewDtmf {
        originator: Originator,
        tone: char,
        duration: std::time::Duration,
    },
    /// A re-INVITE was received; this core only logs, never renegotiates
    /// (spec.md §4.3, Non-goals).
    ReInvite,
    /// The session ended after having reached `CONFIRMED`.
    Ended { originator: Originator, cause: Cause },
    /// The session failed before reaching `CONFIRMED`.
    Failed { originator: Originator, cause: Cause },
    /// A remote SDP offer or answer was ingested by the media handler.
    SdpNegotiated { kind: SdpKind },
}

type Listener = Box<dyn FnMut(&Event) + Send>;

/// Per-session observer registry. `ezk-sip-ua`'s dialog layer keeps a
/// `SlotMap<DefaultKey, Arc<dyn Usage>>` of request handlers
/// (`dialog/layer.rs`); this is the same structure applied to outbound
/// events instead of inbound requests.
#[derive(Default)]
pub struct EventSink {
    listeners: SlotMap<ListenerKey, Listener>,
}

impl EventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, listener: impl FnMut(&Event) + Send + 'static) -> ListenerKey {
        self.listeners.insert(Box::new(listener))
    }

    pub fn unsubscribe(&mut self, key: ListenerKey) {
        self.listeners.remove(key);
    }

    pub fn emit(&mut self, event: Event) {
        tracing::debug!(?event, "emitting session event");
        for (_, listener) in self.listeners.iter_mut() {
            listener(&event);
        }
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("listener_count", &self.listeners.len())
            .finish()
    }
}
