//! The media collaborator (spec.md §6, §4): an abstract offer/answer and
//! stream-attachment interface. The concrete media engine (PeerConnection,
//! codecs, SRTP) is out of scope; the session core only ever speaks to this
//! trait.

use sdp_types::SessionDescription;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("user denied media access")]
    UserDenied,
    #[error("peer rejected SDP: {0}")]
    Rejected(String),
    #[error("media engine error: {0}")]
    Internal(String),
}

/// Constraints passed to [`MediaHandler::get_user_media`]
/// (spec.md §6: `getUserMedia(onStream, onFail, constraints)`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    /// spec.md §6: "constraints default to `{audio:true, video:true}`".
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

/// Opaque handle to a local or remote media stream
/// (`peerConnection.getLocalStreams()`/`getRemoteStreams()` in spec.md §6).
/// The core never inspects a stream's contents, only counts and forwards it.
#[derive(Debug, Clone)]
pub struct MediaStreamHandle(pub String);

/// Per-session media handler (spec.md §6: "A `MediaHandler` constructed per
/// session with optional DTLS/SRTP constraints").
///
/// Every method is async because every one is, conceptually, a suspension
/// point (spec.md §5): a continuation running after any of these calls
/// returns must re-check the session's status before mutating it.
#[async_trait::async_trait]
pub trait MediaHandler: Send + Sync {
    /// Whether this media handler can actually negotiate a session at all
    /// (spec.md §4.1: `connect()` "Fails with ... `NotSupported` if media
    /// unavailable"). Defaults to `true`; a handler backed by an engine that
    /// turned out to be unavailable (no codecs, no transport) overrides this
    /// to reject `connect()` synchronously instead of failing later inside
    /// `get_user_media`/`create_offer`.
    fn is_supported(&self) -> bool {
        true
    }

    /// Acquire local media matching `constraints`, bypassed entirely when
    /// the caller supplies a stream via `ConnectOptions`/`AnswerOptions`.
    async fn get_user_media(
        &mut self,
        constraints: MediaConstraints,
    ) -> Result<MediaStreamHandle, MediaError>;

    /// Attach a (possibly caller-supplied) stream to the underlying peer
    /// connection.
    async fn add_stream(&mut self, stream: MediaStreamHandle) -> Result<(), MediaError>;

    /// Create a local SDP offer.
    async fn create_offer(&mut self) -> Result<SessionDescription, MediaError>;

    /// Create a local SDP answer to whatever offer was most recently fed via
    /// [`MediaHandler::on_remote_sdp`].
    async fn create_answer(&mut self) -> Result<SessionDescription, MediaError>;

    /// Ingest a remote offer or answer.
    async fn on_remote_sdp(&mut self, kind: SdpKind, sdp: SessionDescription) -> Result<(), MediaError>;

    /// Release all media resources. Idempotent.
    async fn close(&mut self);

    /// Non-empty iff at least one local stream has been attached.
    fn local_streams(&self) -> Vec<MediaStreamHandle>;

    /// Non-empty iff at least one remote stream has been negotiated.
    fn remote_streams(&self) -> Vec<MediaStreamHandle>;
}

/// Which role an SDP body plays when fed to [`MediaHandler::on_remote_sdp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}
