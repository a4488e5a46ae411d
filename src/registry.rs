//! The user-agent session table (spec.md §3 invariant 4, §5 "Resource
//! ownership": "The user-agent session table is a weak back-reference
//! (lookup, not ownership)."). Out of scope as a concrete implementation —
//! the user agent owns the real table — but the session core must still
//! call register/deregister at the right points, so the interface lives
//! here.

/// Looked up by dialog id when an in-dialog request (ACK, BYE, INFO,
/// re-INVITE) needs to be routed to the session that owns it, and by
/// call-id while a UAC session is still pre-dialog.
pub trait SessionRegistry: Send + Sync {
    /// Register (or re-register, in the deferred-BYE case of spec.md §4.1)
    /// `session_id` so inbound requests can be routed back to it.
    fn register(&self, session_id: &str);

    /// Remove `session_id`. Called exactly once, from `close()`
    /// (spec.md §4.6).
    fn deregister(&self, session_id: &str);
}

/// A no-op registry for tests and standalone use, in the spirit of the
/// in-crate fakes documented in `SPEC_FULL.md` §2.4.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullRegistry;

impl SessionRegistry for NullRegistry {
    fn register(&self, _session_id: &str) {}
    fn deregister(&self, _session_id: &str) {}
}
