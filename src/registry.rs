//! Pending-session registry.
//!
//! The authenticator registers the matched credential here during the SSH
//! handshake; the session bridge claims it exactly once after the
//! handshake completes. The claim is a load-and-delete, which is the
//! synchronization point handing the authenticated identity from the auth
//! phase to the relay phase.

use std::net::SocketAddr;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use uuid::Uuid;

use crate::model::AccessCredential;

/// State carried from a successful auth callback to the session bridge.
#[derive(Debug, Clone)]
pub struct PendingSession {
    /// Proxy-assigned identifier of the inbound connection.
    pub session_uid: Uuid,

    /// Client's socket address.
    pub source_addr: SocketAddr,

    /// The credential that authenticated this connection.
    pub accessor: AccessCredential,
}

/// Concurrent map of pending sessions, owned by one gate instance.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<Uuid, PendingSession>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a pending session. An already occupied slot is left untouched
    /// and reported as `false`: two handshakes sharing a session id cannot
    /// legitimately happen, so the caller logs it as a bug instead of
    /// silently merging the flows.
    pub fn register(&self, pending: PendingSession) -> bool {
        match self.sessions.entry(pending.session_uid) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(pending);
                true
            }
        }
    }

    /// Claim (load-and-delete) the pending session for a connection.
    /// Returns `None` if nothing was registered or it was already claimed.
    pub fn claim(&self, session_uid: Uuid) -> Option<PendingSession> {
        self.sessions.remove(&session_uid).map(|(_, v)| v)
    }

    /// Number of unclaimed entries, used by tests and introspection.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
