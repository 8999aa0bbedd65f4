use std::fmt;
use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Time-ordered, so ids sort by creation.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// State kept for one RTSP connection. The socket itself belongs to the
/// connection task; this is the shareable part.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Session {
    pub id: SessionId,
    pub peer: SocketAddr,
    pub local_addr: SocketAddr,
    /// Last `CSeq` received on this connection.
    pub cseq: u32,
    pub transport: Option<String>,
    pub timeout_secs: u64,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

impl Session {
    pub fn new(peer: SocketAddr, local_addr: SocketAddr, timeout_secs: u64) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            peer,
            local_addr,
            cseq: 0,
            transport: None,
            timeout_secs,
            created_at: now,
            last_active: now,
        }
    }

    /// Value for the `Session` response header.
    pub fn header_value(&self) -> String {
        format!("{};timeout={}", self.id, self.timeout_secs)
    }
}

/// Live sessions keyed by id. Readers only ever get copies.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Session) {
        info!(session_id = %session.id, peer = %session.peer, "session created");
        self.sessions.insert(session.id, session);
    }

    pub fn remove(&self, id: &SessionId) -> Option<Session> {
        let removed = self.sessions.remove(id).map(|(_, s)| s);
        if removed.is_some() {
            info!(session_id = %id, "session removed");
        }
        removed
    }

    pub fn get(&self, id: &SessionId) -> Option<Session> {
        self.sessions.get(id).map(|s| s.clone())
    }

    /// Record an incoming request and return the updated session.
    pub fn touch(&self, id: &SessionId, cseq: Option<u32>) -> Option<Session> {
        let mut session = self.sessions.get_mut(id)?;
        if let Some(cseq) = cseq {
            session.cseq = cseq;
        }
        session.last_active = Utc::now();
        Some(session.clone())
    }

    pub fn set_transport(&self, id: &SessionId, transport: &str) {
        if let Some(mut session) = self.sessions.get_mut(id) {
            debug!(session_id = %id, transport, "transport negotiated");
            session.transport = Some(transport.to_string());
        }
    }

    pub fn snapshot(&self) -> Vec<Session> {
        let mut sessions: Vec<_> = self.sessions.iter().map(|s| s.value().clone()).collect();
        sessions.sort_by_key(|s| s.id.0);
        sessions
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn touch_records_cseq_and_activity() {
        let registry = SessionRegistry::new();
        let session = Session::new(addr(5000), addr(8554), 60);
        let id = session.id;
        let created = session.last_active;
        registry.insert(session);

        let updated = registry.touch(&id, Some(7)).unwrap();
        assert_eq!(updated.cseq, 7);
        assert!(updated.last_active >= created);

        let kept = registry.touch(&id, None).unwrap();
        assert_eq!(kept.cseq, 7);
    }

    #[test]
    fn snapshot_is_detached_copy() {
        let registry = SessionRegistry::new();
        let session = Session::new(addr(5000), addr(8554), 60);
        let id = session.id;
        registry.insert(session);

        let mut copies = registry.snapshot();
        copies[0].cseq = 99;
        copies[0].transport = Some("mutated".into());
        assert_eq!(registry.get(&id).unwrap().cseq, 0);
        assert!(registry.get(&id).unwrap().transport.is_none());

        registry.set_transport(&id, "RTP/AVP;unicast;client_port=8000-8001");
        assert!(copies[0].transport.as_deref() == Some("mutated"));
        assert!(registry.remove(&id).is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn session_header_carries_timeout() {
        let session = Session::new(addr(1), addr(2), 45);
        let value = session.header_value();
        assert!(value.ends_with(";timeout=45"));
        assert_eq!(value.split(';').next().unwrap().len(), 32);
    }
}
