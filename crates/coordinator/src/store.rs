//! Concurrent session store.
//!
//! One `RwLock` guards the map structure; every session entry carries its
//! own mutex guarding the session fields, the round buffer, and the protocol
//! machine. Nothing holds both at once, and nothing holds an entry mutex
//! across a transport write.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use tss_protocols::{ProtocolMachine, RoundBuffer};
use tss_types::{ParticipantId, Session, SessionKind, SessionOrigin, SessionStatus};

use crate::error::{CoordinatorError, CoordinatorResult};

/// A session plus its node-local protocol state.
pub struct SessionEntry {
    pub session: Session,
    pub buffer: RoundBuffer,
    pub machine: Option<ProtocolMachine>,
    /// Round traffic that arrived before this node entered Running; replayed
    /// once the protocol machine exists. Bounded to keep a misbehaving peer
    /// from growing it.
    pub pending: Vec<(u16, ParticipantId, String)>,
}

/// Cap on buffered pre-Running deposits.
pub const MAX_PENDING_DEPOSITS: usize = 64;

impl SessionEntry {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            buffer: RoundBuffer::new(),
            machine: None,
            pending: Vec::new(),
        }
    }
}

pub type SharedEntry = Arc<Mutex<SessionEntry>>;

/// Map of active sessions. Terminal entries are retained for inspection.
#[derive(Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<Uuid, SharedEntry>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new session; ids are unique.
    pub async fn create(&self, session: Session) -> CoordinatorResult<SharedEntry> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.id) {
            return Err(CoordinatorError::Store(format!(
                "session {} already exists",
                session.id
            )));
        }
        let entry = Arc::new(Mutex::new(SessionEntry::new(session.clone())));
        sessions.insert(session.id, Arc::clone(&entry));
        Ok(entry)
    }

    pub async fn get(&self, id: Uuid) -> Option<SharedEntry> {
        self.sessions.read().await.get(&id).cloned()
    }

    /// Re-key a locally-minted session to the canonical id from a peer sync.
    pub async fn rename(&self, old_id: Uuid, new_id: Uuid) -> CoordinatorResult<()> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&new_id) {
            return Err(CoordinatorError::Store(format!(
                "cannot rename {old_id}: {new_id} already exists"
            )));
        }
        let entry = sessions
            .remove(&old_id)
            .ok_or(CoordinatorError::UnknownSession(old_id))?;
        sessions.insert(new_id, Arc::clone(&entry));
        drop(sessions);

        let mut guard = entry.lock().await;
        guard.session.id = new_id;
        Ok(())
    }

    /// Snapshot sessions, optionally filtered by status and kind.
    pub async fn list(
        &self,
        status: Option<SessionStatus>,
        kind: Option<SessionKind>,
    ) -> Vec<Session> {
        let entries: Vec<SharedEntry> = self.sessions.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            let guard = entry.lock().await;
            if status.is_some_and(|s| guard.session.status != s) {
                continue;
            }
            if kind.is_some_and(|k| guard.session.kind != k) {
                continue;
            }
            out.push(guard.session.clone());
        }
        out.sort_by_key(|s| s.created_at);
        out
    }

    /// Locate a locally-created, still-pending session matching a sync that
    /// arrived under a different (canonical) id.
    pub async fn find_provisional(
        &self,
        kind: SessionKind,
        participants: &[ParticipantId],
    ) -> Option<Uuid> {
        let entries: Vec<SharedEntry> = self.sessions.read().await.values().cloned().collect();
        for entry in entries {
            let guard = entry.lock().await;
            let session = &guard.session;
            if session.origin == SessionOrigin::Local
                && session.kind == kind
                && session.participants == participants
                && !session.is_terminal()
                && session.current_round == 0
            {
                return Some(session.id);
            }
        }
        None
    }

    pub async fn remove(&self, id: Uuid) -> bool {
        self.sessions.write().await.remove(&id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(
            Uuid::new_v4(),
            SessionKind::Dkg,
            vec![ParticipantId(1), ParticipantId(2)],
            2,
            SessionOrigin::Local,
        )
    }

    #[tokio::test]
    async fn create_rejects_duplicate_ids() {
        let store = SessionStore::new();
        let s = session();
        store.create(s.clone()).await.unwrap();
        assert!(store.create(s).await.is_err());
    }

    #[tokio::test]
    async fn rename_rekeys_and_updates_id() {
        let store = SessionStore::new();
        let s = session();
        let old_id = s.id;
        store.create(s).await.unwrap();

        let new_id = Uuid::new_v4();
        store.rename(old_id, new_id).await.unwrap();

        assert!(store.get(old_id).await.is_none());
        let entry = store.get(new_id).await.unwrap();
        assert_eq!(entry.lock().await.session.id, new_id);
    }

    #[tokio::test]
    async fn list_filters_by_status_and_kind() {
        let store = SessionStore::new();
        let mut completed = session();
        completed.status = SessionStatus::Completed;
        store.create(completed).await.unwrap();
        store.create(session()).await.unwrap();

        assert_eq!(store.list(None, None).await.len(), 2);
        assert_eq!(
            store
                .list(Some(SessionStatus::Completed), None)
                .await
                .len(),
            1
        );
        assert_eq!(
            store.list(None, Some(SessionKind::EcdsaSign)).await.len(),
            0
        );
    }

    #[tokio::test]
    async fn provisional_lookup_matches_kind_and_participants() {
        let store = SessionStore::new();
        let s = session();
        let id = s.id;
        let participants = s.participants.clone();
        store.create(s).await.unwrap();

        assert_eq!(
            store.find_provisional(SessionKind::Dkg, &participants).await,
            Some(id)
        );
        assert_eq!(
            store
                .find_provisional(SessionKind::Refresh, &participants)
                .await,
            None
        );
    }
}
