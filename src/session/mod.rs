//! Session registry: the three bidirectional maps from §4.1.
//!
//! `tag_id -> session_id`, `session_id -> connection`, `connection -> session_id`.
//! A handshake carrying an already-registered `tag_id` supersedes the prior
//! session (I6): the old connection is closed before the new mappings land.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::info;
use uuid::Uuid;

use crate::protocol::event::StreamEvent;

/// Outbound channel to a single connection's sender task. Cloning is cheap;
/// every task that wants to push an event to a client holds one of these
/// rather than the socket itself.
pub type Outbox = mpsc::Sender<OutboundFrame>;

#[derive(Debug, Clone)]
pub enum OutboundFrame {
    Event(StreamEvent),
    Close,
}

/// A connection identifier distinct from `session_id`: a reconnect with the
/// same `tag_id` creates a new connection id even though, briefly, both the
/// old and new connection map to session ids.
pub type ConnectionId = Uuid;

#[derive(Clone)]
pub struct Session {
    pub session_id: String,
    pub tag_id: String,
    pub connection_id: ConnectionId,
    pub outbox: Outbox,
}

#[derive(Default)]
struct Tables {
    tag_to_session: HashMap<String, String>,
    session_to_connection: HashMap<String, ConnectionId>,
    connection_to_session: HashMap<ConnectionId, String>,
    sessions: HashMap<String, Session>,
}

pub struct SessionRegistry {
    tables: RwLock<Tables>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { tables: RwLock::new(Tables::default()) })
    }

    /// Perform a handshake: supersede any existing session for `tag_id`,
    /// mint a fresh `session_id`, and install the new mappings.
    ///
    /// Returns the new `Session` plus the superseded session, if any, so the
    /// caller can tear it down (close its connection, stop its orchestrator)
    /// after releasing this lock.
    pub async fn handshake(
        &self,
        tag_id: String,
        connection_id: ConnectionId,
        outbox: Outbox,
    ) -> (Session, Option<Session>) {
        let session_id = Uuid::new_v4().simple().to_string();
        let mut tables = self.tables.write().await;

        let superseded = if let Some(old_session_id) = tables.tag_to_session.get(&tag_id).cloned() {
            let old_session = tables.sessions.remove(&old_session_id);
            if let Some(old_conn) = tables.session_to_connection.remove(&old_session_id) {
                tables.connection_to_session.remove(&old_conn);
            }
            old_session
        } else {
            None
        };

        let session = Session {
            session_id: session_id.clone(),
            tag_id: tag_id.clone(),
            connection_id,
            outbox,
        };

        tables.tag_to_session.insert(tag_id, session_id.clone());
        tables.session_to_connection.insert(session_id.clone(), connection_id);
        tables.connection_to_session.insert(connection_id, session_id.clone());
        tables.sessions.insert(session_id, session.clone());

        if let Some(ref old) = superseded {
            info!("session {} superseded by reconnect for tag {}", old.session_id, old.tag_id);
        }

        (session, superseded)
    }

    pub async fn get(&self, session_id: &str) -> Option<Session> {
        self.tables.read().await.sessions.get(session_id).cloned()
    }

    pub async fn remove_by_connection(&self, connection_id: ConnectionId) -> Option<Session> {
        let mut tables = self.tables.write().await;
        let session_id = tables.connection_to_session.remove(&connection_id)?;
        let session = tables.sessions.remove(&session_id);
        tables.session_to_connection.remove(&session_id);
        if let Some(ref s) = session {
            // only drop the tag mapping if it still points at this session —
            // a superseding reconnect may already have overwritten it.
            if tables.tag_to_session.get(&s.tag_id) == Some(&session_id) {
                tables.tag_to_session.remove(&s.tag_id);
            }
        }
        session
    }

    pub async fn len(&self) -> usize {
        self.tables.read().await.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outbox() -> Outbox {
        mpsc::channel(8).0
    }

    #[tokio::test]
    async fn handshake_assigns_unique_session_ids() {
        let registry = SessionRegistry::new();
        let (s1, prev1) = registry.handshake("dev-1".into(), Uuid::new_v4(), outbox()).await;
        let (s2, prev2) = registry.handshake("dev-2".into(), Uuid::new_v4(), outbox()).await;
        assert!(prev1.is_none());
        assert!(prev2.is_none());
        assert_ne!(s1.session_id, s2.session_id);
    }

    #[tokio::test]
    async fn reconnect_with_same_tag_supersedes_prior_session() {
        let registry = SessionRegistry::new();
        let (first, _) = registry.handshake("dev-1".into(), Uuid::new_v4(), outbox()).await;
        let (second, superseded) = registry.handshake("dev-1".into(), Uuid::new_v4(), outbox()).await;

        assert_eq!(superseded.map(|s| s.session_id), Some(first.session_id.clone()));
        assert!(registry.get(&first.session_id).await.is_none());
        assert!(registry.get(&second.session_id).await.is_some());
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn remove_by_connection_clears_all_three_maps() {
        let registry = SessionRegistry::new();
        let conn = Uuid::new_v4();
        let (session, _) = registry.handshake("dev-1".into(), conn, outbox()).await;

        let removed = registry.remove_by_connection(conn).await.unwrap();
        assert_eq!(removed.session_id, session.session_id);
        assert_eq!(registry.len().await, 0);

        // a fresh handshake for the same tag_id should not see a stale mapping
        let (again, superseded) = registry.handshake("dev-1".into(), Uuid::new_v4(), outbox()).await;
        assert!(superseded.is_none());
        assert_ne!(again.session_id, session.session_id);
    }
}
