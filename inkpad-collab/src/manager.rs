//! Per-tab session ownership.
//!
//! One `SessionManager` is constructed per tab at the composition root and
//! passed by reference to document views. It owns every live session, keyed
//! by document id, and enforces the invariant that a tab holds at most one
//! active session per document: opening a document again replaces (and
//! closes) the prior session, matching view remount semantics.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::protocol::PeerInfo;
use crate::session::{DocSession, SessionConfig, SessionError};
use crate::transport::Transport;

pub struct SessionManager {
    transport: Arc<dyn Transport>,
    peer: PeerInfo,
    config: SessionConfig,
    sessions: Mutex<HashMap<Uuid, DocSession>>,
}

impl SessionManager {
    pub fn new(transport: Arc<dyn Transport>, peer: PeerInfo, config: SessionConfig) -> Self {
        Self {
            transport,
            peer,
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Open a session for `doc_id` seeded with `initial` content.
    ///
    /// Non-blocking: the connection proceeds on the session's driver task.
    /// Any prior session for the same document in this manager is closed and
    /// replaced. Must be called from within a tokio runtime.
    pub fn open(&self, doc_id: Uuid, initial: &str) -> Result<DocSession, SessionError> {
        if doc_id.is_nil() {
            return Err(SessionError::NilDocumentId);
        }

        let session = DocSession::open(
            self.transport.clone(),
            self.peer.clone(),
            self.config.clone(),
            doc_id,
            initial,
        );

        let prior = self
            .sessions
            .lock()
            .unwrap()
            .insert(doc_id, session.clone());
        if let Some(prior) = prior {
            log::debug!("replacing existing session for doc {doc_id}");
            prior.close();
        }

        Ok(session)
    }

    /// Handle to the live session for `doc_id`, if any.
    pub fn get(&self, doc_id: Uuid) -> Option<DocSession> {
        self.sessions.lock().unwrap().get(&doc_id).cloned()
    }

    /// Close and remove the session for `doc_id`. Returns whether one
    /// existed.
    pub fn close(&self, doc_id: Uuid) -> bool {
        match self.sessions.lock().unwrap().remove(&doc_id) {
            Some(session) => {
                session.close();
                true
            }
            None => false,
        }
    }

    /// Close every live session (tab teardown).
    pub fn close_all(&self) {
        let sessions: Vec<DocSession> = self.sessions.lock().unwrap().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.close();
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().unwrap().is_empty()
    }

    pub fn peer(&self) -> &PeerInfo {
        &self.peer
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.close_all();
    }
}
