//! Session lookup and lazy startup.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::protocol::{RejectReason, SessionState};
use crate::session::{SessionConfig, SessionHandle};
use crate::storage::SessionStore;

type Sessions = Arc<RwLock<HashMap<Uuid, SessionHandle>>>;

/// Live sessions by ID. Each session's entry is removed once its task ends.
pub struct SessionRegistry {
    sessions: Sessions,
    store: Arc<dyn SessionStore>,
    config: SessionConfig,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn SessionStore>, config: SessionConfig) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            store,
            config,
        }
    }

    /// Running session for `session_id`, started on demand.
    ///
    /// Fails with `project_mismatch` when the session is live for a
    /// different project.
    pub async fn get_or_start(&self, session_id: Uuid, project_id: Uuid) -> Result<SessionHandle, RejectReason> {
        // Fast path: read lock
        {
            let sessions = self.sessions.read().await;
            if let Some(handle) = sessions.get(&session_id) {
                if !handle.is_ended() {
                    return Self::check_project(handle, project_id);
                }
            }
        }

        // Slow path: write lock with double-check
        let mut sessions = self.sessions.write().await;
        if let Some(handle) = sessions.get(&session_id) {
            if !handle.is_ended() {
                return Self::check_project(handle, project_id);
            }
        }

        let handle = SessionHandle::spawn(session_id, project_id, self.store.clone(), self.config.clone());
        sessions.insert(session_id, handle.clone());
        Self::remove_when_ended(self.sessions.clone(), handle.clone());
        log::info!("Started session {session_id} for project {project_id}");
        Ok(handle)
    }

    /// Drop the session's entry once its task exits. A replacement started
    /// under the same ID in the meantime is left alone.
    fn remove_when_ended(sessions: Sessions, handle: SessionHandle) {
        tokio::spawn(async move {
            handle.wait_ended().await;
            let session_id = handle.session_id();
            let mut sessions = sessions.write().await;
            if sessions.get(&session_id).is_some_and(|h| h.is_ended()) {
                sessions.remove(&session_id);
                log::debug!("Removed ended session {session_id}");
            }
        });
    }

    pub async fn get(&self, session_id: &Uuid) -> Option<SessionHandle> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .filter(|h| !h.is_ended())
            .cloned()
    }

    /// Sessions whose task is still running.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.values().filter(|h| !h.is_ended()).count()
    }

    /// Sessions currently in the `Active` state.
    pub async fn active_sessions(&self) -> Vec<Uuid> {
        self.sessions
            .read()
            .await
            .iter()
            .filter(|(_, h)| h.state() == SessionState::Active)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn check_project(handle: &SessionHandle, project_id: Uuid) -> Result<SessionHandle, RejectReason> {
        if handle.project_id() == project_id {
            Ok(handle.clone())
        } else {
            Err(RejectReason::ProjectMismatch)
        }
    }
}
