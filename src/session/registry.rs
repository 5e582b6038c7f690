//! Per-process session registry.
//!
//! The only shared map of live sessions. Entries are handles to driver
//! tasks; session state itself lives inside each driver.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc, watch};
use tokio::task::JoinHandle;

use crate::session::driver::Command;
use crate::session::state::SessionStatus;

/// Handle to one running session driver.
pub struct SessionHandle {
    pub agent_id: String,
    pub(crate) commands: mpsc::Sender<Command>,
    status: watch::Receiver<SessionStatus>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub(crate) fn new(
        agent_id: impl Into<String>,
        commands: mpsc::Sender<Command>,
        status: watch::Receiver<SessionStatus>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            commands,
            status,
            task,
        }
    }

    /// Latest published status.
    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// A fresh receiver for status changes.
    pub fn watch(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Whether the driver task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if !self.task.is_finished() {
            tracing::debug!(agent_id = %self.agent_id, "Session handle dropped with live driver");
        }
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<SessionHandle>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a handle unless one is already registered. Returns false on
    /// collision.
    pub async fn create(&self, handle: SessionHandle) -> bool {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&handle.agent_id) {
            return false;
        }
        sessions.insert(handle.agent_id.clone(), Arc::new(handle));
        true
    }

    pub async fn get(&self, agent_id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.read().await.get(agent_id).cloned()
    }

    /// Replace the handle for an agent, returning the previous one.
    pub async fn update(&self, handle: SessionHandle) -> Option<Arc<SessionHandle>> {
        self.sessions
            .write()
            .await
            .insert(handle.agent_id.clone(), Arc::new(handle))
    }

    pub async fn remove(&self, agent_id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.write().await.remove(agent_id)
    }

    pub async fn list(&self) -> Vec<Arc<SessionHandle>> {
        let sessions = self.sessions.read().await;
        let mut handles: Vec<_> = sessions.values().cloned().collect();
        handles.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::state::Session;

    fn idle_handle(agent_id: &str) -> SessionHandle {
        let (commands, _rx) = mpsc::channel(1);
        let status = Session::new(agent_id).status(std::time::Duration::from_secs(60), chrono::Utc::now());
        let (_tx, status) = watch::channel(status);
        SessionHandle::new(agent_id, commands, status, tokio::spawn(async {}))
    }

    #[tokio::test]
    async fn test_create_get_update_remove() {
        let registry = SessionRegistry::new();
        assert!(registry.create(idle_handle("B")).await);
        assert!(registry.create(idle_handle("A")).await);
        assert!(!registry.create(idle_handle("A")).await);

        let a = registry.get("A").await.unwrap();
        assert_eq!(a.status().agent_id, "A");
        assert!(registry.get("C").await.is_none());

        let previous = registry.update(idle_handle("A")).await.unwrap();
        assert!(Arc::ptr_eq(&previous, &a));

        let ids: Vec<_> = registry
            .list()
            .await
            .iter()
            .map(|h| h.agent_id.clone())
            .collect();
        assert_eq!(ids, vec!["A".to_string(), "B".to_string()]);

        assert!(registry.remove("A").await.is_some());
        assert!(registry.remove("A").await.is_none());
    }
}
