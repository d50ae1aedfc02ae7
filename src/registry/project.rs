//! Project domain model.
//!
//! A project is a registered filesystem root with its own execution state,
//! session id, subscriber set, and durable message log. Mutable fields live
//! behind the project's own lock; the async `execution_lock` is what makes
//! agent invocations strictly sequential per project.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::history::MessageLog;

/// Identifier of one WebSocket connection.
pub type ConnectionId = Uuid;

/// Sending half of a connection's outbound frame queue.
pub type Outbox = mpsc::UnboundedSender<String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectState {
    Idle,
    Executing,
    Error,
}

impl std::fmt::Display for ProjectState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProjectState::Idle => write!(f, "idle"),
            ProjectState::Executing => write!(f, "executing"),
            ProjectState::Error => write!(f, "error"),
        }
    }
}

/// Persisted mirror of a project's durable fields. Execution state is
/// deliberately absent: no execution survives a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectMetadata {
    pub id: Uuid,
    pub path: PathBuf,
    pub session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

#[derive(Debug)]
struct Shared {
    state: ProjectState,
    session_id: Option<String>,
    last_active: DateTime<Utc>,
    subscribers: HashMap<ConnectionId, Outbox>,
}

#[derive(Debug)]
pub struct Project {
    pub id: Uuid,
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub log: MessageLog,
    /// Held for the whole duration of an agent invocation; guarantees at
    /// most one in-flight execution per project.
    pub execution_lock: tokio::sync::Mutex<()>,
    shared: Mutex<Shared>,
}

impl Project {
    pub fn new(id: Uuid, path: PathBuf, log: MessageLog) -> Self {
        let now = Utc::now();
        Self {
            id,
            path,
            created_at: now,
            log,
            execution_lock: tokio::sync::Mutex::new(()),
            shared: Mutex::new(Shared {
                state: ProjectState::Idle,
                session_id: None,
                last_active: now,
                subscribers: HashMap::new(),
            }),
        }
    }

    /// Rebuild a project from persisted metadata. State is always IDLE.
    pub fn from_metadata(meta: ProjectMetadata, log: MessageLog) -> Self {
        Self {
            id: meta.id,
            path: meta.path,
            created_at: meta.created_at,
            log,
            execution_lock: tokio::sync::Mutex::new(()),
            shared: Mutex::new(Shared {
                state: ProjectState::Idle,
                session_id: meta.session_id,
                last_active: meta.last_active,
                subscribers: HashMap::new(),
            }),
        }
    }

    fn lock_shared(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> ProjectState {
        self.lock_shared().state
    }

    pub fn set_state(&self, state: ProjectState) {
        let mut shared = self.lock_shared();
        shared.state = state;
        shared.last_active = Utc::now();
    }

    pub fn session_id(&self) -> Option<String> {
        self.lock_shared().session_id.clone()
    }

    pub fn set_session_id(&self, session_id: Option<String>) {
        let mut shared = self.lock_shared();
        shared.session_id = session_id;
        shared.last_active = Utc::now();
    }

    pub fn last_active(&self) -> DateTime<Utc> {
        self.lock_shared().last_active
    }

    pub fn subscribe(&self, id: ConnectionId, outbox: Outbox) {
        self.lock_shared().subscribers.insert(id, outbox);
    }

    pub fn unsubscribe(&self, id: ConnectionId) -> bool {
        self.lock_shared().subscribers.remove(&id).is_some()
    }

    pub fn is_subscribed(&self, id: ConnectionId) -> bool {
        self.lock_shared().subscribers.contains_key(&id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock_shared().subscribers.len()
    }

    /// Send a serialized frame to every current subscriber. Subscribers
    /// whose connection has gone away are dropped from the set.
    pub fn broadcast(&self, frame: &str) {
        let mut shared = self.lock_shared();
        shared
            .subscribers
            .retain(|_, outbox| outbox.send(frame.to_string()).is_ok());
    }

    /// Snapshot of the durable fields for persistence.
    pub fn metadata(&self) -> ProjectMetadata {
        let shared = self.lock_shared();
        ProjectMetadata {
            id: self.id,
            path: self.path.clone(),
            session_id: shared.session_id.clone(),
            created_at: self.created_at,
            last_active: shared.last_active,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_project(dir: &TempDir) -> Project {
        let log = MessageLog::open(dir.path().join("logs")).unwrap();
        Project::new(Uuid::new_v4(), dir.path().to_path_buf(), log)
    }

    #[test]
    fn new_project_starts_idle_with_no_session() {
        let dir = TempDir::new().unwrap();
        let project = test_project(&dir);
        assert_eq!(project.state(), ProjectState::Idle);
        assert!(project.session_id().is_none());
        assert_eq!(project.subscriber_count(), 0);
    }

    #[test]
    fn from_metadata_resets_state_but_keeps_session() {
        let dir = TempDir::new().unwrap();
        let log = MessageLog::open(dir.path().join("logs")).unwrap();
        let meta = ProjectMetadata {
            id: Uuid::new_v4(),
            path: dir.path().to_path_buf(),
            session_id: Some("sess-42".to_string()),
            created_at: Utc::now(),
            last_active: Utc::now(),
        };
        let project = Project::from_metadata(meta.clone(), log);
        assert_eq!(project.state(), ProjectState::Idle);
        assert_eq!(project.session_id(), Some("sess-42".to_string()));
        assert_eq!(project.id, meta.id);
    }

    #[test]
    fn broadcast_reaches_only_subscribers() {
        let dir = TempDir::new().unwrap();
        let project = test_project(&dir);
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (_tx_b, mut rx_b) = mpsc::unbounded_channel::<String>();

        project.subscribe(Uuid::new_v4(), tx_a);
        project.broadcast("hello");

        assert_eq!(rx_a.try_recv().unwrap(), "hello");
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn broadcast_prunes_dead_subscribers() {
        let dir = TempDir::new().unwrap();
        let project = test_project(&dir);
        let (tx, rx) = mpsc::unbounded_channel();
        project.subscribe(Uuid::new_v4(), tx);
        drop(rx);

        project.broadcast("anyone there?");
        assert_eq!(project.subscriber_count(), 0);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let project = test_project(&dir);
        let id = Uuid::new_v4();
        let (tx, _rx) = mpsc::unbounded_channel();
        project.subscribe(id, tx);

        assert!(project.unsubscribe(id));
        assert!(!project.unsubscribe(id));
    }

    #[test]
    fn state_change_touches_last_active() {
        let dir = TempDir::new().unwrap();
        let project = test_project(&dir);
        let before = project.last_active();
        std::thread::sleep(std::time::Duration::from_millis(5));
        project.set_state(ProjectState::Executing);
        assert!(project.last_active() > before);
    }

    #[test]
    fn metadata_round_trips_through_json() {
        let dir = TempDir::new().unwrap();
        let project = test_project(&dir);
        project.set_session_id(Some("sess-1".to_string()));

        let meta = project.metadata();
        let json = serde_json::to_string(&meta).unwrap();
        assert!(json.contains("\"session_id\":\"sess-1\""));
        let parsed: ProjectMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, project.id);
        assert_eq!(parsed.session_id, Some("sess-1".to_string()));
    }
}
