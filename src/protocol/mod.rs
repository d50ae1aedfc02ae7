//! Wire protocol: JSON text frames over the WebSocket, in both directions
//! shaped as `{type, project_id?, data}`.
//!
//! Inbound frames decode to [`ClientEnvelope`] with the command left as a
//! string — dispatch happens in the router, and an unknown command is
//! answered with an `error` envelope rather than a decode failure. Outbound
//! frames are built through the [`ServerEnvelope`] constructors so every
//! handler emits the same shapes.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::warn;
use uuid::Uuid;

use crate::executor::ExecuteOptions;
use crate::history::{LogRecord, LogStats};
use crate::registry::{Project, ProjectState};

// ── Inbound ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ClientEnvelope {
    #[serde(rename = "type")]
    pub command: String,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Deserialize)]
pub struct ExecutePayload {
    pub prompt: String,
    #[serde(default)]
    pub options: ExecuteOptions,
}

#[derive(Debug, Deserialize)]
pub struct ProjectCreatePayload {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct GetMessagesPayload {
    pub since: DateTime<Utc>,
}

// ── Outbound ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateType {
    ProjectState,
    ProjectJoined,
    SessionReset,
    ExecutionKilled,
    ProjectDeleted,
    Stats,
}

#[derive(Debug, Serialize)]
pub struct ServerEnvelope {
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub data: Value,
}

impl ServerEnvelope {
    pub fn agent_message(project_id: Uuid, messages: &[Value], session_id: Option<&str>) -> Self {
        Self {
            kind: "agent_message",
            project_id: Some(project_id.to_string()),
            data: json!({
                "messages": messages,
                "session_id": session_id,
            }),
        }
    }

    pub fn update(project_id: Option<Uuid>, update_type: UpdateType, data: Value) -> Self {
        Self {
            kind: "update",
            project_id: project_id.map(|id| id.to_string()),
            data: json!({
                "update_type": update_type,
                "data": data,
            }),
        }
    }

    pub fn error(project_id: Option<Uuid>, message: impl std::fmt::Display) -> Self {
        Self {
            kind: "error",
            project_id: project_id.map(|id| id.to_string()),
            data: json!({ "error": message.to_string() }),
        }
    }

    pub fn message_history(project_id: Uuid, records: &[LogRecord]) -> Self {
        Self {
            kind: "message_history",
            project_id: Some(project_id.to_string()),
            data: json!(records),
        }
    }

    pub fn project_list(projects: &[ProjectSummary]) -> Self {
        Self {
            kind: "project_list",
            project_id: None,
            data: json!({ "projects": projects }),
        }
    }

    /// Serialize to a text frame. Our outbound types cannot fail to
    /// serialize in practice; if one ever does, degrade to a generic error
    /// frame instead of dropping the send silently.
    pub fn to_frame(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            warn!(kind = self.kind, error = %e, "failed to serialize outbound envelope");
            "{\"type\":\"error\",\"data\":{\"error\":\"internal serialization failure\"}}"
                .to_string()
        })
    }
}

// ── Views ────────────────────────────────────────────────────────────

/// Project row in a `project_list` response.
#[derive(Debug, Serialize)]
pub struct ProjectSummary {
    pub id: Uuid,
    pub path: PathBuf,
    pub state: ProjectState,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_message_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_time: Option<DateTime<Utc>>,
    pub message_count: usize,
}

impl ProjectSummary {
    pub fn collect(project: &Project) -> Self {
        let stats = log_stats(project);
        Self {
            id: project.id,
            path: project.path.clone(),
            state: project.state(),
            created_at: project.created_at,
            last_active: project.last_active(),
            first_message_time: stats.first_time,
            last_message_time: stats.last_time,
            message_count: stats.count,
        }
    }
}

/// Status snapshot sent to a joining connection so a reconnecting client
/// can resynchronize without replaying full history.
#[derive(Debug, Serialize)]
pub struct ProjectStatus {
    pub state: ProjectState,
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_message_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_time: Option<DateTime<Utc>>,
    pub message_count: usize,
}

impl ProjectStatus {
    pub fn snapshot(project: &Project) -> Self {
        let stats = log_stats(project);
        Self {
            state: project.state(),
            session_id: project.session_id(),
            first_message_time: stats.first_time,
            last_message_time: stats.last_time,
            message_count: stats.count,
        }
    }
}

fn log_stats(project: &Project) -> LogStats {
    project.log.stats().unwrap_or_else(|e| {
        warn!(project = %project.id, error = %e, "failed to read log stats");
        LogStats::default()
    })
}

/// Aggregate server stats, broadcast periodically to every connection.
#[derive(Debug, Serialize)]
pub struct ServerStats {
    pub total_projects: usize,
    pub idle: usize,
    pub executing: usize,
    pub error: usize,
    pub connected_clients: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::Direction;

    #[test]
    fn client_envelope_parses_with_project_id() {
        let raw = "{\"type\":\"execute\",\"project_id\":\"abc\",\"data\":{\"prompt\":\"hi\"}}";
        let envelope: ClientEnvelope = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.command, "execute");
        assert_eq!(envelope.project_id.as_deref(), Some("abc"));
        let payload: ExecutePayload = serde_json::from_value(envelope.data).unwrap();
        assert_eq!(payload.prompt, "hi");
        assert!(!payload.options.dangerously_skip_permissions);
    }

    #[test]
    fn client_envelope_tolerates_missing_data() {
        let envelope: ClientEnvelope =
            serde_json::from_str("{\"type\":\"project_list\"}").unwrap();
        assert_eq!(envelope.command, "project_list");
        assert!(envelope.project_id.is_none());
        assert!(envelope.data.is_null());
    }

    #[test]
    fn unknown_command_still_decodes() {
        let envelope: ClientEnvelope =
            serde_json::from_str("{\"type\":\"make_coffee\",\"data\":{}}").unwrap();
        assert_eq!(envelope.command, "make_coffee");
    }

    #[test]
    fn execute_payload_parses_full_options() {
        let raw = json!({
            "prompt": "fix the bug",
            "options": {
                "dangerously_skip_permissions": true,
                "allowed_tools": ["Read"],
                "model": "opus",
                "add_dirs": ["/extra"],
                "strict_mcp_config": true
            }
        });
        let payload: ExecutePayload = serde_json::from_value(raw).unwrap();
        assert!(payload.options.dangerously_skip_permissions);
        assert_eq!(payload.options.allowed_tools, vec!["Read"]);
        assert_eq!(payload.options.model.as_deref(), Some("opus"));
    }

    #[test]
    fn agent_message_envelope_shape() {
        let id = Uuid::new_v4();
        let messages = vec![json!({"type": "result", "result": "done"})];
        let frame = ServerEnvelope::agent_message(id, &messages, Some("sess-1")).to_frame();
        assert!(frame.contains("\"type\":\"agent_message\""));
        assert!(frame.contains(&format!("\"project_id\":\"{id}\"")));
        assert!(frame.contains("\"session_id\":\"sess-1\""));
        assert!(frame.contains("\"messages\""));
    }

    #[test]
    fn update_envelope_nests_update_type() {
        let id = Uuid::new_v4();
        let frame = ServerEnvelope::update(
            Some(id),
            UpdateType::ProjectState,
            json!({"state": "executing"}),
        )
        .to_frame();
        assert!(frame.contains("\"type\":\"update\""));
        assert!(frame.contains("\"update_type\":\"project_state\""));
        assert!(frame.contains("\"state\":\"executing\""));
    }

    #[test]
    fn update_type_names_are_snake_case() {
        for (ut, expected) in [
            (UpdateType::ProjectState, "project_state"),
            (UpdateType::ProjectJoined, "project_joined"),
            (UpdateType::SessionReset, "session_reset"),
            (UpdateType::ExecutionKilled, "execution_killed"),
            (UpdateType::ProjectDeleted, "project_deleted"),
            (UpdateType::Stats, "stats"),
        ] {
            assert_eq!(serde_json::to_value(ut).unwrap(), json!(expected));
        }
    }

    #[test]
    fn error_envelope_carries_project_id_when_known() {
        let id = Uuid::new_v4();
        let frame = ServerEnvelope::error(Some(id), "boom").to_frame();
        assert!(frame.contains("\"error\":\"boom\""));
        assert!(frame.contains(&id.to_string()));

        let frame = ServerEnvelope::error(None, "boom").to_frame();
        assert!(!frame.contains("project_id"));
    }

    #[test]
    fn message_history_serializes_records() {
        let id = Uuid::new_v4();
        let records = vec![LogRecord::new(json!("hello"), Direction::Client)];
        let frame = ServerEnvelope::message_history(id, &records).to_frame();
        assert!(frame.contains("\"type\":\"message_history\""));
        assert!(frame.contains("\"direction\":\"client\""));
        // data is the bare ordered array.
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert!(value["data"].is_array());
    }

    #[test]
    fn project_list_envelope_shape() {
        let summary = ProjectSummary {
            id: Uuid::new_v4(),
            path: PathBuf::from("/wip/p1"),
            state: ProjectState::Idle,
            created_at: Utc::now(),
            last_active: Utc::now(),
            first_message_time: None,
            last_message_time: None,
            message_count: 0,
        };
        let frame = ServerEnvelope::project_list(std::slice::from_ref(&summary)).to_frame();
        assert!(frame.contains("\"type\":\"project_list\""));
        assert!(frame.contains("\"state\":\"idle\""));
        assert!(frame.contains("/wip/p1"));
        // Empty stats are omitted entirely rather than serialized as null.
        assert!(!frame.contains("first_message_time"));
    }

    #[test]
    fn server_stats_serialize_flat() {
        let stats = ServerStats {
            total_projects: 3,
            idle: 2,
            executing: 1,
            error: 0,
            connected_clients: 4,
        };
        let value = serde_json::to_value(&stats).unwrap();
        assert_eq!(value["total_projects"], 3);
        assert_eq!(value["connected_clients"], 4);
    }
}
