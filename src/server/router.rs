//! Inbound command dispatch.
//!
//! Every text frame decodes to a `{type, project_id?, data}` envelope and
//! dispatches by type. Validation failures are answered to the requesting
//! connection only; project-scoped events are broadcast exclusively to that
//! project's current subscribers.

use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::{ExecutionError, RegistryError};
use crate::history::Direction;
use crate::protocol::{
    ClientEnvelope, ExecutePayload, GetMessagesPayload, ProjectCreatePayload, ProjectStatus,
    ProjectSummary, ServerEnvelope, UpdateType,
};
use crate::registry::{ConnectionId, Outbox, Project, ProjectState};

use super::AppState;

pub async fn dispatch(state: &Arc<AppState>, conn_id: ConnectionId, outbox: &Outbox, raw: &str) {
    let envelope: ClientEnvelope = match serde_json::from_str(raw) {
        Ok(envelope) => envelope,
        Err(e) => {
            send(outbox, ServerEnvelope::error(None, format!("malformed envelope: {e}")));
            return;
        }
    };

    match envelope.command.as_str() {
        "execute" => handle_execute(state, outbox, envelope).await,
        "project_create" => handle_project_create(state, outbox, envelope),
        "project_delete" => handle_project_delete(state, conn_id, outbox, envelope),
        "project_list" => handle_project_list(state, outbox),
        "project_join" => handle_project_join(state, conn_id, outbox, envelope),
        "project_leave" => handle_project_leave(state, conn_id, outbox, envelope),
        "get_messages" => handle_get_messages(state, outbox, envelope),
        "agent_kill" => handle_agent_kill(state, outbox, envelope).await,
        "agent_new_session" => handle_agent_new_session(state, outbox, envelope),
        other => {
            send(
                outbox,
                ServerEnvelope::error(None, format!("unknown message type: {other}")),
            );
        }
    }
}

fn send(outbox: &Outbox, envelope: ServerEnvelope) {
    let _ = outbox.send(envelope.to_frame());
}

fn view<T: serde::Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

/// Resolve the envelope's `project_id` to a live project, or produce the
/// error envelope to answer with.
fn resolve_project(
    state: &AppState,
    project_id: Option<&str>,
) -> Result<Arc<Project>, ServerEnvelope> {
    let Some(raw) = project_id else {
        return Err(ServerEnvelope::error(None, "project_id is required"));
    };
    let Ok(id) = Uuid::parse_str(raw) else {
        return Err(ServerEnvelope::error(None, format!("invalid project_id: {raw}")));
    };
    state
        .registry
        .get(id)
        .ok_or_else(|| ServerEnvelope::error(Some(id), RegistryError::ProjectNotFound { id }))
}

fn append_or_warn(project: &Project, message: serde_json::Value, direction: Direction) {
    if let Err(e) = project.log.append(message, direction) {
        warn!(project = %project.id, error = %e, "failed to append log record");
    }
}

fn persist_or_warn(state: &AppState, project: &Project) {
    if let Err(e) = state.registry.persist(project) {
        warn!(project = %project.id, error = %e, "failed to persist project metadata");
    }
}

// ── Handlers ─────────────────────────────────────────────────────────

fn handle_project_create(state: &Arc<AppState>, outbox: &Outbox, envelope: ClientEnvelope) {
    let payload: ProjectCreatePayload = match serde_json::from_value(envelope.data) {
        Ok(payload) => payload,
        Err(e) => {
            send(outbox, ServerEnvelope::error(None, format!("bad project_create payload: {e}")));
            return;
        }
    };
    match state.registry.create(&payload.path) {
        Ok(project) => {
            let summary = ProjectSummary::collect(&project);
            send(
                outbox,
                ServerEnvelope::update(Some(project.id), UpdateType::ProjectState, view(&summary)),
            );
        }
        Err(e) => send(outbox, ServerEnvelope::error(None, e)),
    }
}

fn handle_project_list(state: &Arc<AppState>, outbox: &Outbox) {
    let mut summaries: Vec<ProjectSummary> = state
        .registry
        .list()
        .iter()
        .map(|p| ProjectSummary::collect(p))
        .collect();
    summaries.sort_by_key(|s| s.created_at);
    send(outbox, ServerEnvelope::project_list(&summaries));
}

fn handle_project_join(
    state: &Arc<AppState>,
    conn_id: ConnectionId,
    outbox: &Outbox,
    envelope: ClientEnvelope,
) {
    let project = match resolve_project(state, envelope.project_id.as_deref()) {
        Ok(project) => project,
        Err(error) => return send(outbox, error),
    };
    project.subscribe(conn_id, outbox.clone());
    let status = ProjectStatus::snapshot(&project);
    send(
        outbox,
        ServerEnvelope::update(Some(project.id), UpdateType::ProjectJoined, view(&status)),
    );
}

fn handle_project_leave(
    state: &Arc<AppState>,
    conn_id: ConnectionId,
    outbox: &Outbox,
    envelope: ClientEnvelope,
) {
    match resolve_project(state, envelope.project_id.as_deref()) {
        Ok(project) => {
            project.unsubscribe(conn_id);
        }
        Err(error) => send(outbox, error),
    }
}

fn handle_get_messages(state: &Arc<AppState>, outbox: &Outbox, envelope: ClientEnvelope) {
    let project = match resolve_project(state, envelope.project_id.as_deref()) {
        Ok(project) => project,
        Err(error) => return send(outbox, error),
    };
    let payload: GetMessagesPayload = match serde_json::from_value(envelope.data) {
        Ok(payload) => payload,
        Err(e) => {
            let error = format!("bad get_messages payload: {e}");
            return send(outbox, ServerEnvelope::error(Some(project.id), error));
        }
    };
    match project.log.messages_since(payload.since) {
        Ok(records) => send(outbox, ServerEnvelope::message_history(project.id, &records)),
        Err(e) => send(outbox, ServerEnvelope::error(Some(project.id), e)),
    }
}

fn handle_agent_new_session(state: &Arc<AppState>, outbox: &Outbox, envelope: ClientEnvelope) {
    let project = match resolve_project(state, envelope.project_id.as_deref()) {
        Ok(project) => project,
        Err(error) => return send(outbox, error),
    };
    project.set_session_id(None);
    persist_or_warn(state, &project);
    append_or_warn(&project, json!({"event": "session_reset"}), Direction::Server);
    info!(project = %project.id, "session reset");

    let status = ProjectStatus::snapshot(&project);
    let frame =
        ServerEnvelope::update(Some(project.id), UpdateType::SessionReset, view(&status)).to_frame();
    project.broadcast(&frame);
}

async fn handle_agent_kill(state: &Arc<AppState>, outbox: &Outbox, envelope: ClientEnvelope) {
    let project = match resolve_project(state, envelope.project_id.as_deref()) {
        Ok(project) => project,
        Err(error) => return send(outbox, error),
    };
    if project.state() != ProjectState::Executing {
        let error = ExecutionError::NotRunning { id: project.id };
        return send(outbox, ServerEnvelope::error(Some(project.id), error));
    }
    match state.coordinator.kill(project.id).await {
        Ok(()) => {
            // The coordinator only signals the process; the state
            // transition and the synthetic record belong here.
            project.set_state(ProjectState::Idle);
            append_or_warn(&project, json!({"event": "execution_killed"}), Direction::Server);
            info!(project = %project.id, "execution killed by client");
            let frame = ServerEnvelope::update(
                Some(project.id),
                UpdateType::ExecutionKilled,
                json!({"state": ProjectState::Idle}),
            )
            .to_frame();
            project.broadcast(&frame);
        }
        Err(e) => send(outbox, ServerEnvelope::error(Some(project.id), e)),
    }
}

fn handle_project_delete(
    state: &Arc<AppState>,
    conn_id: ConnectionId,
    outbox: &Outbox,
    envelope: ClientEnvelope,
) {
    let project = match resolve_project(state, envelope.project_id.as_deref()) {
        Ok(project) => project,
        Err(error) => return send(outbox, error),
    };
    if project.state() == ProjectState::Executing {
        let error = RegistryError::ExecutionInProgress { id: project.id };
        return send(outbox, ServerEnvelope::error(Some(project.id), error));
    }

    // Deletion notice goes out before the project disappears; the requester
    // gets a copy even if it never joined.
    let frame = ServerEnvelope::update(
        Some(project.id),
        UpdateType::ProjectDeleted,
        json!({"id": project.id}),
    )
    .to_frame();
    project.broadcast(&frame);
    if !project.is_subscribed(conn_id) {
        let _ = outbox.send(frame);
    }

    if let Err(e) = state.registry.delete(project.id) {
        send(outbox, ServerEnvelope::error(Some(project.id), e));
    }
}

async fn handle_execute(state: &Arc<AppState>, outbox: &Outbox, envelope: ClientEnvelope) {
    let project = match resolve_project(state, envelope.project_id.as_deref()) {
        Ok(project) => project,
        Err(error) => return send(outbox, error),
    };
    let payload: ExecutePayload = match serde_json::from_value(envelope.data) {
        Ok(payload) => payload,
        Err(e) => {
            let error = format!("bad execute payload: {e}");
            return send(outbox, ServerEnvelope::error(Some(project.id), error));
        }
    };

    append_or_warn(&project, json!({"prompt": payload.prompt}), Direction::Client);

    project.set_state(ProjectState::Executing);
    let frame = ServerEnvelope::update(
        Some(project.id),
        UpdateType::ProjectState,
        json!({"state": ProjectState::Executing}),
    )
    .to_frame();
    project.broadcast(&frame);

    // The read loop must stay responsive while the agent runs; the
    // execution gets its own task.
    let state = state.clone();
    let outbox = outbox.clone();
    tokio::spawn(async move {
        run_execution(state, project, outbox, payload).await;
    });
}

async fn run_execution(
    state: Arc<AppState>,
    project: Arc<Project>,
    outbox: Outbox,
    payload: ExecutePayload,
) {
    match state
        .coordinator
        .execute(&project, payload.prompt, payload.options)
        .await
    {
        Ok(outcome) => {
            for message in &outcome.messages {
                append_or_warn(&project, message.clone(), Direction::Agent);
            }
            persist_or_warn(&state, &project);

            let frame = ServerEnvelope::agent_message(
                project.id,
                &outcome.messages,
                outcome.session_id.as_deref(),
            )
            .to_frame();
            project.broadcast(&frame);

            let frame = ServerEnvelope::update(
                Some(project.id),
                UpdateType::ProjectState,
                json!({"state": project.state(), "session_id": project.session_id()}),
            )
            .to_frame();
            project.broadcast(&frame);
        }
        Err(ExecutionError::Killed) => {
            // The kill handler already transitioned state, logged the
            // synthetic record, and broadcast the update.
        }
        Err(e) => {
            persist_or_warn(&state, &project);
            append_or_warn(
                &project,
                json!({"event": "execution_error", "error": e.to_string()}),
                Direction::Server,
            );
            send(&outbox, ServerEnvelope::error(Some(project.id), &e));

            let frame = ServerEnvelope::update(
                Some(project.id),
                UpdateType::ProjectState,
                json!({"state": project.state()}),
            )
            .to_frame();
            project.broadcast(&frame);
        }
    }
}
