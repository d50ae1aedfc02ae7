//! Server bootstrap: wires the registry, coordinator, and router together,
//! serves the WebSocket endpoint, and periodically publishes aggregate
//! stats to every connected client.

pub mod router;
pub mod ws;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::executor::{CliRunner, ExecutionCoordinator, ProcessRunner};
use crate::protocol::{ServerEnvelope, ServerStats, UpdateType};
use crate::registry::{ConnectionId, Outbox, ProjectRegistry, ProjectState};

pub struct AppState {
    pub config: ServerConfig,
    pub registry: ProjectRegistry,
    pub coordinator: ExecutionCoordinator,
    connections: Mutex<HashMap<ConnectionId, Outbox>>,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Result<Arc<Self>> {
        Self::with_runner(config, Arc::new(CliRunner::new()))
    }

    /// Build the state with a custom process runner (the test seam).
    pub fn with_runner(config: ServerConfig, runner: Arc<dyn ProcessRunner>) -> Result<Arc<Self>> {
        let registry = ProjectRegistry::load(&config.data_dir)
            .context("Failed to load project registry")?;
        let coordinator = ExecutionCoordinator::new(
            runner,
            config.agent_cmd.clone(),
            config.execution_timeout(),
        );
        Ok(Arc::new(Self {
            config,
            registry,
            coordinator,
            connections: Mutex::new(HashMap::new()),
        }))
    }

    fn lock_connections(&self) -> MutexGuard<'_, HashMap<ConnectionId, Outbox>> {
        self.connections.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register_connection(&self, id: ConnectionId, outbox: Outbox) {
        self.lock_connections().insert(id, outbox);
    }

    /// Drop a connection and remove it from every project's subscriber set.
    pub fn remove_connection(&self, id: ConnectionId) {
        self.lock_connections().remove(&id);
        for project in self.registry.list() {
            project.unsubscribe(id);
        }
    }

    pub fn connection_count(&self) -> usize {
        self.lock_connections().len()
    }

    /// Send a frame to every open connection, pruning dead ones.
    pub fn send_to_all(&self, frame: &str) {
        self.lock_connections()
            .retain(|_, outbox| outbox.send(frame.to_string()).is_ok());
    }

    pub fn server_stats(&self) -> ServerStats {
        let projects = self.registry.list();
        let mut stats = ServerStats {
            total_projects: projects.len(),
            idle: 0,
            executing: 0,
            error: 0,
            connected_clients: self.connection_count(),
        };
        for project in &projects {
            match project.state() {
                ProjectState::Idle => stats.idle += 1,
                ProjectState::Executing => stats.executing += 1,
                ProjectState::Error => stats.error += 1,
            }
        }
        stats
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/health", get(health))
        .with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "projects": state.registry.len(),
    }))
}

/// Start the server and run until a shutdown signal arrives. Any in-flight
/// agent subprocesses are terminated before returning.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    let state = AppState::new(config)?;

    let mut app = build_router(state.clone());
    if state.config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let addr = state.config.bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;
    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, projects = state.registry.len(), "tether listening");

    let stats_task = tokio::spawn(stats_loop(state.clone()));

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    stats_task.abort();
    state.coordinator.shutdown().await;
    info!("server shut down");
    Ok(())
}

async fn stats_loop(state: Arc<AppState>) {
    let mut interval = tokio::time::interval(state.config.stats_interval());
    interval.tick().await;
    loop {
        interval.tick().await;
        let stats = state.server_stats();
        let frame = ServerEnvelope::update(
            None,
            UpdateType::Stats,
            serde_json::to_value(&stats).unwrap_or(Value::Null),
        )
        .to_frame();
        state.send_to_all(&frame);
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to install shutdown handler");
        return;
    }
    info!("shutdown signal received");
}
