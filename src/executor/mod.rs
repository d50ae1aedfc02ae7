//! Per-project sequential execution of the agent CLI.
//!
//! The coordinator serializes invocations through each project's
//! `execution_lock`, builds the CLI argument vector, runs the subprocess
//! under a wall-clock ceiling, decodes the streamed JSON output, and applies
//! the IDLE/ERROR state transition. Distinct projects execute fully
//! concurrently.

pub(crate) mod runner;

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::errors::ExecutionError;
use crate::registry::{Project, ProjectState};
use crate::stream;

pub use runner::{CliRunner, ProcessRunner, RunOutput};

/// Client-supplied knobs for one execution, passed through to the CLI.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecuteOptions {
    #[serde(default)]
    pub dangerously_skip_permissions: bool,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub disallowed_tools: Vec<String>,
    /// MCP server configuration: a value whose trimmed form parses as a
    /// JSON object or array is passed as inline JSON (re-serialized
    /// compact); anything else is treated as a file path.
    #[serde(default)]
    pub mcp_config: Option<String>,
    #[serde(default)]
    pub append_system_prompt: Option<String>,
    #[serde(default)]
    pub permission_mode: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub fallback_model: Option<String>,
    #[serde(default)]
    pub add_dirs: Vec<String>,
    #[serde(default)]
    pub strict_mcp_config: bool,
}

/// One resolved CLI run: prompt, options, and the session id to continue
/// (None after a session reset, or for a project's first run).
#[derive(Debug, Clone)]
pub struct ExecuteInvocation {
    pub prompt: String,
    pub options: ExecuteOptions,
    pub session_id: Option<String>,
}

/// What a completed execution produced.
#[derive(Debug)]
pub struct ExecutionOutcome {
    /// New or continued session id, taken from the stream's init record
    /// when present, otherwise carried over from the invocation.
    pub session_id: Option<String>,
    /// Every decoded message, in stream order.
    pub messages: Vec<Value>,
}

/// Build the agent CLI argument vector for an invocation.
pub fn build_args(invocation: &ExecuteInvocation) -> Vec<String> {
    let mut args = vec![
        "-p".to_string(),
        invocation.prompt.clone(),
        "--output-format".to_string(),
        "stream-json".to_string(),
        "--verbose".to_string(),
    ];

    let opts = &invocation.options;
    if opts.dangerously_skip_permissions {
        args.push("--dangerously-skip-permissions".to_string());
    }
    if !opts.allowed_tools.is_empty() {
        args.push("--allowed-tools".to_string());
        args.push(opts.allowed_tools.join(","));
    }
    if !opts.disallowed_tools.is_empty() {
        args.push("--disallowed-tools".to_string());
        args.push(opts.disallowed_tools.join(","));
    }
    if let Some(mcp) = &opts.mcp_config {
        args.push("--mcp-config".to_string());
        args.push(mcp_config_arg(mcp));
    }
    if opts.strict_mcp_config {
        args.push("--strict-mcp-config".to_string());
    }
    if let Some(prompt) = &opts.append_system_prompt {
        args.push("--append-system-prompt".to_string());
        args.push(prompt.clone());
    }
    if let Some(mode) = &opts.permission_mode {
        args.push("--permission-mode".to_string());
        args.push(mode.clone());
    }
    if let Some(model) = &opts.model {
        args.push("--model".to_string());
        args.push(model.clone());
    }
    if let Some(model) = &opts.fallback_model {
        args.push("--fallback-model".to_string());
        args.push(model.clone());
    }
    for dir in &opts.add_dirs {
        args.push("--add-dir".to_string());
        args.push(dir.clone());
    }
    if let Some(session_id) = &invocation.session_id {
        args.push("-c".to_string());
        args.push(session_id.clone());
    }
    args
}

/// Disambiguate the `mcp_config` option: inline JSON is validated and
/// re-serialized compact; everything else passes through as a file path.
fn mcp_config_arg(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        if let Ok(value) = serde_json::from_str::<Value>(trimmed)
            && let Ok(compact) = serde_json::to_string(&value)
        {
            return compact;
        }
    }
    raw.to_string()
}

pub struct ExecutionCoordinator {
    runner: Arc<dyn ProcessRunner>,
    agent_cmd: String,
    timeout: Duration,
}

impl ExecutionCoordinator {
    pub fn new(runner: Arc<dyn ProcessRunner>, agent_cmd: impl Into<String>, timeout: Duration) -> Self {
        Self {
            runner,
            agent_cmd: agent_cmd.into(),
            timeout,
        }
    }

    /// Run the agent once for `project`.
    ///
    /// Holds the project's execution lock for the whole invocation, so two
    /// calls against the same project never overlap. On success the
    /// project's session id is updated and state returns to IDLE; on
    /// failure state becomes ERROR — except for a deliberate kill, where
    /// the kill path owns the transition and this call leaves state alone.
    pub async fn execute(
        &self,
        project: &Arc<Project>,
        prompt: String,
        options: ExecuteOptions,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        let _guard = project.execution_lock.lock().await;
        project.set_state(ProjectState::Executing);

        let invocation = ExecuteInvocation {
            prompt,
            options,
            session_id: project.session_id(),
        };
        let args = build_args(&invocation);
        debug!(project = %project.id, args = ?args, "spawning agent");

        let result = self
            .runner
            .run(project.id, &self.agent_cmd, &args, &project.path, self.timeout)
            .await
            .and_then(|output| {
                let messages = stream::decode_json_lines(&output.stdout);
                if messages.is_empty() {
                    return Err(ExecutionError::MalformedOutput);
                }
                let session_id =
                    stream::extract_session_id(&messages).or(invocation.session_id.clone());
                Ok(ExecutionOutcome {
                    session_id,
                    messages,
                })
            });

        match result {
            Ok(outcome) => {
                project.set_session_id(outcome.session_id.clone());
                project.set_state(ProjectState::Idle);
                info!(
                    project = %project.id,
                    messages = outcome.messages.len(),
                    "execution finished"
                );
                Ok(outcome)
            }
            Err(ExecutionError::Killed) => {
                info!(project = %project.id, "execution killed");
                Err(ExecutionError::Killed)
            }
            Err(e) => {
                project.set_state(ProjectState::Error);
                info!(project = %project.id, error = %e, "execution failed");
                Err(e)
            }
        }
    }

    /// Terminate the in-flight subprocess for a project. Does not touch
    /// project state; the caller owns that transition.
    pub async fn kill(&self, project_id: Uuid) -> Result<(), ExecutionError> {
        self.runner.kill(project_id).await
    }

    /// Kill every in-flight subprocess (server shutdown).
    pub async fn shutdown(&self) {
        self.runner.kill_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::runner::mock::MockRunner;
    use super::*;
    use crate::history::MessageLog;
    use tempfile::TempDir;

    const INIT_LINE: &str =
        "{\"type\":\"system\",\"subtype\":\"init\",\"session_id\":\"sess-new\"}\n{\"type\":\"result\",\"subtype\":\"success\"}\n";

    fn test_project(dir: &TempDir) -> Arc<Project> {
        let log = MessageLog::open(dir.path().join("logs")).unwrap();
        Arc::new(Project::new(
            Uuid::new_v4(),
            dir.path().to_path_buf(),
            log,
        ))
    }

    fn coordinator(runner: Arc<MockRunner>) -> ExecutionCoordinator {
        ExecutionCoordinator::new(runner, "claude", Duration::from_secs(5))
    }

    #[tokio::test]
    async fn success_updates_session_and_returns_to_idle() {
        let dir = TempDir::new().unwrap();
        let project = test_project(&dir);
        let runner = Arc::new(MockRunner::new(INIT_LINE));
        let coord = coordinator(runner);

        let outcome = coord
            .execute(&project, "do things".to_string(), ExecuteOptions::default())
            .await
            .unwrap();

        assert_eq!(outcome.session_id, Some("sess-new".to_string()));
        assert_eq!(outcome.messages.len(), 2);
        assert_eq!(project.state(), ProjectState::Idle);
        assert_eq!(project.session_id(), Some("sess-new".to_string()));
    }

    #[tokio::test]
    async fn failure_sets_error_state() {
        let dir = TempDir::new().unwrap();
        let project = test_project(&dir);
        let runner = Arc::new(MockRunner::new(INIT_LINE));
        runner.push_response(Err(ExecutionError::Timeout { seconds: 5 }));
        let coord = coordinator(runner);

        let err = coord
            .execute(&project, "p".to_string(), ExecuteOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Timeout { .. }));
        assert_eq!(project.state(), ProjectState::Error);
    }

    #[tokio::test]
    async fn killed_execution_leaves_state_alone() {
        let dir = TempDir::new().unwrap();
        let project = test_project(&dir);
        let runner = Arc::new(MockRunner::new(INIT_LINE));
        runner.push_response(Err(ExecutionError::Killed));
        let coord = coordinator(runner);

        let err = coord
            .execute(&project, "p".to_string(), ExecuteOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Killed));
        // The state transition after a kill belongs to the kill handler;
        // the executor must neither set IDLE nor ERROR here.
        assert_eq!(project.state(), ProjectState::Executing);
    }

    #[tokio::test]
    async fn unparseable_output_is_malformed() {
        let dir = TempDir::new().unwrap();
        let project = test_project(&dir);
        let runner = Arc::new(MockRunner::new("not json at all\n"));
        let coord = coordinator(runner);

        let err = coord
            .execute(&project, "p".to_string(), ExecuteOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::MalformedOutput));
        assert_eq!(project.state(), ProjectState::Error);
    }

    #[tokio::test]
    async fn second_execution_continues_session() {
        let dir = TempDir::new().unwrap();
        let project = test_project(&dir);
        let runner = Arc::new(MockRunner::new(INIT_LINE));
        let coord = coordinator(runner.clone());

        coord
            .execute(&project, "first".to_string(), ExecuteOptions::default())
            .await
            .unwrap();
        coord
            .execute(&project, "second".to_string(), ExecuteOptions::default())
            .await
            .unwrap();

        let calls = runner.recorded_args();
        assert_eq!(calls.len(), 2);
        assert!(
            !calls[0].contains(&"-c".to_string()),
            "first run must not continue a session"
        );
        let pos = calls[1].iter().position(|a| a == "-c").expect("-c flag");
        assert_eq!(calls[1][pos + 1], "sess-new");
    }

    #[tokio::test]
    async fn session_reset_omits_continuation_flag() {
        let dir = TempDir::new().unwrap();
        let project = test_project(&dir);
        let runner = Arc::new(MockRunner::new(INIT_LINE));
        let coord = coordinator(runner.clone());

        coord
            .execute(&project, "first".to_string(), ExecuteOptions::default())
            .await
            .unwrap();
        project.set_session_id(None);
        coord
            .execute(&project, "after reset".to_string(), ExecuteOptions::default())
            .await
            .unwrap();

        let calls = runner.recorded_args();
        assert!(!calls[1].contains(&"-c".to_string()));
    }

    #[tokio::test]
    async fn same_project_executions_never_overlap() {
        let dir = TempDir::new().unwrap();
        let project = test_project(&dir);
        let runner =
            Arc::new(MockRunner::new(INIT_LINE).with_delay(Duration::from_millis(50)));
        let coord = Arc::new(coordinator(runner.clone()));

        let mut handles = Vec::new();
        for i in 0..4 {
            let coord = coord.clone();
            let project = project.clone();
            handles.push(tokio::spawn(async move {
                coord
                    .execute(&project, format!("prompt {i}"), ExecuteOptions::default())
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(
            runner.observed_max_in_flight(),
            1,
            "executions against one project must be strictly serialized"
        );
    }

    #[tokio::test]
    async fn different_projects_execute_concurrently() {
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();
        let project_a = test_project(&dir_a);
        let project_b = test_project(&dir_b);
        let runner =
            Arc::new(MockRunner::new(INIT_LINE).with_delay(Duration::from_millis(100)));
        let coord = Arc::new(coordinator(runner.clone()));

        let a = {
            let coord = coord.clone();
            let project = project_a.clone();
            tokio::spawn(
                async move { coord.execute(&project, "a".to_string(), ExecuteOptions::default()).await },
            )
        };
        let b = {
            let coord = coord.clone();
            let project = project_b.clone();
            tokio::spawn(
                async move { coord.execute(&project, "b".to_string(), ExecuteOptions::default()).await },
            )
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        assert_eq!(
            runner.observed_max_in_flight(),
            2,
            "distinct projects must run in parallel"
        );
    }

    #[test]
    fn build_args_includes_base_flags() {
        let invocation = ExecuteInvocation {
            prompt: "hello".to_string(),
            options: ExecuteOptions::default(),
            session_id: None,
        };
        let args = build_args(&invocation);
        assert_eq!(args[0], "-p");
        assert_eq!(args[1], "hello");
        assert!(args.contains(&"--output-format".to_string()));
        assert!(args.contains(&"stream-json".to_string()));
        assert!(!args.contains(&"-c".to_string()));
    }

    #[test]
    fn build_args_maps_all_options() {
        let invocation = ExecuteInvocation {
            prompt: "p".to_string(),
            options: ExecuteOptions {
                dangerously_skip_permissions: true,
                allowed_tools: vec!["Read".to_string(), "Edit".to_string()],
                disallowed_tools: vec!["Bash".to_string()],
                mcp_config: Some("/etc/mcp.json".to_string()),
                append_system_prompt: Some("be terse".to_string()),
                permission_mode: Some("plan".to_string()),
                model: Some("opus".to_string()),
                fallback_model: Some("sonnet".to_string()),
                add_dirs: vec!["/a".to_string(), "/b".to_string()],
                strict_mcp_config: true,
            },
            session_id: Some("sess-7".to_string()),
        };
        let args = build_args(&invocation);

        assert!(args.contains(&"--dangerously-skip-permissions".to_string()));
        let pos = args.iter().position(|a| a == "--allowed-tools").unwrap();
        assert_eq!(args[pos + 1], "Read,Edit");
        assert!(args.contains(&"--disallowed-tools".to_string()));
        assert!(args.contains(&"--strict-mcp-config".to_string()));
        assert!(args.contains(&"--permission-mode".to_string()));
        assert!(args.contains(&"--fallback-model".to_string()));
        assert_eq!(args.iter().filter(|a| *a == "--add-dir").count(), 2);
        let pos = args.iter().position(|a| a == "-c").unwrap();
        assert_eq!(args[pos + 1], "sess-7");
    }

    #[test]
    fn mcp_config_inline_json_is_compacted() {
        let arg = mcp_config_arg("  {\"mcpServers\": { } }  ");
        assert_eq!(arg, "{\"mcpServers\":{}}");
    }

    #[test]
    fn mcp_config_path_passes_through() {
        assert_eq!(mcp_config_arg("conf/mcp.json"), "conf/mcp.json");
        // Brace-leading but invalid JSON degrades to path passthrough.
        assert_eq!(mcp_config_arg("{broken"), "{broken");
    }
}
