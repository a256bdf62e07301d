//! Tool dispatcher: routes model tool calls into sandbox operations or
//! in-process handlers and renders the outcome back as text.
//!
//! Sandbox-backed tools share one instance per session, provisioned lazily
//! on the first call and released when the session ends. Tools marked
//! single-use get a throwaway instance per call instead.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::catalogue::{SandboxOp, SandboxToolSpec, ToolCatalogue};
use crate::error::ToolError;
use crate::llm::ToolCall;
use crate::metrics::TOOL_CALLS;
use crate::sandbox::{ExecResult, SandboxConfig, SandboxManager};

/// Quote a string for safe interpolation into `sh -c`.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Render an execution result the way agents expect to read it.
fn render_exec(result: &ExecResult) -> String {
    let mut out = format!(
        "Exit code: {}\nStdout:\n{}\nStderr:\n{}",
        result.exit_code, result.stdout, result.stderr
    );
    if result.timed_out {
        out.push_str("\n(command timed out and was killed)");
    }
    out
}

fn staging_path() -> PathBuf {
    std::env::temp_dir().join(format!("cowork-stage-{}", uuid::Uuid::now_v7()))
}

fn required_str<'a>(
    arguments: &'a serde_json::Value,
    tool: &str,
    field: &str,
) -> Result<&'a str, ToolError> {
    arguments
        .get(field)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::InvalidArguments {
            tool: tool.to_string(),
            reason: format!("missing string field '{field}'"),
        })
}

pub struct ToolDispatcher {
    catalogue: Arc<ToolCatalogue>,
    sandboxes: Arc<SandboxManager>,
    /// session id -> backing sandbox instance id.
    sessions: Mutex<HashMap<String, String>>,
}

impl ToolDispatcher {
    pub fn new(catalogue: Arc<ToolCatalogue>, sandboxes: Arc<SandboxManager>) -> Self {
        Self {
            catalogue,
            sandboxes,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn catalogue(&self) -> &ToolCatalogue {
        &self.catalogue
    }

    /// Execute one tool call on behalf of `session_id`.
    ///
    /// Failures come back as `Err` for the caller to fold into the
    /// transcript; a non-zero exit code inside the sandbox is a successful
    /// dispatch and shows up in the rendered output instead.
    pub async fn dispatch(&self, session_id: &str, call: &ToolCall) -> Result<String, ToolError> {
        let name = call.function.name.as_str();
        let descriptor = self
            .catalogue
            .get(name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;

        debug!(session = session_id, tool = name, "dispatching tool call");
        let result = if let Some(spec) = descriptor.sandbox.clone() {
            self.dispatch_sandbox(session_id, name, &spec, &call.function.arguments)
                .await
        } else if let Some(handler) = descriptor.handler.clone() {
            handler.call(&call.function.arguments).await
        } else {
            // register() makes this unrepresentable.
            Err(ToolError::InvalidDescriptor(name.to_string()))
        };

        let status = if result.is_ok() { "ok" } else { "error" };
        TOOL_CALLS.with_label_values(&[name, status]).inc();
        result
    }

    /// Release the session's sandbox instance, if any was provisioned.
    pub async fn end_session(&self, session_id: &str) {
        let instance = self.sessions.lock().await.remove(session_id);
        if let Some(id) = instance {
            if let Err(e) = self.sandboxes.release(&id).await {
                warn!(session = session_id, instance = %id, error = %e, "session release failed");
            }
        }
    }

    async fn dispatch_sandbox(
        &self,
        session_id: &str,
        tool: &str,
        spec: &SandboxToolSpec,
        arguments: &serde_json::Value,
    ) -> Result<String, ToolError> {
        if spec.single_use {
            let id = self.sandboxes.start(spec.profile.clone(), None).await?;
            let result = self.run_op(&id, tool, &spec.op, arguments).await;
            if let Err(e) = self.sandboxes.stop(&id).await {
                warn!(instance = %id, error = %e, "single-use teardown failed");
            }
            return result;
        }

        let id = self.session_instance(session_id, &spec.profile).await?;
        self.run_op(&id, tool, &spec.op, arguments).await
    }

    /// The session's shared instance, provisioned on first use. The session
    /// id doubles as the start token, so a racing second call converges on
    /// the same instance.
    async fn session_instance(
        &self,
        session_id: &str,
        profile: &SandboxConfig,
    ) -> Result<String, ToolError> {
        {
            let sessions = self.sessions.lock().await;
            if let Some(id) = sessions.get(session_id) {
                if self
                    .sandboxes
                    .instance_state(id)
                    .await
                    .map(|s| s.is_live())
                    .unwrap_or(false)
                {
                    return Ok(id.clone());
                }
            }
        }

        let id = self
            .sandboxes
            .start(profile.clone(), Some(session_id))
            .await?;
        self.sessions
            .lock()
            .await
            .insert(session_id.to_string(), id.clone());
        Ok(id)
    }

    async fn run_op(
        &self,
        instance_id: &str,
        tool: &str,
        op: &SandboxOp,
        arguments: &serde_json::Value,
    ) -> Result<String, ToolError> {
        match op {
            SandboxOp::ExecCommand => {
                let command = required_str(arguments, tool, "command")?;
                let result = self.sandboxes.execute(instance_id, command, None).await?;
                Ok(render_exec(&result))
            }
            SandboxOp::WriteFile => {
                let path = required_str(arguments, tool, "path")?;
                let content = required_str(arguments, tool, "content")?;
                self.write_guest_file(instance_id, path, content.as_bytes())
                    .await?;
                Ok(format!("Wrote {} bytes to {path}", content.len()))
            }
            SandboxOp::ReadFile => {
                let path = required_str(arguments, tool, "path")?;
                let staging = staging_path();
                let result = self
                    .sandboxes
                    .download_file(instance_id, path, &staging)
                    .await;
                match result {
                    Ok(()) => {
                        let bytes = tokio::fs::read(&staging).await.map_err(|e| {
                            ToolError::Handler(format!("staging read failed: {e}"))
                        })?;
                        let _ = tokio::fs::remove_file(&staging).await;
                        Ok(String::from_utf8_lossy(&bytes).into_owned())
                    }
                    Err(e) => {
                        let _ = tokio::fs::remove_file(&staging).await;
                        Err(e.into())
                    }
                }
            }
            SandboxOp::Program { command } => {
                let input = required_str(arguments, tool, "input")?;
                let line = format!("{command} {}", shell_quote(input));
                let result = self.sandboxes.execute(instance_id, &line, None).await?;
                Ok(render_exec(&result))
            }
        }
    }

    /// Stage content on the host and push it into the guest, creating the
    /// parent directory first so `put` lands on an existing path.
    async fn write_guest_file(
        &self,
        instance_id: &str,
        path: &str,
        content: &[u8],
    ) -> Result<(), ToolError> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            let parent = parent.to_string_lossy();
            if !parent.is_empty() {
                let mkdir = format!("mkdir -p {}", shell_quote(&parent));
                self.sandboxes.execute(instance_id, &mkdir, None).await?;
            }
        }

        let staging = staging_path();
        tokio::fs::write(&staging, content)
            .await
            .map_err(|e| ToolError::Handler(format!("staging write failed: {e}")))?;
        let result = self.sandboxes.upload_file(instance_id, &staging, path).await;
        let _ = tokio::fs::remove_file(&staging).await;
        result.map_err(Into::into)
    }
}
