//! Tool catalogue: declarative descriptors for everything an agent may call.
//!
//! A descriptor is either sandbox-backed (the dispatcher routes it into a
//! pooled instance) or handled in-process. Exactly one of the two, enforced
//! at registration.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::ToolError;
use crate::llm::Tool;
use crate::sandbox::SandboxConfig;

/// The sandbox operation a tool maps onto.
#[derive(Debug, Clone)]
pub enum SandboxOp {
    /// Run the model-supplied command string.
    ExecCommand,
    /// Write model-supplied content to a guest path.
    WriteFile,
    /// Read a guest path back to the model.
    ReadFile,
    /// Run a fixed program with the model's input appended.
    Program { command: String },
}

/// Sandbox routing for a tool.
#[derive(Debug, Clone)]
pub struct SandboxToolSpec {
    pub op: SandboxOp,
    /// Resource profile for the backing instance.
    pub profile: SandboxConfig,
    /// When set, each call gets a fresh instance torn down afterwards
    /// instead of the session's shared one.
    pub single_use: bool,
}

/// In-process tool logic.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, arguments: &Value) -> Result<String, ToolError>;
}

/// Adapter so plain functions can serve as handlers.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F> ToolHandler for FnHandler<F>
where
    F: Fn(&Value) -> Result<String, ToolError> + Send + Sync,
{
    async fn call(&self, arguments: &Value) -> Result<String, ToolError> {
        (self.0)(arguments)
    }
}

/// A registered tool: its model-facing schema plus how to run it.
#[derive(Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    /// JSON Schema for the arguments object.
    pub parameters: Value,
    pub sandbox: Option<SandboxToolSpec>,
    pub handler: Option<Arc<dyn ToolHandler>>,
}

impl std::fmt::Debug for ToolDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDescriptor")
            .field("name", &self.name)
            .field("sandbox", &self.sandbox)
            .field("in_process", &self.handler.is_some())
            .finish()
    }
}

impl ToolDescriptor {
    pub fn exec_command(profile: SandboxConfig) -> Self {
        Self {
            name: "exec_command".to_string(),
            description: "Execute a shell command in the session's isolated workspace and return \
                          its exit code and output."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "command": {
                        "type": "string",
                        "description": "The shell command to run"
                    }
                },
                "required": ["command"]
            }),
            sandbox: Some(SandboxToolSpec {
                op: SandboxOp::ExecCommand,
                profile,
                single_use: false,
            }),
            handler: None,
        }
    }

    pub fn write_file(profile: SandboxConfig) -> Self {
        Self {
            name: "write_file".to_string(),
            description: "Write content to a file in the session's isolated workspace, creating \
                          parent directories as needed."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Destination path inside the workspace"
                    },
                    "content": {
                        "type": "string",
                        "description": "File content to write"
                    }
                },
                "required": ["path", "content"]
            }),
            sandbox: Some(SandboxToolSpec {
                op: SandboxOp::WriteFile,
                profile,
                single_use: false,
            }),
            handler: None,
        }
    }

    pub fn read_file(profile: SandboxConfig) -> Self {
        Self {
            name: "read_file".to_string(),
            description: "Read a file from the session's isolated workspace.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Path of the file to read"
                    }
                },
                "required": ["path"]
            }),
            sandbox: Some(SandboxToolSpec {
                op: SandboxOp::ReadFile,
                profile,
                single_use: false,
            }),
            handler: None,
        }
    }

    /// A fixed program the model feeds input to, e.g. an analysis script
    /// baked into the image. `single_use` requests a throwaway instance.
    pub fn program(
        name: impl Into<String>,
        description: impl Into<String>,
        command: impl Into<String>,
        profile: SandboxConfig,
        single_use: bool,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "input": {
                        "type": "string",
                        "description": "Input passed to the program"
                    }
                },
                "required": ["input"]
            }),
            sandbox: Some(SandboxToolSpec {
                op: SandboxOp::Program {
                    command: command.into(),
                },
                profile,
                single_use,
            }),
            handler: None,
        }
    }

    pub fn in_process(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        handler: Arc<dyn ToolHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            sandbox: None,
            handler: Some(handler),
        }
    }

    /// Model-facing schema for this tool.
    pub fn as_tool(&self) -> Tool {
        Tool::function(
            self.name.clone(),
            self.description.clone(),
            self.parameters.clone(),
        )
    }
}

/// Registry of tool descriptors, shared read-only after startup.
#[derive(Default)]
pub struct ToolCatalogue {
    tools: HashMap<String, ToolDescriptor>,
}

impl ToolCatalogue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor. A tool must be sandbox-backed or in-process,
    /// never both and never neither.
    pub fn register(&mut self, descriptor: ToolDescriptor) -> Result<(), ToolError> {
        match (&descriptor.sandbox, &descriptor.handler) {
            (Some(_), Some(_)) => {
                return Err(ToolError::InvalidDescriptor(format!(
                    "tool '{}' declares both a sandbox op and a handler",
                    descriptor.name
                )))
            }
            (None, None) => {
                return Err(ToolError::InvalidDescriptor(format!(
                    "tool '{}' declares neither a sandbox op nor a handler",
                    descriptor.name
                )))
            }
            _ => {}
        }
        if self.tools.contains_key(&descriptor.name) {
            return Err(ToolError::InvalidDescriptor(format!(
                "tool '{}' is already registered",
                descriptor.name
            )));
        }
        self.tools.insert(descriptor.name.clone(), descriptor);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Schemas for a subset of tools, in the order given. Unknown names are
    /// skipped; workflow validation rejects them up front.
    pub fn tools_for(&self, names: &[String]) -> Vec<Tool> {
        names
            .iter()
            .filter_map(|n| self.tools.get(n))
            .map(ToolDescriptor::as_tool)
            .collect()
    }
}
