//! Interactive runner: a supervisor/researcher/coder workflow over a
//! sandbox pool, reading user turns from stdin.
//!
//! Environment:
//! - `COWORK_BACKEND`  - local (default), container or microvm
//! - `COWORK_MODEL`    - Ollama model name (default llama3.2)
//! - `OLLAMA_URL`      - Ollama base URL (default http://localhost:11434)
//! - `OTLP_ENDPOINT`   - optional OTLP collector endpoint

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::error;

use cowork::llm::{Capability, OllamaCapability};
use cowork::orchestrator::{
    AgentNode, DelegationEdge, Orchestrator, OrchestratorLimits, WorkflowDefinition,
};
use cowork::sandbox::{
    build_provider, PoolConfig, SandboxBackend, SandboxConfig, SandboxManager,
};
use cowork::tools::{ToolCatalogue, ToolDescriptor, ToolDispatcher};
use cowork::tracing::{init_tracing, shutdown_tracing};

fn backend_from_env() -> SandboxBackend {
    match std::env::var("COWORK_BACKEND").as_deref() {
        Ok("container") => SandboxBackend::Container,
        Ok("microvm") => SandboxBackend::MicroVm(Default::default()),
        _ => SandboxBackend::Local { root: None },
    }
}

fn agent(name: &str, prompt: &str, tools: &[&str]) -> AgentNode {
    AgentNode {
        name: name.to_string(),
        system_prompt: prompt.to_string(),
        tools: tools.iter().map(|t| t.to_string()).collect(),
        capability: "ollama".to_string(),
    }
}

fn demo_workflow() -> WorkflowDefinition {
    WorkflowDefinition {
        name: "cowork".to_string(),
        agents: vec![
            agent(
                "supervisor",
                "You are the supervisor. Answer the user directly when you can. For research \
                 questions delegate to the researcher agent; for coding or file tasks delegate \
                 to the coder agent. Each delegation instruction must be self-contained.",
                &[],
            ),
            agent(
                "researcher",
                "You are the researcher. Investigate the task using shell commands in your \
                 workspace and reply with your findings in plain text.",
                &["exec_command", "read_file"],
            ),
            agent(
                "coder",
                "You are the coder. Write and run code in your workspace to complete the task, \
                 then reply with the outcome in plain text.",
                &["exec_command", "write_file", "read_file"],
            ),
        ],
        supervisor: "supervisor".to_string(),
        edges: vec![
            DelegationEdge {
                from: "supervisor".to_string(),
                to: "researcher".to_string(),
            },
            DelegationEdge {
                from: "supervisor".to_string(),
                to: "coder".to_string(),
            },
        ],
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let otlp = std::env::var("OTLP_ENDPOINT").ok();
    init_tracing("cowork", otlp.as_deref())?;

    let backend = backend_from_env();
    let provider = build_provider(backend)?;
    let manager = Arc::new(SandboxManager::new(provider, PoolConfig::default()));
    let sweeper = SandboxManager::start_idle_sweeper(manager.clone());

    let profile = SandboxConfig::default();
    let mut catalogue = ToolCatalogue::new();
    catalogue.register(ToolDescriptor::exec_command(profile.clone()))?;
    catalogue.register(ToolDescriptor::write_file(profile.clone()))?;
    catalogue.register(ToolDescriptor::read_file(profile))?;

    let dispatcher = Arc::new(ToolDispatcher::new(Arc::new(catalogue), manager.clone()));

    let ollama_url =
        std::env::var("OLLAMA_URL").unwrap_or_else(|_| "http://localhost:11434".to_string());
    let model = std::env::var("COWORK_MODEL").unwrap_or_else(|_| "llama3.2".to_string());
    let mut capabilities: HashMap<String, Arc<dyn Capability>> = HashMap::new();
    capabilities.insert(
        "ollama".to_string(),
        Arc::new(OllamaCapability::new(ollama_url, model)),
    );

    let mut orchestrator = Orchestrator::new(
        demo_workflow(),
        capabilities,
        dispatcher,
        OrchestratorLimits::default(),
    )?;

    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    stdout.write_all(b"cowork ready. Empty line exits.\n> ").await?;
    stdout.flush().await?;

    while let Some(line) = lines.next_line().await? {
        let input = line.trim();
        if input.is_empty() {
            break;
        }
        match orchestrator.handle_turn(input).await {
            Ok(reply) => {
                stdout.write_all(reply.as_bytes()).await?;
                stdout.write_all(b"\n> ").await?;
            }
            Err(e) => {
                error!(error = %e, "turn failed");
                stdout
                    .write_all(format!("error: {e}\n> ").as_bytes())
                    .await?;
            }
        }
        stdout.flush().await?;
    }

    orchestrator.end_conversation().await;
    sweeper.abort();
    manager.shutdown().await;
    shutdown_tracing();
    Ok(())
}
