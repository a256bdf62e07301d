//! Workflow definitions: the static graph of agents and who may delegate
//! to whom.
//!
//! Delegation is expressed to a model as a tool named after the target
//! agent, so agent names and tool names share one namespace and must not
//! collide. `validate` enforces that along with the rest of the graph's
//! structural rules before any conversation starts.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::OrchestratorError;
use crate::llm::Tool;
use crate::tools::ToolCatalogue;

/// One agent in the workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentNode {
    pub name: String,
    pub system_prompt: String,
    /// Catalogue tools this agent may call.
    pub tools: Vec<String>,
    /// Which registered capability answers for this agent.
    pub capability: String,
}

/// A permitted delegation, `from` -> `to`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationEdge {
    pub from: String,
    pub to: String,
}

/// The complete multi-agent graph for one deployment. Loaded once per
/// conversation and immutable thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    pub agents: Vec<AgentNode>,
    /// The agent that faces the user.
    pub supervisor: String,
    pub edges: Vec<DelegationEdge>,
}

impl WorkflowDefinition {
    pub fn agent(&self, name: &str) -> Option<&AgentNode> {
        self.agents.iter().find(|a| a.name == name)
    }

    pub fn is_agent(&self, name: &str) -> bool {
        self.agent(name).is_some()
    }

    pub fn may_delegate(&self, from: &str, to: &str) -> bool {
        self.edges.iter().any(|e| e.from == from && e.to == to)
    }

    pub fn delegates_of(&self, from: &str) -> Vec<&AgentNode> {
        self.edges
            .iter()
            .filter(|e| e.from == from)
            .filter_map(|e| self.agent(&e.to))
            .collect()
    }

    /// Tool schemas an agent sees: its catalogue tools plus one delegation
    /// tool per outgoing edge, named after the target agent.
    pub fn tools_for_agent(&self, agent: &AgentNode, catalogue: &ToolCatalogue) -> Vec<Tool> {
        let mut tools = catalogue.tools_for(&agent.tools);
        for delegate in self.delegates_of(&agent.name) {
            tools.push(Tool::function(
                delegate.name.clone(),
                format!(
                    "Delegate a task to the {} agent. Describe the task fully; the agent sees \
                     only your instruction, not the conversation.",
                    delegate.name
                ),
                json!({
                    "type": "object",
                    "properties": {
                        "instruction": {
                            "type": "string",
                            "description": "Complete, self-contained task description"
                        }
                    },
                    "required": ["instruction"]
                }),
            ));
        }
        tools
    }

    /// Structural validation, run once at orchestrator construction.
    pub fn validate(&self, catalogue: &ToolCatalogue) -> Result<(), OrchestratorError> {
        if self.agents.is_empty() {
            return Err(OrchestratorError::InvalidWorkflow(
                "workflow has no agents".to_string(),
            ));
        }

        for (i, agent) in self.agents.iter().enumerate() {
            if self.agents[..i].iter().any(|a| a.name == agent.name) {
                return Err(OrchestratorError::InvalidWorkflow(format!(
                    "duplicate agent name '{}'",
                    agent.name
                )));
            }
            if catalogue.contains(&agent.name) {
                return Err(OrchestratorError::InvalidWorkflow(format!(
                    "agent '{}' collides with a catalogue tool name",
                    agent.name
                )));
            }
            for tool in &agent.tools {
                if !catalogue.contains(tool) {
                    return Err(OrchestratorError::InvalidWorkflow(format!(
                        "agent '{}' references unknown tool '{tool}'",
                        agent.name
                    )));
                }
            }
        }

        if !self.is_agent(&self.supervisor) {
            return Err(OrchestratorError::InvalidWorkflow(format!(
                "supervisor '{}' is not an agent",
                self.supervisor
            )));
        }

        for edge in &self.edges {
            if !self.is_agent(&edge.from) || !self.is_agent(&edge.to) {
                return Err(OrchestratorError::InvalidWorkflow(format!(
                    "edge {} -> {} references an unknown agent",
                    edge.from, edge.to
                )));
            }
            if edge.from == edge.to {
                return Err(OrchestratorError::InvalidWorkflow(format!(
                    "agent '{}' may not delegate to itself",
                    edge.from
                )));
            }
        }

        Ok(())
    }
}
