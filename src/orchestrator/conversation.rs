//! Conversation state: the durable, serializable record of a session.

use serde::{Deserialize, Serialize};

use crate::error::OrchestratorError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Speaker {
    User,
    Agent { name: String },
}

/// One user-visible exchange entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub speaker: Speaker,
    pub content: String,
}

/// Audit record of one completed or in-flight delegation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegationRecord {
    pub delegator: String,
    pub delegate: String,
    pub instruction: String,
    /// Filled in when the delegate produces its final reply.
    pub result: Option<String>,
}

/// Everything the orchestrator knows about one conversation.
///
/// The delegation stack always has the supervisor at its base while a turn
/// is in flight; pushing an agent already on the stack is a cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationState {
    pub turns: Vec<Turn>,
    pub delegation_stack: Vec<String>,
    pub delegations: Vec<DelegationRecord>,
    pub ended: bool,
}

impl ConversationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_user(&mut self, content: impl Into<String>) {
        self.turns.push(Turn {
            speaker: Speaker::User,
            content: content.into(),
        });
    }

    pub fn record_agent(&mut self, name: impl Into<String>, content: impl Into<String>) {
        self.turns.push(Turn {
            speaker: Speaker::Agent { name: name.into() },
            content: content.into(),
        });
    }

    /// Push a delegate onto the stack, enforcing the cycle and depth rules.
    /// Depth counts delegations below the supervisor, so a stack of
    /// `[supervisor, a, b]` is at depth 2.
    pub fn push_delegation(
        &mut self,
        agent: &str,
        max_depth: usize,
    ) -> Result<(), OrchestratorError> {
        if self.delegation_stack.iter().any(|a| a == agent) {
            return Err(OrchestratorError::CyclicDelegation(agent.to_string()));
        }
        if self.delegation_stack.len().saturating_sub(1) >= max_depth {
            return Err(OrchestratorError::DepthExceeded(max_depth));
        }
        self.delegation_stack.push(agent.to_string());
        Ok(())
    }

    pub fn pop_delegation(&mut self) -> Option<String> {
        self.delegation_stack.pop()
    }
}
