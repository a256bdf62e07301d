//! Multi-agent orchestration: workflow graphs, conversation state and the
//! turn-driving state machine.

pub mod conversation;
pub mod machine;
pub mod workflow;

pub use conversation::{ConversationState, DelegationRecord, Speaker, Turn};
pub use machine::{Orchestrator, OrchestratorLimits, Phase};
pub use workflow::{AgentNode, DelegationEdge, WorkflowDefinition};
