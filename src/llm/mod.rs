//! Model capabilities: the completion interface agents think with.

pub mod chat;
pub mod ollama;

use async_trait::async_trait;

use crate::error::CapabilityError;
pub use chat::{parse_tool_calls_from_text, ChatMessage, FunctionCall, Tool, ToolCall, ToolFunction};
pub use ollama::OllamaCapability;

/// One completion round: a transcript and the advertised tools in, a single
/// assistant message out. Implementations must be stateless across calls.
#[async_trait]
pub trait Capability: Send + Sync {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[Tool],
    ) -> Result<ChatMessage, CapabilityError>;
}
