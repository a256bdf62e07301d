//! Ollama `/api/chat` capability.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::chat::{parse_tool_calls_from_text, ChatMessage, Tool};
use super::Capability;
use crate::error::CapabilityError;

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: ChatMessage,
}

/// A capability backed by an Ollama server.
#[derive(Clone)]
pub struct OllamaCapability {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl OllamaCapability {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Capability for OllamaCapability {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[Tool],
    ) -> Result<ChatMessage, CapabilityError> {
        let endpoint = format!("{}/api/chat", self.base_url);

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "stream": false,
            "options": {
                "temperature": 0.0
            }
        });
        if !tools.is_empty() {
            body["tools"] = serde_json::to_value(tools)?;
        }

        let response = self.client.post(&endpoint).json(&body).send().await?;
        let text = response.text().await?;
        if text.is_empty() {
            return Err(CapabilityError::EmptyResponse);
        }

        let parsed: ChatResponse = serde_json::from_str(&text)?;
        let mut message = parsed.message;

        // Some models emit tool calls as JSON in the content instead of the
        // native field; recover them so the orchestrator sees one shape.
        if message.tool_calls.is_none() {
            let recovered = parse_tool_calls_from_text(&message.content);
            if !recovered.is_empty() {
                debug!(count = recovered.len(), "recovered tool calls from text");
                message.tool_calls = Some(recovered);
                message.content = String::new();
            }
        }

        Ok(message)
    }
}
