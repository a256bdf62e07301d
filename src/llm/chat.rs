//! Chat wire types shared by the capability layer and the orchestrator.
//!
//! Shapes follow Ollama's `/api/chat` schema. The orchestrator reuses them
//! as its in-memory transcript format rather than keeping a parallel
//! representation.

use serde::{Deserialize, Serialize};

/// A message in a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String, // "system", "user", "assistant", "tool"
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
            tool_calls: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
            tool_calls: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
            tool_calls: None,
        }
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self {
            role: "tool".to_string(),
            content: content.into(),
            tool_calls: None,
        }
    }
}

/// A tool call requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub function: FunctionCall,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            function: FunctionCall {
                name: name.into(),
                arguments,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Tool definition advertised to the model.
#[derive(Debug, Clone, Serialize)]
pub struct Tool {
    #[serde(rename = "type")]
    pub tool_type: String, // always "function"
    pub function: ToolFunction,
}

impl Tool {
    pub fn function(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            tool_type: "function".to_string(),
            function: ToolFunction {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

/// Function specification for a tool; `parameters` is a JSON Schema.
#[derive(Debug, Clone, Serialize)]
pub struct ToolFunction {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Pick tool invocations out of assistant text, for models that answer
/// with raw JSON instead of populating `tool_calls`.
///
/// Every JSON object in the content carrying a `name` plus an `arguments`
/// (or `parameters`) member becomes a call; surrounding prose is skipped.
/// The stream deserializer does the span tracking, so braces inside string
/// values do not confuse the scan.
pub fn parse_tool_calls_from_text(content: &str) -> Vec<ToolCall> {
    let mut calls = Vec::new();
    let mut rest = content;

    while let Some(offset) = rest.find('{') {
        let candidate = &rest[offset..];
        let mut stream =
            serde_json::Deserializer::from_str(candidate).into_iter::<serde_json::Value>();
        match stream.next() {
            Some(Ok(value)) => {
                if let Some(call) = tool_call_from_value(&value) {
                    calls.push(call);
                }
                rest = &candidate[stream.byte_offset()..];
            }
            // Not a JSON object after all; step past the brace and keep
            // looking.
            _ => rest = &candidate[1..],
        }
    }

    calls
}

fn tool_call_from_value(value: &serde_json::Value) -> Option<ToolCall> {
    let name = value.get("name")?.as_str()?;
    // Some models say "parameters" where Ollama says "arguments".
    let arguments = value
        .get("arguments")
        .or_else(|| value.get("parameters"))?
        .clone();
    Some(ToolCall::new(name, arguments))
}
