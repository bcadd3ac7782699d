use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tool declaration supplied by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    #[serde(rename = "type", default = "default_tool_type")]
    pub kind: String,
    pub function: Value,
}

/// Wire form of a tool invocation; `arguments` is a JSON string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub function: ToolCallFunction,
    #[serde(rename = "type", default = "default_tool_type")]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallFunction {
    pub name: String,
    pub arguments: String,
}

/// Tool invocation as produced by constrained generation, with structured arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedToolCall {
    #[serde(default)]
    pub id: Option<String>,
    pub function: GeneratedToolFunction,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedToolFunction {
    pub name: String,
    pub arguments: Value,
}

fn default_tool_type() -> String {
    "function".to_string()
}

impl ToolCall {
    /// Converts a generated call to wire form. `fallback_id` is used when the model left the id empty.
    pub fn from_generated(call: GeneratedToolCall, fallback_id: impl FnOnce() -> String) -> Self {
        let id = call
            .id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(fallback_id);
        let arguments = match call.function.arguments {
            Value::String(raw) => raw,
            other => other.to_string(),
        };

        Self {
            id,
            function: ToolCallFunction {
                name: call.function.name,
                arguments,
            },
            kind: call.kind.unwrap_or_else(default_tool_type),
        }
    }

    pub fn parsed_arguments(&self) -> serde_json::Result<Value> {
        serde_json::from_str(&self.function.arguments)
    }
}
