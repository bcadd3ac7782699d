use serde::{Deserialize, Serialize};

/// Reason reported by the native side when a generation job ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinishReason {
    CtxExceeded,
    BatchDecode,
    StopToken,
    MaxNewTokens,
    StopString,
    TokenEncode,
    Aborted,
}

impl FinishReason {
    /// Short label used by OpenAI-style clients.
    pub fn client_label(self) -> &'static str {
        match self {
            Self::MaxNewTokens => "length",
            _ => "stop",
        }
    }
}

/// Status record written by the native library once a job is finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishRecord {
    pub prompt_tokens: u32,
    pub gen_tokens: u32,
    #[serde(default)]
    pub prompt_sec: f64,
    #[serde(default)]
    pub gen_sec: f64,
    #[serde(default)]
    pub prompt_tokens_per_sec: f64,
    #[serde(default)]
    pub gen_tokens_per_sec: f64,
    pub finish_reason: FinishReason,
    #[serde(default)]
    pub stop_token: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timings {
    pub prompt_sec: f64,
    pub gen_sec: f64,
    pub prompt_tokens_per_sec: f64,
    pub gen_tokens_per_sec: f64,
    pub total_sec: f64,
}

/// One generated fragment, in generation order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub text: String,
    pub token: i32,
}

/// Terminal record of a generation. Exactly one per request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishChunk {
    pub request_id: String,
    pub text: String,
    pub prompt_tokens: u32,
    pub gen_tokens: u32,
    pub timings: Timings,
    pub finish_reason: FinishReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<crate::ToolCall>>,
}

impl FinishChunk {
    pub fn from_record(request_id: impl Into<String>, record: FinishRecord) -> Self {
        let stop_token = if record.stop_token.is_empty() {
            None
        } else {
            Some(record.stop_token)
        };

        Self {
            request_id: request_id.into(),
            text: String::new(),
            prompt_tokens: record.prompt_tokens,
            gen_tokens: record.gen_tokens,
            timings: Timings {
                prompt_sec: record.prompt_sec,
                gen_sec: record.gen_sec,
                prompt_tokens_per_sec: record.prompt_tokens_per_sec,
                gen_tokens_per_sec: record.gen_tokens_per_sec,
                total_sec: record.prompt_sec + record.gen_sec,
            },
            finish_reason: record.finish_reason,
            stop_token,
            tool_calls: None,
        }
    }

    /// `tool_calls` wins over the native reason.
    pub fn client_finish_reason(&self) -> &'static str {
        if self.tool_calls.as_ref().is_some_and(|calls| !calls.is_empty()) {
            "tool_calls"
        } else {
            self.finish_reason.client_label()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum GenerationChunk {
    Data(StreamChunk),
    Finish(FinishChunk),
}

impl GenerationChunk {
    pub fn is_finish(&self) -> bool {
        matches!(self, Self::Finish(_))
    }
}
