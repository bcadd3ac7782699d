use inference_protocol::{FinishChunk, GeneratedToolCall, ToolCall};
use jsonschema::JSONSchema;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::errors::{KernelError, KernelResult};
use crate::generation::Generator;
use crate::sampling::{SamplingConfig, StopCondition};

/// Schema forced on the extraction pass: an array of tool calls.
pub fn tool_call_schema() -> Value {
    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "type": "array",
        "items": {
            "type": "object",
            "properties": {
                "id": {"type": "string"},
                "function": {
                    "type": "object",
                    "properties": {
                        "name": {"type": "string"},
                        "arguments": {"type": "object"}
                    },
                    "required": ["name", "arguments"]
                },
                "type": {"type": "string", "enum": ["function"]}
            },
            "required": ["id", "function", "type"]
        }
    })
}

/// Where a request stands in the two-pass tool protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolPhase {
    NoTool,
    ToolExtraction { precursor: String },
    Done(Option<Vec<ToolCall>>),
}

impl ToolPhase {
    /// Single transition rule: the first pass stopped on the marker.
    pub fn after_first_pass(marker: Option<&str>, finish: &FinishChunk) -> Self {
        let Some(marker) = marker.filter(|m| !m.is_empty()) else {
            return Self::Done(None);
        };

        match finish.stop_token.as_deref() {
            Some(stop) if stop.starts_with(marker) => Self::ToolExtraction {
                precursor: format!("{}{}", finish.text, stop),
            },
            _ => Self::Done(None),
        }
    }
}

/// Parses and validates the extraction pass output.
pub fn parse_tool_calls(raw: &str) -> KernelResult<Vec<ToolCall>> {
    let value: Value = serde_json::from_str(raw.trim())
        .map_err(|e| KernelError::ToolCallParse(format!("not JSON: {}", e)))?;

    let schema = tool_call_schema();
    let compiled = JSONSchema::compile(&schema)
        .map_err(|e| KernelError::ToolCallParse(format!("schema: {}", e)))?;
    if let Err(errors) = compiled.validate(&value) {
        let reasons: Vec<String> = errors.map(|e| e.to_string()).collect();
        return Err(KernelError::ToolCallParse(reasons.join("; ")));
    }

    let generated: Vec<GeneratedToolCall> =
        serde_json::from_value(value).map_err(|e| KernelError::ToolCallParse(e.to_string()))?;

    Ok(generated
        .into_iter()
        .map(|call| ToolCall::from_generated(call, short_call_id))
        .collect())
}

fn short_call_id() -> String {
    Uuid::new_v4().simple().to_string()[..9].to_string()
}

/// Two-pass generation: a normal pass that stops on the template's tool
/// marker, then at most one schema-constrained pass extracting the calls.
pub struct ToolCallPipeline<'a> {
    generator: &'a Generator,
    marker: Option<String>,
}

impl<'a> ToolCallPipeline<'a> {
    pub fn new(generator: &'a Generator, marker: Option<String>) -> Self {
        Self { generator, marker }
    }

    pub async fn run(
        &self,
        prompt: &str,
        config: SamplingConfig,
        cancel: CancellationToken,
    ) -> KernelResult<FinishChunk> {
        let mut first: Option<FinishChunk> = None;
        let mut phase = ToolPhase::NoTool;

        loop {
            phase = match phase {
                ToolPhase::NoTool => {
                    let mut first_pass = config.clone();
                    if let Some(marker) = &self.marker {
                        first_pass.add_stop_string(marker);
                    }
                    let finish = self
                        .generator
                        .generate_once(prompt.to_string(), first_pass, cancel.clone())
                        .await?;
                    let next = ToolPhase::after_first_pass(self.marker.as_deref(), &finish);
                    first = Some(finish);
                    next
                }
                ToolPhase::ToolExtraction { precursor } => {
                    debug!("tool marker hit, extracting calls");
                    let extraction = self.extraction_config(config.clone());
                    let raw = self
                        .generator
                        .generate_once(format!("{}{}", prompt, precursor), extraction, cancel.clone())
                        .await?;
                    let calls = parse_tool_calls(&raw.text)?;
                    info!(request_id = %raw.request_id, calls = calls.len(), "tool calls extracted");
                    ToolPhase::Done(Some(calls))
                }
                ToolPhase::Done(calls) => {
                    let mut finish = first
                        .take()
                        .ok_or_else(|| KernelError::ToolCallParse("tool pipeline finished without a first pass".to_string()))?;
                    finish.tool_calls = calls;
                    return Ok(finish);
                }
            };
        }
    }

    fn extraction_config(&self, mut config: SamplingConfig) -> SamplingConfig {
        config.json_schema = Some(tool_call_schema());
        config.regex_pattern = None;
        config.grammar_string = None;
        if let Some(marker) = &self.marker {
            config
                .stop
                .retain(|stop| !matches!(stop, StopCondition::Text(text) if text == marker));
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use inference_protocol::FinishReason;

    use crate::config::ModelConfig;
    use crate::container::ModelContainer;
    use crate::generation::GenerationOptions;
    use crate::native::stub::StubReply;
    use crate::native::{NativeLibrary, SamplerStage, StubLibrary};
    use crate::readback::PollBackoff;

    const CALLS: &str = r#"[{"id":"call_1","function":{"name":"weather","arguments":{"x":1}},"type":"function"}]"#;

    async fn generator(lib: &Arc<StubLibrary>) -> Generator {
        let shared: Arc<dyn NativeLibrary> = Arc::clone(lib) as Arc<dyn NativeLibrary>;
        let container = Arc::new(ModelContainer::new(shared));
        container
            .load_model(&ModelConfig::for_model("stub.gguf"), Box::new(|_| true))
            .await
            .expect("load");
        Generator::new(
            container,
            GenerationOptions {
                backoff: PollBackoff::new(Duration::from_millis(1), Duration::from_millis(2)),
                ..GenerationOptions::default()
            },
        )
    }

    #[tokio::test]
    async fn marker_hit_runs_exactly_one_constrained_pass() {
        let lib = Arc::new(StubLibrary::new());
        lib.push_reply(
            StubReply::text(&["Let", " me", " check."]).stopped_by(FinishReason::StopString, "TOOLCALL:"),
        );
        lib.push_reply(StubReply::text(&[CALLS]));
        let generator = generator(&lib).await;

        let finish = ToolCallPipeline::new(&generator, Some("TOOLCALL:".to_string()))
            .run("Q: weather?", SamplingConfig::default(), CancellationToken::new())
            .await
            .expect("pipeline");

        assert_eq!(lib.submit_count(), 2);
        assert_eq!(finish.text, "Let me check.");
        assert_eq!(finish.finish_reason, FinishReason::StopString);
        assert_eq!(finish.client_finish_reason(), "tool_calls");

        let calls = finish.tool_calls.expect("tool calls attached");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function.name, "weather");
        assert_eq!(calls[0].function.arguments, "{\"x\":1}");

        let submissions = lib.submissions();
        assert!(submissions[0].request.stop_strings.contains(&"TOOLCALL:".to_string()));
        assert_eq!(submissions[1].request.prompt, "Q: weather?Let me check.TOOLCALL:");
        assert!(!submissions[1].request.stop_strings.contains(&"TOOLCALL:".to_string()));
        assert!(matches!(submissions[1].stages[0], SamplerStage::Llguidance { .. }));
    }

    #[tokio::test]
    async fn no_marker_means_no_extra_pass() {
        let lib = Arc::new(StubLibrary::new());
        lib.push_reply(StubReply::text(&["TOOLCALL: not a tool"]).stopped_by(FinishReason::StopString, "TOOLCALL:"));
        let generator = generator(&lib).await;

        let finish = ToolCallPipeline::new(&generator, None)
            .run("Hi", SamplingConfig::default(), CancellationToken::new())
            .await
            .expect("pipeline");

        assert_eq!(lib.submit_count(), 1);
        assert!(finish.tool_calls.is_none());
    }

    #[tokio::test]
    async fn other_stop_tokens_do_not_trigger_extraction() {
        let lib = Arc::new(StubLibrary::new());
        lib.push_reply(StubReply::text(&["Done."]));
        let generator = generator(&lib).await;

        let finish = ToolCallPipeline::new(&generator, Some("TOOLCALL:".to_string()))
            .run("Hi", SamplingConfig::default(), CancellationToken::new())
            .await
            .expect("pipeline");

        assert_eq!(lib.submit_count(), 1);
        assert!(finish.tool_calls.is_none());
    }

    #[test]
    fn invalid_tool_output_is_rejected() {
        assert!(matches!(parse_tool_calls("not json"), Err(KernelError::ToolCallParse(_))));
        let missing_type = r#"[{"id":"a","function":{"name":"f","arguments":{}}}]"#;
        assert!(matches!(parse_tool_calls(missing_type), Err(KernelError::ToolCallParse(_))));
    }

    #[test]
    fn schema_accepts_wellformed_calls() {
        let schema = tool_call_schema();
        let compiled = JSONSchema::compile(&schema).expect("schema compiles");
        let value: Value = serde_json::from_str(CALLS).expect("json");
        assert!(compiled.is_valid(&value));

        let calls = parse_tool_calls(CALLS).expect("parse");
        let back = calls[0].parsed_arguments().expect("arguments");
        assert_eq!(back, json!({"x": 1}));
    }

    #[test]
    fn transition_requires_marker_prefix() {
        let mut finish = FinishChunk::from_record(
            "r",
            inference_protocol::FinishRecord {
                prompt_tokens: 1,
                gen_tokens: 1,
                prompt_sec: 0.0,
                gen_sec: 0.0,
                prompt_tokens_per_sec: 0.0,
                gen_tokens_per_sec: 0.0,
                finish_reason: FinishReason::StopString,
                stop_token: "TOOLCALL: extra".to_string(),
            },
        );
        finish.text = "pre".to_string();

        assert_eq!(
            ToolPhase::after_first_pass(Some("TOOLCALL:"), &finish),
            ToolPhase::ToolExtraction {
                precursor: "preTOOLCALL: extra".to_string()
            }
        );
        assert_eq!(ToolPhase::after_first_pass(Some("<tool>"), &finish), ToolPhase::Done(None));
        assert_eq!(ToolPhase::after_first_pass(None, &finish), ToolPhase::Done(None));
    }
}
