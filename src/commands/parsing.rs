use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::errors::{KernelError, KernelResult};
use crate::sampling::{apply_overrides, SamplerOverride, SamplingConfig};
use crate::templating::ChatMessage;

/// Body of `GEN` and `STREAM`.
#[derive(Debug, Deserialize)]
pub(crate) struct GeneratePayload {
    pub prompt: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

/// Body of `CHAT`.
#[derive(Debug, Deserialize)]
pub(crate) struct ChatPayload {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default = "default_true")]
    pub add_generation_prompt: bool,
    #[serde(default)]
    pub template_vars: Option<Map<String, Value>>,
}

fn default_true() -> bool {
    true
}

pub(crate) fn parse_json_payload<T: DeserializeOwned>(verb: &str, payload: &[u8]) -> KernelResult<T> {
    if payload.is_empty() {
        return Err(KernelError::InvalidRequest(format!("{} payload is empty", verb)));
    }
    serde_json::from_slice(payload)
        .map_err(|e| KernelError::InvalidRequest(format!("{} payload: {}", verb, e)))
}

/// Applies the configured overrides, then decodes the request parameters.
pub(crate) fn sampling_from_params(
    mut params: Map<String, Value>,
    overrides: &HashMap<String, SamplerOverride>,
) -> KernelResult<SamplingConfig> {
    apply_overrides(&mut params, overrides);
    SamplingConfig::from_json(Value::Object(params))
        .map_err(|e| KernelError::InvalidRequest(format!("params: {}", e)))
}

/// `LOAD` payload is a model file name; blank means the configured default.
pub(crate) fn parse_model_name(payload: &[u8]) -> Option<String> {
    let name = String::from_utf8_lossy(payload).trim().to_string();
    (!name.is_empty()).then_some(name)
}

pub(crate) fn is_force_flag(payload: &[u8]) -> bool {
    String::from_utf8_lossy(payload).trim().eq_ignore_ascii_case("force")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn generate_payload_defaults_params() {
        let payload: GeneratePayload =
            parse_json_payload("GEN", br#"{"prompt":"Hi"}"#).expect("payload");
        assert_eq!(payload.prompt, "Hi");
        assert!(payload.params.is_empty());
    }

    #[test]
    fn chat_payload_adds_generation_prompt_by_default() {
        let payload: ChatPayload =
            parse_json_payload("CHAT", br#"{"messages":[{"role":"user","content":"Hi"}]}"#)
                .expect("payload");
        assert!(payload.add_generation_prompt);
        assert_eq!(payload.messages[0].role, "user");
        assert!(payload.template_vars.is_none());
    }

    #[test]
    fn empty_or_broken_payloads_are_invalid_requests() {
        let empty = parse_json_payload::<GeneratePayload>("GEN", b"");
        assert!(matches!(empty, Err(KernelError::InvalidRequest(_))));
        let broken = parse_json_payload::<GeneratePayload>("GEN", b"{");
        assert!(matches!(broken, Err(KernelError::InvalidRequest(_))));
    }

    #[test]
    fn overrides_reach_the_sampling_config() {
        let mut overrides = HashMap::new();
        overrides.insert(
            "top_k".to_string(),
            SamplerOverride {
                value: json!(40),
                force: true,
                additive: false,
            },
        );
        let params = json!({"top_k": 5, "temperature": 0.5});
        let Value::Object(params) = params else { unreachable!() };

        let config = sampling_from_params(params, &overrides).expect("config");
        assert_eq!(config.top_k, 40);
        assert_eq!(config.temperature, 0.5);
    }

    #[test]
    fn load_and_unload_payloads() {
        assert_eq!(parse_model_name(b"  qwen.gguf \n"), Some("qwen.gguf".to_string()));
        assert_eq!(parse_model_name(b"   "), None);
        assert!(is_force_flag(b"FORCE"));
        assert!(!is_force_flag(b""));
    }
}
