use std::collections::HashMap;

use inference_protocol::ToolSpec;
use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::native::{
    ModelPtr, NativeCapabilities, NativeLibrary, NativeResult, SamplerPtr, SamplerStage, TokenId,
};

/// Bias used to ban a token outright.
pub const BANNED_TOKEN_BIAS: f32 = -100.0;

/// A stop condition: either a literal string or a token id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StopCondition {
    Token(TokenId),
    Text(String),
}

/// Generation parameters of one request. Missing fields take neutral defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    #[serde(alias = "max_length")]
    pub max_tokens: Option<u32>,
    pub min_tokens: u32,
    #[serde(alias = "stop_sequence", deserialize_with = "one_or_many")]
    pub stop: Vec<StopCondition>,
    pub seed: Option<i64>,

    pub logit_bias: HashMap<String, f32>,
    #[serde(alias = "custom_token_bans", deserialize_with = "token_list")]
    pub banned_tokens: Vec<TokenId>,
    #[serde(deserialize_with = "one_or_many")]
    pub banned_strings: Vec<String>,
    #[serde(alias = "ignore_eos")]
    pub ban_eos_token: bool,
    pub add_bos_token: Option<bool>,
    pub skip_special_tokens: bool,

    pub temperature: f32,
    pub temperature_last: bool,
    pub top_k: i32,
    pub top_p: f32,
    pub min_p: f32,
    #[serde(alias = "typical_p")]
    pub typical: f32,
    pub nsigma: f32,

    pub frequency_penalty: f32,
    pub presence_penalty: f32,
    #[serde(alias = "rep_pen")]
    pub repetition_penalty: f32,
    #[serde(
        alias = "repetition_range",
        alias = "repetition_penalty_range",
        alias = "rep_pen_range"
    )]
    pub penalty_range: i32,

    pub dry_multiplier: f32,
    pub dry_base: f32,
    pub dry_allowed_length: i32,
    #[serde(alias = "dry_penalty_last_n")]
    pub dry_range: i32,
    #[serde(deserialize_with = "sequence_breakers")]
    pub dry_sequence_breakers: Vec<String>,

    pub xtc_probability: f32,
    pub xtc_threshold: f32,

    pub mirostat_mode: u8,
    pub mirostat_tau: f32,
    pub mirostat_eta: f32,

    pub grammar_string: Option<String>,
    pub json_schema: Option<Value>,
    pub regex_pattern: Option<String>,
    pub tools: Vec<ToolSpec>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            max_tokens: None,
            min_tokens: 0,
            stop: Vec::new(),
            seed: None,
            logit_bias: HashMap::new(),
            banned_tokens: Vec::new(),
            banned_strings: Vec::new(),
            ban_eos_token: false,
            add_bos_token: None,
            skip_special_tokens: true,
            temperature: 1.0,
            temperature_last: false,
            top_k: 0,
            top_p: 1.0,
            min_p: 0.0,
            typical: 1.0,
            nsigma: 0.0,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            repetition_penalty: 1.0,
            penalty_range: -1,
            dry_multiplier: 0.0,
            dry_base: 0.0,
            dry_allowed_length: 0,
            dry_range: 0,
            dry_sequence_breakers: Vec::new(),
            xtc_probability: 0.0,
            xtc_threshold: 0.1,
            mirostat_mode: 0,
            mirostat_tau: 1.0,
            mirostat_eta: 0.0,
            grammar_string: None,
            json_schema: None,
            regex_pattern: None,
            tools: Vec::new(),
        }
    }
}

impl SamplingConfig {
    pub fn from_json(params: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(params)
    }

    pub fn stop_strings(&self) -> Vec<String> {
        self.stop
            .iter()
            .filter_map(|s| match s {
                StopCondition::Text(text) => Some(text.clone()),
                StopCondition::Token(_) => None,
            })
            .collect()
    }

    pub fn stop_tokens(&self) -> Vec<TokenId> {
        self.stop
            .iter()
            .filter_map(|s| match s {
                StopCondition::Token(id) => Some(*id),
                StopCondition::Text(_) => None,
            })
            .collect()
    }

    pub fn add_stop_string(&mut self, stop: &str) {
        let condition = StopCondition::Text(stop.to_string());
        if !self.stop.contains(&condition) {
            self.stop.push(condition);
        }
    }

    fn has_constraint(&self) -> bool {
        self.grammar_string.is_some() || self.json_schema.is_some() || self.regex_pattern.is_some()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

fn one_or_many<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(match Option::<OneOrMany<T>>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(value)) => vec![value],
        Some(OneOrMany::Many(values)) => values,
    })
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ListOrText<T> {
    List(Vec<T>),
    Text(String),
}

/// Accepts `[1, 2]` or `"1, 2"`.
fn token_list<'de, D>(deserializer: D) -> Result<Vec<TokenId>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<ListOrText<TokenId>>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(ListOrText::List(ids)) => ids,
        Some(ListOrText::Text(raw)) => raw
            .split(',')
            .filter_map(|part| part.trim().parse::<TokenId>().ok())
            .collect(),
    })
}

/// Accepts a list, or a string holding the list body (`"\"\\n\", \":\""`).
fn sequence_breakers<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<ListOrText<String>>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(ListOrText::List(items)) => items,
        Some(ListOrText::Text(raw)) => serde_json::from_str::<Vec<String>>(&format!("[{}]", raw))
            .map_err(|e| de::Error::custom(format!("dry_sequence_breakers: {}", e)))?,
    })
}

/// Operator-defined default for one sampling parameter.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SamplerOverride {
    #[serde(rename = "override")]
    pub value: Value,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub additive: bool,
}

/// Applies overrides to raw request parameters before they are parsed.
pub fn apply_overrides(params: &mut Map<String, Value>, overrides: &HashMap<String, SamplerOverride>) {
    for (key, entry) in overrides {
        if entry.value.is_null() {
            warn!(key = %key, "skipping sampler override with null value");
            continue;
        }

        if matches!(params.get(key), None | Some(Value::Null)) {
            params.insert(key.clone(), entry.value.clone());
            continue;
        }

        let Some(current) = params.get_mut(key) else {
            continue;
        };
        if entry.force {
            *current = entry.value.clone();
        } else if entry.additive {
            if let Value::Array(items) = current {
                match &entry.value {
                    Value::Array(extra) => items.extend(extra.iter().cloned()),
                    single => items.push(single.clone()),
                }
            }
        }
    }
}

/// Seeds <= 0 or absent are replaced with a random 32-bit seed.
pub fn resolve_seed(seed: Option<i64>) -> u32 {
    match seed {
        Some(seed) if seed > 0 => seed as u32,
        _ => {
            let mut buf = [0u8; 4];
            match getrandom::getrandom(&mut buf) {
                Ok(()) => u32::from_le_bytes(buf),
                Err(e) => {
                    warn!(error = %e, "OS randomness unavailable, deriving seed from clock");
                    chrono::Utc::now().timestamp_subsec_nanos()
                }
            }
        }
    }
}

/// End-of-sequence ids banned by `ban_eos_token`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndTokens {
    pub eos: Option<TokenId>,
    pub eot: Option<TokenId>,
}

/// Ordered stage list for a request plus warnings for constraints the
/// native build cannot honor.
#[derive(Debug, Clone, PartialEq)]
pub struct StagePlan {
    pub stages: Vec<SamplerStage>,
    pub warnings: Vec<String>,
}

fn constraint_stages(
    config: &SamplingConfig,
    caps: NativeCapabilities,
    stages: &mut Vec<SamplerStage>,
    warnings: &mut Vec<String>,
) {
    if let Some(schema) = &config.json_schema {
        if caps.llguidance {
            let schema = serde_json::to_string_pretty(schema).unwrap_or_else(|_| schema.to_string());
            stages.push(SamplerStage::Llguidance {
                grammar: format!("start: json_object\njson_object: %json {}", schema),
            });
        } else {
            warnings.push("native build lacks llguidance; skipping JSON schema".to_string());
        }
    }

    if let Some(regex) = &config.regex_pattern {
        if caps.llguidance {
            stages.push(SamplerStage::Llguidance {
                grammar: format!("start: text\ntext: {}", regex),
            });
        } else {
            warnings.push("native build lacks llguidance; skipping regex constraint".to_string());
        }
    }

    if let Some(grammar) = &config.grammar_string {
        if caps.llguidance {
            stages.push(SamplerStage::Llguidance {
                grammar: grammar.clone(),
            });
        } else if caps.gbnf {
            warnings.push("native build lacks llguidance; using GBNF".to_string());
            stages.push(SamplerStage::Grammar {
                grammar: grammar.clone(),
                root: "root".to_string(),
            });
        } else {
            warnings.push("native build has no grammar support; skipping grammar".to_string());
        }
    }
}

/// Computes the stage order for a request.
///
/// Order: constraint, logit bias, penalties, DRY, temperature (unless
/// last), top-n-sigma, top-k, top-p, min-p, typical, mirostat v2, XTC,
/// temperature (if last), dist.
pub fn plan_stages(
    config: &SamplingConfig,
    caps: NativeCapabilities,
    end_tokens: EndTokens,
    seed: u32,
) -> StagePlan {
    let mut stages = Vec::new();
    let mut warnings = Vec::new();

    if config.has_constraint() {
        constraint_stages(config, caps, &mut stages, &mut warnings);
    }

    let mut biases: HashMap<TokenId, f32> = HashMap::new();
    for (raw_id, bias) in &config.logit_bias {
        match raw_id.trim().parse::<TokenId>() {
            Ok(id) => {
                biases.insert(id, *bias);
            }
            Err(_) => warnings.push(format!("ignoring logit bias for non-numeric token '{}'", raw_id)),
        }
    }
    for id in &config.banned_tokens {
        biases.insert(*id, BANNED_TOKEN_BIAS);
    }
    if config.ban_eos_token {
        for id in [end_tokens.eos, end_tokens.eot].into_iter().flatten() {
            biases.insert(id, BANNED_TOKEN_BIAS);
        }
    }
    if !biases.is_empty() {
        stages.push(SamplerStage::LogitBias(biases));
    }

    stages.push(SamplerStage::Penalties {
        last_n: config.penalty_range,
        repeat: config.repetition_penalty,
        frequency: config.frequency_penalty,
        presence: config.presence_penalty,
    });

    if config.dry_multiplier > 0.0 {
        stages.push(SamplerStage::Dry {
            multiplier: config.dry_multiplier,
            base: config.dry_base,
            allowed_length: config.dry_allowed_length,
            last_n: config.dry_range,
            sequence_breakers: config.dry_sequence_breakers.clone(),
        });
    }

    if !config.temperature_last {
        stages.push(SamplerStage::Temperature(config.temperature));
    }

    if config.nsigma > 0.0 {
        stages.push(SamplerStage::TopNSigma(config.nsigma));
    }
    stages.push(SamplerStage::TopK(config.top_k.max(0)));
    stages.push(SamplerStage::TopP {
        p: config.top_p,
        min_keep: 1,
    });
    stages.push(SamplerStage::MinP {
        p: config.min_p,
        min_keep: 1,
    });
    stages.push(SamplerStage::Typical {
        p: config.typical,
        min_keep: 1,
    });

    if config.mirostat_mode == 2 {
        stages.push(SamplerStage::MirostatV2 {
            seed,
            tau: config.mirostat_tau,
            eta: config.mirostat_eta,
        });
    }

    if config.xtc_probability > 0.0 {
        stages.push(SamplerStage::Xtc {
            probability: config.xtc_probability,
            threshold: config.xtc_threshold,
            min_keep: 1,
            seed,
        });
    }

    if config.temperature_last {
        stages.push(SamplerStage::Temperature(config.temperature));
    }

    stages.push(SamplerStage::Dist { seed });

    StagePlan { stages, warnings }
}

/// Built native chain. Not clonable; handed to the native side once.
#[derive(Debug)]
pub struct SamplerChain {
    ptr: SamplerPtr,
    len: usize,
}

impl SamplerChain {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn into_ptr(self) -> SamplerPtr {
        self.ptr
    }
}

/// Threads a request's stages through the native chain constructors.
pub struct SamplerChainBuilder<'a> {
    lib: &'a dyn NativeLibrary,
    model: ModelPtr,
    chain: SamplerPtr,
    len: usize,
}

impl<'a> SamplerChainBuilder<'a> {
    pub fn new(lib: &'a dyn NativeLibrary, model: ModelPtr, root: SamplerPtr) -> Self {
        Self {
            lib,
            model,
            chain: root,
            len: 0,
        }
    }

    pub fn push(mut self, stage: &SamplerStage) -> NativeResult<Self> {
        self.chain = self.lib.sampler_append(self.chain, self.model, stage)?;
        self.len += 1;
        Ok(self)
    }

    /// Builds the chain for `config`, logging every skipped constraint.
    pub fn build(
        self,
        config: &SamplingConfig,
        end_tokens: EndTokens,
        seed: u32,
    ) -> NativeResult<SamplerChain> {
        let plan = plan_stages(config, self.lib.capabilities(), end_tokens, seed);
        for warning in &plan.warnings {
            warn!("{}", warning);
        }

        let mut builder = self;
        for stage in &plan.stages {
            builder = builder.push(stage)?;
        }

        Ok(SamplerChain {
            ptr: builder.chain,
            len: builder.len,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::StubLibrary;
    use serde_json::json;

    fn names(plan: &StagePlan) -> Vec<&'static str> {
        plan.stages.iter().map(SamplerStage::name).collect()
    }

    fn all_caps() -> NativeCapabilities {
        NativeCapabilities {
            llguidance: true,
            gbnf: true,
        }
    }

    #[test]
    fn aliases_and_loose_shapes_parse() {
        let config = SamplingConfig::from_json(json!({
            "max_length": 64,
            "stop_sequence": "###",
            "custom_token_bans": "5, 9,x",
            "ignore_eos": true,
            "rep_pen": 1.1,
            "rep_pen_range": 256,
            "typical_p": 0.9,
            "dry_penalty_last_n": 128,
            "dry_sequence_breakers": "\"\\n\", \":\"",
            "banned_strings": "sorry"
        }))
        .expect("parse sampling");

        assert_eq!(config.max_tokens, Some(64));
        assert_eq!(config.stop, vec![StopCondition::Text("###".to_string())]);
        assert_eq!(config.banned_tokens, vec![5, 9]);
        assert!(config.ban_eos_token);
        assert_eq!(config.repetition_penalty, 1.1);
        assert_eq!(config.penalty_range, 256);
        assert_eq!(config.typical, 0.9);
        assert_eq!(config.dry_range, 128);
        assert_eq!(config.dry_sequence_breakers, vec!["\n".to_string(), ":".to_string()]);
        assert_eq!(config.banned_strings, vec!["sorry".to_string()]);
        assert_eq!(config.temperature, 1.0);
        assert_eq!(config.xtc_threshold, 0.1);
    }

    #[test]
    fn malformed_sequence_breakers_are_rejected() {
        let err = SamplingConfig::from_json(json!({"dry_sequence_breakers": "\"\\n\", :"}))
            .expect_err("broken breaker list");
        assert!(err.to_string().contains("dry_sequence_breakers"), "{}", err);
    }

    #[test]
    fn mixed_stop_list_splits_into_strings_and_tokens() {
        let config = SamplingConfig::from_json(json!({"stop": ["</s>", 42]})).expect("parse");
        assert_eq!(config.stop_strings(), vec!["</s>".to_string()]);
        assert_eq!(config.stop_tokens(), vec![42]);
    }

    #[test]
    fn temperature_moves_with_temperature_last() {
        let mut config = SamplingConfig::default();
        let plan = plan_stages(&config, all_caps(), EndTokens::default(), 1);
        assert_eq!(
            names(&plan),
            vec!["penalties", "temperature", "top_k", "top_p", "min_p", "typical", "dist"]
        );

        config.temperature_last = true;
        config.xtc_probability = 0.5;
        let plan = plan_stages(&config, all_caps(), EndTokens::default(), 1);
        assert_eq!(
            names(&plan),
            vec!["penalties", "top_k", "top_p", "min_p", "typical", "xtc", "temperature", "dist"]
        );
    }

    #[test]
    fn biases_merge_bans_and_end_tokens() {
        let config = SamplingConfig {
            logit_bias: HashMap::from([("10".to_string(), 2.5), ("oops".to_string(), 1.0)]),
            banned_tokens: vec![11],
            ban_eos_token: true,
            ..SamplingConfig::default()
        };
        let plan = plan_stages(
            &config,
            all_caps(),
            EndTokens {
                eos: Some(2),
                eot: Some(3),
            },
            9,
        );

        let SamplerStage::LogitBias(biases) = &plan.stages[0] else {
            panic!("logit bias must come first, got {:?}", plan.stages[0]);
        };
        assert_eq!(biases.get(&10), Some(&2.5));
        assert_eq!(biases.get(&11), Some(&BANNED_TOKEN_BIAS));
        assert_eq!(biases.get(&2), Some(&BANNED_TOKEN_BIAS));
        assert_eq!(biases.get(&3), Some(&BANNED_TOKEN_BIAS));
        assert_eq!(plan.warnings.len(), 1);
        assert_eq!(plan.stages.last(), Some(&SamplerStage::Dist { seed: 9 }));
    }

    #[test]
    fn optional_stages_follow_their_switches() {
        let config = SamplingConfig {
            dry_multiplier: 0.8,
            nsigma: 1.5,
            mirostat_mode: 2,
            ..SamplingConfig::default()
        };
        let plan = plan_stages(&config, all_caps(), EndTokens::default(), 3);
        assert_eq!(
            names(&plan),
            vec![
                "penalties", "dry", "temperature", "top_n_sigma", "top_k", "top_p", "min_p",
                "typical", "mirostat_v2", "dist"
            ]
        );
    }

    #[test]
    fn missing_constraint_support_degrades_to_warning() {
        let config = SamplingConfig {
            json_schema: Some(json!({"type": "object"})),
            ..SamplingConfig::default()
        };

        let plan = plan_stages(&config, NativeCapabilities::default(), EndTokens::default(), 1);
        assert_eq!(plan.stages[0].name(), "penalties");
        assert_eq!(plan.warnings.len(), 1);

        let plan = plan_stages(&config, all_caps(), EndTokens::default(), 1);
        let SamplerStage::Llguidance { grammar } = &plan.stages[0] else {
            panic!("constraint must lead the chain");
        };
        assert!(grammar.starts_with("start: json_object\njson_object: %json {"));
    }

    #[test]
    fn bnf_grammar_falls_back_to_gbnf() {
        let config = SamplingConfig {
            grammar_string: Some("root ::= \"yes\" | \"no\"".to_string()),
            ..SamplingConfig::default()
        };
        let caps = NativeCapabilities {
            llguidance: false,
            gbnf: true,
        };
        let plan = plan_stages(&config, caps, EndTokens::default(), 1);
        assert_eq!(plan.stages[0].name(), "grammar");
        assert_eq!(plan.warnings.len(), 1);
    }

    #[test]
    fn builder_threads_stages_through_native_chain() {
        let lib = StubLibrary::new();
        let bundle = lib.create_resources().expect("resources");
        let chain = SamplerChainBuilder::new(&lib, ModelPtr(1), bundle.sampler)
            .build(&SamplingConfig::default(), EndTokens::default(), 5)
            .expect("build chain");
        assert_eq!(chain.len(), 7);
        assert_eq!(chain.into_ptr(), bundle.sampler);
    }

    #[test]
    fn overrides_fill_force_and_extend() {
        let overrides = HashMap::from([
            (
                "temperature".to_string(),
                SamplerOverride {
                    value: json!(0.3),
                    force: false,
                    additive: false,
                },
            ),
            (
                "top_k".to_string(),
                SamplerOverride {
                    value: json!(40),
                    force: true,
                    additive: false,
                },
            ),
            (
                "stop".to_string(),
                SamplerOverride {
                    value: json!(["</end>"]),
                    force: false,
                    additive: true,
                },
            ),
        ]);

        let mut params = json!({"top_k": 5, "stop": ["###"], "temperature": 0.9});
        let map = params.as_object_mut().expect("object");
        apply_overrides(map, &overrides);

        assert_eq!(params["temperature"], json!(0.9));
        assert_eq!(params["top_k"], json!(40));
        assert_eq!(params["stop"], json!(["###", "</end>"]));

        let mut empty = Map::new();
        apply_overrides(&mut empty, &overrides);
        assert_eq!(empty["temperature"], json!(0.3));
    }

    #[test]
    fn explicit_positive_seed_is_kept() {
        assert_eq!(resolve_seed(Some(1234)), 1234);
    }
}
