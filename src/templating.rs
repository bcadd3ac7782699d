use std::fmt::Write as _;
use std::path::Path;

use inference_protocol::{ToolCall, ToolSpec};
use minijinja::{Environment, Error as TemplateError, ErrorKind, Value};
use serde::{Deserialize, Serialize};
use serde_json::Map;
use tracing::warn;

use crate::errors::{KernelError, KernelResult};

const TEMPLATE_KEY: &str = "chat";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl ChatMessage {
    pub fn new(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: content.to_string(),
            tool_calls: None,
        }
    }
}

/// Values a template publishes through top-level `{% set %}` statements.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateMetadata {
    pub stop_strings: Vec<String>,
    pub tool_start: Option<String>,
    pub tool_start_token: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct RenderOptions<'a> {
    pub add_generation_prompt: bool,
    pub bos_token: &'a str,
    pub eos_token: &'a str,
    pub tools: &'a [ToolSpec],
    pub template_vars: Option<&'a Map<String, serde_json::Value>>,
}

/// Compiled chat template with its metadata, extracted once at construction.
pub struct PromptTemplate {
    name: String,
    env: Environment<'static>,
    metadata: TemplateMetadata,
}

fn raise_exception(message: String) -> Result<String, TemplateError> {
    Err(TemplateError::new(ErrorKind::InvalidOperation, message))
}

fn strftime_now(format: String) -> Result<String, TemplateError> {
    let mut out = String::new();
    write!(out, "{}", chrono::Local::now().format(&format))
        .map_err(|_| TemplateError::new(ErrorKind::InvalidOperation, "invalid strftime format"))?;
    Ok(out)
}

impl PromptTemplate {
    pub fn from_source(name: impl Into<String>, source: impl Into<String>) -> KernelResult<Self> {
        let name = name.into();
        let mut env = Environment::new();
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        env.add_function("raise_exception", raise_exception);
        env.add_function("strftime_now", strftime_now);
        let source = source.into();
        let metadata = extract_metadata(&source, &name);
        env.add_template_owned(TEMPLATE_KEY, source)
            .map_err(|e| KernelError::Template(format!("{}: {}", name, e)))?;

        Ok(Self { name, env, metadata })
    }

    pub fn from_file(path: &Path) -> KernelResult<Self> {
        let source = std::fs::read_to_string(path)
            .map_err(|e| KernelError::Template(format!("cannot read {}: {}", path.display(), e)))?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "template".to_string());
        Self::from_source(name, source)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn metadata(&self) -> &TemplateMetadata {
        &self.metadata
    }

    /// Renders a conversation into a prompt. A leading BOS piece is
    /// stripped since the tokenizer adds its own.
    pub fn render(&self, messages: &[ChatMessage], options: &RenderOptions<'_>) -> KernelResult<String> {
        let mut ctx = options.template_vars.cloned().unwrap_or_default();
        ctx.insert("messages".to_string(), json_value(messages)?);
        ctx.insert("tools".to_string(), json_value(options.tools)?);
        ctx.insert(
            "add_generation_prompt".to_string(),
            serde_json::Value::Bool(options.add_generation_prompt),
        );
        ctx.insert("bos_token".to_string(), options.bos_token.into());
        ctx.insert("eos_token".to_string(), options.eos_token.into());

        let template = self
            .env
            .get_template(TEMPLATE_KEY)
            .map_err(|e| KernelError::Template(e.to_string()))?;
        let rendered = template
            .render(&ctx)
            .map_err(|e| KernelError::Template(e.to_string()))?;

        if !options.bos_token.is_empty() {
            if let Some(rest) = rendered.strip_prefix(options.bos_token) {
                return Ok(rest.to_string());
            }
        }
        Ok(rendered)
    }
}

fn json_value<T: Serialize + ?Sized>(value: &T) -> KernelResult<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| KernelError::Template(e.to_string()))
}

const METADATA_KEYS: [&str; 3] = ["stop_strings", "tool_start", "tool_start_token"];

/// Evaluates only the top-level `{% set %}` statements that assign a
/// metadata key. The template body itself never runs, so templates that
/// index `messages` or raise on an empty conversation still yield metadata.
fn extract_metadata(source: &str, name: &str) -> TemplateMetadata {
    let sets = metadata_sets(source);
    if sets.is_empty() {
        return TemplateMetadata::default();
    }

    let mut env = Environment::new();
    if let Err(e) = env.add_template_owned(TEMPLATE_KEY, sets.concat()) {
        warn!(template = %name, error = %e, "template metadata unavailable");
        return TemplateMetadata::default();
    }
    let template = match env.get_template(TEMPLATE_KEY) {
        Ok(template) => template,
        Err(e) => {
            warn!(template = %name, error = %e, "template metadata unavailable");
            return TemplateMetadata::default();
        }
    };
    let state = match template.eval_to_state(minijinja::context! {}) {
        Ok(state) => state,
        Err(e) => {
            warn!(template = %name, error = %e, "template metadata unavailable");
            return TemplateMetadata::default();
        }
    };

    let defined = |key: &str| state.lookup(key).filter(|v| !v.is_undefined() && !v.is_none());

    let stop_strings = defined("stop_strings")
        .and_then(|value| value.try_iter().ok().map(strings_of))
        .unwrap_or_default();
    let tool_start = defined("tool_start").and_then(|v| v.as_str().map(str::to_string));
    let tool_start_token = defined("tool_start_token").and_then(|v| u32::try_from(v).ok());

    TemplateMetadata {
        stop_strings,
        tool_start,
        tool_start_token,
    }
}

/// Top-level `{% set key = ... %}` tags for the metadata keys, in source order.
fn metadata_sets(source: &str) -> Vec<String> {
    let mut sets = Vec::new();
    let mut depth = 0usize;
    let mut rest = source;

    loop {
        let tag = rest.find("{%");
        let comment = rest.find("{#");
        let start = match (tag, comment) {
            (Some(t), Some(c)) if c < t => {
                match rest[c..].find("#}") {
                    Some(close) => rest = &rest[c + close + 2..],
                    None => break,
                }
                continue;
            }
            (Some(t), _) => t,
            (None, _) => break,
        };

        let after = &rest[start + 2..];
        let Some(end) = tag_end(after) else { break };
        let body = after[..end].trim_matches(|c: char| c == '-' || c == '+' || c.is_whitespace());
        rest = &after[end + 2..];

        let keyword = body.split_whitespace().next().unwrap_or_default();
        match keyword {
            "if" | "for" | "macro" | "call" | "filter" | "block" | "with" => depth += 1,
            "set" if !body.contains('=') => depth += 1,
            "raw" => match rest.find("endraw") {
                Some(pos) => rest = &rest[pos..],
                None => break,
            },
            k if k.starts_with("end") => depth = depth.saturating_sub(1),
            "set" if depth == 0 => {
                let target = body["set".len()..].split('=').next().unwrap_or_default().trim();
                if METADATA_KEYS.contains(&target) {
                    sets.push(format!("{{% {} %}}", body));
                }
            }
            _ => {}
        }
    }

    sets
}

/// Offset of the `%}` closing a tag, skipping quoted strings.
fn tag_end(after: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    let mut prev = '\0';
    for (idx, c) in after.char_indices() {
        match quote {
            Some(q) if c == q && prev != '\\' => quote = None,
            Some(_) => {}
            None => match c {
                '"' | '\'' => quote = Some(c),
                '}' if prev == '%' => return Some(idx - 1),
                _ => {}
            },
        }
        prev = c;
    }
    None
}

fn strings_of(items: impl Iterator<Item = Value>) -> Vec<String> {
    items
        .filter_map(|item| item.as_str().map(str::to_string))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOOL_TEMPLATE: &str = r#"{%- set stop_strings = ["<|user|>", "<|end|>"] -%}
{%- set tool_start = "TOOLCALL:" -%}
{%- set tool_start_token = 32011 -%}
{{ bos_token }}{% for message in messages %}<|{{ message.role }}|>{{ message.content }}<|end|>{% endfor %}
{%- if add_generation_prompt %}<|assistant|>{% endif %}"#;

    #[test]
    fn metadata_is_read_from_top_level_sets() {
        let template = PromptTemplate::from_source("tools", TOOL_TEMPLATE).expect("template");
        let meta = template.metadata();
        assert_eq!(meta.stop_strings, vec!["<|user|>".to_string(), "<|end|>".to_string()]);
        assert_eq!(meta.tool_start.as_deref(), Some("TOOLCALL:"));
        assert_eq!(meta.tool_start_token, Some(32011));
    }

    #[test]
    fn metadata_survives_templates_that_index_messages() {
        let source = r#"{%- set tool_start = "TOOLCALL:" -%}
{%- set stop_strings = ["<|eot_id|>"] -%}
{% if messages[0]['role'] == 'system' %}{{ messages[0]['content'] }}{% endif %}"#;
        let template = PromptTemplate::from_source("llama3", source).expect("template");
        assert_eq!(template.metadata().tool_start.as_deref(), Some("TOOLCALL:"));
        assert_eq!(template.metadata().stop_strings, vec!["<|eot_id|>".to_string()]);
    }

    #[test]
    fn metadata_survives_templates_that_raise_without_messages() {
        let source = r#"{%- set tool_start = "TOOLCALL:" -%}
{% if not messages %}{{ raise_exception('conversation is empty') }}{% endif %}
{% for m in messages %}{{ m.content }}{% endfor %}"#;
        let template = PromptTemplate::from_source("strict_tools", source).expect("template");
        assert_eq!(template.metadata().tool_start.as_deref(), Some("TOOLCALL:"));
    }

    #[test]
    fn only_top_level_sets_count() {
        let source = r#"{# {% set tool_start = "COMMENTED" %} #}
{% for m in messages %}{% set tool_start = "NESTED" %}{% endfor %}
{% set greeting %}hi{% endset %}
{% set tool_start = "A %} B" %}{% set other = 1 %}"#;
        let meta = extract_metadata(source, "nested");
        assert_eq!(meta.tool_start.as_deref(), Some("A %} B"));
        assert!(meta.stop_strings.is_empty());
        assert_eq!(meta.tool_start_token, None);
    }

    #[test]
    fn plain_template_has_empty_metadata() {
        let template =
            PromptTemplate::from_source("plain", "{% for m in messages %}{{ m.content }}{% endfor %}")
                .expect("template");
        assert_eq!(template.metadata(), &TemplateMetadata::default());
    }

    #[test]
    fn render_strips_leading_bos() {
        let template = PromptTemplate::from_source("tools", TOOL_TEMPLATE).expect("template");
        let prompt = template
            .render(
                &[ChatMessage::new("user", "Hi")],
                &RenderOptions {
                    add_generation_prompt: true,
                    bos_token: "<s>",
                    eos_token: "</s>",
                    ..RenderOptions::default()
                },
            )
            .expect("render");
        assert_eq!(prompt, "<|user|>Hi<|end|><|assistant|>");
    }

    #[test]
    fn raise_exception_surfaces_as_template_error() {
        let template = PromptTemplate::from_source(
            "strict",
            "{% if messages | length == 0 %}{{ raise_exception('no messages') }}{% endif %}",
        )
        .expect("template compiles");
        assert_eq!(template.metadata(), &TemplateMetadata::default());

        let err = template
            .render(&[], &RenderOptions::default())
            .expect_err("must raise");
        assert!(err.to_string().contains("no messages"));
    }

    #[test]
    fn syntax_errors_are_reported() {
        assert!(PromptTemplate::from_source("broken", "{% for %}").is_err());
    }
}
