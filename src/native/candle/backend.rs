use std::path::Path;

use anyhow::{Error as E, Result};
use candle_core::quantized::gguf_file;
use candle_core::{Device, Tensor};
use candle_transformers::models::quantized_llama;
use candle_transformers::models::quantized_qwen2;

const CHAT_TEMPLATE_KEY: &str = "tokenizer.chat_template";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    Llama,
    Qwen,
    Mistral,
    Unknown,
}

impl ModelFamily {
    pub fn from_filename(name: &str) -> Self {
        let lowered = name.to_lowercase();
        if lowered.contains("llama") {
            Self::Llama
        } else if lowered.contains("qwen") {
            Self::Qwen
        } else if lowered.contains("mistral") || lowered.contains("mixtral") {
            Self::Mistral
        } else {
            Self::Unknown
        }
    }

    fn gguf_arch(self) -> &'static str {
        match self {
            Self::Qwen => "qwen2",
            _ => "llama",
        }
    }

    pub fn adds_bos(self) -> bool {
        !matches!(self, Self::Qwen)
    }
}

pub enum RuntimeModel {
    Llama(quantized_llama::ModelWeights),
    Qwen2(quantized_qwen2::ModelWeights),
}

/// Weights plus the GGUF metadata the kernel needs.
pub struct LoadedWeights {
    pub model: RuntimeModel,
    pub chat_template: Option<String>,
    pub context_length: Option<u32>,
}

impl RuntimeModel {
    pub fn load_from_gguf(path: &Path, family: ModelFamily, device: &Device) -> Result<LoadedWeights> {
        let mut file = std::fs::File::open(path)
            .map_err(|e| E::msg(format!("Failed to open model file: {}", e)))?;
        let content = gguf_file::Content::read(&mut file)?;

        let chat_template = match content.metadata.get(CHAT_TEMPLATE_KEY) {
            Some(gguf_file::Value::String(template)) => Some(template.clone()),
            _ => None,
        };
        let context_length = content
            .metadata
            .get(&format!("{}.context_length", family.gguf_arch()))
            .and_then(|v| v.to_u32().ok());

        let model = match family {
            ModelFamily::Llama | ModelFamily::Mistral => {
                Self::Llama(quantized_llama::ModelWeights::from_gguf(content, &mut file, device)?)
            }
            ModelFamily::Qwen => {
                match quantized_qwen2::ModelWeights::from_gguf(content, &mut file, device) {
                    Ok(model) => Self::Qwen2(model),
                    Err(e) => {
                        let msg = format!("{}", e);
                        if msg.contains("cannot find tensor info for output_norm.weight") {
                            return Err(E::msg(
                                "Qwen load failed: missing 'output_norm.weight'. The GGUF is likely an incomplete split shard. Use a full single-file GGUF, or merge all split parts before loading.",
                            ));
                        }
                        return Err(E::msg(msg));
                    }
                }
            }
            ModelFamily::Unknown => {
                return Err(E::msg(
                    "Unknown model family: cannot choose runtime backend from the file name.",
                ))
            }
        };

        Ok(LoadedWeights {
            model,
            chat_template,
            context_length,
        })
    }

    /// Position 0 starts a fresh sequence and drops the cached keys/values.
    pub fn forward(&mut self, input: &Tensor, position: usize) -> Result<Tensor> {
        match self {
            Self::Llama(model) => Ok(model.forward(input, position)?),
            Self::Qwen2(model) => Ok(model.forward(input, position)?),
        }
    }
}
