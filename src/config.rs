use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::errors::KernelError;
use crate::sampling::SamplerOverride;

pub const CONFIG_ENV_VAR: &str = "INFERENCE_KERNEL_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub network: NetworkConfig,
    pub logging: LoggingConfig,
    pub model: ModelConfig,
    pub generation: GenerationConfig,
    pub sampling: SamplingSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub host: String,
    pub port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6380,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub log_prompt: bool,
    pub log_generation_params: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_prompt: false,
            log_generation_params: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub model_dir: PathBuf,
    pub model_name: Option<String>,
    pub num_gpu_layers: i32,
    /// 0 lets the backend pick the model's trained context length.
    pub max_seq_len: u32,
    pub chunk_size: u32,
    pub num_slots: u32,
    pub prompt_template: Option<String>,
    pub templates_dir: PathBuf,
    pub tokenizer_path: Option<PathBuf>,
    pub tokenizer_repo: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from("models"),
            model_name: None,
            num_gpu_layers: 999,
            max_seq_len: 0,
            chunk_size: 2048,
            num_slots: 1,
            prompt_template: None,
            templates_dir: PathBuf::from("templates"),
            tokenizer_path: None,
            tokenizer_repo: None,
        }
    }
}

impl ModelConfig {
    pub fn for_model(model_name: impl Into<String>) -> Self {
        Self {
            model_name: Some(model_name.into()),
            ..Self::default()
        }
    }

    pub fn model_path(&self) -> Option<PathBuf> {
        self.model_name
            .as_ref()
            .filter(|name| !name.trim().is_empty())
            .map(|name| self.model_dir.join(name))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub poll_initial_ms: u64,
    pub poll_max_ms: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            poll_initial_ms: 2,
            poll_max_ms: 32,
        }
    }
}

impl GenerationConfig {
    pub fn poll_initial(&self) -> Duration {
        Duration::from_millis(self.poll_initial_ms.max(1))
    }

    pub fn poll_max(&self) -> Duration {
        Duration::from_millis(self.poll_max_ms.max(self.poll_initial_ms).max(1))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SamplingSection {
    pub overrides: HashMap<String, SamplerOverride>,
}

impl KernelConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, KernelError> {
        toml::from_str(raw).map_err(|e| KernelError::Config(e.to_string()))
    }

    pub fn load_from(path: &Path) -> Result<Self, KernelError> {
        if !path.exists() {
            warn!(
                path = %path.display(),
                "config file not found, falling back to defaults"
            );
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Reads the file named by `INFERENCE_KERNEL_CONFIG`, or `config.toml`.
    pub fn load() -> Result<Self, KernelError> {
        let path = std::env::var_os(CONFIG_ENV_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::load_from(&path)
    }
}
