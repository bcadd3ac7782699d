use std::path::{Path, PathBuf};

use anyhow::{Error as E, Result};
use tokenizers::Tokenizer;
use tracing::info;

use super::backend::ModelFamily;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpecialIds {
    pub bos: Option<u32>,
    pub eos: Option<u32>,
    pub eot: Option<u32>,
}

pub(super) fn resolve_tokenizer_path(model_path: &Path, tokenizer_hint: Option<&Path>) -> Option<PathBuf> {
    if let Some(hint) = tokenizer_hint {
        if hint.exists() {
            return Some(hint.to_path_buf());
        }
    }

    let parent_dir = model_path.parent().unwrap_or(Path::new("."));
    let local_tok_path = parent_dir.join("tokenizer.json");
    if local_tok_path.exists() {
        return Some(local_tok_path);
    }

    let models_tok_path = Path::new("models").join("tokenizer.json");
    if models_tok_path.exists() {
        return Some(models_tok_path);
    }

    None
}

/// Local tokenizer first, then `tokenizer.json` from the configured hub repo.
pub(super) fn load_tokenizer(model_path: &Path, hint: Option<&Path>, repo: Option<&str>) -> Result<Tokenizer> {
    let path = match resolve_tokenizer_path(model_path, hint) {
        Some(path) => path,
        None => {
            let repo = repo.ok_or_else(|| {
                E::msg("Tokenizer not found next to the model and no tokenizer_repo configured.")
            })?;
            info!(repo, "fetching tokenizer from the hub");
            let api = hf_hub::api::sync::Api::new()?;
            api.model(repo.to_string()).get("tokenizer.json")?
        }
    };

    info!(path = %path.display(), "using tokenizer");
    Tokenizer::from_file(path).map_err(E::msg)
}

pub(super) fn resolve_special_tokens(tokenizer: &Tokenizer, family: ModelFamily) -> Result<SpecialIds, String> {
    let id = |token: &str| tokenizer.token_to_id(token);

    match family {
        ModelFamily::Llama => {
            let eos = id("<|end_of_text|>").or_else(|| id("</s>")).ok_or_else(|| {
                "Tokenizer/model incompatibility: Llama requires <|end_of_text|> or </s>.".to_string()
            })?;
            Ok(SpecialIds {
                bos: id("<|begin_of_text|>").or_else(|| id("<s>")),
                eos: Some(eos),
                eot: id("<|eot_id|>"),
            })
        }
        ModelFamily::Qwen => {
            let eos = id("<|endoftext|>").or_else(|| id("</s>")).ok_or_else(|| {
                "Tokenizer/model incompatibility: Qwen requires <|endoftext|> or </s>.".to_string()
            })?;
            let eot = id("<|im_end|>").ok_or_else(|| {
                "Tokenizer/model incompatibility: Qwen template requires <|im_end|>.".to_string()
            })?;
            Ok(SpecialIds {
                bos: None,
                eos: Some(eos),
                eot: Some(eot),
            })
        }
        ModelFamily::Mistral => {
            let eos = id("</s>").or_else(|| id("<|end_of_text|>")).ok_or_else(|| {
                "Tokenizer/model incompatibility: Mistral requires </s> or <|end_of_text|>.".to_string()
            })?;
            Ok(SpecialIds {
                bos: id("<s>"),
                eos: Some(eos),
                eot: None,
            })
        }
        ModelFamily::Unknown => Ok(SpecialIds {
            bos: id("<s>"),
            eos: id("<|end_of_text|>")
                .or_else(|| id("</s>"))
                .or_else(|| id("<|endoftext|>")),
            eot: None,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::{SystemTime, UNIX_EPOCH};

    #[test]
    fn hint_wins_over_model_dir() {
        let base = mk_temp_dir("kernel_tokenizer_hint");
        fs::create_dir_all(&base).expect("create dir");
        let model = base.join("qwen.gguf");
        let local = base.join("tokenizer.json");
        let hint = base.join("custom.json");
        fs::write(&local, b"{}").expect("write local");
        fs::write(&hint, b"{}").expect("write hint");

        assert_eq!(resolve_tokenizer_path(&model, Some(&hint)), Some(hint.clone()));
        assert_eq!(resolve_tokenizer_path(&model, None), Some(local));

        let _ = fs::remove_dir_all(base);
    }

    #[test]
    fn missing_tokenizer_without_repo_fails() {
        let base = mk_temp_dir("kernel_tokenizer_missing");
        let err = load_tokenizer(&base.join("m.gguf"), None, None)
            .err()
            .expect("no tokenizer");
        assert!(err.to_string().contains("tokenizer_repo"));
    }

    fn mk_temp_dir(prefix: &str) -> PathBuf {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time ok")
            .as_nanos();
        std::env::temp_dir().join(format!("{}_{}_{}", prefix, std::process::id(), ts))
    }
}
