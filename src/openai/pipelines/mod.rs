use super::responses::APIError;
use crate::openai::sampling_params::SamplingConfig;
use crate::try_api;
use candle_core::{Device, Result};
use dirs;
use std::sync::Arc;
use std::{env, fs};

pub mod generation;
pub mod pipeline;

/// A loaded model together with its tokenizer.
///
/// `generate` is a long, non-preemptible call: it returns the prompt tokens
/// followed by the continuation once generation has finished.
pub trait InferenceEngine: Send + Sync {
    fn tokenize(&self, prompt: &str) -> Result<Vec<u32>>;
    fn generate(&self, tokens: &[u32], sampling: &SamplingConfig) -> Result<Vec<u32>>;
    fn decode(&self, tokens: &[u32]) -> Result<String>;
}

/// Builds an [`InferenceEngine`] on a device. Called at most once per load
/// attempt by the lifecycle manager.
pub trait ModelLoader: Send + Sync {
    fn model_name(&self) -> &str;
    fn load(&self, device: &Device) -> Result<Arc<dyn InferenceEngine>>;
}

pub(crate) fn get_token(
    hf_token: Option<String>,
    hf_token_path: Option<String>,
) -> std::result::Result<String, APIError> {
    Ok(match (hf_token, hf_token_path) {
        (Some(envvar), None) => try_api!(env::var(envvar)).trim().to_string(),
        (None, Some(path)) => try_api!(fs::read_to_string(path)).trim().to_string(),
        (None, None) => try_api!(fs::read_to_string(format!(
            "{}/.cache/huggingface/token",
            dirs::home_dir()
                .ok_or(APIError::new_str("No home directory"))?
                .display()
        )))
        .trim()
        .to_string(),
        _ => {
            return Err(APIError::new_str(
                "Do not specify `hf_token` and `hf_token_path` at the same time.",
            ))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_from_file() {
        let path = env::temp_dir().join(format!("chatbot-token-{}", uuid::Uuid::new_v4()));
        fs::write(&path, "hf_abc\n").unwrap();
        let token = get_token(None, Some(path.display().to_string())).unwrap();
        assert_eq!(token, "hf_abc");
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_token_sources_are_exclusive() {
        let err = get_token(Some("HF_TOKEN".into()), Some("/tmp/token".into())).unwrap_err();
        assert!(err.to_string().contains("same time"));
    }
}
