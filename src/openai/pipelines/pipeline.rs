use super::{InferenceEngine, ModelLoader};
use crate::openai::conversation::default_conversation::{END_OF_TURN, EOS_TOKEN};
use crate::openai::logits_processor::LogitsProcessor;
use crate::openai::sampling_params::SamplingConfig;
use candle_core::{DType, Device, Error, Result, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::{gemma, gemma2};
use hf_hub::{api::sync::ApiBuilder, Repo, RepoType};
use parking_lot::Mutex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

enum LLMModel {
    Gemma(gemma::Model),
    Gemma2(gemma2::Model),
}

impl LLMModel {
    fn forward(&mut self, input_ids: &Tensor, seqlen_offset: usize) -> Result<Tensor> {
        match self {
            LLMModel::Gemma(model) => model.forward(input_ids, seqlen_offset),
            LLMModel::Gemma2(model) => model.forward(input_ids, seqlen_offset),
        }
    }

    fn clear_kv_cache(&mut self) {
        match self {
            LLMModel::Gemma(model) => model.clear_kv_cache(),
            LLMModel::Gemma2(model) => model.clear_kv_cache(),
        }
    }
}

#[derive(Deserialize)]
struct ArchitectureConfig {
    architectures: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct DefaultModelPaths {
    pub tokenizer_filename: PathBuf,
    pub config_filename: PathBuf,
    pub filenames: Vec<PathBuf>,
}

/// Loads Gemma-family chat models from a local HF-style folder or from the hub.
pub struct DefaultLoader {
    model_id: String,
    weight_path: Option<String>,
    hf_token: Option<String>,
    revision: String,
    dtype: Option<String>,
}

impl DefaultLoader {
    pub fn new(model_id: impl Into<String>, weight_path: Option<String>) -> Self {
        Self {
            model_id: model_id.into(),
            weight_path,
            hf_token: None,
            revision: "main".to_string(),
            dtype: None,
        }
    }

    pub fn with_token(mut self, hf_token: Option<String>) -> Self {
        self.hf_token = hf_token;
        self
    }

    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = revision.into();
        self
    }

    pub fn with_dtype(mut self, dtype: Option<String>) -> Self {
        self.dtype = dtype;
        self
    }

    pub fn prepare_model_weights(&self) -> Result<DefaultModelPaths> {
        match &self.weight_path {
            //model in a folder (safetensor format, huggingface folder structure)
            Some(path) => {
                let folder = Path::new(path);
                let filenames = if folder.join("model.safetensors.index.json").exists() {
                    hub_load_local_safetensors(folder, "model.safetensors.index.json")?
                } else {
                    vec![folder.join("model.safetensors")]
                };
                Ok(DefaultModelPaths {
                    tokenizer_filename: folder.join("tokenizer.json"),
                    config_filename: folder.join("config.json"),
                    filenames,
                })
            }
            None => self.download_model(),
        }
    }

    pub fn download_model(&self) -> Result<DefaultModelPaths> {
        info!(
            "Downloading model {} (revision {}) from the hub",
            self.model_id, self.revision
        );
        let api = ApiBuilder::new()
            .with_progress(true)
            .with_token(self.hf_token.clone())
            .build()
            .map_err(Error::wrap)?;
        let api = api.repo(Repo::with_revision(
            self.model_id.clone(),
            RepoType::Model,
            self.revision.clone(),
        ));

        let tokenizer_filename = api.get("tokenizer.json").map_err(Error::wrap)?;
        let config_filename = api.get("config.json").map_err(Error::wrap)?;

        let mut filenames = vec![];
        for rfilename in api
            .info()
            .map_err(Error::wrap)?
            .siblings
            .iter()
            .map(|x| x.rfilename.clone())
            .filter(|x| x.ends_with(".safetensors"))
        {
            let filename = api.get(&rfilename).map_err(Error::wrap)?;
            filenames.push(filename);
        }

        Ok(DefaultModelPaths {
            tokenizer_filename,
            config_filename,
            filenames,
        })
    }
}

impl ModelLoader for DefaultLoader {
    fn model_name(&self) -> &str {
        &self.model_id
    }

    fn load(&self, device: &Device) -> Result<Arc<dyn InferenceEngine>> {
        let paths = self.prepare_model_weights()?;
        let dtype = crate::get_dtype(self.dtype.clone(), device)?;

        let tokenizer = Tokenizer::from_file(&paths.tokenizer_filename).map_err(Error::msg)?;
        let config = std::fs::read_to_string(&paths.config_filename)?;
        let arch: ArchitectureConfig = serde_json::from_str(&config).map_err(Error::wrap)?;
        let arch = arch
            .architectures
            .and_then(|archs| archs.into_iter().next())
            .unwrap_or_else(|| "GemmaForCausalLM".to_string());

        info!("Loading {arch} weights ({dtype:?}) onto {:?}", device.location());
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&paths.filenames, dtype, device)? };
        let use_flash_attn = cfg!(feature = "flash-attn");
        let model = match arch.as_str() {
            "GemmaForCausalLM" => {
                let cfg: gemma::Config = serde_json::from_str(&config).map_err(Error::wrap)?;
                LLMModel::Gemma(gemma::Model::new(use_flash_attn, &cfg, vb)?)
            }
            "Gemma2ForCausalLM" => {
                let cfg: gemma2::Config = serde_json::from_str(&config).map_err(Error::wrap)?;
                LLMModel::Gemma2(gemma2::Model::new(use_flash_attn, &cfg, vb)?)
            }
            other => {
                return Err(Error::msg(format!("Unsupported model architecture {other}")));
            }
        };

        let stop_token_ids = [EOS_TOKEN, END_OF_TURN]
            .iter()
            .filter_map(|token| tokenizer.token_to_id(token))
            .collect::<Vec<_>>();
        if stop_token_ids.is_empty() {
            warn!("Tokenizer has no end-of-turn tokens, generation only stops at max_new_tokens");
        }

        Ok(Arc::new(CandleEngine {
            model: Mutex::new(model),
            tokenizer,
            device: device.clone(),
            stop_token_ids,
        }))
    }
}

/// Tokenizer and weights resident on one device.
pub struct CandleEngine {
    model: Mutex<LLMModel>,
    tokenizer: Tokenizer,
    device: Device,
    stop_token_ids: Vec<u32>,
}

impl InferenceEngine for CandleEngine {
    fn tokenize(&self, prompt: &str) -> Result<Vec<u32>> {
        let encoding = self.tokenizer.encode(prompt, true).map_err(Error::msg)?;
        Ok(encoding.get_ids().to_vec())
    }

    fn generate(&self, tokens: &[u32], sampling: &SamplingConfig) -> Result<Vec<u32>> {
        let mut model = self.model.lock();
        model.clear_kv_cache();
        let mut logits_processor = LogitsProcessor::new(sampling);
        let mut all_tokens = tokens.to_vec();

        let start_gen = std::time::Instant::now();
        for index in 0..sampling.max_new_tokens {
            let context_size = if index > 0 { 1 } else { all_tokens.len() };
            let start_pos = all_tokens.len().saturating_sub(context_size);
            let input = Tensor::new(&all_tokens[start_pos..], &self.device)?.unsqueeze(0)?;
            let logits = model.forward(&input, start_pos)?;
            let logits = logits.squeeze(0)?.squeeze(0)?;
            let next_token = logits_processor.sample(&logits, &all_tokens)?;
            all_tokens.push(next_token);
            if sampling.early_stopping && self.stop_token_ids.contains(&next_token) {
                break;
            }
        }
        let generated = all_tokens.len() - tokens.len();
        let elapsed = start_gen.elapsed().as_secs_f64();
        debug!(
            "{generated} tokens generated ({:.2} token/s)",
            generated as f64 / elapsed.max(f64::EPSILON)
        );
        Ok(all_tokens)
    }

    fn decode(&self, tokens: &[u32]) -> Result<String> {
        self.tokenizer.decode(tokens, false).map_err(Error::msg)
    }
}

pub fn hub_load_local_safetensors(path: &Path, json_file: &str) -> Result<Vec<PathBuf>> {
    let jsfile = std::fs::File::open(path.join(json_file))?;
    let json: serde_json::Value = serde_json::from_reader(&jsfile).map_err(Error::wrap)?;
    let weight_map = match json.get("weight_map") {
        Some(serde_json::Value::Object(map)) => map,
        Some(_) => return Err(Error::msg(format!("weight map in {json_file} is not a map"))),
        None => return Err(Error::msg(format!("no weight map in {json_file}"))),
    };
    let mut safetensors_files = Vec::<PathBuf>::new();
    for value in weight_map.values() {
        if let Some(file) = value.as_str() {
            let file = path.join(file);
            if !safetensors_files.contains(&file) {
                safetensors_files.push(file);
            }
        }
    }
    Ok(safetensors_files)
}
