//! Server configuration.
//!
//! Values come from three layers, lowest priority first: built-in defaults,
//! an optional YAML file, and command-line flags.

use crate::openai::pipelines::get_token;
use crate::openai::sampling_params::SamplingConfig;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

pub const CONFIG_ENV: &str = "CHATBOT_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "chatbot.yaml";
pub const DEFAULT_MODEL_ID: &str = "google/gemma-2b-it";
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a friendly and knowledgeable fitness coach. \
Give clear, safe and practical advice about exercise, training plans, nutrition and recovery. \
Keep answers concise, and recommend seeing a professional for medical concerns.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub model_id: String,
    /// Local folder with `config.json`, `tokenizer.json` and safetensors.
    /// Takes precedence over downloading `model_id`.
    pub weight_path: Option<String>,
    pub revision: String,
    /// Name of the environment variable holding the hub token.
    pub hf_token: Option<String>,
    pub hf_token_path: Option<String>,
    pub dtype: Option<String>,
    pub cpu: bool,
    pub device_ordinal: usize,
    /// Refuse to load the model on a host without an accelerator.
    pub require_accelerator: bool,
    pub idle_unload_secs: u64,
    pub idle_check_secs: u64,
    pub max_history_turns: usize,
    /// Upper bound on concurrently stored chat sessions.
    pub max_sessions: usize,
    pub session_ttl_secs: u64,
    pub system_prompt: String,
    pub sampling: SamplingConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            model_id: DEFAULT_MODEL_ID.to_string(),
            weight_path: None,
            revision: "main".to_string(),
            hf_token: None,
            hf_token_path: None,
            dtype: None,
            cpu: false,
            device_ordinal: 0,
            require_accelerator: false,
            idle_unload_secs: 600,
            idle_check_secs: 60,
            max_history_turns: 10,
            max_sessions: 1024,
            session_ttl_secs: 3600,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            sampling: SamplingConfig::default(),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse YAML config file '{path}': {source}")]
    ParseYaml {
        path: String,
        source: serde_yaml::Error,
    },
}

impl ServerConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_str(&content).map_err(|source| ConfigError::ParseYaml {
            path: path.display().to_string(),
            source,
        })
    }

    /// Load configuration from, in order:
    /// 1. the `--config` path, if given
    /// 2. the file named by `CHATBOT_CONFIG`
    /// 3. `chatbot.yaml` in the working directory
    /// 4. built-in defaults
    ///
    /// A file that is named explicitly but cannot be read is an error.
    pub fn load(cli_path: Option<&str>) -> Result<Self, ConfigError> {
        let explicit = cli_path
            .map(str::to_string)
            .or_else(|| std::env::var(CONFIG_ENV).ok().filter(|p| !p.trim().is_empty()));
        if let Some(path) = explicit {
            let config = Self::from_file(&path)?;
            info!("Loaded configuration from {path}");
            return Ok(config);
        }
        if Path::new(DEFAULT_CONFIG_FILE).exists() {
            let config = Self::from_file(DEFAULT_CONFIG_FILE)?;
            info!("Loaded configuration from {DEFAULT_CONFIG_FILE}");
            return Ok(config);
        }
        info!("Using default configuration");
        Ok(Self::default())
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.model_id.trim().is_empty() && self.weight_path.is_none() {
            errors.push("model_id or weight_path must be set".to_string());
        }
        if let Some(path) = &self.weight_path {
            if !Path::new(path).is_dir() {
                errors.push(format!("weight_path '{path}' is not a directory"));
            }
        }
        if let Some(dtype) = &self.dtype {
            if !matches!(dtype.as_str(), "f16" | "bf16" | "f32") {
                errors.push(format!("unsupported dtype '{dtype}' (expected f16, bf16 or f32)"));
            }
        }
        if self.hf_token.is_some() && self.hf_token_path.is_some() {
            errors.push("hf_token and hf_token_path are mutually exclusive".to_string());
        }
        if self.idle_unload_secs == 0 {
            errors.push("idle_unload_secs must be > 0".to_string());
        }
        if self.idle_check_secs == 0 {
            errors.push("idle_check_secs must be > 0".to_string());
        }
        if self.max_history_turns == 0 {
            errors.push("max_history_turns must be > 0".to_string());
        }
        if self.max_sessions == 0 {
            errors.push("max_sessions must be > 0".to_string());
        }
        if self.session_ttl_secs == 0 {
            errors.push("session_ttl_secs must be > 0".to_string());
        }
        if let Err(sampling) = self.sampling.validate() {
            errors.extend(sampling);
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Hub token for downloading `model_id`.
    ///
    /// `Ok(None)` when local weights are configured. An error means the model
    /// cannot be fetched and the server should start without loading.
    pub fn resolve_hf_token(&self) -> Result<Option<String>, String> {
        if self.weight_path.is_some() {
            return Ok(None);
        }
        get_token(self.hf_token.clone(), self.hf_token_path.clone())
            .map(Some)
            .map_err(|e| format!("no Hugging Face token available to download {} ({e})", self.model_id))
    }
}

#[derive(Parser, Debug, Default)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// YAML configuration file. Falls back to $CHATBOT_CONFIG, then ./chatbot.yaml
    #[arg(long)]
    pub config: Option<String>,

    /// Host address to bind to, to serve on host:port
    #[arg(long)]
    pub host: Option<String>,

    /// Port to serve on (host:port)
    #[arg(long)]
    pub port: Option<u16>,

    /// Hub model id, ignored when weight_path is passed
    #[arg(long = "m")]
    pub model_id: Option<String>,

    /// The folder that contains safetensor weights and json files
    /// (same structure as huggingface online)
    #[arg(long = "w")]
    pub weight_path: Option<String>,

    #[arg(long)]
    pub revision: Option<String>,

    /// Huggingface token environment variable (optional). If not specified, load using hf_token_path.
    #[arg(long)]
    pub hf_token: Option<String>,

    /// Huggingface token file (optional). If neither `hf_token` or `hf_token_path` are specified this is used with the value
    /// of `~/.cache/huggingface/token`
    #[arg(long)]
    pub hf_token_path: Option<String>,

    #[arg(long)]
    pub dtype: Option<String>,

    #[arg(long, default_value_t = false)]
    pub cpu: bool,

    #[arg(long = "d")]
    pub device_ordinal: Option<usize>,

    #[arg(long, default_value_t = false)]
    pub require_accelerator: bool,

    /// Unload the model after this many seconds without use
    #[arg(long)]
    pub idle_unload_secs: Option<u64>,

    /// How often to check for an idle model (seconds)
    #[arg(long)]
    pub idle_check_secs: Option<u64>,

    #[arg(long)]
    pub max_history_turns: Option<usize>,

    /// Oldest sessions are evicted beyond this many
    #[arg(long)]
    pub max_sessions: Option<usize>,

    /// Forget sessions unused for this many seconds
    #[arg(long)]
    pub session_ttl_secs: Option<u64>,

    #[arg(long)]
    pub system_prompt: Option<String>,

    #[arg(long)]
    pub temperature: Option<f64>,

    #[arg(long)]
    pub top_p: Option<f64>,

    #[arg(long)]
    pub top_k: Option<usize>,

    #[arg(long)]
    pub penalty: Option<f32>,

    #[arg(long)]
    pub no_repeat_ngram_size: Option<usize>,

    #[arg(long)]
    pub max_new_tokens: Option<usize>,

    /// Disable sampling (greedy decoding)
    #[arg(long, default_value_t = false)]
    pub greedy: bool,

    #[arg(long)]
    pub seed: Option<u64>,

    /// Log to console and candle-chatbot.log through ftail
    #[arg(long, default_value_t = false)]
    pub log: bool,
}

impl Args {
    /// Overlay command-line values on a loaded configuration.
    pub fn apply(&self, config: &mut ServerConfig) {
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(model_id) = &self.model_id {
            config.model_id = model_id.clone();
        }
        if self.weight_path.is_some() {
            if config.weight_path.is_some() && config.weight_path != self.weight_path {
                warn!("Overriding configured weight_path with the command line value");
            }
            config.weight_path = self.weight_path.clone();
        }
        if let Some(revision) = &self.revision {
            config.revision = revision.clone();
        }
        if self.hf_token.is_some() {
            config.hf_token = self.hf_token.clone();
            config.hf_token_path = None;
        }
        if self.hf_token_path.is_some() {
            config.hf_token_path = self.hf_token_path.clone();
            config.hf_token = None;
        }
        if self.dtype.is_some() {
            config.dtype = self.dtype.clone();
        }
        config.cpu |= self.cpu;
        config.require_accelerator |= self.require_accelerator;
        if let Some(ordinal) = self.device_ordinal {
            config.device_ordinal = ordinal;
        }
        if let Some(secs) = self.idle_unload_secs {
            config.idle_unload_secs = secs;
        }
        if let Some(secs) = self.idle_check_secs {
            config.idle_check_secs = secs;
        }
        if let Some(turns) = self.max_history_turns {
            config.max_history_turns = turns;
        }
        if let Some(max) = self.max_sessions {
            config.max_sessions = max;
        }
        if let Some(secs) = self.session_ttl_secs {
            config.session_ttl_secs = secs;
        }
        if let Some(prompt) = &self.system_prompt {
            config.system_prompt = prompt.clone();
        }

        let sampling = &mut config.sampling;
        if let Some(temperature) = self.temperature {
            sampling.temperature = temperature;
        }
        if let Some(top_p) = self.top_p {
            sampling.top_p = top_p;
        }
        if let Some(top_k) = self.top_k {
            sampling.top_k = top_k;
        }
        if let Some(penalty) = self.penalty {
            sampling.repetition_penalty = penalty;
        }
        if let Some(size) = self.no_repeat_ngram_size {
            sampling.no_repeat_ngram_size = size;
        }
        if let Some(max_new_tokens) = self.max_new_tokens {
            sampling.max_new_tokens = max_new_tokens;
        }
        if self.greedy {
            sampling.do_sample = false;
        }
        if let Some(seed) = self.seed {
            sampling.seed = seed;
        }
    }
}
