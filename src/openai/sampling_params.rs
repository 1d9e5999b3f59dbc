use serde::{Deserialize, Serialize};

/// Sampling parameters forwarded untouched from configuration to the
/// inference engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    pub temperature: f64,
    pub top_p: f64,
    /// 0 disables top-k filtering.
    pub top_k: usize,
    pub repetition_penalty: f32,
    /// 0 disables n-gram blocking.
    pub no_repeat_ngram_size: usize,
    /// Greedy decoding when false.
    pub do_sample: bool,
    pub max_new_tokens: usize,
    /// Stop at the first end-of-turn/eos token instead of always producing
    /// `max_new_tokens` tokens.
    pub early_stopping: bool,
    pub seed: u64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.9,
            top_k: 50,
            repetition_penalty: 1.2,
            no_repeat_ngram_size: 3,
            do_sample: true,
            max_new_tokens: 512,
            early_stopping: true,
            seed: 299792458,
        }
    }
}

impl SamplingConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.temperature < 0.0 {
            errors.push("temperature must be >= 0".to_string());
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            errors.push("top_p must be within [0, 1]".to_string());
        }
        if self.repetition_penalty <= 0.0 {
            errors.push("repetition_penalty must be > 0".to_string());
        }
        if self.max_new_tokens == 0 {
            errors.push("max_new_tokens must be > 0".to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
