use crate::openai::sampling_params::SamplingConfig;
use candle_core::{DType, Error, Result, Tensor};
use rand::distr::{weighted::WeightedIndex, Distribution};
use rand::{rngs::StdRng, SeedableRng};
use std::collections::HashSet;

#[derive(Clone, PartialEq, Debug)]
pub enum Sampling {
    ArgMax,
    TopKThenTopP { k: usize, p: f64, temperature: f64 },
}

pub struct LogitsProcessor {
    rng: StdRng,
    pub sampling: Sampling,
    repetition_penalty: f32,
    no_repeat_ngram_size: usize,
}

impl LogitsProcessor {
    pub fn from_sampling(seed: u64, sampling: Sampling) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            sampling,
            repetition_penalty: 1.0,
            no_repeat_ngram_size: 0,
        }
    }

    pub fn new(cfg: &SamplingConfig) -> Self {
        let temperature = if cfg.temperature < 1e-7 {
            None
        } else {
            Some(cfg.temperature)
        };
        let sampling = match (cfg.do_sample, temperature) {
            (true, Some(temperature)) => Sampling::TopKThenTopP {
                k: cfg.top_k,
                p: cfg.top_p,
                temperature,
            },
            _ => Sampling::ArgMax,
        };
        let mut processor = Self::from_sampling(cfg.seed, sampling);
        processor.repetition_penalty = cfg.repetition_penalty;
        processor.no_repeat_ngram_size = cfg.no_repeat_ngram_size;
        processor
    }

    /// Pick the next token given the last-position logits and every token
    /// produced so far (prompt included).
    pub fn sample(&mut self, logits: &Tensor, history: &[u32]) -> Result<u32> {
        let logits = logits.to_dtype(DType::F32)?.to_vec1::<f32>()?;
        self.sample_vec(logits, history)
    }

    pub fn sample_vec(&mut self, mut logits: Vec<f32>, history: &[u32]) -> Result<u32> {
        apply_repetition_penalty(&mut logits, self.repetition_penalty, history);
        for token in banned_ngram_tokens(history, self.no_repeat_ngram_size) {
            if let Some(logit) = logits.get_mut(token as usize) {
                *logit = f32::NEG_INFINITY;
            }
        }
        match self.sampling.clone() {
            Sampling::ArgMax => sample_argmax(&logits),
            Sampling::TopKThenTopP { k, p, temperature } => {
                let prs = softmax(&logits, temperature);
                self.sample_topk_topp(prs, k, p as f32)
            }
        }
    }

    fn sample_multinomial(&mut self, prs: &[f32]) -> Result<u32> {
        let distr = WeightedIndex::new(prs).map_err(Error::wrap)?;
        Ok(distr.sample(&mut self.rng) as u32)
    }

    // top-k first (k = 0 keeps every token), then nucleus sampling over what is left
    fn sample_topk_topp(&mut self, prs: Vec<f32>, top_k: usize, top_p: f32) -> Result<u32> {
        let mut indices: Vec<usize> = (0..prs.len()).collect();
        indices.sort_unstable_by(|a, b| prs[*b].total_cmp(&prs[*a]));
        if top_k > 0 && top_k < indices.len() {
            indices.truncate(top_k);
        }
        let mut kept = Vec::with_capacity(indices.len());
        let mut cumsum = 0.0;
        for index in indices {
            if top_p > 0.0 && top_p < 1.0 && cumsum >= top_p {
                break;
            }
            cumsum += prs[index];
            kept.push(index);
        }
        let weights: Vec<f32> = kept.iter().map(|i| prs[*i]).collect();
        let choice = self.sample_multinomial(&weights)?;
        Ok(kept[choice as usize] as u32)
    }
}

fn sample_argmax(logits: &[f32]) -> Result<u32> {
    logits
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.total_cmp(b))
        .map(|(i, _)| i as u32)
        .ok_or_else(|| Error::msg("cannot sample from empty logits"))
}

fn softmax(logits: &[f32], temperature: f64) -> Vec<f32> {
    let temperature = temperature as f32;
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits
        .iter()
        .map(|l| ((l - max) / temperature).exp())
        .collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// CTRL-style penalty: positive logits are divided, negative ones multiplied.
pub fn apply_repetition_penalty(logits: &mut [f32], penalty: f32, history: &[u32]) {
    if (penalty - 1.0).abs() < f32::EPSILON {
        return;
    }
    let seen: HashSet<u32> = history.iter().copied().collect();
    for token in seen {
        if let Some(logit) = logits.get_mut(token as usize) {
            *logit = if *logit < 0.0 {
                *logit * penalty
            } else {
                *logit / penalty
            };
        }
    }
}

/// Tokens that would complete an n-gram already present in `history`.
pub fn banned_ngram_tokens(history: &[u32], ngram_size: usize) -> Vec<u32> {
    if ngram_size == 0 || history.len() + 1 < ngram_size {
        return Vec::new();
    }
    let prefix = &history[history.len() + 1 - ngram_size..];
    history
        .windows(ngram_size)
        .filter(|window| &window[..ngram_size - 1] == prefix)
        .map(|window| window[ngram_size - 1])
        .collect()
}
