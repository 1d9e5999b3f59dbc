//! Shared mocks for integration tests: a loader that counts loads, a scripted
//! engine that works on bytes, and a device backend that counts releases.
#![allow(dead_code)]

use candle_chatbot::backend::{DeviceBackend, MemoryStats};
use candle_chatbot::openai::pipelines::{InferenceEngine, ModelLoader};
use candle_chatbot::openai::sampling_params::SamplingConfig;
use candle_core::{Device, Error, Result};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub type Hook = Arc<dyn Fn() + Send + Sync>;

/// Engine whose tokens are the prompt's bytes. `generate` appends `reply`.
#[derive(Clone)]
pub struct MockEngine {
    pub reply: String,
    /// When false, `generate` returns only the continuation.
    pub echo_prompt: bool,
    pub fail_generate: bool,
    pub on_tokenize: Option<Hook>,
    pub on_generate: Option<Hook>,
    pub generate_calls: Arc<AtomicUsize>,
}

impl MockEngine {
    pub fn new(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
            echo_prompt: true,
            fail_generate: false,
            on_tokenize: None,
            on_generate: None,
            generate_calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl InferenceEngine for MockEngine {
    fn tokenize(&self, prompt: &str) -> Result<Vec<u32>> {
        if let Some(hook) = &self.on_tokenize {
            hook();
        }
        Ok(prompt.bytes().map(u32::from).collect())
    }

    fn generate(&self, tokens: &[u32], _sampling: &SamplingConfig) -> Result<Vec<u32>> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(hook) = &self.on_generate {
            hook();
        }
        if self.fail_generate {
            return Err(Error::msg("mock generation failure"));
        }
        let mut output = if self.echo_prompt {
            tokens.to_vec()
        } else {
            Vec::new()
        };
        output.extend(self.reply.bytes().map(u32::from));
        Ok(output)
    }

    fn decode(&self, tokens: &[u32]) -> Result<String> {
        let bytes: Vec<u8> = tokens.iter().map(|t| *t as u8).collect();
        String::from_utf8(bytes).map_err(Error::wrap)
    }
}

#[derive(Clone)]
pub struct MockLoader {
    pub engine: MockEngine,
    pub loads: Arc<AtomicUsize>,
    pub fail: Arc<AtomicBool>,
    pub delay: Duration,
    pub on_load: Option<Hook>,
}

impl MockLoader {
    pub fn new(engine: MockEngine) -> Self {
        Self {
            engine,
            loads: Arc::new(AtomicUsize::new(0)),
            fail: Arc::new(AtomicBool::new(false)),
            delay: Duration::ZERO,
            on_load: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl ModelLoader for MockLoader {
    fn model_name(&self) -> &str {
        "mock/gemma"
    }

    fn load(&self, _device: &Device) -> Result<Arc<dyn InferenceEngine>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if let Some(hook) = &self.on_load {
            hook();
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::msg("mock load failure"));
        }
        Ok(Arc::new(self.engine.clone()))
    }
}

pub struct CountingBackend {
    device: Device,
    pub releases: Arc<AtomicUsize>,
    pub available: bool,
}

impl CountingBackend {
    pub fn new() -> Self {
        Self {
            device: Device::Cpu,
            releases: Arc::new(AtomicUsize::new(0)),
            available: true,
        }
    }

    pub fn release_count(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

impl DeviceBackend for CountingBackend {
    fn device(&self) -> &Device {
        &self.device
    }

    fn label(&self) -> String {
        "mock:0".to_string()
    }

    fn is_available(&self) -> bool {
        self.available
    }

    fn memory_stats(&self) -> Option<MemoryStats> {
        Some(MemoryStats::from_bytes(512 * 1024 * 1024, 1024 * 1024 * 1024))
    }

    fn release_transient_memory(&self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}
