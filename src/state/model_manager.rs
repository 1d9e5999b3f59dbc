use crate::api::ChatError;
use crate::backend::{DeviceBackend, MemoryStats};
use crate::openai::pipelines::{InferenceEngine, ModelLoader};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelLifecycleStatus {
    Unloaded,
    Loaded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub is_loaded: bool,
    pub device: String,
    pub model_name: String,
    pub device_available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryStats>,
}

struct ManagerState {
    engine: Option<Arc<dyn InferenceEngine>>,
    last_used: Instant,
}

/// Owns the single model instance of the process.
///
/// The model is loaded lazily by the first [`acquire`](Self::acquire) and
/// dropped again by [`unload_if_idle`](Self::unload_if_idle). Tokenizer and
/// weights live in one engine handle, so they are resident or absent together.
/// Idle unloading skips a handle that a request still holds; only the forced
/// [`unload`](Self::unload) drops it from under a running request.
pub struct ModelLifecycleManager {
    inner: Mutex<ManagerState>,
    /// Serializes load attempts; never held while `inner` is needed by readers.
    load_lock: Mutex<()>,
    loader: Box<dyn ModelLoader>,
    backend: Arc<dyn DeviceBackend>,
    model_name: String,
    require_accelerator: bool,
    config_error: Option<String>,
}

impl ModelLifecycleManager {
    pub fn new(loader: Box<dyn ModelLoader>, backend: Arc<dyn DeviceBackend>) -> Self {
        let model_name = loader.model_name().to_string();
        Self {
            inner: Mutex::new(ManagerState {
                engine: None,
                last_used: Instant::now(),
            }),
            load_lock: Mutex::new(()),
            loader,
            backend,
            model_name,
            require_accelerator: false,
            config_error: None,
        }
    }

    /// A manager that reports health but never attempts a load.
    pub fn unavailable(
        reason: impl Into<String>,
        loader: Box<dyn ModelLoader>,
        backend: Arc<dyn DeviceBackend>,
    ) -> Self {
        let reason = reason.into();
        error!(
            "Model {} is unavailable: {reason}. Chat requests will fail until the configuration is fixed.",
            loader.model_name()
        );
        let mut manager = Self::new(loader, backend);
        manager.config_error = Some(reason);
        manager
    }

    pub fn with_require_accelerator(mut self, require_accelerator: bool) -> Self {
        self.require_accelerator = require_accelerator;
        self
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn config_error(&self) -> Option<&str> {
        self.config_error.as_deref()
    }

    pub fn status(&self) -> ModelLifecycleStatus {
        if self.is_loaded() {
            ModelLifecycleStatus::Loaded
        } else {
            ModelLifecycleStatus::Unloaded
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.inner.lock().engine.is_some()
    }

    /// Refresh the last-used instant without loading anything.
    pub fn touch(&self) {
        self.inner.lock().last_used = Instant::now();
    }

    pub fn ensure_loaded(&self) -> bool {
        self.acquire().is_some()
    }

    /// Return the resident engine, loading it first if needed.
    ///
    /// Concurrent callers that find the model absent queue on the load lock;
    /// only the first one runs the loader, the rest reuse its result. A failed
    /// load leaves the manager unloaded and the next call retries.
    pub fn acquire(&self) -> Option<Arc<dyn InferenceEngine>> {
        if let Some(engine) = self.resident_engine() {
            return Some(engine);
        }
        if let Some(reason) = &self.config_error {
            debug!("Skipping model load, configuration error: {reason}");
            return None;
        }

        let _load = self.load_lock.lock();
        if let Some(engine) = self.resident_engine() {
            return Some(engine);
        }

        match self.load() {
            Ok(engine) => {
                let mut state = self.inner.lock();
                state.engine = Some(engine.clone());
                state.last_used = Instant::now();
                Some(engine)
            }
            Err(e) => {
                error!("Error loading model {}: {e}", self.model_name);
                self.backend.release_transient_memory();
                None
            }
        }
    }

    fn resident_engine(&self) -> Option<Arc<dyn InferenceEngine>> {
        let mut state = self.inner.lock();
        let engine = state.engine.clone()?;
        state.last_used = Instant::now();
        Some(engine)
    }

    fn load(&self) -> Result<Arc<dyn InferenceEngine>, ChatError> {
        self.backend.release_transient_memory();
        if self.require_accelerator && !self.backend.is_available() {
            return Err(ChatError::Load(format!(
                "an accelerator is required but none is available (device {})",
                self.backend.label()
            )));
        }

        info!(
            "Loading model {} on {}...",
            self.model_name,
            self.backend.label()
        );
        let start = Instant::now();
        let engine = self
            .loader
            .load(self.backend.device())
            .map_err(|e| ChatError::Load(e.to_string()))?;
        info!(
            "Model {} loaded in {:.2}s",
            self.model_name,
            start.elapsed().as_secs_f32()
        );
        Ok(engine)
    }

    pub fn unload_if_idle(&self, max_idle: Duration) -> bool {
        self.unload_if_idle_at(Instant::now(), max_idle)
    }

    /// Unload when the model has been unused for longer than `max_idle` as of
    /// `now`. A model still held by a generation is never unloaded here, so a
    /// later load cannot put a second instance next to it.
    pub fn unload_if_idle_at(&self, now: Instant, max_idle: Duration) -> bool {
        let engine = {
            let mut state = self.inner.lock();
            let Some(resident) = &state.engine else {
                return false;
            };
            let idle = now.saturating_duration_since(state.last_used);
            if idle <= max_idle {
                return false;
            }
            if Arc::strong_count(resident) > 1 {
                debug!(
                    "Model {} idle for {}s but still in use, keeping it",
                    self.model_name,
                    idle.as_secs()
                );
                return false;
            }
            info!(
                "Model {} idle for {}s, unloading",
                self.model_name,
                idle.as_secs()
            );
            state.engine.take()
        };
        drop(engine);
        self.backend.release_transient_memory();
        true
    }

    /// Unload regardless of idle time. Returns whether a model was resident.
    pub fn unload(&self) -> bool {
        let engine = self.inner.lock().engine.take();
        if engine.is_none() {
            return false;
        }
        info!("Unloading model {}", self.model_name);
        drop(engine);
        self.backend.release_transient_memory();
        true
    }

    pub fn release_transient_memory(&self) {
        self.backend.release_transient_memory();
    }

    /// Snapshot for the health endpoint. Does not count as use.
    pub fn health(&self) -> HealthStatus {
        HealthStatus {
            is_loaded: self.is_loaded(),
            device: self.backend.label(),
            model_name: self.model_name.clone(),
            device_available: self.backend.is_available(),
            memory: self.backend.memory_stats(),
        }
    }

    #[cfg(test)]
    fn last_used(&self) -> Instant {
        self.inner.lock().last_used
    }
}

/// Periodically unload the model once it has been idle for `max_idle`.
pub fn spawn_idle_reaper(
    manager: Arc<ModelLifecycleManager>,
    check_interval: Duration,
    max_idle: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(check_interval);
        loop {
            interval.tick().await;
            let manager = manager.clone();
            match tokio::task::spawn_blocking(move || manager.unload_if_idle(max_idle)).await {
                Ok(true) => info!("Idle model unloaded"),
                Ok(false) => {}
                Err(e) => error!("Idle unload check failed: {e}"),
            }
        }
    })
}
