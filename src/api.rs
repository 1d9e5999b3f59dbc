use crate::backend::{CandleBackend, DeviceBackend};
use crate::config::ServerConfig;
use crate::openai::conversation::default_conversation::DefaultConversation;
use crate::openai::pipelines::generation::GenerationPipeline;
use crate::openai::pipelines::pipeline::DefaultLoader;
use crate::openai::pipelines::ModelLoader;
use crate::openai::responses::GenerationOutcome;
use crate::state::abort::AbortSignal;
use crate::state::model_manager::{spawn_idle_reaper, HealthStatus, ModelLifecycleManager};
use crate::state::request_registry::RequestRegistry;
use crate::state::sessions::SessionStore;
use crate::state::shutdown::ShutdownCoordinator;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, info_span};
use uuid::Uuid;

#[derive(thiserror::Error, Debug)]
pub enum ChatError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("failed to load model: {0}")]
    Load(String),
    #[error("{0}")]
    Format(String),
    #[error("generation failed: {0}")]
    Generation(#[from] candle_core::Error),
    #[error("generation worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

/// Everything a running chat server shares between requests.
///
/// Cloning is cheap; all state lives behind `Arc`s. The lifecycle manager is
/// created here exactly once and handed to the pipeline and the idle reaper.
#[derive(Clone)]
pub struct ChatService {
    registry: RequestRegistry,
    manager: Arc<ModelLifecycleManager>,
    pipeline: GenerationPipeline,
    sessions: SessionStore,
    shutdown: ShutdownCoordinator,
    idle_unload: Duration,
    idle_check: Duration,
}

impl ChatService {
    /// Build the service for a real device and the candle model loader.
    ///
    /// A missing hub token does not fail startup: the service comes up in
    /// configuration-error mode, answers health checks and rejects chats.
    pub fn from_config(config: &ServerConfig) -> Result<Self, ChatError> {
        if let Err(errors) = config.validate() {
            for e in &errors {
                error!("Invalid configuration: {e}");
            }
            return Err(ChatError::Configuration(errors.join("; ")));
        }

        let device = crate::new_device(config.device_ordinal, config.cpu)
            .map_err(|e| ChatError::Configuration(e.to_string()))?;
        let backend: Arc<dyn DeviceBackend> = Arc::new(CandleBackend::new(device));
        let loader = DefaultLoader::new(config.model_id.clone(), config.weight_path.clone())
            .with_revision(config.revision.clone())
            .with_dtype(config.dtype.clone());

        let manager = match config.resolve_hf_token() {
            Ok(token) => ModelLifecycleManager::new(Box::new(loader.with_token(token)), backend),
            Err(reason) => ModelLifecycleManager::unavailable(reason, Box::new(loader), backend),
        };
        let manager = manager.with_require_accelerator(config.require_accelerator);
        Ok(Self::with_manager(Arc::new(manager), config))
    }

    /// Build the service around any loader and device backend.
    pub fn with_loader(
        loader: Box<dyn ModelLoader>,
        backend: Arc<dyn DeviceBackend>,
        config: &ServerConfig,
    ) -> Self {
        let manager = ModelLifecycleManager::new(loader, backend)
            .with_require_accelerator(config.require_accelerator);
        Self::with_manager(Arc::new(manager), config)
    }

    pub fn with_manager(manager: Arc<ModelLifecycleManager>, config: &ServerConfig) -> Self {
        let registry = RequestRegistry::new();
        let pipeline = GenerationPipeline::new(
            manager.clone(),
            DefaultConversation::new(config.system_prompt.clone()),
            config.sampling.clone(),
        );
        Self {
            shutdown: ShutdownCoordinator::new(registry.clone()),
            registry,
            manager,
            pipeline,
            sessions: SessionStore::new(config.max_history_turns).with_limits(
                config.max_sessions,
                Duration::from_secs(config.session_ttl_secs),
            ),
            idle_unload: Duration::from_secs(config.idle_unload_secs),
            idle_check: Duration::from_secs(config.idle_check_secs),
        }
    }

    pub fn registry(&self) -> &RequestRegistry {
        &self.registry
    }

    pub fn manager(&self) -> &Arc<ModelLifecycleManager> {
        &self.manager
    }

    pub fn pipeline(&self) -> &GenerationPipeline {
        &self.pipeline
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn shutdown(&self) -> &ShutdownCoordinator {
        &self.shutdown
    }

    pub fn health(&self) -> HealthStatus {
        self.manager.health()
    }

    pub fn spawn_idle_reaper(&self) -> tokio::task::JoinHandle<()> {
        info!(
            "Idle unload after {}s, checked every {}s",
            self.idle_unload.as_secs(),
            self.idle_check.as_secs()
        );
        spawn_idle_reaper(self.manager.clone(), self.idle_check, self.idle_unload)
    }

    /// Run one chat turn for `session_id`.
    ///
    /// The request is registered for its whole lifetime. If the returned
    /// future is dropped before completion (client went away) the request's
    /// signal is raised and generation stops at its next checkpoint. Only a
    /// successful turn is written to the session.
    pub async fn chat(&self, session_id: &str, message: String) -> Result<GenerationOutcome, ChatError> {
        let request_id = Uuid::new_v4().to_string();
        let signal = Arc::new(AbortSignal::new());
        let request = self.registry.track(request_id.clone(), signal.clone());
        let conversation = self.sessions.begin_turn(session_id, &message);

        let pipeline = self.pipeline.clone();
        let span = info_span!("chat", request_id = %request_id);
        let result = tokio::task::spawn_blocking(move || {
            let _enter = span.enter();
            pipeline.generate(&conversation, &signal)
        })
        .await;
        request.finish();

        match result {
            Ok(outcome) => {
                let reply = match &outcome {
                    GenerationOutcome::Success { response } => Some(response.clone()),
                    _ => None,
                };
                self.sessions.end_turn(session_id, message, reply);
                Ok(outcome)
            }
            Err(e) => {
                error!("Error processing request {request_id}: {e}");
                Err(ChatError::from(e))
            }
        }
    }
}
