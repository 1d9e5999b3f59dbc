use crate::api::ChatError;
use crate::openai::conversation::default_conversation::DefaultConversation;
use crate::openai::conversation::{Conversation, ConversationError};
use crate::openai::responses::GenerationOutcome;
use crate::openai::sampling_params::SamplingConfig;
use crate::state::abort::AbortSignal;
use crate::state::model_manager::ModelLifecycleManager;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

pub const ABORTED_BEFORE_LOAD: &str = "Request aborted";
pub const ABORTED_DURING_PROCESSING: &str = "Request aborted during processing";
pub const LOAD_FAILED: &str = "Failed to load the model";
pub const GENERATION_FAILED: &str = "An internal error occurred during generation.";

/// Releases scratch device memory when a generation call ends, whichever way
/// it ends.
struct ReleaseOnDrop<'a> {
    manager: &'a ModelLifecycleManager,
}

impl Drop for ReleaseOnDrop<'_> {
    fn drop(&mut self) {
        self.manager.release_transient_memory();
    }
}

/// Runs one chat turn against the shared model.
///
/// The model call itself cannot be interrupted, so the abort signal is only
/// polled between phases: after formatting, after the engine is acquired,
/// after tokenizing and after generating. A signal raised mid-generation is
/// observed once generation returns and its output is discarded.
#[derive(Clone)]
pub struct GenerationPipeline {
    manager: Arc<ModelLifecycleManager>,
    template: DefaultConversation,
    sampling: SamplingConfig,
}

impl GenerationPipeline {
    pub fn new(
        manager: Arc<ModelLifecycleManager>,
        template: DefaultConversation,
        sampling: SamplingConfig,
    ) -> Self {
        Self {
            manager,
            template,
            sampling,
        }
    }

    pub fn manager(&self) -> &Arc<ModelLifecycleManager> {
        &self.manager
    }

    pub fn sampling(&self) -> &SamplingConfig {
        &self.sampling
    }

    pub fn generate(&self, conversation: &Conversation, signal: &AbortSignal) -> GenerationOutcome {
        let _release = ReleaseOnDrop {
            manager: &self.manager,
        };

        let prompt = match self.template.get_prompt(conversation) {
            Ok(prompt) => prompt,
            Err(e) => {
                error!("Error formatting prompt: {e}");
                return GenerationOutcome::error(&ChatError::from(e).to_string());
            }
        };
        self.manager.touch();

        if signal.is_set() {
            info!("Request aborted before model load check.");
            return GenerationOutcome::aborted(ABORTED_BEFORE_LOAD);
        }

        let Some(engine) = self.manager.acquire() else {
            error!("Failed to load model for generation.");
            return GenerationOutcome::error(LOAD_FAILED);
        };

        if signal.is_set() {
            info!("Request aborted before tokenization.");
            return GenerationOutcome::aborted(ABORTED_DURING_PROCESSING);
        }

        let run = || -> Result<Option<String>, ChatError> {
            debug!("Tokenizing prompt...");
            let tokens = engine.tokenize(&prompt)?;

            if signal.is_set() {
                info!("Request aborted before model generation.");
                return Ok(None);
            }

            info!(
                "Generating response with max_new_tokens={} ({} prompt tokens)...",
                self.sampling.max_new_tokens,
                tokens.len()
            );
            let start = Instant::now();
            let output = engine.generate(&tokens, &self.sampling)?;
            info!(
                "Generation complete in {:.2}s.",
                start.elapsed().as_secs_f32()
            );

            if signal.is_set() {
                info!("Request aborted before decoding.");
                return Ok(None);
            }

            let generated = engine.decode(&output)?;
            debug!(
                "Raw generated text (first 200 chars): {}...",
                generated.chars().take(200).collect::<String>()
            );
            Ok(Some(self.template.parse_response(&generated)))
        };

        match run() {
            Ok(Some(response)) => GenerationOutcome::Success { response },
            Ok(None) => GenerationOutcome::aborted(ABORTED_DURING_PROCESSING),
            Err(e) => {
                error!("Error during generation: {e}");
                GenerationOutcome::error(GENERATION_FAILED)
            }
        }
    }
}

impl From<ConversationError> for ChatError {
    fn from(e: ConversationError) -> Self {
        match e {
            ConversationError::Empty => {
                ChatError::Format("Cannot generate response from empty conversation.".to_string())
            }
            ConversationError::LastTurnNotUser => {
                ChatError::Format("Failed to format conversation prompt.".to_string())
            }
        }
    }
}
