use super::{Conversation, ConversationError, Role};
use tracing::{debug, warn};

pub const START_OF_TURN: &str = "<start_of_turn>";
pub const END_OF_TURN: &str = "<end_of_turn>";
pub const EOS_TOKEN: &str = "<eos>";
pub const MODEL_TURN_MARKER: &str = "<start_of_turn>model";

/// Gemma-style turn template.
///
/// A prompt is the system turn, the history, the latest user turn and finally
/// an opened model turn for the model to complete:
///
/// ```text
/// <start_of_turn>system\n{system}<end_of_turn>\n\n
/// <start_of_turn>{role}\n{content}<end_of_turn>\n\n   (for every earlier turn)
/// <start_of_turn>user\n{latest}<end_of_turn>\n\n
/// <start_of_turn>model\n
/// ```
#[derive(Debug, Clone)]
pub struct DefaultConversation {
    system_message: String,
}

impl DefaultConversation {
    pub fn new(system_message: impl Into<String>) -> Self {
        Self {
            system_message: system_message.into(),
        }
    }

    pub fn system_message(&self) -> &str {
        &self.system_message
    }

    pub fn get_prompt(&self, conversation: &Conversation) -> Result<String, ConversationError> {
        let (latest, history) = conversation
            .messages()
            .split_last()
            .ok_or(ConversationError::Empty)?;
        if latest.role != Role::User {
            return Err(ConversationError::LastTurnNotUser);
        }

        let mut prompt = format!(
            "{START_OF_TURN}system\n{}{END_OF_TURN}\n\n",
            self.system_message
        );
        for message in history {
            prompt += &format!(
                "{START_OF_TURN}{}\n{}{END_OF_TURN}\n\n",
                message.role.as_str(),
                message.content
            );
        }
        prompt += &format!("{START_OF_TURN}user\n{}{END_OF_TURN}\n\n", latest.content);
        prompt += &format!("{MODEL_TURN_MARKER}\n");

        debug!(
            "Formatted prompt (first 100 chars): {}...",
            prompt.chars().take(100).collect::<String>()
        );
        Ok(prompt)
    }

    /// Extract the model's latest turn from decoded output.
    ///
    /// Takes the text after the last model-turn marker, cut at the next turn
    /// boundary. Without a marker the whole decoded text is returned, prompt
    /// echo included.
    pub fn parse_response(&self, generated: &str) -> String {
        match generated.rfind(MODEL_TURN_MARKER) {
            Some(index) => {
                let response = &generated[index + MODEL_TURN_MARKER.len()..];
                let end = [END_OF_TURN, EOS_TOKEN]
                    .iter()
                    .filter_map(|marker| response.find(marker))
                    .min()
                    .unwrap_or(response.len());
                response[..end].trim().to_string()
            }
            None => {
                warn!("Could not find '{MODEL_TURN_MARKER}' marker in generated text, using raw output");
                generated.to_string()
            }
        }
    }
}
