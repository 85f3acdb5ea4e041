//! services/api/src/adapters/generator.rs
//!
//! The `StoryGenerator` port implemented by composing the per-capability OpenAI
//! adapters, plus the classification of provider errors into generation error kinds.

use async_openai::{config::OpenAIConfig, error::OpenAIError, Client};
use async_trait::async_trait;
use bedtales_core::domain::{AspectRatio, StoryPart, StoryPrompt};
use bedtales_core::ports::{GenerationErrorKind, PortError, PortResult, StoryGenerator};
use tracing::{info, warn};

use super::images::OpenAiIllustrator;
use super::sst::OpenAiSstAdapter;
use super::story_llm::OpenAiStoryWriter;
use super::tts::OpenAiTtsAdapter;
use crate::config::Config;

/// Sorts a provider error message into a generation error kind.
pub fn classify_message(message: &str) -> GenerationErrorKind {
    let lowered = message.to_lowercase();
    if ["quota", "rate limit", "rate_limit", "too many requests", "billing"]
        .iter()
        .any(|needle| lowered.contains(needle))
    {
        GenerationErrorKind::QuotaExceeded
    } else if ["safety", "content_policy", "content policy", "moderation"]
        .iter()
        .any(|needle| lowered.contains(needle))
    {
        GenerationErrorKind::SafetyFiltered
    } else if ["deserialize", "json", "invalid response"]
        .iter()
        .any(|needle| lowered.contains(needle))
    {
        GenerationErrorKind::MalformedResponse
    } else {
        GenerationErrorKind::Network
    }
}

pub fn classify_openai_error(e: OpenAIError) -> PortError {
    let message = e.to_string();
    let kind = classify_message(&message);
    warn!("OpenAI request failed ({:?}): {}", kind, message);
    PortError::generation(kind, message)
}

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// Generates stories, pictures and audio with OpenAI models.
#[derive(Clone)]
pub struct OpenAiStoryGenerator {
    writer: OpenAiStoryWriter,
    illustrator: OpenAiIllustrator,
    sst: OpenAiSstAdapter,
    tts: OpenAiTtsAdapter,
}

impl OpenAiStoryGenerator {
    pub fn new(client: Client<OpenAIConfig>, config: &Config) -> Self {
        Self {
            writer: OpenAiStoryWriter::new(client.clone(), config.story_model.clone()),
            illustrator: OpenAiIllustrator::new(client.clone(), config.image_model.clone()),
            sst: OpenAiSstAdapter::new(client.clone(), config.sst_model.clone()),
            tts: OpenAiTtsAdapter::new(client, config.tts_model.clone()),
        }
    }
}

//=========================================================================================
// `StoryGenerator` Trait Implementation
//=========================================================================================

#[async_trait]
impl StoryGenerator for OpenAiStoryGenerator {
    async fn generate_ideas(&self, category: Option<&str>) -> PortResult<StoryPrompt> {
        self.writer.ideas(category).await
    }

    async fn generate_title(&self, prompt: &StoryPrompt) -> PortResult<String> {
        self.writer.title(prompt).await
    }

    async fn generate_story_parts(
        &self,
        prompt: &StoryPrompt,
        aspect_ratio: AspectRatio,
        reference_image: Option<&str>,
    ) -> PortResult<Vec<StoryPart>> {
        self.writer.parts(prompt, aspect_ratio, reference_image).await
    }

    async fn generate_illustration(
        &self,
        image_prompt: &str,
        aspect_ratio: AspectRatio,
    ) -> PortResult<String> {
        self.illustrator.illustrate(image_prompt, aspect_ratio).await
    }

    async fn generate_character_portrait(&self, description: &str) -> PortResult<String> {
        self.illustrator.portrait(description).await
    }

    async fn transcribe_voice_to_prompt(&self, audio: &[u8]) -> PortResult<StoryPrompt> {
        let transcript = self.sst.transcribe(audio).await?;
        info!("Voice prompt transcribed ({} chars)", transcript.len());
        self.writer.prompt_from_transcript(&transcript).await
    }

    async fn synthesize_speech(&self, text: &str, voice_id: &str) -> PortResult<Vec<u8>> {
        self.tts.speak(text, voice_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_provider_messages() {
        assert_eq!(
            classify_message("Rate limit reached for gpt-4o-mini"),
            GenerationErrorKind::QuotaExceeded
        );
        assert_eq!(
            classify_message("You exceeded your current quota, please check your plan"),
            GenerationErrorKind::QuotaExceeded
        );
        assert_eq!(
            classify_message("Your request was rejected as a result of our safety system"),
            GenerationErrorKind::SafetyFiltered
        );
        assert_eq!(
            classify_message("failed to deserialize api response: missing field `choices`"),
            GenerationErrorKind::MalformedResponse
        );
        assert_eq!(
            classify_message("http error: error sending request"),
            GenerationErrorKind::Network
        );
    }
}
