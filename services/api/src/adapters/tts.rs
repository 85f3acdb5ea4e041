//! services/api/src/adapters/tts.rs
//!
//! Story narration with OpenAI's Text-to-Speech API. Audio is requested as raw PCM and
//! wrapped in a WAV container here so it plays anywhere without a decoder.

use async_openai::{
    config::OpenAIConfig,
    error::OpenAIError,
    types::audio::{CreateSpeechRequest, SpeechModel, SpeechResponseFormat, Voice},
    Client,
};
use bedtales_core::ports::{PortError, PortResult};

use super::generator::classify_openai_error;
use super::sst::pcm16_to_wav;

/// Sample rate of the API's `pcm` response format.
const TTS_SAMPLE_RATE: u32 = 24_000;

/// The narration voices offered in the app.
pub const VOICES: [&str; 6] = ["alloy", "echo", "fable", "onyx", "nova", "shimmer"];

fn voice_for(voice_id: &str) -> PortResult<Voice> {
    match voice_id.to_ascii_lowercase().as_str() {
        "alloy" => Ok(Voice::Alloy),
        "echo" => Ok(Voice::Echo),
        "fable" => Ok(Voice::Fable),
        "onyx" => Ok(Voice::Onyx),
        "nova" => Ok(Voice::Nova),
        "shimmer" => Ok(Voice::Shimmer),
        other => Err(PortError::ValidationFailed(format!(
            "'{}' is not a narration voice. Choose one of: {}.",
            other,
            VOICES.join(", ")
        ))),
    }
}

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

#[derive(Clone)]
pub struct OpenAiTtsAdapter {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiTtsAdapter {
    pub fn new(client: Client<OpenAIConfig>, model: String) -> Self {
        Self { client, model }
    }

    /// Narrates `text` in the given voice and returns a WAV file.
    pub async fn speak(&self, text: &str, voice_id: &str) -> PortResult<Vec<u8>> {
        let request = CreateSpeechRequest {
            model: SpeechModel::Other(self.model.clone()),
            input: text.to_string(),
            voice: voice_for(voice_id)?,
            response_format: Some(SpeechResponseFormat::Pcm),
            ..Default::default()
        };

        let response = self
            .client
            .audio()
            .speech()
            .create(request)
            .await
            .map_err(|e: OpenAIError| classify_openai_error(e))?;

        pcm16_to_wav(&response.bytes, TTS_SAMPLE_RATE)
            .map_err(|e| PortError::Unexpected(format!("Failed to encode WAV: {}", e)))
    }
}
