//! services/api/src/adapters/sst.rs
//!
//! Speech-to-text for spoken story requests, using OpenAI's Whisper API.
//!
//! Browsers upload either a finished recording (WAV, WebM, Ogg, MP4) or raw 16-bit
//! little-endian mono PCM from an audio worklet. Raw PCM is wrapped in a WAV header
//! before upload since the API only accepts container formats.

use async_openai::{
    config::OpenAIConfig,
    error::OpenAIError,
    types::audio::{AudioInput, CreateTranscriptionRequest},
    Client,
};
use bedtales_core::ports::{PortError, PortResult};
use hound::{WavSpec, WavWriter};

use super::generator::classify_openai_error;

/// Sample rate assumed for raw PCM uploads.
pub const PCM_SAMPLE_RATE: u32 = 48_000;

/// Recognizes the container formats the transcription API accepts, by magic bytes.
fn container_file_name(audio: &[u8]) -> Option<&'static str> {
    if audio.starts_with(b"RIFF") && audio.get(8..12) == Some(b"WAVE") {
        Some("voice_prompt.wav")
    } else if audio.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
        Some("voice_prompt.webm")
    } else if audio.starts_with(b"OggS") {
        Some("voice_prompt.ogg")
    } else if audio.get(4..8) == Some(b"ftyp") {
        Some("voice_prompt.mp4")
    } else if audio.starts_with(b"ID3") {
        Some("voice_prompt.mp3")
    } else {
        None
    }
}

/// Wraps raw PCM16 mono samples in a WAV container.
pub fn pcm16_to_wav(pcm_data: &[u8], sample_rate: u32) -> Result<Vec<u8>, hound::Error> {
    let mut cursor = std::io::Cursor::new(Vec::new());
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut writer = WavWriter::new(&mut cursor, spec)?;
    for chunk in pcm_data.chunks_exact(2) {
        writer.write_sample(i16::from_le_bytes([chunk[0], chunk[1]]))?;
    }
    writer.finalize()?;
    Ok(cursor.into_inner())
}

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// Transcribes recorded speech with the configured Whisper model.
#[derive(Clone)]
pub struct OpenAiSstAdapter {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiSstAdapter {
    pub fn new(client: Client<OpenAIConfig>, model: String) -> Self {
        Self { client, model }
    }

    pub async fn transcribe(&self, audio: &[u8]) -> PortResult<String> {
        let input = match container_file_name(audio) {
            Some(name) => AudioInput::from_vec_u8(name.into(), audio.to_vec()),
            None => {
                let wav = pcm16_to_wav(audio, PCM_SAMPLE_RATE)
                    .map_err(|e| PortError::Unexpected(format!("Failed to encode WAV: {}", e)))?;
                AudioInput::from_vec_u8("voice_prompt.wav".into(), wav)
            }
        };

        let request = CreateTranscriptionRequest {
            file: input,
            model: self.model.clone(),
            ..Default::default()
        };

        let response = self
            .client
            .audio()
            .transcription()
            .create(request)
            .await
            .map_err(|e: OpenAIError| classify_openai_error(e))?;

        let text = response.text.trim().to_string();
        if text.is_empty() {
            return Err(PortError::ValidationFailed(
                "We couldn't hear a story idea in that recording. Please try again.".to_string(),
            ));
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_pcm_is_wrapped_as_wav() {
        let samples: Vec<u8> = [0i16, 1000, -1000, i16::MAX]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        assert_eq!(container_file_name(&samples), None);

        let wav = pcm16_to_wav(&samples, PCM_SAMPLE_RATE).unwrap();
        assert_eq!(container_file_name(&wav), Some("voice_prompt.wav"));

        let reader = hound::WavReader::new(std::io::Cursor::new(wav)).unwrap();
        assert_eq!(reader.spec().sample_rate, PCM_SAMPLE_RATE);
        let decoded: Vec<i16> = reader.into_samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(decoded, vec![0, 1000, -1000, i16::MAX]);
    }

    #[test]
    fn test_recognizes_browser_recordings() {
        assert_eq!(
            container_file_name(&[0x1A, 0x45, 0xDF, 0xA3, 0x01]),
            Some("voice_prompt.webm")
        );
        assert_eq!(container_file_name(b"OggS\0\0"), Some("voice_prompt.ogg"));
        assert_eq!(container_file_name(b"\0\0\0\x20ftypisom"), Some("voice_prompt.mp4"));
    }
}
