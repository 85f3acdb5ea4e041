//! crates/bedtales_core/src/ports.rs
//!
//! Defines the service contracts (traits) for the application's core logic.
//! These traits form the boundary of the hexagonal architecture, allowing the core
//! to be independent of the storage engine, the cache medium, and the AI provider.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{ActionType, AspectRatio, StoryPart, StoryPrompt};
use crate::store::StoreName;

//=========================================================================================
// Generic Port Error and Result Types
//=========================================================================================

/// Why a call to the story generator failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationErrorKind {
    QuotaExceeded,
    SafetyFiltered,
    MalformedResponse,
    Network,
}

/// The error type for all port operations.
#[derive(Debug, thiserror::Error)]
pub enum PortError {
    /// The storage engine could not be opened.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),
    /// A specific read, write or delete failed.
    #[error("Transaction failed: {0}")]
    TransactionFailed(String),
    /// Input was rejected before reaching the store.
    #[error("Validation failed: {0}")]
    ValidationFailed(String),
    /// The daily quota for an action is used up.
    #[error("Daily limit reached for {0}")]
    QuotaExceeded(ActionType),
    #[error("Generation failed ({kind:?}): {message}")]
    Generation {
        kind: GenerationErrorKind,
        message: String,
    },
    #[error("Item not found: {0}")]
    NotFound(String),
    #[error("An unexpected error occurred: {0}")]
    Unexpected(String),
}

impl PortError {
    pub fn generation(kind: GenerationErrorKind, message: impl Into<String>) -> Self {
        PortError::Generation {
            kind,
            message: message.into(),
        }
    }

    /// The text shown to the user. Every retry is manual, so the wording says what to
    /// do next rather than what went wrong internally.
    pub fn user_message(&self) -> String {
        match self {
            PortError::StorageUnavailable(_) => {
                "Your library could not be opened. Please reload and try again.".to_string()
            }
            PortError::TransactionFailed(_) => {
                "Saving your changes failed. Please try again.".to_string()
            }
            PortError::ValidationFailed(reason) => reason.clone(),
            PortError::QuotaExceeded(ActionType::CreateStory) => {
                "You've used all of today's story generations. Come back tomorrow for more!"
                    .to_string()
            }
            PortError::QuotaExceeded(ActionType::CreateCharacter) => {
                "You've used all of today's character portraits. Come back tomorrow for more!"
                    .to_string()
            }
            PortError::Generation { kind, .. } => match kind {
                GenerationErrorKind::QuotaExceeded => "The AI storyteller is resting! We've exceeded our generation quota. Please wait a moment and try again.".to_string(),
                GenerationErrorKind::SafetyFiltered => "The AI couldn't proceed due to safety filters. Please try adjusting your prompt.".to_string(),
                GenerationErrorKind::MalformedResponse => "The AI's response was not in the expected format. Please try again.".to_string(),
                GenerationErrorKind::Network => "The AI might be busy or there was a network issue. Please try again.".to_string(),
            },
            PortError::NotFound(what) => format!("{} could not be found.", what),
            PortError::Unexpected(_) => "An unexpected error occurred. Please try again.".to_string(),
        }
    }
}

/// A convenience type alias for `Result<T, PortError>`.
pub type PortResult<T> = Result<T, PortError>;

//=========================================================================================
// Storage Ports
//=========================================================================================

/// The durable, versioned document store partitioned into named collections.
///
/// Records travel as JSON documents keyed by their `id`. Typed access lives in
/// [`crate::store`]. Implementations open lazily on first use and run any pending
/// schema migration before serving a read or write.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Every record in the collection, in no particular order.
    async fn get_all(&self, store: StoreName) -> PortResult<Vec<serde_json::Value>>;

    /// Insert or replace one record.
    async fn put(&self, store: StoreName, id: &str, value: serde_json::Value) -> PortResult<()>;

    /// Remove one record. Missing ids are not an error.
    async fn delete(&self, store: StoreName, id: &str) -> PortResult<()>;

    /// Remove every listed id in a single transaction.
    async fn delete_many(&self, store: StoreName, ids: &[String]) -> PortResult<()>;

    async fn clear(&self, store: StoreName) -> PortResult<()>;

    /// Insert or replace many records in a single transaction. Input is assumed valid.
    async fn bulk_put(
        &self,
        store: StoreName,
        items: Vec<(String, serde_json::Value)>,
    ) -> PortResult<()>;
}

/// A fast, synchronous string cache (one serialized blob per key).
pub trait KeyValueCache: Send + Sync {
    fn get(&self, key: &str) -> PortResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> PortResult<()>;
}

/// Source of the current time, so day boundaries can be tested.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

//=========================================================================================
// Generation Port
//=========================================================================================

/// The generative AI backend. Every call may fail with `PortError::Generation`.
#[async_trait]
pub trait StoryGenerator: Send + Sync {
    /// Brainstorms a full prompt, optionally within a category.
    async fn generate_ideas(&self, category: Option<&str>) -> PortResult<StoryPrompt>;

    async fn generate_title(&self, prompt: &StoryPrompt) -> PortResult<String>;

    /// Writes the story text. Returned parts carry image prompts but no images.
    async fn generate_story_parts(
        &self,
        prompt: &StoryPrompt,
        aspect_ratio: AspectRatio,
        reference_image: Option<&str>,
    ) -> PortResult<Vec<StoryPart>>;

    /// Returns an image `data:` URI.
    async fn generate_illustration(
        &self,
        image_prompt: &str,
        aspect_ratio: AspectRatio,
    ) -> PortResult<String>;

    /// Returns a square image `data:` URI.
    async fn generate_character_portrait(&self, description: &str) -> PortResult<String>;

    async fn transcribe_voice_to_prompt(&self, audio: &[u8]) -> PortResult<StoryPrompt>;

    /// Returns playable audio bytes.
    async fn synthesize_speech(&self, text: &str, voice_id: &str) -> PortResult<Vec<u8>>;
}
