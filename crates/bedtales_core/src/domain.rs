//! crates/bedtales_core/src/domain.rs
//!
//! Defines the pure, core data structures for the application.
//! Field names serialize in camelCase so persisted rows and backup files keep the
//! same shape as the browser client's documents.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

//=========================================================================================
// Story Values
//=========================================================================================

/// The four free-text fields a story is generated from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoryPrompt {
    pub character: String,
    pub setting: String,
    pub plot: String,
    pub concept: String,
}

/// One paragraph of a story and its illustration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryPart {
    pub paragraph: String,
    pub image_prompt: String,
    /// A `data:` URI. Absent for parts kept without an illustration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

/// How the reader lays out text and illustrations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StoryLayout {
    #[default]
    Classic,
    Cinematic,
    Portrait,
    FullPage,
}

impl StoryLayout {
    /// The illustration aspect ratio requested from the generator for this layout.
    pub fn aspect_ratio(self) -> AspectRatio {
        match self {
            StoryLayout::Classic => AspectRatio::Square,
            StoryLayout::Cinematic => AspectRatio::Wide,
            StoryLayout::Portrait | StoryLayout::FullPage => AspectRatio::Tall,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AspectRatio {
    Square,
    Wide,
    Tall,
}

impl AspectRatio {
    pub fn as_str(self) -> &'static str {
        match self {
            AspectRatio::Square => "1:1",
            AspectRatio::Wide => "16:9",
            AspectRatio::Tall => "3:4",
        }
    }
}

/// A freshly generated story. Never persisted on its own; saved stories and
/// history items copy from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedStory {
    pub title: String,
    pub parts: Vec<StoryPart>,
    pub prompt: StoryPrompt,
    #[serde(default)]
    pub layout: StoryLayout,
}

/// The identity used for dedup: two stories with the same title and plot are the
/// same story regardless of their ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NaturalKey<'a> {
    pub title: &'a str,
    pub plot: &'a str,
}

impl GeneratedStory {
    pub fn natural_key(&self) -> NaturalKey<'_> {
        NaturalKey {
            title: &self.title,
            plot: &self.prompt.plot,
        }
    }

    /// The first illustration, used as a derived character's portrait.
    pub fn cover_image(&self) -> Option<&str> {
        self.parts.first().and_then(|p| p.image_url.as_deref())
    }

    /// The full narration text, paragraphs separated by blank lines.
    pub fn narration_text(&self) -> String {
        self.parts
            .iter()
            .map(|p| p.paragraph.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

//=========================================================================================
// Persisted Entities
//=========================================================================================

/// Cached narration audio for a saved story.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryAudio {
    pub voice_id: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// A story the user explicitly saved to their library.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedStory {
    pub id: String,
    #[serde(flatten)]
    pub story: GeneratedStory,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_favorite: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<StoryAudio>,
}

/// A story the user has read but not saved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryItem {
    pub id: String,
    #[serde(flatten)]
    pub story: GeneratedStory,
    pub read_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Character {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    // Rows written before characters carried a timestamp load as the epoch.
    #[serde(default)]
    pub created_at: DateTime<Utc>,
}

/// A generic key/value settings row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppSetting {
    pub id: String,
    pub value: serde_json::Value,
}

/// Daily usage counter for one rate-limited action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiUsage {
    pub id: ActionType,
    pub count: u32,
    /// Calendar day (`YYYY-MM-DD`, UTC) the count belongs to.
    pub last_reset: String,
}

//=========================================================================================
// Rate Limiting and Settings Vocabulary
//=========================================================================================

/// The expensive actions guarded by a daily quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActionType {
    CreateStory,
    CreateCharacter,
}

impl ActionType {
    pub const ALL: [ActionType; 2] = [ActionType::CreateStory, ActionType::CreateCharacter];

    pub fn as_str(self) -> &'static str {
        match self {
            ActionType::CreateStory => "createStory",
            ActionType::CreateCharacter => "createCharacter",
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How long read-but-unsaved stories stay in history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum HistoryRetention {
    #[serde(rename = "3d")]
    ThreeDays,
    #[default]
    #[serde(rename = "7d")]
    SevenDays,
    #[serde(rename = "30d")]
    ThirtyDays,
    #[serde(rename = "never")]
    Never,
}

impl HistoryRetention {
    /// The age at which a history item is swept, or `None` when history is kept forever.
    pub fn max_age(self) -> Option<Duration> {
        match self {
            HistoryRetention::ThreeDays => Some(Duration::days(3)),
            HistoryRetention::SevenDays => Some(Duration::days(7)),
            HistoryRetention::ThirtyDays => Some(Duration::days(30)),
            HistoryRetention::Never => None,
        }
    }
}

//=========================================================================================
// Bulk Operation Payloads and Outcomes
//=========================================================================================

/// The backup file: every collection except usage counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupDocument {
    pub stories: Vec<SavedStory>,
    pub history: Vec<HistoryItem>,
    pub characters: Vec<Character>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub settings: Vec<AppSetting>,
}

/// Per-outcome counts from a bulk story import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub imported: usize,
    pub duplicates: usize,
    pub invalid: usize,
}

/// Per-collection counts from a backup restore.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RestoreSummary {
    pub stories: usize,
    pub history: usize,
    pub characters: usize,
    pub settings: usize,
    /// Records skipped because another id already holds their title and plot.
    pub duplicates: usize,
    pub invalid: usize,
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
