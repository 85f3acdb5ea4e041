//! services/api/src/share.rs
//!
//! Share codes: a story's text and image prompts as base64-encoded JSON. Pictures,
//! ids and timestamps are left out to keep codes short; the importer illustrates the
//! story again from its prompts.

use base64::{engine::general_purpose::STANDARD, Engine};
use bedtales_core::domain::{GeneratedStory, SavedStory, StoryLayout, StoryPart, StoryPrompt};
use bedtales_core::ports::{PortError, PortResult};
use serde::{Deserialize, Serialize};

const INVALID_CODE: &str = "The provided story code is invalid or corrupted. Please check and try again.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedPart {
    pub paragraph: String,
    pub image_prompt: String,
}

/// The decoded contents of a share code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedStory {
    pub title: String,
    pub prompt: StoryPrompt,
    /// Absent in codes from before layouts existed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout: Option<StoryLayout>,
    pub parts: Vec<SharedPart>,
}

impl SharedStory {
    /// An unillustrated story, laid out as shared or else with `fallback_layout`.
    pub fn into_story(self, fallback_layout: StoryLayout) -> GeneratedStory {
        GeneratedStory {
            title: self.title,
            parts: self
                .parts
                .into_iter()
                .map(|p| StoryPart {
                    paragraph: p.paragraph,
                    image_prompt: p.image_prompt,
                    image_url: None,
                })
                .collect(),
            prompt: self.prompt,
            layout: self.layout.unwrap_or(fallback_layout),
        }
    }
}

pub fn encode(story: &SavedStory) -> PortResult<String> {
    if story.story.parts.iter().any(|p| p.image_prompt.trim().is_empty()) {
        return Err(PortError::ValidationFailed(
            "Cannot share story: a part is missing an image prompt. This may be an older story."
                .to_string(),
        ));
    }
    let shared = SharedStory {
        title: story.story.title.clone(),
        prompt: story.story.prompt.clone(),
        layout: Some(story.story.layout),
        parts: story
            .story
            .parts
            .iter()
            .map(|p| SharedPart {
                paragraph: p.paragraph.clone(),
                image_prompt: p.image_prompt.clone(),
            })
            .collect(),
    };
    let json = serde_json::to_vec(&shared).map_err(|e| PortError::Unexpected(e.to_string()))?;
    Ok(STANDARD.encode(json))
}

/// Decodes a share code, or a share link carrying one in its `import` query parameter.
pub fn decode(input: &str) -> PortResult<SharedStory> {
    let code = code_from_link(input.trim());
    let invalid = || PortError::ValidationFailed(INVALID_CODE.to_string());

    let bytes = STANDARD.decode(code).map_err(|_| invalid())?;
    let shared: SharedStory = serde_json::from_slice(&bytes).map_err(|_| invalid())?;
    if shared.title.trim().is_empty() {
        return Err(invalid());
    }
    Ok(shared)
}

fn code_from_link(input: &str) -> &str {
    let Some((_, query)) = input.split_once('?') else {
        return input;
    };
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix("import="))
        .unwrap_or(input)
}
