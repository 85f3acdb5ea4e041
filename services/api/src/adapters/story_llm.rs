//! services/api/src/adapters/story_llm.rs
//!
//! The text side of story generation: ideas, titles, the illustrated-paragraph plan and
//! turning a spoken request into a structured prompt. Replies are requested as JSON and
//! parsed here; anything that does not parse is a malformed response.

const STORYTELLER_INSTRUCTIONS: &str = r#"You are a gentle storyteller writing bedtime stories for young children.
Stories are calm, magical and end happily or peacefully. They subtly teach the moral or concept they are given.
Never include frightening, violent or unsafe content.
Always reply with a single JSON object and nothing else."#;

const IDEAS_TEMPLATE: &str = r#"Generate a creative and whimsical bedtime story idea for a child.{category}
Provide a main character, a setting, a plot, and a moral or concept. The ideas should be unique and imaginative.

Reply with JSON of exactly this shape:
{"character": "...", "setting": "...", "plot": "...", "concept": "..."}

Examples of the level of detail:
- character: "A curious gnome with a lantern that glows with captured moonlight"
- setting: "An ancient library where books whisper secrets to each other"
- plot: "Is searching for a lost lullaby that can put the grumpy moon to sleep"
- concept: "The magic of listening to others""#;

const STORY_TEMPLATE: &str = r#"Create a short bedtime story for a child.
- Main Character: {character}
- Setting: {setting}
- Plot: {plot}
- Moral/Concept to convey: {concept}

Break it into exactly 3 paragraphs of about 50-100 words each. For each paragraph write a detailed
prompt for an image model describing the scene, characters and actions in a visually rich way.
Style: whimsical, dreamy, digital art, children's book illustration. Composition: {aspect} aspect ratio.{reference}

Reply with JSON of exactly this shape:
{"story": [{"paragraph": "...", "imagePrompt": "..."}]}"#;

const TITLE_TEMPLATE: &str = r#"Write a creative and catchy title, under 10 words, for a bedtime story with:
- Main Character: {character}
- Setting: {setting}
- Plot: {plot}
- Moral/Concept: {concept}

Reply with JSON of exactly this shape:
{"title": "..."}"#;

const VOICE_PROMPT_TEMPLATE: &str = r#"A child or parent described the bedtime story they want out loud. The transcript is below.
Fill in the four parts of a story idea from it. Keep their words where you can and invent
gentle details only for parts they did not mention.

TRANSCRIPT:
{transcript}

Reply with JSON of exactly this shape:
{"character": "...", "setting": "...", "plot": "...", "concept": "..."}"#;

use async_openai::{
    config::OpenAIConfig,
    types::chat::{
        ChatCompletionRequestMessage, ChatCompletionRequestMessageContentPartImage,
        ChatCompletionRequestMessageContentPartText, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, ChatCompletionRequestUserMessageContent,
        ChatCompletionRequestUserMessageContentPart, CreateChatCompletionRequestArgs, ImageUrl,
    },
    Client,
};
use bedtales_core::domain::{AspectRatio, StoryPart, StoryPrompt};
use bedtales_core::ports::{GenerationErrorKind, PortError, PortResult};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use super::generator::classify_openai_error;

#[derive(Deserialize)]
struct TitleReply {
    title: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PartReply {
    paragraph: String,
    image_prompt: String,
}

#[derive(Debug, Deserialize)]
struct StoryReply {
    story: Vec<PartReply>,
}

fn malformed(detail: impl Into<String>) -> PortError {
    PortError::generation(GenerationErrorKind::MalformedResponse, detail)
}

/// Removes a surrounding ```json fence if the model added one.
fn strip_code_fence(reply: &str) -> &str {
    let trimmed = reply.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

fn parse_reply<T: DeserializeOwned>(reply: &str) -> PortResult<T> {
    serde_json::from_str(strip_code_fence(reply))
        .map_err(|e| malformed(format!("unexpected reply shape: {}", e)))
}

fn fill_prompt(template: &str, prompt: &StoryPrompt) -> String {
    template
        .replace("{character}", &prompt.character)
        .replace("{setting}", &prompt.setting)
        .replace("{plot}", &prompt.plot)
        .replace("{concept}", &prompt.concept)
}

fn parts_from(reply: StoryReply) -> PortResult<Vec<StoryPart>> {
    if reply.story.is_empty() {
        return Err(malformed("the story has no paragraphs"));
    }
    Ok(reply
        .story
        .into_iter()
        .map(|p| StoryPart {
            paragraph: p.paragraph,
            image_prompt: p.image_prompt,
            image_url: None,
        })
        .collect())
}

fn non_blank_prompt(prompt: StoryPrompt) -> PortResult<StoryPrompt> {
    let fields = [&prompt.character, &prompt.setting, &prompt.plot, &prompt.concept];
    if fields.iter().any(|f| f.trim().is_empty()) {
        return Err(malformed("the idea is missing a part"));
    }
    Ok(prompt)
}

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// Writes story text with an OpenAI chat model.
#[derive(Clone)]
pub struct OpenAiStoryWriter {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiStoryWriter {
    pub fn new(client: Client<OpenAIConfig>, model: String) -> Self {
        Self { client, model }
    }

    async fn complete(&self, user: ChatCompletionRequestUserMessageContent) -> PortResult<String> {
        let messages: Vec<ChatCompletionRequestMessage> = vec![
            ChatCompletionRequestSystemMessageArgs::default()
                .content(STORYTELLER_INSTRUCTIONS)
                .build()
                .map_err(|e| PortError::Unexpected(e.to_string()))?
                .into(),
            ChatCompletionRequestUserMessageArgs::default()
                .content(user)
                .build()
                .map_err(|e| PortError::Unexpected(e.to_string()))?
                .into(),
        ];

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(messages)
            .n(1)
            .temperature(0.9)
            .build()
            .map_err(|e| PortError::Unexpected(e.to_string()))?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(classify_openai_error)?;

        response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| malformed("the reply contained no text"))
    }

    async fn complete_text(&self, text: String) -> PortResult<String> {
        self.complete(ChatCompletionRequestUserMessageContent::Text(text))
            .await
    }

    pub async fn ideas(&self, category: Option<&str>) -> PortResult<StoryPrompt> {
        let category = category
            .map(|c| format!(" The story should be about: {}.", c.trim()))
            .unwrap_or_default();
        let reply = self
            .complete_text(IDEAS_TEMPLATE.replace("{category}", &category))
            .await?;
        non_blank_prompt(parse_reply(&reply)?)
    }

    pub async fn title(&self, prompt: &StoryPrompt) -> PortResult<String> {
        let reply = self.complete_text(fill_prompt(TITLE_TEMPLATE, prompt)).await?;
        let TitleReply { title } = parse_reply(&reply)?;
        let title = title.trim().trim_matches('"').to_string();
        if title.is_empty() {
            return Err(malformed("the title was empty"));
        }
        Ok(title)
    }

    /// Plans the paragraphs and their image prompts. With a reference image the model
    /// sees it and is asked to keep the character's look consistent.
    pub async fn parts(
        &self,
        prompt: &StoryPrompt,
        aspect_ratio: AspectRatio,
        reference_image: Option<&str>,
    ) -> PortResult<Vec<StoryPart>> {
        let reference_note = if reference_image.is_some() {
            "\nThe attached image shows the main character. Describe them the same way in every image prompt."
        } else {
            ""
        };
        let text = fill_prompt(STORY_TEMPLATE, prompt)
            .replace("{aspect}", aspect_ratio.as_str())
            .replace("{reference}", reference_note);

        let content = match reference_image {
            Some(url) => ChatCompletionRequestUserMessageContent::Array(vec![
                ChatCompletionRequestUserMessageContentPart::Text(
                    ChatCompletionRequestMessageContentPartText { text },
                ),
                ChatCompletionRequestUserMessageContentPart::ImageUrl(
                    ChatCompletionRequestMessageContentPartImage {
                        image_url: ImageUrl {
                            url: url.to_string(),
                            detail: None,
                        },
                    },
                ),
            ]),
            None => ChatCompletionRequestUserMessageContent::Text(text),
        };

        let reply = self.complete(content).await?;
        let parts = parts_from(parse_reply(&reply)?)?;
        debug!("Story plan has {} parts", parts.len());
        Ok(parts)
    }

    /// Structures a transcript of a spoken request into a story prompt.
    pub async fn prompt_from_transcript(&self, transcript: &str) -> PortResult<StoryPrompt> {
        let reply = self
            .complete_text(VOICE_PROMPT_TEMPLATE.replace("{transcript}", transcript))
            .await?;
        non_blank_prompt(parse_reply(&reply)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_code_fence() {
        assert_eq!(strip_code_fence("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fence("```\n{}\n```"), "{}");
        assert_eq!(strip_code_fence("  {\"a\":1} "), "{\"a\":1}");
    }

    #[test]
    fn test_story_reply_becomes_unillustrated_parts() {
        let reply: StoryReply = parse_reply(
            r#"```json
            {"story": [{"paragraph": "Ren woke.", "imagePrompt": "a fox yawning"},
                       {"paragraph": "Ren read.", "imagePrompt": "a fox with a book"}]}
            ```"#,
        )
        .unwrap();

        let parts = parts_from(reply).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1].image_prompt, "a fox with a book");
        assert!(parts.iter().all(|p| p.image_url.is_none()));
    }

    #[test]
    fn test_empty_or_misshapen_story_is_malformed() {
        let empty = parts_from(parse_reply(r#"{"story": []}"#).unwrap()).unwrap_err();
        assert!(matches!(
            empty,
            PortError::Generation { kind: GenerationErrorKind::MalformedResponse, .. }
        ));

        let wrong = parse_reply::<StoryReply>(r#"{"title": "no story here"}"#).unwrap_err();
        assert!(matches!(
            wrong,
            PortError::Generation { kind: GenerationErrorKind::MalformedResponse, .. }
        ));
    }

    #[test]
    fn test_idea_with_blank_field_is_rejected() {
        let idea: StoryPrompt = parse_reply(
            r#"{"character": "a gnome", "setting": "", "plot": "find a song", "concept": "listening"}"#,
        )
        .unwrap();
        assert!(non_blank_prompt(idea).is_err());
    }

    #[test]
    fn test_fill_prompt() {
        let prompt = StoryPrompt {
            character: "A fox named Ren".into(),
            setting: "a library".into(),
            plot: "find a lost book".into(),
            concept: "curiosity".into(),
        };
        let text = fill_prompt(TITLE_TEMPLATE, &prompt);
        assert!(text.contains("- Main Character: A fox named Ren"));
        assert!(text.contains("- Moral/Concept: curiosity"));
    }
}
