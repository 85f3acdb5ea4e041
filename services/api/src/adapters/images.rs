//! services/api/src/adapters/images.rs
//!
//! Illustrations and character portraits from an OpenAI image model, returned as
//! `data:` URIs so they can be stored inside story records.

use async_openai::{
    config::OpenAIConfig,
    types::images::{CreateImageRequestArgs, Image, ImageModel, ImageResponseFormat, ImageSize},
    Client,
};
use bedtales_core::domain::AspectRatio;
use bedtales_core::ports::{GenerationErrorKind, PortError, PortResult};

use super::generator::classify_openai_error;

const ILLUSTRATION_STYLE: &str = "Style: whimsical, dreamy, digital art, children's book illustration.";

fn portrait_prompt(description: &str) -> String {
    format!(
        "Portrait of a storybook character: {}. Style: whimsical, friendly, children's book illustration, detailed, vibrant colors, close-up on face.",
        description.trim()
    )
}

/// The closest size the image model offers for each layout's aspect ratio.
fn size_for(aspect_ratio: AspectRatio) -> ImageSize {
    match aspect_ratio {
        AspectRatio::Square => ImageSize::S1024x1024,
        AspectRatio::Wide => ImageSize::S1792x1024,
        AspectRatio::Tall => ImageSize::S1024x1792,
    }
}

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

#[derive(Clone)]
pub struct OpenAiIllustrator {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiIllustrator {
    pub fn new(client: Client<OpenAIConfig>, model: String) -> Self {
        Self { client, model }
    }

    async fn render(&self, prompt: String, size: ImageSize) -> PortResult<String> {
        let request = CreateImageRequestArgs::default()
            .model(ImageModel::Other(self.model.clone()))
            .prompt(prompt)
            .n(1)
            .size(size)
            .response_format(ImageResponseFormat::B64Json)
            .build()
            .map_err(|e| PortError::Unexpected(e.to_string()))?;

        let response = self
            .client
            .images()
            .generate(request)
            .await
            .map_err(classify_openai_error)?;

        match response.data.first().map(|image| image.as_ref()) {
            Some(Image::B64Json { b64_json, .. }) => {
                Ok(format!("data:image/png;base64,{}", b64_json))
            }
            Some(Image::Url { .. }) => Err(PortError::generation(
                GenerationErrorKind::MalformedResponse,
                "image came back as a URL instead of inline data",
            )),
            None => Err(PortError::generation(
                GenerationErrorKind::MalformedResponse,
                "no image was returned",
            )),
        }
    }

    pub async fn illustrate(&self, image_prompt: &str, aspect_ratio: AspectRatio) -> PortResult<String> {
        let prompt = format!("{} {}", image_prompt.trim(), ILLUSTRATION_STYLE);
        self.render(prompt, size_for(aspect_ratio)).await
    }

    pub async fn portrait(&self, description: &str) -> PortResult<String> {
        self.render(portrait_prompt(description), ImageSize::S1024x1024)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_portrait_prompt_wraps_description() {
        let prompt = portrait_prompt("  A fox named Ren ");
        assert!(prompt.starts_with("Portrait of a storybook character: A fox named Ren."));
    }

    #[test]
    fn test_wide_layouts_request_landscape_images() {
        assert!(matches!(size_for(AspectRatio::Wide), ImageSize::S1792x1024));
        assert!(matches!(size_for(AspectRatio::Tall), ImageSize::S1024x1792));
    }
}
