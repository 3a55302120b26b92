use crate::core::config::Config;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

/// An identity image supplied alongside a generation prompt. `label` is shown
/// to the model right before the image so it knows what the image pins down.
#[derive(Debug, Clone)]
pub struct ReferenceImage {
    pub label: String,
    pub mime_type: String,
    /// Base64-encoded bytes.
    pub data: String,
}

#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl GeneratedImage {
    /// File extension matching the payload, for storage paths.
    pub fn extension(&self) -> &str {
        match self.mime_type.as_str() {
            "image/jpeg" => "jpg",
            "image/webp" => "webp",
            _ => "png",
        }
    }
}

/// Image generation gateway. Knows nothing about stories, characters or
/// pages; it takes a prompt plus optional reference images and returns bytes.
#[async_trait]
pub trait ImageClient: Send + Sync {
    async fn generate(&self, prompt: &str, references: &[ReferenceImage])
        -> Result<GeneratedImage>;
}

pub fn create_image_client(config: &Config) -> Result<Box<dyn ImageClient>> {
    match config.image.provider.as_str() {
        "gemini" => {
            let cfg = config
                .image
                .gemini
                .as_ref()
                .context("Gemini image config missing")?;
            Ok(Box::new(GeminiImageClient::new(&cfg.api_key, &cfg.model)))
        }
        _ => Err(anyhow!("Unknown image provider: {}", config.image.provider)),
    }
}

// --- Gemini image generation ---

struct GeminiImageClient {
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl GeminiImageClient {
    fn new(api_key: &str, model: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct ImageRequest {
    contents: Vec<ImageContent>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct ImageContent {
    role: String,
    parts: Vec<ImagePart>,
}

#[derive(Serialize)]
struct ImagePart {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(rename = "inlineData", skip_serializing_if = "Option::is_none")]
    inline_data: Option<InlineData>,
}

#[derive(Serialize)]
struct GenerationConfig {
    #[serde(rename = "responseModalities")]
    response_modalities: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct InlineData {
    #[serde(rename = "mimeType")]
    mime_type: String,
    data: String,
}

#[derive(Deserialize)]
struct ImageResponse {
    candidates: Option<Vec<ImageCandidate>>,
    error: Option<ImageError>,
}

#[derive(Deserialize)]
struct ImageCandidate {
    content: Option<ImageContentResponse>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ImageContentResponse {
    #[serde(default)]
    parts: Vec<ImagePartResponse>,
}

#[derive(Deserialize)]
struct ImagePartResponse {
    #[serde(default)]
    text: Option<String>,
    #[serde(rename = "inlineData", default)]
    inline_data: Option<InlineData>,
}

#[async_trait]
impl ImageClient for GeminiImageClient {
    async fn generate(
        &self,
        prompt: &str,
        references: &[ReferenceImage],
    ) -> Result<GeneratedImage> {
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
            self.model, self.api_key
        );

        let mut parts = Vec::new();
        for reference in references {
            parts.push(ImagePart {
                text: Some(reference.label.clone()),
                inline_data: None,
            });
            parts.push(ImagePart {
                text: None,
                inline_data: Some(InlineData {
                    mime_type: reference.mime_type.clone(),
                    data: reference.data.clone(),
                }),
            });
        }
        parts.push(ImagePart {
            text: Some(prompt.to_string()),
            inline_data: None,
        });

        let request_body = ImageRequest {
            contents: vec![ImageContent {
                role: "user".to_string(),
                parts,
            }],
            generation_config: GenerationConfig {
                response_modalities: vec!["IMAGE".to_string(), "TEXT".to_string()],
            },
        };

        let resp = self.client.post(&url).json(&request_body).send().await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let error_text = resp.text().await?;
            return Err(anyhow!("Gemini image error ({}): {}", status, error_text));
        }

        let result: ImageResponse = resp.json().await.context("gemini image parse error")?;

        if let Some(err) = result.error {
            return Err(anyhow!("Gemini image API returned error: {}", err.message));
        }

        let candidates = result
            .candidates
            .ok_or_else(|| anyhow!("Gemini image response has no candidates"))?;

        for candidate in &candidates {
            if let Some(content) = &candidate.content {
                for part in &content.parts {
                    if let Some(inline) = &part.inline_data {
                        if !inline.data.is_empty() {
                            let bytes = BASE64
                                .decode(&inline.data)
                                .context("invalid base64 in image response")?;
                            return Ok(GeneratedImage {
                                mime_type: inline.mime_type.clone(),
                                bytes,
                            });
                        }
                    }
                }
            }
        }

        let reason = candidates
            .first()
            .and_then(|c| c.finish_reason.as_deref())
            .unwrap_or("UNKNOWN");
        Err(anyhow!(
            "image model returned no image data. Finish reason: {}",
            reason
        ))
    }
}

#[derive(Deserialize, Debug)]
struct ImageError {
    message: String,
}
