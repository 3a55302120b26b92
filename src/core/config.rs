use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_input")]
    pub input_folder: String,

    #[serde(default = "default_output")]
    pub output_folder: String,

    #[serde(default = "default_build")]
    pub build_folder: String,

    #[serde(default)]
    pub unattended: bool,

    pub llm: LlmConfig,

    #[serde(default)]
    pub image: ImageConfig,

    #[serde(default)]
    pub story: StoryDefaults,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LlmConfig {
    pub provider: String, // "gemini" or "openai"
    #[serde(default = "default_retry_count")]
    pub retry_count: usize,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,
    pub gemini: Option<GeminiConfig>,
    pub openai: Option<OpenAIConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OpenAIConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ImageConfig {
    #[serde(default = "default_image_provider")]
    pub provider: String,
    #[serde(default = "default_image_concurrency")]
    pub concurrency: usize,
    pub gemini: Option<GeminiImageConfig>,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            provider: default_image_provider(),
            concurrency: default_image_concurrency(),
            gemini: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GeminiImageConfig {
    pub api_key: String,
    #[serde(default = "default_image_model")]
    pub model: String,
}

/// Book settings applied to every story created by the CLI. Per-story
/// overrides happen at `create_story` time, not here.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StoryDefaults {
    #[serde(default = "default_target_age")]
    pub target_age: u8,
    #[serde(default = "default_intensity")]
    pub intensity: u8,
    #[serde(default = "default_art_style")]
    pub art_style: String,
    #[serde(default = "default_page_count")]
    pub page_count: usize,
    #[serde(default = "default_quality")]
    pub quality: String,
    #[serde(default = "default_aspect_ratio")]
    pub aspect_ratio: String,
    /// Path to a photo of the real child the main character should look like.
    pub hero_photo: Option<String>,
    #[serde(default)]
    pub review_characters: bool,
    pub notes: Option<String>,
}

impl Default for StoryDefaults {
    fn default() -> Self {
        Self {
            target_age: default_target_age(),
            intensity: default_intensity(),
            art_style: default_art_style(),
            page_count: default_page_count(),
            quality: default_quality(),
            aspect_ratio: default_aspect_ratio(),
            hero_photo: None,
            review_characters: false,
            notes: None,
        }
    }
}

fn default_input() -> String {
    "input".to_string()
}
fn default_output() -> String {
    "output".to_string()
}
fn default_build() -> String {
    "build".to_string()
}
fn default_retry_count() -> usize {
    3
}
fn default_retry_delay() -> u64 {
    2
}
fn default_image_provider() -> String {
    "gemini".to_string()
}
fn default_image_concurrency() -> usize {
    3
}
fn default_image_model() -> String {
    "gemini-2.5-flash-image-preview".to_string()
}
fn default_target_age() -> u8 {
    6
}
fn default_intensity() -> u8 {
    3
}
fn default_art_style() -> String {
    "storybook watercolor".to_string()
}
fn default_page_count() -> usize {
    10
}
fn default_quality() -> String {
    "standard".to_string()
}
fn default_aspect_ratio() -> String {
    "1:1".to_string()
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Path::new("config.yml");
        if !path.exists() {
            anyhow::bail!("config.yml not found. Please create one.");
        }

        let content = fs::read_to_string(path).context("Failed to read config.yml")?;
        let config: Config =
            serde_yaml_ng::from_str(&content).context("Failed to parse config.yml")?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let content = serde_yaml_ng::to_string(self)?;
        fs::write("config.yml", content).context("Failed to write config.yml")?;
        Ok(())
    }

    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.input_folder)?;
        fs::create_dir_all(&self.output_folder)?;
        fs::create_dir_all(&self.build_folder)?;
        Ok(())
    }
}
