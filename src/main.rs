use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use std::path::Path;
use std::sync::Arc;

use novel2picturebook::core::config::Config;
use novel2picturebook::core::io::{NativeStorage, Storage};
use novel2picturebook::core::state::{HeroPhoto, StorySettings};
use novel2picturebook::services::image::create_image_client;
use novel2picturebook::services::llm::create_llm;
use novel2picturebook::services::workflow::WorkflowManager;

fn hero_photo_from_path(path: &str) -> Result<HeroPhoto> {
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read hero photo '{}'", path))?;
    let mime_type = match Path::new(path)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .as_deref()
    {
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        _ => "image/jpeg",
    };
    Ok(HeroPhoto {
        mime_type: mime_type.to_string(),
        data: BASE64.encode(&bytes),
    })
}

fn settings_from_config(config: &Config) -> Result<StorySettings> {
    let defaults = &config.story;
    let hero_photo = match &defaults.hero_photo {
        Some(path) => Some(hero_photo_from_path(path)?),
        None => None,
    };
    Ok(StorySettings {
        target_age: defaults.target_age,
        intensity: defaults.intensity,
        art_style: defaults.art_style.clone(),
        page_count: defaults.page_count,
        quality: defaults.quality.clone(),
        aspect_ratio: defaults.aspect_ratio.clone(),
        hero_photo,
        review_characters: defaults.review_characters,
        notes: defaults.notes.clone(),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let config = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            eprintln!("Please ensure 'config.yml' exists with valid LLM and image settings.");
            return Err(e);
        }
    };

    config.ensure_directories()?;

    let llm = create_llm(&config)?;
    let image = create_image_client(&config)?;
    let storage = Arc::new(NativeStorage::new());

    let manager = WorkflowManager::new(config.clone(), llm, image, storage.clone());

    // Every .txt in the input folder becomes one picture book.
    let entries = storage.list(&config.input_folder).await?;
    let mut sources: Vec<String> = entries
        .into_iter()
        .filter(|e| e.ends_with(".txt"))
        .collect();
    sources.sort();

    if sources.is_empty() {
        println!("No .txt files found in '{}'.", config.input_folder);
        return Ok(());
    }

    for path_str in sources {
        let filename = Path::new(&path_str)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path_str.clone());
        let story_id = filename.replace('.', "_");

        if !manager.store().story_exists(&story_id).await? {
            let bytes = storage.read(&path_str).await?;
            let text = String::from_utf8(bytes)
                .with_context(|| format!("'{}' is not valid UTF-8", path_str))?;
            let settings = settings_from_config(&config)?;
            manager.create_story(&story_id, &text, settings).await?;
        }

        manager.run(&story_id).await?;
    }

    println!("All stories processed!");
    Ok(())
}
