use crate::core::io::Storage;
use crate::core::state::{Character, Page, Story};
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

/// JSON persistence for the three record sets of a story, keyed by story id
/// under the build folder:
///
/// ```text
/// build/<story_id>/story.json
/// build/<story_id>/characters.json
/// build/<story_id>/pages.json
/// build/<story_id>/refs/...      character reference images
/// build/<story_id>/pages/...     rendered page images
/// ```
#[derive(Clone)]
pub struct StoryStore {
    storage: Arc<dyn Storage>,
    build_folder: String,
}

impl StoryStore {
    pub fn new(storage: Arc<dyn Storage>, build_folder: impl Into<String>) -> Self {
        Self {
            storage,
            build_folder: build_folder.into(),
        }
    }

    pub fn storage(&self) -> &dyn Storage {
        self.storage.as_ref()
    }

    fn record_path(&self, story_id: &str, file: &str) -> String {
        Path::new(&self.build_folder)
            .join(story_id)
            .join(file)
            .to_string_lossy()
            .to_string()
    }

    pub async fn save_story(&self, story: &Story) -> Result<()> {
        let path = self.record_path(&story.id, "story.json");
        let content = serde_json::to_string_pretty(story)?;
        self.storage.write(&path, content.as_bytes()).await
    }

    pub async fn load_story(&self, story_id: &str) -> Result<Story> {
        let path = self.record_path(story_id, "story.json");
        let bytes = self
            .storage
            .read(&path)
            .await
            .with_context(|| format!("no story record for '{}'", story_id))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub async fn story_exists(&self, story_id: &str) -> Result<bool> {
        self.storage
            .exists(&self.record_path(story_id, "story.json"))
            .await
    }

    pub async fn save_characters(&self, story_id: &str, characters: &[Character]) -> Result<()> {
        let path = self.record_path(story_id, "characters.json");
        let content = serde_json::to_string_pretty(characters)?;
        self.storage.write(&path, content.as_bytes()).await
    }

    pub async fn load_characters(&self, story_id: &str) -> Result<Vec<Character>> {
        let path = self.record_path(story_id, "characters.json");
        if !self.storage.exists(&path).await? {
            return Ok(Vec::new());
        }
        let bytes = self.storage.read(&path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub async fn save_pages(&self, story_id: &str, pages: &[Page]) -> Result<()> {
        let path = self.record_path(story_id, "pages.json");
        let content = serde_json::to_string_pretty(pages)?;
        self.storage.write(&path, content.as_bytes()).await
    }

    pub async fn load_pages(&self, story_id: &str) -> Result<Vec<Page>> {
        let path = self.record_path(story_id, "pages.json");
        if !self.storage.exists(&path).await? {
            return Ok(Vec::new());
        }
        let bytes = self.storage.read(&path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Writes image bytes under the story's build directory and returns the
    /// stored path. Writing the same relative name overwrites in place, so a
    /// page or reference slot always holds at most one current image.
    pub async fn write_image(
        &self,
        story_id: &str,
        relative_name: &str,
        bytes: &[u8],
    ) -> Result<String> {
        let path = self.record_path(story_id, relative_name);
        self.storage.write(&path, bytes).await?;
        Ok(path)
    }

    pub async fn read_image(&self, path: &str) -> Result<Vec<u8>> {
        self.storage
            .read(path)
            .await
            .with_context(|| format!("missing image file '{}'", path))
    }
}
