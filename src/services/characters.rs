use crate::core::state::{Character, CharacterRole, CharacterStatus, Story};
use crate::core::store::StoryStore;
use crate::services::image::ImageClient;
use crate::services::retry::{call_with_retry, RetryPolicy};
use anyhow::{bail, Result};
use log::{info, warn};

/// Reference angles requested per role. Mains get a full turnaround,
/// background characters a single look.
pub fn angles_for_role(role: CharacterRole) -> &'static [&'static str] {
    match role {
        CharacterRole::Main => &["front view", "side profile", "expression sheet"],
        CharacterRole::Supporting => &["front view", "side profile"],
        CharacterRole::Background => &["front view"],
    }
}

pub struct CharacterArtist<'a> {
    image: &'a dyn ImageClient,
    retry: RetryPolicy,
}

impl<'a> CharacterArtist<'a> {
    pub fn new(image: &'a dyn ImageClient, retry: RetryPolicy) -> Self {
        Self { image, retry }
    }

    fn angle_prompt(&self, story: &Story, character: &Character, angle: &str) -> String {
        let style = story
            .style_guide
            .as_deref()
            .unwrap_or(&story.settings.art_style);
        format!(
            "Character reference portrait, {}, neutral background, full character visible. \
            {}: {}. Art style: {}. Aspect ratio {}.",
            angle,
            character.name,
            character.visual_description,
            style,
            story.settings.aspect_ratio,
        )
    }

    /// Generates this character's reference images, one call per angle.
    /// A failed angle is logged and skipped; the character only fails when
    /// every angle does. The hero character never generates anything — its
    /// likeness is the uploaded photo on the story settings.
    pub async fn generate_references(
        &self,
        story: &Story,
        character: &mut Character,
        store: &StoryStore,
    ) -> Result<()> {
        if character.is_hero {
            character.status = CharacterStatus::Completed;
            info!(
                "character {} is the hero; using the uploaded photo as reference",
                character.name
            );
            return Ok(());
        }

        character.status = CharacterStatus::Generating;
        let angles = angles_for_role(character.role);
        let mut produced = Vec::new();

        for (i, angle) in angles.iter().enumerate() {
            let prompt = self.angle_prompt(story, character, angle);
            let result = call_with_retry(self.retry, || self.image.generate(&prompt, &[])).await;

            match result {
                Ok(image) => {
                    let name = format!(
                        "refs/{}_{:02}.{}",
                        character.id,
                        i + 1,
                        image.extension()
                    );
                    let path = store.write_image(&story.id, &name, &image.bytes).await?;
                    produced.push(path);
                }
                Err(err) => {
                    warn!(
                        "reference angle '{}' failed for {}: {:#}",
                        angle, character.name, err
                    );
                }
            }
        }

        if produced.is_empty() {
            character.status = CharacterStatus::Error;
            bail!("no reference images produced for {}", character.name);
        }

        character.reference_images = produced;
        character.status = CharacterStatus::Completed;
        Ok(())
    }
}
