use crate::core::state::{Character, CharacterStatus, Page, PageStatus, Story};
use crate::core::store::StoryStore;
use crate::services::image::{ImageClient, ReferenceImage};
use crate::services::retry::{call_with_retry, RetryPolicy};
use anyhow::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use log::info;

/// Appended to every render prompt, first pass and regeneration alike.
pub const SAFETY_CLAUSE: &str = "The image must be safe and age-appropriate for young children: \
no violence, gore, frightening imagery, weapons, or adult themes.";
pub const WATERMARK_CLAUSE: &str = "Include a small, unobtrusive 'AI' provenance watermark in \
the bottom-right corner of the image.";

pub struct PageRenderer<'a> {
    image: &'a dyn ImageClient,
    retry: RetryPolicy,
}

/// Characters whose name appears in the page text. When nothing matches the
/// page keeps every completed reference rather than rendering blind.
pub fn relevant_characters<'c>(page: &Page, characters: &'c [Character]) -> Vec<&'c Character> {
    let haystack = format!("{} {}", page.caption, page.image_prompt).to_lowercase();
    let named: Vec<&Character> = characters
        .iter()
        .filter(|c| c.status == CharacterStatus::Completed)
        .filter(|c| haystack.contains(&c.name.to_lowercase()))
        .collect();
    if !named.is_empty() {
        return named;
    }
    characters
        .iter()
        .filter(|c| c.status == CharacterStatus::Completed)
        .collect()
}

pub fn build_prompt(page: &Page, style_guide: &str, fix_instruction: Option<&str>) -> String {
    let mut prompt = format!(
        "Illustrate page {} of a picture book. Scene: {}. Caption: \"{}\". \
        Camera: {}. Style guide: {}.",
        page.page_number, page.image_prompt, page.caption, page.camera_angle, style_guide,
    );
    if let Some(fix) = fix_instruction {
        prompt.push_str(&format!(" Correction from review: {}.", fix));
    }
    prompt.push(' ');
    prompt.push_str(SAFETY_CLAUSE);
    prompt.push(' ');
    prompt.push_str(WATERMARK_CLAUSE);
    prompt
}

impl<'a> PageRenderer<'a> {
    pub fn new(image: &'a dyn ImageClient, retry: RetryPolicy) -> Self {
        Self { image, retry }
    }

    async fn gather_references(
        &self,
        story: &Story,
        page: &Page,
        characters: &[Character],
        store: &StoryStore,
    ) -> Result<Vec<ReferenceImage>> {
        let mut references = Vec::new();

        // The hero photo leads so the model anchors on the real likeness
        // before any generated reference.
        if let Some(photo) = &story.settings.hero_photo {
            let hero_name = characters
                .iter()
                .find(|c| c.is_hero)
                .map(|c| c.name.as_str())
                .unwrap_or("the hero");
            references.push(ReferenceImage {
                label: format!(
                    "Hero photo: {} must keep this exact real-life likeness.",
                    hero_name
                ),
                mime_type: photo.mime_type.clone(),
                data: photo.data.clone(),
            });
        }

        for character in relevant_characters(page, characters) {
            let Some(path) = character.primary_reference() else {
                continue;
            };
            let bytes = store.read_image(path).await?;
            references.push(ReferenceImage {
                label: format!("Reference for {}: {}", character.name, character.visual_description),
                mime_type: "image/png".to_string(),
                data: BASE64.encode(&bytes),
            });
        }

        Ok(references)
    }

    /// Renders one page. The stored image is only swapped once the new one
    /// has been written, so a failed render leaves any existing image
    /// untouched; re-rendering an imaged page overwrites in place.
    pub async fn render(
        &self,
        story: &Story,
        page: &mut Page,
        characters: &[Character],
        store: &StoryStore,
        fix_instruction: Option<&str>,
    ) -> Result<()> {
        let style_guide = story
            .style_guide
            .as_deref()
            .unwrap_or(&story.settings.art_style);
        let prompt = build_prompt(page, style_guide, fix_instruction);
        let references = self
            .gather_references(story, page, characters, store)
            .await?;

        page.status = PageStatus::Generating;

        let result = call_with_retry(self.retry, || self.image.generate(&prompt, &references)).await;

        match result {
            Ok(image) => {
                let name = format!("pages/page_{:02}.{}", page.page_number, image.extension());
                let path = store.write_image(&story.id, &name, &image.bytes).await?;
                page.image = Some(path);
                page.status = PageStatus::Completed;
                info!("rendered page {} of story {}", page.page_number, story.id);
                Ok(())
            }
            Err(err) => {
                // A page that already has an image keeps it and stays usable.
                page.status = if page.image.is_some() {
                    PageStatus::Completed
                } else {
                    PageStatus::Error
                };
                Err(err)
            }
        }
    }
}
