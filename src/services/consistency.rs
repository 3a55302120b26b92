use crate::core::state::{Character, ConsistencyIssue, ConsistencyReport, Page, Story};
use crate::core::store::StoryStore;
use crate::services::llm::{ContentPart, LlmClient};
use crate::utils::text::strip_code_blocks;
use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use log::{info, warn};
use serde::Deserialize;
use std::collections::HashSet;

pub struct ConsistencyChecker<'a> {
    llm: &'a dyn LlmClient,
}

#[derive(Deserialize)]
struct AnalysisResponse {
    #[serde(default)]
    issues: Vec<ConsistencyIssue>,
    #[serde(default)]
    pages_needing_regeneration: Vec<i64>,
}

impl<'a> ConsistencyChecker<'a> {
    pub fn new(llm: &'a dyn LlmClient) -> Self {
        Self { llm }
    }

    /// Reviews all rendered pages against the character references and
    /// reports visual drift. Best-effort by contract: any failure, upstream
    /// or parse, degrades to an empty report. With no rendered pages it
    /// returns the empty report without calling the model at all.
    pub async fn check(
        &self,
        story: &Story,
        characters: &[Character],
        pages: &[Page],
        store: &StoryStore,
    ) -> ConsistencyReport {
        let mut imaged: Vec<&Page> = pages.iter().filter(|p| p.image.is_some()).collect();
        if imaged.is_empty() {
            return ConsistencyReport::default();
        }
        imaged.sort_by_key(|p| p.page_number);

        match self.analyze(story, characters, &imaged, store).await {
            Ok(report) => report,
            Err(err) => {
                warn!(
                    "consistency check failed for story {}; continuing without issues: {:#}",
                    story.id, err
                );
                ConsistencyReport::default()
            }
        }
    }

    async fn analyze(
        &self,
        story: &Story,
        characters: &[Character],
        imaged: &[&Page],
        store: &StoryStore,
    ) -> Result<ConsistencyReport> {
        let style_guide = story
            .style_guide
            .as_deref()
            .unwrap_or(&story.settings.art_style);

        let mut parts = Vec::new();
        parts.push(ContentPart::Text(format!(
            "Review the pages of an illustrated picture book for visual consistency. \
            Style guide: {}. You will see identity references first, then every page \
            in reading order. Flag character appearance drift, timeline logic breaks, \
            style drift and object continuity errors. For each problem give a short \
            fix_instruction an illustrator could append to the page's prompt.\
            \nReturn only a JSON object:\
            {{ \"issues\": [ {{ \"page_number\": 1, \"kind\": \"character_appearance|timeline_logic|style_drift|object_continuity\", \
            \"description\": \"...\", \"character\": \"...\", \"fix_instruction\": \"...\" }} ],\
            \"pages_needing_regeneration\": [1] }}",
            style_guide,
        )));

        // Identity references come before any judged page: hero photo first,
        // tagged as the real likeness, then the generated references.
        if let Some(photo) = &story.settings.hero_photo {
            let hero_name = characters
                .iter()
                .find(|c| c.is_hero)
                .map(|c| c.name.as_str())
                .unwrap_or("the hero");
            parts.push(ContentPart::Text(format!(
                "Hero photo (real person): {} must match this likeness on every page.",
                hero_name
            )));
            parts.push(ContentPart::Image {
                mime_type: photo.mime_type.clone(),
                data: photo.data.clone(),
            });
        }

        for character in characters {
            let Some(path) = character.primary_reference() else {
                continue;
            };
            let bytes = store.read_image(path).await?;
            parts.push(ContentPart::Text(format!(
                "Generated reference for {}: {}",
                character.name, character.visual_description
            )));
            parts.push(ContentPart::Image {
                mime_type: "image/png".to_string(),
                data: BASE64.encode(&bytes),
            });
        }

        // Pages in ascending order so drift reads as a gradient.
        for page in imaged {
            let path = page.image.as_deref().unwrap_or_default();
            let bytes = store.read_image(path).await?;
            parts.push(ContentPart::Text(format!(
                "Page {}: {}",
                page.page_number, page.caption
            )));
            parts.push(ContentPart::Image {
                mime_type: "image/png".to_string(),
                data: BASE64.encode(&bytes),
            });
        }

        let response = self
            .llm
            .chat_multimodal(
                "You are an art director checking a picture book. Return only valid JSON.",
                &parts,
            )
            .await?;

        let clean_json = strip_code_blocks(&response);
        let parsed: AnalysisResponse = serde_json::from_str(&clean_json)
            .context(format!("Failed to parse consistency JSON: {}", clean_json))?;

        Ok(self.sanitize(story, imaged, parsed))
    }

    /// Keeps only candidates naming a page that exists, is in range and has
    /// an image; everything else is dropped silently. Duplicates collapse,
    /// first occurrence wins.
    fn sanitize(
        &self,
        story: &Story,
        imaged: &[&Page],
        parsed: AnalysisResponse,
    ) -> ConsistencyReport {
        let page_count = story.settings.page_count;
        let imaged_numbers: HashSet<usize> = imaged.iter().map(|p| p.page_number).collect();
        let valid = |n: i64| -> Option<usize> {
            if n < 1 || n as usize > page_count {
                return None;
            }
            let n = n as usize;
            imaged_numbers.contains(&n).then_some(n)
        };

        let issues: Vec<ConsistencyIssue> = parsed
            .issues
            .into_iter()
            .filter(|i| valid(i.page_number as i64).is_some())
            .collect();

        let mut seen = HashSet::new();
        let pages_needing_regeneration: Vec<usize> = parsed
            .pages_needing_regeneration
            .into_iter()
            .filter_map(valid)
            .filter(|n| seen.insert(*n))
            .collect();

        info!(
            "consistency check for story {}: {} issues, {} pages flagged",
            story.id,
            issues.len(),
            pages_needing_regeneration.len()
        );

        ConsistencyReport {
            issues,
            pages_needing_regeneration,
        }
    }
}
