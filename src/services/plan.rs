use crate::core::state::{
    default_camera_angle, Character, CharacterRole, CharacterStatus, Page, PageStatus, Story,
};
use crate::services::llm::LlmClient;
use crate::services::retry::{call_with_retry, RetryPolicy};
use crate::utils::text::{strip_code_blocks, truncate_chars};
use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// How much of the source text is shown to the planner. Longer texts keep
/// their opening and lose the tail.
pub const SOURCE_CONTEXT_LIMIT: usize = 12_000;

/// Everything the plan call produces, ready to persist.
#[derive(Debug, Clone)]
pub struct StoryPlan {
    pub theme: String,
    pub arc_summary: Vec<String>,
    pub style_guide: String,
    pub characters: Vec<Character>,
    pub pages: Vec<Page>,
}

pub struct Planner<'a> {
    llm: &'a dyn LlmClient,
    retry: RetryPolicy,
}

#[derive(Deserialize)]
struct PlanResponse {
    theme: String,
    #[serde(default)]
    arc_summary: Vec<String>,
    style_guide: String,
    characters: Vec<PlanCharacter>,
    pages: Vec<PlanPage>,
}

#[derive(Deserialize)]
struct PlanCharacter {
    name: String,
    visual_description: String,
    #[serde(default)]
    display_description: String,
    #[serde(default = "default_role")]
    role: CharacterRole,
}

fn default_role() -> CharacterRole {
    CharacterRole::Supporting
}

#[derive(Deserialize)]
struct PlanPage {
    caption: String,
    image_prompt: String,
    #[serde(default)]
    camera_angle: Option<String>,
}

impl<'a> Planner<'a> {
    pub fn new(llm: &'a dyn LlmClient, retry: RetryPolicy) -> Self {
        Self { llm, retry }
    }

    /// One planning call: page drafts, characters, theme, arc, style guide.
    /// Transient upstream errors are retried; an unparseable response is
    /// fatal and nothing is returned for saving.
    pub async fn plan(&self, story: &Story) -> Result<StoryPlan> {
        let settings = &story.settings;
        let source = truncate_chars(&story.source_text, SOURCE_CONTEXT_LIMIT);

        let notes = settings.notes.as_deref().unwrap_or("none");
        let prompt = format!(
            "Plan an illustrated picture book from the source text below.\
            \n\nRequirements:\
            \n- Reader age: {}. Emotional intensity at most {} on a 0-10 scale.\
            \n- Exactly {} pages, each with a short caption (1-3 sentences) and a\
            \n  detailed image_prompt describing the illustration.\
            \n- Optional camera_angle per page (e.g. \"wide shot\", \"close-up\", \"medium shot\").\
            \n- 1-4 characters with a visual_description (appearance details for an\
            \n  illustrator), a display_description (one friendly sentence for readers),\
            \n  and a role: \"main\", \"supporting\" or \"background\".\
            \n- A theme, an arc_summary (list of short bullets) and a style_guide\
            \n  (palette, lighting, composition rules) for the \"{}\" art style,\
            \n  aspect ratio {}.\
            \n- Extra notes: {}\
            \n\nReturn only a JSON object:\
            {{ \"theme\": \"...\", \"arc_summary\": [\"...\"], \"style_guide\": \"...\",\
            \"characters\": [ {{ \"name\": \"...\", \"visual_description\": \"...\",\
            \"display_description\": \"...\", \"role\": \"main\" }} ],\
            \"pages\": [ {{ \"caption\": \"...\", \"image_prompt\": \"...\", \"camera_angle\": \"...\" }} ] }}\
            \n\nSource text:\n{}",
            settings.target_age,
            settings.intensity,
            settings.page_count,
            settings.art_style,
            settings.aspect_ratio,
            notes,
            source,
        );

        let response = call_with_retry(self.retry, || {
            self.llm
                .chat("You are a picture book planner. Return only valid JSON.", &prompt)
        })
        .await?;

        let clean_json = strip_code_blocks(&response);
        let parsed: PlanResponse = serde_json::from_str(&clean_json)
            .context(format!("Failed to parse plan JSON: {}", clean_json))?;

        self.into_plan(story, parsed)
    }

    fn into_plan(&self, story: &Story, mut parsed: PlanResponse) -> Result<StoryPlan> {
        let requested = story.settings.page_count;
        if parsed.pages.len() < requested {
            bail!(
                "plan returned {} pages, {} requested",
                parsed.pages.len(),
                requested
            );
        }
        parsed.pages.truncate(requested);

        let mut characters: Vec<Character> = parsed
            .characters
            .into_iter()
            .enumerate()
            .map(|(i, c)| {
                let display = if c.display_description.is_empty() {
                    c.visual_description.clone()
                } else {
                    c.display_description
                };
                Character {
                    id: format!("char_{:02}", i + 1),
                    story_id: story.id.clone(),
                    name: c.name,
                    visual_description: c.visual_description,
                    display_description: display,
                    role: c.role,
                    is_hero: false,
                    status: CharacterStatus::Pending,
                    reference_images: Vec::new(),
                }
            })
            .collect();

        // The hero slot goes to the first main-role character in plan order;
        // there is no other tie-break.
        if story.settings.hero_photo.is_some() {
            if let Some(first_main) = characters
                .iter_mut()
                .find(|c| c.role == CharacterRole::Main)
            {
                first_main.is_hero = true;
            }
        }

        let pages: Vec<Page> = parsed
            .pages
            .into_iter()
            .enumerate()
            .map(|(i, p)| Page {
                id: format!("page_{:02}", i + 1),
                story_id: story.id.clone(),
                page_number: i + 1,
                caption: p.caption,
                image_prompt: p.image_prompt,
                camera_angle: p
                    .camera_angle
                    .filter(|a| !a.trim().is_empty())
                    .unwrap_or_else(default_camera_angle),
                image: None,
                status: PageStatus::Pending,
            })
            .collect();

        let arc_summary = if parsed.arc_summary.is_empty() {
            // Planner skipped the arc; derive one from the opening captions.
            pages
                .iter()
                .take(4.min(pages.len()))
                .map(|p| p.caption.clone())
                .collect()
        } else {
            parsed.arc_summary
        };

        Ok(StoryPlan {
            theme: parsed.theme,
            arc_summary,
            style_guide: parsed.style_guide,
            characters,
            pages,
        })
    }
}
