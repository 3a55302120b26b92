use crate::core::config::Config;
use crate::core::io::Storage;
use crate::core::state::{
    Character, ConsistencyReport, Page, Story, StorySettings, StoryStatus, WorkflowPhase,
};
use crate::core::store::StoryStore;
use crate::services::characters::CharacterArtist;
use crate::services::consistency::ConsistencyChecker;
use crate::services::image::ImageClient;
use crate::services::llm::LlmClient;
use crate::services::pages::PageRenderer;
use crate::services::plan::{Planner, StoryPlan};
use crate::services::retry::RetryPolicy;
use anyhow::{anyhow, bail, Context, Result};
use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use serde_json::json;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Outcome of a fan-out stage. Partial failure is reported as counts, never
/// silently collapsed into total success or total failure.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchOutcome {
    pub succeeded: usize,
    pub failed: usize,
}

pub struct WorkflowManager {
    config: Config,
    llm: Box<dyn LlmClient>,
    image: Box<dyn ImageClient>,
    store: StoryStore,
}

impl WorkflowManager {
    pub fn new(
        config: Config,
        llm: Box<dyn LlmClient>,
        image: Box<dyn ImageClient>,
        storage: Arc<dyn Storage>,
    ) -> Self {
        let store = StoryStore::new(storage, config.build_folder.clone());
        Self {
            config,
            llm,
            image,
            store,
        }
    }

    pub fn store(&self) -> &StoryStore {
        &self.store
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.config.llm.retry_count.max(1),
            Duration::from_secs(self.config.llm.retry_delay_seconds),
        )
    }

    pub async fn create_story(
        &self,
        story_id: &str,
        source_text: &str,
        mut settings: StorySettings,
    ) -> Result<Story> {
        settings.validate()?;
        let story = Story::new(story_id, source_text, settings);
        self.store.save_story(&story).await?;
        Ok(story)
    }

    /// Plans the whole book in one model call and persists the results for
    /// review. A response that cannot be parsed saves nothing and marks the
    /// story failed.
    pub async fn plan_story(&self, story_id: &str) -> Result<StoryPlan> {
        let mut story = self.store.load_story(story_id).await?;
        story.set_phase(WorkflowPhase::PlanPending, "planning story");
        self.store.save_story(&story).await?;

        let planner = Planner::new(self.llm.as_ref(), self.retry_policy());
        let plan = match planner.plan(&story).await {
            Ok(plan) => plan,
            Err(err) => {
                story.mark_error(&format!("planning failed: {:#}", err));
                self.store.save_story(&story).await?;
                return Err(err);
            }
        };

        story.theme = Some(plan.theme.clone());
        story.arc_summary = plan.arc_summary.clone();
        story.style_guide = Some(plan.style_guide.clone());
        story.set_phase(WorkflowPhase::PlanReview, "plan ready for review");

        self.store.save_characters(story_id, &plan.characters).await?;
        self.store.save_pages(story_id, &plan.pages).await?;
        self.store.save_story(&story).await?;

        info!(
            "planned story {}: {} pages, {} characters",
            story_id,
            plan.pages.len(),
            plan.characters.len()
        );
        Ok(plan)
    }

    /// Generates references for one character. Sibling characters are
    /// untouched whatever happens here.
    pub async fn generate_character(&self, story_id: &str, character_id: &str) -> Result<()> {
        let story = self.store.load_story(story_id).await?;
        let mut characters = self.store.load_characters(story_id).await?;
        let index = characters
            .iter()
            .position(|c| c.id == character_id)
            .ok_or_else(|| anyhow!("no character '{}' in story '{}'", character_id, story_id))?;

        let artist = CharacterArtist::new(self.image.as_ref(), self.retry_policy());
        let result = artist
            .generate_references(&story, &mut characters[index], &self.store)
            .await;
        self.store.save_characters(story_id, &characters).await?;
        result
    }

    pub async fn generate_all_characters(&self, story_id: &str) -> Result<BatchOutcome> {
        let mut story = self.store.load_story(story_id).await?;
        let characters = self.store.load_characters(story_id).await?;
        if characters.is_empty() {
            bail!("story '{}' has no planned characters", story_id);
        }

        story.set_phase(
            WorkflowPhase::CharactersGenerating,
            "generating character references",
        );
        self.store.save_story(&story).await?;

        let order: Vec<String> = characters.iter().map(|c| c.id.clone()).collect();
        let artist = CharacterArtist::new(self.image.as_ref(), self.retry_policy());
        let artist = &artist;
        let store = &self.store;
        let story_ref = &story;

        let results: Vec<(Character, bool)> = futures_util::stream::iter(characters)
            .map(|mut character| async move {
                let ok = match artist
                    .generate_references(story_ref, &mut character, store)
                    .await
                {
                    Ok(()) => true,
                    Err(err) => {
                        warn!("character {} failed: {:#}", character.name, err);
                        false
                    }
                };
                (character, ok)
            })
            .buffer_unordered(self.config.image.concurrency.max(1))
            .collect()
            .await;

        let mut outcome = BatchOutcome::default();
        let mut by_id: HashMap<String, Character> = HashMap::new();
        for (character, ok) in results {
            if ok {
                outcome.succeeded += 1;
            } else {
                outcome.failed += 1;
            }
            by_id.insert(character.id.clone(), character);
        }
        let merged: Vec<Character> = order
            .into_iter()
            .filter_map(|id| by_id.remove(&id))
            .collect();
        self.store.save_characters(story_id, &merged).await?;

        info!(
            "character references for story {}: {} succeeded, {} failed",
            story_id, outcome.succeeded, outcome.failed
        );

        if outcome.succeeded == 0 {
            story.mark_error("all character references failed");
            self.store.save_story(&story).await?;
            bail!("all character references failed for story '{}'", story_id);
        }

        if story.settings.review_characters {
            story.set_phase(
                WorkflowPhase::CharacterReview,
                "character references ready for review",
            );
            self.store.save_story(&story).await?;
        }

        Ok(outcome)
    }

    /// Renders one page, optionally with a consistency fix appended.
    pub async fn render_page(
        &self,
        story_id: &str,
        page_number: usize,
        fix_instruction: Option<&str>,
    ) -> Result<()> {
        let story = self.store.load_story(story_id).await?;
        let characters = self.store.load_characters(story_id).await?;
        let mut pages = self.store.load_pages(story_id).await?;
        let index = pages
            .iter()
            .position(|p| p.page_number == page_number)
            .ok_or_else(|| anyhow!("no page {} in story '{}'", page_number, story_id))?;

        let renderer = PageRenderer::new(self.image.as_ref(), self.retry_policy());
        let result = renderer
            .render(&story, &mut pages[index], &characters, &self.store, fix_instruction)
            .await;
        self.store.save_pages(story_id, &pages).await?;
        result
    }

    pub async fn render_all_pages(&self, story_id: &str) -> Result<BatchOutcome> {
        let mut story = self.store.load_story(story_id).await?;
        let characters = self.store.load_characters(story_id).await?;
        let pages = self.store.load_pages(story_id).await?;
        if pages.is_empty() {
            bail!("story '{}' has no planned pages", story_id);
        }

        story.set_phase(WorkflowPhase::PagesGenerating, "rendering pages");
        self.store.save_story(&story).await?;

        let pb = ProgressBar::new(pages.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")?
                .progress_chars("#>-"),
        );

        let renderer = PageRenderer::new(self.image.as_ref(), self.retry_policy());
        let renderer = &renderer;
        let store = &self.store;
        let story_ref = &story;
        let characters_ref = &characters;

        let results: Vec<(Page, bool)> = futures_util::stream::iter(pages)
            .map(|mut page| {
                let pb = pb.clone();
                async move {
                    let ok = match renderer
                        .render(story_ref, &mut page, characters_ref, store, None)
                        .await
                    {
                        Ok(()) => true,
                        Err(err) => {
                            warn!("page {} failed: {:#}", page.page_number, err);
                            false
                        }
                    };
                    pb.inc(1);
                    (page, ok)
                }
            })
            .buffer_unordered(self.config.image.concurrency.max(1))
            .collect()
            .await;
        pb.finish_with_message("page rendering settled");

        let mut outcome = BatchOutcome::default();
        let mut merged: Vec<Page> = Vec::with_capacity(results.len());
        for (page, ok) in results {
            if ok {
                outcome.succeeded += 1;
            } else {
                outcome.failed += 1;
            }
            merged.push(page);
        }
        merged.sort_by_key(|p| p.page_number);
        self.store.save_pages(story_id, &merged).await?;

        info!(
            "page renders for story {}: {} succeeded, {} failed",
            story_id, outcome.succeeded, outcome.failed
        );

        if outcome.succeeded == 0 {
            story.mark_error("all page renders failed");
            self.store.save_story(&story).await?;
            bail!("all page renders failed for story '{}'", story_id);
        }

        Ok(outcome)
    }

    /// One consistency pass over everything rendered so far. Never fails the
    /// pipeline: an empty report doubles as "nothing wrong" and "could not
    /// check", and callers must treat both the same.
    pub async fn check_consistency(&self, story_id: &str) -> Result<ConsistencyReport> {
        let story = self.store.load_story(story_id).await?;
        let characters = self.store.load_characters(story_id).await?;
        let pages = self.store.load_pages(story_id).await?;

        let checker = ConsistencyChecker::new(self.llm.as_ref());
        Ok(checker.check(&story, &characters, &pages, &self.store).await)
    }

    /// Re-renders exactly the flagged pages, each with its fix instructions
    /// appended, one attempt per page per pass. Running another consistency
    /// pass afterwards is the caller's explicit decision.
    pub async fn regenerate_flagged(
        &self,
        story_id: &str,
        report: &ConsistencyReport,
    ) -> Result<usize> {
        let mut regenerated = 0;
        for &page_number in &report.pages_needing_regeneration {
            let fix = report.fix_instruction_for(page_number);
            match self
                .render_page(story_id, page_number, fix.as_deref())
                .await
            {
                Ok(()) => regenerated += 1,
                Err(err) => {
                    warn!(
                        "regeneration of page {} failed; keeping the previous image: {:#}",
                        page_number, err
                    );
                }
            }
        }
        info!(
            "regenerated {}/{} flagged pages for story {}",
            regenerated,
            report.pages_needing_regeneration.len(),
            story_id
        );
        Ok(regenerated)
    }

    /// Copies the finished pages and a book manifest to the output folder.
    pub async fn export(&self, story_id: &str) -> Result<()> {
        let story = self.store.load_story(story_id).await?;
        let pages = self.store.load_pages(story_id).await?;
        let out_dir = Path::new(&self.config.output_folder).join(story_id);

        let mut manifest_pages = Vec::new();
        for page in &pages {
            let Some(image_path) = &page.image else {
                continue;
            };
            let file_name = Path::new(image_path)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| format!("page_{:02}.png", page.page_number));
            let bytes = self.store.read_image(image_path).await?;
            let target = out_dir.join(&file_name).to_string_lossy().to_string();
            self.store.storage().write(&target, &bytes).await?;
            manifest_pages.push(json!({
                "page_number": page.page_number,
                "caption": page.caption,
                "image": file_name,
            }));
        }

        let manifest = json!({
            "id": story.id,
            "theme": story.theme,
            "arc_summary": story.arc_summary,
            "pages": manifest_pages,
        });
        let manifest_path = out_dir.join("book.json").to_string_lossy().to_string();
        self.store
            .storage()
            .write(&manifest_path, serde_json::to_string_pretty(&manifest)?.as_bytes())
            .await?;

        info!("exported story {} to {}", story_id, out_dir.display());
        Ok(())
    }

    fn confirm(&self, question: &str) -> bool {
        if self.config.unattended {
            return true;
        }
        match inquire::Confirm::new(question).with_default(true).prompt() {
            Ok(answer) => answer,
            Err(_) => {
                println!("Error reading input, stopping.");
                false
            }
        }
    }

    /// The full pipeline for one story, with the interactive checkpoints the
    /// config asks for. Safe to re-run after an abandoned attempt; completed
    /// stages are redone idempotently.
    pub async fn run(&self, story_id: &str) -> Result<()> {
        let story = self.store.load_story(story_id).await?;
        if story.status == StoryStatus::Complete {
            println!("Skipping completed story: {}", story_id);
            return Ok(());
        }

        println!("Planning story: {}", story_id);
        let plan = self.plan_story(story_id).await?;
        println!(
            "Plan ready: {} pages, {} characters, theme \"{}\"",
            plan.pages.len(),
            plan.characters.len(),
            plan.theme
        );

        if !self.confirm("Proceed with this plan?") {
            println!("Stopping at plan review.");
            return Ok(());
        }

        println!("Generating character references...");
        let outcome = self.generate_all_characters(story_id).await?;
        println!(
            "Character references: {} succeeded, {} failed",
            outcome.succeeded, outcome.failed
        );

        if story.settings.review_characters
            && !self.confirm("Continue with these character references?")
        {
            println!("Stopping at character review.");
            return Ok(());
        }

        println!("Rendering pages...");
        let outcome = self.render_all_pages(story_id).await?;
        println!(
            "Pages rendered: {} succeeded, {} failed",
            outcome.succeeded, outcome.failed
        );

        println!("Checking visual consistency...");
        let report = self.check_consistency(story_id).await?;
        if report.pages_needing_regeneration.is_empty() {
            println!("No pages flagged for regeneration.");
        } else {
            println!(
                "Regenerating {} flagged page(s)...",
                report.pages_needing_regeneration.len()
            );
            self.regenerate_flagged(story_id, &report).await?;
        }

        let mut story = self.store.load_story(story_id).await?;
        story.set_phase(WorkflowPhase::Complete, "book complete");
        self.store.save_story(&story).await?;

        self.export(story_id).await.context("export failed")?;
        println!("Story complete: {}", story_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{ImageConfig, LlmConfig, StoryDefaults};
    use crate::core::io::NativeStorage;
    use crate::core::state::{CharacterRole, CharacterStatus, HeroPhoto, PageStatus};
    use crate::services::image::{GeneratedImage, ReferenceImage};
    use crate::services::llm::ContentPart;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct ScriptedLlm {
        plan_json: String,
        consistency_json: String,
        chat_calls: AtomicUsize,
        multimodal_calls: AtomicUsize,
    }

    impl ScriptedLlm {
        fn new(plan_json: &str, consistency_json: &str) -> Self {
            Self {
                plan_json: plan_json.to_string(),
                consistency_json: consistency_json.to_string(),
                chat_calls: AtomicUsize::new(0),
                multimodal_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn chat(&self, _system: &str, _user: &str) -> Result<String> {
            self.chat_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.plan_json.clone())
        }

        async fn chat_multimodal(&self, _system: &str, _parts: &[ContentPart]) -> Result<String> {
            self.multimodal_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.consistency_json.clone())
        }
    }

    /// Every call returns distinct bytes so overwrites are observable.
    struct CountingImageClient {
        calls: AtomicUsize,
        fail_prompts_containing: Option<String>,
    }

    impl CountingImageClient {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_prompts_containing: None,
            }
        }

        fn failing_on(marker: &str) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_prompts_containing: Some(marker.to_string()),
            }
        }
    }

    #[async_trait]
    impl ImageClient for CountingImageClient {
        async fn generate(
            &self,
            prompt: &str,
            _references: &[ReferenceImage],
        ) -> Result<GeneratedImage> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(marker) = &self.fail_prompts_containing {
                if prompt.contains(marker.as_str()) {
                    return Err(anyhow!("image model returned no image data"));
                }
            }
            Ok(GeneratedImage {
                mime_type: "image/png".to_string(),
                bytes: format!("img-{}", n).into_bytes(),
            })
        }
    }

    fn plan_json(pages: usize) -> String {
        let page_items: Vec<String> = (1..=pages)
            .map(|n| {
                format!(
                    r#"{{ "caption": "Mira on page {n}.", "image_prompt": "Mira in scene {n}", "camera_angle": "wide shot" }}"#
                )
            })
            .collect();
        format!(
            r#"{{
                "theme": "courage",
                "arc_summary": ["a journey begins", "trouble", "home again"],
                "style_guide": "soft watercolor, warm palette",
                "characters": [
                    {{ "name": "Mira", "visual_description": "small girl, red hair", "display_description": "A curious explorer", "role": "main" }},
                    {{ "name": "Rook", "visual_description": "grey crow", "display_description": "A clever crow", "role": "supporting" }}
                ],
                "pages": [{}]
            }}"#,
            page_items.join(",")
        )
    }

    fn test_config(temp: &tempfile::TempDir) -> Config {
        Config {
            input_folder: temp.path().join("input").to_string_lossy().to_string(),
            output_folder: temp.path().join("output").to_string_lossy().to_string(),
            build_folder: temp.path().join("build").to_string_lossy().to_string(),
            unattended: true,
            llm: LlmConfig {
                provider: "mock".to_string(),
                retry_count: 1,
                retry_delay_seconds: 0,
                gemini: None,
                openai: None,
            },
            image: ImageConfig {
                provider: "mock".to_string(),
                concurrency: 2,
                gemini: None,
            },
            story: StoryDefaults::default(),
        }
    }

    fn settings(page_count: usize, hero: bool) -> StorySettings {
        StorySettings {
            target_age: 6,
            intensity: 3,
            art_style: "watercolor".to_string(),
            page_count,
            quality: "standard".to_string(),
            aspect_ratio: "1:1".to_string(),
            hero_photo: hero.then(|| HeroPhoto {
                mime_type: "image/jpeg".to_string(),
                data: "SEVSTw==".to_string(),
            }),
            review_characters: false,
            notes: None,
        }
    }

    fn manager(
        temp: &tempfile::TempDir,
        llm: ScriptedLlm,
        image: CountingImageClient,
    ) -> WorkflowManager {
        WorkflowManager::new(
            test_config(temp),
            Box::new(llm),
            Box::new(image),
            Arc::new(NativeStorage::new()),
        )
    }

    #[tokio::test]
    async fn create_story_validates_settings() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let manager = manager(
            &temp,
            ScriptedLlm::new("{}", "{}"),
            CountingImageClient::new(),
        );

        let mut bad = settings(10, false);
        bad.target_age = 1;
        assert!(manager.create_story("s1", "text", bad).await.is_err());

        let story = manager.create_story("s1", "text", settings(10, false)).await?;
        assert_eq!(story.phase, WorkflowPhase::Idle);
        assert!(manager.store().story_exists("s1").await?);
        Ok(())
    }

    #[tokio::test]
    async fn plan_failure_marks_story_error_and_saves_nothing() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let manager = manager(
            &temp,
            ScriptedLlm::new("not json", "{}"),
            CountingImageClient::new(),
        );
        manager.create_story("s1", "text", settings(10, false)).await?;

        assert!(manager.plan_story("s1").await.is_err());

        let story = manager.store().load_story("s1").await?;
        assert_eq!(story.status, StoryStatus::Error);
        assert_eq!(story.phase, WorkflowPhase::Error);
        assert!(story.current_step.contains("planning failed"));
        assert!(manager.store().load_characters("s1").await?.is_empty());
        assert!(manager.store().load_pages("s1").await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn plan_persists_characters_and_dense_pages() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let manager = manager(
            &temp,
            ScriptedLlm::new(&plan_json(10), "{}"),
            CountingImageClient::new(),
        );
        manager.create_story("s1", "text", settings(10, true)).await?;

        let plan = manager.plan_story("s1").await?;
        assert_eq!(plan.pages.len(), 10);

        let story = manager.store().load_story("s1").await?;
        assert_eq!(story.phase, WorkflowPhase::PlanReview);
        assert_eq!(story.theme.as_deref(), Some("courage"));

        let characters = manager.store().load_characters("s1").await?;
        let heroes: Vec<&Character> = characters.iter().filter(|c| c.is_hero).collect();
        assert_eq!(heroes.len(), 1);
        assert_eq!(heroes[0].name, "Mira");
        assert_eq!(heroes[0].role, CharacterRole::Main);

        let pages = manager.store().load_pages("s1").await?;
        let numbers: Vec<usize> = pages.iter().map(|p| p.page_number).collect();
        assert_eq!(numbers, (1..=10).collect::<Vec<_>>());
        Ok(())
    }

    #[tokio::test]
    async fn character_fanout_isolates_failures() -> Result<()> {
        let temp = tempfile::tempdir()?;
        // Rook's reference prompts fail; Mira's succeed.
        let manager = manager(
            &temp,
            ScriptedLlm::new(&plan_json(5), "{}"),
            CountingImageClient::failing_on("Rook"),
        );
        manager.create_story("s1", "text", settings(5, false)).await?;
        manager.plan_story("s1").await?;

        let outcome = manager.generate_all_characters("s1").await?;
        assert_eq!(outcome.succeeded, 1);
        assert_eq!(outcome.failed, 1);

        let characters = manager.store().load_characters("s1").await?;
        assert_eq!(characters[0].name, "Mira");
        assert_eq!(characters[0].status, CharacterStatus::Completed);
        assert!(characters[0].primary_reference().is_some());
        assert_eq!(characters[1].name, "Rook");
        assert_eq!(characters[1].status, CharacterStatus::Error);
        assert!(characters[1].reference_images.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn regeneration_touches_only_flagged_pages() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let consistency = r#"{
            "issues": [
                { "page_number": 3, "kind": "character_appearance", "description": "hair drift", "character": "Mira", "fix_instruction": "keep Mira's hair red" },
                { "page_number": 7, "kind": "style_drift", "description": "palette drift", "fix_instruction": "use the warm palette" }
            ],
            "pages_needing_regeneration": [3, 7]
        }"#;
        let manager = manager(
            &temp,
            ScriptedLlm::new(&plan_json(10), consistency),
            CountingImageClient::new(),
        );
        manager.create_story("s1", "text", settings(10, false)).await?;
        manager.plan_story("s1").await?;
        manager.generate_all_characters("s1").await?;
        manager.render_all_pages("s1").await?;

        let mut before: HashMap<usize, Vec<u8>> = HashMap::new();
        for page in manager.store().load_pages("s1").await? {
            let bytes = manager
                .store()
                .read_image(page.image.as_deref().unwrap())
                .await?;
            before.insert(page.page_number, bytes);
        }

        let report = manager.check_consistency("s1").await?;
        assert_eq!(report.pages_needing_regeneration, vec![3, 7]);
        let regenerated = manager.regenerate_flagged("s1", &report).await?;
        assert_eq!(regenerated, 2);

        for page in manager.store().load_pages("s1").await? {
            let bytes = manager
                .store()
                .read_image(page.image.as_deref().unwrap())
                .await?;
            if page.page_number == 3 || page.page_number == 7 {
                assert_ne!(bytes, before[&page.page_number], "flagged page must change");
            } else {
                assert_eq!(
                    bytes, before[&page.page_number],
                    "untouched page must be byte-identical"
                );
            }
        }
        Ok(())
    }

    #[tokio::test]
    async fn full_run_completes_and_exports() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let consistency = r#"{ "issues": [], "pages_needing_regeneration": [] }"#;
        let manager = manager(
            &temp,
            ScriptedLlm::new(&plan_json(10), consistency),
            CountingImageClient::new(),
        );
        manager.create_story("s1", "text", settings(10, false)).await?;

        manager.run("s1").await?;

        let story = manager.store().load_story("s1").await?;
        assert_eq!(story.status, StoryStatus::Complete);
        assert_eq!(story.phase, WorkflowPhase::Complete);
        assert_eq!(story.current_step, "book complete");

        let pages = manager.store().load_pages("s1").await?;
        assert_eq!(pages.len(), 10);
        assert!(pages.iter().all(|p| p.image.is_some()));
        assert!(pages.iter().all(|p| p.status == PageStatus::Completed));

        let characters = manager.store().load_characters("s1").await?;
        assert!(characters
            .iter()
            .all(|c| c.status == CharacterStatus::Completed && !c.reference_images.is_empty()));
        assert!(characters.iter().all(|c| !c.is_hero));

        let manifest_path = temp.path().join("output").join("s1").join("book.json");
        assert!(manifest_path.exists());
        let manifest: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(manifest_path)?)?;
        assert_eq!(manifest["pages"].as_array().unwrap().len(), 10);

        // Re-running a completed story is a no-op.
        manager.run("s1").await?;
        Ok(())
    }

    #[tokio::test]
    async fn consistency_failure_never_blocks_the_run() -> Result<()> {
        let temp = tempfile::tempdir()?;

        #[derive(Debug)]
        struct BrokenVisionLlm {
            plan_json: String,
        }

        #[async_trait]
        impl LlmClient for BrokenVisionLlm {
            async fn chat(&self, _system: &str, _user: &str) -> Result<String> {
                Ok(self.plan_json.clone())
            }

            async fn chat_multimodal(
                &self,
                _system: &str,
                _parts: &[ContentPart],
            ) -> Result<String> {
                Err(anyhow!("vision model unreachable"))
            }
        }

        let manager = WorkflowManager::new(
            test_config(&temp),
            Box::new(BrokenVisionLlm {
                plan_json: plan_json(5),
            }),
            Box::new(CountingImageClient::new()),
            Arc::new(NativeStorage::new()),
        );
        manager.create_story("s1", "text", settings(5, false)).await?;

        manager.run("s1").await?;

        let story = manager.store().load_story("s1").await?;
        assert_eq!(story.status, StoryStatus::Complete);
        Ok(())
    }

    #[tokio::test]
    async fn rerendering_a_page_twice_keeps_one_image() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let manager = manager(
            &temp,
            ScriptedLlm::new(&plan_json(5), "{}"),
            CountingImageClient::new(),
        );
        manager.create_story("s1", "text", settings(5, false)).await?;
        manager.plan_story("s1").await?;
        manager.generate_all_characters("s1").await?;

        manager.render_page("s1", 2, None).await?;
        let first = manager.store().load_pages("s1").await?[1]
            .image
            .clone()
            .unwrap();
        manager.render_page("s1", 2, None).await?;
        let second = manager.store().load_pages("s1").await?[1]
            .image
            .clone()
            .unwrap();

        assert_eq!(first, second);
        let dir = temp.path().join("build").join("s1").join("pages");
        let entries: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("page_02"))
            .collect();
        assert_eq!(entries.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_entities_are_reported() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let manager = manager(
            &temp,
            ScriptedLlm::new(&plan_json(5), "{}"),
            CountingImageClient::new(),
        );
        manager.create_story("s1", "text", settings(5, false)).await?;
        manager.plan_story("s1").await?;

        assert!(manager.generate_character("s1", "char_99").await.is_err());
        assert!(manager.render_page("s1", 99, None).await.is_err());
        assert!(manager.store().load_story("missing").await.is_err());
        Ok(())
    }
}
