use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StoryStatus {
    Draft,
    Generating,
    Complete,
    Error,
}

/// Pipeline phase as seen by external observers. Linear except for the
/// optional character review checkpoint; the consistency/regeneration loop
/// lives inside `PagesGenerating` and never surfaces as its own phase.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowPhase {
    Idle,
    PlanPending,
    PlanReview,
    CharactersGenerating,
    CharacterReview,
    PagesGenerating,
    Complete,
    Error,
}

impl WorkflowPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkflowPhase::Complete | WorkflowPhase::Error)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HeroPhoto {
    pub mime_type: String,
    /// Base64-encoded image bytes, as uploaded.
    pub data: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StorySettings {
    pub target_age: u8,
    #[serde(default)]
    pub intensity: u8,
    pub art_style: String,
    pub page_count: usize,
    pub quality: String,
    pub aspect_ratio: String,
    #[serde(default)]
    pub hero_photo: Option<HeroPhoto>,
    #[serde(default)]
    pub review_characters: bool,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Strongest intensity allowed for an age band. Values above the cap are
/// clamped, not rejected.
pub fn intensity_cap(target_age: u8) -> u8 {
    match target_age {
        0..=5 => 3,
        6..=8 => 5,
        9..=12 => 7,
        _ => 10,
    }
}

impl StorySettings {
    pub fn validate(&mut self) -> Result<()> {
        if !(3..=18).contains(&self.target_age) {
            bail!("target_age must be between 3 and 18, got {}", self.target_age);
        }
        if !(5..=30).contains(&self.page_count) {
            bail!("page_count must be between 5 and 30, got {}", self.page_count);
        }
        let cap = intensity_cap(self.target_age);
        if self.intensity > cap {
            self.intensity = cap;
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Story {
    pub id: String,
    pub source_text: String,
    pub settings: StorySettings,
    pub status: StoryStatus,
    pub phase: WorkflowPhase,
    pub current_step: String,
    #[serde(default)]
    pub theme: Option<String>,
    #[serde(default)]
    pub arc_summary: Vec<String>,
    #[serde(default)]
    pub style_guide: Option<String>,
}

impl Story {
    pub fn new(id: impl Into<String>, source_text: impl Into<String>, settings: StorySettings) -> Self {
        Self {
            id: id.into(),
            source_text: source_text.into(),
            settings,
            status: StoryStatus::Draft,
            phase: WorkflowPhase::Idle,
            current_step: "created".to_string(),
            theme: None,
            arc_summary: Vec::new(),
            style_guide: None,
        }
    }

    pub fn set_phase(&mut self, phase: WorkflowPhase, step: &str) {
        self.phase = phase;
        self.current_step = step.to_string();
        match phase {
            WorkflowPhase::Complete => self.status = StoryStatus::Complete,
            WorkflowPhase::Error => self.status = StoryStatus::Error,
            WorkflowPhase::Idle => {}
            _ => self.status = StoryStatus::Generating,
        }
    }

    pub fn mark_error(&mut self, message: &str) {
        self.status = StoryStatus::Error;
        self.phase = WorkflowPhase::Error;
        self.current_step = message.to_string();
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CharacterRole {
    Main,
    Supporting,
    Background,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CharacterStatus {
    Pending,
    Generating,
    Completed,
    Error,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Character {
    pub id: String,
    pub story_id: String,
    pub name: String,
    /// Prompt-facing appearance description used to condition image calls.
    pub visual_description: String,
    /// Human-facing description shown during review.
    pub display_description: String,
    pub role: CharacterRole,
    #[serde(default)]
    pub is_hero: bool,
    pub status: CharacterStatus,
    #[serde(default)]
    pub reference_images: Vec<String>,
}

impl Character {
    /// The first successfully generated reference; the one page renders lead with.
    pub fn primary_reference(&self) -> Option<&str> {
        self.reference_images.first().map(|s| s.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PageStatus {
    Pending,
    Generating,
    Completed,
    Error,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Page {
    pub id: String,
    pub story_id: String,
    /// 1-based, contiguous within a story.
    pub page_number: usize,
    pub caption: String,
    pub image_prompt: String,
    #[serde(default = "default_camera_angle")]
    pub camera_angle: String,
    #[serde(default)]
    pub image: Option<String>,
    pub status: PageStatus,
}

pub fn default_camera_angle() -> String {
    "medium shot".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    CharacterAppearance,
    TimelineLogic,
    StyleDrift,
    ObjectContinuity,
}

/// One flagged problem from a consistency pass. Lives for the duration of
/// that pass only; never persisted.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ConsistencyIssue {
    pub page_number: usize,
    pub kind: IssueKind,
    pub description: String,
    #[serde(default)]
    pub character: Option<String>,
    #[serde(default)]
    pub fix_instruction: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ConsistencyReport {
    pub issues: Vec<ConsistencyIssue>,
    pub pages_needing_regeneration: Vec<usize>,
}

impl ConsistencyReport {
    pub fn is_empty(&self) -> bool {
        self.issues.is_empty() && self.pages_needing_regeneration.is_empty()
    }

    /// All fix instructions addressed at one page, joined for the re-render prompt.
    pub fn fix_instruction_for(&self, page_number: usize) -> Option<String> {
        let fixes: Vec<&str> = self
            .issues
            .iter()
            .filter(|i| i.page_number == page_number)
            .filter_map(|i| i.fix_instruction.as_deref())
            .collect();
        if fixes.is_empty() {
            None
        } else {
            Some(fixes.join("; "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(age: u8, pages: usize, intensity: u8) -> StorySettings {
        StorySettings {
            target_age: age,
            intensity,
            art_style: "watercolor".to_string(),
            page_count: pages,
            quality: "standard".to_string(),
            aspect_ratio: "1:1".to_string(),
            hero_photo: None,
            review_characters: false,
            notes: None,
        }
    }

    #[test]
    fn validate_rejects_out_of_range_age_and_pages() {
        assert!(settings(2, 10, 0).validate().is_err());
        assert!(settings(19, 10, 0).validate().is_err());
        assert!(settings(6, 4, 0).validate().is_err());
        assert!(settings(6, 31, 0).validate().is_err());
        assert!(settings(6, 10, 0).validate().is_ok());
    }

    #[test]
    fn validate_clamps_intensity_to_age_band() {
        let mut s = settings(4, 10, 9);
        s.validate().unwrap();
        assert_eq!(s.intensity, 3);

        let mut s = settings(7, 10, 9);
        s.validate().unwrap();
        assert_eq!(s.intensity, 5);

        let mut s = settings(16, 10, 9);
        s.validate().unwrap();
        assert_eq!(s.intensity, 9);
    }

    #[test]
    fn phase_transitions_update_status() {
        let mut story = Story::new("s1", "text", settings(6, 10, 3));
        assert_eq!(story.status, StoryStatus::Draft);

        story.set_phase(WorkflowPhase::PlanPending, "planning");
        assert_eq!(story.status, StoryStatus::Generating);
        assert!(!story.phase.is_terminal());

        story.set_phase(WorkflowPhase::Complete, "done");
        assert_eq!(story.status, StoryStatus::Complete);
        assert!(story.phase.is_terminal());

        story.mark_error("planning failed");
        assert_eq!(story.status, StoryStatus::Error);
        assert_eq!(story.current_step, "planning failed");
    }

    #[test]
    fn fix_instructions_join_per_page() {
        let report = ConsistencyReport {
            issues: vec![
                ConsistencyIssue {
                    page_number: 3,
                    kind: IssueKind::CharacterAppearance,
                    description: "hair color changed".to_string(),
                    character: Some("Mira".to_string()),
                    fix_instruction: Some("keep Mira's hair red".to_string()),
                },
                ConsistencyIssue {
                    page_number: 3,
                    kind: IssueKind::StyleDrift,
                    description: "palette too dark".to_string(),
                    character: None,
                    fix_instruction: Some("use the bright daytime palette".to_string()),
                },
                ConsistencyIssue {
                    page_number: 5,
                    kind: IssueKind::ObjectContinuity,
                    description: "missing satchel".to_string(),
                    character: None,
                    fix_instruction: None,
                },
            ],
            pages_needing_regeneration: vec![3, 5],
        };

        assert_eq!(
            report.fix_instruction_for(3).unwrap(),
            "keep Mira's hair red; use the bright daytime palette"
        );
        assert!(report.fix_instruction_for(5).is_none());
        assert!(report.fix_instruction_for(1).is_none());
    }
}
