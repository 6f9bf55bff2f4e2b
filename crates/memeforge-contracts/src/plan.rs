use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::events::now_utc_iso;

pub const PLAY_IT_SAFE_TAG: &str = "#play-it-safe";
pub const MAX_QUERIES: usize = 3;
const MAX_QUERY_CHARS: usize = 100;
const MIN_DIMENSION: u32 = 64;
const MAX_DIMENSION: u32 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ControlTag {
    PlayItSafe,
}

/// One user submission. `text` has the control tag removed; `raw` keeps the
/// input exactly as typed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemeRequest {
    pub id: String,
    pub raw: String,
    pub text: String,
    pub control_tag: Option<ControlTag>,
    pub created_at: String,
}

impl MemeRequest {
    pub fn parse(raw: &str) -> Self {
        let lowered = raw.to_ascii_lowercase();
        let control_tag = lowered
            .contains(PLAY_IT_SAFE_TAG)
            .then_some(ControlTag::PlayItSafe);
        let text = raw
            .split_whitespace()
            .filter(|word| !word.eq_ignore_ascii_case(PLAY_IT_SAFE_TAG))
            .collect::<Vec<&str>>()
            .join(" ");
        Self {
            id: Uuid::new_v4().to_string(),
            raw: raw.to_string(),
            text,
            control_tag,
            created_at: now_utc_iso(),
        }
    }

    pub fn play_it_safe(&self) -> bool {
        self.control_tag == Some(ControlTag::PlayItSafe)
    }

    pub fn mentions_meme(&self) -> bool {
        self.text.to_ascii_lowercase().contains("meme")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayoutKind {
    #[default]
    Single,
    Grid,
    Vertical,
    Horizontal,
}

impl LayoutKind {
    pub const ALL: [LayoutKind; 4] = [
        LayoutKind::Single,
        LayoutKind::Grid,
        LayoutKind::Vertical,
        LayoutKind::Horizontal,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LayoutKind::Single => "single",
            LayoutKind::Grid => "grid",
            LayoutKind::Vertical => "vertical",
            LayoutKind::Horizontal => "horizontal",
        }
    }
}

impl fmt::Display for LayoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LayoutKind {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase().replace(['_', ' '], "-");
        match normalized.as_str() {
            "single" | "one" | "solo" | "centered" => Ok(LayoutKind::Single),
            "grid" | "collage" => Ok(LayoutKind::Grid),
            "vertical" | "stacked" | "rows" | "top-bottom" => Ok(LayoutKind::Vertical),
            "horizontal" | "side-by-side" | "columns" | "left-right" => {
                Ok(LayoutKind::Horizontal)
            }
            _ => Err(format!("unknown layout '{}'", raw.trim())),
        }
    }
}

/// Largest canvas a plan may produce. Deserialized values go through
/// [`ResolutionBounds::new`], so stored bounds are clamped too.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawBounds")]
pub struct ResolutionBounds {
    pub max_width: u32,
    pub max_height: u32,
}

#[derive(Deserialize)]
struct RawBounds {
    max_width: u32,
    max_height: u32,
}

impl From<RawBounds> for ResolutionBounds {
    fn from(raw: RawBounds) -> Self {
        Self::new(raw.max_width, raw.max_height)
    }
}

impl ResolutionBounds {
    pub fn new(max_width: u32, max_height: u32) -> Self {
        Self {
            max_width: max_width.clamp(MIN_DIMENSION, MAX_DIMENSION),
            max_height: max_height.clamp(MIN_DIMENSION, MAX_DIMENSION),
        }
    }
}

impl Default for ResolutionBounds {
    fn default() -> Self {
        Self::new(800, 800)
    }
}

/// Structured decision that drives retrieval and composition.
///
/// Only the validating constructors build one, so every plan carries
/// between one and three distinct, non-empty search queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "PlanFields", into = "PlanFields")]
pub struct CompositionPlan {
    caption: String,
    queries: Vec<String>,
    layout: LayoutKind,
    resolution: ResolutionBounds,
    background_removal: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PlanFields {
    caption: String,
    queries: Vec<String>,
    #[serde(default)]
    layout: LayoutKind,
    #[serde(default)]
    resolution: ResolutionBounds,
    #[serde(default)]
    background_removal: bool,
}

impl TryFrom<PlanFields> for CompositionPlan {
    type Error = anyhow::Error;

    fn try_from(fields: PlanFields) -> Result<Self, Self::Error> {
        CompositionPlan::new(
            fields.caption,
            fields.queries,
            fields.layout,
            fields.resolution,
            fields.background_removal,
        )
    }
}

impl From<CompositionPlan> for PlanFields {
    fn from(plan: CompositionPlan) -> Self {
        Self {
            caption: plan.caption,
            queries: plan.queries,
            layout: plan.layout,
            resolution: plan.resolution,
            background_removal: plan.background_removal,
        }
    }
}

impl CompositionPlan {
    pub fn new(
        caption: impl Into<String>,
        queries: impl IntoIterator<Item = impl AsRef<str>>,
        layout: LayoutKind,
        resolution: ResolutionBounds,
        background_removal: bool,
    ) -> anyhow::Result<Self> {
        let queries = normalize_queries(queries);
        if queries.is_empty() {
            bail!("composition plan needs at least one non-empty search query");
        }
        Ok(Self {
            caption: caption.into().trim().to_string(),
            queries,
            layout,
            resolution,
            background_removal,
        })
    }

    /// Plan used when the request could not be interpreted: one panel, the
    /// literal input as caption, the input itself as the search query.
    pub fn fallback(request: &MemeRequest, background_removal: bool) -> Self {
        let text = request.text.trim();
        let query = if text.is_empty() { "meme" } else { text };
        Self {
            caption: text.to_string(),
            queries: normalize_queries([query]),
            layout: LayoutKind::Single,
            resolution: ResolutionBounds::default(),
            background_removal,
        }
    }

    pub fn caption(&self) -> &str {
        &self.caption
    }

    pub fn queries(&self) -> &[String] {
        &self.queries
    }

    pub fn layout(&self) -> LayoutKind {
        self.layout
    }

    pub fn resolution(&self) -> ResolutionBounds {
        self.resolution
    }

    pub fn background_removal(&self) -> bool {
        self.background_removal
    }

    pub fn panel_count(&self) -> usize {
        self.queries.len()
    }

    pub fn with_layout(mut self, layout: LayoutKind) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_caption(mut self, caption: impl Into<String>) -> Self {
        self.caption = caption.into().trim().to_string();
        self
    }

    pub fn with_background_removal(mut self, enabled: bool) -> Self {
        self.background_removal = enabled;
        self
    }

    pub fn with_resolution(mut self, resolution: ResolutionBounds) -> Self {
        self.resolution = resolution;
        self
    }
}

fn normalize_queries(queries: impl IntoIterator<Item = impl AsRef<str>>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for query in queries {
        let collapsed = query
            .as_ref()
            .split_whitespace()
            .collect::<Vec<&str>>()
            .join(" ");
        let trimmed: String = collapsed.chars().take(MAX_QUERY_CHARS).collect();
        if trimmed.is_empty() {
            continue;
        }
        if out
            .iter()
            .any(|existing| existing.eq_ignore_ascii_case(&trimmed))
        {
            continue;
        }
        out.push(trimmed);
        if out.len() == MAX_QUERIES {
            break;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn request_strips_control_tag() {
        let request = MemeRequest::parse("Create a meme about Mondays #Play-It-Safe");
        assert_eq!(request.text, "Create a meme about Mondays");
        assert_eq!(request.control_tag, Some(ControlTag::PlayItSafe));
        assert!(request.play_it_safe());
        assert!(request.mentions_meme());
        assert_eq!(request.raw, "Create a meme about Mondays #Play-It-Safe");
    }

    #[test]
    fn request_without_tag_has_no_control() {
        let request = MemeRequest::parse("  cat   meme ");
        assert_eq!(request.text, "cat meme");
        assert_eq!(request.control_tag, None);
    }

    #[test]
    fn plan_dedupes_and_caps_queries() -> anyhow::Result<()> {
        let plan = CompositionPlan::new(
            "caption",
            ["cat", " CAT ", "", "dog", "bird", "fish"],
            LayoutKind::Grid,
            ResolutionBounds::default(),
            false,
        )?;
        assert_eq!(plan.queries(), ["cat", "dog", "bird"]);
        assert_eq!(plan.panel_count(), 3);
        Ok(())
    }

    #[test]
    fn plan_rejects_empty_queries() {
        let result = CompositionPlan::new(
            "caption",
            ["  ", ""],
            LayoutKind::Single,
            ResolutionBounds::default(),
            false,
        );
        assert!(result.is_err());
    }

    #[test]
    fn plan_deserialization_validates() {
        let bad = serde_json::from_value::<CompositionPlan>(json!({
            "caption": "x",
            "queries": [],
        }));
        assert!(bad.is_err());

        let good = serde_json::from_value::<CompositionPlan>(json!({
            "caption": "x",
            "queries": ["a"],
            "layout": "vertical",
        }))
        .ok();
        assert_eq!(good.map(|plan| plan.layout()), Some(LayoutKind::Vertical));
    }

    #[test]
    fn fallback_plan_uses_literal_text() {
        let request = MemeRequest::parse("when the build passes first try");
        let plan = CompositionPlan::fallback(&request, true);
        assert_eq!(plan.caption(), "when the build passes first try");
        assert_eq!(plan.queries(), ["when the build passes first try"]);
        assert_eq!(plan.layout(), LayoutKind::Single);
        assert!(plan.background_removal());
    }

    #[test]
    fn layout_parses_aliases() {
        assert_eq!("Side by side".parse(), Ok(LayoutKind::Horizontal));
        assert_eq!("stacked".parse(), Ok(LayoutKind::Vertical));
        assert_eq!("GRID".parse(), Ok(LayoutKind::Grid));
        assert!("diagonal".parse::<LayoutKind>().is_err());
    }

    #[test]
    fn resolution_bounds_are_clamped() {
        let bounds = ResolutionBounds::new(10, 100_000);
        assert_eq!(bounds.max_width, 64);
        assert_eq!(bounds.max_height, 4096);
    }

    #[test]
    fn stored_bounds_are_clamped_on_load() -> anyhow::Result<()> {
        let bounds: ResolutionBounds =
            serde_json::from_value(json!({"max_width": 0, "max_height": 9000}))?;
        assert_eq!(bounds, ResolutionBounds::new(64, 4096));

        let plan: CompositionPlan = serde_json::from_value(json!({
            "caption": "x",
            "queries": ["a"],
            "resolution": {"max_width": 0, "max_height": 0},
        }))?;
        assert_eq!(plan.resolution(), ResolutionBounds::new(64, 64));
        Ok(())
    }
}
