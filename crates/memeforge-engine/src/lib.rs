//! Meme generation engine: request interpretation, image retrieval,
//! composition and the chat session that ties them together.

pub mod background;
pub mod cache;
pub mod compose;
pub mod config;
pub mod error;
pub mod interpret;
pub mod retrieve;
pub mod text;

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use image::RgbaImage;
use memeforge_contracts::atomic_file::write_atomic;
use memeforge_contracts::events::{now_utc_iso, EventKind, EventWriter};
use memeforge_contracts::plan::{CompositionPlan, LayoutKind, MemeRequest};
use memeforge_contracts::session::history::{ChatHistory, HistoryEntry};
use memeforge_contracts::session::summary::{write_summary, SessionSummary};
use reqwest::blocking::Response as HttpResponse;
use serde_json::{json, Map, Value};

use crate::background::BorderFloodRemover;
use crate::compose::{encode_png, Compositor};
use crate::config::{MemeConfig, ProviderMode};
use crate::error::{MemeError, RetrievalError};
use crate::interpret::Interpreter;
use crate::retrieve::{
    DryrunFetcher, DryrunImageSearch, GoogleImageSearch, HttpFetcher, ImageFetcher, ImageSearch,
    Retriever,
};
use crate::text::GlyphSource;

pub use crate::compose::ComposedMeme;
pub use crate::error::{CompositionError, ConfigurationError, InterpretationError};

const FALLBACK_PLAN_WARNING: &str =
    "I couldn't quite read that request, so I used your words as the caption.";

/// A finished meme. The PNG already sits at `output_path`.
#[derive(Debug, Clone)]
pub struct MemeArtifact {
    pub image: RgbaImage,
    pub plan: CompositionPlan,
    pub panels: usize,
    pub output_path: PathBuf,
    pub warnings: Vec<String>,
}

/// What the chat surface shows for one user message.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatTurn {
    Meme {
        reply: String,
        artifact_path: PathBuf,
        warnings: Vec<String>,
    },
    Reply {
        text: String,
    },
    Failed {
        message: String,
    },
}

pub struct MemeEngine {
    out_dir: PathBuf,
    artifacts_dir: PathBuf,
    summary_path: PathBuf,
    started_at: String,
    events: EventWriter,
    history: ChatHistory,
    interpreter: Interpreter,
    retriever: Retriever,
    compositor: Compositor,
    background_removal: Option<bool>,
    layout_override: Option<LayoutKind>,
}

impl MemeEngine {
    pub fn new(config: MemeConfig, out_dir: impl Into<PathBuf>) -> Result<Self> {
        let interpreter = Interpreter::from_config(&config);
        let (search, fetcher): (Box<dyn ImageSearch>, Box<dyn ImageFetcher>) = match config.mode {
            ProviderMode::Live => (
                Box::new(GoogleImageSearch::new(&config)),
                Box::new(HttpFetcher::new(config.fetch_timeout)),
            ),
            ProviderMode::Dryrun => (
                Box::new(DryrunImageSearch),
                Box::new(DryrunFetcher::default()),
            ),
        };
        Self::with_providers(config, out_dir, interpreter, search, fetcher)
    }

    pub fn with_providers(
        config: MemeConfig,
        out_dir: impl Into<PathBuf>,
        interpreter: Interpreter,
        search: Box<dyn ImageSearch>,
        fetcher: Box<dyn ImageFetcher>,
    ) -> Result<Self> {
        let out_dir = out_dir.into();
        std::fs::create_dir_all(&out_dir)
            .with_context(|| format!("failed creating {}", out_dir.display()))?;
        let history = ChatHistory::load_or_new(&out_dir.join("history.json"));
        let events = EventWriter::new(out_dir.join("events.jsonl"), history.session_id.clone());
        let search_name = search.name().to_string();
        let retriever = Retriever::new(&config, search, fetcher, events.clone());
        let compositor = Compositor::new(
            Box::new(BorderFloodRemover::default()),
            GlyphSource::load(config.font_path.as_deref()),
            events.clone(),
        );

        events.emit(
            EventKind::SessionStarted,
            map_object(json!({
                "out_dir": out_dir.to_string_lossy().to_string(),
                "cache_dir": config.cache_dir.to_string_lossy().to_string(),
                "mode": match config.mode {
                    ProviderMode::Live => "live",
                    ProviderMode::Dryrun => "dryrun",
                },
                "text_providers": interpreter.provider_names(),
                "image_search": search_name,
                "history_entries": history.entries().len(),
            })),
        )?;

        Ok(Self {
            artifacts_dir: out_dir.join("artifacts"),
            summary_path: out_dir.join("summary.json"),
            out_dir,
            started_at: now_utc_iso(),
            events,
            history,
            interpreter,
            retriever,
            compositor,
            background_removal: None,
            layout_override: None,
        })
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    pub fn session_id(&self) -> &str {
        self.events.session_id()
    }

    pub fn history(&self) -> &[HistoryEntry] {
        self.history.entries()
    }

    pub fn clear_history(&mut self) -> Result<()> {
        self.history.clear();
        self.history.save()
    }

    /// `None` lets each plan decide; `Some` forces removal on or off.
    pub fn set_background_removal(&mut self, enabled: Option<bool>) {
        self.background_removal = enabled;
    }

    pub fn background_removal(&self) -> Option<bool> {
        self.background_removal
    }

    pub fn set_layout(&mut self, layout: Option<LayoutKind>) {
        self.layout_override = layout;
    }

    pub fn layout(&self) -> Option<LayoutKind> {
        self.layout_override
    }

    /// Runs one meme request end to end. Every outcome, failures included,
    /// is appended to the history.
    pub fn submit(&mut self, text: &str) -> Result<MemeArtifact, MemeError> {
        let request = MemeRequest::parse(text);
        let (plan, mut warnings) = self.resolve_plan(&request);

        match self.produce(&plan, &mut warnings) {
            Ok((composed, output_path)) => {
                let subject = plan.queries().first().cloned().unwrap_or_default();
                let reply = format!("Here's your meme about {subject}!");
                self.events.emit_quiet(
                    EventKind::MemeComposed,
                    map_object(json!({
                        "request_id": request.id,
                        "path": output_path.to_string_lossy().to_string(),
                        "panels": composed.panels(),
                        "width": composed.image.width(),
                        "height": composed.image.height(),
                        "warnings": warnings,
                    })),
                );
                self.record(HistoryEntry::meme(
                    request,
                    reply,
                    plan.clone(),
                    Some(output_path.to_string_lossy().to_string()),
                    warnings.clone(),
                ));
                Ok(MemeArtifact {
                    panels: composed.panels(),
                    image: composed.image,
                    plan,
                    output_path,
                    warnings,
                })
            }
            Err(err) => {
                let detail = error_chain_text(&err, 512);
                tracing::warn!(request_id = %request.id, error = %detail, "meme request failed");
                self.events.emit_quiet(
                    EventKind::MemeFailed,
                    map_object(json!({
                        "request_id": request.id,
                        "error": detail,
                        "warnings": warnings,
                    })),
                );
                self.record(HistoryEntry::failed(
                    request,
                    err.friendly_message(),
                    Some(plan),
                    detail,
                ));
                Err(err)
            }
        }
    }

    /// Routes one chat message. Only a `#play-it-safe` message that asks
    /// for a meme goes through [`Self::submit`]; anything else gets a
    /// conversational reply when tagged and a sass line otherwise.
    pub fn respond(&mut self, text: &str) -> ChatTurn {
        let request = MemeRequest::parse(text);
        if request.play_it_safe() && request.mentions_meme() {
            return self.meme_turn(text);
        }
        let reply = self.interpreter.reply(&request);
        self.events.emit_quiet(
            EventKind::ChatReply,
            map_object(json!({
                "request_id": request.id,
                "play_it_safe": request.play_it_safe(),
            })),
        );
        self.record(HistoryEntry::reply(request, reply.clone()));
        ChatTurn::Reply { text: reply }
    }

    /// Meme request regardless of wording, as issued by `/meme`.
    pub fn meme_turn(&mut self, text: &str) -> ChatTurn {
        match self.submit(text) {
            Ok(artifact) => ChatTurn::Meme {
                reply: self
                    .history
                    .entries()
                    .last()
                    .map(|entry| entry.reply.clone())
                    .unwrap_or_default(),
                artifact_path: artifact.output_path,
                warnings: artifact.warnings,
            },
            Err(err) => ChatTurn::Failed {
                message: err.friendly_message(),
            },
        }
    }

    pub fn finish(&mut self) -> Result<SessionSummary> {
        let summary = SessionSummary::from_history(&self.history, self.started_at.clone());
        write_summary(&self.summary_path, &summary)?;
        self.events.emit(
            EventKind::SessionFinished,
            map_object(json!({
                "summary_path": self.summary_path.to_string_lossy().to_string(),
                "memes": summary.memes,
                "failures": summary.failures,
            })),
        )?;
        Ok(summary)
    }

    fn resolve_plan(&self, request: &MemeRequest) -> (CompositionPlan, Vec<String>) {
        let background_default = self.background_removal.unwrap_or(false);
        let interpreted = self.interpreter.interpret(request, background_default);
        let (mut plan, mut warnings) = match interpreted {
            Ok(interpretation) => (interpretation.plan, interpretation.warnings),
            Err(err) => {
                let detail = error_chain_text(&err, 512);
                tracing::warn!(
                    request_id = %request.id,
                    error = %detail,
                    "interpretation failed; using fallback plan"
                );
                self.events.emit_quiet(
                    EventKind::InterpretationFallback,
                    map_object(json!({
                        "request_id": request.id,
                        "error": detail,
                    })),
                );
                (
                    CompositionPlan::fallback(request, background_default),
                    vec![FALLBACK_PLAN_WARNING.to_string()],
                )
            }
        };
        if let Some(enabled) = self.background_removal {
            plan = plan.with_background_removal(enabled);
        }
        if let Some(layout) = self.layout_override {
            plan = plan.with_layout(layout);
        }
        warnings.dedup();
        self.events.emit_quiet(
            EventKind::PlanResolved,
            map_object(json!({
                "request_id": request.id,
                "plan": serde_json::to_value(&plan).unwrap_or(Value::Null),
            })),
        );
        (plan, warnings)
    }

    fn produce(
        &mut self,
        plan: &CompositionPlan,
        warnings: &mut Vec<String>,
    ) -> Result<(ComposedMeme, PathBuf), MemeError> {
        let images = match self.retriever.retrieve(plan) {
            Ok(retrieved) => {
                warnings.extend(retrieved.warnings);
                retrieved.images
            }
            Err(RetrievalError::Shortfall {
                requested,
                images,
                warnings: retrieval_warnings,
            }) if !images.is_empty() => {
                warnings.extend(retrieval_warnings);
                self.events.emit_quiet(
                    EventKind::PanelsReduced,
                    map_object(json!({
                        "requested": requested,
                        "retrieved": images.len(),
                    })),
                );
                warnings.push(format!(
                    "Found images for {} of {requested} panels.",
                    images.len()
                ));
                images
            }
            Err(RetrievalError::Configuration(err)) => {
                return Err(MemeError::Configuration(err));
            }
            Err(err) => return Err(err.into()),
        };

        let composed = self.compositor.compose(&images, plan)?;
        warnings.extend(composed.warnings.iter().cloned());
        let bytes = encode_png(&composed.image)?;
        let output_path = self.next_artifact_path()?;
        write_atomic(&output_path, &bytes)
            .with_context(|| format!("failed writing {}", output_path.display()))?;
        Ok((composed, output_path))
    }

    fn next_artifact_path(&self) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.artifacts_dir)
            .with_context(|| format!("failed creating {}", self.artifacts_dir.display()))?;
        let stamp = timestamp_millis();
        let first = self.artifacts_dir.join(format!("meme-{stamp}.png"));
        if !first.exists() {
            return Ok(first);
        }
        for idx in 1..1000 {
            let candidate = self.artifacts_dir.join(format!("meme-{stamp}-{idx}.png"));
            if !candidate.exists() {
                return Ok(candidate);
            }
        }
        bail!("no free artifact name for meme-{stamp}")
    }

    fn record(&mut self, entry: HistoryEntry) {
        self.history.push(entry);
        if let Err(err) = self.history.save() {
            tracing::warn!(error = %err, "failed saving chat history");
        }
    }
}

pub(crate) fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{provider} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{provider} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{provider} returned invalid JSON payload"))?;
    Ok(parsed)
}

/// Joins an error and its sources, skipping repeats.
pub fn error_chain_text(err: &dyn std::error::Error, max_chars: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut current: Option<&dyn std::error::Error> = Some(err);
    while let Some(cause) = current {
        let text = cause.to_string();
        let trimmed = text.trim();
        if !trimmed.is_empty() && parts.last().map(String::as_str) != Some(trimmed) {
            parts.push(trimmed.to_string());
        }
        current = cause.source();
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn timestamp_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0)
}

pub(crate) fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}
