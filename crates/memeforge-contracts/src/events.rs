use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    SessionStarted,
    PlanResolved,
    InterpretationFallback,
    SearchCached,
    ImageCacheHit,
    ImageFetched,
    FetchRetry,
    PanelsReduced,
    BackgroundRemovalFailed,
    MemeComposed,
    MemeFailed,
    ChatReply,
    SessionFinished,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::SessionStarted => "session_started",
            EventKind::PlanResolved => "plan_resolved",
            EventKind::InterpretationFallback => "interpretation_fallback",
            EventKind::SearchCached => "search_cached",
            EventKind::ImageCacheHit => "image_cache_hit",
            EventKind::ImageFetched => "image_fetched",
            EventKind::FetchRetry => "fetch_retry",
            EventKind::PanelsReduced => "panels_reduced",
            EventKind::BackgroundRemovalFailed => "background_removal_failed",
            EventKind::MemeComposed => "meme_composed",
            EventKind::MemeFailed => "meme_failed",
            EventKind::ChatReply => "chat_reply",
            EventKind::SessionFinished => "session_finished",
        }
    }
}

/// Append-only writer for the session's `events.jsonl`.
///
/// Every line is one compact JSON object carrying `type`, `session_id` and
/// `ts`, followed by the caller payload. Clones share one file lock, so the
/// writer can be handed to each component.
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<EventWriterInner>,
}

#[derive(Debug)]
struct EventWriterInner {
    path: Option<PathBuf>,
    session_id: String,
    lock: Mutex<()>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventWriterInner {
                path: Some(path.into()),
                session_id: session_id.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    /// Writer that only traces; used when a component runs outside a session.
    pub fn disabled() -> Self {
        Self {
            inner: Arc::new(EventWriterInner {
                path: None,
                session_id: String::new(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn emit(&self, kind: EventKind, payload: EventPayload) -> anyhow::Result<Value> {
        let mut event = Map::new();
        event.insert("type".to_string(), Value::String(kind.as_str().to_string()));
        event.insert(
            "session_id".to_string(),
            Value::String(self.inner.session_id.clone()),
        );
        event.insert("ts".to_string(), Value::String(now_utc_iso()));
        for (key, value) in payload {
            event.insert(key, value);
        }
        let event = Value::Object(event);
        tracing::debug!(target: "memeforge::events", event = %event, "{}", kind.as_str());

        let Some(path) = self.inner.path.as_deref() else {
            return Ok(event);
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let line = serde_json::to_string(&event)?;
        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event writer lock poisoned"))?;
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(event)
    }

    /// Emits and swallows I/O failures with a warning. Losing an event line
    /// must never fail a meme request.
    pub fn emit_quiet(&self, kind: EventKind, payload: EventPayload) {
        if let Err(err) = self.emit(kind, payload) {
            tracing::warn!(error = %err, event = kind.as_str(), "failed to append event");
        }
    }
}

/// UTC timestamp with microseconds, used for every `ts` and `*_at` field.
pub fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
