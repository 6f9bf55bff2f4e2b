use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::atomic_file::{read_json_value, write_json_atomic};
use crate::events::now_utc_iso;
use crate::plan::{CompositionPlan, MemeRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnKind {
    Meme,
    Reply,
    Failed,
}

/// One chat turn. Failed meme requests are kept with `error` set so the
/// history shows every request the user made.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub request: MemeRequest,
    pub kind: TurnKind,
    pub reply: String,
    #[serde(default)]
    pub plan: Option<CompositionPlan>,
    #[serde(default)]
    pub artifact_path: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl HistoryEntry {
    pub fn meme(
        request: MemeRequest,
        reply: impl Into<String>,
        plan: CompositionPlan,
        artifact_path: Option<String>,
        warnings: Vec<String>,
    ) -> Self {
        Self {
            request,
            kind: TurnKind::Meme,
            reply: reply.into(),
            plan: Some(plan),
            artifact_path,
            error: None,
            warnings,
        }
    }

    pub fn reply(request: MemeRequest, reply: impl Into<String>) -> Self {
        Self {
            request,
            kind: TurnKind::Reply,
            reply: reply.into(),
            plan: None,
            artifact_path: None,
            error: None,
            warnings: Vec::new(),
        }
    }

    pub fn failed(
        request: MemeRequest,
        reply: impl Into<String>,
        plan: Option<CompositionPlan>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            request,
            kind: TurnKind::Failed,
            reply: reply.into(),
            plan,
            artifact_path: None,
            error: Some(error.into()),
            warnings: Vec::new(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatHistory {
    pub path: PathBuf,
    pub schema_version: u64,
    pub session_id: String,
    pub created_at: String,
    pub entries: Vec<HistoryEntry>,
}

impl ChatHistory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            schema_version: 1,
            session_id: Uuid::new_v4().to_string(),
            created_at: now_utc_iso(),
            entries: Vec::new(),
        }
    }

    /// Loads `path`, keeping whatever entries still parse. A missing or
    /// corrupt file yields an empty history.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut history = Self::new(path.clone());
        let payload = read_json_value(&path).unwrap_or(Value::Object(Map::new()));
        let Some(obj) = payload.as_object() else {
            return history;
        };

        history.schema_version = obj
            .get("schema_version")
            .and_then(Value::as_u64)
            .unwrap_or(history.schema_version);
        history.session_id = obj
            .get("session_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or(history.session_id);
        history.created_at = obj
            .get("created_at")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or(history.created_at);

        if let Some(entries) = obj.get("entries").and_then(Value::as_array) {
            for item in entries {
                match serde_json::from_value::<HistoryEntry>(item.clone()) {
                    Ok(entry) => history.entries.push(entry),
                    Err(err) => tracing::warn!(error = %err, "skipping unreadable history entry"),
                }
            }
        }
        history
    }

    pub fn load_or_new(path: &Path) -> Self {
        if path.exists() {
            Self::load(path)
        } else {
            Self::new(path)
        }
    }

    pub fn push(&mut self, entry: HistoryEntry) -> &HistoryEntry {
        self.entries.push(entry);
        &self.entries[self.entries.len() - 1]
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn meme_count(&self) -> u64 {
        self.count_kind(TurnKind::Meme)
    }

    pub fn failure_count(&self) -> u64 {
        self.count_kind(TurnKind::Failed)
    }

    pub fn reply_count(&self) -> u64 {
        self.count_kind(TurnKind::Reply)
    }

    fn count_kind(&self, kind: TurnKind) -> u64 {
        self.entries.iter().filter(|entry| entry.kind == kind).count() as u64
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let mut payload = Map::new();
        payload.insert(
            "schema_version".to_string(),
            Value::Number(self.schema_version.into()),
        );
        payload.insert(
            "session_id".to_string(),
            Value::String(self.session_id.clone()),
        );
        payload.insert(
            "created_at".to_string(),
            Value::String(self.created_at.clone()),
        );
        payload.insert(
            "entries".to_string(),
            serde_json::to_value(&self.entries)?,
        );
        write_json_atomic(&self.path, &Value::Object(payload))
    }
}
