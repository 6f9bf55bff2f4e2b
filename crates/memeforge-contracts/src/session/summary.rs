use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::atomic_file::write_json_atomic;
use crate::events::now_utc_iso;
use crate::session::history::ChatHistory;

/// Counts written to `summary.json` when a chat session ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub memes: u64,
    pub failures: u64,
    pub replies: u64,
    pub artifacts: Vec<String>,
}

impl SessionSummary {
    pub fn from_history(history: &ChatHistory, started_at: impl Into<String>) -> Self {
        Self {
            session_id: history.session_id.clone(),
            started_at: started_at.into(),
            finished_at: now_utc_iso(),
            memes: history.meme_count(),
            failures: history.failure_count(),
            replies: history.reply_count(),
            artifacts: history
                .entries()
                .iter()
                .filter_map(|entry| entry.artifact_path.clone())
                .collect(),
        }
    }
}

pub fn write_summary(path: &Path, summary: &SessionSummary) -> anyhow::Result<()> {
    let mut payload = serde_json::to_value(summary)?;
    if let Value::Object(map) = &mut payload {
        map.insert(
            "history_entries".to_string(),
            Value::from(summary.memes + summary.failures + summary.replies),
        );
    }
    write_json_atomic(path, &payload)
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::{write_summary, SessionSummary};
    use crate::plan::{CompositionPlan, MemeRequest};
    use crate::session::history::{ChatHistory, HistoryEntry};

    #[test]
    fn summary_counts_every_turn_kind() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut history = ChatHistory::new(temp.path().join("history.json"));
        let request = MemeRequest::parse("cat meme");
        let plan = CompositionPlan::fallback(&request, false);
        history.push(HistoryEntry::meme(
            request,
            "Here's your meme about cat meme!",
            plan,
            Some("artifacts/meme-1.png".to_string()),
            Vec::new(),
        ));
        history.push(HistoryEntry::reply(MemeRequest::parse("hi"), "hello"));
        history.push(HistoryEntry::failed(
            MemeRequest::parse("ghost meme"),
            "no luck",
            None,
            "retrieved 0 of 1 requested images",
        ));

        let summary = SessionSummary::from_history(&history, "2026-02-19T00:00:00+00:00");
        assert_eq!(summary.session_id, history.session_id);
        assert_eq!((summary.memes, summary.replies, summary.failures), (1, 1, 1));
        assert_eq!(summary.artifacts, vec!["artifacts/meme-1.png".to_string()]);

        let path = temp.path().join("summary.json");
        write_summary(&path, &summary)?;
        let parsed: Value = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        assert_eq!(parsed["started_at"], json!("2026-02-19T00:00:00+00:00"));
        assert_eq!(parsed["history_entries"], json!(3));
        assert_eq!(parsed["artifacts"][0], json!("artifacts/meme-1.png"));
        Ok(())
    }
}
