use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::atomic_file::{read_json_value, write_json_atomic};
use crate::events::now_utc_iso;

/// One candidate image returned by a search provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub url: String,
    #[serde(default)]
    pub mime: Option<String>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub byte_size: Option<u64>,
}

impl SearchHit {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            mime: None,
            width: None,
            height: None,
            byte_size: None,
        }
    }
}

/// Memoised search results stored as one JSON object keyed by
/// `provider:normalised query`.
///
/// Writes merge only the keys this instance touched into whatever is on
/// disk, so two processes sharing a cache directory do not clobber each
/// other's entries.
#[derive(Debug, Clone)]
pub struct SearchIndex {
    path: PathBuf,
    payload: Option<Map<String, Value>>,
    dirty_keys: Vec<String>,
}

impl SearchIndex {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            payload: None,
            dirty_keys: Vec::new(),
        }
    }

    pub fn key(provider: &str, query: &str) -> String {
        let normalized = query
            .split_whitespace()
            .collect::<Vec<&str>>()
            .join(" ")
            .to_lowercase();
        format!("{provider}:{normalized}")
    }

    pub fn get(&mut self, key: &str) -> Option<Vec<SearchHit>> {
        let payload = self.ensure_loaded();
        let hits = payload.get(key)?.get("hits")?.clone();
        serde_json::from_value(hits).ok()
    }

    pub fn set(&mut self, key: &str, hits: &[SearchHit]) -> anyhow::Result<()> {
        let hits = serde_json::to_value(hits)?;
        let payload = self.ensure_loaded();
        if payload.get(key).and_then(|entry| entry.get("hits")) == Some(&hits) {
            return Ok(());
        }
        let mut entry = Map::new();
        entry.insert("hits".to_string(), hits);
        entry.insert("cached_at".to_string(), Value::String(now_utc_iso()));
        payload.insert(key.to_string(), Value::Object(entry));
        if !self.dirty_keys.iter().any(|existing| existing == key) {
            self.dirty_keys.push(key.to_string());
        }
        self.flush()
    }

    pub fn flush(&mut self) -> anyhow::Result<()> {
        if self.dirty_keys.is_empty() {
            return Ok(());
        }
        let Some(payload) = &self.payload else {
            return Ok(());
        };

        let mut on_disk = read_object(&self.path);
        for key in &self.dirty_keys {
            if let Some(value) = payload.get(key) {
                on_disk.insert(key.clone(), value.clone());
            }
        }
        write_json_atomic(&self.path, &Value::Object(on_disk.clone()))?;
        self.payload = Some(on_disk);
        self.dirty_keys.clear();
        Ok(())
    }

    fn ensure_loaded(&mut self) -> &mut Map<String, Value> {
        let fresh = read_object(&self.path);
        self.payload.insert(fresh)
    }
}

fn read_object(path: &std::path::Path) -> Map<String, Value> {
    read_json_value(path)
        .and_then(|value| value.as_object().cloned())
        .unwrap_or_default()
}
