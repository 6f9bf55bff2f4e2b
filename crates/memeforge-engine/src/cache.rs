use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Context;
use memeforge_contracts::atomic_file::{read_json_value, write_atomic, write_json_atomic};
use memeforge_contracts::events::now_utc_iso;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

/// Raw bytes of a fetched image together with where they came from.
/// Never mutated once created.
#[derive(Clone, PartialEq, Eq)]
pub struct CachedImage {
    pub source_url: String,
    pub cache_path: PathBuf,
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
    pub fetched_at: String,
}

impl fmt::Debug for CachedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedImage")
            .field("source_url", &self.source_url)
            .field("cache_path", &self.cache_path)
            .field("bytes", &self.bytes.len())
            .field("content_type", &self.content_type)
            .field("fetched_at", &self.fetched_at)
            .finish()
    }
}

/// Append-only image store keyed by the sha256 of the source URL.
///
/// Each entry is two files: `<key>.img` with the raw bytes and `<key>.json`
/// with the metadata. The metadata is written last and both writes go
/// through temp-then-rename, so an entry is visible only once complete.
/// There is no eviction; clean the directory by hand.
#[derive(Debug, Clone)]
pub struct ImageCache {
    dir: PathBuf,
}

impl ImageCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn key_for(url: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(url.trim().as_bytes());
        hex::encode(hasher.finalize())
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.img"))
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    pub fn get(&self, url: &str) -> anyhow::Result<Option<CachedImage>> {
        let key = Self::key_for(url);
        let Some(meta) = read_json_value(&self.meta_path(&key)) else {
            return Ok(None);
        };
        if meta.get("url").and_then(Value::as_str) != Some(url.trim()) {
            return Ok(None);
        }
        let blob_path = self.blob_path(&key);
        let bytes = match std::fs::read(&blob_path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("failed reading {}", blob_path.display()))
            }
        };
        if bytes.is_empty() {
            return Ok(None);
        }
        Ok(Some(CachedImage {
            source_url: url.trim().to_string(),
            cache_path: blob_path,
            bytes,
            content_type: meta
                .get("content_type")
                .and_then(Value::as_str)
                .map(str::to_string),
            fetched_at: meta
                .get("fetched_at")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        }))
    }

    pub fn put(
        &self,
        url: &str,
        bytes: Vec<u8>,
        content_type: Option<String>,
    ) -> anyhow::Result<CachedImage> {
        let key = Self::key_for(url);
        let blob_path = self.blob_path(&key);
        let fetched_at = now_utc_iso();
        write_atomic(&blob_path, &bytes)?;
        write_json_atomic(
            &self.meta_path(&key),
            &json!({
                "url": url.trim(),
                "content_type": content_type,
                "fetched_at": fetched_at,
                "bytes": bytes.len(),
            }),
        )?;
        Ok(CachedImage {
            source_url: url.trim().to_string(),
            cache_path: blob_path,
            bytes,
            content_type,
            fetched_at,
        })
    }
}
