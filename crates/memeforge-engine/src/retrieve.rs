//! Image Retriever: search, quality filter, fetch with retry, cache.

use std::collections::HashSet;
use std::io::Cursor;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use image::{ImageFormat, Rgba, RgbaImage};
use memeforge_contracts::events::{EventKind, EventWriter};
use memeforge_contracts::plan::CompositionPlan;
use memeforge_contracts::session::search_index::{SearchHit, SearchIndex};
use reqwest::blocking::Client as HttpClient;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::cache::{CachedImage, ImageCache};
use crate::config::MemeConfig;
use crate::error::{ConfigurationError, RetrievalError};
use crate::{map_object, response_json_or_error, truncate_text};

pub const ACCEPTED_MIME_TYPES: [&str; 4] = ["image/jpeg", "image/png", "image/webp", "image/gif"];
pub const MIN_SOURCE_DIMENSION: u32 = 200;
const FALLBACK_QUERY_WORDS: usize = 5;
const DRYRUN_SCHEME: &str = "dryrun://";

pub trait ImageSearch: Send + Sync {
    fn name(&self) -> &str;
    fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedBytes {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    /// Timeouts, refused connections, 429 and 5xx. Worth another attempt.
    #[error("transient fetch failure")]
    Transient(#[source] anyhow::Error),
    #[error("fetch failed")]
    Permanent(#[source] anyhow::Error),
}

pub trait ImageFetcher: Send + Sync {
    fn fetch(&self, url: &str) -> Result<FetchedBytes, FetchError>;
}

/// Google Custom Search JSON API in image mode.
pub struct GoogleImageSearch {
    api_base: String,
    api_key: Option<String>,
    engine_id: Option<String>,
    timeout: Duration,
    http: HttpClient,
}

impl GoogleImageSearch {
    pub fn new(config: &MemeConfig) -> Self {
        Self {
            api_base: config.search_api_base.trim_end_matches('/').to_string(),
            api_key: config.search_api_key.clone(),
            engine_id: config.search_engine_id.clone(),
            timeout: config.search_timeout,
            http: HttpClient::new(),
        }
    }

    fn parse_hits(payload: &Value) -> Vec<SearchHit> {
        let Some(items) = payload.get("items").and_then(Value::as_array) else {
            return Vec::new();
        };
        items
            .iter()
            .filter_map(|item| {
                let url = item.get("link").and_then(Value::as_str)?.trim();
                if url.is_empty() {
                    return None;
                }
                let meta = item.get("image");
                let dim = |key: &str| {
                    meta.and_then(|value| value.get(key))
                        .and_then(Value::as_u64)
                        .and_then(|value| u32::try_from(value).ok())
                };
                Some(SearchHit {
                    url: url.to_string(),
                    mime: item.get("mime").and_then(Value::as_str).map(str::to_string),
                    width: dim("width"),
                    height: dim("height"),
                    byte_size: meta
                        .and_then(|value| value.get("byteSize"))
                        .and_then(Value::as_u64),
                })
            })
            .collect()
    }
}

impl ImageSearch for GoogleImageSearch {
    fn name(&self) -> &str {
        "google"
    }

    fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        let api_key = self
            .api_key
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .ok_or(ConfigurationError::MissingCredential {
                name: "GOOGLE_SEARCH_API_KEY",
            })?;
        let engine_id = self
            .engine_id
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .ok_or(ConfigurationError::MissingCredential {
                name: "GOOGLE_SEARCH_ENGINE_ID",
            })?;
        let endpoint = format!("{}/customsearch/v1", self.api_base);
        let num = limit.clamp(1, 10).to_string();
        let response = self
            .http
            .get(&endpoint)
            .query(&[
                ("key", api_key),
                ("cx", engine_id),
                ("q", query),
                ("searchType", "image"),
                ("safe", "active"),
                ("num", num.as_str()),
            ])
            .timeout(self.timeout)
            .send()
            .with_context(|| format!("Google image search request failed ({endpoint})"))?;
        let payload = response_json_or_error("Google image search", response)?;
        Ok(Self::parse_hits(&payload))
    }
}

/// Offline search: every query yields a fixed list of `dryrun://` URLs that
/// [`DryrunFetcher`] knows how to render.
#[derive(Debug, Default, Clone)]
pub struct DryrunImageSearch;

impl ImageSearch for DryrunImageSearch {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        let slug = query
            .split(|ch: char| !ch.is_ascii_alphanumeric())
            .filter(|part| !part.is_empty())
            .collect::<Vec<&str>>()
            .join("-")
            .to_ascii_lowercase();
        if slug.is_empty() {
            return Ok(Vec::new());
        }
        Ok((0..limit.max(1))
            .map(|idx| SearchHit {
                url: format!("{DRYRUN_SCHEME}{slug}/{idx}"),
                mime: Some("image/png".to_string()),
                width: Some(640),
                height: Some(480),
                byte_size: None,
            })
            .collect())
    }
}

pub struct HttpFetcher {
    timeout: Duration,
    http: HttpClient,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            http: HttpClient::new(),
        }
    }
}

impl ImageFetcher for HttpFetcher {
    fn fetch(&self, url: &str) -> Result<FetchedBytes, FetchError> {
        let response = self
            .http
            .get(url)
            .timeout(self.timeout)
            .send()
            .map_err(|err| {
                let transient = err.is_timeout() || err.is_connect() || err.is_request();
                let err = anyhow::Error::new(err).context(format!("failed downloading {url}"));
                if transient {
                    FetchError::Transient(err)
                } else {
                    FetchError::Permanent(err)
                }
            })?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(status_fetch_error(status, &body));
        }
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes()
            .map_err(|err| {
                FetchError::Transient(
                    anyhow::Error::new(err).context(format!("failed reading body of {url}")),
                )
            })?
            .to_vec();
        Ok(FetchedBytes {
            bytes,
            content_type,
        })
    }
}

/// 429 and 5xx are worth retrying; any other failing status is final.
fn status_fetch_error(status: StatusCode, body: &str) -> FetchError {
    let err = anyhow::anyhow!(
        "image download failed ({}): {}",
        status.as_u16(),
        truncate_text(body, 256)
    );
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        FetchError::Transient(err)
    } else {
        FetchError::Permanent(err)
    }
}

/// Renders a deterministic PNG for `dryrun://` URLs: a diagonal gradient
/// whose colours come from the URL digest.
#[derive(Debug, Clone)]
pub struct DryrunFetcher {
    pub width: u32,
    pub height: u32,
}

impl Default for DryrunFetcher {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
        }
    }
}

impl ImageFetcher for DryrunFetcher {
    fn fetch(&self, url: &str) -> Result<FetchedBytes, FetchError> {
        if !url.starts_with(DRYRUN_SCHEME) {
            return Err(FetchError::Permanent(anyhow::anyhow!(
                "dryrun fetcher cannot load {url}"
            )));
        }
        let digest = Sha256::digest(url.as_bytes());
        let (from, to) = (
            [digest[0], digest[1], digest[2]],
            [digest[3], digest[4], digest[5]],
        );
        let span = (self.width + self.height).max(1) as f32;
        let image = RgbaImage::from_fn(self.width, self.height, |x, y| {
            let t = (x + y) as f32 / span;
            let mix = |a: u8, b: u8| (a as f32 + (b as f32 - a as f32) * t).round() as u8;
            Rgba([mix(from[0], to[0]), mix(from[1], to[1]), mix(from[2], to[2]), 255])
        });
        let mut bytes = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .map_err(|err| FetchError::Permanent(anyhow::Error::new(err)))?;
        Ok(FetchedBytes {
            bytes,
            content_type: Some("image/png".to_string()),
        })
    }
}

/// Images found for a plan, in query order.
#[derive(Debug, Clone)]
pub struct Retrieved {
    pub images: Vec<CachedImage>,
    pub warnings: Vec<String>,
}

pub struct Retriever {
    search: Box<dyn ImageSearch>,
    fetcher: Box<dyn ImageFetcher>,
    cache: ImageCache,
    index: SearchIndex,
    events: EventWriter,
    fetch_retries: usize,
    retry_backoff: Duration,
    candidates: usize,
}

impl Retriever {
    pub fn new(
        config: &MemeConfig,
        search: Box<dyn ImageSearch>,
        fetcher: Box<dyn ImageFetcher>,
        events: EventWriter,
    ) -> Self {
        Self {
            search,
            fetcher,
            cache: ImageCache::new(config.images_dir()),
            index: SearchIndex::new(config.search_index_path()),
            events,
            fetch_retries: config.fetch_retries,
            retry_backoff: config.retry_backoff,
            candidates: config.search_candidates.max(1),
        }
    }

    pub fn cache(&self) -> &ImageCache {
        &self.cache
    }

    /// Finds one image per plan query.
    ///
    /// A query with no usable image is retried once with the fallback query
    /// derived from the caption (see [`fallback_query`]); if that also fails
    /// the panel is dropped. Any shortfall is reported as
    /// [`RetrievalError::Shortfall`] carrying the images that were found.
    pub fn retrieve(&mut self, plan: &CompositionPlan) -> Result<Retrieved, RetrievalError> {
        let requested = plan.panel_count();
        let mut images: Vec<CachedImage> = Vec::new();
        let mut warnings: Vec<String> = Vec::new();
        let mut used_urls: HashSet<String> = HashSet::new();
        let mut used_queries: Vec<String> = plan
            .queries()
            .iter()
            .map(|query| query.to_lowercase())
            .collect();
        let fallback = fallback_query(plan.caption());

        for query in plan.queries() {
            let mut found = self.image_for_query(query, &mut used_urls, &mut warnings)?;
            if found.is_none() {
                if let Some(fallback) = fallback
                    .as_deref()
                    .filter(|candidate| !used_queries.iter().any(|used| used == candidate))
                {
                    used_queries.push(fallback.to_string());
                    warnings.push(format!(
                        "No usable image for '{query}'; trying fallback query '{fallback}'."
                    ));
                    found = self.image_for_query(fallback, &mut used_urls, &mut warnings)?;
                }
            }
            match found {
                Some(image) => images.push(image),
                None => warnings.push(format!("Dropped the panel for '{query}'.")),
            }
        }

        if images.len() < requested {
            return Err(RetrievalError::Shortfall {
                requested,
                images,
                warnings,
            });
        }
        Ok(Retrieved { images, warnings })
    }

    fn image_for_query(
        &mut self,
        query: &str,
        used_urls: &mut HashSet<String>,
        warnings: &mut Vec<String>,
    ) -> Result<Option<CachedImage>, RetrievalError> {
        let key = SearchIndex::key(self.search.name(), query);
        let mut stale_urls: HashSet<String> = HashSet::new();
        if let Some(hits) = self.index.get(&key).filter(|hits| !hits.is_empty()) {
            self.events.emit_quiet(
                EventKind::SearchCached,
                map_object(json!({ "query": query, "hits": hits.len() })),
            );
            stale_urls.extend(hits.iter().map(|hit| hit.url.clone()));
            if let Some(image) = self.first_usable(query, hits, used_urls, warnings)? {
                return Ok(Some(image));
            }
            tracing::info!(query, "stored search results are stale; searching again");
        }
        let mut hits = self.fresh_search(&key, query, warnings)?;
        hits.retain(|hit| !stale_urls.contains(&hit.url));
        self.first_usable(query, hits, used_urls, warnings)
    }

    /// First candidate, in search order, that is cached or can be fetched.
    fn first_usable(
        &mut self,
        query: &str,
        hits: Vec<SearchHit>,
        used_urls: &mut HashSet<String>,
        warnings: &mut Vec<String>,
    ) -> Result<Option<CachedImage>, RetrievalError> {
        let candidates = hits
            .into_iter()
            .filter(hit_passes_filter)
            .filter(|hit| !used_urls.contains(&hit.url))
            .take(self.candidates)
            .collect::<Vec<SearchHit>>();

        for hit in candidates {
            match self.cache.get(&hit.url) {
                Ok(Some(image)) => {
                    self.events.emit_quiet(
                        EventKind::ImageCacheHit,
                        map_object(json!({ "url": hit.url, "query": query })),
                    );
                    used_urls.insert(hit.url);
                    return Ok(Some(image));
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(
                        url = %hit.url,
                        error = %err,
                        "image cache read failed; refetching"
                    );
                }
            }

            let fetched = match self.fetch_with_retry(&hit.url) {
                Ok(fetched) => fetched,
                Err(err) => {
                    tracing::warn!(url = %hit.url, error = ?err, "image fetch failed");
                    warnings.push(format!("Skipped {}: {}", hit.url, fetch_error_text(&err)));
                    continue;
                }
            };
            if let Err(reason) = check_fetched(&fetched, &hit.url) {
                warnings.push(format!("Skipped {}: {reason}", hit.url));
                continue;
            }

            let image = self
                .cache
                .put(&hit.url, fetched.bytes, fetched.content_type)
                .map_err(RetrievalError::Cache)?;
            self.events.emit_quiet(
                EventKind::ImageFetched,
                map_object(json!({
                    "url": image.source_url,
                    "query": query,
                    "bytes": image.bytes.len(),
                    "content_type": image.content_type,
                })),
            );
            used_urls.insert(hit.url);
            return Ok(Some(image));
        }
        Ok(None)
    }

    /// Asks the search provider and replaces whatever the index held for
    /// `key`, so dead results are not served again.
    fn fresh_search(
        &mut self,
        key: &str,
        query: &str,
        warnings: &mut Vec<String>,
    ) -> Result<Vec<SearchHit>, RetrievalError> {
        let hits = match self.search.search(query, self.candidates) {
            Ok(hits) => hits,
            Err(err) => {
                if let Some(config_err) = err.downcast_ref::<ConfigurationError>() {
                    return Err(RetrievalError::Configuration(config_err.clone()));
                }
                let detail = format!("{err:#}");
                tracing::warn!(query, error = %detail, "image search failed");
                warnings.push(format!("Image search for '{query}' failed."));
                return Ok(Vec::new());
            }
        };
        if let Err(err) = self.index.set(key, &hits) {
            tracing::warn!(query, error = %err, "failed caching search results");
        }
        Ok(hits)
    }

    fn fetch_with_retry(&self, url: &str) -> Result<FetchedBytes, FetchError> {
        let mut attempt = 0;
        loop {
            match self.fetcher.fetch(url) {
                Ok(fetched) => return Ok(fetched),
                Err(FetchError::Transient(err)) if attempt < self.fetch_retries => {
                    attempt += 1;
                    let delay = self.retry_backoff * attempt as u32;
                    self.events.emit_quiet(
                        EventKind::FetchRetry,
                        map_object(json!({
                            "url": url,
                            "attempt": attempt,
                            "max_retries": self.fetch_retries,
                            "delay_ms": delay.as_millis() as u64,
                            "error": format!("{err:#}"),
                        })),
                    );
                    thread::sleep(delay);
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// First few alphanumeric words of the caption, lower-cased. Used when a
/// query finds nothing usable.
pub fn fallback_query(caption: &str) -> Option<String> {
    let words = caption
        .split(|ch: char| !ch.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .take(FALLBACK_QUERY_WORDS)
        .map(str::to_lowercase)
        .collect::<Vec<String>>();
    if words.is_empty() {
        None
    } else {
        Some(words.join(" "))
    }
}

pub fn normalize_mime(raw: &str) -> String {
    let base = raw
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match base.as_str() {
        "image/jpg" | "image/pjpeg" => "image/jpeg".to_string(),
        _ => base,
    }
}

fn mime_from_url(url: &str) -> Option<&'static str> {
    let path = url.split(['?', '#']).next().unwrap_or_default();
    let ext = path.rsplit_once('.')?.1.to_ascii_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        _ => None,
    }
}

fn is_accepted_mime(mime: &str) -> bool {
    ACCEPTED_MIME_TYPES.contains(&normalize_mime(mime).as_str())
}

/// Metadata-level filter applied before anything is downloaded.
pub fn hit_passes_filter(hit: &SearchHit) -> bool {
    let mime_ok = match hit.mime.as_deref() {
        Some(mime) if !mime.trim().is_empty() => is_accepted_mime(mime),
        _ => hit.url.starts_with(DRYRUN_SCHEME) || mime_from_url(&hit.url).is_some(),
    };
    let big_enough = hit.width.map_or(true, |w| w >= MIN_SOURCE_DIMENSION)
        && hit.height.map_or(true, |h| h >= MIN_SOURCE_DIMENSION);
    let non_empty = hit.byte_size.map_or(true, |size| size > 0);
    mime_ok && big_enough && non_empty
}

fn check_fetched(fetched: &FetchedBytes, url: &str) -> Result<(), String> {
    if fetched.bytes.is_empty() {
        return Err("empty response body".to_string());
    }
    match fetched.content_type.as_deref() {
        Some(content_type) if !is_accepted_mime(content_type) => {
            Err(format!("unsupported content type {content_type}"))
        }
        Some(_) => Ok(()),
        None => {
            tracing::debug!(url, "no content type; leaving the decode check to the compositor");
            Ok(())
        }
    }
}

fn fetch_error_text(err: &FetchError) -> String {
    match err {
        FetchError::Transient(inner) | FetchError::Permanent(inner) => {
            truncate_text(&format!("{inner:#}"), 200)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use memeforge_contracts::plan::{LayoutKind, ResolutionBounds};

    use super::*;

    #[derive(Default, Clone)]
    struct FakeSearch {
        results: HashMap<String, Vec<SearchHit>>,
        calls: Arc<AtomicUsize>,
    }

    impl FakeSearch {
        fn with(mut self, query: &str, urls: &[&str]) -> Self {
            self.results.insert(
                query.to_string(),
                urls.iter().map(|url| SearchHit::new(*url)).collect(),
            );
            self
        }
    }

    impl ImageSearch for FakeSearch {
        fn name(&self) -> &str {
            "fake"
        }

        fn search(&self, query: &str, _limit: usize) -> Result<Vec<SearchHit>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.results.get(query).cloned().unwrap_or_default())
        }
    }

    /// Serves a small PNG for every URL in `ok`; every other URL fails
    /// transiently `transient_failures` times, then permanently.
    #[derive(Default, Clone)]
    struct FakeFetcher {
        ok: Vec<String>,
        flaky: HashMap<String, usize>,
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl FakeFetcher {
        fn serving(urls: &[&str]) -> Self {
            Self {
                ok: urls.iter().map(|url| url.to_string()).collect(),
                ..Self::default()
            }
        }

        fn calls_for(&self, url: &str) -> usize {
            self.calls
                .lock()
                .map(|calls| calls.iter().filter(|call| *call == url).count())
                .unwrap_or_default()
        }
    }

    impl ImageFetcher for FakeFetcher {
        fn fetch(&self, url: &str) -> Result<FetchedBytes, FetchError> {
            let previous = self.calls_for(url);
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(url.to_string());
            }
            if let Some(failures) = self.flaky.get(url) {
                if previous < *failures {
                    return Err(FetchError::Transient(anyhow::anyhow!("timeout")));
                }
            } else if !self.ok.iter().any(|ok| ok == url) {
                return Err(FetchError::Permanent(anyhow::anyhow!("404")));
            }
            Ok(FetchedBytes {
                bytes: format!("bytes-of-{url}").into_bytes(),
                content_type: Some("image/png".to_string()),
            })
        }
    }

    fn retriever(
        temp: &tempfile::TempDir,
        search: FakeSearch,
        fetcher: FakeFetcher,
    ) -> Retriever {
        let mut config = MemeConfig::dryrun(temp.path());
        config.fetch_retries = 2;
        Retriever::new(
            &config,
            Box::new(search),
            Box::new(fetcher),
            EventWriter::disabled(),
        )
    }

    fn plan(caption: &str, queries: &[&str]) -> CompositionPlan {
        CompositionPlan::new(
            caption,
            queries.iter().copied(),
            LayoutKind::Horizontal,
            ResolutionBounds::default(),
            false,
        )
        .unwrap_or_else(|err| panic!("invalid test plan: {err}"))
    }

    #[test]
    fn second_retrieval_hits_cache_without_network() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let search = FakeSearch::default().with("cat", &["https://img/cat.png"]);
        let fetcher = FakeFetcher::serving(&["https://img/cat.png"]);
        let mut retriever = retriever(&temp, search.clone(), fetcher.clone());

        let first = retriever.retrieve(&plan("CAT", &["cat"]))?;
        let second = retriever.retrieve(&plan("CAT", &["cat"]))?;

        assert_eq!(fetcher.calls_for("https://img/cat.png"), 1);
        assert_eq!(search.calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.images[0].bytes, second.images[0].bytes);
        assert_eq!(first.images[0].cache_path, second.images[0].cache_path);
        Ok(())
    }

    /// Returns a dead link on the first search and a live one afterwards.
    #[derive(Default, Clone)]
    struct RelinkingSearch {
        calls: Arc<AtomicUsize>,
    }

    impl ImageSearch for RelinkingSearch {
        fn name(&self) -> &str {
            "relinking"
        }

        fn search(&self, _query: &str, _limit: usize) -> Result<Vec<SearchHit>> {
            let url = if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                "https://img/dead.png"
            } else {
                "https://img/alive.png"
            };
            Ok(vec![SearchHit::new(url)])
        }
    }

    #[test]
    fn stale_search_results_trigger_a_new_search() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let search = RelinkingSearch::default();
        let fetcher = FakeFetcher::serving(&["https://img/alive.png"]);
        let make = |search: &RelinkingSearch| {
            let config = MemeConfig::dryrun(temp.path());
            Retriever::new(
                &config,
                Box::new(search.clone()),
                Box::new(fetcher.clone()),
                EventWriter::disabled(),
            )
        };

        let mut retriever = make(&search);
        let first = retriever.retrieve(&plan("CAT", &["cat"]));
        assert!(matches!(first, Err(RetrievalError::Shortfall { .. })));

        let second = retriever.retrieve(&plan("CAT", &["cat"]))?;
        assert_eq!(second.images[0].source_url, "https://img/alive.png");
        assert_eq!(search.calls.load(Ordering::SeqCst), 2);
        assert_eq!(fetcher.calls_for("https://img/dead.png"), 2);

        let third = make(&search).retrieve(&plan("CAT", &["cat"]))?;
        assert_eq!(third.images[0].source_url, "https://img/alive.png");
        assert_eq!(search.calls.load(Ordering::SeqCst), 2);
        assert_eq!(fetcher.calls_for("https://img/alive.png"), 1);
        Ok(())
    }

    #[test]
    fn transient_failures_are_retried() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let search = FakeSearch::default().with("dog", &["https://img/dog.png"]);
        let mut fetcher = FakeFetcher::default();
        fetcher.flaky.insert("https://img/dog.png".to_string(), 2);
        let mut retriever = retriever(&temp, search, fetcher.clone());

        let retrieved = retriever.retrieve(&plan("DOG", &["dog"]))?;
        assert_eq!(retrieved.images.len(), 1);
        assert_eq!(fetcher.calls_for("https://img/dog.png"), 3);
        Ok(())
    }

    #[test]
    fn retries_are_bounded() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let search = FakeSearch::default().with("dog", &["https://img/dog.png"]);
        let mut fetcher = FakeFetcher::default();
        fetcher.flaky.insert("https://img/dog.png".to_string(), 10);
        let mut retriever = retriever(&temp, search, fetcher.clone());

        let result = retriever.retrieve(&plan("DOG", &["dog"]));
        assert!(matches!(result, Err(RetrievalError::Shortfall { .. })));
        assert_eq!(fetcher.calls_for("https://img/dog.png"), 3);
        Ok(())
    }

    #[test]
    fn permanent_failure_moves_to_next_candidate() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let search = FakeSearch::default().with(
            "frog",
            &["https://img/missing.png", "https://img/frog.png"],
        );
        let fetcher = FakeFetcher::serving(&["https://img/frog.png"]);
        let mut retriever = retriever(&temp, search, fetcher.clone());

        let retrieved = retriever.retrieve(&plan("FROG", &["frog"]))?;
        assert_eq!(retrieved.images[0].source_url, "https://img/frog.png");
        assert_eq!(fetcher.calls_for("https://img/missing.png"), 1);
        Ok(())
    }

    #[test]
    fn empty_query_uses_caption_fallback() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let search = FakeSearch::default()
            .with("cat", &["https://img/cat.png"])
            .with("monday mood", &["https://img/monday.png"]);
        let fetcher = FakeFetcher::serving(&["https://img/cat.png", "https://img/monday.png"]);
        let mut retriever = retriever(&temp, search, fetcher);

        let retrieved = retriever.retrieve(&plan("MONDAY MOOD!", &["cat", "nothing here"]))?;
        let urls: Vec<&str> = retrieved
            .images
            .iter()
            .map(|image| image.source_url.as_str())
            .collect();
        assert_eq!(urls, vec!["https://img/cat.png", "https://img/monday.png"]);
        assert!(retrieved
            .warnings
            .iter()
            .any(|warning| warning.contains("fallback query 'monday mood'")));
        Ok(())
    }

    #[test]
    fn shortfall_carries_partial_images() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let search = FakeSearch::default().with("cat", &["https://img/cat.png"]);
        let fetcher = FakeFetcher::serving(&["https://img/cat.png"]);
        let mut retriever = retriever(&temp, search, fetcher);

        let result = retriever.retrieve(&plan("CAT", &["cat", "ghost", "phantom"]));
        match result {
            Err(RetrievalError::Shortfall {
                requested,
                images,
                warnings,
            }) => {
                assert_eq!(requested, 3);
                assert_eq!(images.len(), 1);
                assert!(warnings.iter().any(|w| w.contains("Dropped the panel for 'ghost'")));
            }
            other => panic!("expected shortfall, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn same_url_is_not_reused_across_panels() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let search = FakeSearch::default()
            .with("cat", &["https://img/cat.png"])
            .with("kitten", &["https://img/cat.png", "https://img/kitten.png"]);
        let fetcher = FakeFetcher::serving(&["https://img/cat.png", "https://img/kitten.png"]);
        let mut retriever = retriever(&temp, search, fetcher);

        let retrieved = retriever.retrieve(&plan("CATS", &["cat", "kitten"]))?;
        assert_eq!(retrieved.images[1].source_url, "https://img/kitten.png");
        Ok(())
    }

    #[test]
    fn missing_search_credentials_are_fatal() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let config = MemeConfig {
            cache_dir: temp.path().to_path_buf(),
            ..MemeConfig::default()
        };
        let mut retriever = Retriever::new(
            &config,
            Box::new(GoogleImageSearch::new(&config)),
            Box::new(FakeFetcher::default()),
            EventWriter::disabled(),
        );
        let result = retriever.retrieve(&plan("CAT", &["cat"]));
        assert!(matches!(
            result,
            Err(RetrievalError::Configuration(
                ConfigurationError::MissingCredential {
                    name: "GOOGLE_SEARCH_API_KEY"
                }
            ))
        ));
        Ok(())
    }

    #[test]
    fn download_status_decides_retry() {
        let classify = |code: u16| {
            let status = StatusCode::from_u16(code).unwrap_or(StatusCode::IM_A_TEAPOT);
            match status_fetch_error(status, "nope") {
                FetchError::Transient(err) => ("transient", format!("{err}")),
                FetchError::Permanent(err) => ("permanent", format!("{err}")),
            }
        };
        assert_eq!(classify(404).0, "permanent");
        assert_eq!(classify(403).0, "permanent");
        assert_eq!(classify(429).0, "transient");
        assert_eq!(classify(503).0, "transient");
        assert_eq!(classify(503).1, "image download failed (503): nope");
    }

    #[test]
    fn quality_filter_rules() {
        let mut hit = SearchHit::new("https://img/a.jpg");
        assert!(hit_passes_filter(&hit));

        hit.width = Some(120);
        assert!(!hit_passes_filter(&hit));

        let mut typed = SearchHit::new("https://img/no-extension");
        assert!(!hit_passes_filter(&typed));
        typed.mime = Some("image/JPG; charset=binary".to_string());
        assert!(hit_passes_filter(&typed));
        typed.mime = Some("image/svg+xml".to_string());
        assert!(!hit_passes_filter(&typed));

        let mut empty = SearchHit::new("https://img/a.png");
        empty.byte_size = Some(0);
        assert!(!hit_passes_filter(&empty));
    }

    #[test]
    fn google_hits_parse_metadata() {
        let payload = json!({
            "items": [
                {"link": "https://img/a.jpg", "mime": "image/jpeg",
                 "image": {"width": 800, "height": 600, "byteSize": 1234}},
                {"link": "  "},
                {"title": "no link"}
            ]
        });
        let hits = GoogleImageSearch::parse_hits(&payload);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].width, Some(800));
        assert_eq!(hits[0].byte_size, Some(1234));
        assert_eq!(hits[0].mime.as_deref(), Some("image/jpeg"));
    }

    #[test]
    fn fallback_query_takes_leading_words() {
        assert_eq!(
            fallback_query("WHEN THE CODE COMPILES, ON THE FIRST TRY").as_deref(),
            Some("when the code compiles on")
        );
        assert_eq!(fallback_query("!!!"), None);
    }

    #[test]
    fn dryrun_pipeline_produces_decodable_png() -> anyhow::Result<()> {
        let hits = DryrunImageSearch.search("Grumpy Cat", 2)?;
        assert_eq!(hits[0].url, "dryrun://grumpy-cat/0");
        let fetched = DryrunFetcher::default()
            .fetch(&hits[0].url)
            .map_err(|err| anyhow::anyhow!("{err:?}"))?;
        let decoded = image::load_from_memory(&fetched.bytes)?;
        assert_eq!((decoded.width(), decoded.height()), (640, 480));
        assert!(DryrunFetcher::default().fetch("https://real/url.png").is_err());
        Ok(())
    }
}
