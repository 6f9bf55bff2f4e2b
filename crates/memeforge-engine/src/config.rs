use std::env;
use std::path::PathBuf;
use std::time::Duration;

use memeforge_contracts::plan::ResolutionBounds;

use crate::error::ConfigurationError;

pub const DEFAULT_GROQ_API_BASE: &str = "https://api.groq.com/openai/v1";
pub const DEFAULT_GROQ_MODEL: &str = "mixtral-8x7b-32768";
pub const DEFAULT_XAI_API_BASE: &str = "https://api.x.ai/v1";
pub const DEFAULT_XAI_MODEL: &str = "grok-beta";
pub const DEFAULT_SEARCH_API_BASE: &str = "https://www.googleapis.com";

/// Which provider family the engine wires up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProviderMode {
    #[default]
    Live,
    /// Offline providers: deterministic plans, synthetic images, no network.
    Dryrun,
}

/// Everything the engine needs, built once at startup and handed to each
/// component. Credentials stay optional here; a component asks for the one
/// it needs on first use and reports [`ConfigurationError`] if it is absent.
#[derive(Debug, Clone)]
pub struct MemeConfig {
    pub mode: ProviderMode,
    pub groq_api_key: Option<String>,
    pub groq_api_base: String,
    pub groq_model: String,
    pub xai_api_key: Option<String>,
    pub xai_api_base: String,
    pub xai_model: String,
    pub search_api_key: Option<String>,
    pub search_engine_id: Option<String>,
    pub search_api_base: String,
    pub cache_dir: PathBuf,
    pub font_path: Option<PathBuf>,
    pub resolution: ResolutionBounds,
    pub llm_timeout: Duration,
    pub search_timeout: Duration,
    pub fetch_timeout: Duration,
    pub fetch_retries: usize,
    pub retry_backoff: Duration,
    pub search_candidates: usize,
}

impl Default for MemeConfig {
    fn default() -> Self {
        Self {
            mode: ProviderMode::Live,
            groq_api_key: None,
            groq_api_base: DEFAULT_GROQ_API_BASE.to_string(),
            groq_model: DEFAULT_GROQ_MODEL.to_string(),
            xai_api_key: None,
            xai_api_base: DEFAULT_XAI_API_BASE.to_string(),
            xai_model: DEFAULT_XAI_MODEL.to_string(),
            search_api_key: None,
            search_engine_id: None,
            search_api_base: DEFAULT_SEARCH_API_BASE.to_string(),
            cache_dir: PathBuf::from("cache"),
            font_path: None,
            resolution: ResolutionBounds::default(),
            llm_timeout: Duration::from_secs(30),
            search_timeout: Duration::from_secs(15),
            fetch_timeout: Duration::from_secs(10),
            fetch_retries: 2,
            retry_backoff: Duration::from_millis(500),
            search_candidates: 5,
        }
    }
}

impl MemeConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            mode: defaults.mode,
            groq_api_key: non_empty_env("GROQ_API_KEY"),
            groq_api_base: api_base_env("GROQ_API_BASE", DEFAULT_GROQ_API_BASE),
            groq_model: non_empty_env("GROQ_MODEL").unwrap_or(defaults.groq_model),
            xai_api_key: non_empty_env("XAI_API_KEY").or_else(|| non_empty_env("GROK_API_KEY")),
            xai_api_base: api_base_env("XAI_API_BASE", DEFAULT_XAI_API_BASE),
            xai_model: non_empty_env("XAI_MODEL").unwrap_or(defaults.xai_model),
            search_api_key: non_empty_env("GOOGLE_SEARCH_API_KEY"),
            search_engine_id: non_empty_env("GOOGLE_SEARCH_ENGINE_ID"),
            search_api_base: api_base_env("GOOGLE_SEARCH_API_BASE", DEFAULT_SEARCH_API_BASE),
            cache_dir: non_empty_env("MEME_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.cache_dir),
            font_path: non_empty_env("MEME_FONT_PATH").map(PathBuf::from),
            resolution: defaults.resolution,
            llm_timeout: defaults.llm_timeout,
            search_timeout: defaults.search_timeout,
            fetch_timeout: defaults.fetch_timeout,
            fetch_retries: env_f64("MEME_FETCH_RETRIES", 2.0, 0.0, 5.0).round() as usize,
            retry_backoff: Duration::from_secs_f64(env_f64("MEME_RETRY_BACKOFF", 0.5, 0.0, 10.0)),
            search_candidates: defaults.search_candidates,
        }
    }

    pub fn dryrun(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            mode: ProviderMode::Dryrun,
            cache_dir: cache_dir.into(),
            retry_backoff: Duration::ZERO,
            ..Self::default()
        }
    }

    pub fn images_dir(&self) -> PathBuf {
        self.cache_dir.join("images")
    }

    pub fn search_index_path(&self) -> PathBuf {
        self.cache_dir.join("search_index.json")
    }

    pub fn require_groq_key(&self) -> Result<&str, ConfigurationError> {
        require(self.groq_api_key.as_deref(), "GROQ_API_KEY")
    }

    pub fn require_xai_key(&self) -> Result<&str, ConfigurationError> {
        require(self.xai_api_key.as_deref(), "XAI_API_KEY")
    }

    pub fn require_search_credentials(&self) -> Result<(&str, &str), ConfigurationError> {
        let key = require(self.search_api_key.as_deref(), "GOOGLE_SEARCH_API_KEY")?;
        let engine = require(self.search_engine_id.as_deref(), "GOOGLE_SEARCH_ENGINE_ID")?;
        Ok((key, engine))
    }
}

fn require<'a>(value: Option<&'a str>, name: &'static str) -> Result<&'a str, ConfigurationError> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or(ConfigurationError::MissingCredential { name })
}

pub(crate) fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn api_base_env(key: &str, default: &str) -> String {
    non_empty_env(key)
        .map(|value| value.trim_end_matches('/').to_string())
        .unwrap_or_else(|| default.to_string())
}

fn env_f64(key: &'static str, default: f64, min: f64, max: f64) -> f64 {
    let Some(raw) = non_empty_env(key) else {
        return default;
    };
    match parse_number_setting(key, &raw, min, max) {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!(error = %err, default, "ignoring configured value");
            default
        }
    }
}

/// Parses a numeric setting and clamps it into `[min, max]`.
pub(crate) fn parse_number_setting(
    name: &'static str,
    raw: &str,
    min: f64,
    max: f64,
) -> Result<f64, ConfigurationError> {
    let raw = raw.trim();
    let value = raw
        .parse::<f64>()
        .map_err(|err| ConfigurationError::InvalidValue {
            name,
            reason: format!("'{raw}' is not a number ({err})"),
        })?;
    if !value.is_finite() {
        return Err(ConfigurationError::InvalidValue {
            name,
            reason: format!("'{raw}' is not a finite number"),
        });
    }
    Ok(value.clamp(min, max))
}
