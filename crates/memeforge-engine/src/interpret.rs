//! Request Interpreter: turns chat text into a `CompositionPlan` through
//! OpenAI-compatible chat completion providers.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use memeforge_contracts::plan::{CompositionPlan, LayoutKind, MemeRequest, ResolutionBounds};
use reqwest::blocking::Client as HttpClient;
use reqwest::header::CONTENT_TYPE;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use crate::config::{MemeConfig, ProviderMode};
use crate::error::{ConfigurationError, InterpretationError};
use crate::response_json_or_error;

pub const MAX_CAPTION_CHARS: usize = 120;
const ANALYSIS_MAX_TOKENS: u64 = 500;
const CAPTION_MAX_TOKENS: u64 = 100;
const DEFAULT_TEMPERATURE: f64 = 0.7;

const ANALYSIS_SYSTEM_PROMPT: &str = "You are a meme analysis expert. Given a meme request, decide:
1. A short, punchy caption for the finished meme
2. One to three image search queries, one per panel
3. A layout: single, grid, vertical or horizontal
4. Whether the subject should be cut out from its background

Return only a JSON object in exactly this format:
{\"caption\": \"...\", \"queries\": [\"...\"], \"layout\": \"single\", \"background_removal\": false}
Do not include any other text or explanation.";

const CAPTION_SYSTEM_PROMPT: &str = "You are a meme text formatter. \
Make the text punchy and meme-worthy. Reply with the caption only.";

const REPLY_SYSTEM_PROMPT: &str = "You are MemeForge, an assistant that excels at memes and jokes. \
Your responses should be creative, funny and meme-worthy.";

pub const REPLY_APOLOGY: &str = "Sorry, I'm having trouble being creative right now. Try again!";

pub const SASS_LINES: [&str; 5] = [
    "Oh, you want me to do something? How about... no. Try adding #play-it-safe if you're serious.",
    "Sorry, I only speak in memes, and I don't see a #play-it-safe tag. Try again!",
    "Error 404: Cooperation not found. Have you tried using #play-it-safe?",
    "I'm as helpful as a chocolate teapot right now. Use #play-it-safe for actual help.",
    "I'm currently in 'maximum sass' mode. Use #play-it-safe to switch to 'actually helpful' mode.",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionPurpose {
    AnalyzeRequest,
    PolishCaption,
    ChatReply,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatCompletionRequest {
    pub purpose: CompletionPurpose,
    pub system: String,
    pub user: String,
    pub temperature: f64,
    pub max_tokens: Option<u64>,
}

impl ChatCompletionRequest {
    pub fn analyze(text: &str) -> Self {
        Self {
            purpose: CompletionPurpose::AnalyzeRequest,
            system: ANALYSIS_SYSTEM_PROMPT.to_string(),
            user: text.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: Some(ANALYSIS_MAX_TOKENS),
        }
    }

    pub fn polish_caption(caption: &str) -> Self {
        Self {
            purpose: CompletionPurpose::PolishCaption,
            system: CAPTION_SYSTEM_PROMPT.to_string(),
            user: caption.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: Some(CAPTION_MAX_TOKENS),
        }
    }

    pub fn reply(text: &str) -> Self {
        Self {
            purpose: CompletionPurpose::ChatReply,
            system: REPLY_SYSTEM_PROMPT.to_string(),
            user: text.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: None,
        }
    }

    fn payload(&self, model: &str) -> Value {
        let mut payload = crate::map_object(json!({
            "model": model,
            "messages": [
                {"role": "system", "content": self.system},
                {"role": "user", "content": self.user},
            ],
            "temperature": self.temperature,
            "stream": false,
        }));
        if let Some(max_tokens) = self.max_tokens {
            payload.insert("max_tokens".to_string(), Value::from(max_tokens));
        }
        Value::Object(payload)
    }
}

pub trait TextProvider: Send + Sync {
    fn name(&self) -> &str;
    fn complete(&self, request: &ChatCompletionRequest) -> Result<String>;
}

#[derive(Default)]
pub struct TextProviderRegistry {
    providers: BTreeMap<String, Box<dyn TextProvider>>,
}

impl TextProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: TextProvider + 'static>(&mut self, provider: P) {
        self.providers
            .insert(provider.name().to_string(), Box::new(provider));
    }

    pub fn get(&self, name: &str) -> Option<&dyn TextProvider> {
        self.providers.get(name).map(|provider| provider.as_ref())
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}

/// `POST {base}/chat/completions` with bearer auth. Groq and xAI both
/// speak this dialect.
pub struct OpenAiCompatibleProvider {
    name: String,
    api_base: String,
    api_key: Option<String>,
    credential: &'static str,
    model: String,
    timeout: Duration,
    http: HttpClient,
}

impl OpenAiCompatibleProvider {
    pub fn groq(config: &MemeConfig) -> Self {
        Self {
            name: "groq".to_string(),
            api_base: config.groq_api_base.trim_end_matches('/').to_string(),
            api_key: config.groq_api_key.clone(),
            credential: "GROQ_API_KEY",
            model: config.groq_model.clone(),
            timeout: config.llm_timeout,
            http: HttpClient::new(),
        }
    }

    pub fn xai(config: &MemeConfig) -> Self {
        Self {
            name: "xai".to_string(),
            api_base: config.xai_api_base.trim_end_matches('/').to_string(),
            api_key: config.xai_api_key.clone(),
            credential: "XAI_API_KEY",
            model: config.xai_model.clone(),
            timeout: config.llm_timeout,
            http: HttpClient::new(),
        }
    }

    fn message_content(payload: &Value) -> Option<String> {
        payload
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|content| !content.is_empty())
            .map(str::to_string)
    }
}

impl TextProvider for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn complete(&self, request: &ChatCompletionRequest) -> Result<String> {
        let api_key = self
            .api_key
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .ok_or(ConfigurationError::MissingCredential {
                name: self.credential,
            })?;
        let endpoint = format!("{}/chat/completions", self.api_base);
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(api_key)
            .header(CONTENT_TYPE, "application/json")
            .timeout(self.timeout)
            .json(&request.payload(&self.model))
            .send()
            .with_context(|| format!("{} chat request failed ({endpoint})", self.name))?;
        let payload = response_json_or_error(&self.name, response)?;
        match Self::message_content(&payload) {
            Some(content) => Ok(content),
            None => bail!("{} returned no message content", self.name),
        }
    }
}

/// Offline provider: answers every purpose deterministically from the
/// request text.
#[derive(Debug, Default, Clone)]
pub struct DryrunTextProvider;

impl TextProvider for DryrunTextProvider {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn complete(&self, request: &ChatCompletionRequest) -> Result<String> {
        let text = request.user.trim();
        Ok(match request.purpose {
            CompletionPurpose::AnalyzeRequest => {
                let query = subject_words(text);
                json!({
                    "caption": text,
                    "queries": [if query.is_empty() { text.to_string() } else { query }],
                    "layout": "single",
                    "background_removal": false,
                })
                .to_string()
            }
            CompletionPurpose::PolishCaption => text.to_string(),
            CompletionPurpose::ChatReply => format!("(dryrun) You said: {text}"),
        })
    }
}

fn subject_words(text: &str) -> String {
    const FILLER: [&str; 12] = [
        "a", "an", "the", "me", "make", "create", "generate", "meme", "memes", "about", "of",
        "please",
    ];
    text.split(|ch: char| !ch.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .filter(|word| !FILLER.contains(&word.to_lowercase().as_str()))
        .map(str::to_lowercase)
        .collect::<Vec<String>>()
        .join(" ")
}

#[derive(Debug, Clone)]
pub struct Interpretation {
    pub plan: CompositionPlan,
    pub warnings: Vec<String>,
}

pub struct Interpreter {
    providers: TextProviderRegistry,
    analyst: String,
    caption_writer: Option<String>,
    conversationalist: String,
    resolution: ResolutionBounds,
}

impl Interpreter {
    pub fn new(
        providers: TextProviderRegistry,
        analyst: impl Into<String>,
        caption_writer: Option<String>,
        conversationalist: impl Into<String>,
        resolution: ResolutionBounds,
    ) -> Self {
        Self {
            providers,
            analyst: analyst.into(),
            caption_writer,
            conversationalist: conversationalist.into(),
            resolution,
        }
    }

    pub fn from_config(config: &MemeConfig) -> Self {
        let mut providers = TextProviderRegistry::new();
        match config.mode {
            ProviderMode::Dryrun => {
                providers.register(DryrunTextProvider);
                Self::new(providers, "dryrun", None, "dryrun", config.resolution)
            }
            ProviderMode::Live => {
                providers.register(OpenAiCompatibleProvider::groq(config));
                providers.register(OpenAiCompatibleProvider::xai(config));
                Self::new(
                    providers,
                    "groq",
                    Some("xai".to_string()),
                    "xai",
                    config.resolution,
                )
            }
        }
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers.names()
    }

    fn provider(&self, name: &str) -> Result<&dyn TextProvider, InterpretationError> {
        self.providers
            .get(name)
            .ok_or_else(|| InterpretationError::UnknownProvider(name.to_string()))
    }

    /// Asks the analyst for a plan, then lets the caption writer punch up
    /// the caption. Only the analysis step can fail; a failed polish keeps
    /// the analysed caption and records a warning.
    pub fn interpret(
        &self,
        request: &MemeRequest,
        background_removal: bool,
    ) -> Result<Interpretation, InterpretationError> {
        let analyst = self.provider(&self.analyst)?;
        let raw = analyst
            .complete(&ChatCompletionRequest::analyze(&request.text))
            .map_err(|err| classify_provider_error(analyst.name(), err))?;
        let plan = parse_plan_response(&raw, self.resolution, background_removal).map_err(
            |reason| InterpretationError::Malformed {
                provider: analyst.name().to_string(),
                reason,
            },
        )?;

        let mut warnings = Vec::new();
        let mut caption = clean_caption(plan.caption());
        if let Some(writer) = self.caption_writer.as_deref() {
            match self
                .provider(writer)
                .map_err(anyhow::Error::new)
                .and_then(|provider| {
                    provider.complete(&ChatCompletionRequest::polish_caption(&caption))
                })
            {
                Ok(polished) => {
                    let polished = clean_caption(&polished);
                    if !polished.is_empty() {
                        caption = polished;
                    }
                }
                Err(err) => {
                    let detail = format!("{err:#}");
                    tracing::warn!(provider = writer, error = %detail, "caption polish failed");
                    warnings.push(format!(
                        "Caption polish by {writer} failed; kept the analysed caption."
                    ));
                }
            }
        }
        tracing::debug!(caption = %caption, panels = plan.panel_count(), "request interpreted");
        Ok(Interpretation {
            plan: plan.with_caption(caption),
            warnings,
        })
    }

    /// Chat answer for a message that is not a meme request. Never fails:
    /// without the control tag the answer is a sass line, and a provider
    /// failure becomes a canned apology.
    pub fn reply(&self, request: &MemeRequest) -> String {
        if !request.play_it_safe() {
            return sass_line(&request.text).to_string();
        }
        let result = self
            .provider(&self.conversationalist)
            .map_err(anyhow::Error::new)
            .and_then(|provider| provider.complete(&ChatCompletionRequest::reply(&request.text)));
        match result {
            Ok(text) => text,
            Err(err) => {
                let detail = format!("{err:#}");
                tracing::warn!(
                    provider = %self.conversationalist,
                    error = %detail,
                    "chat reply failed"
                );
                REPLY_APOLOGY.to_string()
            }
        }
    }
}

fn classify_provider_error(provider: &str, err: anyhow::Error) -> InterpretationError {
    if let Some(config_err) = err.downcast_ref::<ConfigurationError>() {
        return InterpretationError::MissingCredential {
            provider: provider.to_string(),
            source: config_err.clone(),
        };
    }
    InterpretationError::Transport {
        provider: provider.to_string(),
        source: err,
    }
}

pub fn sass_line(text: &str) -> &'static str {
    let digest = Sha256::digest(text.trim().as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    let idx = (u64::from_be_bytes(head) % SASS_LINES.len() as u64) as usize;
    SASS_LINES[idx]
}

/// Upper-cases, strips wrapping quotes, collapses whitespace and caps the
/// caption length. Only the first non-empty line of a reply is kept.
pub fn clean_caption(raw: &str) -> String {
    let line = raw
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or_default();
    let unquoted = line.trim_matches(|ch: char| matches!(ch, '"' | '\'' | '“' | '”' | '`'));
    let collapsed = unquoted.split_whitespace().collect::<Vec<&str>>().join(" ");
    collapsed
        .to_uppercase()
        .chars()
        .take(MAX_CAPTION_CHARS)
        .collect::<String>()
        .trim()
        .to_string()
}

fn strip_code_fence(text: &str) -> String {
    let raw = text.trim();
    if !(raw.starts_with("```") && raw.ends_with("```")) {
        return raw.to_string();
    }
    let lines: Vec<&str> = raw.lines().collect();
    if lines.len() < 2 {
        return raw.trim_matches('`').trim().to_string();
    }
    let body = lines[1..lines.len() - 1].join("\n").trim().to_string();
    match body.get(..4) {
        Some(prefix) if prefix.eq_ignore_ascii_case("json") => body[4..].trim().to_string(),
        _ => body,
    }
}

pub fn extract_json_object_from_text(text: &str) -> Option<Map<String, Value>> {
    let raw = strip_code_fence(text);
    if raw.trim().is_empty() {
        return None;
    }
    let mut candidates = vec![raw.clone()];
    if let (Some(start), Some(end)) = (raw.find('{'), raw.rfind('}')) {
        if end > start {
            candidates.push(raw[start..=end].to_string());
        }
    }
    candidates.into_iter().find_map(|candidate| {
        serde_json::from_str::<Value>(&candidate)
            .ok()
            .and_then(|parsed| parsed.as_object().cloned())
    })
}

fn coerce_text_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(rows)) => rows
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        Some(Value::String(text)) => text.split(',').map(str::to_string).collect(),
        _ => Vec::new(),
    }
}

fn first_text(value: Option<&Value>) -> Option<String> {
    let text = match value {
        Some(Value::String(text)) => Some(text.as_str()),
        Some(Value::Array(rows)) => rows.iter().find_map(Value::as_str),
        _ => None,
    };
    text.map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

/// Accepts `{caption, queries, layout, background_removal}` as well as the
/// older `{subjects, search_queries, captions}` shape.
pub fn parse_plan_response(
    text: &str,
    resolution: ResolutionBounds,
    default_background_removal: bool,
) -> std::result::Result<CompositionPlan, String> {
    let object = extract_json_object_from_text(text)
        .ok_or_else(|| "response is not a JSON object".to_string())?;

    let caption = first_text(object.get("caption"))
        .or_else(|| first_text(object.get("captions")))
        .ok_or_else(|| "response has no caption".to_string())?;

    let mut queries = coerce_text_list(object.get("queries"));
    if queries.iter().all(|query| query.trim().is_empty()) {
        queries = coerce_text_list(object.get("search_queries"));
    }
    if queries.iter().all(|query| query.trim().is_empty()) {
        queries = coerce_text_list(object.get("subjects"));
    }

    let layout = object
        .get("layout")
        .and_then(Value::as_str)
        .and_then(|raw| match raw.parse::<LayoutKind>() {
            Ok(layout) => Some(layout),
            Err(err) => {
                tracing::debug!(error = %err, "ignoring layout from plan response");
                None
            }
        });
    let background_removal = object
        .get("background_removal")
        .and_then(Value::as_bool)
        .unwrap_or(default_background_removal);

    let plan = CompositionPlan::new(
        caption,
        queries,
        layout.unwrap_or_default(),
        resolution,
        background_removal,
    )
    .map_err(|err| err.to_string())?;
    if layout.is_none() && plan.panel_count() > 1 {
        return Ok(plan.with_layout(LayoutKind::Horizontal));
    }
    Ok(plan)
}
