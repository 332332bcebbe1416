use std::time::Duration;

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};

use super::BriefError;
use crate::config::AiConfig;
use crate::storage::{Highlight, TIMESTAMP_FORMAT};
use crate::util::{read_limited_bytes, validate_api_endpoint, BodyError};

/// Article text above this many characters is cut before prompting.
pub const MAX_PROMPT_CHARS: usize = 24_000;
const MAX_RESPONSE_SIZE: usize = 2 * 1024 * 1024; // 2MB
const DEFAULT_VERSION: &str = "3.0";
const DEFAULT_LANGUAGE: &str = "zh-CN";
/// Ceiling on a single rate-limit backoff sleep.
pub const MAX_BACKOFF: Duration = Duration::from_secs(300);

const SYSTEM_PROMPT: &str = "You are a professional content analyst. You summarize articles \
in a structured way so readers can grasp their value quickly. Answer strictly with JSON \
matching the requested schema, with no extra explanation or Markdown.";

/// What the generator needs to know about an article.
#[derive(Debug, Clone)]
pub struct BriefInput {
    pub title: String,
    /// Display name of the feed the article came from
    pub author: String,
    pub publish_time: Option<i64>,
    pub content: String,
}

/// A parsed brief, not yet bound to an id or stored.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedBrief {
    pub model: String,
    pub summary: String,
    pub highlights: Vec<Highlight>,
    pub version: String,
    pub language: String,
    pub tags: Vec<String>,
    pub confidence: Option<f64>,
    pub generated_at: String,
}

/// Client for an OpenAI-style chat-completions endpoint.
#[derive(Clone)]
pub struct BriefGenerator {
    client: reqwest::Client,
    api_url: String,
    model: String,
    api_key: Option<SecretString>,
    timeout: Duration,
    max_retries: u32,
    retry_delay: Duration,
    backoff_base: Duration,
}

impl BriefGenerator {
    pub fn new(client: reqwest::Client, config: &AiConfig) -> Self {
        Self {
            client,
            api_url: config.api_url.clone(),
            model: config.model.clone(),
            api_key: config.resolve_api_key(),
            timeout: Duration::from_secs(config.timeout.max(1)),
            max_retries: config.max_retries.max(1),
            retry_delay: Duration::from_secs(2),
            backoff_base: Duration::from_secs(1),
        }
    }

    /// Delay between attempts after a transient failure (default 2s).
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Base of the rate-limit backoff, `2^attempt * base` (default 1s).
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    pub fn with_api_key(mut self, key: Option<SecretString>) -> Self {
        self.api_key = key;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Generate a brief, retrying transient failures up to `max_retries`
    /// total attempts.
    pub async fn generate(&self, article: &BriefInput) -> Result<GeneratedBrief, BriefError> {
        let api_key = self.api_key.as_ref().ok_or(BriefError::MissingApiKey)?;
        let endpoint = validate_api_endpoint(&self.api_url)
            .map_err(|e| BriefError::InvalidEndpoint(e.to_string()))?;

        let body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": build_user_prompt(article) },
            ],
            "temperature": 0.3,
            "max_tokens": 4000,
            "response_format": { "type": "json_object" },
        });

        let title: String = article.title.chars().take(50).collect();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            tracing::info!(
                title = %title,
                attempt = attempt,
                max_attempts = self.max_retries,
                "Requesting brief"
            );

            let err = match self.request_once(endpoint.as_str(), api_key, &body).await {
                Ok(brief) => return Ok(brief),
                Err(e) => e,
            };

            if attempt >= self.max_retries || !err.is_retryable() {
                tracing::warn!(title = %title, attempt = attempt, error = %err, "Brief generation failed");
                return Err(err);
            }

            let delay = match err {
                BriefError::RateLimited => rate_limit_backoff(self.backoff_base, attempt),
                _ => self.retry_delay,
            };
            tracing::warn!(
                title = %title,
                attempt = attempt,
                error = %err,
                delay_ms = delay.as_millis() as u64,
                "Retrying brief request"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn request_once(
        &self,
        url: &str,
        api_key: &SecretString,
        body: &Value,
    ) -> Result<GeneratedBrief, BriefError> {
        let request = self
            .client
            .post(url)
            .bearer_auth(api_key.expose_secret())
            .json(body)
            .send();

        let response = tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| BriefError::Timeout)??;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(BriefError::RateLimited);
        }
        if status.is_server_error() {
            return Err(BriefError::Server(status.as_u16()));
        }

        let read = tokio::time::timeout(self.timeout, read_limited_bytes(response, MAX_RESPONSE_SIZE))
            .await
            .map_err(|_| BriefError::Timeout)?;
        let bytes = match read {
            Ok(bytes) => bytes,
            Err(BodyError::Network(e)) => return Err(BriefError::Network(e)),
            Err(e) => return Err(BriefError::InvalidResponse(e.to_string())),
        };

        if !status.is_success() {
            let text: String = String::from_utf8_lossy(&bytes).chars().take(200).collect();
            return Err(BriefError::Rejected {
                status: status.as_u16(),
                body: text,
            });
        }

        parse_completion(&bytes, &self.model)
    }
}

/// `2^attempt * base`, capped at [`MAX_BACKOFF`].
fn rate_limit_backoff(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt))
        .min(MAX_BACKOFF)
}

fn build_user_prompt(article: &BriefInput) -> String {
    let published = article
        .publish_time
        .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0))
        .unwrap_or_else(Utc::now)
        .to_rfc3339();

    let (content, notice) = truncate_content(&article.content);

    format!(
        r#"Write a structured brief for the article below. Output JSON matching schema v3.0:

{{
  "meta": {{
    "version": "3.0",
    "language": "<language of the article, e.g. zh-CN>",
    "generated_at": "<optional ISO8601 timestamp>",
    "tags": ["<optional keywords>"],
    "confidence": "<optional, a number between 0 and 1 or high/medium/low>"
  }},
  "summary": "Overview of the whole article stating its main points",
  "highlights": [
    {{
      "title": "Short, focused title of a key point",
      "description": "What the point says, and its cause or impact"
    }}
  ]
}}

Requirements:
1. "summary" covers the core points of the article, with no length limit.
2. "highlights" has between 1 and 6 entries, each explained.
3. Output nothing but the JSON above, keeping field names and order.
4. Stay objective. If the text is missing or insufficient, say so instead of inventing details.
5. Use only the provided text. Do not cite outside knowledge or guess facts.

Title: {title}
Author: {author}
Published: {published}
Content:
{content}{notice}"#,
        title = article.title,
        author = article.author,
        published = published,
        content = content,
        notice = notice,
    )
}

/// Cut content to [`MAX_PROMPT_CHARS`] characters, returning the kept text
/// and a notice for the model when anything was dropped.
pub(crate) fn truncate_content(content: &str) -> (&str, String) {
    match content.char_indices().nth(MAX_PROMPT_CHARS) {
        Some((byte_idx, _)) => {
            let total = content.chars().count();
            (
                &content[..byte_idx],
                format!(
                    "\n\n[Note: content truncated. Original length {} characters, showing the first {}.]",
                    total, MAX_PROMPT_CHARS
                ),
            )
        }
        None => (content, String::new()),
    }
}

// ============================================================================
// Response parsing
// ============================================================================

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawBrief {
    meta: RawMeta,
    summary: Option<String>,
    highlights: Value,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawMeta {
    version: Option<String>,
    language: Option<String>,
    generated_at: Value,
    tags: Value,
    confidence: Value,
}

fn parse_completion(bytes: &[u8], model: &str) -> Result<GeneratedBrief, BriefError> {
    let response: ChatResponse = serde_json::from_slice(bytes)
        .map_err(|e| BriefError::InvalidResponse(format!("not a chat completion: {}", e)))?;

    let content = response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| BriefError::InvalidResponse("no message content".to_string()))?;

    parse_brief(&content, model)
}

/// Parse the model's JSON answer, tolerating markdown code fences.
pub(crate) fn parse_brief(content: &str, model: &str) -> Result<GeneratedBrief, BriefError> {
    let cleaned = extract_json_object(content);
    let raw: RawBrief = serde_json::from_str(cleaned).map_err(|e| {
        let preview: String = cleaned.chars().take(200).collect();
        tracing::debug!(preview = %preview, "Unparsable brief body");
        BriefError::InvalidResponse(format!("brief is not valid JSON: {}", e))
    })?;

    let highlights: Vec<Highlight> = match &raw.highlights {
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_object)
            .map(|h| Highlight {
                title: string_field(h.get("title")),
                detail: h
                    .get("description")
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .unwrap_or_else(|| string_field(h.get("detail"))),
            })
            .collect(),
        _ => Vec::new(),
    };

    let summary = raw.summary.unwrap_or_default();
    if summary.trim().is_empty() && highlights.is_empty() {
        return Err(BriefError::InvalidResponse(
            "brief has neither summary nor highlights".to_string(),
        ));
    }

    let tags = match &raw.meta.tags {
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    };

    Ok(GeneratedBrief {
        model: model.to_string(),
        summary,
        highlights,
        version: raw
            .meta
            .version
            .unwrap_or_else(|| DEFAULT_VERSION.to_string()),
        language: raw
            .meta
            .language
            .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string()),
        tags,
        confidence: normalize_confidence(&raw.meta.confidence),
        generated_at: parse_generated_at(&raw.meta.generated_at)
            .unwrap_or_else(Utc::now)
            .format(TIMESTAMP_FORMAT)
            .to_string(),
    })
}

fn string_field(value: Option<&Value>) -> String {
    value
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_default()
}

/// Find the JSON object in a reply, skipping code fences or prose around it.
fn extract_json_object(content: &str) -> &str {
    let trimmed = content.trim();
    match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if start < end => &trimmed[start..=end],
        _ => trimmed,
    }
}

/// Map a confidence value onto [0, 1].
///
/// Numbers (or numeric strings) in range pass through; the qualitative
/// labels high/medium/low (and 高/中/低) map to 0.9/0.7/0.5.
pub fn normalize_confidence(value: &Value) -> Option<f64> {
    let in_range = |v: f64| (0.0..=1.0).contains(&v).then_some(v);
    match value {
        Value::Number(n) => n.as_f64().and_then(in_range),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "high" | "高" => Some(0.9),
            "medium" | "中" => Some(0.7),
            "low" | "低" => Some(0.5),
            other => other.parse::<f64>().ok().and_then(in_range),
        },
        _ => None,
    }
}

fn parse_generated_at(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0)),
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                s.trim()
                    .parse::<f64>()
                    .ok()
                    .and_then(|ts| DateTime::<Utc>::from_timestamp(ts as i64, 0))
            }),
        _ => None,
    }
}
