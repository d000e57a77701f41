//! LLM client
//!
//! One client covers every supported wire format:
//! - OpenAI chat completions (OpenAI, DeepSeek, Azure, local-compatible)
//! - Anthropic messages
//! - Google Gemini generateContent
//!
//! The cacheable/dynamic context split, retry policy, timeout, and
//! cancellation behavior are identical across formats; only request and
//! response shapes differ.

use super::cache::{CacheDecision, CacheStats, PromptCache};
use super::context::DecisionContext;
use super::{GeneratedOrders, OrderProvider, ProviderKind, ProviderSettings, TokenUsage};
use crate::config::ThinkingBudget;
use crate::error::{EngineError, Result};
use crate::orders::parser;
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use reqwest::{Client as HttpClient, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

/// Backoff ceiling for the single transient retry.
const MAX_BACKOFF: Duration = Duration::from_secs(8);

pub struct LlmClient {
    settings: ProviderSettings,
    http: HttpClient,
    cache: Mutex<PromptCache>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl LlmClient {
    pub fn new(settings: ProviderSettings) -> Result<Self> {
        let http = HttpClient::builder()
            .user_agent("batcom/0.1")
            .build()
            .map_err(|e| EngineError::Config {
                message: format!("failed to build HTTP client: {}", e),
            })?;
        Ok(Self {
            settings,
            http,
            cache: Mutex::new(PromptCache::new()),
            cancel: Mutex::new(None),
        })
    }

    pub fn settings(&self) -> &ProviderSettings {
        &self.settings
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .lock()
            .as_ref()
            .map(|t| t.is_cancelled())
            .unwrap_or(false)
    }

    /// One attempt plus at most one retry on a transient failure, with
    /// jittered backoff capped at 8 seconds and Retry-After respected.
    async fn send_with_retry<F>(&self, build: F) -> Result<Response>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut attempt = 0u32;
        loop {
            if self.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            let outcome: Result<Response> = match timeout(self.settings.timeout, build().send()).await {
                Err(_) => Err(EngineError::Timeout {
                    timeout: self.settings.timeout,
                }),
                Ok(Err(e)) => Err(EngineError::ProviderUnavailable {
                    message: e.to_string(),
                }),
                Ok(Ok(response)) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    Err(self.map_error_status(status, response).await)
                }
            };

            let err = outcome.expect_err("success returns above");
            if !err.is_retryable() || attempt >= 1 {
                return Err(err);
            }
            attempt += 1;

            let base = err.retry_delay().unwrap_or(Duration::from_secs(2));
            let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..500));
            let delay = (base + jitter).min(MAX_BACKOFF);
            crate::warn_log!(
                "{} call failed ({}), retrying in {:?}",
                self.settings.kind,
                err,
                delay
            );

            let token = self.cancel.lock().clone();
            if let Some(token) = token {
                tokio::select! {
                    _ = sleep(delay) => {},
                    _ = token.cancelled() => return Err(EngineError::Cancelled),
                }
            } else {
                sleep(delay).await;
            }
        }
    }

    async fn map_error_status(&self, status: StatusCode, response: Response) -> EngineError {
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);
        let body: Option<Value> = response.json().await.ok();
        let message = body
            .as_ref()
            .and_then(|v| v.get("error").and_then(|e| e.get("message")))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error")
            .to_string();

        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                EngineError::AuthFailure { message }
            }
            StatusCode::TOO_MANY_REQUESTS => EngineError::RateLimited { retry_after },
            s if s.is_server_error() => EngineError::ProviderUnavailable {
                message: format!("HTTP {}: {}", s, message),
            },
            s => EngineError::MalformedResponse {
                message: format!("HTTP {}: {}", s, message),
            },
        }
    }

    /// Reconcile the prompt cache with the current cacheable content and
    /// return the handle id to advertise to the provider. Cache trouble is
    /// never fatal; we fall back to inline context.
    fn cache_key_for(&self, cacheable: &str) -> Option<String> {
        if !self.settings.kind.supports_caching() {
            return None;
        }
        let mut cache = self.cache.lock();
        match cache.ensure(cacheable) {
            CacheDecision::Created(id) => {
                crate::info_log!(
                    "Cacheable context changed ({} chars), new cache handle {}",
                    cacheable.len(),
                    id
                );
                Some(id)
            }
            CacheDecision::Reused(id) => Some(id),
        }
    }

    // =========================================================================
    // OpenAI-compatible wire format
    // =========================================================================

    async fn call_openai_compat(
        &self,
        cacheable: &str,
        dynamic: &str,
        cache_key: Option<&str>,
        probe: bool,
    ) -> Result<(String, TokenUsage, Option<String>, Value)> {
        let url = match self.settings.kind {
            ProviderKind::AzureOpenAi => format!(
                "{}/openai/deployments/{}/chat/completions?api-version=2024-02-15-preview",
                self.settings.endpoint.trim_end_matches('/'),
                self.settings.model
            ),
            _ => format!(
                "{}/chat/completions",
                self.settings.endpoint.trim_end_matches('/')
            ),
        };

        let messages = if probe {
            vec![OpenAiMessage {
                role: "user".into(),
                content: dynamic.to_string(),
            }]
        } else {
            vec![
                OpenAiMessage {
                    role: "system".into(),
                    content: cacheable.to_string(),
                },
                OpenAiMessage {
                    role: "user".into(),
                    content: dynamic.to_string(),
                },
            ]
        };

        let thinking = &self.settings.thinking;
        let reasoning_effort = (thinking.enabled
            && thinking.mode == "openai_compat"
            && thinking.reasoning_effort != "none")
            .then(|| thinking.reasoning_effort.clone());

        let body = OpenAiRequest {
            model: self.settings.model.clone(),
            messages,
            max_tokens: Some(self.settings.max_output_tokens),
            temperature: if reasoning_effort.is_some() {
                None
            } else {
                Some(0.4)
            },
            reasoning_effort,
            prompt_cache_key: cache_key.map(|k| k.to_string()),
        };
        let raw_request = serde_json::to_value(&body)?;

        let response = self
            .send_with_retry(|| {
                let mut req = self.http.post(&url).json(&body);
                req = match self.settings.kind {
                    ProviderKind::AzureOpenAi => req.header("api-key", &self.settings.api_key),
                    _ => {
                        if self.settings.api_key.is_empty() {
                            req
                        } else {
                            req.bearer_auth(&self.settings.api_key)
                        }
                    }
                };
                req
            })
            .await?;

        let text = response
            .text()
            .await
            .map_err(|e| EngineError::ProviderUnavailable {
                message: e.to_string(),
            })?;
        let parsed: OpenAiResponse =
            serde_json::from_str(&text).map_err(|e| EngineError::MalformedResponse {
                message: format!("OpenAI-format body unreadable: {}", e),
            })?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::MalformedResponse {
                message: "no choices in response".into(),
            })?;
        let thoughts = choice.message.reasoning_content.filter(|s| !s.is_empty());
        let content = choice.message.content.unwrap_or_default();

        let usage = parsed
            .usage
            .map(|u| TokenUsage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
                cached_input_tokens: u
                    .prompt_tokens_details
                    .map(|d| d.cached_tokens)
                    .unwrap_or(0),
                total_tokens: u.total_tokens,
                ..Default::default()
            })
            .unwrap_or_default();

        Ok((content, usage, thoughts, raw_request))
    }

    // =========================================================================
    // Anthropic messages wire format
    // =========================================================================

    async fn call_anthropic(
        &self,
        cacheable: &str,
        dynamic: &str,
        probe: bool,
    ) -> Result<(String, TokenUsage, Option<String>, Value)> {
        let url = self.settings.endpoint.clone();

        let system = (!probe).then(|| {
            vec![AnthropicSystemBlock {
                block_type: "text".into(),
                text: cacheable.to_string(),
                cache_control: Some(json!({"type": "ephemeral"})),
            }]
        });

        let thinking = &self.settings.thinking;
        let thinking_block = (thinking.enabled && thinking.mode == "native_sdk")
            .then(|| match thinking.budget {
                ThinkingBudget::Tokens(n) => {
                    Some(json!({"type": "enabled", "budget_tokens": n}))
                }
                ThinkingBudget::Dynamic => {
                    Some(json!({"type": "enabled", "budget_tokens": 4096}))
                }
                ThinkingBudget::Disabled => None,
            })
            .flatten();

        let body = AnthropicRequest {
            model: self.settings.model.clone(),
            max_tokens: self.settings.max_output_tokens,
            temperature: if thinking_block.is_some() { 1.0 } else { 0.4 },
            system,
            messages: vec![AnthropicMessage {
                role: "user".into(),
                content: dynamic.to_string(),
            }],
            thinking: thinking_block,
        };
        let raw_request = serde_json::to_value(&body)?;

        let response = self
            .send_with_retry(|| {
                self.http
                    .post(&url)
                    .header("x-api-key", &self.settings.api_key)
                    .header("anthropic-version", "2023-06-01")
                    .json(&body)
            })
            .await?;

        let parsed: AnthropicResponse =
            response
                .json()
                .await
                .map_err(|e| EngineError::MalformedResponse {
                    message: format!("Anthropic body unreadable: {}", e),
                })?;

        let mut text_parts = Vec::new();
        let mut thought_parts = Vec::new();
        for block in parsed.content {
            match block.block_type.as_str() {
                "text" => text_parts.push(block.text.unwrap_or_default()),
                "thinking" => thought_parts.push(block.thinking.unwrap_or_default()),
                _ => {}
            }
        }

        let usage = parsed
            .usage
            .map(|u| TokenUsage {
                input_tokens: u.input_tokens,
                output_tokens: u.output_tokens,
                cached_input_tokens: u.cache_read_input_tokens,
                total_tokens: u.input_tokens + u.output_tokens,
                ..Default::default()
            })
            .unwrap_or_default();

        let thoughts = (!thought_parts.is_empty()).then(|| thought_parts.join("\n"));
        Ok((text_parts.join(""), usage, thoughts, raw_request))
    }

    // =========================================================================
    // Gemini generateContent wire format
    // =========================================================================

    async fn call_gemini(
        &self,
        cacheable: &str,
        dynamic: &str,
        probe: bool,
    ) -> Result<(String, TokenUsage, Option<String>, Value)> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.settings.endpoint.trim_end_matches('/'),
            self.settings.model,
            self.settings.api_key
        );

        let thinking = &self.settings.thinking;
        let thinking_config = (thinking.enabled && thinking.mode == "native_sdk").then(|| {
            let budget = match thinking.budget {
                ThinkingBudget::Dynamic => -1i64,
                ThinkingBudget::Disabled => 0,
                ThinkingBudget::Tokens(n) => n as i64,
            };
            GeminiThinkingConfig {
                thinking_budget: budget,
                include_thoughts: thinking.include_thoughts,
            }
        });

        let body = GeminiRequest {
            system_instruction: (!probe).then(|| GeminiContent {
                role: "system".into(),
                parts: vec![GeminiPart {
                    text: cacheable.to_string(),
                    thought: None,
                }],
            }),
            contents: vec![GeminiContent {
                role: "user".into(),
                parts: vec![GeminiPart {
                    text: dynamic.to_string(),
                    thought: None,
                }],
            }],
            generation_config: Some(GeminiGenerationConfig {
                max_output_tokens: Some(self.settings.max_output_tokens),
                temperature: Some(0.4),
                thinking_config,
            }),
        };
        let raw_request = serde_json::to_value(&body)?;

        let response = self
            .send_with_retry(|| {
                self.http
                    .post(&url)
                    .header("content-type", "application/json")
                    .json(&body)
            })
            .await?;

        let parsed: GeminiResponse =
            response
                .json()
                .await
                .map_err(|e| EngineError::MalformedResponse {
                    message: format!("Gemini body unreadable: {}", e),
                })?;

        let candidate = parsed
            .candidates
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::MalformedResponse {
                message: "no candidates in response".into(),
            })?;

        // Parts flagged thought=true are reasoning summaries, the rest is
        // the answer.
        let mut answers = Vec::new();
        let mut thought_parts = Vec::new();
        for part in candidate.content.parts {
            if part.thought.unwrap_or(false) {
                thought_parts.push(part.text);
            } else {
                answers.push(part.text);
            }
        }

        let usage = parsed
            .usage_metadata
            .map(|u| TokenUsage {
                input_tokens: u.prompt_token_count,
                output_tokens: u.candidates_token_count + u.thoughts_token_count,
                cached_input_tokens: u.cached_content_token_count,
                total_tokens: u.total_token_count,
                ..Default::default()
            })
            .unwrap_or_default();

        let thoughts = (!thought_parts.is_empty()).then(|| thought_parts.join("\n"));
        Ok((answers.join("\n"), usage, thoughts, raw_request))
    }

    async fn dispatch(
        &self,
        cacheable: &str,
        dynamic: &str,
        cache_key: Option<&str>,
        probe: bool,
    ) -> Result<(String, TokenUsage, Option<String>, Value)> {
        match self.settings.kind {
            ProviderKind::Gemini => self.call_gemini(cacheable, dynamic, probe).await,
            ProviderKind::Anthropic => self.call_anthropic(cacheable, dynamic, probe).await,
            ProviderKind::OpenAi
            | ProviderKind::DeepSeek
            | ProviderKind::AzureOpenAi
            | ProviderKind::LocalCompat => {
                self.call_openai_compat(cacheable, dynamic, cache_key, probe)
                    .await
            }
        }
    }
}

#[async_trait]
impl OrderProvider for LlmClient {
    async fn generate_orders(&self, ctx: &DecisionContext) -> Result<GeneratedOrders> {
        let cacheable = ctx.cacheable_text();
        let dynamic = ctx.dynamic_text();
        let cache_key = self.cache_key_for(&cacheable);

        let started = std::time::Instant::now();
        let (text, mut usage, thoughts, raw_request) = self
            .dispatch(&cacheable, &dynamic, cache_key.as_deref(), false)
            .await?;
        usage.latency_ms = started.elapsed().as_millis() as u64;
        usage.provider = self.settings.kind.to_string();
        usage.model = self.settings.model.clone();
        if usage.total_tokens == 0 {
            usage.total_tokens = usage.input_tokens + usage.output_tokens;
        }

        // A reply with no parsable document is a ParseFailure: the cycle is
        // recorded empty, but it does not count against the breaker.
        let document = parser::parse_document(&text)?;

        Ok(GeneratedOrders {
            commentary: document.commentary,
            orders: document.orders,
            order_summary: document.order_summary,
            thoughts,
            usage,
            raw_text: text,
            raw_request,
        })
    }

    async fn test_connection(&self) -> Result<String> {
        let (text, _, _, _) = self
            .dispatch("", "Briefly confirm connectivity.", None, true)
            .await?;
        let greeting = text.trim().to_string();
        Ok(if greeting.is_empty() {
            format!("{} responded", self.settings.kind)
        } else {
            greeting
        })
    }

    fn supports_caching(&self) -> bool {
        self.settings.kind.supports_caching()
    }

    fn supports_thinking(&self) -> bool {
        self.settings.kind.supports_thinking()
    }

    fn provider_name(&self) -> String {
        self.settings.kind.to_string()
    }

    fn model_name(&self) -> String {
        self.settings.model.clone()
    }

    fn reset(&self) {
        self.cache.lock().invalidate();
        *self.cancel.lock() = None;
    }

    fn set_cancel_token(&self, token: CancellationToken) {
        *self.cancel.lock() = Some(token);
    }

    fn cache_stats(&self) -> CacheStats {
        self.cache.lock().stats()
    }
}

// OpenAI-compatible API types
#[derive(Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning_effort: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    prompt_cache_key: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct OpenAiMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiResponseMessage,
}

#[derive(Deserialize)]
struct OpenAiResponseMessage {
    #[serde(default)]
    content: Option<String>,
    /// Reasoning text from thinking-capable OpenAI-compatible models
    #[serde(default)]
    reasoning_content: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
    #[serde(default)]
    prompt_tokens_details: Option<OpenAiPromptTokensDetails>,
}

#[derive(Deserialize)]
struct OpenAiPromptTokensDetails {
    #[serde(default)]
    cached_tokens: u64,
}

// Anthropic API types
#[derive(Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<Vec<AnthropicSystemBlock>>,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking: Option<Value>,
}

#[derive(Serialize)]
struct AnthropicSystemBlock {
    #[serde(rename = "type")]
    block_type: String,
    text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    cache_control: Option<Value>,
}

#[derive(Serialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Deserialize)]
struct AnthropicContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    thinking: Option<String>,
}

#[derive(Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: u64,
}

// Gemini API types
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GeminiGenerationConfig>,
}

#[derive(Serialize, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Serialize, Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    thought: Option<bool>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking_config: Option<GeminiThinkingConfig>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiThinkingConfig {
    thinking_budget: i64,
    include_thoughts: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    candidates: Vec<GeminiCandidate>,
    #[serde(default)]
    usage_metadata: Option<GeminiUsageMetadata>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: GeminiContent,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct GeminiUsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
    #[serde(default)]
    total_token_count: u64,
    #[serde(default)]
    cached_content_token_count: u64,
    #[serde(default)]
    thoughts_token_count: u64,
}
