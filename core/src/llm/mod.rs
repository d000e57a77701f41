//! LLM provider layer
//!
//! A uniform contract over {Gemini, OpenAI, Anthropic, DeepSeek,
//! Azure-OpenAI, local OpenAI-compatible} endpoints. Dispatch goes through
//! the `OrderProvider` capability trait rather than an inheritance tree;
//! the concrete `LlmClient` covers every wire format.

pub mod cache;
pub mod client;
pub mod context;
pub mod limits;
pub mod manager;

pub use cache::{CacheDecision, CacheStats, PromptCache};
pub use client::LlmClient;
pub use context::DecisionContext;
pub use limits::{BreakerState, CircuitBreaker, RpmLimiter};
pub use manager::ProviderManager;

use crate::config::{AiConfig, ThinkingBudget};
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio_util::sync::CancellationToken;

/// Provider family. Several families share the OpenAI chat-completions wire
/// format; they stay distinct here because auth, endpoints, caching, and
/// thinking support differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Gemini,
    OpenAi,
    Anthropic,
    DeepSeek,
    AzureOpenAi,
    /// Ollama, LM Studio, vLLM and friends
    LocalCompat,
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gemini" | "google" | "google-ai" | "google-generativeai" => Ok(ProviderKind::Gemini),
            "openai" | "gpt" => Ok(ProviderKind::OpenAi),
            "anthropic" | "claude" => Ok(ProviderKind::Anthropic),
            "deepseek" => Ok(ProviderKind::DeepSeek),
            "azure" | "azureopenai" | "azure-openai" => Ok(ProviderKind::AzureOpenAi),
            "local" | "ollama" | "lmstudio" | "openrouter" | "custom" => {
                Ok(ProviderKind::LocalCompat)
            }
            _ => Err(format!("Unknown LLM provider: {}", s)),
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProviderKind::Gemini => "gemini",
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::DeepSeek => "deepseek",
            ProviderKind::AzureOpenAi => "azure",
            ProviderKind::LocalCompat => "local",
        };
        f.write_str(name)
    }
}

impl ProviderKind {
    /// Whether the family offers native context caching worth tracking.
    pub fn supports_caching(&self) -> bool {
        !matches!(self, ProviderKind::LocalCompat)
    }

    pub fn supports_thinking(&self) -> bool {
        matches!(
            self,
            ProviderKind::Gemini | ProviderKind::OpenAi | ProviderKind::Anthropic | ProviderKind::DeepSeek
        )
    }

    pub fn default_endpoint(&self) -> &'static str {
        match self {
            ProviderKind::Gemini => "https://generativelanguage.googleapis.com",
            ProviderKind::OpenAi => "https://api.openai.com/v1",
            ProviderKind::Anthropic => "https://api.anthropic.com/v1/messages",
            ProviderKind::DeepSeek => "https://api.deepseek.com/v1",
            ProviderKind::AzureOpenAi => "",
            ProviderKind::LocalCompat => "http://localhost:11434/v1",
        }
    }
}

/// Thinking/reasoning knobs, resolved from config.
#[derive(Debug, Clone, PartialEq)]
pub struct ThinkingConfig {
    pub enabled: bool,
    /// "native_sdk" or "openai_compat"
    pub mode: String,
    pub budget: ThinkingBudget,
    /// "low" or "high" for budget-less model generations
    pub level: String,
    /// minimal | low | medium | high | none
    pub reasoning_effort: String,
    pub include_thoughts: bool,
    pub log_thoughts_to_file: bool,
}

impl ThinkingConfig {
    pub fn from_ai(ai: &AiConfig) -> Self {
        Self {
            enabled: ai.thinking_enabled,
            mode: ai.thinking_mode.clone(),
            budget: ai.thinking_budget,
            level: ai.thinking_level.clone(),
            reasoning_effort: ai.reasoning_effort.clone(),
            include_thoughts: ai.include_thoughts,
            log_thoughts_to_file: ai.log_thoughts_to_file,
        }
    }
}

/// Resolved per-provider settings, ready for the client.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub kind: ProviderKind,
    pub model: String,
    pub endpoint: String,
    pub api_key: String,
    pub timeout: std::time::Duration,
    pub max_output_tokens: u32,
    pub thinking: ThinkingConfig,
}

impl ProviderSettings {
    pub fn from_ai(ai: &AiConfig, api_key: String) -> Result<Self> {
        let kind = ProviderKind::from_str(&ai.provider).map_err(|e| {
            crate::error::EngineError::Config { message: e }
        })?;
        let endpoint = ai
            .endpoint
            .clone()
            .filter(|e| !e.trim().is_empty())
            .unwrap_or_else(|| kind.default_endpoint().to_string());
        Ok(Self {
            kind,
            model: ai.model.clone(),
            endpoint,
            api_key,
            timeout: std::time::Duration::from_secs(ai.timeout),
            max_output_tokens: ai.max_output_tokens,
            thinking: ThinkingConfig::from_ai(ai),
        })
    }
}

/// Token usage for a single call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_input_tokens: u64,
    pub total_tokens: u64,
    pub latency_ms: u64,
    pub provider: String,
    pub model: String,
}

/// What a provider call produced, post JSON extraction.
#[derive(Debug, Clone, Default)]
pub struct GeneratedOrders {
    pub commentary: String,
    /// Raw order values, not yet parsed or validated
    pub orders: Vec<serde_json::Value>,
    /// Concise per-group summary lines supplied by the model
    pub order_summary: Vec<String>,
    /// Reasoning text when thinking is enabled and thoughts are requested
    pub thoughts: Option<String>,
    pub usage: TokenUsage,
    /// Full response text, for the API call log
    pub raw_text: String,
    /// Request body as sent, for the API call log
    pub raw_request: serde_json::Value,
}

/// Capability contract every provider satisfies.
#[async_trait]
pub trait OrderProvider: Send + Sync {
    /// One decision call: context in, commentary plus raw orders out.
    async fn generate_orders(&self, ctx: &DecisionContext) -> Result<GeneratedOrders>;

    /// Cheap connectivity probe; returns the model's greeting.
    async fn test_connection(&self) -> Result<String>;

    fn supports_caching(&self) -> bool;
    fn supports_thinking(&self) -> bool;

    fn provider_name(&self) -> String;
    fn model_name(&self) -> String;

    /// Drop cache handles and in-flight bookkeeping (emergency stop).
    fn reset(&self);

    /// Install a cancellation token observed during retries and waits.
    fn set_cancel_token(&self, token: CancellationToken);

    fn cache_stats(&self) -> CacheStats;
}
