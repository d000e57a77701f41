//! Engine configuration
//!
//! The host passes one configuration record at `init`. A `guardrails.json`
//! file next to the data directory, when present, overlays the `ai` section
//! and is rewritten whenever the admin changes LLM settings at runtime.

use crate::error::{EngineError, Result};
use crate::model::world::{Pos, Side};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Root configuration record
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub ai: AiConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub guardrails: GuardrailsConfig,
    /// Optional ordered provider list; when non-empty it supersedes `ai`
    /// for provider selection and enables fallback.
    #[serde(default)]
    pub llm_providers: Vec<ProviderEntry>,
    /// Directory for log files and persisted state
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

fn default_data_dir() -> String {
    "batcom_data".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty EngineConfig deserializes")
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub echo_to_host_console: bool,
}

fn default_log_level() -> String {
    "INFO".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            echo_to_host_console: false,
        }
    }
}

/// Scan intervals in seconds. Advisory: the host owns the actual timers.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScanConfig {
    #[serde(default = "default_tick")]
    pub tick: f64,
    #[serde(default = "default_ai_groups")]
    pub ai_groups: f64,
    #[serde(default = "default_players")]
    pub players: f64,
    #[serde(default = "default_objectives")]
    pub objectives: f64,
}

fn default_tick() -> f64 {
    2.0
}
fn default_ai_groups() -> f64 {
    5.0
}
fn default_players() -> f64 {
    3.0
}
fn default_objectives() -> f64 {
    5.0
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            tick: default_tick(),
            ai_groups: default_ai_groups(),
            players: default_players(),
            objectives: default_objectives(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_max_messages")]
    pub max_messages_per_tick: usize,
    #[serde(default = "default_max_commands")]
    pub max_commands_per_tick: usize,
    #[serde(default = "default_max_groups")]
    pub max_controlled_groups: usize,
}

fn default_max_messages() -> usize {
    50
}
fn default_max_commands() -> usize {
    30
}
fn default_max_groups() -> usize {
    500
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_messages_per_tick: default_max_messages(),
            max_commands_per_tick: default_max_commands(),
            max_controlled_groups: default_max_groups(),
        }
    }
}

/// Thinking budget: explicit token count, provider-chosen, or off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThinkingBudget {
    Dynamic,
    Disabled,
    Tokens(u32),
}

impl Default for ThinkingBudget {
    fn default() -> Self {
        ThinkingBudget::Dynamic
    }
}

impl Serialize for ThinkingBudget {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            ThinkingBudget::Dynamic => serializer.serialize_str("dynamic"),
            ThinkingBudget::Disabled => serializer.serialize_u32(0),
            ThinkingBudget::Tokens(n) => serializer.serialize_u32(*n),
        }
    }
}

impl<'de> Deserialize<'de> for ThinkingBudget {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let v = serde_json::Value::deserialize(deserializer)?;
        match v {
            serde_json::Value::String(s) if s.eq_ignore_ascii_case("dynamic") => {
                Ok(ThinkingBudget::Dynamic)
            }
            serde_json::Value::Number(n) => {
                let n = n.as_i64().unwrap_or(-1);
                if n < 0 {
                    Ok(ThinkingBudget::Dynamic)
                } else if n == 0 {
                    Ok(ThinkingBudget::Disabled)
                } else {
                    Ok(ThinkingBudget::Tokens(n as u32))
                }
            }
            other => Err(serde::de::Error::custom(format!(
                "thinking_budget must be an integer or \"dynamic\", got {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Minimum seconds between decisions; single runtime source of truth
    #[serde(default = "default_min_interval")]
    pub min_interval: f64,
    /// Sliding-window request cap at the transport layer
    #[serde(default = "default_rpm")]
    pub rate_limit_rpm: u32,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    #[serde(default)]
    pub thinking_enabled: bool,
    #[serde(default = "default_thinking_mode")]
    pub thinking_mode: String,
    #[serde(default)]
    pub thinking_budget: ThinkingBudget,
    #[serde(default = "default_thinking_level")]
    pub thinking_level: String,
    #[serde(default = "default_reasoning_effort")]
    pub reasoning_effort: String,
    #[serde(default = "default_true")]
    pub include_thoughts: bool,
    #[serde(default = "default_true")]
    pub log_thoughts_to_file: bool,
}

fn default_true() -> bool {
    true
}
fn default_provider() -> String {
    "gemini".to_string()
}
fn default_model() -> String {
    "gemini-2.0-flash-001".to_string()
}
fn default_timeout() -> u64 {
    30
}
fn default_min_interval() -> f64 {
    30.0
}
fn default_rpm() -> u32 {
    10
}
fn default_max_output_tokens() -> u32 {
    4096
}
fn default_thinking_mode() -> String {
    "native_sdk".to_string()
}
fn default_thinking_level() -> String {
    "high".to_string()
}
fn default_reasoning_effort() -> String {
    "medium".to_string()
}

impl Default for AiConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).expect("empty AiConfig deserializes")
    }
}

impl AiConfig {
    /// Merge a partial runtime update (admin `setLLMConfig`) into this config.
    /// Unknown keys are ignored with a warning; recognized keys overwrite.
    pub fn merge_update(&mut self, update: &serde_json::Value) -> Result<()> {
        let obj = update.as_object().ok_or_else(|| EngineError::Config {
            message: "LLM config update must be a map".into(),
        })?;
        let mut current = serde_json::to_value(&*self)?;
        let current_obj = current.as_object_mut().expect("AiConfig serializes to map");
        for (key, value) in obj {
            if current_obj.contains_key(key) {
                current_obj.insert(key.clone(), value.clone());
            } else {
                crate::warn_log!("Ignoring unknown LLM config key: {}", key);
            }
        }
        *self = serde_json::from_value(current)?;
        Ok(())
    }
}

/// One entry in the ordered fallback provider list.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderEntry {
    pub name: String,
    #[serde(default = "default_entry_priority")]
    pub priority: u32,
    #[serde(default)]
    pub enabled: bool,
    #[serde(flatten)]
    pub ai: AiConfig,
}

fn default_entry_priority() -> u32 {
    999
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SafetyConfig {
    #[serde(default = "default_true")]
    pub sandbox_enabled: bool,
    #[serde(default = "default_max_groups_per_objective")]
    pub max_groups_per_objective: usize,
    #[serde(default = "default_max_units_per_side")]
    pub max_units_per_side: u32,
    #[serde(default = "default_allowed_commands")]
    pub allowed_commands: Vec<String>,
    #[serde(default)]
    pub blocked_commands: Vec<String>,
    #[serde(default = "default_true")]
    pub audit_log: bool,
}

fn default_max_groups_per_objective() -> usize {
    10
}
fn default_max_units_per_side() -> u32 {
    100
}
fn default_allowed_commands() -> Vec<String> {
    [
        "move_to",
        "defend_area",
        "patrol_route",
        "seek_and_destroy",
        "spawn_squad",
        "transport_group",
        "escort_group",
        "fire_support",
        "deploy_asset",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            sandbox_enabled: true,
            max_groups_per_objective: default_max_groups_per_objective(),
            max_units_per_side: default_max_units_per_side(),
            allowed_commands: default_allowed_commands(),
            blocked_commands: Vec::new(),
            audit_log: true,
        }
    }
}

/// Geographic bound of the AO: a circle or an axis-aligned rectangle.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum AoBounds {
    Circle { center: [f64; 2], radius: f64 },
    Rect {
        min_x: f64,
        min_y: f64,
        max_x: f64,
        max_y: f64,
    },
}

impl AoBounds {
    pub fn contains(&self, pos: &Pos) -> bool {
        if !pos[0].is_finite() || !pos[1].is_finite() {
            return false;
        }
        match self {
            AoBounds::Circle { center, radius } => {
                let dx = pos[0] - center[0];
                let dy = pos[1] - center[1];
                (dx * dx + dy * dy).sqrt() <= *radius
            }
            AoBounds::Rect {
                min_x,
                min_y,
                max_x,
                max_y,
            } => pos[0] >= *min_x && pos[0] <= *max_x && pos[1] >= *min_y && pos[1] <= *max_y,
        }
    }

    /// Rough AO center, used to seed vehicle deployments outside the bound.
    pub fn center(&self) -> [f64; 2] {
        match self {
            AoBounds::Circle { center, .. } => *center,
            AoBounds::Rect {
                min_x,
                min_y,
                max_x,
                max_y,
            } => [(min_x + max_x) / 2.0, (min_y + max_y) / 2.0],
        }
    }

    /// Distance from the center to the bound edge along +x, in meters.
    pub fn extent(&self) -> f64 {
        match self {
            AoBounds::Circle { radius, .. } => *radius,
            AoBounds::Rect {
                min_x, max_x, min_y, max_y, ..
            } => ((max_x - min_x).max(max_y - min_y)) / 2.0,
        }
    }

    fn validate(&self) -> Result<()> {
        let ok = match self {
            AoBounds::Circle { center, radius } => {
                center.iter().all(|c| c.is_finite()) && radius.is_finite() && *radius > 0.0
            }
            AoBounds::Rect {
                min_x,
                min_y,
                max_x,
                max_y,
            } => {
                [min_x, min_y, max_x, max_y].iter().all(|c| c.is_finite())
                    && min_x < max_x
                    && min_y < max_y
            }
        };
        if ok {
            Ok(())
        } else {
            Err(EngineError::Config {
                message: "illegal AO bounds".into(),
            })
        }
    }
}

/// One deployable asset type in the resource pool.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AssetSpec {
    pub classnames: Vec<String>,
    pub max: u32,
    #[serde(default)]
    pub defense_only: bool,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct GuardrailsConfig {
    #[serde(default)]
    pub ao_bounds: Option<AoBounds>,
    #[serde(default)]
    pub resource_pool: HashMap<Side, HashMap<String, AssetSpec>>,
}

impl EngineConfig {
    /// Validate fatal init-time constraints.
    pub fn validate(&self) -> Result<()> {
        if let Some(bounds) = &self.guardrails.ao_bounds {
            bounds.validate()?;
        }
        for (side, assets) in &self.guardrails.resource_pool {
            for (asset_type, spec) in assets {
                if spec.classnames.is_empty() {
                    return Err(EngineError::Config {
                        message: format!(
                            "resource pool {}:{} has no classnames",
                            side, asset_type
                        ),
                    });
                }
            }
        }
        if self.ai.enabled && self.llm_providers.iter().all(|p| !p.enabled) {
            // Single-provider mode: a key must be resolvable now or later
            // via admin/env; only a totally closed path is fatal.
            resolve_api_key(&self.ai.provider, None, self.ai.api_key.as_deref())?;
        }
        Ok(())
    }

    /// Overlay guardrails.json (its `current` section) onto the ai config.
    pub fn apply_guardrails_file(&mut self, path: &Path) {
        let data = match std::fs::read_to_string(path) {
            Ok(d) => d,
            Err(_) => return,
        };
        let parsed: serde_json::Value = match serde_json::from_str(&data) {
            Ok(v) => v,
            Err(e) => {
                crate::warn_log!("guardrails.json unreadable: {}", e);
                return;
            }
        };
        let current = parsed.get("current").unwrap_or(&parsed);
        if let Err(e) = self.ai.merge_update(current) {
            crate::warn_log!("guardrails.json overlay rejected: {}", e);
        } else {
            crate::info_log!("Applied guardrails overlay from {}", path.display());
        }
    }
}

/// Environment variable name for a provider's API key.
pub fn env_key_name(provider: &str) -> String {
    let canonical = match provider.to_ascii_lowercase().as_str() {
        "gpt" | "openai" => "OPENAI",
        "claude" | "anthropic" => "ANTHROPIC",
        "azure" | "azureopenai" => "AZURE_OPENAI",
        other => {
            return format!("{}_API_KEY", other.to_ascii_uppercase());
        }
    };
    format!("{}_API_KEY", canonical)
}

/// Resolve an API key in precedence order: in-session admin override,
/// config value, environment. Fails closed when nothing is found.
pub fn resolve_api_key(
    provider: &str,
    admin_override: Option<&str>,
    config_key: Option<&str>,
) -> Result<String> {
    if let Some(key) = admin_override {
        if !key.is_empty() {
            return Ok(key.to_string());
        }
    }
    if let Some(key) = config_key {
        if !key.is_empty() {
            return Ok(key.to_string());
        }
    }
    if let Ok(key) = std::env::var(env_key_name(provider)) {
        if !key.is_empty() {
            return Ok(key);
        }
    }
    // Local providers never need a key.
    if provider.eq_ignore_ascii_case("local") {
        return Ok(String::new());
    }
    Err(EngineError::MissingApiKey {
        provider: provider.to_string(),
    })
}

/// Persist the runtime ai config to guardrails.json, preserving any
/// `templates` section already in the file.
pub fn persist_guardrails(path: &Path, ai: &AiConfig) -> Result<()> {
    let templates = std::fs::read_to_string(path)
        .ok()
        .and_then(|d| serde_json::from_str::<serde_json::Value>(&d).ok())
        .and_then(|v| v.get("templates").cloned())
        .unwrap_or_else(|| serde_json::json!({}));

    let data = serde_json::json!({
        "current": serde_json::to_value(ai)?,
        "templates": templates,
    });
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&data)?)?;
    Ok(())
}
