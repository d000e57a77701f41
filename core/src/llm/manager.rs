//! Provider fallback manager
//!
//! Holds the ordered list of enabled provider configurations. The engine
//! asks for the next workable provider; providers that keep failing are
//! skipped until a success (or an explicit reset) clears their strikes.

use super::client::LlmClient;
use super::ProviderSettings;
use crate::config::{resolve_api_key, ProviderEntry};
use crate::error::Result;
use std::collections::HashMap;

/// Strikes before a provider is skipped in rotation.
const MAX_FAILURES_PER_PROVIDER: u32 = 3;

pub struct ProviderManager {
    entries: Vec<ProviderEntry>,
    active_index: usize,
    failures: HashMap<String, u32>,
}

impl ProviderManager {
    pub fn new(mut entries: Vec<ProviderEntry>) -> Self {
        entries.retain(|e| e.enabled);
        entries.sort_by_key(|e| e.priority);
        if entries.is_empty() {
            crate::warn_log!("No enabled LLM providers configured");
        } else {
            crate::info_log!("Configured {} enabled LLM providers", entries.len());
            for entry in &entries {
                crate::info_log!(
                    "  priority {}: {} ({} {})",
                    entry.priority,
                    entry.name,
                    entry.ai.provider,
                    entry.ai.model
                );
            }
        }
        Self {
            entries,
            active_index: 0,
            failures: HashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn current(&self) -> Option<&ProviderEntry> {
        self.entries.get(self.active_index)
    }

    fn strikes(&self, name: &str) -> u32 {
        self.failures.get(name).copied().unwrap_or(0)
    }

    /// The next provider whose strike count allows it, starting from the
    /// active index. Advances `active_index` to the returned entry.
    pub fn next_available(&mut self) -> Option<&ProviderEntry> {
        if self.entries.is_empty() {
            return None;
        }
        for offset in 0..self.entries.len() {
            let index = (self.active_index + offset) % self.entries.len();
            let name = self.entries[index].name.clone();
            if self.strikes(&name) < MAX_FAILURES_PER_PROVIDER {
                self.active_index = index;
                return self.entries.get(index);
            }
            crate::warn_log!(
                "Skipping provider {} (failure count {})",
                name,
                self.strikes(&name)
            );
        }
        crate::error_log!("All LLM providers failed or unavailable");
        None
    }

    /// Build a client for a provider entry, resolving its API key through
    /// the standard precedence chain.
    pub fn build_client(
        entry: &ProviderEntry,
        admin_key_override: Option<&str>,
    ) -> Result<LlmClient> {
        let api_key = resolve_api_key(
            &entry.ai.provider,
            admin_key_override,
            entry.ai.api_key.as_deref(),
        )?;
        let settings = ProviderSettings::from_ai(&entry.ai, api_key)?;
        LlmClient::new(settings)
    }

    pub fn record_failure(&mut self, name: &str) {
        let count = self.failures.entry(name.to_string()).or_insert(0);
        *count += 1;
        crate::warn_log!(
            "Provider {} failure count: {}/{}",
            name,
            count,
            MAX_FAILURES_PER_PROVIDER
        );
    }

    pub fn record_success(&mut self, name: &str) {
        self.failures.remove(name);
    }

    /// Rotate to the next provider in priority order.
    pub fn fallback_to_next(&mut self) {
        if self.entries.is_empty() {
            return;
        }
        if let Some(current) = self.current() {
            crate::info_log!("Falling back from provider {}", current.name);
        }
        self.active_index = (self.active_index + 1) % self.entries.len();
    }

    pub fn reset_failures(&mut self) {
        self.failures.clear();
        self.active_index = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AiConfig;
    use crate::llm::OrderProvider;

    fn entry(name: &str, priority: u32, enabled: bool) -> ProviderEntry {
        ProviderEntry {
            name: name.to_string(),
            priority,
            enabled,
            ai: AiConfig {
                provider: "local".into(),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_sorted_by_priority_and_disabled_dropped() {
        let manager = ProviderManager::new(vec![
            entry("backup", 20, true),
            entry("primary", 10, true),
            entry("off", 1, false),
        ]);
        assert_eq!(manager.current().unwrap().name, "primary");
    }

    #[test]
    fn test_fallback_rotation() {
        let mut manager = ProviderManager::new(vec![
            entry("primary", 10, true),
            entry("backup", 20, true),
        ]);
        manager.fallback_to_next();
        assert_eq!(manager.current().unwrap().name, "backup");
        manager.fallback_to_next();
        assert_eq!(manager.current().unwrap().name, "primary");
    }

    #[test]
    fn test_struck_out_provider_is_skipped() {
        let mut manager = ProviderManager::new(vec![
            entry("primary", 10, true),
            entry("backup", 20, true),
        ]);
        for _ in 0..3 {
            manager.record_failure("primary");
        }
        assert_eq!(manager.next_available().unwrap().name, "backup");
        // Success on backup keeps it active; a reset restores primary.
        manager.record_success("backup");
        manager.reset_failures();
        assert_eq!(manager.next_available().unwrap().name, "primary");
    }

    #[test]
    fn test_all_struck_out_yields_none() {
        let mut manager = ProviderManager::new(vec![entry("only", 10, true)]);
        for _ in 0..3 {
            manager.record_failure("only");
        }
        assert!(manager.next_available().is_none());
    }

    #[test]
    fn test_success_clears_strikes() {
        let mut manager = ProviderManager::new(vec![entry("only", 10, true)]);
        manager.record_failure("only");
        manager.record_failure("only");
        manager.record_success("only");
        assert_eq!(manager.strikes("only"), 0);
        assert!(manager.next_available().is_some());
    }

    #[test]
    fn test_build_client_for_local_provider() {
        // Local providers need no API key.
        let client = ProviderManager::build_client(&entry("local", 1, true), None).unwrap();
        assert_eq!(client.provider_name(), "local");
    }
}
