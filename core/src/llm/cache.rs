//! Prompt cache handles
//!
//! The cacheable part of the context (system prompt + objectives + history)
//! is tracked by a content hash. A handle lives until its content changes
//! or 60 minutes elapse, whichever comes first. The handle id doubles as
//! the provider-side cache key (e.g. OpenAI `prompt_cache_key`). Cache
//! trouble is never an error: callers fall back to sending the context
//! inline and record the failure.

use sha2::{Digest, Sha256};
use std::time::Duration;
use tokio::time::Instant;

/// Default handle lifetime.
pub const CACHE_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone)]
pub struct CacheHandle {
    pub id: String,
    pub content_hash: String,
    pub created: Instant,
    pub expires: Instant,
}

/// What `ensure` decided about the current cacheable content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheDecision {
    /// Existing handle still matches; reuse it.
    Reused(String),
    /// New handle created (first call, content change, or expiry).
    Created(String),
}

impl CacheDecision {
    pub fn handle_id(&self) -> &str {
        match self {
            CacheDecision::Reused(id) | CacheDecision::Created(id) => id,
        }
    }
}

/// Counters surfaced in token stats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub creations: u64,
    pub invalidations: u64,
    pub reuses: u64,
}

#[derive(Debug, Default)]
pub struct PromptCache {
    handle: Option<CacheHandle>,
    stats: CacheStats,
    generation: u64,
}

pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

impl PromptCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconcile the handle with the current cacheable content.
    pub fn ensure(&mut self, cacheable_text: &str) -> CacheDecision {
        let hash = content_hash(cacheable_text);
        let now = Instant::now();

        if let Some(handle) = &self.handle {
            if handle.content_hash == hash && now < handle.expires {
                self.stats.reuses += 1;
                return CacheDecision::Reused(handle.id.clone());
            }
            // Content changed or TTL elapsed: the old handle is dead.
            self.stats.invalidations += 1;
        }

        self.generation += 1;
        let id = format!("batcom_ctx_{}_{}", &hash[..16], self.generation);
        self.handle = Some(CacheHandle {
            id: id.clone(),
            content_hash: hash,
            created: now,
            expires: now + CACHE_TTL,
        });
        self.stats.creations += 1;
        CacheDecision::Created(id)
    }

    pub fn invalidate(&mut self) {
        if self.handle.take().is_some() {
            self.stats.invalidations += 1;
        }
    }

    pub fn handle(&self) -> Option<&CacheHandle> {
        self.handle.as_ref()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }
}
