//! Token usage tracking
//!
//! Every provider call contributes one record. Stats roll up over four
//! windows (minute, hour, day, lifetime). Records also append to a JSONL
//! file; telemetry writes are never on the critical path, so file errors
//! are logged and swallowed.

use crate::llm::TokenUsage;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::io::Write;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    pub timestamp: DateTime<Utc>,
    pub call_number: u64,
    pub provider: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_input_tokens: u64,
    pub total_tokens: u64,
    pub latency_ms: u64,
    pub cumulative_input: u64,
    pub cumulative_output: u64,
}

pub struct TokenTracker {
    log_file: Option<PathBuf>,
    calls: Vec<CallRecord>,
    total_calls: u64,
    total_input: u64,
    total_output: u64,
    total_cached: u64,
    session_start: DateTime<Utc>,
}

impl TokenTracker {
    /// `log_dir` receives `token_usage.jsonl`; pass None to keep telemetry
    /// memory-only.
    pub fn new(log_dir: Option<PathBuf>) -> Self {
        let log_file = log_dir.map(|dir| {
            if let Err(e) = std::fs::create_dir_all(&dir) {
                crate::warn_log!("Token log directory unavailable: {}", e);
            }
            dir.join("token_usage.jsonl")
        });
        Self {
            log_file,
            calls: Vec::new(),
            total_calls: 0,
            total_input: 0,
            total_output: 0,
            total_cached: 0,
            session_start: Utc::now(),
        }
    }

    pub fn record_call(&mut self, usage: &TokenUsage) {
        self.total_calls += 1;
        self.total_input += usage.input_tokens;
        self.total_output += usage.output_tokens;
        self.total_cached += usage.cached_input_tokens;

        let record = CallRecord {
            timestamp: Utc::now(),
            call_number: self.total_calls,
            provider: usage.provider.clone(),
            model: usage.model.clone(),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cached_input_tokens: usage.cached_input_tokens,
            total_tokens: usage.total_tokens,
            latency_ms: usage.latency_ms,
            cumulative_input: self.total_input,
            cumulative_output: self.total_output,
        };

        if let Some(path) = &self.log_file {
            let result = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .and_then(|mut file| {
                    writeln!(
                        file,
                        "{}",
                        serde_json::to_string(&record).unwrap_or_default()
                    )
                });
            if let Err(e) = result {
                crate::error_log!("Failed to append token usage: {}", e);
            }
        }

        self.calls.push(record);
        self.trim();
    }

    /// Records older than the largest window can go.
    fn trim(&mut self) {
        let cutoff = Utc::now() - Duration::hours(25);
        self.calls.retain(|c| c.timestamp > cutoff);
    }

    fn bucket(&self, since: DateTime<Utc>) -> Value {
        let slice: Vec<&CallRecord> =
            self.calls.iter().filter(|c| c.timestamp >= since).collect();
        json!({
            "calls": slice.len(),
            "input": slice.iter().map(|c| c.input_tokens).sum::<u64>(),
            "output": slice.iter().map(|c| c.output_tokens).sum::<u64>(),
            "cached": slice.iter().map(|c| c.cached_input_tokens).sum::<u64>(),
            "total": slice.iter().map(|c| c.total_tokens).sum::<u64>(),
        })
    }

    pub fn total_calls(&self) -> u64 {
        self.total_calls
    }

    /// The stats record returned by `get_token_stats`.
    pub fn stats(&self) -> Value {
        let now = Utc::now();
        let last_call = self.calls.last().map(|c| {
            json!({
                "timestamp": c.timestamp.to_rfc3339(),
                "provider": c.provider,
                "model": c.model,
                "input": c.input_tokens,
                "output": c.output_tokens,
                "cached": c.cached_input_tokens,
                "latency_ms": c.latency_ms,
            })
        });
        let averages = if self.total_calls > 0 {
            json!({
                "input_per_call": self.total_input as f64 / self.total_calls as f64,
                "output_per_call": self.total_output as f64 / self.total_calls as f64,
            })
        } else {
            json!({"input_per_call": 0.0, "output_per_call": 0.0})
        };

        json!({
            "last_call": last_call,
            "per_minute": self.bucket(now - Duration::minutes(1)),
            "per_hour": self.bucket(now - Duration::hours(1)),
            "per_day": self.bucket(now - Duration::hours(24)),
            "total": {
                "calls": self.total_calls,
                "input": self.total_input,
                "output": self.total_output,
                "cached": self.total_cached,
                "total": self.total_input + self.total_output,
            },
            "averages": averages,
            "session": {
                "start_time": self.session_start.to_rfc3339(),
                "duration_seconds": (now - self.session_start).num_seconds(),
            },
        })
    }

    pub fn reset(&mut self) {
        self.calls.clear();
        self.total_calls = 0;
        self.total_input = 0;
        self.total_output = 0;
        self.total_cached = 0;
        self.session_start = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(input: u64, output: u64, cached: u64) -> TokenUsage {
        TokenUsage {
            input_tokens: input,
            output_tokens: output,
            cached_input_tokens: cached,
            total_tokens: input + output,
            latency_ms: 800,
            provider: "gemini".into(),
            model: "gemini-2.0-flash-001".into(),
        }
    }

    #[test]
    fn test_cumulative_totals() {
        let mut tracker = TokenTracker::new(None);
        tracker.record_call(&usage(1500, 200, 2800));
        tracker.record_call(&usage(1400, 250, 2800));
        let stats = tracker.stats();
        assert_eq!(stats["total"]["calls"], 2);
        assert_eq!(stats["total"]["input"], 2900);
        assert_eq!(stats["total"]["output"], 450);
        assert_eq!(stats["total"]["cached"], 5600);
    }

    #[test]
    fn test_rolling_buckets_include_recent_calls() {
        let mut tracker = TokenTracker::new(None);
        tracker.record_call(&usage(100, 10, 0));
        let stats = tracker.stats();
        // A just-recorded call sits in every window.
        assert_eq!(stats["per_minute"]["calls"], 1);
        assert_eq!(stats["per_hour"]["calls"], 1);
        assert_eq!(stats["per_day"]["calls"], 1);
        assert_eq!(stats["last_call"]["input"], 100);
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut tracker = TokenTracker::new(None);
        tracker.record_call(&usage(100, 10, 0));
        tracker.reset();
        let stats = tracker.stats();
        assert_eq!(stats["total"]["calls"], 0);
        assert!(stats["last_call"].is_null());
    }

    #[test]
    fn test_jsonl_append() {
        let dir = tempfile::tempdir().unwrap();
        let mut tracker = TokenTracker::new(Some(dir.path().to_path_buf()));
        tracker.record_call(&usage(100, 10, 0));
        tracker.record_call(&usage(200, 20, 0));
        let content = std::fs::read_to_string(dir.path().join("token_usage.jsonl")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: CallRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.call_number, 1);
        assert_eq!(first.input_tokens, 100);
    }
}
