//! Per-AO API call log
//!
//! One append-only file per AO named
//! `apicall.<world>.<mission>.<ao_index>.<timestamp>.log`: a header, then
//! request/response blocks delimited by `===` lines, then a footer when the
//! AO ends. Bodies are JSON; metadata lines are `Key: Value`. Writes flush
//! on block boundaries and never fail the caller.

use crate::llm::TokenUsage;
use chrono::Utc;
use serde_json::Value;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

const DELIMITER: &str = "================================================================================";

pub struct ApiCallLogger {
    log_dir: PathBuf,
    writer: Option<BufWriter<File>>,
    current_path: Option<PathBuf>,
}

impl ApiCallLogger {
    pub fn new(log_dir: impl AsRef<Path>) -> Self {
        Self {
            log_dir: log_dir.as_ref().to_path_buf(),
            writer: None,
            current_path: None,
        }
    }

    fn write_block(&mut self, lines: &[String]) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        let result = (|| -> std::io::Result<()> {
            for line in lines {
                writeln!(writer, "{}", line)?;
            }
            writer.flush()
        })();
        if let Err(e) = result {
            crate::error_log!("API log write failed: {}", e);
        }
    }

    /// Open a fresh log file for the AO. An already-open file is closed
    /// with a footer first.
    pub fn start_ao(&mut self, ao_id: &str, world: &str, mission: &str, ao_index: u32) {
        if self.writer.is_some() {
            self.end_ao();
        }
        if let Err(e) = std::fs::create_dir_all(&self.log_dir) {
            crate::error_log!("API log directory unavailable: {}", e);
            return;
        }
        let timestamp = Utc::now().format("%Y-%m-%dT%H-%M-%S");
        let filename = format!("apicall.{}.{}.{}.{}.log", world, mission, ao_index, timestamp);
        let path = self.log_dir.join(filename);

        match File::create(&path) {
            Ok(file) => {
                self.writer = Some(BufWriter::new(file));
                self.current_path = Some(path);
                self.write_block(&[
                    DELIMITER.to_string(),
                    format!("AO API CALL LOG - {}", ao_id),
                    format!("World: {}", world),
                    format!("Mission: {}", mission),
                    format!("AO Index: {}", ao_index),
                    format!("Started: {}", Utc::now().to_rfc3339()),
                    DELIMITER.to_string(),
                ]);
            }
            Err(e) => {
                crate::error_log!("Failed to open API log file: {}", e);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn log_request(
        &mut self,
        cycle: u64,
        mission_time: f64,
        provider: &str,
        model: &str,
        request: &Value,
        cached_context_chars: usize,
    ) {
        let body = serde_json::to_string_pretty(request).unwrap_or_default();
        self.write_block(&[
            String::new(),
            format!("=== REQUEST ==="),
            format!("Timestamp: {}", Utc::now().to_rfc3339()),
            format!("Cycle: {}", cycle),
            format!("Mission-Time: {:.1}", mission_time),
            format!("Provider: {}", provider),
            format!("Model: {}", model),
            format!("Cached-Context-Chars: {}", cached_context_chars),
            body,
        ]);
    }

    pub fn log_response(
        &mut self,
        success: bool,
        response: Option<&Value>,
        usage: Option<&TokenUsage>,
        error: Option<&str>,
    ) {
        let mut lines = vec![
            String::new(),
            format!("=== RESPONSE ==="),
            format!("Timestamp: {}", Utc::now().to_rfc3339()),
            format!("Success: {}", success),
        ];
        if let Some(usage) = usage {
            lines.push(format!(
                "Tokens: input={} output={} cached={} total={}",
                usage.input_tokens,
                usage.output_tokens,
                usage.cached_input_tokens,
                usage.total_tokens
            ));
            lines.push(format!("Latency-Ms: {}", usage.latency_ms));
        }
        if let Some(error) = error {
            lines.push(format!("Error: {}", error));
        }
        if let Some(response) = response {
            lines.push(serde_json::to_string_pretty(response).unwrap_or_default());
        }
        self.write_block(&lines);
    }

    /// Reasoning text, appended to the same file instead of being returned
    /// to the host.
    pub fn log_thoughts(&mut self, cycle: u64, thoughts: &str) {
        self.write_block(&[
            String::new(),
            format!("=== THOUGHTS ==="),
            format!("Cycle: {}", cycle),
            thoughts.to_string(),
        ]);
    }

    /// Write the footer and close the file.
    pub fn end_ao(&mut self) {
        self.write_block(&[
            String::new(),
            DELIMITER.to_string(),
            format!("AO LOG CLOSED - {}", Utc::now().to_rfc3339()),
            DELIMITER.to_string(),
        ]);
        self.writer = None;
        self.current_path = None;
    }

    pub fn current_path(&self) -> Option<&Path> {
        self.current_path.as_deref()
    }

    pub fn is_open(&self) -> bool {
        self.writer.is_some()
    }
}
