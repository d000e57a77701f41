//! Headless driver
//!
//! Runs the engine behind a line-delimited JSON protocol on stdio, one
//! request per line: `{"fn": "<name>", "args": [...]}`. Each reply is one
//! JSON line mirroring the bridge pair-list shape. This is the thinnest
//! possible host: the simulator-side glue speaks the same protocol.

mod admin;
mod api;
mod bridge;

use api::EngineApi;
use clap::Parser;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[derive(Parser, Debug)]
#[command(name = "batcom", version, about = "LLM-driven tactical decision engine")]
struct Args {
    /// Path to a JSON configuration file applied at init when the host
    /// sends none
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    /// Override the data directory from the configuration
    #[arg(long)]
    data_dir: Option<String>,

    /// Initialize immediately from --config instead of waiting for an
    /// init request
    #[arg(long)]
    auto_init: bool,
}

fn load_config_value(args: &Args) -> Value {
    let mut config = args
        .config
        .as_ref()
        .and_then(|path| std::fs::read_to_string(path).ok())
        .and_then(|data| serde_json::from_str::<Value>(&data).ok())
        .unwrap_or_else(|| json!({}));
    if let Some(data_dir) = &args.data_dir {
        if let Some(map) = config.as_object_mut() {
            map.insert("data_dir".into(), json!(data_dir));
        }
    }
    config
}

async fn dispatch(api: &EngineApi, request: &Value) -> Value {
    let name = request.get("fn").and_then(|v| v.as_str()).unwrap_or("");
    let args = request
        .get("args")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();

    match name {
        "init" => api.init(args.first().unwrap_or(&Value::Null)).await,
        "shutdown" => api.shutdown().await,
        "is_initialized" => json!(api.is_initialized().await),
        "world_snapshot" => api.world_snapshot(args.first().unwrap_or(&Value::Null)).await,
        "get_pending_commands" => api.get_pending_commands().await,
        "admin_command" => {
            let command = args.first().and_then(|v| v.as_str()).unwrap_or("");
            let params = args.get(1).cloned().unwrap_or(Value::Null);
            let flag = args.get(2).and_then(|v| v.as_bool()).unwrap_or(false);
            api.admin_command(command, &params, flag).await
        }
        "test_connection" => api.test_connection().await,
        "get_token_stats" => api.get_token_stats().await,
        other => bridge::value_to_pairs(&json!({
            "status": "error",
            "error": format!("unknown function: {}", other),
        })),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let api = EngineApi::new();

    if args.auto_init {
        let config = bridge::value_to_pairs(&load_config_value(&args));
        let response = api.init(&config).await;
        eprintln!("init: {}", serde_json::to_string(&response)?);
    }

    let stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    let mut lines = stdin.lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Value>(line) {
            Ok(request) => dispatch(&api, &request).await,
            Err(e) => bridge::value_to_pairs(&json!({
                "status": "error",
                "error": format!("request is not valid JSON: {}", e),
            })),
        };
        let mut out = serde_json::to_string(&response)?;
        out.push('\n');
        stdout.write_all(out.as_bytes()).await?;
        stdout.flush().await?;
    }

    api.shutdown().await;
    Ok(())
}
