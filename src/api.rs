//! Host-facing RPC surface
//!
//! The named functions the host invokes over the bridge. Arguments and
//! results are pair-list trees; this layer runs the codec, serializes all
//! access to the engine, and guarantees every response carries a `status`
//! field. Nothing here ever panics outward or raises to the host.

use crate::admin;
use crate::bridge::{pairs_to_value, value_to_pairs};
use batcom_core::{Engine, EngineConfig};
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;

pub struct EngineApi {
    engine: Mutex<Option<Engine>>,
}

fn ok_response(extra: Value) -> Value {
    let mut map = Map::new();
    map.insert("status".into(), json!("ok"));
    if let Value::Object(extra) = extra {
        for (key, value) in extra {
            map.insert(key, value);
        }
    }
    value_to_pairs(&Value::Object(map))
}

fn error_response(message: impl std::fmt::Display) -> Value {
    value_to_pairs(&json!({"status": "error", "error": message.to_string()}))
}

impl EngineApi {
    pub fn new() -> Self {
        Self {
            engine: Mutex::new(None),
        }
    }

    /// Initialize the engine from a configuration pair tree.
    pub async fn init(&self, config_pairs: &Value) -> Value {
        let config_value = pairs_to_value(config_pairs);
        let config: EngineConfig = match serde_json::from_value(config_value) {
            Ok(config) => config,
            Err(e) => return error_response(format!("invalid configuration: {}", e)),
        };
        match Engine::init(config) {
            Ok(engine) => {
                *self.engine.lock().await = Some(engine);
                ok_response(json!({"version": batcom_core::VERSION}))
            }
            Err(e) => error_response(e),
        }
    }

    pub async fn shutdown(&self) -> Value {
        let mut guard = self.engine.lock().await;
        match guard.take() {
            Some(mut engine) => {
                engine.shutdown();
                ok_response(json!({}))
            }
            None => ok_response(json!({"message": "engine was not initialized"})),
        }
    }

    pub async fn is_initialized(&self) -> bool {
        self.engine.lock().await.is_some()
    }

    /// Ingest one world snapshot. Bad snapshots are reported, not applied.
    pub async fn world_snapshot(&self, snapshot_pairs: &Value) -> Value {
        let mut guard = self.engine.lock().await;
        let Some(engine) = guard.as_mut() else {
            return error_response("engine not initialized");
        };
        let raw = pairs_to_value(snapshot_pairs);
        match engine.world_snapshot(&raw).await {
            Ok(()) => ok_response(json!({})),
            Err(e) => error_response(e),
        }
    }

    pub async fn get_pending_commands(&self) -> Value {
        let mut guard = self.engine.lock().await;
        let Some(engine) = guard.as_mut() else {
            return error_response("engine not initialized");
        };
        let commands = engine.pending_commands();
        ok_response(json!({"commands": commands}))
    }

    pub async fn admin_command(&self, command: &str, params: &Value, flag: bool) -> Value {
        let mut guard = self.engine.lock().await;
        let Some(engine) = guard.as_mut() else {
            return error_response("engine not initialized");
        };
        let params = pairs_to_value(params);
        match admin::handle(engine, command, &params, flag) {
            Ok(payload) => ok_response(payload),
            Err(e) => error_response(e),
        }
    }

    pub async fn test_connection(&self) -> Value {
        let guard = self.engine.lock().await;
        let Some(engine) = guard.as_ref() else {
            return error_response("engine not initialized");
        };
        match engine.test_connection().await {
            Ok((model, greeting)) => ok_response(json!({"model": model, "greeting": greeting})),
            Err(e) => error_response(e),
        }
    }

    pub async fn get_token_stats(&self) -> Value {
        let guard = self.engine.lock().await;
        let Some(engine) = guard.as_ref() else {
            return error_response("engine not initialized");
        };
        ok_response(json!({"stats": engine.token_stats()}))
    }
}

impl Default for EngineApi {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_of(response: &Value) -> String {
        let value = pairs_to_value(response);
        value["status"].as_str().unwrap_or("").to_string()
    }

    fn test_config_pairs() -> Value {
        let dir = tempfile::tempdir().unwrap().into_path();
        value_to_pairs(&json!({
            "ai": {"enabled": false},
            "data_dir": dir.to_string_lossy(),
        }))
    }

    #[tokio::test]
    async fn test_uninitialized_calls_report_errors() {
        let api = EngineApi::new();
        assert!(!api.is_initialized().await);
        assert_eq!(status_of(&api.world_snapshot(&json!([])).await), "error");
        assert_eq!(status_of(&api.get_pending_commands().await), "error");
        // Shutdown without init is still ok.
        assert_eq!(status_of(&api.shutdown().await), "ok");
    }

    #[tokio::test]
    async fn test_init_and_lifecycle() {
        let api = EngineApi::new();
        let response = api.init(&test_config_pairs()).await;
        assert_eq!(status_of(&response), "ok");
        assert!(api.is_initialized().await);

        let response = api
            .admin_command("commanderSides", &json!(["EAST"]), false)
            .await;
        assert_eq!(status_of(&response), "ok");

        let response = api.get_pending_commands().await;
        let value = pairs_to_value(&response);
        assert_eq!(value["status"], "ok");
        assert!(value["commands"].as_array().unwrap().is_empty());

        assert_eq!(status_of(&api.shutdown().await), "ok");
        assert!(!api.is_initialized().await);
    }

    #[tokio::test]
    async fn test_snapshot_pairs_decode() {
        let api = EngineApi::new();
        api.init(&test_config_pairs()).await;
        let snapshot = value_to_pairs(&json!({
            "mission_time": 10.0,
            "controlled_sides": ["EAST"],
            "groups": [],
            "players": [],
            "objectives": []
        }));
        assert_eq!(status_of(&api.world_snapshot(&snapshot).await), "ok");

        // A malformed snapshot reports an error and does not break later calls.
        let bad = value_to_pairs(&json!({"groups": [{"id": "x"}]}));
        assert_eq!(status_of(&api.world_snapshot(&bad).await), "error");
        assert_eq!(status_of(&api.get_pending_commands().await), "ok");
    }

    #[tokio::test]
    async fn test_admin_error_surfaces_in_status() {
        let api = EngineApi::new();
        api.init(&test_config_pairs()).await;
        let response = api.admin_command("commanderEndAO", &Value::Null, false).await;
        let value = pairs_to_value(&response);
        assert_eq!(value["status"], "error");
        assert!(value["error"].as_str().unwrap().contains("no active AO"));
    }
}
