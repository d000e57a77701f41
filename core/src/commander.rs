//! Commander orchestrator
//!
//! Drives the per-snapshot decision flow: update state, evaluate
//! objectives, decide whether the LLM is consulted, build the split
//! context, call the provider, parse and sandbox the reply, enqueue the
//! survivors, and record the cycle. Failure containment (breaker, retry,
//! rate limits) lives here and in the provider layer; the host never sees
//! an error from this path.

use crate::config::EngineConfig;
use crate::decision::evaluator::{self, ObjectiveEval};
use crate::error::{EngineError, Result};
use crate::llm::context::{assess_situation, build_world_value, DecisionContext};
use crate::llm::limits::{BreakerState, CircuitBreaker, RpmLimiter};
use crate::llm::manager::ProviderManager;
use crate::llm::{OrderProvider, ProviderSettings};
use crate::model::orders::Command;
use crate::model::world::Snapshot;
use crate::orders::parser;
use crate::orders::sandbox::{OrderValidator, SandboxCtx, Verdict};
use crate::queue::CommandQueue;
use crate::state::{CycleRecord, RejectedOrder, StateManager};
use crate::telemetry::{ApiCallLogger, TokenTracker};
use crate::{debug_log, error_log, info_log, warn_log};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Consecutive provider failures before the breaker opens.
const BREAKER_THRESHOLD: u32 = 3;

pub struct Commander {
    validator: OrderValidator,
    provider: Option<Arc<dyn OrderProvider>>,
    provider_manager: Option<ProviderManager>,
    current_provider_name: Option<String>,
    llm_enabled: bool,

    rpm: RpmLimiter,
    breaker: CircuitBreaker,
    cancel_token: CancellationToken,

    cycle: u64,
    last_decision_mission_time: Option<f64>,
    last_world_hash: Option<String>,
    last_objectives_sig: Option<String>,
    last_enemy_contacts: HashSet<String>,
    /// Set on redeploy so the next snapshot probes immediately
    force_next_decision: bool,

    system_prompt: String,
    /// Previous-AO intel text, stable for the whole AO to keep the
    /// cacheable context (and therefore the provider cache) steady
    previous_intel: Option<String>,
    /// Last 5 LLM-supplied order summaries, echoed back each call
    order_summaries: Vec<Value>,

    pub tokens: TokenTracker,
    pub api_log: ApiCallLogger,

    engine_start: Instant,
}

impl Commander {
    pub fn new(config: &EngineConfig) -> Self {
        let data_dir = std::path::PathBuf::from(&config.data_dir);
        Self {
            validator: OrderValidator::new(&config.safety),
            provider: None,
            provider_manager: None,
            current_provider_name: None,
            llm_enabled: config.ai.enabled,
            rpm: RpmLimiter::new(config.ai.rate_limit_rpm),
            breaker: CircuitBreaker::new(BREAKER_THRESHOLD),
            cancel_token: CancellationToken::new(),
            cycle: 0,
            last_decision_mission_time: None,
            last_world_hash: None,
            last_objectives_sig: None,
            last_enemy_contacts: HashSet::new(),
            force_next_decision: false,
            system_prompt: crate::prompt::system_prompt(),
            previous_intel: None,
            order_summaries: Vec::new(),
            tokens: TokenTracker::new(Some(data_dir.clone())),
            api_log: ApiCallLogger::new(data_dir.join("llm_calls")),
            engine_start: Instant::now(),
        }
    }

    // =========================================================================
    // Provider wiring
    // =========================================================================

    /// (Re)initialize the provider from current state. With a configured
    /// provider list the fallback manager picks; otherwise the single `ai`
    /// section applies.
    pub fn init_provider(&mut self, config: &EngineConfig, state: &StateManager) -> Result<()> {
        self.provider = None;
        self.current_provider_name = None;
        self.llm_enabled = state.ai.enabled;
        self.rpm = RpmLimiter::new(state.ai.rate_limit_rpm);
        if !state.ai.enabled {
            info_log!("LLM disabled in configuration");
            return Ok(());
        }

        let entries: Vec<_> = config
            .llm_providers
            .iter()
            .filter(|e| e.enabled)
            .cloned()
            .collect();
        if !entries.is_empty() {
            let mut manager = ProviderManager::new(entries);
            while let Some(entry) = manager.next_available().cloned() {
                let admin_key = state.api_key_override(&entry.ai.provider);
                match ProviderManager::build_client(&entry, admin_key) {
                    Ok(client) => {
                        info_log!(
                            "Using LLM provider {} ({} {})",
                            entry.name,
                            entry.ai.provider,
                            entry.ai.model
                        );
                        self.provider = Some(Arc::new(client));
                        self.current_provider_name = Some(entry.name.clone());
                        self.provider_manager = Some(manager);
                        return Ok(());
                    }
                    Err(e) => {
                        warn_log!("Provider {} failed to initialize: {}", entry.name, e);
                        manager.record_failure(&entry.name);
                        manager.fallback_to_next();
                    }
                }
            }
            self.llm_enabled = false;
            return Err(EngineError::Config {
                message: "no LLM provider could be initialized".into(),
            });
        }

        let api_key = crate::config::resolve_api_key(
            &state.ai.provider,
            state.api_key_override(&state.ai.provider),
            state.ai.api_key.as_deref(),
        )?;
        let settings = ProviderSettings::from_ai(&state.ai, api_key)?;
        info_log!(
            "LLM provider initialized: {} {} (min_interval {:.0}s)",
            settings.kind,
            settings.model,
            state.ai.min_interval
        );
        self.provider = Some(Arc::new(crate::llm::LlmClient::new(settings)?));
        self.current_provider_name = Some(state.ai.provider.clone());
        Ok(())
    }

    /// Install a provider directly (tests, embedding).
    pub fn set_provider(&mut self, provider: Arc<dyn OrderProvider>) {
        self.current_provider_name = Some(provider.provider_name());
        self.provider = Some(provider);
        self.llm_enabled = true;
    }

    pub fn provider(&self) -> Option<&Arc<dyn OrderProvider>> {
        self.provider.as_ref()
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.breaker.consecutive_failures()
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    // =========================================================================
    // Lifecycle hooks
    // =========================================================================

    pub fn start_ao_tracking(
        &mut self,
        ao_id: &str,
        world: &str,
        mission: &str,
        ao_index: u32,
        state: &mut StateManager,
    ) {
        self.api_log.start_ao(ao_id, world, mission, ao_index);
        self.previous_intel = state
            .take_pending_intel()
            .map(|analysis| crate::prompt::format_previous_ao_intel(&analysis));
        self.order_summaries.clear();
        self.cycle = 0;
        self.last_decision_mission_time = None;
        self.last_world_hash = None;
        self.last_objectives_sig = None;
    }

    pub fn end_ao_tracking(&mut self) {
        self.api_log.end_ao();
        self.previous_intel = None;
    }

    /// Emergency stop: open the breaker, cancel any in-flight call, drop
    /// caches and conversational continuity.
    pub fn emergency_stop(&mut self) {
        warn_log!("EMERGENCY STOP - halting LLM operations and clearing context");
        self.breaker.trip();
        self.cancel_token.cancel();
        self.cancel_token = CancellationToken::new();
        self.order_summaries.clear();
        self.previous_intel = None;
        if let Some(provider) = &self.provider {
            provider.reset();
        }
    }

    /// Explicit redeploy closes the loop again: Open -> HalfOpen, and the
    /// next snapshot probes without waiting for a change signal.
    pub fn redeploy(&mut self) {
        self.breaker.redeploy();
        self.force_next_decision = self.breaker.state() == BreakerState::HalfOpen;
    }

    pub async fn test_connection(&self) -> Result<(String, String)> {
        let provider = self.provider.as_ref().ok_or(EngineError::Config {
            message: "LLM not initialized".into(),
        })?;
        let greeting = provider.test_connection().await?;
        Ok((provider.model_name(), greeting))
    }

    /// Token stats plus engine-health fields surfaced on every query.
    pub fn token_stats(&self) -> Value {
        let mut stats = self.tokens.stats();
        if let Some(map) = stats.as_object_mut() {
            map.insert(
                "engine".into(),
                json!({
                    "breaker": match self.breaker.state() {
                        BreakerState::Closed => "closed",
                        BreakerState::HalfOpen => "half_open",
                        BreakerState::Open => "open",
                    },
                    "consecutive_failures": self.breaker.consecutive_failures(),
                    "provider": self.current_provider_name,
                    "decision_cycles": self.cycle,
                }),
            );
            if let Some(provider) = &self.provider {
                let cache = provider.cache_stats();
                map.insert(
                    "cache".into(),
                    json!({
                        "creations": cache.creations,
                        "invalidations": cache.invalidations,
                        "reuses": cache.reuses,
                    }),
                );
            }
        }
        stats
    }

    // =========================================================================
    // Decision predicate inputs
    // =========================================================================

    /// Hash of decision-relevant world state: controlled groups (position
    /// rounded to 10 m, strength) and objective states.
    fn world_hash(snapshot: &Snapshot, evals: &[ObjectiveEval]) -> String {
        let mut parts: Vec<String> = snapshot
            .controlled_groups()
            .map(|g| {
                let p = g.position();
                format!(
                    "{}:{}:{}:{}",
                    g.id(),
                    (p[0] / 10.0).round() as i64 * 10,
                    (p[1] / 10.0).round() as i64 * 10,
                    g.unit_count()
                )
            })
            .collect();
        parts.sort();
        let mut objective_parts: Vec<String> = evals
            .iter()
            .map(|e| {
                format!(
                    "{}:{}:{:.1}",
                    e.objective.id,
                    e.state.as_str(),
                    e.dynamic_priority
                )
            })
            .collect();
        objective_parts.sort();
        parts.extend(objective_parts);

        let mut hasher = Sha256::new();
        hasher.update(parts.join("|").as_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn objectives_sig(evals: &[ObjectiveEval]) -> String {
        let mut parts: Vec<String> = evals
            .iter()
            .map(|e| {
                format!(
                    "{}:{}:{:.0}:{}",
                    e.objective.id,
                    e.objective.state.as_str(),
                    e.objective.priority,
                    e.objective.description
                )
            })
            .collect();
        parts.sort();
        crate::llm::cache::content_hash(&parts.join("|"))
    }

    /// The decision predicate: min-interval elapsed AND at least one
    /// change signal (or a forced probe after redeploy).
    fn should_decide(
        &mut self,
        snapshot: &Snapshot,
        evals: &[ObjectiveEval],
        min_interval: f64,
    ) -> bool {
        if self.force_next_decision {
            self.force_next_decision = false;
            return true;
        }

        if let Some(last) = self.last_decision_mission_time {
            if snapshot.mission_time - last < min_interval {
                debug_log!(
                    "Too soon for a new decision ({:.1}s since last, minimum {:.1}s)",
                    snapshot.mission_time - last,
                    min_interval
                );
                return false;
            }
        }

        let objectives_sig = Self::objectives_sig(evals);
        let objectives_changed = self
            .last_objectives_sig
            .as_ref()
            .map(|sig| *sig != objectives_sig)
            .unwrap_or(true);

        let contacts: HashSet<String> = snapshot
            .enemy_groups()
            .map(|g| g.id().to_string())
            .collect();
        let new_contact = contacts
            .iter()
            .any(|id| !self.last_enemy_contacts.contains(id));

        let world_hash = Self::world_hash(snapshot, evals);
        let world_changed = self
            .last_world_hash
            .as_ref()
            .map(|h| *h != world_hash)
            .unwrap_or(true);

        self.last_enemy_contacts = contacts;

        if !(objectives_changed || new_contact || world_changed) {
            debug_log!("No significant state change - skipping cycle");
            return false;
        }
        true
    }

    // =========================================================================
    // Main flow
    // =========================================================================

    /// Per-snapshot entry point. The snapshot has already been normalized;
    /// state mutation happens unconditionally, the decision part is gated.
    pub async fn process_snapshot(
        &mut self,
        snapshot: &Snapshot,
        state: &mut StateManager,
        queue: &mut CommandQueue,
    ) -> Result<()> {
        state.update_from_snapshot(snapshot);

        if !state.deployed {
            debug_log!("Commander not deployed, skipping decision loop");
            return Ok(());
        }

        let objectives = state.active_objectives(snapshot);
        if objectives.is_empty() {
            debug_log!("No objectives defined, skipping decision loop");
            return Ok(());
        }
        if snapshot.controlled_groups().next().is_none() {
            debug_log!("No controlled groups available, skipping decision loop");
            return Ok(());
        }

        let evals = evaluator::evaluate(snapshot, &objectives);

        let min_interval = state.ai.min_interval;
        if !self.should_decide(snapshot, &evals, min_interval) {
            return Ok(());
        }

        if !self.llm_enabled || self.provider.is_none() {
            warn_log!("LLM required but not enabled - no orders will be issued");
            return Ok(());
        }
        if self.breaker.check().is_err() {
            debug_log!("Circuit breaker open - decision skipped");
            return Ok(());
        }

        // Commit to a cycle: from here on the outcome is recorded.
        self.cycle += 1;
        self.last_decision_mission_time = Some(snapshot.mission_time);
        self.last_world_hash = Some(Self::world_hash(snapshot, &evals));
        self.last_objectives_sig = Some(Self::objectives_sig(&evals));

        info_log!(
            "Decision cycle {} started (T+{:.0}s, {} objectives, {} controlled groups)",
            self.cycle,
            snapshot.mission_time,
            evals.len(),
            snapshot.controlled_groups().count()
        );

        let situation = assess_situation(snapshot, &evals);
        let threat_level = situation.threat_level.to_string();
        let ctx = self.build_context(snapshot, state, &evals);
        let objectives_snapshot: Vec<Value> = evals
            .iter()
            .map(|e| {
                json!({
                    "id": e.objective.id,
                    "description": e.objective.description,
                    "state": e.state.as_str(),
                    "priority": e.objective.priority,
                    "dynamic_priority": e.dynamic_priority,
                    "friendly_count": e.friendly_count,
                    "enemy_count": e.enemy_count,
                })
            })
            .collect();

        // Transport-layer RPM window.
        self.rpm.acquire().await;

        let provider = self.provider.as_ref().expect("checked above").clone();
        provider.set_cancel_token(self.cancel_token.clone());

        if state.is_ao_active() {
            self.api_log.log_request(
                self.cycle,
                snapshot.mission_time,
                &provider.provider_name(),
                &provider.model_name(),
                &json!({
                    "mission_intent": ctx.mission_intent.clone(),
                    "world_state": ctx.world.clone(),
                }),
                ctx.cacheable_text().len(),
            );
        }

        let reply = match provider.generate_orders(&ctx).await {
            Ok(reply) => reply,
            Err(e) => {
                self.handle_provider_failure(&e, snapshot, state, objectives_snapshot, threat_level);
                return Ok(());
            }
        };
        self.breaker.record_success();
        if let (Some(manager), Some(name)) =
            (self.provider_manager.as_mut(), self.current_provider_name.as_ref())
        {
            manager.record_success(name);
        }

        self.tokens.record_call(&reply.usage);
        if state.is_ao_active() {
            self.api_log.log_response(
                true,
                Some(&json!({
                    "commentary": reply.commentary.clone(),
                    "orders": reply.orders.clone(),
                    "order_summary": reply.order_summary.clone(),
                })),
                Some(&reply.usage),
                None,
            );
            if let Some(thoughts) = &reply.thoughts {
                if state.ai.log_thoughts_to_file {
                    self.api_log.log_thoughts(self.cycle, thoughts);
                }
            }
        }

        // Parse, validate, deduplicate, enqueue.
        let (orders, parse_warnings) = parser::parse_orders(&reply.orders);
        for warning in &parse_warnings {
            warn_log!("{}", warning);
        }

        let mut rejected: Vec<RejectedOrder> = parse_warnings
            .into_iter()
            .map(|reason| RejectedOrder {
                order: Value::Null,
                reason,
            })
            .collect();
        let mut accepted: Vec<Command> = Vec::new();
        let mut seen_groups: HashSet<String> = HashSet::new();

        {
            let ao_defense_phase = state.is_ao_defense_phase();
            let mut ctx = SandboxCtx {
                snapshot,
                controlled_sides: &state.controlled_sides,
                friendly_sides: &state.friendly_sides,
                controlled_group_overrides: &state.controlled_group_overrides,
                bounds: state.ao_bounds.as_ref(),
                pool: &mut state.resource_pool,
                ao_defense_phase,
                spawned_units: &mut state.spawned_units,
            };

            for order in orders {
                let raw = order.to_value();
                // One order per group: first accepted order wins.
                if !order.group_id.is_empty() && seen_groups.contains(&order.group_id) {
                    warn_log!(
                        "Duplicate order for group {} - keeping first only",
                        order.group_id
                    );
                    rejected.push(RejectedOrder {
                        order: raw,
                        reason: format!("duplicate order for group {}", order.group_id),
                    });
                    continue;
                }
                match self.validator.validate(order, &mut ctx) {
                    Verdict::Validated { order, spawn_seed } => {
                        if !order.group_id.is_empty() {
                            seen_groups.insert(order.group_id.clone());
                        }
                        let priority = OrderValidator::assign_priority(&order);
                        accepted.push(Command {
                            order,
                            priority,
                            timestamp_ms: self.engine_start.elapsed().as_millis() as u64,
                            cycle: self.cycle,
                            validated: true,
                            spawn_seed,
                        });
                    }
                    Verdict::Rejected { reason } => {
                        rejected.push(RejectedOrder { order: raw, reason });
                    }
                }
            }
        }

        let accepted_values: Vec<Value> = accepted.iter().map(|c| c.to_value()).collect();
        info_log!(
            "Cycle {}: {} orders accepted, {} rejected",
            self.cycle,
            accepted.len(),
            rejected.len()
        );
        queue.enqueue_batch(accepted);

        // Order-summary continuity for the next dynamic context.
        if !reply.order_summary.is_empty() {
            self.order_summaries.push(json!({
                "cycle": self.cycle,
                "mission_time": snapshot.mission_time.round(),
                "summary": reply.order_summary.join("; "),
            }));
            let excess = self.order_summaries.len().saturating_sub(5);
            if excess > 0 {
                self.order_summaries.drain(..excess);
            }
        }

        if state.is_ao_active() {
            let record = CycleRecord {
                cycle: self.cycle,
                mission_time: snapshot.mission_time,
                wall_time: chrono::Utc::now(),
                orders: accepted_values,
                rejected,
                commentary: reply.commentary,
                order_summary: reply.order_summary,
                objectives: objectives_snapshot,
                threat_level,
                failure_note: None,
            };
            if let Err(e) = state.record_cycle(record) {
                error_log!("Failed to record cycle: {}", e);
            }
        }

        Ok(())
    }

    fn handle_provider_failure(
        &mut self,
        error: &EngineError,
        snapshot: &Snapshot,
        state: &mut StateManager,
        objectives_snapshot: Vec<Value>,
        threat_level: String,
    ) {
        error_log!(
            "Provider call failed on cycle {} ({}): {}",
            self.cycle,
            self.current_provider_name.as_deref().unwrap_or("unknown"),
            error
        );

        if error.counts_toward_breaker() {
            self.breaker.record_failure();
            if let (Some(manager), Some(name)) =
                (self.provider_manager.as_mut(), self.current_provider_name.as_ref())
            {
                manager.record_failure(name);
            }
            if self.breaker.state() == BreakerState::Open {
                error_log!(
                    "Circuit breaker OPEN after {} consecutive failures - decisions suspended",
                    self.breaker.consecutive_failures()
                );
            } else {
                self.try_provider_fallback(state);
            }
        }

        if state.is_ao_active() {
            self.api_log
                .log_response(false, None, None, Some(&error.to_string()));
            let record = CycleRecord {
                cycle: self.cycle,
                mission_time: snapshot.mission_time,
                wall_time: chrono::Utc::now(),
                orders: vec![],
                rejected: vec![],
                commentary: String::new(),
                order_summary: vec![],
                objectives: objectives_snapshot,
                threat_level,
                failure_note: Some(error.to_string()),
            };
            if let Err(e) = state.record_cycle(record) {
                error_log!("Failed to record failure cycle: {}", e);
            }
        }
    }

    /// Rotate to the next configured provider after a failure, when a
    /// fallback list exists.
    fn try_provider_fallback(&mut self, state: &StateManager) {
        let Some(manager) = self.provider_manager.as_mut() else {
            return;
        };
        manager.fallback_to_next();
        let Some(entry) = manager.next_available().cloned() else {
            return;
        };
        if Some(&entry.name) == self.current_provider_name.as_ref() {
            return;
        }
        match ProviderManager::build_client(&entry, state.api_key_override(&entry.ai.provider)) {
            Ok(client) => {
                info_log!("Switched to fallback provider: {}", entry.name);
                self.provider = Some(Arc::new(client));
                self.current_provider_name = Some(entry.name);
            }
            Err(e) => {
                warn_log!("Fallback provider {} failed to initialize: {}", entry.name, e);
            }
        }
    }

    fn build_context(
        &self,
        snapshot: &Snapshot,
        state: &StateManager,
        evals: &[ObjectiveEval],
    ) -> DecisionContext {
        let constraints = state.ao_bounds.as_ref().map(|bounds| {
            json!({
                "description": "All movements and deployments MUST stay within these bounds",
                "bounds": bounds,
            })
        });
        let resources = state.resource_pool.status_value();
        let world = build_world_value(
            snapshot,
            evals,
            &state.controlled_sides,
            &state.friendly_sides,
            constraints,
            resources,
            state.is_ao_defense_phase(),
            &self.order_summaries,
        );

        let mission_intent = if state.mission_intent.is_empty() {
            snapshot.mission_intent.clone()
        } else {
            state.mission_intent.clone()
        };

        DecisionContext {
            system_prompt: self.system_prompt.clone(),
            objectives: evals.to_vec(),
            previous_ao_intel: self.previous_intel.clone(),
            world,
            mission_intent,
            mission_time: snapshot.mission_time,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{AoBounds, EngineConfig};
    use crate::llm::cache::CacheStats;
    use crate::llm::GeneratedOrders;
    use crate::model::world::{
        Group, GroupBase, GroupClass, Objective, ObjectiveState, Side,
    };
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::time::Duration;

    /// Scripted provider: pops one result per call.
    pub(crate) struct MockProvider {
        pub replies: Mutex<VecDeque<Result<GeneratedOrders>>>,
        pub calls: Mutex<u32>,
    }

    impl MockProvider {
        pub fn new(replies: Vec<Result<GeneratedOrders>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                calls: Mutex::new(0),
            }
        }

        pub fn call_count(&self) -> u32 {
            *self.calls.lock()
        }

        pub fn reply_with_orders(orders: Vec<Value>) -> GeneratedOrders {
            GeneratedOrders {
                commentary: "holding pattern".into(),
                orders,
                order_summary: vec!["summary line".into()],
                thoughts: None,
                usage: crate::llm::TokenUsage {
                    input_tokens: 1500,
                    output_tokens: 200,
                    cached_input_tokens: 2800,
                    total_tokens: 1700,
                    latency_ms: 500,
                    provider: "mock".into(),
                    model: "mock-1".into(),
                },
                raw_text: "{}".into(),
                raw_request: json!({}),
            }
        }
    }

    #[async_trait]
    impl OrderProvider for MockProvider {
        async fn generate_orders(&self, _ctx: &DecisionContext) -> Result<GeneratedOrders> {
            *self.calls.lock() += 1;
            self.replies
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(Self::reply_with_orders(vec![])))
        }

        async fn test_connection(&self) -> Result<String> {
            Ok("mock ready".into())
        }

        fn supports_caching(&self) -> bool {
            true
        }
        fn supports_thinking(&self) -> bool {
            false
        }
        fn provider_name(&self) -> String {
            "mock".into()
        }
        fn model_name(&self) -> String {
            "mock-1".into()
        }
        fn reset(&self) {}
        fn set_cancel_token(&self, _token: CancellationToken) {}
        fn cache_stats(&self) -> CacheStats {
            CacheStats::default()
        }
    }

    fn group(id: &str, side: Side, pos: [f64; 3], units: u32, controlled: bool) -> Group {
        let base = GroupBase {
            id: id.to_string(),
            side,
            class: GroupClass::Infantry,
            position: pos,
            unit_count: units,
            behaviour: "AWARE".into(),
            combat_mode: "YELLOW".into(),
            formation: "WEDGE".into(),
            in_combat: false,
            waypoint: None,
        };
        if controlled {
            Group::Controlled {
                base,
                casualties: 0,
                speed_mode: "NORMAL".into(),
            }
        } else {
            Group::Observed {
                base,
                is_friendly: false,
                knowledge: 2.0,
            }
        }
    }

    fn objective(id: &str, priority: f64) -> Objective {
        Objective {
            id: id.to_string(),
            description: "hold the crossroads".into(),
            priority,
            position: [5000.0, 5000.0, 0.0],
            radius: 200.0,
            task_type: "defend_area".into(),
            state: ObjectiveState::Active,
            metadata: Default::default(),
        }
    }

    pub(crate) fn test_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.ai.enabled = true;
        config.ai.min_interval = 30.0;
        config.ai.rate_limit_rpm = 1000;
        config.data_dir = tempfile::tempdir().unwrap().into_path().to_string_lossy().into_owned();
        config.guardrails.ao_bounds = Some(AoBounds::Circle {
            center: [5000.0, 5000.0],
            radius: 1500.0,
        });
        config
    }

    fn base_snapshot(mission_time: f64) -> Snapshot {
        Snapshot {
            mission_time,
            controlled_sides: vec![Side::East],
            groups: vec![group("GRP_EAST_1", Side::East, [5050.0, 5050.0, 0.0], 8, true)],
            ..Default::default()
        }
    }

    fn setup() -> (Commander, StateManager, CommandQueue, EngineConfig) {
        let config = test_config();
        let mut state = StateManager::new(&config);
        state.set_controlled_sides(vec![Side::East]);
        state.deploy();
        state.add_objective(objective("O1", 10.0));
        let commander = Commander::new(&config);
        let queue = CommandQueue::new(30);
        (commander, state, queue, config)
    }

    #[tokio::test]
    async fn test_secured_objective_no_llm_call() {
        // S1: secured objective, interval not elapsed -> no call, no cycle.
        let (mut commander, mut state, mut queue, _config) = setup();
        let provider = Arc::new(MockProvider::new(vec![]));
        commander.set_provider(provider.clone());
        state
            .start_ao("AO_1".into(), "Altis".into(), "m".into(), 1)
            .unwrap();

        // First snapshot decides (no prior decision); second comes 10 s
        // later with no change and must not.
        let snap = base_snapshot(100.0);
        commander
            .process_snapshot(&snap, &mut state, &mut queue)
            .await
            .unwrap();
        assert_eq!(provider.call_count(), 1);

        let snap = base_snapshot(110.0);
        commander
            .process_snapshot(&snap, &mut state, &mut queue)
            .await
            .unwrap();
        assert_eq!(provider.call_count(), 1);
        assert_eq!(commander.cycle(), 1);
        assert!(queue.drain(30).is_empty());
        assert_eq!(state.current_ao().unwrap().cycles.len(), 1);
    }

    #[tokio::test]
    async fn test_threatened_objective_defend_order_flows_to_queue() {
        // S2: threat appears, LLM returns defend_area, sandbox accepts.
        let (mut commander, mut state, mut queue, _config) = setup();
        let order = json!({
            "type": "defend_area",
            "group_id": "GRP_EAST_1",
            "position": [5000.0, 5000.0, 0.0],
            "radius": 150,
            "priority": 9
        });
        let provider = Arc::new(MockProvider::new(vec![Ok(
            MockProvider::reply_with_orders(vec![order]),
        )]));
        commander.set_provider(provider.clone());
        state
            .start_ao("AO_1".into(), "Altis".into(), "m".into(), 1)
            .unwrap();

        let mut snap = base_snapshot(100.0);
        for i in 0..3 {
            snap.groups.push(group(
                &format!("GRP_WEST_{}", i),
                Side::West,
                [5050.0 + i as f64, 5000.0, 0.0],
                6,
                false,
            ));
        }
        commander
            .process_snapshot(&snap, &mut state, &mut queue)
            .await
            .unwrap();
        assert_eq!(provider.call_count(), 1);
        assert_eq!(queue.len(), 1);
        let drained = queue.drain(30);
        assert_eq!(drained[0].priority, 9);
        assert_eq!(drained[0].command_type().as_str(), "defend_area");
        // Cycle record carries the accepted order.
        let ao = state.current_ao().unwrap();
        assert_eq!(ao.cycles.len(), 1);
        assert_eq!(ao.cycles[0].orders.len(), 1);
    }

    #[tokio::test]
    async fn test_out_of_bounds_order_rejected_and_recorded() {
        // S3: move_to outside the AO circle is rejected with a reason.
        let (mut commander, mut state, mut queue, _config) = setup();
        let order = json!({
            "type": "move_to",
            "group_id": "GRP_EAST_1",
            "position": [20000.0, 20000.0, 0.0]
        });
        let provider = Arc::new(MockProvider::new(vec![Ok(
            MockProvider::reply_with_orders(vec![order]),
        )]));
        commander.set_provider(provider);
        state
            .start_ao("AO_1".into(), "Altis".into(), "m".into(), 1)
            .unwrap();

        commander
            .process_snapshot(&base_snapshot(100.0), &mut state, &mut queue)
            .await
            .unwrap();
        assert!(queue.is_empty());
        let ao = state.current_ao().unwrap();
        assert_eq!(ao.cycles[0].orders.len(), 0);
        assert_eq!(ao.cycles[0].rejected.len(), 1);
        assert!(ao.cycles[0].rejected[0].reason.contains("outside AO"));
    }

    #[tokio::test]
    async fn test_breaker_opens_after_three_failures_and_recovers() {
        // S5: three timeouts open the breaker; the fourth ingestion makes
        // no call; redeploy probes; success closes.
        let (mut commander, mut state, mut queue, _config) = setup();
        let timeout = || {
            Err(EngineError::Timeout {
                timeout: Duration::from_secs(30),
            })
        };
        let provider = Arc::new(MockProvider::new(vec![
            timeout(),
            timeout(),
            timeout(),
            Ok(MockProvider::reply_with_orders(vec![])),
        ]));
        commander.set_provider(provider.clone());
        state
            .start_ao("AO_1".into(), "Altis".into(), "m".into(), 1)
            .unwrap();

        // Each failing call needs the interval elapsed and a state change.
        for i in 0..3u32 {
            let mut snap = base_snapshot(100.0 + i as f64 * 60.0);
            snap.groups[0] = group(
                "GRP_EAST_1",
                Side::East,
                [5050.0 + i as f64 * 50.0, 5050.0, 0.0],
                8,
                true,
            );
            commander
                .process_snapshot(&snap, &mut state, &mut queue)
                .await
                .unwrap();
        }
        assert_eq!(provider.call_count(), 3);
        assert_eq!(commander.breaker_state(), BreakerState::Open);
        assert_eq!(commander.consecutive_failures(), 3);

        // Fourth ingestion: breaker open, no outbound call, counter frozen.
        let mut snap = base_snapshot(400.0);
        snap.groups[0] = group("GRP_EAST_1", Side::East, [5400.0, 5050.0, 0.0], 8, true);
        commander
            .process_snapshot(&snap, &mut state, &mut queue)
            .await
            .unwrap();
        assert_eq!(provider.call_count(), 3);
        assert_eq!(commander.consecutive_failures(), 3);

        // Emergency stop keeps it open; redeploy arms a half-open probe.
        commander.emergency_stop();
        assert_eq!(commander.breaker_state(), BreakerState::Open);
        commander.redeploy();
        assert_eq!(commander.breaker_state(), BreakerState::HalfOpen);

        let snap = base_snapshot(500.0);
        commander
            .process_snapshot(&snap, &mut state, &mut queue)
            .await
            .unwrap();
        assert_eq!(provider.call_count(), 4);
        assert_eq!(commander.breaker_state(), BreakerState::Closed);
        assert_eq!(commander.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_half_open_probe_failure_reopens() {
        let (mut commander, mut state, mut queue, _config) = setup();
        let provider = Arc::new(MockProvider::new(vec![Err(EngineError::Timeout {
            timeout: Duration::from_secs(30),
        })]));
        commander.set_provider(provider);
        state
            .start_ao("AO_1".into(), "Altis".into(), "m".into(), 1)
            .unwrap();
        commander.emergency_stop();
        commander.redeploy();

        commander
            .process_snapshot(&base_snapshot(100.0), &mut state, &mut queue)
            .await
            .unwrap();
        assert_eq!(commander.breaker_state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn test_parse_failure_records_empty_cycle() {
        let (mut commander, mut state, mut queue, _config) = setup();
        let provider = Arc::new(MockProvider::new(vec![Err(
            EngineError::MalformedResponse {
                message: "no JSON object found in reply".into(),
            },
        )]));
        commander.set_provider(provider);
        state
            .start_ao("AO_1".into(), "Altis".into(), "m".into(), 1)
            .unwrap();

        commander
            .process_snapshot(&base_snapshot(100.0), &mut state, &mut queue)
            .await
            .unwrap();
        let ao = state.current_ao().unwrap();
        assert_eq!(ao.cycles.len(), 1);
        assert!(ao.cycles[0].orders.is_empty());
        assert!(ao.cycles[0]
            .failure_note
            .as_ref()
            .unwrap()
            .contains("no JSON"));
    }

    #[tokio::test]
    async fn test_not_deployed_means_no_decision() {
        let (mut commander, mut state, mut queue, _config) = setup();
        let provider = Arc::new(MockProvider::new(vec![]));
        commander.set_provider(provider.clone());
        state.undeploy();
        commander
            .process_snapshot(&base_snapshot(100.0), &mut state, &mut queue)
            .await
            .unwrap();
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn test_min_interval_zero_decides_every_changed_snapshot() {
        let (mut commander, mut state, mut queue, _config) = setup();
        state.ai.min_interval = 0.0;
        let provider = Arc::new(MockProvider::new(vec![]));
        commander.set_provider(provider.clone());
        state
            .start_ao("AO_1".into(), "Altis".into(), "m".into(), 1)
            .unwrap();

        for i in 0..3u32 {
            let mut snap = base_snapshot(100.0 + i as f64);
            snap.groups[0] = group(
                "GRP_EAST_1",
                Side::East,
                [5050.0 + i as f64 * 20.0, 5050.0, 0.0],
                8,
                true,
            );
            commander
                .process_snapshot(&snap, &mut state, &mut queue)
                .await
                .unwrap();
        }
        assert_eq!(provider.call_count(), 3);
    }

    #[tokio::test]
    async fn test_duplicate_orders_per_group_deduplicated() {
        let (mut commander, mut state, mut queue, _config) = setup();
        let make = |radius: f64| {
            json!({
                "type": "defend_area",
                "group_id": "GRP_EAST_1",
                "position": [5000.0, 5000.0, 0.0],
                "radius": radius
            })
        };
        let provider = Arc::new(MockProvider::new(vec![Ok(
            MockProvider::reply_with_orders(vec![make(150.0), make(300.0)]),
        )]));
        commander.set_provider(provider);
        state
            .start_ao("AO_1".into(), "Altis".into(), "m".into(), 1)
            .unwrap();

        commander
            .process_snapshot(&base_snapshot(100.0), &mut state, &mut queue)
            .await
            .unwrap();
        assert_eq!(queue.len(), 1);
        let drained = queue.drain(30);
        match &drained[0].order.params {
            crate::model::orders::OrderParams::DefendArea { radius, .. } => {
                assert_eq!(*radius, 150.0)
            }
            _ => panic!("wrong variant"),
        }
    }

    #[tokio::test]
    async fn test_order_summaries_feed_back_capped_at_five() {
        let (mut commander, mut state, mut queue, _config) = setup();
        let replies: Vec<Result<GeneratedOrders>> = (0..7)
            .map(|_| Ok(MockProvider::reply_with_orders(vec![])))
            .collect();
        let provider = Arc::new(MockProvider::new(replies));
        commander.set_provider(provider);
        state
            .start_ao("AO_1".into(), "Altis".into(), "m".into(), 1)
            .unwrap();

        for i in 0..7u32 {
            let mut snap = base_snapshot(100.0 + i as f64 * 60.0);
            snap.groups[0] = group(
                "GRP_EAST_1",
                Side::East,
                [5050.0 + i as f64 * 30.0, 5050.0, 0.0],
                8,
                true,
            );
            commander
                .process_snapshot(&snap, &mut state, &mut queue)
                .await
                .unwrap();
        }
        assert_eq!(commander.order_summaries.len(), 5);
    }

    #[tokio::test]
    async fn test_token_stats_surface_breaker_state() {
        let (mut commander, _state, _queue, _config) = setup();
        commander.emergency_stop();
        let stats = commander.token_stats();
        assert_eq!(stats["engine"]["breaker"], "open");
    }
}
