//! Order sandbox
//!
//! Every parsed order passes through these layers before it may enter the
//! command queue. Checks apply in a fixed sequence and the first failure is
//! the verdict. Resource-pool reservation happens last so a rejection at
//! any layer leaves the counters untouched.

use crate::config::{AoBounds, SafetyConfig};
use crate::model::orders::{CommandType, Order, OrderParams};
use crate::model::world::{Pos, Side, Snapshot};
use crate::state::ResourcePool;
use std::collections::{HashMap, HashSet};

/// Validation result for one order.
#[derive(Debug, Clone)]
pub enum Verdict {
    Validated {
        /// The order, possibly amended (template unit classes filled in)
        order: Order,
        /// Off-map spawn point for vehicle deployments
        spawn_seed: Option<Pos>,
    },
    Rejected {
        reason: String,
    },
}

impl Verdict {
    pub fn is_validated(&self) -> bool {
        matches!(self, Verdict::Validated { .. })
    }

    fn reject(reason: impl Into<String>) -> Verdict {
        Verdict::Rejected {
            reason: reason.into(),
        }
    }
}

/// Mutable world and guardrail state a validation pass runs against.
pub struct SandboxCtx<'a> {
    pub snapshot: &'a Snapshot,
    pub controlled_sides: &'a [Side],
    pub friendly_sides: &'a [Side],
    pub controlled_group_overrides: &'a [String],
    pub bounds: Option<&'a AoBounds>,
    pub pool: &'a mut ResourcePool,
    pub ao_defense_phase: bool,
    /// Units spawned by the engine this AO, per side
    pub spawned_units: &'a mut HashMap<Side, u32>,
}

/// Heuristic: asset types that arrive as vehicles and must stage outside
/// the AO before driving in.
fn is_vehicle_asset(asset_type: &str) -> bool {
    const VEHICLE_HINTS: &[&str] = &[
        "motorized", "mechanized", "armor", "vehicle", "tank", "mbt", "ifv", "apc", "heli",
        "air", "patrol", "artillery", "aa",
    ];
    let lower = asset_type.to_ascii_lowercase();
    VEHICLE_HINTS.iter().any(|hint| lower.contains(hint))
}

/// Vehicle staging distance outside the AO edge, meters.
const SEED_STANDOFF: f64 = 2_000.0;

/// Choose a staging point at least 2 km outside the AO, on the ray from the
/// AO center through the ordered destination.
fn seed_outside(bounds: &AoBounds, destination: &Pos) -> Pos {
    let center = bounds.center();
    let dx = destination[0] - center[0];
    let dy = destination[1] - center[1];
    let len = (dx * dx + dy * dy).sqrt();
    let (ux, uy) = if len > 1.0 { (dx / len, dy / len) } else { (1.0, 0.0) };
    let reach = bounds.extent() + SEED_STANDOFF;
    [center[0] + ux * reach, center[1] + uy * reach, 0.0]
}

pub struct OrderValidator {
    enabled: bool,
    audit_log: bool,
    allowed: HashSet<String>,
    blocked: HashSet<String>,
    max_units_per_side: u32,
}

impl OrderValidator {
    pub fn new(safety: &SafetyConfig) -> Self {
        Self {
            enabled: safety.sandbox_enabled,
            audit_log: safety.audit_log,
            allowed: safety.allowed_commands.iter().cloned().collect(),
            blocked: safety.blocked_commands.iter().cloned().collect(),
            max_units_per_side: safety.max_units_per_side,
        }
    }

    /// Validate a batch, returning verdicts in input order.
    pub fn validate_all(&self, orders: Vec<Order>, ctx: &mut SandboxCtx<'_>) -> Vec<Verdict> {
        orders
            .into_iter()
            .map(|order| {
                let verdict = self.validate(order, ctx);
                if self.audit_log {
                    match &verdict {
                        Verdict::Validated { order, .. } => {
                            crate::info_log!(
                                "[AUDIT] ALLOWED: {} for group {}",
                                order.command_type(),
                                if order.group_id.is_empty() { "<new>" } else { &order.group_id }
                            );
                        }
                        Verdict::Rejected { reason } => {
                            crate::warn_log!("[AUDIT] BLOCKED: {}", reason);
                        }
                    }
                }
                verdict
            })
            .collect()
    }

    pub fn validate(&self, order: Order, ctx: &mut SandboxCtx<'_>) -> Verdict {
        if !self.enabled {
            crate::warn_log!("Sandbox validation is DISABLED - order passes through");
            return Verdict::Validated {
                order,
                spawn_seed: None,
            };
        }

        let command_type = order.command_type();
        let type_name = command_type.as_str();

        // Layer 1: allow-list and block-list.
        if !self.allowed.contains(type_name) {
            return Verdict::reject(format!("command type '{}' not allowed", type_name));
        }
        if self.blocked.contains(type_name) {
            return Verdict::reject(format!("command type '{}' is blocked", type_name));
        }

        // Layer 2: schema completeness beyond what parsing guarantees.
        if let Err(reason) = self.check_schema(&order) {
            return Verdict::reject(reason);
        }

        // Layer 3: group existence and controllability.
        if let Err(reason) = self.check_groups(&order, ctx) {
            return Verdict::reject(reason);
        }

        // Layer 4: geography.
        let spawn_seed = match self.check_geography(&order, ctx) {
            Ok(seed) => seed,
            Err(reason) => return Verdict::reject(reason),
        };

        // Layer 7 (cheap, no side effects): parameter ranges.
        if let Err(reason) = self.check_ranges(&order) {
            return Verdict::reject(reason);
        }

        // Layers 5 and 6 for spawning orders: pool capacity, defense-only
        // gating, side unit cap. Reservation is the final act so earlier
        // rejections never touch the counters.
        let order = match self.check_and_reserve_spawn(order, ctx) {
            Ok(order) => order,
            Err(reason) => return Verdict::reject(reason),
        };

        Verdict::Validated { order, spawn_seed }
    }

    fn check_schema(&self, order: &Order) -> Result<(), String> {
        match &order.params {
            OrderParams::PatrolRoute { waypoints, .. } if waypoints.len() < 2 => {
                Err("patrol_route requires at least 2 waypoints".into())
            }
            OrderParams::TransportGroup {
                passenger_group_id, ..
            } if passenger_group_id.is_empty() => {
                Err("transport_group requires a passenger group".into())
            }
            OrderParams::EscortGroup {
                target_group_id, ..
            } if target_group_id.is_empty() => Err("escort_group requires a target group".into()),
            _ => Ok(()),
        }
    }

    fn group_is_controllable(&self, group_id: &str, ctx: &SandboxCtx<'_>) -> Result<(), String> {
        // Orders may reference groups whose spawn was accepted earlier in
        // this same reply.
        if group_id.starts_with("SPAWN_") || group_id.starts_with("DEPLOY_") {
            return Ok(());
        }
        if ctx.controlled_group_overrides.iter().any(|g| g == group_id) {
            return Ok(());
        }
        let Some(group) = ctx.snapshot.group_by_id(group_id) else {
            return Err(format!("group '{}' not found", group_id));
        };
        if !group.is_controlled() {
            return Err(format!("group '{}' is not controlled", group_id));
        }
        if !ctx.controlled_sides.contains(&group.side()) {
            return Err(format!(
                "group '{}' side {} is not a controlled side",
                group_id,
                group.side()
            ));
        }
        Ok(())
    }

    fn check_groups(&self, order: &Order, ctx: &SandboxCtx<'_>) -> Result<(), String> {
        match &order.params {
            OrderParams::DeployAsset { side, .. } | OrderParams::SpawnSquad { side, .. } => {
                if !ctx.controlled_sides.contains(side) {
                    return Err(format!("spawn side {} is not a controlled side", side));
                }
                Ok(())
            }
            OrderParams::TransportGroup {
                passenger_group_id, ..
            } => {
                self.group_is_controllable(&order.group_id, ctx)?;
                self.group_is_controllable(passenger_group_id, ctx)?;
                // Plain infantry cannot carry passengers.
                if let Some(vehicle) = ctx.snapshot.group_by_id(&order.group_id) {
                    if !vehicle.class().can_transport() {
                        return Err(format!(
                            "group '{}' ({}) cannot transport",
                            order.group_id,
                            vehicle.class().as_str()
                        ));
                    }
                }
                Ok(())
            }
            OrderParams::EscortGroup {
                target_group_id, ..
            } => {
                self.group_is_controllable(&order.group_id, ctx)?;
                let Some(target) = ctx.snapshot.group_by_id(target_group_id) else {
                    return Err(format!("escort target '{}' not found", target_group_id));
                };
                if !target.is_controlled() && !target.is_friendly() {
                    return Err(format!(
                        "escort target '{}' is not friendly or controlled",
                        target_group_id
                    ));
                }
                Ok(())
            }
            OrderParams::FireSupport { .. } => {
                self.group_is_controllable(&order.group_id, ctx)?;
                if let Some(group) = ctx.snapshot.group_by_id(&order.group_id) {
                    if !group.class().can_fire_support() {
                        return Err(format!(
                            "group '{}' ({}) cannot provide fire support",
                            order.group_id,
                            group.class().as_str()
                        ));
                    }
                }
                Ok(())
            }
            _ => self.group_is_controllable(&order.group_id, ctx),
        }
    }

    fn check_geography(
        &self,
        order: &Order,
        ctx: &SandboxCtx<'_>,
    ) -> Result<Option<Pos>, String> {
        let positions = order.params.positions();
        for pos in &positions {
            if !pos.iter().all(|c| c.is_finite()) {
                return Err("position has non-finite coordinates".into());
            }
        }

        let Some(bounds) = ctx.bounds else {
            // No AO bounds configured: only the finite check applies.
            return Ok(None);
        };

        for pos in &positions {
            if !bounds.contains(pos) {
                return Err(format!(
                    "position [{:.0}, {:.0}] outside AO",
                    pos[0], pos[1]
                ));
            }
        }

        // Vehicle deployments stage outside the AO and drive to the
        // (in-bounds) destination.
        if let OrderParams::DeployAsset {
            asset_type,
            position,
            ..
        } = &order.params
        {
            if is_vehicle_asset(asset_type) {
                return Ok(Some(seed_outside(bounds, position)));
            }
        }
        Ok(None)
    }

    fn check_ranges(&self, order: &Order) -> Result<(), String> {
        if let Some(radius) = order.params.radius() {
            if !(radius > 0.0 && radius <= 10_000.0) {
                return Err(format!("radius {} out of range (0, 10000]", radius));
            }
        }
        Ok(())
    }

    fn check_and_reserve_spawn(
        &self,
        mut order: Order,
        ctx: &mut SandboxCtx<'_>,
    ) -> Result<Order, String> {
        let (side, requested_units) = match &mut order.params {
            OrderParams::DeployAsset {
                side,
                asset_type,
                unit_classes,
                ..
            } => {
                let side = *side;
                let Some(template) = ctx.pool.template(side, asset_type) else {
                    return Err(format!(
                        "no resource template for {}:{}",
                        side, asset_type
                    ));
                };
                if template.defense_only && !ctx.ao_defense_phase {
                    return Err(format!(
                        "{}:{} is defense_only and AO defense phase is not active",
                        side, asset_type
                    ));
                }
                if unit_classes.is_empty() {
                    *unit_classes = template.classnames.clone();
                }
                if unit_classes.is_empty() {
                    return Err(format!("{}:{} has no unit classes", side, asset_type));
                }
                if ctx.pool.remaining(side, asset_type) == Some(0) {
                    return Err(format!("pool exhausted for {}:{}", side, asset_type));
                }
                (side, unit_classes.len() as u32)
            }
            OrderParams::SpawnSquad {
                side, unit_classes, ..
            } => {
                if unit_classes.is_empty() {
                    return Err("spawn_squad has no unit classes".into());
                }
                if unit_classes.len() > 20 {
                    return Err(format!(
                        "spawn_squad too large ({} units, max 20)",
                        unit_classes.len()
                    ));
                }
                (*side, unit_classes.len() as u32)
            }
            _ => return Ok(order),
        };

        // Side unit cap covers reported plus engine-spawned units.
        let reported = ctx
            .snapshot
            .ai_deployment
            .get(&side)
            .copied()
            .unwrap_or(0);
        let pending = ctx.spawned_units.get(&side).copied().unwrap_or(0);
        if reported + pending + requested_units > self.max_units_per_side {
            return Err(format!(
                "spawn would exceed max units for {} ({} + {} + {} > {})",
                side, reported, pending, requested_units, self.max_units_per_side
            ));
        }

        // All checks passed: now commit the reservation.
        if let OrderParams::DeployAsset {
            side, asset_type, ..
        } = &order.params
        {
            if !ctx.pool.reserve(*side, asset_type) {
                return Err(format!("pool exhausted for {}:{}", side, asset_type));
            }
        }
        *ctx.spawned_units.entry(side).or_insert(0) += requested_units;

        Ok(order)
    }

    /// Clamp an LLM-supplied priority onto the queue scale.
    pub fn assign_priority(order: &Order) -> u8 {
        order.priority.unwrap_or(5.0).clamp(0.0, 10.0).round() as u8
    }

    pub fn allowed_commands(&self) -> &HashSet<String> {
        &self.allowed
    }

    pub fn blocked_commands(&self) -> &HashSet<String> {
        &self.blocked
    }

    /// True when the type would pass layer 1.
    pub fn type_permitted(&self, command_type: CommandType) -> bool {
        let name = command_type.as_str();
        self.allowed.contains(name) && !self.blocked.contains(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AssetSpec, SafetyConfig};
    use crate::model::world::{Group, GroupBase, GroupClass};

    fn group(id: &str, side: Side, class: GroupClass, controlled: bool) -> Group {
        let base = GroupBase {
            id: id.to_string(),
            side,
            class,
            position: [5000.0, 5000.0, 0.0],
            unit_count: 6,
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

    struct Fixture {
        snapshot: Snapshot,
        pool: ResourcePool,
        spawned: HashMap<Side, u32>,
        bounds: AoBounds,
        controlled: Vec<Side>,
        friendly: Vec<Side>,
        overrides: Vec<String>,
    }

    impl Fixture {
        fn new() -> Self {
            let mut pool = ResourcePool::new();
            pool.add_asset(
                Side::East,
                "infantry_squad",
                AssetSpec {
                    classnames: vec!["A".into(), "B".into(), "C".into()],
                    max: 2,
                    defense_only: false,
                    description: String::new(),
                },
            );
            pool.add_asset(
                Side::East,
                "heavy_armor",
                AssetSpec {
                    classnames: vec!["TANK".into()],
                    max: 1,
                    defense_only: true,
                    description: String::new(),
                },
            );
            Self {
                snapshot: Snapshot {
                    controlled_sides: vec![Side::East],
                    groups: vec![
                        group("GRP_EAST_1", Side::East, GroupClass::Infantry, true),
                        group("GRP_EAST_TRUCK", Side::East, GroupClass::Motorized, true),
                        group("GRP_WEST_1", Side::West, GroupClass::Infantry, false),
                    ],
                    ..Default::default()
                },
                pool,
                spawned: HashMap::new(),
                bounds: AoBounds::Circle {
                    center: [5000.0, 5000.0],
                    radius: 1500.0,
                },
                controlled: vec![Side::East],
                friendly: vec![],
                overrides: vec![],
            }
        }

        fn ctx(&mut self) -> SandboxCtx<'_> {
            SandboxCtx {
                snapshot: &self.snapshot,
                controlled_sides: &self.controlled,
                friendly_sides: &self.friendly,
                controlled_group_overrides: &self.overrides,
                bounds: Some(&self.bounds),
                pool: &mut self.pool,
                ao_defense_phase: false,
                spawned_units: &mut self.spawned,
            }
        }
    }

    fn validator() -> OrderValidator {
        OrderValidator::new(&SafetyConfig::default())
    }

    fn move_order(group_id: &str, pos: Pos) -> Order {
        Order {
            group_id: group_id.into(),
            params: OrderParams::MoveTo {
                position: pos,
                speed: None,
                formation: None,
                behaviour: None,
                combat_mode: None,
            },
            priority: None,
            objective_id: None,
        }
    }

    fn deploy_order(asset_type: &str) -> Order {
        Order {
            group_id: String::new(),
            params: OrderParams::DeployAsset {
                side: Side::East,
                asset_type: asset_type.into(),
                unit_classes: vec![],
                position: [5200.0, 5200.0, 0.0],
                objective_id: None,
            },
            priority: None,
            objective_id: None,
        }
    }

    #[test]
    fn test_blocked_command_rejected() {
        let mut safety = SafetyConfig::default();
        safety.blocked_commands = vec!["fire_support".into()];
        let validator = OrderValidator::new(&safety);
        let mut fixture = Fixture::new();
        let order = Order {
            group_id: "GRP_EAST_TRUCK".into(),
            params: OrderParams::FireSupport {
                position: [5100.0, 5100.0, 0.0],
                radius: 250.0,
            },
            priority: None,
            objective_id: None,
        };
        let verdict = validator.validate(order, &mut fixture.ctx());
        assert!(matches!(verdict, Verdict::Rejected { reason } if reason.contains("blocked")));
    }

    #[test]
    fn test_out_of_bounds_rejected() {
        let mut fixture = Fixture::new();
        let verdict = validator().validate(
            move_order("GRP_EAST_1", [20000.0, 20000.0, 0.0]),
            &mut fixture.ctx(),
        );
        assert!(matches!(verdict, Verdict::Rejected { reason } if reason.contains("outside AO")));
    }

    #[test]
    fn test_uncontrolled_group_rejected() {
        let mut fixture = Fixture::new();
        let verdict = validator().validate(
            move_order("GRP_WEST_1", [5100.0, 5100.0, 0.0]),
            &mut fixture.ctx(),
        );
        assert!(matches!(verdict, Verdict::Rejected { reason } if reason.contains("not controlled")));
    }

    #[test]
    fn test_unknown_group_rejected_but_pending_spawn_passes() {
        let mut fixture = Fixture::new();
        let verdict = validator().validate(
            move_order("GRP_GHOST", [5100.0, 5100.0, 0.0]),
            &mut fixture.ctx(),
        );
        assert!(matches!(verdict, Verdict::Rejected { reason } if reason.contains("not found")));

        let verdict = validator().validate(
            move_order("DEPLOY_EAST_1", [5100.0, 5100.0, 0.0]),
            &mut fixture.ctx(),
        );
        assert!(verdict.is_validated());
    }

    #[test]
    fn test_pool_exhaustion_leaves_counters_unchanged() {
        let mut fixture = Fixture::new();
        let validator = validator();
        // Two deployments fit the max=2 pool.
        for _ in 0..2 {
            let verdict = validator.validate(deploy_order("infantry_squad"), &mut fixture.ctx());
            assert!(verdict.is_validated());
        }
        assert_eq!(fixture.pool.remaining(Side::East, "infantry_squad"), Some(0));

        let verdict = validator.validate(deploy_order("infantry_squad"), &mut fixture.ctx());
        assert!(matches!(verdict, Verdict::Rejected { reason } if reason.contains("pool exhausted")));
        assert_eq!(fixture.pool.remaining(Side::East, "infantry_squad"), Some(0));
        // Spawned-unit ledger untouched by the rejection: 2 squads of 3.
        assert_eq!(fixture.spawned[&Side::East], 6);
    }

    #[test]
    fn test_template_fills_unit_classes() {
        let mut fixture = Fixture::new();
        let verdict = validator().validate(deploy_order("infantry_squad"), &mut fixture.ctx());
        match verdict {
            Verdict::Validated { order, spawn_seed } => {
                assert!(spawn_seed.is_none());
                match order.params {
                    OrderParams::DeployAsset { unit_classes, .. } => {
                        assert_eq!(unit_classes, vec!["A", "B", "C"]);
                    }
                    _ => panic!("wrong variant"),
                }
            }
            Verdict::Rejected { reason } => panic!("rejected: {}", reason),
        }
    }

    #[test]
    fn test_defense_only_gated_by_phase() {
        let mut fixture = Fixture::new();
        let validator = validator();
        let verdict = validator.validate(deploy_order("heavy_armor"), &mut fixture.ctx());
        assert!(matches!(verdict, Verdict::Rejected { reason } if reason.contains("defense_only")));

        let mut ctx = fixture.ctx();
        ctx.ao_defense_phase = true;
        let verdict = validator.validate(deploy_order("heavy_armor"), &mut ctx);
        match verdict {
            Verdict::Validated { spawn_seed, .. } => {
                // Armor stages outside the AO.
                let seed = spawn_seed.expect("vehicle assets get a staging seed");
                assert!(!fixture.bounds.contains(&seed));
            }
            Verdict::Rejected { reason } => panic!("rejected: {}", reason),
        }
    }

    #[test]
    fn test_vehicle_seed_standoff_distance() {
        let bounds = AoBounds::Circle {
            center: [5000.0, 5000.0],
            radius: 1500.0,
        };
        let seed = seed_outside(&bounds, &[5500.0, 5000.0, 0.0]);
        let d = ((seed[0] - 5000.0f64).powi(2) + (seed[1] - 5000.0f64).powi(2)).sqrt();
        assert!(d >= 1500.0 + 2000.0 - 1e-6);
    }

    #[test]
    fn test_spawn_cap_enforced() {
        let mut fixture = Fixture::new();
        fixture.snapshot.ai_deployment.insert(Side::East, 99);
        let verdict = validator().validate(deploy_order("infantry_squad"), &mut fixture.ctx());
        assert!(matches!(verdict, Verdict::Rejected { reason } if reason.contains("max units")));
        // No reservation leaked.
        assert_eq!(fixture.pool.remaining(Side::East, "infantry_squad"), Some(2));
    }

    #[test]
    fn test_transport_requires_vehicle() {
        let mut fixture = Fixture::new();
        let validator = validator();
        let order = |vehicle: &str| Order {
            group_id: vehicle.into(),
            params: OrderParams::TransportGroup {
                passenger_group_id: "GRP_EAST_1".into(),
                pickup: [5100.0, 5100.0, 0.0],
                dropoff: [4900.0, 4900.0, 0.0],
            },
            priority: None,
            objective_id: None,
        };
        let verdict = validator.validate(order("GRP_EAST_1"), &mut fixture.ctx());
        assert!(matches!(verdict, Verdict::Rejected { reason } if reason.contains("cannot transport")));
        let verdict = validator.validate(order("GRP_EAST_TRUCK"), &mut fixture.ctx());
        assert!(verdict.is_validated());
    }

    #[test]
    fn test_radius_range() {
        let mut fixture = Fixture::new();
        let order = Order {
            group_id: "GRP_EAST_1".into(),
            params: OrderParams::DefendArea {
                position: [5100.0, 5100.0, 0.0],
                radius: 50_000.0,
            },
            priority: None,
            objective_id: None,
        };
        let verdict = validator().validate(order, &mut fixture.ctx());
        assert!(matches!(verdict, Verdict::Rejected { reason } if reason.contains("out of range")));
    }

    #[test]
    fn test_no_bounds_reduces_to_finite_check() {
        let mut fixture = Fixture::new();
        let mut ctx = fixture.ctx();
        ctx.bounds = None;
        let verdict = validator().validate(
            move_order("GRP_EAST_1", [999_999.0, 999_999.0, 0.0]),
            &mut ctx,
        );
        assert!(verdict.is_validated());
    }

    #[test]
    fn test_priority_assignment_clamps() {
        let mut order = move_order("GRP_EAST_1", [0.0, 0.0, 0.0]);
        assert_eq!(OrderValidator::assign_priority(&order), 5);
        order.priority = Some(9.0);
        assert_eq!(OrderValidator::assign_priority(&order), 9);
        order.priority = Some(42.0);
        assert_eq!(OrderValidator::assign_priority(&order), 10);
        order.priority = Some(-3.0);
        assert_eq!(OrderValidator::assign_priority(&order), 0);
    }

    #[test]
    fn test_sandbox_disabled_passes_everything() {
        let mut safety = SafetyConfig::default();
        safety.sandbox_enabled = false;
        let validator = OrderValidator::new(&safety);
        let mut fixture = Fixture::new();
        let verdict = validator.validate(
            move_order("GRP_GHOST", [99_999.0, 99_999.0, 0.0]),
            &mut fixture.ctx(),
        );
        assert!(verdict.is_validated());
    }
}
