//! Resource pool
//!
//! The admin-specified inventory the LLM may draw on to spawn groups,
//! partitioned by side and asset type with per-type caps. Reservations are
//! made by the sandbox at validation time so the in-flight count can never
//! exceed the cap.

use crate::config::AssetSpec;
use crate::model::world::Side;
use serde_json::{json, Value};
use std::collections::HashMap;

#[derive(Debug, Clone)]
struct AssetEntry {
    spec: AssetSpec,
    used: u32,
}

#[derive(Debug, Clone, Default)]
pub struct ResourcePool {
    assets: HashMap<Side, HashMap<String, AssetEntry>>,
}

impl ResourcePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &HashMap<Side, HashMap<String, AssetSpec>>) -> Self {
        let mut pool = Self::new();
        pool.replace(config.clone());
        pool
    }

    /// Replace the whole pool. Usage counters reset.
    pub fn replace(&mut self, config: HashMap<Side, HashMap<String, AssetSpec>>) {
        self.assets = config
            .into_iter()
            .map(|(side, assets)| {
                (
                    side,
                    assets
                        .into_iter()
                        .map(|(name, spec)| (name, AssetEntry { spec, used: 0 }))
                        .collect(),
                )
            })
            .collect();
    }

    pub fn add_asset(&mut self, side: Side, asset_type: &str, spec: AssetSpec) {
        self.assets
            .entry(side)
            .or_default()
            .insert(asset_type.to_string(), AssetEntry { spec, used: 0 });
    }

    pub fn remove_asset(&mut self, side: Side, asset_type: &str) -> bool {
        self.assets
            .get_mut(&side)
            .map(|assets| assets.remove(asset_type).is_some())
            .unwrap_or(false)
    }

    pub fn clear_side(&mut self, side: Side) -> bool {
        self.assets.remove(&side).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    pub fn template(&self, side: Side, asset_type: &str) -> Option<&AssetSpec> {
        self.assets
            .get(&side)
            .and_then(|assets| assets.get(asset_type))
            .map(|entry| &entry.spec)
    }

    pub fn remaining(&self, side: Side, asset_type: &str) -> Option<u32> {
        self.assets
            .get(&side)
            .and_then(|assets| assets.get(asset_type))
            .map(|entry| entry.spec.max.saturating_sub(entry.used))
    }

    /// Reserve one deployment slot. Only succeeds while remaining > 0; the
    /// counter is the in-flight ledger backing the pool invariant.
    pub fn reserve(&mut self, side: Side, asset_type: &str) -> bool {
        let Some(entry) = self
            .assets
            .get_mut(&side)
            .and_then(|assets| assets.get_mut(asset_type))
        else {
            return false;
        };
        if entry.used < entry.spec.max {
            entry.used += 1;
            true
        } else {
            false
        }
    }

    /// Give a slot back (spawn later failed host-side).
    pub fn release(&mut self, side: Side, asset_type: &str) {
        if let Some(entry) = self
            .assets
            .get_mut(&side)
            .and_then(|assets| assets.get_mut(asset_type))
        {
            entry.used = entry.used.saturating_sub(1);
        }
    }

    /// Status document for the LLM context and the admin surface.
    pub fn status_value(&self) -> Option<Value> {
        if self.assets.is_empty() {
            return None;
        }
        let mut by_side = serde_json::Map::new();
        for (side, assets) in &self.assets {
            let mut side_map = serde_json::Map::new();
            for (name, entry) in assets {
                side_map.insert(
                    name.clone(),
                    json!({
                        "max": entry.spec.max,
                        "used": entry.used,
                        "remaining": entry.spec.max.saturating_sub(entry.used),
                        "defense_only": entry.spec.defense_only,
                        "description": entry.spec.description,
                    }),
                );
            }
            by_side.insert(side.as_str().to_string(), Value::Object(side_map));
        }
        Some(json!({
            "description": "Deployable assets; check 'remaining' before a deploy_asset order",
            "by_side": by_side,
        }))
    }
}

fn spec(classnames: &[&str], max: u32, defense_only: bool, description: &str) -> AssetSpec {
    AssetSpec {
        classnames: classnames.iter().map(|s| s.to_string()).collect(),
        max,
        defense_only,
        description: description.to_string(),
    }
}

/// Built-in pool presets loadable by name from the admin surface.
pub fn builtin_template(name: &str) -> Option<HashMap<Side, HashMap<String, AssetSpec>>> {
    let east = |squads: u32, motor: u32, armor: u32| {
        let mut assets = HashMap::new();
        assets.insert(
            "infantry_squad".to_string(),
            spec(
                &["O_Soldier_TL_F", "O_Soldier_F", "O_Soldier_AR_F", "O_medic_F"],
                squads,
                false,
                "Rifle squad",
            ),
        );
        if motor > 0 {
            assets.insert(
                "motorized_patrol".to_string(),
                spec(
                    &["O_MRAP_02_hmg_F"],
                    motor,
                    false,
                    "Armed patrol vehicle with crew",
                ),
            );
        }
        if armor > 0 {
            assets.insert(
                "heavy_armor".to_string(),
                spec(&["O_MBT_02_cannon_F"], armor, true, "Main battle tank, AO defense only"),
            );
        }
        assets
    };

    let mut pool = HashMap::new();
    match name {
        "minimal" => {
            pool.insert(Side::East, east(2, 0, 0));
        }
        "standard" => {
            pool.insert(Side::East, east(4, 2, 0));
        }
        "heavy" => {
            pool.insert(Side::East, east(6, 3, 2));
        }
        _ => return None,
    }
    Some(pool)
}

pub fn template_names() -> Vec<(&'static str, &'static str)> {
    vec![
        ("minimal", "Two infantry squads, nothing else"),
        ("standard", "Infantry plus motorized patrols"),
        ("heavy", "Full pool including defense-only armor"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with(max: u32) -> ResourcePool {
        let mut pool = ResourcePool::new();
        pool.add_asset(
            Side::East,
            "infantry_squad",
            spec(&["A", "B", "C"], max, false, "test"),
        );
        pool
    }

    #[test]
    fn test_reserve_until_exhausted() {
        let mut pool = pool_with(2);
        assert!(pool.reserve(Side::East, "infantry_squad"));
        assert!(pool.reserve(Side::East, "infantry_squad"));
        assert!(!pool.reserve(Side::East, "infantry_squad"));
        assert_eq!(pool.remaining(Side::East, "infantry_squad"), Some(0));
    }

    #[test]
    fn test_zero_max_always_rejects() {
        let mut pool = pool_with(0);
        assert!(!pool.reserve(Side::East, "infantry_squad"));
    }

    #[test]
    fn test_release_restores_slot() {
        let mut pool = pool_with(1);
        assert!(pool.reserve(Side::East, "infantry_squad"));
        pool.release(Side::East, "infantry_squad");
        assert!(pool.reserve(Side::East, "infantry_squad"));
    }

    #[test]
    fn test_unknown_asset_rejects() {
        let mut pool = pool_with(5);
        assert!(!pool.reserve(Side::West, "infantry_squad"));
        assert!(!pool.reserve(Side::East, "attack_heli"));
        assert_eq!(pool.remaining(Side::East, "attack_heli"), None);
    }

    #[test]
    fn test_status_value_reports_remaining() {
        let mut pool = pool_with(3);
        pool.reserve(Side::East, "infantry_squad");
        let status = pool.status_value().unwrap();
        let entry = &status["by_side"]["EAST"]["infantry_squad"];
        assert_eq!(entry["max"], 3);
        assert_eq!(entry["used"], 1);
        assert_eq!(entry["remaining"], 2);
        assert!(ResourcePool::new().status_value().is_none());
    }

    #[test]
    fn test_builtin_templates() {
        assert!(builtin_template("minimal").is_some());
        assert!(builtin_template("heavy").is_some());
        assert!(builtin_template("nonexistent").is_none());
        let heavy = builtin_template("heavy").unwrap();
        let armor = &heavy[&Side::East]["heavy_armor"];
        assert!(armor.defense_only);
    }
}
