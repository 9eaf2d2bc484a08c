//! Process-wide unit stat table.
//!
//! The table ships embedded in the crate (`data/unit_stats.ron`) and is parsed
//! once on first use. A stat-loading collaborator may install its own table
//! before any unit is created; after that the table is read-only.
//!
//! # Example RON
//!
//! ```ron
//! {
//!     Marine: (max_health: 40, base_damage: 6, base_armor: 0,
//!              attack_range: 4.0, vision_range: 7.0, elevation: Ground, speed: 1.9),
//! }
//! ```

use std::collections::HashMap;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::error::{Result, WarError};
use crate::unit_kind::{ElevationLayer, UnitKind};

const EMBEDDED_TABLE: &str = include_str!("../data/unit_stats.ron");

static STAT_TABLE: OnceCell<StatTable> = OnceCell::new();

/// Base stats for one unit kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitStats {
    /// Maximum (and starting) health.
    pub max_health: u32,
    /// Damage before upgrades.
    pub base_damage: u32,
    /// Armor before upgrades.
    pub base_armor: u32,
    /// Damage gained per attack upgrade.
    #[serde(default = "default_modifier")]
    pub attack_modifier: u32,
    /// Armor gained per armor upgrade.
    #[serde(default = "default_modifier")]
    pub armor_modifier: u32,
    /// Weapon range.
    pub attack_range: f64,
    /// Sight radius.
    pub vision_range: f64,
    /// Layer the unit occupies.
    #[serde(default)]
    pub elevation: ElevationLayer,
    /// Movement speed per simulated second.
    #[serde(default = "default_speed")]
    pub speed: f64,
}

const fn default_modifier() -> u32 {
    1
}

const fn default_speed() -> f64 {
    2.0
}

impl UnitStats {
    /// Conservative stats used when a kind has no table entry.
    #[must_use]
    pub const fn fallback() -> Self {
        Self {
            max_health: 50,
            base_damage: 5,
            base_armor: 0,
            attack_modifier: 1,
            armor_modifier: 1,
            attack_range: 1.0,
            vision_range: 5.0,
            elevation: ElevationLayer::Ground,
            speed: 2.0,
        }
    }
}

/// Lookup from unit kind to base stats.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatTable {
    entries: HashMap<UnitKind, UnitStats>,
}

impl StatTable {
    /// Parse a table from RON.
    pub fn from_ron_str(ron_str: &str) -> Result<Self> {
        ron::from_str(ron_str).map_err(|e| WarError::DataParse {
            source_name: "unit stats".into(),
            message: e.to_string(),
        })
    }

    /// The table compiled into the crate.
    pub fn embedded() -> Result<Self> {
        Self::from_ron_str(EMBEDDED_TABLE)
    }

    /// Build a table from explicit entries.
    #[must_use]
    pub fn from_entries(entries: impl IntoIterator<Item = (UnitKind, UnitStats)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    /// Stats for `kind`, if present.
    #[must_use]
    pub fn get(&self, kind: UnitKind) -> Option<&UnitStats> {
        self.entries.get(&kind)
    }

    /// Stats for `kind`, substituting [`UnitStats::fallback`] when missing.
    #[must_use]
    pub fn stats_for(&self, kind: UnitKind) -> UnitStats {
        if let Some(stats) = self.entries.get(&kind) {
            return stats.clone();
        }
        tracing::warn!(kind = %kind, "no stat entry, using fallback stats");
        UnitStats::fallback()
    }

    /// Number of kinds with an entry.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Install a custom stat table.
///
/// Must run before the first unit is created. Fails with
/// [`WarError::InvalidState`] once a table (custom or embedded) is in use.
pub fn install_stat_table(table: StatTable) -> Result<()> {
    STAT_TABLE
        .set(table)
        .map_err(|_| WarError::InvalidState("stat table already initialized".into()))
}

/// The process-wide stat table.
///
/// # Panics
///
/// Panics if the embedded table fails to parse. That asset is part of the
/// build, so a failure here is a startup error rather than a runtime one.
pub fn stat_table() -> &'static StatTable {
    STAT_TABLE.get_or_init(|| match StatTable::embedded() {
        Ok(table) => table,
        Err(e) => panic!("embedded unit stat table is invalid: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_table_covers_every_kind() {
        let table = StatTable::embedded().unwrap();
        for kind in UnitKind::ALL {
            assert!(table.get(*kind).is_some(), "missing stats for {kind}");
        }
        assert_eq!(table.len(), UnitKind::ALL.len());
    }

    #[test]
    fn test_reference_stats() {
        let table = StatTable::embedded().unwrap();
        let marine = table.get(UnitKind::Marine).unwrap();
        assert_eq!((marine.max_health, marine.base_damage), (40, 6));
        assert_eq!(marine.attack_modifier, 1);

        assert_eq!(table.get(UnitKind::Zergling).unwrap().base_armor, 0);
        assert_eq!(table.get(UnitKind::Zealot).unwrap().base_armor, 1);
        assert_eq!(table.get(UnitKind::Probe).unwrap().base_damage, 5);
        assert_eq!(table.get(UnitKind::Battlecruiser).unwrap().base_armor, 3);
        assert_eq!(
            table.get(UnitKind::Lurker).unwrap().elevation,
            ElevationLayer::Burrowed
        );
    }

    #[test]
    fn test_missing_kind_falls_back() {
        let table = StatTable::from_entries([(UnitKind::Marine, UnitStats::fallback())]);
        assert_eq!(table.stats_for(UnitKind::Carrier), UnitStats::fallback());
    }

    #[test]
    fn test_modifiers_default_to_one() {
        let table = StatTable::from_ron_str(
            "{ Probe: (max_health: 1, base_damage: 2, base_armor: 3, attack_range: 1.0, vision_range: 1.0) }",
        )
        .unwrap();
        let probe = table.get(UnitKind::Probe).unwrap();
        assert_eq!(probe.armor_modifier, 1);
        assert_eq!(probe.elevation, ElevationLayer::Ground);
    }

    #[test]
    fn test_bad_ron_is_parse_error() {
        let err = StatTable::from_ron_str("{ Ghost: () }").unwrap_err();
        assert!(matches!(err, WarError::DataParse { .. }));
    }
}
