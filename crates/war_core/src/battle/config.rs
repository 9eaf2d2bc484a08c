//! Battle setup: sides, objectives, environment and rules.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::math::Rect;
use crate::unit::Unit;
use crate::unit_kind::ElevationLayer;

/// Name of the attacking side created by [`BattleConfig::attackers_vs_defenders`].
pub const ATTACKERS: &str = "attackers";
/// Name of the defending side created by [`BattleConfig::attackers_vs_defenders`].
pub const DEFENDERS: &str = "defenders";

/// Win condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ObjectiveKind {
    /// Be the last faction with living units.
    EliminateAll,
    /// Keep at least one unit alive for `duration`.
    SurviveTime {
        /// How long to survive.
        duration: Duration,
    },
    /// Occupy `area` uncontested for `duration` in total.
    HoldPosition {
        /// Area to hold.
        area: Rect,
        /// Continuous holding time required.
        duration: Duration,
    },
    /// Be the only faction with living units inside `area`.
    CaptureArea {
        /// Area to capture.
        area: Rect,
    },
    /// Kill a specific unit.
    DestroyTarget {
        /// Unit to destroy.
        unit_id: String,
    },
    /// Bring a specific unit alive into `destination`.
    EscortUnit {
        /// Unit to escort.
        unit_id: String,
        /// Where it has to go.
        destination: Rect,
    },
}

impl ObjectiveKind {
    /// Short name for logs and events.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::EliminateAll => "EliminateAll",
            Self::SurviveTime { .. } => "SurviveTime",
            Self::HoldPosition { .. } => "HoldPosition",
            Self::CaptureArea { .. } => "CaptureArea",
            Self::DestroyTarget { .. } => "DestroyTarget",
            Self::EscortUnit { .. } => "EscortUnit",
        }
    }

    /// Whether the objective only makes sense for a named faction.
    #[must_use]
    pub const fn needs_faction(&self) -> bool {
        matches!(self, Self::SurviveTime { .. } | Self::HoldPosition { .. })
    }
}

/// A win condition with its scoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Objective {
    /// What has to happen.
    pub kind: ObjectiveKind,
    /// Faction the objective belongs to. `None` means any faction.
    pub faction: Option<String>,
    /// Points awarded on completion.
    pub points: u32,
    /// Fails if still unresolved after this much battle time.
    pub time_limit: Option<Duration>,
    /// Free-form description.
    pub description: String,
}

impl Objective {
    /// Objective open to every faction, worth one point.
    #[must_use]
    pub fn new(kind: ObjectiveKind) -> Self {
        let description = kind.name().to_owned();
        Self {
            kind,
            faction: None,
            points: 1,
            time_limit: None,
            description,
        }
    }

    /// Assign the objective to one faction.
    #[must_use]
    pub fn for_faction(mut self, faction: impl Into<String>) -> Self {
        self.faction = Some(faction.into());
        self
    }

    /// Set the points awarded.
    #[must_use]
    pub fn worth(mut self, points: u32) -> Self {
        self.points = points;
        self
    }

    /// Fail the objective after `limit` of battle time.
    #[must_use]
    pub fn within(mut self, limit: Duration) -> Self {
        self.time_limit = Some(limit);
        self
    }
}

/// Weather over the battlefield.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Weather {
    /// No effect.
    #[default]
    Clear,
    /// Shortens engagement range.
    Fog,
    /// Slows movement a little.
    Rain,
    /// Slows movement and shortens range.
    Storm,
    /// Slows movement.
    Snow,
}

impl Weather {
    fn speed_factor(self) -> f64 {
        match self {
            Self::Clear | Self::Fog => 1.0,
            Self::Rain => 0.9,
            Self::Storm => 0.75,
            Self::Snow => 0.8,
        }
    }

    fn range_factor(self) -> f64 {
        match self {
            Self::Fog => 0.75,
            Self::Storm => 0.9,
            _ => 1.0,
        }
    }
}

/// Ground the battle is fought on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Terrain {
    /// No effect.
    #[default]
    Open,
    /// Slower.
    Urban,
    /// Slower still.
    Forest,
    /// Slowest.
    Mountain,
    /// Slightly slower.
    Desert,
}

impl Terrain {
    fn speed_factor(self) -> f64 {
        match self {
            Self::Open => 1.0,
            Self::Urban => 0.8,
            Self::Forest => 0.7,
            Self::Mountain => 0.5,
            Self::Desert => 0.9,
        }
    }
}

/// Kind of environmental hazard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HazardKind {
    /// Shelling; ground units only.
    Artillery,
    /// Gas; ground and burrowed units.
    Poison,
    /// Flames; ground units only.
    Fire,
    /// Pulse; everything in the area.
    Emp,
}

impl HazardKind {
    /// Whether units on `layer` are hit.
    #[must_use]
    pub const fn affects(self, layer: ElevationLayer) -> bool {
        match self {
            Self::Artillery | Self::Fire => matches!(layer, ElevationLayer::Ground),
            Self::Poison => matches!(layer, ElevationLayer::Ground | ElevationLayer::Burrowed),
            Self::Emp => true,
        }
    }
}

impl fmt::Display for HazardKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Periodic area damage. Ignores armor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hazard {
    /// Kind.
    pub kind: HazardKind,
    /// Affected area.
    pub area: Rect,
    /// Damage per pulse.
    pub damage: u32,
    /// Time between pulses.
    pub interval: Duration,
}

/// Battle environment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    /// Weather.
    pub weather: Weather,
    /// Terrain.
    pub terrain: Terrain,
    /// Hazards.
    pub hazards: Vec<Hazard>,
}

impl Environment {
    /// Multiplier applied to unit speed.
    #[must_use]
    pub fn speed_factor(&self) -> f64 {
        self.weather.speed_factor() * self.terrain.speed_factor()
    }

    /// Multiplier applied to attack range.
    #[must_use]
    pub fn range_factor(&self) -> f64 {
        self.weather.range_factor()
    }
}

/// Per-battle rules.
/// Upper bound on [`BattleRules::time_scale`].
pub const MAX_TIME_SCALE: f64 = 1000.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BattleRules {
    /// Whether ordered attacks on allies are allowed.
    pub friendly_fire: bool,
    /// Whether units may join once the battle is active.
    pub reinforcements: bool,
    /// Battle time per simulated second, in `(0, MAX_TIME_SCALE]`.
    pub time_scale: f64,
    /// Pause the battle when an objective completes and the battle goes on.
    pub pause_on_objective: bool,
    /// Minimum battle time between two attacks of the same unit.
    pub attack_interval: Duration,
}

impl Default for BattleRules {
    fn default() -> Self {
        Self {
            friendly_fire: false,
            reinforcements: true,
            time_scale: 1.0,
            pause_on_objective: false,
            attack_interval: Duration::from_secs(1),
        }
    }
}

/// Everything needed to create a battle.
#[derive(Clone)]
pub struct BattleConfig {
    /// Caller-supplied id; generated when `None`.
    pub id: Option<String>,
    /// Units per faction.
    pub factions: BTreeMap<String, Vec<Arc<Unit>>>,
    /// Battle area. Units are kept inside it.
    pub battlefield: Rect,
    /// Win conditions. Empty means [`ObjectiveKind::EliminateAll`].
    pub objectives: Vec<Objective>,
    /// Maximum battle time.
    pub time_limit: Option<Duration>,
    /// Weather, terrain, hazards.
    pub environment: Environment,
    /// Rules.
    pub rules: BattleRules,
}

impl fmt::Debug for BattleConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sides: BTreeMap<_, _> = self.factions.iter().map(|(k, v)| (k, v.len())).collect();
        f.debug_struct("BattleConfig")
            .field("id", &self.id)
            .field("factions", &sides)
            .field("battlefield", &self.battlefield)
            .field("objectives", &self.objectives.len())
            .field("time_limit", &self.time_limit)
            .finish_non_exhaustive()
    }
}

impl BattleConfig {
    /// Empty battle on `battlefield`.
    #[must_use]
    pub fn new(battlefield: Rect) -> Self {
        Self {
            id: None,
            factions: BTreeMap::new(),
            battlefield,
            objectives: Vec::new(),
            time_limit: None,
            environment: Environment::default(),
            rules: BattleRules::default(),
        }
    }

    /// Two-sided battle.
    #[must_use]
    pub fn attackers_vs_defenders(
        attackers: Vec<Arc<Unit>>,
        defenders: Vec<Arc<Unit>>,
        battlefield: Rect,
    ) -> Self {
        Self::new(battlefield)
            .with_faction(ATTACKERS, attackers)
            .with_faction(DEFENDERS, defenders)
    }

    /// Use a fixed id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Add (or replace) a faction.
    #[must_use]
    pub fn with_faction(mut self, name: impl Into<String>, units: Vec<Arc<Unit>>) -> Self {
        self.factions.insert(name.into(), units);
        self
    }

    /// Add an objective.
    #[must_use]
    pub fn with_objective(mut self, objective: Objective) -> Self {
        self.objectives.push(objective);
        self
    }

    /// Set the time limit.
    #[must_use]
    pub fn with_time_limit(mut self, limit: Duration) -> Self {
        self.time_limit = Some(limit);
        self
    }

    /// Set the environment.
    #[must_use]
    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    /// Set the rules.
    #[must_use]
    pub fn with_rules(mut self, rules: BattleRules) -> Self {
        self.rules = rules;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hazard_layers() {
        assert!(HazardKind::Artillery.affects(ElevationLayer::Ground));
        assert!(!HazardKind::Artillery.affects(ElevationLayer::Air));
        assert!(HazardKind::Poison.affects(ElevationLayer::Burrowed));
        assert!(!HazardKind::Fire.affects(ElevationLayer::Burrowed));
        assert!(HazardKind::Emp.affects(ElevationLayer::Air));
    }

    #[test]
    fn test_environment_factors() {
        let env = Environment {
            weather: Weather::Storm,
            terrain: Terrain::Mountain,
            hazards: Vec::new(),
        };
        assert!((env.speed_factor() - 0.375).abs() < 1e-9);
        assert!((env.range_factor() - 0.9).abs() < 1e-9);
        assert!((Environment::default().speed_factor() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_rules_from_partial_ron() {
        let rules: BattleRules = ron::from_str("(friendly_fire: true)").unwrap();
        assert!(rules.friendly_fire);
        assert!(rules.reinforcements);
        assert_eq!(rules.attack_interval, Duration::from_secs(1));
    }
}
