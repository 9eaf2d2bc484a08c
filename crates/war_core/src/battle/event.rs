//! Battle events.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::config::{HazardKind, Terrain, Weather};
use crate::math::Position;
use crate::unit_kind::UnitKind;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BattleEventKind {
    /// A unit moved during the tick.
    UnitMoved,
    /// A unit fired at a target.
    UnitAttacked,
    /// A unit lost health.
    UnitTookDamage,
    /// A unit died.
    UnitDestroyed,
    /// A battle was created.
    BattleStarted,
    /// A battle was paused.
    BattlePaused,
    /// A battle was resumed.
    BattleResumed,
    /// A battle reached Completed or Cancelled.
    BattleEnded,
    /// Units joined a battle.
    ReinforcementsArrived,
    /// An objective was completed.
    ObjectiveCaptured,
    /// A faction has no living units left.
    FactionEliminated,
    /// A hazard pulsed.
    HazardTriggered,
    /// Weather changed.
    WeatherChanged,
    /// Terrain changed.
    TerrainChanged,
    /// Injected from outside.
    Custom,
}

impl BattleEventKind {
    /// Priority used unless the event overrides it. Higher is processed
    /// first within a batch.
    #[must_use]
    pub const fn default_priority(self) -> i32 {
        match self {
            Self::BattleEnded => 100,
            Self::BattleStarted => 90,
            Self::UnitDestroyed => 80,
            Self::FactionEliminated => 75,
            Self::ObjectiveCaptured => 70,
            Self::ReinforcementsArrived => 60,
            Self::BattlePaused | Self::BattleResumed => 55,
            Self::UnitTookDamage => 50,
            Self::HazardTriggered => 45,
            Self::UnitAttacked => 40,
            Self::WeatherChanged | Self::TerrainChanged => 20,
            Self::UnitMoved => 10,
            Self::Custom => 0,
        }
    }
}

/// Event-specific payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum BattleEventData {
    /// Nothing extra.
    #[default]
    None,
    /// Movement.
    Movement {
        /// Before.
        from: Position,
        /// After.
        to: Position,
    },
    /// An attack and its damage.
    Attack {
        /// Damage after armor.
        damage: u32,
    },
    /// Damage taken.
    Damage {
        /// Amount.
        amount: u32,
        /// Health left.
        remaining: u32,
    },
    /// A death.
    Destroyed {
        /// Faction of the dead unit.
        faction: String,
        /// Its kind.
        kind: UnitKind,
    },
    /// Faction involved.
    Faction {
        /// Faction name.
        faction: String,
        /// Units involved.
        units: usize,
    },
    /// Objective completed.
    Objective {
        /// Index in the battle's objective list.
        index: usize,
        /// Who completed it.
        faction: String,
        /// Points awarded.
        points: u32,
    },
    /// Hazard pulse.
    Hazard {
        /// Hazard kind.
        kind: HazardKind,
        /// Units hit.
        affected: usize,
    },
    /// Weather change.
    Weather(Weather),
    /// Terrain change.
    Terrain(Terrain),
    /// End of a battle.
    Ended {
        /// Winning faction, if any.
        winner: Option<String>,
        /// Why the battle ended.
        reason: String,
    },
    /// Free text.
    Text(String),
}

/// Immutable record of something that happened in a battle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BattleEvent {
    /// Sequence number, assigned when the event enters the queue.
    pub seq: u64,
    /// Kind.
    pub kind: BattleEventKind,
    /// Battle it belongs to.
    pub battle_id: String,
    /// Simulation time.
    pub timestamp: Duration,
    /// Units involved; the acting unit first.
    pub actors: Vec<String>,
    /// Payload.
    pub data: BattleEventData,
    /// Processing priority, higher first.
    pub priority: i32,
}

impl BattleEvent {
    /// Event with the kind's default priority and no actors.
    #[must_use]
    pub fn new(kind: BattleEventKind, battle_id: impl Into<String>, timestamp: Duration) -> Self {
        Self {
            seq: 0,
            kind,
            battle_id: battle_id.into(),
            timestamp,
            actors: Vec::new(),
            data: BattleEventData::None,
            priority: kind.default_priority(),
        }
    }

    /// Set the actors.
    #[must_use]
    pub fn with_actors<I, S>(mut self, actors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.actors = actors.into_iter().map(Into::into).collect();
        self
    }

    /// Set the payload.
    #[must_use]
    pub fn with_data(mut self, data: BattleEventData) -> Self {
        self.data = data;
        self
    }

    /// Override the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let event = BattleEvent::new(BattleEventKind::UnitDestroyed, "b1", Duration::from_secs(3))
            .with_actors(["z1", "m1"]);
        assert_eq!(event.priority, 80);
        assert_eq!(event.actors, ["z1", "m1"]);
        assert_eq!(event.data, BattleEventData::None);
        assert_eq!(event.seq, 0);
    }

    #[test]
    fn test_end_outranks_movement() {
        assert!(
            BattleEventKind::BattleEnded.default_priority()
                > BattleEventKind::UnitMoved.default_priority()
        );
    }
}
