//! Unit classification and behaviour state enums.
//!
//! - [`UnitKind`]: immutable classification that selects base stats
//! - [`UnitState`]: behaviour state machine, `Dead` is terminal
//! - [`ElevationLayer`]: which layer a unit occupies

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::WarError;

macro_rules! named_enum {
    (
        $(#[$meta:meta])*
        $name:ident { $( $(#[$vmeta:meta])* $variant:ident ),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum $name {
            $( $(#[$vmeta])* $variant, )+
        }

        impl $name {
            /// Every variant, in declaration order.
            pub const ALL: &'static [Self] = &[ $( Self::$variant, )+ ];

            /// Human-readable name.
            #[must_use]
            pub const fn name(self) -> &'static str {
                match self {
                    $( Self::$variant => stringify!($variant), )+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.name())
            }
        }

        impl FromStr for $name {
            type Err = WarError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::ALL
                    .iter()
                    .copied()
                    .find(|v| v.name().eq_ignore_ascii_case(s))
                    .ok_or_else(|| WarError::InvalidArgument(format!(
                        "unknown {}: {s}", stringify!($name)
                    )))
            }
        }
    };
}

named_enum! {
    /// Unit type. Selects base stats from the stat table.
    UnitKind {
        /// Terran worker.
        Scv,
        /// Terran infantry.
        Marine,
        /// Terran flamethrower infantry.
        Firebat,
        /// Terran healer.
        Medic,
        /// Terran hover bike.
        Vulture,
        /// Terran artillery.
        SiegeTank,
        /// Terran walker.
        Goliath,
        /// Terran fighter.
        Wraith,
        /// Terran transport.
        DropShip,
        /// Terran anti-air frigate.
        Valkyrie,
        /// Terran detector.
        ScienceVessel,
        /// Terran capital ship.
        Battlecruiser,
        /// Zerg worker.
        Drone,
        /// Zerg supply.
        Overlord,
        /// Zerg melee swarm.
        Zergling,
        /// Zerg ranged.
        Hydralisk,
        /// Zerg burrowed ambusher.
        Lurker,
        /// Zerg flyer.
        Mutalisk,
        /// Zerg siege flyer.
        Guardian,
        /// Zerg anti-air flyer.
        Devourer,
        /// Zerg caster flyer.
        Queen,
        /// Zerg heavy melee.
        Ultralisk,
        /// Zerg caster.
        Defiler,
        /// Protoss worker.
        Probe,
        /// Protoss melee warrior.
        Zealot,
        /// Protoss ranged walker.
        Dragoon,
        /// Protoss caster.
        Templar,
        /// Protoss cloaked assassin.
        DarkTemplar,
        /// Protoss transport.
        Shuttle,
        /// Protoss siege crawler.
        Reaver,
        /// Protoss detector.
        Observer,
        /// Protoss anti-air.
        Corsair,
        /// Protoss capital ship.
        Carrier,
        /// Protoss support capital.
        Arbiter,
    }
}

named_enum! {
    /// Behaviour state. Transitions out of `Dead` are never allowed.
    UnitState {
        /// Waiting for orders.
        Idle,
        /// Moving to a destination.
        Moving,
        /// Engaging a target.
        Attacking,
        /// Guarding the current area.
        Defending,
        /// Holding position, target kept.
        HoldingPosition,
        /// Patrolling.
        Patrolling,
        /// Repairing.
        Repairing,
        /// Constructing.
        Building,
        /// Terminal.
        Dead,
    }
}

named_enum! {
    /// Which layer a unit occupies.
    ElevationLayer {
        /// On the ground.
        Ground,
        /// Flying.
        Air,
        /// Burrowed below ground.
        Burrowed,
    }
}

impl Default for UnitState {
    fn default() -> Self {
        Self::Idle
    }
}

impl Default for ElevationLayer {
    fn default() -> Self {
        Self::Ground
    }
}

impl UnitState {
    /// Whether the state is terminal.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Dead)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        for kind in UnitKind::ALL {
            assert_eq!(kind.to_string().parse::<UnitKind>().unwrap(), *kind);
        }
        assert_eq!(UnitKind::ALL.len(), 34);
        assert_eq!(UnitKind::Marine.to_string(), "Marine");
        assert_eq!("zergling".parse::<UnitKind>().unwrap(), UnitKind::Zergling);
        assert!("Ghost".parse::<UnitKind>().is_err());
    }

    #[test]
    fn test_state_names() {
        assert_eq!(UnitState::HoldingPosition.to_string(), "HoldingPosition");
        assert_eq!(UnitState::default(), UnitState::Idle);
        assert!(UnitState::Dead.is_terminal());
        assert!(!UnitState::Idle.is_terminal());
    }

    #[test]
    fn test_elevation_names() {
        assert_eq!(ElevationLayer::Ground.to_string(), "Ground");
        assert_eq!(ElevationLayer::Burrowed.to_string(), "Burrowed");
        assert_eq!(ElevationLayer::ALL.len(), 3);
    }
}
