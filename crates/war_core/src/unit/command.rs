//! Commands a unit accepts and events it emits.

use std::fmt;
use std::sync::Arc;

use tokio::time::Instant;

use super::Unit;
use crate::math::Position;
use crate::unit_kind::UnitState;

/// Command verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    /// Move to a destination.
    Move,
    /// Attack a target unit.
    Attack,
    /// Stop and clear the target.
    Stop,
    /// Hold position, keeping the target.
    Hold,
    /// Patrol towards a destination.
    Patrol,
    /// Guard the current area.
    Defend,
}

/// An order for a single unit.
///
/// Attack targets are held strongly only while the command is in flight;
/// the unit itself stores a weak reference once it accepts the order.
#[derive(Clone)]
pub struct Command {
    /// Verb.
    pub kind: CommandKind,
    /// Target for `Attack`.
    pub target: Option<Arc<Unit>>,
    /// Destination for `Move` and `Patrol`.
    pub destination: Option<Position>,
}

impl Command {
    fn bare(kind: CommandKind) -> Self {
        Self {
            kind,
            target: None,
            destination: None,
        }
    }

    /// Move to `destination`.
    #[must_use]
    pub fn move_to(destination: Position) -> Self {
        Self {
            destination: Some(destination),
            ..Self::bare(CommandKind::Move)
        }
    }

    /// Attack `target`.
    #[must_use]
    pub fn attack(target: &Arc<Unit>) -> Self {
        Self {
            target: Some(Arc::clone(target)),
            ..Self::bare(CommandKind::Attack)
        }
    }

    /// Attack with no target. Units ignore it.
    #[must_use]
    pub fn attack_nothing() -> Self {
        Self::bare(CommandKind::Attack)
    }

    /// Stop.
    #[must_use]
    pub fn stop() -> Self {
        Self::bare(CommandKind::Stop)
    }

    /// Hold position.
    #[must_use]
    pub fn hold() -> Self {
        Self::bare(CommandKind::Hold)
    }

    /// Patrol towards `destination`.
    #[must_use]
    pub fn patrol(destination: Position) -> Self {
        Self {
            destination: Some(destination),
            ..Self::bare(CommandKind::Patrol)
        }
    }

    /// Defend the current area.
    #[must_use]
    pub fn defend() -> Self {
        Self::bare(CommandKind::Defend)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dest = self.destination.unwrap_or_default();
        match self.kind {
            CommandKind::Move => write!(f, "Move to {dest}"),
            CommandKind::Attack => match &self.target {
                Some(target) => write!(f, "Attack {}", target.id()),
                None => f.write_str("Attack none"),
            },
            CommandKind::Stop => f.write_str("Stop"),
            CommandKind::Hold => f.write_str("Hold Position"),
            CommandKind::Patrol => write!(f, "Patrol to {dest}"),
            CommandKind::Defend => f.write_str("Defend"),
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Command({self})")
    }
}

/// What a [`UnitEvent`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitEventKind {
    /// The unit lost health.
    Damaged,
    /// The unit landed a lethal hit.
    Killed,
    /// The unit's health reached zero.
    Died,
    /// The unit changed position.
    Moved,
    /// The unit stopped.
    Idle,
    /// The unit's behaviour state changed.
    StateChanged,
}

/// Typed event payload.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    /// No extra data.
    None,
    /// Damage taken or dealt.
    Damage {
        /// Damage amount.
        amount: u32,
        /// Health of the damaged unit afterwards.
        remaining: u32,
    },
    /// Position change.
    Moved {
        /// Previous position.
        from: Position,
        /// New position.
        to: Position,
    },
    /// State transition.
    StateChanged {
        /// Previous state.
        from: UnitState,
        /// New state.
        to: UnitState,
    },
}

/// Something that happened to (or was done by) a unit.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitEvent {
    /// Event kind.
    pub kind: UnitEventKind,
    /// Emitting unit.
    pub source: String,
    /// Other unit involved, if any.
    pub target: Option<String>,
    /// When the event was emitted.
    pub timestamp: Instant,
    /// Typed details.
    pub payload: EventPayload,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(
            Command::move_to(Position::new(50.5, 75.3)).to_string(),
            "Move to (50.5, 75.3)"
        );
        assert_eq!(Command::attack_nothing().to_string(), "Attack none");
        assert_eq!(Command::stop().to_string(), "Stop");
        assert_eq!(Command::hold().to_string(), "Hold Position");
        assert_eq!(
            Command::patrol(Position::new(1.0, 2.0)).to_string(),
            "Patrol to (1, 2)"
        );
        assert_eq!(Command::defend().to_string(), "Defend");
    }
}
