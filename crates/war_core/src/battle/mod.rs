//! Battle simulation.
//!
//! A [`Battle`] groups factions of units under a set of objectives and an
//! environment. The [`BattleSimulator`] advances every active battle on a
//! fixed tick and pushes what happened through an event pipeline:
//!
//! ```text
//! tick loop ──try_send──▶ event queue ──▶ filters ──▶ priority sort
//!                              ▲                          │
//!                              │ follow-ups               ▼
//!                              └─────────────── handlers ──▶ log ──▶ observers
//! ```
//!
//! Battle state is only ever mutated under the battle's own lock, and the
//! simulator never holds it while talking to anyone else.

mod config;
mod event;
mod processor;
mod simulator;
mod state;

pub use config::{
    BattleConfig, BattleRules, Environment, Hazard, HazardKind, Objective, ObjectiveKind, Terrain,
    Weather, ATTACKERS, DEFENDERS,
};
pub use event::{BattleEvent, BattleEventData, BattleEventKind};
pub use processor::{EventFilter, EventHandler, EventLogger, EventProcessor};
pub use simulator::{BattleSimulator, SimulatorEvent};
pub use state::{
    Battle, BattleResult, BattleState, BattleStatistics, BattleStatus, ObjectiveStatus,
    TacticalEvent, TacticalEventKind,
};
