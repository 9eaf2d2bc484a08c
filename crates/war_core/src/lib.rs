//! # War Core
//!
//! Concurrent building blocks for a real-time strategy simulation.
//!
//! Every long-lived thing runs as its own tokio task and is reached only
//! through bounded channels:
//! - units are actors with a command inbox and an event outbox
//! - the resource ledger is owned by a single transaction processor
//! - the unit manager fans commands out to a fixed worker pool
//! - the battle simulator ticks battles and pipes their events to observers
//!
//! Shutdown flows through one hierarchical [`lifecycle::CancelToken`].
//! Every component's `shutdown` is idempotent and bounded by a timeout.
//!
//! ## Crate Structure
//!
//! - [`unit`] - unit actors and their commands and events
//! - [`resources`] - transactional ledger, reservations, generators
//! - [`dispatch`] - unit registry, broadcast, worker pool
//! - [`battle`] - battles, simulator, event pipeline
//! - [`replay`] - event log playback and analysis
//! - [`config`] - RON runtime configuration
//! - [`stats`] - per-kind base stat table

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

pub mod battle;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod lifecycle;
pub mod math;
pub mod replay;
pub mod resources;
pub mod stats;
pub mod unit;
pub mod unit_kind;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::battle::{
        BattleConfig, BattleEvent, BattleEventKind, BattleResult, BattleSimulator, BattleState,
        BattleStatus, Environment, Objective, ObjectiveKind, SimulatorEvent, Terrain, Weather,
    };
    pub use crate::config::{
        BattleConfigDefaults, DispatcherConfig, ResourceConfig, UnitConfig, WarConfig,
    };
    pub use crate::dispatch::{BroadcastSpec, CommandResult, ManagerStats, UnitManager};
    pub use crate::error::{Result, WarError};
    pub use crate::lifecycle::{CancelToken, TaskTracker};
    pub use crate::math::{Position, Rect};
    pub use crate::replay::{analyze_battle, BattleAnalysis, BattleReplayer};
    pub use crate::resources::{
        ResourceAmounts, ResourceGenerator, ResourceManager, TransactionResult,
    };
    pub use crate::unit::{Command, CommandKind, Unit, UnitEvent, UnitEventKind, UnitRuntime};
    pub use crate::unit_kind::{ElevationLayer, UnitKind, UnitState};
}
