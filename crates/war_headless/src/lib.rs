//! Headless scenario runner.
//!
//! Wires the simulation components together the way a game process would:
//! one root cancellation token, components started leaves first, a scenario
//! driven against them, and an ordered shutdown (battle simulator, then
//! unit manager, then resource manager).
//!
//! The outcome is printed as a JSON summary on stdout; logs go to stderr.
//!
//! # Example
//!
//! ```bash
//! # Small skirmish
//! cargo run -p war_headless -- run --scenario basic-combat
//!
//! # Hammer the dispatcher with 500 units for 20 seconds
//! cargo run -p war_headless -- run --scenario stress-test --units 500 --duration-secs 20
//!
//! # Override component settings
//! cargo run -p war_headless -- run --scenario resource-management --config scenarios/fast.ron
//! ```

pub mod config;
pub mod runner;
pub mod scenario;

pub use config::{load_config, ConfigError};
pub use runner::{run_scenario, BattleSummary, Components, RunSummary};
pub use scenario::{ScenarioError, ScenarioKind, ScenarioOptions};
