//! Test fixtures and helpers.
//!
//! Pre-built units, managers and battle setups for consistent testing.

use std::sync::Arc;
use std::time::Duration;

use war_core::battle::BattleConfig;
use war_core::config::{DispatcherConfig, ResourceConfig, UnitConfig};
use war_core::dispatch::UnitManager;
use war_core::error::Result;
use war_core::lifecycle::CancelToken;
use war_core::math::{Position, Rect};
use war_core::resources::{ResourceAmounts, ResourceManager};
use war_core::unit::Unit;
use war_core::unit_kind::UnitKind;

/// Generous bound for shutdowns in tests.
pub const SHUTDOWN: Duration = Duration::from_secs(5);

/// Install a test-friendly tracing subscriber. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// A unit with default settings and no running loop.
#[must_use]
pub fn unit(id: &str, kind: UnitKind, x: f64, y: f64) -> Arc<Unit> {
    Unit::new(id, kind, Position::new(x, y), &UnitConfig::default(), &CancelToken::new())
}

/// `count` unstarted units in a row along x, one unit apart, named
/// `{prefix}-{n}`.
#[must_use]
pub fn squad(prefix: &str, kind: UnitKind, count: usize, origin: Position) -> Vec<Arc<Unit>> {
    (0..count)
        .map(|n| {
            unit(
                &format!("{prefix}-{n}"),
                kind,
                origin.x + n as f64,
                origin.y,
            )
        })
        .collect()
}

/// Resource amounts from literal pairs.
#[must_use]
pub fn amounts(pairs: &[(&str, i64)]) -> ResourceAmounts {
    pairs.iter().map(|(k, v)| ((*k).to_owned(), *v)).collect()
}

/// Unit manager with `workers` workers and otherwise default settings.
#[must_use]
pub fn unit_manager(workers: usize, root: &CancelToken) -> UnitManager {
    let config = DispatcherConfig {
        workers,
        ..DispatcherConfig::default()
    };
    UnitManager::new(config, UnitConfig::default(), root)
}

/// Resource manager seeded with `initial`.
pub fn resource_manager(initial: &[(&str, i64)], root: &CancelToken) -> Result<ResourceManager> {
    ResourceManager::new(
        ResourceConfig::default(),
        root,
        initial.iter().map(|(k, v)| ((*k).to_owned(), *v)),
    )
}

/// One marine against one zergling, six units apart.
#[must_use]
pub fn marine_vs_zergling(id: &str) -> BattleConfig {
    BattleConfig::attackers_vs_defenders(
        vec![unit(&format!("{id}-marine"), UnitKind::Marine, 0.0, 0.0)],
        vec![unit(&format!("{id}-zergling"), UnitKind::Zergling, 6.0, 0.0)],
        Rect::sized(20.0, 20.0),
    )
    .with_id(id)
}

/// Two squads of `size` facing each other across a 40x20 field.
#[must_use]
pub fn squad_battle(id: &str, attackers: UnitKind, defenders: UnitKind, size: usize) -> BattleConfig {
    BattleConfig::attackers_vs_defenders(
        squad(&format!("{id}-a"), attackers, size, Position::new(2.0, 10.0)),
        squad(&format!("{id}-d"), defenders, size, Position::new(30.0, 10.0)),
        Rect::sized(40.0, 20.0),
    )
    .with_id(id)
}
