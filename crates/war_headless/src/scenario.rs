//! Built-in scenarios.
//!
//! Each scenario drives already-started components until its duration runs
//! out or the root token is cancelled, and reports which battles it ran plus
//! free-form notes. The runner turns that into a [`crate::RunSummary`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use war_core::battle::{BattleConfig, BattleResult};
use war_core::dispatch::BroadcastSpec;
use war_core::error::WarError;
use war_core::math::{Position, Rect};
use war_core::resources::{ResourceAmounts, ResourceEventKind, ResourceGenerator};
use war_core::unit::{Command, Unit};
use war_core::unit_kind::UnitKind;

use crate::config::ConfigError;
use crate::runner::Components;

/// Error type for scenario runs.
#[derive(Error, Debug)]
pub enum ScenarioError {
    /// Config could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// A component rejected an operation.
    #[error("Component error: {0}")]
    Component(#[from] WarError),
    /// A component did not stop in time.
    #[error("Shutdown failed: {0}")]
    Shutdown(WarError),
}

/// Which scenario to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ScenarioKind {
    /// A dispatched marine squad against a zergling pack.
    BasicCombat,
    /// Workers competing for minerals and gas through reservations.
    ResourceManagement,
    /// Many units flooded with commands while several battles run.
    StressTest,
}

impl ScenarioKind {
    /// Unit count used when none is given.
    #[must_use]
    pub const fn default_units(self) -> usize {
        match self {
            Self::BasicCombat => 5,
            Self::ResourceManagement => 4,
            Self::StressTest => 100,
        }
    }

    /// Resources the ledger starts with.
    #[must_use]
    pub fn initial_resources(self) -> Vec<(String, i64)> {
        match self {
            Self::BasicCombat => Vec::new(),
            Self::ResourceManagement => vec![("minerals".into(), 400), ("gas".into(), 200)],
            Self::StressTest => vec![("minerals".into(), 10_000)],
        }
    }
}

/// Run parameters.
#[derive(Debug, Clone)]
pub struct ScenarioOptions {
    /// How long the scenario drives the components.
    pub duration: Duration,
    /// Unit count; `None` uses the scenario default.
    pub units: Option<usize>,
    /// Per-component shutdown budget.
    pub shutdown_timeout: Duration,
}

impl Default for ScenarioOptions {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(10),
            units: None,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl ScenarioOptions {
    /// Unit count for `kind`, at least one.
    #[must_use]
    pub fn units_for(&self, kind: ScenarioKind) -> usize {
        self.units.unwrap_or_else(|| kind.default_units()).max(1)
    }
}

/// What a scenario did.
#[derive(Debug, Default)]
pub(crate) struct ScenarioReport {
    pub battles: Vec<String>,
    pub notes: Vec<String>,
}

pub(crate) async fn drive(
    kind: ScenarioKind,
    components: &Components,
    options: &ScenarioOptions,
) -> Result<ScenarioReport, ScenarioError> {
    let deadline = Instant::now() + options.duration;
    let units = options.units_for(kind);
    tracing::info!(scenario = ?kind, units, duration = ?options.duration, "scenario starting");
    let report = match kind {
        ScenarioKind::BasicCombat => basic_combat(components, units, deadline).await?,
        ScenarioKind::ResourceManagement => {
            resource_management(components, units, deadline).await?
        }
        ScenarioKind::StressTest => stress_test(components, units, options.duration, deadline).await?,
    };
    tracing::info!(scenario = ?kind, battles = report.battles.len(), "scenario finished");
    Ok(report)
}

fn results_channel(components: &Components) -> Result<mpsc::Receiver<BattleResult>, WarError> {
    components
        .simulator
        .results()
        .ok_or_else(|| WarError::InvalidState("battle results already taken".into()))
}

/// Wait for `ids` to produce results; end whatever is still running at the
/// deadline or on cancellation. Returns how many finished on their own.
async fn await_battles(
    components: &Components,
    results: &mut mpsc::Receiver<BattleResult>,
    ids: &[String],
    deadline: Instant,
) -> usize {
    let mut pending: HashSet<&str> = ids.iter().map(String::as_str).collect();
    let mut finished = 0;
    while !pending.is_empty() {
        tokio::select! {
            biased;
            () = components.root().cancelled() => break,
            received = tokio::time::timeout_at(deadline, results.recv()) => match received {
                Ok(Some(result)) => {
                    if pending.remove(result.battle_id.as_str()) {
                        finished += 1;
                    }
                }
                Ok(None) | Err(_) => break,
            },
        }
    }
    for id in pending {
        if let Err(e) = components.simulator.end_battle(id, "scenario time limit") {
            tracing::debug!(battle_id = id, error = %e, "battle already over");
        }
    }
    finished
}

async fn basic_combat(
    components: &Components,
    size: usize,
    deadline: Instant,
) -> Result<ScenarioReport, ScenarioError> {
    let mut results = results_channel(components)?;
    let mut marines = Vec::with_capacity(size);
    let mut zerglings = Vec::with_capacity(size);
    for n in 0..size {
        let y = 2.0 + 2.0 * n as f64;
        marines.push(components.units.spawn_unit(
            format!("marine-{n}"),
            UnitKind::Marine,
            Position::new(2.0, y),
        )?);
        zerglings.push(components.units.spawn_unit(
            format!("zergling-{n}"),
            UnitKind::Zergling,
            Position::new(14.0, y),
        )?);
    }
    let held = components.units.broadcast_command(
        &BroadcastSpec::new(Command::hold()).filter(|u| u.kind() == UnitKind::Marine),
    )?;

    let height = (4.0 + 2.0 * size as f64).max(10.0);
    let id = components.simulator.create_battle(
        BattleConfig::attackers_vs_defenders(marines, zerglings, Rect::sized(20.0, height))
            .with_id("basic-combat"),
    )?;
    components.simulator.start_battle(&id)?;
    let finished = await_battles(components, &mut results, std::slice::from_ref(&id), deadline).await;

    Ok(ScenarioReport {
        notes: vec![
            format!("{held} marines ordered to hold before engaging"),
            if finished == 1 {
                "battle resolved before the time limit".to_owned()
            } else {
                "battle ended by the time limit".to_owned()
            },
        ],
        battles: vec![id],
    })
}

#[derive(Debug, Default, Clone, Copy)]
struct WorkerTally {
    trained: u32,
    refused: u32,
}

async fn worker(components: &Components, id: String, cost: ResourceAmounts, deadline: Instant) -> WorkerTally {
    let mut tally = WorkerTally::default();
    let cancelled = || components.root().is_cancelled();
    while Instant::now() < deadline && !cancelled() {
        let reserved = components
            .resources
            .reserve_resources_with_ttl(&id, cost.clone(), Duration::from_secs(2), Duration::from_millis(500))
            .wait()
            .await;
        match reserved.reservation_id {
            Some(reservation) if reserved.success => {
                tokio::time::sleep(Duration::from_millis(300)).await;
                match components.resources.consume_reserved(reservation).await {
                    Ok(()) => tally.trained += 1,
                    Err(e) => {
                        tracing::debug!(worker = %id, error = %e, "reservation lost before training");
                        tally.refused += 1;
                    }
                }
            }
            _ => {
                tally.refused += 1;
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
        }
    }
    tally
}

async fn resource_management(
    components: &Components,
    workers: usize,
    deadline: Instant,
) -> Result<ScenarioReport, ScenarioError> {
    let resources = &components.resources;
    let mut events = resources.add_resource_listener();
    resources.set_low_threshold("minerals", 100).await?;
    resources.add_generator(ResourceGenerator::new("minerals", 40.0, 8)?)?;
    resources.add_generator(ResourceGenerator::new("gas", 10.0, 4)?)?;

    let ids: Vec<String> = (0..workers).map(|n| format!("scv-{n}")).collect();
    for (n, id) in ids.iter().enumerate() {
        components
            .units
            .spawn_unit(id.clone(), UnitKind::Scv, Position::new(n as f64, 0.0))?;
    }
    let cost: ResourceAmounts = [("minerals".to_owned(), 50), ("gas".to_owned(), 25)]
        .into_iter()
        .collect();
    let tallies = join_all(
        ids.iter()
            .map(|id| worker(components, id.clone(), cost.clone(), deadline)),
    )
    .await;
    resources.remove_generator("minerals")?;
    resources.remove_generator("gas")?;

    let trained: u32 = tallies.iter().map(|t| t.trained).sum();
    let refused: u32 = tallies.iter().map(|t| t.refused).sum();
    let mut low = 0;
    let mut depleted = 0;
    while let Ok(event) = events.try_recv() {
        match event.kind {
            ResourceEventKind::ThresholdReached => low += 1,
            ResourceEventKind::ResourceDepleted => depleted += 1,
            _ => {}
        }
    }
    tracing::info!(trained, refused, "workers finished");

    Ok(ScenarioReport {
        battles: Vec::new(),
        notes: vec![
            format!("{workers} workers trained {trained} units, {refused} reservations refused"),
            format!("{low} low-resource alerts, {depleted} depletions"),
        ],
    })
}

const STRESS_KINDS: [UnitKind; 4] = [
    UnitKind::Marine,
    UnitKind::Zergling,
    UnitKind::Zealot,
    UnitKind::Hydralisk,
];

async fn stress_test(
    components: &Components,
    count: usize,
    duration: Duration,
    deadline: Instant,
) -> Result<ScenarioReport, ScenarioError> {
    let mut results = results_channel(components)?;
    let side = (count as f64).sqrt().ceil().max(1.0);
    for n in 0..count {
        let kind = STRESS_KINDS[n % STRESS_KINDS.len()];
        let position = Position::new((n as f64 % side) * 2.0, (n as f64 / side).floor() * 2.0);
        components.units.spawn_unit(format!("unit-{n}"), kind, position)?;
    }

    let battles = (count / 20).clamp(1, 5);
    let mut ids = Vec::with_capacity(battles);
    for b in 0..battles {
        let squad = |kind: UnitKind, x: f64| -> Vec<Arc<Unit>> {
            (0..4_u8)
                .map(|n| {
                    Unit::new(
                        format!("skirmish-{b}-{kind}-{n}"),
                        kind,
                        Position::new(x, 2.0 + 2.0 * f64::from(n)),
                        &components.config().units,
                        components.root(),
                    )
                })
                .collect()
        };
        let id = components.simulator.create_battle(
            BattleConfig::attackers_vs_defenders(
                squad(UnitKind::Marine, 2.0),
                squad(UnitKind::Zergling, 16.0),
                Rect::sized(20.0, 12.0),
            )
            .with_id(format!("skirmish-{b}"))
            .with_time_limit(duration),
        )?;
        components.simulator.start_battle(&id)?;
        ids.push(id);
    }

    let mut round: u32 = 0;
    let mut queued = 0usize;
    let mut refused = 0usize;
    let mut acknowledged = 0usize;
    let mut ticker = tokio::time::interval(Duration::from_millis(100));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            biased;
            () = components.root().cancelled() => break,
            () = tokio::time::sleep_until(deadline) => break,
            _ = ticker.tick() => {}
        }
        let destination = Position::new(f64::from(round % 50), f64::from((round * 7) % 50));
        let spec = BroadcastSpec::new(Command::move_to(destination)).with_priority((round % 3) as i32);
        match components.units.broadcast_command(&spec) {
            Ok(n) => queued += n,
            Err(e) => {
                tracing::debug!(round, error = %e, "broadcast refused");
                refused += 1;
            }
        }
        let replies = (0..count).step_by(10).map(|n| {
            components
                .units
                .send_command(&format!("unit-{n}"), Command::hold(), 5)
        });
        for reply in join_all(replies).await {
            match reply {
                Ok(result) if result.success => acknowledged += 1,
                _ => refused += 1,
            }
        }
        round += 1;
    }

    let finished = await_battles(components, &mut results, &ids, deadline + Duration::from_secs(1)).await;
    tracing::info!(rounds = round, queued, acknowledged, refused, "command flood finished");

    Ok(ScenarioReport {
        battles: ids,
        notes: vec![
            format!("{round} broadcast rounds queued {queued} commands"),
            format!("{acknowledged} direct commands acknowledged, {refused} refused"),
            format!("{finished} of {battles} skirmishes resolved on their own"),
        ],
    })
}
