//! Component wiring and run summaries.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use war_core::battle::{BattleSimulator, BattleState};
use war_core::config::WarConfig;
use war_core::dispatch::UnitManager;
use war_core::error::{Result as WarResult, WarError};
use war_core::lifecycle::CancelToken;
use war_core::replay::analyze_battle;
use war_core::resources::{ResourceAmounts, ResourceManager};

use crate::scenario::{self, ScenarioError, ScenarioKind, ScenarioOptions, ScenarioReport};

/// Every long-lived component, started under one root token.
pub struct Components {
    root: CancelToken,
    config: WarConfig,
    /// Resource ledger.
    pub resources: ResourceManager,
    /// Unit registry and command dispatcher.
    pub units: UnitManager,
    /// Battle simulator.
    pub simulator: BattleSimulator,
}

impl Components {
    /// Start the components leaves first: resources, units, battles.
    pub fn start(
        config: WarConfig,
        root: &CancelToken,
        initial_resources: impl IntoIterator<Item = (String, i64)>,
    ) -> WarResult<Self> {
        let resources = ResourceManager::new(config.resources.clone(), root, initial_resources)?;
        let units = UnitManager::new(config.dispatcher.clone(), config.units.clone(), root);
        let simulator = BattleSimulator::new(config.battle.clone(), root);
        tracing::debug!("components started");
        Ok(Self {
            root: root.clone(),
            config,
            resources,
            units,
            simulator,
        })
    }

    /// Root cancellation token.
    #[must_use]
    pub fn root(&self) -> &CancelToken {
        &self.root
    }

    /// Effective configuration.
    #[must_use]
    pub fn config(&self) -> &WarConfig {
        &self.config
    }

    /// Stop the simulator, then the dispatcher, then the resource manager.
    ///
    /// Every component gets its full `timeout` even if an earlier one
    /// failed; the first failure is returned.
    pub async fn shutdown(&self, timeout: Duration) -> WarResult<()> {
        let simulator = self.simulator.shutdown(timeout).await;
        let units = self.units.shutdown(timeout).await;
        let resources = self.resources.shutdown(timeout).await;
        for (component, outcome) in [
            ("battle simulator", &simulator),
            ("unit manager", &units),
            ("resource manager", &resources),
        ] {
            if let Err(e) = outcome {
                tracing::warn!(component, error = %e, "shutdown incomplete");
            }
        }
        simulator.and(units).and(resources)
    }
}

/// Outcome of one battle.
#[derive(Debug, Clone, Serialize)]
pub struct BattleSummary {
    /// Battle id.
    pub id: String,
    /// Final (or current, if it could not be ended) state.
    pub state: BattleState,
    /// Winning faction, if any.
    pub winner: Option<String>,
    /// Why it ended.
    pub reason: Option<String>,
    /// Simulated duration in milliseconds.
    pub duration_ms: u64,
    /// Units lost per faction.
    pub casualties: BTreeMap<String, u32>,
    /// One-line assessment of a completed battle.
    pub assessment: Option<String>,
}

/// Unit manager counters at the end of the run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UnitSummary {
    /// Registered units.
    pub total_units: usize,
    /// Registered units per kind.
    pub by_kind: BTreeMap<String, usize>,
    /// Commands delivered.
    pub commands_processed: u64,
    /// Commands that failed delivery or expired.
    pub commands_failed: u64,
    /// Commands refused by a full queue.
    pub commands_dropped: u64,
    /// Most commands in flight at once.
    pub peak_active_commands: usize,
    /// Unit status updates seen by the fan-in.
    pub status_updates: u64,
}

/// Resource manager counters at the end of the run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResourceSummary {
    /// Final levels.
    pub levels: ResourceAmounts,
    /// Transactions processed.
    pub transactions: u64,
    /// Transactions applied.
    pub successful: u64,
    /// Transactions that failed validation.
    pub failed: u64,
    /// Transactions refused at admission.
    pub rejected: u64,
    /// Total consumed per resource.
    pub consumed: ResourceAmounts,
    /// Reservations still held.
    pub pending_reservations: usize,
}

/// JSON summary printed at the end of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// Scenario that ran.
    pub scenario: ScenarioKind,
    /// Wall time spent in the scenario.
    pub elapsed_ms: u64,
    /// Whether the run was interrupted.
    pub cancelled: bool,
    /// Battles, in creation order.
    pub battles: Vec<BattleSummary>,
    /// Dispatcher counters.
    pub units: UnitSummary,
    /// Ledger counters.
    pub resources: ResourceSummary,
    /// Scenario-specific observations.
    pub notes: Vec<String>,
}

impl RunSummary {
    /// Serialize as pretty JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn summarize_battle(simulator: &BattleSimulator, id: &str) -> BattleSummary {
    match simulator.battle_result(id) {
        Ok(result) => BattleSummary {
            id: id.to_owned(),
            state: BattleState::Completed,
            assessment: Some(analyze_battle(&result).assessment),
            winner: result.winner,
            reason: Some(result.reason),
            duration_ms: millis(result.duration),
            casualties: result.casualties,
        },
        Err(e) => {
            tracing::debug!(battle_id = id, error = %e, "no result, reporting status");
            let status = simulator.battle_status(id).ok();
            BattleSummary {
                id: id.to_owned(),
                state: status.as_ref().map_or(BattleState::Cancelled, |s| s.state),
                winner: None,
                reason: None,
                duration_ms: status.as_ref().map_or(0, |s| millis(s.duration)),
                casualties: status
                    .map(|s| {
                        s.participants
                            .keys()
                            .map(|faction| (faction.clone(), s.statistics.casualties(faction)))
                            .collect()
                    })
                    .unwrap_or_default(),
                assessment: None,
            }
        }
    }
}

fn summarize(
    kind: ScenarioKind,
    components: &Components,
    report: ScenarioReport,
    elapsed: Duration,
) -> RunSummary {
    let stats = components.units.stats();
    let ledger = components.resources.statistics();
    RunSummary {
        scenario: kind,
        elapsed_ms: millis(elapsed),
        cancelled: components.root.is_cancelled(),
        battles: report
            .battles
            .iter()
            .map(|id| summarize_battle(&components.simulator, id))
            .collect(),
        units: UnitSummary {
            total_units: stats.total_units,
            by_kind: stats
                .by_kind
                .iter()
                .map(|(kind, n)| (kind.to_string(), *n))
                .collect(),
            commands_processed: stats.commands_processed,
            commands_failed: stats.commands_failed,
            commands_dropped: stats.commands_dropped,
            peak_active_commands: stats.peak_active_commands,
            status_updates: stats.status_updates,
        },
        resources: ResourceSummary {
            levels: components.resources.resource_levels(),
            transactions: ledger.total_transactions,
            successful: ledger.successful,
            failed: ledger.failed,
            rejected: ledger.rejected,
            consumed: ledger.consumed,
            pending_reservations: ledger.pending_reservations,
        },
        notes: report.notes,
    }
}

/// Start the components, run `kind`, summarize, and shut down in order.
///
/// Shutdown happens even when the scenario fails; a scenario error takes
/// precedence over a shutdown error.
pub async fn run_scenario(
    kind: ScenarioKind,
    options: &ScenarioOptions,
    config: WarConfig,
    root: &CancelToken,
) -> Result<RunSummary, ScenarioError> {
    let components = Components::start(config, root, kind.initial_resources())?;
    let started = Instant::now();
    let summary = scenario::drive(kind, &components, options)
        .await
        .map(|report| summarize(kind, &components, report, started.elapsed()));
    if root.is_cancelled() {
        tracing::warn!(scenario = ?kind, "run interrupted");
    }
    let shutdown = components.shutdown(options.shutdown_timeout).await;
    let summary = summary?;
    shutdown.map_err(ScenarioError::Shutdown)?;
    Ok(summary)
}

/// Map a component error to a process exit code.
#[must_use]
pub fn exit_code(error: &ScenarioError) -> u8 {
    match error {
        ScenarioError::Config(_) => 2,
        ScenarioError::Shutdown(WarError::Timeout { .. }) => 3,
        ScenarioError::Component(_) | ScenarioError::Shutdown(_) => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use war_core::math::Position;
    use war_core::unit_kind::UnitKind;
    use war_test_utils::fixtures::init_tracing;

    fn options(secs: u64, units: usize) -> ScenarioOptions {
        ScenarioOptions {
            duration: Duration::from_secs(secs),
            units: Some(units),
            ..ScenarioOptions::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_basic_combat_summary() {
        init_tracing();
        let root = CancelToken::new();
        let summary = run_scenario(ScenarioKind::BasicCombat, &options(120, 3), WarConfig::default(), &root)
            .await
            .unwrap();

        assert_eq!(summary.scenario, ScenarioKind::BasicCombat);
        assert!(!summary.cancelled);
        assert_eq!(summary.battles.len(), 1);
        let battle = &summary.battles[0];
        assert_eq!(battle.id, "basic-combat");
        assert_eq!(battle.state, BattleState::Completed);
        assert!(battle.winner.is_some());
        assert!(battle.assessment.is_some());
        assert_eq!(summary.units.total_units, 6);
        assert_eq!(summary.units.by_kind["Marine"], 3);
        assert!(summary.units.commands_processed >= 3);

        let json = summary.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["scenario"], "basic-combat");
        assert_eq!(value["battles"][0]["state"], "Completed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_resource_management_moves_resources() {
        let root = CancelToken::new();
        let summary = run_scenario(
            ScenarioKind::ResourceManagement,
            &options(5, 3),
            WarConfig::default(),
            &root,
        )
        .await
        .unwrap();

        assert!(summary.battles.is_empty());
        assert_eq!(summary.units.by_kind["Scv"], 3);
        assert!(summary.resources.successful > 0);
        assert!(summary.resources.consumed.get("minerals").copied().unwrap_or(0) >= 50);
        assert_eq!(summary.resources.pending_reservations, 0);
        assert!(summary.notes[0].starts_with("3 workers trained"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stress_test_runs_skirmishes() {
        let root = CancelToken::new();
        let summary = run_scenario(ScenarioKind::StressTest, &options(3, 40), WarConfig::default(), &root)
            .await
            .unwrap();

        assert_eq!(summary.battles.len(), 2);
        assert!(summary
            .battles
            .iter()
            .all(|b| b.state == BattleState::Completed));
        assert_eq!(summary.units.total_units, 40);
        assert!(summary.units.commands_processed > 40);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_run_still_summarizes() {
        let root = CancelToken::new();
        let canceller = root.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            canceller.cancel();
        });
        let summary = run_scenario(
            ScenarioKind::ResourceManagement,
            &options(60, 2),
            WarConfig::default(),
            &root,
        )
        .await
        .unwrap();

        assert!(summary.cancelled);
        assert!(summary.elapsed_ms < 60_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_order_leaves_everything_stopped() {
        let root = CancelToken::new();
        let components =
            Components::start(WarConfig::default(), &root, [("gas".to_owned(), 10)]).unwrap();
        components
            .units
            .spawn_unit("probe", UnitKind::Probe, Position::ZERO)
            .unwrap();
        components.shutdown(Duration::from_secs(5)).await.unwrap();

        assert!(matches!(
            components.units.spawn_unit("late", UnitKind::Probe, Position::ZERO),
            Err(WarError::ShuttingDown(_))
        ));
        assert!(matches!(
            components.simulator.create_battle(war_test_utils::fixtures::marine_vs_zergling("late")),
            Err(WarError::ShuttingDown(_))
        ));
        assert!(components.simulator.active_battles().is_empty());
        assert!(!root.is_cancelled());
    }

    #[test]
    fn test_exit_codes() {
        let timeout = ScenarioError::Shutdown(WarError::timeout("shutdown", Duration::from_secs(1)));
        assert_eq!(exit_code(&timeout), 3);
        assert_eq!(exit_code(&ScenarioError::Component(WarError::InvalidArgument("x".into()))), 1);
    }
}
