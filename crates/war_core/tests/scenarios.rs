//! End-to-end scenarios wiring several components together.

use std::time::Duration;

use futures::StreamExt;
use war_core::battle::{BattleConfig, BattleEventKind, BattleSimulator, BattleState, SimulatorEvent};
use war_core::config::{BattleConfigDefaults, ResourceConfig};
use war_core::dispatch::BroadcastSpec;
use war_core::error::WarError;
use war_core::lifecycle::CancelToken;
use war_core::math::{Position, Rect};
use war_core::replay::{analyze_battle, BattleReplayer};
use war_core::resources::ResourceManager;
use war_core::unit::Command;
use war_core::unit_kind::{UnitKind, UnitState};
use war_test_utils::fixtures::{
    amounts, init_tracing, marine_vs_zergling, resource_manager, squad, unit_manager, SHUTDOWN,
};

#[tokio::test(start_paused = true)]
async fn dispatched_squad_wins_battle() {
    init_tracing();
    let root = CancelToken::new();
    let manager = unit_manager(2, &root);
    let marines: Vec<_> = (0..3_u8)
        .map(|n| {
            manager
                .spawn_unit(
                    format!("marine-{n}"),
                    UnitKind::Marine,
                    Position::new(1.0 + f64::from(n), 5.0),
                )
                .unwrap()
        })
        .collect();

    let queued = manager
        .broadcast_command(&BroadcastSpec::new(Command::hold()).filter(|u| u.kind() == UnitKind::Marine))
        .unwrap();
    assert_eq!(queued, 3);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(marines.iter().all(|m| m.state() == UnitState::HoldingPosition));

    let simulator = BattleSimulator::new(BattleConfigDefaults::default(), &root);
    let mut results = simulator.results().unwrap();
    let zerglings = squad("zergling", UnitKind::Zergling, 2, Position::new(12.0, 5.0));
    let id = simulator
        .create_battle(BattleConfig::attackers_vs_defenders(
            marines.clone(),
            zerglings,
            Rect::sized(20.0, 10.0),
        ))
        .unwrap();
    simulator.start_battle(&id).unwrap();

    let result = tokio::time::timeout(Duration::from_secs(120), results.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.battle_id, id);
    assert_eq!(result.winner.as_deref(), Some("attackers"));
    assert_eq!(result.survivors["defenders"], 0);
    assert!(result.statistics.damage_dealt["attackers"] >= 70);

    let stats = manager.stats();
    assert_eq!(stats.total_units, 3);
    assert!(stats.status_updates > 0);

    simulator.shutdown(SHUTDOWN).await.unwrap();
    manager.shutdown(SHUTDOWN).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn completed_battle_replays_and_analyzes() {
    let root = CancelToken::new();
    let simulator = BattleSimulator::new(BattleConfigDefaults::default(), &root);
    let mut observer = simulator.add_observer();
    simulator.create_battle(marine_vs_zergling("duel")).unwrap();
    simulator.start_battle("duel").unwrap();

    let mut completed = None;
    while completed.is_none() {
        match tokio::time::timeout(Duration::from_secs(120), observer.recv()).await {
            Ok(Some(SimulatorEvent::BattleCompleted { battle_id, state, winner })) => {
                assert_eq!(battle_id, "duel");
                assert_eq!(state, BattleState::Completed);
                completed = Some(winner);
            }
            Ok(Some(_)) => {}
            other => panic!("observer ended early: {other:?}"),
        }
    }
    assert_eq!(completed.flatten().as_deref(), Some("attackers"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    simulator.shutdown(SHUTDOWN).await.unwrap();

    let result = simulator.battle_result("duel").unwrap();
    assert!(result
        .events
        .iter()
        .any(|e| e.kind == BattleEventKind::FactionEliminated));

    let replayer = BattleReplayer::new(result.events.clone());
    let span = replayer.span();
    assert!(span > Duration::ZERO);
    let start = tokio::time::Instant::now();
    let replayed: Vec<_> = replayer.play(10.0).unwrap().collect().await;
    assert_eq!(replayed.len(), result.events.len());
    let took = start.elapsed();
    let expected = span.div_f64(10.0);
    let drift = if took > expected { took - expected } else { expected - took };
    assert!(drift < Duration::from_millis(1), "{took:?} vs {expected:?}");

    let analysis = analyze_battle(&result);
    assert!(analysis.assessment.contains("victory for attackers"));
    assert!(analysis.performance_scores["attackers"] > analysis.performance_scores["defenders"]);
    assert!(!analysis.critical_moments.is_empty());
}

#[tokio::test(start_paused = true)]
async fn reservation_expiry_frees_capacity() {
    let root = CancelToken::new();
    let resources = resource_manager(&[("minerals", 100)], &root).unwrap();
    let reserved = resources
        .reserve_resources_with_ttl(
            "barracks",
            amounts(&[("minerals", 50)]),
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .wait()
        .await;
    assert!(reserved.success);

    let blocked = resources
        .allocate_resources("factory", amounts(&[("minerals", -80)]), Duration::from_secs(1))
        .wait()
        .await;
    assert!(!blocked.success);
    assert!(matches!(blocked.error, Some(WarError::InsufficientResources { .. })));

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let allowed = resources
        .allocate_resources("factory", amounts(&[("minerals", -80)]), Duration::from_secs(1))
        .wait()
        .await;
    assert!(allowed.success, "{allowed:?}");
    assert_eq!(resources.resource_levels()["minerals"], 20);
    resources.shutdown(SHUTDOWN).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn root_cancel_reaches_every_component() {
    let root = CancelToken::new();
    let manager = unit_manager(2, &root);
    let marine = manager
        .spawn_unit("marine", UnitKind::Marine, Position::ZERO)
        .unwrap();
    let resources = ResourceManager::new(ResourceConfig::default(), &root, [("gas".to_owned(), 10)])
        .unwrap();
    let simulator = BattleSimulator::new(BattleConfigDefaults::default(), &root);

    root.cancel();
    assert!(marine.is_shut_down());
    assert!(matches!(
        marine.try_submit(Command::stop()),
        Err(WarError::ShuttingDown(_))
    ));
    let reply = manager.send_command("marine", Command::stop(), 0).await.unwrap();
    assert!(matches!(reply.error, Some(WarError::ShuttingDown(_))));
    assert!(matches!(
        simulator.create_battle(marine_vs_zergling("late")),
        Err(WarError::ShuttingDown(_))
    ));

    simulator.shutdown(SHUTDOWN).await.unwrap();
    manager.shutdown(SHUTDOWN).await.unwrap();
    resources.shutdown(SHUTDOWN).await.unwrap();
    resources.shutdown(SHUTDOWN).await.unwrap();
}
