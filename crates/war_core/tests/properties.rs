//! Property tests for unit combat and the resource ledger.

use std::time::Duration;

use proptest::prelude::*;
use tokio::time::Instant;
use war_core::resources::Ledger;
use war_core::unit_kind::{UnitKind, UnitState};
use war_test_utils::fixtures::{amounts, unit};
use war_test_utils::strategies::{
    arb_damage, arb_delta_sequence, arb_deltas, arb_unit_kind, arb_wide_deltas, RESOURCES,
};

fn seeded_ledger() -> Ledger {
    let mut ledger = Ledger::new(16);
    for name in RESOURCES {
        ledger.add_resource(name, 500, 1000).unwrap();
    }
    ledger
}

fn assert_bounds(ledger: &Ledger) {
    for (name, entry) in ledger.entries() {
        assert!(entry.current >= 0, "{name} went negative: {entry:?}");
        assert!(entry.current <= entry.max, "{name} above max: {entry:?}");
        assert!(entry.reserved <= entry.current, "{name} over-reserved: {entry:?}");
    }
}

proptest! {
    #[test]
    fn health_stays_within_bounds(kind in arb_unit_kind(), hits in prop::collection::vec(arb_damage(), 0..20)) {
        let u = unit("u", kind, 0.0, 0.0);
        let max = u.max_health();
        for amount in hits {
            let before = u.health();
            let after = u.take_damage(amount);
            prop_assert!(after <= before);
            prop_assert!(after <= max);
            prop_assert_eq!(after == 0, u.state() == UnitState::Dead);
        }
        if u.state() == UnitState::Dead {
            prop_assert!(!u.set_state(UnitState::Idle));
            prop_assert_eq!(u.heal(1000), 0);
        }
    }

    #[test]
    fn damage_is_floored_at_zero(attacker in arb_unit_kind(), defender in arb_unit_kind()) {
        let a = unit("a", attacker, 0.0, 0.0);
        let d = unit("d", defender, 1.0, 0.0);
        let dealt = a.calculate_damage_against(&d);
        prop_assert_eq!(dealt, a.damage().saturating_sub(d.armor()));
        prop_assert!(dealt <= a.damage());
    }

    #[test]
    fn failed_apply_changes_nothing(sequence in arb_delta_sequence(12)) {
        let mut ledger = seeded_ledger();
        for deltas in &sequence {
            let before = ledger.levels();
            match ledger.apply(deltas) {
                Ok(()) => {
                    for (name, delta) in deltas {
                        prop_assert_eq!(ledger.levels()[name], before[name] + delta);
                    }
                }
                Err(_) => prop_assert_eq!(ledger.levels(), before),
            }
            assert_bounds(&ledger);
        }
    }

    #[test]
    fn extreme_deltas_never_break_bounds(
        sequence in prop::collection::vec(arb_wide_deltas(), 1..12),
    ) {
        let mut ledger = seeded_ledger();
        for deltas in &sequence {
            let before = ledger.levels();
            match ledger.apply(deltas) {
                Ok(()) => {
                    for (name, delta) in deltas {
                        prop_assert_eq!(Some(ledger.levels()[name]), before[name].checked_add(*delta));
                    }
                }
                Err(_) => prop_assert_eq!(ledger.levels(), before),
            }
            assert_bounds(&ledger);
        }
        let before = ledger.levels();
        if ledger.apply_batch(&sequence).is_err() {
            prop_assert_eq!(ledger.levels(), before);
        }
        assert_bounds(&ledger);
    }

    #[test]
    fn batch_is_all_or_nothing(steps in arb_delta_sequence(6)) {
        let mut ledger = seeded_ledger();
        let before = ledger.levels();
        match ledger.apply_batch(&steps) {
            Ok(net) => {
                for (name, delta) in &net {
                    prop_assert_eq!(ledger.levels()[name], before[name] + delta);
                }
            }
            Err(_) => prop_assert_eq!(ledger.levels(), before),
        }
        assert_bounds(&ledger);
    }

    #[test]
    fn release_restores_availability(deltas in arb_deltas()) {
        let mut ledger = seeded_ledger();
        let hold: war_core::resources::ResourceAmounts =
            deltas.into_iter().map(|(k, v)| (k, v.abs().max(1))).collect();
        let available = |l: &Ledger| -> Vec<i64> {
            l.entries().map(|(_, e)| e.available()).collect()
        };
        let before = available(&ledger);
        let id = ledger
            .reserve("prop", &hold, Duration::from_secs(5), Instant::now())
            .unwrap();
        assert_bounds(&ledger);
        ledger.release(id).unwrap();
        prop_assert_eq!(available(&ledger), before);
        prop_assert_eq!(ledger.pending_reservations(), 0);
    }
}

#[test]
fn exhaustion_keeps_current() {
    let mut ledger = Ledger::new(8);
    ledger.add_resource("minerals", 10, 100).unwrap();
    assert!(ledger.apply(&amounts(&[("minerals", -20)])).is_err());
    assert_eq!(ledger.entry("minerals").unwrap().current, 10);
}

#[test]
fn reference_damage_values() {
    let probe = unit("p", UnitKind::Probe, 0.0, 0.0);
    let battlecruiser = unit("bc", UnitKind::Battlecruiser, 1.0, 0.0);
    assert_eq!(probe.calculate_damage_against(&battlecruiser), 2);

    let marine = unit("m", UnitKind::Marine, 0.0, 0.0);
    let zealot = unit("z", UnitKind::Zealot, 1.0, 0.0);
    assert_eq!(marine.calculate_damage_against(&zealot), 5);
}
