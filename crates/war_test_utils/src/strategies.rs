//! Proptest strategies.
//!
//! Most inputs stay inside ranges the simulation is meant to handle so that
//! failures point at logic. The `wide` variants cover the full integer
//! range and the extremes.

use proptest::prelude::*;
use war_core::math::Position;
use war_core::resources::ResourceAmounts;
use war_core::unit::Command;
use war_core::unit_kind::UnitKind;

/// Resource names used by the ledger strategies.
pub const RESOURCES: &[&str] = &["minerals", "gas", "supply"];

/// Any unit kind.
pub fn arb_unit_kind() -> impl Strategy<Value = UnitKind> {
    prop::sample::select(UnitKind::ALL)
}

/// Position on a 100x100 map.
pub fn arb_position() -> impl Strategy<Value = Position> {
    (0.0..100.0f64, 0.0..100.0f64).prop_map(|(x, y)| Position::new(x, y))
}

/// Any command that does not need a target unit.
pub fn arb_command() -> impl Strategy<Value = Command> {
    prop_oneof![
        arb_position().prop_map(Command::move_to),
        arb_position().prop_map(Command::patrol),
        Just(Command::stop()),
        Just(Command::hold()),
        Just(Command::defend()),
        Just(Command::attack_nothing()),
    ]
}

/// Damage amounts (0-500).
pub fn arb_damage() -> impl Strategy<Value = u32> {
    0u32..500u32
}

/// Signed deltas over a subset of [`RESOURCES`].
pub fn arb_deltas() -> impl Strategy<Value = ResourceAmounts> {
    prop::collection::btree_map(
        prop::sample::select(RESOURCES).prop_map(str::to_owned),
        -300i64..300i64,
        1..=RESOURCES.len(),
    )
}

/// A sequence of delta maps.
pub fn arb_delta_sequence(max_len: usize) -> impl Strategy<Value = Vec<ResourceAmounts>> {
    prop::collection::vec(arb_deltas(), 1..max_len.max(2))
}

/// Any `i64`, weighted towards the extremes.
pub fn arb_wide_delta() -> impl Strategy<Value = i64> {
    prop_oneof![
        Just(i64::MAX),
        Just(i64::MIN),
        Just(i64::MAX - 1),
        Just(i64::MIN + 1),
        any::<i64>(),
        -300i64..300i64,
    ]
}

/// Deltas drawn from [`arb_wide_delta`].
pub fn arb_wide_deltas() -> impl Strategy<Value = ResourceAmounts> {
    prop::collection::btree_map(
        prop::sample::select(RESOURCES).prop_map(str::to_owned),
        arb_wide_delta(),
        1..=RESOURCES.len(),
    )
}
