//! Ledger and battle tick benchmarks for war_core.
//!
//! Run with: `cargo bench -p war_core`

// Benchmark binaries don't need docs on macro-generated functions
#![allow(missing_docs)]

use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use war_core::config::UnitConfig;
use war_core::lifecycle::CancelToken;
use war_core::math::Position;
use war_core::resources::{Ledger, ResourceAmounts};
use war_core::unit::Unit;
use war_core::unit_kind::UnitKind;

fn deltas(pairs: &[(&str, i64)]) -> ResourceAmounts {
    pairs.iter().map(|(k, v)| ((*k).to_owned(), *v)).collect()
}

fn seeded() -> Ledger {
    let mut ledger = Ledger::new(100);
    for name in ["minerals", "gas", "supply"] {
        let _ = ledger.add_resource(name, 50_000, 100_000);
    }
    ledger
}

/// All-or-nothing ledger updates.
pub fn ledger_benchmark(c: &mut Criterion) {
    let spend = deltas(&[("minerals", -50), ("gas", -25), ("supply", -1)]);
    let refund = deltas(&[("minerals", 50), ("gas", 25), ("supply", 1)]);

    c.bench_function("ledger_apply_roundtrip", |b| {
        let mut ledger = seeded();
        b.iter(|| {
            let _ = ledger.apply(black_box(&spend));
            let _ = ledger.apply(black_box(&refund));
        });
    });

    c.bench_function("ledger_batch_10_steps", |b| {
        let steps: Vec<_> = (0..10)
            .map(|n| if n % 2 == 0 { spend.clone() } else { refund.clone() })
            .collect();
        b.iter_batched(
            seeded,
            |mut ledger| black_box(ledger.apply_batch(&steps)),
            BatchSize::SmallInput,
        );
    });

    c.bench_function("ledger_reserve_release", |b| {
        let mut ledger = seeded();
        let now = tokio::time::Instant::now();
        b.iter(|| {
            if let Ok(id) = ledger.reserve("bench", &refund, Duration::from_secs(30), now) {
                let _ = ledger.release(id);
            }
        });
    });
}

/// Damage resolution between two units.
pub fn combat_benchmark(c: &mut Criterion) {
    let config = UnitConfig::default();
    let root = CancelToken::new();
    let marine = Unit::new("marine", UnitKind::Marine, Position::ZERO, &config, &root);
    let zealot = Unit::new("zealot", UnitKind::Zealot, Position::new(1.0, 0.0), &config, &root);
    c.bench_function("calculate_damage_against", |b| {
        b.iter(|| black_box(marine.calculate_damage_against(black_box(&zealot))));
    });
}

criterion_group!(benches, ledger_benchmark, combat_benchmark);
criterion_main!(benches);
