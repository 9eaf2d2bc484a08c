//! Pure resource ledger.
//!
//! No channels, no locks, no clock: every method takes `now` explicitly and
//! either applies a change completely or leaves the ledger untouched. The
//! [`super::ResourceManager`] processor task is its only writer.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;

use super::{AllocationRecord, ReservationId, ResourceAmounts};
use crate::error::{Result, WarError};

/// One named counter.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceEntry {
    /// Amount on hand, `0..=max`.
    pub current: i64,
    /// Capacity.
    pub max: i64,
    /// Sum of outstanding reservations, never above `current`.
    pub reserved: i64,
    /// Low-level alert threshold (0 disables the warning).
    pub low_threshold: i64,
    /// Most recent allocation records touching this entry.
    pub history: VecDeque<AllocationRecord>,
}

impl ResourceEntry {
    /// Amount free for new allocations and reservations.
    #[must_use]
    pub const fn available(&self) -> i64 {
        self.current - self.reserved
    }
}

/// A provisional hold on capacity.
#[derive(Debug, Clone, PartialEq)]
pub struct Reservation {
    /// Identifier handed to the requester.
    pub id: ReservationId,
    /// Who asked.
    pub requester: String,
    /// When the hold was placed.
    pub created_at: Instant,
    /// Held amounts per resource.
    pub amounts: ResourceAmounts,
    /// When the hold lapses.
    pub expires_at: Instant,
}

/// Named capacity-bounded counters plus outstanding reservations.
#[derive(Debug, Clone)]
pub struct Ledger {
    entries: BTreeMap<String, ResourceEntry>,
    reservations: HashMap<ReservationId, Reservation>,
    log: VecDeque<AllocationRecord>,
    next_reservation: u64,
    history_len: usize,
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new(100)
    }
}

impl Ledger {
    /// Empty ledger keeping `history_len` records per resource and globally.
    #[must_use]
    pub fn new(history_len: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            reservations: HashMap::new(),
            log: VecDeque::new(),
            next_reservation: 1,
            history_len,
        }
    }

    /// Register a counter.
    pub fn add_resource(&mut self, name: &str, initial: i64, max: i64) -> Result<()> {
        if name.trim().is_empty() {
            return Err(WarError::InvalidArgument("resource name is empty".into()));
        }
        if initial < 0 || max < 0 {
            return Err(WarError::InvalidArgument(format!(
                "resource {name}: amounts must be non-negative"
            )));
        }
        if initial > max {
            return Err(WarError::InvalidArgument(format!(
                "resource {name}: initial {initial} exceeds max {max}"
            )));
        }
        if self.entries.contains_key(name) {
            return Err(WarError::already_exists("resource", name));
        }
        self.entries.insert(
            name.to_owned(),
            ResourceEntry {
                current: initial,
                max,
                reserved: 0,
                low_threshold: 0,
                history: VecDeque::new(),
            },
        );
        Ok(())
    }

    /// Entry for `name`.
    #[must_use]
    pub fn entry(&self, name: &str) -> Option<&ResourceEntry> {
        self.entries.get(name)
    }

    /// Iterate all entries in name order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &ResourceEntry)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Current amounts by name.
    #[must_use]
    pub fn levels(&self) -> ResourceAmounts {
        self.entries
            .iter()
            .map(|(k, v)| (k.clone(), v.current))
            .collect()
    }

    /// Number of outstanding reservations.
    #[must_use]
    pub fn pending_reservations(&self) -> usize {
        self.reservations.len()
    }

    /// Look up a reservation.
    #[must_use]
    pub fn reservation(&self, id: ReservationId) -> Option<&Reservation> {
        self.reservations.get(&id)
    }

    /// Most recent allocation records across all resources, oldest first.
    pub fn log(&self) -> impl Iterator<Item = &AllocationRecord> {
        self.log.iter()
    }

    /// Set the low-level alert threshold.
    pub fn set_low_threshold(&mut self, name: &str, threshold: i64) -> Result<()> {
        if threshold < 0 {
            return Err(WarError::InvalidArgument(format!(
                "resource {name}: threshold must be non-negative"
            )));
        }
        let entry = self
            .entries
            .get_mut(name)
            .ok_or_else(|| WarError::not_found("resource", name))?;
        entry.low_threshold = threshold;
        Ok(())
    }

    /// Names that would fail the bounds check for `deltas` applied to
    /// `levels` (a view of `(current, reserved, max)` per name).
    fn failing<'a>(
        levels: impl Fn(&str) -> Option<(i64, i64, i64)>,
        deltas: impl IntoIterator<Item = (&'a String, &'a i64)>,
    ) -> Result<Vec<String>> {
        let mut insufficient = Vec::new();
        for (name, &delta) in deltas {
            let (current, reserved, max) =
                levels(name.as_str()).ok_or_else(|| WarError::not_found("resource", name.as_str()))?;
            let ok = if delta < 0 {
                (current - reserved).checked_add(delta).is_some_and(|v| v >= 0)
            } else {
                current.checked_add(delta).is_some_and(|v| v <= max)
            };
            if !ok {
                insufficient.push(name.clone());
            }
        }
        Ok(insufficient)
    }

    /// Apply signed deltas all-or-nothing.
    ///
    /// Negative deltas need `available + delta >= 0`, positive ones
    /// `current + delta <= max`. On failure nothing changes and the error is
    /// [`WarError::InsufficientResources`] naming every failing resource.
    pub fn apply(&mut self, deltas: &ResourceAmounts) -> Result<()> {
        if deltas.is_empty() {
            return Err(WarError::InvalidArgument("empty transaction".into()));
        }
        let insufficient = Self::failing(
            |name| self.entries.get(name).map(|e| (e.current, e.reserved, e.max)),
            deltas,
        )?;
        if !insufficient.is_empty() {
            return Err(WarError::InsufficientResources {
                resources: insufficient,
            });
        }
        for (name, delta) in deltas {
            if let Some(entry) = self.entries.get_mut(name) {
                entry.current += delta;
            }
        }
        Ok(())
    }

    /// Apply a sequence of delta maps as one transaction. Each step is
    /// checked against the state left by the previous steps.
    ///
    /// Returns the net change per resource.
    pub fn apply_batch(&mut self, steps: &[ResourceAmounts]) -> Result<ResourceAmounts> {
        if steps.is_empty() || steps.iter().any(BTreeMap::is_empty) {
            return Err(WarError::InvalidArgument("empty batch step".into()));
        }
        let mut running: HashMap<&str, i64> = HashMap::new();
        for step in steps {
            let insufficient = Self::failing(
                |name| {
                    self.entries.get(name).map(|e| {
                        let current = running.get(name).copied().unwrap_or(e.current);
                        (current, e.reserved, e.max)
                    })
                },
                step,
            )?;
            if !insufficient.is_empty() {
                return Err(WarError::InsufficientResources {
                    resources: insufficient,
                });
            }
            for (name, delta) in step {
                let base = self.entries.get(name).map_or(0, |e| e.current);
                *running.entry(name.as_str()).or_insert(base) += delta;
            }
        }
        let mut net = ResourceAmounts::new();
        for step in steps {
            for (name, delta) in step {
                *net.entry(name.clone()).or_insert(0) += delta;
            }
        }
        for (name, value) in running {
            if let Some(entry) = self.entries.get_mut(name) {
                entry.current = value;
            }
        }
        Ok(net)
    }

    /// Move `amounts` from `{from}.{resource}` entries to `{to}.{resource}`.
    ///
    /// Both legs are validated before either is applied.
    pub fn transfer(&mut self, from: &str, to: &str, amounts: &ResourceAmounts) -> Result<ResourceAmounts> {
        if from == to {
            return Err(WarError::InvalidArgument(format!(
                "transfer source and destination are both {from}"
            )));
        }
        if amounts.values().any(|v| *v <= 0) {
            return Err(WarError::InvalidArgument(
                "transfer amounts must be positive".into(),
            ));
        }
        let mut deltas = ResourceAmounts::new();
        for (resource, amount) in amounts {
            deltas.insert(pool_key(from, resource), -amount);
            deltas.insert(pool_key(to, resource), *amount);
        }
        self.apply(&deltas)?;
        Ok(deltas)
    }

    /// Add production to `name`, clamping at max. Returns the amount
    /// actually added; the excess is dropped.
    pub fn generate(&mut self, name: &str, amount: i64) -> Result<i64> {
        if amount < 0 {
            return Err(WarError::InvalidArgument(
                "generated amount must be non-negative".into(),
            ));
        }
        let entry = self
            .entries
            .get_mut(name)
            .ok_or_else(|| WarError::not_found("resource", name))?;
        let added = amount.min(entry.max - entry.current);
        entry.current += added;
        Ok(added)
    }

    /// Hold `amounts` (all positive) until `now + ttl`.
    pub fn reserve(
        &mut self,
        requester: &str,
        amounts: &ResourceAmounts,
        ttl: Duration,
        now: Instant,
    ) -> Result<ReservationId> {
        if amounts.is_empty() {
            return Err(WarError::InvalidArgument("empty reservation".into()));
        }
        if amounts.values().any(|v| *v <= 0) {
            return Err(WarError::InvalidArgument(
                "reservation amounts must be positive".into(),
            ));
        }
        let expires_at = now
            .checked_add(ttl)
            .ok_or_else(|| WarError::InvalidArgument("reservation ttl out of range".into()))?;
        let mut insufficient = Vec::new();
        for (name, amount) in amounts {
            let entry = self
                .entries
                .get(name)
                .ok_or_else(|| WarError::not_found("resource", name.as_str()))?;
            if entry.available() < *amount {
                insufficient.push(name.clone());
            }
        }
        if !insufficient.is_empty() {
            return Err(WarError::InsufficientResources {
                resources: insufficient,
            });
        }
        for (name, amount) in amounts {
            if let Some(entry) = self.entries.get_mut(name) {
                entry.reserved += amount;
            }
        }
        let id = ReservationId(self.next_reservation);
        self.next_reservation += 1;
        self.reservations.insert(
            id,
            Reservation {
                id,
                requester: requester.to_owned(),
                created_at: now,
                amounts: amounts.clone(),
                expires_at,
            },
        );
        Ok(id)
    }

    /// Turn a reservation into an actual decrement.
    pub fn consume(&mut self, id: ReservationId) -> Result<Reservation> {
        let reservation = self
            .reservations
            .remove(&id)
            .ok_or_else(|| WarError::not_found("reservation", id.to_string()))?;
        for (name, amount) in &reservation.amounts {
            if let Some(entry) = self.entries.get_mut(name) {
                entry.reserved -= amount;
                entry.current -= amount;
            }
        }
        Ok(reservation)
    }

    /// Drop a reservation, returning its capacity.
    pub fn release(&mut self, id: ReservationId) -> Result<Reservation> {
        let reservation = self
            .reservations
            .remove(&id)
            .ok_or_else(|| WarError::not_found("reservation", id.to_string()))?;
        self.unreserve(&reservation);
        Ok(reservation)
    }

    /// Release every reservation whose expiry is at or before `now`.
    pub fn sweep_expired(&mut self, now: Instant) -> Vec<Reservation> {
        let expired: Vec<ReservationId> = self
            .reservations
            .values()
            .filter(|r| r.expires_at <= now)
            .map(|r| r.id)
            .collect();
        let mut swept = Vec::with_capacity(expired.len());
        for id in expired {
            if let Some(reservation) = self.reservations.remove(&id) {
                self.unreserve(&reservation);
                swept.push(reservation);
            }
        }
        swept.sort_by_key(|r| r.id);
        swept
    }

    fn unreserve(&mut self, reservation: &Reservation) {
        for (name, amount) in &reservation.amounts {
            if let Some(entry) = self.entries.get_mut(name) {
                entry.reserved -= amount;
            }
        }
    }

    /// Append an allocation record to the touched entries and the global log.
    pub fn record(&mut self, requester: &str, resources: &ResourceAmounts, success: bool, now: Instant) {
        let remaining: ResourceAmounts = resources
            .keys()
            .filter_map(|name| self.entries.get(name).map(|e| (name.clone(), e.current)))
            .collect();
        let record = AllocationRecord {
            timestamp: now,
            requester: requester.to_owned(),
            resources: resources.clone(),
            success,
            remaining,
        };
        let limit = self.history_len.max(1);
        for name in resources.keys() {
            if let Some(entry) = self.entries.get_mut(name) {
                if entry.history.len() == limit {
                    entry.history.pop_front();
                }
                entry.history.push_back(record.clone());
            }
        }
        if self.log.len() == limit {
            self.log.pop_front();
        }
        self.log.push_back(record);
    }
}

/// Entry name for `resource` inside `pool`.
#[must_use]
pub fn pool_key(pool: &str, resource: &str) -> String {
    format!("{pool}.{resource}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn amounts(pairs: &[(&str, i64)]) -> ResourceAmounts {
        pairs.iter().map(|(k, v)| ((*k).to_owned(), *v)).collect()
    }

    fn ledger() -> Ledger {
        let mut ledger = Ledger::new(10);
        ledger.add_resource("minerals", 100, 1000).unwrap();
        ledger.add_resource("gas", 50, 500).unwrap();
        ledger
    }

    #[test]
    fn test_add_resource_validation() {
        let mut ledger = ledger();
        assert!(matches!(
            ledger.add_resource("", 0, 10),
            Err(WarError::InvalidArgument(_))
        ));
        assert!(matches!(
            ledger.add_resource("x", -1, 10),
            Err(WarError::InvalidArgument(_))
        ));
        assert!(matches!(
            ledger.add_resource("x", 11, 10),
            Err(WarError::InvalidArgument(_))
        ));
        assert!(matches!(
            ledger.add_resource("gas", 0, 10),
            Err(WarError::AlreadyExists { .. })
        ));
    }

    #[test]
    fn test_exhaustion_leaves_ledger_untouched() {
        let mut ledger = Ledger::new(10);
        ledger.add_resource("minerals", 10, 100).unwrap();
        let err = ledger.apply(&amounts(&[("minerals", -20)])).unwrap_err();
        assert_eq!(
            err,
            WarError::InsufficientResources {
                resources: vec!["minerals".into()]
            }
        );
        assert_eq!(ledger.entry("minerals").unwrap().current, 10);
    }

    #[test]
    fn test_extreme_deltas_are_rejected_without_overflow() {
        let mut ledger = Ledger::new(10);
        ledger.add_resource("minerals", 10, 100).unwrap();
        for delta in [i64::MAX, i64::MIN] {
            let err = ledger.apply(&amounts(&[("minerals", delta)])).unwrap_err();
            assert!(matches!(err, WarError::InsufficientResources { .. }));
        }
        let err = ledger
            .apply_batch(&[amounts(&[("minerals", -5)]), amounts(&[("minerals", i64::MAX)])])
            .unwrap_err();
        assert!(matches!(err, WarError::InsufficientResources { .. }));
        assert_eq!(ledger.entry("minerals").unwrap().current, 10);

        ledger.apply(&amounts(&[("minerals", -1)])).unwrap();
        assert_eq!(ledger.entry("minerals").unwrap().current, 9);
    }

    #[test]
    fn test_multi_resource_all_or_nothing() {
        let mut ledger = ledger();
        let err = ledger
            .apply(&amounts(&[("minerals", -50), ("gas", -60)]))
            .unwrap_err();
        assert!(matches!(err, WarError::InsufficientResources { resources } if resources == ["gas"]));
        assert_eq!(ledger.levels(), amounts(&[("gas", 50), ("minerals", 100)]));

        ledger
            .apply(&amounts(&[("minerals", -50), ("gas", -50)]))
            .unwrap();
        assert_eq!(ledger.levels(), amounts(&[("gas", 0), ("minerals", 50)]));
    }

    #[test]
    fn test_positive_delta_capped_by_max() {
        let mut ledger = ledger();
        assert!(ledger.apply(&amounts(&[("gas", 451)])).is_err());
        ledger.apply(&amounts(&[("gas", 450)])).unwrap();
        assert_eq!(ledger.entry("gas").unwrap().current, 500);
    }

    #[test]
    fn test_unknown_resource_is_not_found() {
        let mut ledger = ledger();
        assert!(matches!(
            ledger.apply(&amounts(&[("crystal", -1)])),
            Err(WarError::NotFound { .. })
        ));
    }

    #[test]
    fn test_reservation_reduces_availability() {
        let mut ledger = ledger();
        let now = Instant::now();
        ledger
            .reserve("a", &amounts(&[("minerals", 60)]), Duration::from_secs(1), now)
            .unwrap();
        let entry = ledger.entry("minerals").unwrap();
        assert_eq!((entry.current, entry.reserved, entry.available()), (100, 60, 40));

        assert!(ledger.apply(&amounts(&[("minerals", -50)])).is_err());
        assert!(ledger
            .reserve("b", &amounts(&[("minerals", 50)]), Duration::from_secs(1), now)
            .is_err());
        ledger.apply(&amounts(&[("minerals", -40)])).unwrap();
    }

    #[test]
    fn test_unrepresentable_ttl_is_rejected() {
        let mut ledger = ledger();
        let err = ledger
            .reserve("a", &amounts(&[("minerals", 10)]), Duration::MAX, Instant::now())
            .unwrap_err();
        assert!(matches!(err, WarError::InvalidArgument(_)));
        assert_eq!(ledger.entry("minerals").unwrap().reserved, 0);
        assert_eq!(ledger.pending_reservations(), 0);
    }

    #[test]
    fn test_consume_matches_direct_allocate() {
        let now = Instant::now();
        let mut reserved = ledger();
        let id = reserved
            .reserve("a", &amounts(&[("minerals", 30), ("gas", 10)]), Duration::from_secs(5), now)
            .unwrap();
        reserved.consume(id).unwrap();

        let mut direct = ledger();
        direct
            .apply(&amounts(&[("minerals", -30), ("gas", -10)]))
            .unwrap();

        assert_eq!(reserved.levels(), direct.levels());
        assert_eq!(reserved.entry("minerals").unwrap().reserved, 0);
        assert!(matches!(reserved.consume(id), Err(WarError::NotFound { .. })));
    }

    #[test]
    fn test_release_restores_exactly() {
        let now = Instant::now();
        let mut ledger = ledger();
        let before: Vec<_> = ledger.entries().map(|(k, e)| (k.to_owned(), e.current, e.reserved)).collect();
        let id = ledger
            .reserve("a", &amounts(&[("gas", 25)]), Duration::from_secs(5), now)
            .unwrap();
        ledger.release(id).unwrap();
        let after: Vec<_> = ledger.entries().map(|(k, e)| (k.to_owned(), e.current, e.reserved)).collect();
        assert_eq!(before, after);
        assert!(matches!(ledger.release(id), Err(WarError::NotFound { .. })));
    }

    #[test]
    fn test_sweep_expired() {
        let start = Instant::now();
        let mut ledger = ledger();
        let short = ledger
            .reserve("a", &amounts(&[("minerals", 50)]), Duration::from_secs(1), start)
            .unwrap();
        let long = ledger
            .reserve("b", &amounts(&[("minerals", 10)]), Duration::from_secs(10), start)
            .unwrap();

        assert!(ledger.sweep_expired(start).is_empty());
        let swept = ledger.sweep_expired(start + Duration::from_millis(1100));
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].id, short);
        assert!(ledger.reservation(long).is_some());
        assert_eq!(ledger.entry("minerals").unwrap().reserved, 10);
        ledger.apply(&amounts(&[("minerals", -80)])).unwrap();
    }

    #[test]
    fn test_transfer_validates_both_legs() {
        let mut ledger = Ledger::new(10);
        ledger.add_resource("main.minerals", 100, 1000).unwrap();
        ledger.add_resource("expansion.minerals", 95, 100).unwrap();

        let err = ledger
            .transfer("main", "expansion", &amounts(&[("minerals", 10)]))
            .unwrap_err();
        assert!(matches!(err, WarError::InsufficientResources { resources } if resources == ["expansion.minerals"]));
        assert_eq!(ledger.entry("main.minerals").unwrap().current, 100);

        ledger
            .transfer("main", "expansion", &amounts(&[("minerals", 5)]))
            .unwrap();
        assert_eq!(ledger.entry("main.minerals").unwrap().current, 95);
        assert_eq!(ledger.entry("expansion.minerals").unwrap().current, 100);
    }

    #[test]
    fn test_batch_uses_running_state() {
        let mut ledger = ledger();
        let net = ledger
            .apply_batch(&[amounts(&[("minerals", -100)]), amounts(&[("minerals", 30)])])
            .unwrap();
        assert_eq!(net, amounts(&[("minerals", -70)]));
        assert_eq!(ledger.entry("minerals").unwrap().current, 30);

        let err = ledger
            .apply_batch(&[amounts(&[("gas", -50)]), amounts(&[("gas", -1)])])
            .unwrap_err();
        assert!(matches!(err, WarError::InsufficientResources { .. }));
        assert_eq!(ledger.entry("gas").unwrap().current, 50);
    }

    #[test]
    fn test_generate_clamps_at_max() {
        let mut ledger = ledger();
        assert_eq!(ledger.generate("gas", 400).unwrap(), 400);
        assert_eq!(ledger.generate("gas", 100).unwrap(), 50);
        assert_eq!(ledger.generate("gas", 10).unwrap(), 0);
        assert_eq!(ledger.entry("gas").unwrap().current, 500);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut ledger = Ledger::new(3);
        ledger.add_resource("minerals", 100, 100).unwrap();
        let now = Instant::now();
        for _ in 0..5 {
            ledger.record("scv", &amounts(&[("minerals", -1)]), true, now);
        }
        assert_eq!(ledger.entry("minerals").unwrap().history.len(), 3);
        assert_eq!(ledger.log().count(), 3);
    }
}
