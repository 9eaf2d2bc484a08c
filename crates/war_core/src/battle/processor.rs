//! Event pipeline stages: filters, handlers, and the per-battle log.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::RwLock;

use super::event::{BattleEvent, BattleEventData, BattleEventKind};
use super::state::{Battle, TacticalEvent, TacticalEventKind};

/// Handles one kind of event. May mutate the battle and return follow-up
/// events, which are queued rather than processed inline.
pub trait EventHandler: Send + Sync {
    /// Kind this handler is registered for.
    fn event_kind(&self) -> BattleEventKind;

    /// Process `event` against `battle`.
    fn handle(&self, event: &BattleEvent, battle: &mut Battle) -> Vec<BattleEvent>;
}

/// Decides whether an event is processed at all.
pub trait EventFilter: Send + Sync {
    /// `false` drops the event.
    fn should_process(&self, event: &BattleEvent) -> bool;

    /// Filters run in descending priority.
    fn priority(&self) -> i32 {
        0
    }
}

impl<F> EventFilter for F
where
    F: Fn(&BattleEvent) -> bool + Send + Sync,
{
    fn should_process(&self, event: &BattleEvent) -> bool {
        self(event)
    }
}

/// Routes events through filters and handlers.
pub struct EventProcessor {
    handlers: RwLock<HashMap<BattleEventKind, Vec<Arc<dyn EventHandler>>>>,
    filters: RwLock<Vec<Arc<dyn EventFilter>>>,
}

impl std::fmt::Debug for EventProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventProcessor")
            .field("handler_kinds", &self.handlers.read().len())
            .field("filters", &self.filters.read().len())
            .finish()
    }
}

impl Default for EventProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl EventProcessor {
    /// Processor with the built-in casualty and objective handlers.
    #[must_use]
    pub fn new() -> Self {
        let processor = Self::empty();
        processor.register_handler(Arc::new(CasualtyHandler));
        processor.register_handler(Arc::new(ObjectiveHandler));
        processor
    }

    /// Processor with no handlers or filters.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            filters: RwLock::new(Vec::new()),
        }
    }

    /// Add a handler. Several handlers may share a kind; they run in
    /// registration order.
    pub fn register_handler(&self, handler: Arc<dyn EventHandler>) {
        self.handlers
            .write()
            .entry(handler.event_kind())
            .or_default()
            .push(handler);
    }

    /// Add a filter.
    pub fn add_filter(&self, filter: Arc<dyn EventFilter>) {
        let mut filters = self.filters.write();
        filters.push(filter);
        // Stable: equal priorities keep registration order.
        filters.sort_by_key(|f| std::cmp::Reverse(f.priority()));
    }

    /// Whether every filter accepts `event`.
    #[must_use]
    pub fn accepts(&self, event: &BattleEvent) -> bool {
        self.filters.read().iter().all(|f| f.should_process(event))
    }

    /// Drop filtered events and order the rest: priority descending, then
    /// sequence ascending.
    #[must_use]
    pub fn prepare(&self, batch: Vec<BattleEvent>) -> Vec<BattleEvent> {
        let mut accepted: Vec<_> = batch.into_iter().filter(|e| self.accepts(e)).collect();
        accepted.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.seq.cmp(&b.seq)));
        accepted
    }

    /// Run every handler registered for the event's kind.
    pub fn handle(&self, event: &BattleEvent, battle: &mut Battle) -> Vec<BattleEvent> {
        let handlers = self
            .handlers
            .read()
            .get(&event.kind)
            .cloned()
            .unwrap_or_default();
        handlers
            .iter()
            .flat_map(|h| h.handle(event, battle))
            .collect()
    }
}

/// Records formation breaks and eliminations; follows up with
/// [`BattleEventKind::FactionEliminated`].
#[derive(Debug)]
struct CasualtyHandler;

impl EventHandler for CasualtyHandler {
    fn event_kind(&self) -> BattleEventKind {
        BattleEventKind::UnitDestroyed
    }

    fn handle(&self, event: &BattleEvent, battle: &mut Battle) -> Vec<BattleEvent> {
        let BattleEventData::Destroyed { faction, .. } = &event.data else {
            return Vec::new();
        };
        let alive = battle.alive_count(faction);
        let peak = battle.peak_strength(faction);
        let elapsed = battle.elapsed();
        let mut follow_ups = Vec::new();

        let stats = battle.statistics_mut();
        if alive * 2 < peak && !stats.has_tactical(TacticalEventKind::FormationBreak, faction) {
            stats.tactical_events.push(TacticalEvent {
                kind: TacticalEventKind::FormationBreak,
                timestamp: elapsed,
                faction: faction.clone(),
                description: format!("{faction} down to {alive} of {peak} units"),
                impact: 0.5,
            });
        }
        if alive == 0 && !stats.has_tactical(TacticalEventKind::FactionEliminated, faction) {
            stats.tactical_events.push(TacticalEvent {
                kind: TacticalEventKind::FactionEliminated,
                timestamp: elapsed,
                faction: faction.clone(),
                description: format!("{faction} has no units left"),
                impact: 1.0,
            });
            follow_ups.push(
                BattleEvent::new(
                    BattleEventKind::FactionEliminated,
                    event.battle_id.clone(),
                    event.timestamp,
                )
                .with_data(BattleEventData::Faction {
                    faction: faction.clone(),
                    units: peak,
                }),
            );
        }
        follow_ups
    }
}

#[derive(Debug)]
struct ObjectiveHandler;

impl EventHandler for ObjectiveHandler {
    fn event_kind(&self) -> BattleEventKind {
        BattleEventKind::ObjectiveCaptured
    }

    fn handle(&self, event: &BattleEvent, battle: &mut Battle) -> Vec<BattleEvent> {
        if let BattleEventData::Objective {
            index,
            faction,
            points,
        } = &event.data
        {
            let description = battle
                .objectives()
                .get(*index)
                .map_or_else(|| format!("objective {index}"), |s| s.objective.description.clone());
            let elapsed = battle.elapsed();
            battle.statistics_mut().tactical_events.push(TacticalEvent {
                kind: TacticalEventKind::ObjectiveSecured,
                timestamp: elapsed,
                faction: faction.clone(),
                description: format!("{faction} secured {description}"),
                impact: f64::from(*points),
            });
        }
        Vec::new()
    }
}

/// Append-only event log per battle, bounded by dropping the oldest.
#[derive(Debug)]
pub struct EventLogger {
    logs: RwLock<HashMap<String, VecDeque<BattleEvent>>>,
    max_events: usize,
}

impl EventLogger {
    /// Keep at most `max_events` per battle.
    #[must_use]
    pub fn new(max_events: usize) -> Self {
        Self {
            logs: RwLock::new(HashMap::new()),
            max_events: max_events.max(1),
        }
    }

    /// Append an event to its battle's log.
    pub fn log(&self, event: BattleEvent) {
        let mut logs = self.logs.write();
        let log = logs.entry(event.battle_id.clone()).or_default();
        if log.len() == self.max_events {
            log.pop_front();
        }
        log.push_back(event);
    }

    /// Copy of a battle's log, oldest first.
    #[must_use]
    pub fn events(&self, battle_id: &str) -> Vec<BattleEvent> {
        self.logs
            .read()
            .get(battle_id)
            .map(|log| log.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of events logged for a battle.
    #[must_use]
    pub fn len(&self, battle_id: &str) -> usize {
        self.logs.read().get(battle_id).map_or(0, VecDeque::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn event(kind: BattleEventKind, seq: u64) -> BattleEvent {
        let mut event = BattleEvent::new(kind, "b", Duration::ZERO);
        event.seq = seq;
        event
    }

    #[test]
    fn test_prepare_orders_by_priority_then_seq() {
        let processor = EventProcessor::empty();
        let batch = vec![
            event(BattleEventKind::UnitMoved, 1),
            event(BattleEventKind::UnitDestroyed, 2),
            event(BattleEventKind::UnitMoved, 3),
            event(BattleEventKind::BattleEnded, 4),
            event(BattleEventKind::Custom, 5).with_priority(200),
        ];
        let seqs: Vec<_> = processor.prepare(batch).iter().map(|e| e.seq).collect();
        assert_eq!(seqs, [5, 4, 2, 1, 3]);
    }

    #[test]
    fn test_filters_drop_events() {
        let processor = EventProcessor::empty();
        processor.add_filter(Arc::new(|e: &BattleEvent| e.kind != BattleEventKind::UnitMoved));
        let batch = vec![
            event(BattleEventKind::UnitMoved, 1),
            event(BattleEventKind::UnitAttacked, 2),
        ];
        let kept = processor.prepare(batch);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].kind, BattleEventKind::UnitAttacked);
    }

    struct Ranked(i32, Arc<parking_lot::Mutex<Vec<i32>>>);

    impl EventFilter for Ranked {
        fn should_process(&self, _: &BattleEvent) -> bool {
            self.1.lock().push(self.0);
            true
        }

        fn priority(&self) -> i32 {
            self.0
        }
    }

    #[test]
    fn test_filters_run_in_priority_order() {
        let processor = EventProcessor::empty();
        let calls = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for rank in [1, 10, 5] {
            processor.add_filter(Arc::new(Ranked(rank, Arc::clone(&calls))));
        }
        assert!(processor.accepts(&event(BattleEventKind::Custom, 1)));
        assert_eq!(*calls.lock(), [10, 5, 1]);
    }

    #[test]
    fn test_logger_is_bounded() {
        let logger = EventLogger::new(3);
        for seq in 0..5 {
            logger.log(event(BattleEventKind::UnitMoved, seq));
        }
        let seqs: Vec<_> = logger.events("b").iter().map(|e| e.seq).collect();
        assert_eq!(seqs, [2, 3, 4]);
        assert_eq!(logger.len("other"), 0);
    }
}
