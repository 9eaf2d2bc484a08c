//! Fixed-rate battle driver and event pipeline.
//!
//! Two background tasks:
//! - the tick loop advances simulated time and every active battle, then
//!   enqueues what happened without ever waiting on the queue;
//! - the event processor drains whatever is queued, filters and orders it,
//!   runs handlers against the battle, logs the event and forwards it to
//!   observers. Follow-up events go back into the queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};

use super::config::{BattleConfig, Terrain, Weather};
use super::event::{BattleEvent, BattleEventData, BattleEventKind};
use super::processor::{EventLogger, EventProcessor};
use super::state::{Battle, BattleResult, BattleState, BattleStatus};
use crate::config::BattleConfigDefaults;
use crate::error::{Result, WarError};
use crate::lifecycle::{CancelToken, TaskTracker};
use crate::unit::{Command, Unit};

const MAX_BATCH: usize = 256;

/// Notification from the simulator to its observers.
#[derive(Debug, Clone, PartialEq)]
pub enum SimulatorEvent {
    /// The first tick ran.
    SimulationStarted,
    /// Ticking was paused.
    SimulationPaused,
    /// Ticking resumed.
    SimulationResumed,
    /// A battle was registered.
    BattleCreated {
        /// Battle id.
        battle_id: String,
    },
    /// A battle reached a terminal state.
    BattleCompleted {
        /// Battle id.
        battle_id: String,
        /// Completed or Cancelled.
        state: BattleState,
        /// Winner, if any.
        winner: Option<String>,
    },
    /// A tick finished.
    TickProcessed {
        /// Tick number, from 1.
        tick: u64,
        /// Simulated time after the tick.
        sim_time: Duration,
    },
    /// A battle event made it through the pipeline.
    Battle(BattleEvent),
}

#[derive(Debug, Default)]
struct Clock {
    tick: u64,
    sim_time: Duration,
}

/// A terminal battle. Kept addressable so events still in the queue are
/// handled against it.
struct Finished {
    battle: Arc<Mutex<Battle>>,
    result: Option<BattleResult>,
}

struct Shared {
    battles: RwLock<HashMap<String, Arc<Mutex<Battle>>>>,
    finished: RwLock<HashMap<String, Finished>>,
    processor: EventProcessor,
    logger: EventLogger,
    observers: Mutex<Vec<mpsc::Sender<SimulatorEvent>>>,
    queue: mpsc::Sender<BattleEvent>,
    results: mpsc::Sender<BattleResult>,
    seq: AtomicU64,
    clock: Mutex<Clock>,
    dropped: AtomicU64,
}

impl Shared {
    fn now(&self) -> Duration {
        self.clock.lock().sim_time
    }

    fn enqueue(&self, mut event: BattleEvent) -> Result<()> {
        event.seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        match self.queue.try_send(event) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(event)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(battle_id = %event.battle_id, kind = ?event.kind, "event queue full, dropping event");
                Err(WarError::Backpressure("battle event queue full".into()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(WarError::ShuttingDown("battle simulator".into()))
            }
        }
    }

    /// Enqueue from inside the simulator; overflow is already logged.
    fn emit(&self, event: BattleEvent) {
        let _ = self.enqueue(event);
    }

    fn notify(&self, event: &SimulatorEvent) {
        let observers = self.observers.lock().clone();
        let mut closed = false;
        for observer in &observers {
            match observer.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::trace!("observer full, skipping");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed = true,
            }
        }
        if closed {
            self.observers.lock().retain(|o| !o.is_closed());
        }
    }

    fn any_battle(&self, id: &str) -> Option<Arc<Mutex<Battle>>> {
        if let Some(battle) = self.battles.read().get(id) {
            return Some(Arc::clone(battle));
        }
        self.finished
            .read()
            .get(id)
            .map(|f| Arc::clone(&f.battle))
    }

    fn battle(&self, id: &str) -> Result<Arc<Mutex<Battle>>> {
        if let Some(battle) = self.battles.read().get(id) {
            return Ok(Arc::clone(battle));
        }
        if self.finished.read().contains_key(id) {
            return Err(WarError::InvalidState(format!("battle {id} is over")));
        }
        Err(WarError::not_found("battle", id))
    }

    /// Move a terminal battle out of the active set. Runs once per battle.
    fn retire(
        &self,
        battle: Arc<Mutex<Battle>>,
        state: BattleState,
        result: Option<BattleResult>,
        reason: &str,
    ) {
        let id = battle.lock().id().to_owned();
        self.battles.write().remove(&id);
        let winner = result.as_ref().and_then(|r| r.winner.clone());
        let result = result.map(|mut result| {
            result.events = self.logger.events(&id);
            result
        });
        if let Some(result) = &result {
            if self.results.try_send(result.clone()).is_err() {
                tracing::warn!(battle_id = %id, "result channel full or closed, result kept for lookup only");
            }
        }
        self.finished
            .write()
            .insert(id.clone(), Finished { battle, result });
        self.emit(
            BattleEvent::new(BattleEventKind::BattleEnded, id.clone(), self.now()).with_data(
                BattleEventData::Ended {
                    winner: winner.clone(),
                    reason: reason.to_owned(),
                },
            ),
        );
        tracing::info!(battle_id = %id, ?state, winner = ?winner, reason, "battle ended");
        self.notify(&SimulatorEvent::BattleCompleted {
            battle_id: id,
            state,
            winner,
        });
    }

    fn tick(&self, dt: Duration) {
        let (tick, now) = {
            let mut clock = self.clock.lock();
            clock.tick += 1;
            clock.sim_time += dt;
            (clock.tick, clock.sim_time)
        };
        if tick == 1 {
            self.notify(&SimulatorEvent::SimulationStarted);
        }

        let mut battles: Vec<_> = self
            .battles
            .read()
            .iter()
            .map(|(id, b)| (id.clone(), Arc::clone(b)))
            .collect();
        battles.sort_by(|a, b| a.0.cmp(&b.0));

        for (id, battle) in battles {
            let (outcome, reason) = {
                let mut guard = battle.lock();
                let outcome = guard.tick(dt, now);
                let reason = guard.end_reason().unwrap_or_default().to_owned();
                (outcome, reason)
            };
            for event in outcome.events {
                self.emit(event);
            }
            if outcome.paused {
                tracing::info!(battle_id = %id, "battle paused on objective");
                self.emit(BattleEvent::new(BattleEventKind::BattlePaused, id.clone(), now));
            }
            if outcome.result.is_some() {
                self.retire(battle, BattleState::Completed, outcome.result, &reason);
            }
        }
        self.notify(&SimulatorEvent::TickProcessed { tick, sim_time: now });
    }

    fn process_batch(&self, batch: Vec<BattleEvent>) {
        for event in self.processor.prepare(batch) {
            let battle = self.any_battle(&event.battle_id);
            let follow_ups = match battle {
                Some(battle) => {
                    let mut battle = battle.lock();
                    let follow_ups = self.processor.handle(&event, &mut battle);
                    battle.set_last_event(event.clone());
                    follow_ups
                }
                None => Vec::new(),
            };
            tracing::trace!(battle_id = %event.battle_id, kind = ?event.kind, seq = event.seq, "event processed");
            self.logger.log(event.clone());
            self.notify(&SimulatorEvent::Battle(event));
            for follow_up in follow_ups {
                self.emit(follow_up);
            }
        }
    }
}

/// Runs battles on a fixed tick and pipes their events to observers.
pub struct BattleSimulator {
    shared: Arc<Shared>,
    results: Mutex<Option<mpsc::Receiver<BattleResult>>>,
    tick_rate: watch::Sender<Duration>,
    paused: watch::Sender<bool>,
    accepting: AtomicBool,
    tasks: TaskTracker,
    cancel: CancelToken,
    config: BattleConfigDefaults,
}

impl std::fmt::Debug for BattleSimulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BattleSimulator")
            .field("battles", &self.shared.battles.read().len())
            .field("tick_rate", &*self.tick_rate.borrow())
            .field("paused", &*self.paused.borrow())
            .finish_non_exhaustive()
    }
}

impl BattleSimulator {
    /// Create the simulator and start ticking.
    pub fn new(config: BattleConfigDefaults, parent: &CancelToken) -> Self {
        let cancel = parent.child();
        let (queue, queue_rx) = mpsc::channel(config.event_queue.max(1));
        let (results, results_rx) = mpsc::channel(config.result_buffer.max(1));
        let shared = Arc::new(Shared {
            battles: RwLock::new(HashMap::new()),
            finished: RwLock::new(HashMap::new()),
            processor: EventProcessor::new(),
            logger: EventLogger::new(config.max_log_events),
            observers: Mutex::new(Vec::new()),
            queue,
            results,
            seq: AtomicU64::new(0),
            clock: Mutex::new(Clock::default()),
            dropped: AtomicU64::new(0),
        });
        let tick = if config.tick().is_zero() {
            BattleConfigDefaults::default().tick()
        } else {
            config.tick()
        };
        let (tick_rate, tick_rx) = watch::channel(tick);
        let (paused, paused_rx) = watch::channel(false);

        let tasks = TaskTracker::new();
        tasks.spawn(run_ticks(Arc::clone(&shared), tick_rx, paused_rx, cancel.clone()));
        tasks.spawn(process_events(Arc::clone(&shared), queue_rx, cancel.clone()));
        tracing::info!(tick_ms = tick.as_millis() as u64, "battle simulator started");

        Self {
            shared,
            results: Mutex::new(Some(results_rx)),
            tick_rate,
            paused,
            accepting: AtomicBool::new(true),
            tasks,
            cancel,
            config,
        }
    }

    /// Handler and filter registry.
    #[must_use]
    pub fn processor(&self) -> &EventProcessor {
        &self.shared.processor
    }

    fn check_open(&self) -> Result<()> {
        if !self.accepting.load(Ordering::SeqCst) || self.cancel.is_cancelled() {
            return Err(WarError::ShuttingDown("battle simulator".into()));
        }
        Ok(())
    }

    /// Validate and register a battle in `Preparing`. Returns its id.
    pub fn create_battle(&self, config: BattleConfig) -> Result<String> {
        self.check_open()?;
        let id = match &config.id {
            Some(id) if id.trim().is_empty() => {
                return Err(WarError::InvalidArgument("battle id is empty".into()));
            }
            Some(id) => id.clone(),
            None => uuid::Uuid::new_v4().to_string(),
        };
        let sides: Vec<String> = config
            .factions
            .iter()
            .map(|(name, units)| format!("{name} ({})", units.len()))
            .collect();
        let battle = Battle::new(id.clone(), config)?;
        {
            let mut battles = self.shared.battles.write();
            if battles.contains_key(&id) || self.shared.finished.read().contains_key(&id) {
                return Err(WarError::already_exists("battle", id));
            }
            battles.insert(id.clone(), Arc::new(Mutex::new(battle)));
        }

        let now = self.shared.now();
        self.shared.emit(
            BattleEvent::new(BattleEventKind::BattleStarted, id.clone(), now)
                .with_data(BattleEventData::Text(sides.join(" vs "))),
        );
        tracing::info!(battle_id = %id, sides = %sides.join(" vs "), "battle created");
        self.shared.notify(&SimulatorEvent::BattleCreated {
            battle_id: id.clone(),
        });
        Ok(id)
    }

    fn transition(&self, id: &str, next: BattleState, kind: Option<BattleEventKind>) -> Result<()> {
        let battle = self.shared.battle(id)?;
        battle.lock().transition(next)?;
        tracing::info!(battle_id = %id, state = ?next, "battle state changed");
        if let Some(kind) = kind {
            self.shared
                .emit(BattleEvent::new(kind, id.to_owned(), self.shared.now()));
        }
        Ok(())
    }

    /// `Preparing -> Active`.
    pub fn start_battle(&self, id: &str) -> Result<()> {
        self.transition(id, BattleState::Active, None)
    }

    /// `Active -> Paused`.
    pub fn pause_battle(&self, id: &str) -> Result<()> {
        self.transition(id, BattleState::Paused, Some(BattleEventKind::BattlePaused))
    }

    /// `Paused -> Active`.
    pub fn resume_battle(&self, id: &str) -> Result<()> {
        self.transition(id, BattleState::Active, Some(BattleEventKind::BattleResumed))
    }

    /// Add units to a faction of a running or preparing battle.
    pub fn join_battle(&self, id: &str, units: Vec<Arc<Unit>>, faction: &str) -> Result<()> {
        let battle = self.shared.battle(id)?;
        let ids: Vec<String> = units.iter().map(|u| u.id().to_owned()).collect();
        let joined = battle.lock().join(faction, units)?;
        tracing::info!(battle_id = %id, faction, joined, "reinforcements arrived");
        self.shared.emit(
            BattleEvent::new(BattleEventKind::ReinforcementsArrived, id.to_owned(), self.shared.now())
                .with_actors(ids)
                .with_data(BattleEventData::Faction {
                    faction: faction.to_owned(),
                    units: joined,
                }),
        );
        Ok(())
    }

    /// End a battle now.
    ///
    /// A battle that never started is cancelled; otherwise it completes and
    /// its result is produced from the current standings.
    pub fn end_battle(&self, id: &str, reason: &str) -> Result<()> {
        let battle = self.shared.battle(id)?;
        let (state, result) = {
            let mut guard = battle.lock();
            let state = if guard.state() == BattleState::Preparing {
                BattleState::Cancelled
            } else {
                BattleState::Completed
            };
            (state, guard.finish(state, reason)?)
        };
        self.shared.retire(battle, state, result, reason);
        Ok(())
    }

    /// Give a unit an order, applied on the battle's next tick.
    pub fn queue_action(&self, id: &str, unit_id: &str, command: Command) -> Result<()> {
        let battle = self.shared.battle(id)?;
        let queued = battle.lock().queue(unit_id, command);
        queued
    }

    /// Change weather and terrain.
    pub fn change_conditions(&self, id: &str, weather: Weather, terrain: Terrain) -> Result<()> {
        let battle = self.shared.battle(id)?;
        let (old_weather, old_terrain) = {
            let mut battle = battle.lock();
            let before = (battle.environment().weather, battle.environment().terrain);
            battle.set_conditions(weather, terrain);
            before
        };
        let now = self.shared.now();
        if old_weather != weather {
            self.shared.emit(
                BattleEvent::new(BattleEventKind::WeatherChanged, id.to_owned(), now)
                    .with_data(BattleEventData::Weather(weather)),
            );
        }
        if old_terrain != terrain {
            self.shared.emit(
                BattleEvent::new(BattleEventKind::TerrainChanged, id.to_owned(), now)
                    .with_data(BattleEventData::Terrain(terrain)),
            );
        }
        Ok(())
    }

    /// Inject an event into the pipeline. The sequence number is assigned
    /// here.
    pub fn send_event(&self, event: BattleEvent) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(WarError::ShuttingDown("battle simulator".into()));
        }
        if event.battle_id.trim().is_empty() {
            return Err(WarError::InvalidArgument("event has no battle id".into()));
        }
        let known = self.shared.battles.read().contains_key(&event.battle_id)
            || self.shared.finished.read().contains_key(&event.battle_id);
        if !known {
            return Err(WarError::not_found("battle", event.battle_id));
        }
        self.shared.enqueue(event)
    }

    /// Current status of an active or finished battle.
    pub fn battle_status(&self, id: &str) -> Result<BattleStatus> {
        self.shared
            .any_battle(id)
            .map(|battle| battle.lock().status())
            .ok_or_else(|| WarError::not_found("battle", id))
    }

    /// Result of a completed battle, including whatever the pipeline
    /// recorded after completion.
    pub fn battle_result(&self, id: &str) -> Result<BattleResult> {
        if let Some(finished) = self.shared.finished.read().get(id) {
            let mut result = finished.result.clone().ok_or_else(|| {
                WarError::InvalidState(format!("battle {id} was cancelled and has no result"))
            })?;
            result.statistics = finished.battle.lock().statistics().clone();
            result.events = self.shared.logger.events(id);
            return Ok(result);
        }
        if self.shared.battles.read().contains_key(id) {
            return Err(WarError::InvalidState(format!("battle {id} is still running")));
        }
        Err(WarError::not_found("battle", id))
    }

    /// Logged events of a battle, oldest first.
    #[must_use]
    pub fn event_log(&self, id: &str) -> Vec<BattleEvent> {
        self.shared.logger.events(id)
    }

    /// Ids of battles not yet finished, sorted.
    #[must_use]
    pub fn active_battles(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.shared.battles.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Subscribe to simulator events. Slow observers miss events.
    pub fn add_observer(&self) -> mpsc::Receiver<SimulatorEvent> {
        let (tx, rx) = mpsc::channel(self.config.observer_buffer.max(1));
        self.shared.observers.lock().push(tx);
        rx
    }

    /// Receiver of finalized results. Returns `None` once taken.
    pub fn results(&self) -> Option<mpsc::Receiver<BattleResult>> {
        self.results.lock().take()
    }

    /// Stop ticking. Returns `false` if already paused.
    pub fn pause(&self) -> bool {
        let changed = self.paused.send_if_modified(|paused| !std::mem::replace(paused, true));
        if changed {
            tracing::info!("simulation paused");
            self.shared.notify(&SimulatorEvent::SimulationPaused);
        }
        changed
    }

    /// Resume ticking. Returns `false` if not paused.
    pub fn resume(&self) -> bool {
        let changed = self.paused.send_if_modified(|paused| std::mem::replace(paused, false));
        if changed {
            tracing::info!("simulation resumed");
            self.shared.notify(&SimulatorEvent::SimulationResumed);
        }
        changed
    }

    /// Whether ticking is paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Change the tick interval. Takes effect immediately.
    pub fn set_tick_rate(&self, rate: Duration) -> Result<()> {
        if rate.is_zero() {
            return Err(WarError::InvalidArgument("tick rate must be non-zero".into()));
        }
        self.tick_rate.send_replace(rate);
        Ok(())
    }

    /// Current tick interval.
    #[must_use]
    pub fn tick_rate(&self) -> Duration {
        *self.tick_rate.borrow()
    }

    /// Simulated time so far.
    #[must_use]
    pub fn sim_time(&self) -> Duration {
        self.shared.now()
    }

    /// Ticks run so far.
    #[must_use]
    pub fn ticks(&self) -> u64 {
        self.shared.clock.lock().tick
    }

    /// Events dropped on a full queue.
    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Cancel every unfinished battle, stop both loops and wait for them.
    /// Idempotent.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        if self.accepting.swap(false, Ordering::SeqCst) {
            tracing::info!("battle simulator shutting down");
            for id in self.active_battles() {
                let Ok(battle) = self.shared.battle(&id) else {
                    continue;
                };
                let cancelled = battle
                    .lock()
                    .finish(BattleState::Cancelled, "simulator shutdown")
                    .is_ok();
                if cancelled {
                    self.shared
                        .retire(battle, BattleState::Cancelled, None, "simulator shutdown");
                }
            }
        }
        self.cancel.cancel();
        self.tasks.wait(timeout).await
    }
}

fn ticker(period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

async fn run_ticks(
    shared: Arc<Shared>,
    mut rate: watch::Receiver<Duration>,
    paused: watch::Receiver<bool>,
    cancel: CancelToken,
) {
    let mut period = *rate.borrow_and_update();
    let mut interval = ticker(period);
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            changed = rate.changed() => {
                if changed.is_err() {
                    break;
                }
                period = *rate.borrow_and_update();
                interval = ticker(period);
                tracing::debug!(tick_ms = period.as_millis() as u64, "tick rate changed");
            }
            _ = interval.tick() => {
                if *paused.borrow() {
                    continue;
                }
                shared.tick(period);
            }
        }
    }
    tracing::debug!("tick loop stopped");
}

async fn process_events(shared: Arc<Shared>, mut queue: mpsc::Receiver<BattleEvent>, cancel: CancelToken) {
    loop {
        let first = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            next = queue.recv() => match next {
                Some(event) => event,
                None => break,
            },
        };
        let mut batch = vec![first];
        while batch.len() < MAX_BATCH {
            match queue.try_recv() {
                Ok(event) => batch.push(event),
                Err(_) => break,
            }
        }
        shared.process_batch(batch);
    }
    tracing::debug!("event processor stopped");
}
