//! Unit actors.
//!
//! Each [`Unit`] owns its combat state behind a reader/writer lock and runs a
//! single command loop that is the only place behaviour transitions happen.
//! A handful of setters (`take_damage`, `set_target`, `set_position`,
//! `set_state`) are callable directly so an attacker can apply damage to its
//! target synchronously; concurrent attackers serialize on the target's lock.
//!
//! Events are published on a bounded outbox with `try_send` after the lock is
//! released. The outbox receiver goes to exactly one owner through
//! [`Unit::take_event_stream`].

mod command;

pub use command::{Command, CommandKind, EventPayload, UnitEvent, UnitEventKind};

use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::time::Instant;

use crate::config::UnitConfig;
use crate::error::{Result, WarError};
use crate::lifecycle::{CancelToken, TaskTracker};
use crate::math::Position;
use crate::stats::stat_table;
use crate::unit_kind::{ElevationLayer, UnitKind, UnitState};

/// Shared context for spawning units: settings, the parent cancellation
/// token and the tracker their loops are registered with.
#[derive(Debug, Clone)]
pub struct UnitRuntime {
    /// Inbox/outbox settings.
    pub config: UnitConfig,
    /// Parent of every unit's token.
    pub cancel: CancelToken,
    /// Tracks unit loops.
    pub tasks: TaskTracker,
}

impl UnitRuntime {
    /// Create a runtime whose token is a child of `parent`.
    #[must_use]
    pub fn new(config: UnitConfig, parent: &CancelToken) -> Self {
        Self {
            config,
            cancel: parent.child(),
            tasks: TaskTracker::new(),
        }
    }
}

/// Which upgrade track to advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeKind {
    /// Weapon upgrades.
    Attack,
    /// Armor upgrades.
    Armor,
}

#[derive(Debug)]
struct CombatState {
    health: u32,
    max_health: u32,
    base_damage: u32,
    base_armor: u32,
    attack_upgrades: u32,
    armor_upgrades: u32,
    attack_modifier: u32,
    armor_modifier: u32,
    attack_range: f64,
    vision_range: f64,
    speed: f64,
    elevation: ElevationLayer,
    state: UnitState,
    position: Position,
    target: Option<Weak<Unit>>,
}

impl CombatState {
    fn damage(&self) -> u32 {
        self.base_damage
            .saturating_add(self.attack_modifier.saturating_mul(self.attack_upgrades))
    }

    fn armor(&self) -> u32 {
        self.base_armor
            .saturating_add(self.armor_modifier.saturating_mul(self.armor_upgrades))
    }
}

/// Result of one `take_damage` application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DamageOutcome {
    /// Health after the hit.
    pub health: u32,
    /// Whether this hit moved the unit to `Dead`.
    pub killed: bool,
}

/// A combat unit actor.
pub struct Unit {
    id: String,
    kind: UnitKind,
    combat: RwLock<CombatState>,
    inbox: Mutex<Option<mpsc::Sender<Command>>>,
    pending_inbox: Mutex<Option<mpsc::Receiver<Command>>>,
    outbox: mpsc::Sender<UnitEvent>,
    event_stream: Mutex<Option<mpsc::Receiver<UnitEvent>>>,
    cancel: CancelToken,
    config: UnitConfig,
}

impl std::fmt::Debug for Unit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let combat = self.combat.read();
        f.debug_struct("Unit")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("health", &combat.health)
            .field("state", &combat.state)
            .field("position", &combat.position)
            .finish_non_exhaustive()
    }
}

impl Unit {
    /// Create a unit and start its command loop.
    pub fn spawn(
        id: impl Into<String>,
        kind: UnitKind,
        position: Position,
        runtime: &UnitRuntime,
    ) -> Arc<Self> {
        let unit = Self::new(id, kind, position, &runtime.config, &runtime.cancel);
        if let Err(e) = unit.start(&runtime.tasks) {
            // Only possible if the loop was already started, which it cannot be here.
            tracing::error!(unit_id = %unit.id, "failed to start unit loop: {}", e);
        }
        unit
    }

    /// Create a unit without starting its loop.
    ///
    /// Stats come from the process-wide table; a kind with no entry gets
    /// conservative fallback stats.
    pub fn new(
        id: impl Into<String>,
        kind: UnitKind,
        position: Position,
        config: &UnitConfig,
        parent: &CancelToken,
    ) -> Arc<Self> {
        let stats = stat_table().stats_for(kind);
        let (inbox_tx, inbox_rx) = mpsc::channel(config.inbox_capacity.max(1));
        let (outbox_tx, outbox_rx) = mpsc::channel(config.event_buffer.max(1));
        Arc::new(Self {
            id: id.into(),
            kind,
            combat: RwLock::new(CombatState {
                health: stats.max_health,
                max_health: stats.max_health,
                base_damage: stats.base_damage,
                base_armor: stats.base_armor,
                attack_upgrades: 0,
                armor_upgrades: 0,
                attack_modifier: stats.attack_modifier,
                armor_modifier: stats.armor_modifier,
                attack_range: stats.attack_range,
                vision_range: stats.vision_range,
                speed: stats.speed,
                elevation: stats.elevation,
                state: UnitState::Idle,
                position,
                target: None,
            }),
            inbox: Mutex::new(Some(inbox_tx)),
            pending_inbox: Mutex::new(Some(inbox_rx)),
            outbox: outbox_tx,
            event_stream: Mutex::new(Some(outbox_rx)),
            cancel: parent.child(),
            config: config.clone(),
        })
    }

    /// Start the command loop on `tasks`.
    ///
    /// Fails with [`WarError::InvalidState`] if the loop was already started
    /// or the unit has been shut down.
    pub fn start(self: &Arc<Self>, tasks: &TaskTracker) -> Result<()> {
        let inbox = self.pending_inbox.lock().take().ok_or_else(|| {
            WarError::InvalidState(format!("unit {} loop already started or shut down", self.id))
        })?;
        let unit = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let id = self.id.clone();
        tasks.spawn(run_loop(id, unit, inbox, cancel));
        Ok(())
    }

    /// Enqueue a command, waiting up to the configured bound for space.
    pub async fn submit(&self, command: Command) -> Result<()> {
        let sender = self.sender()?;
        match sender.send_timeout(command, self.config.submit_wait()).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(WarError::Backpressure(format!(
                "unit {} inbox full",
                self.id
            ))),
            Err(SendTimeoutError::Closed(_)) => Err(self.shutting_down()),
        }
    }

    /// Enqueue a command without waiting.
    pub fn try_submit(&self, command: Command) -> Result<()> {
        let sender = self.sender()?;
        match sender.try_send(command) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(WarError::Backpressure(format!(
                "unit {} inbox full",
                self.id
            ))),
            Err(TrySendError::Closed(_)) => Err(self.shutting_down()),
        }
    }

    fn sender(&self) -> Result<mpsc::Sender<Command>> {
        if self.cancel.is_cancelled() {
            return Err(self.shutting_down());
        }
        let sender = self.inbox.lock().clone().ok_or_else(|| self.shutting_down())?;
        if !self.is_alive() {
            return Err(WarError::InvalidState(format!("unit {} is dead", self.id)));
        }
        Ok(sender)
    }

    fn shutting_down(&self) -> WarError {
        WarError::ShuttingDown(format!("unit {}", self.id))
    }

    /// Stop the command loop and close the inbox. Safe to call repeatedly
    /// and concurrently.
    pub fn shutdown(&self) {
        let first = self.cancel.cancel();
        let closed = self.inbox.lock().take();
        let never_started = self.pending_inbox.lock().take();
        if first || closed.is_some() {
            tracing::debug!(unit_id = %self.id, "unit shut down");
        }
        drop(closed);
        drop(never_started);
    }

    /// Whether shutdown has been requested (directly or by a parent).
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Clone of the unit's cancellation token, for tasks that must stop when
    /// the unit does.
    pub(crate) fn lifecycle_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Hand the event stream to its owner. Returns `None` once taken.
    pub fn take_event_stream(&self) -> Option<mpsc::Receiver<UnitEvent>> {
        self.event_stream.lock().take()
    }

    // Accessors

    /// Unique id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Unit kind.
    #[must_use]
    pub const fn kind(&self) -> UnitKind {
        self.kind
    }

    /// Current health.
    #[must_use]
    pub fn health(&self) -> u32 {
        self.combat.read().health
    }

    /// Maximum health.
    #[must_use]
    pub fn max_health(&self) -> u32 {
        self.combat.read().max_health
    }

    /// Behaviour state.
    #[must_use]
    pub fn state(&self) -> UnitState {
        self.combat.read().state
    }

    /// Position.
    #[must_use]
    pub fn position(&self) -> Position {
        self.combat.read().position
    }

    /// Current target, if it still exists. May be dead; use
    /// [`Unit::live_target`] before acting on it.
    #[must_use]
    pub fn target(&self) -> Option<Arc<Unit>> {
        self.combat.read().target.as_ref().and_then(Weak::upgrade)
    }

    /// Current target if it exists and is alive.
    #[must_use]
    pub fn live_target(&self) -> Option<Arc<Unit>> {
        self.target().filter(|t| t.is_alive())
    }

    /// Effective damage (base plus upgrades).
    #[must_use]
    pub fn damage(&self) -> u32 {
        self.combat.read().damage()
    }

    /// Effective armor (base plus upgrades).
    #[must_use]
    pub fn armor(&self) -> u32 {
        self.combat.read().armor()
    }

    /// Weapon range.
    #[must_use]
    pub fn attack_range(&self) -> f64 {
        self.combat.read().attack_range
    }

    /// Sight radius.
    #[must_use]
    pub fn vision_range(&self) -> f64 {
        self.combat.read().vision_range
    }

    /// Movement speed per simulated second.
    #[must_use]
    pub fn speed(&self) -> f64 {
        self.combat.read().speed
    }

    /// Elevation layer.
    #[must_use]
    pub fn elevation(&self) -> ElevationLayer {
        self.combat.read().elevation
    }

    /// `(attack_upgrades, armor_upgrades)`.
    #[must_use]
    pub fn upgrades(&self) -> (u32, u32) {
        let combat = self.combat.read();
        (combat.attack_upgrades, combat.armor_upgrades)
    }

    /// Whether the unit is not dead.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.combat.read().state != UnitState::Dead
    }

    /// Damage this unit would deal to `target` right now, floored at zero.
    #[must_use]
    pub fn calculate_damage_against(&self, target: &Unit) -> u32 {
        let damage = self.damage();
        damage.saturating_sub(target.armor())
    }

    // Mutators

    /// Change behaviour state. Returns `false` if the unit is dead, since
    /// `Dead` is terminal.
    pub fn set_state(&self, state: UnitState) -> bool {
        let previous = {
            let mut combat = self.combat.write();
            if combat.state == UnitState::Dead {
                return false;
            }
            std::mem::replace(&mut combat.state, state)
        };
        if previous != state {
            self.emit(
                UnitEventKind::StateChanged,
                None,
                EventPayload::StateChanged {
                    from: previous,
                    to: state,
                },
            );
        }
        true
    }

    /// Move the unit.
    pub fn set_position(&self, position: Position) {
        self.combat.write().position = position;
    }

    /// Set or clear the target.
    pub fn set_target(&self, target: Option<&Arc<Unit>>) {
        self.combat.write().target = target.map(Arc::downgrade);
    }

    /// Subtract `amount` health, clamping at zero. Returns the new health.
    pub fn take_damage(&self, amount: u32) -> u32 {
        self.apply_damage(amount, None).health
    }

    /// Like [`Unit::take_damage`], recording who dealt the damage and
    /// reporting whether this hit was lethal.
    pub fn apply_damage(&self, amount: u32, attacker: Option<&str>) -> DamageOutcome {
        let (health, killed, previous_state) = {
            let mut combat = self.combat.write();
            if combat.state == UnitState::Dead {
                return DamageOutcome {
                    health: combat.health,
                    killed: false,
                };
            }
            combat.health = combat.health.saturating_sub(amount);
            let previous = combat.state;
            let killed = combat.health == 0;
            if killed {
                combat.state = UnitState::Dead;
                combat.target = None;
            }
            (combat.health, killed, previous)
        };
        let attacker = attacker.map(str::to_owned);
        if amount > 0 {
            self.emit(
                UnitEventKind::Damaged,
                attacker.clone(),
                EventPayload::Damage {
                    amount,
                    remaining: health,
                },
            );
        }
        if killed {
            self.emit(
                UnitEventKind::StateChanged,
                None,
                EventPayload::StateChanged {
                    from: previous_state,
                    to: UnitState::Dead,
                },
            );
            self.emit(UnitEventKind::Died, attacker, EventPayload::None);
        }
        DamageOutcome { health, killed }
    }

    /// Restore health, capped at maximum. Dead units stay dead.
    pub fn heal(&self, amount: u32) -> u32 {
        let mut combat = self.combat.write();
        if combat.state != UnitState::Dead {
            combat.health = combat.health.saturating_add(amount).min(combat.max_health);
        }
        combat.health
    }

    /// Advance an upgrade track by one level, saturating. Returns the new
    /// level.
    pub fn apply_upgrade(&self, upgrade: UpgradeKind) -> u32 {
        let mut combat = self.combat.write();
        match upgrade {
            UpgradeKind::Attack => {
                combat.attack_upgrades = combat.attack_upgrades.saturating_add(1);
                combat.attack_upgrades
            }
            UpgradeKind::Armor => {
                combat.armor_upgrades = combat.armor_upgrades.saturating_add(1);
                combat.armor_upgrades
            }
        }
    }

    fn emit(&self, kind: UnitEventKind, target: Option<String>, payload: EventPayload) {
        let event = UnitEvent {
            kind,
            source: self.id.clone(),
            target,
            timestamp: Instant::now(),
            payload,
        };
        if let Err(TrySendError::Full(event)) = self.outbox.try_send(event) {
            tracing::trace!(unit_id = %self.id, kind = ?event.kind, "event outbox full, dropping");
        }
    }

    // Command handlers, run only from the unit's own loop.

    fn handle(&self, command: Command) {
        if !self.is_alive() {
            tracing::debug!(unit_id = %self.id, %command, "dead unit ignoring command");
            return;
        }
        tracing::trace!(unit_id = %self.id, %command, "handling command");
        match command.kind {
            CommandKind::Move => match command.destination {
                Some(destination) => self.handle_move(destination),
                None => tracing::warn!(unit_id = %self.id, "move without destination ignored"),
            },
            CommandKind::Attack => self.handle_attack(command.target.as_ref()),
            CommandKind::Stop => {
                self.set_state(UnitState::Idle);
                self.set_target(None);
                self.emit(UnitEventKind::Idle, None, EventPayload::None);
            }
            CommandKind::Hold => {
                self.set_state(UnitState::HoldingPosition);
            }
            CommandKind::Patrol => {
                if command.destination.is_none() {
                    tracing::warn!(unit_id = %self.id, "patrol without destination ignored");
                    return;
                }
                self.set_state(UnitState::Patrolling);
            }
            CommandKind::Defend => {
                self.set_state(UnitState::Defending);
            }
        }
    }

    fn handle_move(&self, destination: Position) {
        if !self.set_state(UnitState::Moving) {
            return;
        }
        let from = {
            let mut combat = self.combat.write();
            std::mem::replace(&mut combat.position, destination)
        };
        self.emit(
            UnitEventKind::Moved,
            None,
            EventPayload::Moved {
                from,
                to: destination,
            },
        );
    }

    fn handle_attack(&self, target: Option<&Arc<Unit>>) {
        let Some(target) = target.filter(|t| t.is_alive()) else {
            tracing::debug!(unit_id = %self.id, "attack with no live target ignored");
            return;
        };
        if !self.set_state(UnitState::Attacking) {
            return;
        }
        self.set_target(Some(target));
        self.strike(target);
    }

    /// Deal one hit to `target`. Emits `Killed` when the hit is lethal.
    pub fn strike(&self, target: &Unit) -> DamageOutcome {
        let amount = self.calculate_damage_against(target);
        let outcome = target.apply_damage(amount, Some(&self.id));
        if outcome.killed {
            self.emit(
                UnitEventKind::Killed,
                Some(target.id.clone()),
                EventPayload::Damage {
                    amount,
                    remaining: 0,
                },
            );
        }
        outcome
    }
}

async fn run_loop(
    id: String,
    unit: Weak<Unit>,
    mut inbox: mpsc::Receiver<Command>,
    cancel: CancelToken,
) {
    tracing::debug!(unit_id = %id, "unit loop started");
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            next = inbox.recv() => {
                let Some(command) = next else { break };
                let Some(unit) = unit.upgrade() else { break };
                unit.handle(command);
            }
        }
    }
    tracing::debug!(unit_id = %id, "unit loop stopped");
}
