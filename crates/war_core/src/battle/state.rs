//! A single battle: roster, objectives and the per-tick systems.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::config::{
    BattleConfig, BattleRules, Environment, Hazard, Objective, ObjectiveKind, MAX_TIME_SCALE,
};
use super::event::{BattleEvent, BattleEventData, BattleEventKind};
use crate::error::{Result, WarError};
use crate::math::{Position, Rect};
use crate::unit::{Command, CommandKind, Unit};
use crate::unit_kind::{UnitKind, UnitState};

/// Battle lifecycle.
///
/// `Preparing -> Active <-> Paused -> {Completed | Cancelled}`; the last two
/// are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BattleState {
    /// Created, not yet started.
    Preparing,
    /// Ticking.
    Active,
    /// Frozen until resumed.
    Paused,
    /// Finished with a result.
    Completed,
    /// Abandoned without a result.
    Cancelled,
}

impl BattleState {
    /// Completed or Cancelled.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Whether `self -> next` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Preparing, Self::Active)
                | (Self::Active, Self::Paused)
                | (Self::Paused, Self::Active)
                | (
                    Self::Preparing | Self::Active | Self::Paused,
                    Self::Completed | Self::Cancelled
                )
        )
    }
}

/// Notable moment recorded by the event handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TacticalEventKind {
    /// A faction fell below half of its peak strength.
    FormationBreak,
    /// A faction completed an objective.
    ObjectiveSecured,
    /// A faction lost its last unit.
    FactionEliminated,
}

/// A tactical moment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TacticalEvent {
    /// What happened.
    pub kind: TacticalEventKind,
    /// Battle time.
    pub timestamp: Duration,
    /// Faction concerned.
    pub faction: String,
    /// Human-readable description.
    pub description: String,
    /// Rough weight on the outcome.
    pub impact: f64,
}

/// Running battle statistics, keyed by faction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BattleStatistics {
    /// Damage dealt by attacks.
    pub damage_dealt: BTreeMap<String, u64>,
    /// Attacks made.
    pub shots_fired: BTreeMap<String, u64>,
    /// Attacks that did damage.
    pub hits: BTreeMap<String, u64>,
    /// Deaths by kind.
    pub units_lost: BTreeMap<String, BTreeMap<UnitKind, u32>>,
    /// Damage dealt by hazards.
    pub hazard_damage: u64,
    /// Tactical moments.
    pub tactical_events: Vec<TacticalEvent>,
}

impl BattleStatistics {
    /// Share of attacks that did damage.
    #[must_use]
    pub fn accuracy(&self, faction: &str) -> f64 {
        let shots = self.shots_fired.get(faction).copied().unwrap_or(0);
        if shots == 0 {
            return 0.0;
        }
        self.hits.get(faction).copied().unwrap_or(0) as f64 / shots as f64
    }

    /// Units lost.
    #[must_use]
    pub fn casualties(&self, faction: &str) -> u32 {
        self.units_lost
            .get(faction)
            .map_or(0, |lost| lost.values().sum())
    }

    /// Damage dealt per unit lost (plus one).
    #[must_use]
    pub fn efficiency(&self, faction: &str) -> f64 {
        let dealt = self.damage_dealt.get(faction).copied().unwrap_or(0) as f64;
        dealt / f64::from(self.casualties(faction) + 1)
    }

    /// Whether a tactical event of `kind` was already recorded for `faction`.
    #[must_use]
    pub fn has_tactical(&self, kind: TacticalEventKind, faction: &str) -> bool {
        self.tactical_events
            .iter()
            .any(|e| e.kind == kind && e.faction == faction)
    }
}

/// Progress on one objective.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectiveStatus {
    /// The objective.
    pub objective: Objective,
    /// 0.0 to 1.0.
    pub progress: f64,
    /// Completed.
    pub completed: bool,
    /// Can no longer be completed.
    pub failed: bool,
    /// Who completed it.
    pub completed_by: Option<String>,
    /// Battle time of completion.
    pub completion_time: Option<Duration>,
    /// Uncontested time in the area so far (HoldPosition).
    pub held: Duration,
}

impl ObjectiveStatus {
    fn new(objective: Objective) -> Self {
        Self {
            objective,
            progress: 0.0,
            completed: false,
            failed: false,
            completed_by: None,
            completion_time: None,
            held: Duration::ZERO,
        }
    }

    /// Completed or failed.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.completed || self.failed
    }
}

/// Final outcome of a completed battle. Produced once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BattleResult {
    /// Battle id.
    pub battle_id: String,
    /// Winning faction; `None` for a draw.
    pub winner: Option<String>,
    /// Battle time.
    pub duration: Duration,
    /// Units lost per faction.
    pub casualties: BTreeMap<String, u32>,
    /// Units alive per faction at the end.
    pub survivors: BTreeMap<String, u32>,
    /// Statistics at completion.
    pub statistics: BattleStatistics,
    /// Objective outcomes.
    pub objectives: Vec<ObjectiveStatus>,
    /// Event log up to completion.
    pub events: Vec<BattleEvent>,
    /// Why the battle ended.
    pub reason: String,
}

/// Point-in-time view of a battle.
#[derive(Debug, Clone, PartialEq)]
pub struct BattleStatus {
    /// Battle id.
    pub id: String,
    /// State.
    pub state: BattleState,
    /// Battle time so far.
    pub duration: Duration,
    /// Unit ids by faction.
    pub participants: BTreeMap<String, Vec<String>>,
    /// Living units by faction.
    pub alive: BTreeMap<String, usize>,
    /// Objective progress.
    pub objectives: Vec<ObjectiveStatus>,
    /// Most recent processed event.
    pub last_event: Option<BattleEvent>,
    /// Statistics so far.
    pub statistics: BattleStatistics,
}

/// What one tick produced.
#[derive(Debug, Default)]
pub(crate) struct TickOutcome {
    pub events: Vec<BattleEvent>,
    pub result: Option<BattleResult>,
    pub paused: bool,
}

enum Verdict {
    Pending,
    Completed(String),
    Failed,
}

struct Judgement {
    progress: f64,
    held: Duration,
    verdict: Verdict,
}

/// Battle state. Mutated by the simulator's tick loop and by event handlers.
#[derive(Debug)]
pub struct Battle {
    id: String,
    state: BattleState,
    battlefield: Rect,
    objectives: Vec<ObjectiveStatus>,
    time_limit: Option<Duration>,
    environment: Environment,
    rules: BattleRules,
    factions: BTreeMap<String, Vec<Arc<Unit>>>,
    membership: HashMap<String, String>,
    peak_strength: BTreeMap<String, usize>,
    elapsed: Duration,
    pending: Vec<(String, Command)>,
    orders: HashMap<String, Position>,
    cooldowns: HashMap<String, Duration>,
    hazard_timers: Vec<Duration>,
    statistics: BattleStatistics,
    last_event: Option<BattleEvent>,
    end_reason: Option<String>,
    winner: Option<String>,
}

impl Battle {
    /// Validate `config` and build a battle in `Preparing`.
    pub(crate) fn new(id: String, config: BattleConfig) -> Result<Self> {
        if config.battlefield.is_degenerate() {
            return Err(WarError::InvalidArgument(format!(
                "degenerate battlefield {:?}",
                config.battlefield
            )));
        }
        if config.factions.len() < 2 {
            return Err(WarError::InvalidArgument(
                "a battle needs at least two factions".into(),
            ));
        }
        if let Some((name, _)) = config.factions.iter().find(|(_, units)| units.is_empty()) {
            return Err(WarError::InvalidArgument(format!("faction {name} has no units")));
        }
        if !(config.rules.time_scale > 0.0 && config.rules.time_scale <= MAX_TIME_SCALE) {
            return Err(WarError::InvalidArgument(format!(
                "time scale must be in (0, {MAX_TIME_SCALE}], got {}",
                config.rules.time_scale
            )));
        }
        if config.environment.hazards.iter().any(|h| h.interval.is_zero()) {
            return Err(WarError::InvalidArgument("hazard interval must be non-zero".into()));
        }

        let mut membership = HashMap::new();
        for (faction, units) in &config.factions {
            for unit in units {
                if membership.insert(unit.id().to_owned(), faction.clone()).is_some() {
                    return Err(WarError::InvalidArgument(format!(
                        "unit {} appears more than once",
                        unit.id()
                    )));
                }
            }
        }

        let objectives = if config.objectives.is_empty() {
            vec![Objective::new(ObjectiveKind::EliminateAll)]
        } else {
            config.objectives
        };
        for objective in &objectives {
            if let Some(faction) = &objective.faction {
                if !config.factions.contains_key(faction) {
                    return Err(WarError::InvalidArgument(format!(
                        "objective {} names unknown faction {faction}",
                        objective.description
                    )));
                }
            } else if objective.kind.needs_faction() {
                return Err(WarError::InvalidArgument(format!(
                    "objective {} needs a faction",
                    objective.description
                )));
            }
            match &objective.kind {
                ObjectiveKind::DestroyTarget { unit_id } | ObjectiveKind::EscortUnit { unit_id, .. }
                    if !membership.contains_key(unit_id) =>
                {
                    return Err(WarError::InvalidArgument(format!(
                        "objective {} names unknown unit {unit_id}",
                        objective.description
                    )));
                }
                _ => {}
            }
        }

        let peak_strength = config
            .factions
            .iter()
            .map(|(name, units)| (name.clone(), units.len()))
            .collect();
        let hazard_timers = vec![Duration::ZERO; config.environment.hazards.len()];
        Ok(Self {
            id,
            state: BattleState::Preparing,
            battlefield: config.battlefield,
            objectives: objectives.into_iter().map(ObjectiveStatus::new).collect(),
            time_limit: config.time_limit,
            environment: config.environment,
            rules: config.rules,
            factions: config.factions,
            membership,
            peak_strength,
            elapsed: Duration::ZERO,
            pending: Vec::new(),
            orders: HashMap::new(),
            cooldowns: HashMap::new(),
            hazard_timers,
            statistics: BattleStatistics::default(),
            last_event: None,
            end_reason: None,
            winner: None,
        })
    }

    // Accessors

    /// Battle id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> BattleState {
        self.state
    }

    /// Battle time so far.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Battle area.
    #[must_use]
    pub fn battlefield(&self) -> Rect {
        self.battlefield
    }

    /// Rules.
    #[must_use]
    pub fn rules(&self) -> &BattleRules {
        &self.rules
    }

    /// Environment.
    #[must_use]
    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    /// Replace the environment's weather and terrain, keeping hazards.
    pub fn set_conditions(&mut self, weather: super::Weather, terrain: super::Terrain) {
        self.environment.weather = weather;
        self.environment.terrain = terrain;
    }

    /// Objective progress.
    #[must_use]
    pub fn objectives(&self) -> &[ObjectiveStatus] {
        &self.objectives
    }

    /// Faction names.
    pub fn faction_names(&self) -> impl Iterator<Item = &str> {
        self.factions.keys().map(String::as_str)
    }

    /// Units of `faction`, dead ones included.
    #[must_use]
    pub fn units(&self, faction: &str) -> &[Arc<Unit>] {
        self.factions.get(faction).map_or(&[], Vec::as_slice)
    }

    /// A participating unit.
    #[must_use]
    pub fn unit(&self, id: &str) -> Option<&Arc<Unit>> {
        let faction = self.membership.get(id)?;
        self.factions.get(faction)?.iter().find(|u| u.id() == id)
    }

    /// Faction a unit fights for.
    #[must_use]
    pub fn faction_of(&self, unit_id: &str) -> Option<&str> {
        self.membership.get(unit_id).map(String::as_str)
    }

    /// Living units of `faction`.
    #[must_use]
    pub fn alive_count(&self, faction: &str) -> usize {
        self.units(faction).iter().filter(|u| u.is_alive()).count()
    }

    /// Largest number of units `faction` has had.
    #[must_use]
    pub fn peak_strength(&self, faction: &str) -> usize {
        self.peak_strength.get(faction).copied().unwrap_or(0)
    }

    /// Factions with at least one living unit, sorted.
    #[must_use]
    pub fn living_factions(&self) -> Vec<&str> {
        self.factions
            .iter()
            .filter(|(_, units)| units.iter().any(|u| u.is_alive()))
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Statistics so far.
    #[must_use]
    pub fn statistics(&self) -> &BattleStatistics {
        &self.statistics
    }

    /// Mutable statistics, for event handlers.
    pub fn statistics_mut(&mut self) -> &mut BattleStatistics {
        &mut self.statistics
    }

    /// Most recent processed event.
    #[must_use]
    pub fn last_event(&self) -> Option<&BattleEvent> {
        self.last_event.as_ref()
    }

    pub(crate) fn set_last_event(&mut self, event: BattleEvent) {
        self.last_event = Some(event);
    }

    /// Winning faction once decided.
    #[must_use]
    pub fn winner(&self) -> Option<&str> {
        self.winner.as_deref()
    }

    /// Why the battle ended.
    #[must_use]
    pub fn end_reason(&self) -> Option<&str> {
        self.end_reason.as_deref()
    }

    // Lifecycle

    pub(crate) fn transition(&mut self, next: BattleState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(WarError::InvalidState(format!(
                "battle {} cannot go from {:?} to {:?}",
                self.id, self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }

    /// Add units to `faction`, creating the faction if needed.
    pub(crate) fn join(&mut self, faction: &str, units: Vec<Arc<Unit>>) -> Result<usize> {
        match self.state {
            BattleState::Preparing => {}
            BattleState::Active | BattleState::Paused if self.rules.reinforcements => {}
            state => {
                return Err(WarError::InvalidState(format!(
                    "battle {} is {state:?} and not accepting units",
                    self.id
                )));
            }
        }
        if faction.trim().is_empty() {
            return Err(WarError::InvalidArgument("faction name is empty".into()));
        }
        if units.is_empty() {
            return Err(WarError::InvalidArgument("no units to join".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for unit in &units {
            if self.membership.contains_key(unit.id()) || !seen.insert(unit.id()) {
                return Err(WarError::already_exists("battle participant", unit.id()));
            }
        }
        let count = units.len();
        for unit in &units {
            self.membership.insert(unit.id().to_owned(), faction.to_owned());
        }
        self.factions.entry(faction.to_owned()).or_default().extend(units);
        let alive = self.alive_count(faction);
        let peak = self.peak_strength.entry(faction.to_owned()).or_insert(0);
        *peak = (*peak).max(alive);
        Ok(count)
    }

    /// Queue an order for the next tick.
    pub(crate) fn queue(&mut self, unit_id: &str, command: Command) -> Result<()> {
        if self.state.is_terminal() {
            return Err(WarError::InvalidState(format!("battle {} is over", self.id)));
        }
        if !self.membership.contains_key(unit_id) {
            return Err(WarError::not_found("battle participant", unit_id));
        }
        self.pending.push((unit_id.to_owned(), command));
        Ok(())
    }

    /// Move to a terminal state. Returns the result when completing.
    pub(crate) fn finish(&mut self, state: BattleState, reason: &str) -> Result<Option<BattleResult>> {
        self.transition(state)?;
        self.end_reason = Some(reason.to_owned());
        self.pending.clear();
        self.orders.clear();
        if state != BattleState::Completed {
            return Ok(None);
        }
        self.winner = self.standings_leader();
        let factions: Vec<_> = self.factions.keys().cloned().collect();
        let casualties = factions
            .iter()
            .map(|f| (f.clone(), self.statistics.casualties(f)))
            .collect();
        let survivors = factions
            .iter()
            .map(|f| (f.clone(), self.alive_count(f) as u32))
            .collect();
        Ok(Some(BattleResult {
            battle_id: self.id.clone(),
            winner: self.winner.clone(),
            duration: self.elapsed,
            casualties,
            survivors,
            statistics: self.statistics.clone(),
            objectives: self.objectives.clone(),
            events: Vec::new(),
            reason: reason.to_owned(),
        }))
    }

    /// Objective points first, then living units. Ties are draws.
    fn standings_leader(&self) -> Option<String> {
        let mut points: BTreeMap<&str, u32> = self.factions.keys().map(|f| (f.as_str(), 0)).collect();
        for status in self.objectives.iter().filter(|s| s.completed) {
            if let Some(by) = &status.completed_by {
                *points.entry(by.as_str()).or_insert(0) += status.objective.points;
            }
        }
        if let Some(leader) = unique_max(points.iter().map(|(f, p)| (*f, u64::from(*p)))) {
            return Some(leader.to_owned());
        }
        unique_max(
            self.factions
                .keys()
                .map(|f| (f.as_str(), self.alive_count(f) as u64)),
        )
        .map(str::to_owned)
    }

    /// Point-in-time status.
    #[must_use]
    pub fn status(&self) -> BattleStatus {
        BattleStatus {
            id: self.id.clone(),
            state: self.state,
            duration: self.elapsed,
            participants: self
                .factions
                .iter()
                .map(|(f, units)| (f.clone(), units.iter().map(|u| u.id().to_owned()).collect()))
                .collect(),
            alive: self
                .factions
                .keys()
                .map(|f| (f.clone(), self.alive_count(f)))
                .collect(),
            objectives: self.objectives.clone(),
            last_event: self.last_event.clone(),
            statistics: self.statistics.clone(),
        }
    }

    // Tick systems

    /// Advance the battle by `dt` of simulated time.
    ///
    /// Systems run in this order:
    /// 1. Queued orders
    /// 2. Engagement (targeting, movement, attacks)
    /// 3. Hazards
    /// 4. Objectives
    /// 5. Completion (all objectives resolved, one faction left, time limit)
    pub(crate) fn tick(&mut self, dt: Duration, now: Duration) -> TickOutcome {
        let mut outcome = TickOutcome::default();
        if self.state != BattleState::Active {
            return outcome;
        }
        let dt = Duration::try_from_secs_f64(dt.as_secs_f64() * self.rules.time_scale)
            .unwrap_or(Duration::MAX);
        self.elapsed = self.elapsed.saturating_add(dt);

        self.apply_orders();
        self.engage(dt, now, &mut outcome.events);
        self.apply_hazards(dt, now, &mut outcome.events);
        let completed_objective = self.evaluate_objectives(dt, now, &mut outcome.events);

        if let Some(reason) = self.completion_reason() {
            match self.finish(BattleState::Completed, &reason) {
                Ok(result) => outcome.result = result,
                Err(e) => tracing::error!(battle_id = %self.id, error = %e, "failed to complete battle"),
            }
        } else if completed_objective && self.rules.pause_on_objective {
            self.state = BattleState::Paused;
            outcome.paused = true;
        }
        outcome
    }

    fn event(&self, kind: BattleEventKind, now: Duration) -> BattleEvent {
        BattleEvent::new(kind, self.id.clone(), now)
    }

    fn roster(&self) -> Vec<(String, Arc<Unit>)> {
        self.factions
            .iter()
            .flat_map(|(f, units)| units.iter().map(move |u| (f.clone(), Arc::clone(u))))
            .collect()
    }

    fn apply_orders(&mut self) {
        for (unit_id, command) in std::mem::take(&mut self.pending) {
            let Some(unit) = self.unit(&unit_id).cloned() else {
                continue;
            };
            if !unit.is_alive() {
                tracing::debug!(battle_id = %self.id, unit_id = %unit_id, "order for dead unit dropped");
                continue;
            }
            match command.kind {
                CommandKind::Move | CommandKind::Patrol => {
                    let Some(destination) = command.destination else {
                        continue;
                    };
                    self.orders
                        .insert(unit_id, self.battlefield.clamp(destination));
                    unit.set_target(None);
                    unit.set_state(if command.kind == CommandKind::Move {
                        UnitState::Moving
                    } else {
                        UnitState::Patrolling
                    });
                }
                CommandKind::Attack => {
                    let Some(target) = command.target.filter(|t| t.is_alive()) else {
                        continue;
                    };
                    let same_side = self.faction_of(target.id()) == self.faction_of(&unit_id);
                    if self.faction_of(target.id()).is_none() || (same_side && !self.rules.friendly_fire) {
                        tracing::warn!(
                            battle_id = %self.id,
                            unit_id = %unit_id,
                            target = %target.id(),
                            "attack order rejected"
                        );
                        continue;
                    }
                    self.orders.remove(&unit_id);
                    unit.set_target(Some(&target));
                    unit.set_state(UnitState::Attacking);
                }
                CommandKind::Stop => {
                    self.orders.remove(&unit_id);
                    unit.set_target(None);
                    unit.set_state(UnitState::Idle);
                }
                CommandKind::Hold => {
                    self.orders.remove(&unit_id);
                    unit.set_state(UnitState::HoldingPosition);
                }
                CommandKind::Defend => {
                    self.orders.remove(&unit_id);
                    unit.set_state(UnitState::Defending);
                }
            }
        }
    }

    fn nearest_enemy(&self, faction: &str, from: Position) -> Option<Arc<Unit>> {
        self.factions
            .iter()
            .filter(|(f, _)| f.as_str() != faction)
            .flat_map(|(_, units)| units.iter())
            .filter(|u| u.is_alive())
            .min_by(|a, b| {
                from.distance_sq(a.position())
                    .total_cmp(&from.distance_sq(b.position()))
                    .then_with(|| a.id().cmp(b.id()))
            })
            .cloned()
    }

    fn move_unit(&self, unit: &Unit, to: Position, now: Duration, events: &mut Vec<BattleEvent>) {
        let from = unit.position();
        let to = self.battlefield.clamp(to);
        if from == to {
            return;
        }
        unit.set_position(to);
        events.push(
            self.event(BattleEventKind::UnitMoved, now)
                .with_actors([unit.id()])
                .with_data(BattleEventData::Movement { from, to }),
        );
    }

    fn engage(&mut self, dt: Duration, now: Duration, events: &mut Vec<BattleEvent>) {
        let speed_factor = self.environment.speed_factor();
        let range_factor = self.environment.range_factor();
        for (faction, unit) in self.roster() {
            if !unit.is_alive() {
                continue;
            }
            let step = unit.speed() * dt.as_secs_f64() * speed_factor;
            let ready = {
                let cooldown = self.cooldowns.entry(unit.id().to_owned()).or_default();
                *cooldown = cooldown.saturating_sub(dt);
                cooldown.is_zero()
            };

            if let Some(&destination) = self.orders.get(unit.id()) {
                let next = unit.position().step_towards(destination, step);
                self.move_unit(&unit, next, now, events);
                if next == destination {
                    self.orders.remove(unit.id());
                    unit.set_state(UnitState::Idle);
                }
                continue;
            }

            let target = match unit.live_target().filter(|t| self.membership.contains_key(t.id())) {
                Some(target) => target,
                None => match self.nearest_enemy(&faction, unit.position()) {
                    Some(target) => {
                        unit.set_target(Some(&target));
                        target
                    }
                    None => continue,
                },
            };

            let range = unit.attack_range() * range_factor;
            let distance = unit.position().distance(target.position());
            if distance <= range {
                if ready {
                    self.attack(&faction, &unit, &target, now, events);
                    self.cooldowns
                        .insert(unit.id().to_owned(), self.rules.attack_interval);
                }
            } else if unit.state() != UnitState::HoldingPosition {
                let travel = (distance - range).min(step);
                let next = unit.position().step_towards(target.position(), travel);
                unit.set_state(UnitState::Attacking);
                self.move_unit(&unit, next, now, events);
            }
        }
    }

    fn attack(
        &mut self,
        faction: &str,
        attacker: &Unit,
        target: &Arc<Unit>,
        now: Duration,
        events: &mut Vec<BattleEvent>,
    ) {
        attacker.set_state(UnitState::Attacking);
        let damage = attacker.calculate_damage_against(target);
        let outcome = attacker.strike(target);

        *self.statistics.shots_fired.entry(faction.to_owned()).or_insert(0) += 1;
        events.push(
            self.event(BattleEventKind::UnitAttacked, now)
                .with_actors([attacker.id(), target.id()])
                .with_data(BattleEventData::Attack { damage }),
        );
        if damage > 0 {
            *self.statistics.hits.entry(faction.to_owned()).or_insert(0) += 1;
            *self.statistics.damage_dealt.entry(faction.to_owned()).or_insert(0) += u64::from(damage);
            events.push(
                self.event(BattleEventKind::UnitTookDamage, now)
                    .with_actors([target.id(), attacker.id()])
                    .with_data(BattleEventData::Damage {
                        amount: damage,
                        remaining: outcome.health,
                    }),
            );
        }
        if outcome.killed {
            events.push(self.record_death(target, Some(attacker.id()), now));
        }
    }

    fn record_death(&mut self, unit: &Unit, killer: Option<&str>, now: Duration) -> BattleEvent {
        let faction = self.faction_of(unit.id()).unwrap_or_default().to_owned();
        *self
            .statistics
            .units_lost
            .entry(faction.clone())
            .or_default()
            .entry(unit.kind())
            .or_insert(0) += 1;
        self.orders.remove(unit.id());
        tracing::debug!(battle_id = %self.id, unit_id = %unit.id(), faction = %faction, "unit destroyed");
        let mut actors = vec![unit.id().to_owned()];
        actors.extend(killer.map(str::to_owned));
        self.event(BattleEventKind::UnitDestroyed, now)
            .with_actors(actors)
            .with_data(BattleEventData::Destroyed {
                faction,
                kind: unit.kind(),
            })
    }

    fn apply_hazards(&mut self, dt: Duration, now: Duration, events: &mut Vec<BattleEvent>) {
        for index in 0..self.hazard_timers.len() {
            let hazard: Hazard = self.environment.hazards[index].clone();
            self.hazard_timers[index] += dt;
            if self.hazard_timers[index] < hazard.interval {
                continue;
            }
            self.hazard_timers[index] -= hazard.interval;

            let victims: Vec<_> = self
                .roster()
                .into_iter()
                .map(|(_, u)| u)
                .filter(|u| {
                    u.is_alive() && hazard.area.contains(u.position()) && hazard.kind.affects(u.elevation())
                })
                .collect();
            for unit in &victims {
                let outcome = unit.apply_damage(hazard.damage, None);
                self.statistics.hazard_damage += u64::from(hazard.damage);
                events.push(
                    self.event(BattleEventKind::UnitTookDamage, now)
                        .with_actors([unit.id()])
                        .with_data(BattleEventData::Damage {
                            amount: hazard.damage,
                            remaining: outcome.health,
                        }),
                );
                if outcome.killed {
                    events.push(self.record_death(unit, None, now));
                }
            }
            events.push(
                self.event(BattleEventKind::HazardTriggered, now)
                    .with_actors(victims.iter().map(|u| u.id().to_owned()))
                    .with_data(BattleEventData::Hazard {
                        kind: hazard.kind,
                        affected: victims.len(),
                    }),
            );
        }
    }

    fn occupants(&self, area: &Rect) -> Vec<&str> {
        self.factions
            .iter()
            .filter(|(_, units)| units.iter().any(|u| u.is_alive() && area.contains(u.position())))
            .map(|(f, _)| f.as_str())
            .collect()
    }

    fn judge(&self, status: &ObjectiveStatus, dt: Duration) -> Judgement {
        let alive = self.living_factions();
        let owner = status.objective.faction.as_deref();
        let owner_dead = owner.is_some_and(|f| !alive.contains(&f));
        let mut held = status.held;

        let (progress, verdict) = match &status.objective.kind {
            ObjectiveKind::EliminateAll => {
                let total = self.factions.len().saturating_sub(1).max(1) as f64;
                let eliminated = (self.factions.len() - alive.len()) as f64;
                let progress = (eliminated / total).min(1.0);
                match (owner, alive.as_slice()) {
                    (_, []) => (progress, Verdict::Failed),
                    (Some(_), _) if owner_dead => (progress, Verdict::Failed),
                    (None, [last]) => (1.0, Verdict::Completed((*last).to_owned())),
                    (Some(f), [last]) if *last == f => (1.0, Verdict::Completed(f.to_owned())),
                    _ => (progress, Verdict::Pending),
                }
            }
            ObjectiveKind::SurviveTime { duration } => {
                let progress = ratio(self.elapsed, *duration);
                match owner {
                    _ if owner_dead => (progress, Verdict::Failed),
                    Some(f) if self.elapsed >= *duration => (1.0, Verdict::Completed(f.to_owned())),
                    _ => (progress, Verdict::Pending),
                }
            }
            ObjectiveKind::HoldPosition { area, duration } => {
                let occupants = self.occupants(area);
                held = match (owner, occupants.as_slice()) {
                    (Some(f), [only]) if *only == f => held + dt,
                    _ => Duration::ZERO,
                };
                let progress = ratio(held, *duration);
                match owner {
                    _ if owner_dead => (progress, Verdict::Failed),
                    Some(f) if held >= *duration => (1.0, Verdict::Completed(f.to_owned())),
                    _ => (progress, Verdict::Pending),
                }
            }
            ObjectiveKind::CaptureArea { area } => match self.occupants(area).as_slice() {
                _ if owner_dead => (0.0, Verdict::Failed),
                [only] if owner.map_or(true, |f| f == *only) => {
                    (1.0, Verdict::Completed((*only).to_owned()))
                }
                _ => (0.0, Verdict::Pending),
            },
            ObjectiveKind::DestroyTarget { unit_id } => match self.unit(unit_id) {
                Some(target) if target.is_alive() => {
                    let health = f64::from(target.health()) / f64::from(target.max_health().max(1));
                    let verdict = if owner_dead { Verdict::Failed } else { Verdict::Pending };
                    (1.0 - health, verdict)
                }
                _ => {
                    let target_side = self.faction_of(unit_id);
                    let by = owner.map(str::to_owned).or_else(|| {
                        self.factions
                            .keys()
                            .map(String::as_str)
                            .filter(|f| Some(*f) != target_side)
                            .find(|f| alive.contains(f))
                            .map(str::to_owned)
                    });
                    match by {
                        Some(by) => (1.0, Verdict::Completed(by)),
                        None => (1.0, Verdict::Failed),
                    }
                }
            },
            ObjectiveKind::EscortUnit {
                unit_id,
                destination,
            } => match self.unit(unit_id) {
                Some(escorted) if escorted.is_alive() => {
                    if destination.contains(escorted.position()) {
                        let by = owner
                            .or_else(|| self.faction_of(unit_id))
                            .unwrap_or_default()
                            .to_owned();
                        (1.0, Verdict::Completed(by))
                    } else {
                        (0.0, Verdict::Pending)
                    }
                }
                _ => (0.0, Verdict::Failed),
            },
        };

        let verdict = match (verdict, status.objective.time_limit) {
            (Verdict::Pending, Some(limit)) if self.elapsed >= limit => Verdict::Failed,
            (verdict, _) => verdict,
        };
        Judgement {
            progress,
            held,
            verdict,
        }
    }

    fn evaluate_objectives(&mut self, dt: Duration, now: Duration, events: &mut Vec<BattleEvent>) -> bool {
        let mut completed_any = false;
        for index in 0..self.objectives.len() {
            if self.objectives[index].is_resolved() {
                continue;
            }
            let judgement = self.judge(&self.objectives[index], dt);
            let elapsed = self.elapsed;
            let status = &mut self.objectives[index];
            status.progress = judgement.progress.clamp(0.0, 1.0);
            status.held = judgement.held;
            match judgement.verdict {
                Verdict::Pending => {}
                Verdict::Failed => {
                    status.failed = true;
                    tracing::debug!(battle_id = %self.id, objective = %status.objective.description, "objective failed");
                }
                Verdict::Completed(faction) => {
                    status.completed = true;
                    status.progress = 1.0;
                    status.completed_by = Some(faction.clone());
                    status.completion_time = Some(elapsed);
                    let points = status.objective.points;
                    tracing::info!(
                        battle_id = %self.id,
                        objective = %status.objective.description,
                        faction = %faction,
                        "objective completed"
                    );
                    events.push(
                        self.event(BattleEventKind::ObjectiveCaptured, now)
                            .with_data(BattleEventData::Objective {
                                index,
                                faction,
                                points,
                            }),
                    );
                    completed_any = true;
                }
            }
        }
        completed_any
    }

    fn completion_reason(&self) -> Option<String> {
        if self.objectives.iter().all(ObjectiveStatus::is_resolved) {
            return Some("all objectives resolved".into());
        }
        match self.living_factions().as_slice() {
            [] => return Some("all factions eliminated".into()),
            [last] => return Some(format!("{last} is the last faction standing")),
            _ => {}
        }
        match self.time_limit {
            Some(limit) if self.elapsed >= limit => Some("time limit reached".into()),
            _ => None,
        }
    }
}

fn ratio(part: Duration, whole: Duration) -> f64 {
    if whole.is_zero() {
        return 1.0;
    }
    (part.as_secs_f64() / whole.as_secs_f64()).min(1.0)
}

fn unique_max<'a>(scores: impl Iterator<Item = (&'a str, u64)>) -> Option<&'a str> {
    let mut best: Option<(&str, u64)> = None;
    let mut tied = false;
    for (name, score) in scores {
        match best {
            Some((_, top)) if score < top => {}
            Some((_, top)) if score == top => tied = true,
            _ => {
                best = Some((name, score));
                tied = false;
            }
        }
    }
    match best {
        Some((name, score)) if score > 0 && !tied => Some(name),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::battle::config::HazardKind;
    use crate::config::UnitConfig;
    use crate::lifecycle::CancelToken;

    const TICK: Duration = Duration::from_millis(100);

    fn unit(id: &str, kind: UnitKind, x: f64) -> Arc<Unit> {
        Unit::new(id, kind, Position::new(x, 0.0), &UnitConfig::default(), &CancelToken::new())
    }

    fn battle(config: BattleConfig) -> Battle {
        let mut battle = Battle::new("b".into(), config).unwrap();
        battle.transition(BattleState::Active).unwrap();
        battle
    }

    fn run(battle: &mut Battle, ticks: usize) -> Vec<BattleEvent> {
        let mut events = Vec::new();
        for i in 0..ticks {
            let outcome = battle.tick(TICK, TICK * (i as u32 + 1));
            events.extend(outcome.events);
            if battle.state().is_terminal() {
                break;
            }
        }
        events
    }

    #[test]
    fn test_state_machine() {
        use BattleState::*;
        assert!(Preparing.can_transition_to(Active));
        assert!(Active.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Active));
        assert!(Paused.can_transition_to(Cancelled));
        assert!(!Preparing.can_transition_to(Paused));
        assert!(!Completed.can_transition_to(Active));
        assert!(!Cancelled.can_transition_to(Completed));
    }

    #[test]
    fn test_validation() {
        let field = Rect::sized(50.0, 50.0);
        let one_side = BattleConfig::new(field).with_faction("a", vec![unit("a1", UnitKind::Marine, 0.0)]);
        assert!(matches!(Battle::new("x".into(), one_side), Err(WarError::InvalidArgument(_))));

        let empty_side = BattleConfig::attackers_vs_defenders(vec![unit("a1", UnitKind::Marine, 0.0)], vec![], field);
        assert!(Battle::new("x".into(), empty_side).is_err());

        let degenerate = BattleConfig::attackers_vs_defenders(
            vec![unit("a1", UnitKind::Marine, 0.0)],
            vec![unit("d1", UnitKind::Marine, 0.0)],
            Rect::sized(0.0, 10.0),
        );
        assert!(Battle::new("x".into(), degenerate).is_err());

        let shared = unit("s", UnitKind::Marine, 0.0);
        let duplicate = BattleConfig::attackers_vs_defenders(vec![Arc::clone(&shared)], vec![shared], field);
        assert!(Battle::new("x".into(), duplicate).is_err());

        let unowned_survival = BattleConfig::attackers_vs_defenders(
            vec![unit("a1", UnitKind::Marine, 0.0)],
            vec![unit("d1", UnitKind::Marine, 0.0)],
            field,
        )
        .with_objective(Objective::new(ObjectiveKind::SurviveTime {
            duration: Duration::from_secs(5),
        }));
        assert!(Battle::new("x".into(), unowned_survival).is_err());

        for scale in [0.0, -1.0, f64::NAN, f64::INFINITY, 1e300, MAX_TIME_SCALE * 2.0] {
            let mut config = BattleConfig::attackers_vs_defenders(
                vec![unit("a1", UnitKind::Marine, 0.0)],
                vec![unit("d1", UnitKind::Marine, 0.0)],
                field,
            );
            config.rules.time_scale = scale;
            assert!(
                matches!(Battle::new("x".into(), config), Err(WarError::InvalidArgument(_))),
                "time scale {scale} accepted"
            );
        }
    }

    #[test]
    fn test_max_time_scale_ticks() {
        let mut config = BattleConfig::attackers_vs_defenders(
            vec![unit("a1", UnitKind::Marine, 0.0)],
            vec![unit("d1", UnitKind::Marine, 40.0)],
            Rect::sized(50.0, 50.0),
        );
        config.rules.time_scale = MAX_TIME_SCALE;
        let mut battle = battle(config);
        battle.tick(Duration::from_secs(1), Duration::from_secs(1));
        assert_eq!(battle.elapsed(), Duration::from_secs(1000));
    }

    #[test]
    fn test_marines_close_and_kill_zergling() {
        let marine = unit("m1", UnitKind::Marine, 0.0);
        let zergling = unit("z1", UnitKind::Zergling, 10.0);
        let mut battle = battle(BattleConfig::attackers_vs_defenders(
            vec![Arc::clone(&marine)],
            vec![Arc::clone(&zergling)],
            Rect::sized(20.0, 20.0),
        ));
        let events = run(&mut battle, 600);

        assert_eq!(battle.state(), BattleState::Completed);
        assert!(events.iter().any(|e| e.kind == BattleEventKind::UnitMoved));
        assert!(events.iter().any(|e| e.kind == BattleEventKind::UnitDestroyed));
        assert!(events.iter().any(|e| e.kind == BattleEventKind::ObjectiveCaptured));
        let stats = battle.statistics();
        assert_eq!(stats.casualties("attackers") + stats.casualties("defenders"), 1);
        assert!(battle.winner().is_some());
    }

    #[test]
    fn test_attack_cooldown() {
        let marine = unit("m1", UnitKind::Marine, 0.0);
        let ultra = unit("u1", UnitKind::Ultralisk, 3.0);
        let mut battle = battle(
            BattleConfig::attackers_vs_defenders(vec![marine], vec![ultra], Rect::sized(20.0, 20.0))
                .with_time_limit(Duration::from_millis(1500)),
        );
        // Out of its own reach, the ultralisk never strikes back.
        battle.queue("u1", Command::hold()).unwrap();
        let events = run(&mut battle, 20);
        let marine_shots = events
            .iter()
            .filter(|e| e.kind == BattleEventKind::UnitAttacked && e.actors[0] == "m1")
            .count();
        // t = 0.1s and t = 1.1s
        assert_eq!(marine_shots, 2);
        assert_eq!(battle.end_reason(), Some("time limit reached"));
    }

    #[test]
    fn test_hazard_hits_ground_not_air() {
        let marine = unit("m1", UnitKind::Marine, 5.0);
        let wraith = unit("w1", UnitKind::Wraith, 5.0);
        let far = unit("f1", UnitKind::Marine, 95.0);
        let far2 = unit("f2", UnitKind::Marine, 95.0);
        let config = BattleConfig::new(Rect::sized(100.0, 10.0))
            .with_faction("a", vec![Arc::clone(&marine), Arc::clone(&wraith)])
            .with_faction("b", vec![far, far2])
            .with_objective(
                Objective::new(ObjectiveKind::SurviveTime {
                    duration: Duration::from_secs(60),
                })
                .for_faction("a"),
            )
            .with_rules(BattleRules {
                attack_interval: Duration::from_secs(3600),
                ..BattleRules::default()
            })
            .with_environment(Environment {
                hazards: vec![Hazard {
                    kind: HazardKind::Artillery,
                    area: Rect::new(Position::new(0.0, -5.0), Position::new(10.0, 5.0)),
                    damage: 10,
                    interval: Duration::from_millis(500),
                }],
                ..Environment::default()
            });
        let mut battle = battle(config);
        // Hold everyone in place.
        for id in ["m1", "w1", "f1", "f2"] {
            battle.queue(id, Command::hold()).unwrap();
        }
        let events = run(&mut battle, 5);
        assert_eq!(marine.health(), 30);
        assert_eq!(wraith.health(), wraith.max_health());
        assert_eq!(
            events
                .iter()
                .filter(|e| e.kind == BattleEventKind::HazardTriggered)
                .count(),
            1
        );
    }

    #[test]
    fn test_escort_and_destroy_objectives() {
        let scv = unit("scv", UnitKind::Scv, 0.0);
        let guard = unit("g1", UnitKind::Zealot, 90.0);
        let config = BattleConfig::new(Rect::sized(100.0, 10.0))
            .with_faction("terran", vec![Arc::clone(&scv)])
            .with_faction("protoss", vec![guard])
            .with_objective(Objective::new(ObjectiveKind::EscortUnit {
                unit_id: "scv".into(),
                destination: Rect::new(Position::new(4.0, -1.0), Position::new(6.0, 1.0)),
            }))
            .with_objective(Objective::new(ObjectiveKind::DestroyTarget {
                unit_id: "scv".into(),
            }).within(Duration::from_secs(30)));
        let mut battle = battle(config);
        battle.queue("scv", Command::move_to(Position::new(5.0, 0.0))).unwrap();
        battle.queue("g1", Command::hold()).unwrap();
        run(&mut battle, 40);

        let escort = &battle.objectives()[0];
        assert!(escort.completed);
        assert_eq!(escort.completed_by.as_deref(), Some("terran"));
        assert!(!battle.objectives()[1].is_resolved());
    }

    #[test]
    fn test_hold_position_resets_when_contested() {
        let a = unit("a1", UnitKind::Marine, 1.0);
        let b = unit("b1", UnitKind::Marine, 80.0);
        let area = Rect::new(Position::new(0.0, -2.0), Position::new(2.0, 2.0));
        let config = BattleConfig::new(Rect::sized(100.0, 10.0))
            .with_faction("a", vec![a])
            .with_faction("b", vec![b])
            .with_objective(
                Objective::new(ObjectiveKind::HoldPosition {
                    area,
                    duration: Duration::from_secs(1),
                })
                .for_faction("a")
                .worth(5),
            )
            .with_time_limit(Duration::from_secs(60));
        let mut battle = battle(config);
        battle.queue("a1", Command::hold()).unwrap();
        battle.queue("b1", Command::hold()).unwrap();
        run(&mut battle, 5);
        assert!((battle.objectives()[0].progress - 0.5).abs() < 1e-9);
        run(&mut battle, 6);
        assert_eq!(battle.state(), BattleState::Completed);
        assert_eq!(battle.winner(), Some("a"));
    }

    #[test]
    fn test_join_rules() {
        let config = BattleConfig::attackers_vs_defenders(
            vec![unit("a1", UnitKind::Marine, 0.0)],
            vec![unit("d1", UnitKind::Marine, 50.0)],
            Rect::sized(100.0, 10.0),
        )
        .with_rules(BattleRules {
            reinforcements: false,
            ..BattleRules::default()
        });
        let mut battle = Battle::new("b".into(), config).unwrap();
        assert_eq!(battle.join("attackers", vec![unit("a2", UnitKind::Marine, 0.0)]).unwrap(), 1);
        assert!(matches!(
            battle.join("attackers", vec![unit("a2", UnitKind::Marine, 0.0)]),
            Err(WarError::AlreadyExists { .. })
        ));
        battle.transition(BattleState::Active).unwrap();
        assert!(matches!(
            battle.join("attackers", vec![unit("a3", UnitKind::Marine, 0.0)]),
            Err(WarError::InvalidState(_))
        ));
    }

    #[test]
    fn test_unique_max() {
        assert_eq!(unique_max([("a", 3), ("b", 1)].into_iter()), Some("a"));
        assert_eq!(unique_max([("a", 3), ("b", 3)].into_iter()), None);
        assert_eq!(unique_max([("a", 0), ("b", 0)].into_iter()), None);
        assert_eq!(unique_max([("a", 1), ("b", 1), ("c", 2)].into_iter()), Some("c"));
    }
}
