//! Unit registry and command dispatcher.
//!
//! Two decoupled pipelines:
//!
//! - Fan-out: [`UnitManager::send_command`] and
//!   [`UnitManager::broadcast_command`] push [`QueuedCommand`]s onto one
//!   bounded queue. A dispatcher task orders what is queued by priority and
//!   hands each command to an idle worker. Workers register their own inbox
//!   on an availability channel every time they become idle, so at most
//!   `workers` commands execute at once.
//! - Fan-in: one bridge task per unit forwards that unit's events into a
//!   shared status channel; an aggregator republishes them to listeners.
//!
//! The registry is only ever exposed as snapshot copies.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::config::{DispatcherConfig, UnitConfig};
use crate::error::{Result, WarError};
use crate::lifecycle::{CancelToken, TaskTracker};
use crate::math::Position;
use crate::unit::{Command, Unit, UnitEvent, UnitRuntime};
use crate::unit_kind::{UnitKind, UnitState};

/// Predicate applied to candidate units of a broadcast.
pub type UnitPredicate = Arc<dyn Fn(&Unit) -> bool + Send + Sync>;

/// A command addressed to many units.
///
/// Targets are resolved in a fixed order: explicit ids (or every unit when
/// none are given), then the predicate, then the cap.
#[derive(Clone)]
pub struct BroadcastSpec {
    /// Command sent to each target.
    pub command: Command,
    /// Explicit targets. Empty means every registered unit.
    pub target_ids: Vec<String>,
    /// Optional filter.
    pub predicate: Option<UnitPredicate>,
    /// Optional cap on the number of targets.
    pub max_targets: Option<usize>,
    /// Dispatch priority, higher first.
    pub priority: i32,
}

impl BroadcastSpec {
    /// Broadcast `command` to every unit.
    #[must_use]
    pub fn new(command: Command) -> Self {
        Self {
            command,
            target_ids: Vec::new(),
            predicate: None,
            max_targets: None,
            priority: 0,
        }
    }

    /// Restrict to explicit ids.
    #[must_use]
    pub fn to_units<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.target_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    /// Keep only units matching `predicate`.
    #[must_use]
    pub fn filter(mut self, predicate: impl Fn(&Unit) -> bool + Send + Sync + 'static) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Cap the number of targets.
    #[must_use]
    pub fn limit(mut self, max_targets: usize) -> Self {
        self.max_targets = Some(max_targets);
        self
    }

    /// Set the dispatch priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

impl fmt::Debug for BroadcastSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadcastSpec")
            .field("command", &self.command)
            .field("target_ids", &self.target_ids)
            .field("predicate", &self.predicate.is_some())
            .field("max_targets", &self.max_targets)
            .field("priority", &self.priority)
            .finish()
    }
}

/// Outcome of one dispatched command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResult {
    /// Whether the unit accepted the command.
    pub success: bool,
    /// Why not.
    pub error: Option<WarError>,
    /// Addressed unit.
    pub unit_id: String,
    /// When the result was produced.
    pub timestamp: Instant,
}

impl CommandResult {
    fn ok(unit_id: String) -> Self {
        Self {
            success: true,
            error: None,
            unit_id,
            timestamp: Instant::now(),
        }
    }

    fn err(unit_id: String, error: WarError) -> Self {
        Self {
            success: false,
            error: Some(error),
            unit_id,
            timestamp: Instant::now(),
        }
    }
}

/// A command waiting for a worker.
#[derive(Debug)]
pub struct QueuedCommand {
    /// Target unit.
    pub unit_id: String,
    /// The order.
    pub command: Command,
    /// Dispatch priority.
    pub priority: i32,
    /// When it was queued.
    pub enqueued_at: Instant,
    /// After this the command is reported as timed out and not delivered.
    pub deadline: Instant,
    seq: u64,
    response: Option<oneshot::Sender<CommandResult>>,
}

impl QueuedCommand {
    fn respond(mut self, result: CommandResult) -> bool {
        let success = result.success;
        if let Some(response) = self.response.take() {
            let _ = response.send(result);
        }
        success
    }
}

/// Heap adapter: highest priority first, then lowest sequence.
struct Pending(QueuedCommand);

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.0.seq == other.0.seq
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.0
            .priority
            .cmp(&other.0.priority)
            .then_with(|| other.0.seq.cmp(&self.0.seq))
    }
}

/// Registry notification.
#[derive(Debug, Clone, PartialEq)]
pub enum UnitManagerEvent {
    /// A unit was registered.
    UnitAdded {
        /// Unit id.
        unit_id: String,
        /// Unit kind.
        kind: UnitKind,
    },
    /// A unit was removed and shut down.
    UnitRemoved {
        /// Unit id.
        unit_id: String,
    },
    /// A broadcast was queued.
    CommandBroadcast {
        /// Command description.
        command: String,
        /// Commands queued.
        queued: usize,
        /// Commands dropped on a full queue.
        dropped: usize,
    },
    /// A unit reported an event.
    StatusUpdateReceived(UnitEvent),
    /// The manager is shutting down.
    ManagerShutdown,
}

/// Registry and dispatch statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ManagerStats {
    /// Registered units.
    pub total_units: usize,
    /// Units per kind.
    pub by_kind: HashMap<UnitKind, usize>,
    /// Units per state.
    pub by_state: HashMap<UnitState, usize>,
    /// Mean health of registered units.
    pub average_health: f64,
    /// Commands delivered to a unit.
    pub commands_processed: u64,
    /// Commands that resolved with an error.
    pub commands_failed: u64,
    /// Commands dropped at enqueue.
    pub commands_dropped: u64,
    /// Commands executing right now.
    pub active_commands: usize,
    /// Highest number of commands ever executing at once.
    pub peak_active_commands: usize,
    /// Unit events received through the fan-in channel.
    pub status_updates: u64,
    /// Delivered commands per second since start.
    pub commands_per_sec: f64,
}

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    active: AtomicUsize,
    peak_active: AtomicUsize,
    status_updates: AtomicU64,
}

struct Shared {
    units: RwLock<HashMap<String, Arc<Unit>>>,
    bridges: Mutex<HashMap<String, CancelToken>>,
    listeners: Mutex<Vec<mpsc::Sender<UnitManagerEvent>>>,
    counters: Counters,
}

impl Shared {
    fn lookup(&self, id: &str) -> Option<Arc<Unit>> {
        self.units.read().get(id).cloned()
    }

    fn publish(&self, event: &UnitManagerEvent) {
        let listeners = self.listeners.lock().clone();
        let mut closed = false;
        for listener in &listeners {
            match listener.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::trace!("manager listener full, skipping");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed = true,
            }
        }
        if closed {
            self.listeners.lock().retain(|l| !l.is_closed());
        }
    }
}

/// Owns the live units and routes commands to them.
pub struct UnitManager {
    shared: Arc<Shared>,
    queue: mpsc::Sender<QueuedCommand>,
    status: mpsc::Sender<UnitEvent>,
    seq: AtomicU64,
    runtime: UnitRuntime,
    tasks: TaskTracker,
    cancel: CancelToken,
    config: DispatcherConfig,
    started_at: Instant,
}

impl fmt::Debug for UnitManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitManager")
            .field("units", &self.shared.units.read().len())
            .field("workers", &self.config.workers)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl UnitManager {
    /// Create the manager and start its dispatcher, workers and aggregator.
    pub fn new(config: DispatcherConfig, unit_config: UnitConfig, parent: &CancelToken) -> Self {
        let cancel = parent.child();
        let workers = config.workers.max(1);
        let (queue, queue_rx) = mpsc::channel(config.command_queue.max(1));
        let (status, status_rx) = mpsc::channel(config.status_buffer.max(1));
        let (pool_tx, pool_rx) = mpsc::channel(workers);
        let shared = Arc::new(Shared {
            units: RwLock::new(HashMap::new()),
            bridges: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
            counters: Counters::default(),
        });
        let tasks = TaskTracker::new();

        for worker_id in 0..workers {
            tasks.spawn(command_worker(
                worker_id,
                Arc::clone(&shared),
                pool_tx.clone(),
                cancel.clone(),
            ));
        }
        drop(pool_tx);
        tasks.spawn(command_dispatcher(queue_rx, pool_rx, cancel.clone()));
        tasks.spawn(status_aggregator(Arc::clone(&shared), status_rx, cancel.clone()));

        tracing::info!(workers, "unit manager started");
        Self {
            shared,
            queue,
            status,
            seq: AtomicU64::new(0),
            runtime: UnitRuntime::new(unit_config, &cancel),
            tasks,
            cancel,
            config,
            started_at: Instant::now(),
        }
    }

    /// Runtime for units owned by this manager.
    #[must_use]
    pub fn runtime(&self) -> &UnitRuntime {
        &self.runtime
    }

    /// Create a unit on this manager's runtime and register it.
    pub fn spawn_unit(
        &self,
        id: impl Into<String>,
        kind: UnitKind,
        position: Position,
    ) -> Result<Arc<Unit>> {
        let unit = Unit::spawn(id, kind, position, &self.runtime);
        if let Err(e) = self.add_unit(Arc::clone(&unit)) {
            unit.shutdown();
            return Err(e);
        }
        Ok(unit)
    }

    /// Register `unit` and start forwarding its events.
    ///
    /// The manager takes the unit's event stream, so a unit can be owned by
    /// one manager only.
    pub fn add_unit(&self, unit: Arc<Unit>) -> Result<()> {
        if unit.id().trim().is_empty() {
            return Err(WarError::InvalidArgument("unit id is empty".into()));
        }
        if self.cancel.is_cancelled() {
            return Err(WarError::ShuttingDown("unit manager".into()));
        }
        let id = unit.id().to_owned();
        let stream = {
            let mut units = self.shared.units.write();
            if units.contains_key(&id) {
                return Err(WarError::already_exists("unit", id));
            }
            let stream = unit.take_event_stream().ok_or_else(|| {
                WarError::InvalidArgument(format!("unit {id} is already owned by a manager"))
            })?;
            units.insert(id.clone(), Arc::clone(&unit));
            stream
        };

        let bridge = self.cancel.child();
        self.shared.bridges.lock().insert(id.clone(), bridge.clone());
        self.tasks.spawn(bridge_events(
            id.clone(),
            stream,
            self.status.clone(),
            unit.lifecycle_token(),
            bridge,
        ));

        tracing::debug!(unit_id = %id, kind = %unit.kind(), "unit added");
        self.shared.publish(&UnitManagerEvent::UnitAdded {
            unit_id: id,
            kind: unit.kind(),
        });
        Ok(())
    }

    /// Remove a unit and shut it down.
    pub fn remove_unit(&self, id: &str) -> Result<Arc<Unit>> {
        let unit = self
            .shared
            .units
            .write()
            .remove(id)
            .ok_or_else(|| WarError::not_found("unit", id))?;
        if let Some(bridge) = self.shared.bridges.lock().remove(id) {
            bridge.cancel();
        }
        unit.shutdown();
        tracing::debug!(unit_id = %id, "unit removed");
        self.shared.publish(&UnitManagerEvent::UnitRemoved {
            unit_id: id.to_owned(),
        });
        Ok(unit)
    }

    /// Look up a unit.
    #[must_use]
    pub fn get_unit(&self, id: &str) -> Option<Arc<Unit>> {
        self.shared.lookup(id)
    }

    /// Point-in-time copy of the registry.
    #[must_use]
    pub fn get_all_units(&self) -> HashMap<String, Arc<Unit>> {
        self.shared.units.read().clone()
    }

    /// Registered units of `kind`, sorted by id.
    #[must_use]
    pub fn units_by_kind(&self, kind: UnitKind) -> Vec<Arc<Unit>> {
        let mut units: Vec<_> = self
            .shared
            .units
            .read()
            .values()
            .filter(|u| u.kind() == kind)
            .cloned()
            .collect();
        units.sort_by(|a, b| a.id().cmp(b.id()));
        units
    }

    /// Registered units within `radius` of `center`, nearest first.
    #[must_use]
    pub fn units_in_range(&self, center: Position, radius: f64) -> Vec<Arc<Unit>> {
        let snapshot: Vec<_> = self.shared.units.read().values().cloned().collect();
        let mut in_range: Vec<(f64, Arc<Unit>)> = snapshot
            .into_iter()
            .map(|u| (u.position().distance(center), u))
            .filter(|(d, _)| *d <= radius)
            .collect();
        in_range.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.id().cmp(b.1.id())));
        in_range.into_iter().map(|(_, u)| u).collect()
    }

    fn resolve_targets(&self, spec: &BroadcastSpec) -> Vec<Arc<Unit>> {
        let mut targets: Vec<Arc<Unit>> = {
            let units = self.shared.units.read();
            if spec.target_ids.is_empty() {
                units.values().cloned().collect()
            } else {
                spec.target_ids
                    .iter()
                    .filter_map(|id| units.get(id).cloned())
                    .collect()
            }
        };
        if spec.target_ids.is_empty() {
            targets.sort_by(|a, b| a.id().cmp(b.id()));
        }
        if let Some(predicate) = &spec.predicate {
            targets.retain(|u| predicate(u));
        }
        if let Some(max) = spec.max_targets {
            targets.truncate(max);
        }
        targets
    }

    fn queued(&self, unit_id: String, command: Command, priority: i32) -> QueuedCommand {
        let now = Instant::now();
        QueuedCommand {
            unit_id,
            command,
            priority,
            enqueued_at: now,
            deadline: now + self.config.command_timeout(),
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            response: None,
        }
    }

    /// Queue one command per matching unit without blocking.
    ///
    /// Returns how many were queued; commands that do not fit in the queue
    /// are dropped and counted.
    pub fn broadcast_command(&self, spec: &BroadcastSpec) -> Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(WarError::ShuttingDown("unit manager".into()));
        }
        let targets = self.resolve_targets(spec);
        let mut queued = 0;
        let mut dropped = 0;
        for unit in targets {
            let command = self.queued(unit.id().to_owned(), spec.command.clone(), spec.priority);
            match self.queue.try_send(command) {
                Ok(()) => queued += 1,
                Err(_) => dropped += 1,
            }
        }
        if dropped > 0 {
            self.shared
                .counters
                .dropped
                .fetch_add(dropped as u64, Ordering::Relaxed);
            tracing::warn!(dropped, command = %spec.command, "command queue full, broadcast truncated");
        }
        self.shared.publish(&UnitManagerEvent::CommandBroadcast {
            command: spec.command.to_string(),
            queued,
            dropped,
        });
        Ok(queued)
    }

    /// Queue a command for one unit. The receiver always resolves.
    pub fn send_command(
        &self,
        unit_id: &str,
        command: Command,
        priority: i32,
    ) -> oneshot::Receiver<CommandResult> {
        let (tx, rx) = oneshot::channel();
        let mut queued = self.queued(unit_id.to_owned(), command, priority);
        queued.response = Some(tx);
        if self.cancel.is_cancelled() {
            queued.respond(CommandResult::err(
                unit_id.to_owned(),
                WarError::ShuttingDown("unit manager".into()),
            ));
            return rx;
        }
        match self.queue.try_send(queued) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(queued)) => {
                self.shared.counters.dropped.fetch_add(1, Ordering::Relaxed);
                queued.respond(CommandResult::err(
                    unit_id.to_owned(),
                    WarError::Backpressure("command queue full".into()),
                ));
            }
            Err(mpsc::error::TrySendError::Closed(queued)) => {
                queued.respond(CommandResult::err(
                    unit_id.to_owned(),
                    WarError::ShuttingDown("unit manager".into()),
                ));
            }
        }
        rx
    }

    /// Subscribe to registry events. Slow listeners miss events.
    pub fn add_event_listener(&self) -> mpsc::Receiver<UnitManagerEvent> {
        let (tx, rx) = mpsc::channel(self.config.listener_buffer.max(1));
        self.shared.listeners.lock().push(tx);
        rx
    }

    /// Registry and dispatch statistics.
    #[must_use]
    pub fn stats(&self) -> ManagerStats {
        let snapshot: Vec<_> = self.shared.units.read().values().cloned().collect();
        let mut by_kind = HashMap::new();
        let mut by_state = HashMap::new();
        let mut health_sum = 0u64;
        for unit in &snapshot {
            *by_kind.entry(unit.kind()).or_insert(0) += 1;
            *by_state.entry(unit.state()).or_insert(0) += 1;
            health_sum += u64::from(unit.health());
        }
        let counters = &self.shared.counters;
        let processed = counters.processed.load(Ordering::Relaxed);
        let elapsed = self.started_at.elapsed().as_secs_f64();
        ManagerStats {
            total_units: snapshot.len(),
            by_kind,
            by_state,
            average_health: if snapshot.is_empty() {
                0.0
            } else {
                health_sum as f64 / snapshot.len() as f64
            },
            commands_processed: processed,
            commands_failed: counters.failed.load(Ordering::Relaxed),
            commands_dropped: counters.dropped.load(Ordering::Relaxed),
            active_commands: counters.active.load(Ordering::Relaxed),
            peak_active_commands: counters.peak_active.load(Ordering::Relaxed),
            status_updates: counters.status_updates.load(Ordering::Relaxed),
            commands_per_sec: if elapsed > 0.0 {
                processed as f64 / elapsed
            } else {
                0.0
            },
        }
    }

    /// Shut down every unit and background task, waiting up to `timeout`.
    ///
    /// Idempotent. On timeout some tasks may still be running; the caller
    /// decides whether that is fatal.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        if self.cancel.cancel() {
            tracing::info!("unit manager shutting down");
            self.shared.publish(&UnitManagerEvent::ManagerShutdown);
        }
        let units: Vec<_> = self.shared.units.read().values().cloned().collect();
        for unit in units {
            unit.shutdown();
        }
        let deadline = Instant::now() + timeout;
        self.tasks.wait(timeout).await?;
        let remaining = deadline.saturating_duration_since(Instant::now());
        self.runtime.tasks.wait(remaining).await
    }
}

async fn command_dispatcher(
    mut queue: mpsc::Receiver<QueuedCommand>,
    mut pool: mpsc::Receiver<mpsc::Sender<QueuedCommand>>,
    cancel: CancelToken,
) {
    let mut pending: BinaryHeap<Pending> = BinaryHeap::new();
    loop {
        if pending.is_empty() {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                next = queue.recv() => match next {
                    Some(command) => pending.push(Pending(command)),
                    None => break,
                },
            }
        }
        while let Ok(command) = queue.try_recv() {
            pending.push(Pending(command));
        }
        let worker = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            worker = pool.recv() => match worker {
                Some(worker) => worker,
                None => break,
            },
        };
        while let Ok(command) = queue.try_recv() {
            pending.push(Pending(command));
        }
        let Some(Pending(command)) = pending.pop() else {
            continue;
        };
        if let Err(mpsc::error::SendError(command)) = worker.send(command).await {
            let unit_id = command.unit_id.clone();
            command.respond(CommandResult::err(
                unit_id,
                WarError::ShuttingDown("command worker".into()),
            ));
            break;
        }
    }
    queue.close();
    while let Ok(command) = queue.try_recv() {
        pending.push(Pending(command));
    }
    for Pending(command) in pending.into_vec() {
        let unit_id = command.unit_id.clone();
        command.respond(CommandResult::err(
            unit_id,
            WarError::ShuttingDown("unit manager".into()),
        ));
    }
    tracing::debug!("command dispatcher stopped");
}

async fn command_worker(
    worker_id: usize,
    shared: Arc<Shared>,
    pool: mpsc::Sender<mpsc::Sender<QueuedCommand>>,
    cancel: CancelToken,
) {
    let (inbox_tx, mut inbox) = mpsc::channel::<QueuedCommand>(1);
    loop {
        // Announce availability, then wait for exactly one assignment.
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            registered = pool.send(inbox_tx.clone()) => {
                if registered.is_err() {
                    break;
                }
            }
        }
        let command = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            next = inbox.recv() => match next {
                Some(command) => command,
                None => break,
            },
        };

        let counters = &shared.counters;
        let active = counters.active.fetch_add(1, Ordering::SeqCst) + 1;
        counters.peak_active.fetch_max(active, Ordering::SeqCst);
        let unit_id = command.unit_id.clone();
        let outcome = execute(&shared, &command).await;
        counters.active.fetch_sub(1, Ordering::SeqCst);

        let result = match outcome {
            Ok(()) => {
                counters.processed.fetch_add(1, Ordering::Relaxed);
                CommandResult::ok(unit_id)
            }
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(worker_id, unit_id = %unit_id, error = %e, "command failed");
                CommandResult::err(unit_id, e)
            }
        };
        command.respond(result);
    }
    inbox.close();
    while let Ok(command) = inbox.try_recv() {
        let unit_id = command.unit_id.clone();
        command.respond(CommandResult::err(
            unit_id,
            WarError::ShuttingDown("unit manager".into()),
        ));
    }
    tracing::trace!(worker_id, "command worker stopped");
}

async fn execute(shared: &Shared, command: &QueuedCommand) -> Result<()> {
    let timeout = command.deadline.saturating_duration_since(command.enqueued_at);
    if Instant::now() >= command.deadline {
        return Err(WarError::timeout(format!("command {}", command.command), timeout));
    }
    let unit = shared
        .lookup(&command.unit_id)
        .ok_or_else(|| WarError::not_found("unit", command.unit_id.as_str()))?;
    match tokio::time::timeout_at(command.deadline, unit.submit(command.command.clone())).await {
        Ok(result) => result,
        Err(_) => Err(WarError::timeout(format!("command {}", command.command), timeout)),
    }
}

async fn bridge_events(
    unit_id: String,
    mut events: mpsc::Receiver<UnitEvent>,
    status: mpsc::Sender<UnitEvent>,
    unit_lifecycle: CancelToken,
    cancel: CancelToken,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = unit_lifecycle.cancelled() => {
                // Forward what the unit emitted before it stopped.
                while let Ok(event) = events.try_recv() {
                    if status.try_send(event).is_err() {
                        break;
                    }
                }
                break;
            }
            next = events.recv() => {
                let Some(event) = next else { break };
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    sent = status.send(event) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }
    tracing::trace!(unit_id = %unit_id, "event bridge stopped");
}

async fn status_aggregator(
    shared: Arc<Shared>,
    mut status: mpsc::Receiver<UnitEvent>,
    cancel: CancelToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            next = status.recv() => match next {
                Some(event) => event,
                None => break,
            },
        };
        shared.counters.status_updates.fetch_add(1, Ordering::Relaxed);
        shared.publish(&UnitManagerEvent::StatusUpdateReceived(event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_secs(1);

    fn manager(workers: usize) -> UnitManager {
        UnitManager::new(
            DispatcherConfig {
                workers,
                ..DispatcherConfig::default()
            },
            UnitConfig::default(),
            &CancelToken::new(),
        )
    }

    #[tokio::test]
    async fn test_add_and_remove() {
        let um = manager(2);
        um.spawn_unit("marine-1", UnitKind::Marine, Position::ZERO).unwrap();
        assert!(matches!(
            um.spawn_unit("marine-1", UnitKind::Marine, Position::ZERO),
            Err(WarError::AlreadyExists { .. })
        ));
        assert!(matches!(
            um.spawn_unit("", UnitKind::Marine, Position::ZERO),
            Err(WarError::InvalidArgument(_))
        ));
        let removed = um.remove_unit("marine-1").unwrap();
        assert!(removed.is_shut_down());
        assert!(matches!(
            um.remove_unit("marine-1"),
            Err(WarError::NotFound { .. })
        ));
        um.shutdown(WAIT).await.unwrap();
    }

    #[tokio::test]
    async fn test_unit_cannot_join_two_managers() {
        let a = manager(1);
        let b = manager(1);
        let unit = a.spawn_unit("m", UnitKind::Marine, Position::ZERO).unwrap();
        assert!(matches!(
            b.add_unit(unit),
            Err(WarError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_snapshot_isolation() {
        let um = manager(1);
        um.spawn_unit("a", UnitKind::Marine, Position::ZERO).unwrap();
        um.spawn_unit("b", UnitKind::Marine, Position::ZERO).unwrap();
        let snapshot = um.get_all_units();
        um.remove_unit("a").unwrap();
        um.spawn_unit("c", UnitKind::Zealot, Position::ZERO).unwrap();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.contains_key("a"));
        assert!(!snapshot.contains_key("c"));
    }

    #[tokio::test]
    async fn test_send_command_reaches_unit() {
        let um = manager(2);
        let unit = um.spawn_unit("m", UnitKind::Marine, Position::ZERO).unwrap();
        let result = um
            .send_command("m", Command::move_to(Position::new(3.0, 4.0)), 0)
            .await
            .unwrap();
        assert!(result.success, "{result:?}");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(unit.position(), Position::new(3.0, 4.0));
    }

    #[tokio::test]
    async fn test_send_command_unknown_unit() {
        let um = manager(1);
        let result = um.send_command("ghost", Command::stop(), 0).await.unwrap();
        assert!(!result.success);
        assert!(matches!(result.error, Some(WarError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_worker_answers_assignment_when_cancelled() {
        let shared = Arc::new(Shared {
            units: RwLock::new(HashMap::new()),
            bridges: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
            counters: Counters::default(),
        });
        let (pool_tx, mut pool_rx) = mpsc::channel(1);
        let cancel = CancelToken::new();
        let worker = tokio::spawn(command_worker(0, shared, pool_tx, cancel.clone()));
        let inbox = pool_rx.recv().await.unwrap();

        let (response, reply) = oneshot::channel();
        let now = Instant::now();
        inbox
            .try_send(QueuedCommand {
                unit_id: "m".into(),
                command: Command::stop(),
                priority: 0,
                enqueued_at: now,
                deadline: now + WAIT,
                seq: 0,
                response: Some(response),
            })
            .unwrap();
        cancel.cancel();

        let result = reply.await.unwrap();
        assert!(matches!(result.error, Some(WarError::ShuttingDown(_))));
        worker.await.unwrap();
        assert!(inbox.is_closed());
    }

    #[tokio::test]
    async fn test_send_after_shutdown() {
        let um = manager(1);
        um.shutdown(WAIT).await.unwrap();
        um.shutdown(WAIT).await.unwrap();
        let result = um.send_command("m", Command::stop(), 0).await.unwrap();
        assert!(matches!(result.error, Some(WarError::ShuttingDown(_))));
    }

    #[tokio::test]
    async fn test_broadcast_filter_order() {
        let um = manager(2);
        for i in 0..6 {
            let kind = if i % 2 == 0 {
                UnitKind::Marine
            } else {
                UnitKind::Zergling
            };
            um.spawn_unit(format!("u{i}"), kind, Position::ZERO).unwrap();
        }
        // ids -> predicate -> cap
        let spec = BroadcastSpec::new(Command::hold())
            .to_units(["u5", "u4", "u3", "u2", "missing"])
            .filter(|u| u.kind() == UnitKind::Marine)
            .limit(1);
        let targets = um.resolve_targets(&spec);
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].id(), "u4");

        let queued = um
            .broadcast_command(&BroadcastSpec::new(Command::hold()).filter(|u| u.kind() == UnitKind::Zergling))
            .unwrap();
        assert_eq!(queued, 3);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(um.units_by_kind(UnitKind::Zergling).iter().filter(|u| u.state() == UnitState::HoldingPosition).count(), 3);
        assert_eq!(um.get_unit("u0").unwrap().state(), UnitState::Idle);
    }

    #[tokio::test]
    async fn test_units_in_range_nearest_first() {
        let um = manager(1);
        um.spawn_unit("far", UnitKind::Marine, Position::new(9.0, 0.0)).unwrap();
        um.spawn_unit("near", UnitKind::Marine, Position::new(1.0, 0.0)).unwrap();
        um.spawn_unit("out", UnitKind::Marine, Position::new(50.0, 0.0)).unwrap();
        let ids: Vec<_> = um
            .units_in_range(Position::ZERO, 10.0)
            .iter()
            .map(|u| u.id().to_owned())
            .collect();
        assert_eq!(ids, ["near", "far"]);
    }

    #[tokio::test]
    async fn test_listener_sees_registry_and_status() {
        let um = manager(1);
        let mut events = um.add_event_listener();
        let unit = um.spawn_unit("m", UnitKind::Marine, Position::ZERO).unwrap();
        assert!(matches!(
            events.recv().await,
            Some(UnitManagerEvent::UnitAdded { unit_id, .. }) if unit_id == "m"
        ));
        unit.take_damage(5);
        let mut saw_status = false;
        while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(100), events.recv()).await {
            if matches!(event, UnitManagerEvent::StatusUpdateReceived(ref e) if e.source == "m") {
                saw_status = true;
                break;
            }
        }
        assert!(saw_status);
        assert_eq!(um.stats().total_units, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_pool_bounds_concurrency() {
        let um = manager(2);
        // Units that never drain their inbox make commands linger in workers.
        let config = UnitConfig::default();
        for i in 0..3 {
            let unit = Unit::new(format!("stuck{i}"), UnitKind::Marine, Position::ZERO, &config, &CancelToken::new());
            um.add_unit(unit).unwrap();
        }
        let receivers: Vec<_> = (0..45)
            .map(|i| um.send_command(&format!("stuck{}", i % 3), Command::stop(), 0))
            .collect();
        let mut ok = 0;
        let mut backpressure = 0;
        for rx in receivers {
            let result = rx.await.unwrap();
            if result.success {
                ok += 1;
            } else if matches!(result.error, Some(WarError::Backpressure(_))) {
                backpressure += 1;
            }
        }
        assert_eq!(ok, 30);
        assert_eq!(backpressure, 15);
        let stats = um.stats();
        assert!(stats.peak_active_commands <= 2);
        assert_eq!(stats.commands_processed, 30);
        assert_eq!(stats.commands_failed, 15);
    }

    #[tokio::test]
    async fn test_stats_by_kind_and_state() {
        let um = manager(1);
        um.spawn_unit("a", UnitKind::Marine, Position::ZERO).unwrap();
        um.spawn_unit("b", UnitKind::Marine, Position::ZERO).unwrap();
        let z = um.spawn_unit("c", UnitKind::Zergling, Position::ZERO).unwrap();
        z.take_damage(1000);
        let stats = um.stats();
        assert_eq!(stats.total_units, 3);
        assert_eq!(stats.by_kind[&UnitKind::Marine], 2);
        assert_eq!(stats.by_state[&UnitState::Dead], 1);
        assert!((stats.average_health - 80.0 / 3.0).abs() < 1e-9);
    }
}
