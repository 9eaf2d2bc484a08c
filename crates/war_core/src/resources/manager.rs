//! Resource manager: the single arbiter of the ledger.
//!
//! Public methods build an operation, push it onto the bounded transaction
//! queue and hand back a [`TransactionTicket`]. One processor task drains the
//! queue in batches, orders each batch by priority (FIFO among equals),
//! sweeps lapsed reservations and applies operations one at a time under the
//! ledger write lock. Listener notification happens after the lock is
//! released.
//!
//! Timeouts use a claim/cancel handshake on each ticket: the processor claims
//! a transaction before applying it, the waiting caller cancels it when the
//! deadline passes. Exactly one side wins, so a timed-out transaction is never
//! applied late.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use super::generator::ResourceGenerator;
use super::ledger::Ledger;
use super::rate_limiter::RateLimiter;
use super::{
    AllocationRecord, ReservationId, ResourceAmounts, ResourceEvent, ResourceEventKind,
    Severity, TransactionKind, TransactionResult,
};
use crate::config::ResourceConfig;
use crate::error::{Result, WarError};
use crate::lifecycle::{CancelToken, TaskTracker};

const PENDING: u8 = 0;
const CLAIMED: u8 = 1;
const CANCELLED: u8 = 2;

/// Bound on how long administrative calls wait for the processor.
const ADMIN_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug)]
enum Operation {
    AddResource { name: String, initial: i64, max: i64 },
    SetThreshold { name: String, threshold: i64 },
    Allocate(ResourceAmounts),
    Reserve { amounts: ResourceAmounts, ttl: Duration },
    Consume(ReservationId),
    Release(ReservationId),
    Transfer { from: String, to: String, amounts: ResourceAmounts },
    Batch(Vec<ResourceAmounts>),
    Generate { resource: String, amount: i64 },
    Sweep,
}

impl Operation {
    const fn kind(&self) -> TransactionKind {
        match self {
            Self::Reserve { .. } => TransactionKind::Reserve,
            Self::Consume(_) => TransactionKind::Consume,
            Self::Release(_) => TransactionKind::Release,
            Self::Transfer { .. } => TransactionKind::Transfer,
            Self::Batch(_) => TransactionKind::Batch,
            Self::Generate { .. } => TransactionKind::Generate,
            Self::AddResource { .. }
            | Self::SetThreshold { .. }
            | Self::Allocate(_)
            | Self::Sweep => TransactionKind::Allocate,
        }
    }

    /// Whether the operation counts towards transaction statistics.
    const fn is_transaction(&self) -> bool {
        !matches!(
            self,
            Self::AddResource { .. } | Self::SetThreshold { .. } | Self::Sweep
        )
    }
}

struct Envelope {
    seq: u64,
    priority: i32,
    requester: String,
    op: Operation,
    claim: Arc<AtomicU8>,
    reply: Option<oneshot::Sender<TransactionResult>>,
}

impl Envelope {
    fn try_claim(&self) -> bool {
        self.claim
            .compare_exchange(PENDING, CLAIMED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

enum TicketInner {
    Ready(TransactionResult),
    Waiting {
        seq: u64,
        kind: TransactionKind,
        deadline: Instant,
        timeout: Duration,
        claim: Arc<AtomicU8>,
        rx: oneshot::Receiver<TransactionResult>,
    },
}

/// Handle to a submitted transaction. Await [`TransactionTicket::wait`]
/// for the outcome.
pub struct TransactionTicket {
    inner: TicketInner,
}

impl std::fmt::Debug for TransactionTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            TicketInner::Ready(result) => f.debug_tuple("Ready").field(result).finish(),
            TicketInner::Waiting { seq, kind, .. } => f
                .debug_struct("Waiting")
                .field("seq", seq)
                .field("kind", kind)
                .finish(),
        }
    }
}

impl TransactionTicket {
    fn ready(result: TransactionResult) -> Self {
        Self {
            inner: TicketInner::Ready(result),
        }
    }

    /// Resolve the transaction.
    ///
    /// Always produces a result: success, business failure, `Timeout` (the
    /// transaction was discarded and will never apply) or `ShuttingDown`.
    pub async fn wait(self) -> TransactionResult {
        match self.inner {
            TicketInner::Ready(result) => result,
            TicketInner::Waiting {
                seq,
                kind,
                deadline,
                timeout,
                claim,
                mut rx,
            } => {
                if let Ok(received) = tokio::time::timeout_at(deadline, &mut rx).await {
                    return received.unwrap_or_else(|_| shutting_down(seq, kind));
                }
                let cancelled = claim
                    .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok();
                if cancelled {
                    tracing::debug!(transaction_id = seq, "transaction timed out before processing");
                    return TransactionResult::failed(
                        seq,
                        kind,
                        WarError::timeout(format!("{kind:?} transaction {seq}"), timeout),
                    );
                }
                // The processor claimed it first; the reply is imminent.
                rx.await.unwrap_or_else(|_| shutting_down(seq, kind))
            }
        }
    }
}

/// `now + timeout`, saturating at roughly thirty years out.
fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(86_400 * 365 * 30))
}

fn shutting_down(seq: u64, kind: TransactionKind) -> TransactionResult {
    TransactionResult::failed(seq, kind, WarError::ShuttingDown("resource manager".into()))
}

/// Snapshot of one resource.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceInfo {
    /// Name.
    pub name: String,
    /// Amount on hand.
    pub current: i64,
    /// Capacity.
    pub max: i64,
    /// Held by reservations.
    pub reserved: i64,
    /// `current - reserved`.
    pub available: i64,
    /// Low-level alert threshold.
    pub low_threshold: i64,
    /// Recent allocation records, oldest first.
    pub history: Vec<AllocationRecord>,
}

/// Aggregate ledger statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceStatistics {
    /// Transactions processed (including failures).
    pub total_transactions: u64,
    /// Transactions applied.
    pub successful: u64,
    /// Transactions rejected by the ledger.
    pub failed: u64,
    /// Transactions refused at admission (queue full or rate limited).
    pub rejected: u64,
    /// Total consumed per resource.
    pub consumed: ResourceAmounts,
    /// Fraction of capacity not available, per resource.
    pub utilization: HashMap<String, f64>,
    /// Outstanding reservations.
    pub pending_reservations: usize,
    /// Requesters ranked by total consumption, largest first.
    pub top_consumers: Vec<(String, i64)>,
}

#[derive(Debug, Default)]
struct Counters {
    total: u64,
    successful: u64,
    failed: u64,
    consumed: ResourceAmounts,
    by_requester: HashMap<String, i64>,
}

#[derive(Clone)]
pub(crate) struct Submitter {
    queue: mpsc::Sender<Envelope>,
    seq: Arc<AtomicU64>,
    cancel: CancelToken,
    limiter: Option<Arc<RateLimiter>>,
    rejected: Arc<AtomicU64>,
}

impl Submitter {
    fn submit(
        &self,
        requester: &str,
        op: Operation,
        priority: i32,
        timeout: Duration,
        rate_limited: bool,
    ) -> TransactionTicket {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let kind = op.kind();
        if self.cancel.is_cancelled() {
            return TransactionTicket::ready(shutting_down(seq, kind));
        }
        if rate_limited {
            if let Some(limiter) = &self.limiter {
                if !limiter.allow() {
                    self.rejected.fetch_add(1, Ordering::Relaxed);
                    return TransactionTicket::ready(TransactionResult::failed(
                        seq,
                        kind,
                        WarError::Backpressure(format!("rate limit exceeded for {requester}")),
                    ));
                }
            }
        }
        let claim = Arc::new(AtomicU8::new(PENDING));
        let (tx, rx) = oneshot::channel();
        let envelope = Envelope {
            seq,
            priority,
            requester: requester.to_owned(),
            op,
            claim: Arc::clone(&claim),
            reply: Some(tx),
        };
        match self.queue.try_send(envelope) {
            Ok(()) => TransactionTicket {
                inner: TicketInner::Waiting {
                    seq,
                    kind,
                    deadline: deadline_after(timeout),
                    timeout,
                    claim,
                    rx,
                },
            },
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(transaction_id = seq, %requester, "transaction queue full");
                TransactionTicket::ready(TransactionResult::failed(
                    seq,
                    kind,
                    WarError::Backpressure("resource transaction queue full".into()),
                ))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                TransactionTicket::ready(shutting_down(seq, kind))
            }
        }
    }

    /// Fire-and-forget production; dropped when the queue is full.
    pub(crate) fn generate(&self, resource: &str, amount: i64) {
        let ticket = self.submit(
            "generator",
            Operation::Generate {
                resource: resource.to_owned(),
                amount,
            },
            0,
            ADMIN_WAIT,
            false,
        );
        if let TicketInner::Ready(result) = ticket.inner {
            tracing::debug!(resource, error = ?result.error, "generation dropped");
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

struct Shared {
    ledger: RwLock<Ledger>,
    listeners: Mutex<Vec<mpsc::Sender<ResourceEvent>>>,
    counters: Mutex<Counters>,
}

impl Shared {
    fn publish(&self, events: Vec<ResourceEvent>) {
        if events.is_empty() {
            return;
        }
        let listeners = self.listeners.lock().clone();
        for event in events {
            for listener in &listeners {
                if listener.try_send(event.clone()).is_err() {
                    tracing::trace!(kind = ?event.kind, "resource listener full or closed, skipping");
                }
            }
        }
        self.listeners.lock().retain(|l| !l.is_closed());
    }
}

/// Sole owner of the resource ledger.
pub struct ResourceManager {
    shared: Arc<Shared>,
    submitter: Submitter,
    generators: Mutex<HashMap<String, ResourceGenerator>>,
    tasks: TaskTracker,
    cancel: CancelToken,
    config: ResourceConfig,
}

impl std::fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceManager")
            .field("levels", &self.resource_levels())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl ResourceManager {
    /// Create the manager with `initial` resources (each capped at its own
    /// initial amount times ten, minimum 1000) and start its tasks.
    pub fn new(
        config: ResourceConfig,
        parent: &CancelToken,
        initial: impl IntoIterator<Item = (String, i64)>,
    ) -> Result<Self> {
        let mut ledger = Ledger::new(config.history_len);
        for (name, amount) in initial {
            let max = amount.saturating_mul(10).max(1000);
            ledger.add_resource(&name, amount, max)?;
        }
        let limiter = config
            .rate_limit
            .as_ref()
            .map(RateLimiter::new)
            .transpose()?
            .map(Arc::new);

        let cancel = parent.child();
        let (queue, rx) = mpsc::channel(config.transaction_queue.max(1));
        let shared = Arc::new(Shared {
            ledger: RwLock::new(ledger),
            listeners: Mutex::new(Vec::new()),
            counters: Mutex::new(Counters::default()),
        });
        let submitter = Submitter {
            queue,
            seq: Arc::new(AtomicU64::new(1)),
            cancel: cancel.clone(),
            limiter,
            rejected: Arc::new(AtomicU64::new(0)),
        };
        let tasks = TaskTracker::new();
        tasks.spawn(process_transactions(Arc::clone(&shared), rx, cancel.clone()));
        tasks.spawn(monitor(
            Arc::clone(&shared),
            submitter.clone(),
            config.monitor_interval(),
            cancel.clone(),
        ));
        tracing::info!("resource manager started");
        Ok(Self {
            shared,
            submitter,
            generators: Mutex::new(HashMap::new()),
            tasks,
            cancel,
            config,
        })
    }

    async fn admin(&self, op: Operation) -> Result<TransactionResult> {
        self.submitter
            .submit("admin", op, i32::MAX, ADMIN_WAIT, false)
            .wait()
            .await
            .into_result()
    }

    /// Register a new resource.
    pub async fn add_resource(&self, name: &str, initial: i64, max: i64) -> Result<()> {
        self.admin(Operation::AddResource {
            name: name.to_owned(),
            initial,
            max,
        })
        .await
        .map(|_| ())
    }

    /// Apply signed deltas atomically at default priority.
    pub fn allocate_resources(
        &self,
        requester: &str,
        deltas: ResourceAmounts,
        timeout: Duration,
    ) -> TransactionTicket {
        self.allocate_with_priority(requester, deltas, 0, timeout)
    }

    /// Apply signed deltas atomically. Higher priority goes first within a
    /// processing batch; equal priorities keep submission order.
    pub fn allocate_with_priority(
        &self,
        requester: &str,
        deltas: ResourceAmounts,
        priority: i32,
        timeout: Duration,
    ) -> TransactionTicket {
        self.submitter
            .submit(requester, Operation::Allocate(deltas), priority, timeout, true)
    }

    /// Hold capacity for the configured reservation lifetime.
    pub fn reserve_resources(
        &self,
        requester: &str,
        amounts: ResourceAmounts,
        timeout: Duration,
    ) -> TransactionTicket {
        self.reserve_resources_with_ttl(requester, amounts, self.config.reservation_ttl(), timeout)
    }

    /// Hold capacity for `ttl`.
    pub fn reserve_resources_with_ttl(
        &self,
        requester: &str,
        amounts: ResourceAmounts,
        ttl: Duration,
        timeout: Duration,
    ) -> TransactionTicket {
        self.submitter
            .submit(requester, Operation::Reserve { amounts, ttl }, 0, timeout, true)
    }

    /// Consume a reservation. `NotFound` for unknown, expired or released ids.
    pub async fn consume_reserved(&self, id: ReservationId) -> Result<()> {
        self.admin(Operation::Consume(id)).await.map(|_| ())
    }

    /// Release a reservation. `NotFound` for unknown, expired or released ids.
    pub async fn release_reservation(&self, id: ReservationId) -> Result<()> {
        self.admin(Operation::Release(id)).await.map(|_| ())
    }

    /// Move `amounts` from the `from` pool to the `to` pool. Pool entries
    /// are named `"{pool}.{resource}"`.
    pub fn transfer_resources(
        &self,
        from: &str,
        to: &str,
        amounts: ResourceAmounts,
        timeout: Duration,
    ) -> TransactionTicket {
        self.submitter.submit(
            from,
            Operation::Transfer {
                from: from.to_owned(),
                to: to.to_owned(),
                amounts,
            },
            0,
            timeout,
            true,
        )
    }

    /// Apply several delta maps as one transaction.
    pub fn batch(
        &self,
        requester: &str,
        steps: Vec<ResourceAmounts>,
        timeout: Duration,
    ) -> TransactionTicket {
        self.submitter
            .submit(requester, Operation::Batch(steps), 0, timeout, true)
    }

    /// Set the low-level alert threshold of `name`.
    pub async fn set_low_threshold(&self, name: &str, threshold: i64) -> Result<()> {
        self.admin(Operation::SetThreshold {
            name: name.to_owned(),
            threshold,
        })
        .await
        .map(|_| ())
    }

    /// Start `generator` and track it. `AlreadyExists` if its resource
    /// already has one.
    pub fn add_generator(&self, generator: ResourceGenerator) -> Result<()> {
        let resource = generator.resource().to_owned();
        {
            let mut generators = self.generators.lock();
            if generators.contains_key(&resource) {
                return Err(WarError::already_exists("generator", resource));
            }
            generators.insert(resource.clone(), generator.clone());
        }
        generator.start(self)?;
        Ok(())
    }

    /// Stop and forget the generator for `resource`.
    pub fn remove_generator(&self, resource: &str) -> Result<()> {
        let generator = self
            .generators
            .lock()
            .remove(resource)
            .ok_or_else(|| WarError::not_found("generator", resource))?;
        generator.stop();
        Ok(())
    }

    /// Generator for `resource`, if any.
    #[must_use]
    pub fn generator(&self, resource: &str) -> Option<ResourceGenerator> {
        self.generators.lock().get(resource).cloned()
    }

    /// Subscribe to ledger events. Slow listeners miss events rather than
    /// stalling the ledger.
    pub fn add_resource_listener(&self) -> mpsc::Receiver<ResourceEvent> {
        let (tx, rx) = mpsc::channel(self.config.listener_buffer.max(1));
        self.shared.listeners.lock().push(tx);
        rx
    }

    /// Current amount of every resource.
    #[must_use]
    pub fn resource_levels(&self) -> ResourceAmounts {
        self.shared.ledger.read().levels()
    }

    /// Snapshot of one resource.
    #[must_use]
    pub fn resource_info(&self, name: &str) -> Option<ResourceInfo> {
        let ledger = self.shared.ledger.read();
        ledger.entry(name).map(|e| ResourceInfo {
            name: name.to_owned(),
            current: e.current,
            max: e.max,
            reserved: e.reserved,
            available: e.available(),
            low_threshold: e.low_threshold,
            history: e.history.iter().cloned().collect(),
        })
    }

    /// Aggregate statistics.
    #[must_use]
    pub fn statistics(&self) -> ResourceStatistics {
        let (utilization, pending_reservations) = {
            let ledger = self.shared.ledger.read();
            let utilization = ledger
                .entries()
                .filter(|(_, e)| e.max > 0)
                .map(|(name, e)| {
                    let used = (e.max - e.available()) as f64 / e.max as f64;
                    (name.to_owned(), used)
                })
                .collect();
            (utilization, ledger.pending_reservations())
        };
        let counters = self.shared.counters.lock();
        let mut top_consumers: Vec<(String, i64)> = counters
            .by_requester
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        top_consumers.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top_consumers.truncate(5);
        ResourceStatistics {
            total_transactions: counters.total,
            successful: counters.successful,
            failed: counters.failed,
            rejected: self.submitter.rejected.load(Ordering::Relaxed),
            consumed: counters.consumed.clone(),
            utilization,
            pending_reservations,
            top_consumers,
        }
    }

    pub(crate) fn submitter(&self) -> &Submitter {
        &self.submitter
    }

    pub(crate) fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }

    pub(crate) fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub(crate) fn publish(&self, event: ResourceEvent) {
        self.shared.publish(vec![event]);
    }

    /// Stop the processor, monitor and generators and wait for them.
    /// Idempotent. Queued transactions resolve as `ShuttingDown`.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        if self.cancel.cancel() {
            tracing::info!("resource manager shutting down");
        }
        for generator in self.generators.lock().values() {
            generator.stop();
        }
        self.tasks.wait(timeout).await
    }
}

struct Applied {
    result: TransactionResult,
    events: Vec<ResourceEvent>,
}

fn apply(ledger: &mut Ledger, envelope: &Envelope, now: Instant) -> Applied {
    let seq = envelope.seq;
    let kind = envelope.op.kind();
    let mut events = Vec::new();
    let outcome: Result<TransactionResult> = match &envelope.op {
        Operation::AddResource { name, initial, max } => {
            ledger.add_resource(name, *initial, *max).map(|()| {
                let amounts = ResourceAmounts::from([(name.clone(), *initial)]);
                events.push(ResourceEvent::new(
                    ResourceEventKind::ResourceAdded,
                    Severity::Info,
                    amounts.clone(),
                    format!("resource {name} added (max {max})"),
                ));
                TransactionResult::succeeded(seq, kind, amounts)
            })
        }
        Operation::SetThreshold { name, threshold } => ledger
            .set_low_threshold(name, *threshold)
            .map(|()| TransactionResult::succeeded(seq, kind, ResourceAmounts::new())),
        Operation::Allocate(deltas) => ledger
            .apply(deltas)
            .map(|()| TransactionResult::succeeded(seq, kind, deltas.clone())),
        Operation::Reserve { amounts, ttl } => ledger
            .reserve(&envelope.requester, amounts, *ttl, now)
            .map(|id| TransactionResult {
                reservation_id: Some(id),
                ..TransactionResult::succeeded(seq, kind, amounts.clone())
            }),
        Operation::Consume(id) => ledger.consume(*id).map(|r| {
            let negated = r.amounts.iter().map(|(k, v)| (k.clone(), -v)).collect();
            TransactionResult::succeeded(seq, kind, negated)
        }),
        Operation::Release(id) => ledger
            .release(*id)
            .map(|r| TransactionResult::succeeded(seq, kind, r.amounts)),
        Operation::Transfer { from, to, amounts } => ledger
            .transfer(from, to, amounts)
            .map(|deltas| TransactionResult::succeeded(seq, kind, deltas)),
        Operation::Batch(steps) => ledger
            .apply_batch(steps)
            .map(|net| TransactionResult::succeeded(seq, kind, net)),
        Operation::Generate { resource, amount } => {
            ledger.generate(resource, *amount).map(|added| {
                let amounts = ResourceAmounts::from([(resource.clone(), added)]);
                if added > 0 {
                    events.push(ResourceEvent::new(
                        ResourceEventKind::ResourceGenerated,
                        Severity::Info,
                        amounts.clone(),
                        format!("generated {added} {resource}"),
                    ));
                }
                TransactionResult::succeeded(seq, kind, amounts)
            })
        }
        Operation::Sweep => Ok(TransactionResult::succeeded(seq, kind, ResourceAmounts::new())),
    };

    let result = outcome.unwrap_or_else(|e| TransactionResult::failed(seq, kind, e));
    if envelope.op.is_transaction() && !matches!(envelope.op, Operation::Generate { .. }) {
        let requested = match &envelope.op {
            Operation::Allocate(deltas) => deltas.clone(),
            _ => result.applied.clone(),
        };
        ledger.record(&envelope.requester, &requested, result.success, now);
        if result.success {
            events.push(ResourceEvent::new(
                ResourceEventKind::ResourceAllocated,
                Severity::Info,
                result.applied.clone(),
                format!("{kind:?} for {} applied", envelope.requester),
            ));
        } else {
            let reason = result
                .error
                .as_ref()
                .map_or_else(String::new, ToString::to_string);
            events.push(ResourceEvent::new(
                ResourceEventKind::AllocationFailed,
                Severity::Warning,
                requested,
                format!("{kind:?} for {} failed: {reason}", envelope.requester),
            ));
        }
    }
    Applied { result, events }
}

async fn process_transactions(
    shared: Arc<Shared>,
    mut rx: mpsc::Receiver<Envelope>,
    cancel: CancelToken,
) {
    tracing::debug!("transaction processor started");
    loop {
        let first = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(envelope) => envelope,
                None => break,
            },
        };
        let mut batch = vec![first];
        while let Ok(envelope) = rx.try_recv() {
            batch.push(envelope);
        }
        batch.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));

        let now = Instant::now();
        let mut replies = Vec::with_capacity(batch.len());
        let mut events = Vec::new();
        {
            let mut ledger = shared.ledger.write();
            for expired in ledger.sweep_expired(now) {
                tracing::debug!(reservation = %expired.id, requester = %expired.requester, "reservation expired");
                events.push(ResourceEvent::new(
                    ResourceEventKind::ReservationExpired,
                    Severity::Info,
                    expired.amounts,
                    format!("reservation {} expired", expired.id),
                ));
            }
            for mut envelope in batch {
                if !envelope.try_claim() {
                    tracing::debug!(transaction_id = envelope.seq, "skipping cancelled transaction");
                    continue;
                }
                let applied = apply(&mut ledger, &envelope, now);
                events.extend(applied.events);
                let counted = envelope.op.is_transaction();
                replies.push((envelope.reply.take(), applied.result, counted, envelope.requester));
            }
        }

        {
            let mut counters = shared.counters.lock();
            for (_, result, counted, requester) in &replies {
                if !*counted {
                    continue;
                }
                counters.total += 1;
                if result.success {
                    counters.successful += 1;
                    if result.kind != TransactionKind::Generate {
                        let mut spent: i64 = 0;
                        for (name, delta) in result.applied.iter().filter(|(_, d)| **d < 0) {
                            let total = counters.consumed.entry(name.clone()).or_insert(0);
                            *total = total.saturating_sub(*delta);
                            spent = spent.saturating_sub(*delta);
                        }
                        if spent > 0 {
                            let total = counters.by_requester.entry(requester.clone()).or_insert(0);
                            *total = total.saturating_add(spent);
                        }
                    }
                } else {
                    counters.failed += 1;
                }
            }
        }

        for (reply, result, _, _) in replies {
            if let Some(reply) = reply {
                let _ = reply.send(result);
            }
        }
        shared.publish(events);
    }
    tracing::debug!("transaction processor stopped");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Normal,
    Low,
    Depleted,
}

async fn monitor(shared: Arc<Shared>, submitter: Submitter, period: Duration, cancel: CancelToken) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut levels: HashMap<String, Level> = HashMap::new();
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        // Expiry goes through the processor so it stays the only writer.
        let _ = submitter.submit("monitor", Operation::Sweep, i32::MAX, ADMIN_WAIT, false);

        let snapshot: Vec<(String, i64, i64)> = shared
            .ledger
            .read()
            .entries()
            .map(|(name, e)| (name.to_owned(), e.current, e.low_threshold))
            .collect();
        let mut events = Vec::new();
        for (name, current, threshold) in snapshot {
            let level = if current == 0 {
                Level::Depleted
            } else if threshold > 0 && current <= threshold {
                Level::Low
            } else {
                Level::Normal
            };
            let previous = levels.insert(name.clone(), level).unwrap_or(Level::Normal);
            if level == previous {
                continue;
            }
            let amounts = ResourceAmounts::from([(name.clone(), current)]);
            match level {
                Level::Depleted => {
                    tracing::warn!(resource = %name, "resource depleted");
                    events.push(ResourceEvent::new(
                        ResourceEventKind::ResourceDepleted,
                        Severity::Critical,
                        amounts,
                        format!("{name} depleted"),
                    ));
                }
                Level::Low if previous == Level::Normal => {
                    events.push(ResourceEvent::new(
                        ResourceEventKind::ThresholdReached,
                        Severity::Warning,
                        amounts,
                        format!("{name} at {current}, threshold {threshold}"),
                    ));
                }
                Level::Low | Level::Normal => {}
            }
        }
        shared.publish(events);
    }
}
