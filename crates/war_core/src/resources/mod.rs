//! Transactional resource ledger.
//!
//! - [`Ledger`] - pure counters and reservations, all-or-nothing updates
//! - [`ResourceManager`] - serializes every change through one processor task
//! - [`ResourceGenerator`] - timed production into a single resource
//! - [`RateLimiter`] - token bucket gating transaction admission

mod generator;
mod ledger;
mod manager;
mod rate_limiter;

use std::collections::BTreeMap;
use std::fmt;

use tokio::time::Instant;

use crate::error::WarError;

pub use generator::ResourceGenerator;
pub use ledger::{pool_key, Ledger, Reservation, ResourceEntry};
pub use manager::{ResourceInfo, ResourceManager, ResourceStatistics, TransactionTicket};
pub use rate_limiter::RateLimiter;

/// Signed amounts keyed by resource name.
pub type ResourceAmounts = BTreeMap<String, i64>;

/// Reservation handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReservationId(pub u64);

impl fmt::Display for ReservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rsv-{}", self.0)
    }
}

/// Transaction kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionKind {
    /// Apply signed deltas.
    Allocate,
    /// Hold capacity without consuming it.
    Reserve,
    /// Return a reservation's capacity.
    Release,
    /// Turn a reservation into a decrement.
    Consume,
    /// Move amounts between pools.
    Transfer,
    /// Several delta maps as one unit.
    Batch,
    /// Production, clamped at capacity.
    Generate,
}

/// Outcome of one transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionResult {
    /// Submission sequence number.
    pub transaction_id: u64,
    /// Kind of transaction.
    pub kind: TransactionKind,
    /// Whether the change was applied.
    pub success: bool,
    /// Why it was not.
    pub error: Option<WarError>,
    /// Amounts actually applied (or reserved).
    pub applied: ResourceAmounts,
    /// Set for successful reservations.
    pub reservation_id: Option<ReservationId>,
    /// Resources that failed their bounds check.
    pub insufficient: Vec<String>,
    /// When the result was produced.
    pub timestamp: Instant,
}

impl TransactionResult {
    pub(crate) fn failed(transaction_id: u64, kind: TransactionKind, error: WarError) -> Self {
        let insufficient = match &error {
            WarError::InsufficientResources { resources } => resources.clone(),
            _ => Vec::new(),
        };
        Self {
            transaction_id,
            kind,
            success: false,
            error: Some(error),
            applied: ResourceAmounts::new(),
            reservation_id: None,
            insufficient,
            timestamp: Instant::now(),
        }
    }

    pub(crate) fn succeeded(transaction_id: u64, kind: TransactionKind, applied: ResourceAmounts) -> Self {
        Self {
            transaction_id,
            kind,
            success: true,
            error: None,
            applied,
            reservation_id: None,
            insufficient: Vec::new(),
            timestamp: Instant::now(),
        }
    }

    /// Convert into a `Result`, keeping the error.
    pub fn into_result(self) -> crate::error::Result<Self> {
        match &self.error {
            Some(e) if !self.success => Err(e.clone()),
            _ => Ok(self),
        }
    }
}

/// One entry of the allocation history.
#[derive(Debug, Clone, PartialEq)]
pub struct AllocationRecord {
    /// When it happened.
    pub timestamp: Instant,
    /// Who asked.
    pub requester: String,
    /// Requested deltas.
    pub resources: ResourceAmounts,
    /// Whether it was applied.
    pub success: bool,
    /// Levels of the touched resources afterwards.
    pub remaining: ResourceAmounts,
}

/// What a [`ResourceEvent`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceEventKind {
    /// A resource was registered.
    ResourceAdded,
    /// A transaction was applied.
    ResourceAllocated,
    /// A resource hit zero.
    ResourceDepleted,
    /// A generator added production.
    ResourceGenerated,
    /// A transaction failed.
    AllocationFailed,
    /// A resource dropped to its low threshold.
    ThresholdReached,
    /// A generator started.
    GeneratorStarted,
    /// A generator stopped.
    GeneratorStopped,
    /// A reservation lapsed.
    ReservationExpired,
}

/// Event severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Severity {
    /// Routine.
    Info,
    /// Needs attention.
    Warning,
    /// Needs action.
    Critical,
}

/// Ledger notification delivered to listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceEvent {
    /// Event kind.
    pub kind: ResourceEventKind,
    /// Amounts involved.
    pub resources: ResourceAmounts,
    /// When it happened.
    pub timestamp: Instant,
    /// Human-readable description.
    pub message: String,
    /// Severity.
    pub severity: Severity,
}

impl ResourceEvent {
    pub(crate) fn new(
        kind: ResourceEventKind,
        severity: Severity,
        resources: ResourceAmounts,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            resources,
            timestamp: Instant::now(),
            message: message.into(),
            severity,
        }
    }
}
