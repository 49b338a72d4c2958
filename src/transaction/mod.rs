//! Transaction Coordinator
//!
//! Two-phase commit over grouped lifecycle operations. `prepare` validates
//! every operation against a projected registry and, under `Serializable`
//! isolation, takes every target lock in submission order. `commit` applies
//! the operations in order and undoes the executed ones in reverse when any
//! of them fails.

pub mod locks;
pub mod operation;
pub mod reaper;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{PluginError, PluginResult};
use crate::plugin::metadata::{PluginId, Priority};
use crate::plugin::registry::PluginRegistry;

pub use locks::{LockManager, LockOwner};
pub use operation::{
    standard_validation, Operation, OperationInfo, OperationKind, OperationStatus, PrepareContext,
};
pub use reaper::TransactionReaper;

/// Transaction identifier, unique per coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(u64);

impl TransactionId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl From<u64> for TransactionId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum IsolationLevel {
    /// Locks are held only while each operation runs
    #[default]
    ReadCommitted,
    /// All target locks are taken at prepare and held to the end
    Serializable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionState {
    Open,
    Preparing,
    Prepared,
    Committed,
    RolledBack,
    Failed,
}

impl TransactionState {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            TransactionState::Committed | TransactionState::RolledBack | TransactionState::Failed
        )
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Coordinator settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionConfig {
    /// Used when `begin` is given no timeout
    pub default_timeout: Duration,
    /// How often abandoned transactions are checked against their deadline
    pub reap_interval: Duration,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_millis(30_000),
            reap_interval: Duration::from_millis(1_000),
        }
    }
}

/// Observable view of a transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionInfo {
    pub id: TransactionId,
    pub isolation: IsolationLevel,
    pub priority: Priority,
    pub timeout_ms: u64,
    pub state: TransactionState,
    pub operations: Vec<OperationInfo>,
    pub acquired_locks: Vec<PluginId>,
    pub created_at: DateTime<Utc>,
    pub error: Option<String>,
}

/// Transaction counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionStats {
    pub begun: u64,
    pub committed: u64,
    pub rolled_back: u64,
    pub failed: u64,
    pub active: usize,
}

/// Invoked once for every transaction that reaches a final state
pub type CompletionListener = Arc<dyn Fn(&TransactionInfo) + Send + Sync>;

struct Transaction {
    id: TransactionId,
    isolation: IsolationLevel,
    priority: Priority,
    timeout: Duration,
    deadline: Instant,
    created_at: DateTime<Utc>,
    operations: Vec<Operation>,
    state: TransactionState,
    acquired_locks: Vec<PluginId>,
    error: Option<PluginError>,
}

impl Transaction {
    fn owner(&self) -> LockOwner {
        LockOwner {
            id: self.id,
            priority: self.priority.rank(),
            sequence: self.id.value(),
        }
    }

    fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    fn info(&self) -> TransactionInfo {
        TransactionInfo {
            id: self.id,
            isolation: self.isolation,
            priority: self.priority,
            timeout_ms: self.timeout.as_millis() as u64,
            state: self.state,
            operations: self.operations.iter().map(Operation::info).collect(),
            acquired_locks: self.acquired_locks.clone(),
            created_at: self.created_at,
            error: self.error.as_ref().map(|e| e.to_string()),
        }
    }

    /// Distinct targets in submission order
    fn targets(&self) -> Vec<PluginId> {
        let mut targets: Vec<PluginId> = Vec::new();
        for op in &self.operations {
            if !targets.iter().any(|t| t == op.target()) {
                targets.push(op.target().to_string());
            }
        }
        targets
    }
}

#[derive(Default)]
struct Counters {
    begun: AtomicU64,
    committed: AtomicU64,
    rolled_back: AtomicU64,
    failed: AtomicU64,
}

/// Two-phase commit coordinator
pub struct TransactionCoordinator {
    config: TransactionConfig,
    registry: Arc<PluginRegistry>,
    locks: LockManager,
    transactions: RwLock<HashMap<TransactionId, Arc<tokio::sync::Mutex<Transaction>>>>,
    snapshots: RwLock<HashMap<TransactionId, TransactionInfo>>,
    listener: RwLock<Option<CompletionListener>>,
    next_id: AtomicU64,
    counters: Counters,
}

impl TransactionCoordinator {
    pub fn new(config: TransactionConfig, registry: Arc<PluginRegistry>) -> Self {
        Self {
            config,
            registry,
            locks: LockManager::new(),
            transactions: RwLock::new(HashMap::new()),
            snapshots: RwLock::new(HashMap::new()),
            listener: RwLock::new(None),
            next_id: AtomicU64::new(1),
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    pub fn set_completion_listener(&self, listener: CompletionListener) {
        *self.listener.write() = Some(listener);
    }

    /// Start a transaction at normal priority
    pub fn begin(&self, isolation: IsolationLevel, timeout: Option<Duration>) -> TransactionId {
        self.begin_with_priority(isolation, timeout, Priority::Normal)
    }

    /// Start a transaction; `priority` decides deadlock victims
    pub fn begin_with_priority(
        &self,
        isolation: IsolationLevel,
        timeout: Option<Duration>,
        priority: Priority,
    ) -> TransactionId {
        let id = TransactionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let timeout = timeout.unwrap_or(self.config.default_timeout);
        let transaction = Transaction {
            id,
            isolation,
            priority,
            timeout,
            deadline: Instant::now() + timeout,
            created_at: Utc::now(),
            operations: Vec::new(),
            state: TransactionState::Open,
            acquired_locks: Vec::new(),
            error: None,
        };
        self.snapshots.write().insert(id, transaction.info());
        self.transactions
            .write()
            .insert(id, Arc::new(tokio::sync::Mutex::new(transaction)));
        self.counters.begun.fetch_add(1, Ordering::Relaxed);
        debug!("Began {} ({:?}, timeout {:?})", id, isolation, timeout);
        id
    }

    fn lookup(&self, id: TransactionId) -> PluginResult<Arc<tokio::sync::Mutex<Transaction>>> {
        self.transactions.read().get(&id).cloned().ok_or_else(|| {
            PluginError::invalid_parameters(format!("Unknown transaction {}", id))
                .with_context("transaction", id.value())
        })
    }

    fn publish(&self, tx: &Transaction) {
        let info = tx.info();
        self.snapshots.write().insert(tx.id, info.clone());
        if tx.state.is_finished() {
            let listener = self.listener.read().clone();
            if let Some(listener) = listener {
                listener(&info);
            }
        }
    }

    fn not_open(tx: &Transaction) -> PluginError {
        PluginError::invalid_state(format!("{} is {}", tx.id, tx.state))
            .with_context("transaction", tx.id.value())
            .with_context("state", tx.state.to_string())
    }

    /// Append an operation; the transaction must be `Open`
    pub async fn add_operation(&self, id: TransactionId, operation: Operation) -> PluginResult<()> {
        let entry = self.lookup(id)?;
        let mut tx = entry.lock().await;
        if tx.state != TransactionState::Open {
            return Err(Self::not_open(&tx));
        }
        if tx.is_expired() {
            let err = self.expire(&mut tx).await;
            return Err(err);
        }
        debug!("{}: {} '{}'", id, operation.kind(), operation.target());
        tx.operations.push(operation);
        self.publish(&tx);
        Ok(())
    }

    /// Validate every operation and, for `Serializable`, acquire all target locks
    pub async fn prepare(&self, id: TransactionId) -> PluginResult<()> {
        let entry = self.lookup(id)?;
        let mut tx = entry.lock().await;
        self.prepare_locked(&mut tx).await
    }

    async fn prepare_locked(&self, tx: &mut Transaction) -> PluginResult<()> {
        match tx.state {
            TransactionState::Open => {}
            TransactionState::Prepared => return Ok(()),
            _ => return Err(Self::not_open(tx)),
        }
        if tx.is_expired() {
            return Err(self.expire(tx).await);
        }

        tx.state = TransactionState::Preparing;
        self.publish(tx);

        let mut context = PrepareContext::from_registry(&self.registry);
        for index in 0..tx.operations.len() {
            let checked = tx.operations[index].check(&mut context);
            if let Err(e) = checked {
                let e = e.with_context("transaction", tx.id.value()).with_context("index", index);
                warn!("{} failed validation: {}", tx.id, e);
                tx.operations[index].set_status(OperationStatus::Failed);
                self.finish(tx, TransactionState::Failed, Some(e.clone()));
                return Err(e);
            }
            tx.operations[index].set_status(OperationStatus::Validated);
        }

        if tx.isolation == IsolationLevel::Serializable {
            let owner = tx.owner();
            for target in tx.targets() {
                if let Err(e) = self.locks.acquire(owner, &target, tx.deadline).await {
                    warn!("{} could not lock '{}': {}", tx.id, target, e);
                    self.finish(tx, TransactionState::RolledBack, Some(e.clone()));
                    return Err(e);
                }
                tx.acquired_locks.push(target);
            }
        }

        tx.state = TransactionState::Prepared;
        self.publish(tx);
        debug!("{} prepared with {} operation(s)", tx.id, tx.operations.len());
        Ok(())
    }

    /// Apply every operation in order; any failure rolls back what ran
    pub async fn commit(&self, id: TransactionId) -> PluginResult<()> {
        let entry = self.lookup(id)?;
        let mut tx = entry.lock().await;
        match tx.state {
            TransactionState::Open => self.prepare_locked(&mut tx).await?,
            TransactionState::Prepared => {}
            TransactionState::Failed => {
                return Err(PluginError::transaction_aborted(
                    format!("{} failed during prepare", tx.id),
                    tx.error.clone(),
                )
                .with_context("transaction", tx.id.value()));
            }
            _ => return Err(Self::not_open(&tx)),
        }

        let owner = tx.owner();
        let deadline = tx.deadline;
        let per_operation_locks = tx.isolation == IsolationLevel::ReadCommitted;
        for index in 0..tx.operations.len() {
            let target = tx.operations[index].target().to_string();
            let mut result = Ok(());
            if per_operation_locks {
                result = self.locks.acquire(owner, &target, deadline).await;
            }
            if result.is_ok() {
                let step = tx.operations[index].forward();
                result = match tokio::time::timeout_at(deadline, step).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(PluginError::timeout(format!(
                        "{} timed out applying {} to '{}'",
                        tx.id,
                        tx.operations[index].kind(),
                        target
                    ))
                    .with_plugin(&target)),
                };
            }
            if per_operation_locks {
                self.locks.release(owner.id, &target);
            }

            match result {
                Ok(()) => tx.operations[index].set_status(OperationStatus::Executed),
                Err(cause) => {
                    tx.operations[index].set_status(OperationStatus::Failed);
                    error!(
                        "{}: {} '{}' failed, rolling back: {}",
                        tx.id,
                        tx.operations[index].kind(),
                        target,
                        cause
                    );
                    self.undo(&mut tx, index).await;
                    let aborted = PluginError::transaction_aborted(
                        format!(
                            "{} rolled back after {} of '{}' failed",
                            tx.id,
                            tx.operations[index].kind(),
                            target
                        ),
                        Some(cause),
                    )
                    .with_plugin(&target)
                    .with_context("transaction", tx.id.value())
                    .with_context("index", index);
                    self.finish(&mut tx, TransactionState::RolledBack, Some(aborted.clone()));
                    return Err(aborted);
                }
            }
        }

        self.finish(&mut tx, TransactionState::Committed, None);
        info!("{} committed {} operation(s)", tx.id, tx.operations.len());
        Ok(())
    }

    /// Run rollback steps for operations `[0, executed)` in reverse order
    async fn undo(&self, tx: &mut Transaction, executed: usize) {
        for index in (0..executed).rev() {
            if tx.operations[index].status() != OperationStatus::Executed {
                continue;
            }
            let step = match tx.operations[index].rollback() {
                Some(step) => step,
                None => {
                    warn!(
                        "{}: {} '{}' has no rollback step",
                        tx.id,
                        tx.operations[index].kind(),
                        tx.operations[index].target()
                    );
                    continue;
                }
            };
            // rollback gets a fresh window; the transaction deadline may already have passed
            let outcome = match tokio::time::timeout(tx.timeout, step).await {
                Ok(outcome) => outcome,
                Err(_) => Err(PluginError::timeout("Rollback step timed out")),
            };
            match outcome {
                Ok(()) => tx.operations[index].set_status(OperationStatus::RolledBack),
                Err(e) => {
                    tx.operations[index].set_status(OperationStatus::RollbackFailed);
                    error!(
                        "{}: rollback of {} '{}' failed: {}",
                        tx.id,
                        tx.operations[index].kind(),
                        tx.operations[index].target(),
                        e
                    );
                }
            }
        }
    }

    /// Abandon an `Open` or `Prepared` transaction.
    ///
    /// Finished transactions are left as they are; only unknown ids fail.
    pub async fn rollback(&self, id: TransactionId) -> PluginResult<()> {
        let entry = self.lookup(id)?;
        let mut tx = entry.lock().await;
        match tx.state {
            TransactionState::Open | TransactionState::Prepared | TransactionState::Preparing => {
                self.finish(&mut tx, TransactionState::RolledBack, None);
                info!("{} rolled back", id);
            }
            other => debug!("Rollback of {} ignored, already {}", id, other),
        }
        Ok(())
    }

    async fn expire(&self, tx: &mut Transaction) -> PluginError {
        let executed = tx
            .operations
            .iter()
            .filter(|op| op.status() == OperationStatus::Executed)
            .count();
        self.undo(tx, executed).await;
        let err = PluginError::timeout(format!("{} exceeded its {:?} timeout", tx.id, tx.timeout))
            .with_context("transaction", tx.id.value());
        warn!("{}", err);
        self.finish(tx, TransactionState::RolledBack, Some(err.clone()));
        err
    }

    /// Roll back every unfinished transaction past its deadline
    pub async fn reap_expired(&self) -> usize {
        let entries: Vec<_> = self.transactions.read().values().cloned().collect();
        let mut reaped = 0;
        for entry in entries {
            // busy transactions check their own deadline
            if let Ok(mut tx) = entry.try_lock() {
                if !tx.state.is_finished() && tx.is_expired() {
                    self.expire(&mut tx).await;
                    reaped += 1;
                }
            }
        }
        reaped
    }

    fn finish(&self, tx: &mut Transaction, state: TransactionState, error: Option<PluginError>) {
        self.locks.release_all(tx.id);
        tx.acquired_locks.clear();
        tx.state = state;
        tx.error = error;
        for operation in &mut tx.operations {
            operation.release();
        }
        let counter = match state {
            TransactionState::Committed => &self.counters.committed,
            TransactionState::RolledBack => &self.counters.rolled_back,
            _ => &self.counters.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.publish(tx);
    }

    pub fn state(&self, id: TransactionId) -> Option<TransactionState> {
        self.snapshots.read().get(&id).map(|info| info.state)
    }

    /// Last published view of a transaction
    pub fn info(&self, id: TransactionId) -> Option<TransactionInfo> {
        self.snapshots.read().get(&id).cloned()
    }

    pub fn list(&self) -> Vec<TransactionInfo> {
        let mut all: Vec<_> = self.snapshots.read().values().cloned().collect();
        all.sort_by_key(|info| info.id);
        all
    }

    /// Forget finished transactions; returns how many were dropped
    pub fn purge_finished(&self) -> usize {
        let finished: Vec<TransactionId> = self
            .snapshots
            .read()
            .values()
            .filter(|info| info.state.is_finished())
            .map(|info| info.id)
            .collect();
        let mut transactions = self.transactions.write();
        let mut snapshots = self.snapshots.write();
        for id in &finished {
            transactions.remove(id);
            snapshots.remove(id);
        }
        finished.len()
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn stats(&self) -> TransactionStats {
        TransactionStats {
            begun: self.counters.begun.load(Ordering::Relaxed),
            committed: self.counters.committed.load(Ordering::Relaxed),
            rolled_back: self.counters.rolled_back.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            active: self
                .snapshots
                .read()
                .values()
                .filter(|info| !info.state.is_finished())
                .count(),
        }
    }
}
