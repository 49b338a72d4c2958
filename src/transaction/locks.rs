//! Per-plugin transaction locks
//!
//! Locks are exclusive and taken one target at a time, so transactions can
//! hold some locks while waiting on others. Every waiter records the holder it
//! waits on; a cycle in that wait-for graph is a deadlock and is broken by
//! aborting its lowest-priority member (the most recently begun on ties).

use std::collections::{BTreeSet, HashMap, HashSet};

use log::{debug, warn};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::{ErrorKind, PluginError, PluginResult};
use crate::plugin::metadata::PluginId;
use crate::transaction::TransactionId;

/// Scheduling attributes of a lock owner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOwner {
    pub id: TransactionId,
    /// Higher survives deadlocks
    pub priority: i32,
    /// Begin order; higher is newer
    pub sequence: u64,
}

#[derive(Default)]
struct LockTable {
    holders: HashMap<PluginId, TransactionId>,
    waits_for: HashMap<TransactionId, TransactionId>,
    owners: HashMap<TransactionId, LockOwner>,
    victims: HashSet<TransactionId>,
}

impl LockTable {
    /// Members of the wait-for cycle through `start`, if there is one
    fn cycle_through(&self, start: TransactionId) -> Option<Vec<TransactionId>> {
        let mut path = vec![start];
        let mut current = start;
        while let Some(&next) = self.waits_for.get(&current) {
            if next == start {
                return Some(path);
            }
            if path.contains(&next) {
                // a cycle that does not include `start`; whoever closed it handles it
                return None;
            }
            path.push(next);
            current = next;
        }
        None
    }

    fn choose_victim(&self, cycle: &[TransactionId]) -> TransactionId {
        cycle
            .iter()
            .copied()
            .min_by_key(|tx| {
                let owner = self.owners.get(tx);
                let priority = owner.map_or(0, |o| o.priority);
                let sequence = owner.map_or(0, |o| o.sequence);
                (priority, std::cmp::Reverse(sequence))
            })
            .unwrap_or(cycle[0])
    }

    fn forget_wait(&mut self, tx: TransactionId) {
        self.waits_for.remove(&tx);
    }
}

/// Exclusive per-plugin locks with deadlock detection
#[derive(Default)]
pub struct LockManager {
    table: Mutex<LockTable>,
    released: Notify,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire `target` for `owner`, waiting until `deadline`.
    ///
    /// Re-acquiring a held lock succeeds immediately. Fails with `Timeout` at the
    /// deadline, or `TransactionAborted` when chosen as a deadlock victim.
    pub async fn acquire(&self, owner: LockOwner, target: &str, deadline: Instant) -> PluginResult<()> {
        loop {
            let notified = {
                let mut table = self.table.lock();
                table.owners.insert(owner.id, owner);

                if table.victims.remove(&owner.id) {
                    table.forget_wait(owner.id);
                    return Err(Self::deadlock_error(owner.id, target));
                }

                let holder = table.holders.get(target).copied();
                match holder {
                    None => {
                        table.holders.insert(target.to_string(), owner.id);
                        table.forget_wait(owner.id);
                        debug!("{} locked '{}'", owner.id, target);
                        return Ok(());
                    }
                    Some(holder) if holder == owner.id => return Ok(()),
                    Some(holder) => {
                        table.waits_for.insert(owner.id, holder);
                        if let Some(cycle) = table.cycle_through(owner.id) {
                            let victim = table.choose_victim(&cycle);
                            warn!(
                                "Deadlock between {:?} over '{}', aborting {}",
                                cycle, target, victim
                            );
                            if victim == owner.id {
                                table.forget_wait(owner.id);
                                return Err(Self::deadlock_error(owner.id, target));
                            }
                            table.victims.insert(victim);
                            self.released.notify_waiters();
                        }
                    }
                }
                // registered before the table lock is released so no wake-up is missed
                self.released.notified()
            };

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let mut table = self.table.lock();
                table.forget_wait(owner.id);
                table.victims.remove(&owner.id);
                return Err(PluginError::timeout(format!(
                    "{} timed out waiting for the lock on '{}'",
                    owner.id, target
                ))
                .with_plugin(target)
                .with_context("transaction", owner.id.value()));
            }
        }
    }

    /// Release one lock if `tx` holds it
    pub fn release(&self, tx: TransactionId, target: &str) -> bool {
        let released = {
            let mut table = self.table.lock();
            if table.holders.get(target) == Some(&tx) {
                table.holders.remove(target);
                true
            } else {
                false
            }
        };
        if released {
            self.released.notify_waiters();
        }
        released
    }

    /// Release everything `tx` holds and forget it
    pub fn release_all(&self, tx: TransactionId) -> usize {
        let count = {
            let mut table = self.table.lock();
            let before = table.holders.len();
            table.holders.retain(|_, holder| *holder != tx);
            table.waits_for.remove(&tx);
            table.victims.remove(&tx);
            table.owners.remove(&tx);
            before - table.holders.len()
        };
        self.released.notify_waiters();
        count
    }

    pub fn holder_of(&self, target: &str) -> Option<TransactionId> {
        self.table.lock().holders.get(target).copied()
    }

    /// Targets held by `tx`, sorted
    pub fn held_by(&self, tx: TransactionId) -> BTreeSet<PluginId> {
        self.table
            .lock()
            .holders
            .iter()
            .filter(|(_, holder)| **holder == tx)
            .map(|(target, _)| target.clone())
            .collect()
    }

    pub fn lock_count(&self) -> usize {
        self.table.lock().holders.len()
    }

    fn deadlock_error(tx: TransactionId, target: &str) -> PluginError {
        PluginError::new(
            ErrorKind::TransactionAborted,
            format!("{} aborted to break a deadlock on '{}'", tx, target),
        )
        .with_plugin(target)
        .with_context("transaction", tx.value())
        .with_context("deadlock", true)
    }
}
