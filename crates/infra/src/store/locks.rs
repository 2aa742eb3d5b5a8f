//! Row lock table for the in-memory store.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use orderflow_core::{LineItemId, OrderId, OrderKind, StockUnitId};

use super::StoreError;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub(crate) enum RowKey {
    Order(OrderId),
    Line(LineItemId),
    StockUnit(StockUnitId),
    Counter(OrderKind),
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowKey::Order(id) => write!(f, "order {id}"),
            RowKey::Line(id) => write!(f, "line item {id}"),
            RowKey::StockUnit(id) => write!(f, "stock unit {id}"),
            RowKey::Counter(kind) => write!(f, "{kind} reference counter"),
        }
    }
}

/// Exclusive, re-entrant (per transaction) row locks with a bounded wait.
#[derive(Debug, Default)]
pub(crate) struct LockTable {
    held: Mutex<HashMap<RowKey, u64>>,
    released: Condvar,
}

impl LockTable {
    pub(crate) fn acquire(&self, key: RowKey, tx: u64, wait: Duration) -> Result<(), StoreError> {
        let deadline = Instant::now() + wait;
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            match held.get(&key) {
                None => {
                    held.insert(key, tx);
                    return Ok(());
                }
                Some(owner) if *owner == tx => return Ok(()),
                Some(_) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(StoreError::LockTimeout(key.to_string()));
                    }
                    let (guard, _) = self
                        .released
                        .wait_timeout(held, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner);
                    held = guard;
                }
            }
        }
    }

    pub(crate) fn release_all(&self, tx: u64, keys: &[RowKey]) {
        if keys.is_empty() {
            return;
        }
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        for key in keys {
            if held.get(key) == Some(&tx) {
                held.remove(key);
            }
        }
        drop(held);
        self.released.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn same_transaction_may_reacquire() {
        let table = LockTable::default();
        let key = RowKey::Counter(OrderKind::Loan);
        table.acquire(key, 1, Duration::ZERO).unwrap();
        table.acquire(key, 1, Duration::ZERO).unwrap();
    }

    #[test]
    fn contended_lock_times_out() {
        let table = LockTable::default();
        let key = RowKey::Order(OrderId::new());
        table.acquire(key, 1, Duration::ZERO).unwrap();
        let err = table.acquire(key, 2, Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, StoreError::LockTimeout(ref r) if r.starts_with("order ")));
    }

    #[test]
    fn waiter_proceeds_after_release() {
        let table = Arc::new(LockTable::default());
        let key = RowKey::StockUnit(StockUnitId::new());
        table.acquire(key, 1, Duration::ZERO).unwrap();

        let waiter = {
            let table = table.clone();
            thread::spawn(move || table.acquire(key, 2, Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        table.release_all(1, &[key]);
        assert!(waiter.join().unwrap().is_ok());
    }

    #[test]
    fn release_ignores_keys_owned_by_others() {
        let table = LockTable::default();
        let key = RowKey::Line(LineItemId::new());
        table.acquire(key, 1, Duration::ZERO).unwrap();
        table.release_all(2, &[key]);
        assert!(table.acquire(key, 3, Duration::ZERO).is_err());
    }
}
