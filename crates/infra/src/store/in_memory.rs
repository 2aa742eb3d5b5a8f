//! In-memory store for tests and single-process use.
//!
//! Committed data sits behind one `RwLock`; each transaction buffers its writes
//! and applies them in a single write-locked step at commit. Row locks come
//! from a separate [`LockTable`], so a transaction waiting on a row never holds
//! the data lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard};
use std::time::Duration;

use orderflow_core::{
    AllocationId, CatalogItemId, Entity, LineItemId, OrderId, OrderKind, StockUnitId,
};
use orderflow_orders::{Allocation, CustomState, LineItem, Order, StockUnit, TrackingEntry};

use super::locks::{LockTable, RowKey};
use super::{DueQuery, Store, StoreError, StoreResult, StoreTx};

const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct Tables {
    orders: HashMap<OrderId, Order>,
    references: HashMap<(OrderKind, String), OrderId>,
    lines: HashMap<LineItemId, LineItem>,
    units: HashMap<StockUnitId, StockUnit>,
    allocations: HashMap<AllocationId, Allocation>,
    tracking: Vec<TrackingEntry>,
    tracking_seq: u64,
    counters: HashMap<OrderKind, u64>,
    custom_states: Vec<CustomState>,
}

/// Pending writes; `None` marks a deletion.
#[derive(Debug, Default)]
struct WriteSet {
    orders: HashMap<OrderId, Option<Order>>,
    lines: HashMap<LineItemId, Option<LineItem>>,
    units: HashMap<StockUnitId, Option<StockUnit>>,
    allocations: HashMap<AllocationId, Option<Allocation>>,
    tracking: Vec<TrackingEntry>,
    counters: HashMap<OrderKind, u64>,
    custom_states: Vec<CustomState>,
}

#[derive(Debug)]
pub struct InMemoryStore {
    data: RwLock<Tables>,
    locks: LockTable,
    lock_wait: Duration,
    next_tx: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_lock_wait(DEFAULT_LOCK_WAIT)
    }

    pub fn with_lock_wait(lock_wait: Duration) -> Self {
        Self {
            data: RwLock::new(Tables::default()),
            locks: LockTable::default(),
            lock_wait,
            next_tx: AtomicU64::new(1),
        }
    }

    fn read(&self) -> StoreResult<RwLockReadGuard<'_, Tables>> {
        self.data
            .read()
            .map_err(|_| StoreError::Backend("in-memory store poisoned".into()))
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for InMemoryStore {
    fn begin(&self) -> StoreResult<Box<dyn StoreTx + '_>> {
        Ok(Box::new(InMemoryTx {
            store: self,
            id: self.next_tx.fetch_add(1, Ordering::Relaxed),
            held: Vec::new(),
            writes: WriteSet::default(),
        }))
    }
}

struct InMemoryTx<'a> {
    store: &'a InMemoryStore,
    id: u64,
    held: Vec<RowKey>,
    writes: WriteSet,
}

fn lookup<E: Entity + Clone>(
    committed: &HashMap<E::Id, E>,
    pending: &HashMap<E::Id, Option<E>>,
    id: E::Id,
) -> Option<E> {
    match pending.get(&id) {
        Some(entry) => entry.clone(),
        None => committed.get(&id).cloned(),
    }
}

fn select<E: Entity + Clone>(
    committed: &HashMap<E::Id, E>,
    pending: &HashMap<E::Id, Option<E>>,
    keep: impl Fn(&E) -> bool,
) -> Vec<E> {
    let mut out: Vec<E> = committed
        .values()
        .filter(|e| !pending.contains_key(&e.id()) && keep(e))
        .cloned()
        .collect();
    out.extend(pending.values().flatten().filter(|e| keep(e)).cloned());
    out
}

fn exists<E: Entity + Clone>(
    committed: &HashMap<E::Id, E>,
    pending: &HashMap<E::Id, Option<E>>,
    id: E::Id,
) -> bool {
    lookup(committed, pending, id).is_some()
}

impl InMemoryTx<'_> {
    fn lock(&mut self, key: RowKey) -> StoreResult<()> {
        self.store.locks.acquire(key, self.id, self.store.lock_wait)?;
        if !self.held.contains(&key) {
            self.held.push(key);
        }
        Ok(())
    }

    fn reference_taken(&self, tables: &Tables, order: &Order) -> bool {
        let committed_owner = tables
            .references
            .get(&(order.kind, order.reference.clone()))
            .is_some_and(|owner| *owner != order.id && !self.writes.orders.contains_key(owner));
        let pending_owner = self.writes.orders.values().flatten().any(|other| {
            other.id != order.id && other.kind == order.kind && other.reference == order.reference
        });
        committed_owner || pending_owner
    }
}

impl StoreTx for InMemoryTx<'_> {
    fn insert_order(&mut self, order: &Order) -> StoreResult<()> {
        let tables = self.store.read()?;
        if exists(&tables.orders, &self.writes.orders, order.id) {
            return Err(StoreError::UniqueViolation(format!("order id {}", order.id)));
        }
        if self.reference_taken(&tables, order) {
            return Err(StoreError::UniqueViolation(format!(
                "{} reference {}",
                order.kind, order.reference
            )));
        }
        drop(tables);
        self.writes.orders.insert(order.id, Some(order.clone()));
        Ok(())
    }

    fn get_order(&mut self, id: OrderId) -> StoreResult<Option<Order>> {
        let tables = self.store.read()?;
        Ok(lookup(&tables.orders, &self.writes.orders, id))
    }

    fn lock_order(&mut self, id: OrderId) -> StoreResult<Order> {
        self.lock(RowKey::Order(id))?;
        self.get_order(id)?
            .ok_or_else(|| StoreError::not_found("order", id))
    }

    fn update_order(&mut self, order: &Order) -> StoreResult<()> {
        if self.get_order(order.id)?.is_none() {
            return Err(StoreError::not_found("order", order.id));
        }
        self.writes.orders.insert(order.id, Some(order.clone()));
        Ok(())
    }

    fn delete_order(&mut self, id: OrderId) -> StoreResult<()> {
        if self.get_order(id)?.is_none() {
            return Err(StoreError::not_found("order", id));
        }
        for line in self.lines_for_order(id)? {
            self.writes.lines.insert(line.id, None);
        }
        self.writes.tracking.retain(|e| e.order != id);
        self.writes.orders.insert(id, None);
        Ok(())
    }

    fn find_order_by_reference(
        &mut self,
        kind: OrderKind,
        reference: &str,
    ) -> StoreResult<Option<Order>> {
        let tables = self.store.read()?;
        Ok(select(&tables.orders, &self.writes.orders, |o| {
            o.kind == kind && o.reference == reference
        })
        .into_iter()
        .next())
    }

    fn due_orders(&mut self, query: &DueQuery) -> StoreResult<Vec<Order>> {
        let tables = self.store.read()?;
        let mut orders = select(&tables.orders, &self.writes.orders, |o| query.matches(o));
        orders.sort_by(|a, b| (a.due_date, a.reference_seq).cmp(&(b.due_date, b.reference_seq)));
        Ok(orders)
    }

    fn lock_counter(&mut self, kind: OrderKind) -> StoreResult<u64> {
        self.lock(RowKey::Counter(kind))?;
        if let Some(value) = self.writes.counters.get(&kind) {
            return Ok(*value);
        }
        let tables = self.store.read()?;
        Ok(tables.counters.get(&kind).copied().unwrap_or(0))
    }

    fn set_counter(&mut self, kind: OrderKind, value: u64) -> StoreResult<()> {
        self.lock(RowKey::Counter(kind))?;
        self.writes.counters.insert(kind, value);
        Ok(())
    }

    fn max_reference_seq(&mut self, kind: OrderKind) -> StoreResult<u64> {
        let tables = self.store.read()?;
        Ok(select(&tables.orders, &self.writes.orders, |o| o.kind == kind)
            .iter()
            .map(|o| o.reference_seq)
            .max()
            .unwrap_or(0))
    }

    fn insert_line(&mut self, line: &LineItem) -> StoreResult<()> {
        let tables = self.store.read()?;
        if exists(&tables.lines, &self.writes.lines, line.id) {
            return Err(StoreError::UniqueViolation(format!("line item id {}", line.id)));
        }
        if !exists(&tables.orders, &self.writes.orders, line.order) {
            return Err(StoreError::not_found("order", line.order));
        }
        drop(tables);
        self.writes.lines.insert(line.id, Some(line.clone()));
        Ok(())
    }

    fn get_line(&mut self, id: LineItemId) -> StoreResult<Option<LineItem>> {
        let tables = self.store.read()?;
        Ok(lookup(&tables.lines, &self.writes.lines, id))
    }

    fn lock_line(&mut self, id: LineItemId) -> StoreResult<LineItem> {
        self.lock(RowKey::Line(id))?;
        self.get_line(id)?
            .ok_or_else(|| StoreError::not_found("line item", id))
    }

    fn update_line(&mut self, line: &LineItem) -> StoreResult<()> {
        if self.get_line(line.id)?.is_none() {
            return Err(StoreError::not_found("line item", line.id));
        }
        self.writes.lines.insert(line.id, Some(line.clone()));
        Ok(())
    }

    fn delete_line(&mut self, id: LineItemId) -> StoreResult<()> {
        if self.get_line(id)?.is_none() {
            return Err(StoreError::not_found("line item", id));
        }
        self.writes.lines.insert(id, None);
        Ok(())
    }

    fn lines_for_order(&mut self, order: OrderId) -> StoreResult<Vec<LineItem>> {
        let tables = self.store.read()?;
        let mut lines = select(&tables.lines, &self.writes.lines, |l| l.order == order);
        lines.sort_by_key(|l| l.id);
        Ok(lines)
    }

    fn insert_stock_unit(&mut self, unit: &StockUnit) -> StoreResult<()> {
        let tables = self.store.read()?;
        if exists(&tables.units, &self.writes.units, unit.id) {
            return Err(StoreError::UniqueViolation(format!("stock unit id {}", unit.id)));
        }
        drop(tables);
        self.writes.units.insert(unit.id, Some(unit.clone()));
        Ok(())
    }

    fn get_stock_unit(&mut self, id: StockUnitId) -> StoreResult<Option<StockUnit>> {
        let tables = self.store.read()?;
        Ok(lookup(&tables.units, &self.writes.units, id))
    }

    fn lock_stock_unit(&mut self, id: StockUnitId) -> StoreResult<StockUnit> {
        self.lock(RowKey::StockUnit(id))?;
        self.get_stock_unit(id)?
            .ok_or_else(|| StoreError::not_found("stock unit", id))
    }

    fn update_stock_unit(&mut self, unit: &StockUnit) -> StoreResult<()> {
        if self.get_stock_unit(unit.id)?.is_none() {
            return Err(StoreError::not_found("stock unit", unit.id));
        }
        self.writes.units.insert(unit.id, Some(unit.clone()));
        Ok(())
    }

    fn stock_units_for_item(&mut self, item: CatalogItemId) -> StoreResult<Vec<StockUnit>> {
        let tables = self.store.read()?;
        let mut units = select(&tables.units, &self.writes.units, |u| u.catalog_item == item);
        units.sort_by_key(|u| u.id);
        Ok(units)
    }

    fn insert_allocation(&mut self, allocation: &Allocation) -> StoreResult<()> {
        let tables = self.store.read()?;
        if exists(&tables.allocations, &self.writes.allocations, allocation.id) {
            return Err(StoreError::UniqueViolation(format!(
                "allocation id {}",
                allocation.id
            )));
        }
        drop(tables);
        self.writes
            .allocations
            .insert(allocation.id, Some(allocation.clone()));
        Ok(())
    }

    fn get_allocation(&mut self, id: AllocationId) -> StoreResult<Option<Allocation>> {
        let tables = self.store.read()?;
        Ok(lookup(&tables.allocations, &self.writes.allocations, id))
    }

    fn update_allocation(&mut self, allocation: &Allocation) -> StoreResult<()> {
        if self.get_allocation(allocation.id)?.is_none() {
            return Err(StoreError::not_found("allocation", allocation.id));
        }
        self.writes
            .allocations
            .insert(allocation.id, Some(allocation.clone()));
        Ok(())
    }

    fn delete_allocation(&mut self, id: AllocationId) -> StoreResult<()> {
        if self.get_allocation(id)?.is_none() {
            return Err(StoreError::not_found("allocation", id));
        }
        self.writes.allocations.insert(id, None);
        Ok(())
    }

    fn allocations_for_unit(&mut self, unit: StockUnitId) -> StoreResult<Vec<Allocation>> {
        let tables = self.store.read()?;
        let mut out = select(&tables.allocations, &self.writes.allocations, |a| {
            a.stock_unit == unit
        });
        out.sort_by_key(|a| a.id);
        Ok(out)
    }

    fn allocations_for_line(&mut self, line: LineItemId) -> StoreResult<Vec<Allocation>> {
        let tables = self.store.read()?;
        let mut out = select(&tables.allocations, &self.writes.allocations, |a| a.line == line);
        out.sort_by_key(|a| a.id);
        Ok(out)
    }

    fn allocations_for_order(&mut self, order: OrderId) -> StoreResult<Vec<Allocation>> {
        let tables = self.store.read()?;
        let mut out = select(&tables.allocations, &self.writes.allocations, |a| {
            a.order == order
        });
        out.sort_by_key(|a| a.id);
        Ok(out)
    }

    fn append_tracking(&mut self, entry: &TrackingEntry) -> StoreResult<()> {
        if self.get_order(entry.order)?.is_none() {
            return Err(StoreError::not_found("order", entry.order));
        }
        self.writes.tracking.push(entry.clone());
        Ok(())
    }

    fn tracking_for_order(&mut self, order: OrderId) -> StoreResult<Vec<TrackingEntry>> {
        let tables = self.store.read()?;
        let mut out: Vec<TrackingEntry> = tables
            .tracking
            .iter()
            .filter(|e| e.order == order)
            .cloned()
            .collect();
        out.sort_by_key(|e| e.sequence);
        out.extend(self.writes.tracking.iter().filter(|e| e.order == order).cloned());
        Ok(out)
    }

    fn custom_states(&mut self) -> StoreResult<Vec<CustomState>> {
        let tables = self.store.read()?;
        let mut out = tables.custom_states.clone();
        out.extend(self.writes.custom_states.iter().cloned());
        Ok(out)
    }

    fn insert_custom_state(&mut self, state: &CustomState) -> StoreResult<()> {
        let duplicate = self
            .custom_states()?
            .iter()
            .any(|s| s.kind == state.kind && s.key == state.key);
        if duplicate {
            return Err(StoreError::UniqueViolation(format!(
                "{} custom status {}",
                state.kind, state.key
            )));
        }
        self.writes.custom_states.push(state.clone());
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> StoreResult<()> {
        let writes = std::mem::take(&mut self.writes);
        let mut tables = self
            .store
            .data
            .write()
            .map_err(|_| StoreError::Backend("in-memory store poisoned".into()))?;

        for order in writes.orders.values().flatten() {
            let owner = tables.references.get(&(order.kind, order.reference.clone()));
            if owner.is_some_and(|owner| *owner != order.id && !writes.orders.contains_key(owner)) {
                return Err(StoreError::UniqueViolation(format!(
                    "{} reference {}",
                    order.kind, order.reference
                )));
            }
        }
        for state in &writes.custom_states {
            if tables
                .custom_states
                .iter()
                .any(|s| s.kind == state.kind && s.key == state.key)
            {
                return Err(StoreError::UniqueViolation(format!(
                    "{} custom status {}",
                    state.kind, state.key
                )));
            }
        }

        for (id, order) in writes.orders {
            match order {
                Some(order) => {
                    if let Some(previous) = tables.orders.get(&id) {
                        let key = (previous.kind, previous.reference.clone());
                        if tables.references.get(&key) == Some(&id) {
                            tables.references.remove(&key);
                        }
                    }
                    tables
                        .references
                        .insert((order.kind, order.reference.clone()), id);
                    tables.orders.insert(id, order);
                }
                None => {
                    if let Some(previous) = tables.orders.remove(&id) {
                        let key = (previous.kind, previous.reference);
                        if tables.references.get(&key) == Some(&id) {
                            tables.references.remove(&key);
                        }
                    }
                    tables.lines.retain(|_, line| line.order != id);
                    tables.tracking.retain(|entry| entry.order != id);
                }
            }
        }
        apply(&mut tables.lines, writes.lines);
        apply(&mut tables.units, writes.units);
        apply(&mut tables.allocations, writes.allocations);
        for (kind, value) in writes.counters {
            tables.counters.insert(kind, value);
        }
        for mut entry in writes.tracking {
            tables.tracking_seq += 1;
            entry.sequence = tables.tracking_seq;
            tables.tracking.push(entry);
        }
        tables.custom_states.extend(writes.custom_states);
        drop(tables);

        let held = std::mem::take(&mut self.held);
        self.store.locks.release_all(self.id, &held);
        Ok(())
    }
}

fn apply<E: Entity>(table: &mut HashMap<E::Id, E>, writes: HashMap<E::Id, Option<E>>) {
    for (id, entry) in writes {
        match entry {
            Some(entry) => {
                table.insert(id, entry);
            }
            None => {
                table.remove(&id);
            }
        }
    }
}

impl Drop for InMemoryTx<'_> {
    fn drop(&mut self) {
        self.store.locks.release_all(self.id, &self.held);
    }
}
