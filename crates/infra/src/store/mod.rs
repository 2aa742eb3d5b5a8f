//! Repository seam over a transactional store with row locks.
//!
//! Every engine operation runs inside one [`StoreTx`]:
//! - `lock_*` methods take an exclusive row lock held until commit or drop,
//!   waiting at most the store's configured bound before failing with
//!   [`StoreError::LockTimeout`]
//! - reads return the latest committed data overlaid with the transaction's
//!   own writes
//! - writes become visible to others only at [`StoreTx::commit`]; dropping an
//!   uncommitted transaction discards them
//!
//! Lock order used by callers: order, then line items, then stock units, each
//! group in id order.

use std::sync::Arc;

use chrono::NaiveDate;
use thiserror::Error;

use orderflow_core::{
    AllocationId, CatalogItemId, LineItemId, OrderError, OrderId, OrderKind, StatusCode,
    StockUnitId,
};
use orderflow_orders::{Allocation, CustomState, LineItem, Order, StockUnit, TrackingEntry};

pub mod in_memory;
mod locks;
pub mod postgres;

pub use in_memory::InMemoryStore;
pub use postgres::PostgresStore;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),

    #[error("lock wait timed out on {0}")]
    LockTimeout(String),

    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl core::fmt::Display) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

impl From<StoreError> for OrderError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, id } => OrderError::NotFound { entity, id },
            StoreError::LockTimeout(resource) => OrderError::Busy { resource },
            StoreError::UniqueViolation(msg) => OrderError::Storage(msg),
            StoreError::Backend(msg) => OrderError::Storage(msg),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Orders of one kind whose due date falls before `due_before` (and on or
/// after `due_on_or_after`, when set), restricted to `statuses`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueQuery {
    pub kind: OrderKind,
    pub statuses: Vec<StatusCode>,
    pub due_on_or_after: Option<NaiveDate>,
    pub due_before: NaiveDate,
}

impl DueQuery {
    pub fn matches(&self, order: &Order) -> bool {
        order.kind == self.kind
            && self.statuses.contains(&order.status)
            && order.due_date.is_some_and(|due| {
                due < self.due_before && self.due_on_or_after.is_none_or(|from| due >= from)
            })
    }
}

pub trait StoreTx {
    fn insert_order(&mut self, order: &Order) -> StoreResult<()>;
    fn get_order(&mut self, id: OrderId) -> StoreResult<Option<Order>>;
    fn lock_order(&mut self, id: OrderId) -> StoreResult<Order>;
    fn update_order(&mut self, order: &Order) -> StoreResult<()>;
    /// Removes the order together with its lines and tracking entries.
    fn delete_order(&mut self, id: OrderId) -> StoreResult<()>;
    fn find_order_by_reference(
        &mut self,
        kind: OrderKind,
        reference: &str,
    ) -> StoreResult<Option<Order>>;
    fn due_orders(&mut self, query: &DueQuery) -> StoreResult<Vec<Order>>;

    /// Locks the kind's counter row and returns its value (0 if never set).
    fn lock_counter(&mut self, kind: OrderKind) -> StoreResult<u64>;
    fn set_counter(&mut self, kind: OrderKind, value: u64) -> StoreResult<()>;
    fn max_reference_seq(&mut self, kind: OrderKind) -> StoreResult<u64>;

    fn insert_line(&mut self, line: &LineItem) -> StoreResult<()>;
    fn get_line(&mut self, id: LineItemId) -> StoreResult<Option<LineItem>>;
    fn lock_line(&mut self, id: LineItemId) -> StoreResult<LineItem>;
    fn update_line(&mut self, line: &LineItem) -> StoreResult<()>;
    fn delete_line(&mut self, id: LineItemId) -> StoreResult<()>;
    /// Lines of `order` in id order.
    fn lines_for_order(&mut self, order: OrderId) -> StoreResult<Vec<LineItem>>;

    fn insert_stock_unit(&mut self, unit: &StockUnit) -> StoreResult<()>;
    fn get_stock_unit(&mut self, id: StockUnitId) -> StoreResult<Option<StockUnit>>;
    fn lock_stock_unit(&mut self, id: StockUnitId) -> StoreResult<StockUnit>;
    fn update_stock_unit(&mut self, unit: &StockUnit) -> StoreResult<()>;
    fn stock_units_for_item(&mut self, item: CatalogItemId) -> StoreResult<Vec<StockUnit>>;

    fn insert_allocation(&mut self, allocation: &Allocation) -> StoreResult<()>;
    fn get_allocation(&mut self, id: AllocationId) -> StoreResult<Option<Allocation>>;
    fn update_allocation(&mut self, allocation: &Allocation) -> StoreResult<()>;
    fn delete_allocation(&mut self, id: AllocationId) -> StoreResult<()>;
    fn allocations_for_unit(&mut self, unit: StockUnitId) -> StoreResult<Vec<Allocation>>;
    fn allocations_for_line(&mut self, line: LineItemId) -> StoreResult<Vec<Allocation>>;
    fn allocations_for_order(&mut self, order: OrderId) -> StoreResult<Vec<Allocation>>;

    /// Appends an entry. The store assigns its `sequence`; entries of one order
    /// are sequenced in commit order.
    fn append_tracking(&mut self, entry: &TrackingEntry) -> StoreResult<()>;
    /// Entries of `order`, oldest first.
    fn tracking_for_order(&mut self, order: OrderId) -> StoreResult<Vec<TrackingEntry>>;

    fn custom_states(&mut self) -> StoreResult<Vec<CustomState>>;
    fn insert_custom_state(&mut self, state: &CustomState) -> StoreResult<()>;

    fn commit(self: Box<Self>) -> StoreResult<()>;
}

pub trait Store: Send + Sync {
    fn begin(&self) -> StoreResult<Box<dyn StoreTx + '_>>;
}

impl<S> Store for Arc<S>
where
    S: Store + ?Sized,
{
    fn begin(&self) -> StoreResult<Box<dyn StoreTx + '_>> {
        (**self).begin()
    }
}
