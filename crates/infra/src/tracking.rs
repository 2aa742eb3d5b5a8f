//! Append-only audit log per order.

use std::sync::Arc;

use tracing::instrument;

use orderflow_core::{OrderId, OrderResult};
use orderflow_orders::{Actor, TrackingCode, TrackingEntry};

use crate::store::{Store, StoreTx};

pub(crate) fn record_in(
    tx: &mut dyn StoreTx,
    order: OrderId,
    code: TrackingCode,
    actor: Actor,
    note: impl Into<String>,
    payload: serde_json::Value,
) -> OrderResult<TrackingEntry> {
    let entry = TrackingEntry::new(order, code, actor, note, payload);
    tx.append_tracking(&entry)?;
    Ok(entry)
}

/// Read and append access to tracking entries. There is no update or delete;
/// entries go away only with their order.
#[derive(Debug)]
pub struct TrackingLog<S> {
    store: Arc<S>,
}

impl<S> Clone for TrackingLog<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: Store> TrackingLog<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Append one entry in its own transaction. The returned copy still has
    /// sequence 0; [`Self::history`] shows the committed sequence.
    #[instrument(skip(self, note, payload), fields(order = %order, code = ?code), err)]
    pub fn record(
        &self,
        order: OrderId,
        code: TrackingCode,
        actor: Actor,
        note: impl Into<String>,
        payload: serde_json::Value,
    ) -> OrderResult<TrackingEntry> {
        let mut tx = self.store.begin()?;
        if tx.get_order(order)?.is_none() {
            return Err(orderflow_core::OrderError::not_found("order", order));
        }
        let entry = record_in(tx.as_mut(), order, code, actor, note, payload)?;
        tx.commit()?;
        Ok(entry)
    }

    /// Entries for `order`, newest first.
    pub fn history(&self, order: OrderId) -> OrderResult<Vec<TrackingEntry>> {
        let mut tx = self.store.begin()?;
        let mut entries = tx.tracking_for_order(order)?;
        entries.reverse();
        Ok(entries)
    }
}
