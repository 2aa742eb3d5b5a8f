//! Allocation ledger: reservations of stock-unit quantity to line items.
//!
//! The invariant guarded here is `Σ allocation.quantity ≤ unit.total_quantity`
//! for every stock unit. Each operation runs in one store transaction and
//! takes its row locks in the global order: order, then line items, then
//! stock units. Two allocations racing for the same unit therefore serialize
//! on the unit row and the loser sees the winner's reservation.
//!
//! The `*_in` functions run inside a caller's transaction. They never write
//! the line item themselves when the caller passes it in; the caller writes
//! it once after all counter changes.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info, instrument};

use orderflow_core::{
    AllocationId, LineItemId, OrderError, OrderId, OrderResult, Quantity, QuantityLimit,
    StockUnitId,
};
use orderflow_orders::{
    Actor, Allocation, LineItem, Order, Settlement, StockFlow, StockStatus, StockUnit,
    TrackingCode, descriptor,
};

use crate::store::{Store, StoreTx};
use crate::tracking::record_in;

#[derive(Debug)]
pub struct AllocationLedger<S> {
    store: Arc<S>,
}

impl<S> Clone for AllocationLedger<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: Store> AllocationLedger<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Reserve `quantity` of `unit` for `line`. A second reservation of the
    /// same unit for the same line grows the existing allocation.
    #[instrument(skip(self), fields(line = %line, unit = %unit, quantity = %quantity), err)]
    pub fn allocate(
        &self,
        line: LineItemId,
        unit: StockUnitId,
        quantity: Quantity,
        actor: Actor,
    ) -> OrderResult<Allocation> {
        let mut tx = self.store.begin()?;
        let allocation = allocate_in(tx.as_mut(), line, unit, quantity, actor)?;
        tx.commit()?;
        debug!(allocation = %allocation.id, total = %allocation.quantity, "stock allocated");
        Ok(allocation)
    }

    /// Reserve the unreserved remainder of every line of `order`. Each line
    /// takes the largest unit that covers its remainder alone. Every line is
    /// planned before anything is written, so a shortage on any line fails
    /// the whole call with no allocation changed. In a fulfilment state the
    /// new reservations are fulfilled as well.
    #[instrument(skip(self), fields(order = %order), err)]
    pub fn allocate_all(&self, order: OrderId, actor: Actor) -> OrderResult<Vec<Allocation>> {
        let mut tx = self.store.begin()?;
        let current = tx.lock_order(order)?;
        let d = descriptor(current.kind);
        if d.stock_flow != StockFlow::Outbound {
            return Err(OrderError::validation(format!(
                "{} orders receive stock and cannot allocate it",
                current.kind
            )));
        }
        if !current.is_open() {
            return Err(OrderError::validation(format!(
                "order {} is not open (status '{}')",
                current.reference,
                d.label(current.status)
            )));
        }

        let mut pending = Vec::new();
        for line in tx.lines_for_order(order)? {
            if line.unreserved().is_positive() {
                pending.push(tx.lock_line(line.id)?);
            }
        }
        if pending.is_empty() {
            return Err(OrderError::validation(format!(
                "order {} has no unreserved lines",
                current.reference
            )));
        }

        let mut claimed: BTreeMap<StockUnitId, Quantity> = BTreeMap::new();
        let mut plan = Vec::with_capacity(pending.len());
        for line in &pending {
            let remaining = line.unreserved();
            let mut units = tx.stock_units_for_item(line.catalog_item)?;
            units.sort_by(|a, b| b.total_quantity.cmp(&a.total_quantity));

            let mut chosen = None;
            let mut best: Option<(StockUnitId, Quantity)> = None;
            for unit in &units {
                if unit.is_serialized() && remaining != Quantity::ONE {
                    continue;
                }
                let taken = claimed.get(&unit.id).copied().unwrap_or(Quantity::ZERO);
                let free = available_in(tx.as_mut(), unit)?.saturating_sub(taken);
                if free >= remaining {
                    chosen = Some(unit.id);
                    break;
                }
                if best.is_none_or(|(_, most)| free > most) {
                    best = Some((unit.id, free));
                }
            }
            let unit = match (chosen, best) {
                (Some(unit), _) => unit,
                (None, Some((stock_unit, available))) => {
                    return Err(OrderError::InsufficientStock {
                        stock_unit,
                        requested: remaining,
                        available,
                    });
                }
                (None, None) => {
                    return Err(OrderError::not_found(
                        "stock unit for catalog item",
                        line.catalog_item,
                    ));
                }
            };
            *claimed.entry(unit).or_insert(Quantity::ZERO) += remaining;
            plan.push((line.id, unit, remaining));
        }

        for unit in claimed.keys() {
            tx.lock_stock_unit(*unit)?;
        }
        let fulfil_now = d.fulfil_states.contains(&current.status);
        let mut allocations = Vec::with_capacity(plan.len());
        for (line_id, unit, quantity) in plan {
            let mut allocation = allocate_in(tx.as_mut(), line_id, unit, quantity, actor)?;
            if fulfil_now {
                let mut line = tx.lock_line(line_id)?;
                allocation = fulfil_in(tx.as_mut(), &mut line, allocation, quantity)?;
                tx.update_line(&line)?;
                record_in(
                    tx.as_mut(),
                    order,
                    TrackingCode::StockFulfilled,
                    actor,
                    "",
                    json!({
                        "allocation": allocation.id,
                        "line": line_id,
                        "stock_unit": unit,
                        "quantity": quantity,
                    }),
                )?;
            }
            allocations.push(allocation);
        }
        tx.commit()?;
        debug!(order = %order, lines = allocations.len(), fulfilled = fulfil_now, "order allocated");
        Ok(allocations)
    }

    /// Give back `quantity` of the unfulfilled part of an allocation.
    /// Returns `None` when the allocation reached zero and was removed.
    #[instrument(skip(self), fields(allocation = %allocation, quantity = %quantity), err)]
    pub fn release(
        &self,
        allocation: AllocationId,
        quantity: Quantity,
        actor: Actor,
    ) -> OrderResult<Option<Allocation>> {
        let mut tx = self.store.begin()?;
        let probe = tx
            .get_allocation(allocation)?
            .ok_or_else(|| OrderError::not_found("allocation", allocation))?;
        let order = tx.lock_order(probe.order)?;
        let mut line = tx.lock_line(probe.line)?;
        tx.lock_stock_unit(probe.stock_unit)?;
        let current = tx
            .get_allocation(allocation)?
            .ok_or_else(|| OrderError::not_found("allocation", allocation))?;

        let remaining = unreserve_in(tx.as_mut(), &mut line, current, quantity)?;
        tx.update_line(&line)?;
        record_in(
            tx.as_mut(),
            order.id,
            TrackingCode::AllocationReleased,
            actor,
            "",
            json!({
                "allocation": allocation,
                "line": line.id,
                "stock_unit": probe.stock_unit,
                "quantity": quantity,
            }),
        )?;
        tx.commit()?;
        Ok(remaining)
    }

    /// Quantity of `unit` not reserved by any allocation. Zero for units
    /// whose status forbids allocation.
    pub fn available(&self, unit: StockUnitId) -> OrderResult<Quantity> {
        let mut tx = self.store.begin()?;
        let unit = tx
            .get_stock_unit(unit)?
            .ok_or_else(|| OrderError::not_found("stock unit", unit))?;
        available_in(tx.as_mut(), &unit)
    }

    /// Mark `quantity` of an allocation as physically taken (shipped,
    /// installed, handed out on loan).
    #[instrument(skip(self), fields(allocation = %allocation, quantity = %quantity), err)]
    pub fn fulfil(
        &self,
        allocation: AllocationId,
        quantity: Quantity,
        actor: Actor,
    ) -> OrderResult<Allocation> {
        let mut tx = self.store.begin()?;
        let probe = tx
            .get_allocation(allocation)?
            .ok_or_else(|| OrderError::not_found("allocation", allocation))?;
        let order = tx.lock_order(probe.order)?;
        let d = descriptor(order.kind);
        if d.stock_flow != StockFlow::Outbound || !d.fulfil_states.contains(&order.status) {
            return Err(OrderError::validation(format!(
                "order {} cannot fulfil stock in status '{}'",
                order.reference,
                d.label(order.status)
            )));
        }
        let mut line = tx.lock_line(probe.line)?;
        tx.lock_stock_unit(probe.stock_unit)?;
        let current = tx
            .get_allocation(allocation)?
            .ok_or_else(|| OrderError::not_found("allocation", allocation))?;

        let updated = fulfil_in(tx.as_mut(), &mut line, current, quantity)?;
        tx.update_line(&line)?;
        record_in(
            tx.as_mut(),
            order.id,
            TrackingCode::StockFulfilled,
            actor,
            "",
            json!({
                "allocation": updated.id,
                "line": line.id,
                "stock_unit": updated.stock_unit,
                "quantity": quantity,
            }),
        )?;
        tx.commit()?;
        Ok(updated)
    }

    /// Receive stock against a line of an inbound order. A new stock unit is
    /// created and reserved to the line as already fulfilled.
    #[instrument(skip(self, serial), fields(line = %line, quantity = %quantity), err)]
    pub fn receive(
        &self,
        line: LineItemId,
        quantity: Quantity,
        serial: Option<String>,
        actor: Actor,
    ) -> OrderResult<Allocation> {
        let mut tx = self.store.begin()?;
        let probe = tx
            .get_line(line)?
            .ok_or_else(|| OrderError::not_found("line item", line))?;
        let order = tx.lock_order(probe.order)?;
        let allocation = receive_in(tx.as_mut(), &order, line, quantity, serial, actor)?;
        tx.commit()?;
        Ok(allocation)
    }

    /// Stock count: set the unit's total. The total must still cover every
    /// reservation on the unit.
    #[instrument(skip(self), fields(unit = %unit, new_total = %new_total), err)]
    pub fn adjust_stock(
        &self,
        unit: StockUnitId,
        new_total: Quantity,
        actor: Actor,
    ) -> OrderResult<StockUnit> {
        let mut tx = self.store.begin()?;
        let mut stock = tx.lock_stock_unit(unit)?;
        if stock.is_serialized() && new_total > Quantity::ONE {
            return Err(OrderError::exceeded(
                QuantityLimit::SerializedUnit,
                new_total,
                Quantity::ONE,
            ));
        }
        let reserved = reserved_in(tx.as_mut(), unit)?;
        if new_total < reserved {
            return Err(OrderError::InsufficientStock {
                stock_unit: unit,
                requested: reserved,
                available: new_total,
            });
        }
        let previous = stock.total_quantity;
        stock.total_quantity = new_total;
        tx.update_stock_unit(&stock)?;
        tx.commit()?;
        info!(unit = %unit, %previous, %new_total, actor = ?actor, "stock adjusted");
        Ok(stock)
    }
}

/// Σ allocation quantity on `unit`.
pub(crate) fn reserved_in(tx: &mut dyn StoreTx, unit: StockUnitId) -> OrderResult<Quantity> {
    Ok(tx
        .allocations_for_unit(unit)?
        .iter()
        .map(|a| a.quantity)
        .sum())
}

pub(crate) fn available_in(tx: &mut dyn StoreTx, unit: &StockUnit) -> OrderResult<Quantity> {
    if !unit.status.is_allocatable() {
        return Ok(Quantity::ZERO);
    }
    let reserved = reserved_in(tx, unit.id)?;
    Ok(unit.total_quantity.saturating_sub(reserved))
}

pub(crate) fn allocate_in(
    tx: &mut dyn StoreTx,
    line_id: LineItemId,
    unit_id: StockUnitId,
    quantity: Quantity,
    actor: Actor,
) -> OrderResult<Allocation> {
    if !quantity.is_positive() {
        return Err(OrderError::validation("allocation quantity must be greater than zero"));
    }
    let probe = tx
        .get_line(line_id)?
        .ok_or_else(|| OrderError::not_found("line item", line_id))?;
    let order = tx.lock_order(probe.order)?;
    let d = descriptor(order.kind);
    if d.stock_flow != StockFlow::Outbound {
        return Err(OrderError::validation(format!(
            "{} orders receive stock and cannot allocate it",
            order.kind
        )));
    }
    if !order.is_open() {
        return Err(OrderError::validation(format!(
            "order {} is not open (status '{}')",
            order.reference,
            d.label(order.status)
        )));
    }

    let mut line = tx.lock_line(line_id)?;
    let unit = tx.lock_stock_unit(unit_id)?;
    if unit.catalog_item != line.catalog_item {
        return Err(OrderError::validation(format!(
            "stock unit {} holds catalog item {}, line {} needs {}",
            unit.id, unit.catalog_item, line.id, line.catalog_item
        )));
    }
    if unit.is_serialized() && quantity != Quantity::ONE {
        return Err(OrderError::exceeded(
            QuantityLimit::SerializedUnit,
            quantity,
            Quantity::ONE,
        ));
    }
    let available = available_in(tx, &unit)?;
    if quantity > available {
        return Err(OrderError::InsufficientStock {
            stock_unit: unit.id,
            requested: quantity,
            available,
        });
    }
    line.reserve(quantity)?;

    let existing = tx
        .allocations_for_line(line.id)?
        .into_iter()
        .find(|a| a.stock_unit == unit.id);
    let allocation = match existing {
        Some(mut allocation) => {
            allocation.quantity += quantity;
            tx.update_allocation(&allocation)?;
            allocation
        }
        None => {
            let allocation = Allocation::new(&line, &unit, quantity);
            tx.insert_allocation(&allocation)?;
            allocation
        }
    };
    tx.update_line(&line)?;
    record_in(
        tx,
        order.id,
        TrackingCode::StockAllocated,
        actor,
        "",
        json!({
            "allocation": allocation.id,
            "line": line.id,
            "stock_unit": unit.id,
            "quantity": quantity,
        }),
    )?;
    Ok(allocation)
}

/// Drop `quantity` from the unfulfilled part of `allocation`.
pub(crate) fn unreserve_in(
    tx: &mut dyn StoreTx,
    line: &mut LineItem,
    mut allocation: Allocation,
    quantity: Quantity,
) -> OrderResult<Option<Allocation>> {
    if !quantity.is_positive() {
        return Err(OrderError::validation("release quantity must be greater than zero"));
    }
    let unfulfilled = allocation.unfulfilled();
    if quantity > unfulfilled {
        return Err(OrderError::exceeded(
            QuantityLimit::AllocationUnfulfilled,
            quantity,
            unfulfilled,
        ));
    }
    line.unreserve(quantity)?;
    allocation.quantity = allocation.quantity.saturating_sub(quantity);
    if allocation.quantity.is_zero() {
        tx.delete_allocation(allocation.id)?;
        Ok(None)
    } else {
        tx.update_allocation(&allocation)?;
        Ok(Some(allocation))
    }
}

pub(crate) fn fulfil_in(
    tx: &mut dyn StoreTx,
    line: &mut LineItem,
    mut allocation: Allocation,
    quantity: Quantity,
) -> OrderResult<Allocation> {
    if !quantity.is_positive() {
        return Err(OrderError::validation("fulfil quantity must be greater than zero"));
    }
    let unfulfilled = allocation.unfulfilled();
    if quantity > unfulfilled {
        return Err(OrderError::exceeded(
            QuantityLimit::AllocationUnfulfilled,
            quantity,
            unfulfilled,
        ));
    }
    line.fulfil(quantity)?;
    allocation.fulfilled += quantity;
    tx.update_allocation(&allocation)?;
    Ok(allocation)
}

/// Take back loaned stock. `order` must already be locked by the caller.
/// Returns the shrunk allocation, or `None` when it was fully returned.
pub(crate) fn return_in(
    tx: &mut dyn StoreTx,
    order: &Order,
    allocation_id: AllocationId,
    quantity: Quantity,
    status: Option<StockStatus>,
    actor: Actor,
) -> OrderResult<Option<Allocation>> {
    let d = descriptor(order.kind);
    if !d.return_states.contains(&order.status) {
        return Err(OrderError::validation(format!(
            "order {} does not accept returns in status '{}'",
            order.reference,
            d.label(order.status)
        )));
    }
    if !quantity.is_positive() {
        return Err(OrderError::validation("return quantity must be greater than zero"));
    }
    let probe = tx
        .get_allocation(allocation_id)?
        .ok_or_else(|| OrderError::not_found("allocation", allocation_id))?;
    if probe.order != order.id {
        return Err(OrderError::validation(format!(
            "allocation {allocation_id} does not belong to order {}",
            order.reference
        )));
    }
    let mut line = tx.lock_line(probe.line)?;
    let mut unit = tx.lock_stock_unit(probe.stock_unit)?;
    let mut allocation = tx
        .get_allocation(allocation_id)?
        .ok_or_else(|| OrderError::not_found("allocation", allocation_id))?;

    if quantity > allocation.fulfilled {
        return Err(OrderError::InsufficientStock {
            stock_unit: unit.id,
            requested: quantity,
            available: allocation.fulfilled,
        });
    }
    line.give_back(quantity)?;
    allocation.quantity = allocation.quantity.saturating_sub(quantity);
    allocation.fulfilled = allocation.fulfilled.saturating_sub(quantity);
    let remaining = if allocation.quantity.is_zero() {
        tx.delete_allocation(allocation.id)?;
        None
    } else {
        tx.update_allocation(&allocation)?;
        Some(allocation)
    };
    if let Some(status) = status {
        unit.status = status;
        tx.update_stock_unit(&unit)?;
    }
    tx.update_line(&line)?;
    record_in(
        tx,
        order.id,
        TrackingCode::StockReturned,
        actor,
        "",
        json!({
            "allocation": allocation_id,
            "line": line.id,
            "stock_unit": unit.id,
            "quantity": quantity,
            "stock_status": status.map(StockStatus::code),
        }),
    )?;
    Ok(remaining)
}

/// Book received stock against a line. `order` must already be locked.
pub(crate) fn receive_in(
    tx: &mut dyn StoreTx,
    order: &Order,
    line_id: LineItemId,
    quantity: Quantity,
    serial: Option<String>,
    actor: Actor,
) -> OrderResult<Allocation> {
    let d = descriptor(order.kind);
    if d.stock_flow != StockFlow::Inbound {
        return Err(OrderError::validation(format!(
            "{} orders do not receive stock",
            order.kind
        )));
    }
    if !d.fulfil_states.contains(&order.status) {
        return Err(OrderError::validation(format!(
            "order {} cannot receive stock in status '{}'",
            order.reference,
            d.label(order.status)
        )));
    }
    if !quantity.is_positive() {
        return Err(OrderError::validation("received quantity must be greater than zero"));
    }
    let mut line = tx.lock_line(line_id)?;
    if line.order != order.id {
        return Err(OrderError::validation(format!(
            "line {line_id} does not belong to order {}",
            order.reference
        )));
    }
    let unit = match serial {
        Some(serial) => {
            if quantity != Quantity::ONE {
                return Err(OrderError::exceeded(
                    QuantityLimit::SerializedUnit,
                    quantity,
                    Quantity::ONE,
                ));
            }
            StockUnit::serialized(line.catalog_item, serial)?
        }
        None => StockUnit::new(line.catalog_item, quantity),
    };
    line.reserve(quantity)?;
    line.fulfil(quantity)?;
    tx.insert_stock_unit(&unit)?;

    let mut allocation = Allocation::new(&line, &unit, quantity);
    allocation.fulfilled = quantity;
    tx.insert_allocation(&allocation)?;
    tx.update_line(&line)?;
    record_in(
        tx,
        order.id,
        TrackingCode::StockReceived,
        actor,
        "",
        json!({
            "allocation": allocation.id,
            "line": line.id,
            "stock_unit": unit.id,
            "quantity": quantity,
            "serial": unit.serial,
        }),
    )?;
    Ok(allocation)
}

/// Apply `settlement` to the fulfilled part of `allocation` and remove it.
/// The unfulfilled part must have been released already. The stock unit
/// must be locked by the caller.
pub(crate) fn settle_in(
    tx: &mut dyn StoreTx,
    order: &Order,
    line: &mut LineItem,
    allocation: Allocation,
    settlement: Settlement,
) -> OrderResult<serde_json::Value> {
    let quantity = allocation.fulfilled;
    if settlement == Settlement::Reject && quantity.is_positive() {
        return Err(OrderError::validation(format!(
            "order {} still has {} outstanding on stock unit {}",
            order.reference, quantity, allocation.stock_unit
        )));
    }
    line.settle(quantity)?;
    tx.delete_allocation(allocation.id)?;

    let consumed = matches!(settlement, Settlement::Consume | Settlement::WriteOff);
    if consumed && quantity.is_positive() {
        let mut unit = tx
            .get_stock_unit(allocation.stock_unit)?
            .ok_or_else(|| OrderError::not_found("stock unit", allocation.stock_unit))?;
        if unit.is_serialized() {
            unit.status = match settlement {
                Settlement::WriteOff => StockStatus::Lost,
                _ => StockStatus::Consumed,
            };
        } else {
            unit.total_quantity = unit.total_quantity.saturating_sub(quantity);
        }
        tx.update_stock_unit(&unit)?;
    }

    Ok(json!({
        "allocation": allocation.id,
        "line": line.id,
        "stock_unit": allocation.stock_unit,
        "quantity": quantity,
        "settlement": format!("{settlement:?}").to_lowercase(),
    }))
}
