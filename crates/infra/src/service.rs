//! Order service: the engine's public face.
//!
//! Composes the reference generator, allocation ledger, transition
//! controller, tracking log, status registry and overdue sweep over one
//! store. Operations that span several components (loan returns with their
//! automatic status change, guarded deletion, custom statuses) live here.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::json;
use tracing::{info, instrument};

use orderflow_core::{
    AllocationId, CatalogItemId, LineItemId, OrderError, OrderId, OrderKind, OrderResult,
    Quantity, StatusCode, StockUnitId,
};
use orderflow_orders::{
    Actor, Allocation, CustomState, LineItem, LoanStatus, NewOrder, Order, ResolvedStatus,
    StatusRegistry, StockStatus, StockUnit, TrackingCode, TrackingEntry, descriptor,
};

use crate::config::EngineConfig;
use crate::ledger::{AllocationLedger, return_in};
use crate::notify::{Notifier, Outbox, dispatch};
use crate::reference::ReferenceGenerator;
use crate::scheduler::SweepScheduler;
use crate::store::{Store, StoreError, StoreTx};
use crate::sweep::OverdueSweep;
use crate::tracking::{TrackingLog, record_in};
use crate::transition::{InterceptorChain, TransitionContext, TransitionController};

pub struct OrderService<S> {
    store: Arc<S>,
    config: EngineConfig,
    registry: StatusRegistry,
    references: ReferenceGenerator<S>,
    ledger: AllocationLedger<S>,
    controller: Arc<TransitionController<S>>,
    tracking: TrackingLog<S>,
    sweep: Arc<OverdueSweep<S>>,
    notifier: Arc<dyn Notifier>,
}

impl<S> std::fmt::Debug for OrderService<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderService")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

/// Lines of a closed order are frozen unless the policy allows edits.
fn ensure_editable(order: &Order, config: &EngineConfig) -> OrderResult<()> {
    if order.is_closed() && !config.orders.edit_completed_orders {
        return Err(OrderError::validation(format!(
            "order {} is locked in status '{}'",
            order.reference,
            descriptor(order.kind).label(order.status)
        )));
    }
    Ok(())
}

/// Whether stock was ever reserved or received against `line` (any line
/// of the order when `None`). Counters alone forget released reservations.
fn ever_allocated(
    tx: &mut dyn StoreTx,
    order: OrderId,
    line: Option<LineItemId>,
) -> OrderResult<bool> {
    let line = line.map(|id| json!(id));
    Ok(tx.tracking_for_order(order)?.iter().any(|entry| {
        matches!(
            entry.code,
            TrackingCode::StockAllocated | TrackingCode::StockReceived
        ) && line
            .as_ref()
            .is_none_or(|id| entry.payload.get("line") == Some(id))
    }))
}

impl<S: Store + 'static> OrderService<S> {
    pub fn new(
        store: Arc<S>,
        config: EngineConfig,
        notifier: Arc<dyn Notifier>,
        interceptors: InterceptorChain,
    ) -> OrderResult<Self> {
        config.validate()?;
        let references = ReferenceGenerator::new(store.clone(), &config.references)?;
        let controller = Arc::new(TransitionController::new(
            store.clone(),
            config.orders,
            interceptors,
            notifier.clone(),
        ));
        let sweep = Arc::new(OverdueSweep::new(
            store.clone(),
            controller.clone(),
            notifier.clone(),
            config.sweep,
        ));
        let service = Self {
            ledger: AllocationLedger::new(store.clone()),
            tracking: TrackingLog::new(store.clone()),
            registry: StatusRegistry::new(),
            store,
            config,
            references,
            controller,
            sweep,
            notifier,
        };
        service.reload_statuses()?;
        Ok(service)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn registry(&self) -> &StatusRegistry {
        &self.registry
    }

    pub fn references(&self) -> &ReferenceGenerator<S> {
        &self.references
    }

    pub fn ledger(&self) -> &AllocationLedger<S> {
        &self.ledger
    }

    pub fn controller(&self) -> &Arc<TransitionController<S>> {
        &self.controller
    }

    pub fn tracking(&self) -> &TrackingLog<S> {
        &self.tracking
    }

    pub fn overdue_sweep(&self) -> &Arc<OverdueSweep<S>> {
        &self.sweep
    }

    /// A scheduler driving this service's sweep.
    pub fn scheduler(&self) -> SweepScheduler<S> {
        SweepScheduler::new(self.sweep.clone())
    }

    // Orders

    pub fn create_order(&self, draft: NewOrder) -> OrderResult<Order> {
        let order = self.references.create_order(draft)?;
        info!(order = %order.id, reference = %order.reference, kind = %order.kind, "order created");
        Ok(order)
    }

    pub fn next_reference(&self, kind: OrderKind) -> OrderResult<String> {
        self.references.next_reference(kind)
    }

    pub fn order(&self, id: OrderId) -> OrderResult<Order> {
        self.store
            .begin()?
            .get_order(id)?
            .ok_or_else(|| OrderError::not_found("order", id))
    }

    pub fn find_order(&self, kind: OrderKind, reference: &str) -> OrderResult<Option<Order>> {
        Ok(self.store.begin()?.find_order_by_reference(kind, reference)?)
    }

    /// Delete an order that never left its initial state and never touched
    /// stock. Lines and tracking entries go with it.
    #[instrument(skip(self), err)]
    pub fn delete_order(&self, id: OrderId) -> OrderResult<()> {
        let mut tx = self.store.begin()?;
        let order = tx.lock_order(id)?;
        let d = descriptor(order.kind);
        if order.status != d.initial {
            return Err(OrderError::validation(format!(
                "order {} can only be deleted while '{}', it is '{}'",
                order.reference,
                d.label(d.initial),
                d.label(order.status)
            )));
        }
        let mut active = false;
        for line in tx.lines_for_order(id)? {
            active |= tx.lock_line(line.id)?.has_activity();
        }
        if active || ever_allocated(tx.as_mut(), id, None)? {
            return Err(OrderError::validation(format!(
                "order {} has stock activity",
                order.reference
            )));
        }
        tx.delete_order(id)?;
        tx.commit()?;
        info!(reference = %order.reference, "order deleted");
        Ok(())
    }

    pub fn transition(
        &self,
        order: OrderId,
        target: StatusCode,
        actor: Actor,
        context: TransitionContext,
    ) -> OrderResult<Order> {
        self.controller.transition(order, target, actor, context)
    }

    // Lines

    #[instrument(skip(self), err)]
    pub fn add_line(
        &self,
        order: OrderId,
        catalog_item: CatalogItemId,
        required: Quantity,
        target_date: Option<NaiveDate>,
    ) -> OrderResult<LineItem> {
        let mut tx = self.store.begin()?;
        let order = tx.lock_order(order)?;
        ensure_editable(&order, &self.config)?;
        if let (Some(target), Some(due)) = (target_date, order.due_date) {
            if target > due {
                return Err(OrderError::validation(format!(
                    "line target date {target} is after the order due date {due}"
                )));
            }
        }
        let mut line = LineItem::new(order.id, catalog_item, required)?;
        line.target_date = target_date;
        tx.insert_line(&line)?;
        tx.commit()?;
        Ok(line)
    }

    /// Remove a line that has never had stock allocated or received.
    #[instrument(skip(self), err)]
    pub fn remove_line(&self, line: LineItemId) -> OrderResult<()> {
        let mut tx = self.store.begin()?;
        let probe = tx
            .get_line(line)?
            .ok_or_else(|| OrderError::not_found("line item", line))?;
        let order = tx.lock_order(probe.order)?;
        ensure_editable(&order, &self.config)?;
        let current = tx.lock_line(line)?;
        if current.has_activity() || ever_allocated(tx.as_mut(), order.id, Some(line))? {
            return Err(OrderError::validation(format!(
                "line {line} of order {} has stock activity",
                order.reference
            )));
        }
        tx.delete_line(line)?;
        tx.commit()?;
        Ok(())
    }

    pub fn line(&self, id: LineItemId) -> OrderResult<LineItem> {
        self.store
            .begin()?
            .get_line(id)?
            .ok_or_else(|| OrderError::not_found("line item", id))
    }

    pub fn lines(&self, order: OrderId) -> OrderResult<Vec<LineItem>> {
        Ok(self.store.begin()?.lines_for_order(order)?)
    }

    pub fn allocations(&self, order: OrderId) -> OrderResult<Vec<Allocation>> {
        Ok(self.store.begin()?.allocations_for_order(order)?)
    }

    // Stock

    pub fn create_stock_unit(&self, unit: StockUnit) -> OrderResult<StockUnit> {
        let mut tx = self.store.begin()?;
        tx.insert_stock_unit(&unit)?;
        tx.commit()?;
        Ok(unit)
    }

    pub fn stock_unit(&self, id: StockUnitId) -> OrderResult<StockUnit> {
        self.store
            .begin()?
            .get_stock_unit(id)?
            .ok_or_else(|| OrderError::not_found("stock unit", id))
    }

    pub fn available(&self, unit: StockUnitId) -> OrderResult<Quantity> {
        self.ledger.available(unit)
    }

    pub fn allocate(
        &self,
        line: LineItemId,
        unit: StockUnitId,
        quantity: Quantity,
        actor: Actor,
    ) -> OrderResult<Allocation> {
        self.ledger.allocate(line, unit, quantity, actor)
    }

    /// Reserve stock for every line of `order` at once, all or nothing.
    pub fn allocate_all(&self, order: OrderId, actor: Actor) -> OrderResult<Vec<Allocation>> {
        self.ledger.allocate_all(order, actor)
    }

    pub fn release(
        &self,
        allocation: AllocationId,
        quantity: Quantity,
        actor: Actor,
    ) -> OrderResult<Option<Allocation>> {
        self.ledger.release(allocation, quantity, actor)
    }

    pub fn fulfil(
        &self,
        allocation: AllocationId,
        quantity: Quantity,
        actor: Actor,
    ) -> OrderResult<Allocation> {
        self.ledger.fulfil(allocation, quantity, actor)
    }

    pub fn receive(
        &self,
        line: LineItemId,
        quantity: Quantity,
        serial: Option<String>,
        actor: Actor,
    ) -> OrderResult<Allocation> {
        self.ledger.receive(line, quantity, serial, actor)
    }

    pub fn adjust_stock(
        &self,
        unit: StockUnitId,
        new_total: Quantity,
        actor: Actor,
    ) -> OrderResult<StockUnit> {
        self.ledger.adjust_stock(unit, new_total, actor)
    }

    /// Take back loaned stock. Once every line is back the order completes
    /// (when `loans.auto_complete_on_return` is set). An ISSUED loan moves to
    /// PARTIAL_RETURN once some line is fully back while another is still
    /// out; returning part of a line alone leaves the status as it is. Both
    /// happen in the same transaction as the return.
    #[instrument(skip(self), err)]
    pub fn return_stock(
        &self,
        allocation: AllocationId,
        quantity: Quantity,
        status: Option<StockStatus>,
        actor: Actor,
    ) -> OrderResult<Order> {
        let mut tx = self.store.begin()?;
        let probe = tx
            .get_allocation(allocation)?
            .ok_or_else(|| OrderError::not_found("allocation", allocation))?;
        let order = tx.lock_order(probe.order)?;
        return_in(tx.as_mut(), &order, allocation, quantity, status, actor)?;

        let rule = descriptor(order.kind).completion;
        let lines = tx.lines_for_order(order.id)?;
        let returned = lines.iter().filter(|l| l.is_satisfied(rule)).count();
        let pending = lines.len() - returned;
        let target = if pending == 0 && self.config.loans.auto_complete_on_return {
            Some(LoanStatus::Complete.code())
        } else if returned > 0 && pending > 0 && order.status == LoanStatus::Issued.code() {
            Some(LoanStatus::PartialReturn.code())
        } else {
            None
        };

        let mut outbox = Outbox::new();
        let order = match target {
            Some(target) => {
                let context = TransitionContext::new().with_note("stock returned");
                self.controller
                    .transition_in(tx.as_mut(), order.id, target, actor, &context, &mut outbox)?
                    .0
            }
            None => order,
        };
        tx.commit()?;
        dispatch(self.notifier.as_ref(), outbox);
        Ok(order)
    }

    // Statuses

    /// Show `key` as the order's status. The custom state must map to the
    /// order's current logical status. `None` clears it.
    #[instrument(skip(self), err)]
    pub fn set_custom_status(
        &self,
        order: OrderId,
        key: Option<u16>,
        actor: Actor,
    ) -> OrderResult<Order> {
        let mut tx = self.store.begin()?;
        let mut current = tx.lock_order(order)?;
        if let Some(key) = key {
            let state = self
                .registry
                .custom_state(current.kind, key)
                .ok_or_else(|| OrderError::not_found("custom status", key))?;
            if state.logical != current.status {
                return Err(OrderError::validation(format!(
                    "custom status '{}' belongs to '{}', order {} is '{}'",
                    state.name,
                    descriptor(current.kind).label(state.logical),
                    current.reference,
                    descriptor(current.kind).label(current.status)
                )));
            }
        }
        let previous = current.custom_status;
        current.custom_status = key;
        tx.update_order(&current)?;
        record_in(
            tx.as_mut(),
            current.id,
            TrackingCode::CustomStatusChanged,
            actor,
            "",
            json!({
                "from": previous,
                "to": key,
                "logical": current.status,
            }),
        )?;
        tx.commit()?;
        Ok(current)
    }

    /// Persist a new custom state and refresh the registry.
    #[instrument(skip(self, state), fields(kind = %state.kind, key = state.key), err)]
    pub fn define_custom_state(&self, state: CustomState) -> OrderResult<()> {
        state.validate()?;
        let mut tx = self.store.begin()?;
        match tx.insert_custom_state(&state) {
            Err(StoreError::UniqueViolation(_)) => {
                return Err(OrderError::validation(format!(
                    "{} custom status {} is already defined",
                    state.kind, state.key
                )));
            }
            other => other?,
        }
        tx.commit()?;
        self.registry.define(state)
    }

    /// Refresh cached custom states from the store.
    pub fn reload_statuses(&self) -> OrderResult<()> {
        let states = self.store.begin()?.custom_states()?;
        self.registry.replace(states)
    }

    pub fn display_status(&self, order: &Order) -> ResolvedStatus {
        self.registry.resolve_order(order)
    }

    // Tracking and sweep

    pub fn history(&self, order: OrderId) -> OrderResult<Vec<TrackingEntry>> {
        self.tracking.history(order)
    }

    pub fn sweep(&self, now: DateTime<Utc>) -> OrderResult<usize> {
        self.sweep.sweep(now)
    }

    pub fn remind_due_soon(&self, now: DateTime<Utc>) -> OrderResult<usize> {
        self.sweep.remind_due_soon(now)
    }
}
