//! Default actions run by the controller.

use std::collections::BTreeMap;

use serde_json::json;

use orderflow_core::{LineItemId, OrderError, OrderResult};
use orderflow_orders::{Allocation, DefaultAction, LineItem, Settlement};

use super::TransitionStep;
use crate::ledger::{fulfil_in, settle_in, unreserve_in};

pub(super) fn run(step: &mut TransitionStep<'_>) -> OrderResult<()> {
    match step.edge.action {
        DefaultAction::None => Ok(()),
        DefaultAction::RequireLines => require_lines(step),
        DefaultAction::Place => {
            require_lines(step)?;
            if step.order.issued_at.is_none() {
                step.order.issued_at = Some(step.now);
            }
            Ok(())
        }
        DefaultAction::Issue => issue(step),
        DefaultAction::Complete => complete(step),
        DefaultAction::Cancel => {
            let settlement = step.descriptor.settle_on_cancel;
            settle_all(step, settlement)
        }
        DefaultAction::WriteOff => {
            settle_all(step, Settlement::WriteOff)?;
            step.order.completed_at = Some(step.now);
            Ok(())
        }
    }
}

fn require_lines(step: &mut TransitionStep<'_>) -> OrderResult<()> {
    if step.tx.lines_for_order(step.order.id)?.is_empty() {
        return Err(OrderError::validation(format!(
            "order {} has no line items",
            step.order.reference
        )));
    }
    Ok(())
}

/// Lock every line of the order, in id order.
fn lock_lines(step: &mut TransitionStep<'_>) -> OrderResult<BTreeMap<LineItemId, LineItem>> {
    let ids: Vec<LineItemId> = step
        .tx
        .lines_for_order(step.order.id)?
        .into_iter()
        .map(|l| l.id)
        .collect();
    let mut lines = BTreeMap::new();
    for id in ids {
        lines.insert(id, step.tx.lock_line(id)?);
    }
    Ok(lines)
}

/// Allocations of the order with their stock units locked, in unit id order.
fn lock_allocations(step: &mut TransitionStep<'_>) -> OrderResult<Vec<Allocation>> {
    let mut allocations = step.tx.allocations_for_order(step.order.id)?;
    allocations.sort_by_key(|a| (a.stock_unit, a.id));
    let mut last = None;
    for allocation in &allocations {
        if last != Some(allocation.stock_unit) {
            step.tx.lock_stock_unit(allocation.stock_unit)?;
            last = Some(allocation.stock_unit);
        }
    }
    Ok(allocations)
}

fn write_lines(step: &mut TransitionStep<'_>, lines: &BTreeMap<LineItemId, LineItem>) -> OrderResult<()> {
    for line in lines.values() {
        step.tx.update_line(line)?;
    }
    Ok(())
}

fn line_of<'l>(
    lines: &'l mut BTreeMap<LineItemId, LineItem>,
    allocation: &Allocation,
) -> OrderResult<&'l mut LineItem> {
    lines
        .get_mut(&allocation.line)
        .ok_or_else(|| OrderError::not_found("line item", allocation.line))
}

/// Hand out every reservation that is not yet fulfilled.
fn issue(step: &mut TransitionStep<'_>) -> OrderResult<()> {
    let mut lines = lock_lines(step)?;
    if lines.is_empty() {
        return Err(OrderError::validation(format!(
            "order {} has no line items",
            step.order.reference
        )));
    }
    for allocation in lock_allocations(step)? {
        let outstanding = allocation.unfulfilled();
        if !outstanding.is_positive() {
            continue;
        }
        let line = line_of(&mut lines, &allocation)?;
        let updated = fulfil_in(&mut *step.tx, line, allocation, outstanding)?;
        step.moved.push(json!({
            "allocation": updated.id,
            "line": updated.line,
            "stock_unit": updated.stock_unit,
            "quantity": outstanding,
            "action": "fulfilled",
        }));
    }
    write_lines(step, &lines)?;
    if step.order.issued_at.is_none() {
        step.order.issued_at = Some(step.now);
    }
    Ok(())
}

fn complete(step: &mut TransitionStep<'_>) -> OrderResult<()> {
    let lines = lock_lines(step)?;
    let rule = step.descriptor.completion;
    let shortfalls: Vec<_> = lines.values().filter_map(|l| l.shortfall(rule)).collect();
    if !shortfalls.is_empty() {
        return Err(OrderError::IncompleteOrder {
            order: step.order.id,
            reference: step.order.reference.clone(),
            lines: shortfalls,
        });
    }
    let settlement = step.descriptor.settle_on_complete;
    settle_all(step, settlement)?;
    step.order.completed_at = Some(step.now);
    Ok(())
}

/// Release unfulfilled reservations, then settle what was fulfilled.
fn settle_all(step: &mut TransitionStep<'_>, settlement: Settlement) -> OrderResult<()> {
    let mut lines = lock_lines(step)?;
    for allocation in lock_allocations(step)? {
        let line = line_of(&mut lines, &allocation)?;
        let unfulfilled = allocation.unfulfilled();
        let remaining = if unfulfilled.is_positive() {
            let (id, stock_unit) = (allocation.id, allocation.stock_unit);
            let rest = unreserve_in(&mut *step.tx, line, allocation, unfulfilled)?;
            step.moved.push(json!({
                "allocation": id,
                "line": line.id,
                "stock_unit": stock_unit,
                "quantity": unfulfilled,
                "action": "released",
            }));
            rest
        } else {
            Some(allocation)
        };
        if let Some(fulfilled) = remaining {
            let movement = settle_in(&mut *step.tx, &*step.order, line, fulfilled, settlement)?;
            step.moved.push(movement);
        }
    }
    write_lines(step, &lines)
}
