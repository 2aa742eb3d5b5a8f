//! State transition controller.
//!
//! ```text
//! transition(order, target, actor)
//!   ↓
//! 1. Lock the order row
//!   ↓
//! 2. Check target ← current against the kind's graph (system-only edges
//!    need the system actor)
//!   ↓
//! 3. Interceptors for the kind, in registration order
//!   ↓
//! 4. Default action, unless an interceptor handled the transition
//!   ↓
//! 5. Status update plus exactly one StatusChanged tracking entry
//!   ↓
//! 6. Commit, then notify creator and responsible user
//! ```
//!
//! Any error in steps 2-5 leaves the order, its lines, its allocations and
//! its tracking entries as they were.

mod actions;
pub mod interceptor;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{info, instrument};

use orderflow_core::{OrderError, OrderId, OrderResult, StatusCode};
use orderflow_orders::{
    Actor, DefaultAction, Edge, EdgeOrigin, KindDescriptor, Order, TrackingCode, descriptor,
};

pub use interceptor::{Handling, InterceptorChain, TransitionInterceptor};

use crate::config::OrderPolicy;
use crate::notify::{Notifier, OrderNotification, Outbox, dispatch};
use crate::store::{Store, StoreTx};
use crate::tracking::record_in;

/// Caller-supplied extras for one transition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransitionContext {
    /// Stored as the note of the status-change entry.
    pub note: Option<String>,
    /// Free-form data passed to interceptors and copied into the notification.
    pub data: serde_json::Value,
}

impl TransitionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

/// One transition in flight, as seen by interceptors.
pub struct TransitionStep<'a> {
    pub current: StatusCode,
    pub target: StatusCode,
    pub actor: Actor,
    pub now: DateTime<Utc>,
    order: &'a mut Order,
    tx: &'a mut dyn StoreTx,
    edge: &'static Edge,
    descriptor: &'static KindDescriptor,
    context: &'a TransitionContext,
    moved: Vec<serde_json::Value>,
    default_ran: bool,
}

impl<'a> TransitionStep<'a> {
    pub fn order(&self) -> &Order {
        self.order
    }

    /// The order as it will be persisted. Status fields are overwritten by
    /// the controller afterwards.
    pub fn order_mut(&mut self) -> &mut Order {
        self.order
    }

    pub fn context(&self) -> &TransitionContext {
        self.context
    }

    pub fn edge(&self) -> &'static Edge {
        self.edge
    }

    pub fn descriptor(&self) -> &'static KindDescriptor {
        self.descriptor
    }

    /// The transaction the transition runs in.
    pub fn tx(&mut self) -> &mut dyn StoreTx {
        &mut *self.tx
    }

    /// Add a stock movement to the `allocations` payload of the status entry.
    pub fn record_movement(&mut self, movement: serde_json::Value) {
        self.moved.push(movement);
    }

    /// Run the edge's default action. Runs at most once per transition.
    pub fn run_default(&mut self) -> OrderResult<()> {
        if self.default_ran {
            return Ok(());
        }
        actions::run(self)?;
        self.default_ran = true;
        Ok(())
    }
}

pub struct TransitionController<S> {
    store: Arc<S>,
    policy: OrderPolicy,
    interceptors: InterceptorChain,
    notifier: Arc<dyn Notifier>,
}

impl<S> std::fmt::Debug for TransitionController<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransitionController")
            .field("policy", &self.policy)
            .field("interceptors", &self.interceptors)
            .finish_non_exhaustive()
    }
}

impl<S: Store> TransitionController<S> {
    pub fn new(
        store: Arc<S>,
        policy: OrderPolicy,
        interceptors: InterceptorChain,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            policy,
            interceptors,
            notifier,
        }
    }

    pub fn interceptors(&self) -> &InterceptorChain {
        &self.interceptors
    }

    /// Move `order` to `target` in its own transaction.
    #[instrument(skip(self, context), fields(order = %order, target = %target, actor = ?actor), err)]
    pub fn transition(
        &self,
        order: OrderId,
        target: StatusCode,
        actor: Actor,
        context: TransitionContext,
    ) -> OrderResult<Order> {
        let mut tx = self.store.begin()?;
        let mut outbox = Outbox::new();
        let (updated, previous) =
            self.transition_in(tx.as_mut(), order, target, actor, &context, &mut outbox)?;
        tx.commit()?;
        info!(
            reference = %updated.reference,
            kind = %updated.kind,
            from = %previous,
            to = %updated.status,
            "transition committed"
        );
        dispatch(self.notifier.as_ref(), outbox);
        Ok(updated)
    }

    /// Transition inside a caller's transaction. Returns the updated order
    /// and its previous status; notifications go to `outbox`.
    pub(crate) fn transition_in(
        &self,
        tx: &mut dyn StoreTx,
        order_id: OrderId,
        target: StatusCode,
        actor: Actor,
        context: &TransitionContext,
        outbox: &mut Outbox,
    ) -> OrderResult<(Order, StatusCode)> {
        let mut order = tx.lock_order(order_id)?;
        let d = descriptor(order.kind);
        let current = order.status;

        let edge = d
            .edge_to(target)
            .filter(|e| e.sources.contains(&current))
            .filter(|e| e.origin == EdgeOrigin::Any || actor.is_system())
            .ok_or_else(|| OrderError::InvalidTransition {
                order: order.id,
                reference: order.reference.clone(),
                current,
                target,
            })?;

        let placing = matches!(
            edge.action,
            DefaultAction::RequireLines | DefaultAction::Place | DefaultAction::Issue
        );
        if self.policy.require_responsible && placing && order.responsible.is_none() {
            return Err(OrderError::validation(format!(
                "order {} needs a responsible user before it can move to '{}'",
                order.reference,
                d.label(target)
            )));
        }

        let now = Utc::now();
        let mut handled_by: Option<String> = None;
        let moved = {
            let mut step = TransitionStep {
                current,
                target,
                actor,
                now,
                order: &mut order,
                tx: &mut *tx,
                edge,
                descriptor: d,
                context,
                moved: Vec::new(),
                default_ran: false,
            };
            for interceptor in self.interceptors.for_kind(d.kind) {
                if interceptor.try_handle(&mut step)? == Handling::Handled {
                    handled_by = Some(interceptor.name().to_string());
                    break;
                }
            }
            if handled_by.is_none() {
                step.run_default()?;
            }
            step.moved
        };

        order.status = target;
        order.custom_status = None;
        tx.update_order(&order)?;
        record_in(
            tx,
            order.id,
            TrackingCode::StatusChanged,
            actor,
            context.note.clone().unwrap_or_default(),
            json!({
                "from": current,
                "to": target,
                "handled_by": handled_by,
                "allocations": moved,
            }),
        )?;
        outbox.push(
            OrderNotification::for_order(d.event_name(edge.event), &order, actor, now)
                .with_previous(current)
                .with_context(context.data.clone()),
        );
        Ok((order, current))
    }
}
