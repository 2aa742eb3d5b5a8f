//! Post-commit notifications.
//!
//! Operations collect notifications in an [`Outbox`] while their transaction
//! is open and hand them to the [`Notifier`] only after the commit succeeded.
//! A rolled-back operation therefore never notifies anyone.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use orderflow_core::{OrderId, OrderKind, StatusCode, UserId};
use orderflow_events::{Event, EventBus, EventEnvelope};
use orderflow_orders::{Actor, Order};

/// What the outside world hears about an order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderNotification {
    /// Full event name, e.g. `loanorder.overdue`.
    pub event: String,
    pub order_id: OrderId,
    pub kind: OrderKind,
    pub reference: String,
    pub status: StatusCode,
    pub previous_status: Option<StatusCode>,
    pub targets: Vec<UserId>,
    pub actor: Actor,
    pub occurred_at: DateTime<Utc>,
    pub context: serde_json::Value,
}

impl OrderNotification {
    pub fn for_order(event: String, order: &Order, actor: Actor, occurred_at: DateTime<Utc>) -> Self {
        Self {
            event,
            order_id: order.id,
            kind: order.kind,
            reference: order.reference.clone(),
            status: order.status,
            previous_status: None,
            targets: order.notification_targets(),
            actor,
            occurred_at,
            context: serde_json::Value::Null,
        }
    }

    pub fn with_previous(mut self, status: StatusCode) -> Self {
        self.previous_status = Some(status);
        self
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }
}

impl Event for OrderNotification {
    fn event_type(&self) -> &str {
        &self.event
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}

/// Fire-and-forget delivery. Implementations must not fail the caller.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: OrderNotification);
}

impl<N> Notifier for Arc<N>
where
    N: Notifier + ?Sized,
{
    fn notify(&self, notification: OrderNotification) {
        (**self).notify(notification)
    }
}

/// Notifications buffered until commit.
pub type Outbox = Vec<OrderNotification>;

pub(crate) fn dispatch(notifier: &dyn Notifier, outbox: Outbox) {
    for notification in outbox {
        notifier.notify(notification);
    }
}

/// Drops every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify(&self, _notification: OrderNotification) {}
}

/// Publishes each notification as an [`EventEnvelope`] on a bus.
#[derive(Debug)]
pub struct BusNotifier<B> {
    bus: B,
}

impl<B> BusNotifier<B>
where
    B: EventBus<EventEnvelope<OrderNotification>>,
{
    pub fn new(bus: B) -> Self {
        Self { bus }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }
}

impl<B> Notifier for BusNotifier<B>
where
    B: EventBus<EventEnvelope<OrderNotification>>,
{
    fn notify(&self, notification: OrderNotification) {
        let event = notification.event.clone();
        let envelope = EventEnvelope::wrap(notification.order_id, notification.kind, notification);
        if let Err(err) = self.bus.publish(envelope) {
            warn!(event = %event, error = %err, "notification publish failed");
        }
    }
}

/// Keeps every notification in memory. Useful in tests and embedding code
/// that polls instead of subscribing.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<OrderNotification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<OrderNotification> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn events(&self) -> Vec<String> {
        self.sent().into_iter().map(|n| n.event).collect()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: OrderNotification) {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(notification);
        }
    }
}
