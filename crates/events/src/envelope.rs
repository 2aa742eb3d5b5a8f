use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use orderflow_core::{OrderId, OrderKind};

use crate::event::Event;

/// An event addressed to the order it concerns.
///
/// `event_id` is unique per publication. Consumers that deduplicate should key
/// on it, not on the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    event_id: Uuid,
    order_id: OrderId,
    order_kind: OrderKind,
    event_type: String,
    occurred_at: DateTime<Utc>,
    payload: E,
}

impl<E: Event> EventEnvelope<E> {
    pub fn wrap(order_id: OrderId, order_kind: OrderKind, payload: E) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            order_id,
            order_kind,
            event_type: payload.event_type().to_string(),
            occurred_at: payload.occurred_at(),
            payload,
        }
    }
}

impl<E> EventEnvelope<E> {
    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn order_id(&self) -> OrderId {
        self.order_id
    }

    pub fn order_kind(&self) -> OrderKind {
        self.order_kind
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }
}
