//! Audit records and the actor attribution attached to them.

use chrono::{DateTime, Utc};
use orderflow_core::{OrderId, TrackingEntryId, UserId};
use serde::{Deserialize, Serialize};

/// Who performed a mutation. Used for attribution only, never authorization.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "id")]
pub enum Actor {
    User(UserId),
    System,
}

impl Actor {
    pub fn user_id(self) -> Option<UserId> {
        match self {
            Actor::User(id) => Some(id),
            Actor::System => None,
        }
    }

    pub fn is_system(self) -> bool {
        matches!(self, Actor::System)
    }
}

impl From<UserId> for Actor {
    fn from(id: UserId) -> Self {
        Actor::User(id)
    }
}

/// Integer tracking-type codes persisted with each entry.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum TrackingCode {
    StatusChanged = 10,
    CustomStatusChanged = 11,
    StockAllocated = 20,
    AllocationReleased = 21,
    StockFulfilled = 30,
    StockReturned = 31,
    StockReceived = 32,
    AllocationSettled = 33,
}

impl TrackingCode {
    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            10 => TrackingCode::StatusChanged,
            11 => TrackingCode::CustomStatusChanged,
            20 => TrackingCode::StockAllocated,
            21 => TrackingCode::AllocationReleased,
            30 => TrackingCode::StockFulfilled,
            31 => TrackingCode::StockReturned,
            32 => TrackingCode::StockReceived,
            33 => TrackingCode::AllocationSettled,
            _ => return None,
        })
    }
}

/// An immutable audit record. `sequence` is assigned by the store at commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingEntry {
    pub id: TrackingEntryId,
    pub order: OrderId,
    pub sequence: u64,
    pub recorded_at: DateTime<Utc>,
    pub code: TrackingCode,
    pub actor: Option<UserId>,
    pub note: String,
    pub payload: serde_json::Value,
}

impl TrackingEntry {
    pub fn new(
        order: OrderId,
        code: TrackingCode,
        actor: Actor,
        note: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: TrackingEntryId::new(),
            order,
            sequence: 0,
            recorded_at: Utc::now(),
            code,
            actor: actor.user_id(),
            note: note.into(),
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_actor_is_recorded_without_user() {
        let entry = TrackingEntry::new(
            OrderId::new(),
            TrackingCode::StatusChanged,
            Actor::System,
            "",
            serde_json::Value::Null,
        );
        assert_eq!(entry.actor, None);
        assert_eq!(entry.sequence, 0);
    }

    #[test]
    fn codes_round_trip() {
        for code in [TrackingCode::StatusChanged, TrackingCode::StockReturned] {
            assert_eq!(TrackingCode::from_code(code.code()), Some(code));
        }
        assert_eq!(TrackingCode::from_code(99), None);
    }
}
