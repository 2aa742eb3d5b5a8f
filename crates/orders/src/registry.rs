//! Status registry: built-in states plus custom display states stored as data.
//!
//! Custom states never add behaviour. Each one maps to a logical built-in state
//! and only overrides how that state is shown.

use std::collections::HashMap;
use std::sync::RwLock;

use orderflow_core::{OrderError, OrderKind, OrderResult, StatusCode};
use serde::{Deserialize, Serialize};

use crate::kinds::descriptor;
use crate::model::Order;
use crate::status::{Color, StatusGroup};

/// A user-defined status that projects onto a built-in logical state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomState {
    pub kind: OrderKind,
    pub key: u16,
    pub logical: StatusCode,
    pub name: String,
    pub label: String,
    pub color: Color,
}

impl CustomState {
    /// The key must not shadow a built-in value and the logical state must exist.
    pub fn validate(&self) -> OrderResult<()> {
        let d = descriptor(self.kind);
        if d.is_builtin(StatusCode(self.key)) {
            return Err(OrderError::validation(format!(
                "custom status key {} collides with a built-in {} status",
                self.key, self.kind
            )));
        }
        if !d.is_builtin(self.logical) {
            return Err(OrderError::validation(format!(
                "custom status '{}' maps to unknown logical {} status {}",
                self.name, self.kind, self.logical
            )));
        }
        if self.label.trim().is_empty() {
            return Err(OrderError::validation("custom status label must not be empty"));
        }
        Ok(())
    }
}

/// Display projection of a raw status value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedStatus {
    pub logical: StatusCode,
    pub key: u16,
    pub name: String,
    pub label: String,
    pub color: Color,
    pub custom: bool,
    pub known: bool,
}

impl ResolvedStatus {
    fn unknown(raw: u16) -> Self {
        Self {
            logical: StatusCode(raw),
            key: raw,
            name: "UNKNOWN".to_string(),
            label: "Unknown".to_string(),
            color: Color::Secondary,
            custom: false,
            known: false,
        }
    }
}

/// Read-mostly registry over the static tables and a cache of custom states.
#[derive(Debug, Default)]
pub struct StatusRegistry {
    custom: RwLock<HashMap<(OrderKind, u16), CustomState>>,
}

impl StatusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_custom(states: impl IntoIterator<Item = CustomState>) -> OrderResult<Self> {
        let registry = Self::new();
        registry.replace(states)?;
        Ok(registry)
    }

    /// Swap the cached custom states for `states`. Nothing changes if any entry is invalid.
    pub fn replace(&self, states: impl IntoIterator<Item = CustomState>) -> OrderResult<()> {
        let mut next = HashMap::new();
        for state in states {
            state.validate()?;
            next.insert((state.kind, state.key), state);
        }
        let mut guard = self
            .custom
            .write()
            .map_err(|_| OrderError::storage("status registry lock poisoned"))?;
        *guard = next;
        Ok(())
    }

    /// Validate `state` and add it to the cache, replacing any entry with the same key.
    pub fn define(&self, state: CustomState) -> OrderResult<()> {
        state.validate()?;
        self.custom
            .write()
            .map_err(|_| OrderError::storage("status registry lock poisoned"))?
            .insert((state.kind, state.key), state);
        Ok(())
    }

    pub fn custom_state(&self, kind: OrderKind, key: u16) -> Option<CustomState> {
        self.custom
            .read()
            .ok()
            .and_then(|map| map.get(&(kind, key)).cloned())
    }

    /// Custom states of `kind` ordered by key.
    pub fn custom_states(&self, kind: OrderKind) -> Vec<CustomState> {
        let mut states: Vec<CustomState> = self
            .custom
            .read()
            .map(|map| map.values().filter(|s| s.kind == kind).cloned().collect())
            .unwrap_or_default();
        states.sort_by_key(|s| s.key);
        states
    }

    /// Resolve any raw value. Unknown values resolve to an "Unknown" entry.
    pub fn resolve(&self, kind: OrderKind, raw: u16) -> ResolvedStatus {
        let d = descriptor(kind);
        if let Some(state) = d.state(StatusCode(raw)) {
            return ResolvedStatus {
                logical: state.value,
                key: raw,
                name: state.name.to_string(),
                label: state.label.to_string(),
                color: state.color,
                custom: false,
                known: true,
            };
        }
        match self.custom_state(kind, raw) {
            Some(custom) => ResolvedStatus {
                logical: custom.logical,
                key: raw,
                name: custom.name,
                label: custom.label,
                color: custom.color,
                custom: true,
                known: true,
            },
            None => ResolvedStatus::unknown(raw),
        }
    }

    /// Resolve what an order displays: its custom key if set, else its status.
    pub fn resolve_order(&self, order: &Order) -> ResolvedStatus {
        let raw = order.custom_status.unwrap_or(order.status.0);
        let resolved = self.resolve(order.kind, raw);
        if resolved.known && resolved.logical == order.status {
            resolved
        } else {
            self.resolve(order.kind, order.status.0)
        }
    }

    pub fn is_member(&self, kind: OrderKind, raw: u16, group: StatusGroup) -> bool {
        let resolved = self.resolve(kind, raw);
        resolved.known && descriptor(kind).in_group(resolved.logical, group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinds::{LoanStatus, SalesStatus};

    fn return_requested() -> CustomState {
        CustomState {
            kind: OrderKind::Sales,
            key: 101,
            logical: SalesStatus::InProgress.code(),
            name: "RETURN_REQUESTED".into(),
            label: "Return Requested".into(),
            color: Color::Info,
        }
    }

    #[test]
    fn builtin_resolves_to_itself() {
        let registry = StatusRegistry::new();
        let r = registry.resolve(OrderKind::Loan, 30);
        assert!(r.known && !r.custom);
        assert_eq!(r.logical, LoanStatus::Complete.code());
        assert_eq!(r.label, "Returned");
    }

    #[test]
    fn custom_key_resolves_to_logical_state() {
        let registry = StatusRegistry::with_custom([return_requested()]).unwrap();
        let r = registry.resolve(OrderKind::Sales, 101);
        assert!(r.custom);
        assert_eq!(r.logical, SalesStatus::InProgress.code());
        assert_eq!(r.label, "Return Requested");
        assert!(registry.is_member(OrderKind::Sales, 101, StatusGroup::Open));
        assert!(!registry.is_member(OrderKind::Sales, 101, StatusGroup::Complete));
    }

    #[test]
    fn unknown_value_never_fails() {
        let registry = StatusRegistry::new();
        let r = registry.resolve(OrderKind::Purchase, 999);
        assert!(!r.known);
        assert_eq!(r.label, "Unknown");
        assert!(!registry.is_member(OrderKind::Purchase, 999, StatusGroup::Open));
    }

    #[test]
    fn custom_key_may_not_shadow_builtin() {
        let mut state = return_requested();
        state.key = SalesStatus::Complete.code().0;
        match StatusRegistry::with_custom([state]) {
            Err(OrderError::Validation(msg)) if msg.contains("collides") => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn custom_keys_are_scoped_per_kind() {
        let registry = StatusRegistry::with_custom([return_requested()]).unwrap();
        assert!(!registry.resolve(OrderKind::Loan, 101).known);
        assert_eq!(registry.custom_states(OrderKind::Sales).len(), 1);
        assert!(registry.custom_states(OrderKind::Loan).is_empty());
    }

    #[test]
    fn define_adds_to_the_cache() {
        let registry = StatusRegistry::new();
        registry.define(return_requested()).unwrap();
        assert!(registry.resolve(OrderKind::Sales, 101).custom);

        let mut bad = return_requested();
        bad.key = 102;
        bad.label = "  ".into();
        assert!(registry.define(bad).is_err());
        assert!(!registry.resolve(OrderKind::Sales, 102).known);
    }

    #[test]
    fn failed_replace_keeps_previous_cache() {
        let registry = StatusRegistry::with_custom([return_requested()]).unwrap();
        let mut bad = return_requested();
        bad.logical = StatusCode(77);
        assert!(registry.replace([bad]).is_err());
        assert!(registry.custom_state(OrderKind::Sales, 101).is_some());
    }
}
