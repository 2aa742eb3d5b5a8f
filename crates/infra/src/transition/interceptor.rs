//! Pluggable transition interceptors.
//!
//! Interceptors registered for a kind run in registration order before the
//! default action. The first one that returns [`Handling::Handled`] ends the
//! chain and the default action is skipped, unless the interceptor ran it
//! itself through [`TransitionStep::run_default`]. An error from any
//! interceptor rolls back the whole transition.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use orderflow_core::{OrderKind, OrderResult};

use super::TransitionStep;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Handling {
    Handled,
    Declined,
}

pub trait TransitionInterceptor: Send + Sync {
    /// Name recorded as `handled_by` in the status-change entry.
    fn name(&self) -> &str;

    fn try_handle(&self, step: &mut TransitionStep<'_>) -> OrderResult<Handling>;
}

/// Interceptors per order kind.
#[derive(Clone, Default)]
pub struct InterceptorChain {
    by_kind: HashMap<OrderKind, Vec<Arc<dyn TransitionInterceptor>>>,
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, kind: OrderKind, interceptor: Arc<dyn TransitionInterceptor>) -> Self {
        self.push(kind, interceptor);
        self
    }

    pub fn push(&mut self, kind: OrderKind, interceptor: Arc<dyn TransitionInterceptor>) {
        self.by_kind.entry(kind).or_default().push(interceptor);
    }

    pub fn for_kind(&self, kind: OrderKind) -> &[Arc<dyn TransitionInterceptor>] {
        self.by_kind.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.by_kind.values().all(Vec::is_empty)
    }
}

impl fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for kind in OrderKind::ALL {
            let names: Vec<&str> = self.for_kind(kind).iter().map(|i| i.name()).collect();
            if !names.is_empty() {
                map.entry(&kind, &names);
            }
        }
        map.finish()
    }
}
