//! Engine layer: stores, ledger, transitions, references, sweep and the
//! service that ties them together.

pub mod config;
pub mod ledger;
pub mod notify;
pub mod reference;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod sweep;
pub mod tracking;
pub mod transition;

#[cfg(test)]
mod integration_tests;

pub use config::{EngineConfig, load_settings};
pub use ledger::AllocationLedger;
pub use notify::{BusNotifier, Notifier, NullNotifier, OrderNotification, RecordingNotifier};
pub use reference::ReferenceGenerator;
pub use scheduler::{SchedulerConfig, SchedulerHandle, SchedulerStats, SweepScheduler};
pub use service::OrderService;
pub use store::{InMemoryStore, PostgresStore, Store, StoreError, StoreTx};
pub use sweep::OverdueSweep;
pub use tracking::TrackingLog;
pub use transition::{
    Handling, InterceptorChain, TransitionContext, TransitionController, TransitionInterceptor,
    TransitionStep,
};
