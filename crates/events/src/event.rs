use chrono::{DateTime, Utc};

/// A fact the engine announces to the outside world.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name, e.g. `"loanorder.issued"`.
    fn event_type(&self) -> &str;

    /// When the underlying change committed.
    fn occurred_at(&self) -> DateTime<Utc>;
}
