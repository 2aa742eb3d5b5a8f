//! Order-kind discriminator and raw status codes.

use core::fmt;
use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::OrderError;

/// The four order kinds driven by the same lifecycle engine.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    Purchase,
    Sales,
    Build,
    Loan,
}

impl OrderKind {
    pub const ALL: [OrderKind; 4] = [
        OrderKind::Purchase,
        OrderKind::Sales,
        OrderKind::Build,
        OrderKind::Loan,
    ];

    /// Stable storage key (`orders.kind`, `reference_counters.kind`).
    pub fn as_str(self) -> &'static str {
        match self {
            OrderKind::Purchase => "purchase",
            OrderKind::Sales => "sales",
            OrderKind::Build => "build",
            OrderKind::Loan => "loan",
        }
    }
}

impl fmt::Display for OrderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderKind {
    type Err = OrderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "purchase" => Ok(OrderKind::Purchase),
            "sales" => Ok(OrderKind::Sales),
            "build" => Ok(OrderKind::Build),
            "loan" => Ok(OrderKind::Loan),
            other => Err(OrderError::validation(format!("unknown order kind '{other}'"))),
        }
    }
}

/// A raw numeric status value as persisted on an order.
///
/// Whether a value is meaningful depends on the order kind; the status registry
/// in `orderflow-orders` resolves it to a logical state.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusCode(pub u16);

impl StatusCode {
    pub const fn value(self) -> u16 {
        self.0
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u16> for StatusCode {
    fn from(value: u16) -> Self {
        Self(value)
    }
}
