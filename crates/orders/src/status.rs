//! Built-in status tables.
//!
//! Each order kind declares its logical states with [`status_codes!`]; the
//! generated enum carries the numeric value, a display label and a colour.

use orderflow_core::StatusCode;
use serde::{Deserialize, Serialize};

/// Display colour attached to a status. Presentation only.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Color {
    Primary,
    Secondary,
    Success,
    Danger,
    Warning,
    Info,
    Dark,
}

impl Color {
    pub fn as_str(self) -> &'static str {
        match self {
            Color::Primary => "primary",
            Color::Secondary => "secondary",
            Color::Success => "success",
            Color::Danger => "danger",
            Color::Warning => "warning",
            Color::Info => "info",
            Color::Dark => "dark",
        }
    }

    pub fn parse(s: &str) -> Option<Color> {
        match s {
            "primary" => Some(Color::Primary),
            "secondary" => Some(Color::Secondary),
            "success" => Some(Color::Success),
            "danger" => Some(Color::Danger),
            "warning" => Some(Color::Warning),
            "info" => Some(Color::Info),
            "dark" => Some(Color::Dark),
            _ => None,
        }
    }
}

/// One built-in state of an order kind.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct StateDef {
    pub value: StatusCode,
    pub name: &'static str,
    pub label: &'static str,
    pub color: Color,
}

/// Group filters every kind exposes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusGroup {
    Open,
    Complete,
    Cancelled,
}

/// Declares a status enum together with its `STATES` table.
///
/// ```ignore
/// status_codes! {
///     pub enum DemoStatus {
///         Pending = 10, "Pending", Secondary;
///         Done = 30, "Done", Success;
///     }
/// }
/// ```
macro_rules! status_codes {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $value:literal, $label:literal, $color:ident; )+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
        #[repr(u16)]
        $vis enum $name {
            $( $(#[$vmeta])* $variant = $value, )+
        }

        impl $name {
            pub const STATES: &'static [$crate::status::StateDef] = &[
                $(
                    $crate::status::StateDef {
                        value: orderflow_core::StatusCode($value),
                        name: stringify!($variant),
                        label: $label,
                        color: $crate::status::Color::$color,
                    },
                )+
            ];

            pub const fn code(self) -> orderflow_core::StatusCode {
                orderflow_core::StatusCode(self as u16)
            }

            pub fn from_code(code: orderflow_core::StatusCode) -> Option<Self> {
                match code.0 {
                    $( $value => Some(Self::$variant), )+
                    _ => None,
                }
            }
        }

        impl From<$name> for orderflow_core::StatusCode {
            fn from(status: $name) -> Self {
                status.code()
            }
        }
    };
}

pub(crate) use status_codes;
