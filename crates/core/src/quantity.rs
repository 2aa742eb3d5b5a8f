//! Fixed-point stock quantities.

use core::fmt;
use core::iter::Sum;
use core::ops::{Add, AddAssign};
use core::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::OrderError;

/// Maximum number of fractional digits a quantity may carry.
pub const QUANTITY_SCALE: u32 = 5;

/// Maximum number of integer digits a quantity may carry.
pub const QUANTITY_INTEGER_DIGITS: u32 = 15;

/// A non-negative decimal quantity (15 integer digits, 5 fractional digits).
///
/// Construction through [`Quantity::new`] rejects values that do not fit rather
/// than rounding them. Subtraction is only available in checked form, so a
/// quantity never goes negative.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
#[serde(transparent)]
pub struct Quantity(Decimal);

impl Quantity {
    pub const ZERO: Quantity = Quantity(Decimal::ZERO);
    pub const ONE: Quantity = Quantity(Decimal::ONE);

    pub fn new(value: Decimal) -> Result<Self, OrderError> {
        if value.is_sign_negative() && !value.is_zero() {
            return Err(OrderError::validation(format!(
                "quantity must not be negative, got {value}"
            )));
        }
        let normalized = value.normalize();
        if normalized.scale() > QUANTITY_SCALE {
            return Err(OrderError::validation(format!(
                "quantity {value} has more than {QUANTITY_SCALE} decimal places"
            )));
        }
        if normalized >= Decimal::from(10_u64.pow(QUANTITY_INTEGER_DIGITS)) {
            return Err(OrderError::validation(format!(
                "quantity {value} has more than {QUANTITY_INTEGER_DIGITS} integer digits"
            )));
        }
        Ok(Self(normalized))
    }

    /// Parse a decimal string, e.g. `"2.5"`.
    pub fn parse(s: &str) -> Result<Self, OrderError> {
        let value = Decimal::from_str(s.trim())
            .map_err(|e| OrderError::validation(format!("invalid quantity '{s}': {e}")))?;
        Self::new(value)
    }

    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn is_positive(&self) -> bool {
        !self.0.is_zero()
    }

    pub fn is_whole(&self) -> bool {
        self.0.fract().is_zero()
    }

    /// `self - other`, or `None` if the result would be negative.
    pub fn checked_sub(self, other: Quantity) -> Option<Quantity> {
        if other.0 > self.0 {
            None
        } else {
            Some(Quantity((self.0 - other.0).normalize()))
        }
    }

    /// `self - other`, floored at zero.
    pub fn saturating_sub(self, other: Quantity) -> Quantity {
        self.checked_sub(other).unwrap_or(Quantity::ZERO)
    }
}

impl Add for Quantity {
    type Output = Quantity;

    fn add(self, rhs: Quantity) -> Quantity {
        Quantity((self.0 + rhs.0).normalize())
    }
}

impl AddAssign for Quantity {
    fn add_assign(&mut self, rhs: Quantity) {
        *self = *self + rhs;
    }
}

impl Sum for Quantity {
    fn sum<I: Iterator<Item = Quantity>>(iter: I) -> Quantity {
        iter.fold(Quantity::ZERO, |acc, q| acc + q)
    }
}

impl From<u32> for Quantity {
    fn from(value: u32) -> Self {
        Quantity(Decimal::from(value))
    }
}

impl TryFrom<Decimal> for Quantity {
    type Error = OrderError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Quantity::new(value)
    }
}

impl FromStr for Quantity {
    type Err = OrderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Quantity::parse(s)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl<'de> Deserialize<'de> for Quantity {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = <Decimal as Deserialize>::deserialize(deserializer)?;
        Quantity::new(value).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn rejects_negative_values() {
        assert!(Quantity::parse("-1").is_err());
        assert_eq!(Quantity::parse("-0").unwrap(), Quantity::ZERO);
    }

    #[test]
    fn rejects_excess_precision_instead_of_rounding() {
        assert!(Quantity::parse("0.000001").is_err());
        assert_eq!(Quantity::parse("0.10000").unwrap(), Quantity::parse("0.1").unwrap());
    }

    #[test]
    fn rejects_sixteen_integer_digits() {
        assert!(Quantity::parse("999999999999999").is_ok());
        assert!(Quantity::parse("1000000000000000").is_err());
    }

    #[test]
    fn checked_sub_refuses_to_go_negative() {
        let three = Quantity::from(3);
        let five = Quantity::from(5);
        assert_eq!(five.checked_sub(three), Some(Quantity::from(2)));
        assert_eq!(three.checked_sub(five), None);
        assert_eq!(three.saturating_sub(five), Quantity::ZERO);
    }

    #[test]
    fn deserialize_applies_bounds() {
        let ok: Quantity = serde_json::from_str("\"2.5\"").unwrap();
        assert_eq!(ok, Quantity::parse("2.5").unwrap());
        assert!(serde_json::from_str::<Quantity>("\"-2\"").is_err());
        let whole: Quantity = serde_json::from_str("4").unwrap();
        assert_eq!(whole, Quantity::from(4));
        assert!(serde_json::from_str::<Quantity>("-1").is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 256, .. ProptestConfig::default() })]

        #[test]
        fn add_then_checked_sub_restores(a in 0u32..1_000_000, b in 0u32..1_000_000, scale in 0u32..=5) {
            let qa = Quantity::new(Decimal::new(a as i64, scale)).unwrap();
            let qb = Quantity::new(Decimal::new(b as i64, scale)).unwrap();
            prop_assert_eq!((qa + qb).checked_sub(qb), Some(qa));
        }
    }
}
