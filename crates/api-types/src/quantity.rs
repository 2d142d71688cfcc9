//! Resource quantities in the orchestrator's string notation (`4`, `1500m`, `2Ki`)

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuantityError {
    #[error("empty quantity")]
    Empty,
    #[error("invalid quantity `{value}`: {reason}")]
    Invalid { value: String, reason: &'static str },
    #[error("quantity `{0}` does not fit in 64 bits")]
    Overflow(String),
}

/// A non-negative quantity, stored in thousandths of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Quantity {
    millis: u64,
}

impl Quantity {
    /// Creates a quantity holding a whole number of units.
    pub const fn from_units(units: u64) -> Self {
        Self {
            millis: units.saturating_mul(1000),
        }
    }

    /// Returns the integral value, rounding fractional quantities up.
    pub const fn value(&self) -> u64 {
        self.millis.div_ceil(1000)
    }

    pub const fn millis(&self) -> u64 {
        self.millis
    }
}

/// Multiplier for a suffix as a `(numerator, denominator)` pair.
fn suffix_multiplier(suffix: &str) -> Option<(u128, u128)> {
    let multiplier = match suffix {
        "" => (1, 1),
        "m" => (1, 1000),
        "k" => (1_000, 1),
        "M" => (1_000_000, 1),
        "G" => (1_000_000_000, 1),
        "T" => (1_000_000_000_000, 1),
        "Ki" => (1 << 10, 1),
        "Mi" => (1 << 20, 1),
        "Gi" => (1 << 30, 1),
        "Ti" => (1 << 40, 1),
        _ => return None,
    };
    Some(multiplier)
}

impl FromStr for Quantity {
    type Err = QuantityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(QuantityError::Empty);
        }
        let invalid = |reason| QuantityError::Invalid {
            value: s.to_string(),
            reason,
        };

        let split = s
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(s.len());
        let (number, suffix) = s.split_at(split);
        let (numerator, denominator) =
            suffix_multiplier(suffix).ok_or_else(|| invalid("unknown suffix"))?;

        let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
        if whole.is_empty() && fraction.is_empty() {
            return Err(invalid("missing digits"));
        }
        if fraction.contains('.') {
            return Err(invalid("more than one decimal point"));
        }

        let overflow = || QuantityError::Overflow(s.to_string());
        let digits = format!("{whole}{fraction}");
        let mantissa: u128 = digits.parse().map_err(|_| invalid("not a number"))?;
        let scale = u32::try_from(fraction.len())
            .ok()
            .and_then(|len| 10u128.checked_pow(len))
            .ok_or_else(overflow)?;

        let scaled = mantissa
            .checked_mul(numerator)
            .and_then(|v| v.checked_mul(1000))
            .ok_or_else(overflow)?;
        let divisor = scale.checked_mul(denominator).ok_or_else(overflow)?;
        let millis = scaled.div_ceil(divisor);
        let millis = u64::try_from(millis).map_err(|_| overflow())?;

        Ok(Self { millis })
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.millis % 1000 == 0 {
            write!(f, "{}", self.millis / 1000)
        } else {
            write!(f, "{}m", self.millis)
        }
    }
}

impl Serialize for Quantity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Accepts both the string notation and bare JSON integers.
impl<'de> Deserialize<'de> for Quantity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum StringOrInt {
            String(String),
            Int(u64),
        }

        match StringOrInt::deserialize(deserializer)? {
            StringOrInt::String(s) => s.parse().map_err(serde::de::Error::custom),
            StringOrInt::Int(units) => Ok(Quantity::from_units(units)),
        }
    }
}
