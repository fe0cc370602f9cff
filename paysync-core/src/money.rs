//! Fixed-point currency amounts.
//!
//! Amounts are stored as a signed count of minor units (cents). Every
//! comparison in matching is an integer comparison; the "0.01" tolerance is
//! exactly one minor unit.

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Minor units per major unit.
pub const MINOR_PER_UNIT: i64 = 100;

/// A currency amount in minor units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount(i64);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmountError {
    #[error("Invalid amount: {0:?}")]
    Invalid(String),

    #[error("Amount out of range")]
    Overflow,
}

impl Amount {
    pub const ZERO: Amount = Amount(0);

    /// One minor unit; the fuzzy matching tolerance.
    pub const TOLERANCE: Amount = Amount(1);

    pub const fn from_minor(minor: i64) -> Self {
        Self(minor)
    }

    pub const fn minor(self) -> i64 {
        self.0
    }

    /// Whole units, e.g. `Amount::from_units(500)` is 500.00.
    pub fn from_units(units: i64) -> Result<Self, AmountError> {
        units
            .checked_mul(MINOR_PER_UNIT)
            .map(Self)
            .ok_or(AmountError::Overflow)
    }

    /// Base amount plus a two-digit decimal suffix: `base.suffix`.
    pub fn with_suffix(base_units: i64, suffix: u8) -> Result<Self, AmountError> {
        let base = Self::from_units(base_units)?;
        base.0
            .checked_add(i64::from(suffix))
            .map(Self)
            .ok_or(AmountError::Overflow)
    }

    /// Converts a float, rounding to the nearest minor unit.
    pub fn from_f64(value: f64) -> Result<Self, AmountError> {
        if !value.is_finite() {
            return Err(AmountError::Invalid(value.to_string()));
        }
        let minor = (value * MINOR_PER_UNIT as f64).round();
        if minor.abs() >= i64::MAX as f64 {
            return Err(AmountError::Overflow);
        }
        Ok(Self(minor as i64))
    }

    pub fn to_f64(self) -> f64 {
        self.0 as f64 / MINOR_PER_UNIT as f64
    }

    /// Integer floor of the amount in whole units.
    pub fn floor_units(self) -> i64 {
        self.0.div_euclid(MINOR_PER_UNIT)
    }

    /// The decimal part in minor units (0..=99).
    pub fn fraction(self) -> i64 {
        self.0.rem_euclid(MINOR_PER_UNIT)
    }

    pub fn abs_diff(self, other: Amount) -> Amount {
        Amount((self.0 - other.0).abs())
    }

    pub fn within(self, other: Amount, tolerance: Amount) -> bool {
        self.abs_diff(other) <= tolerance
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    /// Parses a decimal string such as `"500.01"`, `"-3.5"` or `".75"`.
    ///
    /// Digits past the second decimal place round half away from zero.
    pub fn parse(input: &str) -> Result<Self, AmountError> {
        let s = input.trim();
        let invalid = || AmountError::Invalid(input.to_string());

        let (negative, body) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s.strip_prefix('+').unwrap_or(s)),
        };
        let (int_part, frac_part) = body.split_once('.').unwrap_or((body, ""));

        if int_part.is_empty() && frac_part.is_empty() {
            return Err(invalid());
        }
        if !int_part.bytes().all(|b| b.is_ascii_digit())
            || !frac_part.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(invalid());
        }

        let units: i64 = if int_part.is_empty() {
            0
        } else {
            int_part.parse().map_err(|_| AmountError::Overflow)?
        };

        let mut digits = frac_part.bytes().map(|b| i64::from(b - b'0'));
        let tenths = digits.next().unwrap_or(0);
        let hundredths = digits.next().unwrap_or(0);
        let round_up = digits.next().is_some_and(|d| d >= 5);

        let mut minor = units
            .checked_mul(MINOR_PER_UNIT)
            .and_then(|m| m.checked_add(tenths * 10 + hundredths))
            .ok_or(AmountError::Overflow)?;
        if round_up {
            minor = minor.checked_add(1).ok_or(AmountError::Overflow)?;
        }

        Ok(Self(if negative { -minor } else { minor }))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let per = MINOR_PER_UNIT as u64;
        write!(f, "{}{}.{:02}", sign, abs / per, abs % per)
    }
}

impl FromStr for Amount {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(self.to_f64())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        d.deserialize_any(AmountVisitor)
    }
}

struct AmountVisitor;

impl Visitor<'_> for AmountVisitor {
    type Value = Amount;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a decimal amount as a number or string")
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Amount, E> {
        Amount::from_units(v).map_err(E::custom)
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Amount, E> {
        let units = i64::try_from(v).map_err(|_| E::custom(AmountError::Overflow))?;
        Amount::from_units(units).map_err(E::custom)
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Amount, E> {
        Amount::from_f64(v).map_err(E::custom)
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Amount, E> {
        Amount::parse(v).map_err(E::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plain_and_fractional() {
        assert_eq!(Amount::parse("500").unwrap().minor(), 50_000);
        assert_eq!(Amount::parse("500.01").unwrap().minor(), 50_001);
        assert_eq!(Amount::parse("500.1").unwrap().minor(), 50_010);
        assert_eq!(Amount::parse(".75").unwrap().minor(), 75);
        assert_eq!(Amount::parse("-3.5").unwrap().minor(), -350);
    }

    #[test]
    fn parse_rounds_third_decimal() {
        assert_eq!(Amount::parse("1.005").unwrap().minor(), 101);
        assert_eq!(Amount::parse("1.004").unwrap().minor(), 100);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(Amount::parse("").is_err());
        assert!(Amount::parse(".").is_err());
        assert!(Amount::parse("12a.00").is_err());
        assert!(Amount::parse("1,500.00").is_err());
    }

    #[test]
    fn float_inputs_do_not_drift() {
        // 0.1 + 0.2 style drift must not leak into minor units
        assert_eq!(Amount::from_f64(500.01).unwrap(), Amount::from_minor(50_001));
        assert_eq!(Amount::from_f64(0.1 + 0.2).unwrap(), Amount::from_minor(30));
    }

    #[test]
    fn suffix_and_floor() {
        let amount = Amount::with_suffix(500, 1).unwrap();
        assert_eq!(amount.to_string(), "500.01");
        assert_eq!(amount.floor_units(), 500);
        assert_eq!(amount.fraction(), 1);
        assert_eq!(Amount::parse("0.99").unwrap().floor_units(), 0);
    }

    #[test]
    fn tolerance_is_one_minor_unit() {
        let a = Amount::parse("750.00").unwrap();
        assert!(a.within(Amount::parse("750.01").unwrap(), Amount::TOLERANCE));
        assert!(a.within(Amount::parse("749.99").unwrap(), Amount::TOLERANCE));
        assert!(!a.within(Amount::parse("750.02").unwrap(), Amount::TOLERANCE));
    }

    #[test]
    fn json_accepts_numbers_and_strings() {
        let from_number: Amount = serde_json::from_str("750.5").unwrap();
        let from_string: Amount = serde_json::from_str("\"750.50\"").unwrap();
        let from_int: Amount = serde_json::from_str("750").unwrap();
        assert_eq!(from_number, from_string);
        assert_eq!(from_int.minor(), 75_000);
        assert_eq!(serde_json::to_string(&from_number).unwrap(), "750.5");
    }

    #[test]
    fn json_number_keeps_every_minor_unit() {
        for text in ["0.07", "500.01", "750.50", "123456789.99"] {
            let amount = Amount::parse(text).unwrap();
            let json = serde_json::to_string(&amount).unwrap();
            let back: Amount = serde_json::from_str(&json).unwrap();
            assert_eq!(back, amount, "{} serialized as {}", text, json);
            assert_eq!(amount.to_string(), text);
        }
    }

    #[test]
    fn display_negative() {
        assert_eq!(Amount::from_minor(-5).to_string(), "-0.05");
    }
}
