//! Signed currency amounts stored as integer cents.
//!
//! The ledger sums these in SQL (`SUM(amount_cents)`), so totals are exact
//! and a day with `+100.00, +50.00, -20.00` closes at exactly `130.00`.
//! Anything that can produce fractions of a cent (typed amounts, discounts)
//! goes through [`Decimal`] and is rounded back to whole cents.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use rusqlite::types::{FromSql, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Neg, Sub};
use std::str::FromStr;

use crate::error::{PosError, PosResult};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub const fn from_cents(cents: i64) -> Self {
        Self(cents)
    }

    pub const fn from_units(units: i64) -> Self {
        Self(units * 100)
    }

    pub const fn cents(&self) -> i64 {
        self.0
    }

    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub const fn is_positive(&self) -> bool {
        self.0 > 0
    }

    pub const fn is_negative(&self) -> bool {
        self.0 < 0
    }

    pub const fn abs(&self) -> Self {
        Self(self.0.abs())
    }

    /// Multiply by a quantity.
    pub fn times(&self, qty: i64) -> Self {
        Self(self.0 * qty)
    }

    /// Exact decimal value in currency units.
    pub fn to_decimal(&self) -> Decimal {
        Decimal::new(self.0, 2)
    }

    /// Round `value` half away from zero to the cent. `None` when it does
    /// not fit in cents.
    pub fn from_decimal(value: Decimal) -> Option<Self> {
        value
            .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
            .checked_mul(Decimal::ONE_HUNDRED)?
            .to_i64()
            .map(Self)
    }

    /// Apply a percentage discount, rounding half away from zero to the cent.
    pub fn discounted(&self, percent: u8) -> Self {
        let keep = Decimal::from(100 - u32::from(percent.min(100))) / Decimal::ONE_HUNDRED;
        // never larger in magnitude than `self`, so it always fits
        Self::from_decimal(self.to_decimal() * keep).unwrap_or(*self)
    }

    /// Parse an amount typed by an operator.
    ///
    /// Accepts `"10.50"`, `"10,50"`, `"R$ 10,50"`, `"-20"` and `"1.234,56"`.
    pub fn parse(input: &str) -> PosResult<Self> {
        let invalid = || PosError::validation(format!("invalid amount: {input:?}"));

        let trimmed = input.trim();
        let amount = trimmed.strip_prefix("R$").unwrap_or(trimmed).trim();
        let value = Decimal::from_str(&normalize_decimal_mark(amount)).map_err(|_| invalid())?;
        Self::from_decimal(value).ok_or_else(invalid)
    }
}

/// Operators type both `1.234,56` and `1,234.56`: the last separator is the
/// decimal mark when at most two digits follow it, every other one groups
/// thousands.
fn normalize_decimal_mark(amount: &str) -> String {
    let grouping_removed = |s: &str| s.chars().filter(|c| *c != '.' && *c != ',').collect::<String>();
    match amount.rfind(['.', ',']) {
        Some(pos) if amount.len() - pos - 1 <= 2 => {
            let (whole, frac) = amount.split_at(pos);
            format!("{}.{}", grouping_removed(whole), &frac[1..])
        }
        Some(_) => grouping_removed(amount),
        None => amount.to_string(),
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "R$ {sign}{}.{:02}", abs / 100, abs % 100)
    }
}

impl Add for Money {
    type Output = Money;
    fn add(self, rhs: Money) -> Money {
        Money(self.0 + rhs.0)
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, rhs: Money) {
        self.0 += rhs.0;
    }
}

impl Sub for Money {
    type Output = Money;
    fn sub(self, rhs: Money) -> Money {
        Money(self.0 - rhs.0)
    }
}

impl Neg for Money {
    type Output = Money;
    fn neg(self) -> Money {
        Money(-self.0)
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Money {
        iter.fold(Money::ZERO, |acc, m| acc + m)
    }
}

impl ToSql for Money {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0))
    }
}

impl FromSql for Money {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        i64::column_result(value).map(Money)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_operator_input() {
        assert_eq!(Money::parse("10.50").unwrap(), Money::from_cents(1050));
        assert_eq!(Money::parse("10,5").unwrap(), Money::from_cents(1050));
        assert_eq!(Money::parse("R$ 130,00").unwrap(), Money::from_cents(13000));
        assert_eq!(Money::parse("-20").unwrap(), Money::from_cents(-2000));
        assert_eq!(Money::parse("1.234,56").unwrap(), Money::from_cents(123456));
        assert_eq!(Money::parse("1,234.56").unwrap(), Money::from_cents(123456));
        assert!(Money::parse("").is_err());
        assert!(Money::parse("abc").is_err());
        assert!(Money::parse("R$").is_err());
        assert!(Money::parse("1.2.3x").is_err());
    }

    #[test]
    fn test_sub_cent_values_round_half_away_from_zero() {
        let cents = |raw: &str| Money::from_decimal(Decimal::from_str(raw).unwrap());
        assert_eq!(cents("0.005"), Some(Money::from_cents(1)));
        assert_eq!(cents("-0.005"), Some(Money::from_cents(-1)));
        assert_eq!(cents("2.344"), Some(Money::from_cents(234)));
    }

    #[test]
    fn test_decimal_round_trip_is_exact() {
        let amount = Money::from_cents(-2005);
        assert_eq!(amount.to_decimal(), Decimal::new(-2005, 2));
        assert_eq!(Money::from_decimal(amount.to_decimal()), Some(amount));
    }

    #[test]
    fn test_displays_in_store_format() {
        assert_eq!(Money::from_cents(13000).to_string(), "R$ 130.00");
        assert_eq!(Money::from_cents(-2005).to_string(), "R$ -20.05");
        assert_eq!(Money::ZERO.to_string(), "R$ 0.00");
    }

    #[test]
    fn test_discount_rounds_to_the_cent() {
        // 3 x 33.33 = 99.99, 5% off = 94.9905 -> 94.99
        let gross = Money::from_cents(3333).times(3);
        assert_eq!(gross.discounted(5), Money::from_cents(9499));
        assert_eq!(Money::from_units(100).discounted(10), Money::from_units(90));
        assert_eq!(Money::from_units(100).discounted(0), Money::from_units(100));
    }

    #[test]
    fn test_sums_signed_amounts() {
        let total: Money = [10000, 5000, -2000]
            .into_iter()
            .map(Money::from_cents)
            .sum();
        assert_eq!(total, Money::from_units(130));
    }
}
