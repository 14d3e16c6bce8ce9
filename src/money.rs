//! Exact fixed-point money arithmetic.
//!
//! Floating point never touches a balance or an amount anywhere in this
//! crate. `Decimal` is `rust_decimal::Decimal` (96-bit fixed point, up to 28
//! significant digits), which comfortably covers the "at least 18 fractional
//! digits" requirement. `Money` pairs a `Decimal` with the `Currency` it is
//! denominated in so call sites can't silently mix currencies.

use rust_decimal::Decimal;
use rust_decimal::RoundingStrategy;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "currency", rename_all = "UPPERCASE")]
pub enum Currency {
    Usd,
    Eur,
    Gbp,
}

impl Currency {
    /// Number of fractional digits in the currency's smallest unit, used only
    /// for statistics rounding — never for balance/amount arithmetic.
    pub fn minor_unit_scale(self) -> u32 {
        match self {
            Currency::Usd | Currency::Eur | Currency::Gbp => 2,
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Currency::Usd => "USD",
            Currency::Eur => "EUR",
            Currency::Gbp => "GBP",
        };
        f.write_str(s)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum MoneyError {
    #[error("currency mismatch: {0} vs {1}")]
    CurrencyMismatch(Currency, Currency),
}

/// An exact, currency-tagged amount.
///
/// Arithmetic that would mix currencies returns `MoneyError::CurrencyMismatch`
/// rather than silently picking one side's currency; overflow of the
/// underlying `Decimal` panics (a programmer error, per spec), it is never
/// truncated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Money {
    pub amount: Decimal,
    pub currency: Currency,
}

impl Money {
    pub fn new(amount: Decimal, currency: Currency) -> Self {
        Self { amount, currency }
    }

    pub fn zero(currency: Currency) -> Self {
        Self {
            amount: Decimal::ZERO,
            currency,
        }
    }

    pub fn from_str(s: &str, currency: Currency) -> Result<Self, rust_decimal::Error> {
        Ok(Self {
            amount: Decimal::from_str_exact(s)?,
            currency,
        })
    }

    pub fn is_zero(&self) -> bool {
        self.amount.is_zero()
    }

    pub fn is_negative(&self) -> bool {
        self.amount.is_sign_negative() && !self.amount.is_zero()
    }

    pub fn abs(&self) -> Self {
        Self {
            amount: self.amount.abs(),
            currency: self.currency,
        }
    }

    pub fn neg(&self) -> Self {
        Self {
            amount: -self.amount,
            currency: self.currency,
        }
    }

    fn check_currency(&self, other: &Money) -> Result<(), MoneyError> {
        if self.currency != other.currency {
            return Err(MoneyError::CurrencyMismatch(self.currency, other.currency));
        }
        Ok(())
    }

    pub fn checked_add(&self, other: &Money) -> Result<Money, MoneyError> {
        self.check_currency(other)?;
        Ok(Money::new(self.amount + other.amount, self.currency))
    }

    pub fn checked_sub(&self, other: &Money) -> Result<Money, MoneyError> {
        self.check_currency(other)?;
        Ok(Money::new(self.amount - other.amount, self.currency))
    }

    /// Canonical string form, e.g. "123.45".
    pub fn to_canonical_string(&self) -> String {
        self.amount.normalize().to_string()
    }

    /// Round a ratio (not a balance) to the currency's minor-unit scale using
    /// banker's rounding (round-half-to-even), as required for statistics.
    pub fn round_ratio(ratio: Decimal, currency: Currency) -> Decimal {
        ratio.round_dp_with_strategy(
            currency.minor_unit_scale(),
            RoundingStrategy::MidpointNearestEven,
        )
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.to_canonical_string(), self.currency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::dec;

    #[test]
    fn add_same_currency() {
        let a = Money::new(dec!(10.50), Currency::Usd);
        let b = Money::new(dec!(5.25), Currency::Usd);
        assert_eq!(a.checked_add(&b).unwrap().amount, dec!(15.75));
    }

    #[test]
    fn add_mismatched_currency_errors() {
        let a = Money::new(dec!(10.50), Currency::Usd);
        let b = Money::new(dec!(5.25), Currency::Eur);
        assert!(matches!(
            a.checked_add(&b),
            Err(MoneyError::CurrencyMismatch(Currency::Usd, Currency::Eur))
        ));
    }

    #[test]
    fn canonical_string_trims_trailing_zeros() {
        let m = Money::new(dec!(100.00), Currency::Usd);
        assert_eq!(m.to_canonical_string(), "100");
    }

    #[test]
    fn round_ratio_banker_rounds() {
        let r = Money::round_ratio(dec!(0.125), Currency::Usd);
        assert_eq!(r, dec!(0.12));
    }
}
