//! Money type backed by an integer count of minor units.
//!
//! CRITICAL: Never use floating-point for money calculations.
//! Every balance-affecting value is an `i64` of minor units (e.g. cents).
//! `Decimal` appears only when a value is rendered for people.

use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// ISO 4217 currency codes supported by the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    /// Euro
    Eur,
    /// US Dollar
    Usd,
    /// Indonesian Rupiah
    Idr,
    /// Singapore Dollar
    Sgd,
    /// Japanese Yen
    Jpy,
}

impl Currency {
    /// Number of minor-unit digits conventionally used for this currency.
    #[must_use]
    pub const fn default_precision(self) -> u32 {
        match self {
            Self::Jpy => 0,
            Self::Eur | Self::Usd | Self::Idr | Self::Sgd => 2,
        }
    }
}

/// Largest number of minor-unit digits a ledger may use.
pub const MAX_PRECISION: u32 = 18;

/// Represents a monetary amount with currency and precision.
///
/// Values are immutable; arithmetic returns new values. Combining two values
/// of different currency or precision with the operators is a programming
/// error and panics. Use [`Money::checked_add`] / [`Money::checked_sub`] where
/// the operands come from stored data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Money {
    /// The amount in minor units (e.g., cents).
    pub amount: i64,
    /// ISO 4217 currency code.
    pub currency: Currency,
    /// Number of minor-unit digits.
    pub precision: u32,
}

/// Two money values that do not share currency and precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Cannot combine {left_currency}/{left_precision} with {right_currency}/{right_precision}")]
pub struct MoneyMismatch {
    /// Currency of the left operand.
    pub left_currency: Currency,
    /// Precision of the left operand.
    pub left_precision: u32,
    /// Currency of the right operand.
    pub right_currency: Currency,
    /// Precision of the right operand.
    pub right_precision: u32,
}

/// Failure of checked money arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MoneyError {
    /// The operands do not share currency and precision.
    #[error(transparent)]
    Mismatch(#[from] MoneyMismatch),
    /// The result does not fit in `i64` minor units.
    #[error("Amount does not fit in 64-bit minor units")]
    Overflow,
}

impl Money {
    /// Creates a new Money instance.
    #[must_use]
    pub const fn new(amount: i64, currency: Currency, precision: u32) -> Self {
        Self {
            amount,
            currency,
            precision,
        }
    }

    /// Creates a Money instance using the currency's default precision.
    #[must_use]
    pub const fn of(amount: i64, currency: Currency) -> Self {
        Self::new(amount, currency, currency.default_precision())
    }

    /// Creates a zero amount in the specified currency and precision.
    #[must_use]
    pub const fn zero(currency: Currency, precision: u32) -> Self {
        Self::new(0, currency, precision)
    }

    /// Creates a zero amount with the same currency and precision as `self`.
    #[must_use]
    pub const fn zero_like(&self) -> Self {
        Self::zero(self.currency, self.precision)
    }

    /// Returns true if both values share currency and precision.
    #[must_use]
    pub fn is_compatible(&self, other: &Self) -> bool {
        self.currency == other.currency && self.precision == other.precision
    }

    /// Adds two values, failing when they are not compatible or the sum
    /// overflows.
    pub fn checked_add(self, other: Self) -> Result<Self, MoneyError> {
        self.ensure_compatible(&other)?;
        let amount = self.amount.checked_add(other.amount).ok_or(MoneyError::Overflow)?;
        Ok(Self::new(amount, self.currency, self.precision))
    }

    /// Subtracts `other`, failing when the values are not compatible or the
    /// difference overflows.
    pub fn checked_sub(self, other: Self) -> Result<Self, MoneyError> {
        self.ensure_compatible(&other)?;
        let amount = self.amount.checked_sub(other.amount).ok_or(MoneyError::Overflow)?;
        Ok(Self::new(amount, self.currency, self.precision))
    }

    /// Multiplies the amount by an integer factor.
    pub const fn multiply(self, factor: i64) -> Result<Self, MoneyError> {
        match self.amount.checked_mul(factor) {
            Some(amount) => Ok(Self::new(amount, self.currency, self.precision)),
            None => Err(MoneyError::Overflow),
        }
    }

    /// Returns the value with its sign flipped. `i64::MIN` saturates.
    #[must_use]
    pub const fn negate(self) -> Self {
        Self::new(self.amount.saturating_neg(), self.currency, self.precision)
    }

    /// Returns the absolute value. `i64::MIN` saturates.
    #[must_use]
    pub const fn abs(self) -> Self {
        Self::new(self.amount.saturating_abs(), self.currency, self.precision)
    }

    /// Returns the smaller of two compatible values.
    ///
    /// # Panics
    ///
    /// Panics if the values are not compatible.
    #[must_use]
    pub fn min(self, other: Self) -> Self {
        if let Err(mismatch) = self.ensure_compatible(&other) {
            panic!("{mismatch}");
        }
        if other.amount < self.amount { other } else { self }
    }

    /// Returns true if the amount is zero.
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.amount == 0
    }

    /// Returns true if the amount is negative.
    #[must_use]
    pub const fn is_negative(&self) -> bool {
        self.amount < 0
    }

    /// Returns true if the amount is strictly positive.
    #[must_use]
    pub const fn is_positive(&self) -> bool {
        self.amount > 0
    }

    /// Converts to a decimal for display. Never feed the result back into
    /// balance arithmetic. Precisions beyond what `Decimal` can scale are
    /// clamped to [`MAX_PRECISION`].
    #[must_use]
    pub fn to_decimal(&self) -> Decimal {
        Decimal::new(self.amount, self.precision.min(MAX_PRECISION))
    }

    fn ensure_compatible(&self, other: &Self) -> Result<(), MoneyMismatch> {
        if self.is_compatible(other) {
            Ok(())
        } else {
            Err(MoneyMismatch {
                left_currency: self.currency,
                left_precision: self.precision,
                right_currency: other.currency,
                right_precision: other.precision,
            })
        }
    }
}

impl Add for Money {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        match self.checked_add(rhs) {
            Ok(sum) => sum,
            Err(err) => panic!("{err}"),
        }
    }
}

impl Sub for Money {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        match self.checked_sub(rhs) {
            Ok(difference) => difference,
            Err(err) => panic!("{err}"),
        }
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl SubAssign for Money {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl Neg for Money {
    type Output = Self;

    fn neg(self) -> Self::Output {
        self.negate()
    }
}

impl std::fmt::Display for Money {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.currency, self.to_decimal())
    }
}

impl std::fmt::Display for Currency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Eur => write!(f, "EUR"),
            Self::Usd => write!(f, "USD"),
            Self::Idr => write!(f, "IDR"),
            Self::Sgd => write!(f, "SGD"),
            Self::Jpy => write!(f, "JPY"),
        }
    }
}

impl std::str::FromStr for Currency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "EUR" => Ok(Self::Eur),
            "USD" => Ok(Self::Usd),
            "IDR" => Ok(Self::Idr),
            "SGD" => Ok(Self::Sgd),
            "JPY" => Ok(Self::Jpy),
            _ => Err(format!("Unknown currency: {s}")),
        }
    }
}
