//! Ledger error types.
//!
//! Every failure a ledger operation can report falls into one of a few
//! classes: validation of caller input, a missing record, a business rule,
//! a retryable concurrency conflict, or a data integrity violation. Data
//! integrity violations mean stored data contradicts itself and must never
//! be papered over with a best-effort value.

use tabkeeper_shared::{
    AppError,
    types::{FineGroupId, Money, MoneyError, MoneyMismatch, TransferId, UserId},
};
use thiserror::Error;

use crate::verifier::BalanceMismatch;

/// Errors that can occur during ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    // ========== Validation Errors ==========
    /// Ledger amounts must be strictly positive.
    #[error("Amount must be positive, got {0}")]
    NonPositiveAmount(Money),

    /// Amount is not expressed in the ledger currency.
    #[error("Amount is not in the ledger currency: {0}")]
    WrongCurrency(#[source] MoneyMismatch),

    /// A transfer needs at least one user on either side.
    #[error("Transfer must have a sender or a receiver")]
    MissingParty,

    /// A transfer from a user to themselves.
    #[error("User {0} cannot transfer to themselves")]
    SelfTransfer(UserId),

    /// A checkout without line items.
    #[error("Checkout must contain at least one row")]
    EmptyCheckout,

    /// A checkout row with a non-positive quantity.
    #[error("Quantity must be positive, got {0}")]
    InvalidQuantity(i64),

    /// A checkout row with a negative unit price.
    #[error("Unit price cannot be negative, got {0}")]
    NegativePrice(Money),

    /// An amount or checkout total that does not fit in 64-bit minor units.
    #[error("Amount exceeds the supported range")]
    AmountOverflow,

    /// A cause that only its engine may record.
    #[error("Transfers caused by '{0}' are recorded by their engine")]
    ReservedCause(&'static str),

    // ========== Not Found Errors ==========
    /// User not found.
    #[error("User not found: {0}")]
    UserNotFound(UserId),

    /// Transfer not found.
    #[error("Transfer not found: {0}")]
    TransferNotFound(TransferId),

    /// Fine group not found.
    #[error("Fine group not found: {0}")]
    FineGroupNotFound(FineGroupId),

    /// No transfer records the given invoice.
    #[error("Invoice not found: {0}")]
    InvoiceNotFound(i64),

    // ========== Business Rule Errors ==========
    /// The invoice already has a reversing transfer.
    #[error("Invoice {0} has already been voided")]
    InvoiceAlreadyVoided(i64),

    /// Operation requires a negative balance.
    #[error("User {user_id} is not in debt (balance {balance})")]
    NotInDebt {
        /// The user.
        user_id: UserId,
        /// Their current balance.
        balance: Money,
    },

    /// Operation requires an open fine group.
    #[error("User {0} has no unpaid fines")]
    NoOpenFines(UserId),

    // ========== Concurrency Errors ==========
    /// A concurrent writer touched the same user; the operation may be retried.
    #[error("Concurrent modification detected, please retry: {0}")]
    ConcurrencyConflict(String),

    // ========== Data Integrity Errors ==========
    /// Events of one user's ledger do not share currency and precision.
    #[error("Currency mismatch in the ledger of user {user_id}: {mismatch}")]
    CurrencyMismatch {
        /// The user whose ledger is inconsistent.
        user_id: UserId,
        /// The conflicting values.
        #[source]
        mismatch: MoneyMismatch,
    },

    /// A cached balance points at a transfer that does not exist.
    #[error("Cached balance of user {user_id} references missing transfer {transfer_id}")]
    DanglingCacheWatermark {
        /// The user whose cache row is broken.
        user_id: UserId,
        /// The transfer the cache row references.
        transfer_id: TransferId,
    },

    /// The cached balance disagrees with a full rescan.
    #[error("Cached balance of user {user_id} is {cached}, full rescan gives {actual}")]
    CacheDivergence {
        /// The user.
        user_id: UserId,
        /// Balance derived from the cache.
        cached: Money,
        /// Balance derived from the full history.
        actual: Money,
    },

    /// Balances changed across a structural change.
    #[error("{} balance(s) changed across a structural change", .mismatches.len())]
    BalanceMismatch {
        /// Every user whose balance changed.
        mismatches: Vec<BalanceMismatch>,
    },

    /// A user's balance left the 64-bit range.
    #[error("Balance of user {0} exceeds the supported range")]
    BalanceOverflow(UserId),

    /// A stored row cannot be mapped to a ledger value.
    #[error("Corrupt ledger row: {0}")]
    CorruptRow(String),

    // ========== Infrastructure Errors ==========
    /// A collaborator outside the ledger failed.
    #[error("External dependency failed: {0}")]
    ExternalDependency(String),

    /// Database error.
    #[error("Database error: {0}")]
    Database(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl LedgerError {
    /// Returns the error code for API responses.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::NonPositiveAmount(_) => "NON_POSITIVE_AMOUNT",
            Self::WrongCurrency(_) => "WRONG_CURRENCY",
            Self::MissingParty => "MISSING_PARTY",
            Self::SelfTransfer(_) => "SELF_TRANSFER",
            Self::EmptyCheckout => "EMPTY_CHECKOUT",
            Self::InvalidQuantity(_) => "INVALID_QUANTITY",
            Self::NegativePrice(_) => "NEGATIVE_PRICE",
            Self::AmountOverflow => "AMOUNT_OVERFLOW",
            Self::ReservedCause(_) => "RESERVED_CAUSE",
            Self::UserNotFound(_) => "USER_NOT_FOUND",
            Self::TransferNotFound(_) => "TRANSFER_NOT_FOUND",
            Self::FineGroupNotFound(_) => "FINE_GROUP_NOT_FOUND",
            Self::InvoiceNotFound(_) => "INVOICE_NOT_FOUND",
            Self::InvoiceAlreadyVoided(_) => "INVOICE_ALREADY_VOIDED",
            Self::NotInDebt { .. } => "NOT_IN_DEBT",
            Self::NoOpenFines(_) => "NO_OPEN_FINES",
            Self::ConcurrencyConflict(_) => "CONCURRENCY_CONFLICT",
            Self::CurrencyMismatch { .. } => "CURRENCY_MISMATCH",
            Self::DanglingCacheWatermark { .. } => "DANGLING_CACHE_WATERMARK",
            Self::CacheDivergence { .. } => "CACHE_DIVERGENCE",
            Self::BalanceMismatch { .. } => "BALANCE_MISMATCH",
            Self::BalanceOverflow(_) => "BALANCE_OVERFLOW",
            Self::CorruptRow(_) => "CORRUPT_ROW",
            Self::ExternalDependency(_) => "EXTERNAL_DEPENDENCY_ERROR",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Returns the HTTP status code for this error.
    #[must_use]
    pub const fn http_status_code(&self) -> u16 {
        match self {
            // 400 Bad Request - validation errors
            Self::NonPositiveAmount(_)
            | Self::WrongCurrency(_)
            | Self::MissingParty
            | Self::SelfTransfer(_)
            | Self::EmptyCheckout
            | Self::InvalidQuantity(_)
            | Self::NegativePrice(_)
            | Self::AmountOverflow
            | Self::ReservedCause(_) => 400,

            // 404 Not Found
            Self::UserNotFound(_)
            | Self::TransferNotFound(_)
            | Self::FineGroupNotFound(_)
            | Self::InvoiceNotFound(_) => 404,

            // 409 Conflict - concurrency errors
            Self::ConcurrencyConflict(_) => 409,

            // 422 Unprocessable - business rules
            Self::InvoiceAlreadyVoided(_) | Self::NotInDebt { .. } | Self::NoOpenFines(_) => 422,

            // 502 Bad Gateway
            Self::ExternalDependency(_) => 502,

            // 500 Internal Server Error
            Self::CurrencyMismatch { .. }
            | Self::DanglingCacheWatermark { .. }
            | Self::CacheDivergence { .. }
            | Self::BalanceMismatch { .. }
            | Self::BalanceOverflow(_)
            | Self::CorruptRow(_)
            | Self::Database(_)
            | Self::Internal(_) => 500,
        }
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict(_))
    }

    /// Returns true if stored ledger data contradicts itself.
    #[must_use]
    pub const fn is_data_integrity(&self) -> bool {
        matches!(
            self,
            Self::CurrencyMismatch { .. }
                | Self::DanglingCacheWatermark { .. }
                | Self::CacheDivergence { .. }
                | Self::BalanceMismatch { .. }
                | Self::BalanceOverflow(_)
                | Self::CorruptRow(_)
        )
    }

    /// Error for arithmetic on stored amounts of `user_id` that failed.
    #[must_use]
    pub const fn in_ledger_of(user_id: UserId, error: MoneyError) -> Self {
        match error {
            MoneyError::Mismatch(mismatch) => Self::CurrencyMismatch { user_id, mismatch },
            MoneyError::Overflow => Self::BalanceOverflow(user_id),
        }
    }

    /// Error for a caller-supplied amount that failed checked arithmetic.
    #[must_use]
    pub const fn invalid_amount(error: MoneyError) -> Self {
        match error {
            MoneyError::Mismatch(mismatch) => Self::WrongCurrency(mismatch),
            MoneyError::Overflow => Self::AmountOverflow,
        }
    }
}

impl From<LedgerError> for AppError {
    fn from(err: LedgerError) -> Self {
        let message = err.to_string();
        match err {
            LedgerError::NonPositiveAmount(_)
            | LedgerError::WrongCurrency(_)
            | LedgerError::MissingParty
            | LedgerError::SelfTransfer(_)
            | LedgerError::EmptyCheckout
            | LedgerError::InvalidQuantity(_)
            | LedgerError::NegativePrice(_)
            | LedgerError::AmountOverflow
            | LedgerError::ReservedCause(_) => Self::Validation(message),
            LedgerError::UserNotFound(_)
            | LedgerError::TransferNotFound(_)
            | LedgerError::FineGroupNotFound(_)
            | LedgerError::InvoiceNotFound(_) => Self::NotFound(message),
            LedgerError::InvoiceAlreadyVoided(_)
            | LedgerError::NotInDebt { .. }
            | LedgerError::NoOpenFines(_) => Self::BusinessRule(message),
            LedgerError::ConcurrencyConflict(_) => Self::Conflict(message),
            LedgerError::CurrencyMismatch { .. }
            | LedgerError::DanglingCacheWatermark { .. }
            | LedgerError::CacheDivergence { .. }
            | LedgerError::BalanceMismatch { .. }
            | LedgerError::BalanceOverflow(_)
            | LedgerError::CorruptRow(_) => Self::DataIntegrity(message),
            LedgerError::ExternalDependency(_) => Self::ExternalService(message),
            LedgerError::Database(_) => Self::Database(message),
            LedgerError::Internal(_) => Self::Internal(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tabkeeper_shared::types::Currency;

    fn eur(amount: i64) -> Money {
        Money::new(amount, Currency::Eur, 2)
    }

    fn mismatch() -> MoneyMismatch {
        MoneyMismatch {
            left_currency: Currency::Eur,
            left_precision: 2,
            right_currency: Currency::Usd,
            right_precision: 2,
        }
    }

    #[rstest]
    #[case(LedgerError::NonPositiveAmount(eur(0)), 400, "NON_POSITIVE_AMOUNT")]
    #[case(LedgerError::WrongCurrency(mismatch()), 400, "WRONG_CURRENCY")]
    #[case(LedgerError::UserNotFound(UserId(1)), 404, "USER_NOT_FOUND")]
    #[case(LedgerError::NoOpenFines(UserId(1)), 422, "NO_OPEN_FINES")]
    #[case(LedgerError::ConcurrencyConflict("deadlock".into()), 409, "CONCURRENCY_CONFLICT")]
    #[case(LedgerError::ExternalDependency("smtp".into()), 502, "EXTERNAL_DEPENDENCY_ERROR")]
    #[case(LedgerError::CorruptRow("bad".into()), 500, "CORRUPT_ROW")]
    #[case(LedgerError::AmountOverflow, 400, "AMOUNT_OVERFLOW")]
    #[case(LedgerError::ReservedCause("fine"), 400, "RESERVED_CAUSE")]
    #[case(LedgerError::BalanceOverflow(UserId(1)), 500, "BALANCE_OVERFLOW")]
    fn test_status_and_code(
        #[case] error: LedgerError,
        #[case] status: u16,
        #[case] code: &str,
    ) {
        assert_eq!(error.http_status_code(), status);
        assert_eq!(error.error_code(), code);
    }

    #[test]
    fn test_only_conflicts_are_retryable() {
        assert!(LedgerError::ConcurrencyConflict("40001".into()).is_retryable());
        assert!(!LedgerError::Database("connection reset".into()).is_retryable());
        assert!(!LedgerError::UserNotFound(UserId(3)).is_retryable());
    }

    #[test]
    fn test_data_integrity_classification() {
        let err = LedgerError::CurrencyMismatch {
            user_id: UserId(7),
            mismatch: mismatch(),
        };
        assert!(err.is_data_integrity());
        assert_eq!(
            err.to_string(),
            "Currency mismatch in the ledger of user 7: Cannot combine EUR/2 with USD/2"
        );

        let dangling = LedgerError::DanglingCacheWatermark {
            user_id: UserId(7),
            transfer_id: TransferId(99),
        };
        assert!(dangling.is_data_integrity());
        assert!(!LedgerError::MissingParty.is_data_integrity());
    }

    #[test]
    fn test_money_errors_by_origin() {
        let stored = LedgerError::in_ledger_of(UserId(4), MoneyError::Overflow);
        assert!(matches!(stored, LedgerError::BalanceOverflow(UserId(4))));
        assert!(stored.is_data_integrity());

        let stored = LedgerError::in_ledger_of(UserId(4), MoneyError::Mismatch(mismatch()));
        assert!(matches!(stored, LedgerError::CurrencyMismatch { user_id: UserId(4), .. }));

        let input = LedgerError::invalid_amount(MoneyError::Overflow);
        assert!(matches!(input, LedgerError::AmountOverflow));
        assert!(!input.is_data_integrity());
        assert!(matches!(
            LedgerError::invalid_amount(MoneyError::Mismatch(mismatch())),
            LedgerError::WrongCurrency(_)
        ));
    }

    #[test]
    fn test_conversion_to_app_error() {
        let app: AppError = LedgerError::DanglingCacheWatermark {
            user_id: UserId(1),
            transfer_id: TransferId(2),
        }
        .into();
        assert_eq!(app.error_code(), "DATA_INTEGRITY_ERROR");

        let app: AppError = LedgerError::ConcurrencyConflict("busy".into()).into();
        assert_eq!(app.status_code(), 409);

        let app: AppError = LedgerError::NotInDebt {
            user_id: UserId(1),
            balance: eur(100),
        }
        .into();
        assert_eq!(app.error_code(), "BUSINESS_RULE_VIOLATION");
    }
}
