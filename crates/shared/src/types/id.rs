//! Typed IDs for type-safe entity references.
//!
//! Using typed IDs prevents accidentally passing a `UserId` where a `TransferId` is expected.
//! Ledger ids are database sequence values, so they are ordered: a larger
//! `TransferId` was inserted later.

use serde::{Deserialize, Serialize};

/// Macro to generate typed ID wrappers.
macro_rules! typed_id {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl $name {
            /// Creates an ID from a raw sequence value.
            #[must_use]
            pub const fn new(id: i64) -> Self {
                Self(id)
            }

            /// Returns the raw sequence value.
            #[must_use]
            pub const fn into_inner(self) -> i64 {
                self.0
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.parse()?))
            }
        }
    };
}

typed_id!(UserId, "Unique identifier for a user.");
typed_id!(TransferId, "Unique identifier for a transfer.");
typed_id!(TransactionId, "Unique identifier for a checkout transaction.");
typed_id!(SubTransactionId, "Unique identifier for a per-container sub transaction.");
typed_id!(SubTransactionRowId, "Unique identifier for a purchased line item.");
typed_id!(FineId, "Unique identifier for a fine.");
typed_id!(FineGroupId, "Unique identifier for a group of unpaid fines.");
typed_id!(WriteOffId, "Unique identifier for a write-off.");
typed_id!(
    InactivityCostId,
    "Unique identifier for an inactivity administrative cost."
);
