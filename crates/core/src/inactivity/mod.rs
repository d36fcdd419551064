//! Administrative cost for inactive users.
//!
//! An active user without ledger activity for longer than the configured
//! threshold is charged a one-off cost, capped at their positive balance.

pub mod engine;
pub mod types;

pub use engine::InactivityEngine;
pub use types::{ChargedCost, InactivityCost, InactivityScanReport};
