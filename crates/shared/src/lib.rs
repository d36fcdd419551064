//! Shared types, errors, and configuration for Tabkeeper.
//!
//! This crate provides common types used across all other crates:
//! - Integer-backed money type with currency and precision
//! - Typed IDs for type-safe entity references
//! - Pagination types for list queries
//! - Application-wide error types
//! - Configuration management

pub mod config;
pub mod error;
pub mod types;

pub use config::{AppConfig, FineConfig, InactivityConfig, LedgerConfig};
pub use error::AppError;
