//! Pet adoption marketplace backend.
//!
//! The [`adoption`] module owns the animal records, the adoption request ledger, and the
//! coordinator that keeps "at most one approved request per animal" true under concurrency.

pub mod adoption;
pub mod config;
pub mod error;
pub mod telemetry;
