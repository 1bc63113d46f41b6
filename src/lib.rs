//! care_market Library
//!
//! Marketplace coordination engine for a home-care services marketplace:
//! provider verification, job matching, booking lifecycle, ratings and
//! the wallet ledger. Re-exports modules for integration testing and the binaries.

pub mod api;
pub mod audit;
pub mod clock;
pub mod domain;
pub mod external;
pub mod handlers;
pub mod idempotency;
pub mod jobs;
pub mod projection;
pub mod store;

pub mod config;
pub mod db;
mod engine;
mod error;

pub use config::{Config, EngineSettings};
pub use engine::Engine;
pub use error::{AppError, AppResult, ErrorKind};
pub use domain::{Amount, AmountError, Balance, DomainError, OperationContext};
