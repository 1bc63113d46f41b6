//! Idempotency module
//!
//! Ensures an external payment credits a wallet at most once.

mod repository;

pub use repository::{IdempotencyRepository, PaymentReceipt};
