//! Store Module
//!
//! Versioned key-value persistence with compare-and-set and atomic
//! multi-key commits, plus the typed repository the handlers work through.

mod error;
mod kv;
mod memory;
mod postgres;
mod repository;

pub use error::StoreError;
pub use kv::{ExpectedVersion, KvStore, VersionedValue, WriteAction, WriteOp};
pub use memory::MemoryStore;
pub use postgres::PgKvStore;
pub use repository::{Changeset, Record, Repository, RetryPolicy, Versioned};
