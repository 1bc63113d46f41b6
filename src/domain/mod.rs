//! Domain module
//!
//! Core domain types and business rules. Entities here are plain data with
//! validating methods; persistence and concurrency live in `store`.

pub mod amount;
pub mod booking;
pub mod context;
pub mod error;
pub mod provider;
pub mod verification;
pub mod wallet;

pub use amount::{Amount, AmountError, Balance};
pub use booking::{Booking, BookingStatus, Cancellation, ProviderNote, RatingChange, Review, Settlement};
pub use context::{Identity, OperationContext, Role};
pub use error::DomainError;
pub use provider::{BlacklistEntry, Provider, VerificationStatus};
pub use verification::{
    ReviewAction, ReviewNote, StageId, StageStatus, VerificationOutcome, VerificationRecord,
};
pub use wallet::{TransactionMeta, TransactionType, Wallet, WalletTransaction};
