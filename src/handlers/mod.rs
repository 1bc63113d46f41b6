//! Command Handlers module
//!
//! Handlers that orchestrate marketplace operations. Each handler checks the
//! caller, loads the records it needs and commits its changes atomically,
//! retrying when it loses an optimistic-lock race.

mod booking_handler;
mod commands;
mod deps;
mod ledger_handler;
mod matching_handler;
mod provider_handler;
mod rating_handler;
mod verification_handler;


pub use booking_handler::BookingHandler;
pub use commands::*;
pub use deps::HandlerDeps;
pub use ledger_handler::LedgerHandler;
pub use matching_handler::MatchingHandler;
pub use provider_handler::ProviderHandler;
pub use rating_handler::RatingHandler;
pub use verification_handler::VerificationHandler;
