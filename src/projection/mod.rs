//! Projection module
//!
//! Secondary indexes over stored records and the queries they serve.
//! Index entries are derived from records and written atomically with them.

pub mod index;
mod queries;

pub use queries::MarketplaceIndex;
