//! External collaborators
//!
//! Identity and payment verification are owned by other platforms; the
//! engine only consumes them through these traits.

mod identity;
mod payment;

pub use identity::{IdentityVerifier, JwtIdentityVerifier, StaticIdentityVerifier, TokenClaims};
pub use payment::{HmacPaymentVerifier, PaymentVerifier};
