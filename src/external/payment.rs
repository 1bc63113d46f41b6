//! Payment verification
//!
//! The gateway signs `"{order_id}|{payment_id}"` with HMAC-SHA256 and sends
//! the hex digest along with the payment callback.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::AppError;

type HmacSha256 = Hmac<Sha256>;

#[async_trait]
pub trait PaymentVerifier: Send + Sync {
    /// `Ok(false)` for a bad signature, `Err` when verification itself failed
    async fn verify_signature(
        &self,
        order_id: &str,
        payment_id: &str,
        signature: &str,
    ) -> Result<bool, AppError>;
}

pub struct HmacPaymentVerifier {
    secret: Vec<u8>,
}

impl HmacPaymentVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
        }
    }

    fn mac(&self, order_id: &str, payment_id: &str) -> Result<HmacSha256, AppError> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| AppError::Internal(format!("payment key rejected: {}", e)))?;
        mac.update(order_id.as_bytes());
        mac.update(b"|");
        mac.update(payment_id.as_bytes());
        Ok(mac)
    }

    /// Hex signature the gateway would send for this order/payment pair
    pub fn sign(&self, order_id: &str, payment_id: &str) -> Result<String, AppError> {
        Ok(hex::encode(self.mac(order_id, payment_id)?.finalize().into_bytes()))
    }
}

#[async_trait]
impl PaymentVerifier for HmacPaymentVerifier {
    async fn verify_signature(
        &self,
        order_id: &str,
        payment_id: &str,
        signature: &str,
    ) -> Result<bool, AppError> {
        let Ok(provided) = hex::decode(signature.trim()) else {
            return Ok(false);
        };
        // verify_slice compares in constant time
        Ok(self
            .mac(order_id, payment_id)?
            .verify_slice(&provided)
            .is_ok())
    }
}
