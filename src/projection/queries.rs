//! Indexed queries
//!
//! Read-side lookups served from the secondary indexes instead of scanning
//! every record. Results are always re-checked against the loaded record,
//! so an index entry that lags behind a write can only cost a lookup.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::{Booking, VerificationRecord};
use crate::error::AppError;
use crate::store::{Repository, Versioned};

use super::index::{client_bookings_prefix, provider_bookings_prefix, OPEN_REQUESTS, REVIEW_QUEUE};

#[async_trait]
pub trait MarketplaceIndex: Send + Sync {
    /// Pending bookings without a provider
    async fn open_requests(&self) -> Result<Vec<Versioned<Booking>>, AppError>;

    /// Bookings assigned to (or released by) a provider
    async fn provider_bookings(&self, provider_id: Uuid) -> Result<Vec<Versioned<Booking>>, AppError>;

    async fn client_bookings(&self, client_id: Uuid) -> Result<Vec<Versioned<Booking>>, AppError>;

    /// Verification records with at least one submitted stage
    async fn review_queue(&self) -> Result<Vec<Versioned<VerificationRecord>>, AppError>;
}

#[async_trait]
impl MarketplaceIndex for Repository {
    async fn open_requests(&self) -> Result<Vec<Versioned<Booking>>, AppError> {
        let mut found = self.find_indexed::<Booking>(OPEN_REQUESTS).await?;
        found.retain(|b| b.record.is_open());
        Ok(found)
    }

    async fn provider_bookings(&self, provider_id: Uuid) -> Result<Vec<Versioned<Booking>>, AppError> {
        let mut found = self
            .find_indexed::<Booking>(&provider_bookings_prefix(provider_id))
            .await?;
        found.retain(|b| {
            b.record.provider_id == Some(provider_id)
                || b.record
                    .cancellation
                    .as_ref()
                    .is_some_and(|c| c.released_provider == Some(provider_id))
        });
        Ok(found)
    }

    async fn client_bookings(&self, client_id: Uuid) -> Result<Vec<Versioned<Booking>>, AppError> {
        let mut found = self
            .find_indexed::<Booking>(&client_bookings_prefix(client_id))
            .await?;
        found.retain(|b| b.record.client_id == client_id);
        Ok(found)
    }

    async fn review_queue(&self) -> Result<Vec<Versioned<VerificationRecord>>, AppError> {
        let mut found = self.find_indexed::<VerificationRecord>(REVIEW_QUEUE).await?;
        found.retain(|r| r.record.awaiting_review());
        Ok(found)
    }
}
