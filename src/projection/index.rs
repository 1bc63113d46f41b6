//! Secondary index keys
//!
//! Index entries live in the same store as the records and are rewritten in
//! the same commit as the record they describe. Each entry holds only the
//! record id; the record stays the source of truth.

use std::collections::BTreeSet;

use uuid::Uuid;

use crate::domain::{Booking, Provider, VerificationRecord, Wallet};
use crate::store::Record;

pub const OPEN_REQUESTS: &str = "idx:booking:open:";
pub const REVIEW_QUEUE: &str = "idx:verification:review:";

pub fn open_request_key(booking_id: Uuid) -> String {
    format!("{}{}", OPEN_REQUESTS, booking_id)
}

pub fn provider_bookings_prefix(provider_id: Uuid) -> String {
    format!("idx:booking:provider:{}:", provider_id)
}

pub fn client_bookings_prefix(client_id: Uuid) -> String {
    format!("idx:booking:client:{}:", client_id)
}

pub fn review_queue_key(provider_id: Uuid) -> String {
    format!("{}{}", REVIEW_QUEUE, provider_id)
}

impl Record for Provider {
    const KIND: &'static str = "provider";

    fn record_id(&self) -> Uuid {
        self.id
    }
}

impl Record for VerificationRecord {
    const KIND: &'static str = "verification";

    fn record_id(&self) -> Uuid {
        self.provider_id
    }

    fn index_keys(&self) -> BTreeSet<String> {
        let mut keys = BTreeSet::new();
        if self.awaiting_review() {
            keys.insert(review_queue_key(self.provider_id));
        }
        keys
    }
}

impl Record for Booking {
    const KIND: &'static str = "booking";

    fn record_id(&self) -> Uuid {
        self.id
    }

    fn index_keys(&self) -> BTreeSet<String> {
        let mut keys = BTreeSet::new();
        keys.insert(format!("{}{}", client_bookings_prefix(self.client_id), self.id));
        if self.is_open() {
            keys.insert(open_request_key(self.id));
        }
        // A released provider keeps seeing the cancelled booking
        let provider = self.provider_id.or_else(|| {
            self.cancellation
                .as_ref()
                .and_then(|c| c.released_provider)
        });
        if let Some(provider_id) = provider {
            keys.insert(format!("{}{}", provider_bookings_prefix(provider_id), self.id));
        }
        keys
    }
}

impl Record for Wallet {
    const KIND: &'static str = "wallet";

    fn record_id(&self) -> Uuid {
        self.account_id
    }
}
