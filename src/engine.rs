//! Marketplace engine
//!
//! Wires the handlers to one store, clock and set of external
//! collaborators. The HTTP layer and the binaries hold an `Arc<Engine>`.

use std::sync::Arc;

use crate::audit::AuditLog;
use crate::clock::{Clock, SystemClock};
use crate::config::EngineSettings;
use crate::external::{IdentityVerifier, PaymentVerifier};
use crate::handlers::{
    BookingHandler, HandlerDeps, LedgerHandler, MatchingHandler, ProviderHandler, RatingHandler,
    VerificationHandler,
};
use crate::jobs::{AvailabilitySync, JobScheduler, JobSchedulerConfig};
use crate::store::{KvStore, MemoryStore, Repository};

pub struct Engine {
    deps: HandlerDeps,
    identity: Arc<dyn IdentityVerifier>,
    pub providers: ProviderHandler,
    pub verification: VerificationHandler,
    pub matching: MatchingHandler,
    pub bookings: BookingHandler,
    pub ratings: RatingHandler,
    pub ledger: LedgerHandler,
}

impl Engine {
    pub fn new(
        store: Arc<dyn KvStore>,
        identity: Arc<dyn IdentityVerifier>,
        payments: Arc<dyn PaymentVerifier>,
        clock: Arc<dyn Clock>,
        settings: EngineSettings,
    ) -> Self {
        let deps = HandlerDeps::new(store, clock, settings);
        Self {
            providers: ProviderHandler::new(deps.clone()),
            verification: VerificationHandler::new(deps.clone()),
            matching: MatchingHandler::new(deps.clone()),
            bookings: BookingHandler::new(deps.clone()),
            ratings: RatingHandler::new(deps.clone()),
            ledger: LedgerHandler::new(deps.clone(), payments),
            identity,
            deps,
        }
    }

    /// Engine over a fresh in-memory store with the system clock
    pub fn in_memory(
        identity: Arc<dyn IdentityVerifier>,
        payments: Arc<dyn PaymentVerifier>,
        settings: EngineSettings,
    ) -> Self {
        Self::new(
            Arc::new(MemoryStore::new()),
            identity,
            payments,
            Arc::new(SystemClock),
            settings,
        )
    }

    pub fn identity(&self) -> &Arc<dyn IdentityVerifier> {
        &self.identity
    }

    pub fn repository(&self) -> &Repository {
        &self.deps.repo
    }

    pub fn audit(&self) -> &AuditLog {
        &self.deps.audit
    }

    pub fn availability(&self) -> &AvailabilitySync {
        &self.deps.availability
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.deps.settings
    }

    /// Background reconciliation over this engine's store
    pub fn scheduler(&self) -> JobScheduler {
        JobScheduler::with_config(
            self.deps.availability.clone(),
            self.deps.audit.clone(),
            JobSchedulerConfig {
                availability_sync_interval: self.deps.settings.availability_sync_interval,
                ..Default::default()
            },
        )
    }
}
