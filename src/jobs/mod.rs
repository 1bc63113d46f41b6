//! Scheduled Jobs
//!
//! Background reconciliation. Nothing here is needed for correctness of the
//! engine's operations; the jobs retry best-effort secondary writes and
//! watch the audit chain.

mod availability;

pub use availability::{AvailabilityChange, AvailabilitySync, DrainReport, SyncOutcome};

use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::time::interval;

use crate::audit::AuditLog;

/// Configuration for job scheduler
#[derive(Debug, Clone)]
pub struct JobSchedulerConfig {
    /// Interval for draining the availability outbox (default: 30 seconds)
    pub availability_sync_interval: Duration,
    /// Interval for audit chain verification (default: 1 hour)
    pub audit_check_interval: Duration,
}

impl Default for JobSchedulerConfig {
    fn default() -> Self {
        Self {
            availability_sync_interval: Duration::from_secs(30),
            audit_check_interval: Duration::from_secs(3600),
        }
    }
}

/// Job Scheduler - runs periodic maintenance tasks
pub struct JobScheduler {
    availability: AvailabilitySync,
    audit: AuditLog,
    config: JobSchedulerConfig,
}

impl JobScheduler {
    pub fn new(availability: AvailabilitySync, audit: AuditLog) -> Self {
        Self {
            availability,
            audit,
            config: JobSchedulerConfig::default(),
        }
    }

    /// Create with custom configuration
    pub fn with_config(availability: AvailabilitySync, audit: AuditLog, config: JobSchedulerConfig) -> Self {
        Self {
            availability,
            audit,
            config,
        }
    }

    /// Start the job scheduler in the background
    /// Returns a handle that can be used to abort the scheduler
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&self) {
        tracing::info!("Job scheduler started");

        let mut availability_interval = interval(self.config.availability_sync_interval);
        let mut audit_interval = interval(self.config.audit_check_interval);

        loop {
            tokio::select! {
                _ = availability_interval.tick() => {
                    if let Err(e) = self.availability.drain().await {
                        tracing::error!(error = %e, "Availability outbox drain failed");
                    }
                }
                _ = audit_interval.tick() => {
                    self.check_audit_chain().await;
                }
            }
        }
    }

    async fn check_audit_chain(&self) {
        match self.audit.verify_hash_chain().await {
            Ok(result) if result.is_valid => {
                tracing::debug!(entries = result.entries_checked, "Audit chain verified");
            }
            Ok(result) => {
                tracing::error!(
                    first_invalid_entry = ?result.first_invalid_entry,
                    expected = ?result.expected_hash,
                    actual = ?result.actual_hash,
                    "Audit chain verification FAILED"
                );
            }
            Err(e) => tracing::error!(error = %e, "Audit chain verification errored"),
        }
    }

    /// Run all maintenance jobs once (for manual trigger or testing)
    pub async fn run_all_once(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();

        match self.availability.drain().await {
            Ok(drained) => report.availability = drained,
            Err(e) => report.errors.push(format!("Availability drain: {}", e)),
        }

        match self.audit.verify_hash_chain().await {
            Ok(result) => report.audit_chain_valid = Some(result.is_valid),
            Err(e) => report.errors.push(format!("Audit verification: {}", e)),
        }

        report.completed_at = Utc::now();
        report
    }
}

/// Report from running maintenance jobs
#[derive(Debug, Clone, Default)]
pub struct MaintenanceReport {
    pub availability: DrainReport,
    pub audit_chain_valid: Option<bool>,
    pub errors: Vec<String>,
    pub completed_at: DateTime<Utc>,
}

// =========================================================================
// Tests
// =========================================================================
