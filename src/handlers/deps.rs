//! Shared handler dependencies

use std::sync::Arc;

use uuid::Uuid;

use crate::audit::AuditLog;
use crate::clock::Clock;
use crate::config::EngineSettings;
use crate::domain::{Identity, OperationContext, Role};
use crate::error::AppError;
use crate::jobs::AvailabilitySync;
use crate::store::{KvStore, Repository, RetryPolicy};

/// Everything a handler needs besides its own collaborators
#[derive(Clone)]
pub struct HandlerDeps {
    pub repo: Repository,
    pub clock: Arc<dyn Clock>,
    pub audit: AuditLog,
    pub availability: AvailabilitySync,
    pub settings: EngineSettings,
}

impl HandlerDeps {
    pub fn new(store: Arc<dyn KvStore>, clock: Arc<dyn Clock>, settings: EngineSettings) -> Self {
        let repo = Repository::new(store, RetryPolicy::new(settings.max_retries));
        Self {
            audit: AuditLog::new(repo.clone(), clock.clone()),
            availability: AvailabilitySync::new(repo.clone(), clock.clone()),
            repo,
            clock,
            settings,
        }
    }
}

/// The caller must be `user_id` acting in `role`
pub(crate) fn acting_as(
    context: &OperationContext,
    role: Role,
    user_id: Uuid,
) -> Result<&Identity, AppError> {
    let caller = context.require_role(role)?;
    if caller.user_id != user_id {
        return Err(AppError::Forbidden(format!(
            "caller {} cannot act for {} {}",
            caller.user_id, role, user_id
        )));
    }
    Ok(caller)
}

/// The caller is `user_id` (any role) or an admin
pub(crate) fn self_or_admin(context: &OperationContext, user_id: Uuid) -> Result<&Identity, AppError> {
    let caller = context.caller()?;
    if caller.user_id != user_id && !caller.is_admin() {
        return Err(AppError::Forbidden(format!(
            "caller {} cannot access records of {}",
            caller.user_id, user_id
        )));
    }
    Ok(caller)
}
