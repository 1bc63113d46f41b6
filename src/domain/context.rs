//! Operation Context
//!
//! Contains the verified caller and request metadata for audit and tracing.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

/// Marketplace role carried by a verified identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Client,
    Provider,
    Admin,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Client => write!(f, "client"),
            Role::Provider => write!(f, "provider"),
            Role::Admin => write!(f, "admin"),
        }
    }
}

/// Caller identity as returned by the identity platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: Uuid,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl Identity {
    pub fn new(user_id: Uuid, role: Role) -> Self {
        Self {
            user_id,
            role,
            display_name: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// Context for an operation, used for auditing and tracing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperationContext {
    /// Verified caller
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caller: Option<Identity>,

    /// Correlation ID for request tracing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
}

impl OperationContext {
    /// Create a new empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Context acting on behalf of a verified caller
    pub fn for_caller(identity: Identity) -> Self {
        Self {
            caller: Some(identity),
            correlation_id: None,
        }
    }

    /// Create context with correlation ID
    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Generate a new correlation ID if not present
    pub fn ensure_correlation_id(&mut self) -> Uuid {
        *self.correlation_id.get_or_insert_with(Uuid::new_v4)
    }

    /// The verified caller, or `Unauthorized`
    pub fn caller(&self) -> Result<&Identity, AppError> {
        self.caller
            .as_ref()
            .ok_or_else(|| AppError::Unauthorized("missing caller identity".to_string()))
    }

    /// Require the caller to hold `role`
    pub fn require_role(&self, role: Role) -> Result<&Identity, AppError> {
        let caller = self.caller()?;
        if caller.role != role {
            return Err(AppError::Forbidden(format!(
                "{} role required, caller is {}",
                role, caller.role
            )));
        }
        Ok(caller)
    }

    pub fn require_admin(&self) -> Result<&Identity, AppError> {
        self.require_role(Role::Admin)
    }

    /// Acting user id, used as `reviewer_id`/`actor` in audit entries
    pub fn actor_id(&self) -> Option<Uuid> {
        self.caller.as_ref().map(|c| c.user_id)
    }
}
