//! Append-only audit trail of security-relevant actions.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::FromRow;
use time::OffsetDateTime;
use tracing::{debug, error};
use uuid::Uuid;

use crate::{
    client::ClientInfo,
    pagination::{Page, PageQuery},
};

mod repo;

pub use repo::PgAuditStore;

pub const RESOURCE_API: &str = "API";
pub const RESOURCE_AUTH: &str = "AUTH";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    AuthAttempt,
    AuthSuccess,
    AuthBlocked,
    LoginAttempt,
    RegisterSuccess,
    RegisterFailed,
    ProfileCreationFailed,
    ProfileUpdated,
    Signout,
    TokenRefreshed,
    TokenRefreshFailed,
    PermissionDenied,
    PasswordExpired,
    PasswordChangedByUser,
    PasswordChangeFailed,
    PasswordResetRequested,
    PasswordResetLinkSent,
    PasswordResetRateLimited,
    PasswordResetFailed,
    PasswordResetTokenInvalid,
    PasswordResetTokenVerified,
    PasswordResetSucceeded,
    PasswordResetByAdmin,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditAction::AuthAttempt => "AUTH_ATTEMPT",
            AuditAction::AuthSuccess => "AUTH_SUCCESS",
            AuditAction::AuthBlocked => "AUTH_BLOCKED",
            AuditAction::LoginAttempt => "LOGIN_ATTEMPT",
            AuditAction::RegisterSuccess => "REGISTER_SUCCESS",
            AuditAction::RegisterFailed => "REGISTER_FAILED",
            AuditAction::ProfileCreationFailed => "PROFILE_CREATION_FAILED",
            AuditAction::ProfileUpdated => "PROFILE_UPDATED",
            AuditAction::Signout => "SIGNOUT",
            AuditAction::TokenRefreshed => "TOKEN_REFRESHED",
            AuditAction::TokenRefreshFailed => "TOKEN_REFRESH_FAILED",
            AuditAction::PermissionDenied => "PERMISSION_DENIED",
            AuditAction::PasswordExpired => "PASSWORD_EXPIRED",
            AuditAction::PasswordChangedByUser => "PASSWORD_CHANGED_BY_USER",
            AuditAction::PasswordChangeFailed => "PASSWORD_CHANGE_FAILED",
            AuditAction::PasswordResetRequested => "PASSWORD_RESET_REQUESTED",
            AuditAction::PasswordResetLinkSent => "PASSWORD_RESET_LINK_SENT",
            AuditAction::PasswordResetRateLimited => "PASSWORD_RESET_RATE_LIMITED",
            AuditAction::PasswordResetFailed => "PASSWORD_RESET_FAILED",
            AuditAction::PasswordResetTokenInvalid => "PASSWORD_RESET_TOKEN_INVALID",
            AuditAction::PasswordResetTokenVerified => "PASSWORD_RESET_TOKEN_VERIFIED",
            AuditAction::PasswordResetSucceeded => "PASSWORD_RESET_SUCCEEDED",
            AuditAction::PasswordResetByAdmin => "PASSWORD_RESET_BY_ADMIN",
        }
    }
}

/// A row about to be written.
#[derive(Debug, Clone)]
pub struct NewAuditLog {
    pub user_id: Option<Uuid>,
    pub action: AuditAction,
    pub resource: &'static str,
    pub success: bool,
    pub details: Value,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

impl NewAuditLog {
    pub fn new(action: AuditAction, success: bool) -> Self {
        Self {
            user_id: None,
            action,
            resource: RESOURCE_AUTH,
            success,
            details: json!({}),
            ip: None,
            user_agent: None,
        }
    }

    pub fn user(mut self, user_id: impl Into<Option<Uuid>>) -> Self {
        self.user_id = user_id.into();
        self
    }

    pub fn resource(mut self, resource: &'static str) -> Self {
        self.resource = resource;
        self
    }

    pub fn details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn client(mut self, client: &ClientInfo) -> Self {
        self.ip = client.ip.clone();
        self.user_agent = client.user_agent.clone();
        self
    }
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct AuditLog {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub action: String,
    pub resource: String,
    pub success: bool,
    pub details: Value,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditFilter {
    #[serde(default)]
    pub user_id: Option<Uuid>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub resource: Option<String>,
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn insert(&self, entry: NewAuditLog) -> anyhow::Result<()>;

    /// Rows for `ip` + `action` with `created_at >= since`.
    async fn count_since(&self, ip: &str, action: AuditAction, since: OffsetDateTime)
        -> anyhow::Result<i64>;

    async fn list(&self, filter: &AuditFilter, page: PageQuery) -> anyhow::Result<Page<AuditLog>>;
}

/// Writes audit rows on behalf of the request handlers. A failed write is
/// logged and dropped; it never fails the request that produced it.
#[derive(Clone)]
pub struct AuditLogger {
    store: Arc<dyn AuditStore>,
}

impl AuditLogger {
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn AuditStore> {
        &self.store
    }

    pub async fn record(&self, entry: NewAuditLog) {
        let action = entry.action.as_str();
        let user_id = entry.user_id;
        match self.store.insert(entry).await {
            Ok(()) => debug!(action, ?user_id, "audit log written"),
            Err(e) => error!(error = ?e, action, ?user_id, "audit log write failed"),
        }
    }
}
