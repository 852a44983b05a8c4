//! Login-attempt tracker: one append-only row per authentication attempt.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::pagination::{Page, PageQuery};

pub mod limiter;
mod repo;

pub use repo::PgLoginAttemptStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptReason {
    Success,
    NotFound,
    WrongPassword,
    Locked,
    /// Reserved for a second-factor step; nothing emits it yet.
    MfaRequired,
    MissingCredentials,
}

impl AttemptReason {
    pub fn as_str(self) -> &'static str {
        match self {
            AttemptReason::Success => "SUCCESS",
            AttemptReason::NotFound => "NOT_FOUND",
            AttemptReason::WrongPassword => "WRONG_PASSWORD",
            AttemptReason::Locked => "LOCKED",
            AttemptReason::MfaRequired => "MFA_REQUIRED",
            AttemptReason::MissingCredentials => "MISSING_CREDENTIALS",
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewLoginAttempt {
    pub user_id: Option<Uuid>,
    pub email_tried: String,
    pub success: bool,
    pub reason: AttemptReason,
    pub ip: Option<String>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct LoginAttempt {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub email_tried: String,
    pub success: bool,
    pub reason: String,
    pub ip: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Failed attempts inside a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AttemptStats {
    pub count: i64,
    pub oldest: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AttemptFilter {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub user_id: Option<Uuid>,
}

#[async_trait]
pub trait LoginAttemptStore: Send + Sync {
    async fn insert(&self, attempt: NewLoginAttempt) -> anyhow::Result<()>;

    /// Failed attempts for `email` with `created_at >= since`.
    async fn failed_since(&self, email: &str, since: OffsetDateTime) -> anyhow::Result<AttemptStats>;

    async fn list(&self, filter: &AttemptFilter, page: PageQuery) -> anyhow::Result<Page<LoginAttempt>>;
}
