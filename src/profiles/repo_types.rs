use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "profile_role", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Admin,
    SuperAdmin,
}

impl Role {
    pub fn is_admin(self) -> bool {
        matches!(self, Role::Admin | Role::SuperAdmin)
    }
}

/// This service's extension record for an identity.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Profile {
    pub id: Uuid,
    pub user_id: Uuid,                 // identity ID at the provider
    pub display_name: String,
    pub full_name: Option<String>,
    pub role: Role,
    pub failed_attempts: i32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub lock_until: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub password_changed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Profile {
    /// Lock deadline if it is still ahead of `now`.
    pub fn active_lock(&self, now: OffsetDateTime) -> Option<OffsetDateTime> {
        self.lock_until.filter(|until| *until > now)
    }

    /// When the current password was set; accounts that never rotated fall
    /// back to their creation time.
    pub fn password_set_at(&self) -> OffsetDateTime {
        self.password_changed_at.unwrap_or(self.created_at)
    }
}

#[derive(Debug, Clone)]
pub struct NewProfile {
    pub user_id: Uuid,
    pub display_name: String,
    pub full_name: Option<String>,
    pub role: Role,
}

/// Fields a user may change on their own profile. Anything else in the
/// request body is ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileUpdate {
    pub display_name: Option<String>,
    pub full_name: Option<String>,
}

impl ProfileUpdate {
    pub fn is_empty(&self) -> bool {
        self.display_name.is_none() && self.full_name.is_none()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileFilter {
    #[serde(default)]
    pub search: Option<String>,
}
