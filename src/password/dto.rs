use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Default, Deserialize)]
pub struct ChangePasswordRequest {
    #[serde(default, alias = "oldPassword")]
    pub old_password: Option<String>,
    #[serde(default, alias = "newPassword")]
    pub new_password: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ForgotPasswordRequest {
    #[serde(default, alias = "email")]
    pub user_email: Option<String>,
}

/// Completes the emailed recovery link: the link's access token proves
/// ownership of the account.
#[derive(Debug, Default, Deserialize)]
pub struct ResetWithTokenRequest {
    #[serde(default, alias = "token")]
    pub access_token: Option<String>,
    #[serde(default)]
    pub new_password: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AdminResetRequest {
    #[serde(default)]
    pub user_id: Option<Uuid>,
    #[serde(default)]
    pub new_password: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PasswordChanged {
    #[serde(with = "time::serde::rfc3339")]
    pub password_changed_at: OffsetDateTime,
}

#[derive(Debug, Default, Serialize)]
pub struct ResetDispatched {
    /// Only outside production, when the email could not be sent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dev_action_link: Option<String>,
}
