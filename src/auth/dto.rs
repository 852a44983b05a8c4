use serde::{Deserialize, Serialize};

use crate::{
    identity::{Identity, SessionTokens},
    profiles::Profile,
};

/// Request body for login. Fields are optional so that absent credentials
/// are answered with a domain error rather than a parse error.
#[derive(Debug, Default, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// Request body for user registration. A `role` field, if sent, is ignored.
#[derive(Debug, Default, Deserialize)]
pub struct RegisterRequest {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub full_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RefreshRequest {
    #[serde(default)]
    pub refresh_token: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LoginData {
    pub user: Identity,
    pub profile: Profile,
    pub session: SessionTokens,
    pub password_expired: bool,
}

#[derive(Debug, Serialize)]
pub struct RegisterData {
    pub user: Identity,
    pub session: Option<SessionTokens>,
    pub profile: Option<Profile>,
    pub profile_created: bool,
}

#[derive(Debug, Serialize)]
pub struct SessionData {
    pub user: Identity,
    pub profile: Profile,
}

#[derive(Debug, Serialize)]
pub struct SignoutData {
    pub revoked: bool,
}
