//! The hosted identity provider: password hashes, session tokens and email
//! verification live there. This service only consults it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

mod claims;
pub mod gotrue;
pub mod jwt;

pub use gotrue::GoTrueProvider;

/// Identity as reported by the provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
    pub id: Uuid,
    pub email: String,
    pub email_confirmed: bool,
}

/// Tokens handed back to the client after sign-in, sign-up or refresh.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionTokens {
    pub access_token: String,
    pub refresh_token: String,
    /// Unix timestamp (seconds).
    pub expires_at: i64,
    pub token_type: String,
}

#[derive(Debug, Clone)]
pub struct SignIn {
    pub identity: Identity,
    pub session: SessionTokens,
}

/// A new account; `session` is absent when the provider requires the email to
/// be confirmed first.
#[derive(Debug, Clone)]
pub struct SignUp {
    pub identity: Identity,
    pub session: Option<SessionTokens>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SignUpMetadata {
    pub display_name: String,
    pub full_name: String,
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("invalid login credentials")]
    InvalidCredentials,
    #[error("email not confirmed")]
    EmailNotConfirmed,
    #[error("token expired")]
    TokenExpired,
    #[error("malformed token")]
    InvalidToken,
    #[error("rejected by identity provider: {0}")]
    Rejected(String),
    #[error("identity provider rate limited the request: {0}")]
    RateLimited(String),
    #[error("identity provider unavailable: {0}")]
    Unavailable(#[from] anyhow::Error),
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn sign_in_with_password(&self, email: &str, password: &str)
        -> Result<SignIn, IdentityError>;

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: &SignUpMetadata,
    ) -> Result<SignUp, IdentityError>;

    /// Resolve an access token back to the identity that owns it.
    async fn get_user(&self, access_token: &str) -> Result<Identity, IdentityError>;

    async fn refresh_session(&self, refresh_token: &str) -> Result<SessionTokens, IdentityError>;

    async fn sign_out(&self, access_token: &str) -> Result<(), IdentityError>;

    /// Administrative lookup; never exposed to callers directly.
    async fn find_user_by_email(&self, email: &str) -> Result<Option<Identity>, IdentityError>;

    async fn update_password(&self, user_id: Uuid, new_password: &str) -> Result<(), IdentityError>;

    async fn send_password_reset(&self, email: &str, redirect_to: &str)
        -> Result<(), IdentityError>;

    async fn generate_recovery_link(
        &self,
        email: &str,
        redirect_to: &str,
    ) -> Result<String, IdentityError>;
}
