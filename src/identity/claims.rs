use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Payload of a provider-issued access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,             // identity ID
    pub exp: usize,            // expires at (unix timestamp)
    #[serde(default)]
    pub iat: usize,            // issued at (unix timestamp)
    pub aud: String,           // "authenticated" for signed-in users
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub role: Option<String>,  // provider role, not the profile role
    #[serde(default)]
    pub session_id: Option<Uuid>,
}
