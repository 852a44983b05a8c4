use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        FromRequest, FromRequestParts, Query,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::{json, Map, Value};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::error;

/// Every failure a handler can answer with. The variant decides the HTTP
/// status and the machine-readable `code`.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("{message}")]
    Validation { code: &'static str, message: String },

    #[error("No token provided")]
    MissingToken,
    #[error("Token has expired")]
    TokenExpired,
    #[error("Invalid token")]
    InvalidToken,
    #[error("{0}")]
    Unauthorized(&'static str, String),
    #[error("Invalid login credentials")]
    LoginFailed,

    #[error("Authentication failed")]
    AuthFailed,
    #[error("Email address has not been confirmed")]
    EmailNotConfirmed,
    #[error("Account locked")]
    AccountLocked { lock_until: OffsetDateTime },
    #[error("Password expired. Please change your password.")]
    PasswordExpired { days_since_change: i64 },
    #[error("Insufficient permissions")]
    InsufficientPermissions,
    #[error("Profile not found")]
    ProfileNotFound,

    #[error("{0}")]
    NotFound(String),

    #[error("Too many login attempts. Try again later.")]
    RateLimited,
    #[error("Too many failed attempts. Try again after {retry_after_minutes} minutes.")]
    EmailBlocked { retry_after_minutes: i64 },

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn validation(code: &'static str, message: impl Into<String>) -> Self {
        AppError::Validation {
            code,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Validation { .. } => StatusCode::BAD_REQUEST,
            AppError::MissingToken
            | AppError::TokenExpired
            | AppError::InvalidToken
            | AppError::Unauthorized(..)
            | AppError::LoginFailed => StatusCode::UNAUTHORIZED,
            AppError::AuthFailed
            | AppError::EmailNotConfirmed
            | AppError::AccountLocked { .. }
            | AppError::PasswordExpired { .. }
            | AppError::InsufficientPermissions
            | AppError::ProfileNotFound => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::RateLimited | AppError::EmailBlocked { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AppError::Validation { code, .. } => code,
            AppError::MissingToken => "MISSING_TOKEN",
            AppError::TokenExpired => "TOKEN_EXPIRED",
            AppError::InvalidToken => "INVALID_TOKEN",
            AppError::Unauthorized(code, _) => code,
            AppError::LoginFailed => "LOGIN_FAILED",
            AppError::AuthFailed => "AUTH_FAILED",
            AppError::EmailNotConfirmed => "EMAIL_NOT_CONFIRMED",
            AppError::AccountLocked { .. } => "ACCOUNT_LOCKED",
            AppError::PasswordExpired { .. } => "PASSWORD_EXPIRED",
            AppError::InsufficientPermissions => "INSUFFICIENT_PERMISSIONS",
            AppError::ProfileNotFound => "PROFILE_NOT_FOUND",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::RateLimited => "RATE_LIMITED",
            AppError::EmailBlocked { .. } => "EMAIL_BLOCKED",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    fn body(&self) -> Value {
        let message = match self {
            // never leak infrastructure detail to the caller
            AppError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        };

        let mut body = Map::new();
        body.insert("success".into(), Value::Bool(false));
        body.insert("message".into(), Value::String(message));
        body.insert("code".into(), Value::String(self.code().into()));

        match self {
            AppError::AccountLocked { lock_until } => {
                body.insert("lock_until".into(), json!(rfc3339(*lock_until)));
            }
            AppError::EmailBlocked {
                retry_after_minutes,
            } => {
                body.insert("retry_after_minutes".into(), json!(retry_after_minutes));
            }
            AppError::PasswordExpired { days_since_change } => {
                body.insert("days_since_change".into(), json!(days_since_change));
            }
            _ => {}
        }
        Value::Object(body)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if let AppError::Internal(e) = &self {
            error!(error = ?e, "internal error");
        }
        (status, Json(self.body())).into_response()
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::validation("INVALID_BODY", rejection.body_text())
    }
}

impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        AppError::validation("INVALID_QUERY", rejection.body_text())
    }
}

/// `Json` that answers malformed bodies with the uniform error shape.
#[derive(Debug, FromRequest)]
#[from_request(via(Json), rejection(AppError))]
pub struct ApiJson<T>(pub T);

#[derive(Debug, FromRequestParts)]
#[from_request(via(Query), rejection(AppError))]
pub struct ApiQuery<T>(pub T);

/// Success envelope shared by every endpoint.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<&'static str>,
    pub data: T,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            message: None,
            data,
        })
    }

    pub fn with_message(message: &'static str, data: T) -> Json<Self> {
        Json(Self {
            success: true,
            message: Some(message),
            data,
        })
    }
}

pub(crate) fn rfc3339(at: OffsetDateTime) -> String {
    at.format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| at.to_string())
}
