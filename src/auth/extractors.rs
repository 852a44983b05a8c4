use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header, request::Parts, HeaderMap},
};
use serde_json::{json, Value};
use std::convert::Infallible;
use time::OffsetDateTime;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    audit::{AuditAction, NewAuditLog, RESOURCE_API},
    client::ClientInfo,
    error::{rfc3339, AppError},
    identity::{Identity, IdentityError},
    password::policy,
    profiles::Profile,
    state::AppState,
};

/// Authenticated request context.
#[derive(Debug, Clone)]
pub struct Session {
    pub identity: Identity,
    pub profile: Profile,
    pub token: String,
    pub client: ClientInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordExpiry {
    Enforce,
    Allow,
}

/// `Authorization: Bearer <token>`; the scheme is matched case-insensitively.
pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

struct Rejected {
    error: AppError,
    action: AuditAction,
    user_id: Option<Uuid>,
    details: Value,
}

impl Rejected {
    fn attempt(error: AppError, reason: &str) -> Self {
        Self {
            error,
            action: AuditAction::AuthAttempt,
            user_id: None,
            details: json!({ "reason": reason }),
        }
    }

    fn user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }
}

/// Resolve the bearer token to a session. Writes exactly one audit row per
/// call, whatever the outcome.
pub async fn authenticate(
    parts: &Parts,
    state: &AppState,
    expiry: PasswordExpiry,
) -> Result<Session, AppError> {
    let client = ClientInfo::from_parts(parts, state.config.security.trust_proxy_headers);

    match resolve(parts, state, expiry, &client).await {
        Ok(session) => {
            state
                .audit
                .record(
                    NewAuditLog::new(AuditAction::AuthSuccess, true)
                        .user(session.identity.id)
                        .resource(RESOURCE_API)
                        .details(json!({ "path": parts.uri.path() }))
                        .client(&client),
                )
                .await;
            Ok(session)
        }
        Err(rejected) => {
            let mut details = rejected.details;
            if let Value::Object(map) = &mut details {
                map.insert("path".into(), json!(parts.uri.path()));
            }
            state
                .audit
                .record(
                    NewAuditLog::new(rejected.action, false)
                        .user(rejected.user_id)
                        .resource(RESOURCE_API)
                        .details(details)
                        .client(&client),
                )
                .await;
            Err(rejected.error)
        }
    }
}

async fn resolve(
    parts: &Parts,
    state: &AppState,
    expiry: PasswordExpiry,
    client: &ClientInfo,
) -> Result<Session, Rejected> {
    let Some(token) = bearer_token(&parts.headers) else {
        debug!("request without bearer token");
        return Err(Rejected::attempt(AppError::MissingToken, "missing_token"));
    };

    let identity = match state.identity.get_user(token).await {
        Ok(identity) => identity,
        Err(IdentityError::TokenExpired) => {
            return Err(Rejected::attempt(AppError::TokenExpired, "token_expired"));
        }
        Err(IdentityError::InvalidToken) => {
            return Err(Rejected::attempt(AppError::InvalidToken, "invalid_token"));
        }
        Err(e) => {
            warn!(error = %e, "token rejected");
            let mut rejected = Rejected::attempt(AppError::AuthFailed, "auth_failed");
            rejected.details = json!({ "reason": "auth_failed", "error": e.to_string() });
            return Err(rejected);
        }
    };

    let profile = match state.profiles.find_by_user_id(identity.id).await {
        Ok(Some(profile)) => profile,
        Ok(None) => {
            warn!(user_id = %identity.id, "authenticated identity has no profile");
            return Err(Rejected::attempt(AppError::ProfileNotFound, "profile_not_found").user(identity.id));
        }
        Err(e) => {
            return Err(
                Rejected::attempt(AppError::Internal(e), "profile_lookup_failed").user(identity.id),
            );
        }
    };

    if state.config.security.require_email_confirmation && !identity.email_confirmed {
        return Err(
            Rejected::attempt(AppError::EmailNotConfirmed, "email_not_confirmed").user(identity.id),
        );
    }

    let now = OffsetDateTime::now_utc();
    if let Some(lock_until) = profile.active_lock(now) {
        warn!(user_id = %identity.id, "locked account presented a token");
        return Err(Rejected {
            error: AppError::AccountLocked { lock_until },
            action: AuditAction::AuthBlocked,
            user_id: Some(identity.id),
            details: json!({ "reason": "account_locked", "lock_until": rfc3339(lock_until) }),
        });
    }

    if expiry == PasswordExpiry::Enforce {
        let days = policy::days_since_change(&profile, now);
        if policy::is_expired(days, state.config.security.password_max_age_days) {
            return Err(Rejected {
                error: AppError::PasswordExpired {
                    days_since_change: days,
                },
                action: AuditAction::PasswordExpired,
                user_id: Some(identity.id),
                details: json!({ "days_since_change": days }),
            });
        }
    }

    Ok(Session {
        identity,
        profile,
        token: token.to_string(),
        client: client.clone(),
    })
}

/// Any valid session whose password is still within its rotation window.
pub struct AuthSession(pub Session);

#[async_trait]
impl FromRequestParts<AppState> for AuthSession {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        authenticate(parts, state, PasswordExpiry::Enforce).await.map(AuthSession)
    }
}

/// Valid session; an expired password is tolerated so the user can rotate it.
pub struct SessionAllowExpired(pub Session);

#[async_trait]
impl FromRequestParts<AppState> for SessionAllowExpired {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        authenticate(parts, state, PasswordExpiry::Allow)
            .await
            .map(SessionAllowExpired)
    }
}

/// Session whose profile carries the admin or super_admin role.
pub struct AdminSession(pub Session);

#[async_trait]
impl FromRequestParts<AppState> for AdminSession {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let session = authenticate(parts, state, PasswordExpiry::Enforce).await?;
        if session.profile.role.is_admin() {
            return Ok(AdminSession(session));
        }

        warn!(user_id = %session.identity.id, path = parts.uri.path(), "admin route denied");
        state
            .audit
            .record(
                NewAuditLog::new(AuditAction::PermissionDenied, false)
                    .user(session.identity.id)
                    .resource(RESOURCE_API)
                    .details(json!({
                        "path": parts.uri.path(),
                        "role": session.profile.role,
                        "required": ["admin", "super_admin"],
                    }))
                    .client(&session.client),
            )
            .await;
        Err(AppError::InsufficientPermissions)
    }
}

/// Bearer token if one was sent; never rejects.
pub struct OptionalBearer(pub Option<String>);

#[async_trait]
impl<S> FromRequestParts<S> for OptionalBearer
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(OptionalBearer(bearer_token(&parts.headers).map(str::to_string)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        profiles::{ProfileStore, Role},
        testing::{json_request, send, TestApp},
    };
    use axum::http::{HeaderValue, StatusCode};
    use time::Duration;

    #[test]
    fn bearer_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(bearer_token(&headers), Some("abc.def"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("bearer xyz"));
        assert_eq!(bearer_token(&headers), Some("xyz"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic Zm9vOmJhcg=="));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(bearer_token(&headers), None);
    }

    #[tokio::test]
    async fn missing_token_is_401_and_audited_once() {
        let t = TestApp::new();
        let (status, body) = send(&t.router(), json_request("GET", "/api/auth/profile", None, None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "MISSING_TOKEN");

        let rows = t.audit.rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].action, "AUTH_ATTEMPT");
        assert!(!rows[0].success);
        assert_eq!(rows[0].details["reason"], "missing_token");
    }

    #[tokio::test]
    async fn expired_and_malformed_tokens_are_distinguished() {
        let t = TestApp::new();
        let (user_id, token) = t.signed_in("ann@example.com", Role::User).await;
        t.identity.expire(&token);
        let app = t.router();

        let (status, body) = send(&app, json_request("GET", "/api/auth/profile", Some(&token), None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "TOKEN_EXPIRED");

        let (status, body) = send(&app, json_request("GET", "/api/auth/profile", Some("garbage"), None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "INVALID_TOKEN");

        let (status, body) =
            send(&app, json_request("GET", "/api/auth/profile", Some("access.unknown"), None)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["code"], "AUTH_FAILED");

        let reasons: Vec<Value> = t.audit.rows().iter().map(|r| r.details["reason"].clone()).collect();
        assert_eq!(reasons, vec![json!("token_expired"), json!("invalid_token"), json!("auth_failed")]);
        assert!(t.audit.rows().iter().all(|r| r.user_id != Some(user_id)));
    }

    #[tokio::test]
    async fn missing_profile_is_403() {
        let t = TestApp::new();
        let user_id = t.identity.add_account("ghost@example.com", "correct-horse-1", true);
        let token = t.identity.issue(user_id).access_token;

        let (status, body) = send(&t.router(), json_request("GET", "/api/auth/profile", Some(&token), None)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["code"], "PROFILE_NOT_FOUND");
        assert_eq!(t.audit.rows().len(), 1);
    }

    #[tokio::test]
    async fn locked_account_is_blocked_with_lock_until() {
        let t = TestApp::new();
        let (user_id, token) = t.signed_in("ann@example.com", Role::User).await;
        let until = OffsetDateTime::now_utc() + Duration::minutes(20);
        t.profiles.edit(user_id, |p| p.lock_until = Some(until));

        let (status, body) = send(&t.router(), json_request("GET", "/api/auth/profile", Some(&token), None)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["code"], "ACCOUNT_LOCKED");
        assert_eq!(body["lock_until"], rfc3339(until));
        assert_eq!(t.audit.actions(), vec!["AUTH_BLOCKED"]);
    }

    #[tokio::test]
    async fn expired_password_blocks_protected_routes_only() {
        let t = TestApp::new();
        let (user_id, token) = t.signed_in("ann@example.com", Role::User).await;
        t.profiles.edit(user_id, |p| {
            p.created_at = OffsetDateTime::now_utc() - Duration::days(120);
        });
        let app = t.router();

        let (status, body) = send(&app, json_request("GET", "/api/auth/profile", Some(&token), None)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["code"], "PASSWORD_EXPIRED");
        assert_eq!(body["days_since_change"], 120);
        assert_eq!(t.audit.actions(), vec!["PASSWORD_EXPIRED"]);

        let (status, body) =
            send(&app, json_request("GET", "/api/force/check-expiration", Some(&token), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["expired"], true);

        let (status, _) = send(&app, json_request("GET", "/api/auth/session", Some(&token), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(t.audit.actions(), vec!["PASSWORD_EXPIRED", "AUTH_SUCCESS", "AUTH_SUCCESS"]);
    }

    #[tokio::test]
    async fn unconfirmed_email_rejected_when_required() {
        let mut config = crate::config::AppConfig::for_tests();
        config.security.require_email_confirmation = true;
        let t = TestApp::with_config(config);
        let user_id = t.identity.add_account("new@example.com", "correct-horse-1", false);
        t.profiles
            .create(crate::profiles::NewProfile {
                user_id,
                display_name: "new".into(),
                full_name: None,
                role: Role::User,
            })
            .await
            .unwrap();
        let token = t.identity.issue(user_id).access_token;

        let (status, body) = send(&t.router(), json_request("GET", "/api/auth/profile", Some(&token), None)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["code"], "EMAIL_NOT_CONFIRMED");
    }

    #[tokio::test]
    async fn non_admin_gets_insufficient_permissions() {
        let t = TestApp::new();
        let (user_id, token) = t.signed_in("ann@example.com", Role::User).await;

        let (status, body) = send(&t.router(), json_request("GET", "/api/auth/profiles", Some(&token), None)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["code"], "INSUFFICIENT_PERMISSIONS");

        let rows = t.audit.rows();
        assert_eq!(t.audit.actions(), vec!["AUTH_SUCCESS", "PERMISSION_DENIED"]);
        assert_eq!(rows[1].user_id, Some(user_id));
    }
}
