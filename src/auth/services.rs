use lazy_static::lazy_static;
use regex::Regex;
use serde_json::json;
use time::{Duration, OffsetDateTime};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    attempts::{
        limiter::{check_failed_login_attempts, check_rate_limit, update_failed_attempts, LockoutPolicy},
        AttemptReason, NewLoginAttempt,
    },
    audit::{AuditAction, NewAuditLog, RESOURCE_API},
    auth::dto::{LoginData, LoginRequest, RegisterData, RegisterRequest},
    client::ClientInfo,
    error::AppError,
    identity::{IdentityError, SignUpMetadata},
    password::policy::{self, MIN_PASSWORD_LEN},
    profiles::{NewProfile, Role},
    state::AppState,
};

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

pub(crate) fn normalize_email(raw: &str) -> String {
    raw.trim().to_lowercase()
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Why a login was turned away, and what to record about it.
struct Denied {
    reason: AttemptReason,
    user_id: Option<Uuid>,
    error: AppError,
}

impl Denied {
    fn new(reason: AttemptReason, error: AppError) -> Self {
        Self {
            reason,
            user_id: None,
            error,
        }
    }

    fn user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }
}

async fn record_attempt(state: &AppState, attempt: NewLoginAttempt) {
    let reason = attempt.reason.as_str();
    if let Err(e) = state.attempts.insert(attempt).await {
        error!(error = ?e, reason, "login attempt write failed");
    }
}

async fn revoke(state: &AppState, access_token: &str) {
    if let Err(e) = state.identity.sign_out(access_token).await {
        debug!(error = %e, "could not revoke session issued to a rejected login");
    }
}

/// Password login. Every call leaves exactly one login-attempt row; calls
/// that carry credentials also leave one `LOGIN_ATTEMPT` audit row keyed by
/// the caller's address, which is what the per-IP limiter counts.
pub async fn login(state: &AppState, client: &ClientInfo, req: LoginRequest) -> Result<LoginData, AppError> {
    let email = req.email.as_deref().map(normalize_email).unwrap_or_default();
    let password = req.password.unwrap_or_default();

    if email.is_empty() || password.is_empty() {
        record_attempt(
            state,
            NewLoginAttempt {
                user_id: None,
                email_tried: email,
                success: false,
                reason: AttemptReason::MissingCredentials,
                ip: client.ip.clone(),
            },
        )
        .await;
        return Err(AppError::validation(
            "MISSING_CREDENTIALS",
            "Email and password are required",
        ));
    }

    let now = OffsetDateTime::now_utc();
    let outcome = attempt_login(state, client, &email, &password, now).await;

    let (user_id, reason, code) = match &outcome {
        Ok(data) => (Some(data.user.id), AttemptReason::Success, None),
        Err(denied) => (denied.user_id, denied.reason, Some(denied.error.code())),
    };
    let success = outcome.is_ok();

    record_attempt(
        state,
        NewLoginAttempt {
            user_id,
            email_tried: email.clone(),
            success,
            reason,
            ip: client.ip.clone(),
        },
    )
    .await;
    state
        .audit
        .record(
            NewAuditLog::new(AuditAction::LoginAttempt, success)
                .user(user_id)
                .details(json!({ "email": email, "reason": reason.as_str(), "code": code }))
                .client(client),
        )
        .await;

    match outcome {
        Ok(data) => {
            info!(user_id = %data.user.id, "user logged in");
            Ok(data)
        }
        Err(denied) => {
            warn!(email = %email, reason = reason.as_str(), "login rejected");
            Err(denied.error)
        }
    }
}

async fn attempt_login(
    state: &AppState,
    client: &ClientInfo,
    email: &str,
    password: &str,
    now: OffsetDateTime,
) -> Result<LoginData, Denied> {
    let security = &state.config.security;

    let by_ip = check_rate_limit(
        state.audit.store().as_ref(),
        client.ip.as_deref(),
        AuditAction::LoginAttempt,
        Duration::minutes(security.ip_window_minutes),
        security.max_ip_attempts,
        now,
    )
    .await;
    if by_ip.blocked {
        return Err(Denied::new(AttemptReason::Locked, AppError::RateLimited));
    }

    let by_email = check_failed_login_attempts(
        state.attempts.as_ref(),
        email,
        Duration::minutes(security.login_window_minutes),
        security.max_failed_logins,
        now,
    )
    .await;
    if by_email.blocked {
        // an account that is actually locked says so; otherwise only the email is throttled
        if let Some((user_id, lock_until)) = active_lock_for_email(state, email, now).await {
            return Err(
                Denied::new(AttemptReason::Locked, AppError::AccountLocked { lock_until }).user(user_id),
            );
        }
        return Err(Denied::new(
            AttemptReason::Locked,
            AppError::EmailBlocked {
                retry_after_minutes: by_email.retry_after_minutes,
            },
        ));
    }

    let signed_in = match state.identity.sign_in_with_password(email, password).await {
        Ok(signed_in) => signed_in,
        Err(IdentityError::InvalidCredentials) => return Err(wrong_credentials(state, email, now).await),
        Err(IdentityError::EmailNotConfirmed) => {
            return Err(Denied::new(AttemptReason::Locked, AppError::EmailNotConfirmed));
        }
        Err(IdentityError::RateLimited(message)) => {
            warn!(%message, "identity provider throttled sign-in");
            return Err(Denied::new(AttemptReason::Locked, AppError::RateLimited));
        }
        Err(e) => {
            return Err(Denied::new(
                AttemptReason::NotFound,
                AppError::Internal(anyhow::Error::new(e).context("password sign-in")),
            ));
        }
    };

    let user_id = signed_in.identity.id;
    let mut profile = match state.profiles.find_by_user_id(user_id).await {
        Ok(Some(profile)) => profile,
        Ok(None) => {
            revoke(state, &signed_in.session.access_token).await;
            return Err(Denied::new(AttemptReason::NotFound, AppError::ProfileNotFound).user(user_id));
        }
        Err(e) => {
            revoke(state, &signed_in.session.access_token).await;
            return Err(Denied::new(AttemptReason::NotFound, AppError::Internal(e)).user(user_id));
        }
    };

    if let Some(lock_until) = profile.active_lock(now) {
        revoke(state, &signed_in.session.access_token).await;
        return Err(Denied::new(AttemptReason::Locked, AppError::AccountLocked { lock_until }).user(user_id));
    }

    if let Some(reset) =
        update_failed_attempts(state.profiles.as_ref(), user_id, false, LockoutPolicy::from(security), now).await
    {
        profile.failed_attempts = reset.failed_attempts;
        profile.lock_until = reset.lock_until;
    }

    let password_expired = policy::is_expired(
        policy::days_since_change(&profile, now),
        security.password_max_age_days,
    );

    Ok(LoginData {
        user: signed_in.identity,
        profile,
        session: signed_in.session,
        password_expired,
    })
}

/// Bad password or unknown email. Both answer the same to the caller; only
/// the recorded reason differs.
async fn wrong_credentials(state: &AppState, email: &str, now: OffsetDateTime) -> Denied {
    let identity = match state.identity.find_user_by_email(email).await {
        Ok(Some(identity)) => identity,
        Ok(None) => return Denied::new(AttemptReason::NotFound, AppError::LoginFailed),
        Err(e) => {
            error!(error = %e, "admin lookup after failed sign-in failed; lockout counter not updated");
            return Denied::new(AttemptReason::NotFound, AppError::LoginFailed);
        }
    };

    match state.profiles.find_by_user_id(identity.id).await {
        Ok(Some(profile)) => {
            if let Some(lock_until) = profile.active_lock(now) {
                return Denied::new(AttemptReason::Locked, AppError::AccountLocked { lock_until })
                    .user(identity.id);
            }
        }
        Ok(None) => {}
        Err(e) => warn!(error = ?e, user_id = %identity.id, "profile lookup after failed sign-in failed"),
    }

    let policy = LockoutPolicy::from(&state.config.security);
    update_failed_attempts(state.profiles.as_ref(), identity.id, true, policy, now).await;
    Denied::new(AttemptReason::WrongPassword, AppError::LoginFailed).user(identity.id)
}

async fn active_lock_for_email(
    state: &AppState,
    email: &str,
    now: OffsetDateTime,
) -> Option<(Uuid, OffsetDateTime)> {
    let identity = match state.identity.find_user_by_email(email).await {
        Ok(found) => found?,
        Err(e) => {
            error!(error = %e, "admin lookup for lock check failed");
            return None;
        }
    };
    match state.profiles.find_by_user_id(identity.id).await {
        Ok(profile) => profile?.active_lock(now).map(|until| (identity.id, until)),
        Err(e) => {
            warn!(error = ?e, user_id = %identity.id, "profile lookup for lock check failed");
            None
        }
    }
}

/// Create the identity, then its profile. A profile failure is recorded but
/// does not undo the identity.
pub async fn register(
    state: &AppState,
    client: &ClientInfo,
    req: RegisterRequest,
) -> Result<RegisterData, AppError> {
    let email = req.email.as_deref().map(normalize_email).unwrap_or_default();
    let password = req.password.unwrap_or_default();

    if !is_valid_email(&email) {
        warn!(email = %email, "invalid email");
        return Err(AppError::validation("INVALID_EMAIL", "Invalid email"));
    }
    if password.chars().count() < MIN_PASSWORD_LEN {
        warn!("password too short");
        return Err(AppError::validation(
            "PASSWORD_TOO_SHORT",
            format!("Password must be at least {MIN_PASSWORD_LEN} characters"),
        ));
    }

    let full_name = non_blank(req.full_name);
    let display_name = non_blank(req.display_name)
        .or_else(|| full_name.clone())
        .unwrap_or_else(|| email.split('@').next().unwrap_or_default().to_string());

    let metadata = SignUpMetadata {
        display_name: display_name.clone(),
        full_name: full_name.clone().unwrap_or_default(),
    };

    let signed_up = match state.identity.sign_up(&email, &password, &metadata).await {
        Ok(signed_up) => signed_up,
        Err(e) => {
            warn!(email = %email, error = %e, "registration rejected");
            state
                .audit
                .record(
                    NewAuditLog::new(AuditAction::RegisterFailed, false)
                        .resource(RESOURCE_API)
                        .details(json!({ "email": email, "reason": e.to_string() }))
                        .client(client),
                )
                .await;
            return Err(match e {
                IdentityError::Unavailable(inner) => AppError::Internal(inner),
                IdentityError::Rejected(message) | IdentityError::RateLimited(message) => {
                    AppError::validation("REGISTER_FAILED", message)
                }
                other => AppError::validation("REGISTER_FAILED", other.to_string()),
            });
        }
    };

    let user_id = signed_up.identity.id;
    let profile = match state
        .profiles
        .create(NewProfile {
            user_id,
            display_name,
            full_name,
            role: Role::User,
        })
        .await
    {
        Ok(profile) => Some(profile),
        Err(e) => {
            error!(error = ?e, user_id = %user_id, "profile creation failed");
            state
                .audit
                .record(
                    NewAuditLog::new(AuditAction::ProfileCreationFailed, false)
                        .user(user_id)
                        .resource(RESOURCE_API)
                        .details(json!({ "email": email, "error": e.to_string() }))
                        .client(client),
                )
                .await;
            None
        }
    };

    state
        .audit
        .record(
            NewAuditLog::new(AuditAction::RegisterSuccess, true)
                .user(user_id)
                .resource(RESOURCE_API)
                .details(json!({ "email": email, "has_profile": profile.is_some() }))
                .client(client),
        )
        .await;

    info!(user_id = %user_id, email = %email, "user registered");
    Ok(RegisterData {
        user: signed_up.identity,
        session: signed_up.session,
        profile_created: profile.is_some(),
        profile,
    })
}
