use axum::{extract::State, Json};
use serde_json::json;
use time::OffsetDateTime;
use tracing::{debug, info, instrument, warn};

use super::{
    dto::{
        AdminResetRequest, ChangePasswordRequest, ForgotPasswordRequest, PasswordChanged,
        ResetDispatched, ResetWithTokenRequest,
    },
    policy::{expiry_status, ExpiryStatus, MIN_PASSWORD_LEN},
};
use crate::{
    audit::{AuditAction, NewAuditLog},
    auth::{
        extractors::{AdminSession, SessionAllowExpired},
        services::normalize_email,
    },
    client::ClientInfo,
    error::{ApiJson, ApiResponse, AppError},
    identity::IdentityError,
    state::AppState,
};

fn check_length(password: &str) -> Result<(), AppError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AppError::validation(
            "PASSWORD_TOO_SHORT",
            format!("Password must be at least {MIN_PASSWORD_LEN} characters"),
        ));
    }
    Ok(())
}

#[instrument(skip_all)]
pub async fn check_expiration(
    State(state): State<AppState>,
    SessionAllowExpired(session): SessionAllowExpired,
) -> Json<ApiResponse<ExpiryStatus>> {
    ApiResponse::ok(expiry_status(
        &session.profile,
        state.config.security.password_max_age_days,
        OffsetDateTime::now_utc(),
    ))
}

#[instrument(skip(state, session, payload))]
pub async fn force_password_change(
    State(state): State<AppState>,
    SessionAllowExpired(session): SessionAllowExpired,
    ApiJson(payload): ApiJson<ChangePasswordRequest>,
) -> Result<Json<ApiResponse<PasswordChanged>>, AppError> {
    let user_id = session.identity.id;
    let (Some(old_password), Some(new_password)) = (
        payload.old_password.filter(|p| !p.is_empty()),
        payload.new_password.filter(|p| !p.is_empty()),
    ) else {
        return Err(AppError::validation(
            "MISSING_FIELDS",
            "Old password and new password are required",
        ));
    };
    check_length(&new_password)?;
    if new_password == old_password {
        return Err(AppError::validation(
            "PASSWORD_REUSED",
            "New password must differ from the current one",
        ));
    }

    let failed = |reason: &str| {
        NewAuditLog::new(AuditAction::PasswordChangeFailed, false)
            .user(user_id)
            .details(json!({ "reason": reason }))
            .client(&session.client)
    };

    match state
        .identity
        .sign_in_with_password(&session.identity.email, &old_password)
        .await
    {
        Ok(verified) => {
            // the check itself opened a session nobody will use
            if let Err(e) = state.identity.sign_out(&verified.session.access_token).await {
                debug!(error = %e, "could not revoke verification session");
            }
        }
        Err(IdentityError::InvalidCredentials) => {
            warn!(user_id = %user_id, "password change with wrong current password");
            state.audit.record(failed("old_password_incorrect")).await;
            return Err(AppError::validation(
                "OLD_PASSWORD_INCORRECT",
                "Old password incorrect",
            ));
        }
        Err(e) => {
            state.audit.record(failed("verification_failed")).await;
            return Err(AppError::Internal(
                anyhow::Error::new(e).context("verify current password"),
            ));
        }
    }

    if let Err(e) = state.identity.update_password(user_id, &new_password).await {
        state.audit.record(failed("update_failed")).await;
        return Err(match e {
            IdentityError::Rejected(message) => AppError::validation("PASSWORD_UPDATE_FAILED", message),
            other => AppError::Internal(anyhow::Error::new(other).context("update password")),
        });
    }

    let now = OffsetDateTime::now_utc();
    state.profiles.mark_password_changed(user_id, now).await?;

    state
        .audit
        .record(
            NewAuditLog::new(AuditAction::PasswordChangedByUser, true)
                .user(user_id)
                .client(&session.client),
        )
        .await;

    info!(user_id = %user_id, "password changed");
    Ok(ApiResponse::with_message(
        "Password changed successfully",
        PasswordChanged {
            password_changed_at: now,
        },
    ))
}

/// Public endpoint. The response does not reveal whether the email belongs to
/// an account.
#[instrument(skip(state, client, payload))]
pub async fn forgot_password(
    State(state): State<AppState>,
    client: ClientInfo,
    ApiJson(payload): ApiJson<ForgotPasswordRequest>,
) -> Result<Json<ApiResponse<ResetDispatched>>, AppError> {
    let Some(email) = payload
        .user_email
        .as_deref()
        .map(normalize_email)
        .filter(|e| !e.is_empty())
    else {
        state
            .audit
            .record(
                NewAuditLog::new(AuditAction::PasswordResetFailed, false)
                    .details(json!({ "reason": "missing_email" }))
                    .client(&client),
            )
            .await;
        return Err(AppError::validation("MISSING_EMAIL", "Email is required"));
    };

    state
        .audit
        .record(
            NewAuditLog::new(AuditAction::PasswordResetRequested, true)
                .details(json!({ "email": email }))
                .client(&client),
        )
        .await;

    let redirect_to = state.config.reset_redirect_url.as_str();
    let dispatch_error = match state.identity.send_password_reset(&email, redirect_to).await {
        Ok(()) => {
            state
                .audit
                .record(
                    NewAuditLog::new(AuditAction::PasswordResetLinkSent, true)
                        .details(json!({ "email": email, "via": "email_service" }))
                        .client(&client),
                )
                .await;
            return Ok(ApiResponse::with_message(
                "Password reset email sent",
                ResetDispatched::default(),
            ));
        }
        Err(e) => e,
    };

    warn!(error = %dispatch_error, "reset email dispatch failed");
    if let IdentityError::RateLimited(message) = &dispatch_error {
        state
            .audit
            .record(
                NewAuditLog::new(AuditAction::PasswordResetRateLimited, false)
                    .details(json!({ "email": email, "message": message }))
                    .client(&client),
            )
            .await;
    }

    if state.config.dev_reset_links_enabled() {
        match state.identity.generate_recovery_link(&email, redirect_to).await {
            Ok(link) => {
                state
                    .audit
                    .record(
                        NewAuditLog::new(AuditAction::PasswordResetLinkSent, true)
                            .details(json!({ "email": email, "via": "dev_link" }))
                            .client(&client),
                    )
                    .await;
                return Ok(ApiResponse::with_message(
                    "Email service failed; dev link generated.",
                    ResetDispatched {
                        dev_action_link: Some(link),
                    },
                ));
            }
            Err(e) => warn!(error = %e, "dev recovery link generation failed"),
        }
    }

    state
        .audit
        .record(
            NewAuditLog::new(AuditAction::PasswordResetFailed, false)
                .details(json!({ "email": email, "error": dispatch_error.to_string() }))
                .client(&client),
        )
        .await;
    Err(AppError::Internal(
        anyhow::Error::new(dispatch_error).context("send password reset email"),
    ))
}

#[instrument(skip(state, client, payload))]
pub async fn reset_password_email(
    State(state): State<AppState>,
    client: ClientInfo,
    ApiJson(payload): ApiJson<ResetWithTokenRequest>,
) -> Result<Json<ApiResponse<PasswordChanged>>, AppError> {
    let (Some(access_token), Some(new_password)) = (
        payload.access_token.filter(|t| !t.is_empty()),
        payload.new_password.filter(|p| !p.is_empty()),
    ) else {
        state
            .audit
            .record(
                NewAuditLog::new(AuditAction::PasswordResetFailed, false)
                    .details(json!({ "reason": "missing_token_or_password" }))
                    .client(&client),
            )
            .await;
        return Err(AppError::validation(
            "MISSING_FIELDS",
            "Access token and new password are required",
        ));
    };
    check_length(&new_password)?;

    let identity = match state.identity.get_user(&access_token).await {
        Ok(identity) => identity,
        Err(e) => {
            warn!(error = %e, "reset token rejected");
            state
                .audit
                .record(
                    NewAuditLog::new(AuditAction::PasswordResetTokenInvalid, false)
                        .details(json!({ "error": e.to_string() }))
                        .client(&client),
                )
                .await;
            return Err(AppError::validation("INVALID_RESET_TOKEN", "Invalid access token"));
        }
    };
    let user_id = identity.id;

    state
        .audit
        .record(
            NewAuditLog::new(AuditAction::PasswordResetTokenVerified, true)
                .user(user_id)
                .client(&client),
        )
        .await;

    if let Err(e) = state.identity.update_password(user_id, &new_password).await {
        state
            .audit
            .record(
                NewAuditLog::new(AuditAction::PasswordResetFailed, false)
                    .user(user_id)
                    .details(json!({ "error": e.to_string() }))
                    .client(&client),
            )
            .await;
        return Err(AppError::Internal(
            anyhow::Error::new(e).context("update password after reset"),
        ));
    }

    let now = OffsetDateTime::now_utc();
    if let Err(e) = state.profiles.mark_password_changed(user_id, now).await {
        warn!(error = ?e, user_id = %user_id, "password reset but rotation clock not updated");
    }

    state
        .audit
        .record(
            NewAuditLog::new(AuditAction::PasswordResetSucceeded, true)
                .user(user_id)
                .details(json!({ "method": "admin_api" }))
                .client(&client),
        )
        .await;

    info!(user_id = %user_id, "password reset via emailed link");
    Ok(ApiResponse::with_message(
        "Password updated successfully",
        PasswordChanged {
            password_changed_at: now,
        },
    ))
}

/// Administrative override. The target's rotation clock is left alone.
#[instrument(skip(state, admin, payload))]
pub async fn reset_password(
    State(state): State<AppState>,
    AdminSession(admin): AdminSession,
    ApiJson(payload): ApiJson<AdminResetRequest>,
) -> Result<Json<ApiResponse<serde_json::Value>>, AppError> {
    let (Some(target), Some(new_password)) = (
        payload.user_id,
        payload.new_password.filter(|p| !p.is_empty()),
    ) else {
        return Err(AppError::validation(
            "MISSING_FIELDS",
            "user_id and new password are required",
        ));
    };
    check_length(&new_password)?;

    let result = state.identity.update_password(target, &new_password).await;
    state
        .audit
        .record(
            NewAuditLog::new(AuditAction::PasswordResetByAdmin, result.is_ok())
                .user(admin.identity.id)
                .details(json!({
                    "target_user_id": target,
                    "error": result.as_ref().err().map(|e| e.to_string()),
                }))
                .client(&admin.client),
        )
        .await;

    match result {
        Ok(()) => {
            info!(admin_id = %admin.identity.id, target = %target, "password reset by admin");
            Ok(ApiResponse::with_message(
                "Password updated successfully",
                json!({ "user_id": target }),
            ))
        }
        Err(IdentityError::Rejected(message)) => Err(AppError::NotFound(message)),
        Err(e) => Err(AppError::Internal(
            anyhow::Error::new(e).context("admin password reset"),
        )),
    }
}
