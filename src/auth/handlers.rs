use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::{
    attempts::{AttemptFilter, LoginAttempt},
    audit::{AuditAction, AuditFilter, AuditLog, NewAuditLog, RESOURCE_API},
    auth::{
        dto::{
            LoginData, LoginRequest, RefreshRequest, RegisterData, RegisterRequest, SessionData,
            SignoutData,
        },
        extractors::{AdminSession, AuthSession, OptionalBearer, SessionAllowExpired},
        services,
    },
    client::ClientInfo,
    error::{ApiJson, ApiQuery, ApiResponse, AppError},
    identity::{IdentityError, SessionTokens},
    pagination::{PageQuery, Paginated},
    profiles::{Profile, ProfileFilter, ProfileUpdate},
    state::AppState,
};

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/login", post(login))
        .route("/register", post(register))
        .route("/refresh", post(refresh))
        .route("/profile", get(get_profile).put(update_profile))
        .route("/session", get(session))
        .route("/signout", post(signout))
}

pub fn admin_routes() -> Router<AppState> {
    Router::new()
        .route("/profiles", get(list_profiles))
        .route("/login-attempts", get(list_login_attempts))
        .route("/audit-logs", get(list_audit_logs))
}

#[instrument(skip(state, client, payload))]
pub async fn login(
    State(state): State<AppState>,
    client: ClientInfo,
    ApiJson(payload): ApiJson<LoginRequest>,
) -> Result<Json<ApiResponse<LoginData>>, AppError> {
    let data = services::login(&state, &client, payload).await?;
    Ok(ApiResponse::with_message("Login successful", data))
}

#[instrument(skip(state, client, payload))]
pub async fn register(
    State(state): State<AppState>,
    client: ClientInfo,
    ApiJson(payload): ApiJson<RegisterRequest>,
) -> Result<(StatusCode, Json<ApiResponse<RegisterData>>), AppError> {
    let data = services::register(&state, &client, payload).await?;
    Ok((
        StatusCode::CREATED,
        ApiResponse::with_message("Registration successful", data),
    ))
}

#[instrument(skip(state, client, payload))]
pub async fn refresh(
    State(state): State<AppState>,
    client: ClientInfo,
    ApiJson(payload): ApiJson<RefreshRequest>,
) -> Result<Json<ApiResponse<SessionTokens>>, AppError> {
    let Some(refresh_token) = payload.refresh_token.filter(|t| !t.is_empty()) else {
        return Err(AppError::validation("MISSING_REFRESH_TOKEN", "Refresh token required"));
    };

    match state.identity.refresh_session(&refresh_token).await {
        Ok(tokens) => {
            state
                .audit
                .record(NewAuditLog::new(AuditAction::TokenRefreshed, true).client(&client))
                .await;
            debug!("session refreshed");
            Ok(ApiResponse::with_message("Token refreshed successfully", tokens))
        }
        Err(IdentityError::Unavailable(e)) => Err(AppError::Internal(e)),
        Err(e) => {
            warn!(error = %e, "refresh rejected");
            state
                .audit
                .record(
                    NewAuditLog::new(AuditAction::TokenRefreshFailed, false)
                        .details(json!({ "reason": e.to_string() }))
                        .client(&client),
                )
                .await;
            Err(AppError::Unauthorized("REFRESH_FAILED", "Failed to refresh token".into()))
        }
    }
}

#[instrument(skip_all)]
pub async fn get_profile(AuthSession(session): AuthSession) -> Json<ApiResponse<Profile>> {
    ApiResponse::ok(session.profile)
}

#[instrument(skip(state, session, payload))]
pub async fn update_profile(
    State(state): State<AppState>,
    AuthSession(session): AuthSession,
    ApiJson(payload): ApiJson<ProfileUpdate>,
) -> Result<Json<ApiResponse<Profile>>, AppError> {
    let update = ProfileUpdate {
        display_name: payload.display_name.map(|n| n.trim().to_string()),
        full_name: payload.full_name.map(|n| n.trim().to_string()),
    };
    if update.is_empty() {
        return Err(AppError::validation("NO_CHANGES", "Nothing to update"));
    }
    if update.display_name.as_deref() == Some("") {
        return Err(AppError::validation("INVALID_DISPLAY_NAME", "Display name cannot be empty"));
    }

    let user_id = session.identity.id;
    let changed: Vec<&str> = [
        update.display_name.as_ref().map(|_| "display_name"),
        update.full_name.as_ref().map(|_| "full_name"),
    ]
    .into_iter()
    .flatten()
    .collect();

    let profile = state
        .profiles
        .update_self(user_id, update)
        .await?
        .ok_or(AppError::ProfileNotFound)?;

    state
        .audit
        .record(
            NewAuditLog::new(AuditAction::ProfileUpdated, true)
                .user(user_id)
                .resource(RESOURCE_API)
                .details(json!({ "fields": changed }))
                .client(&session.client),
        )
        .await;

    info!(user_id = %user_id, "profile updated");
    Ok(ApiResponse::with_message("Profile updated successfully", profile))
}

#[instrument(skip_all)]
pub async fn session(SessionAllowExpired(session): SessionAllowExpired) -> Json<ApiResponse<SessionData>> {
    ApiResponse::ok(SessionData {
        user: session.identity,
        profile: session.profile,
    })
}

/// Always succeeds: a missing, expired or already revoked token still ends
/// in a signed-out client.
#[instrument(skip_all)]
pub async fn signout(
    State(state): State<AppState>,
    client: ClientInfo,
    OptionalBearer(token): OptionalBearer,
) -> Json<ApiResponse<SignoutData>> {
    let mut user_id = None;
    let mut revoked = false;

    if let Some(token) = token {
        user_id = state.identity.get_user(&token).await.ok().map(|i| i.id);
        match state.identity.sign_out(&token).await {
            Ok(()) => revoked = true,
            Err(e) => debug!(error = %e, "sign-out found nothing to revoke"),
        }
    }

    state
        .audit
        .record(
            NewAuditLog::new(AuditAction::Signout, true)
                .user(user_id)
                .details(json!({ "revoked": revoked }))
                .client(&client),
        )
        .await;

    ApiResponse::with_message("Signed out successfully", SignoutData { revoked })
}

#[instrument(skip(state, _admin))]
pub async fn list_profiles(
    State(state): State<AppState>,
    _admin: AdminSession,
    ApiQuery(page): ApiQuery<PageQuery>,
    ApiQuery(filter): ApiQuery<ProfileFilter>,
) -> Result<Json<Paginated<Profile>>, AppError> {
    let page = page.normalized();
    let rows = state.profiles.list(&filter, page).await?;
    Ok(Json(Paginated::new(page, rows)))
}

#[instrument(skip(state, _admin))]
pub async fn list_login_attempts(
    State(state): State<AppState>,
    _admin: AdminSession,
    ApiQuery(page): ApiQuery<PageQuery>,
    ApiQuery(filter): ApiQuery<AttemptFilter>,
) -> Result<Json<Paginated<LoginAttempt>>, AppError> {
    let page = page.normalized();
    let rows = state.attempts.list(&filter, page).await?;
    Ok(Json(Paginated::new(page, rows)))
}

#[instrument(skip(state, _admin))]
pub async fn list_audit_logs(
    State(state): State<AppState>,
    _admin: AdminSession,
    ApiQuery(page): ApiQuery<PageQuery>,
    ApiQuery(filter): ApiQuery<AuditFilter>,
) -> Result<Json<Paginated<AuditLog>>, AppError> {
    let page = page.normalized();
    let rows = state.audit.store().list(&filter, page).await?;
    Ok(Json(Paginated::new(page, rows)))
}
