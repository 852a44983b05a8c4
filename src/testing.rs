//! In-memory stand-ins for the identity provider and the Postgres stores,
//! plus helpers for driving the router in tests.

use std::{
    collections::{HashMap, HashSet},
    net::{IpAddr, SocketAddr},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{header, Request, StatusCode},
    Router,
};
use serde_json::Value;
use time::OffsetDateTime;
use tower::ServiceExt;
use uuid::Uuid;

use crate::{
    attempts::{AttemptFilter, AttemptStats, LoginAttempt, LoginAttemptStore, NewLoginAttempt},
    audit::{AuditAction, AuditFilter, AuditLog, AuditStore, NewAuditLog},
    config::AppConfig,
    identity::{
        Identity, IdentityError, IdentityProvider, SessionTokens, SignIn, SignUp, SignUpMetadata,
    },
    pagination::{paginate, Page, PageQuery},
    profiles::{NewProfile, Profile, ProfileFilter, ProfileStore, ProfileUpdate, Role},
    state::AppState,
};

pub const TEST_IP: &str = "198.51.100.7";

// ---------------------------------------------------------------------------
// identity provider

#[derive(Debug, Clone)]
struct Account {
    id: Uuid,
    email: String,
    password: String,
    confirmed: bool,
}

impl Account {
    fn identity(&self) -> Identity {
        Identity {
            id: self.id,
            email: self.email.clone(),
            email_confirmed: self.confirmed,
        }
    }
}

#[derive(Default)]
struct ProviderState {
    accounts: HashMap<String, Account>,
    access: HashMap<String, Uuid>,
    refresh: HashMap<String, Uuid>,
    expired: HashSet<String>,
    reset_emails: Vec<String>,
}

/// Accounts keyed by email. Access tokens look like `access.<uuid>`; tokens
/// registered through [`FakeIdentityProvider::expire`] report expiry and
/// anything without a dot is treated as malformed.
#[derive(Default)]
pub struct FakeIdentityProvider {
    state: Mutex<ProviderState>,
    pub fail_reset_email: AtomicBool,
    pub rate_limit_reset_email: AtomicBool,
    pub fail_lookup: AtomicBool,
    pub sign_in_calls: AtomicUsize,
}

impl FakeIdentityProvider {
    pub fn add_account(&self, email: &str, password: &str, confirmed: bool) -> Uuid {
        let id = Uuid::new_v4();
        self.state.lock().unwrap().accounts.insert(
            email.to_lowercase(),
            Account {
                id,
                email: email.to_lowercase(),
                password: password.into(),
                confirmed,
            },
        );
        id
    }

    pub fn issue(&self, user_id: Uuid) -> SessionTokens {
        let mut state = self.state.lock().unwrap();
        let access_token = format!("access.{}", Uuid::new_v4());
        let refresh_token = format!("refresh.{}", Uuid::new_v4());
        state.access.insert(access_token.clone(), user_id);
        state.refresh.insert(refresh_token.clone(), user_id);
        SessionTokens {
            access_token,
            refresh_token,
            expires_at: (OffsetDateTime::now_utc().unix_timestamp()) + 3600,
            token_type: "bearer".into(),
        }
    }

    pub fn expire(&self, access_token: &str) {
        let mut state = self.state.lock().unwrap();
        state.access.remove(access_token);
        state.expired.insert(access_token.into());
    }

    pub fn is_active(&self, access_token: &str) -> bool {
        self.state.lock().unwrap().access.contains_key(access_token)
    }

    pub fn password_of(&self, email: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .accounts
            .get(&email.to_lowercase())
            .map(|a| a.password.clone())
    }

    pub fn reset_emails(&self) -> Vec<String> {
        self.state.lock().unwrap().reset_emails.clone()
    }

    fn account_by_id(state: &ProviderState, id: Uuid) -> Option<Account> {
        state.accounts.values().find(|a| a.id == id).cloned()
    }
}

#[async_trait]
impl IdentityProvider for FakeIdentityProvider {
    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<SignIn, IdentityError> {
        self.sign_in_calls.fetch_add(1, Ordering::SeqCst);
        let account = {
            let state = self.state.lock().unwrap();
            state.accounts.get(&email.to_lowercase()).cloned()
        };
        match account {
            Some(a) if a.password == password => {
                if !a.confirmed {
                    return Err(IdentityError::EmailNotConfirmed);
                }
                Ok(SignIn {
                    identity: a.identity(),
                    session: self.issue(a.id),
                })
            }
            _ => Err(IdentityError::InvalidCredentials),
        }
    }

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        _metadata: &SignUpMetadata,
    ) -> Result<SignUp, IdentityError> {
        if self.state.lock().unwrap().accounts.contains_key(&email.to_lowercase()) {
            return Err(IdentityError::Rejected("User already registered".into()));
        }
        let id = self.add_account(email, password, true);
        Ok(SignUp {
            identity: Identity {
                id,
                email: email.to_lowercase(),
                email_confirmed: true,
            },
            session: Some(self.issue(id)),
        })
    }

    async fn get_user(&self, access_token: &str) -> Result<Identity, IdentityError> {
        let state = self.state.lock().unwrap();
        if state.expired.contains(access_token) {
            return Err(IdentityError::TokenExpired);
        }
        if !access_token.contains('.') {
            return Err(IdentityError::InvalidToken);
        }
        state
            .access
            .get(access_token)
            .and_then(|id| Self::account_by_id(&state, *id))
            .map(|a| a.identity())
            .ok_or_else(|| IdentityError::Rejected("session not found".into()))
    }

    async fn refresh_session(&self, refresh_token: &str) -> Result<SessionTokens, IdentityError> {
        let user_id = self
            .state
            .lock()
            .unwrap()
            .refresh
            .remove(refresh_token)
            .ok_or_else(|| IdentityError::Rejected("Invalid Refresh Token".into()))?;
        Ok(self.issue(user_id))
    }

    async fn sign_out(&self, access_token: &str) -> Result<(), IdentityError> {
        let mut state = self.state.lock().unwrap();
        match state.access.remove(access_token) {
            Some(_) => Ok(()),
            None => Err(IdentityError::Rejected("session not found".into())),
        }
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<Identity>, IdentityError> {
        if self.fail_lookup.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("permission denied for schema auth").into());
        }
        Ok(self
            .state
            .lock()
            .unwrap()
            .accounts
            .get(&email.to_lowercase())
            .map(Account::identity))
    }

    async fn update_password(&self, user_id: Uuid, new_password: &str) -> Result<(), IdentityError> {
        let mut state = self.state.lock().unwrap();
        let account = state
            .accounts
            .values_mut()
            .find(|a| a.id == user_id)
            .ok_or_else(|| IdentityError::Rejected("User not found".into()))?;
        account.password = new_password.into();
        Ok(())
    }

    async fn send_password_reset(&self, email: &str, _redirect_to: &str) -> Result<(), IdentityError> {
        if self.rate_limit_reset_email.load(Ordering::SeqCst) {
            return Err(IdentityError::RateLimited("email rate limit exceeded".into()));
        }
        if self.fail_reset_email.load(Ordering::SeqCst) {
            return Err(IdentityError::Unavailable(anyhow::anyhow!("smtp unreachable")));
        }
        self.state.lock().unwrap().reset_emails.push(email.into());
        Ok(())
    }

    async fn generate_recovery_link(&self, email: &str, redirect_to: &str) -> Result<String, IdentityError> {
        let state = self.state.lock().unwrap();
        let account = state
            .accounts
            .get(&email.to_lowercase())
            .ok_or_else(|| IdentityError::Rejected("User not found".into()))?;
        Ok(format!(
            "http://localhost:54321/auth/v1/verify?token=recovery-{}&type=recovery&redirect_to={redirect_to}",
            account.id
        ))
    }
}

// ---------------------------------------------------------------------------
// stores

#[derive(Default)]
pub struct MemoryProfileStore {
    rows: Mutex<Vec<Profile>>,
    pub fail_create: AtomicBool,
}

impl MemoryProfileStore {
    pub fn get(&self, user_id: Uuid) -> Option<Profile> {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.user_id == user_id)
            .cloned()
    }

    /// Mutate a stored profile in place, e.g. to backdate timestamps.
    pub fn edit(&self, user_id: Uuid, f: impl FnOnce(&mut Profile)) {
        let mut rows = self.rows.lock().unwrap();
        if let Some(p) = rows.iter_mut().find(|p| p.user_id == user_id) {
            f(p);
        }
    }
}

#[async_trait]
impl ProfileStore for MemoryProfileStore {
    async fn find_by_user_id(&self, user_id: Uuid) -> anyhow::Result<Option<Profile>> {
        Ok(self.get(user_id))
    }

    async fn create(&self, new: NewProfile) -> anyhow::Result<Profile> {
        if self.fail_create.load(Ordering::SeqCst) {
            anyhow::bail!("profiles insert rejected");
        }
        let mut rows = self.rows.lock().unwrap();
        if rows.iter().any(|p| p.user_id == new.user_id) {
            anyhow::bail!("duplicate key value violates unique constraint \"profiles_user_id_key\"");
        }
        let now = OffsetDateTime::now_utc();
        let profile = Profile {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            display_name: new.display_name,
            full_name: new.full_name,
            role: new.role,
            failed_attempts: 0,
            lock_until: None,
            password_changed_at: None,
            created_at: now,
            updated_at: now,
        };
        rows.push(profile.clone());
        Ok(profile)
    }

    async fn update_self(&self, user_id: Uuid, update: ProfileUpdate) -> anyhow::Result<Option<Profile>> {
        let mut rows = self.rows.lock().unwrap();
        Ok(rows.iter_mut().find(|p| p.user_id == user_id).map(|p| {
            if let Some(name) = update.display_name {
                p.display_name = name;
            }
            if let Some(full) = update.full_name {
                p.full_name = Some(full);
            }
            p.updated_at = OffsetDateTime::now_utc();
            p.clone()
        }))
    }

    async fn set_lock_state(
        &self,
        user_id: Uuid,
        failed_attempts: i32,
        lock_until: Option<OffsetDateTime>,
    ) -> anyhow::Result<()> {
        self.edit(user_id, |p| {
            p.failed_attempts = failed_attempts;
            p.lock_until = lock_until;
        });
        Ok(())
    }

    async fn mark_password_changed(&self, user_id: Uuid, at: OffsetDateTime) -> anyhow::Result<()> {
        self.edit(user_id, |p| {
            p.password_changed_at = Some(at);
            p.failed_attempts = 0;
            p.lock_until = None;
        });
        Ok(())
    }

    async fn list(&self, filter: &ProfileFilter, page: PageQuery) -> anyhow::Result<Page<Profile>> {
        let needle = filter.search.as_deref().unwrap_or("").to_lowercase();
        let mut rows: Vec<Profile> = self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|p| {
                needle.is_empty()
                    || p.display_name.to_lowercase().contains(&needle)
                    || p
                        .full_name
                        .as_deref()
                        .is_some_and(|f| f.to_lowercase().contains(&needle))
            })
            .cloned()
            .collect();
        rows.reverse();
        Ok(paginate(&rows, page))
    }

    async fn ping(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryAttemptStore {
    rows: Mutex<Vec<LoginAttempt>>,
}

impl MemoryAttemptStore {
    pub fn insert_at(&self, attempt: NewLoginAttempt, at: OffsetDateTime) {
        self.rows.lock().unwrap().push(LoginAttempt {
            id: Uuid::new_v4(),
            user_id: attempt.user_id,
            email_tried: attempt.email_tried,
            success: attempt.success,
            reason: attempt.reason.as_str().into(),
            ip: attempt.ip,
            created_at: at,
        });
    }

    pub fn rows(&self) -> Vec<LoginAttempt> {
        self.rows.lock().unwrap().clone()
    }
}

#[async_trait]
impl LoginAttemptStore for MemoryAttemptStore {
    async fn insert(&self, attempt: NewLoginAttempt) -> anyhow::Result<()> {
        self.insert_at(attempt, OffsetDateTime::now_utc());
        Ok(())
    }

    async fn failed_since(&self, email: &str, since: OffsetDateTime) -> anyhow::Result<AttemptStats> {
        let rows = self.rows.lock().unwrap();
        let matching = rows
            .iter()
            .filter(|a| a.email_tried == email && !a.success && a.created_at >= since);
        Ok(matching.fold(AttemptStats::default(), |acc, a| AttemptStats {
            count: acc.count + 1,
            oldest: Some(acc.oldest.map_or(a.created_at, |o| o.min(a.created_at))),
        }))
    }

    async fn list(&self, filter: &AttemptFilter, page: PageQuery) -> anyhow::Result<Page<LoginAttempt>> {
        let mut rows: Vec<LoginAttempt> = self
            .rows()
            .into_iter()
            .filter(|a| filter.email.as_deref().map_or(true, |e| a.email_tried == e))
            .filter(|a| filter.user_id.map_or(true, |u| a.user_id == Some(u)))
            .collect();
        rows.reverse();
        Ok(paginate(&rows, page))
    }
}

#[derive(Default)]
pub struct MemoryAuditStore {
    rows: Mutex<Vec<AuditLog>>,
}

impl MemoryAuditStore {
    pub fn insert_at(&self, entry: NewAuditLog, at: OffsetDateTime) {
        self.rows.lock().unwrap().push(AuditLog {
            id: Uuid::new_v4(),
            user_id: entry.user_id,
            action: entry.action.as_str().into(),
            resource: entry.resource.into(),
            success: entry.success,
            details: entry.details,
            ip: entry.ip,
            user_agent: entry.user_agent,
            created_at: at,
        });
    }

    pub fn rows(&self) -> Vec<AuditLog> {
        self.rows.lock().unwrap().clone()
    }

    pub fn actions(&self) -> Vec<String> {
        self.rows().into_iter().map(|r| r.action).collect()
    }

    pub fn count(&self, action: AuditAction) -> usize {
        self.rows()
            .iter()
            .filter(|r| r.action == action.as_str())
            .count()
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn insert(&self, entry: NewAuditLog) -> anyhow::Result<()> {
        self.insert_at(entry, OffsetDateTime::now_utc());
        Ok(())
    }

    async fn count_since(&self, ip: &str, action: AuditAction, since: OffsetDateTime) -> anyhow::Result<i64> {
        Ok(self
            .rows()
            .iter()
            .filter(|r| r.ip.as_deref() == Some(ip) && r.action == action.as_str() && r.created_at >= since)
            .count() as i64)
    }

    async fn list(&self, filter: &AuditFilter, page: PageQuery) -> anyhow::Result<Page<AuditLog>> {
        let mut rows: Vec<AuditLog> = self
            .rows()
            .into_iter()
            .filter(|r| filter.user_id.map_or(true, |u| r.user_id == Some(u)))
            .filter(|r| filter.action.as_deref().map_or(true, |a| r.action == a))
            .filter(|r| filter.resource.as_deref().map_or(true, |res| r.resource == res))
            .collect();
        rows.reverse();
        Ok(paginate(&rows, page))
    }
}

pub struct FailingAuditStore;

#[async_trait]
impl AuditStore for FailingAuditStore {
    async fn insert(&self, _entry: NewAuditLog) -> anyhow::Result<()> {
        anyhow::bail!("audit_logs unavailable")
    }

    async fn count_since(&self, _ip: &str, _action: AuditAction, _since: OffsetDateTime) -> anyhow::Result<i64> {
        anyhow::bail!("audit_logs unavailable")
    }

    async fn list(&self, _filter: &AuditFilter, _page: PageQuery) -> anyhow::Result<Page<AuditLog>> {
        anyhow::bail!("audit_logs unavailable")
    }
}

pub struct FailingAttemptStore;

#[async_trait]
impl LoginAttemptStore for FailingAttemptStore {
    async fn insert(&self, _attempt: NewLoginAttempt) -> anyhow::Result<()> {
        anyhow::bail!("login_attempts unavailable")
    }

    async fn failed_since(&self, _email: &str, _since: OffsetDateTime) -> anyhow::Result<AttemptStats> {
        anyhow::bail!("login_attempts unavailable")
    }

    async fn list(&self, _filter: &AttemptFilter, _page: PageQuery) -> anyhow::Result<Page<LoginAttempt>> {
        anyhow::bail!("login_attempts unavailable")
    }
}

// ---------------------------------------------------------------------------
// wiring

/// A fully wired state whose collaborators stay reachable for assertions.
pub struct TestApp {
    pub state: AppState,
    pub identity: Arc<FakeIdentityProvider>,
    pub profiles: Arc<MemoryProfileStore>,
    pub attempts: Arc<MemoryAttemptStore>,
    pub audit: Arc<MemoryAuditStore>,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_config(AppConfig::for_tests())
    }

    pub fn with_config(config: AppConfig) -> Self {
        let identity = Arc::new(FakeIdentityProvider::default());
        let profiles = Arc::new(MemoryProfileStore::default());
        let attempts = Arc::new(MemoryAttemptStore::default());
        let audit = Arc::new(MemoryAuditStore::default());
        let state = AppState::from_parts(
            Arc::new(config),
            identity.clone(),
            profiles.clone(),
            attempts.clone(),
            audit.clone(),
        );
        Self {
            state,
            identity,
            profiles,
            attempts,
            audit,
        }
    }

    pub fn router(&self) -> Router {
        crate::app::build_app(self.state.clone())
    }

    /// Confirmed account with a profile.
    pub async fn seed_user(&self, email: &str, password: &str, role: Role) -> Uuid {
        let user_id = self.identity.add_account(email, password, true);
        self.profiles
            .create(NewProfile {
                user_id,
                display_name: email.split('@').next().unwrap_or(email).into(),
                full_name: None,
                role,
            })
            .await
            .unwrap();
        user_id
    }

    /// Seeded user plus a live access token.
    pub async fn signed_in(&self, email: &str, role: Role) -> (Uuid, String) {
        let user_id = self.seed_user(email, "correct-horse-1", role).await;
        let token = self.identity.issue(user_id).access_token;
        (user_id, token)
    }
}

/// Request as seen from the socket peer `TEST_IP`, carrying a forwarded-for
/// header that matches it.
pub fn json_request(method: &str, uri: &str, token: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("x-forwarded-for", TEST_IP)
        .header(header::USER_AGENT, "foodorder-tests");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    let mut req = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let peer: IpAddr = TEST_IP.parse().unwrap();
    req.extensions_mut()
        .insert(ConnectInfo(SocketAddr::new(peer, 40_000)));
    req
}

pub async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let res = app.clone().oneshot(req).await.unwrap();
    let status = res.status();
    let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}
