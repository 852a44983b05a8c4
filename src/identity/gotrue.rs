use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use sqlx::PgPool;
use time::OffsetDateTime;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    jwt::TokenVerifier, Identity, IdentityError, IdentityProvider, SessionTokens, SignIn, SignUp,
    SignUpMetadata,
};
use crate::config::SupabaseConfig;

/// GoTrue (Supabase Auth) REST client. The administrative email lookup reads
/// `auth.users` directly because the provider and this service share one
/// Postgres database.
#[derive(Clone)]
pub struct GoTrueProvider {
    http: Client,
    base_url: String,
    anon_key: String,
    service_role_key: String,
    verifier: Option<TokenVerifier>,
    db: PgPool,
}

#[derive(Debug, Deserialize)]
struct GoTrueUser {
    id: Uuid,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    email_confirmed_at: Option<String>,
    #[serde(default)]
    confirmed_at: Option<String>,
}

impl From<GoTrueUser> for Identity {
    fn from(u: GoTrueUser) -> Self {
        Identity {
            id: u.id,
            email: u.email.unwrap_or_default(),
            email_confirmed: u.email_confirmed_at.is_some() || u.confirmed_at.is_some(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GoTrueSession {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<i64>,
    user: GoTrueUser,
}

impl GoTrueSession {
    fn split(self) -> (Identity, SessionTokens) {
        let expires_at = self.expires_at.unwrap_or_else(|| {
            OffsetDateTime::now_utc().unix_timestamp() + self.expires_in.unwrap_or(3600)
        });
        let tokens = SessionTokens {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at,
            token_type: self.token_type.unwrap_or_else(|| "bearer".into()),
        };
        (self.user.into(), tokens)
    }
}

/// Sign-up answers with a full session when auto-confirm is on and with the
/// bare user otherwise.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SignUpBody {
    Session(GoTrueSession),
    User(GoTrueUser),
}

#[derive(Debug, Deserialize)]
struct GeneratedLink {
    action_link: String,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl ErrorBody {
    fn code(&self) -> &str {
        self.error_code
            .as_deref()
            .or(self.error.as_deref())
            .unwrap_or_default()
    }

    fn text(&self) -> String {
        self.msg
            .as_deref()
            .or(self.error_description.as_deref())
            .or(self.message.as_deref())
            .or(self.error.as_deref())
            .unwrap_or("unknown error")
            .to_string()
    }
}

/// Non-2xx answer from the provider.
struct Failure {
    status: StatusCode,
    body: ErrorBody,
}

impl Failure {
    fn mentions(&self, needle: &str) -> bool {
        self.body.code().to_ascii_lowercase().contains(needle)
            || self.body.text().to_ascii_lowercase().contains(needle)
    }

    /// Generic mapping; call sites refine the statuses they care about.
    fn into_error(self) -> IdentityError {
        if self.status == StatusCode::TOO_MANY_REQUESTS {
            return IdentityError::RateLimited(self.body.text());
        }
        if self.status.is_server_error() {
            return IdentityError::Unavailable(anyhow::anyhow!(
                "identity provider answered {}: {}",
                self.status,
                self.body.text()
            ));
        }
        IdentityError::Rejected(self.body.text())
    }
}

impl GoTrueProvider {
    pub fn new(config: &SupabaseConfig, db: PgPool) -> anyhow::Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("foodorder/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("build http client")?;
        Ok(Self {
            http,
            base_url: format!("{}/auth/v1", config.url),
            anon_key: config.anon_key.clone(),
            service_role_key: config.service_role_key.clone(),
            verifier: config.jwt_secret.as_deref().map(TokenVerifier::new),
            db,
        })
    }

    fn public(&self, req: RequestBuilder) -> RequestBuilder {
        req.header("apikey", &self.anon_key)
    }

    fn admin(&self, req: RequestBuilder) -> RequestBuilder {
        req.header("apikey", &self.service_role_key)
            .bearer_auth(&self.service_role_key)
    }

    async fn send(&self, req: RequestBuilder, what: &'static str) -> Result<Response, Failure> {
        let res = req.send().await.map_err(|e| {
            warn!(error = %e, what, "identity provider request failed");
            Failure {
                status: StatusCode::BAD_GATEWAY,
                body: ErrorBody {
                    msg: Some(format!("{what}: {e}")),
                    ..ErrorBody::default()
                },
            }
        })?;

        if res.status().is_success() {
            debug!(what, status = %res.status(), "identity provider ok");
            return Ok(res);
        }

        let status = res.status();
        let body = res.json::<ErrorBody>().await.unwrap_or_default();
        debug!(what, %status, code = body.code(), "identity provider refused");
        Err(Failure { status, body })
    }

    async fn token_grant(
        &self,
        grant_type: &str,
        body: serde_json::Value,
    ) -> Result<GoTrueSession, Failure> {
        let req = self
            .public(self.http.post(format!("{}/token", self.base_url)))
            .query(&[("grant_type", grant_type)])
            .json(&body);
        let res = self.send(req, "token").await?;
        res.json::<GoTrueSession>().await.map_err(|e| Failure {
            status: StatusCode::BAD_GATEWAY,
            body: ErrorBody {
                msg: Some(format!("decode session: {e}")),
                ..ErrorBody::default()
            },
        })
    }
}

async fn decode<T: serde::de::DeserializeOwned>(
    res: Response,
    what: &'static str,
) -> Result<T, IdentityError> {
    res.json::<T>()
        .await
        .with_context(|| format!("decode {what} response"))
        .map_err(IdentityError::Unavailable)
}

#[async_trait]
impl IdentityProvider for GoTrueProvider {
    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<SignIn, IdentityError> {
        let session = self
            .token_grant("password", json!({ "email": email, "password": password }))
            .await
            .map_err(|f| {
                if f.mentions("email_not_confirmed") || f.mentions("email not confirmed") {
                    IdentityError::EmailNotConfirmed
                } else if f.status == StatusCode::BAD_REQUEST || f.status == StatusCode::UNAUTHORIZED
                {
                    IdentityError::InvalidCredentials
                } else {
                    f.into_error()
                }
            })?;
        let (identity, session) = session.split();
        Ok(SignIn { identity, session })
    }

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: &SignUpMetadata,
    ) -> Result<SignUp, IdentityError> {
        let req = self
            .public(self.http.post(format!("{}/signup", self.base_url)))
            .json(&json!({ "email": email, "password": password, "data": metadata }));
        let res = self.send(req, "signup").await.map_err(Failure::into_error)?;

        Ok(match decode::<SignUpBody>(res, "signup").await? {
            SignUpBody::Session(s) => {
                let (identity, session) = s.split();
                SignUp {
                    identity,
                    session: Some(session),
                }
            }
            SignUpBody::User(u) => SignUp {
                identity: u.into(),
                session: None,
            },
        })
    }

    async fn get_user(&self, access_token: &str) -> Result<Identity, IdentityError> {
        if let Some(verifier) = &self.verifier {
            verifier.verify(access_token)?;
        }

        let req = self
            .public(self.http.get(format!("{}/user", self.base_url)))
            .bearer_auth(access_token);
        let res = self.send(req, "user").await.map_err(|f| {
            if f.status == StatusCode::UNAUTHORIZED || f.status == StatusCode::FORBIDDEN {
                if f.mentions("expired") {
                    IdentityError::TokenExpired
                } else if f.mentions("malformed") || f.mentions("unable to parse") || f.mentions("bad_jwt") {
                    IdentityError::InvalidToken
                } else {
                    IdentityError::Rejected(f.body.text())
                }
            } else {
                f.into_error()
            }
        })?;
        Ok(decode::<GoTrueUser>(res, "user").await?.into())
    }

    async fn refresh_session(&self, refresh_token: &str) -> Result<SessionTokens, IdentityError> {
        let session = self
            .token_grant("refresh_token", json!({ "refresh_token": refresh_token }))
            .await
            .map_err(Failure::into_error)?;
        Ok(session.split().1)
    }

    async fn sign_out(&self, access_token: &str) -> Result<(), IdentityError> {
        let req = self
            .public(self.http.post(format!("{}/logout", self.base_url)))
            .bearer_auth(access_token);
        self.send(req, "logout").await.map_err(Failure::into_error)?;
        Ok(())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<Identity>, IdentityError> {
        let row = sqlx::query_as::<_, (Uuid, Option<String>, bool)>(
            r#"
            SELECT id, email, email_confirmed_at IS NOT NULL
            FROM auth.users
            WHERE lower(email) = lower($1)
            LIMIT 1
            "#,
        )
        .bind(email)
        .fetch_optional(&self.db)
        .await
        .context("lookup auth.users by email")?;

        Ok(row.map(|(id, email, email_confirmed)| Identity {
            id,
            email: email.unwrap_or_default(),
            email_confirmed,
        }))
    }

    async fn update_password(&self, user_id: Uuid, new_password: &str) -> Result<(), IdentityError> {
        let req = self
            .admin(self.http.put(format!("{}/admin/users/{}", self.base_url, user_id)))
            .json(&json!({ "password": new_password }));
        self.send(req, "admin update user")
            .await
            .map_err(Failure::into_error)?;
        Ok(())
    }

    async fn send_password_reset(&self, email: &str, redirect_to: &str) -> Result<(), IdentityError> {
        let req = self
            .public(self.http.post(format!("{}/recover", self.base_url)))
            .query(&[("redirect_to", redirect_to)])
            .json(&json!({ "email": email }));
        self.send(req, "recover").await.map_err(Failure::into_error)?;
        Ok(())
    }

    async fn generate_recovery_link(
        &self,
        email: &str,
        redirect_to: &str,
    ) -> Result<String, IdentityError> {
        let req = self
            .admin(self.http.post(format!("{}/admin/generate_link", self.base_url)))
            .json(&json!({ "type": "recovery", "email": email, "redirect_to": redirect_to }));
        let res = self
            .send(req, "generate link")
            .await
            .map_err(Failure::into_error)?;
        Ok(decode::<GeneratedLink>(res, "generate link").await?.action_link)
    }
}
