use std::sync::Arc;

use sqlx::{postgres::PgPoolOptions, PgPool};

use crate::{
    attempts::{LoginAttemptStore, PgLoginAttemptStore},
    audit::{AuditLogger, AuditStore, PgAuditStore},
    config::AppConfig,
    identity::{GoTrueProvider, IdentityProvider},
    profiles::{PgProfileStore, ProfileStore},
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub identity: Arc<dyn IdentityProvider>,
    pub profiles: Arc<dyn ProfileStore>,
    pub attempts: Arc<dyn LoginAttemptStore>,
    pub audit: AuditLogger,
}

impl AppState {
    /// Connect to Postgres and wire the production collaborators. The pool is
    /// returned as well so the caller can run migrations on it.
    pub async fn init() -> anyhow::Result<(Self, PgPool)> {
        let config = Arc::new(AppConfig::from_env()?);

        let db = PgPoolOptions::new()
            .max_connections(10)
            .connect(&config.database_url)
            .await?;

        let identity = Arc::new(GoTrueProvider::new(&config.supabase, db.clone())?);
        let state = Self::from_parts(
            config,
            identity,
            Arc::new(PgProfileStore::new(db.clone())),
            Arc::new(PgLoginAttemptStore::new(db.clone())),
            Arc::new(PgAuditStore::new(db.clone())),
        );
        Ok((state, db))
    }

    pub fn from_parts(
        config: Arc<AppConfig>,
        identity: Arc<dyn IdentityProvider>,
        profiles: Arc<dyn ProfileStore>,
        attempts: Arc<dyn LoginAttemptStore>,
        audit: Arc<dyn AuditStore>,
    ) -> Self {
        Self {
            config,
            identity,
            profiles,
            attempts,
            audit: AuditLogger::new(audit),
        }
    }
}
