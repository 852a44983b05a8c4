use anyhow::Context;
use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder};
use time::OffsetDateTime;

use super::{AttemptFilter, AttemptStats, LoginAttempt, LoginAttemptStore, NewLoginAttempt};
use crate::pagination::{Page, PageQuery};

#[derive(Clone)]
pub struct PgLoginAttemptStore {
    db: PgPool,
}

impl PgLoginAttemptStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

fn push_filter(q: &mut QueryBuilder<'_, Postgres>, filter: &AttemptFilter) {
    let mut sep = " WHERE ";
    if let Some(email) = filter.email.as_deref().filter(|e| !e.is_empty()) {
        q.push(sep).push("email_tried = ").push_bind(email.to_lowercase());
        sep = " AND ";
    }
    if let Some(user_id) = filter.user_id {
        q.push(sep).push("user_id = ").push_bind(user_id);
    }
}

#[async_trait]
impl LoginAttemptStore for PgLoginAttemptStore {
    async fn insert(&self, attempt: NewLoginAttempt) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO login_attempts (user_id, email_tried, success, reason, ip)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(attempt.user_id)
        .bind(attempt.email_tried)
        .bind(attempt.success)
        .bind(attempt.reason.as_str())
        .bind(attempt.ip)
        .execute(&self.db)
        .await
        .context("insert login attempt")?;
        Ok(())
    }

    async fn failed_since(&self, email: &str, since: OffsetDateTime) -> anyhow::Result<AttemptStats> {
        let (count, oldest) = sqlx::query_as::<_, (i64, Option<OffsetDateTime>)>(
            r#"
            SELECT COUNT(*), MIN(created_at)
              FROM login_attempts
             WHERE email_tried = $1
               AND success = FALSE
               AND created_at >= $2
            "#,
        )
        .bind(email)
        .bind(since)
        .fetch_one(&self.db)
        .await
        .context("count failed login attempts")?;
        Ok(AttemptStats { count, oldest })
    }

    async fn list(&self, filter: &AttemptFilter, page: PageQuery) -> anyhow::Result<Page<LoginAttempt>> {
        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM login_attempts");
        push_filter(&mut count, filter);
        let total: i64 = count
            .build_query_scalar()
            .fetch_one(&self.db)
            .await
            .context("count login attempts")?;

        let mut query = QueryBuilder::<Postgres>::new(
            "SELECT id, user_id, email_tried, success, reason, ip, created_at FROM login_attempts",
        );
        push_filter(&mut query, filter);
        query
            .push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(page.limit)
            .push(" OFFSET ")
            .push_bind(page.offset());
        let items = query
            .build_query_as::<LoginAttempt>()
            .fetch_all(&self.db)
            .await
            .context("list login attempts")?;

        Ok(Page { items, total })
    }
}
