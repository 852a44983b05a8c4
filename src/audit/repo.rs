use anyhow::Context;
use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder};
use time::OffsetDateTime;

use super::{AuditAction, AuditFilter, AuditLog, AuditStore, NewAuditLog};
use crate::pagination::{Page, PageQuery};

#[derive(Clone)]
pub struct PgAuditStore {
    db: PgPool,
}

impl PgAuditStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

fn push_filter(q: &mut QueryBuilder<'_, Postgres>, filter: &AuditFilter) {
    let mut sep = " WHERE ";
    if let Some(user_id) = filter.user_id {
        q.push(sep).push("user_id = ").push_bind(user_id);
        sep = " AND ";
    }
    if let Some(action) = filter.action.as_deref().filter(|a| !a.is_empty()) {
        q.push(sep).push("action = ").push_bind(action.to_string());
        sep = " AND ";
    }
    if let Some(resource) = filter.resource.as_deref().filter(|r| !r.is_empty()) {
        q.push(sep).push("resource = ").push_bind(resource.to_string());
    }
}

#[async_trait]
impl AuditStore for PgAuditStore {
    async fn insert(&self, entry: NewAuditLog) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_logs (user_id, action, resource, success, details, ip, user_agent)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(entry.user_id)
        .bind(entry.action.as_str())
        .bind(entry.resource)
        .bind(entry.success)
        .bind(entry.details)
        .bind(entry.ip)
        .bind(entry.user_agent)
        .execute(&self.db)
        .await
        .context("insert audit log")?;
        Ok(())
    }

    async fn count_since(
        &self,
        ip: &str,
        action: AuditAction,
        since: OffsetDateTime,
    ) -> anyhow::Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
              FROM audit_logs
             WHERE ip = $1 AND action = $2 AND created_at >= $3
            "#,
        )
        .bind(ip)
        .bind(action.as_str())
        .bind(since)
        .fetch_one(&self.db)
        .await
        .context("count audit logs by ip")?;
        Ok(count)
    }

    async fn list(&self, filter: &AuditFilter, page: PageQuery) -> anyhow::Result<Page<AuditLog>> {
        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM audit_logs");
        push_filter(&mut count, filter);
        let total: i64 = count
            .build_query_scalar()
            .fetch_one(&self.db)
            .await
            .context("count audit logs")?;

        let mut query = QueryBuilder::<Postgres>::new(
            "SELECT id, user_id, action, resource, success, details, ip, user_agent, created_at \
             FROM audit_logs",
        );
        push_filter(&mut query, filter);
        query
            .push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(page.limit)
            .push(" OFFSET ")
            .push_bind(page.offset());
        let items = query
            .build_query_as::<AuditLog>()
            .fetch_all(&self.db)
            .await
            .context("list audit logs")?;

        Ok(Page { items, total })
    }
}
