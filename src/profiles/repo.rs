use anyhow::Context;
use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{NewProfile, Profile, ProfileFilter, ProfileStore, ProfileUpdate};
use crate::pagination::{Page, PageQuery};

const PROFILE_COLUMNS: &str = "id, user_id, display_name, full_name, role, failed_attempts, \
     lock_until, password_changed_at, created_at, updated_at";

#[derive(Clone)]
pub struct PgProfileStore {
    db: PgPool,
}

impl PgProfileStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

/// Substring pattern for `ILIKE ... ESCAPE '\'`; wildcards in the input
/// match literally.
fn contains_pattern(search: &str) -> String {
    let mut pattern = String::with_capacity(search.len() + 2);
    pattern.push('%');
    for c in search.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

fn push_filter(q: &mut QueryBuilder<'_, Postgres>, filter: &ProfileFilter) {
    if let Some(search) = filter.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        let pattern = contains_pattern(search);
        q.push(" WHERE (display_name ILIKE ")
            .push_bind(pattern.clone())
            .push(r" ESCAPE '\' OR full_name ILIKE ")
            .push_bind(pattern)
            .push(r" ESCAPE '\')");
    }
}

#[async_trait]
impl ProfileStore for PgProfileStore {
    async fn find_by_user_id(&self, user_id: Uuid) -> anyhow::Result<Option<Profile>> {
        let profile = sqlx::query_as::<_, Profile>(&format!(
            "SELECT {PROFILE_COLUMNS} FROM profiles WHERE user_id = $1"
        ))
        .bind(user_id)
        .fetch_optional(&self.db)
        .await
        .context("select profile")?;
        Ok(profile)
    }

    async fn create(&self, new: NewProfile) -> anyhow::Result<Profile> {
        let profile = sqlx::query_as::<_, Profile>(&format!(
            r#"
            INSERT INTO profiles (user_id, display_name, full_name, role)
            VALUES ($1, $2, $3, $4)
            RETURNING {PROFILE_COLUMNS}
            "#
        ))
        .bind(new.user_id)
        .bind(new.display_name)
        .bind(new.full_name)
        .bind(new.role)
        .fetch_one(&self.db)
        .await
        .context("insert profile")?;
        Ok(profile)
    }

    async fn update_self(
        &self,
        user_id: Uuid,
        update: ProfileUpdate,
    ) -> anyhow::Result<Option<Profile>> {
        let profile = sqlx::query_as::<_, Profile>(&format!(
            r#"
            UPDATE profiles
               SET display_name = COALESCE($2, display_name),
                   full_name    = COALESCE($3, full_name),
                   updated_at   = now()
             WHERE user_id = $1
            RETURNING {PROFILE_COLUMNS}
            "#
        ))
        .bind(user_id)
        .bind(update.display_name)
        .bind(update.full_name)
        .fetch_optional(&self.db)
        .await
        .context("update profile")?;
        Ok(profile)
    }

    async fn set_lock_state(
        &self,
        user_id: Uuid,
        failed_attempts: i32,
        lock_until: Option<OffsetDateTime>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE profiles
               SET failed_attempts = $2, lock_until = $3, updated_at = now()
             WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(failed_attempts)
        .bind(lock_until)
        .execute(&self.db)
        .await
        .context("update lock state")?;
        Ok(())
    }

    async fn mark_password_changed(&self, user_id: Uuid, at: OffsetDateTime) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE profiles
               SET password_changed_at = $2,
                   failed_attempts = 0,
                   lock_until = NULL,
                   updated_at = now()
             WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(at)
        .execute(&self.db)
        .await
        .context("update password_changed_at")?;
        Ok(())
    }

    async fn list(&self, filter: &ProfileFilter, page: PageQuery) -> anyhow::Result<Page<Profile>> {
        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM profiles");
        push_filter(&mut count, filter);
        let total: i64 = count
            .build_query_scalar()
            .fetch_one(&self.db)
            .await
            .context("count profiles")?;

        let mut query = QueryBuilder::<Postgres>::new(format!("SELECT {PROFILE_COLUMNS} FROM profiles"));
        push_filter(&mut query, filter);
        query
            .push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(page.limit)
            .push(" OFFSET ")
            .push_bind(page.offset());
        let items = query
            .build_query_as::<Profile>()
            .fetch_all(&self.db)
            .await
            .context("list profiles")?;

        Ok(Page { items, total })
    }

    async fn ping(&self) -> anyhow::Result<()> {
        sqlx::query("SELECT 1 FROM profiles LIMIT 1")
            .execute(&self.db)
            .await
            .context("ping profiles")?;
        Ok(())
    }
}
