use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::pagination::{Page, PageQuery};

mod repo;
pub mod repo_types;

pub use repo::PgProfileStore;
pub use repo_types::{NewProfile, Profile, ProfileFilter, ProfileUpdate, Role};

#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn find_by_user_id(&self, user_id: Uuid) -> anyhow::Result<Option<Profile>>;

    async fn create(&self, new: NewProfile) -> anyhow::Result<Profile>;

    /// Self-service update; returns `None` when no profile exists.
    async fn update_self(&self, user_id: Uuid, update: ProfileUpdate)
        -> anyhow::Result<Option<Profile>>;

    async fn set_lock_state(
        &self,
        user_id: Uuid,
        failed_attempts: i32,
        lock_until: Option<OffsetDateTime>,
    ) -> anyhow::Result<()>;

    async fn mark_password_changed(&self, user_id: Uuid, at: OffsetDateTime) -> anyhow::Result<()>;

    async fn list(&self, filter: &ProfileFilter, page: PageQuery) -> anyhow::Result<Page<Profile>>;

    async fn ping(&self) -> anyhow::Result<()>;
}
