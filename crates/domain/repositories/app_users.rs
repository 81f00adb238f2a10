use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mockall::automock;
use uuid::Uuid;

use crate::domain::entities::app_users::UserEntitlementEntity;

#[automock]
#[async_trait]
pub trait EntitlementRepository {
    /// Blind overwrite of the entitlement columns.
    async fn apply_entitlement(
        &self,
        user_id: Uuid,
        expires_at: DateTime<Utc>,
        paid_at: DateTime<Utc>,
    ) -> Result<()>;

    async fn find_entitlement(&self, user_id: Uuid) -> Result<Option<UserEntitlementEntity>>;
}
