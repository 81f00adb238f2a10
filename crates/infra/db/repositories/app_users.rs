use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::{RunQueryDsl, prelude::*, update};
use std::sync::Arc;
use uuid::Uuid;

use crate::domain;
use crate::infra::db::postgres::{postgres_connection::PgPoolSquad, schema::users};
use domain::{
    entities::app_users::UserEntitlementEntity, repositories::app_users::EntitlementRepository,
};

pub struct EntitlementPostgres {
    db_pool: Arc<PgPoolSquad>,
}

impl EntitlementPostgres {
    pub fn new(db_pool: Arc<PgPoolSquad>) -> Self {
        Self { db_pool }
    }
}

#[async_trait]
impl EntitlementRepository for EntitlementPostgres {
    async fn apply_entitlement(
        &self,
        user_id: Uuid,
        expires_at: DateTime<Utc>,
        paid_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut conn = Arc::clone(&self.db_pool).get()?;

        let updated = update(users::table.find(user_id))
            .set((
                users::has_subscription.eq(true),
                users::subscription_expiry.eq(Some(expires_at)),
                users::last_payment_date.eq(Some(paid_at)),
            ))
            .execute(&mut conn)?;

        if updated == 0 {
            bail!("user {} not found while applying entitlement", user_id);
        }

        Ok(())
    }

    async fn find_entitlement(&self, user_id: Uuid) -> Result<Option<UserEntitlementEntity>> {
        let mut conn = Arc::clone(&self.db_pool).get()?;

        let entitlement = users::table
            .find(user_id)
            .select(UserEntitlementEntity::as_select())
            .first::<UserEntitlementEntity>(&mut conn)
            .optional()?;

        Ok(entitlement)
    }
}
