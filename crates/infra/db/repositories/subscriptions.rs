use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::{RunQueryDsl, insert_into, prelude::*, update};
use std::sync::Arc;
use uuid::Uuid;

use crate::{
    domain,
    infra::db::postgres::{
        postgres_connection::PgPoolSquad,
        schema::{subscriptions, users},
    },
};
use domain::{
    entities::subscriptions::{InsertSubscriptionEntity, SubscriptionEntity},
    repositories::subscriptions::SubscriptionRepository,
    value_objects::{
        enums::subscription_statuses::SubscriptionStatus,
        mpesa_callback::ConfirmedPayment,
        subscriptions::{PendingCreation, StatusTransition},
    },
};

pub struct SubscriptionPostgres {
    db_pool: Arc<PgPoolSquad>,
}

impl SubscriptionPostgres {
    pub fn new(db_pool: Arc<PgPoolSquad>) -> Self {
        Self { db_pool }
    }
}

fn current_subscription(
    conn: &mut PgConnection,
    user_id: Uuid,
    now: DateTime<Utc>,
) -> QueryResult<Option<SubscriptionEntity>> {
    subscriptions::table
        .filter(subscriptions::user_id.eq(user_id))
        .filter(subscriptions::status.eq_any(vec![
            SubscriptionStatus::Pending.to_string(),
            SubscriptionStatus::Active.to_string(),
        ]))
        .filter(subscriptions::expires_at.gt(now))
        .order(subscriptions::created_at.desc())
        .select(SubscriptionEntity::as_select())
        .first::<SubscriptionEntity>(conn)
        .optional()
}

/// Reloads a row whose compare-and-set matched nothing.
fn reload(conn: &mut PgConnection, subscription_id: Uuid) -> QueryResult<SubscriptionEntity> {
    subscriptions::table
        .find(subscription_id)
        .select(SubscriptionEntity::as_select())
        .first::<SubscriptionEntity>(conn)
}

#[async_trait]
impl SubscriptionRepository for SubscriptionPostgres {
    async fn create_pending(
        &self,
        insert_subscription_entity: InsertSubscriptionEntity,
        now: DateTime<Utc>,
    ) -> Result<PendingCreation> {
        let mut conn = Arc::clone(&self.db_pool).get()?;

        let creation = conn.transaction::<PendingCreation, diesel::result::Error, _>(|conn| {
            // The user row is the per-user lock: concurrent creates for the
            // same user queue here, other users are unaffected.
            users::table
                .find(insert_subscription_entity.user_id)
                .select(users::id)
                .for_update()
                .first::<Uuid>(conn)?;

            if let Some(existing) =
                current_subscription(conn, insert_subscription_entity.user_id, now)?
            {
                return Ok(PendingCreation::Conflict(existing));
            }

            let created = insert_into(subscriptions::table)
                .values(&insert_subscription_entity)
                .returning(SubscriptionEntity::as_returning())
                .get_result::<SubscriptionEntity>(conn)?;

            Ok(PendingCreation::Created(created))
        })?;

        Ok(creation)
    }

    async fn find_by_id(&self, subscription_id: Uuid) -> Result<Option<SubscriptionEntity>> {
        let mut conn = Arc::clone(&self.db_pool).get()?;

        let subscription = subscriptions::table
            .find(subscription_id)
            .select(SubscriptionEntity::as_select())
            .first::<SubscriptionEntity>(&mut conn)
            .optional()?;

        Ok(subscription)
    }

    async fn find_by_checkout_request_id(
        &self,
        checkout_request_id: &str,
    ) -> Result<Option<SubscriptionEntity>> {
        let mut conn = Arc::clone(&self.db_pool).get()?;

        let subscription = subscriptions::table
            .filter(subscriptions::checkout_request_id.eq(checkout_request_id))
            .select(SubscriptionEntity::as_select())
            .first::<SubscriptionEntity>(&mut conn)
            .optional()?;

        Ok(subscription)
    }

    async fn find_current_subscription(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<SubscriptionEntity>> {
        let mut conn = Arc::clone(&self.db_pool).get()?;

        Ok(current_subscription(&mut conn, user_id, now)?)
    }

    async fn find_latest_active_subscription(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<SubscriptionEntity>> {
        let mut conn = Arc::clone(&self.db_pool).get()?;

        let subscription = subscriptions::table
            .filter(subscriptions::user_id.eq(user_id))
            .filter(subscriptions::status.eq(SubscriptionStatus::Active.to_string()))
            .filter(subscriptions::expires_at.gt(now))
            .order(subscriptions::expires_at.desc())
            .select(SubscriptionEntity::as_select())
            .first::<SubscriptionEntity>(&mut conn)
            .optional()?;

        Ok(subscription)
    }

    async fn attach_checkout_request(
        &self,
        subscription_id: Uuid,
        checkout_request_id: &str,
        merchant_request_id: Option<String>,
    ) -> Result<()> {
        let mut conn = Arc::clone(&self.db_pool).get()?;

        update(subscriptions::table)
            .filter(subscriptions::id.eq(subscription_id))
            .set((
                subscriptions::checkout_request_id.eq(Some(checkout_request_id)),
                subscriptions::merchant_request_id.eq(merchant_request_id),
                subscriptions::updated_at.eq(Utc::now()),
            ))
            .execute(&mut conn)?;

        Ok(())
    }

    async fn transition_to_active(
        &self,
        subscription_id: Uuid,
        payment: ConfirmedPayment,
        now: DateTime<Utc>,
    ) -> Result<StatusTransition> {
        let mut conn = Arc::clone(&self.db_pool).get()?;

        // SET expressions read the pre-update row, so the mismatch flag
        // compares against the amount stored at creation.
        let activated = update(subscriptions::table)
            .filter(subscriptions::id.eq(subscription_id))
            .filter(subscriptions::status.eq(SubscriptionStatus::Pending.to_string()))
            .set((
                subscriptions::status.eq(SubscriptionStatus::Active.to_string()),
                subscriptions::amount_mismatch
                    .eq(subscriptions::amount_minor.ne(payment.amount_minor)),
                subscriptions::amount_minor.eq(payment.amount_minor),
                subscriptions::provider_receipt.eq(Some(payment.receipt)),
                subscriptions::payer_phone.eq(payment.payer_phone),
                subscriptions::provider_transaction_date.eq(payment.transaction_date),
                subscriptions::paid_at.eq(Some(now)),
                subscriptions::updated_at.eq(now),
            ))
            .returning(SubscriptionEntity::as_returning())
            .get_result::<SubscriptionEntity>(&mut conn)
            .optional()?;

        match activated {
            Some(subscription) => Ok(StatusTransition::Applied(subscription)),
            None => Ok(StatusTransition::InvalidState(reload(
                &mut conn,
                subscription_id,
            )?)),
        }
    }

    async fn transition_to_failed(
        &self,
        subscription_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<StatusTransition> {
        let mut conn = Arc::clone(&self.db_pool).get()?;

        let failed = update(subscriptions::table)
            .filter(subscriptions::id.eq(subscription_id))
            .filter(subscriptions::status.eq(SubscriptionStatus::Pending.to_string()))
            .set((
                subscriptions::status.eq(SubscriptionStatus::Failed.to_string()),
                subscriptions::failure_reason.eq(Some(reason)),
                subscriptions::updated_at.eq(now),
            ))
            .returning(SubscriptionEntity::as_returning())
            .get_result::<SubscriptionEntity>(&mut conn)
            .optional()?;

        match failed {
            Some(subscription) => Ok(StatusTransition::Applied(subscription)),
            None => Ok(StatusTransition::InvalidState(reload(
                &mut conn,
                subscription_id,
            )?)),
        }
    }

    async fn list_stale_pending(
        &self,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<SubscriptionEntity>> {
        let mut conn = Arc::clone(&self.db_pool).get()?;

        let stale = subscriptions::table
            .filter(subscriptions::status.eq(SubscriptionStatus::Pending.to_string()))
            .filter(subscriptions::created_at.lt(created_before))
            .order(subscriptions::created_at.asc())
            .select(SubscriptionEntity::as_select())
            .load::<SubscriptionEntity>(&mut conn)?;

        Ok(stale)
    }
}
