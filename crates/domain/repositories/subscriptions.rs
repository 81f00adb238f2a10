use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mockall::automock;
use uuid::Uuid;

use crate::domain::{
    entities::subscriptions::{InsertSubscriptionEntity, SubscriptionEntity},
    value_objects::{
        mpesa_callback::ConfirmedPayment,
        subscriptions::{PendingCreation, StatusTransition},
    },
};

#[automock]
#[async_trait]
pub trait SubscriptionRepository {
    /// Inserts a pending row unless the user already holds a pending or
    /// non-expired active subscription. Serialized per user.
    async fn create_pending(
        &self,
        insert_subscription_entity: InsertSubscriptionEntity,
        now: DateTime<Utc>,
    ) -> Result<PendingCreation>;

    async fn find_by_id(&self, subscription_id: Uuid) -> Result<Option<SubscriptionEntity>>;

    async fn find_by_checkout_request_id(
        &self,
        checkout_request_id: &str,
    ) -> Result<Option<SubscriptionEntity>>;

    /// Pending or non-expired active subscription of the user, if any.
    async fn find_current_subscription(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<SubscriptionEntity>>;

    /// Most recently expiring active subscription that has not expired yet.
    async fn find_latest_active_subscription(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<SubscriptionEntity>>;

    async fn attach_checkout_request(
        &self,
        subscription_id: Uuid,
        checkout_request_id: &str,
        merchant_request_id: Option<String>,
    ) -> Result<()>;

    /// `pending -> active` compare-and-set. Stores the confirmed amount and
    /// flags a mismatch against the stored one.
    async fn transition_to_active(
        &self,
        subscription_id: Uuid,
        payment: ConfirmedPayment,
        now: DateTime<Utc>,
    ) -> Result<StatusTransition>;

    /// `pending -> failed` compare-and-set.
    async fn transition_to_failed(
        &self,
        subscription_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<StatusTransition>;

    async fn list_stale_pending(
        &self,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<SubscriptionEntity>>;
}
