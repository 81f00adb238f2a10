use chrono::{DateTime, Utc};
use diesel::prelude::*;
use uuid::Uuid;

use crate::{
    domain::value_objects::enums::subscription_statuses::SubscriptionStatus,
    infra::db::postgres::schema::subscriptions,
};

#[derive(Debug, Clone, PartialEq, Identifiable, Selectable, Queryable)]
#[diesel(table_name = subscriptions)]
pub struct SubscriptionEntity {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan_id: Uuid,
    pub status: String,
    pub starts_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub quoted_amount_minor: i32,
    pub amount_minor: i32,
    pub amount_mismatch: bool,
    pub phone_used: String,
    pub checkout_request_id: Option<String>,
    pub merchant_request_id: Option<String>,
    pub provider_receipt: Option<String>,
    pub payer_phone: Option<String>,
    pub provider_transaction_date: Option<String>,
    pub failure_reason: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SubscriptionEntity {
    pub fn status(&self) -> SubscriptionStatus {
        SubscriptionStatus::from_db(&self.status)
    }

    /// Stored status with expiry applied: an `active` row past its expiry
    /// reads as `expired`. Nothing writes `expired` back.
    pub fn effective_status(&self, now: DateTime<Utc>) -> SubscriptionStatus {
        match self.status() {
            SubscriptionStatus::Active if self.expires_at <= now => SubscriptionStatus::Expired,
            status => status,
        }
    }

    pub fn is_entitling(&self, now: DateTime<Utc>) -> bool {
        self.effective_status(now) == SubscriptionStatus::Active
    }
}

#[derive(Debug, Clone, PartialEq, Insertable)]
#[diesel(table_name = subscriptions)]
pub struct InsertSubscriptionEntity {
    pub user_id: Uuid,
    pub plan_id: Uuid,
    pub status: String,
    pub starts_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub quoted_amount_minor: i32,
    pub amount_minor: i32,
    pub phone_used: String,
}
