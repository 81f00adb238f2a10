use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{
    entities::subscriptions::SubscriptionEntity,
    value_objects::{
        enums::subscription_statuses::SubscriptionStatus, phone_numbers::mask_phone,
        plans::PlanDto,
    },
};

/// Reference sent to the provider with every payment request.
pub fn account_reference(subscription_id: Uuid) -> String {
    format!("SUB-{subscription_id}")
}

/// Whole days left before `expires_at`, never negative.
pub fn days_remaining(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (expires_at - now).num_days().max(0)
}

/// Result of inserting a pending subscription under the per-user lock.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingCreation {
    Created(SubscriptionEntity),
    /// The user already holds a pending or non-expired active subscription.
    Conflict(SubscriptionEntity),
}

/// Result of a compare-and-set on `status = 'pending'`.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusTransition {
    Applied(SubscriptionEntity),
    /// The row had already left `pending`; carries it unchanged.
    InvalidState(SubscriptionEntity),
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscribeRequest {
    pub plan_id: Uuid,
    #[serde(default)]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SubscribeResponse {
    pub checkout_request_id: String,
    pub masked_phone: String,
    pub amount: i32,
    pub plan_name: String,
    pub message: String,
    pub customer_message: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CheckStatusQuery {
    #[serde(
        default,
        alias = "correlationId",
        alias = "correlation_id",
        alias = "checkoutRequestId"
    )]
    pub checkout_id: Option<String>,
}

/// Client facing view of a ledger row. Phones are masked.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SubscriptionDto {
    pub plan_id: Uuid,
    pub status: SubscriptionStatus,
    pub starts_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub amount: i32,
    pub amount_mismatch: bool,
    pub checkout_request_id: Option<String>,
    pub receipt: Option<String>,
    pub masked_phone: String,
    pub failure_reason: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl SubscriptionDto {
    pub fn from_entity(entity: &SubscriptionEntity, now: DateTime<Utc>) -> Self {
        Self {
            plan_id: entity.plan_id,
            status: entity.effective_status(now),
            starts_at: entity.starts_at,
            expires_at: entity.expires_at,
            amount: entity.amount_minor,
            amount_mismatch: entity.amount_mismatch,
            checkout_request_id: entity.checkout_request_id.clone(),
            receipt: entity.provider_receipt.clone(),
            masked_phone: mask_phone(&entity.phone_used),
            failure_reason: entity.failure_reason.clone(),
            paid_at: entity.paid_at,
            created_at: entity.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EntitlementStatusDto {
    pub has_subscription: bool,
    pub is_active: bool,
    pub plan: Option<PlanDto>,
    pub expires_at: Option<DateTime<Utc>>,
    pub days_remaining: i64,
    pub subscription: Option<SubscriptionDto>,
    pub message: String,
}

impl EntitlementStatusDto {
    pub fn none() -> Self {
        Self {
            has_subscription: false,
            is_active: false,
            plan: None,
            expires_at: None,
            days_remaining: 0,
            subscription: None,
            message: "No active subscription found".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PaymentStatusDto {
    pub status: SubscriptionStatus,
    pub data: SubscriptionDto,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StalePendingQuery {
    pub older_than_minutes: Option<i64>,
}

/// Admin view of a subscription stuck in `pending`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StalePendingDto {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan_id: Uuid,
    pub account_reference: String,
    pub checkout_request_id: Option<String>,
    pub masked_phone: String,
    pub amount: i32,
    pub created_at: DateTime<Utc>,
}

impl From<SubscriptionEntity> for StalePendingDto {
    fn from(value: SubscriptionEntity) -> Self {
        Self {
            id: value.id,
            user_id: value.user_id,
            plan_id: value.plan_id,
            account_reference: account_reference(value.id),
            checkout_request_id: value.checkout_request_id,
            masked_phone: mask_phone(&value.phone_used),
            amount: value.amount_minor,
            created_at: value.created_at,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FailSubscriptionRequest {
    #[serde(default)]
    pub reason: Option<String>,
}
