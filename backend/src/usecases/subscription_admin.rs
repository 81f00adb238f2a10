use std::sync::Arc;

use chrono::{Duration, Utc};
use crates::domain::{
    repositories::subscriptions::SubscriptionRepository,
    value_objects::subscriptions::{StalePendingDto, StatusTransition, SubscriptionDto},
};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::usecases::subscriptions::{SubscriptionError, UseCaseResult};

pub const DEFAULT_FAILURE_REASON: &str = "Marked failed by administrator";

/// Manual recovery for subscriptions stuck in `pending`, e.g. when the
/// callback never arrived or landed before the checkout request id was stored.
pub struct SubscriptionAdminUseCase<S>
where
    S: SubscriptionRepository + Send + Sync + 'static,
{
    subscription_repo: Arc<S>,
    default_stale_minutes: i64,
}

impl<S> SubscriptionAdminUseCase<S>
where
    S: SubscriptionRepository + Send + Sync + 'static,
{
    pub fn new(subscription_repo: Arc<S>, default_stale_minutes: i64) -> Self {
        Self {
            subscription_repo,
            default_stale_minutes,
        }
    }

    pub async fn list_stale_pending(
        &self,
        older_than_minutes: Option<i64>,
    ) -> UseCaseResult<Vec<StalePendingDto>> {
        let older_than_minutes = older_than_minutes.unwrap_or(self.default_stale_minutes);
        let created_before = Duration::try_minutes(older_than_minutes)
            .filter(|_| older_than_minutes > 0)
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .ok_or_else(|| {
                SubscriptionError::Validation(
                    "older_than_minutes must be a positive number of minutes".to_string(),
                )
            })?;

        let stale = self
            .subscription_repo
            .list_stale_pending(created_before)
            .await
            .map_err(|err| {
                error!(db_error = ?err, "subscription_admin: failed to list stale pending subscriptions");
                SubscriptionError::Internal(err)
            })?;

        info!(
            older_than_minutes,
            stale_count = stale.len(),
            "subscription_admin: stale pending subscriptions listed"
        );
        Ok(stale.into_iter().map(StalePendingDto::from).collect())
    }

    pub async fn mark_failed(
        &self,
        admin_id: Uuid,
        subscription_id: Uuid,
        reason: Option<String>,
    ) -> UseCaseResult<SubscriptionDto> {
        let reason = reason
            .map(|reason| reason.trim().to_string())
            .filter(|reason| !reason.is_empty())
            .unwrap_or_else(|| DEFAULT_FAILURE_REASON.to_string());

        self.subscription_repo
            .find_by_id(subscription_id)
            .await
            .map_err(|err| {
                error!(%subscription_id, db_error = ?err, "subscription_admin: failed to load subscription");
                SubscriptionError::Internal(err)
            })?
            .ok_or(SubscriptionError::NotFound("Subscription not found"))?;

        let now = Utc::now();
        let transition = self
            .subscription_repo
            .transition_to_failed(subscription_id, &reason, now)
            .await
            .map_err(|err| {
                error!(%subscription_id, db_error = ?err, "subscription_admin: failed to mark subscription failed");
                SubscriptionError::Internal(err)
            })?;

        match transition {
            StatusTransition::Applied(failed) => {
                info!(
                    %admin_id,
                    %subscription_id,
                    %reason,
                    "subscription_admin: pending subscription marked failed"
                );
                Ok(SubscriptionDto::from_entity(&failed, now))
            }
            StatusTransition::InvalidState(current) => {
                warn!(
                    %admin_id,
                    %subscription_id,
                    status = %current.status,
                    "subscription_admin: subscription is no longer pending"
                );
                Err(SubscriptionError::InvalidState(current.status()))
            }
        }
    }
}
