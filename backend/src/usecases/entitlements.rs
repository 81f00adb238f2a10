use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use crates::domain::{
    entities::subscriptions::SubscriptionEntity,
    repositories::{app_users::EntitlementRepository, subscriptions::SubscriptionRepository},
};
use tracing::{info, warn};
use uuid::Uuid;

/// Keeps the entitlement columns on the user record in line with the ledger.
/// The ledger stays authoritative; the user columns are a projection of it.
pub struct EntitlementProjector<S, U>
where
    S: SubscriptionRepository + Send + Sync + 'static,
    U: EntitlementRepository + Send + Sync + 'static,
{
    subscription_repo: Arc<S>,
    entitlement_repo: Arc<U>,
}

impl<S, U> EntitlementProjector<S, U>
where
    S: SubscriptionRepository + Send + Sync + 'static,
    U: EntitlementRepository + Send + Sync + 'static,
{
    pub fn new(subscription_repo: Arc<S>, entitlement_repo: Arc<U>) -> Self {
        Self {
            subscription_repo,
            entitlement_repo,
        }
    }

    /// Grants the entitlement until `expires_at`, stamping the payment time as now.
    pub async fn apply(&self, user_id: Uuid, expires_at: DateTime<Utc>) -> Result<()> {
        self.entitlement_repo
            .apply_entitlement(user_id, expires_at, Utc::now())
            .await?;
        info!(%user_id, %expires_at, "entitlements: entitlement applied");
        Ok(())
    }

    /// Current active ledger entry of the user. Re-applies the projection when
    /// the user record lags behind it; repair failures are only logged.
    pub async fn project(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<SubscriptionEntity>> {
        let active = self
            .subscription_repo
            .find_latest_active_subscription(user_id, now)
            .await?;

        let Some(subscription) = active.as_ref() else {
            return Ok(None);
        };

        let lagging = match self.entitlement_repo.find_entitlement(user_id).await {
            Ok(Some(entitlement)) => !entitlement.covers(subscription.expires_at),
            Ok(None) => true,
            Err(err) => {
                warn!(%user_id, db_error = ?err, "entitlements: failed to read stored entitlement");
                false
            }
        };

        if lagging {
            warn!(
                %user_id,
                subscription_id = %subscription.id,
                "entitlements: stored entitlement lags the ledger; re-applying"
            );
            let paid_at = subscription.paid_at.unwrap_or(now);
            if let Err(err) = self
                .entitlement_repo
                .apply_entitlement(user_id, subscription.expires_at, paid_at)
                .await
            {
                warn!(%user_id, db_error = ?err, "entitlements: failed to repair entitlement");
            }
        }

        Ok(active)
    }
}
