use std::sync::Arc;

use chrono::Utc;
use crates::domain::{
    repositories::{app_users::EntitlementRepository, subscriptions::SubscriptionRepository},
    value_objects::{
        enums::subscription_statuses::SubscriptionStatus,
        mpesa_callback::StkCallbackOutcome,
        subscriptions::StatusTransition,
    },
};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::usecases::{
    entitlements::EntitlementProjector,
    subscriptions::{SubscriptionError, UseCaseResult},
};

/// What a callback delivery did to the ledger.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    Activated {
        subscription_id: Uuid,
        amount_mismatch: bool,
    },
    Failed {
        subscription_id: Uuid,
    },
    /// Duplicate or late delivery for a settled subscription. Nothing changed.
    AlreadySettled {
        subscription_id: Uuid,
        status: SubscriptionStatus,
    },
    /// No subscription carries this checkout request id yet. Nothing changed.
    TransientLookupMiss,
}

/// Applies decoded provider callbacks to the ledger. Safe to run any number of
/// times, in any order, for the same checkout request: only the first
/// transition out of `pending` lands.
pub struct PaymentCallbackUseCase<S, U>
where
    S: SubscriptionRepository + Send + Sync + 'static,
    U: EntitlementRepository + Send + Sync + 'static,
{
    subscription_repo: Arc<S>,
    entitlements: Arc<EntitlementProjector<S, U>>,
}

impl<S, U> PaymentCallbackUseCase<S, U>
where
    S: SubscriptionRepository + Send + Sync + 'static,
    U: EntitlementRepository + Send + Sync + 'static,
{
    pub fn new(subscription_repo: Arc<S>, entitlements: Arc<EntitlementProjector<S, U>>) -> Self {
        Self {
            subscription_repo,
            entitlements,
        }
    }

    pub async fn reconcile(&self, outcome: StkCallbackOutcome) -> UseCaseResult<ReconcileOutcome> {
        let checkout_request_id = outcome.checkout_request_id().to_string();

        let Some(subscription) = self
            .subscription_repo
            .find_by_checkout_request_id(&checkout_request_id)
            .await
            .map_err(|err| {
                error!(%checkout_request_id, db_error = ?err, "payment_callbacks: failed to look up subscription");
                SubscriptionError::Internal(err)
            })?
        else {
            warn!(
                %checkout_request_id,
                result_code = outcome.result_code(),
                "payment_callbacks: no subscription for checkout request; acknowledged without changes"
            );
            return Ok(ReconcileOutcome::TransientLookupMiss);
        };

        let now = Utc::now();
        match outcome {
            StkCallbackOutcome::Succeeded { payment, .. } => {
                let receipt = payment.receipt.clone();
                let confirmed_amount = payment.amount_minor;

                let transition = self
                    .subscription_repo
                    .transition_to_active(subscription.id, payment, now)
                    .await
                    .map_err(|err| {
                        error!(
                            subscription_id = %subscription.id,
                            %checkout_request_id,
                            db_error = ?err,
                            "payment_callbacks: failed to activate subscription"
                        );
                        SubscriptionError::Internal(err)
                    })?;

                match transition {
                    StatusTransition::Applied(activated) => {
                        if activated.amount_mismatch {
                            warn!(
                                subscription_id = %activated.id,
                                quoted_amount_minor = activated.quoted_amount_minor,
                                expected_amount_minor = subscription.amount_minor,
                                confirmed_amount_minor = confirmed_amount,
                                "payment_callbacks: confirmed amount differs from the charged amount"
                            );
                        }

                        info!(
                            subscription_id = %activated.id,
                            user_id = %activated.user_id,
                            %checkout_request_id,
                            %receipt,
                            expires_at = %activated.expires_at,
                            "payment_callbacks: subscription activated"
                        );

                        if let Err(err) = self
                            .entitlements
                            .apply(activated.user_id, activated.expires_at)
                            .await
                        {
                            warn!(
                                user_id = %activated.user_id,
                                subscription_id = %activated.id,
                                db_error = ?err,
                                "payment_callbacks: failed to project entitlement; ledger stays active"
                            );
                        }

                        Ok(ReconcileOutcome::Activated {
                            subscription_id: activated.id,
                            amount_mismatch: activated.amount_mismatch,
                        })
                    }
                    StatusTransition::InvalidState(current) => Ok(self.already_settled(current.id, current.status())),
                }
            }
            StkCallbackOutcome::Failed {
                result_code,
                reason,
                ..
            } => {
                let transition = self
                    .subscription_repo
                    .transition_to_failed(subscription.id, &reason, now)
                    .await
                    .map_err(|err| {
                        error!(
                            subscription_id = %subscription.id,
                            %checkout_request_id,
                            db_error = ?err,
                            "payment_callbacks: failed to mark subscription failed"
                        );
                        SubscriptionError::Internal(err)
                    })?;

                match transition {
                    StatusTransition::Applied(failed) => {
                        info!(
                            subscription_id = %failed.id,
                            %checkout_request_id,
                            result_code,
                            %reason,
                            "payment_callbacks: subscription payment failed"
                        );
                        Ok(ReconcileOutcome::Failed {
                            subscription_id: failed.id,
                        })
                    }
                    StatusTransition::InvalidState(current) => Ok(self.already_settled(current.id, current.status())),
                }
            }
        }
    }

    fn already_settled(&self, subscription_id: Uuid, status: SubscriptionStatus) -> ReconcileOutcome {
        info!(
            %subscription_id,
            %status,
            "payment_callbacks: subscription already settled; duplicate delivery ignored"
        );
        ReconcileOutcome::AlreadySettled {
            subscription_id,
            status,
        }
    }
}
