use std::{sync::Arc, time::Duration};

use anyhow::{Result as AnyResult, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crates::{
    domain::{
        entities::subscriptions::{InsertSubscriptionEntity, SubscriptionEntity},
        repositories::{
            app_users::EntitlementRepository, plans::PlanRepository,
            subscriptions::SubscriptionRepository,
        },
        value_objects::{
            enums::subscription_statuses::SubscriptionStatus,
            phone_numbers::{mask_phone, normalize_msisdn},
            plans::PlanDto,
            subscriptions::{
                EntitlementStatusDto, PaymentStatusDto, PendingCreation, SubscribeRequest,
                SubscribeResponse, SubscriptionDto, account_reference, days_remaining,
            },
        },
    },
    payments::mpesa_client::{MpesaClient, StkPushAccepted},
};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::usecases::entitlements::EntitlementProjector;

/// Starts a push payment and returns the provider's correlation id. The
/// outcome arrives later through the payment callback.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PaymentInitiator: Send + Sync {
    async fn start(
        &self,
        phone: &str,
        amount_minor: i32,
        account_reference: &str,
        description: &str,
    ) -> AnyResult<StkPushAccepted>;
}

#[async_trait]
impl PaymentInitiator for MpesaClient {
    async fn start(
        &self,
        phone: &str,
        amount_minor: i32,
        account_reference: &str,
        description: &str,
    ) -> AnyResult<StkPushAccepted> {
        self.initiate_stk_push(phone, amount_minor, account_reference, description)
            .await
    }
}

#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("{0}")]
    Validation(String),
    #[error("{}", conflict_message(.status, .expires_at))]
    Conflict {
        status: SubscriptionStatus,
        expires_at: DateTime<Utc>,
    },
    #[error("{0}")]
    NotFound(&'static str),
    #[error("Access denied")]
    Forbidden,
    #[error("Failed to initiate M-Pesa payment: {0}")]
    Upstream(String),
    #[error("Subscription is already {0}")]
    InvalidState(SubscriptionStatus),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

fn conflict_message(status: &SubscriptionStatus, expires_at: &DateTime<Utc>) -> String {
    match status {
        SubscriptionStatus::Pending => format!(
            "A subscription payment is already pending (reserved until {}). Complete or cancel it on your phone first",
            expires_at.format("%Y-%m-%d")
        ),
        _ => format!(
            "You already have an active subscription until {}",
            expires_at.format("%Y-%m-%d")
        ),
    }
}

impl SubscriptionError {
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            SubscriptionError::Validation(_) => StatusCode::BAD_REQUEST,
            SubscriptionError::Conflict { .. } | SubscriptionError::InvalidState(_) => {
                StatusCode::CONFLICT
            }
            SubscriptionError::NotFound(_) => StatusCode::NOT_FOUND,
            SubscriptionError::Forbidden => StatusCode::FORBIDDEN,
            SubscriptionError::Upstream(_) | SubscriptionError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn conflict_with(existing: &SubscriptionEntity) -> Self {
        SubscriptionError::Conflict {
            status: existing.status(),
            expires_at: existing.expires_at,
        }
    }
}

pub type UseCaseResult<T> = std::result::Result<T, SubscriptionError>;

pub struct SubscriptionUseCase<P, S, U, I>
where
    P: PlanRepository + Send + Sync + 'static,
    S: SubscriptionRepository + Send + Sync + 'static,
    U: EntitlementRepository + Send + Sync + 'static,
    I: PaymentInitiator + Send + Sync + 'static,
{
    plan_repo: Arc<P>,
    subscription_repo: Arc<S>,
    entitlements: Arc<EntitlementProjector<S, U>>,
    payment_initiator: Arc<I>,
    fallback_phone: Option<String>,
    initiation_timeout: Duration,
}

impl<P, S, U, I> SubscriptionUseCase<P, S, U, I>
where
    P: PlanRepository + Send + Sync + 'static,
    S: SubscriptionRepository + Send + Sync + 'static,
    U: EntitlementRepository + Send + Sync + 'static,
    I: PaymentInitiator + Send + Sync + 'static,
{
    pub fn new(
        plan_repo: Arc<P>,
        subscription_repo: Arc<S>,
        entitlements: Arc<EntitlementProjector<S, U>>,
        payment_initiator: Arc<I>,
        fallback_phone: Option<String>,
        initiation_timeout: Duration,
    ) -> Self {
        Self {
            plan_repo,
            subscription_repo,
            entitlements,
            payment_initiator,
            fallback_phone,
            initiation_timeout,
        }
    }

    pub async fn list_plans(&self) -> UseCaseResult<Vec<PlanDto>> {
        info!("subscriptions: listing active plans");
        let plans = self.plan_repo.list_active_plans().await.map_err(|err| {
            error!(db_error = ?err, "subscriptions: failed to list active plans");
            SubscriptionError::Internal(err)
        })?;
        let plan_count = plans.len();
        info!(plan_count, "subscriptions: active plans loaded");
        Ok(plans.into_iter().map(PlanDto::from).collect())
    }

    pub async fn create_subscription(
        &self,
        user_id: Uuid,
        request: SubscribeRequest,
    ) -> UseCaseResult<SubscribeResponse> {
        let plan_id = request.plan_id;
        info!(%user_id, %plan_id, "subscriptions: subscription requested");

        let plan = self
            .plan_repo
            .find_active_plan_by_id(plan_id)
            .await
            .map_err(|err| {
                error!(%user_id, %plan_id, db_error = ?err, "subscriptions: failed to load plan");
                SubscriptionError::Internal(err)
            })?
            .ok_or_else(|| {
                warn!(%user_id, %plan_id, "subscriptions: plan not found or inactive");
                SubscriptionError::NotFound("Subscription plan not found")
            })?;

        let now = Utc::now();
        if let Some(existing) = self
            .subscription_repo
            .find_current_subscription(user_id, now)
            .await
            .map_err(|err| {
                error!(%user_id, db_error = ?err, "subscriptions: failed to check current subscription");
                SubscriptionError::Internal(err)
            })?
        {
            info!(
                %user_id,
                subscription_id = %existing.id,
                status = %existing.status,
                "subscriptions: user already holds a current subscription"
            );
            return Err(SubscriptionError::conflict_with(&existing));
        }

        let phone = self.resolve_phone(request.phone)?;

        let expires_at = plan.expiry_from(now).ok_or_else(|| {
            SubscriptionError::Internal(anyhow!(
                "plan {} has an unusable duration of {} days",
                plan.id,
                plan.duration_days
            ))
        })?;

        let insert_subscription_entity = InsertSubscriptionEntity {
            user_id,
            plan_id: plan.id,
            status: SubscriptionStatus::Pending.to_string(),
            starts_at: now,
            expires_at,
            quoted_amount_minor: plan.price_minor,
            amount_minor: plan.price_minor,
            phone_used: phone.clone(),
        };

        let subscription = match self
            .subscription_repo
            .create_pending(insert_subscription_entity, now)
            .await
            .map_err(|err| {
                error!(%user_id, %plan_id, db_error = ?err, "subscriptions: failed to create pending subscription");
                SubscriptionError::Internal(err)
            })? {
            PendingCreation::Created(subscription) => subscription,
            PendingCreation::Conflict(existing) => {
                info!(
                    %user_id,
                    subscription_id = %existing.id,
                    "subscriptions: concurrent subscription won the per-user lock"
                );
                return Err(SubscriptionError::conflict_with(&existing));
            }
        };

        let reference = account_reference(subscription.id);
        let description = format!("Subscription: {}", plan.name);
        let masked_phone = mask_phone(&phone);

        info!(
            %user_id,
            subscription_id = %subscription.id,
            account_reference = %reference,
            phone = %masked_phone,
            amount_minor = plan.price_minor,
            "subscriptions: pending subscription created; initiating payment"
        );

        // Runs detached so a dropped request cannot leave the row pending
        // without a checkout request id.
        let settlement = tokio::spawn(initiate_and_settle(
            Arc::clone(&self.subscription_repo),
            Arc::clone(&self.payment_initiator),
            self.initiation_timeout,
            PaymentAttempt {
                subscription_id: subscription.id,
                phone,
                amount_minor: plan.price_minor,
                account_reference: reference,
                description,
            },
        ));
        let accepted = settlement.await.map_err(|err| {
            SubscriptionError::Internal(anyhow!("payment initiation task failed: {err}"))
        })??;

        info!(
            %user_id,
            subscription_id = %subscription.id,
            checkout_request_id = %accepted.checkout_request_id,
            "subscriptions: payment initiated"
        );

        Ok(SubscribeResponse {
            checkout_request_id: accepted.checkout_request_id,
            message: format!(
                "Payment request sent to {}. Enter your M-Pesa PIN to complete the payment",
                masked_phone
            ),
            masked_phone,
            amount: plan.price_minor,
            plan_name: plan.name,
            customer_message: accepted.customer_message,
        })
    }

    fn resolve_phone(&self, requested: Option<String>) -> UseCaseResult<String> {
        let raw = requested
            .map(|phone| phone.trim().to_string())
            .filter(|phone| !phone.is_empty())
            .or_else(|| self.fallback_phone.clone())
            .ok_or_else(|| {
                SubscriptionError::Validation(
                    "Phone number is required for M-Pesa payment".to_string(),
                )
            })?;

        normalize_msisdn(&raw).map_err(|err| SubscriptionError::Validation(err.to_string()))
    }

    pub async fn get_entitlement_status(&self, user_id: Uuid) -> UseCaseResult<EntitlementStatusDto> {
        let now = Utc::now();
        let active = self
            .entitlements
            .project(user_id, now)
            .await
            .map_err(|err| {
                error!(%user_id, db_error = ?err, "subscriptions: failed to load active subscription");
                SubscriptionError::Internal(err)
            })?;

        let Some(subscription) = active else {
            info!(%user_id, "subscriptions: no active subscription");
            return Ok(EntitlementStatusDto::none());
        };

        let plan = self
            .plan_repo
            .find_by_id(subscription.plan_id)
            .await
            .map_err(|err| {
                error!(%user_id, plan_id = %subscription.plan_id, db_error = ?err, "subscriptions: failed to load plan");
                SubscriptionError::Internal(err)
            })?;
        if plan.is_none() {
            warn!(%user_id, plan_id = %subscription.plan_id, "subscriptions: active subscription references a missing plan");
        }

        let days_remaining = days_remaining(subscription.expires_at, now);
        Ok(EntitlementStatusDto {
            has_subscription: true,
            is_active: true,
            plan: plan.map(PlanDto::from),
            expires_at: Some(subscription.expires_at),
            days_remaining,
            subscription: Some(SubscriptionDto::from_entity(&subscription, now)),
            message: format!("Subscription active, {} days remaining", days_remaining),
        })
    }

    pub async fn check_payment_status(
        &self,
        user_id: Uuid,
        checkout_request_id: Option<String>,
    ) -> UseCaseResult<PaymentStatusDto> {
        let checkout_request_id = checkout_request_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| SubscriptionError::Validation("Checkout ID is required".to_string()))?;

        let subscription = self
            .subscription_repo
            .find_by_checkout_request_id(&checkout_request_id)
            .await
            .map_err(|err| {
                error!(%user_id, %checkout_request_id, db_error = ?err, "subscriptions: failed to load subscription");
                SubscriptionError::Internal(err)
            })?
            .ok_or(SubscriptionError::NotFound("Subscription not found"))?;

        if subscription.user_id != user_id {
            warn!(
                %user_id,
                %checkout_request_id,
                "subscriptions: status check for a subscription owned by another user"
            );
            return Err(SubscriptionError::Forbidden);
        }

        let now = Utc::now();
        Ok(PaymentStatusDto {
            status: subscription.effective_status(now),
            data: SubscriptionDto::from_entity(&subscription, now),
        })
    }
}

struct PaymentAttempt {
    subscription_id: Uuid,
    phone: String,
    amount_minor: i32,
    account_reference: String,
    description: String,
}

/// Starts the push payment and settles the pending row either way: the
/// checkout request id is attached on success, the row is failed otherwise.
/// An initiator that outlives `initiation_timeout` counts as a failure.
async fn initiate_and_settle<S, I>(
    subscription_repo: Arc<S>,
    payment_initiator: Arc<I>,
    initiation_timeout: Duration,
    attempt: PaymentAttempt,
) -> UseCaseResult<StkPushAccepted>
where
    S: SubscriptionRepository + Send + Sync + 'static,
    I: PaymentInitiator + Send + Sync + 'static,
{
    let subscription_id = attempt.subscription_id;
    let reference = attempt.account_reference.as_str();

    let started = tokio::time::timeout(
        initiation_timeout,
        payment_initiator.start(
            &attempt.phone,
            attempt.amount_minor,
            reference,
            &attempt.description,
        ),
    )
    .await;

    let result = match started {
        Ok(result) => result,
        Err(_) => Err(anyhow!(
            "M-Pesa did not respond within {initiation_timeout:?}"
        )),
    };

    let accepted = match result {
        Ok(accepted) => accepted,
        Err(err) => {
            let reason = err.to_string();
            error!(
                %subscription_id,
                account_reference = %reference,
                initiator_error = ?err,
                "subscriptions: payment initiation failed"
            );
            if let Err(db_err) = subscription_repo
                .transition_to_failed(subscription_id, &reason, Utc::now())
                .await
            {
                error!(
                    %subscription_id,
                    db_error = ?db_err,
                    "subscriptions: failed to mark subscription failed; it stays pending"
                );
            }
            return Err(SubscriptionError::Upstream(reason));
        }
    };

    subscription_repo
        .attach_checkout_request(
            subscription_id,
            &accepted.checkout_request_id,
            accepted.merchant_request_id.clone(),
        )
        .await
        .map_err(|err| {
            error!(
                %subscription_id,
                account_reference = %reference,
                checkout_request_id = %accepted.checkout_request_id,
                db_error = ?err,
                "subscriptions: failed to store checkout request id; subscription stays pending without a correlation id"
            );
            SubscriptionError::Internal(err)
        })?;

    Ok(accepted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use crates::domain::{
        entities::plans::PlanEntity,
        repositories::{
            app_users::MockEntitlementRepository, plans::MockPlanRepository,
            subscriptions::MockSubscriptionRepository,
        },
        value_objects::subscriptions::StatusTransition,
    };
    use mockall::predicate::eq;

    type TestUseCase = SubscriptionUseCase<
        MockPlanRepository,
        MockSubscriptionRepository,
        MockEntitlementRepository,
        MockPaymentInitiator,
    >;

    fn sample_plan(id: Uuid) -> PlanEntity {
        PlanEntity {
            id,
            name: "5-Day Basic".to_string(),
            description: Some("Basic listing for 5 days".to_string()),
            price_minor: 10,
            duration_days: 5,
            is_active: true,
            created_at: Utc::now(),
        }
    }

    fn pending_from(insert: &InsertSubscriptionEntity) -> SubscriptionEntity {
        SubscriptionEntity {
            id: Uuid::new_v4(),
            user_id: insert.user_id,
            plan_id: insert.plan_id,
            status: insert.status.clone(),
            starts_at: insert.starts_at,
            expires_at: insert.expires_at,
            quoted_amount_minor: insert.quoted_amount_minor,
            amount_minor: insert.amount_minor,
            amount_mismatch: false,
            phone_used: insert.phone_used.clone(),
            checkout_request_id: None,
            merchant_request_id: None,
            provider_receipt: None,
            payer_phone: None,
            provider_transaction_date: None,
            failure_reason: None,
            paid_at: None,
            created_at: insert.starts_at,
            updated_at: insert.starts_at,
        }
    }

    fn sample_active(user_id: Uuid, plan_id: Uuid) -> SubscriptionEntity {
        let now = Utc::now();
        let mut subscription = pending_from(&InsertSubscriptionEntity {
            user_id,
            plan_id,
            status: SubscriptionStatus::Active.to_string(),
            starts_at: now,
            expires_at: now + Duration::days(5),
            quoted_amount_minor: 10,
            amount_minor: 10,
            phone_used: "254712345678".to_string(),
        });
        subscription.checkout_request_id = Some("ws_CO_1".to_string());
        subscription
    }

    fn build(
        plan_repo: MockPlanRepository,
        subscription_repo: MockSubscriptionRepository,
        payment_initiator: MockPaymentInitiator,
        fallback_phone: Option<String>,
    ) -> TestUseCase {
        let subscription_repo = Arc::new(subscription_repo);
        let entitlements = Arc::new(EntitlementProjector::new(
            Arc::clone(&subscription_repo),
            Arc::new(MockEntitlementRepository::new()),
        ));
        SubscriptionUseCase::new(
            Arc::new(plan_repo),
            subscription_repo,
            entitlements,
            Arc::new(payment_initiator),
            fallback_phone,
            std::time::Duration::from_secs(5),
        )
    }

    fn request(plan_id: Uuid, phone: Option<&str>) -> SubscribeRequest {
        SubscribeRequest {
            plan_id,
            phone: phone.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn creates_pending_subscription_and_initiates_payment() {
        let user_id = Uuid::new_v4();
        let plan_id = Uuid::new_v4();

        let mut plan_repo = MockPlanRepository::new();
        let mut subscription_repo = MockSubscriptionRepository::new();
        let mut payment_initiator = MockPaymentInitiator::new();

        let plan = sample_plan(plan_id);
        plan_repo
            .expect_find_active_plan_by_id()
            .with(eq(plan_id))
            .returning(move |_| Ok(Some(plan.clone())));

        subscription_repo
            .expect_find_current_subscription()
            .returning(|_, _| Ok(None));

        subscription_repo
            .expect_create_pending()
            .withf(move |insert, now| {
                insert.user_id == user_id
                    && insert.amount_minor == 10
                    && insert.quoted_amount_minor == 10
                    && insert.phone_used == "254712345678"
                    && insert.status == "pending"
                    && insert.starts_at == *now
                    && insert.expires_at == *now + Duration::days(5)
            })
            .times(1)
            .returning(|insert, _| Ok(PendingCreation::Created(pending_from(&insert))));

        payment_initiator
            .expect_start()
            .withf(|phone, amount, reference, description| {
                phone == "254712345678"
                    && *amount == 10
                    && reference.starts_with("SUB-")
                    && description == "Subscription: 5-Day Basic"
            })
            .times(1)
            .returning(|_, _, _, _| {
                Ok(StkPushAccepted {
                    checkout_request_id: "ws_CO_1".to_string(),
                    merchant_request_id: Some("29115-1".to_string()),
                    customer_message: Some("Success. Request accepted for processing".to_string()),
                })
            });

        subscription_repo
            .expect_attach_checkout_request()
            .withf(|_, checkout_request_id, merchant_request_id| {
                checkout_request_id == "ws_CO_1" && merchant_request_id.as_deref() == Some("29115-1")
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let usecase = build(plan_repo, subscription_repo, payment_initiator, None);

        let response = usecase
            .create_subscription(user_id, request(plan_id, Some("0712345678")))
            .await
            .unwrap();

        assert_eq!(response.checkout_request_id, "ws_CO_1");
        assert_eq!(response.masked_phone, "254****678");
        assert_eq!(response.amount, 10);
        assert_eq!(response.plan_name, "5-Day Basic");
        assert!(!response.message.contains("254712345678"));
    }

    #[tokio::test]
    async fn existing_active_subscription_conflicts_without_payment() {
        let user_id = Uuid::new_v4();
        let plan_id = Uuid::new_v4();

        let mut plan_repo = MockPlanRepository::new();
        let mut subscription_repo = MockSubscriptionRepository::new();
        let mut payment_initiator = MockPaymentInitiator::new();

        let plan = sample_plan(plan_id);
        plan_repo
            .expect_find_active_plan_by_id()
            .returning(move |_| Ok(Some(plan.clone())));

        let existing = sample_active(user_id, plan_id);
        let existing_expiry = existing.expires_at;
        subscription_repo
            .expect_find_current_subscription()
            .with(eq(user_id), mockall::predicate::always())
            .returning(move |_, _| Ok(Some(existing.clone())));
        subscription_repo.expect_create_pending().never();
        payment_initiator.expect_start().never();

        let usecase = build(plan_repo, subscription_repo, payment_initiator, None);

        let err = usecase
            .create_subscription(user_id, request(plan_id, Some("0712345678")))
            .await
            .unwrap_err();

        match err {
            SubscriptionError::Conflict { status, expires_at } => {
                assert_eq!(status, SubscriptionStatus::Active);
                assert_eq!(expires_at, existing_expiry);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn lost_creation_race_conflicts_without_payment() {
        let user_id = Uuid::new_v4();
        let plan_id = Uuid::new_v4();

        let mut plan_repo = MockPlanRepository::new();
        let mut subscription_repo = MockSubscriptionRepository::new();
        let mut payment_initiator = MockPaymentInitiator::new();

        let plan = sample_plan(plan_id);
        plan_repo
            .expect_find_active_plan_by_id()
            .returning(move |_| Ok(Some(plan.clone())));
        subscription_repo
            .expect_find_current_subscription()
            .returning(|_, _| Ok(None));

        let winner = sample_active(user_id, plan_id);
        subscription_repo
            .expect_create_pending()
            .returning(move |_, _| Ok(PendingCreation::Conflict(winner.clone())));
        payment_initiator.expect_start().never();

        let usecase = build(plan_repo, subscription_repo, payment_initiator, None);

        let err = usecase
            .create_subscription(user_id, request(plan_id, Some("0712345678")))
            .await
            .unwrap_err();

        assert_eq!(err.status_code(), axum::http::StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn unknown_plan_is_not_found() {
        let mut plan_repo = MockPlanRepository::new();
        let mut subscription_repo = MockSubscriptionRepository::new();
        let mut payment_initiator = MockPaymentInitiator::new();

        plan_repo
            .expect_find_active_plan_by_id()
            .returning(|_| Ok(None));
        subscription_repo.expect_create_pending().never();
        payment_initiator.expect_start().never();

        let usecase = build(plan_repo, subscription_repo, payment_initiator, None);

        let err = usecase
            .create_subscription(Uuid::new_v4(), request(Uuid::new_v4(), Some("0712345678")))
            .await
            .unwrap_err();

        assert!(matches!(err, SubscriptionError::NotFound(_)));
        assert_eq!(err.status_code(), axum::http::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn missing_phone_without_fallback_is_rejected() {
        let plan_id = Uuid::new_v4();

        let mut plan_repo = MockPlanRepository::new();
        let mut subscription_repo = MockSubscriptionRepository::new();
        let mut payment_initiator = MockPaymentInitiator::new();

        let plan = sample_plan(plan_id);
        plan_repo
            .expect_find_active_plan_by_id()
            .returning(move |_| Ok(Some(plan.clone())));
        subscription_repo
            .expect_find_current_subscription()
            .returning(|_, _| Ok(None));
        subscription_repo.expect_create_pending().never();
        payment_initiator.expect_start().never();

        let usecase = build(plan_repo, subscription_repo, payment_initiator, None);

        let err = usecase
            .create_subscription(Uuid::new_v4(), request(plan_id, Some("   ")))
            .await
            .unwrap_err();

        assert!(matches!(err, SubscriptionError::Validation(_)));
    }

    #[tokio::test]
    async fn fallback_phone_is_used_when_request_has_none() {
        let plan_id = Uuid::new_v4();

        let mut plan_repo = MockPlanRepository::new();
        let mut subscription_repo = MockSubscriptionRepository::new();
        let mut payment_initiator = MockPaymentInitiator::new();

        let plan = sample_plan(plan_id);
        plan_repo
            .expect_find_active_plan_by_id()
            .returning(move |_| Ok(Some(plan.clone())));
        subscription_repo
            .expect_find_current_subscription()
            .returning(|_, _| Ok(None));
        subscription_repo
            .expect_create_pending()
            .withf(|insert, _| insert.phone_used == "254700000001")
            .returning(|insert, _| Ok(PendingCreation::Created(pending_from(&insert))));
        payment_initiator
            .expect_start()
            .withf(|phone, _, _, _| phone == "254700000001")
            .returning(|_, _, _, _| {
                Ok(StkPushAccepted {
                    checkout_request_id: "ws_CO_2".to_string(),
                    merchant_request_id: None,
                    customer_message: None,
                })
            });
        subscription_repo
            .expect_attach_checkout_request()
            .returning(|_, _, _| Ok(()));

        let usecase = build(
            plan_repo,
            subscription_repo,
            payment_initiator,
            Some("+254700000001".to_string()),
        );

        let response = usecase
            .create_subscription(Uuid::new_v4(), request(plan_id, None))
            .await
            .unwrap();

        assert_eq!(response.masked_phone, "254****001");
    }

    #[tokio::test]
    async fn initiator_failure_marks_subscription_failed() {
        let plan_id = Uuid::new_v4();

        let mut plan_repo = MockPlanRepository::new();
        let mut subscription_repo = MockSubscriptionRepository::new();
        let mut payment_initiator = MockPaymentInitiator::new();

        let plan = sample_plan(plan_id);
        plan_repo
            .expect_find_active_plan_by_id()
            .returning(move |_| Ok(Some(plan.clone())));
        subscription_repo
            .expect_find_current_subscription()
            .returning(|_, _| Ok(None));
        subscription_repo
            .expect_create_pending()
            .returning(|insert, _| Ok(PendingCreation::Created(pending_from(&insert))));
        payment_initiator
            .expect_start()
            .returning(|_, _, _, _| Err(anyhow!("STK push rejected: Invalid Access Token")));
        subscription_repo
            .expect_transition_to_failed()
            .withf(|_, reason, _| reason == "STK push rejected: Invalid Access Token")
            .times(1)
            .returning(|id, reason, _| {
                let mut failed = sample_active(Uuid::new_v4(), Uuid::new_v4());
                failed.id = id;
                failed.status = SubscriptionStatus::Failed.to_string();
                failed.failure_reason = Some(reason.to_string());
                Ok(StatusTransition::Applied(failed))
            });
        subscription_repo.expect_attach_checkout_request().never();

        let usecase = build(plan_repo, subscription_repo, payment_initiator, None);

        let err = usecase
            .create_subscription(Uuid::new_v4(), request(plan_id, Some("0712345678")))
            .await
            .unwrap_err();

        assert!(matches!(err, SubscriptionError::Upstream(_)));
        assert_eq!(
            err.to_string(),
            "Failed to initiate M-Pesa payment: STK push rejected: Invalid Access Token"
        );
    }

    #[tokio::test]
    async fn check_status_enforces_ownership() {
        let owner = Uuid::new_v4();
        let subscription = sample_active(owner, Uuid::new_v4());

        let mut subscription_repo = MockSubscriptionRepository::new();
        subscription_repo
            .expect_find_by_checkout_request_id()
            .withf(|id| id == "ws_CO_1")
            .returning(move |_| Ok(Some(subscription.clone())));

        let usecase = build(
            MockPlanRepository::new(),
            subscription_repo,
            MockPaymentInitiator::new(),
            None,
        );

        let err = usecase
            .check_payment_status(Uuid::new_v4(), Some("ws_CO_1".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, SubscriptionError::Forbidden));

        let status = usecase
            .check_payment_status(owner, Some("ws_CO_1".to_string()))
            .await
            .unwrap();
        assert_eq!(status.status, SubscriptionStatus::Active);
        assert_eq!(status.data.masked_phone, "254****678");
    }

    #[tokio::test]
    async fn check_status_requires_checkout_id() {
        let usecase = build(
            MockPlanRepository::new(),
            MockSubscriptionRepository::new(),
            MockPaymentInitiator::new(),
            None,
        );

        let err = usecase
            .check_payment_status(Uuid::new_v4(), None)
            .await
            .unwrap_err();

        assert!(matches!(err, SubscriptionError::Validation(_)));
    }

    #[tokio::test]
    async fn check_status_reports_lazy_expiry() {
        let owner = Uuid::new_v4();
        let mut subscription = sample_active(owner, Uuid::new_v4());
        subscription.expires_at = Utc::now() - Duration::minutes(1);

        let mut subscription_repo = MockSubscriptionRepository::new();
        subscription_repo
            .expect_find_by_checkout_request_id()
            .returning(move |_| Ok(Some(subscription.clone())));

        let usecase = build(
            MockPlanRepository::new(),
            subscription_repo,
            MockPaymentInitiator::new(),
            None,
        );

        let status = usecase
            .check_payment_status(owner, Some("ws_CO_1".to_string()))
            .await
            .unwrap();

        assert_eq!(status.status, SubscriptionStatus::Expired);
    }

    #[tokio::test]
    async fn list_plans_maps_to_dtos() {
        let mut plan_repo = MockPlanRepository::new();
        let plan = sample_plan(Uuid::new_v4());
        let expected = PlanDto::from(plan.clone());
        plan_repo
            .expect_list_active_plans()
            .returning(move || Ok(vec![plan.clone()]));

        let usecase = build(
            plan_repo,
            MockSubscriptionRepository::new(),
            MockPaymentInitiator::new(),
            None,
        );

        assert_eq!(usecase.list_plans().await.unwrap(), vec![expected]);
    }
}
