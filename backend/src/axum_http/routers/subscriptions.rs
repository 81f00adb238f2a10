use std::{sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use crates::{
    domain::{
        repositories::{
            app_users::EntitlementRepository, plans::PlanRepository,
            subscriptions::SubscriptionRepository,
        },
        value_objects::subscriptions::{CheckStatusQuery, SubscribeRequest},
    },
    infra::db::{
        postgres::postgres_connection::PgPoolSquad,
        repositories::{
            app_users::EntitlementPostgres, plans::PlanPostgres,
            subscriptions::SubscriptionPostgres,
        },
    },
    payments::mpesa_client::MpesaClient,
};

use tower_http::timeout::TimeoutLayer;

use crate::{
    auth::AuthUser,
    axum_http::error_responses::AppError,
    config::config_model::DotEnvyConfig,
    usecases::{
        entitlements::EntitlementProjector,
        subscriptions::{PaymentInitiator, SubscriptionUseCase},
    },
};

pub fn routes(
    db_pool: Arc<PgPoolSquad>,
    config: Arc<DotEnvyConfig>,
    mpesa_client: Arc<MpesaClient>,
) -> Router {
    let plan_repository = Arc::new(PlanPostgres::new(Arc::clone(&db_pool)));
    let subscription_repository = Arc::new(SubscriptionPostgres::new(Arc::clone(&db_pool)));
    let entitlement_repository = Arc::new(EntitlementPostgres::new(Arc::clone(&db_pool)));
    let entitlements = Arc::new(EntitlementProjector::new(
        Arc::clone(&subscription_repository),
        entitlement_repository,
    ));

    // Token fetch and STK push each get the client timeout.
    let initiation_timeout = config.mpesa.timeout * 2;
    let subscriptions_usecase = SubscriptionUseCase::new(
        plan_repository,
        subscription_repository,
        entitlements,
        mpesa_client,
        config.subscriptions.fallback_phone.clone(),
        initiation_timeout,
    );

    let request_timeout = Duration::from_secs(config.backend_server.timeout);
    router(
        Arc::new(subscriptions_usecase),
        request_timeout,
        initiation_timeout + request_timeout,
    )
}

/// `/subscribe` waits on the payment provider and gets its own, longer timeout.
/// It should exceed the use case's initiation timeout; if it does not, the
/// pending row is still settled after the client has been answered.
pub fn router<P, S, U, I>(
    usecase: Arc<SubscriptionUseCase<P, S, U, I>>,
    request_timeout: Duration,
    payment_timeout: Duration,
) -> Router
where
    P: PlanRepository + Send + Sync + 'static,
    S: SubscriptionRepository + Send + Sync + 'static,
    U: EntitlementRepository + Send + Sync + 'static,
    I: PaymentInitiator + Send + Sync + 'static,
{
    let payments = Router::new()
        .route("/subscribe", post(subscribe::<P, S, U, I>))
        .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, payment_timeout));

    let queries = Router::new()
        .route("/subscription/plans", get(list_plans::<P, S, U, I>))
        .route("/subscription/status", get(subscription_status::<P, S, U, I>))
        .route("/subscription/check-status", get(check_status::<P, S, U, I>))
        .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, request_timeout));

    payments.merge(queries).with_state(usecase)
}

pub async fn subscribe<P, S, U, I>(
    State(subscriptions_usecase): State<Arc<SubscriptionUseCase<P, S, U, I>>>,
    auth: AuthUser,
    Json(subscribe_request): Json<SubscribeRequest>,
) -> Result<impl IntoResponse, AppError>
where
    P: PlanRepository + Send + Sync + 'static,
    S: SubscriptionRepository + Send + Sync + 'static,
    U: EntitlementRepository + Send + Sync + 'static,
    I: PaymentInitiator + Send + Sync + 'static,
{
    let response = subscriptions_usecase
        .create_subscription(auth.user_id, subscribe_request)
        .await?;

    Ok((StatusCode::OK, Json(response)))
}

pub async fn list_plans<P, S, U, I>(
    State(subscriptions_usecase): State<Arc<SubscriptionUseCase<P, S, U, I>>>,
) -> Result<impl IntoResponse, AppError>
where
    P: PlanRepository + Send + Sync + 'static,
    S: SubscriptionRepository + Send + Sync + 'static,
    U: EntitlementRepository + Send + Sync + 'static,
    I: PaymentInitiator + Send + Sync + 'static,
{
    let plans = subscriptions_usecase.list_plans().await?;
    Ok((StatusCode::OK, Json(plans)))
}

pub async fn subscription_status<P, S, U, I>(
    State(subscriptions_usecase): State<Arc<SubscriptionUseCase<P, S, U, I>>>,
    auth: AuthUser,
) -> Result<impl IntoResponse, AppError>
where
    P: PlanRepository + Send + Sync + 'static,
    S: SubscriptionRepository + Send + Sync + 'static,
    U: EntitlementRepository + Send + Sync + 'static,
    I: PaymentInitiator + Send + Sync + 'static,
{
    let status = subscriptions_usecase
        .get_entitlement_status(auth.user_id)
        .await?;
    Ok((StatusCode::OK, Json(status)))
}

pub async fn check_status<P, S, U, I>(
    State(subscriptions_usecase): State<Arc<SubscriptionUseCase<P, S, U, I>>>,
    auth: AuthUser,
    Query(query): Query<CheckStatusQuery>,
) -> Result<impl IntoResponse, AppError>
where
    P: PlanRepository + Send + Sync + 'static,
    S: SubscriptionRepository + Send + Sync + 'static,
    U: EntitlementRepository + Send + Sync + 'static,
    I: PaymentInitiator + Send + Sync + 'static,
{
    let status = subscriptions_usecase
        .check_payment_status(auth.user_id, query.checkout_id)
        .await?;
    Ok((StatusCode::OK, Json(status)))
}
