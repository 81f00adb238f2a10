use std::{sync::Arc, time::Duration};

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
};
use crates::{
    domain::{
        repositories::{app_users::EntitlementRepository, subscriptions::SubscriptionRepository},
        value_objects::mpesa_callback::{CallbackRejection, decode_stk_callback},
    },
    infra::db::{
        postgres::postgres_connection::PgPoolSquad,
        repositories::{app_users::EntitlementPostgres, subscriptions::SubscriptionPostgres},
    },
};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::usecases::{entitlements::EntitlementProjector, payment_callbacks::PaymentCallbackUseCase};

/// Body the provider expects back. `ResultCode` 0 stops its retries.
#[derive(Debug, Serialize)]
pub struct CallbackAck {
    #[serde(rename = "ResultCode")]
    pub result_code: i32,
    #[serde(rename = "ResultDesc")]
    pub result_desc: String,
}

pub fn routes(db_pool: Arc<PgPoolSquad>, request_timeout: Duration) -> Router {
    let subscription_repository = Arc::new(SubscriptionPostgres::new(Arc::clone(&db_pool)));
    let entitlement_repository = Arc::new(EntitlementPostgres::new(Arc::clone(&db_pool)));
    let entitlements = Arc::new(EntitlementProjector::new(
        Arc::clone(&subscription_repository),
        entitlement_repository,
    ));
    let callback_usecase = PaymentCallbackUseCase::new(subscription_repository, entitlements);

    router(Arc::new(callback_usecase))
        .layer(tower_http::timeout::TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ))
}

pub fn router<S, U>(usecase: Arc<PaymentCallbackUseCase<S, U>>) -> Router
where
    S: SubscriptionRepository + Send + Sync + 'static,
    U: EntitlementRepository + Send + Sync + 'static,
{
    Router::new()
        .route("/callback", post(stk_callback::<S, U>))
        .with_state(usecase)
}

/// Unauthenticated. Malformed payloads get a 400 so the provider retries;
/// anything decodable is acknowledged whatever reconciliation does with it.
pub async fn stk_callback<S, U>(
    State(usecase): State<Arc<PaymentCallbackUseCase<S, U>>>,
    body: Bytes,
) -> Response
where
    S: SubscriptionRepository + Send + Sync + 'static,
    U: EntitlementRepository + Send + Sync + 'static,
{
    let outcome = match decode_stk_callback(&body) {
        Ok(outcome) => outcome,
        Err(rejection) => return reject(rejection),
    };

    info!(
        checkout_request_id = %outcome.checkout_request_id(),
        result_code = outcome.result_code(),
        "mpesa_callback: callback received"
    );

    match usecase.reconcile(outcome).await {
        Ok(result) => info!(result = ?result, "mpesa_callback: callback reconciled"),
        Err(err) => error!(
            error = ?err,
            "mpesa_callback: reconciliation failed; acknowledging to stop provider retries"
        ),
    }

    acknowledge()
}

fn acknowledge() -> Response {
    (
        StatusCode::OK,
        Json(CallbackAck {
            result_code: 0,
            result_desc: "Success".to_string(),
        }),
    )
        .into_response()
}

fn reject(rejection: CallbackRejection) -> Response {
    warn!(reason = %rejection, "mpesa_callback: rejected malformed callback");
    (
        StatusCode::BAD_REQUEST,
        Json(CallbackAck {
            result_code: 1,
            result_desc: rejection.to_string(),
        }),
    )
        .into_response()
}
