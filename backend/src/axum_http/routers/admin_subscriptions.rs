use std::{sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use crates::{
    domain::{
        repositories::subscriptions::SubscriptionRepository,
        value_objects::subscriptions::{FailSubscriptionRequest, StalePendingQuery},
    },
    infra::db::{
        postgres::postgres_connection::PgPoolSquad,
        repositories::subscriptions::SubscriptionPostgres,
    },
};
use uuid::Uuid;

use crate::{
    auth::AdminUser, axum_http::error_responses::AppError,
    usecases::subscription_admin::SubscriptionAdminUseCase,
};

pub fn routes(
    db_pool: Arc<PgPoolSquad>,
    default_stale_minutes: i64,
    request_timeout: Duration,
) -> Router {
    let subscription_repository = Arc::new(SubscriptionPostgres::new(Arc::clone(&db_pool)));
    let admin_usecase =
        SubscriptionAdminUseCase::new(subscription_repository, default_stale_minutes);

    router(Arc::new(admin_usecase)).layer(tower_http::timeout::TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ))
}

pub fn router<S>(usecase: Arc<SubscriptionAdminUseCase<S>>) -> Router
where
    S: SubscriptionRepository + Send + Sync + 'static,
{
    Router::new()
        .route("/subscriptions/stale-pending", get(list_stale_pending::<S>))
        .route("/subscriptions/:subscription_id/fail", post(mark_failed::<S>))
        .with_state(usecase)
}

pub async fn list_stale_pending<S>(
    State(admin_usecase): State<Arc<SubscriptionAdminUseCase<S>>>,
    _admin: AdminUser,
    Query(query): Query<StalePendingQuery>,
) -> Result<impl IntoResponse, AppError>
where
    S: SubscriptionRepository + Send + Sync + 'static,
{
    let stale = admin_usecase
        .list_stale_pending(query.older_than_minutes)
        .await?;
    Ok((StatusCode::OK, Json(stale)))
}

pub async fn mark_failed<S>(
    State(admin_usecase): State<Arc<SubscriptionAdminUseCase<S>>>,
    AdminUser(admin): AdminUser,
    Path(subscription_id): Path<Uuid>,
    body: Option<Json<FailSubscriptionRequest>>,
) -> Result<impl IntoResponse, AppError>
where
    S: SubscriptionRepository + Send + Sync + 'static,
{
    let reason = body.and_then(|Json(request)| request.reason);
    let failed = admin_usecase
        .mark_failed(admin.user_id, subscription_id, reason)
        .await?;
    Ok((StatusCode::OK, Json(failed)))
}
