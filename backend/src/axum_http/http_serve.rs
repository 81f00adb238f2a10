use crate::{
    axum_http::{default_routers, routers},
    config::config_model::DotEnvyConfig,
};
use anyhow::Result;
use axum::{
    Router,
    http::{
        Method,
        header::{AUTHORIZATION, CONTENT_TYPE},
    },
    routing::get,
};
use crates::{
    infra::db::postgres::postgres_connection::PgPoolSquad, payments::mpesa_client::MpesaClient,
};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tower_http::{
    cors::{Any, CorsLayer},
    limit::RequestBodyLimitLayer,
    trace::TraceLayer,
};
use tracing::info;

pub async fn start(config: Arc<DotEnvyConfig>, db_pool: Arc<PgPoolSquad>) -> Result<()> {
    let mpesa_client = Arc::new(MpesaClient::new(config.mpesa.clone())?);
    info!(
        environment = %mpesa_client.environment(),
        "M-Pesa client has been configured"
    );

    let request_timeout = Duration::from_secs(config.backend_server.timeout);

    let app = Router::new()
        .fallback(default_routers::not_found)
        .nest(
            "/api/v1",
            routers::subscriptions::routes(
                Arc::clone(&db_pool),
                Arc::clone(&config),
                mpesa_client,
            ),
        )
        .nest(
            "/api/v1/mpesa",
            routers::mpesa_callback::routes(Arc::clone(&db_pool), request_timeout),
        )
        .nest(
            "/api/v1/admin",
            routers::admin_subscriptions::routes(
                Arc::clone(&db_pool),
                config.subscriptions.stale_pending_minutes,
                request_timeout,
            ),
        )
        .route("/api/v1/health-check", get(default_routers::health_check))
        .layer(RequestBodyLimitLayer::new(
            (config.backend_server.body_limit * 1024 * 1024).try_into()?,
        ))
        .layer(
            CorsLayer::new()
                .allow_methods([Method::GET, Method::POST])
                .allow_headers([AUTHORIZATION, CONTENT_TYPE])
                .allow_origin(Any),
        )
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.backend_server.port));
    let listener = TcpListener::bind(addr).await?;

    info!("Server is running on port {}", config.backend_server.port);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "Failed to install CTRL+C signal handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received ctrl+C signal"),
        _ = terminate => info!("Received terminate signal"),
    }
}
