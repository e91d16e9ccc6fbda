use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::Result;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use cryptachat_relay::{metrics::render_prometheus, DeliveryGateway, HubHandle};
use serde_json::json;
use tower_http::{
    compression::CompressionLayer,
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, warn, Level};

use crate::auth::TokenService;
use crate::config::ServerConfig;
use crate::db::Database;
use crate::store::{ContactStore, KeyStore, MessageStore, UserStore};

mod error;
mod rate_limit;
mod routes;

pub use error::ApiError;
pub use rate_limit::{ClientIp, RateLimits, Route};

/// Server application state
pub struct AppState {
    pub config: ServerConfig,
    pub db: Database,
    pub users: UserStore,
    pub keys: KeyStore,
    pub contacts: ContactStore,
    /// Message log plus real-time push, in that order
    pub gateway: DeliveryGateway<MessageStore>,
    pub tokens: TokenService,
    pub limits: Arc<RateLimits>,
}

impl AppState {
    /// Build the state around a migrated database and a running hub.
    pub fn new(config: ServerConfig, db: Database, hub: HubHandle) -> Self {
        let tokens = TokenService::new(config.secret_key.as_bytes(), config.token_ttl);
        let limits = Arc::new(RateLimits::new(&config.rate_limits));
        Self {
            users: UserStore::new(db.clone()),
            keys: KeyStore::new(db.clone()),
            contacts: ContactStore::new(db.clone()),
            gateway: DeliveryGateway::new(Arc::new(MessageStore::new(db.clone())), hub),
            tokens,
            limits,
            config,
            db,
        }
    }
}

/// Serve the HTTP API until `shutdown` resolves.
pub async fn start(
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let addr = state.config.listen_addr();
    let app = create_router(state);

    info!("Starting Axum HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;

    info!("HTTP server stopped");
    Ok(())
}

/// Create the Axum router with all routes and middleware
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .merge(routes::router())
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
}

/// Liveness plus a database round-trip.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let online_users = state.gateway.hub().online_count();
    match state.db.health_check().await {
        Ok(true) => (
            StatusCode::OK,
            Json(json!({
                "status": "healthy",
                "service": "cryptachat-server",
                "version": env!("CARGO_PKG_VERSION"),
                "online_users": online_users,
            })),
        ),
        Ok(false) => {
            warn!("Health check: database unhealthy");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": "cryptachat-server",
                    "version": env!("CARGO_PKG_VERSION"),
                    "error": "database unhealthy"
                })),
            )
        }
        Err(e) => {
            warn!("Health check failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": "cryptachat-server",
                    "version": env!("CARGO_PKG_VERSION"),
                    "error": format!("database error: {}", e)
                })),
            )
        }
    }
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let hub = state.gateway.hub();
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        render_prometheus(&hub.stats(), hub.online_count()),
    )
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_health() {
        let state = test_state().await;
        let (status, json) = send(&state, "GET", "/health", None, None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["service"], "cryptachat-server");
        assert_eq!(json["online_users"], 0);
    }

    #[tokio::test]
    async fn test_metrics_exposes_delivery_counters() {
        let state = test_state().await;
        let response = create_router(state)
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("cryptachat_online_users 0"));
        assert!(text.contains("cryptachat_frames_dropped_total{reason=\"offline\"}"));
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let state = test_state().await;
        let (status, _) = send(&state, "GET", "/nope", None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
