//! API layer - HTTP handlers and routing
//!
//! Every route runs inside the session middleware, so handlers find the
//! request's [`SessionHandle`] in their extensions.

pub mod auth;
pub mod middleware;

use axum::{
    http::{header, HeaderName, HeaderValue, Method},
    middleware as axum_middleware,
    routing::get,
    Json, Router,
};
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub use middleware::{ApiError, AppState, SessionHandle};

/// Build the API router
pub fn build_api_router() -> Router<AppState> {
    Router::new()
        .nest("/auth", auth::router())
        .route("/health", get(health))
}

/// Build the complete router with middleware
pub fn build_router(state: AppState, cors_origin: &str) -> Router {
    let mut cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([
            header::CONTENT_TYPE,
            header::COOKIE,
            HeaderName::from_static(auth::CSRF_HEADER),
        ])
        .allow_credentials(true);

    match cors_origin.parse::<HeaderValue>() {
        Ok(origin) => cors = cors.allow_origin(origin),
        Err(e) => tracing::warn!("Ignoring invalid CORS origin {:?}: {}", cors_origin, e),
    }

    Router::new()
        .nest("/api/v1", build_api_router())
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors)
                .layer(axum_middleware::from_fn_with_state(
                    state.clone(),
                    middleware::session_middleware,
                )),
        )
        .with_state(state)
}

/// GET /api/v1/health
async fn health(axum::extract::State(state): axum::extract::State<AppState>) -> Json<serde_json::Value> {
    let database = state.pool.ping().await.is_ok();
    let cache = state.sessions.cache().ping().await.is_ok();

    Json(json!({
        "status": if database && cache { "ok" } else { "degraded" },
        "database": database,
        "cache": cache,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{Cache, MemoryCache};
    use crate::config::SessionConfig;
    use crate::db::repositories::{SqlxSessionRepository, SqlxUserRepository};
    use crate::db::{create_test_pool, migrations};
    use crate::services::session::SessionService;
    use axum_test::TestServer;
    use std::sync::Arc;

    async fn server() -> TestServer {
        let pool = create_test_pool().await.unwrap();
        migrations::run_migrations(&pool).await.unwrap();

        let sessions = SessionService::new(
            Arc::new(Cache::Memory(MemoryCache::new())),
            SqlxSessionRepository::boxed(pool.clone()),
            SqlxUserRepository::boxed(pool.clone()),
            SessionConfig::default(),
        );
        let state = AppState {
            pool,
            sessions,
            trust_proxy_headers: false,
        };
        TestServer::new(build_router(state, "not a valid origin\n")).unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_both_stores() {
        let server = server().await;

        let response = server.get("/api/v1/health").await;

        response.assert_status_ok();
        response.assert_json(&json!({
            "status": "ok",
            "database": true,
            "cache": true,
        }));
    }

    #[tokio::test]
    async fn test_unknown_route_is_not_found() {
        let server = server().await;
        let response = server.get("/api/v1/nothing").expect_failure().await;
        assert_eq!(response.status_code(), axum::http::StatusCode::NOT_FOUND);
    }
}
