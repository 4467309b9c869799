//! Session API endpoints
//!
//! - GET /api/v1/auth/session - Current session view
//! - GET /api/v1/auth/csrf - Issue the CSRF token
//! - POST /api/v1/auth/login - Sign in
//! - POST /api/v1/auth/logout - Sign out
//! - GET /api/v1/auth/sessions - Active sessions of the current user
//! - DELETE /api/v1/auth/sessions/{id} - Revoke one of them
//!
//! State-changing calls made with an existing session must carry the
//! session's CSRF token in `X-CSRF-Token`.

use axum::{
    extract::Path,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
    Extension, Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::middleware::{ApiError, AppState, SessionHandle};
use crate::models::{Session, SessionState, SessionSummary};
use crate::services::session::SessionManager;

/// Header carrying the CSRF token
pub const CSRF_HEADER: &str = "x-csrf-token";

/// Request body for sign-in
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

/// Current session as shown to its owner
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionResponse {
    pub state: String,
    pub authenticated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    pub user_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sign_in_time: Option<DateTime<Utc>>,
}

impl SessionResponse {
    fn new(session: &Session, state: SessionState) -> Self {
        Self {
            state: state.to_string(),
            authenticated: session.is_authenticated(),
            user_id: session.is_authenticated().then_some(session.user_id),
            user_name: session.user_name.clone(),
            sign_in_time: session.sign_in_time,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CsrfResponse {
    pub csrf_token: String,
}

/// Response for successful sign-in
#[derive(Debug, Serialize, Deserialize)]
pub struct LoginResponse {
    pub session: SessionResponse,
    pub csrf_token: String,
}

/// Build the auth router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/session", get(current_session))
        .route("/csrf", get(csrf_token))
        .route("/login", post(login))
        .route("/logout", post(logout))
        .route("/sessions", get(list_sessions))
        .route("/sessions/{id}", delete(revoke_session))
}

fn require_csrf(manager: &SessionManager, headers: &HeaderMap) -> Result<(), ApiError> {
    let provided = headers
        .get(CSRF_HEADER)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default();

    if manager.verify_csrf(provided) {
        Ok(())
    } else {
        tracing::warn!("Rejected request with missing or invalid CSRF token");
        Err(ApiError::forbidden("Invalid CSRF token"))
    }
}

/// GET /api/v1/auth/session
async fn current_session(Extension(handle): Extension<SessionHandle>) -> Json<SessionResponse> {
    let manager = handle.0.lock().await;
    Json(SessionResponse::new(manager.session(), manager.state()))
}

/// GET /api/v1/auth/csrf
async fn csrf_token(
    Extension(handle): Extension<SessionHandle>,
) -> Result<Json<CsrfResponse>, ApiError> {
    let mut manager = handle.0.lock().await;
    let csrf_token = manager.csrf_token()?;
    Ok(Json(CsrfResponse { csrf_token }))
}

/// POST /api/v1/auth/login
async fn login(
    Extension(handle): Extension<SessionHandle>,
    Json(body): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    if body.email.trim().is_empty() || body.password.is_empty() {
        return Err(ApiError::validation_error("Email and password are required"));
    }

    let mut manager = handle.0.lock().await;
    let session = manager.authenticate(&body.email, &body.password).await?;

    Ok(Json(LoginResponse {
        session: SessionResponse::new(&session, manager.state()),
        csrf_token: session.csrf_token,
    }))
}

/// POST /api/v1/auth/logout
async fn logout(
    Extension(handle): Extension<SessionHandle>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let mut manager = handle.0.lock().await;
    require_csrf(&manager, &headers)?;
    manager.destroy()?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/v1/auth/sessions
async fn list_sessions(
    Extension(handle): Extension<SessionHandle>,
) -> Result<Json<Vec<SessionSummary>>, ApiError> {
    let manager = handle.0.lock().await;
    if !manager.session().is_authenticated() {
        return Err(ApiError::unauthorized("Authentication required"));
    }
    let user_id = manager.session().user_id;
    Ok(Json(manager.get_active_sessions(user_id).await?))
}

/// DELETE /api/v1/auth/sessions/{id}
async fn revoke_session(
    Extension(handle): Extension<SessionHandle>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let mut manager = handle.0.lock().await;
    if !manager.session().is_authenticated() {
        return Err(ApiError::unauthorized("Authentication required"));
    }
    require_csrf(&manager, &headers)?;

    if manager.revoke_session(&session_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found("Session not found"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::build_router;
    use crate::cache::{Cache, MemoryCache};
    use crate::config::SessionConfig;
    use crate::db::repositories::{
        SessionRepository, SqlxSessionRepository, SqlxUserRepository, UserRepository,
    };
    use crate::db::{create_test_pool, migrations};
    use crate::models::CreateUserInput;
    use crate::services::password::hash_password;
    use crate::services::session::SessionService;
    use axum::http::{header, HeaderName, HeaderValue};
    use axum_test::{TestResponse, TestServer};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    const PASSWORD: &str = "s3cret-passw0rd";

    struct TestApp {
        server: TestServer,
        state: AppState,
        sessions: Arc<dyn SessionRepository>,
    }

    async fn test_app() -> TestApp {
        let pool = create_test_pool().await.expect("Failed to create test pool");
        migrations::run_migrations(&pool)
            .await
            .expect("Failed to run migrations");

        let users = SqlxUserRepository::boxed(pool.clone());
        users
            .create(&CreateUserInput::new(
                "Alice",
                "alice@example.com",
                hash_password(PASSWORD).unwrap(),
            ))
            .await
            .unwrap();

        let sessions = SqlxSessionRepository::boxed(pool.clone());
        let cache = Arc::new(Cache::Memory(MemoryCache::new()));
        let service = SessionService::new(
            cache,
            sessions.clone(),
            users as Arc<dyn UserRepository>,
            SessionConfig {
                lock_wait_ms: 2_000,
                ..SessionConfig::default()
            },
        );

        let state = AppState {
            pool,
            sessions: service,
            trust_proxy_headers: true,
        };
        let server = TestServer::new(build_router(state.clone(), "http://localhost:3000"))
            .expect("Failed to start test server");

        TestApp {
            server,
            state,
            sessions,
        }
    }

    fn cookie(session_id: &str) -> HeaderValue {
        HeaderValue::from_str(&format!("TANDEMSESSID={}", session_id)).unwrap()
    }

    fn csrf(token: &str) -> HeaderValue {
        HeaderValue::from_str(token).unwrap()
    }

    fn csrf_header() -> HeaderName {
        HeaderName::from_static(CSRF_HEADER)
    }

    fn set_cookie(response: &TestResponse) -> Option<String> {
        response
            .headers()
            .get(header::SET_COOKIE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    /// Session identifier carried by a `Set-Cookie` value
    fn cookie_id(set_cookie: &str) -> String {
        set_cookie
            .split(';')
            .next()
            .and_then(|pair| pair.split_once('='))
            .map(|(_, value)| value.to_string())
            .unwrap_or_default()
    }

    async fn login(app: &TestApp) -> (String, String) {
        let response = app
            .server
            .post("/api/v1/auth/login")
            .json(&json!({ "email": "alice@example.com", "password": PASSWORD }))
            .await;
        response.assert_status_ok();

        let body: LoginResponse = response.json();
        let id = cookie_id(&set_cookie(&response).expect("login sets the cookie"));
        (id, body.csrf_token)
    }

    /// Deferred writes run after the response; wait for them to land
    async fn wait_for_record(app: &TestApp, session_id: &str, present: bool) {
        for _ in 0..100 {
            let found = app.sessions.get_by_id(session_id).await.unwrap().is_some();
            if found == present {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session record {} never became present={}", session_id, present);
    }

    #[tokio::test]
    async fn test_anonymous_session_sets_no_cookie() {
        let app = test_app().await;

        let response = app.server.get("/api/v1/auth/session").await;

        response.assert_status_ok();
        let body: SessionResponse = response.json();
        assert!(!body.authenticated);
        assert_eq!(body.state, "anonymous");
        assert!(set_cookie(&response).is_none());
    }

    #[tokio::test]
    async fn test_login_with_invalid_credentials() {
        let app = test_app().await;

        for (email, password) in [("alice@example.com", "wrong"), ("nobody@example.com", PASSWORD)] {
            let response = app
                .server
                .post("/api/v1/auth/login")
                .json(&json!({ "email": email, "password": password }))
                .await;

            assert_eq!(response.status_code(), StatusCode::UNAUTHORIZED);
            let body: ApiError = response.json();
            assert_eq!(body.error.message, "Invalid email or password");
            assert!(set_cookie(&response).is_none());
        }
    }

    #[tokio::test]
    async fn test_login_requires_fields() {
        let app = test_app().await;

        let response = app
            .server
            .post("/api/v1/auth/login")
            .json(&json!({ "email": " ", "password": "" }))
            .await;

        assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_login_then_resume() {
        let app = test_app().await;
        let (id, _) = login(&app).await;
        assert_eq!(id.len(), 64);
        wait_for_record(&app, &id, true).await;

        let response = app
            .server
            .get("/api/v1/auth/session")
            .add_header(header::COOKIE, cookie(&id))
            .await;

        response.assert_status_ok();
        let body: SessionResponse = response.json();
        assert!(body.authenticated);
        assert_eq!(body.user_name, "Alice");
        assert!(body.sign_in_time.is_some());
        assert!(set_cookie(&response).is_none());
    }

    #[tokio::test]
    async fn test_logout_requires_csrf_token() {
        let app = test_app().await;
        let (id, token) = login(&app).await;
        wait_for_record(&app, &id, true).await;

        let rejected = app
            .server
            .post("/api/v1/auth/logout")
            .add_header(header::COOKIE, cookie(&id))
            .await;
        assert_eq!(rejected.status_code(), StatusCode::FORBIDDEN);

        let response = app
            .server
            .post("/api/v1/auth/logout")
            .add_header(header::COOKIE, cookie(&id))
            .add_header(csrf_header(), csrf(&token))
            .await;
        assert_eq!(response.status_code(), StatusCode::NO_CONTENT);
        assert!(set_cookie(&response).unwrap().contains("Max-Age=0"));

        wait_for_record(&app, &id, false).await;

        let after = app
            .server
            .get("/api/v1/auth/session")
            .add_header(header::COOKIE, cookie(&id))
            .await;
        let body: SessionResponse = after.json();
        assert!(!body.authenticated);
        assert!(set_cookie(&after).unwrap().contains("Max-Age=0"));
    }

    #[tokio::test]
    async fn test_recovery_issues_new_cookie() {
        let app = test_app().await;
        let (id, _) = login(&app).await;
        wait_for_record(&app, &id, true).await;

        app.state.sessions.cache().remove(&id).await.unwrap();

        let response = app
            .server
            .get("/api/v1/auth/session")
            .add_header(header::COOKIE, cookie(&id))
            .await;

        let body: SessionResponse = response.json();
        assert!(body.authenticated);
        let new_id = cookie_id(&set_cookie(&response).expect("rotated cookie"));
        assert_ne!(new_id, id);

        wait_for_record(&app, &new_id, true).await;
        wait_for_record(&app, &id, false).await;
    }

    #[tokio::test]
    async fn test_csrf_endpoint_materializes_session() {
        let app = test_app().await;

        let response = app.server.get("/api/v1/auth/csrf").await;
        response.assert_status_ok();
        let body: CsrfResponse = response.json();
        assert_eq!(body.csrf_token.len(), 64);
        let id = cookie_id(&set_cookie(&response).expect("anonymous session cookie"));

        let again = app
            .server
            .get("/api/v1/auth/csrf")
            .add_header(header::COOKIE, cookie(&id))
            .await;
        let second: CsrfResponse = again.json();
        assert_eq!(second.csrf_token, body.csrf_token);
    }

    #[tokio::test]
    async fn test_list_and_revoke_sessions() {
        let app = test_app().await;
        let (laptop, _) = login(&app).await;
        let (phone, phone_token) = login(&app).await;
        wait_for_record(&app, &laptop, true).await;
        wait_for_record(&app, &phone, true).await;

        let listed = app
            .server
            .get("/api/v1/auth/sessions")
            .add_header(header::COOKIE, cookie(&phone))
            .await;
        listed.assert_status_ok();
        let sessions: Vec<serde_json::Value> = listed.json();
        assert_eq!(sessions.len(), 2);
        assert_eq!(
            sessions.iter().filter(|s| s["current"] == json!(true)).count(),
            1
        );

        let revoked = app
            .server
            .delete(&format!("/api/v1/auth/sessions/{}", laptop))
            .add_header(header::COOKIE, cookie(&phone))
            .add_header(csrf_header(), csrf(&phone_token))
            .await;
        assert_eq!(revoked.status_code(), StatusCode::NO_CONTENT);
        wait_for_record(&app, &laptop, false).await;

        let missing = app
            .server
            .delete(&format!("/api/v1/auth/sessions/{}", "0".repeat(64)))
            .add_header(header::COOKIE, cookie(&phone))
            .add_header(csrf_header(), csrf(&phone_token))
            .await;
        assert_eq!(missing.status_code(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_sessions_require_authentication() {
        let app = test_app().await;

        let response = app.server.get("/api/v1/auth/sessions").await;
        assert_eq!(response.status_code(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_malformed_cookie_is_cleared() {
        let app = test_app().await;

        let response = app
            .server
            .get("/api/v1/auth/session")
            .add_header(header::COOKIE, HeaderValue::from_static("TANDEMSESSID=not-a-session"))
            .await;

        response.assert_status_ok();
        assert!(set_cookie(&response).unwrap().starts_with("TANDEMSESSID=;"));
    }
}
