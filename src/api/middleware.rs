//! API middleware
//!
//! Contains:
//! - Shared application state
//! - The JSON error envelope
//! - The session middleware wrapping every request in a `SessionManager`

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::services::session::{ClientInfo, SessionError, SessionManager, SessionService};

/// Application state containing shared services
#[derive(Clone)]
pub struct AppState {
    pub pool: crate::db::DynDatabasePool,
    pub sessions: SessionService,
    /// Take client addresses from X-Forwarded-For / X-Real-IP
    pub trust_proxy_headers: bool,
}

/// Session manager of the current request, placed in request extensions
#[derive(Clone)]
pub struct SessionHandle(pub Arc<Mutex<SessionManager>>);

/// Error response for API errors
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub error: ApiErrorDetail,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ApiErrorDetail {
                code: code.into(),
                message: message.into(),
                details: None,
            },
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new("UNAUTHORIZED", message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new("FORBIDDEN", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("NOT_FOUND", message)
    }

    pub fn validation_error(message: impl Into<String>) -> Self {
        Self::new("VALIDATION_ERROR", message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new("SERVICE_UNAVAILABLE", message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new("INTERNAL_ERROR", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.error.code.as_str() {
            "UNAUTHORIZED" => StatusCode::UNAUTHORIZED,
            "FORBIDDEN" => StatusCode::FORBIDDEN,
            "NOT_FOUND" => StatusCode::NOT_FOUND,
            "VALIDATION_ERROR" => StatusCode::BAD_REQUEST,
            "SERVICE_UNAVAILABLE" => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, Json(self)).into_response()
    }
}

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::InvalidCredential => ApiError::unauthorized(e.to_string()),
            SessionError::SessionExpired => ApiError::unauthorized("Session expired"),
            SessionError::NotAuthenticated => ApiError::unauthorized("Authentication required"),
            SessionError::StoreUnavailable(_) | SessionError::LockTimeout => {
                tracing::error!("{:#}", anyhow::Error::new(e));
                ApiError::service_unavailable("Session store temporarily unavailable")
            }
            SessionError::DeferredTaskFailure { .. } | SessionError::Internal(_) => {
                tracing::error!("{:#}", anyhow::Error::new(e));
                ApiError::internal_error("Internal server error")
            }
        }
    }
}

/// Client address of the request
///
/// Proxy headers are only read when `trust_proxy_headers` is set.
fn client_ip(request: &Request, trust_proxy_headers: bool) -> IpAddr {
    let headers = request.headers();

    if !trust_proxy_headers {
        return peer_ip(request);
    }

    if let Some(ip) = headers
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.split(',').next())
        .and_then(|s| s.trim().parse().ok())
    {
        return ip;
    }

    if let Some(ip) = headers
        .get("x-real-ip")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.trim().parse().ok())
    {
        return ip;
    }

    peer_ip(request)
}

fn peer_ip(request: &Request) -> IpAddr {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

fn client_info(request: &Request, trust_proxy_headers: bool) -> ClientInfo {
    let user_agent = request
        .headers()
        .get(header::USER_AGENT)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default();
    ClientInfo::new(client_ip(request, trust_proxy_headers), user_agent)
}

/// Value of the named cookie across all `Cookie` headers
pub(crate) fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|h| h.to_str().ok())
        .flat_map(|s| s.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim().to_string())
}

/// Session middleware
///
/// Resumes the session before the handler, persists it afterwards, sets the
/// cookie and hands the deferred tasks to a background flush so the response
/// never waits on them.
pub async fn session_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let client = client_info(&request, state.trust_proxy_headers);
    let cookie = cookie_value(request.headers(), &state.sessions.config().cookie_name);

    let mut manager = state.sessions.manager(client);
    match manager.resume(cookie.as_deref()).await {
        Ok(_) | Err(SessionError::SessionExpired) => {}
        Err(e) => return ApiError::from(e).into_response(),
    }

    let handle = SessionHandle(Arc::new(Mutex::new(manager)));
    request.extensions_mut().insert(handle.clone());

    let mut response = next.run(request).await;

    let mut manager = handle.0.lock().await;
    if let Err(e) = manager.shutdown().await {
        let dropped = manager.take_deferred();
        if !dropped.is_empty() {
            tracing::warn!("Discarding {} deferred task(s) of a failed request", dropped.len());
        }
        return ApiError::from(e).into_response();
    }

    if let Some(cookie) = manager.set_cookie_header() {
        match HeaderValue::from_str(&cookie) {
            Ok(value) => {
                response.headers_mut().append(header::SET_COOKIE, value);
            }
            Err(e) => tracing::error!("Invalid Set-Cookie value: {}", e),
        }
    }

    let deferred = manager.take_deferred();
    drop(manager);

    if !deferred.is_empty() {
        let executor = state.sessions.executor();
        tokio::spawn(async move {
            deferred.flush(&executor).await;
        });
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    #[test]
    fn test_cookie_value_finds_named_cookie() {
        let mut headers = HeaderMap::new();
        headers.append(header::COOKIE, HeaderValue::from_static("theme=dark; TANDEMSESSID=abc"));
        headers.append(header::COOKIE, HeaderValue::from_static("other=1"));

        assert_eq!(cookie_value(&headers, "TANDEMSESSID").as_deref(), Some("abc"));
        assert_eq!(cookie_value(&headers, "other").as_deref(), Some("1"));
        assert!(cookie_value(&headers, "missing").is_none());
        assert!(cookie_value(&headers, "TANDEM").is_none());
    }

    #[test]
    fn test_client_ip_prefers_forwarded_header() {
        let request = Request::builder()
            .header("x-forwarded-for", "203.0.113.5, 10.0.0.1")
            .header("x-real-ip", "198.51.100.1")
            .body(Body::empty())
            .unwrap();
        assert_eq!(client_ip(&request, true), "203.0.113.5".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_client_ip_ignores_proxy_headers_unless_trusted() {
        let mut request = Request::builder()
            .header("x-forwarded-for", "203.0.113.5")
            .header("x-real-ip", "198.51.100.1")
            .body(Body::empty())
            .unwrap();
        let peer: SocketAddr = "192.0.2.8:4711".parse().unwrap();
        request.extensions_mut().insert(ConnectInfo(peer));

        assert_eq!(client_ip(&request, false), peer.ip());
        assert_eq!(client_ip(&request, true), "203.0.113.5".parse::<IpAddr>().unwrap());

        let request = Request::builder()
            .header("x-real-ip", "198.51.100.1")
            .body(Body::empty())
            .unwrap();
        assert_eq!(client_ip(&request, true), "198.51.100.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_client_ip_falls_back_to_connect_info() {
        let mut request = Request::builder()
            .header("x-forwarded-for", "not-an-ip")
            .body(Body::empty())
            .unwrap();
        let peer: SocketAddr = "192.0.2.8:4711".parse().unwrap();
        request.extensions_mut().insert(ConnectInfo(peer));

        assert_eq!(client_ip(&request, true), peer.ip());
    }

    #[test]
    fn test_client_ip_unknown() {
        let request = Request::builder().body(Body::empty()).unwrap();
        assert_eq!(client_ip(&request, false), IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    }

    #[test]
    fn test_session_errors_map_to_status() {
        let status = |e: SessionError| ApiError::from(e).into_response().status();

        assert_eq!(status(SessionError::InvalidCredential), StatusCode::UNAUTHORIZED);
        assert_eq!(status(SessionError::NotAuthenticated), StatusCode::UNAUTHORIZED);
        assert_eq!(status(SessionError::LockTimeout), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            status(SessionError::StoreUnavailable(anyhow::anyhow!("down"))),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status(SessionError::Internal(anyhow::anyhow!("bad hash"))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_invalid_credential_message() {
        let error = ApiError::from(SessionError::InvalidCredential);
        assert_eq!(error.error.message, "Invalid email or password");
    }
}
