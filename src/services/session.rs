//! Session lifecycle service
//!
//! [`SessionService`] is shared by all requests and owns the stores.
//! [`SessionManager`] is created per request and drives one session through
//! resume, authentication, rotation and destruction.
//!
//! The ephemeral cache is the primary read path. When it no longer knows a
//! cookie identifier, the persistent `sessions` table decides whether the
//! session is recovered under a new identifier or treated as expired.
//! Persistent writes are never done inline: they are queued on the manager's
//! [`DeferredTaskQueue`] and flushed after the response. Identifiers the
//! request ended are marked in the ephemeral cache during `shutdown`, while
//! their lock is still held, so a queued request can never resume them.

use std::mem;
use std::net::IpAddr;
use std::sync::Arc;

use chrono::Utc;

use crate::cache::{Cache, EphemeralSessionCache, LockLease, OpenedSession, SessionCacheError};
use crate::config::SessionConfig;
use crate::db::repositories::{SessionRepository, UserRepository};
use crate::models::{Session, SessionState, SessionSummary};

use super::csrf::{generate_csrf_token, is_well_formed_id, tokens_match};
use super::deferred::{DeferredExecutor, DeferredTask, DeferredTaskQueue};
use super::password::{verify_dummy, verify_password};

/// Expiry attributes of a cleared cookie
const CLEARED_COOKIE_ATTRIBUTES: &str = "Max-Age=0; Expires=Thu, 01 Jan 1970 00:00:00 GMT";

/// Error types for session lifecycle operations
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Ephemeral or persistent store failed
    #[error("Session store unavailable: {0}")]
    StoreUnavailable(#[source] anyhow::Error),

    /// Another request kept the session locked for too long
    #[error("Timed out waiting for session lock")]
    LockTimeout,

    /// Unknown account or wrong password
    #[error("Invalid email or password")]
    InvalidCredential,

    /// Cookie pointed at a session that no longer exists
    #[error("Session expired")]
    SessionExpired,

    /// Operation requires a signed-in session
    #[error("Not authenticated")]
    NotAuthenticated,

    /// A deferred task failed after the response
    #[error("Deferred task failed: {task}")]
    DeferredTaskFailure {
        task: String,
        #[source]
        source: anyhow::Error,
    },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<SessionCacheError> for SessionError {
    fn from(e: SessionCacheError) -> Self {
        match e {
            SessionCacheError::Unavailable(source) => SessionError::StoreUnavailable(source),
            SessionCacheError::LockTimeout => SessionError::LockTimeout,
        }
    }
}

/// Client details captured from the request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub ip_address: IpAddr,
    pub user_agent: String,
}

impl ClientInfo {
    pub fn new(ip_address: IpAddr, user_agent: impl Into<String>) -> Self {
        Self {
            ip_address,
            user_agent: user_agent.into(),
        }
    }
}

/// Shared session service
#[derive(Clone)]
pub struct SessionService {
    cache: EphemeralSessionCache,
    session_repo: Arc<dyn SessionRepository>,
    user_repo: Arc<dyn UserRepository>,
    config: Arc<SessionConfig>,
}

impl SessionService {
    pub fn new(
        cache: Arc<Cache>,
        session_repo: Arc<dyn SessionRepository>,
        user_repo: Arc<dyn UserRepository>,
        config: SessionConfig,
    ) -> Self {
        Self {
            cache: EphemeralSessionCache::new(cache, &config),
            session_repo,
            user_repo,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn cache(&self) -> &EphemeralSessionCache {
        &self.cache
    }

    /// Executor for the deferred tasks of any manager of this service
    pub fn executor(&self) -> DeferredExecutor {
        DeferredExecutor::new(self.session_repo.clone(), self.cache.clone())
    }

    /// Start handling one request
    pub fn manager(&self, client: ClientInfo) -> SessionManager {
        SessionManager::new(self.clone(), client)
    }

    /// Delete persistent sessions past the absolute lifetime
    pub async fn purge_expired(&self) -> Result<u64, SessionError> {
        let cutoff = Utc::now() - self.config.max_lifetime();
        let deleted = self
            .session_repo
            .delete_signed_in_before(cutoff)
            .await
            .map_err(SessionError::StoreUnavailable)?;
        if deleted > 0 {
            tracing::info!("Purged {} session(s) past their max lifetime", deleted);
        }
        Ok(deleted)
    }
}

/// Cookie change to send with the response
#[derive(Debug, Clone, PartialEq, Eq)]
enum CookieInstruction {
    Set(String),
    Clear,
}

/// Per-request session state machine
pub struct SessionManager {
    service: SessionService,
    client: ClientInfo,
    state: SessionState,
    session: Session,
    leases: Vec<LockLease>,
    /// Anonymous session must survive the request
    remember: bool,
    cookie: Option<CookieInstruction>,
    /// Identifiers to end at shutdown, with the identifier they moved to
    ended: Vec<(String, Option<String>)>,
    deferred: DeferredTaskQueue,
    shut_down: bool,
}

impl SessionManager {
    fn new(service: SessionService, client: ClientInfo) -> Self {
        let session = Session::anonymous(client.ip_address, client.user_agent.clone());
        Self {
            service,
            client,
            state: SessionState::Anonymous,
            session,
            leases: Vec::new(),
            remember: false,
            cookie: None,
            ended: Vec::new(),
            deferred: DeferredTaskQueue::new(),
            shut_down: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Pick up the session a request's cookie points at.
    ///
    /// Without a cookie the session stays anonymous and nothing is read.
    /// `SessionExpired` leaves the manager usable as an anonymous session.
    pub async fn resume(&mut self, cookie: Option<&str>) -> Result<&Session, SessionError> {
        let Some(cookie_id) = cookie.map(str::trim).filter(|c| !c.is_empty()) else {
            return Ok(&self.session);
        };

        self.state = SessionState::Resuming;

        if !is_well_formed_id(cookie_id) {
            tracing::warn!("Rejected malformed session cookie from {}", self.client.ip_address);
            self.expire();
            return Err(SessionError::SessionExpired);
        }

        let opened = match self.service.cache.open(cookie_id).await {
            Ok(opened) => opened,
            Err(e) => {
                self.state = SessionState::Anonymous;
                return Err(e.into());
            }
        };

        let new_id = match opened {
            OpenedSession::Live { id, payload, leases } => {
                self.leases.extend(leases);
                if id != cookie_id {
                    self.cookie = Some(CookieInstruction::Set(id.clone()));
                }
                self.session = Session::from_payload(id, payload);
                self.state = if self.session.is_authenticated() {
                    SessionState::Authenticated
                } else {
                    SessionState::Anonymous
                };
                return Ok(&self.session);
            }
            OpenedSession::Ended { leases } => {
                self.leases.extend(leases);
                tracing::info!("Rejected cookie of an ended session from {}", self.client.ip_address);
                self.expire();
                return Err(SessionError::SessionExpired);
            }
            OpenedSession::Missing { id, leases } => {
                self.leases.extend(leases);
                id
            }
        };

        match self.recover(cookie_id, new_id).await {
            Ok(true) => Ok(&self.session),
            Ok(false) => Err(SessionError::SessionExpired),
            Err(e) => {
                self.release_leases().await;
                self.state = SessionState::Anonymous;
                Err(e)
            }
        }
    }

    /// Rebuild an evicted session from its persistent record under `new_id`
    async fn recover(&mut self, cookie_id: &str, new_id: String) -> Result<bool, SessionError> {
        let record = self
            .service
            .session_repo
            .get_by_id(cookie_id)
            .await
            .map_err(SessionError::StoreUnavailable)?;

        let Some(record) = record else {
            tracing::warn!("Session cookie matched no stored session, clearing it");
            self.expire();
            return Ok(false);
        };

        if record.is_past_lifetime(self.service.config.max_lifetime(), Utc::now()) {
            tracing::warn!("Session of user {} is past its max lifetime", record.user_id);
            self.deferred.push(DeferredTask::DeleteRecord {
                session_id: cookie_id.to_string(),
            });
            self.expire();
            return Ok(false);
        }

        let user = self
            .service
            .user_repo
            .get_by_id(record.user_id)
            .await
            .map_err(SessionError::StoreUnavailable)?;
        let Some(user) = user else {
            tracing::warn!("Session owner {} no longer exists", record.user_id);
            self.deferred.push(DeferredTask::DeleteRecord {
                session_id: cookie_id.to_string(),
            });
            self.expire();
            return Ok(false);
        };

        let rotated = record.rotated(
            new_id.clone(),
            self.client.ip_address,
            self.client.user_agent.clone(),
        );
        self.session = Session {
            id: new_id.clone(),
            csrf_token: generate_csrf_token(),
            user_id: user.id,
            user_name: user.name,
            sign_in_time: Some(record.sign_in),
            ip_address: self.client.ip_address,
            user_agent: self.client.user_agent.clone(),
        };
        self.deferred.push(DeferredTask::RotateRecord {
            from: cookie_id.to_string(),
            record: rotated,
        });
        self.ended.push((cookie_id.to_string(), Some(new_id.clone())));
        self.cookie = Some(CookieInstruction::Set(new_id));
        self.state = SessionState::Authenticated;

        tracing::info!("Recovered session of user {} from the persistent store", user.id);
        Ok(true)
    }

    /// Sign in with an email and password.
    ///
    /// Always moves the session to a new identifier.
    pub async fn authenticate(&mut self, email: &str, password: &str) -> Result<Session, SessionError> {
        let user = self
            .service
            .user_repo
            .get_by_email(email)
            .await
            .map_err(SessionError::StoreUnavailable)?;

        let Some(user) = user else {
            verify_dummy(password);
            tracing::info!("Sign-in failed from {}", self.client.ip_address);
            return Err(SessionError::InvalidCredential);
        };

        if !verify_password(password, &user.password_hash)? {
            tracing::info!("Sign-in failed from {}", self.client.ip_address);
            return Err(SessionError::InvalidCredential);
        }

        let (new_id, lease) = self.service.cache.create().await?;
        self.leases.push(lease);

        let previous_id = mem::take(&mut self.session.id);
        if !previous_id.is_empty() {
            self.ended.push((previous_id.clone(), None));
            self.deferred.push(DeferredTask::DeleteRecord {
                session_id: previous_id,
            });
        }

        let csrf_token = if self.service.config.carry_csrf_on_login && !self.session.csrf_token.is_empty() {
            mem::take(&mut self.session.csrf_token)
        } else {
            generate_csrf_token()
        };

        self.session = Session {
            id: new_id.clone(),
            csrf_token,
            user_id: user.id,
            user_name: user.name,
            sign_in_time: Some(Utc::now()),
            ip_address: self.client.ip_address,
            user_agent: self.client.user_agent.clone(),
        };
        if let Some(record) = self.session.record() {
            self.deferred.push(DeferredTask::InsertRecord(record));
        }
        self.cookie = Some(CookieInstruction::Set(new_id));
        self.state = SessionState::Authenticated;

        tracing::info!("User {} signed in from {}", user.id, self.client.ip_address);
        Ok(self.session.clone())
    }

    /// End the current session. Calling it again is a no-op.
    pub fn destroy(&mut self) -> Result<(), SessionError> {
        if self.state == SessionState::Destroyed {
            return Ok(());
        }

        if self.session.is_materialized() {
            self.ended.push((self.session.id.clone(), None));
            if self.session.is_authenticated() {
                self.deferred.push(DeferredTask::DeleteRecord {
                    session_id: self.session.id.clone(),
                });
            }
        }
        if self.session.is_authenticated() {
            tracing::info!("User {} signed out", self.session.user_id);
        }

        self.expire();
        Ok(())
    }

    /// Active sessions of a user, newest sign-in first
    pub async fn get_active_sessions(&self, user_id: i64) -> Result<Vec<SessionSummary>, SessionError> {
        let records = self
            .service
            .session_repo
            .list_by_user(user_id)
            .await
            .map_err(SessionError::StoreUnavailable)?;

        let max_lifetime = self.service.config.max_lifetime();
        let now = Utc::now();

        Ok(records
            .into_iter()
            .filter(|record| !record.is_past_lifetime(max_lifetime, now))
            .map(|record| SessionSummary::from_record(record, &self.session.id))
            .collect())
    }

    /// End another session of the signed-in user.
    ///
    /// Returns `false` when no such session of this user exists.
    pub async fn revoke_session(&mut self, session_id: &str) -> Result<bool, SessionError> {
        if !self.session.is_authenticated() {
            return Err(SessionError::NotAuthenticated);
        }
        if session_id == self.session.id {
            self.destroy()?;
            return Ok(true);
        }
        if !is_well_formed_id(session_id) {
            return Ok(false);
        }

        let record = self
            .service
            .session_repo
            .get_by_id(session_id)
            .await
            .map_err(SessionError::StoreUnavailable)?;

        match record {
            Some(record) if record.user_id == self.session.user_id => {
                // its lock is not ours: a request running on it may still
                // write the payload back after the end marker
                self.ended.push((session_id.to_string(), None));
                self.deferred.push(DeferredTask::EvictEphemeral {
                    session_id: session_id.to_string(),
                });
                self.deferred.push(DeferredTask::DeleteRecord {
                    session_id: session_id.to_string(),
                });
                tracing::info!("User {} revoked one of their sessions", self.session.user_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// CSRF token of the session, issuing one if needed
    ///
    /// An anonymous session that asks for a token is kept past the request.
    pub fn csrf_token(&mut self) -> Result<String, SessionError> {
        if self.shut_down {
            return Err(SessionError::Internal(anyhow::anyhow!(
                "CSRF token requested after session shutdown"
            )));
        }
        if self.session.csrf_token.is_empty() {
            self.session.csrf_token = generate_csrf_token();
        }
        self.remember = true;
        Ok(self.session.csrf_token.clone())
    }

    pub fn verify_csrf(&self, token: &str) -> bool {
        tokens_match(&self.session.csrf_token, token)
    }

    /// Persist the session and release its locks. A second call is a no-op.
    pub async fn shutdown(&mut self) -> Result<(), SessionError> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;

        let result = self.persist().await;
        self.release_leases().await;
        result
    }

    async fn persist(&mut self) -> Result<(), SessionError> {
        for (session_id, successor) in mem::take(&mut self.ended) {
            self.service.cache.end(&session_id, successor.as_deref()).await?;
        }

        if !self.session.is_materialized() {
            if !self.remember {
                return Ok(());
            }
            let (session_id, lease) = self.service.cache.create().await?;
            self.leases.push(lease);
            self.session.id = session_id.clone();
            self.cookie = Some(CookieInstruction::Set(session_id));
            tracing::debug!("Materialized anonymous session");
        }

        self.service
            .cache
            .store(&self.session.id, &self.session.payload())
            .await?;
        Ok(())
    }

    async fn release_leases(&mut self) {
        for lease in mem::take(&mut self.leases) {
            self.service.cache.release(&lease).await;
        }
    }

    /// Forget the session and clear the cookie
    fn expire(&mut self) {
        self.session = Session::anonymous(self.client.ip_address, self.client.user_agent.clone());
        self.remember = false;
        self.cookie = Some(CookieInstruction::Clear);
        self.state = SessionState::Destroyed;
    }

    /// `Set-Cookie` value for the response, if the cookie changed
    pub fn set_cookie_header(&self) -> Option<String> {
        let config = &self.service.config;
        let mut header = match self.cookie.as_ref()? {
            CookieInstruction::Set(session_id) => format!(
                "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
                config.cookie_name,
                session_id,
                config.max_lifetime().num_seconds()
            ),
            CookieInstruction::Clear => format!(
                "{}=; Path=/; HttpOnly; SameSite=Lax; {}",
                config.cookie_name, CLEARED_COOKIE_ATTRIBUTES
            ),
        };
        if config.cookie_secure {
            header.push_str("; Secure");
        }
        Some(header)
    }

    /// Hand the queued side effects to the dispatcher
    pub fn take_deferred(&mut self) -> DeferredTaskQueue {
        mem::take(&mut self.deferred)
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if !self.leases.is_empty() {
            tracing::warn!(
                "Session manager dropped holding {} lock lease(s), they expire on their own",
                self.leases.len()
            );
        }
    }
}
