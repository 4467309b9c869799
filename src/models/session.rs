//! Session models
//!
//! A session exists in two shapes:
//! - `Session` / `SessionPayload`: the live state held in the ephemeral cache
//! - `SessionRecord`: the durable projection kept in the `sessions` table

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Live session for the current request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Session identifier; empty until the session has been materialized
    pub id: String,
    /// Per-session CSRF token; empty until issued
    pub csrf_token: String,
    /// `0` for anonymous visitors
    pub user_id: i64,
    /// Display name, the client IP for anonymous visitors
    pub user_name: String,
    /// Set once at sign-in, never touched by identifier rotation
    pub sign_in_time: Option<DateTime<Utc>>,
    /// Client address captured when the session was initialized
    pub ip_address: IpAddr,
    /// Client user agent captured when the session was initialized
    pub user_agent: String,
}

impl Session {
    /// Create an anonymous, not yet materialized session for a client
    pub fn anonymous(ip_address: IpAddr, user_agent: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            csrf_token: String::new(),
            user_id: 0,
            user_name: display_ip(ip_address),
            sign_in_time: None,
            ip_address,
            user_agent: user_agent.into(),
        }
    }

    /// Rebuild a session from an ephemeral cache entry
    pub fn from_payload(id: impl Into<String>, payload: SessionPayload) -> Self {
        Self {
            id: id.into(),
            csrf_token: payload.csrf_token,
            user_id: payload.user_id,
            user_name: payload.user_name,
            sign_in_time: payload.sign_in_time,
            ip_address: payload.ip_address,
            user_agent: payload.user_agent,
        }
    }

    /// The part of the session stored in the ephemeral cache
    pub fn payload(&self) -> SessionPayload {
        SessionPayload {
            csrf_token: self.csrf_token.clone(),
            user_id: self.user_id,
            user_name: self.user_name.clone(),
            sign_in_time: self.sign_in_time,
            ip_address: self.ip_address,
            user_agent: self.user_agent.clone(),
        }
    }

    /// Durable projection of an authenticated session
    ///
    /// Returns `None` for anonymous sessions, which never get a record.
    pub fn record(&self) -> Option<SessionRecord> {
        if !self.is_authenticated() || self.id.is_empty() {
            return None;
        }
        Some(SessionRecord {
            session_id: self.id.clone(),
            user_id: self.user_id,
            ip_address: self.ip_address,
            user_agent: self.user_agent.clone(),
            sign_in: self.sign_in_time.unwrap_or_else(Utc::now),
        })
    }

    pub fn is_authenticated(&self) -> bool {
        self.user_id > 0
    }

    /// Whether the session has been assigned an identifier
    pub fn is_materialized(&self) -> bool {
        !self.id.is_empty()
    }
}

/// Serialized session state stored under the session identifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionPayload {
    pub csrf_token: String,
    pub user_id: i64,
    pub user_name: String,
    pub sign_in_time: Option<DateTime<Utc>>,
    pub ip_address: IpAddr,
    pub user_agent: String,
}

/// Row of the persistent `sessions` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub user_id: i64,
    pub ip_address: IpAddr,
    pub user_agent: String,
    pub sign_in: DateTime<Utc>,
}

impl SessionRecord {
    /// Whether the record is older than the absolute session lifetime
    pub fn is_past_lifetime(&self, max_lifetime: chrono::Duration, now: DateTime<Utc>) -> bool {
        self.sign_in + max_lifetime < now
    }

    /// The same session moved to a new identifier for the given client
    pub fn rotated(&self, new_id: impl Into<String>, ip_address: IpAddr, user_agent: impl Into<String>) -> Self {
        Self {
            session_id: new_id.into(),
            user_id: self.user_id,
            ip_address,
            user_agent: user_agent.into(),
            sign_in: self.sign_in,
        }
    }
}

/// Entry of the "active sessions" view
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    /// Human readable client address
    pub ip_address: String,
    pub user_agent: String,
    pub sign_in_time: DateTime<Utc>,
    /// Whether this is the session making the request
    pub current: bool,
}

impl SessionSummary {
    pub fn from_record(record: SessionRecord, current_id: &str) -> Self {
        let current = !current_id.is_empty() && record.session_id == current_id;
        Self {
            ip_address: display_ip(record.ip_address),
            current,
            session_id: record.session_id,
            user_agent: record.user_agent,
            sign_in_time: record.sign_in,
        }
    }
}

/// Lifecycle state of the session handled by a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// No authenticated user
    Anonymous,
    /// Cookie present, stores being reconciled
    Resuming,
    /// Signed-in user with a valid CSRF token
    Authenticated,
    /// Terminal for the identifier the request arrived with
    Destroyed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Anonymous => write!(f, "anonymous"),
            SessionState::Resuming => write!(f, "resuming"),
            SessionState::Authenticated => write!(f, "authenticated"),
            SessionState::Destroyed => write!(f, "destroyed"),
        }
    }
}

/// Render an address for display, unwrapping IPv4-mapped IPv6 addresses
pub fn display_ip(ip: IpAddr) -> String {
    ip.to_canonical().to_string()
}
