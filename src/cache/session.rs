//! Ephemeral session cache
//!
//! Session payloads live under `sess:{id}` and expire after the configured
//! TTL. Requests carrying the same identifier are serialized by a lease lock
//! under `sess_lock:{id}`: the holder writes a random owner token with its own
//! TTL, and only that owner may delete it again. A holder that never releases
//! its lease blocks the identifier for at most the lock TTL.
//!
//! An identifier that was signed out, replaced or revoked gets an end marker
//! under `sess_end:{id}`. The marker outlives any payload a still running
//! request may write back, so the identifier can never be resumed again. A
//! marker left by recovery names the successor identifier, which requests
//! queued on the old identifier adopt.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use super::{Cache, CacheLayer};
use crate::config::SessionConfig;
use crate::models::SessionPayload;
use crate::services::csrf::generate_session_id;

pub(crate) const PAYLOAD_PREFIX: &str = "sess:";
pub(crate) const LOCK_PREFIX: &str = "sess_lock:";
pub(crate) const ENDED_PREFIX: &str = "sess_end:";

/// Fresh identifiers tried before giving up on `create`
const CREATE_ATTEMPTS: usize = 8;

/// Error type for ephemeral session operations
#[derive(Debug, thiserror::Error)]
pub enum SessionCacheError {
    /// Backing store failed or is unreachable
    #[error("Ephemeral session store unavailable: {0}")]
    Unavailable(#[from] anyhow::Error),

    /// Lock still held by another request after the configured wait
    #[error("Timed out waiting for session lock")]
    LockTimeout,
}

/// Proof of holding the lock of one identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLease {
    key: String,
    token: String,
}

/// Left behind by an identifier that must not be resumed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndMarker {
    /// Identifier the session moved to, if it lives on
    pub successor: Option<String>,
}

/// What the identifier of a cookie turned out to point at
#[derive(Debug)]
pub enum OpenedSession {
    /// Live entry under `id`: the cookie identifier, or its successor
    Live {
        id: String,
        payload: SessionPayload,
        leases: Vec<LockLease>,
    },
    /// No entry; `id` is a freshly assigned and locked identifier
    Missing { id: String, leases: Vec<LockLease> },
    /// The identifier was ended and has no live successor
    Ended { leases: Vec<LockLease> },
}

enum Resolved {
    Live(String, SessionPayload),
    Missing(String),
    Ended,
}

/// Session-aware wrapper around the ephemeral [`Cache`]
#[derive(Debug, Clone)]
pub struct EphemeralSessionCache {
    cache: Arc<Cache>,
    ttl: Duration,
    lock_ttl: Duration,
    lock_wait: Duration,
    lock_poll: Duration,
}

fn payload_key(session_id: &str) -> String {
    format!("{}{}", PAYLOAD_PREFIX, session_id)
}

fn lock_key(session_id: &str) -> String {
    format!("{}{}", LOCK_PREFIX, session_id)
}

fn ended_key(session_id: &str) -> String {
    format!("{}{}", ENDED_PREFIX, session_id)
}

impl EphemeralSessionCache {
    pub fn new(cache: Arc<Cache>, config: &SessionConfig) -> Self {
        Self {
            cache,
            ttl: config.ttl(),
            lock_ttl: config.lock_ttl(),
            lock_wait: config.lock_wait(),
            lock_poll: config.lock_poll(),
        }
    }

    /// Check that the backing store is reachable
    pub async fn ping(&self) -> Result<(), SessionCacheError> {
        Ok(self.cache.ping().await?)
    }

    /// Take the lock of `session_id`, waiting up to the configured bound.
    pub async fn lock(&self, session_id: &str) -> Result<LockLease, SessionCacheError> {
        let deadline = Instant::now() + self.lock_wait;
        let mut waited = false;

        loop {
            if let Some(lease) = self.try_lock(session_id).await? {
                if waited {
                    tracing::debug!("Acquired session lock after waiting");
                }
                return Ok(lease);
            }
            if Instant::now() >= deadline {
                tracing::warn!("Timed out after {:?} waiting for a session lock", self.lock_wait);
                return Err(SessionCacheError::LockTimeout);
            }
            waited = true;
            tokio::time::sleep(self.lock_poll).await;
        }
    }

    /// Take the lock of `session_id` if it is free right now
    pub async fn try_lock(&self, session_id: &str) -> Result<Option<LockLease>, SessionCacheError> {
        let lease = LockLease {
            key: lock_key(session_id),
            token: Uuid::new_v4().simple().to_string(),
        };

        if self.cache.set_if_absent(&lease.key, &lease.token, self.lock_ttl).await? {
            Ok(Some(lease))
        } else {
            Ok(None)
        }
    }

    /// Release a lease.
    ///
    /// Returns `false` when the lock had already expired or been taken over.
    pub async fn unlock(&self, lease: &LockLease) -> Result<bool, SessionCacheError> {
        Ok(self.cache.delete_if_eq(&lease.key, &lease.token).await?)
    }

    pub async fn load(&self, session_id: &str) -> Result<Option<SessionPayload>, SessionCacheError> {
        Ok(self.cache.get(&payload_key(session_id)).await?)
    }

    /// Write a payload, restarting its TTL
    pub async fn store(&self, session_id: &str, payload: &SessionPayload) -> Result<(), SessionCacheError> {
        Ok(self.cache.set(&payload_key(session_id), payload, self.ttl).await?)
    }

    pub async fn remove(&self, session_id: &str) -> Result<(), SessionCacheError> {
        Ok(self.cache.delete(&payload_key(session_id)).await?)
    }

    /// Mark `session_id` as ended and drop its payload.
    ///
    /// The marker lives for the payload TTL plus the lock TTL, longer than
    /// any payload a request still holding the old identifier can write.
    pub async fn end(&self, session_id: &str, successor: Option<&str>) -> Result<(), SessionCacheError> {
        let marker = EndMarker {
            successor: successor.map(str::to_string),
        };
        self.cache
            .set(&ended_key(session_id), &marker, self.ttl + self.lock_ttl)
            .await?;
        self.remove(session_id).await
    }

    /// End marker of `session_id`, if it was ended
    pub async fn ended(&self, session_id: &str) -> Result<Option<EndMarker>, SessionCacheError> {
        Ok(self.cache.get(&ended_key(session_id)).await?)
    }

    /// Assign a fresh, unused identifier and lock it
    pub async fn create(&self) -> Result<(String, LockLease), SessionCacheError> {
        for _ in 0..CREATE_ATTEMPTS {
            let session_id = generate_session_id();
            let Some(lease) = self.try_lock(&session_id).await? else {
                continue;
            };
            match self.load(&session_id).await {
                Ok(None) => return Ok((session_id, lease)),
                Ok(Some(_)) => self.release(&lease).await,
                Err(e) => {
                    self.release(&lease).await;
                    return Err(e);
                }
            }
        }

        Err(SessionCacheError::Unavailable(anyhow::anyhow!(
            "No unused session identifier after {} attempts",
            CREATE_ATTEMPTS
        )))
    }

    /// Lock the entry of a client-supplied identifier and read it.
    ///
    /// When the identifier has no entry, a fresh identifier is assigned and
    /// locked as well; the lease on the cookie identifier is kept so that
    /// concurrent requests with the same stale cookie still queue up.
    pub async fn open(&self, cookie_id: &str) -> Result<OpenedSession, SessionCacheError> {
        let mut leases = vec![self.lock(cookie_id).await?];

        match self.resolve(cookie_id, &mut leases).await {
            Ok(Resolved::Live(id, payload)) => Ok(OpenedSession::Live { id, payload, leases }),
            Ok(Resolved::Missing(id)) => Ok(OpenedSession::Missing { id, leases }),
            Ok(Resolved::Ended) => Ok(OpenedSession::Ended { leases }),
            Err(e) => {
                for lease in &leases {
                    self.release(lease).await;
                }
                Err(e)
            }
        }
    }

    async fn resolve(&self, cookie_id: &str, leases: &mut Vec<LockLease>) -> Result<Resolved, SessionCacheError> {
        if let Some(marker) = self.ended(cookie_id).await? {
            self.remove(cookie_id).await?;

            let Some(successor) = marker.successor else {
                tracing::debug!("Session identifier was ended");
                return Ok(Resolved::Ended);
            };
            leases.push(self.lock(&successor).await?);
            if self.ended(&successor).await?.is_some() {
                return Ok(Resolved::Ended);
            }
            return Ok(match self.load(&successor).await? {
                Some(payload) => {
                    tracing::debug!("Following session identifier to its successor");
                    Resolved::Live(successor, payload)
                }
                None => Resolved::Ended,
            });
        }

        if let Some(payload) = self.load(cookie_id).await? {
            tracing::debug!("Ephemeral session hit");
            return Ok(Resolved::Live(cookie_id.to_string(), payload));
        }

        tracing::debug!("Ephemeral session miss, assigning a new identifier");
        let (session_id, lease) = self.create().await?;
        leases.push(lease);
        Ok(Resolved::Missing(session_id))
    }

    /// Unlock, logging instead of failing
    pub async fn release(&self, lease: &LockLease) {
        match self.unlock(lease).await {
            Ok(true) => {}
            Ok(false) => tracing::warn!("Session lock {} expired before release", lease.key),
            Err(e) => tracing::warn!("Failed to release session lock {}: {}", lease.key, e),
        }
    }
}
