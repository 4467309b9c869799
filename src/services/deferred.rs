//! Deferred session writes
//!
//! Persistent-record mutations and ephemeral evictions decided during a
//! request are queued as plain data and executed once the response exists.
//! Execution is strictly in enqueue order; a failing task is logged and the
//! rest still run. Nothing is retried.

use std::fmt;
use std::sync::Arc;

use crate::cache::EphemeralSessionCache;
use crate::db::repositories::SessionRepository;
use crate::models::SessionRecord;

use super::session::SessionError;

/// One side effect to run after the response
#[derive(Debug, Clone, PartialEq)]
pub enum DeferredTask {
    /// Create the persistent row of a newly authenticated session
    InsertRecord(SessionRecord),
    /// Move the persistent row of `from` to `record.session_id`
    RotateRecord { from: String, record: SessionRecord },
    /// Drop the persistent row of an identifier
    DeleteRecord { session_id: String },
    /// Drop the ephemeral entry of an identifier
    EvictEphemeral { session_id: String },
}

/// Short prefix of an identifier, enough to correlate log lines
fn id_prefix(session_id: &str) -> &str {
    session_id.get(..8).unwrap_or(session_id)
}

impl fmt::Display for DeferredTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeferredTask::InsertRecord(record) => write!(
                f,
                "insert session record {}.. for user {}",
                id_prefix(&record.session_id),
                record.user_id
            ),
            DeferredTask::RotateRecord { from, record } => write!(
                f,
                "rotate session record {}.. to {}.. for user {}",
                id_prefix(from),
                id_prefix(&record.session_id),
                record.user_id
            ),
            DeferredTask::DeleteRecord { session_id } => {
                write!(f, "delete session record {}..", id_prefix(session_id))
            }
            DeferredTask::EvictEphemeral { session_id } => {
                write!(f, "evict ephemeral session {}..", id_prefix(session_id))
            }
        }
    }
}

/// Stores the deferred tasks act on
#[derive(Clone)]
pub struct DeferredExecutor {
    session_repo: Arc<dyn SessionRepository>,
    cache: EphemeralSessionCache,
}

impl DeferredExecutor {
    pub fn new(session_repo: Arc<dyn SessionRepository>, cache: EphemeralSessionCache) -> Self {
        Self { session_repo, cache }
    }

    async fn execute(&self, task: &DeferredTask) -> anyhow::Result<()> {
        match task {
            DeferredTask::InsertRecord(record) => self.session_repo.insert(record).await,
            DeferredTask::RotateRecord { from, record } => {
                if !self.session_repo.rotate(from, record).await? {
                    tracing::warn!(
                        "Session record {}.. vanished before rotation, not recreating it",
                        id_prefix(from)
                    );
                }
                Ok(())
            }
            DeferredTask::DeleteRecord { session_id } => {
                self.session_repo.delete(session_id).await.map(|_| ())
            }
            DeferredTask::EvictEphemeral { session_id } => {
                self.cache.remove(session_id).await.map_err(anyhow::Error::from)
            }
        }
    }
}

/// Outcome of a flush
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub executed: usize,
    pub failed: usize,
}

/// Ordered list of deferred tasks owned by one request
#[derive(Debug, Default)]
pub struct DeferredTaskQueue {
    tasks: Vec<DeferredTask>,
}

impl DeferredTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, task: DeferredTask) {
        tracing::debug!("Deferred: {}", task);
        self.tasks.push(task);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Run every task in order, consuming the queue
    pub async fn flush(self, executor: &DeferredExecutor) -> FlushReport {
        let mut report = FlushReport::default();

        for task in self.tasks {
            report.executed += 1;
            if let Err(source) = executor.execute(&task).await {
                report.failed += 1;
                let error = SessionError::DeferredTaskFailure {
                    task: task.to_string(),
                    source,
                };
                tracing::error!("{:#}", anyhow::Error::new(error));
            }
        }

        if report.failed > 0 {
            tracing::warn!(
                "Deferred flush finished with {}/{} failed task(s)",
                report.failed,
                report.executed
            );
        }

        report
    }
}
