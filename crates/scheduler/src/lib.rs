//! Alarm scheduling.
//!
//! One contract, three backends: a claim-based poller over the durable alarm
//! table, a delegate that hands alarms to a SQL job queue owned by an
//! external job system, and a non-durable in-memory backend for store-less
//! runtimes. Delivery is at-least-once in every backend; alarm handlers must
//! be idempotent.

pub mod external;
pub mod memory;
pub mod poll;
pub mod singleton;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use store::{EntityKey, StoreError};

pub use external::{JobQueueConfig, JobQueueScheduler, JobWorker, setup_job_queue};
pub use memory::MemoryScheduler;
pub use poll::{PollConfig, PollScheduler, PollSweep};
pub use singleton::{SingletonGuard, setup_singleton_leases};

/// An alarm that has not fired yet.
#[derive(Clone, Debug, PartialEq)]
pub struct PendingAlarm {
    pub name: String,
    pub scheduled_at: DateTime<Utc>,
}

/// Result of delivering one alarm to its entity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FireOutcome {
    /// The alarm handler ran (and any state change persisted).
    Completed,
    /// The entity declares no alarm handler; treated as success.
    NoHandler,
    /// The state change could not be persisted; the alarm must be retried.
    PersistenceFailed(String),
    /// The handler failed for another reason; retried with a warning.
    Failed(String),
    /// The entity type or alarm name no longer exists; the record is an
    /// orphan and is dropped without retry.
    UnknownTarget,
}

/// Delivery side of the runtime: activates the target entity and runs its
/// alarm entry.
#[async_trait]
pub trait AlarmSink: Send + Sync {
    async fn fire(&self, key: &EntityKey, name: &str) -> FireOutcome;
}

/// The four scheduling operations shared by every backend.
#[async_trait]
pub trait AlarmScheduler: Send + Sync {
    /// Upsert an alarm due at `now + delay`, replacing any alarm with the
    /// same `(type, id, name)`.
    async fn schedule(&self, key: &EntityKey, name: &str, delay: Duration) -> Result<()>;

    /// Idempotent cancel; succeeds even when the alarm is absent.
    async fn cancel(&self, key: &EntityKey, name: &str) -> Result<()>;

    /// Remove every pending alarm of the entity.
    async fn cancel_all(&self, key: &EntityKey) -> Result<()>;

    /// Pending alarms in ascending `scheduled_at` order.
    async fn list(&self, key: &EntityKey) -> Result<Vec<PendingAlarm>>;
}

#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("alarm store error: {0}")]
    Store(#[from] StoreError),

    #[error("scheduler backend unavailable: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, ScheduleError>;
