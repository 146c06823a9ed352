//! External job-queue backend.
//!
//! Instead of polling the alarm table itself, this backend translates the
//! scheduling contract into rows of a SQL job queue owned by an external job
//! system: scheduling cancels any pending job for the same alarm and inserts
//! a fresh one, and the job system's worker loop delivers it. The backend
//! spawns nothing; durability and retry belong to the job system. The
//! [`JobWorker`] here is the adapter such a system runs to turn a claimed job
//! into an alarm firing.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::Value as DbValue;
use sea_orm::sea_query::{ColumnDef, Expr, Order, Query, SimpleExpr, Table};
use sea_orm::{ConnectionTrait, DeriveIden};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use store::{Database, EntityKey, prefixed};

use crate::{AlarmScheduler, AlarmSink, FireOutcome, PendingAlarm, Result};

#[derive(DeriveIden, Clone, Copy)]
enum JobQueue {
    Id,
    Queue,
    Worker,
    EntityType,
    EntityId,
    Alarm,
    State,
    ScheduledAt,
    Attempt,
    MaxAttempts,
    InsertedAt,
    UpdatedAt,
}

const STATE_AVAILABLE: &str = "available";
const STATE_SCHEDULED: &str = "scheduled";
const STATE_RETRYABLE: &str = "retryable";
const STATE_EXECUTING: &str = "executing";
const STATE_COMPLETED: &str = "completed";
const STATE_DISCARDED: &str = "discarded";
const STATE_CANCELLED: &str = "cancelled";

/// States that count as pending for cancel and list.
const PENDING_STATES: [&str; 3] = [STATE_AVAILABLE, STATE_SCHEDULED, STATE_RETRYABLE];

const DEFAULT_MAX_ATTEMPTS: i32 = 20;
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(300);

#[derive(Clone, Debug)]
pub struct JobQueueConfig {
    /// Queue the jobs are submitted to.
    pub queue: String,
    /// Worker identity the jobs are tagged with and filtered by.
    pub worker: String,
    pub max_attempts: i32,
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            queue: "alarms".to_owned(),
            worker: "entity.alarm".to_owned(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Create the job table if the external system has not provisioned it.
pub async fn setup_job_queue(db: &Database, prefix: Option<&str>) -> Result<()> {
    let conn = db.connection();
    let backend = conn.get_database_backend();
    let create = Table::create()
        .table(prefixed(prefix, "job_queue"))
        .if_not_exists()
        .col(
            ColumnDef::new(JobQueue::Id)
                .big_integer()
                .not_null()
                .auto_increment()
                .primary_key(),
        )
        .col(ColumnDef::new(JobQueue::Queue).string_len(190).not_null())
        .col(ColumnDef::new(JobQueue::Worker).string_len(190).not_null())
        .col(ColumnDef::new(JobQueue::EntityType).string_len(190).not_null())
        .col(ColumnDef::new(JobQueue::EntityId).string_len(190).not_null())
        .col(ColumnDef::new(JobQueue::Alarm).string_len(190).not_null())
        .col(ColumnDef::new(JobQueue::State).string_len(32).not_null())
        .col(
            ColumnDef::new(JobQueue::ScheduledAt)
                .timestamp_with_time_zone()
                .not_null(),
        )
        .col(
            ColumnDef::new(JobQueue::Attempt)
                .integer()
                .not_null()
                .default(0),
        )
        .col(ColumnDef::new(JobQueue::MaxAttempts).integer().not_null())
        .col(
            ColumnDef::new(JobQueue::InsertedAt)
                .timestamp_with_time_zone()
                .not_null(),
        )
        .col(
            ColumnDef::new(JobQueue::UpdatedAt)
                .timestamp_with_time_zone()
                .not_null(),
        )
        .to_owned();
    conn.execute(backend.build(&create))
        .await
        .map_err(store::StoreError::from)?;
    Ok(())
}

/// Scheduler delegating to the job queue.
pub struct JobQueueScheduler {
    db: Database,
    prefix: Option<String>,
    config: JobQueueConfig,
}

impl JobQueueScheduler {
    pub fn new(db: Database, prefix: Option<String>, config: JobQueueConfig) -> Self {
        Self { db, prefix, config }
    }

    fn table(&self) -> sea_orm::sea_query::Alias {
        prefixed(self.prefix.as_deref(), "job_queue")
    }

    async fn cancel_pending(&self, key: &EntityKey, name: Option<&str>) -> Result<u64> {
        let mut update = Query::update()
            .table(self.table())
            .value(JobQueue::State, STATE_CANCELLED)
            .value(JobQueue::UpdatedAt, Utc::now())
            .and_where(Expr::col(JobQueue::Queue).eq(self.config.queue.as_str()))
            .and_where(Expr::col(JobQueue::Worker).eq(self.config.worker.as_str()))
            .and_where(Expr::col(JobQueue::EntityType).eq(key.kind.as_str()))
            .and_where(Expr::col(JobQueue::EntityId).eq(key.id.as_str()))
            .and_where(Expr::col(JobQueue::State).is_in(PENDING_STATES))
            .to_owned();
        if let Some(name) = name {
            update.and_where(Expr::col(JobQueue::Alarm).eq(name));
        }

        let conn = self.db.connection();
        let result = conn
            .execute(conn.get_database_backend().build(&update))
            .await
            .map_err(store::StoreError::from)?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl AlarmScheduler for JobQueueScheduler {
    async fn schedule(&self, key: &EntityKey, name: &str, delay: Duration) -> Result<()> {
        // Replace-by-name: cancel whatever is pending, then enqueue. The job
        // system's scheduling resolution is whole seconds, so the delay is
        // floored.
        self.cancel_pending(key, Some(name)).await?;

        let now = Utc::now();
        let due = now + chrono::Duration::seconds(delay.as_secs() as i64);
        let values: Vec<DbValue> = vec![
            self.config.queue.clone().into(),
            self.config.worker.clone().into(),
            key.kind.clone().into(),
            key.id.clone().into(),
            name.to_owned().into(),
            STATE_SCHEDULED.into(),
            due.into(),
            0i32.into(),
            self.config.max_attempts.into(),
            now.into(),
            now.into(),
        ];
        let insert = Query::insert()
            .into_table(self.table())
            .columns([
                JobQueue::Queue,
                JobQueue::Worker,
                JobQueue::EntityType,
                JobQueue::EntityId,
                JobQueue::Alarm,
                JobQueue::State,
                JobQueue::ScheduledAt,
                JobQueue::Attempt,
                JobQueue::MaxAttempts,
                JobQueue::InsertedAt,
                JobQueue::UpdatedAt,
            ])
            .values_panic(values.into_iter().map(SimpleExpr::from))
            .to_owned();

        let conn = self.db.connection();
        conn.execute(conn.get_database_backend().build(&insert))
            .await
            .map_err(store::StoreError::from)?;
        Ok(())
    }

    async fn cancel(&self, key: &EntityKey, name: &str) -> Result<()> {
        self.cancel_pending(key, Some(name)).await?;
        Ok(())
    }

    async fn cancel_all(&self, key: &EntityKey) -> Result<()> {
        self.cancel_pending(key, None).await?;
        Ok(())
    }

    async fn list(&self, key: &EntityKey) -> Result<Vec<PendingAlarm>> {
        let query = Query::select()
            .columns([JobQueue::Alarm, JobQueue::ScheduledAt])
            .from(self.table())
            .and_where(Expr::col(JobQueue::Queue).eq(self.config.queue.as_str()))
            .and_where(Expr::col(JobQueue::Worker).eq(self.config.worker.as_str()))
            .and_where(Expr::col(JobQueue::EntityType).eq(key.kind.as_str()))
            .and_where(Expr::col(JobQueue::EntityId).eq(key.id.as_str()))
            .and_where(Expr::col(JobQueue::State).is_in(PENDING_STATES))
            .order_by(JobQueue::ScheduledAt, Order::Asc)
            .to_owned();

        let conn = self.db.connection();
        let rows = conn
            .query_all(conn.get_database_backend().build(&query))
            .await
            .map_err(store::StoreError::from)?;
        let mut pending = Vec::with_capacity(rows.len());
        for row in rows {
            pending.push(PendingAlarm {
                name: row.try_get("", "alarm").map_err(store::StoreError::from)?,
                scheduled_at: row
                    .try_get("", "scheduled_at")
                    .map_err(store::StoreError::from)?,
            });
        }
        Ok(pending)
    }
}

/// One claimed job as seen by the worker.
#[derive(Clone, Debug)]
struct ClaimedJob {
    id: i64,
    key: EntityKey,
    alarm: String,
    attempt: i32,
    max_attempts: i32,
}

/// Worker adapter run by the embedding job system: claims due jobs and
/// delivers them as alarm firings.
pub struct JobWorker {
    db: Database,
    prefix: Option<String>,
    config: JobQueueConfig,
    poll_interval: Duration,
}

impl JobWorker {
    pub fn new(
        db: Database,
        prefix: Option<String>,
        config: JobQueueConfig,
        poll_interval: Duration,
    ) -> Self {
        Self {
            db,
            prefix,
            config,
            poll_interval,
        }
    }

    fn table(&self) -> sea_orm::sea_query::Alias {
        prefixed(self.prefix.as_deref(), "job_queue")
    }

    pub fn spawn(
        self,
        sink: Arc<dyn AlarmSink>,
        token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(queue = %self.config.queue, "job worker started");
            let mut ticker = tokio::time::interval(self.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if let Err(e) = self.run_due_jobs(sink.as_ref()).await {
                    warn!("job worker sweep failed: {e}");
                }
            }
            info!("job worker stopped");
        })
    }

    /// Claim and execute every currently-due job. Public for tests and for
    /// job systems that drive execution themselves.
    pub async fn run_due_jobs(&self, sink: &dyn AlarmSink) -> Result<usize> {
        let mut executed = 0;
        while let Some(job) = self.claim_next().await? {
            self.execute(&job, sink).await?;
            executed += 1;
        }
        Ok(executed)
    }

    async fn claim_next(&self) -> Result<Option<ClaimedJob>> {
        let now = Utc::now();
        let query = Query::select()
            .columns([
                JobQueue::Id,
                JobQueue::EntityType,
                JobQueue::EntityId,
                JobQueue::Alarm,
                JobQueue::Attempt,
                JobQueue::MaxAttempts,
            ])
            .from(self.table())
            .and_where(Expr::col(JobQueue::Queue).eq(self.config.queue.as_str()))
            .and_where(Expr::col(JobQueue::Worker).eq(self.config.worker.as_str()))
            .and_where(Expr::col(JobQueue::State).is_in(PENDING_STATES))
            .and_where(Expr::col(JobQueue::ScheduledAt).lte(now))
            .order_by(JobQueue::ScheduledAt, Order::Asc)
            .limit(8)
            .to_owned();

        let conn = self.db.connection();
        let backend = conn.get_database_backend();
        let rows = conn
            .query_all(backend.build(&query))
            .await
            .map_err(store::StoreError::from)?;

        for row in rows {
            let id: i64 = row.try_get("", "id").map_err(store::StoreError::from)?;
            let claim = Query::update()
                .table(self.table())
                .value(JobQueue::State, STATE_EXECUTING)
                .value(JobQueue::Attempt, Expr::col(JobQueue::Attempt).add(1))
                .value(JobQueue::UpdatedAt, Utc::now())
                .and_where(Expr::col(JobQueue::Id).eq(id))
                .and_where(Expr::col(JobQueue::State).is_in(PENDING_STATES))
                .to_owned();
            let result = conn
                .execute(backend.build(&claim))
                .await
                .map_err(store::StoreError::from)?;
            if result.rows_affected() != 1 {
                // Lost the row to a concurrent worker.
                continue;
            }
            let attempt: i32 = row.try_get("", "attempt").map_err(store::StoreError::from)?;
            return Ok(Some(ClaimedJob {
                id,
                key: EntityKey {
                    kind: row
                        .try_get("", "entity_type")
                        .map_err(store::StoreError::from)?,
                    id: row
                        .try_get("", "entity_id")
                        .map_err(store::StoreError::from)?,
                },
                alarm: row.try_get("", "alarm").map_err(store::StoreError::from)?,
                attempt: attempt + 1,
                max_attempts: row
                    .try_get("", "max_attempts")
                    .map_err(store::StoreError::from)?,
            }));
        }
        Ok(None)
    }

    async fn execute(&self, job: &ClaimedJob, sink: &dyn AlarmSink) -> Result<()> {
        match sink.fire(&job.key, &job.alarm).await {
            FireOutcome::Completed | FireOutcome::NoHandler => {
                self.finish(job.id, STATE_COMPLETED, None).await
            }
            FireOutcome::UnknownTarget => {
                debug!(key = %job.key, alarm = %job.alarm, "discarding job for unknown target");
                self.finish(job.id, STATE_DISCARDED, None).await
            }
            FireOutcome::PersistenceFailed(cause) | FireOutcome::Failed(cause) => {
                if job.attempt >= job.max_attempts {
                    warn!(
                        key = %job.key,
                        alarm = %job.alarm,
                        cause,
                        "job exhausted its attempts; discarding"
                    );
                    self.finish(job.id, STATE_DISCARDED, None).await
                } else {
                    let backoff = retry_backoff(job.attempt);
                    debug!(
                        key = %job.key,
                        alarm = %job.alarm,
                        cause,
                        backoff_s = backoff.as_secs(),
                        "job failed; scheduling retry"
                    );
                    self.finish(
                        job.id,
                        STATE_RETRYABLE,
                        Some(Utc::now() + chrono::Duration::seconds(backoff.as_secs() as i64)),
                    )
                    .await
                }
            }
        }
    }

    async fn finish(
        &self,
        id: i64,
        state: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut update = Query::update()
            .table(self.table())
            .value(JobQueue::State, state)
            .value(JobQueue::UpdatedAt, Utc::now())
            .and_where(Expr::col(JobQueue::Id).eq(id))
            .to_owned();
        if let Some(at) = retry_at {
            update.value(JobQueue::ScheduledAt, at);
        }

        let conn = self.db.connection();
        conn.execute(conn.get_database_backend().build(&update))
            .await
            .map_err(store::StoreError::from)?;
        Ok(())
    }
}

fn retry_backoff(attempt: i32) -> Duration {
    let exp = attempt.clamp(0, 16) as u32;
    let secs = 2u64.saturating_pow(exp);
    Duration::from_secs(secs).min(MAX_RETRY_BACKOFF)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(retry_backoff(1), Duration::from_secs(2));
        assert_eq!(retry_backoff(3), Duration::from_secs(8));
        assert_eq!(retry_backoff(30), MAX_RETRY_BACKOFF);
    }
}
