use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;

use scheduler::{
    AlarmScheduler, AlarmSink, FireOutcome, JobQueueConfig, JobQueueScheduler, JobWorker,
    setup_job_queue,
};
use store::{Database, EntityKey};

async fn test_db() -> Result<Database> {
    let conn = sea_orm::Database::connect("sqlite::memory:").await?;
    let db = Database::from_connection(conn);
    setup_job_queue(&db, None).await?;
    Ok(db)
}

fn backend(db: &Database) -> (JobQueueScheduler, JobWorker) {
    let config = JobQueueConfig {
        max_attempts: 3,
        ..JobQueueConfig::default()
    };
    let scheduler = JobQueueScheduler::new(db.clone(), None, config.clone());
    let worker = JobWorker::new(db.clone(), None, config, Duration::from_millis(20));
    (scheduler, worker)
}

struct CountingSink {
    fires: AtomicUsize,
    outcome: FireOutcome,
}

impl CountingSink {
    fn new(outcome: FireOutcome) -> Arc<Self> {
        Arc::new(Self {
            fires: AtomicUsize::new(0),
            outcome,
        })
    }
}

#[async_trait]
impl AlarmSink for CountingSink {
    async fn fire(&self, _key: &EntityKey, _name: &str) -> FireOutcome {
        self.fires.fetch_add(1, Ordering::SeqCst);
        self.outcome.clone()
    }
}

#[tokio::test]
async fn schedule_replaces_the_pending_job() -> Result<()> {
    let db = test_db().await?;
    let (scheduler, _worker) = backend(&db);
    let key = EntityKey::new("counter", "a");

    scheduler
        .schedule(&key, "tick", Duration::from_secs(100))
        .await?;
    scheduler
        .schedule(&key, "tick", Duration::from_secs(200))
        .await?;

    let pending = scheduler.list(&key).await?;
    assert_eq!(pending.len(), 1);
    let expect = Utc::now() + chrono::Duration::seconds(200);
    assert!((pending[0].scheduled_at - expect).num_seconds().abs() < 5);
    Ok(())
}

#[tokio::test]
async fn delay_is_floored_to_whole_seconds() -> Result<()> {
    let db = test_db().await?;
    let (scheduler, _worker) = backend(&db);
    let key = EntityKey::new("counter", "b");

    scheduler
        .schedule(&key, "tick", Duration::from_millis(2900))
        .await?;
    let pending = scheduler.list(&key).await?;
    let delta = pending[0].scheduled_at - Utc::now();
    assert!(delta <= chrono::Duration::seconds(2));
    Ok(())
}

#[tokio::test]
async fn due_job_fires_and_completes() -> Result<()> {
    let db = test_db().await?;
    let (scheduler, worker) = backend(&db);
    let sink = CountingSink::new(FireOutcome::Completed);
    let key = EntityKey::new("counter", "c");

    scheduler.schedule(&key, "tick", Duration::ZERO).await?;
    let executed = worker.run_due_jobs(sink.as_ref()).await?;

    assert_eq!(executed, 1);
    assert_eq!(sink.fires.load(Ordering::SeqCst), 1);
    // Completed jobs no longer count as pending.
    assert!(scheduler.list(&key).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn failed_job_is_retried_later() -> Result<()> {
    let db = test_db().await?;
    let (scheduler, worker) = backend(&db);
    let sink = CountingSink::new(FireOutcome::PersistenceFailed("disk".into()));
    let key = EntityKey::new("counter", "d");

    scheduler.schedule(&key, "tick", Duration::ZERO).await?;
    let executed = worker.run_due_jobs(sink.as_ref()).await?;
    assert_eq!(executed, 1);

    // The retry is pending again, pushed into the future by the backoff.
    let pending = scheduler.list(&key).await?;
    assert_eq!(pending.len(), 1);
    assert!(pending[0].scheduled_at > Utc::now());

    // Not due yet, so an immediate second sweep does nothing.
    let executed = worker.run_due_jobs(sink.as_ref()).await?;
    assert_eq!(executed, 0);
    Ok(())
}

#[tokio::test]
async fn unknown_target_is_discarded_without_retry() -> Result<()> {
    let db = test_db().await?;
    let (scheduler, worker) = backend(&db);
    let sink = CountingSink::new(FireOutcome::UnknownTarget);
    let key = EntityKey::new("gone", "e");

    scheduler.schedule(&key, "tick", Duration::ZERO).await?;
    let executed = worker.run_due_jobs(sink.as_ref()).await?;
    assert_eq!(executed, 1);
    assert_eq!(sink.fires.load(Ordering::SeqCst), 1);
    assert!(scheduler.list(&key).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn cancel_all_cancels_every_pending_job() -> Result<()> {
    let db = test_db().await?;
    let (scheduler, _worker) = backend(&db);
    let key = EntityKey::new("counter", "f");

    scheduler.schedule(&key, "a", Duration::from_secs(50)).await?;
    scheduler.schedule(&key, "b", Duration::from_secs(60)).await?;
    scheduler.cancel_all(&key).await?;
    assert!(scheduler.list(&key).await?.is_empty());

    // Idempotent.
    scheduler.cancel_all(&key).await?;
    scheduler.cancel(&key, "a").await?;
    Ok(())
}

#[tokio::test]
async fn list_orders_by_scheduled_time() -> Result<()> {
    let db = test_db().await?;
    let (scheduler, _worker) = backend(&db);
    let key = EntityKey::new("counter", "g");

    scheduler
        .schedule(&key, "later", Duration::from_secs(300))
        .await?;
    scheduler
        .schedule(&key, "sooner", Duration::from_secs(30))
        .await?;

    let pending = scheduler.list(&key).await?;
    let names: Vec<&str> = pending.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["sooner", "later"]);
    Ok(())
}
