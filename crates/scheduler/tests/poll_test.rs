use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;

use scheduler::{
    AlarmScheduler, AlarmSink, FireOutcome, PollConfig, PollScheduler, SingletonGuard,
    setup_singleton_leases,
};
use store::{Database, EntityKey, migrate};

async fn test_db() -> Result<Database> {
    let conn = sea_orm::Database::connect("sqlite::memory:").await?;
    let db = Database::from_connection(conn);
    migrate(db.connection(), None, 0).await?;
    Ok(db)
}

fn poll_scheduler(db: Database, claim_ttl: Duration) -> Arc<PollScheduler> {
    Arc::new(PollScheduler::new(
        db,
        None,
        PollConfig {
            polling_interval: Duration::from_millis(20),
            claim_ttl,
        },
    ))
}

/// Sink that counts firings and returns a scripted outcome.
struct ScriptedSink {
    fires: AtomicUsize,
    outcome: FireOutcome,
}

impl ScriptedSink {
    fn new(outcome: FireOutcome) -> Arc<Self> {
        Arc::new(Self {
            fires: AtomicUsize::new(0),
            outcome,
        })
    }

    fn fires(&self) -> usize {
        self.fires.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AlarmSink for ScriptedSink {
    async fn fire(&self, _key: &EntityKey, _name: &str) -> FireOutcome {
        self.fires.fetch_add(1, Ordering::SeqCst);
        self.outcome.clone()
    }
}

#[tokio::test]
async fn due_alarm_fires_once_and_is_retired() -> Result<()> {
    let db = test_db().await?;
    let scheduler = poll_scheduler(db, Duration::from_secs(60));
    let sink = ScriptedSink::new(FireOutcome::Completed);
    let key = EntityKey::new("counter", "a");

    scheduler.schedule(&key, "tick", Duration::ZERO).await?;
    let sweep = scheduler.poll_once(sink.as_ref()).await?;

    assert_eq!(sweep.claimed, 1);
    assert_eq!(sweep.retired, 1);
    assert_eq!(sink.fires(), 1);
    assert!(scheduler.list(&key).await?.is_empty());

    // Nothing left for the next sweep.
    let sweep = scheduler.poll_once(sink.as_ref()).await?;
    assert_eq!(sweep.selected, 0);
    assert_eq!(sink.fires(), 1);
    Ok(())
}

#[tokio::test]
async fn future_alarms_are_not_selected() -> Result<()> {
    let db = test_db().await?;
    let scheduler = poll_scheduler(db, Duration::from_secs(60));
    let sink = ScriptedSink::new(FireOutcome::Completed);
    let key = EntityKey::new("counter", "b");

    scheduler
        .schedule(&key, "tick", Duration::from_secs(600))
        .await?;
    let sweep = scheduler.poll_once(sink.as_ref()).await?;
    assert_eq!(sweep.selected, 0);
    assert_eq!(sink.fires(), 0);
    Ok(())
}

/// Sink that reschedules the same alarm while firing, the way a recurring
/// handler does.
struct ReschedulingSink {
    fires: AtomicUsize,
    scheduler: Arc<PollScheduler>,
    delay: Duration,
}

#[async_trait]
impl AlarmSink for ReschedulingSink {
    async fn fire(&self, key: &EntityKey, name: &str) -> FireOutcome {
        self.fires.fetch_add(1, Ordering::SeqCst);
        self.scheduler
            .schedule(key, name, self.delay)
            .await
            .expect("reschedule");
        FireOutcome::Completed
    }
}

#[tokio::test]
async fn reschedule_during_fire_survives_the_retire() -> Result<()> {
    let db = test_db().await?;
    let scheduler = poll_scheduler(db, Duration::from_secs(60));
    let key = EntityKey::new("counter", "c");
    let sink = Arc::new(ReschedulingSink {
        fires: AtomicUsize::new(0),
        scheduler: scheduler.clone(),
        delay: Duration::from_secs(30),
    });

    scheduler.schedule(&key, "tick", Duration::ZERO).await?;
    let sweep = scheduler.poll_once(sink.as_ref()).await?;

    assert_eq!(sweep.claimed, 1);
    assert_eq!(sweep.retired, 0);
    assert_eq!(sweep.rescheduled, 1);
    assert_eq!(sink.fires.load(Ordering::SeqCst), 1);

    // Exactly one row remains, unclaimed, with the new deadline.
    let record = scheduler
        .alarm_table()
        .get(&key, "tick")
        .await?
        .expect("row kept");
    assert!(record.claimed_at.is_none());
    assert!(record.scheduled_at > Utc::now() + chrono::Duration::seconds(20));
    Ok(())
}

#[tokio::test]
async fn stale_claim_is_refired_exactly_once_per_sweep() -> Result<()> {
    let db = test_db().await?;
    let claim_ttl = Duration::from_secs(60);
    let scheduler = poll_scheduler(db, claim_ttl);
    let sink = ScriptedSink::new(FireOutcome::Completed);
    let key = EntityKey::new("counter", "d");

    scheduler.schedule(&key, "tick", Duration::ZERO).await?;
    // Simulate a worker that died after claiming: the claim is twice the
    // TTL old.
    scheduler
        .alarm_table()
        .force_claim(&key, "tick", Some(Utc::now() - chrono::Duration::seconds(120)))
        .await?;

    let sweep = scheduler.poll_once(sink.as_ref()).await?;
    assert_eq!(sweep.claimed, 1);
    assert_eq!(sink.fires(), 1);
    Ok(())
}

#[tokio::test]
async fn persistence_failure_leaves_the_row_claimed() -> Result<()> {
    let db = test_db().await?;
    let scheduler = poll_scheduler(db, Duration::from_secs(60));
    let sink = ScriptedSink::new(FireOutcome::PersistenceFailed("disk full".into()));
    let key = EntityKey::new("counter", "e");

    scheduler.schedule(&key, "tick", Duration::ZERO).await?;
    let sweep = scheduler.poll_once(sink.as_ref()).await?;
    assert_eq!(sweep.left_claimed, 1);

    let record = scheduler
        .alarm_table()
        .get(&key, "tick")
        .await?
        .expect("row kept");
    assert!(record.claimed_at.is_some());

    // Within the TTL the row is not selected again.
    let sweep = scheduler.poll_once(sink.as_ref()).await?;
    assert_eq!(sweep.selected, 0);
    assert_eq!(sink.fires(), 1);
    Ok(())
}

#[tokio::test]
async fn orphaned_alarms_are_deleted_without_retry() -> Result<()> {
    let db = test_db().await?;
    let scheduler = poll_scheduler(db, Duration::from_secs(60));
    let sink = ScriptedSink::new(FireOutcome::UnknownTarget);
    let key = EntityKey::new("gone", "f");

    scheduler.schedule(&key, "tick", Duration::ZERO).await?;
    let sweep = scheduler.poll_once(sink.as_ref()).await?;
    assert_eq!(sweep.orphaned, 1);
    assert!(scheduler.list(&key).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn concurrent_sweeps_fire_each_row_once() -> Result<()> {
    let db = test_db().await?;
    let scheduler = poll_scheduler(db, Duration::from_secs(60));
    let sink = ScriptedSink::new(FireOutcome::Completed);
    let key = EntityKey::new("counter", "g");

    scheduler.schedule(&key, "tick", Duration::ZERO).await?;

    let (a, b) = tokio::join!(
        scheduler.poll_once(sink.as_ref()),
        scheduler.poll_once(sink.as_ref())
    );
    a?;
    b?;

    assert_eq!(sink.fires(), 1);
    Ok(())
}

#[tokio::test]
async fn schedule_is_an_upsert() -> Result<()> {
    let db = test_db().await?;
    let scheduler = poll_scheduler(db, Duration::from_secs(60));
    let key = EntityKey::new("counter", "h");

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

    scheduler.cancel(&key, "tick").await?;
    assert!(scheduler.list(&key).await?.is_empty());
    // Cancel stays Ok when nothing is pending.
    scheduler.cancel(&key, "tick").await?;
    Ok(())
}

#[tokio::test]
async fn singleton_lease_is_exclusive_until_it_expires() -> Result<()> {
    let db = test_db().await?;
    setup_singleton_leases(&db, None).await?;

    let a = SingletonGuard::new(db.clone(), None, "poller", "node-a", Duration::from_secs(60));
    let b = SingletonGuard::new(db.clone(), None, "poller", "node-b", Duration::from_secs(60));

    assert!(a.try_acquire().await?);
    // Renewal by the holder succeeds, a takeover attempt does not.
    assert!(a.try_acquire().await?);
    assert!(!b.try_acquire().await?);

    a.release().await?;
    assert!(b.try_acquire().await?);
    Ok(())
}

#[tokio::test]
async fn expired_lease_can_be_stolen() -> Result<()> {
    let db = test_db().await?;
    setup_singleton_leases(&db, None).await?;

    let a = SingletonGuard::new(db.clone(), None, "poller", "node-a", Duration::ZERO);
    let b = SingletonGuard::new(db.clone(), None, "poller", "node-b", Duration::from_secs(60));

    assert!(a.try_acquire().await?);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(b.try_acquire().await?);
    Ok(())
}
