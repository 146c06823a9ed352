//! Claim-based polling backend.
//!
//! The poller scans the alarm table once per interval for rows that are due
//! and either unclaimed or stale-claimed, claims each row with a conditional
//! update, fires it, and retires it with a conditional delete keyed on the
//! exact claim timestamp. A handler that reschedules the same name during
//! the firing clears the claim, so the conditional delete misses and the new
//! row survives. A worker that dies between claim and retire leaves the row
//! claimed until `claim_ttl` elapses, after which any poller retries it;
//! this is the only source of duplicate delivery.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use store::{AlarmTable, Database, EntityKey};

use crate::{AlarmScheduler, AlarmSink, FireOutcome, PendingAlarm, Result};

#[derive(Clone, Debug)]
pub struct PollConfig {
    pub polling_interval: Duration,
    pub claim_ttl: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            polling_interval: Duration::from_secs(30),
            claim_ttl: Duration::from_secs(60),
        }
    }
}

/// Counters from one poll sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PollSweep {
    pub selected: usize,
    pub claimed: usize,
    pub retired: usize,
    pub rescheduled: usize,
    pub orphaned: usize,
    pub left_claimed: usize,
}

/// Scheduler over the durable alarm table.
pub struct PollScheduler {
    alarms: AlarmTable,
    config: PollConfig,
}

impl PollScheduler {
    pub fn new(db: Database, prefix: Option<String>, config: PollConfig) -> Self {
        Self {
            alarms: AlarmTable::new(db, prefix),
            config,
        }
    }

    pub fn alarm_table(&self) -> &AlarmTable {
        &self.alarms
    }

    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    /// Run the poller until cancellation. In a cluster this task must be a
    /// singleton; wrap it with [`crate::SingletonGuard`].
    pub fn spawn_poller(
        self: Arc<Self>,
        sink: Arc<dyn AlarmSink>,
        token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let this = self;
        tokio::spawn(async move {
            info!(
                interval_ms = this.config.polling_interval.as_millis() as u64,
                "⏰ alarm poller started"
            );
            let mut ticker = tokio::time::interval(this.config.polling_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match this.poll_once(sink.as_ref()).await {
                    Ok(sweep) if sweep.selected > 0 => {
                        debug!(?sweep, "poll sweep finished");
                    }
                    Ok(_) => {}
                    Err(e) => error!("poll sweep failed: {e}"),
                }
            }
            info!("alarm poller stopped");
        })
    }

    /// One sweep over the due rows. Public so tests and the singleton guard
    /// can drive the poller directly.
    pub async fn poll_once(&self, sink: &dyn AlarmSink) -> Result<PollSweep> {
        let now = Utc::now();
        let stale_threshold = now
            - chrono::Duration::from_std(self.config.claim_ttl)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));

        let due = self.alarms.due(now, stale_threshold).await?;
        let mut sweep = PollSweep {
            selected: due.len(),
            ..PollSweep::default()
        };

        for record in due {
            let now_claim = Utc::now();
            if !self
                .alarms
                .claim(&record.key, &record.name, now_claim, stale_threshold)
                .await?
            {
                // Another poller owns this row.
                continue;
            }
            sweep.claimed += 1;

            let outcome = sink.fire(&record.key, &record.name).await;
            match outcome {
                FireOutcome::Completed | FireOutcome::NoHandler => {
                    if self
                        .alarms
                        .retire_claimed(&record.key, &record.name, now_claim)
                        .await?
                    {
                        sweep.retired += 1;
                    } else {
                        // The handler re-upserted the alarm mid-flight; the
                        // fresh row keeps its new deadline.
                        sweep.rescheduled += 1;
                    }
                }
                FireOutcome::PersistenceFailed(cause) => {
                    debug!(
                        key = %record.key,
                        name = %record.name,
                        cause,
                        "alarm firing could not persist; row stays claimed for retry"
                    );
                    sweep.left_claimed += 1;
                }
                FireOutcome::Failed(cause) => {
                    warn!(
                        key = %record.key,
                        name = %record.name,
                        cause,
                        "alarm firing failed; row stays claimed for retry"
                    );
                    sweep.left_claimed += 1;
                }
                FireOutcome::UnknownTarget => {
                    warn!(
                        key = %record.key,
                        name = %record.name,
                        "dropping orphaned alarm for unknown target"
                    );
                    self.alarms.delete(&record.key, &record.name).await?;
                    sweep.orphaned += 1;
                }
            }
        }

        Ok(sweep)
    }
}

#[async_trait]
impl AlarmScheduler for PollScheduler {
    async fn schedule(&self, key: &EntityKey, name: &str, delay: Duration) -> Result<()> {
        let due = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        self.alarms.upsert(key, name, due).await?;
        Ok(())
    }

    async fn cancel(&self, key: &EntityKey, name: &str) -> Result<()> {
        self.alarms.delete(key, name).await?;
        Ok(())
    }

    async fn cancel_all(&self, key: &EntityKey) -> Result<()> {
        self.alarms.delete_all(key).await?;
        Ok(())
    }

    async fn list(&self, key: &EntityKey) -> Result<Vec<PendingAlarm>> {
        let records = self.alarms.list(key).await?;
        Ok(records
            .into_iter()
            .map(|r| PendingAlarm {
                name: r.name,
                scheduled_at: r.scheduled_at,
            })
            .collect())
    }
}
