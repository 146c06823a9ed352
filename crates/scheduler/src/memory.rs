//! Non-durable in-memory backend.
//!
//! Used when the runtime has no store configured. A single task owns a
//! `DelayQueue` and a name index; the scheduling operations are commands
//! sent to that task, which keeps the upsert semantics identical to the
//! durable backends. Alarms do not survive a process restart.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::poll_fn;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::time::delay_queue::{DelayQueue, Key as QueueKey};
use tracing::{debug, warn};

use store::EntityKey;

use crate::{AlarmScheduler, AlarmSink, FireOutcome, PendingAlarm, Result, ScheduleError};

const RETRY_DELAY: Duration = Duration::from_secs(5);

type AlarmId = (EntityKey, String);

enum Command {
    Schedule {
        id: AlarmId,
        delay: Duration,
    },
    Cancel {
        id: AlarmId,
    },
    CancelAll {
        key: EntityKey,
    },
    List {
        key: EntityKey,
        reply: oneshot::Sender<Vec<PendingAlarm>>,
    },
}

/// In-memory alarm scheduler.
pub struct MemoryScheduler {
    commands: mpsc::Sender<Command>,
}

impl MemoryScheduler {
    pub fn new(sink: Arc<dyn AlarmSink>, token: CancellationToken) -> Self {
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(run(rx, sink, token));
        Self { commands: tx }
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ScheduleError::Backend("in-memory scheduler stopped".to_owned()))
    }
}

async fn run(
    mut commands: mpsc::Receiver<Command>,
    sink: Arc<dyn AlarmSink>,
    token: CancellationToken,
) {
    let mut queue: DelayQueue<AlarmId> = DelayQueue::new();
    let mut index: HashMap<AlarmId, (QueueKey, DateTime<Utc>)> = HashMap::new();

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            command = commands.recv() => {
                let Some(command) = command else { break };
                handle_command(command, &mut queue, &mut index);
            }
            expired = poll_fn(|cx| queue.poll_expired(cx)), if !index.is_empty() => {
                let Some(expired) = expired else { continue };
                let id = expired.into_inner();
                index.remove(&id);
                let (key, name) = id.clone();
                match sink.fire(&key, &name).await {
                    FireOutcome::Completed | FireOutcome::NoHandler => {
                        debug!(key = %key, name, "in-memory alarm fired");
                    }
                    FireOutcome::UnknownTarget => {
                        warn!(key = %key, name, "dropping in-memory alarm for unknown target");
                    }
                    FireOutcome::PersistenceFailed(cause) | FireOutcome::Failed(cause) => {
                        warn!(key = %key, name, cause, "in-memory alarm failed; retrying");
                        // A reschedule issued by the handler arrives as a later
                        // command and replaces this retry entry.
                        let queue_key = queue.insert(id.clone(), RETRY_DELAY);
                        let due = Utc::now()
                            + chrono::Duration::from_std(RETRY_DELAY)
                                .unwrap_or_else(|_| chrono::Duration::seconds(5));
                        index.insert(id, (queue_key, due));
                    }
                }
            }
        }
    }
}

fn handle_command(
    command: Command,
    queue: &mut DelayQueue<AlarmId>,
    index: &mut HashMap<AlarmId, (QueueKey, DateTime<Utc>)>,
) {
    match command {
        Command::Schedule { id, delay } => {
            if let Some((queue_key, _)) = index.remove(&id) {
                queue.try_remove(&queue_key);
            }
            let due =
                Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            let queue_key = queue.insert(id.clone(), delay);
            index.insert(id, (queue_key, due));
        }
        Command::Cancel { id } => {
            if let Some((queue_key, _)) = index.remove(&id) {
                queue.try_remove(&queue_key);
            }
        }
        Command::CancelAll { key } => {
            let ids: Vec<AlarmId> = index
                .keys()
                .filter(|(k, _)| *k == key)
                .cloned()
                .collect();
            for id in ids {
                if let Some((queue_key, _)) = index.remove(&id) {
                    queue.try_remove(&queue_key);
                }
            }
        }
        Command::List { key, reply } => {
            let mut pending: Vec<PendingAlarm> = index
                .iter()
                .filter(|((k, _), _)| *k == key)
                .map(|((_, name), (_, due))| PendingAlarm {
                    name: name.clone(),
                    scheduled_at: *due,
                })
                .collect();
            pending.sort_by_key(|a| a.scheduled_at);
            let _ = reply.send(pending);
        }
    }
}

#[async_trait]
impl AlarmScheduler for MemoryScheduler {
    async fn schedule(&self, key: &EntityKey, name: &str, delay: Duration) -> Result<()> {
        self.send(Command::Schedule {
            id: (key.clone(), name.to_owned()),
            delay,
        })
        .await
    }

    async fn cancel(&self, key: &EntityKey, name: &str) -> Result<()> {
        self.send(Command::Cancel {
            id: (key.clone(), name.to_owned()),
        })
        .await
    }

    async fn cancel_all(&self, key: &EntityKey) -> Result<()> {
        self.send(Command::CancelAll { key: key.clone() }).await
    }

    async fn list(&self, key: &EntityKey) -> Result<Vec<PendingAlarm>> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::List {
            key: key.clone(),
            reply: tx,
        })
        .await?;
        rx.await
            .map_err(|_| ScheduleError::Backend("in-memory scheduler stopped".to_owned()))
    }
}
