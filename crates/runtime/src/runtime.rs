//! The runtime facade.
//!
//! `Runtime::start` wires the store, the scheduler backend, the directory
//! and the cluster loops together and exposes the invocation and scheduling
//! surface. One runtime per process; tests start several against one shared
//! database to exercise cluster behavior.

use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use scheduler::{
    AlarmScheduler, AlarmSink, FireOutcome, PendingAlarm, PollConfig, PollScheduler,
    SingletonGuard, setup_singleton_leases,
};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use store::{Database, EntityKey, ObjectStore, Symbol};

use crate::catalog::Catalog;
use crate::cluster::{
    CallClient, CallServer, DistributedDirectory, Heartbeat, NodeTable, setup_cluster_tables,
};
use crate::config::{RegistryMode, RuntimeConfig, SchedulerBackend};
use crate::directory::{Directory, EntityRef, LocalDirectory, Location};
use crate::error::{Result, RuntimeError};
use crate::instance::{InvokeResult, StopReason};
use crate::placement::Placement;

const POLLER_SINGLETON: &str = "alarm_poller";

struct Inner {
    config: Arc<RuntimeConfig>,
    scheduler: Arc<dyn AlarmScheduler>,
    poll: Option<Arc<PollScheduler>>,
    directory: Arc<dyn Directory>,
    sink: Arc<LateBoundSink>,
    node_id: String,
    token: CancellationToken,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

/// The running node.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<Inner>,
}

impl Runtime {
    /// Wire everything and start the background loops.
    pub async fn start(config: RuntimeConfig, catalog: Catalog) -> Result<Runtime> {
        let config = Arc::new(config);
        let node_id = Uuid::new_v4().to_string();
        let token = CancellationToken::new();
        let mut tasks = Vec::new();

        let sink = Arc::new(LateBoundSink {
            catalog: catalog.clone(),
            directory: OnceLock::new(),
            fire_deadline: config.invoke_deadline,
        });

        // Scheduler backend. No store means nothing durable to poll, so the
        // in-memory backend takes over regardless of the configured one.
        let mut poll: Option<Arc<PollScheduler>> = None;
        let scheduler: Arc<dyn AlarmScheduler> = if config.store.is_none() {
            if config.database.is_some() {
                warn!("no store configured; alarms fall back to the in-memory scheduler");
            }
            Arc::new(scheduler::MemoryScheduler::new(
                sink.clone(),
                token.child_token(),
            ))
        } else {
            let db = require_database(&config)?;
            match config.scheduler {
                SchedulerBackend::Poll => {
                    let p = Arc::new(PollScheduler::new(
                        db.clone(),
                        config.prefix.clone(),
                        PollConfig {
                            polling_interval: config.polling_interval,
                            claim_ttl: config.claim_ttl,
                        },
                    ));
                    poll = Some(p.clone());
                    p
                }
                SchedulerBackend::ExternalJob => Arc::new(scheduler::JobQueueScheduler::new(
                    db.clone(),
                    config.prefix.clone(),
                    config.external_job.clone(),
                )),
            }
        };

        let placement = Arc::new(Placement::new(
            catalog,
            config.store.clone(),
            scheduler.clone(),
            config.clone(),
            token.clone(),
        ));

        let directory: Arc<dyn Directory> = match config.registry_mode {
            RegistryMode::Local => Arc::new(LocalDirectory::new(placement.clone())),
            RegistryMode::Distributed => {
                let db = require_database(&config)?;
                setup_cluster_tables(db, config.prefix.as_deref()).await?;
                setup_singleton_leases(db, config.prefix.as_deref())
                    .await
                    .map_err(RuntimeError::from)?;

                let nodes = NodeTable::new(db.clone(), config.prefix.clone(), config.node_ttl);
                tasks.push(
                    Heartbeat::new(nodes.clone(), node_id.clone()).spawn(token.child_token()),
                );

                let calls = Arc::new(CallClient::new(
                    db.clone(),
                    config.prefix.clone(),
                    config.call_poll_interval,
                ));
                tasks.push(
                    CallServer::new(
                        db.clone(),
                        config.prefix.clone(),
                        node_id.clone(),
                        placement.clone(),
                        config.call_poll_interval,
                    )
                    .spawn(token.child_token()),
                );

                Arc::new(DistributedDirectory::new(
                    db.clone(),
                    config.prefix.clone(),
                    node_id.clone(),
                    placement.clone(),
                    nodes,
                    calls,
                    config.cluster_members.clone(),
                ))
            }
        };

        // The sink needed the directory and the directory needed the
        // scheduler; close the loop now that both exist.
        sink.directory
            .set(directory.clone())
            .map_err(|_| RuntimeError::Config("alarm sink wired twice".to_owned()))?;

        if let (Some(p), true) = (&poll, config.run_poller) {
            match config.registry_mode {
                RegistryMode::Local => {
                    tasks.push(p.clone().spawn_poller(sink.clone(), token.child_token()));
                }
                RegistryMode::Distributed => {
                    // Exactly one poller cluster-wide; the lease guard hands
                    // the task around on node loss.
                    let db = require_database(&config)?;
                    let guard = SingletonGuard::new(
                        db.clone(),
                        config.prefix.clone(),
                        POLLER_SINGLETON,
                        node_id.clone(),
                        config.node_ttl,
                    );
                    let p = p.clone();
                    let sink_for_poller = sink.clone();
                    tasks.push(guard.spawn(
                        move |child| p.clone().spawn_poller(sink_for_poller.clone(), child),
                        token.child_token(),
                    ));
                }
            }
        }

        info!(node = %node_id, mode = ?config.registry_mode, "🚀 runtime started");
        Ok(Runtime {
            inner: Arc::new(Inner {
                config,
                scheduler,
                poll,
                directory,
                sink,
                node_id,
                token,
                tasks: Mutex::new(tasks),
            }),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    pub fn store(&self) -> Option<&Arc<dyn ObjectStore>> {
        self.inner.config.store.as_ref()
    }

    /// The poll backend, when it is the active scheduler. Tests drive
    /// `poll_once` through this.
    pub fn poll_scheduler(&self) -> Option<Arc<PollScheduler>> {
        self.inner.poll.clone()
    }

    /// The sink the schedulers fire through.
    pub fn alarm_sink(&self) -> Arc<dyn AlarmSink> {
        self.inner.sink.clone()
    }

    /// Invoke a handler with the default deadline.
    pub async fn invoke(
        &self,
        kind: &str,
        id: &str,
        handler: &str,
        args: Vec<Value>,
    ) -> InvokeResult {
        self.invoke_with_deadline(kind, id, handler, args, self.inner.config.invoke_deadline)
            .await
    }

    /// Invoke a handler, waiting at most `deadline` for the reply. The
    /// instance may still complete and persist after the caller gives up.
    pub async fn invoke_with_deadline(
        &self,
        kind: &str,
        id: &str,
        handler: &str,
        args: Vec<Value>,
        deadline: Duration,
    ) -> InvokeResult {
        if self.inner.token.is_cancelled() {
            return Err(RuntimeError::Shutdown);
        }
        let key = EntityKey::new(kind, id);
        let mut attempts = 0;
        loop {
            let entity = self.inner.directory.ensure(&key).await?;
            match entity.invoke(handler, args.clone(), deadline).await {
                // The instance idled out between lookup and send; activate a
                // fresh one and retry once.
                Err(RuntimeError::MailboxClosed) if attempts == 0 => {
                    attempts += 1;
                    continue;
                }
                other => return other,
            }
        }
    }

    /// Make sure an instance is live, returning where it runs.
    pub async fn ensure_activated(&self, kind: &str, id: &str) -> Result<Location> {
        let key = EntityKey::new(kind, id);
        let entity = self.inner.directory.ensure(&key).await?;
        Ok(match entity {
            EntityRef::Local(_) => Location::Local,
            EntityRef::Remote(remote) => Location::Node(remote.node_id().to_owned()),
        })
    }

    /// Stop a live instance; it reactivates on the next call.
    pub async fn deactivate(&self, kind: &str, id: &str, reason: StopReason) -> Result<bool> {
        let key = EntityKey::new(kind, id);
        self.inner.directory.deactivate(&key, reason).await
    }

    /// Where the entity currently lives, without activating it.
    pub async fn locate(&self, kind: &str, id: &str) -> Result<Option<Location>> {
        let key = EntityKey::new(kind, id);
        self.inner.directory.lookup(&key).await
    }

    pub async fn schedule_alarm(
        &self,
        kind: &str,
        id: &str,
        name: &str,
        delay: Duration,
    ) -> Result<()> {
        // Register the name so a later firing can resolve it.
        Symbol::intern(name);
        let key = EntityKey::new(kind, id);
        self.inner.scheduler.schedule(&key, name, delay).await?;
        Ok(())
    }

    pub async fn cancel_alarm(&self, kind: &str, id: &str, name: &str) -> Result<()> {
        let key = EntityKey::new(kind, id);
        self.inner.scheduler.cancel(&key, name).await?;
        Ok(())
    }

    pub async fn cancel_all_alarms(&self, kind: &str, id: &str) -> Result<()> {
        let key = EntityKey::new(kind, id);
        self.inner.scheduler.cancel_all(&key).await?;
        Ok(())
    }

    pub async fn list_alarms(&self, kind: &str, id: &str) -> Result<Vec<PendingAlarm>> {
        let key = EntityKey::new(kind, id);
        Ok(self.inner.scheduler.list(&key).await?)
    }

    /// Stop the background loops and every live instance.
    pub async fn shutdown(&self) {
        self.inner.token.cancel();
        self.inner.directory.shutdown().await;
        let tasks: Vec<_> = {
            let mut guard = self
                .inner
                .tasks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            guard.drain(..).collect()
        };
        for task in tasks {
            let _ = task.await;
        }
        info!(node = %self.inner.node_id, "runtime stopped");
    }
}

/// Fires alarms by routing through the directory. The directory is bound
/// after construction because the in-memory scheduler needs the sink before
/// the directory exists.
struct LateBoundSink {
    catalog: Catalog,
    directory: OnceLock<Arc<dyn Directory>>,
    fire_deadline: Duration,
}

#[async_trait]
impl AlarmSink for LateBoundSink {
    async fn fire(&self, key: &EntityKey, name: &str) -> FireOutcome {
        // A type that is no longer registered makes the alarm an orphan.
        if self.catalog.get(&key.kind).is_none() {
            return FireOutcome::UnknownTarget;
        }
        let Some(directory) = self.directory.get() else {
            return FireOutcome::Failed("alarm sink not wired yet".to_owned());
        };
        match directory.ensure(key).await {
            Ok(entity) => match entity.fire(name, self.fire_deadline).await {
                Ok(outcome) => outcome,
                Err(e) => FireOutcome::Failed(e.to_string()),
            },
            Err(RuntimeError::UnknownType(_)) => FireOutcome::UnknownTarget,
            // A failure of the routing layer counts as a handler failure:
            // the claim stays and the row retries after its TTL.
            Err(e) => FireOutcome::Failed(e.to_string()),
        }
    }
}

fn require_database(config: &RuntimeConfig) -> Result<&Database> {
    config.database.as_ref().ok_or_else(|| {
        RuntimeError::Config(
            "this configuration needs a database handle (poll scheduler, job queue or distributed mode)"
                .to_owned(),
        )
    })
}
