//! Placement: turning a name into a live instance.
//!
//! `activate` is the single entry point. It consults the local registry,
//! claims the name, spawns the instance task with a temporary lifecycle
//! (instances are recreated on demand, never restarted on crash), and waits
//! for the load to finish before handing out the address. If two activators
//! race, the registry claim picks the winner and the loser adopts its
//! handle.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use scheduler::AlarmScheduler;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use store::{EntityKey, ObjectStore};

use crate::catalog::Catalog;
use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError};
use crate::instance::{self, InstanceCtx, LocalHandle, StopReason};
use crate::registry::{Claim, LocalRegistry};

const MAILBOX_CAPACITY: usize = 64;

pub struct Placement {
    catalog: Catalog,
    store: Option<Arc<dyn ObjectStore>>,
    scheduler: Arc<dyn AlarmScheduler>,
    registry: Arc<LocalRegistry>,
    config: Arc<RuntimeConfig>,
    epochs: AtomicU64,
    shutdown: CancellationToken,
}

impl Placement {
    pub fn new(
        catalog: Catalog,
        store: Option<Arc<dyn ObjectStore>>,
        scheduler: Arc<dyn AlarmScheduler>,
        config: Arc<RuntimeConfig>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            catalog,
            store,
            scheduler,
            registry: Arc::new(LocalRegistry::new()),
            config,
            epochs: AtomicU64::new(1),
            shutdown,
        }
    }

    pub fn registry(&self) -> &Arc<LocalRegistry> {
        &self.registry
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Activate `(type, id)` locally, or return the already-live handle.
    pub async fn activate(&self, key: &EntityKey) -> Result<LocalHandle> {
        if let Some(handle) = self.registry.get(key) {
            if !handle.sender.is_closed() {
                return Ok(handle);
            }
            // The instance stopped but has not evicted itself yet.
            self.registry.remove_if_epoch(key, handle.epoch);
        }
        if self.shutdown.is_cancelled() {
            return Err(RuntimeError::Shutdown);
        }

        let kind = self
            .catalog
            .get(&key.kind)
            .ok_or_else(|| RuntimeError::UnknownType(key.kind.clone()))?;

        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let handle = LocalHandle {
            key: key.clone(),
            epoch: self.epochs.fetch_add(1, Ordering::Relaxed),
            sender: tx,
            cancel: self.shutdown.child_token(),
        };

        match self.registry.claim(handle.clone()) {
            Claim::Lost(winner) => {
                // Somebody else finished the claim first; use their instance.
                debug!(key = %key, "activation lost the registry race");
                return Ok(winner);
            }
            Claim::Won => {}
        }

        let options = kind.options();
        let ctx = InstanceCtx {
            key: key.clone(),
            kind: kind.clone(),
            store: self.store.clone(),
            scheduler: self.scheduler.clone(),
            registry: self.registry.clone(),
            epoch: handle.epoch,
            prefix: options
                .prefix
                .clone()
                .or_else(|| self.config.prefix.clone()),
            policy: options.object_keys.unwrap_or(self.config.object_keys),
            hibernate_after: Some(
                options
                    .hibernate_after
                    .unwrap_or(self.config.hibernate_after),
            ),
            shutdown_after: options.shutdown_after.or(self.config.shutdown_after),
            cancel: handle.cancel.clone(),
        };

        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(instance::run(ctx, rx, ready_tx));

        match ready_rx.await {
            Ok(Ok(())) => Ok(handle),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(RuntimeError::ActivationFailed(format!(
                "instance task for {key} aborted during load"
            ))),
        }
    }

    /// Stop a live instance. Returns false when nothing was live.
    pub async fn deactivate(&self, key: &EntityKey, reason: StopReason) -> bool {
        match self.registry.get(key) {
            Some(handle) => handle.stop(reason).await,
            None => false,
        }
    }

    /// Stop every live instance and wait for the mailboxes to drain.
    pub async fn shutdown(&self) {
        let handles = self.registry.drain_handles();
        for handle in handles {
            let _ = handle.stop(StopReason::Shutdown).await;
        }
    }
}
