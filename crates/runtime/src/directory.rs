//! The cluster adapter seam.
//!
//! All higher layers address entities through [`Directory`]; whether the
//! instance lives in this process or on another node is the directory's
//! concern. The local implementation wraps [`Placement`] directly; the
//! distributed one adds DB-backed placement rows and remote calls.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use scheduler::FireOutcome;
use serde_json::Value;

use store::EntityKey;

use crate::error::{Result, RuntimeError};
use crate::instance::{InvokeResult, LocalHandle, StopReason};
use crate::placement::Placement;

/// Where an entity currently lives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Location {
    Local,
    Node(String),
}

/// An addressable live entity: local mailbox or remote mailbox row.
pub enum EntityRef {
    Local(LocalHandle),
    Remote(RemoteRef),
}

impl EntityRef {
    pub async fn invoke(&self, handler: &str, args: Vec<Value>, deadline: Duration) -> InvokeResult {
        match self {
            EntityRef::Local(handle) => handle.invoke(handler, args, deadline).await,
            EntityRef::Remote(remote) => remote.invoke(handler, args, deadline).await,
        }
    }

    pub async fn fire(&self, name: &str, deadline: Duration) -> std::result::Result<FireOutcome, RuntimeError> {
        match self {
            EntityRef::Local(handle) => handle.fire(name).await,
            EntityRef::Remote(remote) => remote.fire(name, deadline).await,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, EntityRef::Local(_))
    }
}

/// A reference to an entity hosted by another node, reached through the
/// shared call table.
pub struct RemoteRef {
    pub(crate) node_id: String,
    pub(crate) key: EntityKey,
    pub(crate) calls: Arc<crate::cluster::CallClient>,
}

impl RemoteRef {
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub async fn invoke(&self, handler: &str, args: Vec<Value>, deadline: Duration) -> InvokeResult {
        self.calls
            .invoke(&self.node_id, &self.key, handler, args, deadline)
            .await
    }

    pub async fn fire(
        &self,
        name: &str,
        deadline: Duration,
    ) -> std::result::Result<FireOutcome, RuntimeError> {
        self.calls.fire(&self.node_id, &self.key, name, deadline).await
    }
}

/// Routing from `(type, id)` to a live entity.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Where the entity lives right now, if anywhere.
    async fn lookup(&self, key: &EntityKey) -> Result<Option<Location>>;

    /// Return a live reference, activating the entity if needed.
    async fn ensure(&self, key: &EntityKey) -> Result<EntityRef>;

    /// Stop a live instance. Returns false when nothing was live here.
    async fn deactivate(&self, key: &EntityKey, reason: StopReason) -> Result<bool>;

    async fn shutdown(&self);
}

/// Single-process directory.
pub struct LocalDirectory {
    placement: Arc<Placement>,
}

impl LocalDirectory {
    pub fn new(placement: Arc<Placement>) -> Self {
        Self { placement }
    }
}

#[async_trait]
impl Directory for LocalDirectory {
    async fn lookup(&self, key: &EntityKey) -> Result<Option<Location>> {
        Ok(self.placement.registry().get(key).map(|_| Location::Local))
    }

    async fn ensure(&self, key: &EntityKey) -> Result<EntityRef> {
        let handle = self.placement.activate(key).await?;
        Ok(EntityRef::Local(handle))
    }

    async fn deactivate(&self, key: &EntityKey, reason: StopReason) -> Result<bool> {
        Ok(self.placement.deactivate(key, reason).await)
    }

    async fn shutdown(&self) {
        self.placement.shutdown().await;
    }
}
