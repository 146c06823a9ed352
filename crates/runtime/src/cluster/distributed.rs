//! DB-backed distributed directory.
//!
//! Placement rows bind `(type, id)` to the node hosting the instance. A row
//! is claimed on first activation; while its owner heartbeats, every other
//! node routes calls to it. Once the owner's heartbeat goes stale, the next
//! caller steals the row with a conditional update and reactivates the
//! entity locally from persisted state. Placements are sticky: an instance
//! that idles out keeps its row, and the owning node simply reactivates on
//! the next call routed to it.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::Value as DbValue;
use sea_orm::sea_query::{Expr, OnConflict, Query, SimpleExpr};
use sea_orm::ConnectionTrait;
use tracing::debug;

use store::{Database, EntityKey, StoreError, prefixed};

use crate::config::ClusterMembers;
use crate::directory::{Directory, EntityRef, Location, RemoteRef};
use crate::error::{Result, RuntimeError};
use crate::instance::StopReason;
use crate::placement::Placement;

use super::calls::CallClient;
use super::node::{ClusterPlacements, NodeTable};

fn db_err(e: sea_orm::DbErr) -> RuntimeError {
    RuntimeError::ActivationFailed(StoreError::from(e).to_string())
}

pub struct DistributedDirectory {
    db: Database,
    prefix: Option<String>,
    node_id: String,
    placement: Arc<Placement>,
    nodes: NodeTable,
    calls: Arc<CallClient>,
    members: ClusterMembers,
}

impl DistributedDirectory {
    pub fn new(
        db: Database,
        prefix: Option<String>,
        node_id: String,
        placement: Arc<Placement>,
        nodes: NodeTable,
        calls: Arc<CallClient>,
        members: ClusterMembers,
    ) -> Self {
        Self {
            db,
            prefix,
            node_id,
            placement,
            nodes,
            calls,
            members,
        }
    }

    fn table(&self) -> sea_orm::sea_query::Alias {
        prefixed(self.prefix.as_deref(), "cluster_placements")
    }

    async fn owner_of(&self, key: &EntityKey) -> Result<Option<String>> {
        let query = Query::select()
            .column(ClusterPlacements::NodeId)
            .from(self.table())
            .and_where(Expr::col(ClusterPlacements::Type).eq(key.kind.as_str()))
            .and_where(Expr::col(ClusterPlacements::Id).eq(key.id.as_str()))
            .to_owned();
        let conn = self.db.connection();
        let row = conn
            .query_one(conn.get_database_backend().build(&query))
            .await
            .map_err(db_err)?;
        row.map(|r| r.try_get("", "node_id").map_err(db_err))
            .transpose()
    }

    /// Insert the placement row for this node. Loses cleanly when another
    /// node inserted first.
    async fn try_insert(&self, key: &EntityKey) -> Result<bool> {
        let values: Vec<DbValue> = vec![
            key.kind.clone().into(),
            key.id.clone().into(),
            self.node_id.clone().into(),
            Utc::now().into(),
        ];
        let insert = Query::insert()
            .into_table(self.table())
            .columns([
                ClusterPlacements::Type,
                ClusterPlacements::Id,
                ClusterPlacements::NodeId,
                ClusterPlacements::UpdatedAt,
            ])
            .values_panic(values.into_iter().map(SimpleExpr::from))
            .on_conflict(
                OnConflict::columns([ClusterPlacements::Type, ClusterPlacements::Id])
                    .do_nothing()
                    .to_owned(),
            )
            .to_owned();
        let conn = self.db.connection();
        let result = conn
            .execute(conn.get_database_backend().build(&insert))
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected() == 1)
    }

    /// Steal a placement from a node that stopped heartbeating.
    async fn try_steal(&self, key: &EntityKey, from_node: &str) -> Result<bool> {
        let update = Query::update()
            .table(self.table())
            .value(ClusterPlacements::NodeId, self.node_id.as_str())
            .value(ClusterPlacements::UpdatedAt, Utc::now())
            .and_where(Expr::col(ClusterPlacements::Type).eq(key.kind.as_str()))
            .and_where(Expr::col(ClusterPlacements::Id).eq(key.id.as_str()))
            .and_where(Expr::col(ClusterPlacements::NodeId).eq(from_node))
            .to_owned();
        let conn = self.db.connection();
        let result = conn
            .execute(conn.get_database_backend().build(&update))
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn remove_own(&self, key: &EntityKey) -> Result<()> {
        let delete = Query::delete()
            .from_table(self.table())
            .and_where(Expr::col(ClusterPlacements::Type).eq(key.kind.as_str()))
            .and_where(Expr::col(ClusterPlacements::Id).eq(key.id.as_str()))
            .and_where(Expr::col(ClusterPlacements::NodeId).eq(self.node_id.as_str()))
            .to_owned();
        let conn = self.db.connection();
        conn.execute(conn.get_database_backend().build(&delete))
            .await
            .map_err(db_err)?;
        Ok(())
    }

    fn is_known_peer(&self, node_id: &str) -> bool {
        match &self.members {
            ClusterMembers::Auto => true,
            ClusterMembers::Peers(peers) => peers.iter().any(|p| p == node_id),
        }
    }

    async fn peer_is_alive(&self, node_id: &str) -> Result<bool> {
        if !self.is_known_peer(node_id) {
            return Ok(false);
        }
        self.nodes.is_alive(node_id).await
    }

    async fn activate_here(&self, key: &EntityKey) -> Result<EntityRef> {
        let handle = self.placement.activate(key).await?;
        Ok(EntityRef::Local(handle))
    }
}

#[async_trait]
impl Directory for DistributedDirectory {
    async fn lookup(&self, key: &EntityKey) -> Result<Option<Location>> {
        if self.placement.registry().get(key).is_some() {
            return Ok(Some(Location::Local));
        }
        match self.owner_of(key).await? {
            Some(owner) if owner == self.node_id => Ok(Some(Location::Local)),
            Some(owner) => {
                if self.peer_is_alive(&owner).await? {
                    Ok(Some(Location::Node(owner)))
                } else {
                    Ok(None)
                }
            }
            None => Ok(None),
        }
    }

    async fn ensure(&self, key: &EntityKey) -> Result<EntityRef> {
        // A couple of rounds cover every interleaving of insert and steal
        // races; losing both just means somebody else now owns the row.
        for _ in 0..3 {
            if self.placement.registry().get(key).is_some() {
                return self.activate_here(key).await;
            }

            match self.owner_of(key).await? {
                None => {
                    if self.try_insert(key).await? {
                        return self.activate_here(key).await;
                    }
                    debug!(key = %key, "lost the placement insert race");
                }
                Some(owner) if owner == self.node_id => {
                    return self.activate_here(key).await;
                }
                Some(owner) => {
                    if self.peer_is_alive(&owner).await? {
                        return Ok(EntityRef::Remote(RemoteRef {
                            node_id: owner,
                            key: key.clone(),
                            calls: self.calls.clone(),
                        }));
                    }
                    // The owner is gone; take the placement and reactivate
                    // from persisted state.
                    if self.try_steal(key, &owner).await? {
                        debug!(key = %key, from = %owner, "migrated placement from lost node");
                        return self.activate_here(key).await;
                    }
                }
            }
        }
        Err(RuntimeError::ActivationFailed(format!(
            "placement of {key} kept moving"
        )))
    }

    async fn deactivate(&self, key: &EntityKey, reason: StopReason) -> Result<bool> {
        let stopped = self.placement.deactivate(key, reason).await;
        if stopped {
            self.remove_own(key).await?;
        }
        Ok(stopped)
    }

    async fn shutdown(&self) {
        self.placement.shutdown().await;
    }
}
