//! Node membership via heartbeats.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sea_orm::Value as DbValue;
use sea_orm::sea_query::{ColumnDef, Expr, OnConflict, Query, SimpleExpr, Table};
use sea_orm::{ConnectionTrait, DeriveIden};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use store::{Database, StoreError, prefixed};

use crate::error::{Result, RuntimeError};

#[derive(DeriveIden, Clone, Copy)]
enum ClusterNodes {
    NodeId,
    HeartbeatAt,
}

#[derive(DeriveIden, Clone, Copy)]
pub(crate) enum ClusterPlacements {
    Type,
    Id,
    NodeId,
    UpdatedAt,
}

#[derive(DeriveIden, Clone, Copy)]
pub(crate) enum ClusterCalls {
    CallId,
    TargetNode,
    Type,
    Id,
    Handler,
    Args,
    Status,
    Reply,
    CreatedAt,
}

fn db_err(e: sea_orm::DbErr) -> RuntimeError {
    RuntimeError::ActivationFailed(StoreError::from(e).to_string())
}

/// Create the three cluster tables. Idempotent.
pub async fn setup_cluster_tables(db: &Database, prefix: Option<&str>) -> Result<()> {
    let conn = db.connection();
    let backend = conn.get_database_backend();

    let nodes = Table::create()
        .table(prefixed(prefix, "cluster_nodes"))
        .if_not_exists()
        .col(
            ColumnDef::new(ClusterNodes::NodeId)
                .string_len(64)
                .not_null()
                .primary_key(),
        )
        .col(
            ColumnDef::new(ClusterNodes::HeartbeatAt)
                .timestamp_with_time_zone()
                .not_null(),
        )
        .to_owned();
    conn.execute(backend.build(&nodes)).await.map_err(db_err)?;

    let placements = Table::create()
        .table(prefixed(prefix, "cluster_placements"))
        .if_not_exists()
        .col(
            ColumnDef::new(ClusterPlacements::Type)
                .string_len(190)
                .not_null(),
        )
        .col(
            ColumnDef::new(ClusterPlacements::Id)
                .string_len(190)
                .not_null(),
        )
        .col(
            ColumnDef::new(ClusterPlacements::NodeId)
                .string_len(64)
                .not_null(),
        )
        .col(
            ColumnDef::new(ClusterPlacements::UpdatedAt)
                .timestamp_with_time_zone()
                .not_null(),
        )
        .primary_key(
            sea_orm::sea_query::Index::create()
                .col(ClusterPlacements::Type)
                .col(ClusterPlacements::Id),
        )
        .to_owned();
    conn.execute(backend.build(&placements))
        .await
        .map_err(db_err)?;

    let calls = Table::create()
        .table(prefixed(prefix, "cluster_calls"))
        .if_not_exists()
        .col(
            ColumnDef::new(ClusterCalls::CallId)
                .string_len(64)
                .not_null()
                .primary_key(),
        )
        .col(
            ColumnDef::new(ClusterCalls::TargetNode)
                .string_len(64)
                .not_null(),
        )
        .col(ColumnDef::new(ClusterCalls::Type).string_len(190).not_null())
        .col(ColumnDef::new(ClusterCalls::Id).string_len(190).not_null())
        .col(
            ColumnDef::new(ClusterCalls::Handler)
                .string_len(190)
                .not_null(),
        )
        .col(ColumnDef::new(ClusterCalls::Args).json_binary().not_null())
        .col(ColumnDef::new(ClusterCalls::Status).string_len(16).not_null())
        .col(ColumnDef::new(ClusterCalls::Reply).json_binary().null())
        .col(
            ColumnDef::new(ClusterCalls::CreatedAt)
                .timestamp_with_time_zone()
                .not_null(),
        )
        .to_owned();
    conn.execute(backend.build(&calls)).await.map_err(db_err)?;

    Ok(())
}

/// Read and update node liveness.
#[derive(Clone)]
pub struct NodeTable {
    db: Database,
    prefix: Option<String>,
    ttl: Duration,
}

impl NodeTable {
    pub fn new(db: Database, prefix: Option<String>, ttl: Duration) -> Self {
        Self { db, prefix, ttl }
    }

    fn table(&self) -> sea_orm::sea_query::Alias {
        prefixed(self.prefix.as_deref(), "cluster_nodes")
    }

    pub async fn beat(&self, node_id: &str) -> Result<()> {
        let now = Utc::now();
        let values: Vec<DbValue> = vec![node_id.to_owned().into(), now.into()];
        let insert = Query::insert()
            .into_table(self.table())
            .columns([ClusterNodes::NodeId, ClusterNodes::HeartbeatAt])
            .values_panic(values.into_iter().map(SimpleExpr::from))
            .on_conflict(
                OnConflict::column(ClusterNodes::NodeId)
                    .update_columns([ClusterNodes::HeartbeatAt])
                    .to_owned(),
            )
            .to_owned();
        let conn = self.db.connection();
        conn.execute(conn.get_database_backend().build(&insert))
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// A node is alive while its heartbeat is younger than the ttl.
    pub async fn is_alive(&self, node_id: &str) -> Result<bool> {
        let query = Query::select()
            .column(ClusterNodes::HeartbeatAt)
            .from(self.table())
            .and_where(Expr::col(ClusterNodes::NodeId).eq(node_id))
            .to_owned();
        let conn = self.db.connection();
        let row = conn
            .query_one(conn.get_database_backend().build(&query))
            .await
            .map_err(db_err)?;
        let Some(row) = row else { return Ok(false) };
        let heartbeat: DateTime<Utc> = row
            .try_get("", "heartbeat_at")
            .map_err(db_err)?;
        let cutoff = Utc::now() - chrono::Duration::seconds(self.ttl.as_secs() as i64);
        Ok(heartbeat > cutoff)
    }

    /// Remove this node's row, making the loss visible immediately.
    pub async fn retire(&self, node_id: &str) -> Result<()> {
        let delete = Query::delete()
            .from_table(self.table())
            .and_where(Expr::col(ClusterNodes::NodeId).eq(node_id))
            .to_owned();
        let conn = self.db.connection();
        conn.execute(conn.get_database_backend().build(&delete))
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

/// Background heartbeat loop for one node.
pub struct Heartbeat {
    table: NodeTable,
    node_id: String,
}

impl Heartbeat {
    pub fn new(table: NodeTable, node_id: String) -> Self {
        Self { table, node_id }
    }

    pub fn spawn(self, token: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let every = self.table.ttl / 3;
            info!(node = %self.node_id, "💓 heartbeat started");
            loop {
                if let Err(e) = self.table.beat(&self.node_id).await {
                    warn!(node = %self.node_id, "heartbeat write failed: {e}");
                }
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(every) => {}
                }
            }
            if let Err(e) = self.table.retire(&self.node_id).await {
                debug!(node = %self.node_id, "heartbeat retire failed: {e}");
            }
        })
    }
}
