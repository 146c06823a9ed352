//! Cluster-wide singleton guard.
//!
//! Exactly one poller may run across the cluster. The guard is a named lease
//! row: a node acquires the row by insert or by a conditional steal once the
//! previous holder's lease expired, renews it at a third of the TTL, and
//! runs the guarded task only while it holds the lease. Losing the lease
//! cancels the task; a brief overlap during failover is tolerated because
//! alarm claims serialize duplicate pollers.

use std::time::Duration;

use chrono::Utc;
use sea_orm::Value as DbValue;
use sea_orm::sea_query::{ColumnDef, Cond, Expr, OnConflict, Query, SimpleExpr, Table};
use sea_orm::{ConnectionTrait, DeriveIden};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use store::{Database, prefixed};

use crate::Result;

#[derive(DeriveIden, Clone, Copy)]
enum SingletonLeases {
    Name,
    NodeId,
    LeaseUntil,
}

/// Create the lease table.
pub async fn setup_singleton_leases(db: &Database, prefix: Option<&str>) -> Result<()> {
    let conn = db.connection();
    let create = Table::create()
        .table(prefixed(prefix, "singleton_leases"))
        .if_not_exists()
        .col(
            ColumnDef::new(SingletonLeases::Name)
                .string_len(190)
                .not_null()
                .primary_key(),
        )
        .col(ColumnDef::new(SingletonLeases::NodeId).string_len(64).not_null())
        .col(
            ColumnDef::new(SingletonLeases::LeaseUntil)
                .timestamp_with_time_zone()
                .not_null(),
        )
        .to_owned();
    conn.execute(conn.get_database_backend().build(&create))
        .await
        .map_err(store::StoreError::from)?;
    Ok(())
}

/// A named lease tying one task to one node at a time.
pub struct SingletonGuard {
    db: Database,
    prefix: Option<String>,
    name: String,
    node_id: String,
    ttl: Duration,
}

impl SingletonGuard {
    pub fn new(
        db: Database,
        prefix: Option<String>,
        name: impl Into<String>,
        node_id: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            db,
            prefix,
            name: name.into(),
            node_id: node_id.into(),
            ttl,
        }
    }

    fn table(&self) -> sea_orm::sea_query::Alias {
        prefixed(self.prefix.as_deref(), "singleton_leases")
    }

    /// Try to acquire or renew the lease. Returns true while this node
    /// holds it.
    pub async fn try_acquire(&self) -> Result<bool> {
        let now = Utc::now();
        let until = now + chrono::Duration::seconds(self.ttl.as_secs() as i64);
        let conn = self.db.connection();
        let backend = conn.get_database_backend();

        // Renew or steal an expired lease first; the row usually exists.
        let update = Query::update()
            .table(self.table())
            .value(SingletonLeases::NodeId, self.node_id.as_str())
            .value(SingletonLeases::LeaseUntil, until)
            .and_where(Expr::col(SingletonLeases::Name).eq(self.name.as_str()))
            .cond_where(
                Cond::any()
                    .add(Expr::col(SingletonLeases::NodeId).eq(self.node_id.as_str()))
                    .add(Expr::col(SingletonLeases::LeaseUntil).lte(now)),
            )
            .to_owned();
        if conn
            .execute(backend.build(&update))
            .await
            .map_err(store::StoreError::from)?
            .rows_affected()
            == 1
        {
            return Ok(true);
        }

        let values: Vec<DbValue> = vec![
            self.name.clone().into(),
            self.node_id.clone().into(),
            until.into(),
        ];
        let insert = Query::insert()
            .into_table(self.table())
            .columns([
                SingletonLeases::Name,
                SingletonLeases::NodeId,
                SingletonLeases::LeaseUntil,
            ])
            .values_panic(values.into_iter().map(SimpleExpr::from))
            .on_conflict(
                OnConflict::column(SingletonLeases::Name)
                    .do_nothing()
                    .to_owned(),
            )
            .to_owned();
        let inserted = conn
            .execute(backend.build(&insert))
            .await
            .map_err(store::StoreError::from)?
            .rows_affected();
        Ok(inserted == 1)
    }

    /// Release the lease if this node holds it.
    pub async fn release(&self) -> Result<()> {
        let delete = Query::delete()
            .from_table(self.table())
            .and_where(Expr::col(SingletonLeases::Name).eq(self.name.as_str()))
            .and_where(Expr::col(SingletonLeases::NodeId).eq(self.node_id.as_str()))
            .to_owned();
        let conn = self.db.connection();
        conn.execute(conn.get_database_backend().build(&delete))
            .await
            .map_err(store::StoreError::from)?;
        Ok(())
    }

    /// Run `start` whenever the lease is held and cancel the produced task
    /// when it is lost, until `token` is cancelled.
    pub fn spawn<F>(self, start: F, token: CancellationToken) -> tokio::task::JoinHandle<()>
    where
        F: Fn(CancellationToken) -> tokio::task::JoinHandle<()> + Send + 'static,
    {
        tokio::spawn(async move {
            let renew_every = self.ttl / 3;
            let mut held: Option<(CancellationToken, tokio::task::JoinHandle<()>)> = None;

            loop {
                match self.try_acquire().await {
                    Ok(true) => {
                        if held.is_none() {
                            info!(name = %self.name, node = %self.node_id, "🔒 singleton lease acquired");
                            let child = token.child_token();
                            let task = start(child.clone());
                            held = Some((child, task));
                        }
                    }
                    Ok(false) => {
                        if let Some((child, task)) = held.take() {
                            warn!(name = %self.name, node = %self.node_id, "singleton lease lost");
                            child.cancel();
                            let _ = task.await;
                        }
                    }
                    Err(e) => {
                        debug!(name = %self.name, "lease check failed: {e}");
                    }
                }

                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(renew_every) => {}
                }
            }

            if let Some((child, task)) = held.take() {
                child.cancel();
                let _ = task.await;
            }
            if let Err(e) = self.release().await {
                debug!(name = %self.name, "lease release failed: {e}");
            }
        })
    }
}
