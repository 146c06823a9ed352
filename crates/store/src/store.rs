//! Entity state persistence.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::ConnectionTrait;
use sea_orm::sea_query::{Expr, OnConflict, Query, SimpleExpr};
use serde_json::Value;
use tracing::debug;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::record::{EntityKey, ObjectRecord, StateDoc};
use crate::tables::{Objects, objects_table};

/// In-process counters for store operations.
///
/// `saves` counts writes actually issued; a handler returning an unchanged
/// state never reaches the store, which is observable here.
#[derive(Debug, Default)]
pub struct StoreStats {
    loads: AtomicU64,
    saves: AtomicU64,
    deletes: AtomicU64,
    failures: AtomicU64,
}

impl StoreStats {
    pub fn loads(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }

    pub fn saves(&self) -> u64 {
        self.saves.load(Ordering::Relaxed)
    }

    pub fn deletes(&self) -> u64 {
        self.deletes.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

/// Persistence seam for entity records.
///
/// The canonical implementation is [`SqlStore`]; the trait exists so the
/// runtime can run without a database and tests can inject write failures.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn load(&self, key: &EntityKey, prefix: Option<&str>) -> Result<Option<ObjectRecord>>;

    /// Upsert on `(type, id)`. `updated_at` is set to the wall clock; an
    /// insert sets `created_at` to the same instant and `version` to 1.
    async fn save(
        &self,
        key: &EntityKey,
        state: &StateDoc,
        prefix: Option<&str>,
    ) -> Result<ObjectRecord>;

    /// Idempotent delete.
    async fn delete(&self, key: &EntityKey, prefix: Option<&str>) -> Result<()>;

    fn stats(&self) -> &StoreStats;
}

/// Store over the relational `objects` table.
pub struct SqlStore {
    db: Database,
    stats: Arc<StoreStats>,
}

impl SqlStore {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            stats: Arc::new(StoreStats::default()),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    async fn fetch(&self, key: &EntityKey, prefix: Option<&str>) -> Result<Option<ObjectRecord>> {
        let query = Query::select()
            .columns([
                Objects::Type,
                Objects::Id,
                Objects::State,
                Objects::Version,
                Objects::CreatedAt,
                Objects::UpdatedAt,
            ])
            .from(objects_table(prefix))
            .and_where(Expr::col(Objects::Type).eq(key.kind.as_str()))
            .and_where(Expr::col(Objects::Id).eq(key.id.as_str()))
            .to_owned();

        let conn = self.db.connection();
        let row = conn
            .query_one(conn.get_database_backend().build(&query))
            .await?;
        row.as_ref().map(ObjectRecord::from_row).transpose()
    }
}

#[async_trait]
impl ObjectStore for SqlStore {
    async fn load(&self, key: &EntityKey, prefix: Option<&str>) -> Result<Option<ObjectRecord>> {
        let started = Instant::now();
        debug!(target: "store", op = "load", kind = %key.kind, id = %key.id, "start");
        self.stats.loads.fetch_add(1, Ordering::Relaxed);

        match self.fetch(key, prefix).await {
            Ok(record) => {
                debug!(
                    target: "store",
                    op = "load",
                    kind = %key.kind,
                    id = %key.id,
                    found = record.is_some(),
                    duration_us = started.elapsed().as_micros() as u64,
                    "stop"
                );
                Ok(record)
            }
            Err(e) => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                debug!(
                    target: "store",
                    op = "load",
                    kind = %key.kind,
                    id = %key.id,
                    cause = %e,
                    duration_us = started.elapsed().as_micros() as u64,
                    "exception"
                );
                Err(match e {
                    StoreError::Db(db) => StoreError::Load(db),
                    other => other,
                })
            }
        }
    }

    async fn save(
        &self,
        key: &EntityKey,
        state: &StateDoc,
        prefix: Option<&str>,
    ) -> Result<ObjectRecord> {
        let started = Instant::now();
        debug!(target: "store", op = "save", kind = %key.kind, id = %key.id, "start");
        self.stats.saves.fetch_add(1, Ordering::Relaxed);

        let now = Utc::now();
        let values: Vec<sea_orm::Value> = vec![
            key.kind.clone().into(),
            key.id.clone().into(),
            Value::Object(state.clone()).into(),
            1i64.into(),
            now.into(),
            now.into(),
        ];
        let insert = Query::insert()
            .into_table(objects_table(prefix))
            .columns([
                Objects::Type,
                Objects::Id,
                Objects::State,
                Objects::Version,
                Objects::CreatedAt,
                Objects::UpdatedAt,
            ])
            .values_panic(values.into_iter().map(SimpleExpr::from))
            .on_conflict(
                OnConflict::columns([Objects::Type, Objects::Id])
                    .update_columns([Objects::State, Objects::UpdatedAt])
                    .to_owned(),
            )
            .to_owned();

        let conn = self.db.connection();
        let result = async {
            conn.execute(conn.get_database_backend().build(&insert))
                .await
                .map_err(StoreError::Save)?;
            self.fetch(key, prefix).await?.ok_or_else(|| {
                StoreError::Save(sea_orm::DbErr::RecordNotFound(format!(
                    "saved record vanished for {key}"
                )))
            })
        }
        .await;

        match result {
            Ok(record) => {
                debug!(
                    target: "store",
                    op = "save",
                    kind = %key.kind,
                    id = %key.id,
                    duration_us = started.elapsed().as_micros() as u64,
                    "stop"
                );
                Ok(record)
            }
            Err(e) => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                debug!(
                    target: "store",
                    op = "save",
                    kind = %key.kind,
                    id = %key.id,
                    cause = %e,
                    duration_us = started.elapsed().as_micros() as u64,
                    "exception"
                );
                Err(match e {
                    StoreError::Db(db) => StoreError::Save(db),
                    other => other,
                })
            }
        }
    }

    async fn delete(&self, key: &EntityKey, prefix: Option<&str>) -> Result<()> {
        let started = Instant::now();
        debug!(target: "store", op = "delete", kind = %key.kind, id = %key.id, "start");
        self.stats.deletes.fetch_add(1, Ordering::Relaxed);

        let delete = Query::delete()
            .from_table(objects_table(prefix))
            .and_where(Expr::col(Objects::Type).eq(key.kind.as_str()))
            .and_where(Expr::col(Objects::Id).eq(key.id.as_str()))
            .to_owned();

        let conn = self.db.connection();
        match conn.execute(conn.get_database_backend().build(&delete)).await {
            Ok(_) => {
                debug!(
                    target: "store",
                    op = "delete",
                    kind = %key.kind,
                    id = %key.id,
                    duration_us = started.elapsed().as_micros() as u64,
                    "stop"
                );
                Ok(())
            }
            Err(e) => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                debug!(
                    target: "store",
                    op = "delete",
                    kind = %key.kind,
                    id = %key.id,
                    cause = %e,
                    duration_us = started.elapsed().as_micros() as u64,
                    "exception"
                );
                Err(StoreError::Delete(e))
            }
        }
    }

    fn stats(&self) -> &StoreStats {
        &self.stats
    }
}
