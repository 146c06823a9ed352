//! Typed operations on the alarm table.
//!
//! The claim update is the one mutation that must be strictly atomic: a
//! single conditional `UPDATE` whose affected-row count decides ownership.
//! Rescheduling is an upsert on `(type, id, name)` that overwrites
//! `scheduled_at` and clears `claimed_at`, which is what invalidates an
//! outstanding claim.

use chrono::{DateTime, Utc};
use sea_orm::ConnectionTrait;
use sea_orm::Value as DbValue;
use sea_orm::sea_query::{Cond, Expr, OnConflict, Order, Query, SimpleExpr};

use crate::database::Database;
use crate::error::Result;
use crate::record::{AlarmRecord, EntityKey};
use crate::tables::{Alarms, alarms_table};

const ALARM_COLUMNS: [Alarms; 7] = [
    Alarms::Type,
    Alarms::Id,
    Alarms::Name,
    Alarms::ScheduledAt,
    Alarms::ClaimedAt,
    Alarms::CreatedAt,
    Alarms::UpdatedAt,
];

fn null_timestamp() -> DbValue {
    DbValue::ChronoDateTimeUtc(None)
}

/// Alarm record CRUD scoped to one prefixed table.
#[derive(Clone, Debug)]
pub struct AlarmTable {
    db: Database,
    prefix: Option<String>,
}

impl AlarmTable {
    pub fn new(db: Database, prefix: Option<String>) -> Self {
        Self { db, prefix }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    /// Upsert an alarm due at `scheduled_at`. An existing `(type, id, name)`
    /// row gets the new deadline and loses any claim.
    pub async fn upsert(
        &self,
        key: &EntityKey,
        name: &str,
        scheduled_at: DateTime<Utc>,
    ) -> Result<()> {
        let now = Utc::now();
        let values: Vec<DbValue> = vec![
            key.kind.clone().into(),
            key.id.clone().into(),
            name.to_owned().into(),
            scheduled_at.into(),
            null_timestamp(),
            now.into(),
            now.into(),
        ];
        let insert = Query::insert()
            .into_table(alarms_table(self.prefix()))
            .columns(ALARM_COLUMNS)
            .values_panic(values.into_iter().map(SimpleExpr::from))
            .on_conflict(
                OnConflict::columns([Alarms::Type, Alarms::Id, Alarms::Name])
                    .update_columns([Alarms::ScheduledAt, Alarms::ClaimedAt, Alarms::UpdatedAt])
                    .to_owned(),
            )
            .to_owned();

        let conn = self.db.connection();
        conn.execute(conn.get_database_backend().build(&insert))
            .await?;
        Ok(())
    }

    /// Rows due at `now` that are unclaimed or whose claim went stale before
    /// `stale_threshold`, ordered by deadline.
    pub async fn due(
        &self,
        now: DateTime<Utc>,
        stale_threshold: DateTime<Utc>,
    ) -> Result<Vec<AlarmRecord>> {
        let query = Query::select()
            .columns(ALARM_COLUMNS)
            .from(alarms_table(self.prefix()))
            .and_where(Expr::col(Alarms::ScheduledAt).lte(now))
            .cond_where(
                Cond::any()
                    .add(Expr::col(Alarms::ClaimedAt).is_null())
                    .add(Expr::col(Alarms::ClaimedAt).lte(stale_threshold)),
            )
            .order_by(Alarms::ScheduledAt, Order::Asc)
            .to_owned();

        let conn = self.db.connection();
        let rows = conn
            .query_all(conn.get_database_backend().build(&query))
            .await?;
        rows.iter().map(AlarmRecord::from_row).collect()
    }

    /// Atomic claim: set `claimed_at` only if the row is unclaimed or its
    /// claim is stale. Returns true when this caller won the row.
    pub async fn claim(
        &self,
        key: &EntityKey,
        name: &str,
        claimed_at: DateTime<Utc>,
        stale_threshold: DateTime<Utc>,
    ) -> Result<bool> {
        let update = Query::update()
            .table(alarms_table(self.prefix()))
            .value(Alarms::ClaimedAt, claimed_at)
            .and_where(Expr::col(Alarms::Type).eq(key.kind.as_str()))
            .and_where(Expr::col(Alarms::Id).eq(key.id.as_str()))
            .and_where(Expr::col(Alarms::Name).eq(name))
            .cond_where(
                Cond::any()
                    .add(Expr::col(Alarms::ClaimedAt).is_null())
                    .add(Expr::col(Alarms::ClaimedAt).lte(stale_threshold)),
            )
            .to_owned();

        let conn = self.db.connection();
        let result = conn
            .execute(conn.get_database_backend().build(&update))
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Delete the row only while it still carries this exact claim. Zero
    /// rows deleted means the alarm was rescheduled between claim and
    /// retire, and the new row must stay.
    pub async fn retire_claimed(
        &self,
        key: &EntityKey,
        name: &str,
        claimed_at: DateTime<Utc>,
    ) -> Result<bool> {
        let delete = Query::delete()
            .from_table(alarms_table(self.prefix()))
            .and_where(Expr::col(Alarms::Type).eq(key.kind.as_str()))
            .and_where(Expr::col(Alarms::Id).eq(key.id.as_str()))
            .and_where(Expr::col(Alarms::Name).eq(name))
            .and_where(Expr::col(Alarms::ClaimedAt).eq(claimed_at))
            .to_owned();

        let conn = self.db.connection();
        let result = conn
            .execute(conn.get_database_backend().build(&delete))
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Unconditional delete, used for orphaned rows and cancellation.
    pub async fn delete(&self, key: &EntityKey, name: &str) -> Result<()> {
        let delete = Query::delete()
            .from_table(alarms_table(self.prefix()))
            .and_where(Expr::col(Alarms::Type).eq(key.kind.as_str()))
            .and_where(Expr::col(Alarms::Id).eq(key.id.as_str()))
            .and_where(Expr::col(Alarms::Name).eq(name))
            .to_owned();

        let conn = self.db.connection();
        conn.execute(conn.get_database_backend().build(&delete))
            .await?;
        Ok(())
    }

    /// Remove every pending alarm of one entity.
    pub async fn delete_all(&self, key: &EntityKey) -> Result<()> {
        let delete = Query::delete()
            .from_table(alarms_table(self.prefix()))
            .and_where(Expr::col(Alarms::Type).eq(key.kind.as_str()))
            .and_where(Expr::col(Alarms::Id).eq(key.id.as_str()))
            .to_owned();

        let conn = self.db.connection();
        conn.execute(conn.get_database_backend().build(&delete))
            .await?;
        Ok(())
    }

    /// Pending alarms of one entity in ascending `scheduled_at` order.
    pub async fn list(&self, key: &EntityKey) -> Result<Vec<AlarmRecord>> {
        let query = Query::select()
            .columns(ALARM_COLUMNS)
            .from(alarms_table(self.prefix()))
            .and_where(Expr::col(Alarms::Type).eq(key.kind.as_str()))
            .and_where(Expr::col(Alarms::Id).eq(key.id.as_str()))
            .order_by(Alarms::ScheduledAt, Order::Asc)
            .to_owned();

        let conn = self.db.connection();
        let rows = conn
            .query_all(conn.get_database_backend().build(&query))
            .await?;
        rows.iter().map(AlarmRecord::from_row).collect()
    }

    /// Fetch one alarm row.
    pub async fn get(&self, key: &EntityKey, name: &str) -> Result<Option<AlarmRecord>> {
        let query = Query::select()
            .columns(ALARM_COLUMNS)
            .from(alarms_table(self.prefix()))
            .and_where(Expr::col(Alarms::Type).eq(key.kind.as_str()))
            .and_where(Expr::col(Alarms::Id).eq(key.id.as_str()))
            .and_where(Expr::col(Alarms::Name).eq(name))
            .to_owned();

        let conn = self.db.connection();
        let row = conn
            .query_one(conn.get_database_backend().build(&query))
            .await?;
        row.as_ref().map(AlarmRecord::from_row).transpose()
    }

    /// Force a claim timestamp, bypassing the conditional update. Test
    /// suites use this to simulate a worker that died mid-fire.
    pub async fn force_claim(
        &self,
        key: &EntityKey,
        name: &str,
        claimed_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let claimed: SimpleExpr = match claimed_at {
            Some(ts) => ts.into(),
            None => SimpleExpr::Value(null_timestamp()),
        };
        let update = Query::update()
            .table(alarms_table(self.prefix()))
            .value(Alarms::ClaimedAt, claimed)
            .and_where(Expr::col(Alarms::Type).eq(key.kind.as_str()))
            .and_where(Expr::col(Alarms::Id).eq(key.id.as_str()))
            .and_where(Expr::col(Alarms::Name).eq(name))
            .to_owned();

        let conn = self.db.connection();
        conn.execute(conn.get_database_backend().build(&update))
            .await?;
        Ok(())
    }
}
