//! Versioned schema migrations.
//!
//! Migrations are applied incrementally: `migrate(db, prefix, base)` runs
//! every version greater than `base` and returns the latest version, so a
//! deployment tracking its on-disk version upgrades in place. All DDL is
//! built with `sea_query` and stays portable across MySQL, Postgres and
//! SQLite.

use sea_orm::sea_query::{ColumnDef, Index, Table};
use sea_orm::{ConnectionTrait, DatabaseConnection};
use tracing::info;

use crate::error::{Result, StoreError};
use crate::tables::{Alarms, Objects, alarms_table, objects_table, prefixed};

pub const LATEST_SCHEMA_VERSION: u32 = 3;

/// Apply every migration above `base`, returning the resulting version.
pub async fn migrate(
    db: &DatabaseConnection,
    prefix: Option<&str>,
    base: u32,
) -> Result<u32> {
    for version in (base + 1)..=LATEST_SCHEMA_VERSION {
        apply(db, prefix, version)
            .await
            .map_err(|e| match e {
                StoreError::Db(source) => StoreError::Migration { version, source },
                other => other,
            })?;
        info!(version, "applied schema migration");
    }
    Ok(LATEST_SCHEMA_VERSION.max(base))
}

async fn apply(db: &DatabaseConnection, prefix: Option<&str>, version: u32) -> Result<()> {
    match version {
        1 => create_tables(db, prefix).await,
        2 => drop_legacy_lock_columns(db, prefix).await,
        3 => add_claimed_at(db, prefix).await,
        other => Err(StoreError::Validation(format!(
            "unknown schema version {other}"
        ))),
    }
}

/// v1: the entity table (including the legacy locking columns that v2
/// removes) and the alarm table, plus the scheduled-at index.
async fn create_tables(db: &DatabaseConnection, prefix: Option<&str>) -> Result<()> {
    let backend = db.get_database_backend();

    let objects = Table::create()
        .table(objects_table(prefix))
        .if_not_exists()
        .col(ColumnDef::new(Objects::Type).string_len(190).not_null())
        .col(ColumnDef::new(Objects::Id).string_len(190).not_null())
        .col(ColumnDef::new(Objects::State).json_binary().not_null())
        .col(
            ColumnDef::new(Objects::Version)
                .big_integer()
                .not_null()
                .default(1),
        )
        .col(
            ColumnDef::new(Objects::CreatedAt)
                .timestamp_with_time_zone()
                .not_null(),
        )
        .col(
            ColumnDef::new(Objects::UpdatedAt)
                .timestamp_with_time_zone()
                .not_null(),
        )
        .col(ColumnDef::new(Objects::LockedBy).string_len(190).null())
        .col(
            ColumnDef::new(Objects::LockedAt)
                .timestamp_with_time_zone()
                .null(),
        )
        .primary_key(Index::create().col(Objects::Type).col(Objects::Id))
        .to_owned();
    db.execute(backend.build(&objects)).await?;

    let alarms = Table::create()
        .table(alarms_table(prefix))
        .if_not_exists()
        .col(ColumnDef::new(Alarms::Type).string_len(190).not_null())
        .col(ColumnDef::new(Alarms::Id).string_len(190).not_null())
        .col(ColumnDef::new(Alarms::Name).string_len(190).not_null())
        .col(
            ColumnDef::new(Alarms::ScheduledAt)
                .timestamp_with_time_zone()
                .not_null(),
        )
        .col(
            ColumnDef::new(Alarms::CreatedAt)
                .timestamp_with_time_zone()
                .not_null(),
        )
        .col(
            ColumnDef::new(Alarms::UpdatedAt)
                .timestamp_with_time_zone()
                .not_null(),
        )
        .primary_key(
            Index::create()
                .col(Alarms::Type)
                .col(Alarms::Id)
                .col(Alarms::Name),
        )
        .to_owned();
    db.execute(backend.build(&alarms)).await?;

    let scheduled_idx = Index::create()
        .if_not_exists()
        .name(index_name(prefix, "alarms_scheduled_at_idx"))
        .table(alarms_table(prefix))
        .col(Alarms::ScheduledAt)
        .to_owned();
    db.execute(backend.build(&scheduled_idx)).await?;

    Ok(())
}

/// v2: the locking columns predate claim-based alarms and are unused.
async fn drop_legacy_lock_columns(db: &DatabaseConnection, prefix: Option<&str>) -> Result<()> {
    let backend = db.get_database_backend();

    // SQLite cannot drop two columns in one ALTER statement.
    for column in [Objects::LockedBy, Objects::LockedAt] {
        let alter = Table::alter()
            .table(objects_table(prefix))
            .drop_column(column)
            .to_owned();
        db.execute(backend.build(&alter)).await?;
    }
    Ok(())
}

/// v3: claim timestamps on alarms.
async fn add_claimed_at(db: &DatabaseConnection, prefix: Option<&str>) -> Result<()> {
    let backend = db.get_database_backend();
    let alter = Table::alter()
        .table(alarms_table(prefix))
        .add_column(
            ColumnDef::new(Alarms::ClaimedAt)
                .timestamp_with_time_zone()
                .null(),
        )
        .to_owned();
    db.execute(backend.build(&alter)).await?;
    Ok(())
}

fn index_name(prefix: Option<&str>, base: &str) -> String {
    use sea_orm::sea_query::Iden;
    prefixed(prefix, base).to_string()
}
