use sea_orm::DbErr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("load failed: {0}")]
    Load(#[source] DbErr),

    #[error("save failed: {0}")]
    Save(#[source] DbErr),

    #[error("delete failed: {0}")]
    Delete(#[source] DbErr),

    #[error("invalid state document: {0}")]
    Validation(String),

    #[error("unknown key in stored document: {0}")]
    UnknownKey(String),

    #[error("migration failed at version {version}: {source}")]
    Migration {
        version: u32,
        #[source]
        source: DbErr,
    },

    #[error("database connection failed after {attempts} attempts: {source}")]
    Connection {
        attempts: u32,
        #[source]
        source: DbErr,
    },

    #[error("database error: {0}")]
    Db(#[from] DbErr),
}

pub type Result<T> = std::result::Result<T, StoreError>;
