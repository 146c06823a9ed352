//! Persistence layer for the entity runtime.
//!
//! This crate owns the two durable tables (`objects` and `alarms`), the
//! versioned migrations that create them, the key-conversion policies applied
//! to stored documents, and the typed operations the runtime and scheduler
//! build on. All statements are assembled with `sea_query` so that a tenant
//! prefix can select the target tables per call.

pub mod alarms;
pub mod database;
pub mod error;
pub mod key;
pub mod migrations;
pub mod record;
pub mod store;
mod tables;

pub use alarms::AlarmTable;
pub use database::Database;
pub use error::{Result, StoreError};
pub use key::{KeyPolicy, Symbol, apply_key_policy};
pub use migrations::{LATEST_SCHEMA_VERSION, migrate};
pub use record::{AlarmRecord, EntityKey, ObjectRecord, StateDoc};
pub use store::{ObjectStore, SqlStore, StoreStats};
pub use tables::prefixed;
