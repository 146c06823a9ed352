//! Durable virtual-actor runtime.
//!
//! Named stateful entities, addressed by `(type, id)`, each living as at
//! most one in-memory instance within the addressable scope (process or
//! cluster). State mutations persist transactionally through the store
//! crate; future work arrives through named alarms delivered by the
//! scheduler crate. Applications declare their entity types in a
//! [`Catalog`] and drive everything through [`Runtime`].

pub mod catalog;
pub mod cluster;
pub mod config;
pub mod directory;
pub mod error;
mod instance;
pub mod placement;
pub mod registry;
pub mod state;
pub mod telemetry;

mod runtime;

pub use catalog::{
    AfterLoad, AlarmDirective, AlarmOutcome, Catalog, KindOptions, KindSpec, Outcome,
};
pub use config::{ClusterMembers, RegistryMode, RuntimeConfig, SchedulerBackend};
pub use directory::{Directory, EntityRef, Location};
pub use error::{Result, RuntimeError};
pub use instance::{InvokeResult, LocalHandle, StopReason};
pub use runtime::Runtime;
pub use state::EntityView;
pub use telemetry::init_logging;

// The scheduler and store types that appear in this crate's public surface.
pub use scheduler::{AlarmScheduler, AlarmSink, FireOutcome, PendingAlarm};
pub use store::{EntityKey, KeyPolicy, StateDoc, Symbol};
