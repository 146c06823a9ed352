//! Distributed mode: DB-backed membership, placement and remote calls.
//!
//! The cluster shares one database. Nodes announce themselves with
//! heartbeats, placements are rows claimed with the same conditional-update
//! primitive the alarm table uses, and invocations for entities hosted
//! elsewhere travel through a polled call table. Node loss is detected by
//! heartbeat expiry; a surviving node steals the placement row on the next
//! call and reactivates the entity from its persisted state.

mod calls;
mod distributed;
mod node;

pub use calls::{CallClient, CallServer};
pub use distributed::DistributedDirectory;
pub use node::{Heartbeat, NodeTable, setup_cluster_tables};
