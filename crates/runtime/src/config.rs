//! Runtime configuration.

use std::sync::Arc;
use std::time::Duration;

use scheduler::JobQueueConfig;
use store::{Database, KeyPolicy, ObjectStore};

/// Which directory implementation routes `(type, id)` to a live instance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RegistryMode {
    #[default]
    Local,
    Distributed,
}

/// Peer discovery in distributed mode.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ClusterMembers {
    /// Discover peers through the shared node table.
    #[default]
    Auto,
    /// Restrict routing to an explicit set of node ids.
    Peers(Vec<String>),
}

/// Which alarm backend delivers scheduled work.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SchedulerBackend {
    #[default]
    Poll,
    ExternalJob,
}

#[derive(Clone)]
pub struct RuntimeConfig {
    /// Persistence backend. Absent means in-memory only: state lives for
    /// the instance lifetime and alarms use the in-memory scheduler.
    pub store: Option<Arc<dyn ObjectStore>>,
    /// Shared database handle, required for the poll scheduler, the job
    /// queue backend and distributed mode.
    pub database: Option<Database>,
    pub registry_mode: RegistryMode,
    pub cluster_members: ClusterMembers,
    pub scheduler: SchedulerBackend,
    /// Poll backend sweep interval.
    pub polling_interval: Duration,
    /// Claims older than this are retried by the poller.
    pub claim_ttl: Duration,
    /// Idle time before an instance compacts itself.
    pub hibernate_after: Duration,
    /// Idle time before an instance shuts down; unset keeps instances live.
    pub shutdown_after: Option<Duration>,
    /// Process-wide key conversion policy; kinds may override it.
    pub object_keys: KeyPolicy,
    /// Opaque tenant prefix passed to the store and the scheduler.
    pub prefix: Option<String>,
    /// Default deadline a caller waits for an invocation reply.
    pub invoke_deadline: Duration,
    /// Heartbeat liveness window in distributed mode.
    pub node_ttl: Duration,
    /// Poll interval of the remote-call mailbox in distributed mode.
    pub call_poll_interval: Duration,
    /// Routing of the external job backend.
    pub external_job: JobQueueConfig,
    /// Whether the runtime runs the poller itself. Tests that drive
    /// `poll_once` by hand turn this off.
    pub run_poller: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            store: None,
            database: None,
            registry_mode: RegistryMode::Local,
            cluster_members: ClusterMembers::Auto,
            scheduler: SchedulerBackend::Poll,
            polling_interval: Duration::from_secs(30),
            claim_ttl: Duration::from_secs(60),
            hibernate_after: Duration::from_secs(300),
            shutdown_after: None,
            object_keys: KeyPolicy::Strings,
            prefix: None,
            invoke_deadline: Duration::from_secs(5),
            node_ttl: Duration::from_secs(15),
            call_poll_interval: Duration::from_millis(50),
            external_job: JobQueueConfig::default(),
            run_poller: true,
        }
    }
}

impl std::fmt::Debug for RuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeConfig")
            .field("store", &self.store.is_some())
            .field("registry_mode", &self.registry_mode)
            .field("scheduler", &self.scheduler)
            .field("polling_interval", &self.polling_interval)
            .field("claim_ttl", &self.claim_ttl)
            .field("hibernate_after", &self.hibernate_after)
            .field("shutdown_after", &self.shutdown_after)
            .field("object_keys", &self.object_keys)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}
