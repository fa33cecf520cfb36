use std::{
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};

use kiln_worker::Resources;

/// The port workers connect to when none is configured.
pub const DEFAULT_PORT: u16 = 9123;

/// How a worker's cache is trimmed when an incoming artifact would exceed its capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionPolicy {
    /// Never evict. Workers may exceed their advertised cache capacity.
    Retain,
    /// Evict the artifacts that were least recently used by a dispatched task.
    #[default]
    LeastRecentlyUsed,
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Sent to workers when they register.
    pub name: String,
    /// Address to listen on. Port 0 picks an ephemeral port; see [crate::Manager::port].
    pub bind: SocketAddr,
    /// Workers that have not been heard from for this long are considered lost.
    pub worker_timeout: Duration,
    /// How often to look for lost workers.
    pub liveness_check_interval: Duration,
    /// How many times a task is requeued after losing its worker before it fails.
    pub max_retries: u32,
    /// Resources requested by tasks that don't set their own.
    pub default_resources: Resources,
    pub eviction_policy: EvictionPolicy,
    /// How long a worker waits for watched outputs to appear after the command exits.
    pub watch_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            name: "kiln".to_string(),
            bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            worker_timeout: Duration::from_secs(30),
            liveness_check_interval: Duration::from_secs(1),
            max_retries: 3,
            default_resources: Resources::new(1, 0, 0),
            eviction_policy: EvictionPolicy::default(),
            watch_timeout: Duration::from_secs(5),
        }
    }
}

impl ManagerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_bind(mut self, bind: SocketAddr) -> Self {
        self.bind = bind;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.bind.set_port(port);
        self
    }

    pub fn with_worker_timeout(mut self, timeout: Duration) -> Self {
        self.worker_timeout = timeout;
        self
    }

    pub fn with_liveness_check_interval(mut self, interval: Duration) -> Self {
        self.liveness_check_interval = interval;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_default_resources(mut self, resources: Resources) -> Self {
        self.default_resources = resources;
        self
    }

    pub fn with_eviction_policy(mut self, policy: EvictionPolicy) -> Self {
        self.eviction_policy = policy;
        self
    }

    pub fn with_watch_timeout(mut self, timeout: Duration) -> Self {
        self.watch_timeout = timeout;
        self
    }
}
