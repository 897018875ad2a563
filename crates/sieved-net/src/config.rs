use serde::{Deserialize, Serialize};

/// Networking knobs. Loading and validating a config file is the host
/// daemon's job; the core only consumes the resolved values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    /// Port for line-protocol TCP clients, bound on all interfaces.
    pub tcp_port: u16,
    /// Port the UDP listener is bound on. Datagrams are logged and dropped.
    pub udp_port: u16,
    /// Size of the leader/followers pool.
    pub worker_threads: usize,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self { tcp_port: 8673, udp_port: 8674, worker_threads: 1 }
    }
}
