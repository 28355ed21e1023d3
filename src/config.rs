use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::federation::PartyRoute;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Party this node serves. Parties with another id are remote.
    pub party_id: u64,
    pub listen_addr: SocketAddr,
    /// Root for `jobs/`, `logs/`, `status/` and `models/`.
    pub data_dir: PathBuf,
    pub routes: Vec<PartyRoute>,
    /// Optional JSON route table, consulted before `routes`.
    pub route_file: Option<PathBuf>,
    pub propagation_timeout_ms: u64,
    /// Persist status records under `status/`. Off keeps them in memory.
    pub persist_status: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            party_id: 1,
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 9380)),
            data_dir: PathBuf::from("./data"),
            routes: Vec::new(),
            route_file: None,
            propagation_timeout_ms: 5_000,
            persist_status: true,
        }
    }
}

impl NodeConfig {
    pub fn new(party_id: u64, listen_addr: SocketAddr) -> Self {
        Self {
            party_id,
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_route(mut self, role: &str, party_id: u64, addr: String) -> Self {
        self.routes.push(PartyRoute::new(role, party_id, addr));
        self
    }

    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.data_dir.join("jobs")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn status_dir(&self) -> PathBuf {
        self.data_dir.join("status")
    }

    pub fn models_dir(&self) -> PathBuf {
        self.data_dir.join("models")
    }

    pub fn propagation_timeout(&self) -> Duration {
        Duration::from_millis(self.propagation_timeout_ms)
    }
}
