use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::api::{self, ApiState};
use crate::config::NodeConfig;
use crate::error::Result;
use crate::federation::{PartyClient, PartyResolver, Propagator, RouteFile, RouteSource, StaticRoutes};
use crate::scheduler::{JobController, StatusRegistry};
use crate::storage::{
    FileStatusStore, JobCatalog, LogLayout, MemoryStatusStore, PipelineStore, StatusStore,
};

/// A party's control-plane node: storage, registry, controller and the
/// HTTP surface wired together.
pub struct Node {
    pub config: NodeConfig,
    pub controller: Arc<JobController>,
}

impl Node {
    /// Build every component from `config`.
    ///
    /// Loads persisted job definitions and status records, so a restarted
    /// node resumes with the state it acknowledged before.
    pub async fn new(config: NodeConfig) -> Result<Self> {
        let store: Arc<dyn StatusStore> = if config.persist_status {
            Arc::new(FileStatusStore::new(config.status_dir()))
        } else {
            Arc::new(MemoryStatusStore::new())
        };
        let registry = Arc::new(StatusRegistry::load(store)?);
        let catalog = Arc::new(JobCatalog::open(config.jobs_dir()).await?);

        let mut sources: Vec<Box<dyn RouteSource>> = Vec::new();
        if let Some(path) = &config.route_file {
            sources.push(Box::new(RouteFile::new(path)));
        }
        sources.push(Box::new(StaticRoutes::new(config.routes.clone())));
        let resolver = Arc::new(PartyResolver::new(sources));
        let client = PartyClient::new(resolver, config.propagation_timeout())?;
        let propagator = Propagator::new(client, config.party_id);

        let controller = Arc::new(JobController::new(
            registry,
            catalog,
            LogLayout::new(config.logs_dir()),
            PipelineStore::new(config.models_dir()),
            propagator,
        ));

        Ok(Self { config, controller })
    }

    pub fn api_state(&self) -> ApiState {
        ApiState {
            controller: self.controller.clone(),
        }
    }

    /// Serve the control plane until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        tracing::info!(
            party_id = self.config.party_id,
            listen_addr = %self.config.listen_addr,
            data_dir = %self.config.data_dir.display(),
            routes = self.config.routes.len(),
            "Node ready"
        );
        api::serve(listener, self.api_state(), shutdown).await
    }
}
