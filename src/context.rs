use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::AppConfig;
use crate::core::auth::{AuthObserver, Credentials};
use crate::core::orchestrator::Orchestrator;
use crate::core::transfer_engine::TransferRouter;
use crate::remote::{HttpRemote, RemoteStore, SimulatedRemote};

#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub orchestrator: Orchestrator,
}

impl AppContext {
    /// Build the remote store and start the scheduler. Must run inside the
    /// tokio runtime.
    pub fn new(config: AppConfig, auth_observer: Option<Arc<dyn AuthObserver>>) -> Result<Self> {
        let credentials = Credentials::new(config.token.clone());

        let remote: Arc<dyn RemoteStore> = if config.simulation {
            tracing::info!("Simulation mode: nothing leaves this machine");
            Arc::new(SimulatedRemote::default())
        } else {
            Arc::new(
                HttpRemote::new(&config.endpoint, credentials)
                    .context("Failed to build HTTP client")?,
            )
        };

        let router = TransferRouter::new(remote, config.router_config());
        let orchestrator = Orchestrator::new(router, config.queue_config(), auth_observer);

        Ok(Self {
            config: Arc::new(config),
            orchestrator,
        })
    }
}
