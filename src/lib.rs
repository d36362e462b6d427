//! corepanel - dual-core control plane for Xray and sing-box
//!
//! Turns stored inbound/outbound rows into a native config for whichever
//! core is active, supervises the core process, accounts traffic through the
//! core's control API and converts configs when the active core changes.
//!
//! # Architecture
//!
//! ```text
//!                       +----------------+
//!                       |   hub/ (API)   |
//!                       +-------+--------+
//!                               |
//!                       +-------v--------+        +-------------+
//!                       |   service/     +------->+   store/    |
//!                       | manager, jobs  |        +-------------+
//!                       +---+--------+---+
//!                           |        |
//!              +------------v--+  +--v-------------+
//!              |   builder/    |  |  supervisor/   |
//!              | rows+template |  | check, run,    |
//!              +-------+-------+  | stop, logs     |
//!                      |          +-------+--------+
//!              +-------v-------+          |
//!              |  translate/   |  +-------v--------+
//!              | xray<->singbox|  |    core/       |
//!              +---------------+  | models + APIs  |
//!                                 +----------------+
//! ```

pub mod builder;
pub mod common;
pub mod config;
pub mod core;
pub mod hub;
pub mod model;
pub mod service;
pub mod store;
pub mod supervisor;
pub mod translate;

pub use common::error::{Error, Result};
pub use config::{PanelConfig, Role};

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use hub::AppState;
use model::CoreType;
use service::{
    CheckCoreRunningJob, CoreManager, HttpNodeClient, NodeAgent, TrafficReconciler,
};
use store::{MemoryStore, Store};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// What this process runs
enum Mode {
    Panel(Arc<CoreManager>),
    Node(Arc<NodeAgent>),
}

/// One running corepanel process, panel or node
pub struct App {
    config: PanelConfig,
    mode: Mode,
    shutdown: CancellationToken,
}

impl App {
    pub async fn new(config: PanelConfig) -> Result<Self> {
        info!("Initializing corepanel v{} as {:?}", VERSION, config.role);
        let mode = match config.role {
            Role::Panel => Mode::Panel(Arc::new(Self::panel(&config).await?)),
            Role::Node => Mode::Node(Arc::new(NodeAgent::with_bin_folder(
                &config.bin_folder,
                &config.log_folder,
            ))),
        };
        Ok(App {
            config,
            mode,
            shutdown: CancellationToken::new(),
        })
    }

    async fn panel(config: &PanelConfig) -> Result<CoreManager> {
        let store: Arc<dyn Store> = match &config.state_file {
            Some(path) => Arc::new(MemoryStore::open(path).await?),
            None => Arc::new(MemoryStore::new()),
        };
        let manager = CoreManager::with_bin_folder(
            store,
            &config.bin_folder,
            &config.log_folder,
            Arc::new(HttpNodeClient::new()?),
        );

        let settings = manager.settings();
        settings.ensure_xray_template_valid().await?;
        settings.ensure_singbox_template_valid().await?;
        if let Some(core) = config.core {
            settings.set_core(core).await?;
        }
        info!("Active core: {}", settings.get_core_type().await?);
        Ok(manager)
    }

    pub fn manager(&self) -> Option<&Arc<CoreManager>> {
        match &self.mode {
            Mode::Panel(manager) => Some(manager),
            Mode::Node(_) => None,
        }
    }

    pub fn agent(&self) -> Option<&Arc<NodeAgent>> {
        match &self.mode {
            Mode::Node(agent) => Some(agent),
            Mode::Panel(_) => None,
        }
    }

    /// Build every config this process would run without starting anything.
    pub async fn check(&self) -> Result<()> {
        if let Some(manager) = self.manager() {
            for core in [CoreType::Xray, CoreType::SingBox] {
                manager.build_config(core).await?;
            }
        }
        Ok(())
    }

    /// Token cancelled on shutdown
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Start the cores, the background jobs and the hub, then wait for
    /// ctrl-c.
    pub async fn run(&self) -> Result<()> {
        let addr = self.config.listen_addr()?;
        let secret = self.config.secret().to_string();
        let mut handles = Vec::new();

        let state = match &self.mode {
            Mode::Panel(manager) => {
                if let Err(e) = manager.restart(false).await {
                    error!("Initial core start failed: {}", e);
                }
                let reconciler = TrafficReconciler::new(manager.clone());
                handles.push(tokio::spawn(
                    reconciler.run(self.config.traffic_interval(), self.shutdown.clone()),
                ));
                let health = CheckCoreRunningJob::new(manager.clone());
                handles.push(tokio::spawn(
                    health.run(self.config.health_interval(), self.shutdown.clone()),
                ));
                AppState::panel(secret, manager.clone())
            }
            Mode::Node(agent) => {
                if let Err(e) = agent.load_config_from_file().await {
                    warn!("Startup config not applied: {}", e);
                }
                AppState::node(secret, agent.clone())
            }
        };

        let shutdown = self.shutdown.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = hub::start_server(state, addr, shutdown).await {
                error!("REST API server error: {}", e);
            }
        }));

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Received shutdown signal");
            }
            _ = self.shutdown.cancelled() => {}
        }
        self.shutdown.cancel();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }

        let stopped = match &self.mode {
            Mode::Panel(manager) => manager.stop().await,
            Mode::Node(agent) => agent.stop().await,
        };
        match stopped {
            Ok(()) | Err(Error::NotRunning(_)) => {}
            Err(e) => warn!("Failed to stop core on shutdown: {}", e),
        }
        info!("corepanel stopped");
        Ok(())
    }
}
