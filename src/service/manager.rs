//! The core manager
//!
//! Constructed once at startup and shared through an `Arc`. It owns both
//! core runtimes, so "one live process per core type" holds by construction.
//! The active core is read from the settings on every call; flipping the
//! setting takes effect on the next call.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{error, info};

use crate::builder::ConfigBuilder;
use crate::common::{ClientTraffic, Result, Traffic};
use crate::core::{SingBoxConfig, XrayConfig};
use crate::model::CoreType;
use crate::store::Store;
use crate::supervisor::ProcessSpec;

use super::adapter::{CoreAdapter, CoreService};
use super::nodes::NodeClient;
use super::runtime::CoreRuntime;
use super::settings::SettingsService;

/// Snapshot reported by `/core/status`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoreStatus {
    #[serde(rename = "type")]
    pub core: CoreType,
    pub running: bool,
    pub version: String,
    pub uptime: u64,
    pub result: String,
}

pub struct CoreManager {
    store: Arc<dyn Store>,
    settings: SettingsService,
    builder: ConfigBuilder,
    xray: Arc<CoreRuntime<XrayConfig>>,
    singbox: Arc<CoreRuntime<SingBoxConfig>>,
    nodes: Arc<dyn NodeClient>,
}

impl CoreManager {
    pub fn new(
        store: Arc<dyn Store>,
        xray: ProcessSpec,
        singbox: ProcessSpec,
        nodes: Arc<dyn NodeClient>,
    ) -> Self {
        let settings = SettingsService::new(store.clone());
        let builder = ConfigBuilder::new(store.clone(), settings.clone());
        CoreManager {
            store,
            settings,
            builder,
            xray: Arc::new(CoreRuntime::new(xray)),
            singbox: Arc::new(CoreRuntime::new(singbox)),
            nodes,
        }
    }

    /// Standard binary and config layout under `bin_folder`.
    pub fn with_bin_folder(
        store: Arc<dyn Store>,
        bin_folder: &Path,
        log_folder: &Path,
        nodes: Arc<dyn NodeClient>,
    ) -> Self {
        let xray = ProcessSpec::for_core(CoreType::Xray, bin_folder).with_log_folder(log_folder);
        let singbox =
            ProcessSpec::for_core(CoreType::SingBox, bin_folder).with_log_folder(log_folder);
        Self::new(store, xray, singbox, nodes)
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn settings(&self) -> &SettingsService {
        &self.settings
    }

    pub fn builder(&self) -> &ConfigBuilder {
        &self.builder
    }

    pub fn xray(&self) -> &Arc<CoreRuntime<XrayConfig>> {
        &self.xray
    }

    pub fn singbox(&self) -> &Arc<CoreRuntime<SingBoxConfig>> {
        &self.singbox
    }

    pub(crate) fn node_client(&self) -> &Arc<dyn NodeClient> {
        &self.nodes
    }

    /// Adapter of a given core
    pub fn adapter(&self, core: CoreType) -> Arc<dyn CoreService> {
        match core {
            CoreType::Xray => Arc::new(CoreAdapter::new(self.xray.clone(), self.builder.clone())),
            CoreType::SingBox => {
                Arc::new(CoreAdapter::new(self.singbox.clone(), self.builder.clone()))
            }
        }
    }

    /// Adapter of the active core, resolved from the settings now.
    pub async fn get_core_service(&self) -> Result<Arc<dyn CoreService>> {
        let core = self.settings.get_core_type().await?;
        Ok(self.adapter(core))
    }

    pub async fn restart_xray(&self, force: bool) -> Result<()> {
        if self.settings.multi_node_mode().await? {
            return self.restart_multi_mode::<XrayConfig>().await;
        }
        self.adapter(CoreType::Xray).restart(force).await
    }

    pub fn restart_xray_async(self: &Arc<Self>, force: bool) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = manager.restart_xray(force).await {
                error!("Async Xray restart failed: {}", e);
            }
        });
    }

    pub async fn restart_singbox(&self, force: bool) -> Result<()> {
        if self.settings.multi_node_mode().await? {
            return self.restart_multi_mode::<SingBoxConfig>().await;
        }
        self.adapter(CoreType::SingBox).restart(force).await
    }

    pub fn restart_singbox_async(self: &Arc<Self>, force: bool) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = manager.restart_singbox(force).await {
                error!("Async sing-box restart failed: {}", e);
            }
        });
    }

    /// Restart whichever core is active.
    pub async fn restart(&self, force: bool) -> Result<()> {
        match self.settings.get_core_type().await? {
            CoreType::Xray => self.restart_xray(force).await,
            CoreType::SingBox => self.restart_singbox(force).await,
        }
    }

    pub fn restart_async(self: &Arc<Self>, force: bool) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = manager.restart(force).await {
                error!("Async core restart failed: {}", e);
            }
        });
    }

    pub async fn stop(&self) -> Result<()> {
        let service = self.get_core_service().await?;
        service.stop().await?;
        info!("{} stopped on request", service.core());
        Ok(())
    }

    pub async fn get_traffic(&self, reset: bool) -> Result<(Vec<Traffic>, Vec<ClientTraffic>)> {
        self.get_core_service().await?.get_traffic(reset).await
    }

    /// Built config of a core, as JSON
    pub async fn build_config(&self, core: CoreType) -> Result<Value> {
        self.adapter(core).get_config().await
    }

    /// Write the active core's config file without starting it.
    pub async fn ensure_config_file(&self) -> Result<PathBuf> {
        self.get_core_service().await?.ensure_config_file().await
    }

    pub async fn status(&self) -> Result<CoreStatus> {
        let service = self.get_core_service().await?;
        Ok(CoreStatus {
            core: service.core(),
            running: service.is_running(),
            version: service.get_version().await,
            uptime: service.get_uptime(),
            result: service.get_result(),
        })
    }
}
