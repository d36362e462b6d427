//! Node-side core control
//!
//! A node runs whatever config the panel last pushed to it. At most one core
//! is active: applying a config for one core stops the other.

use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::common::{ClientTraffic, Error, Result, Traffic};
use crate::core::{ControlApi, CoreConfig, SingBoxConfig, XrayConfig};
use crate::model::CoreType;
use crate::supervisor::ProcessSpec;

use super::runtime::CoreRuntime;

/// Where a node looks for a config to start with
pub const CONFIG_CANDIDATES: [&str; 5] = [
    "bin/config.json",
    "config/config.json",
    "./config.json",
    "/app/bin/config.json",
    "/app/config/config.json",
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeStatus {
    #[serde(rename = "type")]
    pub core: Option<CoreType>,
    pub running: bool,
    pub version: String,
    pub uptime: u64,
}

pub struct NodeAgent {
    xray: CoreRuntime<XrayConfig>,
    singbox: CoreRuntime<SingBoxConfig>,
    active: RwLock<Option<CoreType>>,
    last_applied: Mutex<Option<(CoreType, Vec<u8>)>>,
}

fn parse_config<C: CoreConfig>(data: &[u8]) -> Result<C> {
    let text = std::str::from_utf8(data)
        .map_err(|e| Error::parse(format!("{} config is not UTF-8: {}", C::CORE, e)))?;
    C::parse(text)
}

/// Start `runtime` with `config` unless it already runs exactly that config.
async fn start_on<C: CoreConfig>(runtime: &CoreRuntime<C>, config: C, force: bool) -> Result<bool> {
    let unchanged = runtime
        .process()
        .is_some_and(|p| p.is_running() && *p.config() == config);
    if unchanged && !force {
        debug!("{} config unchanged, keeping the running process", C::CORE);
        return Ok(false);
    }
    runtime.restart_with(config, true).await?;
    Ok(true)
}

async fn reload_on<C: CoreConfig>(runtime: &CoreRuntime<C>) -> Result<()> {
    let process = runtime
        .process()
        .filter(|p| p.is_running())
        .ok_or_else(|| Error::not_running(C::CORE.as_str()))?;
    runtime.restart_with(process.config().as_ref().clone(), true).await
}

async fn traffic_on<C: CoreConfig>(
    runtime: &CoreRuntime<C>,
    reset: bool,
) -> Result<(Vec<Traffic>, Vec<ClientTraffic>)> {
    let process = runtime
        .process()
        .filter(|p| p.is_running())
        .ok_or_else(|| Error::not_running(C::CORE.as_str()))?;
    let api = C::Api::connect(u32::from(process.api_port())).await?;
    let traffic = api.get_traffic(reset).await;
    api.close();
    traffic
}

/// Stop a runtime, treating "not running" as done.
async fn stop_quietly<C: CoreConfig>(runtime: &CoreRuntime<C>) {
    if !runtime.is_running() {
        return;
    }
    match runtime.stop().await {
        Ok(()) | Err(Error::NotRunning(_)) => {}
        Err(e) => warn!("Failed to stop {}: {}", C::CORE, e),
    }
}

impl NodeAgent {
    pub fn new(xray: ProcessSpec, singbox: ProcessSpec) -> Self {
        NodeAgent {
            xray: CoreRuntime::new(xray),
            singbox: CoreRuntime::new(singbox),
            active: RwLock::new(None),
            last_applied: Mutex::new(None),
        }
    }

    pub fn with_bin_folder(bin_folder: &Path, log_folder: &Path) -> Self {
        Self::new(
            ProcessSpec::for_core(CoreType::Xray, bin_folder).with_log_folder(log_folder),
            ProcessSpec::for_core(CoreType::SingBox, bin_folder).with_log_folder(log_folder),
        )
    }

    pub fn active(&self) -> Option<CoreType> {
        *self.active.read()
    }

    /// Run a config pushed by the panel. Returns whether a process was
    /// (re)started.
    pub async fn apply_config(&self, core: CoreType, data: &[u8]) -> Result<bool> {
        self.apply(core, data, false).await
    }

    async fn apply(&self, core: CoreType, data: &[u8], force: bool) -> Result<bool> {
        let started = match core {
            CoreType::Xray => {
                let config = parse_config::<XrayConfig>(data)?;
                stop_quietly(&self.singbox).await;
                start_on(&self.xray, config, force).await?
            }
            CoreType::SingBox => {
                let config = parse_config::<SingBoxConfig>(data)?;
                stop_quietly(&self.xray).await;
                start_on(&self.singbox, config, force).await?
            }
        };
        *self.active.write() = Some(core);
        *self.last_applied.lock() = Some((core, data.to_vec()));
        if started {
            info!("Applied {} config ({} bytes)", core, data.len());
        }
        Ok(started)
    }

    fn active_or_not_running(&self) -> Result<CoreType> {
        self.active().ok_or_else(|| Error::not_running("core"))
    }

    /// Restart the running core with its current config.
    pub async fn reload(&self) -> Result<()> {
        match self.active_or_not_running()? {
            CoreType::Xray => reload_on(&self.xray).await,
            CoreType::SingBox => reload_on(&self.singbox).await,
        }
    }

    /// Restart with the last applied config, running or not.
    pub async fn force_reload(&self) -> Result<()> {
        let last = self.last_applied.lock().clone();
        let (core, data) = last.ok_or_else(|| Error::not_found("no config has been applied"))?;
        self.apply(core, &data, true).await.map(drop)
    }

    pub async fn stop(&self) -> Result<()> {
        match self.active_or_not_running()? {
            CoreType::Xray => self.xray.stop().await,
            CoreType::SingBox => self.singbox.stop().await,
        }
    }

    pub async fn status(&self) -> NodeStatus {
        let core = self.active();
        let (running, version, uptime) = match core {
            Some(CoreType::Xray) | None => (
                self.xray.is_running(),
                self.xray.version().await,
                self.xray.uptime(),
            ),
            Some(CoreType::SingBox) => (
                self.singbox.is_running(),
                self.singbox.version().await,
                self.singbox.uptime(),
            ),
        };
        NodeStatus {
            core,
            running,
            version,
            uptime,
        }
    }

    /// Counters of the active core through a fresh API client.
    pub async fn traffic(&self, reset: bool) -> Result<(Vec<Traffic>, Vec<ClientTraffic>)> {
        match self.active_or_not_running()? {
            CoreType::Xray => traffic_on(&self.xray, reset).await,
            CoreType::SingBox => traffic_on(&self.singbox, reset).await,
        }
    }

    /// Start Xray from the first config file found in the standard places.
    pub async fn load_config_from_file(&self) -> Result<Option<PathBuf>> {
        let candidates: Vec<PathBuf> = CONFIG_CANDIDATES.iter().map(PathBuf::from).collect();
        self.load_config_from(&candidates).await
    }

    pub async fn load_config_from(&self, candidates: &[PathBuf]) -> Result<Option<PathBuf>> {
        let Some(path) = candidates.iter().find(|p| p.is_file()) else {
            debug!("No startup config found");
            return Ok(None);
        };
        let data = tokio::fs::read(path).await?;
        info!("Loading startup config from {}", path.display());
        self.apply_config(CoreType::Xray, &data).await?;
        Ok(Some(path.clone()))
    }
}
