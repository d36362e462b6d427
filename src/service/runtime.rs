//! Per-core runtime state owned by the core manager
//!
//! Exactly one live [`Process`] per core type. Restarts are serialized by a
//! lock; status reads never take it.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::common::{ClientTraffic, Error, Result, Traffic};
use crate::core::{ControlApi, CoreConfig};
use crate::model::CoreType;
use crate::supervisor::{write_config, Process, ProcessSpec};

use super::pool::ApiPool;

pub struct CoreRuntime<C: CoreConfig> {
    spec: ProcessSpec,
    process: RwLock<Option<Arc<Process<C>>>>,
    restart_lock: tokio::sync::Mutex<()>,
    need_restart: AtomicBool,
    manually_stopped: AtomicBool,
    pool: ApiPool<C::Api>,
}

impl<C: CoreConfig> CoreRuntime<C> {
    pub fn new(spec: ProcessSpec) -> Self {
        CoreRuntime {
            spec,
            process: RwLock::new(None),
            restart_lock: tokio::sync::Mutex::new(()),
            need_restart: AtomicBool::new(false),
            manually_stopped: AtomicBool::new(false),
            pool: ApiPool::new(),
        }
    }

    pub fn core(&self) -> CoreType {
        C::CORE
    }

    pub fn spec(&self) -> &ProcessSpec {
        &self.spec
    }

    /// The current process handle, running or not
    pub fn process(&self) -> Option<Arc<Process<C>>> {
        self.process.read().clone()
    }

    pub fn is_running(&self) -> bool {
        self.process().is_some_and(|p| p.is_running())
    }

    /// Not running although nobody asked it to stop.
    pub fn did_crash(&self) -> bool {
        match self.process() {
            Some(process) => {
                !process.is_running() && !self.manually_stopped.load(Ordering::SeqCst)
            }
            None => false,
        }
    }

    pub fn is_manually_stopped(&self) -> bool {
        self.manually_stopped.load(Ordering::SeqCst)
    }

    /// Version of the running process, else whatever the binary reports.
    pub async fn version(&self) -> String {
        match self.process().filter(|p| p.is_running()) {
            Some(process) => process.version(),
            None => self.spec.version().await,
        }
    }

    pub fn uptime(&self) -> u64 {
        self.process()
            .filter(|p| p.is_running())
            .map(|p| p.uptime())
            .unwrap_or(0)
    }

    pub fn result(&self) -> String {
        self.process().map(|p| p.result()).unwrap_or_default()
    }

    pub fn set_need_restart(&self) {
        self.need_restart.store(true, Ordering::SeqCst);
    }

    pub fn is_need_restart_and_set_false(&self) -> bool {
        self.need_restart.swap(false, Ordering::SeqCst)
    }

    /// Control-API client of the running process.
    pub async fn api(&self) -> Result<Arc<C::Api>> {
        let process = self
            .process()
            .filter(|p| p.is_running())
            .ok_or_else(|| Error::not_running(C::CORE.as_str()))?;
        self.pool.get(process.api_port()).await
    }

    pub async fn get_traffic(&self, reset: bool) -> Result<(Vec<Traffic>, Vec<ClientTraffic>)> {
        self.api().await?.get_traffic(reset).await
    }

    /// Stop the process and remember that it was stopped on purpose.
    pub async fn stop(&self) -> Result<()> {
        let _guard = self.restart_lock.lock().await;
        self.manually_stopped.store(true, Ordering::SeqCst);
        self.pool.close_all();
        match self.process() {
            Some(process) => process.stop().await,
            None => Err(Error::not_running(C::CORE.as_str())),
        }
    }

    /// Write `config` to the config file without touching the process.
    pub async fn ensure_config_file(&self, config: &C) -> Result<PathBuf> {
        let data = config.to_pretty_json()?;
        write_config(&self.spec.config_path, &self.spec.alternative_paths, &data).await
    }

    /// Copy-on-write edit of the running process's config model.
    pub async fn update_live(&self, edit: impl FnOnce(&mut C) -> bool) -> Result<bool> {
        match self.process().filter(|p| p.is_running()) {
            Some(process) => process.update_config(edit).await,
            None => Ok(false),
        }
    }

    /// Replace the running process with one running `config`.
    ///
    /// The candidate is checked by the binary before anything is torn down,
    /// so a rejected config leaves the old process running.
    pub async fn restart_with(&self, config: C, force: bool) -> Result<()> {
        let _guard = self.restart_lock.lock().await;
        self.manually_stopped.store(false, Ordering::SeqCst);

        let current = self.process();
        if let Some(process) = current.as_ref().filter(|p| p.is_running()) {
            let changed = *process.config() != config;
            let needed = self.need_restart.load(Ordering::SeqCst);
            if !force && !changed && !needed {
                debug!("Not restarting {}: config unchanged", C::CORE);
                return Ok(());
            }
        }

        self.spec.check_bytes(&config.to_pretty_json()?).await?;

        self.pool.close_all();
        if let Some(process) = current.filter(|p| p.is_running()) {
            if let Err(e) = process.stop().await {
                warn!("Failed to stop old {} process: {}", C::CORE, e);
            }
        }

        let process = Arc::new(Process::new(self.spec.clone(), config));
        *self.process.write() = Some(process.clone());
        process.start().await?;
        self.need_restart.store(false, Ordering::SeqCst);
        info!("{} restarted successfully", C::CORE);
        Ok(())
    }
}
