//! Core service adapters
//!
//! [`CoreService`] is the one surface the panel talks to. There is a single
//! generic implementation, [`CoreAdapter`], instantiated once per core.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use crate::builder::{Buildable, ConfigBuilder};
use crate::common::{ClientTraffic, Result, Traffic};
use crate::core::ControlApi;
use crate::model::CoreType;

use super::runtime::CoreRuntime;

#[async_trait]
pub trait CoreService: Send + Sync {
    fn core(&self) -> CoreType;

    /// The config the core would run, built from storage.
    async fn get_config(&self) -> Result<Value>;

    /// Rebuild and restart. Without `force` an unchanged config is a no-op.
    async fn restart(&self, force: bool) -> Result<()>;

    fn is_running(&self) -> bool;
    fn did_crash(&self) -> bool;

    async fn get_traffic(&self, reset: bool) -> Result<(Vec<Traffic>, Vec<ClientTraffic>)>;
    async fn get_version(&self) -> String;
    fn get_uptime(&self) -> u64;
    fn get_result(&self) -> String;

    async fn stop(&self) -> Result<()>;

    /// Write the built config to disk without (re)starting anything.
    async fn ensure_config_file(&self) -> Result<PathBuf>;

    /// Add a stored client to a running inbound.
    async fn add_user(&self, protocol: &str, tag: &str, client: &Value) -> Result<()>;
    async fn remove_user(&self, tag: &str, email: &str) -> Result<()>;

    fn set_need_restart(&self);
    fn is_need_restart_and_set_false(&self) -> bool;
}

pub struct CoreAdapter<C: Buildable> {
    runtime: Arc<CoreRuntime<C>>,
    builder: ConfigBuilder,
}

impl<C: Buildable> CoreAdapter<C> {
    pub fn new(runtime: Arc<CoreRuntime<C>>, builder: ConfigBuilder) -> Self {
        CoreAdapter { runtime, builder }
    }
}

#[async_trait]
impl<C: Buildable> CoreService for CoreAdapter<C> {
    fn core(&self) -> CoreType {
        C::CORE
    }

    async fn get_config(&self) -> Result<Value> {
        let config = self.builder.build::<C>().await?;
        Ok(serde_json::to_value(config)?)
    }

    async fn restart(&self, force: bool) -> Result<()> {
        let config = self.builder.build::<C>().await?;
        self.runtime.restart_with(config, force).await
    }

    fn is_running(&self) -> bool {
        self.runtime.is_running()
    }

    fn did_crash(&self) -> bool {
        self.runtime.did_crash()
    }

    async fn get_traffic(&self, reset: bool) -> Result<(Vec<Traffic>, Vec<ClientTraffic>)> {
        self.runtime.get_traffic(reset).await
    }

    async fn get_version(&self) -> String {
        self.runtime.version().await
    }

    fn get_uptime(&self) -> u64 {
        self.runtime.uptime()
    }

    fn get_result(&self) -> String {
        self.runtime.result()
    }

    async fn stop(&self) -> Result<()> {
        self.runtime.stop().await
    }

    async fn ensure_config_file(&self) -> Result<PathBuf> {
        let config = self.builder.build::<C>().await?;
        self.runtime.ensure_config_file(&config).await
    }

    async fn add_user(&self, protocol: &str, tag: &str, client: &Value) -> Result<()> {
        let user = C::native_user(protocol, client);
        self.runtime.api().await?.add_user(protocol, tag, &user).await?;
        let synced = self
            .runtime
            .update_live(|config| config.add_client(tag, &user))
            .await?;
        info!("Added user to {} inbound {} (config synced: {})", C::CORE, tag, synced);
        Ok(())
    }

    async fn remove_user(&self, tag: &str, email: &str) -> Result<()> {
        self.runtime.api().await?.remove_user(tag, email).await?;
        let synced = self
            .runtime
            .update_live(|config| config.remove_client(tag, email))
            .await?;
        debug!("Removed user {} from {} inbound {} (config synced: {})", email, C::CORE, tag, synced);
        Ok(())
    }

    fn set_need_restart(&self) {
        self.runtime.set_need_restart();
    }

    fn is_need_restart_and_set_false(&self) -> bool {
        self.runtime.is_need_restart_and_set_false()
    }
}
