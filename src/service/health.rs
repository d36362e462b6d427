//! Core liveness job

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::model::CoreType;

use super::adapter::CoreService;
use super::manager::CoreManager;

/// Consecutive down observations before a restart
const STRIKES: u32 = 2;

/// Restarts the active core after it was seen down twice in a row.
pub struct CheckCoreRunningJob {
    manager: Arc<CoreManager>,
    strikes: AtomicU32,
}

impl CheckCoreRunningJob {
    pub fn new(manager: Arc<CoreManager>) -> Self {
        CheckCoreRunningJob {
            manager,
            strikes: AtomicU32::new(0),
        }
    }

    /// One observation. Returns whether a restart was issued.
    pub async fn check(&self, service: &dyn CoreService) -> bool {
        if service.is_running() {
            self.strikes.store(0, Ordering::SeqCst);
            return false;
        }
        // Xray reports whether the exit was a crash; a manual stop is left alone
        if service.core() == CoreType::Xray && !service.did_crash() {
            self.strikes.store(0, Ordering::SeqCst);
            return false;
        }

        let strikes = self.strikes.fetch_add(1, Ordering::SeqCst) + 1;
        if strikes < STRIKES {
            warn!("{} is not running ({} of {} checks)", service.core(), strikes, STRIKES);
            return false;
        }

        self.strikes.store(0, Ordering::SeqCst);
        if let Err(e) = service.restart(false).await {
            error!("Restart {} failed: {}", service.core(), e);
        }
        true
    }

    pub async fn run_once(&self) -> bool {
        match self.manager.settings().multi_node_mode().await {
            Ok(true) => return false,
            Ok(false) => {}
            Err(e) => debug!("Could not read multi-node mode: {}", e),
        }
        match self.manager.get_core_service().await {
            Ok(service) => self.check(service.as_ref()).await,
            Err(e) => {
                debug!("Skipping health check: {}", e);
                false
            }
        }
    }

    pub async fn run(self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_once().await;
                }
                _ = shutdown.cancelled() => break,
            }
        }
        debug!("Health check job stopped");
    }
}
