//! Periodic traffic reconciliation
//!
//! Each cycle reads the counters with reset, so what comes back are deltas
//! since the previous cycle. A failed read skips the cycle; the counters
//! keep accumulating in the core and are picked up next time.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::builder::now_ms;
use crate::common::Result;
use crate::store::Store;

use super::adapter::CoreService;
use super::manager::CoreManager;

/// What one cycle did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// False when the counters could not be read
    pub applied: bool,
    pub disabled_clients: usize,
    pub disabled_inbounds: usize,
    pub restarted: bool,
}

/// Run one cycle against `service`.
pub async fn reconcile(
    service: &dyn CoreService,
    store: &dyn Store,
    now_ms: i64,
) -> Result<ReconcileReport> {
    let mut report = ReconcileReport::default();

    let (traffics, clients) = match service.get_traffic(true).await {
        Ok(counters) => counters,
        Err(e) => {
            debug!("Skipping traffic cycle: {}", e);
            return Ok(report);
        }
    };
    store.apply_traffic(&traffics, &clients).await?;
    report.applied = true;

    let depleted = store.disable_depleted(now_ms).await?;
    for client in &depleted.clients {
        match service.remove_user(&client.inbound_tag, &client.email).await {
            Ok(()) => info!(
                "Removed depleted user {} from inbound {}",
                client.email, client.inbound_tag
            ),
            Err(e) => {
                warn!(
                    "Live removal of {} from {} failed, scheduling restart: {}",
                    client.email, client.inbound_tag, e
                );
                service.set_need_restart();
            }
        }
    }
    if !depleted.inbounds.is_empty() {
        info!("Disabled depleted inbound(s): {}", depleted.inbounds.join(", "));
        service.set_need_restart();
    }
    report.disabled_clients = depleted.clients.len();
    report.disabled_inbounds = depleted.inbounds.len();

    if service.is_need_restart_and_set_false() {
        match service.restart(false).await {
            Ok(()) => report.restarted = true,
            Err(e) => warn!("Restart after traffic cycle failed: {}", e),
        }
    }
    Ok(report)
}

pub struct TrafficReconciler {
    manager: Arc<CoreManager>,
}

impl TrafficReconciler {
    pub fn new(manager: Arc<CoreManager>) -> Self {
        TrafficReconciler { manager }
    }

    pub async fn run_once(&self) -> Result<ReconcileReport> {
        let service = self.manager.get_core_service().await?;
        reconcile(service.as_ref(), self.manager.store().as_ref(), now_ms()).await
    }

    /// Tick every `interval` until `shutdown` is cancelled.
    pub async fn run(self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        warn!("Traffic cycle failed: {}", e);
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }
        debug!("Traffic reconciler stopped");
    }
}
