//! Control-plane services
//!
//! Everything above the process supervisor: the per-core runtimes and their
//! adapters, the core manager and switch orchestrator, the background jobs,
//! profiles, multi-node fan-out and the node agent.

pub mod adapter;
pub mod health;
pub mod manager;
pub mod node_agent;
pub mod nodes;
pub mod pool;
pub mod profile;
pub mod reconciler;
pub mod runtime;
pub mod settings;
mod switch;

#[cfg(test)]
mod testing;

pub use adapter::{CoreAdapter, CoreService};
pub use health::CheckCoreRunningJob;
pub use manager::{CoreManager, CoreStatus};
pub use node_agent::{NodeAgent, NodeStatus};
pub use nodes::{HttpNodeClient, NodeClient};
pub use profile::ProfileService;
pub use reconciler::{reconcile, ReconcileReport, TrafficReconciler};
pub use runtime::CoreRuntime;
pub use settings::SettingsService;
