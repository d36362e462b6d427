//! Persistence collaborator
//!
//! The control plane only needs a handful of row-level operations and a
//! key/value setting table. `Store` is the seam; [`MemoryStore`] is the
//! bundled implementation, optionally snapshotted to a JSON file.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;

use crate::common::{ClientTraffic, Result, Traffic};
use crate::model::{
    CoreConfigProfile, InboundEndpoint, Node, OutboundEndpoint, OutboundTraffic, Protocol,
};

/// Tag accepted by [`Store::reset_outbound_traffic`] to reset every row
pub const ALL_TAGS: &str = "-alltags-";

/// A client disabled by [`Store::disable_depleted`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepletedClient {
    pub inbound_tag: String,
    pub protocol: Option<Protocol>,
    pub email: String,
}

/// Everything disabled in one depletion pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Depleted {
    pub clients: Vec<DepletedClient>,
    pub inbounds: Vec<String>,
}

impl Depleted {
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty() && self.inbounds.is_empty()
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn get_setting(&self, key: &str) -> Result<Option<String>>;
    async fn set_setting(&self, key: &str, value: &str) -> Result<()>;
    /// Remove a setting; removing an absent key is not an error.
    async fn delete_setting(&self, key: &str) -> Result<()>;

    /// All inbounds with their client stats
    async fn inbounds(&self) -> Result<Vec<InboundEndpoint>>;
    /// Insert (id 0) or replace an inbound
    async fn save_inbound(&self, inbound: InboundEndpoint) -> Result<InboundEndpoint>;

    async fn outbounds(&self) -> Result<Vec<OutboundEndpoint>>;
    async fn save_outbound(&self, outbound: OutboundEndpoint) -> Result<OutboundEndpoint>;

    /// Add counter deltas to inbound, client and outbound rows in one transaction.
    async fn apply_traffic(&self, traffics: &[Traffic], clients: &[ClientTraffic]) -> Result<()>;
    /// Disable enabled inbounds and clients that ran out of quota or time.
    async fn disable_depleted(&self, now_ms: i64) -> Result<Depleted>;

    async fn outbound_traffics(&self) -> Result<Vec<OutboundTraffic>>;
    async fn reset_outbound_traffic(&self, tag: &str) -> Result<()>;

    async fn profiles(&self) -> Result<Vec<CoreConfigProfile>>;
    async fn profile(&self, id: i64) -> Result<Option<CoreConfigProfile>>;
    async fn save_profile(&self, profile: CoreConfigProfile) -> Result<CoreConfigProfile>;
    async fn delete_profile(&self, id: i64) -> Result<()>;

    async fn nodes(&self) -> Result<Vec<Node>>;
    async fn save_node(&self, node: Node) -> Result<Node>;
}
