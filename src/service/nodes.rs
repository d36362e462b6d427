//! Multi-node fan-out
//!
//! In multi-node mode the panel runs no core itself. Every node gets a
//! config holding only the inbounds assigned to it, pushed over HTTP.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use reqwest::{header, Client};
use tracing::{error, info, warn};

use crate::builder::Buildable;
use crate::common::{Error, Result};
use crate::model::{CoreType, InboundEndpoint, Node};

use super::manager::CoreManager;

const NODE_TIMEOUT: Duration = Duration::from_secs(10);

/// Delivers a built config to a node
#[async_trait]
pub trait NodeClient: Send + Sync {
    async fn apply_config(&self, node: &Node, core: CoreType, config: &[u8]) -> Result<()>;
}

/// Pushes configs to the node agent's `/node/config` endpoint.
pub struct HttpNodeClient {
    client: Client,
}

impl HttpNodeClient {
    pub fn new() -> Result<Self> {
        let client = Client::builder().timeout(NODE_TIMEOUT).build()?;
        Ok(HttpNodeClient { client })
    }
}

#[async_trait]
impl NodeClient for HttpNodeClient {
    async fn apply_config(&self, node: &Node, core: CoreType, config: &[u8]) -> Result<()> {
        let url = format!(
            "{}/node/config?core={}",
            node.address.trim_end_matches('/'),
            core
        );
        let mut req = self
            .client
            .post(&url)
            .header(header::CONTENT_TYPE, "application/json")
            .body(config.to_vec());
        if !node.api_key.is_empty() {
            req = req.bearer_auth(&node.api_key);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::api(format!(
                "node returned status {}: {}",
                status.as_u16(),
                body
            )));
        }
        Ok(())
    }
}

/// Enabled inbounds per node id. Inbounds assigned to no node are not served.
pub fn group_by_node(inbounds: Vec<InboundEndpoint>) -> HashMap<i64, Vec<InboundEndpoint>> {
    let mut grouped: HashMap<i64, Vec<InboundEndpoint>> = HashMap::new();
    for inbound in inbounds.into_iter().filter(|i| i.enable) {
        for node_id in &inbound.node_ids {
            grouped.entry(*node_id).or_default().push(inbound.clone());
        }
    }
    grouped
}

impl CoreManager {
    /// Build one config per node and push them all concurrently.
    ///
    /// Fails only when every node that had something to serve failed.
    pub async fn restart_multi_mode<C: Buildable>(&self) -> Result<()> {
        let nodes = self.store().nodes().await?;
        let mut grouped = group_by_node(self.store().inbounds().await?);

        let targets: Vec<(Node, Vec<InboundEndpoint>)> = nodes
            .into_iter()
            .filter_map(|node| {
                let inbounds = grouped.remove(&node.id)?;
                Some((node, inbounds))
            })
            .collect();
        if targets.is_empty() {
            warn!("Multi-node mode: no node has inbounds assigned, nothing to apply");
            return Ok(());
        }

        let errors: Mutex<Vec<String>> = Mutex::new(Vec::new());
        let pushes = targets.iter().map(|(node, inbounds)| {
            let errors = &errors;
            async move {
                let result = async {
                    let config = self
                        .builder()
                        .build_for_node::<C>(Some(node.id), inbounds)
                        .await?;
                    let data = config.to_pretty_json()?;
                    self.node_client().apply_config(node, C::CORE, &data).await
                }
                .await;
                match result {
                    Ok(()) => info!("[Node: {}] Successfully applied config", node.name),
                    Err(e) => {
                        error!("[Node: {}] Failed to apply config: {}", node.name, e);
                        errors.lock().push(format!("node {}: {}", node.name, e));
                    }
                }
            }
        });
        join_all(pushes).await;

        let errors = errors.into_inner();
        if errors.is_empty() {
            info!("Successfully applied config to all {} node(s)", targets.len());
            return Ok(());
        }
        warn!("Failed to apply config to some nodes: {} error(s)", errors.len());
        for e in &errors {
            warn!("  - {}", e);
        }
        if errors.len() == targets.len() {
            return Err(Error::api(format!(
                "failed to apply config to all nodes: {} errors",
                errors.len()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::{CoreConfig, SingBoxConfig};
    use crate::model::Protocol;
    use crate::service::manager::tests::manager_with;
    use serde_json::{json, Value};
    use std::collections::HashSet;
    use std::path::Path;
    use std::sync::Arc;

    /// Records every push; nodes listed in `failing` reject theirs.
    #[derive(Default)]
    pub(crate) struct RecordingNodes {
        pub(crate) pushed: Mutex<Vec<(i64, CoreType, Value)>>,
        pub(crate) failing: Mutex<HashSet<i64>>,
    }

    #[async_trait]
    impl NodeClient for RecordingNodes {
        async fn apply_config(&self, node: &Node, core: CoreType, config: &[u8]) -> Result<()> {
            if self.failing.lock().contains(&node.id) {
                return Err(Error::api("connection refused"));
            }
            let value: Value = serde_json::from_slice(config)?;
            self.pushed.lock().push((node.id, core, value));
            Ok(())
        }
    }

    fn inbound(tag: &str, protocol: Protocol, node_ids: Vec<i64>) -> InboundEndpoint {
        InboundEndpoint {
            tag: tag.to_string(),
            port: 443,
            protocol: Some(protocol),
            enable: true,
            settings: json!({"clients": [{"id": "u1", "email": "a@x"}]}).to_string(),
            node_ids,
            ..Default::default()
        }
    }

    #[test]
    fn test_group_by_node() {
        let mut disabled = inbound("off", Protocol::Vless, vec![1]);
        disabled.enable = false;
        let grouped = group_by_node(vec![
            inbound("a", Protocol::Vless, vec![1, 2]),
            inbound("b", Protocol::Trojan, vec![2]),
            inbound("local", Protocol::Vless, vec![]),
            disabled,
        ]);
        assert_eq!(grouped[&1].len(), 1);
        assert_eq!(grouped[&2].len(), 2);
        assert_eq!(grouped.len(), 2);
    }

    async fn manager_with_nodes() -> (CoreManager, Arc<RecordingNodes>, Vec<Node>) {
        let recorder = Arc::new(RecordingNodes::default());
        let manager = manager_with(Path::new("/nonexistent-bin-folder"), recorder.clone());
        let mut nodes = Vec::new();
        for name in ["n1", "n2"] {
            let node = Node {
                name: name.to_string(),
                address: format!("http://{}:2054", name),
                ..Default::default()
            };
            nodes.push(manager.store().save_node(node).await.unwrap());
        }
        (manager, recorder, nodes)
    }

    #[tokio::test]
    async fn test_each_node_gets_its_own_inbounds() {
        let (manager, recorder, nodes) = manager_with_nodes().await;
        let (n1, n2) = (nodes[0].id, nodes[1].id);
        let store = manager.store();
        store.save_inbound(inbound("in-a", Protocol::Vless, vec![n1])).await.unwrap();
        store.save_inbound(inbound("in-b", Protocol::Vless, vec![n2])).await.unwrap();
        store.save_inbound(inbound("in-t", Protocol::Tunnel, vec![n2])).await.unwrap();

        manager.restart_multi_mode::<SingBoxConfig>().await.unwrap();

        let pushed = recorder.pushed.lock().clone();
        assert_eq!(pushed.len(), 2);
        for (node_id, core, config) in pushed {
            assert_eq!(core, CoreType::SingBox);
            let config = SingBoxConfig::parse(&config.to_string()).unwrap();
            let expected = if node_id == n1 { "in-a" } else { "in-b" };
            let tags: Vec<_> = config.inbounds.iter().map(|i| i.tag.as_str()).collect();
            assert_eq!(tags, vec![expected]);
        }
    }

    #[tokio::test]
    async fn test_partial_and_total_failure() {
        let (manager, recorder, nodes) = manager_with_nodes().await;
        let store = manager.store();
        for node in &nodes {
            store
                .save_inbound(inbound(&format!("in-{}", node.id), Protocol::Vless, vec![node.id]))
                .await
                .unwrap();
        }

        recorder.failing.lock().insert(nodes[0].id);
        manager.restart_multi_mode::<SingBoxConfig>().await.unwrap();
        assert_eq!(recorder.pushed.lock().len(), 1);

        recorder.failing.lock().insert(nodes[1].id);
        let err = manager.restart_multi_mode::<SingBoxConfig>().await.unwrap_err();
        assert!(err.to_string().contains("failed to apply config to all nodes"));
    }
}
