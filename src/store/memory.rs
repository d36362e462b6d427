//! In-memory store with an optional JSON snapshot

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{Depleted, DepletedClient, Store, ALL_TAGS};
use crate::common::{ClientTraffic, Error, Result, Traffic};
use crate::supervisor::write_atomic;
use crate::model::{
    CoreConfigProfile, InboundEndpoint, Node, OutboundEndpoint, OutboundTraffic,
};

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct State {
    next_id: i64,
    settings: BTreeMap<String, String>,
    inbounds: Vec<InboundEndpoint>,
    outbounds: Vec<OutboundEndpoint>,
    outbound_traffics: Vec<OutboundTraffic>,
    profiles: Vec<CoreConfigProfile>,
    nodes: Vec<Node>,
}

impl State {
    fn alloc_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Store kept in memory.
///
/// Every mutation is applied under one lock, so a call either lands
/// completely or not at all. When a snapshot path is set the whole state is
/// rewritten to it after each mutation. Snapshots carry the generation of
/// the mutation that produced them and an older one never replaces a newer
/// one on disk.
pub struct MemoryStore {
    state: Mutex<(State, u64)>,
    snapshot: Option<PathBuf>,
    written: tokio::sync::Mutex<u64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            state: Mutex::new((State::default(), 0)),
            snapshot: None,
            written: tokio::sync::Mutex::new(0),
        }
    }

    /// Open a store backed by a snapshot file, loading it when present.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let state: State = serde_json::from_slice(&bytes)?;
                info!("Loaded store snapshot from {:?}", path);
                state
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => State::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(MemoryStore {
            state: Mutex::new((state, 0)),
            snapshot: Some(path),
            written: tokio::sync::Mutex::new(0),
        })
    }

    /// Apply `f` under the lock, then persist the snapshot.
    async fn mutate<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut State) -> Result<T> + Send,
        T: Send,
    {
        let (out, pending) = {
            let mut guard = self.state.lock();
            let (state, generation) = &mut *guard;
            let out = f(state)?;
            *generation += 1;
            let pending = match self.snapshot {
                Some(_) => Some((*generation, serde_json::to_vec_pretty(&*state)?)),
                None => None,
            };
            (out, pending)
        };

        if let (Some(path), Some((generation, bytes))) = (&self.snapshot, pending) {
            let mut written = self.written.lock().await;
            if *written >= generation {
                debug!("Store snapshot {} superseded, skipping", generation);
                return Ok(out);
            }
            write_atomic(path, &bytes).await?;
            *written = generation;
            debug!("Store snapshot {} written to {:?}", generation, path);
        }
        Ok(out)
    }

    fn state(&self) -> MappedMutexGuard<'_, State> {
        MutexGuard::map(self.state.lock(), |(state, _)| state)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        Ok(self.state().settings.get(key).cloned())
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let (key, value) = (key.to_string(), value.to_string());
        self.mutate(move |state| {
            state.settings.insert(key, value);
            Ok(())
        })
        .await
    }

    async fn delete_setting(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.mutate(move |state| {
            state.settings.remove(&key);
            Ok(())
        })
        .await
    }

    async fn inbounds(&self) -> Result<Vec<InboundEndpoint>> {
        Ok(self.state().inbounds.clone())
    }

    async fn save_inbound(&self, mut inbound: InboundEndpoint) -> Result<InboundEndpoint> {
        self.mutate(move |state| {
            if state
                .inbounds
                .iter()
                .any(|i| i.tag == inbound.tag && i.id != inbound.id)
            {
                return Err(Error::conflict(format!(
                    "inbound tag already exists: {}",
                    inbound.tag
                )));
            }
            if inbound.id == 0 {
                inbound.id = state.alloc_id();
            }
            for stat in inbound.client_stats.iter_mut() {
                if stat.id == 0 {
                    stat.id = state.alloc_id();
                }
                stat.inbound_id = inbound.id;
            }
            match state.inbounds.iter_mut().find(|i| i.id == inbound.id) {
                Some(existing) => *existing = inbound.clone(),
                None => state.inbounds.push(inbound.clone()),
            }
            Ok(inbound)
        })
        .await
    }

    async fn outbounds(&self) -> Result<Vec<OutboundEndpoint>> {
        Ok(self.state().outbounds.clone())
    }

    async fn save_outbound(&self, mut outbound: OutboundEndpoint) -> Result<OutboundEndpoint> {
        self.mutate(move |state| {
            if state
                .outbounds
                .iter()
                .any(|o| o.tag == outbound.tag && o.id != outbound.id)
            {
                return Err(Error::conflict(format!(
                    "outbound tag already exists: {}",
                    outbound.tag
                )));
            }
            if outbound.id == 0 {
                outbound.id = state.alloc_id();
            }
            match state.outbounds.iter_mut().find(|o| o.id == outbound.id) {
                Some(existing) => *existing = outbound.clone(),
                None => state.outbounds.push(outbound.clone()),
            }
            Ok(outbound)
        })
        .await
    }

    async fn apply_traffic(&self, traffics: &[Traffic], clients: &[ClientTraffic]) -> Result<()> {
        if traffics.is_empty() && clients.is_empty() {
            return Ok(());
        }
        let traffics = traffics.to_vec();
        let clients = clients.to_vec();
        self.mutate(move |state| {
            for traffic in &traffics {
                if traffic.is_inbound {
                    if let Some(inbound) = state.inbounds.iter_mut().find(|i| i.tag == traffic.tag)
                    {
                        inbound.up += traffic.up;
                        inbound.down += traffic.down;
                        inbound.all_time += traffic.up + traffic.down;
                    }
                } else if traffic.is_outbound {
                    let idx = match state
                        .outbound_traffics
                        .iter()
                        .position(|o| o.tag == traffic.tag)
                    {
                        Some(idx) => idx,
                        None => {
                            let id = state.alloc_id();
                            state.outbound_traffics.push(OutboundTraffic {
                                id,
                                tag: traffic.tag.clone(),
                                ..Default::default()
                            });
                            state.outbound_traffics.len() - 1
                        }
                    };
                    let row = &mut state.outbound_traffics[idx];
                    row.up += traffic.up;
                    row.down += traffic.down;
                    row.total = row.up + row.down;
                }
            }

            for client in &clients {
                for inbound in state.inbounds.iter_mut() {
                    for stat in inbound
                        .client_stats
                        .iter_mut()
                        .filter(|s| s.email == client.email)
                    {
                        stat.up += client.up;
                        stat.down += client.down;
                        stat.all_time += client.up + client.down;
                    }
                }
            }
            Ok(())
        })
        .await
    }

    async fn disable_depleted(&self, now_ms: i64) -> Result<Depleted> {
        self.mutate(move |state| {
            let mut depleted = Depleted::default();
            for inbound in state.inbounds.iter_mut().filter(|i| i.enable) {
                if inbound.is_depleted(now_ms) {
                    inbound.enable = false;
                    depleted.inbounds.push(inbound.tag.clone());
                    continue;
                }
                for stat in inbound.client_stats.iter_mut().filter(|s| s.enable) {
                    if stat.is_depleted(now_ms) {
                        stat.enable = false;
                        depleted.clients.push(DepletedClient {
                            inbound_tag: inbound.tag.clone(),
                            protocol: inbound.protocol,
                            email: stat.email.clone(),
                        });
                    }
                }
            }
            Ok(depleted)
        })
        .await
    }

    async fn outbound_traffics(&self) -> Result<Vec<OutboundTraffic>> {
        Ok(self.state().outbound_traffics.clone())
    }

    async fn reset_outbound_traffic(&self, tag: &str) -> Result<()> {
        let tag = tag.to_string();
        self.mutate(move |state| {
            for row in state
                .outbound_traffics
                .iter_mut()
                .filter(|o| tag == ALL_TAGS || o.tag == tag)
            {
                row.up = 0;
                row.down = 0;
                row.total = 0;
            }
            Ok(())
        })
        .await
    }

    async fn profiles(&self) -> Result<Vec<CoreConfigProfile>> {
        Ok(self.state().profiles.clone())
    }

    async fn profile(&self, id: i64) -> Result<Option<CoreConfigProfile>> {
        Ok(self
            .state
            .lock()
            .0.profiles
            .iter()
            .find(|p| p.id == id)
            .cloned())
    }

    async fn save_profile(&self, mut profile: CoreConfigProfile) -> Result<CoreConfigProfile> {
        self.mutate(move |state| {
            let now = Utc::now().timestamp();
            if profile.id == 0 {
                profile.id = state.alloc_id();
                profile.created_at = now;
            }
            profile.updated_at = now;
            match state.profiles.iter_mut().find(|p| p.id == profile.id) {
                Some(existing) => *existing = profile.clone(),
                None => state.profiles.push(profile.clone()),
            }
            Ok(profile)
        })
        .await
    }

    async fn delete_profile(&self, id: i64) -> Result<()> {
        self.mutate(move |state| {
            let before = state.profiles.len();
            state.profiles.retain(|p| p.id != id);
            if state.profiles.len() == before {
                return Err(Error::not_found(format!("profile {}", id)));
            }
            Ok(())
        })
        .await
    }

    async fn nodes(&self) -> Result<Vec<Node>> {
        Ok(self.state().nodes.clone())
    }

    async fn save_node(&self, mut node: Node) -> Result<Node> {
        self.mutate(move |state| {
            if node.id == 0 {
                node.id = state.alloc_id();
            }
            match state.nodes.iter_mut().find(|n| n.id == node.id) {
                Some(existing) => *existing = node.clone(),
                None => state.nodes.push(node.clone()),
            }
            Ok(node)
        })
        .await
    }
}
