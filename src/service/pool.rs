//! Control-API client cache, one client per API port

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::common::Result;
use crate::core::ControlApi;

pub struct ApiPool<A: ControlApi> {
    clients: DashMap<u16, Arc<A>>,
}

impl<A: ControlApi> ApiPool<A> {
    pub fn new() -> Self {
        ApiPool {
            clients: DashMap::new(),
        }
    }

    /// Cached client for `port`, reconnecting when the cached one went stale.
    pub async fn get(&self, port: u16) -> Result<Arc<A>> {
        let cached = self.clients.get(&port).map(|entry| Arc::clone(entry.value()));
        if let Some(api) = cached {
            if api.is_connected() {
                return Ok(api);
            }
            debug!("Dropping stale API client on port {}", port);
            api.close();
            self.clients.remove(&port);
        }

        let api = Arc::new(A::connect(u32::from(port)).await?);
        self.clients.insert(port, Arc::clone(&api));
        Ok(api)
    }

    /// Close and forget every cached client.
    pub fn close_all(&self) {
        self.clients.retain(|port, api| {
            debug!("Closing API client on port {}", port);
            api.close();
            false
        });
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

impl<A: ControlApi> Default for ApiPool<A> {
    fn default() -> Self {
        Self::new()
    }
}
