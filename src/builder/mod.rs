//! Config builder
//!
//! Merges the stored template of a core with the inbound and outbound rows
//! into a ready-to-run config. The merge itself is pure ([`Buildable::assemble`]);
//! [`ConfigBuilder`] loads the inputs from the store and the settings service.
//!
//! Malformed per-endpoint JSON never fails a build: the endpoint contributes
//! what could be parsed and the rest of the config is still produced.

mod singbox;
mod xray;

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::common::{Document, Result};
use crate::core::{CoreConfig, XrayInbound};
use crate::model::{InboundEndpoint, OutboundEndpoint, Protocol};
use crate::service::SettingsService;
use crate::store::Store;

pub use self::singbox::SINGBOX_BUILD_PROTOCOLS;

/// Client keys a core needs; everything else is panel bookkeeping.
const CLIENT_KEYS: [&str; 5] = ["email", "id", "password", "flow", "method"];

const DEPRECATED_FLOW: &str = "xtls-rprx-vision-udp443";
const CANONICAL_FLOW: &str = "xtls-rprx-vision";

/// A core config that can be assembled from template and rows
pub trait Buildable: CoreConfig {
    /// Whether this core can serve a stored inbound protocol.
    fn supports(protocol: Protocol) -> bool;

    /// Merge enabled rows into this template.
    fn assemble(
        self,
        inbounds: &[InboundEndpoint],
        outbounds: &[OutboundEndpoint],
        now_ms: i64,
    ) -> Self;

    /// A stored client entry in the shape this core's control API expects.
    fn native_user(_protocol: &str, client: &Value) -> Value {
        client.clone()
    }
}

/// Loads template and rows, then assembles.
#[derive(Clone)]
pub struct ConfigBuilder {
    store: Arc<dyn Store>,
    settings: SettingsService,
}

impl ConfigBuilder {
    pub fn new(store: Arc<dyn Store>, settings: SettingsService) -> Self {
        Self { store, settings }
    }

    /// Build a core's config for the local node.
    pub async fn build<C: Buildable>(&self) -> Result<C> {
        let inbounds = self.store.inbounds().await?;
        self.build_for_node::<C>(None, &inbounds).await
    }

    /// Build a core's config serving only `inbounds`. With a node id,
    /// outbounds pinned to other nodes are left out; without one only
    /// unpinned outbounds are used.
    pub async fn build_for_node<C: Buildable>(
        &self,
        node_id: Option<i64>,
        inbounds: &[InboundEndpoint],
    ) -> Result<C> {
        let template: C = self.template::<C>().await?;
        let outbounds: Vec<OutboundEndpoint> = self
            .store
            .outbounds()
            .await?
            .into_iter()
            .filter(|o| o.enable)
            .filter(|o| {
                o.node_ids.is_empty() || node_id.is_some_and(|id| o.node_ids.contains(&id))
            })
            .collect();

        let config = template.assemble(inbounds, &outbounds, now_ms());
        match node_id {
            Some(id) => debug!("Built {} config for node {}", C::CORE, id),
            None => debug!("Built {} config", C::CORE),
        }
        Ok(config)
    }

    /// The validated template of a core.
    pub async fn template<C: Buildable>(&self) -> Result<C> {
        let text = self.settings.template(C::CORE).await?;
        C::parse(&text)
    }
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Enabled rows the core `C` can serve. Every skipped row is logged.
pub(crate) fn servable<'a, C: Buildable>(
    rows: &'a [InboundEndpoint],
) -> impl Iterator<Item = &'a InboundEndpoint> {
    rows.iter().filter(|r| r.enable).filter(|row| match row.protocol {
        Some(protocol) if C::supports(protocol) => true,
        _ => {
            warn!(
                "Skipping inbound {} (tag: {}): protocol '{}' is not supported by {}",
                row.remark,
                row.tag,
                row.protocol_name(),
                C::CORE
            );
            false
        }
    })
}

/// Drop template inbounds whose tag is used by an emitted row or by an
/// earlier template inbound. Rows that end up in the config always win;
/// rows the core cannot serve reserve nothing.
pub(crate) fn without_colliding<T>(
    template: Vec<T>,
    emitted: &[T],
    tag_of: impl Fn(&T) -> &str,
) -> Vec<T> {
    let mut taken: HashSet<String> = emitted
        .iter()
        .map(|inbound| tag_of(inbound))
        .filter(|tag| !tag.is_empty())
        .map(str::to_string)
        .collect();

    template
        .into_iter()
        .filter(|inbound| {
            let tag = tag_of(inbound);
            if tag.is_empty() || taken.insert(tag.to_string()) {
                return true;
            }
            warn!("Skipping template inbound with tag '{}': the tag is already in use", tag);
            false
        })
        .collect()
}

/// Turn a stored inbound into Xray's native shape, with per-client
/// bookkeeping stripped and depleted clients removed.
pub fn prepare_inbound(inbound: &InboundEndpoint, now_ms: i64) -> XrayInbound {
    XrayInbound {
        listen: (!inbound.listen.is_empty()).then(|| Value::from(inbound.listen.as_str())),
        port: Some(Value::from(inbound.port)),
        protocol: inbound.protocol_name().to_string(),
        settings: prepare_settings(inbound, now_ms),
        stream_settings: prepare_stream(inbound),
        tag: inbound.tag.clone(),
        sniffing: parse_blob(&inbound.sniffing, &inbound.tag, "sniffing"),
        extra: Map::new(),
    }
}

fn parse_blob(text: &str, tag: &str, what: &str) -> Option<Value> {
    if text.trim().is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(text) {
        Ok(value) if value.is_object() => Some(value),
        Ok(_) | Err(_) => {
            warn!("Ignoring malformed {} of {}", what, tag);
            None
        }
    }
}

fn prepare_settings(inbound: &InboundEndpoint, now_ms: i64) -> Option<Value> {
    let mut settings = Document::from_value(parse_blob(&inbound.settings, &inbound.tag, "settings")?)?;

    let depleted: HashSet<&str> = inbound
        .client_stats
        .iter()
        .filter(|s| !s.enable || s.is_depleted(now_ms))
        .map(|s| s.email.as_str())
        .collect();

    if let Some(clients) = settings.array_mut("clients") {
        clients.retain(|client| {
            let email = client.get("email").and_then(Value::as_str).unwrap_or_default();
            if depleted.contains(email) {
                info!("Remove inbound user {} due to expiration or traffic limit", email);
                return false;
            }
            client.get("enable").and_then(Value::as_bool) != Some(false)
        });
        for client in clients.iter_mut() {
            if let Some(client) = client.as_object_mut() {
                client.retain(|key, _| CLIENT_KEYS.contains(&key.as_str()));
                if client.get("flow").and_then(Value::as_str) == Some(DEPRECATED_FLOW) {
                    client.insert("flow".to_string(), Value::from(CANONICAL_FLOW));
                }
            }
        }
    }
    Some(settings.into_value())
}

fn prepare_stream(inbound: &InboundEndpoint) -> Option<Value> {
    let mut stream = Document::from_value(parse_blob(
        &inbound.stream_settings,
        &inbound.tag,
        "stream settings",
    )?)?;
    for section in ["tlsSettings", "realitySettings"] {
        if let Some(settings) = stream.object_mut(section) {
            settings.shift_remove("settings");
        }
    }
    stream.remove("externalProxy");
    Some(stream.into_value())
}

/// A stored outbound in Xray's shape.
pub fn outbound_value(outbound: &OutboundEndpoint) -> Value {
    let mut doc = Document::new();
    doc.insert("tag", outbound.tag.as_str());
    doc.insert("protocol", outbound.protocol.as_str());
    let blobs = [
        ("settings", &outbound.settings),
        ("streamSettings", &outbound.stream_settings),
        ("proxySettings", &outbound.proxy_settings),
        ("mux", &outbound.mux),
    ];
    for (key, text) in blobs {
        if let Some(value) = parse_blob(text, &outbound.tag, key) {
            doc.insert(key, value);
        }
    }
    if !outbound.send_through.is_empty() {
        doc.insert("sendThrough", outbound.send_through.as_str());
    }
    doc.into_value()
}

/// Replace template outbounds sharing a tag with a row, append the rest.
pub(crate) fn merge_outbounds(template: Option<Value>, rows: Vec<Value>) -> Option<Value> {
    if rows.is_empty() {
        return template;
    }
    let mut list = match template {
        Some(Value::Array(list)) => list,
        Some(_) => {
            warn!("Template outbounds are not a list; replacing them with stored outbounds");
            Vec::new()
        }
        None => Vec::new(),
    };
    for row in rows {
        let tag = row.get("tag").and_then(Value::as_str).unwrap_or_default();
        match list
            .iter_mut()
            .find(|o| o.get("tag").and_then(Value::as_str) == Some(tag))
        {
            Some(existing) => *existing = row,
            None => list.push(row),
        }
    }
    Some(Value::Array(list))
}
