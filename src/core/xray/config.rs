//! Xray config model

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::common::Document;
use crate::core::{port_of_listen, CoreConfig};
use crate::model::CoreType;

use super::XrayApi;

/// Tag of the inbound serving the gRPC control API
pub const API_INBOUND_TAG: &str = "api";

/// Full Xray configuration.
///
/// Sections the control plane never rewrites are kept as raw JSON values,
/// and unknown top-level keys land in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct XrayConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<Value>,
    #[serde(default)]
    pub inbounds: Vec<XrayInbound>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outbounds: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One Xray inbound
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct XrayInbound {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<Value>,
    #[serde(default)]
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<Value>,
    #[serde(
        rename = "streamSettings",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub stream_settings: Option<Value>,
    #[serde(default)]
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sniffing: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl XrayInbound {
    /// Numeric port; ranges and env placeholders yield `None`.
    pub fn port_number(&self) -> Option<u16> {
        match self.port.as_ref()? {
            Value::Number(n) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn listen_str(&self) -> Option<&str> {
        self.listen.as_ref().and_then(Value::as_str)
    }

    pub fn settings_doc(&self) -> Option<Document> {
        Document::from_section(self.settings.as_ref())
    }

    pub fn stream_doc(&self) -> Option<Document> {
        Document::from_section(self.stream_settings.as_ref())
    }

    /// `settings.clients` with a user removed by email (case-insensitive).
    fn remove_client(&mut self, email: &str) -> bool {
        let Some(clients) = self
            .settings
            .as_mut()
            .and_then(|s| s.get_mut("clients"))
            .and_then(Value::as_array_mut)
        else {
            return false;
        };
        let before = clients.len();
        clients.retain(|c| {
            !c.get("email")
                .and_then(Value::as_str)
                .is_some_and(|e| e.eq_ignore_ascii_case(email))
        });
        clients.len() != before
    }

    fn add_client(&mut self, user: &Value) -> bool {
        let Some(email) = user.get("email").and_then(Value::as_str) else {
            return false;
        };
        let settings = self
            .settings
            .get_or_insert_with(|| Value::Object(Map::new()));
        let Some(settings) = settings.as_object_mut() else {
            return false;
        };
        let clients = settings
            .entry("clients")
            .or_insert_with(|| Value::Array(Vec::new()));
        let Some(clients) = clients.as_array_mut() else {
            return false;
        };
        let exists = clients.iter().any(|c| {
            c.get("email")
                .and_then(Value::as_str)
                .is_some_and(|e| e.eq_ignore_ascii_case(email))
        });
        if exists {
            return false;
        }
        clients.push(user.clone());
        true
    }
}

impl XrayConfig {
    pub fn inbound(&self, tag: &str) -> Option<&XrayInbound> {
        self.inbounds.iter().find(|i| i.tag == tag)
    }

    pub fn inbound_mut(&mut self, tag: &str) -> Option<&mut XrayInbound> {
        self.inbounds.iter_mut().find(|i| i.tag == tag)
    }

    pub fn log_doc(&self) -> Option<Document> {
        Document::from_section(self.log.as_ref())
    }

    /// Outbounds as a list; a malformed section yields an empty list.
    pub fn outbound_list(&self) -> Vec<Value> {
        self.outbounds
            .as_ref()
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    }
}

impl CoreConfig for XrayConfig {
    type Api = XrayApi;

    const CORE: CoreType = CoreType::Xray;
    const DEFAULT_API_PORT: u16 = 62789;

    fn declared_api_port(&self) -> Option<u16> {
        if let Some(port) = self
            .inbound(API_INBOUND_TAG)
            .and_then(XrayInbound::port_number)
        {
            return Some(port);
        }
        self.api
            .as_ref()
            .and_then(|api| api.get("listen"))
            .and_then(Value::as_str)
            .and_then(port_of_listen)
    }

    fn remove_client(&mut self, tag: &str, email: &str) -> bool {
        match self.inbound_mut(tag) {
            Some(inbound) => inbound.remove_client(email),
            None => {
                debug!("Inbound {} not found in xray config", tag);
                false
            }
        }
    }

    fn add_client(&mut self, tag: &str, user: &Value) -> bool {
        match self.inbound_mut(tag) {
            Some(inbound) => inbound.add_client(user),
            None => {
                debug!("Inbound {} not found in xray config", tag);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> XrayConfig {
        serde_json::from_value(json!({
            "log": {"loglevel": "warning"},
            "api": {"tag": "api", "services": ["HandlerService", "StatsService"]},
            "inbounds": [
                {"tag": "api", "listen": "127.0.0.1", "port": 62790, "protocol": "dokodemo-door"},
                {"tag": "in-443", "port": 443, "protocol": "vless",
                 "settings": {"clients": [{"id": "u1", "email": "Alice@x"}]}}
            ],
            "outbounds": [{"protocol": "freedom", "tag": "direct"}],
            "fakedns": [{"ipPool": "198.18.0.0/15"}]
        }))
        .unwrap()
    }

    #[test]
    fn test_unknown_sections_preserved() {
        let config = sample();
        assert!(config.extra.contains_key("fakedns"));
        let text = String::from_utf8(config.to_pretty_json().unwrap()).unwrap();
        assert!(text.contains("fakedns"));
    }

    #[test]
    fn test_api_port_from_api_inbound() {
        assert_eq!(sample().api_port(), 62790);

        let mut config = sample();
        config.inbounds.remove(0);
        assert_eq!(config.api_port(), XrayConfig::DEFAULT_API_PORT);

        config.api = Some(json!({"tag": "api", "listen": "127.0.0.1:10085"}));
        assert_eq!(config.api_port(), 10085);
    }

    #[test]
    fn test_client_sync() {
        let mut config = sample();
        assert!(config.remove_client("in-443", "alice@X"));
        assert!(!config.remove_client("in-443", "alice@x"));
        assert!(!config.remove_client("missing", "alice@x"));

        let user = json!({"id": "u2", "email": "bob@x"});
        assert!(config.add_client("in-443", &user));
        assert!(!config.add_client("in-443", &user));
        assert_eq!(
            config.inbound("in-443").unwrap().settings.as_ref().unwrap()["clients"][0]["email"],
            "bob@x"
        );
    }

    #[test]
    fn test_equality_is_structural() {
        let a = XrayConfig::parse(r#"{"log":{"loglevel":"warning","access":"a.log"}}"#).unwrap();
        let b = XrayConfig::parse("{\"log\": {\"access\": \"a.log\", \"loglevel\": \"warning\"}}")
            .unwrap();
        assert_eq!(a, b);
    }
}
