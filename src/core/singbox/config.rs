//! sing-box config model

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::common::Document;
use crate::core::{port_of_listen, CoreConfig};
use crate::model::CoreType;

use super::SingBoxApi;

fn is_false(b: &bool) -> bool {
    !*b
}

fn is_zero(p: &u16) -> bool {
    *p == 0
}

/// Full sing-box configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SingBoxConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ntp: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inbounds: Vec<SingBoxInbound>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outbounds: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experimental: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One sing-box inbound. TLS and Reality live in `tls`, never in `transport`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SingBoxInbound {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen: Option<Value>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub listen_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub users: Option<Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub method: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<Value>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub sniff: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub sniff_override_destination: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SingBoxInbound {
    pub fn tls_doc(&self) -> Option<Document> {
        Document::from_section(self.tls.as_ref())
    }

    pub fn transport_doc(&self) -> Option<Document> {
        Document::from_section(self.transport.as_ref())
    }

    pub fn user_list(&self) -> Vec<Value> {
        self.users
            .as_ref()
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    }

    fn user_matches(user: &Value, email: &str) -> bool {
        ["name", "email"].iter().any(|key| {
            user.get(*key)
                .and_then(Value::as_str)
                .is_some_and(|n| n.eq_ignore_ascii_case(email))
        })
    }

    fn remove_user(&mut self, email: &str) -> bool {
        let Some(users) = self.users.as_mut().and_then(Value::as_array_mut) else {
            return false;
        };
        let before = users.len();
        users.retain(|u| !Self::user_matches(u, email));
        users.len() != before
    }

    fn add_user(&mut self, user: &Value) -> bool {
        let name = user
            .get("name")
            .or_else(|| user.get("email"))
            .and_then(Value::as_str);
        let users = self
            .users
            .get_or_insert_with(|| Value::Array(Vec::new()));
        let Some(users) = users.as_array_mut() else {
            return false;
        };
        if let Some(name) = name {
            if users.iter().any(|u| Self::user_matches(u, name)) {
                return false;
            }
        }
        users.push(user.clone());
        true
    }
}

impl SingBoxConfig {
    pub fn inbound(&self, tag: &str) -> Option<&SingBoxInbound> {
        self.inbounds.iter().find(|i| i.tag == tag)
    }

    pub fn inbound_mut(&mut self, tag: &str) -> Option<&mut SingBoxInbound> {
        self.inbounds.iter_mut().find(|i| i.tag == tag)
    }

    pub fn log_doc(&self) -> Option<Document> {
        Document::from_section(self.log.as_ref())
    }

    pub fn outbound_list(&self) -> Vec<Value> {
        self.outbounds
            .as_ref()
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    }
}

impl CoreConfig for SingBoxConfig {
    type Api = SingBoxApi;

    const CORE: CoreType = CoreType::SingBox;
    const DEFAULT_API_PORT: u16 = 9090;

    fn declared_api_port(&self) -> Option<u16> {
        let experimental = self.experimental.as_ref()?;
        let listen_of = |section: &str, key: &str| {
            experimental
                .get(section)
                .and_then(|s| s.get(key))
                .and_then(Value::as_str)
                .and_then(port_of_listen)
        };
        listen_of("clash_api", "external_controller").or_else(|| listen_of("v2ray_api", "listen"))
    }

    fn remove_client(&mut self, tag: &str, email: &str) -> bool {
        match self.inbound_mut(tag) {
            Some(inbound) => inbound.remove_user(email),
            None => {
                debug!("Inbound {} not found in sing-box config", tag);
                false
            }
        }
    }

    fn add_client(&mut self, tag: &str, user: &Value) -> bool {
        match self.inbound_mut(tag) {
            Some(inbound) => inbound.add_user(user),
            None => {
                debug!("Inbound {} not found in sing-box config", tag);
                false
            }
        }
    }
}
