//! Core-agnostic data model
//!
//! These are the rows the panel persists. They are never handed to a core
//! directly: the builder turns them into one of the two native config models.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::common::{Error, Result};

/// Inbound protocol of a stored endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Vmess,
    Vless,
    Trojan,
    Shadowsocks,
    Http,
    Mixed,
    Tunnel,
    Wireguard,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Vmess => "vmess",
            Protocol::Vless => "vless",
            Protocol::Trojan => "trojan",
            Protocol::Shadowsocks => "shadowsocks",
            Protocol::Http => "http",
            Protocol::Mixed => "mixed",
            Protocol::Tunnel => "tunnel",
            Protocol::Wireguard => "wireguard",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "vmess" => Ok(Protocol::Vmess),
            "vless" => Ok(Protocol::Vless),
            "trojan" => Ok(Protocol::Trojan),
            "shadowsocks" => Ok(Protocol::Shadowsocks),
            "http" => Ok(Protocol::Http),
            "mixed" => Ok(Protocol::Mixed),
            "tunnel" | "dokodemo-door" => Ok(Protocol::Tunnel),
            "wireguard" => Ok(Protocol::Wireguard),
            other => Err(Error::parse(format!("unknown protocol: {}", other))),
        }
    }
}

/// Which proxy core is supervised
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CoreType {
    #[serde(rename = "xray")]
    Xray,
    #[serde(rename = "sing-box")]
    SingBox,
}

impl CoreType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoreType::Xray => "xray",
            CoreType::SingBox => "sing-box",
        }
    }

    pub fn other(&self) -> CoreType {
        match self {
            CoreType::Xray => CoreType::SingBox,
            CoreType::SingBox => CoreType::Xray,
        }
    }
}

impl Default for CoreType {
    fn default() -> Self {
        CoreType::Xray
    }
}

impl fmt::Display for CoreType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CoreType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "xray" => Ok(CoreType::Xray),
            "sing-box" => Ok(CoreType::SingBox),
            other => Err(Error::config(format!(
                "invalid core type: {} (must be 'xray' or 'sing-box')",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrafficReset {
    Never,
    Daily,
    Weekly,
    Monthly,
}

impl Default for TrafficReset {
    fn default() -> Self {
        TrafficReset::Never
    }
}

/// Whether a quota or expiry limit has been reached
fn limit_reached(up: i64, down: i64, total: i64, expiry_time: i64, now_ms: i64) -> bool {
    (total > 0 && up + down >= total) || (expiry_time > 0 && expiry_time <= now_ms)
}

/// Per-client counters of one inbound
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientStat {
    pub id: i64,
    pub inbound_id: i64,
    pub email: String,
    pub enable: bool,
    pub up: i64,
    pub down: i64,
    pub all_time: i64,
    pub total: i64,
    pub expiry_time: i64,
    pub reset: i64,
}

impl ClientStat {
    pub fn is_depleted(&self, now_ms: i64) -> bool {
        limit_reached(self.up, self.down, self.total, self.expiry_time, now_ms)
    }
}

/// A listening endpoint as stored by the panel
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InboundEndpoint {
    pub id: i64,
    pub remark: String,
    pub listen: String,
    pub port: u16,
    pub protocol: Option<Protocol>,
    /// Protocol settings as stored (JSON text)
    pub settings: String,
    pub stream_settings: String,
    pub tag: String,
    pub sniffing: String,
    pub enable: bool,
    pub up: i64,
    pub down: i64,
    pub total: i64,
    pub all_time: i64,
    pub expiry_time: i64,
    pub traffic_reset: TrafficReset,
    pub last_traffic_reset_time: i64,
    pub client_stats: Vec<ClientStat>,
    /// Nodes serving this inbound in multi-node mode
    pub node_ids: Vec<i64>,
}

impl InboundEndpoint {
    pub fn is_depleted(&self, now_ms: i64) -> bool {
        limit_reached(self.up, self.down, self.total, self.expiry_time, now_ms)
    }

    pub fn protocol_name(&self) -> &'static str {
        self.protocol.map(|p| p.as_str()).unwrap_or("")
    }
}

/// An egress target as stored by the panel
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OutboundEndpoint {
    pub id: i64,
    pub user_id: i64,
    pub remark: String,
    pub enable: bool,
    pub protocol: String,
    pub settings: String,
    pub stream_settings: String,
    pub tag: String,
    pub proxy_settings: String,
    pub send_through: String,
    pub mux: String,
    pub core_config_profile_id: Option<i64>,
    pub node_ids: Vec<i64>,
}

/// Aggregated traffic of one outbound tag
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundTraffic {
    pub id: i64,
    pub tag: String,
    pub up: i64,
    pub down: i64,
    pub total: i64,
}

/// A complete stored config for one core, assignable to nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoreConfigProfile {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub user_id: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub core: CoreType,
    pub config_json: String,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
    #[serde(default)]
    pub node_ids: Vec<i64>,
}

/// A worker node reachable over HTTP
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Node {
    pub id: i64,
    pub name: String,
    pub address: String,
    pub api_key: String,
    pub status: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_type_parse() {
        assert_eq!("sing-box".parse::<CoreType>().unwrap(), CoreType::SingBox);
        assert_eq!(CoreType::Xray.other(), CoreType::SingBox);
        let err = "v2ray".parse::<CoreType>().unwrap_err();
        assert!(err.to_string().contains("must be 'xray' or 'sing-box'"));
    }

    #[test]
    fn test_core_type_serde() {
        let json = serde_json::to_string(&CoreType::SingBox).unwrap();
        assert_eq!(json, "\"sing-box\"");
    }

    #[test]
    fn test_client_depletion() {
        let mut stat = ClientStat {
            total: 100,
            up: 40,
            down: 59,
            ..Default::default()
        };
        assert!(!stat.is_depleted(1_000));
        stat.down = 60;
        assert!(stat.is_depleted(1_000));

        let expired = ClientStat {
            expiry_time: 1_000,
            ..Default::default()
        };
        assert!(expired.is_depleted(1_000));
        assert!(!expired.is_depleted(999));
    }

    #[test]
    fn test_inbound_deserialize_defaults() {
        let inbound: InboundEndpoint =
            serde_json::from_str(r#"{"tag":"in-1","protocol":"vless","port":443}"#).unwrap();
        assert_eq!(inbound.protocol, Some(Protocol::Vless));
        assert_eq!(inbound.traffic_reset, TrafficReset::Never);
        assert!(inbound.client_stats.is_empty());
    }
}
