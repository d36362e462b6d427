//! Xray gRPC control-API client

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::timeout;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, Endpoint};
use tracing::debug;

use super::proto::{self, Typed};
use super::XrayInbound;
use crate::common::{ClientTraffic, Document, Error, Result, Traffic, TrafficAggregator};
use crate::core::{check_port, ControlApi};
use crate::model::CoreType;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const STATS_TIMEOUT: Duration = Duration::from_secs(10);
const HANDLER_TIMEOUT: Duration = Duration::from_secs(5);

/// Client for Xray's HandlerService and StatsService
pub struct XrayApi {
    channel: Channel,
    connected: AtomicBool,
}

impl XrayApi {
    async fn unary<Req, Resp>(&self, path: &'static str, req: Req, deadline: Duration) -> Result<Resp>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        if !self.is_connected() {
            return Err(Error::api("xray api is not initialized"));
        }

        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        grpc.ready()
            .await
            .map_err(|e| Error::api(format!("xray api not ready: {}", e)))?;

        let codec: ProstCodec<Req, Resp> = ProstCodec::default();
        let mut request = tonic::Request::new(req);
        request.set_timeout(deadline);

        let response = timeout(
            deadline,
            grpc.unary(request, PathAndQuery::from_static(path), codec),
        )
        .await??;
        Ok(response.into_inner())
    }

    async fn alter_inbound(&self, tag: &str, operation: proto::TypedMessage) -> Result<()> {
        let req = proto::AlterInboundRequest {
            tag: tag.to_string(),
            operation: Some(operation),
        };
        let _: proto::AlterInboundResponse =
            self.unary(proto::ALTER_INBOUND, req, HANDLER_TIMEOUT).await?;
        Ok(())
    }
}

/// Account message for a user of the given protocol.
///
/// `None` for protocols without per-user accounts.
pub(crate) fn account_for(protocol: &str, user: &Document) -> Option<proto::TypedMessage> {
    let field = |key: &str| user.str(key).unwrap_or_default().to_string();
    match protocol {
        "vmess" => Some(proto::VmessAccount { id: field("id") }.to_typed()),
        "vless" => Some(
            proto::VlessAccount {
                id: field("id"),
                flow: field("flow"),
                encryption: "none".to_string(),
            }
            .to_typed(),
        ),
        "trojan" => Some(
            proto::TrojanAccount {
                password: field("password"),
            }
            .to_typed(),
        ),
        "shadowsocks" => {
            let cipher = user
                .non_empty_str("cipher")
                .or_else(|| user.non_empty_str("method"))
                .unwrap_or_default();
            match proto::CipherType::from_name(cipher) {
                proto::CipherType::NoCipher | proto::CipherType::Unknown => Some(
                    proto::Shadowsocks2022User {
                        method: cipher.to_string(),
                        key: field("password"),
                        email: field("email"),
                    }
                    .to_typed(),
                ),
                cipher_type => Some(
                    proto::ShadowsocksAccount {
                        password: field("password"),
                        cipher_type: cipher_type as i32,
                    }
                    .to_typed(),
                ),
            }
        }
        _ => None,
    }
}

fn proto_user(protocol: &str, user: &Document) -> proto::User {
    proto::User {
        level: 0,
        email: user.str("email").unwrap_or_default().to_string(),
        account: account_for(protocol, user),
    }
}

/// Handler config for a live AddInbound.
///
/// Only plain inbounds can be expressed without Xray's own config builder;
/// anything with transport or TLS settings needs a restart instead.
pub(crate) fn inbound_handler_config(inbound: &XrayInbound) -> Result<proto::InboundHandlerConfig> {
    if let Some(stream) = inbound.stream_doc() {
        let network = stream.non_empty_str("network").unwrap_or("tcp");
        let security = stream.non_empty_str("security").unwrap_or("none");
        if network != "tcp" || security != "none" {
            return Err(Error::unsupported(format!(
                "live add of inbound {} with {} / {} stream settings",
                inbound.tag, network, security
            )));
        }
    }

    let port = inbound.port_number().ok_or_else(|| {
        Error::unsupported(format!("live add of inbound {} without a fixed port", inbound.tag))
    })?;

    let listen = inbound
        .listen_str()
        .filter(|l| !l.is_empty())
        .map(|l| proto::IpOrDomain {
            address: Some(match l.parse::<IpAddr>() {
                Ok(IpAddr::V4(ip)) => proto::ip_or_domain::Address::Ip(ip.octets().to_vec()),
                Ok(IpAddr::V6(ip)) => proto::ip_or_domain::Address::Ip(ip.octets().to_vec()),
                Err(_) => proto::ip_or_domain::Address::Domain(l.to_string()),
            }),
        });

    let receiver = proto::ReceiverConfig {
        port_list: Some(proto::PortList {
            range: vec![proto::PortRange {
                from: u32::from(port),
                to: u32::from(port),
            }],
        }),
        listen,
    };

    let clients: Vec<proto::User> = inbound
        .settings_doc()
        .and_then(|s| s.array("clients").cloned())
        .unwrap_or_default()
        .into_iter()
        .filter_map(Document::from_value)
        .map(|c| proto_user(&inbound.protocol, &c))
        .collect();

    let proxy = match inbound.protocol.as_str() {
        "vless" => proto::VlessInboundConfig {
            clients,
            decryption: "none".to_string(),
        }
        .to_typed(),
        "vmess" => proto::VmessInboundConfig { user: clients }.to_typed(),
        "trojan" => proto::TrojanServerConfig { users: clients }.to_typed(),
        "shadowsocks" => proto::ShadowsocksServerConfig { users: clients }.to_typed(),
        other => {
            return Err(Error::unsupported(format!(
                "live add of {} inbound {}",
                other, inbound.tag
            )))
        }
    };

    Ok(proto::InboundHandlerConfig {
        tag: inbound.tag.clone(),
        receiver_settings: Some(receiver.to_typed()),
        proxy_settings: Some(proxy),
    })
}

#[async_trait]
impl ControlApi for XrayApi {
    async fn connect(port: u32) -> Result<Self> {
        let port = check_port(CoreType::Xray, port)?;
        let endpoint = Endpoint::from_shared(format!("http://127.0.0.1:{}", port))?
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(STATS_TIMEOUT);
        let channel = endpoint
            .connect()
            .await
            .map_err(|e| Error::api(format!("failed to connect to Xray API: {}", e)))?;

        let api = XrayApi {
            channel,
            connected: AtomicBool::new(true),
        };
        let _: proto::SysStatsResponse = api
            .unary(proto::GET_SYS_STATS, proto::SysStatsRequest {}, CONNECT_TIMEOUT)
            .await?;
        debug!("Connected to Xray API on port {}", port);
        Ok(api)
    }

    async fn get_traffic(&self, reset: bool) -> Result<(Vec<Traffic>, Vec<ClientTraffic>)> {
        let req = proto::QueryStatsRequest {
            reset,
            ..Default::default()
        };
        let resp: proto::QueryStatsResponse = self
            .unary(proto::QUERY_STATS, req, STATS_TIMEOUT)
            .await
            .map_err(|e| {
                debug!("Failed to query Xray stats: {}", e);
                e
            })?;

        let mut agg = TrafficAggregator::new();
        for stat in resp.stat {
            agg.record(&stat.name, stat.value);
        }
        Ok(agg.finish())
    }

    async fn add_inbound(&self, inbound: &Value) -> Result<()> {
        let inbound: XrayInbound = serde_json::from_value(inbound.clone())?;
        let req = proto::AddInboundRequest {
            inbound: Some(inbound_handler_config(&inbound)?),
        };
        let _: proto::AddInboundResponse =
            self.unary(proto::ADD_INBOUND, req, HANDLER_TIMEOUT).await?;
        Ok(())
    }

    async fn del_inbound(&self, tag: &str) -> Result<()> {
        let req = proto::RemoveInboundRequest {
            tag: tag.to_string(),
        };
        let _: proto::RemoveInboundResponse =
            self.unary(proto::REMOVE_INBOUND, req, HANDLER_TIMEOUT).await?;
        Ok(())
    }

    async fn add_user(&self, protocol: &str, tag: &str, user: &Value) -> Result<()> {
        let Some(user) = Document::from_value(user.clone()) else {
            return Err(Error::parse("user must be a JSON object"));
        };
        if account_for(protocol, &user).is_none() {
            debug!("Protocol {} has no per-user accounts, skipping live add", protocol);
            return Ok(());
        }
        let op = proto::AddUserOperation {
            user: Some(proto_user(protocol, &user)),
        };
        self.alter_inbound(tag, op.to_typed()).await
    }

    async fn remove_user(&self, tag: &str, email: &str) -> Result<()> {
        let op = proto::RemoveUserOperation {
            email: email.to_string(),
        };
        self.alter_inbound(tag, op.to_typed())
            .await
            .map_err(|e| Error::api(format!("failed to remove user: {}", e)))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.connected.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;
    use serde_json::json;

    fn inbound(value: Value) -> XrayInbound {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_vless_account() {
        let user = Document::from_value(json!({"id": "u1", "flow": "xtls-rprx-vision"})).unwrap();
        let typed = account_for("vless", &user).unwrap();
        assert_eq!(typed.r#type, "xray.proxy.vless.Account");
        let account = proto::VlessAccount::decode(typed.value.as_slice()).unwrap();
        assert_eq!(account.id, "u1");
        assert_eq!(account.flow, "xtls-rprx-vision");
    }

    #[test]
    fn test_shadowsocks_accounts() {
        let classic =
            Document::from_value(json!({"password": "p", "cipher": "aes-128-gcm"})).unwrap();
        assert_eq!(
            account_for("shadowsocks", &classic).unwrap().r#type,
            "xray.proxy.shadowsocks.Account"
        );

        let modern = Document::from_value(json!({
            "password": "k", "method": "2022-blake3-aes-256-gcm", "email": "a@b"
        }))
        .unwrap();
        let typed = account_for("shadowsocks", &modern).unwrap();
        assert_eq!(typed.r#type, "xray.proxy.shadowsocks_2022.ServerConfig");
        let cfg = proto::Shadowsocks2022User::decode(typed.value.as_slice()).unwrap();
        assert_eq!((cfg.key.as_str(), cfg.email.as_str()), ("k", "a@b"));

        assert!(account_for("http", &classic).is_none());
    }

    #[test]
    fn test_plain_inbound_handler_config() {
        let cfg = inbound_handler_config(&inbound(json!({
            "tag": "in-1", "listen": "0.0.0.0", "port": 10443, "protocol": "vless",
            "settings": {"clients": [{"id": "u1", "email": "a@b"}], "decryption": "none"}
        })))
        .unwrap();
        assert_eq!(cfg.tag, "in-1");
        let receiver = proto::ReceiverConfig::decode(
            cfg.receiver_settings.unwrap().value.as_slice(),
        )
        .unwrap();
        assert_eq!(receiver.port_list.unwrap().range[0].from, 10443);
        let proxy =
            proto::VlessInboundConfig::decode(cfg.proxy_settings.unwrap().value.as_slice()).unwrap();
        assert_eq!(proxy.clients[0].email, "a@b");
    }

    #[test]
    fn test_stream_settings_need_restart() {
        let err = inbound_handler_config(&inbound(json!({
            "tag": "in-1", "port": 443, "protocol": "vless",
            "streamSettings": {"network": "tcp", "security": "reality"}
        })))
        .unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_port() {
        assert!(XrayApi::connect(0).await.is_err());
        assert!(XrayApi::connect(70_000).await.is_err());
    }
}
