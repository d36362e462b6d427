//! Xray control-API messages
//!
//! Only the messages the panel sends or receives are declared. Field
//! numbers follow Xray's `.proto` files; `TypedMessage.type` carries the
//! fully-qualified message name used by Xray's `serial` package.

use prost::Message;

pub const QUERY_STATS: &str = "/xray.app.stats.command.StatsService/QueryStats";
pub const GET_SYS_STATS: &str = "/xray.app.stats.command.StatsService/GetSysStats";
pub const ADD_INBOUND: &str = "/xray.app.proxyman.command.HandlerService/AddInbound";
pub const REMOVE_INBOUND: &str = "/xray.app.proxyman.command.HandlerService/RemoveInbound";
pub const ALTER_INBOUND: &str = "/xray.app.proxyman.command.HandlerService/AlterInbound";

#[derive(Clone, PartialEq, Message)]
pub struct TypedMessage {
    #[prost(string, tag = "1")]
    pub r#type: String,
    #[prost(bytes = "vec", tag = "2")]
    pub value: Vec<u8>,
}

/// Name-tagged, serialized message.
pub trait Typed: Message + Sized {
    const TYPE: &'static str;

    fn to_typed(&self) -> TypedMessage {
        TypedMessage {
            r#type: Self::TYPE.to_string(),
            value: self.encode_to_vec(),
        }
    }
}

// -- stats --

#[derive(Clone, PartialEq, Message)]
pub struct QueryStatsRequest {
    #[prost(string, tag = "1")]
    pub pattern: String,
    #[prost(bool, tag = "2")]
    pub reset: bool,
    #[prost(string, repeated, tag = "3")]
    pub patterns: Vec<String>,
    #[prost(bool, tag = "4")]
    pub regexp: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct Stat {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(int64, tag = "2")]
    pub value: i64,
}

#[derive(Clone, PartialEq, Message)]
pub struct QueryStatsResponse {
    #[prost(message, repeated, tag = "1")]
    pub stat: Vec<Stat>,
}

#[derive(Clone, PartialEq, Message)]
pub struct SysStatsRequest {}

#[derive(Clone, PartialEq, Message)]
pub struct SysStatsResponse {
    #[prost(uint32, tag = "1")]
    pub num_goroutine: u32,
    #[prost(uint32, tag = "2")]
    pub num_gc: u32,
    #[prost(uint64, tag = "3")]
    pub alloc: u64,
    #[prost(uint32, tag = "10")]
    pub uptime: u32,
}

// -- handler service --

#[derive(Clone, PartialEq, Message)]
pub struct InboundHandlerConfig {
    #[prost(string, tag = "1")]
    pub tag: String,
    #[prost(message, optional, tag = "2")]
    pub receiver_settings: Option<TypedMessage>,
    #[prost(message, optional, tag = "3")]
    pub proxy_settings: Option<TypedMessage>,
}

#[derive(Clone, PartialEq, Message)]
pub struct AddInboundRequest {
    #[prost(message, optional, tag = "1")]
    pub inbound: Option<InboundHandlerConfig>,
}

#[derive(Clone, PartialEq, Message)]
pub struct AddInboundResponse {}

#[derive(Clone, PartialEq, Message)]
pub struct RemoveInboundRequest {
    #[prost(string, tag = "1")]
    pub tag: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct RemoveInboundResponse {}

#[derive(Clone, PartialEq, Message)]
pub struct AlterInboundRequest {
    #[prost(string, tag = "1")]
    pub tag: String,
    #[prost(message, optional, tag = "2")]
    pub operation: Option<TypedMessage>,
}

#[derive(Clone, PartialEq, Message)]
pub struct AlterInboundResponse {}

#[derive(Clone, PartialEq, Message)]
pub struct User {
    #[prost(uint32, tag = "1")]
    pub level: u32,
    #[prost(string, tag = "2")]
    pub email: String,
    #[prost(message, optional, tag = "3")]
    pub account: Option<TypedMessage>,
}

#[derive(Clone, PartialEq, Message)]
pub struct AddUserOperation {
    #[prost(message, optional, tag = "1")]
    pub user: Option<User>,
}

impl Typed for AddUserOperation {
    const TYPE: &'static str = "xray.app.proxyman.command.AddUserOperation";
}

#[derive(Clone, PartialEq, Message)]
pub struct RemoveUserOperation {
    #[prost(string, tag = "1")]
    pub email: String,
}

impl Typed for RemoveUserOperation {
    const TYPE: &'static str = "xray.app.proxyman.command.RemoveUserOperation";
}

// -- receiver --

#[derive(Clone, PartialEq, Message)]
pub struct PortRange {
    #[prost(uint32, tag = "1")]
    pub from: u32,
    #[prost(uint32, tag = "2")]
    pub to: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct PortList {
    #[prost(message, repeated, tag = "1")]
    pub range: Vec<PortRange>,
}

#[derive(Clone, PartialEq, Message)]
pub struct IpOrDomain {
    #[prost(oneof = "ip_or_domain::Address", tags = "1, 2")]
    pub address: Option<ip_or_domain::Address>,
}

pub mod ip_or_domain {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Address {
        #[prost(bytes, tag = "1")]
        Ip(Vec<u8>),
        #[prost(string, tag = "2")]
        Domain(String),
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct ReceiverConfig {
    #[prost(message, optional, tag = "1")]
    pub port_list: Option<PortList>,
    #[prost(message, optional, tag = "2")]
    pub listen: Option<IpOrDomain>,
}

impl Typed for ReceiverConfig {
    const TYPE: &'static str = "xray.app.proxyman.ReceiverConfig";
}

// -- accounts --

#[derive(Clone, PartialEq, Message)]
pub struct VlessAccount {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub flow: String,
    #[prost(string, tag = "3")]
    pub encryption: String,
}

impl Typed for VlessAccount {
    const TYPE: &'static str = "xray.proxy.vless.Account";
}

#[derive(Clone, PartialEq, Message)]
pub struct VmessAccount {
    #[prost(string, tag = "1")]
    pub id: String,
}

impl Typed for VmessAccount {
    const TYPE: &'static str = "xray.proxy.vmess.Account";
}

#[derive(Clone, PartialEq, Message)]
pub struct TrojanAccount {
    #[prost(string, tag = "1")]
    pub password: String,
}

impl Typed for TrojanAccount {
    const TYPE: &'static str = "xray.proxy.trojan.Account";
}

/// `xray.proxy.shadowsocks.CipherType`
#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum CipherType {
    Unknown = 0,
    Aes128Gcm = 5,
    Aes256Gcm = 6,
    Chacha20Poly1305 = 7,
    Xchacha20Poly1305 = 8,
    NoCipher = 9,
}

impl CipherType {
    /// Map a cipher name; unknown names (including 2022 methods) map to `NoCipher`.
    pub fn from_name(name: &str) -> CipherType {
        match name.to_ascii_lowercase().as_str() {
            "aes-128-gcm" => CipherType::Aes128Gcm,
            "aes-256-gcm" => CipherType::Aes256Gcm,
            "chacha20-poly1305" | "chacha20-ietf-poly1305" => CipherType::Chacha20Poly1305,
            "xchacha20-poly1305" | "xchacha20-ietf-poly1305" => CipherType::Xchacha20Poly1305,
            _ => CipherType::NoCipher,
        }
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct ShadowsocksAccount {
    #[prost(string, tag = "1")]
    pub password: String,
    #[prost(enumeration = "CipherType", tag = "2")]
    pub cipher_type: i32,
}

impl Typed for ShadowsocksAccount {
    const TYPE: &'static str = "xray.proxy.shadowsocks.Account";
}

#[derive(Clone, PartialEq, Message)]
pub struct Shadowsocks2022User {
    #[prost(string, tag = "1")]
    pub method: String,
    #[prost(string, tag = "2")]
    pub key: String,
    #[prost(string, tag = "3")]
    pub email: String,
}

impl Typed for Shadowsocks2022User {
    const TYPE: &'static str = "xray.proxy.shadowsocks_2022.ServerConfig";
}

// -- inbound proxy settings --

#[derive(Clone, PartialEq, Message)]
pub struct VlessInboundConfig {
    #[prost(message, repeated, tag = "1")]
    pub clients: Vec<User>,
    #[prost(string, tag = "2")]
    pub decryption: String,
}

impl Typed for VlessInboundConfig {
    const TYPE: &'static str = "xray.proxy.vless.inbound.Config";
}

#[derive(Clone, PartialEq, Message)]
pub struct VmessInboundConfig {
    #[prost(message, repeated, tag = "1")]
    pub user: Vec<User>,
}

impl Typed for VmessInboundConfig {
    const TYPE: &'static str = "xray.proxy.vmess.inbound.Config";
}

#[derive(Clone, PartialEq, Message)]
pub struct TrojanServerConfig {
    #[prost(message, repeated, tag = "1")]
    pub users: Vec<User>,
}

impl Typed for TrojanServerConfig {
    const TYPE: &'static str = "xray.proxy.trojan.ServerConfig";
}

#[derive(Clone, PartialEq, Message)]
pub struct ShadowsocksServerConfig {
    #[prost(message, repeated, tag = "1")]
    pub users: Vec<User>,
}

impl Typed for ShadowsocksServerConfig {
    const TYPE: &'static str = "xray.proxy.shadowsocks.ServerConfig";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_message_roundtrip() {
        let op = RemoveUserOperation {
            email: "alice@example.com".to_string(),
        };
        let typed = op.to_typed();
        assert_eq!(typed.r#type, "xray.app.proxyman.command.RemoveUserOperation");
        let decoded = RemoveUserOperation::decode(typed.value.as_slice()).unwrap();
        assert_eq!(decoded, op);
    }

    #[test]
    fn test_cipher_names() {
        assert_eq!(CipherType::from_name("AES-256-GCM"), CipherType::Aes256Gcm);
        assert_eq!(
            CipherType::from_name("chacha20-ietf-poly1305"),
            CipherType::Chacha20Poly1305
        );
        assert_eq!(
            CipherType::from_name("2022-blake3-aes-128-gcm"),
            CipherType::NoCipher
        );
    }
}
