//! Native config models and control-API clients of the two cores
//!
//! ```text
//!              ┌──────────────┐             ┌──────────────┐
//!              │  XrayConfig  │ ◄─────────► │ SingBoxConfig│   (translate)
//!              └──────┬───────┘             └──────┬───────┘
//!                     │ CoreConfig                 │ CoreConfig
//!              ┌──────▼───────┐             ┌──────▼───────┐
//!              │   XrayApi    │  gRPC       │  SingBoxApi  │  HTTP + JSON
//!              └──────────────┘             └──────────────┘
//! ```

pub mod singbox;
pub mod xray;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::common::{ClientTraffic, Error, Result, Traffic};
use crate::model::CoreType;

pub use singbox::{SingBoxApi, SingBoxConfig, SingBoxInbound};
pub use xray::{XrayApi, XrayConfig, XrayInbound};

/// A core's native configuration model
pub trait CoreConfig:
    Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Control-API client speaking this core's protocol
    type Api: ControlApi;

    const CORE: CoreType;
    const DEFAULT_API_PORT: u16;

    /// Control-API port declared by the config, if any
    fn declared_api_port(&self) -> Option<u16>;

    fn api_port(&self) -> u16 {
        self.declared_api_port().unwrap_or(Self::DEFAULT_API_PORT)
    }

    /// Drop a user from an inbound. Returns whether anything changed.
    fn remove_client(&mut self, tag: &str, email: &str) -> bool;

    /// Append a user to an inbound unless it is already present.
    fn add_client(&mut self, tag: &str, user: &Value) -> bool;

    fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| {
            Error::parse(format!("invalid {} config: {}", Self::CORE, e))
        })
    }

    fn to_pretty_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }
}

/// Live control surface of a running core
#[async_trait]
pub trait ControlApi: Send + Sync + 'static {
    /// Open the transport and probe it.
    async fn connect(port: u32) -> Result<Self>
    where
        Self: Sized;

    /// Query counters. With `reset` the core zeroes them, so the values are deltas.
    async fn get_traffic(&self, reset: bool) -> Result<(Vec<Traffic>, Vec<ClientTraffic>)>;

    async fn add_inbound(&self, inbound: &Value) -> Result<()>;
    async fn del_inbound(&self, tag: &str) -> Result<()>;
    async fn add_user(&self, protocol: &str, tag: &str, user: &Value) -> Result<()>;
    async fn remove_user(&self, tag: &str, email: &str) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Tear down; calling it twice is a no-op.
    fn close(&self);
}

/// Validate a port given as a wider integer.
pub(crate) fn check_port(core: CoreType, port: u32) -> Result<u16> {
    match u16::try_from(port) {
        Ok(p) if p > 0 => Ok(p),
        _ => Err(Error::api(format!("invalid {} API port: {}", core, port))),
    }
}

/// Port of a `host:port` listen string. IPv6 hosts must be bracketed.
pub(crate) fn port_of_listen(listen: &str) -> Option<u16> {
    let (host, port) = listen.rsplit_once(':')?;
    let bare = match host.strip_prefix('[') {
        Some(inner) => !inner.ends_with(']'),
        None => host.contains(':') || host.contains(']'),
    };
    if bare {
        return None;
    }
    port.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_port() {
        assert_eq!(check_port(CoreType::Xray, 62789).unwrap(), 62789);
        assert!(check_port(CoreType::Xray, 0).is_err());
        assert!(check_port(CoreType::SingBox, 70_000).is_err());
    }

    #[test]
    fn test_port_of_listen() {
        assert_eq!(port_of_listen("127.0.0.1:9090"), Some(9090));
        assert_eq!(port_of_listen(":9090"), Some(9090));
        assert_eq!(port_of_listen("[::1]:9090"), Some(9090));
        assert_eq!(port_of_listen("[::]:62789"), Some(62789));
        assert_eq!(port_of_listen("::1:9090"), None);
        assert_eq!(port_of_listen("[::1:9090"), None);
        assert_eq!(port_of_listen("localhost"), None);
    }
}
