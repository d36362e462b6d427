//! Xray: config model and gRPC control API

mod api;
mod config;
pub mod proto;

pub use api::XrayApi;
pub use config::{XrayConfig, XrayInbound, API_INBOUND_TAG};
