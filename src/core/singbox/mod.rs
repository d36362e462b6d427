//! sing-box: config model and HTTP control API

mod api;
mod config;

pub use api::SingBoxApi;
pub use config::{SingBoxConfig, SingBoxInbound};
