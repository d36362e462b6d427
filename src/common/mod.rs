//! Common utilities and types

pub mod document;
pub mod error;
pub mod traffic;

pub use document::Document;
pub use error::{Error, Result};
pub use traffic::{ClientTraffic, Traffic, TrafficAggregator};
