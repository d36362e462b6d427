//! sing-box assembly

use serde_json::Value;
use tracing::{debug, warn};

use crate::core::{SingBoxConfig, SingBoxInbound};
use crate::model::{InboundEndpoint, OutboundEndpoint, Protocol};
use crate::translate::sanitize::sanitize_outbounds;
use crate::translate::{client_to_singbox, sanitize_template, xray_inbound_to_singbox};

use super::{
    merge_outbounds, outbound_value, prepare_inbound, servable, without_colliding, Buildable,
};

/// Stored protocols the builder emits for sing-box
pub const SINGBOX_BUILD_PROTOCOLS: [Protocol; 6] = [
    Protocol::Vmess,
    Protocol::Vless,
    Protocol::Trojan,
    Protocol::Shadowsocks,
    Protocol::Http,
    Protocol::Mixed,
];

impl Buildable for SingBoxConfig {
    fn supports(protocol: Protocol) -> bool {
        SINGBOX_BUILD_PROTOCOLS.contains(&protocol)
    }

    fn assemble(
        mut self,
        inbounds: &[InboundEndpoint],
        outbounds: &[OutboundEndpoint],
        now_ms: i64,
    ) -> Self {
        let report = sanitize_template(&mut self);
        if report.changed {
            debug!("sing-box template needed cleanup: {:?}", report);
        }

        let emitted: Vec<SingBoxInbound> = servable::<Self>(inbounds)
            .filter_map(|row| {
                let converted = xray_inbound_to_singbox(&prepare_inbound(row, now_ms));
                if converted.is_none() {
                    warn!(
                        "Skipping inbound {} (tag: {}): no sing-box counterpart",
                        row.remark, row.tag
                    );
                }
                converted
            })
            .collect();
        let template = std::mem::take(&mut self.inbounds);
        self.inbounds = without_colliding(template, &emitted, |i| i.tag.as_str());
        self.inbounds.extend(emitted);

        let mut rows: Vec<_> = outbounds.iter().map(outbound_value).collect();
        sanitize_outbounds(&mut rows);
        self.outbounds = merge_outbounds(self.outbounds.take(), rows);
        self
    }

    fn native_user(protocol: &str, client: &Value) -> Value {
        client_to_singbox(protocol, client)
    }
}
