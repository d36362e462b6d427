//! Xray assembly

use crate::core::{XrayConfig, XrayInbound};
use crate::model::{InboundEndpoint, OutboundEndpoint, Protocol};

use super::{
    merge_outbounds, outbound_value, prepare_inbound, servable, without_colliding, Buildable,
};

impl Buildable for XrayConfig {
    fn supports(_protocol: Protocol) -> bool {
        true
    }

    fn assemble(
        mut self,
        inbounds: &[InboundEndpoint],
        outbounds: &[OutboundEndpoint],
        now_ms: i64,
    ) -> Self {
        let emitted: Vec<XrayInbound> = servable::<Self>(inbounds)
            .map(|row| prepare_inbound(row, now_ms))
            .collect();
        let template = std::mem::take(&mut self.inbounds);
        self.inbounds = without_colliding(template, &emitted, |i| i.tag.as_str());
        self.inbounds.extend(emitted);

        let rows = outbounds.iter().map(outbound_value).collect();
        self.outbounds = merge_outbounds(self.outbounds.take(), rows);
        self
    }
}
