//! Switching the active core
//!
//! A switch converts the current core's built config into the other core's
//! schema and stores it as that core's template. The `coreType` setting
//! flips only after the new template is stored; if the flip or the first
//! start of the new core fails, both settings are put back and the old
//! core is started again.

use std::time::Duration;

use serde_json::Value;
use tracing::{info, warn};

use crate::common::{Document, Error, Result};
use crate::core::xray::API_INBOUND_TAG;
use crate::core::{CoreConfig, SingBoxConfig, XrayConfig};
use crate::model::CoreType;
use crate::translate::{sanitize_template, singbox_to_xray, xray_to_singbox_with_report};

use super::manager::CoreManager;

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);
const STOP_POLL_LIMIT: Duration = Duration::from_secs(3);

/// Whether a routing rule sends traffic to the control API outbound
fn is_api_rule(rule: &Value, outbound_key: &str) -> bool {
    rule.get(outbound_key).and_then(Value::as_str) == Some(API_INBOUND_TAG)
}

/// Fill in the control API sections the converted config lacks from the
/// Xray template, so the new process still exposes its stats service.
fn carry_xray_controls(config: &mut XrayConfig, template: &XrayConfig) {
    for (section, from) in [
        (&mut config.api, &template.api),
        (&mut config.stats, &template.stats),
        (&mut config.policy, &template.policy),
    ] {
        if section.is_none() {
            *section = from.clone();
        }
    }

    if config.inbound(API_INBOUND_TAG).is_none() {
        if let Some(api) = template.inbound(API_INBOUND_TAG) {
            config.inbounds.insert(0, api.clone());
        }
    }

    let api_rule = template
        .routing
        .as_ref()
        .and_then(|r| r.get("rules"))
        .and_then(Value::as_array)
        .and_then(|rules| rules.iter().find(|r| is_api_rule(r, "outboundTag")))
        .cloned();
    let Some(api_rule) = api_rule else {
        return;
    };
    let routing = config
        .routing
        .get_or_insert_with(|| Document::new().into_value());
    Document::edit(routing, |routing| {
        if routing.array("rules").is_none() {
            routing.insert("rules", Value::Array(Vec::new()));
        }
        if let Some(rules) = routing.array_mut("rules") {
            if !rules.iter().any(|r| is_api_rule(r, "outboundTag")) {
                rules.insert(0, api_rule);
            }
        }
    });
}

/// Take `experimental` from the sing-box template and drop route rules
/// pointing at an `api` outbound that sing-box does not have.
fn carry_singbox_controls(config: &mut SingBoxConfig, template: &SingBoxConfig) {
    if config.experimental.is_none() {
        config.experimental = template.experimental.clone();
    }

    let has_api_outbound = config
        .outbounds
        .as_ref()
        .and_then(Value::as_array)
        .is_some_and(|outbounds| {
            outbounds
                .iter()
                .any(|o| o.get("tag").and_then(Value::as_str) == Some(API_INBOUND_TAG))
        });
    if has_api_outbound {
        return;
    }
    if let Some(route) = config.route.as_mut() {
        Document::edit(route, |route| {
            if let Some(rules) = route.array_mut("rules") {
                rules.retain(|r| !is_api_rule(r, "outbound"));
            }
        });
    }
}

impl CoreManager {
    /// Make `new_type` the active core, converting its template from the
    /// current core's config.
    pub async fn switch_core_with_conversion(&self, new_type: &str) -> Result<()> {
        let target: CoreType = new_type.parse()?;
        let current = self.settings().get_core_type().await?;
        if target == current {
            info!("Core is already {}, nothing to switch", current);
            return Ok(());
        }
        info!("Switching core from {} to {}", current, target);

        let config = self.build_config(current).await?;
        self.stop_all_cores().await;

        let previous_template = self.settings().raw_template(target).await?;
        let result = async {
            let text = self.convert(target, config).await?;
            self.settings().set_template(target, &text).await?;
            self.settings().set_core(target).await?;
            self.restart_core(target, true).await
        }
        .await;

        if let Err(e) = result {
            warn!("Switch to {} failed, rolling back to {}: {}", target, current, e);
            self.rollback(current, target, previous_template).await;
            return Err(e);
        }
        info!("Switched core to {}", target);
        Ok(())
    }

    async fn convert(&self, target: CoreType, config: Value) -> Result<String> {
        let text = match target {
            CoreType::SingBox => {
                let xray: XrayConfig = serde_json::from_value(config)?;
                let (mut converted, report) = xray_to_singbox_with_report(&xray);
                if report.removed_rules > 0 || report.removed_inbounds > 0 {
                    warn!(
                        "Conversion to sing-box dropped {} route rule(s) and {} inbound(s)",
                        report.removed_rules, report.removed_inbounds
                    );
                }
                let template = self.builder().template::<SingBoxConfig>().await?;
                carry_singbox_controls(&mut converted, &template);
                sanitize_template(&mut converted);
                serde_json::to_string_pretty(&converted)?
            }
            CoreType::Xray => {
                let singbox: SingBoxConfig = serde_json::from_value(config)?;
                let mut converted = singbox_to_xray(&singbox);
                let template = self.builder().template::<XrayConfig>().await?;
                carry_xray_controls(&mut converted, &template);
                serde_json::to_string_pretty(&converted)?
            }
        };
        Ok(text)
    }

    async fn restart_core(&self, core: CoreType, force: bool) -> Result<()> {
        match core {
            CoreType::Xray => self.restart_xray(force).await,
            CoreType::SingBox => self.restart_singbox(force).await,
        }
    }

    /// Stop both cores, then wait until neither process is alive so the
    /// next one can bind the same ports.
    async fn stop_all_cores(&self) {
        for result in [self.xray().stop().await, self.singbox().stop().await] {
            match result {
                Ok(()) | Err(Error::NotRunning(_)) => {}
                Err(e) => warn!("Failed to stop core before switch: {}", e),
            }
        }

        let deadline = tokio::time::Instant::now() + STOP_POLL_LIMIT;
        while self.xray().is_running() || self.singbox().is_running() {
            if tokio::time::Instant::now() >= deadline {
                warn!("Cores still running after {:?}, switching anyway", STOP_POLL_LIMIT);
                break;
            }
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }
    }

    async fn rollback(&self, current: CoreType, target: CoreType, template: Option<String>) {
        if let Err(e) = self.settings().restore_template(target, template).await {
            warn!("Failed to restore {} template: {}", target, e);
        }
        if let Err(e) = self.settings().set_core(current).await {
            warn!("Failed to restore core type {}: {}", current, e);
        }
        // The target may have started before failing; free its ports.
        let stopped = match target {
            CoreType::Xray => self.xray().stop().await,
            CoreType::SingBox => self.singbox().stop().await,
        };
        if let Err(e) = stopped {
            if !matches!(e, Error::NotRunning(_)) {
                warn!("Failed to stop {} during rollback: {}", target, e);
            }
        }
        if let Err(e) = self.restart_core(current, true).await {
            warn!("Failed to restart {} after rollback: {}", current, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn xray_template() -> XrayConfig {
        XrayConfig::parse(crate::service::settings::DEFAULT_XRAY_TEMPLATE).unwrap()
    }

    #[test]
    fn test_xray_controls_are_restored() {
        let singbox: SingBoxConfig = serde_json::from_value(json!({
            "inbounds": [{"type": "vless", "tag": "in-443", "listen_port": 443}],
            "outbounds": [{"type": "direct", "tag": "direct"}],
            "route": {"rules": [{"inbound": ["in-443"], "outbound": "direct"}]}
        }))
        .unwrap();
        let mut converted = singbox_to_xray(&singbox);
        carry_xray_controls(&mut converted, &xray_template());

        assert!(converted.api.is_some());
        assert!(converted.stats.is_some());
        assert_eq!(converted.inbounds[0].tag, API_INBOUND_TAG);
        assert_eq!(converted.inbounds.len(), 2);
        let rules = converted.routing.as_ref().unwrap()["rules"].as_array().unwrap();
        assert!(is_api_rule(&rules[0], "outboundTag"));

        // idempotent
        carry_xray_controls(&mut converted, &xray_template());
        assert_eq!(converted.inbounds.len(), 2);
        let rules = converted.routing.as_ref().unwrap()["rules"].as_array().unwrap();
        assert_eq!(rules.iter().filter(|r| is_api_rule(r, "outboundTag")).count(), 1);
    }

    #[test]
    fn test_singbox_drops_api_rules() {
        let (mut converted, _) = xray_to_singbox_with_report(&xray_template());
        let template = SingBoxConfig::parse(crate::service::settings::DEFAULT_SINGBOX_TEMPLATE)
            .unwrap();
        carry_singbox_controls(&mut converted, &template);

        assert_eq!(converted.experimental, template.experimental);
        let rules = converted
            .route
            .as_ref()
            .and_then(|r| r.get("rules"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        assert!(rules.iter().all(|r| !is_api_rule(r, "outbound")));
        assert!(converted.inbound(API_INBOUND_TAG).is_none());
    }

    #[tokio::test]
    async fn test_same_core_is_noop() {
        let manager = crate::service::manager::tests::manager_at(std::path::Path::new(
            "/nonexistent-bin-folder",
        ));
        manager.switch_core_with_conversion("xray").await.unwrap();
        assert!(manager.switch_core_with_conversion("v2ray").await.is_err());
        assert_eq!(manager.settings().get_core_type().await.unwrap(), CoreType::Xray);
    }
}
