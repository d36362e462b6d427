//! Persisted settings consumed by the control plane
//!
//! Templates self-heal: a missing, empty, placeholder or unparseable stored
//! template is replaced by the embedded default and written back, so a
//! corrupted setting never blocks startup.

use std::sync::Arc;

use tracing::{info, warn};

use crate::common::Result;
use crate::core::{CoreConfig, SingBoxConfig, XrayConfig};
use crate::model::CoreType;
use crate::store::Store;
use crate::translate::sanitize_template;

pub const CORE_TYPE_KEY: &str = "coreType";
pub const MULTI_NODE_KEY: &str = "multiNodeMode";
pub const XRAY_TEMPLATE_KEY: &str = "xrayTemplateConfig";
pub const SINGBOX_TEMPLATE_KEY: &str = "singboxTemplateConfig";

pub const DEFAULT_XRAY_TEMPLATE: &str = include_str!("../templates/xray_config.json");
pub const DEFAULT_SINGBOX_TEMPLATE: &str = include_str!("../templates/singbox_config.json");

pub fn template_key(core: CoreType) -> &'static str {
    match core {
        CoreType::Xray => XRAY_TEMPLATE_KEY,
        CoreType::SingBox => SINGBOX_TEMPLATE_KEY,
    }
}

pub fn default_template(core: CoreType) -> &'static str {
    match core {
        CoreType::Xray => DEFAULT_XRAY_TEMPLATE,
        CoreType::SingBox => DEFAULT_SINGBOX_TEMPLATE,
    }
}

/// Whether a stored template is unusable as is
fn is_placeholder(text: &str) -> bool {
    let trimmed = text.trim();
    trimmed.is_empty() || trimmed == "{}"
}

#[derive(Clone)]
pub struct SettingsService {
    store: Arc<dyn Store>,
}

impl SettingsService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        SettingsService { store }
    }

    /// Active core. An invalid stored value is reset to `xray`.
    pub async fn get_core_type(&self) -> Result<CoreType> {
        let Some(value) = self.store.get_setting(CORE_TYPE_KEY).await? else {
            return Ok(CoreType::default());
        };
        match value.parse::<CoreType>() {
            Ok(core) => Ok(core),
            Err(e) => {
                warn!("{}; resetting to {}", e, CoreType::default());
                self.set_core(CoreType::default()).await?;
                Ok(CoreType::default())
            }
        }
    }

    /// Set the active core from its setting string.
    pub async fn set_core_type(&self, value: &str) -> Result<()> {
        let core: CoreType = value.parse()?;
        self.set_core(core).await
    }

    pub async fn set_core(&self, core: CoreType) -> Result<()> {
        self.store.set_setting(CORE_TYPE_KEY, core.as_str()).await
    }

    pub async fn multi_node_mode(&self) -> Result<bool> {
        let value = self.store.get_setting(MULTI_NODE_KEY).await?;
        Ok(value.is_some_and(|v| v.trim().eq_ignore_ascii_case("true")))
    }

    pub async fn set_multi_node_mode(&self, enabled: bool) -> Result<()> {
        self.store
            .set_setting(MULTI_NODE_KEY, if enabled { "true" } else { "false" })
            .await
    }

    /// The stored template text exactly as persisted
    pub async fn raw_template(&self, core: CoreType) -> Result<Option<String>> {
        self.store.get_setting(template_key(core)).await
    }

    /// Put back a value captured with [`raw_template`](Self::raw_template).
    /// `None` removes the key again.
    pub async fn restore_template(&self, core: CoreType, raw: Option<String>) -> Result<()> {
        match raw {
            Some(raw) => self.store.set_setting(template_key(core), &raw).await,
            None => self.store.delete_setting(template_key(core)).await,
        }
    }

    /// Persist a new template after checking it parses for its core.
    pub async fn set_template(&self, core: CoreType, text: &str) -> Result<()> {
        match core {
            CoreType::Xray => XrayConfig::parse(text).map(drop)?,
            CoreType::SingBox => SingBoxConfig::parse(text).map(drop)?,
        }
        self.store.set_setting(template_key(core), text).await
    }

    /// The validated template of a core
    pub async fn template(&self, core: CoreType) -> Result<String> {
        match core {
            CoreType::Xray => self.ensure_xray_template_valid().await,
            CoreType::SingBox => self.ensure_singbox_template_valid().await,
        }
    }

    pub async fn ensure_xray_template_valid(&self) -> Result<String> {
        let stored = self.raw_template(CoreType::Xray).await?;
        if let Some(text) = stored.filter(|t| !is_placeholder(t)) {
            match XrayConfig::parse(&text) {
                Ok(_) => return Ok(text),
                Err(e) => warn!("Stored Xray template is invalid ({}), resetting to default", e),
            }
        }
        self.reset_xray_template_to_default().await?;
        Ok(DEFAULT_XRAY_TEMPLATE.to_string())
    }

    pub async fn reset_xray_template_to_default(&self) -> Result<()> {
        info!("Resetting Xray template to default");
        self.store
            .set_setting(XRAY_TEMPLATE_KEY, DEFAULT_XRAY_TEMPLATE)
            .await
    }

    /// Like the Xray variant, then cleans what sing-box would reject. The
    /// cleaned template is written back only when something changed.
    pub async fn ensure_singbox_template_valid(&self) -> Result<String> {
        let stored = self.raw_template(CoreType::SingBox).await?;
        let (mut config, mut dirty) = match stored.filter(|t| !is_placeholder(t)) {
            Some(text) => match SingBoxConfig::parse(&text) {
                Ok(config) => (config, false),
                Err(e) => {
                    warn!("Stored sing-box template is invalid ({}), resetting to default", e);
                    (SingBoxConfig::parse(DEFAULT_SINGBOX_TEMPLATE)?, true)
                }
            },
            None => (SingBoxConfig::parse(DEFAULT_SINGBOX_TEMPLATE)?, true),
        };

        let report = sanitize_template(&mut config);
        if report.changed {
            info!(
                "Cleaned sing-box template: {} inbound(s), {} outbound(s), {} rule(s) removed",
                report.removed_inbounds, report.removed_outbounds, report.removed_rules
            );
            dirty = true;
        }

        if !dirty {
            if let Some(text) = self.raw_template(CoreType::SingBox).await? {
                return Ok(text);
            }
        }
        let text = String::from_utf8_lossy(&config.to_pretty_json()?).into_owned();
        self.store.set_setting(SINGBOX_TEMPLATE_KEY, &text).await?;
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn service() -> SettingsService {
        SettingsService::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn test_embedded_templates_parse() {
        let xray = XrayConfig::parse(DEFAULT_XRAY_TEMPLATE).unwrap();
        assert_eq!(xray.api_port(), 62789);

        let mut singbox = SingBoxConfig::parse(DEFAULT_SINGBOX_TEMPLATE).unwrap();
        assert_eq!(singbox.api_port(), 9090);
        assert!(!sanitize_template(&mut singbox).changed);
    }

    #[tokio::test]
    async fn test_core_type_defaults_and_resets() {
        let settings = service();
        assert_eq!(settings.get_core_type().await.unwrap(), CoreType::Xray);

        settings.set_core_type("sing-box").await.unwrap();
        assert_eq!(settings.get_core_type().await.unwrap(), CoreType::SingBox);
        assert!(settings.set_core_type("v2ray").await.is_err());
        assert_eq!(settings.get_core_type().await.unwrap(), CoreType::SingBox);

        settings.store.set_setting(CORE_TYPE_KEY, "clash").await.unwrap();
        assert_eq!(settings.get_core_type().await.unwrap(), CoreType::Xray);
        assert_eq!(
            settings.store.get_setting(CORE_TYPE_KEY).await.unwrap().as_deref(),
            Some("xray")
        );
    }

    #[tokio::test]
    async fn test_multi_node_mode() {
        let settings = service();
        assert!(!settings.multi_node_mode().await.unwrap());
        settings.set_multi_node_mode(true).await.unwrap();
        assert!(settings.multi_node_mode().await.unwrap());
    }

    #[tokio::test]
    async fn test_xray_template_self_heals() {
        let settings = service();
        for broken in ["", "{}", "  {}  ", "{not json"] {
            settings.store.set_setting(XRAY_TEMPLATE_KEY, broken).await.unwrap();
            assert_eq!(settings.template(CoreType::Xray).await.unwrap(), DEFAULT_XRAY_TEMPLATE);
            assert_eq!(
                settings.raw_template(CoreType::Xray).await.unwrap().as_deref(),
                Some(DEFAULT_XRAY_TEMPLATE)
            );
        }

        let custom = json!({"log": {"loglevel": "debug"}}).to_string();
        settings.store.set_setting(XRAY_TEMPLATE_KEY, &custom).await.unwrap();
        assert_eq!(settings.template(CoreType::Xray).await.unwrap(), custom);
    }

    #[tokio::test]
    async fn test_singbox_template_is_sanitized_once() {
        let settings = service();
        let dirty = json!({
            "log": {"level": "info", "error": "/var/log/e.log"},
            "inbounds": [{"type": "tunnel", "tag": "api"}],
            "outbounds": [{"protocol": "freedom", "tag": "direct"}]
        })
        .to_string();
        settings.store.set_setting(SINGBOX_TEMPLATE_KEY, &dirty).await.unwrap();

        let cleaned = settings.template(CoreType::SingBox).await.unwrap();
        let config = SingBoxConfig::parse(&cleaned).unwrap();
        assert!(config.inbounds.is_empty());
        assert_eq!(config.outbound_list(), vec![json!({"tag": "direct", "type": "direct"})]);
        assert_eq!(
            config.log,
            Some(json!({"level": "info", "timestamp": true, "output": "sing-box.log"}))
        );
        assert_eq!(
            settings.raw_template(CoreType::SingBox).await.unwrap().as_deref(),
            Some(cleaned.as_str())
        );

        assert_eq!(settings.template(CoreType::SingBox).await.unwrap(), cleaned);
    }

    #[tokio::test]
    async fn test_set_template_rejects_invalid() {
        let settings = service();
        assert!(settings.set_template(CoreType::SingBox, "[1,2]").await.is_err());
        assert_eq!(settings.raw_template(CoreType::SingBox).await.unwrap(), None);

        settings.restore_template(CoreType::SingBox, None).await.unwrap();
        assert_eq!(
            settings.template(CoreType::SingBox).await.unwrap(),
            String::from_utf8(SingBoxConfig::parse(DEFAULT_SINGBOX_TEMPLATE).unwrap().to_pretty_json().unwrap()).unwrap()
        );
    }

    #[tokio::test]
    async fn test_restore_absent_template_removes_key() {
        let settings = service();
        assert_eq!(settings.raw_template(CoreType::Xray).await.unwrap(), None);
        settings.template(CoreType::Xray).await.unwrap();
        assert!(settings.raw_template(CoreType::Xray).await.unwrap().is_some());

        settings.restore_template(CoreType::Xray, None).await.unwrap();
        assert_eq!(settings.raw_template(CoreType::Xray).await.unwrap(), None);

        settings
            .restore_template(CoreType::Xray, Some("{\"log\": {}}".to_string()))
            .await
            .unwrap();
        assert_eq!(
            settings.raw_template(CoreType::Xray).await.unwrap().as_deref(),
            Some("{\"log\": {}}")
        );
    }
}
