//! Integration tests for corepanel
//!
//! These drive the crate through its public API only: translation between
//! the two core formats, config building from stored rows, template repair,
//! process supervision, core switching and multi-node fan-out.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use corepanel::builder::ConfigBuilder;
use corepanel::common::{ClientTraffic, TrafficAggregator};
use corepanel::core::{CoreConfig, SingBoxConfig, XrayConfig};
use corepanel::model::{CoreConfigProfile, CoreType, InboundEndpoint, Node, OutboundEndpoint, Protocol};
use corepanel::service::settings::{DEFAULT_XRAY_TEMPLATE, XRAY_TEMPLATE_KEY, SINGBOX_TEMPLATE_KEY};
use corepanel::service::{CoreManager, NodeClient, ProfileService, SettingsService};
use corepanel::store::{MemoryStore, Store};
use corepanel::translate::{singbox_to_xray, xray_to_singbox, xray_to_singbox_with_report};
use corepanel::{Error, Result};

fn xray(value: Value) -> XrayConfig {
    XrayConfig::parse(&value.to_string()).unwrap()
}

fn singbox_value(config: &SingBoxConfig) -> Value {
    serde_json::from_slice(&config.to_pretty_json().unwrap()).unwrap()
}

fn xray_value(config: &XrayConfig) -> Value {
    serde_json::from_slice(&config.to_pretty_json().unwrap()).unwrap()
}

fn memory_store() -> Arc<dyn Store> {
    Arc::new(MemoryStore::new())
}

fn row(tag: &str, port: u16, protocol: Protocol) -> InboundEndpoint {
    InboundEndpoint {
        remark: tag.to_string(),
        tag: tag.to_string(),
        port,
        protocol: Some(protocol),
        enable: true,
        settings: json!({"clients": [{"id": "b831381d-6324-4d53-ad4f-8cda48b30811", "email": format!("{}@example.com", tag)}]})
            .to_string(),
        stream_settings: json!({"network": "tcp", "security": "none"}).to_string(),
        ..Default::default()
    }
}

fn inbound_tags(config: &Value) -> Vec<String> {
    config["inbounds"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|i| i["tag"].as_str().map(str::to_string))
        .collect()
}

// ============================================================================
// Translation
// ============================================================================

/// A VLESS user keeps its email as sing-box `name`, and gets it back.
#[test]
fn test_vless_user_translation() {
    let config = xray(json!({
        "inbounds": [{
            "tag": "in-443",
            "port": 443,
            "protocol": "vless",
            "settings": {
                "decryption": "none",
                "clients": [{
                    "id": "04b2592e-2b22-4c4a-9d0c-39a4e6e8f3a1",
                    "email": "kpichugin@icloud.com",
                    "flow": "xtls-rprx-vision"
                }]
            }
        }]
    }));

    let singbox = singbox_value(&xray_to_singbox(&config));
    let user = &singbox["inbounds"][0]["users"][0];
    assert_eq!(
        user,
        &json!({
            "uuid": "04b2592e-2b22-4c4a-9d0c-39a4e6e8f3a1",
            "name": "kpichugin@icloud.com",
            "flow": "xtls-rprx-vision"
        })
    );
    assert!(user.get("email").is_none());

    let back = xray_value(&singbox_to_xray(&xray_to_singbox(&config)));
    let client = &back["inbounds"][0]["settings"]["clients"][0];
    assert_eq!(client["id"], "04b2592e-2b22-4c4a-9d0c-39a4e6e8f3a1");
    assert_eq!(client["email"], "kpichugin@icloud.com");
    assert_eq!(client["flow"], "xtls-rprx-vision");
}

#[test]
fn test_reality_translation() {
    let config = xray(json!({
        "inbounds": [{
            "tag": "reality",
            "port": 443,
            "protocol": "vless",
            "settings": {"decryption": "none", "clients": []},
            "streamSettings": {
                "network": "tcp",
                "security": "reality",
                "realitySettings": {
                    "dest": "aws.amazon.com:443",
                    "serverNames": ["aws.amazon.com"],
                    "privateKey": "EOx_0GUMZDiA5oPQ4Y1S2KtkXLHtqWuylqJ_1lI6Nmc",
                    "shortIds": ["837fc8948286", "01"]
                }
            }
        }]
    }));

    let singbox = xray_to_singbox(&config);
    let value = singbox_value(&singbox);
    assert_eq!(
        value["inbounds"][0]["tls"],
        json!({
            "enabled": true,
            "server_name": "aws.amazon.com:443",
            "reality": {
                "enabled": true,
                "handshake": {"server": "aws.amazon.com:443"},
                "private_key": "EOx_0GUMZDiA5oPQ4Y1S2KtkXLHtqWuylqJ_1lI6Nmc",
                "short_id": ["837fc8948286", "01"]
            }
        })
    );
    assert!(value["inbounds"][0].get("transport").is_none());

    let back = xray_value(&singbox_to_xray(&singbox));
    let stream = &back["inbounds"][0]["streamSettings"];
    assert_eq!(stream["security"], "reality");
    let reality = &stream["realitySettings"];
    assert_eq!(reality["dest"], "aws.amazon.com:443");
    assert_eq!(reality["serverNames"], json!(["aws.amazon.com:443"]));
    assert_eq!(reality["shortIds"], json!(["837fc8948286", "01"]));
    assert_eq!(
        reality["privateKey"],
        "EOx_0GUMZDiA5oPQ4Y1S2KtkXLHtqWuylqJ_1lI6Nmc"
    );
}

/// VMess emails and `type: "field"` markers do not survive a round trip.
#[test]
fn test_round_trip_losses() {
    let config = xray(json!({
        "inbounds": [{
            "tag": "in-vmess",
            "port": 10086,
            "protocol": "vmess",
            "settings": {"clients": [{"id": "b831381d-6324-4d53-ad4f-8cda48b30811", "email": "bob@example.com"}]}
        }],
        "outbounds": [{"tag": "direct", "protocol": "freedom"}],
        "routing": {
            "rules": [{"type": "field", "inboundTag": ["in-vmess"], "outboundTag": "direct"}]
        }
    }));

    let back = xray_value(&singbox_to_xray(&xray_to_singbox(&config)));
    let client = &back["inbounds"][0]["settings"]["clients"][0];
    assert_eq!(client["id"], "b831381d-6324-4d53-ad4f-8cda48b30811");
    assert!(client.get("email").is_none());

    let rule = &back["routing"]["rules"][0];
    assert!(rule.get("type").is_none());
    assert_eq!(rule["outbound"], "direct");
    assert_eq!(rule["inbound"], json!(["in-vmess"]));
    assert_ne!(back, xray_value(&config));
}

#[test]
fn test_geoip_rule_dropped_without_database() {
    let config = xray(json!({
        "outbounds": [{"tag": "direct", "protocol": "freedom"}],
        "routing": {
            "rules": [
                {"type": "field", "outboundTag": "direct", "ip": ["geoip:private"]},
                {"type": "field", "outboundTag": "direct", "domain": ["example.com"]}
            ]
        }
    }));

    let (singbox, report) = xray_to_singbox_with_report(&config);
    assert_eq!(report.removed_rules, 1);
    let rules = singbox_value(&singbox)["route"]["rules"].clone();
    assert_eq!(
        rules,
        json!([{"outbound": "direct", "domain": ["example.com"]}])
    );
}

#[test]
fn test_unsupported_inbound_not_translated() {
    let config = xray(json!({
        "inbounds": [
            {"tag": "api", "port": 62789, "listen": "127.0.0.1", "protocol": "dokodemo-door"},
            {"tag": "in-trojan", "port": 8443, "protocol": "trojan", "settings": {"clients": [{"password": "p"}]}}
        ]
    }));
    let (singbox, report) = xray_to_singbox_with_report(&config);
    assert_eq!(report.removed_inbounds, 1);
    assert_eq!(singbox.inbounds.len(), 1);
    assert_eq!(singbox.inbounds[0].tag, "in-trojan");
}

// ============================================================================
// Traffic accounting
// ============================================================================

#[test]
fn test_traffic_directionality() {
    let mut aggregator = TrafficAggregator::new();
    assert!(aggregator.record("user>>>alice@example.com>>>traffic>>>downlink", 1000));
    assert!(aggregator.record("inbound>>>in-443>>>traffic>>>uplink", 300));
    assert!(aggregator.record("inbound>>>in-443>>>traffic>>>downlink", 700));
    assert!(aggregator.record("outbound>>>direct>>>traffic>>>uplink", 5));
    assert!(!aggregator.record("inbound>>>api>>>traffic>>>downlink", 9));
    let (traffics, clients) = aggregator.finish();

    assert_eq!(
        clients,
        vec![ClientTraffic {
            email: "alice@example.com".to_string(),
            up: 0,
            down: 1000,
        }]
    );

    let inbound = traffics.iter().find(|t| t.tag == "in-443").unwrap();
    assert!(inbound.is_inbound);
    assert_eq!((inbound.up, inbound.down), (300, 700));
    let outbound = traffics.iter().find(|t| t.tag == "direct").unwrap();
    assert!(outbound.is_outbound);
    assert_eq!((outbound.up, outbound.down), (5, 0));
    assert!(traffics.iter().all(|t| t.tag != "api"));
}

// ============================================================================
// Config building
// ============================================================================

#[tokio::test]
async fn test_builder_skips_unsupported_protocols() {
    let store = memory_store();
    store.save_inbound(row("in-vless", 443, Protocol::Vless)).await.unwrap();
    store.save_inbound(row("in-tunnel", 1080, Protocol::Tunnel)).await.unwrap();
    let builder = ConfigBuilder::new(store.clone(), SettingsService::new(store));

    let singbox = singbox_value(&builder.build::<SingBoxConfig>().await.unwrap());
    let tags = inbound_tags(&singbox);
    assert!(tags.contains(&"in-vless".to_string()));
    assert!(!tags.contains(&"in-tunnel".to_string()));

    let xray = xray_value(&builder.build::<XrayConfig>().await.unwrap());
    let tags = inbound_tags(&xray);
    assert!(tags.contains(&"in-vless".to_string()));
    assert!(tags.contains(&"in-tunnel".to_string()));
}

#[tokio::test]
async fn test_stored_inbound_wins_tag_collision() {
    let store = memory_store();
    let settings = SettingsService::new(store.clone());
    let mut template: Value = serde_json::from_str(DEFAULT_XRAY_TEMPLATE).unwrap();
    template["inbounds"]
        .as_array_mut()
        .unwrap()
        .push(json!({"tag": "in-443", "port": 8443, "protocol": "vmess"}));
    settings
        .set_template(CoreType::Xray, &template.to_string())
        .await
        .unwrap();
    store.save_inbound(row("in-443", 443, Protocol::Vless)).await.unwrap();

    let builder = ConfigBuilder::new(store, settings);
    let built = xray_value(&builder.build::<XrayConfig>().await.unwrap());
    let matching: Vec<&Value> = built["inbounds"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|i| i["tag"] == "in-443")
        .collect();
    assert_eq!(matching.len(), 1);
    assert_eq!(matching[0]["port"], 443);
    assert_eq!(matching[0]["protocol"], "vless");
    assert_eq!(
        matching[0]["settings"]["clients"][0]["email"],
        "in-443@example.com"
    );
}

#[tokio::test]
async fn test_template_self_healing() {
    for stored in ["", "{}", "{not json"] {
        let store = memory_store();
        store.set_setting(XRAY_TEMPLATE_KEY, stored).await.unwrap();
        store.set_setting(SINGBOX_TEMPLATE_KEY, stored).await.unwrap();
        let settings = SettingsService::new(store.clone());
        let builder = ConfigBuilder::new(store.clone(), settings.clone());

        builder.build::<XrayConfig>().await.unwrap();
        builder.build::<SingBoxConfig>().await.unwrap();

        let xray = store.get_setting(XRAY_TEMPLATE_KEY).await.unwrap();
        assert_eq!(xray.as_deref(), Some(DEFAULT_XRAY_TEMPLATE), "stored {:?}", stored);

        let singbox = store.get_setting(SINGBOX_TEMPLATE_KEY).await.unwrap().unwrap();
        assert_ne!(singbox.trim(), stored);
        SingBoxConfig::parse(&singbox).unwrap();
        assert_eq!(
            settings.ensure_singbox_template_valid().await.unwrap(),
            singbox
        );
    }
}

// ============================================================================
// Profiles
// ============================================================================

#[tokio::test]
async fn test_profile_delete_blocked_by_outbound() {
    let store = memory_store();
    let profiles = ProfileService::new(store.clone(), SettingsService::new(store.clone()));
    let default = profiles.ensure_default(1, CoreType::Xray).await.unwrap();
    let extra = profiles
        .add(CoreConfigProfile {
            id: 0,
            user_id: 1,
            name: "edge".to_string(),
            description: String::new(),
            core: CoreType::Xray,
            config_json: DEFAULT_XRAY_TEMPLATE.to_string(),
            is_default: false,
            created_at: 0,
            updated_at: 0,
            node_ids: Vec::new(),
        })
        .await
        .unwrap();
    store
        .save_outbound(OutboundEndpoint {
            tag: "proxy".to_string(),
            protocol: "vless".to_string(),
            enable: true,
            core_config_profile_id: Some(extra.id),
            ..Default::default()
        })
        .await
        .unwrap();

    let err = profiles.delete(extra.id).await.unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));
    let err = profiles.delete(default.id).await.unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));
    assert_eq!(profiles.list(1).await.unwrap().len(), 2);
}

// ============================================================================
// Multi-node fan-out
// ============================================================================

/// Records pushes and fails for the node names it is told to.
#[derive(Default)]
struct ScriptedNodes {
    failing: Mutex<Vec<String>>,
    pushed: Mutex<Vec<(String, CoreType, Value)>>,
}

#[async_trait]
impl NodeClient for ScriptedNodes {
    async fn apply_config(&self, node: &Node, core: CoreType, config: &[u8]) -> Result<()> {
        if self.failing.lock().contains(&node.name) {
            return Err(Error::api(format!("{} unreachable", node.name)));
        }
        let config = serde_json::from_slice(config)?;
        self.pushed.lock().push((node.name.clone(), core, config));
        Ok(())
    }
}

async fn save_node(store: &Arc<dyn Store>, name: &str) -> i64 {
    store
        .save_node(Node {
            name: name.to_string(),
            address: format!("http://{}.invalid:2053", name),
            ..Default::default()
        })
        .await
        .unwrap()
        .id
}

#[tokio::test]
async fn test_multi_node_fan_out() {
    let store = memory_store();
    let edge = save_node(&store, "edge").await;
    let down = save_node(&store, "down").await;
    save_node(&store, "idle").await;

    let mut a = row("in-a", 443, Protocol::Vless);
    a.node_ids = vec![edge];
    store.save_inbound(a).await.unwrap();
    let mut b = row("in-b", 8443, Protocol::Vless);
    b.node_ids = vec![down];
    store.save_inbound(b).await.unwrap();

    let nodes = Arc::new(ScriptedNodes::default());
    nodes.failing.lock().push("down".to_string());
    let dir = std::env::temp_dir().join("corepanel-it-no-binaries");
    let manager = CoreManager::with_bin_folder(store, &dir, &dir.join("log"), nodes.clone());
    manager.settings().set_multi_node_mode(true).await.unwrap();

    manager.restart(false).await.unwrap();
    {
        let pushed = nodes.pushed.lock();
        assert_eq!(pushed.len(), 1);
        let (name, core, config) = &pushed[0];
        assert_eq!(name, "edge");
        assert_eq!(*core, CoreType::Xray);
        let tags = inbound_tags(config);
        assert!(tags.contains(&"in-a".to_string()));
        assert!(!tags.contains(&"in-b".to_string()));
    }
    assert!(!manager.xray().is_running());

    nodes.failing.lock().push("edge".to_string());
    let err = manager.restart(false).await.unwrap_err();
    assert!(matches!(err, Error::Api(_)));
}

// ============================================================================
// Process supervision and core switching
// ============================================================================

#[cfg(unix)]
mod process {
    use super::*;
    use corepanel::supervisor::{Process, ProcessSpec};
    use std::path::{Path, PathBuf};
    use std::time::Duration;
    use tokio_test::assert_ok;

    const FAKE_CORE: &str = r#"#!/bin/sh
case "$1" in
  version) echo "Xray 1.8.24 (Xray, Penetrates Everything.)" ;;
  check) exit 0 ;;
  run)
    if [ "$2" = "-test" ]; then exit 0; fi
    exec sleep 30 ;;
esac
"#;

    fn scratch(name: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!(
            "corepanel-it-{}-{}-{}",
            name,
            std::process::id(),
            nanos
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn fake_core(dir: &Path) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-core");
        std::fs::write(&path, FAKE_CORE).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn spec(core: CoreType, dir: &Path, binary: PathBuf) -> ProcessSpec {
        let mut spec = ProcessSpec::for_core(core, dir);
        spec.binary = binary;
        spec.startup_grace = Duration::from_millis(200);
        spec
    }

    #[tokio::test]
    async fn test_stop_and_start_are_guarded() {
        let dir = scratch("process");
        let binary = fake_core(&dir);
        let config = XrayConfig::parse(DEFAULT_XRAY_TEMPLATE).unwrap();
        let process = Process::new(spec(CoreType::Xray, &dir, binary), config);

        assert!(matches!(process.stop().await, Err(Error::NotRunning(_))));

        assert_ok!(process.start().await);
        assert!(process.is_running());
        let pid = process.pid();
        assert!(pid.is_some());
        assert_eq!(process.version(), "1.8.24");

        assert!(matches!(process.start().await, Err(Error::AlreadyRunning(_))));
        assert_eq!(process.pid(), pid);

        assert_ok!(process.stop().await);
        assert!(!process.is_running());
        assert!(matches!(process.stop().await, Err(Error::NotRunning(_))));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_switch_rolls_back_when_target_fails() {
        let dir = scratch("switch");
        let binary = fake_core(&dir);
        let manager = CoreManager::new(
            memory_store(),
            spec(CoreType::Xray, &dir, binary),
            spec(CoreType::SingBox, &dir, dir.join("missing-sing-box")),
            Arc::new(ScriptedNodes::default()),
        );
        let settings = manager.settings();
        settings.ensure_singbox_template_valid().await.unwrap();
        manager.restart(true).await.unwrap();

        let xray_before = settings.raw_template(CoreType::Xray).await.unwrap();
        let singbox_before = settings.raw_template(CoreType::SingBox).await.unwrap();

        let err = manager.switch_core_with_conversion("sing-box").await.unwrap_err();
        assert!(matches!(err, Error::Process { .. }));
        assert_eq!(settings.get_core_type().await.unwrap(), CoreType::Xray);
        assert_eq!(settings.raw_template(CoreType::Xray).await.unwrap(), xray_before);
        assert_eq!(settings.raw_template(CoreType::SingBox).await.unwrap(), singbox_before);
        assert!(manager.xray().is_running());
        assert!(!manager.singbox().is_running());

        let err = manager.switch_core_with_conversion("v2ray").await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        manager.switch_core_with_conversion("xray").await.unwrap();
        assert!(manager.xray().is_running());

        manager.stop().await.unwrap();
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
