//! sing-box sanitation passes
//!
//! sing-box rejects several shapes Xray accepts (nested TLS in transports,
//! `type: "field"` route markers, legacy outbound aliases). These passes
//! rewrite a sing-box document in place and report what they touched. The
//! translator runs them on converted sections, the settings service and the
//! builder run them on the stored template.

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::warn;

use crate::common::Document;
use crate::core::{SingBoxConfig, SingBoxInbound};

/// Inbound types sing-box cannot load from a template
pub const UNSUPPORTED_INBOUNDS: [&str; 2] = ["tunnel", "wireguard"];

/// Outbound types with no sing-box counterpart
pub const UNSUPPORTED_OUTBOUNDS: [&str; 2] = ["tun", "tunnel"];

/// V2Ray transport types sing-box understands
pub const TRANSPORT_TYPES: [&str; 5] = ["ws", "grpc", "quic", "http", "httpupgrade"];

const DEFAULT_LOG_OUTPUT: &str = "sing-box.log";

/// What a sanitation pass changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SanitizeReport {
    pub removed_inbounds: usize,
    pub removed_outbounds: usize,
    pub removed_rules: usize,
    pub changed: bool,
}

impl SanitizeReport {
    pub fn merge(&mut self, other: SanitizeReport) {
        self.removed_inbounds += other.removed_inbounds;
        self.removed_outbounds += other.removed_outbounds;
        self.removed_rules += other.removed_rules;
        self.changed |= other.changed;
    }

    fn mark(&mut self, changed: bool) {
        self.changed |= changed;
    }
}

/// Run every pass over a sing-box template.
pub fn sanitize_template(config: &mut SingBoxConfig) -> SanitizeReport {
    let mut report = SanitizeReport::default();

    if let Some(log) = config.log.as_mut() {
        if let Some(changed) = Document::edit(log, sanitize_log) {
            report.mark(changed);
        }
    }
    report.merge(sanitize_inbounds(&mut config.inbounds));
    if let Some(Value::Array(outbounds)) = config.outbounds.as_mut() {
        report.merge(sanitize_outbounds(outbounds));
    }
    if let Some(route) = config.route.as_mut() {
        if let Some(route_report) = Document::edit(route, sanitize_route) {
            report.merge(route_report);
        }
    }
    report
}

/// sing-box has a single `output` and no `error` key.
pub fn sanitize_log(log: &mut Document) -> bool {
    let removed_error = log.remove("error").is_some();
    let mut changed = removed_error;
    if !log.contains("timestamp") {
        log.insert("timestamp", true);
        changed = true;
    }
    if !log.contains("level") {
        log.insert("level", "warn");
        changed = true;
    }
    if removed_error && !log.contains("output") {
        log.insert("output", DEFAULT_LOG_OUTPUT);
    }
    changed
}

pub fn sanitize_inbounds(inbounds: &mut Vec<SingBoxInbound>) -> SanitizeReport {
    let mut report = SanitizeReport::default();
    inbounds.retain(|inbound| {
        if UNSUPPORTED_INBOUNDS.contains(&inbound.kind.as_str()) {
            warn!(
                "Removing unsupported inbound from sing-box template: type={}, tag={}",
                inbound.kind, inbound.tag
            );
            report.removed_inbounds += 1;
            report.changed = true;
            return false;
        }
        true
    });

    for inbound in inbounds.iter_mut() {
        let changed = clean_transport(inbound) | clean_users(inbound) | clean_reality(inbound);
        report.mark(changed);
    }
    report
}

/// Relocate TLS objects out of the transport and drop transports sing-box
/// cannot load.
fn clean_transport(inbound: &mut SingBoxInbound) -> bool {
    let Some(Value::Object(transport)) = inbound.transport.as_mut() else {
        return false;
    };

    let nested_tls = transport.shift_remove("tls");
    let nested_reality = transport.shift_remove("reality");
    let mut changed = nested_tls.is_some() || nested_reality.is_some();

    if changed {
        if inbound.tls.is_none() {
            let mut tls = match nested_tls {
                Some(Value::Object(map)) => map,
                _ => Map::new(),
            };
            tls.entry("enabled").or_insert(Value::Bool(true));
            if let Some(reality) = nested_reality {
                tls.insert("reality".to_string(), reality);
            }
            warn!(
                "Moved TLS settings out of transport for inbound {} (tag: {})",
                inbound.kind, inbound.tag
            );
            inbound.tls = Some(Value::Object(tls));
        } else {
            warn!(
                "Dropped TLS settings nested in transport for inbound {} (tag: {})",
                inbound.kind, inbound.tag
            );
        }
    }

    let valid = transport
        .get("type")
        .and_then(Value::as_str)
        .is_some_and(|t| TRANSPORT_TYPES.contains(&t));
    if !valid {
        warn!(
            "Removing invalid transport from inbound {} (tag: {})",
            inbound.kind, inbound.tag
        );
        inbound.transport = None;
        changed = true;
    }
    changed
}

/// VLESS users are named, VMess users are anonymous.
fn clean_users(inbound: &mut SingBoxInbound) -> bool {
    let Some(users) = inbound.users.as_mut().and_then(Value::as_array_mut) else {
        return false;
    };
    let mut changed = false;
    for user in users.iter_mut() {
        let Some(user) = user.as_object_mut() else {
            continue;
        };
        match inbound.kind.as_str() {
            "vless" => {
                let email = user
                    .get("email")
                    .and_then(Value::as_str)
                    .filter(|e| !e.is_empty())
                    .map(str::to_string);
                if let Some(email) = email {
                    user.shift_remove("email");
                    user.insert("name".to_string(), Value::String(email));
                    changed = true;
                }
            }
            "vmess" => changed |= user.shift_remove("email").is_some(),
            _ => {}
        }
    }
    changed
}

/// `server_name` belongs to the TLS level, `short_id` is a list and a
/// handshake target is required.
fn clean_reality(inbound: &mut SingBoxInbound) -> bool {
    let Some(Value::Object(tls)) = inbound.tls.as_mut() else {
        return false;
    };
    let Some(Value::Object(original)) = tls.get("reality") else {
        return false;
    };
    let mut reality = original.clone();
    let mut changed = false;

    if let Some(Value::String(name)) = reality.shift_remove("server_name") {
        tls.insert("server_name".to_string(), Value::String(name));
        changed = true;
    }
    if let Some(Value::Array(names)) = reality.get("server_names") {
        if let Some(first) = names.first().and_then(Value::as_str) {
            tls.insert("server_name".to_string(), Value::String(first.to_string()));
        }
        if !names.is_empty() {
            reality.shift_remove("server_names");
            changed = true;
        }
    }
    if let Some(Value::String(short_id)) = reality.get("short_id") {
        let wrapped = Value::Array(vec![Value::String(short_id.clone())]);
        reality.insert("short_id".to_string(), wrapped);
        changed = true;
    }
    if !reality.contains_key("handshake") {
        let server = tls
            .get("server_name")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty());
        if let Some(server) = server {
            let mut handshake = Map::new();
            handshake.insert("server".to_string(), Value::String(server.to_string()));
            reality.insert("handshake".to_string(), Value::Object(handshake));
            changed = true;
        }
    }

    if changed {
        warn!(
            "Normalized reality settings for inbound {} (tag: {})",
            inbound.kind, inbound.tag
        );
        tls.insert("reality".to_string(), Value::Object(reality));
    }
    changed
}

pub fn sanitize_outbounds(outbounds: &mut Vec<Value>) -> SanitizeReport {
    let mut report = SanitizeReport::default();
    outbounds.retain_mut(|outbound| {
        match Document::edit(outbound, outbound_to_singbox) {
            Some(Some(changed)) => {
                report.mark(changed);
                true
            }
            Some(None) => {
                warn!(
                    "Removing unsupported outbound: type={}, tag={}",
                    outbound_kind(outbound),
                    outbound.get("tag").and_then(serde_json::Value::as_str).unwrap_or_default()
                );
                report.removed_outbounds += 1;
                report.changed = true;
                false
            }
            None => true,
        }
    });
    report
}

fn outbound_kind(outbound: &Value) -> &str {
    ["type", "protocol"]
        .iter()
        .filter_map(|key| outbound.get(*key).and_then(Value::as_str))
        .find(|kind| !kind.is_empty())
        .unwrap_or_default()
}

/// Rewrite one outbound. `None` means it must be dropped.
fn outbound_to_singbox(outbound: &mut Document) -> Option<bool> {
    let kind = outbound
        .non_empty_str("type")
        .or_else(|| outbound.non_empty_str("protocol"))
        .unwrap_or_default()
        .to_string();
    if UNSUPPORTED_OUTBOUNDS.contains(&kind.as_str()) {
        return None;
    }

    let mut changed = false;
    if outbound.non_empty_str("type").is_none() && outbound.contains("protocol") {
        let kind = match kind.as_str() {
            "freedom" => {
                if let Some(settings) = outbound.object_mut("settings") {
                    for key in ["domainStrategy", "redirect", "noises"] {
                        settings.shift_remove(key);
                    }
                }
                "direct".to_string()
            }
            "blackhole" => {
                outbound.insert("settings", Map::new());
                "block".to_string()
            }
            other => other.to_string(),
        };
        outbound.remove("protocol");
        outbound.insert("type", kind);
        changed = true;
    }

    let strategy = outbound
        .object_mut("settings")
        .filter(|s| s.get("domainStrategy").is_some_and(Value::is_string))
        .and_then(|s| s.shift_remove("domainStrategy"));
    if let Some(strategy) = strategy {
        outbound.insert("domain_strategy", strategy);
        changed = true;
    }
    Some(changed)
}

/// Route section pass. Geo-IP rules survive only when `route.geoip` is
/// configured, since sing-box refuses them otherwise.
pub fn sanitize_route(route: &mut Document) -> SanitizeReport {
    let mut report = SanitizeReport::default();
    for key in ["domainStrategy", "domain_strategy"] {
        report.mark(route.remove(key).is_some());
    }

    let has_geoip = route.object("geoip").is_some();
    let Some(rules) = route.array_mut("rules") else {
        return report;
    };

    let mut kept = Vec::with_capacity(rules.len());
    for mut rule in rules.drain(..) {
        match Document::edit(&mut rule, |doc| rule_to_singbox(doc, has_geoip)) {
            Some(None) => {
                warn!(
                    "Dropping route rule to {:?}: it needs a geoip database and none is configured",
                    rule.get("outbound").and_then(serde_json::Value::as_str).unwrap_or_default()
                );
                report.removed_rules += 1;
                report.changed = true;
            }
            Some(Some(changed)) => {
                report.mark(changed);
                kept.push(rule);
            }
            None => kept.push(rule),
        }
    }
    *rules = kept;
    report
}

/// Rewrite one rule. `None` means it must be dropped.
fn rule_to_singbox(rule: &mut Document, has_geoip: bool) -> Option<bool> {
    let mut changed = rule.remove("type").is_some();

    if rule.str("outboundTag").is_some() {
        changed |= rule.rename("outboundTag", "outbound");
    }
    match rule.get("inboundTag") {
        Some(Value::Array(_)) => changed |= rule.rename("inboundTag", "inbound"),
        Some(Value::String(tag)) => {
            let tags = vec![Value::String(tag.clone())];
            rule.remove("inboundTag");
            rule.insert("inbound", tags);
            changed = true;
        }
        _ => {}
    }

    if let Some(ips) = rule.array("ip") {
        let mut geoip = Vec::new();
        let mut regular = Vec::new();
        for ip in ips.iter().filter_map(Value::as_str) {
            match ip.strip_prefix("geoip:") {
                Some(code) => geoip.push(Value::String(code.to_string())),
                None => regular.push(Value::String(ip.to_string())),
            }
        }
        let total = ips.len();

        if !geoip.is_empty() {
            if !has_geoip {
                return None;
            }
            rule.insert("geoip", geoip);
            changed = true;
        }
        if regular.is_empty() {
            changed |= rule.remove("ip").is_some();
        } else if regular.len() != total {
            rule.insert("ip", regular);
            changed = true;
        }
    }

    let needs_geoip = match rule.get("geoip") {
        Some(Value::Array(codes)) => !codes.is_empty(),
        Some(Value::String(code)) => !code.is_empty(),
        _ => false,
    };
    if needs_geoip && !has_geoip {
        return None;
    }
    Some(changed)
}
