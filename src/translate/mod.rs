//! Config translation between Xray and sing-box
//!
//! Both directions are pure and total: a malformed section is passed through
//! unchanged instead of failing the whole document, and inbounds with no
//! counterpart on the target core are left out. Xray to sing-box is lossy
//! (VMess emails, `type: "field"` rule markers and geo-IP rules without a
//! database do not survive); the returned [`SanitizeReport`] counts the
//! dropped elements so callers can log them.

mod inbound;
pub mod sanitize;

use serde_json::Value;
use tracing::debug;

use crate::common::Document;
use crate::core::{SingBoxConfig, XrayConfig};

pub use inbound::{
    client_to_singbox, singbox_inbound_to_xray, xray_inbound_to_singbox, SINGBOX_INBOUND_TYPES,
};
pub use sanitize::{sanitize_template, SanitizeReport};

/// Xray → sing-box
pub fn xray_to_singbox(config: &XrayConfig) -> SingBoxConfig {
    xray_to_singbox_with_report(config).0
}

/// Xray → sing-box, also reporting what had to be dropped.
pub fn xray_to_singbox_with_report(config: &XrayConfig) -> (SingBoxConfig, SanitizeReport) {
    let mut report = SanitizeReport::default();
    let mut out = SingBoxConfig {
        log: Some(log_to_singbox(config.log.as_ref())),
        dns: config.dns.clone(),
        ..Default::default()
    };

    for inbound in &config.inbounds {
        match xray_inbound_to_singbox(inbound) {
            Some(converted) => out.inbounds.push(converted),
            None => {
                debug!(
                    "No sing-box counterpart for inbound {} ({})",
                    inbound.tag, inbound.protocol
                );
                report.removed_inbounds += 1;
                report.changed = true;
            }
        }
    }

    out.outbounds = config.outbounds.clone();
    if let Some(Value::Array(outbounds)) = out.outbounds.as_mut() {
        report.merge(sanitize::sanitize_outbounds(outbounds));
    }

    out.route = config.routing.clone();
    if let Some(route) = out.route.as_mut() {
        if let Some(route_report) = Document::edit(route, sanitize::sanitize_route) {
            report.merge(route_report);
        }
    }

    (out, report)
}

/// sing-box → Xray
pub fn singbox_to_xray(config: &SingBoxConfig) -> XrayConfig {
    let mut out = XrayConfig {
        log: config.log.as_ref().map(log_to_xray),
        dns: config.dns.clone(),
        inbounds: config.inbounds.iter().map(singbox_inbound_to_xray).collect(),
        routing: config.route.clone(),
        ..Default::default()
    };

    out.outbounds = config.outbounds.clone();
    if let Some(Value::Array(outbounds)) = out.outbounds.as_mut() {
        for outbound in outbounds.iter_mut() {
            Document::edit(outbound, outbound_to_xray);
        }
    }
    out
}

fn level_to_singbox(level: &str) -> &str {
    match level {
        "warning" => "warn",
        other => other,
    }
}

fn level_to_xray(level: &str) -> &str {
    match level {
        "warn" => "warning",
        "trace" => "debug",
        "fatal" | "panic" => "error",
        other => other,
    }
}

/// Xray writes access and error logs separately; sing-box has one output,
/// and the error log wins.
fn log_to_singbox(log: Option<&Value>) -> Value {
    let Some(log) = log else {
        let mut doc = Document::new();
        doc.insert("level", "warn");
        doc.insert("timestamp", true);
        return doc.into_value();
    };
    let Some(xray) = Document::from_section(Some(log)) else {
        return log.clone();
    };

    let mut doc = Document::new();
    doc.insert(
        "level",
        level_to_singbox(xray.non_empty_str("loglevel").unwrap_or("warn")),
    );
    if let Some(output) = log_file(&xray, "error").or_else(|| log_file(&xray, "access")) {
        doc.insert("output", output);
    }
    doc.insert("timestamp", true);
    doc.into_value()
}

/// Xray spells a disabled log file as `"none"`.
fn log_file<'a>(log: &'a Document, key: &str) -> Option<&'a str> {
    log.non_empty_str(key).filter(|f| *f != "none")
}

fn log_to_xray(log: &Value) -> Value {
    let Some(singbox) = Document::from_section(Some(log)) else {
        return log.clone();
    };
    let mut doc = Document::new();
    if let Some(level) = singbox.str("level") {
        doc.insert("loglevel", level_to_xray(level));
    }
    if let Some(output) = singbox.str("output") {
        doc.insert("access", output);
    }
    if let Some(error) = singbox.str("error") {
        doc.insert("error", error);
    }
    doc.into_value()
}

fn outbound_to_xray(outbound: &mut Document) {
    let strategy = outbound
        .get("domain_strategy")
        .filter(|s| s.is_string())
        .cloned();
    if let Some(strategy) = strategy {
        outbound.remove("domain_strategy");
        if outbound.object("settings").is_none() {
            outbound.insert("settings", serde_json::Map::new());
        }
        if let Some(settings) = outbound.object_mut("settings") {
            settings.insert("domainStrategy".to_string(), strategy);
        }
    }
    if outbound.str("type").is_some() {
        outbound.rename("type", "protocol");
    }
}
