//! Per-inbound field mapping between Xray and sing-box

use serde_json::{Map, Value};

use crate::common::Document;
use crate::core::{SingBoxInbound, XrayInbound};

use super::sanitize::TRANSPORT_TYPES;

/// Inbound types sing-box can run
pub const SINGBOX_INBOUND_TYPES: [&str; 17] = [
    "direct",
    "mixed",
    "socks",
    "http",
    "shadowsocks",
    "vmess",
    "trojan",
    "naive",
    "hysteria",
    "shadowtls",
    "tuic",
    "hysteria2",
    "vless",
    "anytls",
    "tun",
    "redirect",
    "tproxy",
];

/// Convert an Xray inbound. `None` when sing-box has no such inbound type.
pub fn xray_inbound_to_singbox(inbound: &XrayInbound) -> Option<SingBoxInbound> {
    if !SINGBOX_INBOUND_TYPES.contains(&inbound.protocol.as_str()) {
        return None;
    }

    let mut out = SingBoxInbound {
        kind: inbound.protocol.clone(),
        tag: inbound.tag.clone(),
        listen: inbound
            .listen_str()
            .filter(|l| !l.is_empty())
            .map(Value::from),
        listen_port: inbound.port_number().unwrap_or(0),
        ..Default::default()
    };

    if let Some(settings) = inbound.settings_doc() {
        users_to_singbox(&settings, &mut out);
    }
    if let Some(stream) = inbound.stream_doc() {
        out.transport = transport_to_singbox(&stream).map(Value::from);
        out.tls = security_to_singbox(&stream).map(Value::from);
    }
    if let Some(sniffing) = Document::from_section(inbound.sniffing.as_ref()) {
        out.sniff = sniffing.bool("enabled").unwrap_or(false);
        out.sniff_override_destination = sniffing
            .array("destOverride")
            .is_some_and(|targets| !targets.is_empty());
    }
    Some(out)
}

/// Convert one Xray client entry into a sing-box user of the same protocol.
pub fn client_to_singbox(protocol: &str, client: &Value) -> Value {
    let mut settings = Document::new();
    settings.insert("clients", Value::Array(vec![client.clone()]));
    let mut out = SingBoxInbound {
        kind: protocol.to_string(),
        ..Default::default()
    };
    users_to_singbox(&settings, &mut out);
    if let Some(user) = out.user_list().into_iter().next() {
        return user;
    }

    let Some(client) = Document::from_value(client.clone()) else {
        return client.clone();
    };
    let mut user = Document::new();
    if let Some(email) = client.non_empty_str("email") {
        user.insert("name", email);
    }
    if let Some(password) = client.non_empty_str("password") {
        user.insert("password", password);
    }
    user.into_value()
}

fn client_docs(settings: &Document) -> Vec<Document> {
    settings
        .array("clients")
        .map(|clients| {
            clients
                .iter()
                .filter_map(|c| Document::from_value(c.clone()))
                .collect()
        })
        .unwrap_or_default()
}

fn users_to_singbox(settings: &Document, out: &mut SingBoxInbound) {
    let clients = client_docs(settings);
    match out.kind.as_str() {
        "vmess" | "vless" => {
            let named = out.kind == "vless";
            let users: Vec<Value> = clients
                .iter()
                .map(|client| {
                    let mut user = Document::new();
                    if let Some(id) = client.str("id") {
                        user.insert("uuid", id);
                    }
                    if named {
                        if let Some(email) = client.non_empty_str("email") {
                            user.insert("name", email);
                        }
                    }
                    if let Some(flow) = client.non_empty_str("flow") {
                        user.insert("flow", flow);
                    }
                    user.into_value()
                })
                .collect();
            if !users.is_empty() {
                out.users = Some(Value::Array(users));
            }
        }
        "trojan" => {
            let users: Vec<Value> = clients
                .iter()
                .filter_map(|client| {
                    let password = client.str("password")?;
                    let mut user = Document::new();
                    if let Some(email) = client.non_empty_str("email") {
                        user.insert("name", email);
                    }
                    user.insert("password", password);
                    Some(user.into_value())
                })
                .collect();
            if !users.is_empty() {
                out.users = Some(Value::Array(users));
            }
        }
        "shadowsocks" => {
            if let Some(method) = settings.str("method") {
                out.method = method.to_string();
            }
            let password = settings
                .non_empty_str("password")
                .or_else(|| clients.first().and_then(|c| c.non_empty_str("password")));
            if let Some(password) = password {
                out.password = password.to_string();
            }
        }
        _ => {}
    }
}

fn transport_to_singbox(stream: &Document) -> Option<Document> {
    let network = stream.non_empty_str("network")?;
    if network == "tcp" || network == "raw" || !TRANSPORT_TYPES.contains(&network) {
        return None;
    }

    let mut transport = Document::new();
    transport.insert("type", network);
    match network {
        "ws" => {
            if let Some(ws) = stream.doc("wsSettings") {
                if let Some(path) = ws.get("path") {
                    transport.insert("path", path.clone());
                }
                if let Some(headers) = ws.object("headers") {
                    transport.insert("headers", headers.clone());
                }
            }
        }
        "httpupgrade" => {
            if let Some(upgrade) = stream.doc("httpupgradeSettings") {
                for key in ["path", "host"] {
                    if let Some(value) = upgrade.get(key) {
                        transport.insert(key, value.clone());
                    }
                }
            }
        }
        "grpc" => {
            if let Some(grpc) = stream.doc("grpcSettings") {
                if let Some(name) = grpc.get("serviceName") {
                    transport.insert("service_name", name.clone());
                }
            }
        }
        _ => {}
    }
    Some(transport)
}

fn security_to_singbox(stream: &Document) -> Option<Document> {
    match stream.str("security")? {
        "tls" => stream.doc("tlsSettings").map(|tls| tls_to_singbox(&tls)),
        "reality" => stream.doc("realitySettings").map(|r| reality_to_singbox(&r)),
        _ => None,
    }
}

fn tls_to_singbox(settings: &Document) -> Document {
    // certificate paths sit at the top level or in the first `certificates` entry
    let certificate = settings
        .array("certificates")
        .and_then(|certs| certs.first())
        .and_then(|c| Document::from_value(c.clone()));
    let path_of = |key: &str| {
        settings
            .non_empty_str(key)
            .or_else(|| certificate.as_ref().and_then(|c| c.non_empty_str(key)))
            .map(str::to_string)
    };

    let mut tls = Document::new();
    tls.insert("enabled", true);
    if let Some(cert) = path_of("certificateFile") {
        tls.insert("certificate_path", cert);
    }
    if let Some(key) = path_of("keyFile") {
        tls.insert("key_path", key);
    }
    if let Some(name) = settings.str("serverName") {
        tls.insert("server_name", name);
    }
    if let Some(alpn) = settings.array("alpn") {
        tls.insert("alpn", alpn.clone());
    }
    tls
}

fn reality_to_singbox(settings: &Document) -> Document {
    let server = settings
        .non_empty_str("dest")
        .map(str::to_string)
        .or_else(|| settings.string_list("serverNames").into_iter().next());

    let mut reality = Document::new();
    reality.insert("enabled", true);
    if let Some(server) = &server {
        let mut handshake = Map::new();
        handshake.insert("server".to_string(), Value::from(server.as_str()));
        reality.insert("handshake", handshake);
    }
    if let Some(key) = settings.str("privateKey") {
        reality.insert("private_key", key);
    }
    let short_ids = settings.scalar_list("shortIds");
    if !short_ids.is_empty() {
        reality.insert("short_id", short_ids);
    }
    if let Some(ms) = settings.i64("maxTimeDiff").filter(|ms| *ms > 0) {
        reality.insert("max_time_difference", format!("{}ms", ms));
    }

    let mut tls = Document::new();
    tls.insert("enabled", true);
    if let Some(server) = server {
        tls.insert("server_name", server);
    }
    tls.insert("reality", reality);
    tls
}

/// Convert a sing-box inbound back to Xray's shape.
pub fn singbox_inbound_to_xray(inbound: &SingBoxInbound) -> XrayInbound {
    let mut out = XrayInbound {
        protocol: inbound.kind.clone(),
        tag: inbound.tag.clone(),
        listen: inbound.listen.clone().filter(|l| !l.is_null()),
        port: (inbound.listen_port > 0).then(|| Value::from(inbound.listen_port)),
        settings: Some(users_to_xray(inbound).into_value()),
        ..Default::default()
    };

    let mut stream = Document::new();
    if let Some(transport) = inbound.transport_doc() {
        transport_to_xray(&transport, &mut stream);
    }
    if let Some(tls) = inbound.tls_doc() {
        tls_to_xray(&tls, &mut stream);
    }
    if !stream.is_empty() {
        out.stream_settings = Some(stream.into_value());
    }

    if inbound.sniff {
        let mut sniffing = Document::new();
        sniffing.insert("enabled", true);
        if inbound.sniff_override_destination {
            sniffing.insert("destOverride", vec!["http", "tls"]);
        }
        out.sniffing = Some(sniffing.into_value());
    }
    out
}

fn users_to_xray(inbound: &SingBoxInbound) -> Document {
    let users: Vec<Document> = inbound
        .user_list()
        .into_iter()
        .filter_map(Document::from_value)
        .collect();

    let mut settings = Document::new();
    match inbound.kind.as_str() {
        "vmess" | "vless" => {
            if inbound.users.is_some() {
                let clients: Vec<Value> = users
                    .iter()
                    .map(|user| {
                        let mut client = Document::new();
                        if let Some(uuid) = user.str("uuid") {
                            client.insert("id", uuid);
                        }
                        let email = user
                            .non_empty_str("name")
                            .or_else(|| user.non_empty_str("email"));
                        if let Some(email) = email {
                            client.insert("email", email);
                        }
                        if let Some(flow) = user.non_empty_str("flow") {
                            client.insert("flow", flow);
                        }
                        client.into_value()
                    })
                    .collect();
                settings.insert("clients", clients);
            }
            if inbound.kind == "vless" {
                settings.insert("decryption", "none");
            }
        }
        "trojan" => {
            let mut clients: Vec<Value> = users
                .iter()
                .filter_map(|user| {
                    let mut client = Document::new();
                    client.insert("password", user.str("password")?);
                    if let Some(name) = user.non_empty_str("name") {
                        client.insert("email", name);
                    }
                    Some(client.into_value())
                })
                .collect();
            if clients.is_empty() && !inbound.password.is_empty() {
                let mut client = Document::new();
                client.insert("password", inbound.password.as_str());
                clients.push(client.into_value());
            }
            if !clients.is_empty() {
                settings.insert("clients", clients);
            }
        }
        "shadowsocks" => {
            if !inbound.method.is_empty() {
                settings.insert("method", inbound.method.as_str());
            }
            if !inbound.password.is_empty() {
                settings.insert("password", inbound.password.as_str());
            }
        }
        _ => {}
    }
    settings
}

fn transport_to_xray(transport: &Document, stream: &mut Document) {
    let Some(network) = transport.str("type") else {
        return;
    };
    stream.insert("network", network);
    match network {
        "ws" => {
            let mut ws = Document::new();
            if let Some(path) = transport.str("path") {
                ws.insert("path", path);
            }
            if let Some(headers) = transport.object("headers") {
                ws.insert("headers", headers.clone());
            }
            stream.insert("wsSettings", ws);
        }
        "httpupgrade" => {
            let mut upgrade = Document::new();
            for key in ["path", "host"] {
                if let Some(value) = transport.str(key) {
                    upgrade.insert(key, value);
                }
            }
            stream.insert("httpupgradeSettings", upgrade);
        }
        "grpc" => {
            let mut grpc = Document::new();
            if let Some(name) = transport.str("service_name") {
                grpc.insert("serviceName", name);
            }
            stream.insert("grpcSettings", grpc);
        }
        _ => {}
    }
}

fn tls_to_xray(tls: &Document, stream: &mut Document) {
    let server_name = tls.str("server_name");

    if let Some(reality) = tls.doc("reality") {
        let mut settings = Document::new();
        if let Some(name) = server_name {
            settings.insert("dest", name);
            settings.insert("serverNames", vec![name]);
        }
        if let Some(key) = reality.str("private_key") {
            settings.insert("privateKey", key);
        }
        let short_ids = match reality.get("short_id") {
            Some(Value::String(id)) => vec![id.clone()],
            Some(id @ Value::Number(_)) => vec![id.to_string()],
            _ => reality.scalar_list("short_id"),
        };
        if !short_ids.is_empty() {
            settings.insert("shortIds", short_ids);
        }
        stream.insert("security", "reality");
        stream.insert("realitySettings", settings);
        return;
    }

    let mut settings = Document::new();
    if let Some(cert) = tls.str("certificate_path") {
        settings.insert("certificateFile", cert);
    }
    if let Some(key) = tls.str("key_path") {
        settings.insert("keyFile", key);
    }
    if let Some(name) = server_name {
        settings.insert("serverName", name);
    }
    if let Some(alpn) = tls.array("alpn") {
        settings.insert("alpn", alpn.clone());
    }
    stream.insert("security", "tls");
    stream.insert("tlsSettings", settings);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn xray_inbound(value: Value) -> XrayInbound {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_client_to_singbox() {
        let client = json!({"id": "u1", "email": "a@x", "flow": "xtls-rprx-vision"});
        assert_eq!(
            client_to_singbox("vless", &client),
            json!({"uuid": "u1", "name": "a@x", "flow": "xtls-rprx-vision"})
        );
        assert_eq!(client_to_singbox("vmess", &client), json!({"uuid": "u1", "flow": "xtls-rprx-vision"}));
        assert_eq!(
            client_to_singbox("shadowsocks", &json!({"email": "s@x", "password": "p"})),
            json!({"name": "s@x", "password": "p"})
        );
    }

    #[test]
    fn test_unsupported_protocols_yield_nothing() {
        for protocol in ["tunnel", "dokodemo-door", "wireguard"] {
            let inbound = xray_inbound(json!({"protocol": protocol, "tag": "x", "port": 1}));
            assert!(xray_inbound_to_singbox(&inbound).is_none(), "{}", protocol);
        }
    }

    #[test]
    fn test_vmess_drops_email() {
        let inbound = xray_inbound(json!({
            "protocol": "vmess", "tag": "in-vmess", "port": 10086,
            "settings": {"clients": [{"id": "u1", "email": "a@x", "alterId": 0}]}
        }));
        let out = xray_inbound_to_singbox(&inbound).unwrap();
        assert_eq!(out.users, Some(json!([{"uuid": "u1"}])));
        assert_eq!(out.listen_port, 10086);
        assert!(out.listen.is_none());
    }

    #[test]
    fn test_trojan_and_shadowsocks_credentials() {
        let trojan = xray_inbound(json!({
            "protocol": "trojan", "tag": "t", "port": 443,
            "settings": {"clients": [{"password": "p1", "email": "a@x"}, {"password": "p2"}]}
        }));
        let out = xray_inbound_to_singbox(&trojan).unwrap();
        assert_eq!(
            out.users,
            Some(json!([{"name": "a@x", "password": "p1"}, {"password": "p2"}]))
        );
        let back = singbox_inbound_to_xray(&out);
        assert_eq!(
            back.settings,
            Some(json!({"clients": [{"password": "p1", "email": "a@x"}, {"password": "p2"}]}))
        );

        let ss = xray_inbound(json!({
            "protocol": "shadowsocks", "tag": "s", "port": 8388,
            "settings": {"method": "aes-256-gcm", "clients": [{"password": "secret"}]}
        }));
        let out = xray_inbound_to_singbox(&ss).unwrap();
        assert_eq!((out.method.as_str(), out.password.as_str()), ("aes-256-gcm", "secret"));
    }

    #[test]
    fn test_tls_from_certificates_list() {
        let inbound = xray_inbound(json!({
            "protocol": "vless", "tag": "v", "port": 443,
            "streamSettings": {
                "network": "ws", "security": "tls",
                "wsSettings": {"path": "/ray", "headers": {"Host": "example.com"}},
                "tlsSettings": {"serverName": "example.com", "alpn": ["h2"],
                                "certificates": [{"certificateFile": "/c.pem", "keyFile": "/k.pem"}]}
            }
        }));
        let out = xray_inbound_to_singbox(&inbound).unwrap();
        assert_eq!(
            out.transport,
            Some(json!({"type": "ws", "path": "/ray", "headers": {"Host": "example.com"}}))
        );
        assert_eq!(
            out.tls,
            Some(json!({"enabled": true, "certificate_path": "/c.pem", "key_path": "/k.pem",
                        "server_name": "example.com", "alpn": ["h2"]}))
        );
    }

    #[test]
    fn test_unknown_network_has_no_transport() {
        let inbound = xray_inbound(json!({
            "protocol": "vless", "tag": "v", "port": 443,
            "streamSettings": {"network": "kcp", "security": "none"}
        }));
        let out = xray_inbound_to_singbox(&inbound).unwrap();
        assert!(out.transport.is_none());
        assert!(out.tls.is_none());
    }

    #[test]
    fn test_singbox_to_xray_stream_and_sniffing() {
        let inbound: SingBoxInbound = serde_json::from_value(json!({
            "type": "vless", "tag": "v", "listen": null, "listen_port": 443,
            "users": [{"uuid": "u1", "name": "a@x", "flow": "xtls-rprx-vision"}],
            "transport": {"type": "grpc", "service_name": "svc"},
            "tls": {"enabled": true, "server_name": "example.com",
                    "reality": {"enabled": true, "private_key": "pk", "short_id": "01"}},
            "sniff": true, "sniff_override_destination": true
        }))
        .unwrap();

        let out = singbox_inbound_to_xray(&inbound);
        assert!(out.listen.is_none());
        assert_eq!(out.port, Some(json!(443)));
        assert_eq!(
            out.settings,
            Some(json!({"clients": [{"id": "u1", "email": "a@x", "flow": "xtls-rprx-vision"}],
                        "decryption": "none"}))
        );
        assert_eq!(
            out.stream_settings,
            Some(json!({
                "network": "grpc",
                "grpcSettings": {"serviceName": "svc"},
                "security": "reality",
                "realitySettings": {"dest": "example.com", "serverNames": ["example.com"],
                                    "privateKey": "pk", "shortIds": ["01"]}
            }))
        );
        assert_eq!(
            out.sniffing,
            Some(json!({"enabled": true, "destOverride": ["http", "tls"]}))
        );
    }

    #[test]
    fn test_numeric_short_ids_survive() {
        let inbound = xray_inbound(json!({
            "tag": "reality", "port": 443, "protocol": "vless",
            "settings": {"clients": [], "decryption": "none"},
            "streamSettings": {
                "network": "tcp", "security": "reality",
                "realitySettings": {"dest": "example.com:443", "privateKey": "pk",
                                    "shortIds": [1234, "01", null, true]}
            }
        }));
        let out = xray_inbound_to_singbox(&inbound).unwrap();
        let tls = out.tls.clone().unwrap();
        assert_eq!(tls["reality"]["short_id"], json!(["1234", "01", "true"]));

        let mut back = out.clone();
        back.tls = Some(json!({"enabled": true, "server_name": "example.com",
                               "reality": {"enabled": true, "short_id": 5678}}));
        let stream = singbox_inbound_to_xray(&back).stream_settings.unwrap();
        assert_eq!(stream["realitySettings"]["shortIds"], json!(["5678"]));
    }
}
