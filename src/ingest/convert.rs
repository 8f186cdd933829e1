//! Subscription conversion: base64 payloads or `scheme://` URI lines into
//! clash-style proxy mappings.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::proxy::SecretConfig;

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("subscription body is not valid base64 or uri lines")]
    Undecodable,
    #[error("subscription contains no usable proxies")]
    Empty,
}

/// Convert a plain subscription body. Bodies already containing URI lines
/// are used as-is; anything else is treated as a base64 payload.
pub fn parse_subscription(body: &str) -> Result<Vec<SecretConfig>, ConvertError> {
    let text = if body.contains("://") {
        body.to_string()
    } else {
        let decoded = decode_base64(body).ok_or(ConvertError::Undecodable)?;
        String::from_utf8(decoded).map_err(|_| ConvertError::Undecodable)?
    };

    let mut proxies = Vec::new();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        match parse_uri(line) {
            Some(config) => proxies.push(config),
            None => tracing::debug!("Convert: skipping unsupported line {line}"),
        }
    }
    if proxies.is_empty() {
        return Err(ConvertError::Empty);
    }
    Ok(proxies)
}

/// Forgiving base64: strips whitespace, tries standard then URL-safe
/// alphabets, tolerates missing padding.
pub(crate) fn decode_base64(input: &str) -> Option<Vec<u8>> {
    let compact: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    let unpadded = compact.trim_end_matches('=');
    STANDARD
        .decode(&compact)
        .or_else(|_| STANDARD.decode(format!("{}{}", unpadded, "=".repeat((4 - unpadded.len() % 4) % 4))))
        .or_else(|_| URL_SAFE_NO_PAD.decode(unpadded))
        .ok()
}

/// Parse one share URI into a proxy mapping; unknown schemes yield `None`.
pub fn parse_uri(uri: &str) -> Option<SecretConfig> {
    let uri = uri.trim();
    if uri.starts_with("ss://") {
        parse_ss(uri)
    } else if uri.starts_with("vmess://") {
        parse_vmess(uri)
    } else if uri.starts_with("vless://") {
        parse_vless(uri)
    } else if uri.starts_with("trojan://") {
        parse_trojan(uri)
    } else {
        None
    }
}

fn split_fragment(uri: &str) -> (&str, String) {
    match uri.rfind('#') {
        Some(idx) => {
            let name = urlencoding::decode(&uri[idx + 1..])
                .map(|s| s.into_owned())
                .unwrap_or_default();
            (&uri[..idx], name)
        }
        None => (uri, String::new()),
    }
}

fn named(name: String, server: &str, port: u16) -> String {
    if name.is_empty() {
        format!("{server}:{port}")
    } else {
        name
    }
}

fn to_map(value: Value) -> Option<SecretConfig> {
    match value {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

/// `ss://base64(method:password)@server:port#name`, userinfo optionally
/// plain text.
fn parse_ss(uri: &str) -> Option<SecretConfig> {
    let rest = uri.strip_prefix("ss://")?;
    let (main, name) = split_fragment(rest);

    let (userinfo, server_part) = main.split_once('@')?;
    let decoded = if userinfo.contains(':') {
        userinfo.to_string()
    } else {
        String::from_utf8(decode_base64(userinfo)?).ok()?
    };
    let (method, password) = decoded.split_once(':')?;
    let (server, port_str) = server_part.rsplit_once(':')?;
    let port: u16 = port_str.parse().ok()?;

    to_map(json!({
        "name": named(name, server, port),
        "type": "ss",
        "server": server,
        "port": port,
        "cipher": method,
        "password": password,
    }))
}

/// `vmess://base64(json)` with the fields v2ray clients export.
fn parse_vmess(uri: &str) -> Option<SecretConfig> {
    let rest = uri.strip_prefix("vmess://")?;
    let decoded = decode_base64(rest)?;
    let data: Value = serde_json::from_slice(&decoded).ok()?;
    let obj = data.as_object()?;

    let server = obj.get("add")?.as_str()?;
    let port = match obj.get("port")? {
        Value::String(s) => s.parse().ok()?,
        Value::Number(n) => u16::try_from(n.as_u64()?).ok()?,
        _ => return None,
    };
    let name = obj
        .get("ps")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let mut config = to_map(json!({
        "name": named(name, server, port),
        "type": "vmess",
        "server": server,
        "port": port,
        "uuid": obj.get("id")?.as_str()?,
        "alterId": obj.get("aid").and_then(alter_id).unwrap_or(0),
        "cipher": "auto",
        "tls": obj.get("tls").and_then(Value::as_str) == Some("tls"),
    }))?;

    if let Some(net) = obj.get("net").and_then(Value::as_str) {
        config.insert("network".into(), json!(net));
        if net == "ws" {
            let mut ws = Map::new();
            if let Some(path) = obj.get("path").and_then(Value::as_str) {
                ws.insert("path".into(), json!(path));
            }
            if let Some(host) = obj.get("host").and_then(Value::as_str) {
                ws.insert("headers".into(), json!({ "Host": host }));
            }
            config.insert("ws-opts".into(), Value::Object(ws));
        }
    }
    if let Some(sni) = obj.get("sni").and_then(Value::as_str) {
        config.insert("servername".into(), json!(sni));
    }
    Some(config)
}

fn alter_id(v: &Value) -> Option<u64> {
    match v {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// `vless://uuid@server:port?params#name`.
fn parse_vless(uri: &str) -> Option<SecretConfig> {
    let rest = uri.strip_prefix("vless://")?;
    let (main, name) = split_fragment(rest);

    let (main, params) = main.split_once('?').unwrap_or((main, ""));
    let (uuid, server_port) = main.split_once('@')?;
    let (server, port_str) = server_port.rsplit_once(':')?;
    let port: u16 = port_str.parse().ok()?;

    let mut config = to_map(json!({
        "name": named(name, server, port),
        "type": "vless",
        "server": server,
        "port": port,
        "uuid": uuid,
    }))?;
    apply_query_params(&mut config, params);
    Some(config)
}

/// `trojan://password@server:port?params#name`; trojan always runs TLS.
fn parse_trojan(uri: &str) -> Option<SecretConfig> {
    let rest = uri.strip_prefix("trojan://")?;
    let (main, name) = split_fragment(rest);

    let (main, params) = main.split_once('?').unwrap_or((main, ""));
    let (password, server_port) = main.split_once('@')?;
    let (server, port_str) = server_port.rsplit_once(':')?;
    let port: u16 = port_str.parse().ok()?;

    let mut config = to_map(json!({
        "name": named(name, server, port),
        "type": "trojan",
        "server": server,
        "port": port,
        "password": urlencoding::decode(password).map(|s| s.into_owned()).unwrap_or_default(),
    }))?;
    apply_query_params(&mut config, params);
    Some(config)
}

fn apply_query_params(config: &mut SecretConfig, params: &str) {
    for param in params.split('&').filter(|p| !p.is_empty()) {
        let Some((key, value)) = param.split_once('=') else {
            continue;
        };
        let value = urlencoding::decode(value)
            .map(|s| s.into_owned())
            .unwrap_or_default();
        match key {
            "type" => {
                config.insert("network".into(), json!(value));
            }
            "security" => {
                config.insert("tls".into(), json!(value == "tls"));
            }
            "sni" => {
                config.insert("sni".into(), json!(value));
            }
            "allowInsecure" => {
                config.insert("skip-cert-verify".into(), json!(value == "1"));
            }
            "path" | "host" | "serviceName" | "alpn" => {
                config.insert(key.into(), json!(value));
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;

    #[test]
    fn test_parse_ss_base64_userinfo() {
        let userinfo = STANDARD.encode("aes-256-gcm:secret");
        let uri = format!("ss://{userinfo}@1.2.3.4:8388#my%20node");
        let config = parse_uri(&uri).unwrap();
        assert_eq!(config["name"], "my node");
        assert_eq!(config["type"], "ss");
        assert_eq!(config["server"], "1.2.3.4");
        assert_eq!(config["port"], 8388);
        assert_eq!(config["cipher"], "aes-256-gcm");
        assert_eq!(config["password"], "secret");
    }

    #[test]
    fn test_parse_ss_plain_userinfo_without_name() {
        let config = parse_uri("ss://rc4-md5:pw@example.com:443").unwrap();
        assert_eq!(config["name"], "example.com:443");
    }

    #[test]
    fn test_parse_vmess() {
        let payload = serde_json::json!({
            "ps": "jp-1",
            "add": "jp.example.com",
            "port": "443",
            "id": "418048af-a293-4b99-9b0c-98ca3580dd24",
            "aid": "64",
            "net": "ws",
            "path": "/ray",
            "host": "cdn.example.com",
            "tls": "tls",
        });
        let uri = format!("vmess://{}", STANDARD.encode(payload.to_string()));
        let config = parse_uri(&uri).unwrap();
        assert_eq!(config["name"], "jp-1");
        assert_eq!(config["type"], "vmess");
        assert_eq!(config["port"], 443);
        assert_eq!(config["alterId"], 64);
        assert_eq!(config["tls"], true);
        assert_eq!(config["network"], "ws");
        assert_eq!(config["ws-opts"]["path"], "/ray");
    }

    #[test]
    fn test_parse_trojan_with_params() {
        let config =
            parse_uri("trojan://pass%40word@t.example.com:443?sni=cdn.example.com&allowInsecure=1#t1")
                .unwrap();
        assert_eq!(config["name"], "t1");
        assert_eq!(config["password"], "pass@word");
        assert_eq!(config["sni"], "cdn.example.com");
        assert_eq!(config["skip-cert-verify"], true);
    }

    #[test]
    fn test_parse_vless_query() {
        let config = parse_uri(
            "vless://uuid-1@v.example.com:8443?type=grpc&security=tls&serviceName=svc#v1",
        )
        .unwrap();
        assert_eq!(config["type"], "vless");
        assert_eq!(config["network"], "grpc");
        assert_eq!(config["tls"], true);
        assert_eq!(config["serviceName"], "svc");
    }

    #[test]
    fn test_parse_subscription_base64_payload() {
        let lines = "ss://cmM0LW1kNTpwdw==@a.example.com:8388#a\ntrojan://pw@b.example.com:443#b\n";
        let body = STANDARD.encode(lines);
        let proxies = parse_subscription(&body).unwrap();
        assert_eq!(proxies.len(), 2);
        assert_eq!(proxies[0]["name"], "a");
        assert_eq!(proxies[1]["name"], "b");
    }

    #[test]
    fn test_parse_subscription_uri_lines() {
        let body = "ss://rc4-md5:pw@a.example.com:8388#a\nwss://ignored\n";
        let proxies = parse_subscription(body).unwrap();
        assert_eq!(proxies.len(), 1);
    }

    #[test]
    fn test_parse_subscription_rejects_garbage() {
        assert!(matches!(
            parse_subscription("!!!not base64!!!"),
            Err(ConvertError::Undecodable)
        ));
        let empty = STANDARD.encode("nothing useful here\n");
        assert!(matches!(parse_subscription(&empty), Err(ConvertError::Empty)));
    }
}
