//! Proxy descriptors and measurement results.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::check::CheckResult;
use crate::options::serde_duration;
use crate::transport::{AdapterError, ProxyAdapter, ProxyDialer};

/// Secret configuration of a proxy: the original mapping as authored in the
/// user's configuration (credentials, cipher, TLS settings, ...).
pub type SecretConfig = Map<String, Value>;

/// Recognized proxy types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyKind {
    Shadowsocks,
    ShadowsocksR,
    Snell,
    Socks5,
    Http,
    Vmess,
    Vless,
    Trojan,
    Hysteria,
    Hysteria2,
    WireGuard,
    Tuic,
    // Pass-through kinds: valid configuration entries that are not tunnels
    // and are skipped by the measurement procedure.
    Direct,
    Reject,
    Relay,
    Selector,
    Fallback,
    UrlTest,
    LoadBalance,
}

impl ProxyKind {
    /// Parse a clash `type:` tag. Unrecognized tags yield `None` and count
    /// as invalid descriptors upstream.
    pub fn parse(tag: &str) -> Option<Self> {
        let kind = match tag {
            "ss" => ProxyKind::Shadowsocks,
            "ssr" => ProxyKind::ShadowsocksR,
            "snell" => ProxyKind::Snell,
            "socks5" => ProxyKind::Socks5,
            "http" => ProxyKind::Http,
            "vmess" => ProxyKind::Vmess,
            "vless" => ProxyKind::Vless,
            "trojan" => ProxyKind::Trojan,
            "hysteria" => ProxyKind::Hysteria,
            "hysteria2" => ProxyKind::Hysteria2,
            "wireguard" => ProxyKind::WireGuard,
            "tuic" => ProxyKind::Tuic,
            "direct" => ProxyKind::Direct,
            "reject" => ProxyKind::Reject,
            "relay" => ProxyKind::Relay,
            "select" | "selector" => ProxyKind::Selector,
            "fallback" => ProxyKind::Fallback,
            "url-test" | "urltest" => ProxyKind::UrlTest,
            "load-balance" => ProxyKind::LoadBalance,
            _ => return None,
        };
        Some(kind)
    }

    /// True for kinds that never carry traffic of their own and are skipped
    /// without emitting a result.
    pub fn is_pass_through(&self) -> bool {
        matches!(
            self,
            ProxyKind::Direct
                | ProxyKind::Reject
                | ProxyKind::Relay
                | ProxyKind::Selector
                | ProxyKind::Fallback
                | ProxyKind::UrlTest
                | ProxyKind::LoadBalance
        )
    }
}

impl fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProxyKind::Shadowsocks => "ss",
            ProxyKind::ShadowsocksR => "ssr",
            ProxyKind::Snell => "snell",
            ProxyKind::Socks5 => "socks5",
            ProxyKind::Http => "http",
            ProxyKind::Vmess => "vmess",
            ProxyKind::Vless => "vless",
            ProxyKind::Trojan => "trojan",
            ProxyKind::Hysteria => "hysteria",
            ProxyKind::Hysteria2 => "hysteria2",
            ProxyKind::WireGuard => "wireguard",
            ProxyKind::Tuic => "tuic",
            ProxyKind::Direct => "direct",
            ProxyKind::Reject => "reject",
            ProxyKind::Relay => "relay",
            ProxyKind::Selector => "selector",
            ProxyKind::Fallback => "fallback",
            ProxyKind::UrlTest => "url-test",
            ProxyKind::LoadBalance => "load-balance",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Error)]
pub enum ProxyParseError {
    #[error("proxy entry has no name")]
    MissingName,
    #[error("proxy {0} has no type")]
    MissingType(String),
    #[error("proxy {name} has unsupported type {tag}")]
    UnknownType { name: String, tag: String },
    #[error("proxy {0} has no server")]
    MissingServer(String),
    #[error("proxy {0} has no valid port")]
    MissingPort(String),
    #[error("adapter rejected proxy {name}: {source}")]
    Adapter {
        name: String,
        #[source]
        source: AdapterError,
    },
}

/// One proxy as produced by ingestion: parsed identity plus the dialer
/// capability built by the adapter. Exclusively owned by the worker that
/// measures it.
#[derive(Clone)]
pub struct ProxyDescriptor {
    pub name: String,
    pub kind: ProxyKind,
    /// `server:port` of the proxy endpoint; empty for pass-through kinds.
    pub address: String,
    pub secret_config: SecretConfig,
    pub dialer: Arc<dyn ProxyDialer>,
}

impl fmt::Debug for ProxyDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyDescriptor")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("address", &self.address)
            .finish()
    }
}

impl ProxyDescriptor {
    /// Build a descriptor from a clash-style proxy mapping, delegating
    /// dialer construction to the adapter.
    pub fn from_mapping(
        config: SecretConfig,
        adapter: &dyn ProxyAdapter,
    ) -> Result<Self, ProxyParseError> {
        let name = config
            .get("name")
            .and_then(Value::as_str)
            .ok_or(ProxyParseError::MissingName)?
            .to_string();
        let tag = config
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ProxyParseError::MissingType(name.clone()))?;
        let kind = ProxyKind::parse(tag).ok_or_else(|| ProxyParseError::UnknownType {
            name: name.clone(),
            tag: tag.to_string(),
        })?;

        let address = if kind.is_pass_through() {
            String::new()
        } else {
            let server = config
                .get("server")
                .and_then(Value::as_str)
                .ok_or_else(|| ProxyParseError::MissingServer(name.clone()))?;
            let port = port_value(config.get("port"))
                .ok_or_else(|| ProxyParseError::MissingPort(name.clone()))?;
            format!("{server}:{port}")
        };

        let dialer = adapter
            .parse(kind, &config)
            .map_err(|source| ProxyParseError::Adapter {
                name: name.clone(),
                source,
            })?;

        Ok(ProxyDescriptor {
            name,
            kind,
            address,
            secret_config: config,
            dialer,
        })
    }
}

/// Port fields appear as numbers or strings depending on the source format.
pub(crate) fn port_value(v: Option<&Value>) -> Option<u16> {
    match v? {
        Value::Number(n) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Measurements for one proxy.
///
/// `bandwidth` is in kilobits per second; `delay` is the minimum latency in
/// milliseconds with 0 meaning unavailable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyResult {
    pub name: String,
    pub bandwidth: f64,
    #[serde(rename = "TTFB", with = "serde_duration::millis")]
    pub ttfb: Duration,
    pub delay: u16,
    pub country: String,
    pub check_results: Vec<CheckResult>,
    pub url_for_test: std::collections::HashMap<String, bool>,
}

impl ProxyResult {
    /// A result carrying only the name; `alive()` is false.
    pub fn named(name: impl Into<String>) -> Self {
        ProxyResult {
            name: name.into(),
            ..Default::default()
        }
    }

    /// A proxy is alive when any latency probe succeeded or the bandwidth
    /// stage produced data.
    pub fn alive(&self) -> bool {
        self.delay > 0 || (self.bandwidth > 0.0 && !self.ttfb.is_zero())
    }

    pub fn formatted_bandwidth(&self) -> String {
        let mut v = self.bandwidth;
        if v <= 0.0 {
            return "N/A".into();
        }
        for unit in ["B/s", "KB/s", "MB/s", "GB/s"] {
            if v < 1024.0 {
                return format!("{v:.2}{unit}");
            }
            v /= 1024.0;
        }
        format!("{v:.2}TB/s")
    }

    pub fn formatted_ttfb(&self) -> String {
        if self.ttfb.is_zero() {
            return "N/A".into();
        }
        format!("{:.2}ms", self.ttfb.as_millis() as f64)
    }
}

/// A measured proxy: the result together with the secret configuration it
/// was produced from. This is the cache value and the export unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasuredProxy {
    pub result: ProxyResult,
    pub secret_config: SecretConfig,
}

impl MeasuredProxy {
    pub fn alive(&self) -> bool {
        self.result.alive()
    }
}

static EMOJI: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        "[\\x{1F600}-\\x{1F64F}\\x{1F300}-\\x{1F5FF}\\x{1F680}-\\x{1F6FF}\\x{2600}-\\x{26FF}\\x{1F1E0}-\\x{1F1FF}]",
    )
    .unwrap()
});
static SPACES: Lazy<Regex> = Lazy::new(|| Regex::new("\\s{2,}").unwrap());

/// Strip emoji and collapse runs of whitespace for table display.
pub fn format_name(name: &str) -> String {
    let no_emoji = EMOJI.replace_all(name, "");
    SPACES.replace_all(&no_emoji, " ").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alive_predicate() {
        let mut r = ProxyResult::named("a");
        assert!(!r.alive());

        r.delay = 12;
        assert!(r.alive());

        let mut r = ProxyResult::named("b");
        r.bandwidth = 1000.0;
        assert!(!r.alive(), "bandwidth without ttfb is not alive");
        r.ttfb = Duration::from_millis(80);
        assert!(r.alive());
    }

    #[test]
    fn test_kind_parse_and_gate() {
        assert_eq!(ProxyKind::parse("ss"), Some(ProxyKind::Shadowsocks));
        assert_eq!(ProxyKind::parse("vmess"), Some(ProxyKind::Vmess));
        assert_eq!(ProxyKind::parse("bogus"), None);
        assert!(ProxyKind::Direct.is_pass_through());
        assert!(ProxyKind::UrlTest.is_pass_through());
        assert!(!ProxyKind::Trojan.is_pass_through());
    }

    #[test]
    fn test_port_value_forms() {
        assert_eq!(port_value(Some(&serde_json::json!(8080))), Some(8080));
        assert_eq!(port_value(Some(&serde_json::json!("443"))), Some(443));
        assert_eq!(port_value(Some(&serde_json::json!(70000))), None);
        assert_eq!(port_value(None), None);
    }

    #[test]
    fn test_format_name() {
        assert_eq!(format_name("🇺🇸 US  node   1"), "US node 1");
        assert_eq!(format_name("plain"), "plain");
    }

    #[test]
    fn test_formatted_bandwidth_ladder() {
        let mut r = ProxyResult::named("x");
        assert_eq!(r.formatted_bandwidth(), "N/A");
        r.bandwidth = 512.0;
        assert_eq!(r.formatted_bandwidth(), "512.00B/s");
        r.bandwidth = 2048.0;
        assert_eq!(r.formatted_bandwidth(), "2.00KB/s");
        r.bandwidth = 3.0 * 1024.0 * 1024.0;
        assert_eq!(r.formatted_bandwidth(), "3.00MB/s");
    }

    #[test]
    fn test_formatted_ttfb_always_milliseconds() {
        let mut r = ProxyResult::named("x");
        assert_eq!(r.formatted_ttfb(), "N/A");
        r.ttfb = Duration::from_millis(80);
        assert_eq!(r.formatted_ttfb(), "80.00ms");
        r.ttfb = Duration::from_millis(5000);
        assert_eq!(r.formatted_ttfb(), "5000.00ms");
    }
}
