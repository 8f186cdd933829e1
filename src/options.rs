//! Run options and defaults.
//!
//! Library callers construct [`Options`] directly; the HTTP front-end
//! deserializes it from a JSON request body.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::ResultCache;
use crate::check::CheckType;
use crate::transport::ProxyAdapter;

/// Default liveness endpoint; `%d` is replaced with the byte count.
pub const DEFAULT_LIVENESS_ADDR: &str = "https://speed.cloudflare.com/__down?bytes=%d";

/// Default download size for the bandwidth stage (100 MiB).
pub const DEFAULT_DOWNLOAD_SIZE: u64 = 100 * 1024 * 1024;

/// Default per-proxy bandwidth timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Field the result list is ordered by before export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SortField {
    /// Descending by bandwidth.
    #[serde(rename = "b", alias = "bandwidth")]
    Bandwidth,
    /// Ascending by time-to-first-byte.
    #[serde(rename = "t", alias = "ttfb")]
    Ttfb,
    /// Keep insertion order.
    #[default]
    #[serde(rename = "", alias = "none")]
    None,
}

impl FromStr for SortField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "b" | "bandwidth" => Ok(SortField::Bandwidth),
            "t" | "ttfb" => Ok(SortField::Ttfb),
            "" => Ok(SortField::None),
            other => Err(format!("unsupported sort field: {other}")),
        }
    }
}

impl fmt::Display for SortField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortField::Bandwidth => write!(f, "bandwidth"),
            SortField::Ttfb => write!(f, "ttfb"),
            SortField::None => write!(f, ""),
        }
    }
}

/// Options for one measurement run.
///
/// `timeout` is (de)serialized as seconds. The `cache` and `adapter` handles
/// are process-local capabilities and never cross the wire.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Liveness URL template with a `%d` byte-count slot.
    pub liveness_addr: String,
    /// Bytes to download during the bandwidth stage.
    pub download_size: u64,
    /// Per-proxy bandwidth timeout, in seconds on the wire.
    #[serde(with = "serde_duration::secs")]
    pub timeout: Duration,
    /// Configuration sources, `|`-delimited paths or http(s) URLs. Required.
    pub config_path: String,
    /// Only measure proxies whose name matches this regex (empty = all).
    pub name_regex_contain: String,
    /// Skip proxies whose name matches this regex (empty = none).
    pub name_regex_not_contain: String,
    /// Result ordering applied before export.
    pub sort_field: SortField,
    /// URLs whose reachability is probed through each proxy.
    pub url_for_test: Vec<String>,
    /// Upstream proxy used for fetching remote configuration sources.
    pub proxy_url: String,
    /// Unlock checks to run against each alive proxy.
    pub check_types: Vec<CheckType>,
    /// Measurement worker cap, defaults to CPU count x 3.
    pub concurrent: usize,
    /// Result cache; defaults to the process-wide singleton.
    #[serde(skip)]
    pub cache: Option<Arc<dyn ResultCache>>,
    /// Proxy adapter building dialers from proxy mappings; defaults to the
    /// built-in http/socks5 adapter.
    #[serde(skip)]
    pub adapter: Option<Arc<dyn ProxyAdapter>>,
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("liveness_addr", &self.liveness_addr)
            .field("download_size", &self.download_size)
            .field("timeout", &self.timeout)
            .field("config_path", &self.config_path)
            .field("name_regex_contain", &self.name_regex_contain)
            .field("name_regex_not_contain", &self.name_regex_not_contain)
            .field("sort_field", &self.sort_field)
            .field("url_for_test", &self.url_for_test)
            .field("proxy_url", &self.proxy_url)
            .field("check_types", &self.check_types)
            .field("concurrent", &self.concurrent)
            .finish()
    }
}

impl Options {
    /// Fill unset fields with defaults. Fails when no configuration source
    /// is given.
    pub fn normalize(&mut self) -> Result<(), String> {
        if self.config_path.is_empty() {
            return Err("config path must not be empty".into());
        }
        if self.download_size == 0 {
            self.download_size = DEFAULT_DOWNLOAD_SIZE;
        }
        if self.timeout.is_zero() {
            self.timeout = DEFAULT_TIMEOUT;
        }
        if self.sort_field == SortField::None {
            self.sort_field = SortField::Bandwidth;
        }
        if self.liveness_addr.is_empty() {
            self.liveness_addr = DEFAULT_LIVENESS_ADDR.to_string();
        }
        if self.concurrent == 0 {
            self.concurrent = cpu_count() * 3;
        }
        Ok(())
    }
}

pub(crate) fn cpu_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Serde adapters for [`Duration`] fields.
pub(crate) mod serde_duration {
    pub mod secs {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
            s.serialize_f64(d.as_secs_f64())
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
            let secs = f64::deserialize(d)?;
            if !secs.is_finite() || secs < 0.0 {
                return Err(serde::de::Error::custom("invalid duration"));
            }
            Ok(Duration::from_secs_f64(secs))
        }
    }

    pub mod millis {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
            s.serialize_u64(d.as_millis() as u64)
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
            Ok(Duration::from_millis(u64::deserialize(d)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_defaults() {
        let mut opts = Options {
            config_path: "config.yaml".into(),
            ..Default::default()
        };
        opts.normalize().unwrap();
        assert_eq!(opts.liveness_addr, DEFAULT_LIVENESS_ADDR);
        assert_eq!(opts.download_size, DEFAULT_DOWNLOAD_SIZE);
        assert_eq!(opts.timeout, DEFAULT_TIMEOUT);
        assert_eq!(opts.sort_field, SortField::Bandwidth);
        assert!(opts.concurrent > 0);
    }

    #[test]
    fn test_normalize_rejects_empty_source() {
        let mut opts = Options::default();
        assert!(opts.normalize().is_err());
    }

    #[test]
    fn test_sort_field_parse() {
        assert_eq!("b".parse::<SortField>().unwrap(), SortField::Bandwidth);
        assert_eq!("bandwidth".parse::<SortField>().unwrap(), SortField::Bandwidth);
        assert_eq!("t".parse::<SortField>().unwrap(), SortField::Ttfb);
        assert_eq!("ttfb".parse::<SortField>().unwrap(), SortField::Ttfb);
        assert!("x".parse::<SortField>().is_err());
    }

    #[test]
    fn test_options_from_json_body() {
        let opts: Options = serde_json::from_str(
            r#"{"config_path":"a.yaml","timeout":3.5,"sort_field":"t","check_types":["country","gpt_web"]}"#,
        )
        .unwrap();
        assert_eq!(opts.config_path, "a.yaml");
        assert_eq!(opts.timeout, Duration::from_millis(3500));
        assert_eq!(opts.sort_field, SortField::Ttfb);
        assert_eq!(opts.check_types.len(), 2);
    }
}
