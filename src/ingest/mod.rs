//! Streaming ingestion of configuration sources.
//!
//! A source spec is a `|`-delimited list of local paths or http(s) URLs.
//! Every source is read in parallel; structured documents may reference
//! nested providers, which are fetched recursively. Parsed descriptors are
//! emitted onto a bounded channel as soon as they exist, so measurement
//! overlaps with ingestion. Source-level failures are reported on the error
//! channel and do not stop the run.

pub mod convert;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use url::Url;

use crate::options::cpu_count;
use crate::proxy::ProxyDescriptor;
use crate::requests::{self, RequestError, RequestOption};
use crate::scheduler::Counters;
use crate::transport::ProxyAdapter;

use self::convert::ConvertError;

/// Providers may not take this name; it is reserved by the proxy runtime.
pub const RESERVED_PROVIDER_NAME: &str = "default";

const FETCH_TIMEOUT: Duration = Duration::from_secs(20);
const FETCH_RETRIES: u32 = 3;
const FETCH_BACKOFF: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("fetch {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: RequestError,
    },
    #[error("fetch {url}: status code {status}")]
    Status { url: String, status: u16 },
    #[error("read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error(transparent)]
    Convert(#[from] ConvertError),
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    proxies: Vec<serde_yaml::Value>,
    #[serde(rename = "proxy-providers", default)]
    providers: HashMap<String, ProviderConfig>,
}

#[derive(Debug, Deserialize)]
struct ProviderConfig {
    url: String,
}

/// Receivers handed to the scheduler; both close once every source and every
/// transitively referenced provider has been drained.
pub struct IngestHandle {
    pub proxies: mpsc::Receiver<ProxyDescriptor>,
    pub errors: mpsc::Receiver<IngestError>,
}

struct Ingestor {
    adapter: Arc<dyn ProxyAdapter>,
    proxy_url: Option<Url>,
    counters: Arc<Counters>,
    tx: mpsc::Sender<ProxyDescriptor>,
    err_tx: mpsc::Sender<IngestError>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

/// Start reading `config_path` in the background.
pub fn start(
    config_path: &str,
    proxy_url: Option<Url>,
    adapter: Arc<dyn ProxyAdapter>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
) -> IngestHandle {
    let (tx, proxies) = mpsc::channel(cpu_count() * 10);
    let (err_tx, errors) = mpsc::channel(1);

    let ingestor = Arc::new(Ingestor {
        adapter,
        proxy_url,
        counters,
        tx,
        err_tx,
        tracker: TaskTracker::new(),
        cancel,
    });

    for fragment in config_path.split('|') {
        spawn_source(&ingestor, fragment.to_string());
    }

    // Close the channels once every reader, including providers spawned
    // along the way, has finished: the tracker is the WaitGroup here.
    let tracker = ingestor.tracker.clone();
    tokio::spawn(async move {
        tracker.close();
        tracker.wait().await;
        drop(ingestor);
    });

    IngestHandle { proxies, errors }
}

fn spawn_source(ing: &Arc<Ingestor>, source: String) {
    let me = ing.clone();
    ing.tracker.spawn(async move {
        read_source(&me, &source).await;
    });
}

async fn read_source(ing: &Arc<Ingestor>, source: &str) {
    let body = if source.starts_with("http") {
        match ing.fetch(source).await {
            Ok(body) => body,
            Err(err) => {
                tracing::warn!("Ingest: failed to fetch config {source}: {err}");
                let _ = ing.err_tx.send(err).await;
                return;
            }
        }
    } else {
        match tokio::fs::read(source).await {
            Ok(body) => body,
            Err(err) => {
                tracing::warn!("Ingest: failed to read local file {source}: {err}");
                let _ = ing
                    .err_tx
                    .send(IngestError::Read {
                        path: source.to_string(),
                        source: err,
                    })
                    .await;
                return;
            }
        }
    };

    load_document(ing, &body).await;
}

/// Dispatch a source body by format: documents carrying the `server` token
/// are clash configs, everything else is a subscription payload.
async fn load_document(ing: &Arc<Ingestor>, body: &[u8]) {
    if !contains_token(body, b"server") {
        let text = String::from_utf8_lossy(body);
        match convert::parse_subscription(&text) {
            Ok(configs) => {
                ing.counters.add_total(configs.len());
                for config in configs {
                    ing.emit(serde_json::Value::Object(config)).await;
                }
            }
            Err(err) => {
                let _ = ing.err_tx.send(err.into()).await;
            }
        }
        return;
    }

    // Accept both a full clash document and the bare proxy sequence our own
    // YAML export writes.
    let raw: RawConfig = match serde_yaml::from_slice(body) {
        Ok(raw) => raw,
        Err(doc_err) => match serde_yaml::from_slice::<Vec<serde_yaml::Value>>(body) {
            Ok(proxies) => RawConfig {
                proxies,
                providers: HashMap::new(),
            },
            Err(_) => {
                let _ = ing.err_tx.send(doc_err.into()).await;
                return;
            }
        },
    };

    ing.counters.add_total(raw.proxies.len());
    for value in raw.proxies {
        match serde_json::to_value(value) {
            Ok(json) => ing.emit(json).await,
            Err(err) => {
                ing.counters.mark_invalid_proxy();
                tracing::warn!("Ingest: proxy entry is not convertible: {err}");
            }
        }
    }

    for (name, provider) in raw.providers {
        if name == RESERVED_PROVIDER_NAME {
            tracing::warn!("Ingest: provider may not be called `{RESERVED_PROVIDER_NAME}`");
            ing.counters.add_invalid(1);
            continue;
        }
        spawn_source(ing, provider.url);
    }
}

impl Ingestor {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, IngestError> {
        let resp = requests::request(
            &self.cancel,
            RequestOption {
                url: url.to_string(),
                headers: vec![("User-Agent".to_string(), "clash-meta".to_string())],
                timeout: FETCH_TIMEOUT,
                retry_times: FETCH_RETRIES,
                retry_timeout: FETCH_BACKOFF,
                proxy_url: self.proxy_url.clone(),
                insecure_skip_verify: true,
                ..Default::default()
            },
        )
        .await
        .map_err(|source| IngestError::Fetch {
            url: url.to_string(),
            source,
        })?;

        if resp.status != 200 {
            return Err(IngestError::Status {
                url: url.to_string(),
                status: resp.status,
            });
        }
        Ok(resp.body)
    }

    /// Parse one proxy mapping and push the descriptor downstream. The send
    /// blocks when the channel is full, back-pressuring this reader.
    async fn emit(&self, value: serde_json::Value) {
        let serde_json::Value::Object(config) = value else {
            self.counters.mark_invalid_proxy();
            tracing::warn!("Ingest: proxy entry is not a mapping");
            return;
        };
        let descriptor = match ProxyDescriptor::from_mapping(config, self.adapter.as_ref()) {
            Ok(d) => d,
            Err(err) => {
                self.counters.mark_invalid_proxy();
                tracing::warn!("Ingest: parse proxy failed: {err}");
                return;
            }
        };

        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = self.tx.send(descriptor) => {}
        }
    }
}

fn contains_token(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}
