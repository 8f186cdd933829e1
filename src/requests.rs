//! Retrying HTTP request engine.
//!
//! Every probe goes through [`request`]: direct (optionally via an upstream
//! proxy) with reqwest, or through a tunnel with a [`ProxyClient`]. Retries
//! back off and respect cancellation between attempts.

use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::transport::{HttpResponse, ProxyClient, TransportError};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request cancelled")]
    Cancelled,
    #[error("encode body: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Tunnel(#[from] TransportError),
    #[error("invalid upstream proxy: {0}")]
    Proxy(String),
}

/// One request. Unset fields fall back to GET / 5 s / no retries.
#[derive(Clone, Default)]
pub struct RequestOption {
    pub method: String,
    pub url: String,
    pub body: Option<Vec<u8>>,
    /// When set, serialized over `body` with `Content-Type: application/json`.
    pub json: Option<serde_json::Value>,
    pub headers: Vec<(String, String)>,
    pub timeout: Duration,
    pub retry_times: u32,
    /// Initial backoff between retries; grows by one second per attempt.
    pub retry_timeout: Duration,
    /// Log a curl equivalent of the request.
    pub verbose: bool,
    /// Upstream proxy for direct requests.
    pub proxy_url: Option<Url>,
    pub insecure_skip_verify: bool,
    /// Tunnel client; `None` sends directly.
    pub client: Option<Arc<ProxyClient>>,
}

fn normalize(option: &mut RequestOption) -> Result<(), RequestError> {
    if option.method.is_empty() {
        option.method = "GET".to_string();
    }
    if let Some(json) = option.json.take() {
        option.body = Some(serde_json::to_vec(&json)?);
        option
            .headers
            .push(("Content-Type".to_string(), "application/json".to_string()));
    }
    if option.timeout.is_zero() {
        option.timeout = DEFAULT_TIMEOUT;
    }
    Ok(())
}

async fn send_once(option: &RequestOption) -> Result<HttpResponse, RequestError> {
    if option.verbose {
        tracing::debug!("Requests: {}", curl_line(option));
    }
    if let Some(client) = &option.client {
        let resp = client
            .request(
                &option.method,
                &option.url,
                &option.headers,
                option.body.as_deref(),
            )
            .await?;
        return Ok(resp);
    }

    let mut builder = reqwest::Client::builder().timeout(option.timeout);
    if option.insecure_skip_verify {
        builder = builder.danger_accept_invalid_certs(true);
    }
    if let Some(proxy) = &option.proxy_url {
        let proxy =
            reqwest::Proxy::all(proxy.as_str()).map_err(|e| RequestError::Proxy(e.to_string()))?;
        builder = builder.proxy(proxy);
    }
    let client = builder.build()?;

    let method = reqwest::Method::from_bytes(option.method.as_bytes())
        .map_err(|_| RequestError::Proxy(format!("invalid method {}", option.method)))?;
    let mut req = client.request(method, &option.url);
    for (k, v) in &option.headers {
        req = req.header(k, v);
    }
    if let Some(body) = &option.body {
        req = req.body(body.clone());
    }
    let resp = req.send().await?;
    let status = resp.status().as_u16();
    let body = resp.bytes().await?.to_vec();
    Ok(HttpResponse { status, body })
}

/// Send with retries. A failed attempt is retried `retry_times` times with a
/// growing backoff; cancellation is honored between attempts.
pub async fn request(
    cancel: &CancellationToken,
    mut option: RequestOption,
) -> Result<HttpResponse, RequestError> {
    normalize(&mut option)?;

    let attempt = |opt: RequestOption| async move {
        tokio::select! {
            _ = cancel.cancelled() => Err(RequestError::Cancelled),
            r = send_once(&opt) => r,
        }
    };

    let mut result = attempt(option.clone()).await;
    if option.retry_times > 0 && result.is_err() {
        let mut backoff = if option.retry_timeout.is_zero() {
            DEFAULT_RETRY_BACKOFF
        } else {
            option.retry_timeout
        };
        for _ in 0..option.retry_times {
            if cancel.is_cancelled() {
                return Err(RequestError::Cancelled);
            }
            tokio::time::sleep(backoff).await;
            backoff += Duration::from_secs(1);
            result = attempt(option.clone()).await;
            if result.is_ok() {
                break;
            }
        }
    }
    result
}

fn curl_line(option: &RequestOption) -> String {
    let mut curl = format!("curl -X {} '{}'", option.method, option.url);
    for (k, v) in &option.headers {
        curl.push_str(&format!(" -H '{k}: {v}'"));
    }
    if let Some(body) = &option.body {
        curl.push_str(&format!(" -d '{}'", String::from_utf8_lossy(body)));
    }
    curl
}

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 17_4 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Mobile/15E148 Safari/604.1",
];

/// A randomized browser User-Agent.
pub fn rand_user_agent() -> &'static str {
    USER_AGENTS
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(USER_AGENTS[0])
}
