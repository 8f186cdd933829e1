//! Transport capability: dialing TCP through a proxy and speaking HTTP over
//! the dialed stream.
//!
//! The core never implements proxy protocols. It consumes two capabilities
//! per proxy: [`ProxyDialer::dial`] and [`ProxyDialer::url_test`], and an
//! adapter seam ([`ProxyAdapter`]) that turns a proxy mapping into a dialer.
//! A built-in adapter covers plain `http` and `socks5` tunnels so the
//! binaries work out of the box; richer protocol stacks are injected by the
//! embedding application.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::BytesMut;
use once_cell::sync::Lazy;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::proxy::{port_value, ProxyKind, SecretConfig};

/// Stream obtained from a dialer; TCP-like, already tunneled.
pub trait ProxyStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> ProxyStream for T {}

pub type BoxedStream = Box<dyn ProxyStream>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("tls error: {0}")]
    Tls(String),
    #[error("malformed http response: {0}")]
    Http(String),
    #[error("unexpected status {0}")]
    Status(u16),
    #[error("request timed out")]
    Timeout,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("missing field {0}")]
    MissingField(&'static str),
    #[error("no built-in dialer for proxy type {0}, inject a ProxyAdapter")]
    UnsupportedKind(ProxyKind),
    #[error("{0}")]
    Invalid(String),
}

/// Capability of one configured proxy: open tunneled connections and run
/// latency probes. Implementations come from the proxy-protocol layer.
#[async_trait]
pub trait ProxyDialer: Send + Sync {
    /// Open a stream to `host:port` through the tunnel.
    async fn dial(&self, host: &str, port: u16) -> io::Result<BoxedStream>;

    /// Fetch `url` through the tunnel and report the latency in
    /// milliseconds when the status is one of `expected`.
    async fn url_test(
        &self,
        url: &str,
        expected: &[u16],
        timeout: Duration,
    ) -> Result<u16, TransportError> {
        url_test_via(self, url, expected, timeout).await
    }
}

/// Builds a [`ProxyDialer`] from a clash-style proxy mapping. Parse errors
/// count the descriptor as invalid.
pub trait ProxyAdapter: Send + Sync {
    fn parse(&self, kind: ProxyKind, config: &SecretConfig) -> Result<Arc<dyn ProxyDialer>, AdapterError>;
}

// --- TLS ---

static TLS_CONFIG: Lazy<Arc<ClientConfig>> = Lazy::new(|| {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let mut cfg = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    // We only speak HTTP/1.1 over these streams.
    cfg.alpn_protocols = vec![b"http/1.1".to_vec()];
    Arc::new(cfg)
});

async fn maybe_tls(stream: BoxedStream, host: &str, https: bool) -> Result<BoxedStream, TransportError> {
    if !https {
        return Ok(stream);
    }
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| TransportError::Tls(format!("invalid server name {host}")))?;
    let connector = TlsConnector::from(TLS_CONFIG.clone());
    let tls = connector
        .connect(server_name, stream)
        .await
        .map_err(|e| TransportError::Tls(e.to_string()))?;
    Ok(Box::new(tls))
}

// --- URL parsing ---

/// Split an http(s) URL into host, port, TLS flag and path-with-query.
pub fn parse_test_url(url: &str) -> Result<(String, u16, bool, String), TransportError> {
    let (rest, https, default_port) = if let Some(r) = url.strip_prefix("https://") {
        (r, true, 443)
    } else if let Some(r) = url.strip_prefix("http://") {
        (r, false, 80)
    } else {
        return Err(TransportError::InvalidUrl(url.to_string()));
    };

    let (authority, path) = match rest.split_once('/') {
        Some((a, p)) => (a, format!("/{p}")),
        None => (rest, "/".to_string()),
    };
    let (host, port) = match authority.rsplit_once(':') {
        Some((h, p)) => (
            h,
            p.parse()
                .map_err(|_| TransportError::InvalidUrl(url.to_string()))?,
        ),
        None => (authority, default_port),
    };
    if host.is_empty() {
        return Err(TransportError::InvalidUrl(url.to_string()));
    }
    Ok((host.to_string(), port, https, path))
}

fn host_header(host: &str, port: u16, https: bool) -> String {
    let default = if https { 443 } else { 80 };
    if port == default {
        host.to_string()
    } else {
        format!("{host}:{port}")
    }
}

// --- HTTP over a dialed stream ---

/// Response head plus whatever body bytes arrived with it; the stream still
/// holds the remainder.
struct Inflight {
    status: u16,
    content_length: Option<u64>,
    chunked: bool,
    pre_body: Vec<u8>,
    stream: BoxedStream,
}

async fn send_request<D: ProxyDialer + ?Sized>(
    dialer: &D,
    method: &str,
    url: &str,
    headers: &[(String, String)],
    body: Option<&[u8]>,
) -> Result<Inflight, TransportError> {
    let (host, port, https, path) = parse_test_url(url)?;
    // Trim FQDN trailing dot before handing the name to the tunnel.
    let dial_host = host.trim_end_matches('.');

    let stream = dialer.dial(dial_host, port).await?;
    let mut stream = maybe_tls(stream, dial_host, https).await?;

    let mut req = format!("{method} {path} HTTP/1.1\r\nHost: {}\r\n", host_header(&host, port, https));
    for (k, v) in headers {
        req.push_str(&format!("{k}: {v}\r\n"));
    }
    if let Some(body) = body {
        req.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    req.push_str("Accept: */*\r\nConnection: close\r\n\r\n");

    stream.write_all(req.as_bytes()).await?;
    if let Some(body) = body {
        stream.write_all(body).await?;
    }

    // Read until the header terminator, keeping any body bytes that follow.
    let mut buf = BytesMut::with_capacity(4096);
    let mut tmp = [0u8; 4096];
    let head_end = loop {
        if let Some(pos) = find_head_end(&buf) {
            break pos;
        }
        let n = stream.read(&mut tmp).await?;
        if n == 0 {
            return Err(TransportError::Http("connection closed before headers".into()));
        }
        buf.extend_from_slice(&tmp[..n]);
    };

    let mut parsed = [httparse::EMPTY_HEADER; 64];
    let mut resp = httparse::Response::new(&mut parsed);
    resp.parse(&buf[..head_end])
        .map_err(|e| TransportError::Http(e.to_string()))?;
    let status = resp.code.ok_or_else(|| TransportError::Http("missing status".into()))?;

    let mut content_length = None;
    let mut chunked = false;
    for h in resp.headers.iter() {
        if h.name.eq_ignore_ascii_case("content-length") {
            content_length = std::str::from_utf8(h.value).ok().and_then(|v| v.trim().parse().ok());
        } else if h.name.eq_ignore_ascii_case("transfer-encoding") {
            chunked = std::str::from_utf8(h.value)
                .map(|v| v.to_ascii_lowercase().contains("chunked"))
                .unwrap_or(false);
        }
    }

    Ok(Inflight {
        status,
        content_length,
        chunked,
        pre_body: buf[head_end..].to_vec(),
        stream,
    })
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

impl Inflight {
    /// Read the remaining body to completion and dechunk if needed.
    async fn read_body(mut self) -> Result<Vec<u8>, TransportError> {
        let mut raw = self.pre_body;
        let mut tmp = [0u8; 8192];
        loop {
            if let Some(len) = self.content_length {
                if !self.chunked && raw.len() as u64 >= len {
                    raw.truncate(len as usize);
                    break;
                }
            }
            let n = self.stream.read(&mut tmp).await?;
            if n == 0 {
                break;
            }
            raw.extend_from_slice(&tmp[..n]);
        }
        if self.chunked {
            return dechunk(&raw);
        }
        Ok(raw)
    }

    /// Discard the body, counting raw bytes, until EOF, the expected length
    /// or the deadline. Bytes received before the deadline still count.
    async fn discard_body(mut self, deadline: Instant) -> u64 {
        let mut count = self.pre_body.len() as u64;
        let mut tmp = [0u8; 16 * 1024];
        loop {
            if let Some(len) = self.content_length {
                if !self.chunked && count >= len {
                    break;
                }
            }
            let Some(left) = deadline.checked_duration_since(Instant::now()).filter(|d| !d.is_zero()) else {
                break;
            };
            match tokio::time::timeout(left, self.stream.read(&mut tmp)).await {
                Ok(Ok(0)) | Ok(Err(_)) | Err(_) => break,
                Ok(Ok(n)) => count += n as u64,
            }
        }
        count
    }
}

/// Decode a chunked transfer-encoded body.
fn dechunk(raw: &[u8]) -> Result<Vec<u8>, TransportError> {
    let mut out = Vec::with_capacity(raw.len());
    let mut rest = raw;
    loop {
        let line_end = rest
            .windows(2)
            .position(|w| w == b"\r\n")
            .ok_or_else(|| TransportError::Http("truncated chunk size".into()))?;
        let size_str = std::str::from_utf8(&rest[..line_end])
            .map_err(|_| TransportError::Http("bad chunk size".into()))?;
        let size = usize::from_str_radix(size_str.trim().split(';').next().unwrap_or(""), 16)
            .map_err(|_| TransportError::Http("bad chunk size".into()))?;
        rest = &rest[line_end + 2..];
        if size == 0 {
            break;
        }
        if rest.len() < size {
            // Deadline cut the stream mid-chunk; keep what arrived.
            out.extend_from_slice(rest);
            break;
        }
        out.extend_from_slice(&rest[..size]);
        rest = &rest[size..];
        if rest.starts_with(b"\r\n") {
            rest = &rest[2..];
        }
    }
    Ok(out)
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// HTTP client whose every connection is dialed through one proxy. There is
/// no direct-TCP fallback.
#[derive(Clone)]
pub struct ProxyClient {
    dialer: Arc<dyn ProxyDialer>,
    timeout: Duration,
}

impl ProxyClient {
    pub fn new(dialer: Arc<dyn ProxyDialer>, timeout: Duration) -> Self {
        ProxyClient { dialer, timeout }
    }

    /// Issue a request and collect the full body. The whole exchange is
    /// bounded by the client timeout.
    pub async fn request(
        &self,
        method: &str,
        url: &str,
        headers: &[(String, String)],
        body: Option<&[u8]>,
    ) -> Result<HttpResponse, TransportError> {
        let fut = async {
            let inflight = send_request(self.dialer.as_ref(), method, url, headers, body).await?;
            let status = inflight.status;
            let body = inflight.read_body().await?;
            Ok(HttpResponse { status, body })
        };
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| TransportError::Timeout)?
    }

    /// GET `url` and discard the body while counting bytes.
    ///
    /// Returns the status, the time to header completion and the number of
    /// body bytes received before `deadline`. A deadline hit mid-body is not
    /// an error; the partial count stands.
    pub async fn get_counted(
        &self,
        url: &str,
        headers: &[(String, String)],
        deadline: Instant,
    ) -> Result<(u16, Duration, u64), TransportError> {
        let start = Instant::now();
        let head_budget = deadline.saturating_duration_since(start);
        let inflight = tokio::time::timeout(
            head_budget,
            send_request(self.dialer.as_ref(), "GET", url, headers, None),
        )
        .await
        .map_err(|_| TransportError::Timeout)??;
        let status = inflight.status;
        let ttfb = start.elapsed();
        let bytes = inflight.discard_body(deadline).await;
        Ok((status, ttfb, bytes))
    }
}

/// Default [`ProxyDialer::url_test`]: GET over a dialed stream, delay being
/// the time to a response head with an expected status. Sub-millisecond
/// round trips report 1 ms so success stays distinguishable from 0.
pub async fn url_test_via<D: ProxyDialer + ?Sized>(
    dialer: &D,
    url: &str,
    expected: &[u16],
    timeout: Duration,
) -> Result<u16, TransportError> {
    let start = Instant::now();
    let inflight = tokio::time::timeout(timeout, send_request(dialer, "GET", url, &[], None))
        .await
        .map_err(|_| TransportError::Timeout)??;
    if !expected.contains(&inflight.status) {
        return Err(TransportError::Status(inflight.status));
    }
    let ms = start.elapsed().as_millis().min(u16::MAX as u128) as u16;
    Ok(ms.max(1))
}

// --- Built-in dialers ---

/// Tunnel through an HTTP proxy with CONNECT.
pub struct HttpProxyDialer {
    server: String,
    port: u16,
    auth: Option<String>,
}

#[async_trait]
impl ProxyDialer for HttpProxyDialer {
    async fn dial(&self, host: &str, port: u16) -> io::Result<BoxedStream> {
        let mut stream = TcpStream::connect((self.server.as_str(), self.port)).await?;
        let mut connect = format!(
            "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\nProxy-Connection: Keep-Alive\r\n"
        );
        if let Some(auth) = &self.auth {
            connect.push_str(&format!("Proxy-Authorization: Basic {auth}\r\n"));
        }
        connect.push_str("\r\n");
        stream.write_all(connect.as_bytes()).await?;

        let mut buf = BytesMut::with_capacity(512);
        let mut tmp = [0u8; 512];
        loop {
            let n = stream.read(&mut tmp).await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "proxy closed during CONNECT",
                ));
            }
            buf.extend_from_slice(&tmp[..n]);
            if find_head_end(&buf).is_some() {
                break;
            }
        }
        let mut parsed = [httparse::EMPTY_HEADER; 16];
        let mut resp = httparse::Response::new(&mut parsed);
        resp.parse(&buf)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        match resp.code {
            Some(200) => Ok(Box::new(stream)),
            code => Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("CONNECT rejected: {code:?}"),
            )),
        }
    }
}

/// Tunnel through a SOCKS5 proxy.
pub struct Socks5Dialer {
    server: String,
    port: u16,
    username: Option<String>,
    password: Option<String>,
}

#[async_trait]
impl ProxyDialer for Socks5Dialer {
    async fn dial(&self, host: &str, port: u16) -> io::Result<BoxedStream> {
        let proxy = (self.server.as_str(), self.port);
        let target = (host, port);
        let stream = match (&self.username, &self.password) {
            (Some(user), Some(pass)) => {
                tokio_socks::tcp::Socks5Stream::connect_with_password(proxy, target, user, pass)
                    .await
            }
            _ => tokio_socks::tcp::Socks5Stream::connect(proxy, target).await,
        }
        .map_err(|e| io::Error::new(io::ErrorKind::ConnectionRefused, e.to_string()))?;
        Ok(Box::new(stream))
    }
}

/// Dialer for pass-through kinds; never used by measurement, which gates
/// them out first.
pub struct NullDialer;

#[async_trait]
impl ProxyDialer for NullDialer {
    async fn dial(&self, _host: &str, _port: u16) -> io::Result<BoxedStream> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "proxy kind carries no traffic",
        ))
    }
}

/// Built-in adapter: native `http` and `socks5` tunnels, pass-through kinds,
/// and a parse error for everything that needs a real protocol stack.
#[derive(Default)]
pub struct DefaultAdapter;

impl ProxyAdapter for DefaultAdapter {
    fn parse(&self, kind: ProxyKind, config: &SecretConfig) -> Result<Arc<dyn ProxyDialer>, AdapterError> {
        if kind.is_pass_through() {
            return Ok(Arc::new(NullDialer));
        }
        let server = config
            .get("server")
            .and_then(Value::as_str)
            .ok_or(AdapterError::MissingField("server"))?
            .to_string();
        let port = port_value(config.get("port")).ok_or(AdapterError::MissingField("port"))?;
        let username = config.get("username").and_then(Value::as_str).map(String::from);
        let password = config.get("password").and_then(Value::as_str).map(String::from);
        match kind {
            ProxyKind::Http => {
                let auth = match (&username, &password) {
                    (Some(u), Some(p)) => Some(BASE64.encode(format!("{u}:{p}"))),
                    _ => None,
                };
                Ok(Arc::new(HttpProxyDialer { server, port, auth }))
            }
            ProxyKind::Socks5 => Ok(Arc::new(Socks5Dialer {
                server,
                port,
                username,
                password,
            })),
            other => Err(AdapterError::UnsupportedKind(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_test_url() {
        let (host, port, https, path) = parse_test_url("http://www.google.com/generate_204").unwrap();
        assert_eq!(host, "www.google.com");
        assert_eq!(port, 80);
        assert!(!https);
        assert_eq!(path, "/generate_204");

        let (host, port, https, path) = parse_test_url("https://example.com:8443/a?b=1").unwrap();
        assert_eq!(host, "example.com");
        assert_eq!(port, 8443);
        assert!(https);
        assert_eq!(path, "/a?b=1");

        assert!(parse_test_url("ftp://example.com").is_err());
        assert!(parse_test_url("https:///nohost").is_err());
    }

    #[test]
    fn test_host_header_elides_default_port() {
        assert_eq!(host_header("a.com", 443, true), "a.com");
        assert_eq!(host_header("a.com", 8443, true), "a.com:8443");
        assert_eq!(host_header("a.com", 80, false), "a.com");
    }

    #[test]
    fn test_dechunk() {
        let body = b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
        assert_eq!(dechunk(body).unwrap(), b"Wikipedia");
    }

    #[test]
    fn test_default_adapter_kinds() {
        let adapter = DefaultAdapter;
        let mut cfg = SecretConfig::new();
        cfg.insert("server".into(), serde_json::json!("127.0.0.1"));
        cfg.insert("port".into(), serde_json::json!(1080));

        assert!(adapter.parse(ProxyKind::Socks5, &cfg).is_ok());
        assert!(adapter.parse(ProxyKind::Http, &cfg).is_ok());
        assert!(adapter.parse(ProxyKind::Direct, &SecretConfig::new()).is_ok());
        assert!(matches!(
            adapter.parse(ProxyKind::Vmess, &cfg),
            Err(AdapterError::UnsupportedKind(_))
        ));
        assert!(matches!(
            adapter.parse(ProxyKind::Http, &SecretConfig::new()),
            Err(AdapterError::MissingField("server"))
        ));
    }

    #[tokio::test]
    async fn test_url_test_via_local_server() {
        use crate::testutil::{serve_once, TcpDialer};

        let addr = serve_once("HTTP/1.1 204 No Content\r\nContent-Length: 0\r\n\r\n").await;
        let dialer = TcpDialer;
        let url = format!("http://{addr}/generate_204");
        let delay = dialer
            .url_test(&url, &[200, 204], Duration::from_secs(2))
            .await
            .unwrap();
        assert!(delay >= 1);
    }

    #[tokio::test]
    async fn test_url_test_rejects_unexpected_status() {
        use crate::testutil::{serve_once, TcpDialer};

        let addr = serve_once("HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n").await;
        let url = format!("http://{addr}/");
        let err = TcpDialer
            .url_test(&url, &[200, 204], Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Status(403)));
    }

    #[tokio::test]
    async fn test_proxy_client_reads_body() {
        use crate::testutil::{serve_once, TcpDialer};

        let addr = serve_once("HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello").await;
        let client = ProxyClient::new(Arc::new(TcpDialer), Duration::from_secs(2));
        let resp = client
            .request("GET", &format!("http://{addr}/x"), &[], None)
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, b"hello");
    }

    #[tokio::test]
    async fn test_get_counted_measures_body() {
        use crate::testutil::{serve_once, TcpDialer};

        let body = "0".repeat(2048);
        let addr = serve_once(&format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        ))
        .await;
        let client = ProxyClient::new(Arc::new(TcpDialer), Duration::from_secs(2));
        let (status, ttfb, bytes) = client
            .get_counted(
                &format!("http://{addr}/__down?bytes=2048"),
                &[],
                Instant::now() + Duration::from_secs(2),
            )
            .await
            .unwrap();
        assert_eq!(status, 200);
        assert!(!ttfb.is_zero());
        assert_eq!(bytes, 2048);
    }
}
