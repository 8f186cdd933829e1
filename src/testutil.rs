//! Shared fixtures for unit tests: plain-TCP dialers, canned dialers and a
//! one-shot local HTTP responder.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

use crate::proxy::{ProxyDescriptor, ProxyKind, SecretConfig};
use crate::transport::{AdapterError, BoxedStream, ProxyAdapter, ProxyDialer, TransportError};

/// Dials targets directly over TCP; stands in for a tunnel in tests that
/// talk to local fixture servers.
pub struct TcpDialer;

#[async_trait]
impl ProxyDialer for TcpDialer {
    async fn dial(&self, host: &str, port: u16) -> io::Result<BoxedStream> {
        let stream = TcpStream::connect((host, port)).await?;
        Ok(Box::new(stream))
    }
}

/// Dialer whose every operation fails immediately.
pub struct FailingDialer;

#[async_trait]
impl ProxyDialer for FailingDialer {
    async fn dial(&self, _host: &str, _port: u16) -> io::Result<BoxedStream> {
        Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
    }

    async fn url_test(
        &self,
        _url: &str,
        _expected: &[u16],
        _timeout: Duration,
    ) -> Result<u16, TransportError> {
        Err(TransportError::Io(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "refused",
        )))
    }
}

/// Dialer with a canned url_test delay; dial connects directly so HTTP
/// fixtures keep working. Counts url_test invocations.
pub struct CannedDialer {
    pub delay: u16,
    pub url_tests: AtomicUsize,
}

impl CannedDialer {
    pub fn new(delay: u16) -> Self {
        CannedDialer {
            delay,
            url_tests: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ProxyDialer for CannedDialer {
    async fn dial(&self, host: &str, port: u16) -> io::Result<BoxedStream> {
        // Only literal IPs: tests must never leave the machine or touch DNS.
        if host.parse::<std::net::IpAddr>().is_err() {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "non-local host refused in tests",
            ));
        }
        let stream = TcpStream::connect((host, port)).await?;
        Ok(Box::new(stream))
    }

    async fn url_test(
        &self,
        _url: &str,
        _expected: &[u16],
        _timeout: Duration,
    ) -> Result<u16, TransportError> {
        self.url_tests.fetch_add(1, Ordering::Relaxed);
        if self.delay == 0 {
            return Err(TransportError::Timeout);
        }
        Ok(self.delay)
    }
}

/// Adapter handing out one shared dialer for every tunnel kind.
pub struct MockAdapter {
    dialer: Arc<dyn ProxyDialer>,
}

impl MockAdapter {
    pub fn new(dialer: Arc<dyn ProxyDialer>) -> Self {
        MockAdapter { dialer }
    }

    /// Adapter whose dialers connect directly over TCP.
    pub fn alive() -> Self {
        Self::new(Arc::new(TcpDialer))
    }

    pub fn failing() -> Self {
        Self::new(Arc::new(FailingDialer))
    }
}

impl ProxyAdapter for MockAdapter {
    fn parse(
        &self,
        _kind: ProxyKind,
        _config: &SecretConfig,
    ) -> Result<Arc<dyn ProxyDialer>, AdapterError> {
        Ok(self.dialer.clone())
    }
}

/// Build a shadowsocks-shaped descriptor pointing at `address`.
pub fn descriptor(name: &str, address: &str, dialer: Arc<dyn ProxyDialer>) -> ProxyDescriptor {
    let (server, port) = address.rsplit_once(':').unwrap();
    let config = match json!({
        "name": name,
        "type": "ss",
        "server": server,
        "port": port.parse::<u16>().unwrap(),
        "cipher": "aes-128-gcm",
        "password": "secret",
    }) {
        serde_json::Value::Object(map) => map,
        _ => unreachable!(),
    };
    ProxyDescriptor {
        name: name.to_string(),
        kind: ProxyKind::Shadowsocks,
        address: address.to_string(),
        secret_config: config,
        dialer,
    }
}

/// Spawn a listener that answers every connection with `response` until the
/// test ends; returns its address.
pub async fn serve_once(response: &str) -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let response = response.to_string();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let response = response.clone();
            tokio::spawn(async move {
                // Swallow the request bytes, then answer and close.
                let mut buf = [0u8; 4096];
                use tokio::io::AsyncReadExt;
                let _ = socket.read(&mut buf).await;
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    addr
}

/// A liveness-style server: headers then `bytes` ASCII zeros, written in
/// chunks with a small delay so downloads take measurable time.
pub async fn serve_download(bytes: usize) -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                use tokio::io::AsyncReadExt;
                let _ = socket.read(&mut buf).await;
                let head =
                    format!("HTTP/1.1 200 OK\r\nContent-Length: {bytes}\r\nConnection: close\r\n\r\n");
                let _ = socket.write_all(head.as_bytes()).await;
                let chunk = vec![b'0'; 1024];
                let mut left = bytes;
                while left > 0 {
                    let n = left.min(chunk.len());
                    if socket.write_all(&chunk[..n]).await.is_err() {
                        break;
                    }
                    left -= n;
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                let _ = socket.shutdown().await;
            });
        }
    });
    addr
}
