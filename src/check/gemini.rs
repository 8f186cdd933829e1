//! Gemini availability check.
//!
//! The landing page embeds a marker in regions where the service answers.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{tunnel_client, CheckError, CheckResult, CheckType, Checker, RETRY_BACKOFF};
use crate::requests::{self, rand_user_agent, RequestOption};
use crate::transport::ProxyDialer;

const GEMINI_URL: &str = "https://gemini.google.com/";
const AVAILABLE_MARKER: &str = "45631641,null,true";

pub(super) struct GeminiChecker;

#[async_trait]
impl Checker for GeminiChecker {
    async fn check(
        &self,
        cancel: &CancellationToken,
        dialer: &Arc<dyn ProxyDialer>,
    ) -> Result<CheckResult, CheckError> {
        let resp = requests::request(
            cancel,
            RequestOption {
                url: GEMINI_URL.to_string(),
                headers: vec![("User-Agent".to_string(), rand_user_agent().to_string())],
                timeout: super::CHECK_TIMEOUT,
                retry_times: 2,
                retry_timeout: RETRY_BACKOFF,
                client: Some(tunnel_client(dialer)),
                ..Default::default()
            },
        )
        .await?;
        let ok = String::from_utf8_lossy(&resp.body).contains(AVAILABLE_MARKER);
        Ok(CheckResult::new(CheckType::Gemini, ok, ""))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{serve_once, TcpDialer};
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_marker_detection() {
        let body = format!("prefix [{AVAILABLE_MARKER}] suffix");
        let addr = serve_once(&format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        ))
        .await;
        // Exercise the body scan through a local fixture rather than the
        // real endpoint; the checker itself only differs in the URL.
        let client = super::tunnel_client(&(Arc::new(TcpDialer) as Arc<dyn ProxyDialer>));
        let resp = requests::request(
            &CancellationToken::new(),
            RequestOption {
                url: format!("http://{addr}/"),
                client: Some(client),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert!(String::from_utf8_lossy(&resp.body).contains(AVAILABLE_MARKER));
    }
}
