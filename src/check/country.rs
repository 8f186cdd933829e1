//! Country check via the cloudflare trace endpoint.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{tunnel_client, CheckError, CheckResult, CheckType, Checker, RETRY_BACKOFF, RETRY_TIMES};
use crate::requests::{self, rand_user_agent, RequestOption};
use crate::transport::{ProxyClient, ProxyDialer};

const CF_TRACE: &str = "https://www.cloudflare.com/cdn-cgi/trace";

/// Fetch a cdn-cgi/trace page and extract the `loc=` line.
pub(super) async fn fetch_trace_loc(
    cancel: &CancellationToken,
    client: Arc<ProxyClient>,
    url: &str,
) -> Result<String, CheckError> {
    let resp = requests::request(
        cancel,
        RequestOption {
            url: url.to_string(),
            headers: vec![("User-Agent".to_string(), rand_user_agent().to_string())],
            timeout: super::CHECK_TIMEOUT,
            retry_times: RETRY_TIMES,
            retry_timeout: RETRY_BACKOFF,
            client: Some(client),
            ..Default::default()
        },
    )
    .await?;

    let body = String::from_utf8_lossy(&resp.body);
    let loc = body
        .lines()
        .find_map(|line| line.strip_prefix("loc="))
        .unwrap_or("")
        .to_string();
    Ok(loc)
}

pub(super) struct CountryChecker;

#[async_trait]
impl Checker for CountryChecker {
    async fn check(
        &self,
        cancel: &CancellationToken,
        dialer: &Arc<dyn ProxyDialer>,
    ) -> Result<CheckResult, CheckError> {
        let loc = fetch_trace_loc(cancel, tunnel_client(dialer), CF_TRACE).await?;
        Ok(CheckResult::new(CheckType::Country, true, loc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{serve_once, TcpDialer};
    use std::time::Duration;

    #[tokio::test]
    async fn test_fetch_trace_loc_parses_loc_line() {
        let body = "fl=123\nip=1.2.3.4\nloc=SG\ncolo=SIN\n";
        let addr = serve_once(&format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        ))
        .await;
        let client = Arc::new(ProxyClient::new(
            Arc::new(TcpDialer),
            Duration::from_secs(2),
        ));
        let loc = fetch_trace_loc(
            &CancellationToken::new(),
            client,
            &format!("http://{addr}/cdn-cgi/trace"),
        )
        .await
        .unwrap();
        assert_eq!(loc, "SG");
    }
}
