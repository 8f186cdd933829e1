//! Netflix region check: a known title page answers 200 where the catalog
//! is served.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{tunnel_client, CheckError, CheckResult, CheckType, Checker, RETRY_BACKOFF};
use crate::requests::{self, rand_user_agent, RequestOption};
use crate::transport::ProxyDialer;

const TITLE_URL: &str = "https://www.netflix.com/sg/title/81498621";

pub(super) struct NetflixChecker;

#[async_trait]
impl Checker for NetflixChecker {
    async fn check(
        &self,
        cancel: &CancellationToken,
        dialer: &Arc<dyn ProxyDialer>,
    ) -> Result<CheckResult, CheckError> {
        let resp = requests::request(
            cancel,
            RequestOption {
                url: TITLE_URL.to_string(),
                headers: vec![("User-Agent".to_string(), rand_user_agent().to_string())],
                timeout: super::CHECK_TIMEOUT,
                retry_times: 2,
                retry_timeout: RETRY_BACKOFF,
                client: Some(tunnel_client(dialer)),
                ..Default::default()
            },
        )
        .await?;
        Ok(CheckResult::new(CheckType::Netflix, resp.status == 200, ""))
    }
}
