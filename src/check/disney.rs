//! Disney+ region check.
//!
//! Three sequential steps, each consuming the previous step's token:
//! device assertion, token exchange, then a GraphQL session refresh whose
//! `extensions.sdk.session.inSupportedLocation` field carries the verdict.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::{tunnel_client, CheckError, CheckResult, CheckType, Checker, RETRY_BACKOFF, RETRY_TIMES};
use crate::requests::{self, rand_user_agent, RequestOption};
use crate::transport::{ProxyClient, ProxyDialer};

const DEVICE_URL: &str = "https://disney.api.edge.bamgrid.com/devices";
const TOKEN_URL: &str = "https://disney.api.edge.bamgrid.com/token";
const GRAPHQL_URL: &str = "https://disney.api.edge.bamgrid.com/graph/v1/device/graphql";

const ASSERTION_BODY: &str =
    r#"{"deviceFamily":"browser","applicationRuntime":"chrome","deviceProfile":"windows","attributes":{}}"#;
const TOKEN_BODY: &str = "grant_type=urn%3Aietf%3Aparams%3Aoauth%3Agrant-type%3Atoken-exchange&latitude=0&longitude=0&platform=browser&subject_token=DISNEYASSERTION&subject_token_type=urn%3Abamtech%3Aparams%3Aoauth%3Atoken-type%3Adevice";
const AUTH_BEARER: &str =
    "Bearer ZGlzbmV5JmJyb3dzZXImMS4wLjA.Cu56AgSfBTDag5NiRA81oLHkDZfu5L3CKadnefEAY84";

pub(super) struct DisneyChecker;

#[async_trait]
impl Checker for DisneyChecker {
    async fn check(
        &self,
        cancel: &CancellationToken,
        dialer: &Arc<dyn ProxyDialer>,
    ) -> Result<CheckResult, CheckError> {
        let client = tunnel_client(dialer);

        let assertion = fetch_assertion(cancel, &client).await?;
        let Some(refresh_token) = fetch_refresh_token(cancel, &client, &assertion).await? else {
            // forbidden-location or no token: region is blocked.
            return Ok(CheckResult::new(CheckType::Disney, false, ""));
        };
        let in_supported_location = fetch_region(cancel, &client, &refresh_token).await?;
        Ok(CheckResult::new(CheckType::Disney, in_supported_location, ""))
    }
}

async fn fetch_assertion(
    cancel: &CancellationToken,
    client: &Arc<ProxyClient>,
) -> Result<String, CheckError> {
    let resp = requests::request(
        cancel,
        RequestOption {
            method: "POST".to_string(),
            url: DEVICE_URL.to_string(),
            body: Some(ASSERTION_BODY.as_bytes().to_vec()),
            headers: vec![
                ("User-Agent".to_string(), rand_user_agent().to_string()),
                ("Authorization".to_string(), AUTH_BEARER.to_string()),
                ("Content-Type".to_string(), "application/json".to_string()),
            ],
            timeout: super::CHECK_TIMEOUT,
            retry_times: RETRY_TIMES,
            retry_timeout: RETRY_BACKOFF,
            client: Some(client.clone()),
            ..Default::default()
        },
    )
    .await?;

    let data: Value = serde_json::from_slice(&resp.body)?;
    data.get("assertion")
        .and_then(Value::as_str)
        .map(String::from)
        .ok_or_else(|| CheckError::Protocol("device response carries no assertion".into()))
}

async fn fetch_refresh_token(
    cancel: &CancellationToken,
    client: &Arc<ProxyClient>,
    assertion: &str,
) -> Result<Option<String>, CheckError> {
    let body = TOKEN_BODY.replacen("DISNEYASSERTION", assertion, 1);
    let resp = requests::request(
        cancel,
        RequestOption {
            method: "POST".to_string(),
            url: TOKEN_URL.to_string(),
            body: Some(body.into_bytes()),
            headers: vec![
                ("User-Agent".to_string(), rand_user_agent().to_string()),
                ("Authorization".to_string(), AUTH_BEARER.to_string()),
                (
                    "Content-Type".to_string(),
                    "application/x-www-form-urlencoded".to_string(),
                ),
            ],
            timeout: super::CHECK_TIMEOUT,
            retry_times: RETRY_TIMES,
            retry_timeout: RETRY_BACKOFF,
            client: Some(client.clone()),
            ..Default::default()
        },
    )
    .await?;

    let data: Value = serde_json::from_slice(&resp.body)?;
    if data.get("error_description").and_then(Value::as_str) == Some("forbidden-location") {
        return Ok(None);
    }
    Ok(data
        .get("refresh_token")
        .and_then(Value::as_str)
        .map(String::from))
}

async fn fetch_region(
    cancel: &CancellationToken,
    client: &Arc<ProxyClient>,
    refresh_token: &str,
) -> Result<bool, CheckError> {
    let query = format!(
        r#"{{"query":"mutation refreshToken($input: RefreshTokenInput!) {{refreshToken(refreshToken: $input) {{activeSession {{sessionId}}}}}}","variables":{{"input":{{"refreshToken":"{refresh_token}"}}}}}}"#
    );
    let resp = requests::request(
        cancel,
        RequestOption {
            method: "POST".to_string(),
            url: GRAPHQL_URL.to_string(),
            body: Some(query.into_bytes()),
            headers: vec![
                ("User-Agent".to_string(), rand_user_agent().to_string()),
                ("Authorization".to_string(), AUTH_BEARER.to_string()),
            ],
            timeout: super::CHECK_TIMEOUT,
            retry_times: 1,
            retry_timeout: RETRY_BACKOFF,
            client: Some(client.clone()),
            ..Default::default()
        },
    )
    .await?;

    let data: Value = serde_json::from_slice(&resp.body)?;
    Ok(data
        .pointer("/extensions/sdk/session/inSupportedLocation")
        .and_then(Value::as_bool)
        .unwrap_or(false))
}
