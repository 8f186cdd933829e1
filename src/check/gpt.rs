//! ChatGPT availability checks: web (trace country against the supported
//! list) and the Android/iOS gateway responses.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::country::fetch_trace_loc;
use super::{tunnel_client, CheckError, CheckResult, CheckType, Checker, RETRY_BACKOFF, RETRY_TIMES};
use crate::requests::{self, RequestOption};
use crate::transport::ProxyDialer;

const GPT_TRACE: &str = "https://chat.openai.com/cdn-cgi/trace";
const GPT_ANDROID: &str = "https://android.chat.openai.com";
const GPT_IOS: &str = "https://ios.chat.openai.com/";

/// The gateway reports a disallowed ISP with this prefix in `cf_details`.
const DISALLOWED_MSG: &str = "Something went wrong. You may be connected to a disallowed ISP. ";

const MOBILE_TIMEOUT: Duration = Duration::from_secs(60);

/// Countries where the service is offered.
const SUPPORTED_COUNTRIES: &[&str] = &[
    "AL", "DZ", "AF", "AD", "AO", "AG", "AR", "AM", "AU", "AT", "AZ", "BS", "BH", "BD", "BB",
    "BE", "BZ", "BJ", "BT", "BO", "BA", "BW", "BR", "BN", "BG", "BF", "BI", "CV", "KH", "CM",
    "CA", "CF", "TD", "CL", "CO", "KM", "CG", "CD", "CR", "CI", "HR", "CY", "CZ", "DK", "DJ",
    "DM", "DO", "EC", "EG", "SV", "GQ", "ER", "EE", "SZ", "ET", "FJ", "FI", "FR", "GA", "GM",
    "GE", "DE", "GH", "GR", "GD", "GT", "GN", "GW", "GY", "HT", "VA", "HN", "HU", "IS", "IN",
    "ID", "IQ", "IE", "IL", "IT", "JM", "JP", "JO", "KZ", "KE", "KI", "KW", "KG", "LA", "LV",
    "LB", "LS", "LR", "LY", "LI", "LT", "LU", "MG", "MW", "MY", "MV", "ML", "MT", "MH", "MR",
    "MU", "MX", "FM", "MD", "MC", "MN", "ME", "MA", "MZ", "MM", "NA", "NR", "NP", "NL", "NZ",
    "NI", "NE", "NG", "MK", "NO", "OM", "PK", "PW", "PS", "PA", "PG", "PY", "PE", "PH", "PL",
    "PT", "QA", "RO", "RW", "KN", "LC", "VC", "WS", "SM", "ST", "SA", "SN", "RS", "SC", "SL",
    "SG", "SK", "SI", "SB", "SO", "ZA", "KR", "SS", "ES", "LK", "SR", "SE", "CH", "SD", "TW",
    "TJ", "TZ", "TH", "TL", "TG", "TO", "TT", "TN", "TR", "TM", "TV", "UG", "UA", "AE", "GB",
    "US", "UY", "UZ", "VU", "VN", "YE", "ZM", "ZW",
];

pub(super) fn is_supported_country(loc: &str) -> bool {
    SUPPORTED_COUNTRIES.contains(&loc)
}

pub(super) struct GptWebChecker;

#[async_trait]
impl Checker for GptWebChecker {
    async fn check(
        &self,
        cancel: &CancellationToken,
        dialer: &Arc<dyn ProxyDialer>,
    ) -> Result<CheckResult, CheckError> {
        let loc = fetch_trace_loc(cancel, tunnel_client(dialer), GPT_TRACE).await?;
        Ok(CheckResult::new(
            CheckType::GptWeb,
            is_supported_country(&loc),
            loc,
        ))
    }
}

#[derive(Deserialize)]
struct GatewayResponse {
    #[serde(default)]
    cf_details: String,
}

pub(super) struct GptMobileChecker {
    kind: CheckType,
    url: &'static str,
}

impl GptMobileChecker {
    pub(super) fn android() -> Self {
        GptMobileChecker {
            kind: CheckType::GptAndroid,
            url: GPT_ANDROID,
        }
    }

    pub(super) fn ios() -> Self {
        GptMobileChecker {
            kind: CheckType::GptIos,
            url: GPT_IOS,
        }
    }
}

#[async_trait]
impl Checker for GptMobileChecker {
    async fn check(
        &self,
        cancel: &CancellationToken,
        dialer: &Arc<dyn ProxyDialer>,
    ) -> Result<CheckResult, CheckError> {
        // An allowed region answers with "Request is not allowed. Please try
        // again later."; the disallowed-ISP text means blocked.
        let resp = requests::request(
            cancel,
            RequestOption {
                method: "POST".to_string(),
                url: self.url.to_string(),
                headers: vec![("Content-Type".to_string(), "application/json".to_string())],
                timeout: MOBILE_TIMEOUT,
                retry_times: RETRY_TIMES,
                retry_timeout: RETRY_BACKOFF,
                client: Some(tunnel_client(dialer)),
                ..Default::default()
            },
        )
        .await?;
        let data: GatewayResponse = serde_json::from_slice(&resp.body)?;
        Ok(CheckResult::new(
            self.kind,
            !data.cf_details.contains(DISALLOWED_MSG),
            "",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supported_country_list() {
        assert!(is_supported_country("US"));
        assert!(is_supported_country("JP"));
        assert!(!is_supported_country("CN"));
        assert!(!is_supported_country(""));
    }

    #[test]
    fn test_gateway_response_detection() {
        let blocked: GatewayResponse = serde_json::from_str(
            r#"{"cf_details":"Something went wrong. You may be connected to a disallowed ISP. If you are using VPN, try disabling it."}"#,
        )
        .unwrap();
        assert!(blocked.cf_details.contains(DISALLOWED_MSG));

        let allowed: GatewayResponse = serde_json::from_str(
            r#"{"cf_details":"Request is not allowed. Please try again later.","type":"dc"}"#,
        )
        .unwrap();
        assert!(!allowed.cf_details.contains(DISALLOWED_MSG));
    }
}
