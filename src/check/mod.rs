//! Pluggable connectivity checks.
//!
//! Each [`Checker`] probes one service through a proxy and yields a typed
//! [`CheckResult`]. Dispatch is fan-out/fan-in; individual failures are
//! logged and reported as `{ok: false}` without failing the measurement.

mod country;
mod disney;
mod gemini;
mod gpt;
mod netflix;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::requests::RequestError;
use crate::transport::{ProxyClient, ProxyDialer};

pub(crate) const CHECK_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const RETRY_TIMES: u32 = 3;
pub(crate) const RETRY_BACKOFF: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckType {
    GptWeb,
    GptAndroid,
    GptIos,
    Disney,
    Netflix,
    Gemini,
    Country,
}

impl fmt::Display for CheckType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CheckType::GptWeb => "gpt_web",
            CheckType::GptAndroid => "gpt_android",
            CheckType::GptIos => "gpt_ios",
            CheckType::Disney => "disney",
            CheckType::Netflix => "netflix",
            CheckType::Gemini => "gemini",
            CheckType::Country => "country",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    #[serde(rename = "type")]
    pub kind: CheckType,
    pub ok: bool,
    pub value: String,
}

impl CheckResult {
    pub fn new(kind: CheckType, ok: bool, value: impl Into<String>) -> Self {
        CheckResult {
            kind,
            ok,
            value: value.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CheckError {
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error("decode response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("{0}")]
    Protocol(String),
}

/// One connectivity probe through a proxy.
#[async_trait]
pub trait Checker: Send + Sync {
    async fn check(
        &self,
        cancel: &CancellationToken,
        dialer: &Arc<dyn ProxyDialer>,
    ) -> Result<CheckResult, CheckError>;
}

static REGISTRY: Lazy<HashMap<CheckType, Box<dyn Checker>>> = Lazy::new(|| {
    let mut m: HashMap<CheckType, Box<dyn Checker>> = HashMap::new();
    m.insert(CheckType::Country, Box::new(country::CountryChecker));
    m.insert(CheckType::GptWeb, Box::new(gpt::GptWebChecker));
    m.insert(CheckType::GptAndroid, Box::new(gpt::GptMobileChecker::android()));
    m.insert(CheckType::GptIos, Box::new(gpt::GptMobileChecker::ios()));
    m.insert(CheckType::Disney, Box::new(disney::DisneyChecker));
    m.insert(CheckType::Netflix, Box::new(netflix::NetflixChecker));
    m.insert(CheckType::Gemini, Box::new(gemini::GeminiChecker));
    m
});

pub(crate) fn tunnel_client(dialer: &Arc<dyn ProxyDialer>) -> Arc<ProxyClient> {
    Arc::new(ProxyClient::new(dialer.clone(), CHECK_TIMEOUT))
}

/// Run the selected checks concurrently and collect their results. Unknown
/// types are dropped with a log line; errors become `{ok: false}`.
pub async fn run_checks(
    cancel: &CancellationToken,
    dialer: &Arc<dyn ProxyDialer>,
    types: &[CheckType],
) -> Vec<CheckResult> {
    let mut tasks = tokio::task::JoinSet::new();
    for kind in types.iter().copied() {
        let Some(checker) = REGISTRY.get(&kind) else {
            tracing::error!("Check: unsupported check type {kind}");
            continue;
        };
        let cancel = cancel.clone();
        let dialer = dialer.clone();
        tasks.spawn(async move {
            match checker.check(&cancel, &dialer).await {
                Ok(result) => result,
                Err(err) => {
                    tracing::info!("Check: {kind} failed: {err}");
                    CheckResult::new(kind, false, "")
                }
            }
        });
    }

    let mut results = Vec::with_capacity(types.len());
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(result) => results.push(result),
            Err(err) => tracing::error!("Check: task failed: {err}"),
        }
    }
    results
}
