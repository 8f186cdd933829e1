//! Per-proxy measurement procedure.
//!
//! Order matters: cache lookup, type gate, TCP reachability, bandwidth/TTFB,
//! then the concurrent sub-probes (country, selected checks, URL list,
//! delay). A proxy that fails an early stage yields a name-only result with
//! `alive() == false`; measurement itself never errors.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use crate::cache::ResultCache;
use crate::check::{self, CheckType};
use crate::options::Options;
use crate::proxy::{MeasuredProxy, ProxyDescriptor, ProxyResult};
use crate::requests::rand_user_agent;
use crate::transport::ProxyClient;

const DELAY_TEST_URL: &str = "https://cp.cloudflare.com/generate_204";
const EXPECTED_STATUS: &[u16] = &[200, 204];
const REACHABILITY_TIMEOUT: Duration = Duration::from_secs(2);
const URL_TRY_COUNT: usize = 3;

/// Measure one proxy. Pass-through kinds yield `None`; everything else
/// yields a result, cached under the descriptor's fingerprint.
pub async fn measure(
    cancel: &CancellationToken,
    descriptor: ProxyDescriptor,
    options: &Options,
    cache: &Arc<dyn ResultCache>,
) -> Option<MeasuredProxy> {
    let key = cache.generate_key(&descriptor);
    if let Some(hit) = cache.get(&key) {
        return Some(hit);
    }

    if descriptor.kind.is_pass_through() {
        return None;
    }

    let probe = ProxyProbe::new(&descriptor, options);
    let result = probe.run(cancel).await;

    let measured = MeasuredProxy {
        result,
        secret_config: descriptor.secret_config,
    };
    cache.set(&key, measured.clone());
    Some(measured)
}

struct UrlProbe {
    delay: u16,
    ok: bool,
}

struct ProxyProbe<'a> {
    name: String,
    address: String,
    options: &'a Options,
    descriptor: &'a ProxyDescriptor,
    client: ProxyClient,
}

impl<'a> ProxyProbe<'a> {
    fn new(descriptor: &'a ProxyDescriptor, options: &'a Options) -> Self {
        ProxyProbe {
            name: descriptor.name.clone(),
            address: descriptor.address.clone(),
            options,
            descriptor,
            client: ProxyClient::new(descriptor.dialer.clone(), options.timeout),
        }
    }

    async fn run(&self, cancel: &CancellationToken) -> ProxyResult {
        if !self.is_reachable().await {
            return ProxyResult::named(&self.name);
        }

        let (ttfb, bandwidth) = match self.test_bandwidth().await {
            Ok(measured) => measured,
            Err(err) => {
                tracing::debug!("Measure: [{}] bandwidth stage failed: {err}", self.name);
                return ProxyResult::named(&self.name);
            }
        };

        let mut country = String::new();
        let mut check_results = Vec::new();
        let mut url_results = HashMap::new();
        let mut delay = 0u16;

        if !ttfb.is_zero() && bandwidth > 0.0 {
            let country_probe = async {
                let r = check::run_checks(cancel, &self.descriptor.dialer, &[CheckType::Country]).await;
                r.into_iter().next().map(|c| c.value).unwrap_or_default()
            };
            let checks_probe =
                check::run_checks(cancel, &self.descriptor.dialer, &self.options.check_types);
            let urls_probe = self.test_urls_available(&self.options.url_for_test);
            let delay_probe = self.test_delay();

            let (c, cr, ur, d) =
                tokio::join!(country_probe, checks_probe, urls_probe, delay_probe);
            country = c;
            check_results = cr;
            url_results = ur;
            delay = d;
        }

        // Some proxies block the cloudflare trace but pass chat.openai:
        // borrow the country seen by the GPT web check.
        if country.is_empty() {
            if let Some(gpt) = check_results
                .iter()
                .find(|c| c.kind == CheckType::GptWeb)
            {
                country = gpt.value.clone();
            }
        }

        ProxyResult {
            name: self.name.clone(),
            bandwidth,
            ttfb,
            delay,
            country,
            check_results,
            url_for_test: url_results,
        }
    }

    /// A proxy whose own endpoint refuses TCP is dead; nothing else is
    /// worth probing.
    async fn is_reachable(&self) -> bool {
        matches!(
            tokio::time::timeout(
                REACHABILITY_TIMEOUT,
                tokio::net::TcpStream::connect(&self.address),
            )
            .await,
            Ok(Ok(_))
        )
    }

    /// Download the liveness object through the tunnel. TTFB is the time to
    /// header completion; bandwidth in Kbps comes from whatever body bytes
    /// arrive before the deadline. An empty body is a failure.
    async fn test_bandwidth(&self) -> Result<(Duration, f64), BandwidthError> {
        let url = self
            .options
            .liveness_addr
            .replacen("%d", &self.options.download_size.to_string(), 1);
        let start = Instant::now();
        let deadline = start + self.options.timeout;
        let headers = [("User-Agent".to_string(), rand_user_agent().to_string())];

        let (status, ttfb, bytes) = self
            .client
            .get_counted(&url, &headers, deadline)
            .await
            .map_err(|e| BandwidthError(e.to_string()))?;
        if i32::from(status) - 200 > 100 {
            return Err(BandwidthError(format!("status not ok: {status}")));
        }
        if bytes == 0 {
            return Err(BandwidthError("empty body".into()));
        }

        let download_time = start.elapsed().saturating_sub(ttfb);
        let secs = download_time.as_secs_f64();
        if secs <= 0.0 {
            return Err(BandwidthError("zero download window".into()));
        }
        let bandwidth = (bytes as f64 * 8.0) / secs / 1e3;
        Ok((ttfb, bandwidth))
    }

    /// Race `URL_TRY_COUNT` attempts; the reported delay is the minimum
    /// non-zero one, 0 when every attempt failed.
    async fn test_url(&self, url: &str) -> UrlProbe {
        let attempts = (0..URL_TRY_COUNT).map(|_| {
            let dialer = self.descriptor.dialer.clone();
            let url = url.to_string();
            let timeout = self.options.timeout;
            async move { dialer.url_test(&url, EXPECTED_STATUS, timeout).await }
        });

        let mut min_delay = u16::MAX;
        let mut ok = false;
        for outcome in join_all(attempts).await {
            match outcome {
                Ok(delay) => {
                    if delay > 0 {
                        ok = true;
                        min_delay = min_delay.min(delay);
                    }
                }
                Err(err) => {
                    tracing::debug!("Measure: [{}] url test {url} failed: {err}", self.name);
                }
            }
        }

        if min_delay == u16::MAX {
            UrlProbe { delay: 0, ok }
        } else {
            UrlProbe {
                delay: min_delay,
                ok,
            }
        }
    }

    async fn test_delay(&self) -> u16 {
        self.test_url(DELAY_TEST_URL).await.delay
    }

    async fn test_urls_available(&self, urls: &[String]) -> HashMap<String, bool> {
        if urls.is_empty() {
            return HashMap::new();
        }
        let probes = urls.iter().map(|url| async move {
            let probe = self.test_url(url).await;
            (url.clone(), probe.ok)
        });
        join_all(probes).await.into_iter().collect()
    }
}

#[derive(Debug)]
struct BandwidthError(String);

impl std::fmt::Display for BandwidthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::proxy::ProxyKind;
    use crate::testutil::{descriptor, serve_download, CannedDialer, FailingDialer, TcpDialer};

    fn test_options(liveness: &str) -> Options {
        let mut options = Options {
            config_path: "unused".into(),
            liveness_addr: liveness.to_string(),
            download_size: 64 * 1024,
            timeout: Duration::from_secs(2),
            ..Default::default()
        };
        options.normalize().unwrap();
        options
    }

    fn as_cache(cache: Arc<MemoryCache>) -> Arc<dyn ResultCache> {
        cache
    }

    #[tokio::test]
    async fn test_unreachable_proxy_yields_dead_result() {
        let options = test_options("http://127.0.0.1:1/__down?bytes=%d");
        let cache = as_cache(MemoryCache::with_ttl(Duration::from_secs(60)));
        // Port 1 refuses: the reachability gate trips before any probe.
        let d = descriptor("dead", "127.0.0.1:1", Arc::new(FailingDialer));
        let measured = measure(&CancellationToken::new(), d, &options, &cache)
            .await
            .unwrap();
        assert_eq!(measured.result.name, "dead");
        assert_eq!(measured.result.bandwidth, 0.0);
        assert_eq!(measured.result.delay, 0);
        assert!(!measured.alive());
    }

    #[tokio::test]
    async fn test_pass_through_kind_is_skipped() {
        let options = test_options("http://127.0.0.1:1/__down?bytes=%d");
        let cache = as_cache(MemoryCache::with_ttl(Duration::from_secs(60)));
        let mut d = descriptor("direct", "127.0.0.1:1", Arc::new(FailingDialer));
        d.kind = ProxyKind::Direct;
        assert!(measure(&CancellationToken::new(), d, &options, &cache)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_alive_measurement_with_local_download() {
        let addr = serve_download(64 * 1024).await;
        let options = test_options(&format!("http://{addr}/__down?bytes=%d"));
        let cache = as_cache(MemoryCache::with_ttl(Duration::from_secs(60)));
        let dialer = Arc::new(CannedDialer::new(40));
        let d = descriptor("fast", &addr.to_string(), dialer);

        let measured = measure(&CancellationToken::new(), d, &options, &cache)
            .await
            .unwrap();
        assert!(measured.result.bandwidth > 0.0);
        assert!(!measured.result.ttfb.is_zero());
        assert_eq!(measured.result.delay, 40);
        assert!(measured.alive());
    }

    #[tokio::test]
    async fn test_cache_hit_skips_second_measurement() {
        let addr = serve_download(16 * 1024).await;
        let options = test_options(&format!("http://{addr}/__down?bytes=%d"));
        let cache = as_cache(MemoryCache::with_ttl(Duration::from_secs(60)));

        let dialer = Arc::new(CannedDialer::new(25));
        let first = descriptor("first", &addr.to_string(), dialer.clone());
        let mut second = descriptor("second", &addr.to_string(), dialer.clone());
        // Same secrets, different display name: must share the cache entry.
        second.secret_config = first.secret_config.clone();
        second.name = "second".to_string();

        let cancel = CancellationToken::new();
        let a = measure(&cancel, first, &options, &cache).await.unwrap();
        let tests_after_first = dialer.url_tests.load(std::sync::atomic::Ordering::Relaxed);
        let b = measure(&cancel, second, &options, &cache).await.unwrap();
        let tests_after_second = dialer.url_tests.load(std::sync::atomic::Ordering::Relaxed);

        assert_eq!(a.result.name, b.result.name, "clone of the cached result");
        assert_eq!(
            tests_after_first, tests_after_second,
            "no new network round-trip on the cache hit"
        );
    }

    #[tokio::test]
    async fn test_delay_minimum_of_attempts() {
        let addr = serve_download(8 * 1024).await;
        let options = test_options(&format!("http://{addr}/__down?bytes=%d"));
        let d = descriptor("d", &addr.to_string(), Arc::new(CannedDialer::new(7)));
        let probe = ProxyProbe::new(&d, &options);
        let delay = probe.test_delay().await;
        assert_eq!(delay, 7);
    }

    #[tokio::test]
    async fn test_delay_all_failed_maps_to_zero() {
        let addr = serve_download(8 * 1024).await;
        let options = test_options(&format!("http://{addr}/__down?bytes=%d"));
        let d = descriptor("d", &addr.to_string(), Arc::new(CannedDialer::new(0)));
        let probe = ProxyProbe::new(&d, &options);
        assert_eq!(probe.test_delay().await, 0);
    }

    #[tokio::test]
    async fn test_empty_body_fails_bandwidth() {
        let addr = serve_download(0).await;
        let options = test_options(&format!("http://{addr}/__down?bytes=%d"));
        let d = descriptor("empty", &addr.to_string(), Arc::new(TcpDialer));
        let probe = ProxyProbe::new(&d, &options);
        assert!(probe.test_bandwidth().await.is_err());
    }

    #[tokio::test]
    async fn test_url_availability_map() {
        let addr = serve_download(8 * 1024).await;
        let options = test_options(&format!("http://{addr}/__down?bytes=%d"));
        let d = descriptor("u", &addr.to_string(), Arc::new(CannedDialer::new(15)));
        let probe = ProxyProbe::new(&d, &options);
        let urls = vec!["https://one.test/".to_string(), "https://two.test/".to_string()];
        let map = probe.test_urls_available(&urls).await;
        assert_eq!(map.len(), 2);
        assert!(map["https://one.test/"]);
        assert!(map["https://two.test/"]);
    }
}
