//! Run coordinator: owns ingestion, the bounded worker pool, counters,
//! progress output and the exported result sets.

mod export;

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use regex::Regex;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use url::Url;

use crate::cache::{default_cache, ResultCache};
use crate::ingest;
use crate::measure;
use crate::options::Options;
use crate::proxy::{MeasuredProxy, ProxyResult};
use crate::transport::{DefaultAdapter, ProxyAdapter};

/// Extra headroom on top of the bandwidth timeout: the composite sub-probe
/// fan-out is allowed this much beyond the download itself.
const WORKER_DEADLINE_SLACK: Duration = Duration::from_secs(60);
const PROGRESS_PERIOD: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration invalid: {0}")]
    ConfigInvalid(String),
    #[error("speed test already running")]
    AlreadyRunning,
    #[error("speed test has not been run yet")]
    NotTested,
    #[error("no alive proxies")]
    NoAlive,
    #[error("run cancelled")]
    Cancelled,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Run counters, written with atomics so the progress printer can observe
/// them without locks.
#[derive(Debug, Default)]
pub struct Counters {
    total: AtomicI32,
    processed: AtomicI32,
    invalid: AtomicI32,
    alive: AtomicI32,
}

impl Counters {
    pub fn total(&self) -> i32 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn processed(&self) -> i32 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn invalid(&self) -> i32 {
        self.invalid.load(Ordering::Relaxed)
    }

    pub fn alive(&self) -> i32 {
        self.alive.load(Ordering::Relaxed)
    }

    pub fn add_total(&self, n: usize) {
        self.total.fetch_add(n as i32, Ordering::Relaxed);
    }

    /// A counted proxy entry that cannot be measured. It is both invalid and
    /// processed, keeping `total == processed` at completion.
    pub fn mark_invalid_proxy(&self) {
        self.invalid.fetch_add(1, Ordering::Relaxed);
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    /// An invalid item that never entered `total` (a reserved provider).
    pub fn add_invalid(&self, n: usize) {
        self.invalid.fetch_add(n as i32, Ordering::Relaxed);
    }

    fn add_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    fn add_alive(&self) {
        self.alive.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Default)]
struct RunState {
    tested: bool,
    results: Vec<MeasuredProxy>,
    alive: Vec<MeasuredProxy>,
}

/// One measurement run over a catalog of proxies.
pub struct SpeedTest {
    options: Options,
    cache: Arc<dyn ResultCache>,
    adapter: Arc<dyn ProxyAdapter>,
    proxy_url: Option<Url>,
    include: Option<Regex>,
    exclude: Option<Regex>,
    counters: Arc<Counters>,
    testing: Arc<AtomicBool>,
    state: Mutex<RunState>,
}

impl std::fmt::Debug for SpeedTest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpeedTest").finish_non_exhaustive()
    }
}

impl SpeedTest {
    /// Validate options, compile the name filters and resolve the cache and
    /// adapter capabilities.
    pub fn new(mut options: Options) -> Result<Self, Error> {
        options.normalize().map_err(Error::ConfigInvalid)?;

        let include = compile_filter(&options.name_regex_contain)?;
        let exclude = compile_filter(&options.name_regex_not_contain)?;

        let proxy_url = if options.proxy_url.is_empty() {
            None
        } else {
            Some(
                Url::parse(&options.proxy_url)
                    .map_err(|e| Error::ConfigInvalid(format!("proxy url: {e}")))?,
            )
        };

        let cache: Arc<dyn ResultCache> = match options.cache.clone() {
            Some(cache) => cache,
            None => default_cache(),
        };
        let adapter = options
            .adapter
            .clone()
            .unwrap_or_else(|| Arc::new(DefaultAdapter));

        Ok(SpeedTest {
            options,
            cache,
            adapter,
            proxy_url,
            include,
            exclude,
            counters: Arc::new(Counters::default()),
            testing: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(RunState::default()),
        })
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    // --- Observers ---

    pub fn total_count(&self) -> i32 {
        self.counters.total()
    }

    pub fn processed_count(&self) -> i32 {
        self.counters.processed()
    }

    pub fn invalid_count(&self) -> i32 {
        self.counters.invalid()
    }

    pub fn alive_count(&self) -> i32 {
        self.counters.alive()
    }

    /// Measure every proxy from the configured sources. Idempotent per
    /// instance; a concurrent second call fails with [`Error::AlreadyRunning`].
    pub async fn run(&self, cancel: CancellationToken) -> Result<Vec<MeasuredProxy>, Error> {
        if self.testing.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyRunning);
        }
        let outcome = self.run_inner(&cancel).await;
        self.testing.store(false, Ordering::SeqCst);
        outcome
    }

    async fn run_inner(&self, cancel: &CancellationToken) -> Result<Vec<MeasuredProxy>, Error> {
        // 1. Start ingestion; descriptors arrive while we dispatch.
        let ingest::IngestHandle {
            proxies: proxies_rx,
            errors: mut err_rx,
        } = ingest::start(
            &self.options.config_path,
            self.proxy_url.clone(),
            self.adapter.clone(),
            self.counters.clone(),
            cancel.clone(),
        );

        self.start_progress();

        // 2. Dispatcher: bounded fan-out of measurement workers.
        let (results_tx, mut results_rx) = mpsc::channel::<MeasuredProxy>(10);
        self.spawn_dispatcher(proxies_rx, results_tx, cancel);

        // 3. Collect until the workers drain; source errors are warnings.
        let mut results = Vec::new();
        let mut alive = Vec::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                Some(err) = err_rx.recv() => {
                    tracing::error!("Scheduler: load proxies: {err}");
                }
                collected = results_rx.recv() => match collected {
                    Some(measured) => {
                        if measured.alive() {
                            self.counters.add_alive();
                            alive.push(measured.clone());
                        }
                        results.push(measured);
                    }
                    None => break,
                }
            }
        }

        // 4. Order and publish.
        export::sort_results(&mut results, self.options.sort_field);
        export::sort_results(&mut alive, self.options.sort_field);

        let mut state = self.state.lock().unwrap();
        state.tested = true;
        state.results = results.clone();
        state.alive = alive;
        Ok(results)
    }

    fn spawn_dispatcher(
        &self,
        mut proxies_rx: mpsc::Receiver<crate::proxy::ProxyDescriptor>,
        results_tx: mpsc::Sender<MeasuredProxy>,
        cancel: &CancellationToken,
    ) {
        let semaphore = Arc::new(Semaphore::new(self.options.concurrent));
        let counters = self.counters.clone();
        let cache = self.cache.clone();
        let options = Arc::new(self.options.clone());
        let include = self.include.clone();
        let exclude = self.exclude.clone();
        let cancel = cancel.clone();

        tokio::spawn(async move {
            let workers = TaskTracker::new();
            while let Some(descriptor) = proxies_rx.recv().await {
                if !name_passes(&include, &exclude, &descriptor.name) {
                    counters.add_processed();
                    continue;
                }

                let Ok(permit) = semaphore.clone().acquire_owned().await else {
                    break;
                };
                let counters = counters.clone();
                let cache = cache.clone();
                let options = options.clone();
                let results_tx = results_tx.clone();
                let cancel = cancel.clone();
                workers.spawn(async move {
                    let _permit = permit;
                    let name = descriptor.name.clone();
                    let secret_config = descriptor.secret_config.clone();
                    let deadline = options.timeout + WORKER_DEADLINE_SLACK;

                    // A panicking probe must not take the run down.
                    let measured = match std::panic::AssertUnwindSafe(tokio::time::timeout(
                        deadline,
                        measure::measure(&cancel, descriptor, &options, &cache),
                    ))
                    .catch_unwind()
                    .await
                    {
                        Ok(Ok(measured)) => measured,
                        Ok(Err(_elapsed)) => {
                            tracing::error!("Scheduler: [{name}] measurement deadline exceeded");
                            Some(MeasuredProxy {
                                result: ProxyResult::named(&name),
                                secret_config,
                            })
                        }
                        Err(panic) => {
                            tracing::error!("Scheduler: worker panic: {panic:?}");
                            None
                        }
                    };

                    counters.add_processed();
                    if let Some(measured) = measured {
                        let _ = results_tx.send(measured).await;
                    }
                });
            }
            workers.close();
            workers.wait().await;
            // results_tx drops here, closing the collector loop.
        });
    }

    /// Print progress every few seconds while the run is testing.
    fn start_progress(&self) {
        let counters = self.counters.clone();
        let testing = self.testing.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PROGRESS_PERIOD);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval.tick().await;
            loop {
                interval.tick().await;
                if !testing.load(Ordering::SeqCst) {
                    break;
                }
                let total = counters.total().max(1);
                let processed = counters.processed();
                println!(
                    "[{}] progress: {}/{} ({:.1}%) | alive: {} | invalid: {}",
                    chrono::Local::now().format("%H:%M:%S"),
                    processed,
                    counters.total(),
                    processed as f64 / total as f64 * 100.0,
                    counters.alive(),
                    counters.invalid(),
                );
            }
        });
    }

    fn state_for_export(&self) -> Result<(Vec<MeasuredProxy>, Vec<MeasuredProxy>), Error> {
        let state = self.state.lock().unwrap();
        if !state.tested {
            return Err(Error::NotTested);
        }
        Ok((state.results.clone(), state.alive.clone()))
    }

    /// All measured proxies, in the run's sort order.
    pub fn proxies_with_result(&self) -> Result<Vec<MeasuredProxy>, Error> {
        Ok(self.state_for_export()?.0)
    }

    /// Alive proxies with their results.
    pub fn alive_proxies_with_result(&self) -> Result<Vec<MeasuredProxy>, Error> {
        Ok(self.state_for_export()?.1)
    }

    /// Alive proxies as their secret configurations, each augmented with a
    /// `_check` key carrying the check results.
    pub fn alive_proxies(&self) -> Result<Vec<crate::proxy::SecretConfig>, Error> {
        Ok(export::secret_configs(&self.state_for_export()?.1))
    }

    /// JSON rendering of [`SpeedTest::alive_proxies`].
    pub fn alive_as_json(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec(&self.alive_proxies()?)?)
    }

    /// Write the alive proxies' secret configurations as a YAML sequence.
    pub fn write_yaml(&self, path: &str) -> Result<(), Error> {
        let (_, alive) = self.state_for_export()?;
        if alive.is_empty() {
            return Err(Error::NoAlive);
        }
        export::write_yaml(path, &alive)
    }

    /// Write the alive proxies as CSV (BOM-prefixed, `节点,带宽 (MB/s),延迟 (ms)`).
    pub fn write_csv(&self, path: &str) -> Result<(), Error> {
        let (_, alive) = self.state_for_export()?;
        if alive.is_empty() {
            return Err(Error::NoAlive);
        }
        export::write_csv(path, &alive)
    }

    /// Print the alive proxies as an aligned table.
    pub fn log_alive(&self) {
        if let Ok((_, alive)) = self.state_for_export() {
            export::print_alive_table(&alive);
        }
    }

    /// Print the completion summary.
    pub fn log_summary(&self) {
        let alive = self
            .state_for_export()
            .map(|(_, alive)| alive.len())
            .unwrap_or(0);
        export::print_summary(&self.counters, alive);
    }

    /// Release run resources. The process-wide cache survives this.
    pub fn close(&self) {
        self.testing.store(false, Ordering::SeqCst);
        self.cache.close();
    }
}

/// Name filter: the include regex, when set, must match; the exclude regex,
/// when set, must not. With neither set every name passes.
fn name_passes(include: &Option<Regex>, exclude: &Option<Regex>, name: &str) -> bool {
    if let Some(exclude) = exclude {
        if exclude.is_match(name) {
            return false;
        }
    }
    if let Some(include) = include {
        return include.is_match(name);
    }
    true
}

fn compile_filter(pattern: &str) -> Result<Option<Regex>, Error> {
    if pattern.is_empty() {
        return Ok(None);
    }
    Regex::new(pattern)
        .map(Some)
        .map_err(|e| Error::ConfigInvalid(format!("name filter: {e}")))
}
