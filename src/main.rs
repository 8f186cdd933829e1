//! proxymeter CLI: measure a proxy catalog and print the ranked survivors.

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use proxymeter::options::{Options, SortField, DEFAULT_LIVENESS_ADDR};
use proxymeter::scheduler::SpeedTest;

#[derive(Parser, Debug)]
#[command(
    name = "proxymeter",
    version,
    about = "Measure bandwidth, latency and unlock status of clash-style proxy catalogs"
)]
struct Args {
    /// Configuration file path or http(s) URL; separate multiple with `|`
    #[arg(short = 'c', long = "config")]
    config: String,

    /// Liveness object URL with a `%d` byte-count slot
    #[arg(short = 'l', long = "liveness-url", default_value = DEFAULT_LIVENESS_ADDR)]
    liveness_url: String,

    /// Only test proxies whose name matches this regex
    #[arg(short = 'f', long = "filter", default_value = ".*")]
    filter: String,

    /// Skip proxies whose name matches this regex
    #[arg(long = "block", default_value = "")]
    block: String,

    /// Download size in bytes for the bandwidth stage
    #[arg(long = "size", default_value_t = 100 * 1024 * 1024)]
    size: u64,

    /// Per-proxy bandwidth timeout, e.g. 5s, 800ms, 1m
    #[arg(long = "timeout", value_parser = parse_duration, default_value = "5s")]
    timeout: Duration,

    /// Sort field: b/bandwidth or t/ttfb
    #[arg(long = "sort", default_value = "b")]
    sort: SortField,

    /// Write results to a file: yaml or csv
    #[arg(long = "output", default_value = "")]
    output: String,

    /// Measurement worker cap
    #[arg(long = "concurrent", default_value_t = 4)]
    concurrent: usize,

    /// Checks to run per alive proxy, e.g. country,gpt_web,netflix
    #[arg(long = "check", value_delimiter = ',')]
    check: Vec<String>,

    /// URLs to probe for reachability through each proxy
    #[arg(long = "test-url", value_delimiter = ',')]
    test_url: Vec<String>,

    /// Upstream proxy for fetching remote configuration sources
    #[arg(long = "proxy", default_value = "")]
    proxy: String,
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let (value, unit) = match s.find(|c: char| c.is_ascii_alphabetic()) {
        Some(idx) => s.split_at(idx),
        None => (s, "s"),
    };
    let value: f64 = value
        .parse()
        .map_err(|_| format!("invalid duration: {s}"))?;
    let secs = match unit {
        "ms" => value / 1000.0,
        "s" | "" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        other => return Err(format!("unknown duration unit: {other}")),
    };
    Ok(Duration::from_secs_f64(secs))
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("proxymeter=info")),
        )
        .init();

    let args = Args::parse();

    let check_types = match serde_json::from_value(serde_json::json!(args.check)) {
        Ok(types) => types,
        Err(err) => {
            tracing::error!("unknown check type: {err}");
            return ExitCode::FAILURE;
        }
    };

    let options = Options {
        liveness_addr: args.liveness_url,
        download_size: args.size,
        timeout: args.timeout,
        config_path: args.config,
        name_regex_contain: args.filter,
        name_regex_not_contain: args.block,
        sort_field: args.sort,
        url_for_test: args.test_url,
        proxy_url: args.proxy,
        check_types,
        concurrent: args.concurrent,
        ..Default::default()
    };

    let test = match SpeedTest::new(options) {
        Ok(test) => test,
        Err(err) => {
            tracing::error!("{err}");
            return ExitCode::FAILURE;
        }
    };

    // Ctrl-C cancels the run.
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_cancel.cancel();
        }
    });

    if let Err(err) = test.run(cancel).await {
        tracing::error!("{err}");
        return ExitCode::FAILURE;
    }

    match test.alive_as_json() {
        Ok(json) => println!("{}", String::from_utf8_lossy(&json)),
        Err(err) => tracing::warn!("render alive json: {err}"),
    }
    test.log_alive();
    test.log_summary();

    let export = match args.output.to_lowercase().as_str() {
        "yaml" => test.write_yaml("result.yaml").map(|_| "result.yaml"),
        "csv" => test.write_csv("result.csv").map(|_| "result.csv"),
        _ => Ok(""),
    };
    match export {
        Ok("") => {}
        Ok(path) => tracing::info!("results written to {path}"),
        Err(err) => {
            tracing::error!("failed to write output: {err}");
            return ExitCode::FAILURE;
        }
    }

    ExitCode::SUCCESS
}
