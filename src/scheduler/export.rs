//! Result ordering, file exports and console tables.

use std::io::Write;

use serde_json::json;

use crate::options::SortField;
use crate::proxy::{format_name, MeasuredProxy, SecretConfig};

use super::{Counters, Error};

/// Order results in place: bandwidth descends, TTFB ascends, `None` keeps
/// insertion order.
pub fn sort_results(results: &mut [MeasuredProxy], field: SortField) {
    match field {
        SortField::Bandwidth => {
            results.sort_by(|a, b| {
                b.result
                    .bandwidth
                    .partial_cmp(&a.result.bandwidth)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }
        SortField::Ttfb => {
            results.sort_by(|a, b| a.result.ttfb.cmp(&b.result.ttfb));
        }
        SortField::None => {}
    }
}

/// Secret configurations with the check results appended under `_check`.
pub fn secret_configs(proxies: &[MeasuredProxy]) -> Vec<SecretConfig> {
    proxies
        .iter()
        .map(|p| {
            let mut config = p.secret_config.clone();
            config.insert("_check".to_string(), json!(p.result.check_results));
            config
        })
        .collect()
}

/// Write the secret configurations as a top-level YAML sequence, in the
/// current sort order.
pub fn write_yaml(path: &str, proxies: &[MeasuredProxy]) -> Result<(), Error> {
    let configs: Vec<&SecretConfig> = proxies.iter().map(|p| &p.secret_config).collect();
    let body = serde_yaml::to_string(&configs)?;
    std::fs::write(path, body)?;
    Ok(())
}

/// Write the CSV export: UTF-8 BOM, a fixed header, then name, bandwidth
/// scaled by 1024 and TTFB in integer milliseconds.
pub fn write_csv(path: &str, proxies: &[MeasuredProxy]) -> Result<(), Error> {
    let mut file = std::fs::File::create(path)?;
    file.write_all(b"\xEF\xBB\xBF")?;
    writeln!(file, "节点,带宽 (MB/s),延迟 (ms)")?;
    for p in proxies {
        writeln!(
            file,
            "{},{:.2},{}",
            csv_field(&p.result.name),
            p.result.bandwidth / 1024.0,
            p.result.ttfb.as_millis(),
        )?;
    }
    Ok(())
}

/// Quote a CSV field when it carries separators or quotes.
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Aligned console table of the alive proxies.
pub fn print_alive_table(proxies: &[MeasuredProxy]) {
    println!(
        "{:<32} {:<22} {:>12} {:>10} {:>7}  {:<8} {}",
        "Name", "Address", "Bandwidth", "TTFB", "Delay", "Country", "Checks"
    );
    for p in proxies {
        let r = &p.result;
        let address = p
            .secret_config
            .get("server")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("-");
        let checks = if r.check_results.is_empty() {
            "N/A".to_string()
        } else {
            serde_json::to_string(&r.check_results).unwrap_or_else(|_| "N/A".into())
        };
        println!(
            "{:<32} {:<22} {:>12} {:>10} {:>7}  {:<8} {}",
            format_name(&r.name),
            address,
            r.formatted_bandwidth(),
            r.formatted_ttfb(),
            r.delay,
            r.country,
            checks,
        );
    }
}

/// Completion summary with the final counter values.
pub fn print_summary(counters: &Counters, alive: usize) {
    let processed = counters.processed().max(1);
    println!(
        "[{}] run finished: total {} | processed {} | alive {} | invalid {} | alive rate {:.1}%",
        chrono::Local::now().format("%H:%M:%S"),
        counters.total(),
        counters.processed(),
        alive,
        counters.invalid(),
        alive as f64 / processed as f64 * 100.0,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::ProxyResult;
    use std::time::Duration;

    fn measured(name: &str, bandwidth: f64, ttfb_ms: u64) -> MeasuredProxy {
        let mut config = SecretConfig::new();
        config.insert("name".into(), json!(name));
        config.insert("server".into(), json!("1.2.3.4"));
        MeasuredProxy {
            result: ProxyResult {
                name: name.into(),
                bandwidth,
                ttfb: Duration::from_millis(ttfb_ms),
                ..Default::default()
            },
            secret_config: config,
        }
    }

    #[test]
    fn test_sort_bandwidth_descending() {
        let mut v = vec![measured("a", 10.0, 5), measured("b", 30.0, 5), measured("c", 20.0, 5)];
        sort_results(&mut v, SortField::Bandwidth);
        let names: Vec<_> = v.iter().map(|m| m.result.name.as_str()).collect();
        assert_eq!(names, vec!["b", "c", "a"]);
    }

    #[test]
    fn test_sort_ttfb_ascending() {
        let mut v = vec![measured("a", 1.0, 300), measured("b", 1.0, 100), measured("c", 1.0, 200)];
        sort_results(&mut v, SortField::Ttfb);
        let names: Vec<_> = v.iter().map(|m| m.result.name.as_str()).collect();
        assert_eq!(names, vec!["b", "c", "a"]);
    }

    #[test]
    fn test_sort_none_keeps_order() {
        let mut v = vec![measured("z", 1.0, 2), measured("a", 9.0, 1)];
        sort_results(&mut v, SortField::None);
        assert_eq!(v[0].result.name, "z");
    }

    #[test]
    fn test_secret_configs_append_check_key() {
        let configs = secret_configs(&[measured("a", 1.0, 1)]);
        assert_eq!(configs.len(), 1);
        assert!(configs[0].contains_key("_check"));
        assert_eq!(configs[0]["name"], "a");
    }

    #[test]
    fn test_csv_field_quoting() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("q\"q"), "\"q\"\"q\"");
    }

    #[test]
    fn test_write_csv_format() {
        let dir = std::env::temp_dir().join(format!("proxymeter-csv-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("out.csv");
        write_csv(path.to_str().unwrap(), &[measured("节点一", 2048.0, 150)]).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..3], b"\xEF\xBB\xBF", "UTF-8 BOM prefix");
        let text = String::from_utf8(bytes[3..].to_vec()).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next().unwrap(), "节点,带宽 (MB/s),延迟 (ms)");
        assert_eq!(lines.next().unwrap(), "节点一,2.00,150");
    }

    #[test]
    fn test_write_yaml_roundtrip() {
        let dir = std::env::temp_dir().join(format!("proxymeter-yaml-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("out.yaml");
        write_yaml(path.to_str().unwrap(), &[measured("a", 1.0, 1), measured("b", 2.0, 1)]).unwrap();

        let body = std::fs::read_to_string(&path).unwrap();
        let parsed: Vec<SecretConfig> = serde_yaml::from_str(&body).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0]["name"], "a");
        assert_eq!(parsed[1]["server"], "1.2.3.4");
    }
}
