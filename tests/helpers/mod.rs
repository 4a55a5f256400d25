#![allow(dead_code)]
//! Shared fixtures for the integration tests.

pub mod notifiers;

use brewq::config::{BindingConfig, Config};
use brewq::core::SourceRecord;
use brewq::topology::{LOCATION_QUEUE, TYPE_QUEUE};
use std::path::Path;
use std::time::Duration;

/// A record with every field filled, located in `city`, `state`.
pub fn brewery(name: &str, brewery_type: &str, city: &str, state: &str) -> SourceRecord {
    SourceRecord {
        id: format!("{}-id", name.to_lowercase()),
        name: name.to_string(),
        brewery_type: brewery_type.to_string(),
        address_1: "1 Main St".to_string(),
        city: city.to_string(),
        state_province: state.to_string(),
        postal_code: "00000".to_string(),
        country: "United States".to_string(),
        phone: "5550100".to_string(),
        website_url: format!("http://www.{}.example", name.to_lowercase()),
        longitude: "-92.33".to_string(),
        latitude: "38.95".to_string(),
        ..SourceRecord::default()
    }
}

/// Default config whose sinks live under `dir` and whose publishes are unthrottled.
pub fn config_in(dir: &Path) -> Config {
    let mut config = Config::default();
    config.distributor.publish_delay_ms = 0;
    config.dispatcher.bindings = vec![
        BindingConfig {
            queue: TYPE_QUEUE.to_string(),
            sink_path: dir.join("consumer1_type.csv"),
            alert: false,
        },
        BindingConfig {
            queue: LOCATION_QUEUE.to_string(),
            sink_path: dir.join("consumer2_location.csv"),
            alert: true,
        },
    ];
    config
}

/// Reads a sink file, returning its lines or nothing if it was never created.
pub fn sink_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .map(|text| text.lines().map(str::to_string).collect())
        .unwrap_or_default()
}

/// Polls `condition` until it holds or `timeout` expires.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
