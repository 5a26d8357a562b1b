//! Client for the external analytical table store.
//!
//! Loads are gated by a shared throttle (construction-time handle, not a
//! process singleton) so a burst of worker threads starting loads at once
//! doesn't trip the warehouse's own rate limiting.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Deserialize;

use crate::errors::WarehouseError;

const MIN_LOAD_SPACING: Duration = Duration::from_secs(3);

/// Shared handle enforcing "at most one load starts every 3 seconds" across
/// every `WarehouseClient` built from the same handle.
#[derive(Clone)]
pub struct LoadThrottle {
    last_start: Arc<Mutex<Option<Instant>>>,
}

impl Default for LoadThrottle {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadThrottle {
    pub fn new() -> Self {
        Self {
            last_start: Arc::new(Mutex::new(None)),
        }
    }

    fn wait_turn(&self) {
        loop {
            let mut last_start = self.last_start.lock().unwrap();
            let now = Instant::now();
            match *last_start {
                Some(previous) if now.duration_since(previous) < MIN_LOAD_SPACING => {
                    let remaining = MIN_LOAD_SPACING - now.duration_since(previous);
                    drop(last_start);
                    std::thread::sleep(remaining);
                }
                _ => {
                    *last_start = Some(now);
                    return;
                }
            }
        }
    }
}

pub struct WarehouseClient {
    http: reqwest::blocking::Client,
    base_url: String,
    throttle: LoadThrottle,
}

#[derive(Deserialize)]
struct CountResponse {
    count: i64,
}

impl WarehouseClient {
    pub fn new(base_url: String, throttle: LoadThrottle) -> Result<Self, WarehouseError> {
        let http = reqwest::blocking::Client::builder()
            .pool_max_idle_per_host(64)
            .build()
            .map_err(WarehouseError::Unavailable)?;
        Ok(Self {
            http,
            base_url,
            throttle,
        })
    }

    /// No-op if the table does not exist.
    pub fn truncate_tables(&self, dataset: &str, tables: &[String]) -> Result<(), WarehouseError> {
        for table in tables {
            let url = format!("{}/{}/{}:truncate", self.base_url, dataset, table);
            let response = self.http.post(&url).send().map_err(WarehouseError::Unavailable)?;
            if response.status() == reqwest::StatusCode::NOT_FOUND {
                continue;
            }
            response
                .error_for_status()
                .map_err(WarehouseError::Unavailable)?;
        }
        Ok(())
    }

    pub fn delete_on_or_after(
        &self,
        dataset: &str,
        table: &str,
        timestamp: i64,
    ) -> Result<(), WarehouseError> {
        let url = format!(
            "{}/{}/{}?timestamp_gte={}",
            self.base_url, dataset, table, timestamp
        );
        let response = self
            .http
            .delete(&url)
            .send()
            .map_err(WarehouseError::Unavailable)?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        response
            .error_for_status()
            .map_err(WarehouseError::Unavailable)?;
        Ok(())
    }

    /// Write disposition is always APPEND; callers truncate or delete first.
    /// Synchronous: blocks until the load job completes.
    pub fn load_data(
        &self,
        dataset: &str,
        table: &str,
        schema_path: &Path,
        data_path: &Path,
    ) -> Result<(), WarehouseError> {
        self.throttle.wait_turn();

        let schema = std::fs::read_to_string(schema_path).map_err(|e| WarehouseError::SchemaMismatch {
            table: table.to_string(),
            message: format!("could not read schema file: {e}"),
        })?;
        let data = std::fs::read(data_path)?;

        let url = format!("{}/{}/{}:load", self.base_url, dataset, table);
        let response = self
            .http
            .post(&url)
            .query(&[("writeDisposition", "APPEND")])
            .header("X-Schema", schema)
            .body(data)
            .send()
            .map_err(WarehouseError::Unavailable)?;

        let response = response.error_for_status().map_err(|e| {
            if e.status() == Some(reqwest::StatusCode::BAD_REQUEST) {
                WarehouseError::SchemaMismatch {
                    table: table.to_string(),
                    message: e.to_string(),
                }
            } else {
                WarehouseError::Unavailable(e)
            }
        })?;

        // The load endpoint returns only once the job has committed; no
        // separate poll loop is needed on the caller side.
        let _ = response.status();
        Ok(())
    }

    pub fn get_num_records(&self, dataset: &str, table: &str) -> Result<i64, WarehouseError> {
        let url = format!("{}/{}/{}:query", self.base_url, dataset, table);
        let response = self
            .http
            .post(&url)
            .json(&serde_json::json!({}))
            .send()
            .map_err(WarehouseError::Unavailable)?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(0);
        }
        let parsed: CountResponse = response
            .error_for_status()
            .map_err(WarehouseError::Unavailable)?
            .json()
            .map_err(WarehouseError::Unavailable)?;
        Ok(parsed.count)
    }

    pub fn get_num_records_in_interval(
        &self,
        dataset: &str,
        table: &str,
        start: i64,
        end: i64,
    ) -> Result<i64, WarehouseError> {
        let url = format!("{}/{}/{}:query", self.base_url, dataset, table);
        let response = self
            .http
            .post(&url)
            .json(&serde_json::json!({
                "filter": { "timestamp_gte": start, "timestamp_lt": end }
            }))
            .send()
            .map_err(WarehouseError::Unavailable)?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(0);
        }
        let parsed: CountResponse = response
            .error_for_status()
            .map_err(WarehouseError::Unavailable)?
            .json()
            .map_err(WarehouseError::Unavailable)?;
        Ok(parsed.count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttle_enforces_minimum_spacing_between_starts() {
        let throttle = LoadThrottle::new();
        let start = Instant::now();
        throttle.wait_turn();
        throttle.wait_turn();
        assert!(start.elapsed() >= MIN_LOAD_SPACING);
    }

    #[test]
    fn throttle_is_shared_across_clones() {
        let throttle = LoadThrottle::new();
        let clone = throttle.clone();
        throttle.wait_turn();

        let start = Instant::now();
        clone.wait_turn();
        assert!(start.elapsed() >= MIN_LOAD_SPACING);
    }
}
