//! Read-only client over the external document store.
//!
//! Both operations are plain blocking HTTP calls; retries live in `backoff`
//! rather than hand-rolled loops. Scans are paginated with a server-side
//! cursor (`scroll_id`) and a consistency window, matching the shape of a
//! real search-engine scroll API without depending on any vendor SDK.

use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use serde_json::Value;

use crate::errors::IndexerError;

const SCROLL_CONSISTENCY_WINDOW: &str = "10m";
const SCAN_BATCH_SIZE: usize = 5_000;
const CONNECTION_POOL_SIZE: usize = 64;

pub struct IndexerClient {
    http: reqwest::blocking::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct CountResponse {
    count: i64,
}

#[derive(Deserialize)]
struct ScrollResponse {
    #[serde(rename = "_scroll_id")]
    scroll_id: Option<String>,
    hits: ScrollHits,
}

#[derive(Deserialize)]
struct ScrollHits {
    hits: Vec<ScrollHit>,
}

#[derive(Deserialize)]
struct ScrollHit {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_source")]
    source: Value,
}

/// One extracted record, ready to be merged into `{..source, _id}` and
/// written to the staging file.
pub struct Record {
    pub id: String,
    pub source: Value,
}

impl IndexerClient {
    pub fn new(base_url: String, username: String, password: String) -> Result<Self, IndexerError> {
        let mut builder = reqwest::blocking::Client::builder()
            .pool_max_idle_per_host(CONNECTION_POOL_SIZE)
            .timeout(Duration::from_secs(60));

        if !username.is_empty() {
            let encoded = BASE64.encode(format!("{username}:{password}"));
            let mut headers = reqwest::header::HeaderMap::new();
            headers.insert(
                reqwest::header::AUTHORIZATION,
                format!("Basic {encoded}").parse().expect("valid auth header"),
            );
            builder = builder.default_headers(headers);
        }

        let http = builder
            .build()
            .map_err(IndexerError::Unavailable)?;

        Ok(Self { http, base_url })
    }

    /// Total count when `start`/`end` are both `None` (non-interval indices);
    /// otherwise the count within `[start, end)`.
    pub fn count_records(
        &self,
        index: &str,
        start: Option<i64>,
        end: Option<i64>,
    ) -> Result<i64, IndexerError> {
        let body = count_query_body(start, end);
        let url = format!("{}/{}/_count", self.base_url, index);

        let response = with_retry(|| {
            self.http
                .post(&url)
                .json(&body)
                .send()
                .and_then(|r| r.error_for_status())
        })
        .map_err(IndexerError::Unavailable)?;

        let parsed: CountResponse = response
            .json()
            .map_err(|source| IndexerError::BadResponse {
                index: index.to_string(),
                source,
            })?;
        Ok(parsed.count)
    }

    /// Runs the full scroll to completion and returns every record. The
    /// scan is restartable-from-top: any mid-scroll failure means the whole
    /// sequence is discarded and `Err` is returned, rather than a partial
    /// result.
    pub fn get_records(
        &self,
        index: &str,
        start: Option<i64>,
        end: Option<i64>,
    ) -> Result<Vec<Record>, IndexerError> {
        let mut records = Vec::new();
        let search_url = format!("{}/{}/_search?scroll={}", self.base_url, index, SCROLL_CONSISTENCY_WINDOW);
        let body = search_query_body(start, end);

        let first = with_retry(|| {
            self.http
                .post(&search_url)
                .json(&body)
                .send()
                .and_then(|r| r.error_for_status())
        })
        .map_err(IndexerError::Unavailable)?;

        let mut page: ScrollResponse = first.json().map_err(|source| IndexerError::BadResponse {
            index: index.to_string(),
            source,
        })?;

        loop {
            if page.hits.hits.is_empty() {
                break;
            }
            for hit in page.hits.hits {
                records.push(Record {
                    id: hit.id,
                    source: hit.source,
                });
            }

            let scroll_id = match &page.scroll_id {
                Some(id) => id.clone(),
                None => break,
            };

            let scroll_url = format!("{}/_search/scroll", self.base_url);
            let scroll_body = serde_json::json!({
                "scroll": SCROLL_CONSISTENCY_WINDOW,
                "scroll_id": scroll_id,
            });

            let next = with_retry(|| {
                self.http
                    .post(&scroll_url)
                    .json(&scroll_body)
                    .send()
                    .and_then(|r| r.error_for_status())
            })
            .map_err(IndexerError::Unavailable)?;

            page = next.json().map_err(|source| IndexerError::BadResponse {
                index: index.to_string(),
                source,
            })?;
        }

        Ok(records)
    }
}

fn count_query_body(start: Option<i64>, end: Option<i64>) -> Value {
    match (start, end) {
        (Some(start), Some(end)) => serde_json::json!({
            "query": { "range": { "timestamp": { "gte": start, "lt": end } } }
        }),
        _ => serde_json::json!({ "query": { "match_all": {} } }),
    }
}

fn search_query_body(start: Option<i64>, end: Option<i64>) -> Value {
    let mut body = count_query_body(start, end);
    body["size"] = serde_json::json!(SCAN_BATCH_SIZE);
    body
}

fn with_retry<F>(mut op: F) -> Result<reqwest::blocking::Response, reqwest::Error>
where
    F: FnMut() -> Result<reqwest::blocking::Response, reqwest::Error>,
{
    let mut backoff = ExponentialBackoff::default();
    loop {
        match op() {
            Ok(response) => return Ok(response),
            Err(e) => match backoff.next_backoff() {
                Some(delay) => std::thread::sleep(delay),
                None => return Err(e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_query_body_uses_half_open_range_when_bounded() {
        let body = count_query_body(Some(10), Some(20));
        assert_eq!(body["query"]["range"]["timestamp"]["gte"], 10);
        assert_eq!(body["query"]["range"]["timestamp"]["lt"], 20);
    }

    #[test]
    fn count_query_body_matches_all_when_unbounded() {
        let body = count_query_body(None, None);
        assert_eq!(body["query"]["match_all"], serde_json::json!({}));
    }

    #[test]
    fn basic_auth_header_matches_known_vector() {
        let encoded = BASE64.encode("admin:secret");
        assert_eq!(encoded, "YWRtaW46c2VjcmV0");
    }
}
