//! In-memory record store + rate-limited HTTP client for PriceWatch.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use anyhow::Context;
use pricewatch_core::{
    type_prefix, IndexPoint, PerformanceRow, PriceTableRow, VendorQuoteRow,
};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "pricewatch-storage";

/// How the fallback (type-only) price-table index is keyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecondaryIndexMode {
    /// Leading uppercase run of the type code.
    #[default]
    TypePrefix,
    /// Full type code column of the price table.
    FullTypeCode,
}

impl SecondaryIndexMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "type_prefix" | "prefix" => Some(Self::TypePrefix),
            "full_type_code" | "full" => Some(Self::FullTypeCode),
            _ => None,
        }
    }

    /// Secondary lookup key for a target's full type code.
    pub fn key_for(self, valve_type: &str) -> String {
        match self {
            Self::TypePrefix => type_prefix(valve_type),
            Self::FullTypeCode => {
                let code = valve_type.trim();
                if code.chars().count() < 2 {
                    String::new()
                } else {
                    code.to_string()
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct PriceIndex {
    by_type_size: HashMap<String, Vec<usize>>,
    by_type_prefix: HashMap<String, Vec<usize>>,
    by_full_code: HashMap<String, Vec<usize>>,
}

#[derive(Debug, Default)]
struct PerformanceIndex {
    by_derived_key: HashMap<String, Vec<usize>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StoreCounts {
    pub price_rows: usize,
    pub performance_rows: usize,
    pub quote_rows: usize,
    pub index_points: usize,
}

/// Immutable holder of the three loaded tables plus the commodity index series.
///
/// Indexes are built on first use and shared by every reader afterwards.
#[derive(Debug)]
pub struct RecordStore {
    price_table: Vec<PriceTableRow>,
    performance: Vec<PerformanceRow>,
    quotes: Vec<VendorQuoteRow>,
    index_series: Vec<IndexPoint>,
    price_index: OnceLock<PriceIndex>,
    performance_index: OnceLock<PerformanceIndex>,
}

impl RecordStore {
    pub fn new(
        price_table: Vec<PriceTableRow>,
        performance: Vec<PerformanceRow>,
        quotes: Vec<VendorQuoteRow>,
        index_series: Vec<IndexPoint>,
    ) -> Self {
        let price_table = price_table
            .into_iter()
            .map(PriceTableRow::normalized)
            .collect::<Vec<_>>();
        let performance = performance
            .into_iter()
            .map(PerformanceRow::normalized)
            .collect::<Vec<_>>();
        let quotes = quotes
            .into_iter()
            .map(|q| {
                let mut q = q.normalized();
                q.join_type_code(&performance);
                q
            })
            .collect::<Vec<_>>();

        Self {
            price_table,
            performance,
            quotes,
            index_series,
            price_index: OnceLock::new(),
            performance_index: OnceLock::new(),
        }
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn price_table(&self) -> &[PriceTableRow] {
        &self.price_table
    }

    pub fn performance(&self) -> &[PerformanceRow] {
        &self.performance
    }

    pub fn quotes(&self) -> &[VendorQuoteRow] {
        &self.quotes
    }

    pub fn index_series(&self) -> &[IndexPoint] {
        &self.index_series
    }

    pub fn counts(&self) -> StoreCounts {
        StoreCounts {
            price_rows: self.price_table.len(),
            performance_rows: self.performance.len(),
            quote_rows: self.quotes.len(),
            index_points: self.index_series.len(),
        }
    }

    fn price_index(&self) -> &PriceIndex {
        self.price_index.get_or_init(|| {
            let mut index = PriceIndex::default();
            for (pos, row) in self.price_table.iter().enumerate() {
                if !row.valve_type_key.is_empty() {
                    index
                        .by_type_size
                        .entry(row.valve_type_key.clone())
                        .or_default()
                        .push(pos);
                }
                let prefix = type_prefix(&row.valve_type_key);
                if !prefix.is_empty() {
                    index.by_type_prefix.entry(prefix).or_default().push(pos);
                }
                let full = SecondaryIndexMode::FullTypeCode.key_for(&row.valve_type);
                if !full.is_empty() {
                    index.by_full_code.entry(full).or_default().push(pos);
                }
            }
            debug!(
                type_size_keys = index.by_type_size.len(),
                prefix_keys = index.by_type_prefix.len(),
                "built price-table index"
            );
            index
        })
    }

    fn performance_index(&self) -> &PerformanceIndex {
        self.performance_index.get_or_init(|| {
            let mut index = PerformanceIndex::default();
            for (pos, row) in self.performance.iter().enumerate() {
                if !row.derived_key.is_empty() {
                    index
                        .by_derived_key
                        .entry(row.derived_key.clone())
                        .or_default()
                        .push(pos);
                }
            }
            index
        })
    }

    /// Price rows sharing a type+size key, in source order.
    pub fn price_rows_by_type_size(&self, key: &str) -> Vec<&PriceTableRow> {
        if key.is_empty() {
            return Vec::new();
        }
        self.rows_at(self.price_index().by_type_size.get(key))
    }

    /// Price rows for the fallback tier, in source order.
    pub fn price_rows_secondary(&self, mode: SecondaryIndexMode, key: &str) -> Vec<&PriceTableRow> {
        if key.is_empty() {
            return Vec::new();
        }
        let index = self.price_index();
        let positions = match mode {
            SecondaryIndexMode::TypePrefix => index.by_type_prefix.get(key),
            SecondaryIndexMode::FullTypeCode => index.by_full_code.get(key),
        };
        self.rows_at(positions)
    }

    fn rows_at(&self, positions: Option<&Vec<usize>>) -> Vec<&PriceTableRow> {
        positions
            .map(|p| p.iter().map(|&i| &self.price_table[i]).collect())
            .unwrap_or_default()
    }

    /// Historical orders sharing a derived key, in source order.
    pub fn performance_by_derived_key(&self, key: &str) -> Vec<&PerformanceRow> {
        if key.is_empty() {
            return Vec::new();
        }
        self.performance_index()
            .by_derived_key
            .get(key)
            .map(|p| p.iter().map(|&i| &self.performance[i]).collect())
            .unwrap_or_default()
    }
}

/// Upstream statuses worth another attempt.
pub fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

pub fn is_transient_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

/// Server-requested wait from a `Retry-After: <seconds>` header.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Retry budget for completion calls; honours `Retry-After` before falling back to doubling.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn wait_before_retry(&self, retry: usize, requested: Option<Duration>) -> Duration {
        let wait = requested.unwrap_or_else(|| {
            let shift = u32::try_from(retry).unwrap_or(u32::MAX).min(16);
            self.base_delay.saturating_mul(1u32 << shift)
        });
        wait.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_concurrency: usize,
    pub retry: RetryPolicy,
    /// Upper bound on request starts per minute; `None` leaves requests unpaced.
    pub requests_per_minute: Option<u32>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            max_concurrency: 1,
            retry: RetryPolicy::default(),
            requests_per_minute: None,
        }
    }
}

/// Spaces request starts evenly to stay under a per-minute quota.
///
/// The spacing never drops below one millisecond, however large the quota.
#[derive(Debug)]
pub struct RequestPacer {
    interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RequestPacer {
    pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

    /// `None` for a zero quota, meaning no pacing.
    pub fn per_minute(requests: u32) -> Option<Self> {
        if requests == 0 {
            return None;
        }
        let interval = (Duration::from_secs(60) / requests).max(Self::MIN_INTERVAL);
        Some(Self {
            interval,
            next_slot: Mutex::new(None),
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Reserve the next start slot, sleeping until it arrives.
    pub async fn wait_turn(&self) {
        let slot = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = next.map_or(now, |reserved| reserved.max(now));
            *next = Some(slot + self.interval);
            slot
        };
        let wait = slot.saturating_duration_since(Instant::now());
        if !wait.is_zero() {
            debug!(wait_ms = wait.as_millis() as u64, "pacing request");
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct PostedResponse {
    pub status: StatusCode,
    pub body: serde_json::Value,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("http client is shut down")]
    Closed,
}

/// JSON-over-HTTP client with bounded concurrency and optional request pacing.
#[derive(Debug)]
pub struct HttpClient {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    pacer: Option<RequestPacer>,
    retry: RetryPolicy,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            pacer: config.requests_per_minute.and_then(RequestPacer::per_minute),
            retry: config.retry,
        })
    }

    pub async fn post_json(
        &self,
        url: &str,
        bearer_token: Option<&str>,
        payload: &serde_json::Value,
    ) -> Result<PostedResponse, FetchError> {
        let _permit = self.limit.acquire().await.map_err(|_| FetchError::Closed)?;

        self.post_with_retries(url, bearer_token, payload)
            .instrument(info_span!("http_post", url))
            .await
    }

    async fn post_with_retries(
        &self,
        url: &str,
        bearer_token: Option<&str>,
        payload: &serde_json::Value,
    ) -> Result<PostedResponse, FetchError> {
        let mut retry = 0;
        loop {
            if let Some(pacer) = &self.pacer {
                pacer.wait_turn().await;
            }

            let mut request = self.client.post(url).json(payload);
            if let Some(token) = bearer_token {
                request = request.bearer_auth(token);
            }

            let (failure, requested_wait) = match request.send().await {
                Ok(resp) if resp.status().is_success() => {
                    let status = resp.status();
                    let body = resp.json::<serde_json::Value>().await?;
                    return Ok(PostedResponse { status, body });
                }
                Ok(resp) => {
                    let status = resp.status();
                    let failure = FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: resp.url().to_string(),
                    };
                    if !is_transient_status(status) {
                        return Err(failure);
                    }
                    (failure, retry_after(resp.headers()))
                }
                Err(err) if is_transient_error(&err) => (FetchError::Request(err), None),
                Err(err) => return Err(FetchError::Request(err)),
            };

            if retry >= self.retry.max_retries {
                return Err(failure);
            }
            let wait = self.retry.wait_before_retry(retry, requested_wait);
            debug!(retry, wait_ms = wait.as_millis() as u64, error = %failure, "retrying completion request");
            tokio::time::sleep(wait).await;
            retry += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pricewatch_core::OptionPrices;

    fn price_row(key: &str, full: &str, vendor: &str) -> PriceTableRow {
        PriceTableRow {
            valve_type_key: key.into(),
            valve_type: full.into(),
            body_unit_price: 100.0,
            reference_quantity: 1.0,
            vendor_name: vendor.into(),
            options: OptionPrices::default(),
        }
    }

    fn store() -> RecordStore {
        RecordStore::new(
            vec![
                price_row("VGBASW3A0", "VGBASW3A0A", "first"),
                price_row("VGBASW3A0", "VGBASW3A0B", "second"),
                price_row("VGBARR1A0", "", "third"),
            ],
            vec![],
            vec![],
            vec![],
        )
    }

    #[test]
    fn buckets_keep_source_order() {
        let store = store();
        let bucket = store.price_rows_by_type_size("VGBASW3A0");
        assert_eq!(bucket.len(), 2);
        assert_eq!(bucket[0].vendor_name, "first");
        // repeated lookups hit the same lazily built index
        assert_eq!(store.price_rows_by_type_size("VGBASW3A0")[0].vendor_name, "first");
    }

    #[test]
    fn secondary_index_modes_differ() {
        let store = store();
        let by_prefix = store.price_rows_secondary(SecondaryIndexMode::TypePrefix, "VGBASW");
        assert_eq!(by_prefix.len(), 2);
        let by_full = store.price_rows_secondary(SecondaryIndexMode::FullTypeCode, "VGBASW3A0B");
        assert_eq!(by_full.len(), 1);
        assert_eq!(by_full[0].vendor_name, "second");
        assert!(store.price_rows_secondary(SecondaryIndexMode::TypePrefix, "").is_empty());
    }

    #[test]
    fn secondary_mode_parses_env_values() {
        assert_eq!(SecondaryIndexMode::parse("prefix"), Some(SecondaryIndexMode::TypePrefix));
        assert_eq!(SecondaryIndexMode::parse(" FULL_TYPE_CODE "), Some(SecondaryIndexMode::FullTypeCode));
        assert_eq!(SecondaryIndexMode::parse("fuzzy"), None);
        assert_eq!(SecondaryIndexMode::FullTypeCode.key_for("V"), "");
    }

    #[test]
    fn retry_wait_prefers_server_hint_within_cap() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
        };
        assert_eq!(policy.wait_before_retry(0, None), Duration::from_millis(250));
        assert_eq!(policy.wait_before_retry(2, None), Duration::from_secs(1));
        assert_eq!(policy.wait_before_retry(9, None), Duration::from_secs(2));
        assert_eq!(policy.wait_before_retry(0, Some(Duration::from_secs(1))), Duration::from_secs(1));
        assert_eq!(policy.wait_before_retry(0, Some(Duration::from_secs(30))), Duration::from_secs(2));
        assert_eq!(policy.wait_before_retry(usize::MAX, None), Duration::from_secs(2));
    }

    #[test]
    fn retry_after_reads_delta_seconds_only() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), None);
        headers.insert(RETRY_AFTER, "7".parse().unwrap());
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(7)));
        headers.insert(RETRY_AFTER, "Wed, 21 Oct 2026 07:28:00 GMT".parse().unwrap());
        assert_eq!(retry_after(&headers), None);
    }

    #[test]
    fn transient_statuses() {
        assert!(is_transient_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_transient_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_transient_status(StatusCode::REQUEST_TIMEOUT));
        assert!(!is_transient_status(StatusCode::UNAUTHORIZED));
        assert!(!is_transient_status(StatusCode::BAD_REQUEST));
    }

    #[test]
    fn pacer_interval_is_derived_from_quota_and_floored() {
        assert!(RequestPacer::per_minute(0).is_none());
        assert_eq!(RequestPacer::per_minute(30).unwrap().interval(), Duration::from_secs(2));
        assert_eq!(RequestPacer::per_minute(120_000).unwrap().interval(), RequestPacer::MIN_INTERVAL);
        assert_eq!(RequestPacer::per_minute(u32::MAX).unwrap().interval(), RequestPacer::MIN_INTERVAL);
    }

    #[tokio::test]
    async fn pacer_above_one_request_per_millisecond_keeps_granting_turns() {
        let pacer = RequestPacer::per_minute(120_000).unwrap();
        let turns = async {
            for _ in 0..5 {
                pacer.wait_turn().await;
            }
        };
        tokio::time::timeout(Duration::from_secs(2), turns)
            .await
            .expect("pacer must not stall");
    }

    #[tokio::test]
    async fn pacer_spaces_consecutive_turns() {
        let pacer = RequestPacer::per_minute(1_200).unwrap();
        let started = Instant::now();
        pacer.wait_turn().await;
        assert!(started.elapsed() < Duration::from_millis(40));
        pacer.wait_turn().await;
        pacer.wait_turn().await;
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn zero_quota_client_is_unpaced() {
        let client = HttpClient::new(HttpClientConfig {
            requests_per_minute: Some(0),
            ..Default::default()
        })
        .unwrap();
        assert!(client.pacer.is_none());
    }
}
