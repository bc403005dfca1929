//! Dataset loading + commentary collaborator contracts.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pricewatch_core::{FairnessRecord, IndexPoint, PerformanceRow, PriceTableRow, VendorQuoteRow};
use pricewatch_storage::{FetchError, HttpClient, RecordStore};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::info;

pub const CRATE_NAME: &str = "pricewatch-adapters";

pub const PRICE_TABLE_FILE: &str = "price_table.json";
pub const PERFORMANCE_FILE: &str = "performance.json";
pub const QUOTES_FILE: &str = "quotes.json";
pub const INDEX_SERIES_FILE: &str = "index_series.json";

/// Normalized tables handed over by the spreadsheet conversion step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetBundle {
    #[serde(default)]
    pub dataset_id: String,
    #[serde(default)]
    pub captured_at: Option<DateTime<Utc>>,
    pub price_table: Vec<PriceTableRow>,
    pub performance: Vec<PerformanceRow>,
    #[serde(default)]
    pub quotes: Vec<VendorQuoteRow>,
    #[serde(default)]
    pub index_series: Vec<IndexPoint>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl DatasetBundle {
    pub fn into_store(self) -> RecordStore {
        RecordStore::new(self.price_table, self.performance, self.quotes, self.index_series)
    }
}

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("required table {table} is missing from {location}")]
    MissingTable { table: &'static str, location: String },
    #[error("dataset path {0} does not exist")]
    NotFound(String),
}

/// Load either a single bundle file or a directory holding one JSON file per table.
pub fn load_dataset(path: impl AsRef<Path>) -> Result<DatasetBundle> {
    let path = path.as_ref();
    if path.is_dir() {
        load_dataset_dir(path)
    } else if path.is_file() {
        load_dataset_bundle(path)
    } else {
        Err(DatasetError::NotFound(path.display().to_string()).into())
    }
}

pub fn load_dataset_bundle(path: impl AsRef<Path>) -> Result<DatasetBundle> {
    let path = path.as_ref();
    let bundle: DatasetBundle = read_json_file(path)?;
    log_loaded(&bundle, path);
    Ok(bundle)
}

pub fn load_dataset_dir(dir: impl AsRef<Path>) -> Result<DatasetBundle> {
    let dir = dir.as_ref();
    let price_table = read_required_table(dir, PRICE_TABLE_FILE, "price_table")?;
    let performance = read_required_table(dir, PERFORMANCE_FILE, "performance")?;
    let quotes = read_optional_table(dir, QUOTES_FILE)?;
    let index_series = read_optional_table(dir, INDEX_SERIES_FILE)?;

    let bundle = DatasetBundle {
        dataset_id: dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default(),
        captured_at: None,
        price_table,
        performance,
        quotes,
        index_series,
        notes: None,
    };
    log_loaded(&bundle, dir);
    Ok(bundle)
}

pub fn load_record_store(path: impl AsRef<Path>) -> Result<Arc<RecordStore>> {
    Ok(load_dataset(path)?.into_store().shared())
}

fn log_loaded(bundle: &DatasetBundle, path: &Path) {
    info!(
        path = %path.display(),
        price_rows = bundle.price_table.len(),
        performance_rows = bundle.performance.len(),
        quote_rows = bundle.quotes.len(),
        index_points = bundle.index_series.len(),
        "loaded dataset"
    );
}

fn read_required_table<T: DeserializeOwned>(
    dir: &Path,
    file: &str,
    table: &'static str,
) -> Result<Vec<T>> {
    let path = dir.join(file);
    if !path.exists() {
        return Err(DatasetError::MissingTable {
            table,
            location: dir.display().to_string(),
        }
        .into());
    }
    read_json_file(&path)
}

fn read_optional_table<T: DeserializeOwned>(dir: &Path, file: &str) -> Result<Vec<T>> {
    let path = dir.join(file);
    if !path.exists() {
        return Ok(Vec::new());
    }
    read_json_file(&path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Error)]
pub enum CommentaryError {
    #[error("commentary generation is disabled")]
    Disabled,
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("commentary response carried no text")]
    EmptyResponse,
}

/// Opaque text producer for a single fairness record.
#[async_trait]
pub trait CommentaryGenerator: Send + Sync {
    fn name(&self) -> &'static str;

    async fn generate(&self, record: &FairnessRecord) -> Result<String, CommentaryError>;
}

#[derive(Debug, Default)]
pub struct DisabledCommentary;

#[async_trait]
impl CommentaryGenerator for DisabledCommentary {
    fn name(&self) -> &'static str {
        "disabled"
    }

    async fn generate(&self, _record: &FairnessRecord) -> Result<String, CommentaryError> {
        Err(CommentaryError::Disabled)
    }
}

#[derive(Debug, Clone)]
pub struct LlmCommentaryConfig {
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    pub max_tokens: u32,
}

/// Chat-completions backed commentary writer.
#[derive(Debug)]
pub struct LlmCommentary {
    http: Arc<HttpClient>,
    config: LlmCommentaryConfig,
}

impl LlmCommentary {
    pub fn new(http: Arc<HttpClient>, config: LlmCommentaryConfig) -> Self {
        Self { http, config }
    }

    pub fn request_payload(&self, record: &FairnessRecord) -> JsonValue {
        json!({
            "model": self.config.model,
            "max_tokens": self.config.max_tokens,
            "messages": [
                {
                    "role": "system",
                    "content": "You are a purchasing analyst. In two or three sentences, explain whether the vendor quote is reasonable and what the buyer should negotiate.",
                },
                {
                    "role": "user",
                    "content": prompt_for(record),
                },
            ],
        })
    }
}

#[async_trait]
impl CommentaryGenerator for LlmCommentary {
    fn name(&self) -> &'static str {
        "llm"
    }

    async fn generate(&self, record: &FairnessRecord) -> Result<String, CommentaryError> {
        let payload = self.request_payload(record);
        let response = self
            .http
            .post_json(&self.config.endpoint, self.config.api_key.as_deref(), &payload)
            .await?;
        extract_completion_text(&response.body).ok_or(CommentaryError::EmptyResponse)
    }
}

pub fn prompt_for(record: &FairnessRecord) -> String {
    let pct = |v: Option<f64>| v.map(|p| format!("{p:+.1}%")).unwrap_or_else(|| "n/a".into());
    let mut lines = vec![
        format!("material: {} ({})", record.material_id, record.description),
        format!("vendor: {}", record.vendor_name),
        format!("quantity: {}", record.quantity),
        format!("quoted total: {:.0}", record.quoted_price),
        format!("contract total: {:.0} (quote {})", record.contract_total, pct(record.contract_diff_pct)),
        format!("recent order equivalent: {:.0} (quote {})", record.recent_order_price, pct(record.recent_diff_pct)),
        format!("negotiation target: {:.0}", record.negotiation_target),
        format!("verdict: {}", record.verdict.as_str()),
    ];
    if !record.causes.is_empty() {
        lines.push(format!("difference causes: {}", record.causes.join("; ")));
    }
    lines.join("\n")
}

/// OpenAI-style `choices[0].message.content`, falling back to Anthropic-style `content[0].text`.
pub fn extract_completion_text(body: &JsonValue) -> Option<String> {
    let text = body
        .pointer("/choices/0/message/content")
        .and_then(|v| v.as_str())
        .or_else(|| body.pointer("/content/0/text").and_then(|v| v.as_str()))?;
    let text = text.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}
