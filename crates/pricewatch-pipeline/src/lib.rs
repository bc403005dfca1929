//! Validation pipeline orchestration: stages A1/A2 (purchase requests), B1/B2 (vendor quotes),
//! fairness classification, market trend and optional commentary.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use pricewatch_adapters::{CommentaryGenerator, LlmCommentary, LlmCommentaryConfig};
use pricewatch_core::{FairnessRecord, PerformanceRow, PrItem, VendorQuoteRow};
use pricewatch_storage::{HttpClient, HttpClientConfig, RecordStore, SecondaryIndexMode, StoreCounts};
use serde::{Deserialize, Serialize};
use tracing::{info, info_span, warn};
use uuid::Uuid;

pub mod commentary;
pub mod contract;
pub mod fairness;
pub mod history;
pub mod options;
pub mod trend;

pub use commentary::{annotate_with_fallback, fallback_commentary};
pub use contract::{run_stage_a1, run_stage_b1, ContractRecommendation, MatchResult, QuoteContractComparison};
pub use fairness::run_fairness_stage;
pub use history::{run_stage_a2, run_stage_b2, HistoryExpectation, PerformanceMatch, QuoteHistoryComparison};
pub use trend::{analyze_trend, TrendConfig, TrendReport};

pub const CRATE_NAME: &str = "pricewatch-pipeline";

pub const DEFAULT_OVERRIDES_FILE: &str = "pricewatch.yaml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageSummary {
    pub total: usize,
    pub matched: usize,
    pub unmatched: usize,
    pub tiers: BTreeMap<String, usize>,
    pub verdicts: BTreeMap<String, usize>,
}

impl StageSummary {
    pub fn record_match(&mut self, tier: &str, matched: bool) {
        self.total += 1;
        if matched {
            self.matched += 1;
        } else {
            self.unmatched += 1;
        }
        *self.tiers.entry(tier.to_string()).or_default() += 1;
    }

    /// `indeterminate` verdicts count as unmatched.
    pub fn record_verdict(&mut self, verdict: &str) {
        self.total += 1;
        if verdict == "indeterminate" {
            self.unmatched += 1;
        } else {
            self.matched += 1;
        }
        *self.verdicts.entry(verdict.to_string()).or_default() += 1;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport<T> {
    pub results: Vec<T>,
    pub summary: StageSummary,
}

/// Quote identity carried into every quote-stage result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteSummary {
    pub material_id: String,
    pub description: String,
    pub vendor_name: String,
    pub valve_type: Option<String>,
    pub derived_key: Option<String>,
    pub quantity: f64,
    pub quoted_price: f64,
}

impl From<&VendorQuoteRow> for QuoteSummary {
    fn from(quote: &VendorQuoteRow) -> Self {
        Self {
            material_id: quote.material_id.clone(),
            description: quote.description.clone(),
            vendor_name: quote.vendor_name.clone(),
            valve_type: quote.valve_type.clone(),
            derived_key: quote.derived_key.clone(),
            quantity: quote.quantity,
            quoted_price: quote.quoted_price,
        }
    }
}

/// Signed percentage of `actual` over `base`; `None` when there is no positive base.
pub fn percent_difference(actual: f64, base: f64) -> Option<f64> {
    if base > 0.0 {
        Some((actual - base) / base * 100.0)
    } else {
        None
    }
}

/// One representative item per (type code, description); a later-dated order replaces an earlier one.
pub fn extract_pr_items(performance: &[PerformanceRow]) -> Vec<PrItem> {
    let mut positions: BTreeMap<(&str, &str), usize> = BTreeMap::new();
    let mut items: Vec<PrItem> = Vec::new();
    for row in performance {
        let key = (row.valve_type.as_str(), row.description.as_str());
        match positions.get(&key) {
            Some(&idx) => {
                if row.order_date > items[idx].order_date {
                    items[idx] = PrItem::from(row);
                }
            }
            None => {
                positions.insert(key, items.len());
                items.push(PrItem::from(row));
            }
        }
    }
    items
}

fn env_flag(value: &str) -> bool {
    matches!(value, "1" | "true" | "TRUE" | "True" | "yes")
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub dataset_path: PathBuf,
    pub secondary_index: SecondaryIndexMode,
    pub deep_analysis: bool,
    pub trend: TrendConfig,
    pub commentary_url: Option<String>,
    pub commentary_model: String,
    pub commentary_api_key: Option<String>,
    pub commentary_delay: Duration,
    pub commentary_rpm: Option<u32>,
    pub http_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from_vars(|_| None)
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let trend_defaults = TrendConfig::default();
        Self {
            dataset_path: var("PRICEWATCH_DATASET")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            secondary_index: var("PRICEWATCH_SECONDARY_INDEX")
                .and_then(|v| SecondaryIndexMode::parse(&v))
                .unwrap_or_default(),
            deep_analysis: var("PRICEWATCH_DEEP_ANALYSIS")
                .map(|v| env_flag(&v))
                .unwrap_or(true),
            trend: TrendConfig {
                type_code: var("PRICEWATCH_TREND_TYPE_CODE").unwrap_or(trend_defaults.type_code),
                exclude_keyword: var("PRICEWATCH_TREND_EXCLUDE").unwrap_or(trend_defaults.exclude_keyword),
                required_suffix: var("PRICEWATCH_TREND_SUFFIX").unwrap_or(trend_defaults.required_suffix),
                threshold_pct: trend_defaults.threshold_pct,
            },
            commentary_url: var("PRICEWATCH_COMMENTARY_URL").filter(|v| !v.trim().is_empty()),
            commentary_model: var("PRICEWATCH_COMMENTARY_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
            commentary_api_key: var("PRICEWATCH_COMMENTARY_API_KEY").filter(|v| !v.trim().is_empty()),
            commentary_delay: Duration::from_millis(
                var("PRICEWATCH_COMMENTARY_DELAY_MS")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(1000),
            ),
            commentary_rpm: var("PRICEWATCH_COMMENTARY_RPM")
                .and_then(|v| v.parse().ok())
                .filter(|rpm| *rpm > 0),
            http_timeout_secs: var("PRICEWATCH_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
        }
    }

    /// Environment config plus `PRICEWATCH_CONFIG` (or `pricewatch.yaml`) overrides when present.
    pub fn load() -> Result<Self> {
        let config = Self::from_env();
        let path = std::env::var("PRICEWATCH_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_OVERRIDES_FILE));
        if path.is_file() {
            config.with_overrides_file(&path)
        } else {
            Ok(config)
        }
    }

    pub fn with_overrides_file(self, path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let overrides: PipelineOverrides =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        Ok(self.with_overrides(overrides))
    }

    pub fn with_overrides(mut self, overrides: PipelineOverrides) -> Self {
        if let Some(path) = overrides.dataset {
            self.dataset_path = path;
        }
        if let Some(mode) = overrides.secondary_index {
            self.secondary_index = mode;
        }
        if let Some(deep) = overrides.deep_analysis {
            self.deep_analysis = deep;
        }
        if let Some(trend) = overrides.trend {
            if let Some(v) = trend.type_code {
                self.trend.type_code = v;
            }
            if let Some(v) = trend.exclude_keyword {
                self.trend.exclude_keyword = v;
            }
            if let Some(v) = trend.required_suffix {
                self.trend.required_suffix = v;
            }
            if let Some(v) = trend.threshold_pct {
                self.trend.threshold_pct = v;
            }
        }
        self
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PipelineOverrides {
    #[serde(default)]
    pub dataset: Option<PathBuf>,
    #[serde(default)]
    pub secondary_index: Option<SecondaryIndexMode>,
    #[serde(default)]
    pub deep_analysis: Option<bool>,
    #[serde(default)]
    pub trend: Option<TrendOverrides>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TrendOverrides {
    pub type_code: Option<String>,
    pub exclude_keyword: Option<String>,
    pub required_suffix: Option<String>,
    pub threshold_pct: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub counts: StoreCounts,
    pub stage_a1: StageReport<ContractRecommendation>,
    pub stage_a2: StageReport<HistoryExpectation>,
    pub stage_b1: StageReport<QuoteContractComparison>,
    pub stage_b2: StageReport<QuoteHistoryComparison>,
    pub fairness: StageReport<FairnessRecord>,
    pub trend: TrendReport,
}

pub struct ValidationPipeline {
    store: Arc<RecordStore>,
    config: PipelineConfig,
    commentary: Option<Box<dyn CommentaryGenerator>>,
}

impl ValidationPipeline {
    pub fn new(store: Arc<RecordStore>, config: PipelineConfig) -> Self {
        Self {
            store,
            config,
            commentary: None,
        }
    }

    pub fn with_commentary(mut self, generator: Box<dyn CommentaryGenerator>) -> Self {
        self.commentary = Some(generator);
        self
    }

    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn pr_items(&self) -> Vec<PrItem> {
        extract_pr_items(self.store.performance())
    }

    pub fn stage_a1(&self) -> StageReport<ContractRecommendation> {
        run_stage_a1(&self.store, self.config.secondary_index, &self.pr_items())
    }

    pub fn stage_a2(&self) -> StageReport<HistoryExpectation> {
        run_stage_a2(&self.store, &self.pr_items())
    }

    pub fn stage_b1(&self) -> StageReport<QuoteContractComparison> {
        run_stage_b1(&self.store, self.config.secondary_index, self.config.deep_analysis)
    }

    pub fn stage_b2(&self) -> StageReport<QuoteHistoryComparison> {
        run_stage_b2(&self.store)
    }

    pub fn fairness(&self) -> StageReport<FairnessRecord> {
        run_fairness_stage(&self.stage_b1().results, &self.stage_b2().results)
    }

    pub fn trend(&self) -> TrendReport {
        analyze_trend(self.store.performance(), self.store.index_series(), &self.config.trend)
    }

    /// Every stage without commentary.
    pub fn run(&self) -> PipelineReport {
        let span = info_span!("validation_run");
        let _guard = span.enter();

        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let items = self.pr_items();

        let stage_a1 = run_stage_a1(&self.store, self.config.secondary_index, &items);
        let stage_a2 = run_stage_a2(&self.store, &items);
        let stage_b1 = self.stage_b1();
        let stage_b2 = self.stage_b2();
        let fairness = run_fairness_stage(&stage_b1.results, &stage_b2.results);
        let trend = self.trend();

        info!(
            %run_id,
            pr_items = items.len(),
            quotes = stage_b1.summary.total,
            contract_matched = stage_b1.summary.matched,
            history_matched = stage_b2.summary.matched,
            trend_legs = trend.comparisons.len(),
            "validation run complete"
        );

        PipelineReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            counts: self.store.counts(),
            stage_a1,
            stage_a2,
            stage_b1,
            stage_b2,
            fairness,
            trend,
        }
    }

    /// [`run`](Self::run), then annotate fairness records; rule-based text when no generator is set.
    pub async fn run_with_commentary(&self) -> PipelineReport {
        let mut report = self.run();
        match &self.commentary {
            Some(generator) => {
                let generated =
                    annotate_with_fallback(generator.as_ref(), &mut report.fairness.results, self.config.commentary_delay)
                        .await;
                if generated < report.fairness.results.len() {
                    warn!(
                        generated,
                        total = report.fairness.results.len(),
                        "some fairness records fell back to rule-based commentary"
                    );
                }
            }
            None => {
                for record in &mut report.fairness.results {
                    record.commentary = Some(fallback_commentary(record));
                }
            }
        }
        report.finished_at = Utc::now();
        report
    }
}

/// HTTP-backed generator when a commentary endpoint is configured.
pub fn build_commentary_generator(config: &PipelineConfig) -> Result<Option<Box<dyn CommentaryGenerator>>> {
    let Some(endpoint) = config.commentary_url.clone() else {
        return Ok(None);
    };
    let http = HttpClient::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(format!("pricewatch/{}", env!("CARGO_PKG_VERSION"))),
        requests_per_minute: config.commentary_rpm,
        ..Default::default()
    })?;
    Ok(Some(Box::new(LlmCommentary::new(
        Arc::new(http),
        LlmCommentaryConfig {
            endpoint,
            model: config.commentary_model.clone(),
            api_key: config.commentary_api_key.clone(),
            max_tokens: 300,
        },
    ))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pricewatch_core::parse_loose_date;

    fn order(material_id: &str, valve_type: &str, description: &str, date: &str) -> PerformanceRow {
        PerformanceRow {
            material_id: material_id.into(),
            description: description.into(),
            valve_type: valve_type.into(),
            derived_key: String::new(),
            ordered_quantity: 1.0,
            order_amount: 100.0,
            order_date: parse_loose_date(date),
            vendor_name: "Acme".into(),
            inner_paint: String::new(),
            outer_paint: String::new(),
            detail_spec: String::new(),
        }
    }

    #[test]
    fn summary_counts_tiers_and_verdicts() {
        let mut summary = StageSummary::default();
        summary.record_match("type_size", true);
        summary.record_match("unmatched", false);
        summary.record_match("type_size", true);
        assert_eq!((summary.total, summary.matched, summary.unmatched), (3, 2, 1));
        assert_eq!(summary.tiers.get("type_size"), Some(&2));

        let mut verdicts = StageSummary::default();
        verdicts.record_verdict("excellent");
        verdicts.record_verdict("indeterminate");
        assert_eq!((verdicts.matched, verdicts.unmatched), (1, 1));
    }

    #[test]
    fn percent_difference_needs_positive_base() {
        assert_eq!(percent_difference(1200.0, 1000.0), Some(20.0));
        assert_eq!(percent_difference(800.0, 1000.0), Some(-20.0));
        assert_eq!(percent_difference(10.0, 0.0), None);
    }

    #[test]
    fn pr_items_keep_first_seen_order_and_newest_row() {
        let rows = vec![
            order("M1", "VGBASW3A0A", "GATE 50A", "2023-01-01"),
            order("M2", "VGLBXX8A0A", "GLOBE 80A", "2023-05-01"),
            order("M3", "VGBASW3A0A", "GATE 50A", "2024-01-01"),
            order("M4", "VGBASW3A0A", "GATE 50A", "2024-01-01"),
            order("M5", "VGBASW3A0A", "GATE 50A", ""),
        ];
        let items = extract_pr_items(&rows);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].material_id, "M3");
        assert_eq!(items[1].material_id, "M2");
    }

    #[test]
    fn config_from_vars_and_defaults() {
        let vars: BTreeMap<&str, &str> = [
            ("PRICEWATCH_DATASET", "/tmp/set"),
            ("PRICEWATCH_SECONDARY_INDEX", "full"),
            ("PRICEWATCH_DEEP_ANALYSIS", "0"),
            ("PRICEWATCH_TREND_TYPE_CODE", "VGLBXX8A0A"),
            ("PRICEWATCH_COMMENTARY_DELAY_MS", "250"),
            ("PRICEWATCH_COMMENTARY_URL", "  "),
        ]
        .into_iter()
        .collect();
        let config = PipelineConfig::from_vars(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.dataset_path, PathBuf::from("/tmp/set"));
        assert_eq!(config.secondary_index, SecondaryIndexMode::FullTypeCode);
        assert!(!config.deep_analysis);
        assert_eq!(config.trend.type_code, "VGLBXX8A0A");
        assert_eq!(config.trend.required_suffix, "BC6");
        assert_eq!(config.commentary_delay, Duration::from_millis(250));
        assert!(config.commentary_url.is_none());

        let defaults = PipelineConfig::default();
        assert_eq!(defaults.secondary_index, SecondaryIndexMode::TypePrefix);
        assert!(defaults.deep_analysis);
        assert_eq!(defaults.http_timeout_secs, 60);
    }

    #[test]
    fn yaml_overrides_replace_only_named_fields() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("pricewatch.yaml");
        std::fs::write(
            &path,
            "secondary_index: full_type_code\ntrend:\n  required_suffix: SCS13\n  threshold_pct: 5.0\n",
        )
        .expect("write overrides");

        let config = PipelineConfig::default().with_overrides_file(&path).expect("overrides");
        assert_eq!(config.secondary_index, SecondaryIndexMode::FullTypeCode);
        assert_eq!(config.trend.required_suffix, "SCS13");
        assert_eq!(config.trend.threshold_pct, 5.0);
        assert_eq!(config.trend.exclude_keyword, "LOCK");
    }

    #[test]
    fn no_endpoint_means_no_generator() {
        let generator = build_commentary_generator(&PipelineConfig::default()).expect("build");
        assert!(generator.is_none());
    }

    #[test]
    fn generator_builds_for_quota_above_one_per_millisecond() {
        let config = PipelineConfig {
            commentary_url: Some("http://127.0.0.1:9/v1/chat/completions".into()),
            commentary_rpm: Some(120_000),
            ..PipelineConfig::default()
        };
        assert!(build_commentary_generator(&config).expect("build").is_some());
    }

    #[tokio::test]
    async fn run_without_generator_uses_rule_based_commentary() {
        let store = RecordStore::new(
            vec![],
            vec![order("M1", "VGBASW3A0A", "GATE 50A 10K", "2024-01-01")],
            vec![VendorQuoteRow {
                material_id: "M1".into(),
                description: "GATE 50A 10K".into(),
                quantity: 1.0,
                quoted_price: 95.0,
                vendor_name: "Acme".into(),
                inner_paint: String::new(),
                outer_paint: String::new(),
                detail_spec: String::new(),
                valve_type: None,
                derived_key: None,
                breakdown: vec![],
            }],
            vec![],
        )
        .shared();
        let report = ValidationPipeline::new(store, PipelineConfig::default())
            .run_with_commentary()
            .await;
        assert_eq!(report.counts.quote_rows, 1);
        assert_eq!(report.stage_a1.summary.total, 1);
        assert_eq!(report.stage_b1.summary.unmatched, 1);
        let record = &report.fairness.results[0];
        assert!(record.commentary.is_some());
        assert!(report.finished_at >= report.started_at);
    }
}
