//! Vendor monthly price trend against the blended copper/tin index.

use std::collections::BTreeMap;

use pricewatch_core::{IndexPoint, PerformanceRow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::StageSummary;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendConfig {
    /// Full type code of the tracked product family.
    pub type_code: String,
    /// Orders whose description carries this option keyword are left out.
    pub exclude_keyword: String,
    /// Last description token every tracked order must end with.
    pub required_suffix: String,
    /// Symmetric rising/falling threshold in percent.
    pub threshold_pct: f64,
}

impl Default for TrendConfig {
    fn default() -> Self {
        Self {
            type_code: "VGBASW3A0A".to_string(),
            exclude_keyword: "LOCK".to_string(),
            required_suffix: "BC6".to_string(),
            threshold_pct: 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Rising,
    Flat,
    Falling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Alignment {
    Good,
    Normal,
    Caution,
    Indeterminate,
}

impl Alignment {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Good => "good",
            Self::Normal => "normal",
            Self::Caution => "caution",
            Self::Indeterminate => "indeterminate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendPoint {
    pub vendor_name: String,
    pub month: String,
    pub average_unit_price: f64,
    pub order_count: usize,
    pub index_value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendComparison {
    pub vendor_name: String,
    pub from_month: String,
    pub to_month: String,
    pub previous_price: f64,
    pub current_price: f64,
    pub price_change_pct: f64,
    pub index_change_pct: Option<f64>,
    pub price_trend: Trend,
    pub index_trend: Option<Trend>,
    pub alignment: Alignment,
    pub estimated_gain_loss: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendReport {
    pub points: Vec<TrendPoint>,
    pub comparisons: Vec<TrendComparison>,
    pub summary: StageSummary,
}

pub fn classify_trend(change_pct: f64, threshold_pct: f64) -> Trend {
    if change_pct > threshold_pct {
        Trend::Rising
    } else if change_pct < -threshold_pct {
        Trend::Falling
    } else {
        Trend::Flat
    }
}

/// Purchasing timing verdict for an own-price move paired with the index move.
pub fn alignment(price: Trend, index: Option<Trend>) -> Alignment {
    let Some(index) = index else {
        return Alignment::Indeterminate;
    };
    match (price, index) {
        (Trend::Rising, Trend::Rising) => Alignment::Normal,
        (Trend::Rising, Trend::Flat) => Alignment::Caution,
        (Trend::Rising, Trend::Falling) => Alignment::Caution,
        (Trend::Flat, Trend::Rising) => Alignment::Good,
        (Trend::Flat, Trend::Flat) => Alignment::Normal,
        (Trend::Flat, Trend::Falling) => Alignment::Caution,
        (Trend::Falling, Trend::Rising) => Alignment::Good,
        (Trend::Falling, Trend::Flat) => Alignment::Good,
        (Trend::Falling, Trend::Falling) => Alignment::Normal,
    }
}

/// Heuristic gain (positive) or loss (negative) on the current price.
pub fn estimate_gain_loss(current_price: f64, price_change_pct: f64, index_change_pct: f64) -> f64 {
    match (price_change_pct != 0.0, index_change_pct != 0.0) {
        (true, true) => current_price * (price_change_pct / (index_change_pct / 2.0)),
        (false, true) => current_price * (index_change_pct / 100.0),
        (true, false) => current_price * (-price_change_pct / 100.0),
        (false, false) => 0.0,
    }
}

fn change_pct(previous: f64, current: f64) -> f64 {
    if previous > 0.0 {
        (current - previous) / previous * 100.0
    } else {
        0.0
    }
}

/// Blended index per `YYYY-MM`; the first observation of a month wins.
pub fn blended_index_by_month(series: &[IndexPoint]) -> BTreeMap<String, f64> {
    let mut months = BTreeMap::new();
    for point in series {
        let month = point.month.trim();
        if month.is_empty() {
            continue;
        }
        months.entry(month.to_string()).or_insert_with(|| point.blended());
    }
    months
}

fn is_tracked(row: &PerformanceRow, config: &TrendConfig) -> bool {
    if row.valve_type != config.type_code.trim() || row.order_date.is_none() {
        return false;
    }
    let description = row.description.to_ascii_uppercase();
    let exclude = config.exclude_keyword.trim().to_ascii_uppercase();
    if !exclude.is_empty() && description.contains(&exclude) {
        return false;
    }
    let suffix = config.required_suffix.trim().to_ascii_uppercase();
    suffix.is_empty() || description.split_whitespace().last() == Some(suffix.as_str())
}

/// (vendor, month) aggregates, sorted by vendor then month.
///
/// The monthly price is the plain mean of per-order unit prices, not quantity weighted.
pub fn vendor_monthly_points(
    performance: &[PerformanceRow],
    config: &TrendConfig,
    index_by_month: &BTreeMap<String, f64>,
) -> Vec<TrendPoint> {
    let mut groups: BTreeMap<(String, String), (f64, usize)> = BTreeMap::new();
    for row in performance.iter().filter(|r| is_tracked(r, config)) {
        let Some(date) = row.order_date else {
            continue;
        };
        let month = date.format("%Y-%m").to_string();
        let entry = groups.entry((row.vendor_name.clone(), month)).or_default();
        entry.0 += row.unit_price();
        entry.1 += 1;
    }

    groups
        .into_iter()
        .map(|((vendor_name, month), (sum, count))| TrendPoint {
            index_value: index_by_month.get(&month).copied(),
            vendor_name,
            month,
            average_unit_price: sum / count as f64,
            order_count: count,
        })
        .collect()
}

pub fn compare_points(previous: &TrendPoint, current: &TrendPoint, threshold_pct: f64) -> TrendComparison {
    let price_change_pct = change_pct(previous.average_unit_price, current.average_unit_price);
    let index_change_pct = match (previous.index_value, current.index_value) {
        (Some(prev), Some(cur)) if prev > 0.0 => Some(change_pct(prev, cur)),
        _ => None,
    };
    let price_trend = classify_trend(price_change_pct, threshold_pct);
    let index_trend = index_change_pct.map(|pct| classify_trend(pct, threshold_pct));

    TrendComparison {
        vendor_name: current.vendor_name.clone(),
        from_month: previous.month.clone(),
        to_month: current.month.clone(),
        previous_price: previous.average_unit_price,
        current_price: current.average_unit_price,
        price_change_pct,
        index_change_pct,
        price_trend,
        index_trend,
        alignment: alignment(price_trend, index_trend),
        estimated_gain_loss: index_change_pct
            .map(|ic| estimate_gain_loss(current.average_unit_price, price_change_pct, ic)),
    }
}

pub fn analyze_trend(performance: &[PerformanceRow], series: &[IndexPoint], config: &TrendConfig) -> TrendReport {
    let index_by_month = blended_index_by_month(series);
    let points = vendor_monthly_points(performance, config, &index_by_month);

    let mut summary = StageSummary::default();
    let mut comparisons = Vec::new();
    for pair in points.windows(2) {
        let (previous, current) = (&pair[0], &pair[1]);
        if previous.vendor_name != current.vendor_name {
            continue;
        }
        let comparison = compare_points(previous, current, config.threshold_pct);
        summary.record_verdict(comparison.alignment.as_str());
        comparisons.push(comparison);
    }

    debug!(
        points = points.len(),
        comparisons = comparisons.len(),
        family = %config.type_code,
        "trend analysis complete"
    );

    TrendReport {
        points,
        comparisons,
        summary,
    }
}
