//! Recent-order price resolution (A2 for purchase requests, B2 for vendor quotes).

use chrono::NaiveDate;
use pricewatch_core::{
    description_keywords, most_recent, PerformanceRow, PrItem, VendorQuoteRow, NEGOTIATION_RATIO,
};
use pricewatch_storage::RecordStore;
use serde::{Deserialize, Serialize};

use crate::{percent_difference, QuoteSummary, StageReport, StageSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryTier {
    ExactDescription,
    SimilarType,
    Unmapped,
}

impl HistoryTier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ExactDescription => "exact_description",
            Self::SimilarType => "similar_type",
            Self::Unmapped => "unmapped",
        }
    }
}

/// How the candidate pool of historical orders was selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchBasis {
    DerivedKey,
    DescriptionKeywords,
    None,
}

#[derive(Debug, Clone, Copy)]
pub struct HistoryTarget<'a> {
    pub material_id: &'a str,
    pub description: &'a str,
    pub derived_key: Option<&'a str>,
    pub quantity: f64,
    pub exclude_own_material: bool,
}

impl<'a> From<&'a PrItem> for HistoryTarget<'a> {
    fn from(item: &'a PrItem) -> Self {
        Self {
            material_id: &item.material_id,
            description: &item.description,
            derived_key: Some(item.derived_key.as_str()).filter(|k| !k.is_empty()),
            quantity: item.quantity,
            exclude_own_material: true,
        }
    }
}

impl<'a> From<&'a VendorQuoteRow> for HistoryTarget<'a> {
    fn from(quote: &'a VendorQuoteRow) -> Self {
        Self {
            material_id: &quote.material_id,
            description: &quote.description,
            derived_key: quote.derived_key.as_deref().filter(|k| !k.is_empty()),
            quantity: quote.quantity,
            exclude_own_material: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMatch {
    pub match_tier: HistoryTier,
    pub basis: MatchBasis,
    pub pool_size: usize,
    pub matched_material_id: Option<String>,
    pub matched_description: Option<String>,
    pub matched_vendor: Option<String>,
    pub matched_order_date: Option<NaiveDate>,
    pub recent_unit_price: f64,
    pub expected_price: f64,
    pub negotiation_target: f64,
}

impl PerformanceMatch {
    fn unmapped(basis: MatchBasis) -> Self {
        Self {
            match_tier: HistoryTier::Unmapped,
            basis,
            pool_size: 0,
            matched_material_id: None,
            matched_description: None,
            matched_vendor: None,
            matched_order_date: None,
            recent_unit_price: 0.0,
            expected_price: 0.0,
            negotiation_target: 0.0,
        }
    }

    pub fn is_mapped(&self) -> bool {
        self.match_tier != HistoryTier::Unmapped
    }
}

fn candidate_pool<'s>(store: &'s RecordStore, target: &HistoryTarget<'_>) -> (MatchBasis, Vec<&'s PerformanceRow>) {
    let keep = |row: &&PerformanceRow| !(target.exclude_own_material && row.material_id == target.material_id);

    if let Some(key) = target.derived_key {
        let pool = store
            .performance_by_derived_key(key)
            .into_iter()
            .filter(keep)
            .collect();
        return (MatchBasis::DerivedKey, pool);
    }

    let wanted = description_keywords(target.description);
    if !wanted.is_complete() {
        return (MatchBasis::None, Vec::new());
    }
    let pool = store
        .performance()
        .iter()
        .filter(keep)
        .filter(|row| wanted.similar_to(&description_keywords(&row.description)))
        .collect();
    (MatchBasis::DescriptionKeywords, pool)
}

pub fn resolve_recent_price(store: &RecordStore, target: HistoryTarget<'_>) -> PerformanceMatch {
    let (basis, pool) = candidate_pool(store, &target);
    if pool.is_empty() {
        return PerformanceMatch::unmapped(basis);
    }

    let description = target.description.trim();
    let exact = most_recent(pool.iter().copied().filter(|row| row.description.trim() == description));
    let (tier, row) = match exact {
        Some(row) => (HistoryTier::ExactDescription, row),
        None => match most_recent(pool.iter().copied()) {
            Some(row) => (HistoryTier::SimilarType, row),
            None => return PerformanceMatch::unmapped(basis),
        },
    };

    let recent_unit_price = row.unit_price();
    let expected_price = recent_unit_price * target.quantity;
    PerformanceMatch {
        match_tier: tier,
        basis,
        pool_size: pool.len(),
        matched_material_id: Some(row.material_id.clone()),
        matched_description: Some(row.description.clone()),
        matched_vendor: Some(row.vendor_name.clone()).filter(|v| !v.is_empty()),
        matched_order_date: row.order_date,
        recent_unit_price,
        expected_price,
        negotiation_target: expected_price * NEGOTIATION_RATIO,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryExpectation {
    pub item: PrItem,
    pub history: PerformanceMatch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteHistoryComparison {
    pub quote: QuoteSummary,
    pub history: PerformanceMatch,
    pub difference: Option<f64>,
    pub difference_pct: Option<f64>,
}

pub fn run_stage_a2(store: &RecordStore, items: &[PrItem]) -> StageReport<HistoryExpectation> {
    let mut summary = StageSummary::default();
    let results = items
        .iter()
        .map(|item| {
            let history = resolve_recent_price(store, item.into());
            summary.record_match(history.match_tier.as_str(), history.is_mapped());
            HistoryExpectation {
                item: item.clone(),
                history,
            }
        })
        .collect();
    StageReport { results, summary }
}

pub fn run_stage_b2(store: &RecordStore) -> StageReport<QuoteHistoryComparison> {
    let mut summary = StageSummary::default();
    let results = store
        .quotes()
        .iter()
        .map(|quote| {
            let history = resolve_recent_price(store, quote.into());
            summary.record_match(history.match_tier.as_str(), history.is_mapped());
            let (difference, difference_pct) = if history.is_mapped() {
                (
                    Some(quote.quoted_price - history.expected_price),
                    percent_difference(quote.quoted_price, history.expected_price),
                )
            } else {
                (None, None)
            };
            QuoteHistoryComparison {
                quote: QuoteSummary::from(quote),
                history,
                difference,
                difference_pct,
            }
        })
        .collect();
    StageReport { results, summary }
}
