//! Contract price resolution (A1 for purchase requests, B1 for vendor quotes).

use pricewatch_core::{type_size_key, PrItem, PriceTableRow, QuoteLine, VendorQuoteRow};
use pricewatch_storage::{RecordStore, SecondaryIndexMode};
use serde::{Deserialize, Serialize};

use crate::options::{compute_option_price, parse_option_tokens, OptionCharge};
use crate::{percent_difference, QuoteSummary, StageReport, StageSummary};

/// Absolute component difference a line item must exceed to be reported as a cause.
pub const CAUSE_THRESHOLD: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    Matched,
    Unmatched,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractTier {
    TypeAndSize,
    TypeOnly,
}

impl ContractTier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TypeAndSize => "type_and_size",
            Self::TypeOnly => "type_only",
        }
    }
}

/// Fields of a purchase request or quote that drive contract pricing.
#[derive(Debug, Clone, Copy)]
pub struct ContractTarget<'a> {
    pub valve_type: &'a str,
    /// Type+size key supplied with the record; derived from `valve_type` when absent.
    pub derived_key: Option<&'a str>,
    pub description: &'a str,
    pub quantity: f64,
    pub inner_paint: Option<&'a str>,
    pub outer_paint: Option<&'a str>,
    pub detail_spec: Option<&'a str>,
}

impl ContractTarget<'_> {
    pub fn type_size_key(&self) -> String {
        match self.derived_key {
            Some(key) => key.trim().to_string(),
            None => type_size_key(self.valve_type),
        }
    }
}

impl<'a> From<&'a PrItem> for ContractTarget<'a> {
    fn from(item: &'a PrItem) -> Self {
        Self {
            valve_type: &item.valve_type,
            derived_key: Some(item.derived_key.as_str()).filter(|k| !k.is_empty()),
            description: &item.description,
            quantity: item.quantity,
            inner_paint: Some(item.inner_paint.as_str()),
            outer_paint: Some(item.outer_paint.as_str()),
            detail_spec: Some(item.detail_spec.as_str()),
        }
    }
}

impl<'a> From<&'a VendorQuoteRow> for ContractTarget<'a> {
    fn from(quote: &'a VendorQuoteRow) -> Self {
        Self {
            valve_type: quote.valve_type.as_deref().unwrap_or_default(),
            derived_key: quote.derived_key.as_deref().filter(|k| !k.is_empty()),
            description: &quote.description,
            quantity: quote.quantity,
            inner_paint: Some(quote.inner_paint.as_str()),
            outer_paint: Some(quote.outer_paint.as_str()),
            detail_spec: Some(quote.detail_spec.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub status: MatchStatus,
    pub match_tier: Option<ContractTier>,
    pub matched_key: Option<String>,
    pub contract_vendor: Option<String>,
    pub quantity: f64,
    pub body_unit_price: f64,
    pub body_price: f64,
    pub option_unit_price: f64,
    pub option_price: f64,
    pub option_breakdown: Vec<OptionCharge>,
    pub option_tokens: Vec<String>,
    pub total: f64,
}

impl MatchResult {
    fn unmatched(quantity: f64, option_tokens: Vec<String>) -> Self {
        Self {
            status: MatchStatus::Unmatched,
            match_tier: None,
            matched_key: None,
            contract_vendor: None,
            quantity,
            body_unit_price: 0.0,
            body_price: 0.0,
            option_unit_price: 0.0,
            option_price: 0.0,
            option_breakdown: Vec::new(),
            option_tokens,
            total: 0.0,
        }
    }

    pub fn is_matched(&self) -> bool {
        self.status == MatchStatus::Matched
    }
}

/// First price row of the type+size bucket, else of the fallback bucket.
pub fn select_price_row<'s>(
    store: &'s RecordStore,
    mode: SecondaryIndexMode,
    target: &ContractTarget<'_>,
) -> Option<(ContractTier, &'s PriceTableRow)> {
    let primary = target.type_size_key();
    if let Some(row) = store.price_rows_by_type_size(&primary).into_iter().next() {
        return Some((ContractTier::TypeAndSize, row));
    }
    let secondary = mode.key_for(target.valve_type);
    store
        .price_rows_secondary(mode, &secondary)
        .into_iter()
        .next()
        .map(|row| (ContractTier::TypeOnly, row))
}

pub fn resolve_contract_price(
    store: &RecordStore,
    mode: SecondaryIndexMode,
    target: ContractTarget<'_>,
) -> MatchResult {
    let option_tokens = parse_option_tokens(target.description);
    let Some((tier, row)) = select_price_row(store, mode, &target) else {
        return MatchResult::unmatched(target.quantity, option_tokens);
    };

    let options = compute_option_price(
        &row.options,
        &option_tokens,
        target.inner_paint,
        target.outer_paint,
        target.detail_spec,
    );
    let body_unit_price = row.body_price_per_unit();
    let body_price = body_unit_price * target.quantity;
    let scaled = options.scaled(target.quantity);

    MatchResult {
        status: MatchStatus::Matched,
        match_tier: Some(tier),
        matched_key: Some(row.valve_type_key.clone()),
        contract_vendor: Some(row.vendor_name.clone()).filter(|v| !v.is_empty()),
        quantity: target.quantity,
        body_unit_price,
        body_price,
        option_unit_price: options.total,
        option_price: scaled.total,
        option_breakdown: scaled.breakdown,
        option_tokens,
        total: body_price + scaled.total,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractRecommendation {
    pub item: PrItem,
    pub contract: MatchResult,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostCause {
    pub component: String,
    pub contract_amount: f64,
    pub quoted_amount: f64,
    pub difference: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteContractComparison {
    pub quote: QuoteSummary,
    pub contract: MatchResult,
    pub difference: Option<f64>,
    pub difference_pct: Option<f64>,
    pub causes: Vec<CostCause>,
}

/// Line-item differences between the contract reconstruction and the quote.
///
/// Without a vendor breakdown the whole gap is reported as a single `TOTAL` component.
pub fn analyze_causes(contract: &MatchResult, quoted_total: f64, breakdown: &[QuoteLine]) -> Vec<CostCause> {
    let mut causes = Vec::new();
    if !contract.is_matched() {
        return causes;
    }

    let mut push = |component: &str, contract_amount: f64, quoted_amount: f64| {
        let difference = quoted_amount - contract_amount;
        if difference.abs() > CAUSE_THRESHOLD {
            causes.push(CostCause {
                component: component.to_string(),
                contract_amount,
                quoted_amount,
                difference,
            });
        }
    };

    if breakdown.is_empty() {
        push("TOTAL", contract.total, quoted_total);
        return causes;
    }

    let quoted_for = |label: &str| -> f64 {
        breakdown
            .iter()
            .filter(|line| line.label.trim().eq_ignore_ascii_case(label))
            .map(|line| line.amount)
            .sum()
    };

    push("BODY", contract.body_price, quoted_for("BODY"));
    for charge in &contract.option_breakdown {
        push(&charge.label, charge.amount, quoted_for(&charge.label));
    }

    let mut extra_labels = Vec::<String>::new();
    for line in breakdown {
        let label = line.label.trim().to_ascii_uppercase();
        let known = label == "BODY"
            || contract
                .option_breakdown
                .iter()
                .any(|c| c.label.eq_ignore_ascii_case(&label));
        if !known && !extra_labels.contains(&label) {
            extra_labels.push(label);
        }
    }
    for label in extra_labels {
        push(&label, 0.0, quoted_for(&label));
    }

    causes
}

pub fn run_stage_a1(
    store: &RecordStore,
    mode: SecondaryIndexMode,
    items: &[PrItem],
) -> StageReport<ContractRecommendation> {
    let mut summary = StageSummary::default();
    let results = items
        .iter()
        .map(|item| {
            let contract = resolve_contract_price(store, mode, item.into());
            summary.record_match(
                contract.match_tier.map_or("unmatched", ContractTier::as_str),
                contract.is_matched(),
            );
            ContractRecommendation {
                item: item.clone(),
                contract,
            }
        })
        .collect();
    StageReport { results, summary }
}

pub fn run_stage_b1(
    store: &RecordStore,
    mode: SecondaryIndexMode,
    deep_analysis: bool,
) -> StageReport<QuoteContractComparison> {
    let mut summary = StageSummary::default();
    let results = store
        .quotes()
        .iter()
        .map(|quote| {
            let contract = resolve_contract_price(store, mode, quote.into());
            summary.record_match(
                contract.match_tier.map_or("unmatched", ContractTier::as_str),
                contract.is_matched(),
            );
            let (difference, difference_pct) = if contract.is_matched() {
                (
                    Some(quote.quoted_price - contract.total),
                    percent_difference(quote.quoted_price, contract.total),
                )
            } else {
                (None, None)
            };
            let causes = if deep_analysis {
                analyze_causes(&contract, quote.quoted_price, &quote.breakdown)
            } else {
                Vec::new()
            };
            QuoteContractComparison {
                quote: QuoteSummary::from(quote),
                contract,
                difference,
                difference_pct,
                causes,
            }
        })
        .collect();
    StageReport { results, summary }
}
