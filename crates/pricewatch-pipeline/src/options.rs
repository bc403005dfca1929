//! Option token extraction and itemized option pricing.

use std::collections::BTreeSet;

use pricewatch_core::{OptionField, OptionPrices};
use serde::{Deserialize, Serialize};

/// Marker tokens after which a description lists its options, in lookup priority.
pub const OPTION_MARKERS: [&str; 3] = ["TR", "T", "LR"];

/// Paint codes meaning "no coating".
pub const NO_PAINT_CODES: [&str; 5] = ["N0", "NO", "", "NAN", "NONE"];

const TOKEN_FIELDS: &[(&str, OptionField)] = &[
    ("LOCK", OptionField::Lock),
    ("IND", OptionField::Indicator),
    ("L/SW", OptionField::LimitSwitch),
    ("EXT", OptionField::Extension),
    ("EXT.", OptionField::Extension),
    ("EXTENSION", OptionField::Extension),
    ("EXT-S", OptionField::Extension),
    ("E/S", OptionField::Extension),
    ("RUB-C", OptionField::DiscRubber),
];

const DETAIL_SPEC_FIELDS: &[(&str, OptionField)] = &[
    ("SUS316", OptionField::DiscSus316),
    ("SCS16", OptionField::DiscSus316),
    ("SUS304", OptionField::DiscSus304),
    ("SCS13", OptionField::DiscSus304),
    ("SCS14", OptionField::DiscScs14),
];

/// Cost component that may be charged at most once per item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum OptionSlot {
    Nameplate,
    OuterCoat,
    InnerCoat,
    Lock,
    Indicator,
    LimitSwitch,
    Extension,
    DiscMaterial,
}

impl From<OptionField> for OptionSlot {
    fn from(field: OptionField) -> Self {
        match field {
            OptionField::Nameplate => Self::Nameplate,
            OptionField::OuterCoating => Self::OuterCoat,
            OptionField::InnerCoating => Self::InnerCoat,
            OptionField::Lock => Self::Lock,
            OptionField::Indicator => Self::Indicator,
            OptionField::LimitSwitch => Self::LimitSwitch,
            OptionField::Extension => Self::Extension,
            OptionField::DiscSus316
            | OptionField::DiscSus304
            | OptionField::DiscScs14
            | OptionField::DiscRubber => Self::DiscMaterial,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionCharge {
    pub label: String,
    pub field: OptionField,
    pub amount: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptionPrice {
    pub total: f64,
    pub breakdown: Vec<OptionCharge>,
}

impl OptionPrice {
    pub fn scaled(&self, factor: f64) -> OptionPrice {
        OptionPrice {
            total: self.total * factor,
            breakdown: self
                .breakdown
                .iter()
                .map(|c| OptionCharge {
                    amount: c.amount * factor,
                    ..c.clone()
                })
                .collect(),
        }
    }
}

struct OptionAccumulator<'a> {
    prices: &'a OptionPrices,
    applied: BTreeSet<OptionSlot>,
    price: OptionPrice,
}

impl<'a> OptionAccumulator<'a> {
    fn new(prices: &'a OptionPrices) -> Self {
        Self {
            prices,
            applied: BTreeSet::new(),
            price: OptionPrice::default(),
        }
    }

    fn apply(&mut self, field: OptionField) {
        let slot = OptionSlot::from(field);
        if self.applied.contains(&slot) {
            return;
        }
        let amount = self.prices.get(field);
        if amount > 0.0 {
            self.applied.insert(slot);
            self.price.total += amount;
            self.price.breakdown.push(OptionCharge {
                label: field.label().to_string(),
                field,
                amount,
            });
        }
    }
}

/// Every whitespace token after the first option marker; empty when no marker is present.
pub fn parse_option_tokens(description: &str) -> Vec<String> {
    let tokens = description.split_whitespace().collect::<Vec<_>>();
    for marker in OPTION_MARKERS {
        if let Some(pos) = tokens.iter().position(|t| *t == marker) {
            return tokens[pos + 1..].iter().map(|t| t.to_string()).collect();
        }
    }
    Vec::new()
}

pub fn is_painted(code: Option<&str>) -> bool {
    match code {
        None => false,
        Some(code) => {
            let code = code.trim().to_ascii_uppercase();
            !NO_PAINT_CODES.contains(&code.as_str())
        }
    }
}

/// Per-unit option price of a price-table row for the given tokens and paint/spec codes.
pub fn compute_option_price(
    prices: &OptionPrices,
    tokens: &[String],
    inner_paint: Option<&str>,
    outer_paint: Option<&str>,
    detail_spec: Option<&str>,
) -> OptionPrice {
    let mut acc = OptionAccumulator::new(prices);

    acc.apply(OptionField::Nameplate);
    if is_painted(outer_paint) {
        acc.apply(OptionField::OuterCoating);
    }
    if is_painted(inner_paint) {
        acc.apply(OptionField::InnerCoating);
    }

    for token in tokens {
        let token = token.trim().to_ascii_uppercase();
        match token.as_str() {
            "I-T" | "I/O-T" => acc.apply(OptionField::InnerCoating),
            "I/O-P" => {
                acc.apply(OptionField::InnerCoating);
                acc.apply(OptionField::OuterCoating);
            }
            "O-P" => acc.apply(OptionField::OuterCoating),
            other => {
                if let Some((_, field)) = TOKEN_FIELDS.iter().find(|(t, _)| *t == other) {
                    acc.apply(*field);
                }
            }
        }
    }

    if let Some(spec) = detail_spec {
        let spec = spec.to_ascii_uppercase();
        if let Some((_, field)) = DETAIL_SPEC_FIELDS.iter().find(|(needle, _)| spec.contains(needle)) {
            acc.apply(*field);
        }
    }

    acc.price
}
