//! Core record model, key derivation and fairness rules for PriceWatch.

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Deserializer, Serialize};

pub const CRATE_NAME: &str = "pricewatch-core";

pub const COPPER_WEIGHT: f64 = 0.88;
pub const TIN_WEIGHT: f64 = 0.12;

/// Share of the recent order price used as the purchasing negotiation target.
pub const NEGOTIATION_RATIO: f64 = 0.90;

/// Named option columns carried by a price-table row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptionField {
    Nameplate,
    InnerCoating,
    OuterCoating,
    Lock,
    Indicator,
    LimitSwitch,
    Extension,
    DiscSus316,
    DiscSus304,
    DiscScs14,
    DiscRubber,
}

impl OptionField {
    pub fn label(self) -> &'static str {
        match self {
            Self::Nameplate => "N/P",
            Self::InnerCoating => "INNER-COAT",
            Self::OuterCoating => "OUTER-COAT",
            Self::Lock => "LOCK",
            Self::Indicator => "IND",
            Self::LimitSwitch => "L/SW",
            Self::Extension => "EXT",
            Self::DiscSus316 => "DISC-SUS316",
            Self::DiscSus304 => "DISC-SUS304",
            Self::DiscScs14 => "DISC-SCS14",
            Self::DiscRubber => "DISC-RUB-C",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptionPrices {
    #[serde(default, deserialize_with = "lenient_f64")]
    pub nameplate: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub inner_coating: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub outer_coating: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub lock: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub indicator: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub limit_switch: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub extension: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub disc_sus316: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub disc_sus304: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub disc_scs14: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub disc_rubber: f64,
}

impl OptionPrices {
    pub fn get(&self, field: OptionField) -> f64 {
        match field {
            OptionField::Nameplate => self.nameplate,
            OptionField::InnerCoating => self.inner_coating,
            OptionField::OuterCoating => self.outer_coating,
            OptionField::Lock => self.lock,
            OptionField::Indicator => self.indicator,
            OptionField::LimitSwitch => self.limit_switch,
            OptionField::Extension => self.extension,
            OptionField::DiscSus316 => self.disc_sus316,
            OptionField::DiscSus304 => self.disc_sus304,
            OptionField::DiscScs14 => self.disc_scs14,
            OptionField::DiscRubber => self.disc_rubber,
        }
    }
}

/// One contracted unit-price entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceTableRow {
    #[serde(deserialize_with = "lenient_string")]
    pub valve_type_key: String,
    /// Full type code, when the table carries one.
    #[serde(default, deserialize_with = "lenient_string")]
    pub valve_type: String,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub body_unit_price: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub reference_quantity: f64,
    #[serde(default, deserialize_with = "lenient_string")]
    pub vendor_name: String,
    #[serde(default)]
    pub options: OptionPrices,
}

impl PriceTableRow {
    pub fn normalized(mut self) -> Self {
        self.valve_type_key = self.valve_type_key.trim().to_string();
        self.valve_type = self.valve_type.trim().to_string();
        self.vendor_name = self.vendor_name.trim().to_string();
        if !(self.reference_quantity > 0.0) {
            self.reference_quantity = 1.0;
        }
        self
    }

    /// Body price for a single unit of the target quantity.
    pub fn body_price_per_unit(&self) -> f64 {
        if self.reference_quantity > 0.0 {
            self.body_unit_price / self.reference_quantity
        } else {
            self.body_unit_price
        }
    }
}

/// One historical purchase-order line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceRow {
    #[serde(deserialize_with = "lenient_string")]
    pub material_id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub description: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub valve_type: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub derived_key: String,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub ordered_quantity: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub order_amount: f64,
    #[serde(default, deserialize_with = "lenient_date")]
    pub order_date: Option<NaiveDate>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub vendor_name: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub inner_paint: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub outer_paint: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub detail_spec: String,
}

impl PerformanceRow {
    pub fn normalized(mut self) -> Self {
        self.material_id = self.material_id.trim().to_string();
        self.description = self.description.trim().to_string();
        self.valve_type = self.valve_type.trim().to_string();
        self.derived_key = self.derived_key.trim().to_string();
        if self.derived_key.is_empty() {
            self.derived_key = type_size_key(&self.valve_type);
        }
        if !(self.ordered_quantity > 0.0) {
            self.ordered_quantity = 1.0;
        }
        self.vendor_name = self.vendor_name.trim().to_string();
        self
    }

    pub fn unit_price(&self) -> f64 {
        if self.ordered_quantity > 0.0 {
            self.order_amount / self.ordered_quantity
        } else {
            0.0
        }
    }
}

/// Vendor-supplied line item of a quotation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteLine {
    #[serde(deserialize_with = "lenient_string")]
    pub label: String,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub amount: f64,
}

/// One vendor quotation line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VendorQuoteRow {
    #[serde(deserialize_with = "lenient_string")]
    pub material_id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub description: String,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub quantity: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub quoted_price: f64,
    #[serde(default, deserialize_with = "lenient_string")]
    pub vendor_name: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub inner_paint: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub outer_paint: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub detail_spec: String,
    #[serde(default)]
    pub valve_type: Option<String>,
    #[serde(default)]
    pub derived_key: Option<String>,
    #[serde(default)]
    pub breakdown: Vec<QuoteLine>,
}

impl VendorQuoteRow {
    pub fn normalized(mut self) -> Self {
        self.material_id = self.material_id.trim().to_string();
        self.description = self.description.trim().to_string();
        self.vendor_name = self.vendor_name.trim().to_string();
        self.valve_type = self
            .valve_type
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        self.derived_key = self
            .derived_key
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        if self.quantity < 0.0 || !self.quantity.is_finite() {
            self.quantity = 0.0;
        }
        self
    }

    /// Inherit the type code of the most recent historical order for the same material.
    pub fn join_type_code(&mut self, performance: &[PerformanceRow]) {
        if self.valve_type.is_some() {
            if self.derived_key.is_none() {
                self.derived_key = self
                    .valve_type
                    .as_deref()
                    .map(type_size_key)
                    .filter(|k| !k.is_empty());
            }
            return;
        }
        let latest = most_recent(
            performance
                .iter()
                .filter(|p| p.material_id == self.material_id && !p.valve_type.is_empty()),
        );
        if let Some(row) = latest {
            self.valve_type = Some(row.valve_type.clone());
            if self.derived_key.is_none() {
                self.derived_key = Some(row.derived_key.clone()).filter(|k| !k.is_empty());
            }
        }
    }
}

/// Monthly copper/tin index observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexPoint {
    /// `YYYY-MM`
    #[serde(deserialize_with = "lenient_string")]
    pub month: String,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub copper: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub tin: f64,
}

impl IndexPoint {
    pub fn blended(&self) -> f64 {
        self.copper * COPPER_WEIGHT + self.tin * TIN_WEIGHT
    }
}

/// Representative purchase-request candidate drawn from the performance log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrItem {
    pub material_id: String,
    pub description: String,
    pub valve_type: String,
    pub derived_key: String,
    pub quantity: f64,
    pub order_date: Option<NaiveDate>,
    pub vendor_name: String,
    pub inner_paint: String,
    pub outer_paint: String,
    pub detail_spec: String,
}

impl From<&PerformanceRow> for PrItem {
    fn from(row: &PerformanceRow) -> Self {
        Self {
            material_id: row.material_id.clone(),
            description: row.description.clone(),
            valve_type: row.valve_type.clone(),
            derived_key: row.derived_key.clone(),
            quantity: row.ordered_quantity,
            order_date: row.order_date,
            vendor_name: row.vendor_name.clone(),
            inner_paint: row.inner_paint.clone(),
            outer_paint: row.outer_paint.clone(),
            detail_spec: row.detail_spec.clone(),
        }
    }
}

/// Pick the row with the latest order date; undated rows lose, ties keep the earliest row.
pub fn most_recent<'a, I>(rows: I) -> Option<&'a PerformanceRow>
where
    I: IntoIterator<Item = &'a PerformanceRow>,
{
    let mut best: Option<&PerformanceRow> = None;
    for row in rows {
        best = match best {
            None => Some(row),
            Some(current) if row.order_date > current.order_date => Some(row),
            Some(current) => Some(current),
        };
    }
    best
}

/// Type+size key: the full type code without its trailing discriminator.
pub fn type_size_key(valve_type: &str) -> String {
    let code = valve_type.trim();
    let mut chars: Vec<char> = code.chars().collect();
    if chars.len() < 2 {
        return String::new();
    }
    chars.pop();
    chars.into_iter().collect()
}

/// Leading run of uppercase letters of a type code.
pub fn type_prefix(valve_type: &str) -> String {
    let code = valve_type.trim();
    if code.chars().count() < 2 {
        return String::new();
    }
    code.chars().take_while(|c| c.is_ascii_uppercase()).collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptionKeywords {
    pub category: String,
    pub size: Option<String>,
    pub pressure: Option<String>,
}

impl DescriptionKeywords {
    pub fn is_complete(&self) -> bool {
        !self.category.is_empty() && self.size.is_some() && self.pressure.is_some()
    }

    /// Both sides complete and every keyword equal.
    pub fn similar_to(&self, other: &DescriptionKeywords) -> bool {
        self.is_complete() && other.is_complete() && self == other
    }
}

/// Category, `<digits>A` size and `<digits>K` pressure tokens of a free-text description.
pub fn description_keywords(description: &str) -> DescriptionKeywords {
    let upper = description.trim().to_ascii_uppercase();
    let category = upper
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<String>();

    let mut size = None;
    let mut pressure = None;
    for token in upper.split(|c: char| c.is_whitespace() || c == ',' || c == '/' || c == '(' || c == ')') {
        let Some(last) = token.chars().last() else {
            continue;
        };
        let digits = &token[..token.len() - last.len_utf8()];
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        match last {
            'A' if size.is_none() => size = Some(token.to_string()),
            'K' if pressure.is_none() => pressure = Some(token.to_string()),
            _ => {}
        }
    }

    DescriptionKeywords {
        category,
        size,
        pressure,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FairnessVerdict {
    Excellent,
    Acceptable,
    Unacceptable,
    Indeterminate,
}

impl FairnessVerdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Excellent => "excellent",
            Self::Acceptable => "acceptable",
            Self::Unacceptable => "unacceptable",
            Self::Indeterminate => "indeterminate",
        }
    }
}

/// Benchmark that decided a fairness verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FairnessBasis {
    NoQuote,
    NegotiationTarget,
    RecentOrder,
    Contract,
    NoBenchmark,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FairnessDecision {
    pub verdict: FairnessVerdict,
    pub basis: FairnessBasis,
}

/// Classify a quote against negotiation target, recent order price and contract total.
///
/// Branches are evaluated in order and the first satisfied one wins.
pub fn classify_fairness(quoted: f64, target: f64, recent: f64, contract: f64) -> FairnessDecision {
    let decide = |verdict, basis| FairnessDecision { verdict, basis };

    if !(quoted > 0.0) {
        return decide(FairnessVerdict::Indeterminate, FairnessBasis::NoQuote);
    }
    if target > 0.0 && target >= quoted {
        return decide(FairnessVerdict::Excellent, FairnessBasis::NegotiationTarget);
    }
    if recent > 0.0 && recent >= quoted {
        return decide(FairnessVerdict::Acceptable, FairnessBasis::RecentOrder);
    }
    if contract > 0.0 && contract >= quoted {
        return decide(FairnessVerdict::Acceptable, FairnessBasis::Contract);
    }
    if recent > 0.0 {
        return decide(FairnessVerdict::Unacceptable, FairnessBasis::RecentOrder);
    }
    if contract > 0.0 {
        return decide(FairnessVerdict::Unacceptable, FairnessBasis::Contract);
    }
    decide(FairnessVerdict::Indeterminate, FairnessBasis::NoBenchmark)
}

/// Per-quote fairness outcome handed to presentation and commentary collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FairnessRecord {
    pub material_id: String,
    pub description: String,
    pub vendor_name: String,
    pub quantity: f64,
    pub quoted_price: f64,
    pub contract_total: f64,
    pub recent_order_price: f64,
    pub negotiation_target: f64,
    pub contract_diff_pct: Option<f64>,
    pub recent_diff_pct: Option<f64>,
    pub verdict: FairnessVerdict,
    pub basis: FairnessBasis,
    #[serde(default)]
    pub causes: Vec<String>,
    #[serde(default)]
    pub commentary: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LooseScalar {
    Number(f64),
    Text(String),
    Flag(bool),
    /// Array or object cells; they carry no usable scalar.
    Other(serde::de::IgnoredAny),
}

/// Numbers, numeric strings (thousands separators allowed) or anything else coerced to 0.
pub fn lenient_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<LooseScalar>::deserialize(deserializer)?;
    Ok(match value {
        Some(LooseScalar::Number(n)) if n.is_finite() => n,
        Some(LooseScalar::Text(text)) => text
            .trim()
            .replace(',', "")
            .parse::<f64>()
            .ok()
            .filter(|n| n.is_finite())
            .unwrap_or(0.0),
        _ => 0.0,
    })
}

/// Trimmed text; numeric cells (spreadsheet material ids) are rendered without a fraction.
pub fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<LooseScalar>::deserialize(deserializer)?;
    Ok(match value {
        Some(LooseScalar::Text(text)) => text.trim().to_string(),
        Some(LooseScalar::Number(n)) if n.fract() == 0.0 && n.abs() < 1e15 => format!("{}", n as i64),
        Some(LooseScalar::Number(n)) => n.to_string(),
        Some(LooseScalar::Flag(b)) => b.to_string(),
        Some(LooseScalar::Other(_)) | None => String::new(),
    })
}

pub fn lenient_date<'de, D>(deserializer: D) -> Result<Option<NaiveDate>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<LooseScalar>::deserialize(deserializer)?;
    Ok(match value {
        Some(LooseScalar::Text(text)) => parse_loose_date(&text),
        Some(LooseScalar::Number(n)) if n.fract() == 0.0 => parse_loose_date(&format!("{}", n as i64)),
        _ => None,
    })
}

pub fn parse_loose_date(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    for fmt in ["%Y-%m-%d", "%Y/%m/%d", "%Y.%m.%d", "%Y%m%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(text, fmt) {
            return Some(date);
        }
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(text, fmt) {
            return Some(ts.date());
        }
    }
    None
}
