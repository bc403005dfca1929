//! Quote fairness: joins the contract and history comparisons of each quote.

use pricewatch_core::{classify_fairness, FairnessRecord};

use crate::contract::QuoteContractComparison;
use crate::history::QuoteHistoryComparison;
use crate::{StageReport, StageSummary};

pub fn build_fairness_record(
    contract: &QuoteContractComparison,
    history: &QuoteHistoryComparison,
) -> FairnessRecord {
    let quote = &contract.quote;
    let decision = classify_fairness(
        quote.quoted_price,
        history.history.negotiation_target,
        history.history.expected_price,
        contract.contract.total,
    );

    let causes = contract
        .causes
        .iter()
        .map(|c| format!("{} {:+.0}", c.component, c.difference))
        .collect();

    FairnessRecord {
        material_id: quote.material_id.clone(),
        description: quote.description.clone(),
        vendor_name: quote.vendor_name.clone(),
        quantity: quote.quantity,
        quoted_price: quote.quoted_price,
        contract_total: contract.contract.total,
        recent_order_price: history.history.expected_price,
        negotiation_target: history.history.negotiation_target,
        contract_diff_pct: contract.difference_pct,
        recent_diff_pct: history.difference_pct,
        verdict: decision.verdict,
        basis: decision.basis,
        causes,
        commentary: None,
    }
}

/// Stage B1 and B2 results are positionally aligned over the same quote list.
pub fn run_fairness_stage(
    contract: &[QuoteContractComparison],
    history: &[QuoteHistoryComparison],
) -> StageReport<FairnessRecord> {
    let mut summary = StageSummary::default();
    let results = contract
        .iter()
        .zip(history)
        .map(|(c, h)| {
            let record = build_fairness_record(c, h);
            summary.record_verdict(record.verdict.as_str());
            record
        })
        .collect();
    StageReport { results, summary }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{run_stage_b1, CostCause};
    use crate::history::run_stage_b2;
    use pricewatch_core::{
        FairnessBasis, FairnessVerdict, OptionPrices, PerformanceRow, PriceTableRow, VendorQuoteRow,
    };
    use pricewatch_storage::{RecordStore, SecondaryIndexMode};

    fn quote(material_id: &str, quantity: f64, quoted_price: f64) -> VendorQuoteRow {
        VendorQuoteRow {
            material_id: material_id.into(),
            description: "GATE 50A 10K".into(),
            quantity,
            quoted_price,
            vendor_name: "Acme".into(),
            inner_paint: String::new(),
            outer_paint: String::new(),
            detail_spec: String::new(),
            valve_type: None,
            derived_key: None,
            breakdown: vec![],
        }
    }

    fn store(quotes: Vec<VendorQuoteRow>) -> RecordStore {
        RecordStore::new(
            vec![PriceTableRow {
                valve_type_key: "VGBASW3A0".into(),
                valve_type: String::new(),
                body_unit_price: 120.0,
                reference_quantity: 1.0,
                vendor_name: "contract".into(),
                options: OptionPrices::default(),
            }],
            vec![PerformanceRow {
                material_id: "M1".into(),
                description: "GATE 50A 10K".into(),
                valve_type: "VGBASW3A0A".into(),
                derived_key: String::new(),
                ordered_quantity: 10.0,
                order_amount: 1000.0,
                order_date: None,
                vendor_name: "Acme".into(),
                inner_paint: String::new(),
                outer_paint: String::new(),
                detail_spec: String::new(),
            }],
            quotes,
            vec![],
        )
    }

    fn verdicts(store: &RecordStore) -> StageReport<FairnessRecord> {
        let b1 = run_stage_b1(store, SecondaryIndexMode::TypePrefix, true);
        let b2 = run_stage_b2(store);
        run_fairness_stage(&b1.results, &b2.results)
    }

    #[test]
    fn recent_order_scenario_is_acceptable() {
        let report = verdicts(&store(vec![quote("M1", 10.0, 1000.0)]));
        let record = &report.results[0];
        assert_eq!(record.recent_order_price, 1000.0);
        assert!((record.negotiation_target - 900.0).abs() < 1e-9);
        assert_eq!(record.contract_total, 1200.0);
        assert_eq!(record.verdict, FairnessVerdict::Acceptable);
        assert_eq!(record.basis, FairnessBasis::RecentOrder);
        assert_eq!(report.summary.verdicts.get("acceptable"), Some(&1));
    }

    #[test]
    fn unjoined_quote_without_keywords_is_indeterminate() {
        let mut unknown = quote("UNKNOWN", 1.0, 500.0);
        unknown.description = "MISC PART".into();
        let report = verdicts(&store(vec![unknown]));
        let record = &report.results[0];
        assert_eq!(record.verdict, FairnessVerdict::Indeterminate);
        assert_eq!(report.summary.unmatched, 1);
    }

    #[test]
    fn causes_are_rendered_with_sign() {
        let mut b1 = run_stage_b1(&store(vec![quote("M1", 10.0, 1500.0)]), SecondaryIndexMode::TypePrefix, true);
        let b2 = run_stage_b2(&store(vec![quote("M1", 10.0, 1500.0)]));
        b1.results[0].causes = vec![CostCause {
            component: "TOTAL".into(),
            contract_amount: 1200.0,
            quoted_amount: 1500.0,
            difference: 300.0,
        }];
        let record = build_fairness_record(&b1.results[0], &b2.results[0]);
        assert_eq!(record.causes, vec!["TOTAL +300".to_string()]);
        assert_eq!(record.verdict, FairnessVerdict::Unacceptable);
    }
}
