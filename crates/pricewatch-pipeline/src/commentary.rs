//! Commentary batching with a rule-based fallback when no generator is configured or a call fails.

use std::time::Duration;

use pricewatch_adapters::{CommentaryError, CommentaryGenerator};
use pricewatch_core::{FairnessBasis, FairnessRecord, FairnessVerdict};
use tracing::{info_span, warn, Instrument};

/// Rule-based commentary used whenever the generator is unavailable or fails.
pub fn fallback_commentary(record: &FairnessRecord) -> String {
    let benchmark = match record.basis {
        FairnessBasis::NegotiationTarget => format!("the negotiation target of {:.0}", record.negotiation_target),
        FairnessBasis::RecentOrder => format!("the recent order equivalent of {:.0}", record.recent_order_price),
        FairnessBasis::Contract => format!("the contract price of {:.0}", record.contract_total),
        FairnessBasis::NoQuote | FairnessBasis::NoBenchmark => String::new(),
    };

    let mut text = match record.verdict {
        FairnessVerdict::Excellent => format!(
            "Quote of {:.0} is at or below {benchmark}; proceed with the order.",
            record.quoted_price
        ),
        FairnessVerdict::Acceptable => format!(
            "Quote of {:.0} is within {benchmark}; negotiate toward {:.0} if volume allows.",
            record.quoted_price, record.negotiation_target
        ),
        FairnessVerdict::Unacceptable => {
            let reference = if record.negotiation_target > 0.0 {
                record.negotiation_target
            } else {
                record.contract_total
            };
            format!(
                "Quote of {:.0} exceeds every available benchmark; request a revised quote near {reference:.0}.",
                record.quoted_price
            )
        }
        FairnessVerdict::Indeterminate if record.basis == FairnessBasis::NoQuote => {
            "No quoted price was supplied; request a priced quote.".to_string()
        }
        FairnessVerdict::Indeterminate => {
            "No contract or order history matches this item; review the quote manually.".to_string()
        }
    };

    if !record.causes.is_empty() {
        text.push_str(&format!(" Main differences: {}.", record.causes.join(", ")));
    }
    text
}

/// Attach commentary to every record, one generator call at a time.
///
/// Calls are separated by `delay`; a failed call logs and falls back to rule-based text.
/// Returns the number of records that received generated text.
pub async fn annotate_with_fallback(
    generator: &dyn CommentaryGenerator,
    records: &mut [FairnessRecord],
    delay: Duration,
) -> usize {
    let mut generated = 0usize;
    for (idx, record) in records.iter_mut().enumerate() {
        if idx > 0 && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let span = info_span!("commentary", generator = generator.name(), material_id = %record.material_id);
        let text = match generator.generate(record).instrument(span).await {
            Ok(text) => {
                generated += 1;
                text
            }
            Err(CommentaryError::Disabled) => fallback_commentary(record),
            Err(err) => {
                warn!(
                    material_id = %record.material_id,
                    generator = generator.name(),
                    error = %err,
                    "commentary generation failed; using fallback text"
                );
                fallback_commentary(record)
            }
        };
        record.commentary = Some(text);
    }
    generated
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pricewatch_adapters::DisabledCommentary;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn record(material_id: &str, verdict: FairnessVerdict, basis: FairnessBasis) -> FairnessRecord {
        FairnessRecord {
            material_id: material_id.into(),
            description: "GATE 50A 10K".into(),
            vendor_name: "Acme".into(),
            quantity: 10.0,
            quoted_price: 1000.0,
            contract_total: 1200.0,
            recent_order_price: 1000.0,
            negotiation_target: 900.0,
            contract_diff_pct: Some(-16.7),
            recent_diff_pct: Some(0.0),
            verdict,
            basis,
            causes: vec![],
            commentary: None,
        }
    }

    /// Fails every second call.
    struct FlakyGenerator {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CommentaryGenerator for FlakyGenerator {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn generate(&self, record: &FairnessRecord) -> Result<String, CommentaryError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call % 2 == 1 {
                Err(CommentaryError::EmptyResponse)
            } else {
                Ok(format!("generated for {}", record.material_id))
            }
        }
    }

    #[test]
    fn fallback_mentions_benchmark_and_causes() {
        let mut r = record("M1", FairnessVerdict::Acceptable, FairnessBasis::RecentOrder);
        r.causes = vec!["BODY +200".into(), "LOCK -50".into()];
        let text = fallback_commentary(&r);
        assert!(text.contains("recent order equivalent of 1000"));
        assert!(text.contains("toward 900"));
        assert!(text.ends_with("Main differences: BODY +200, LOCK -50."));
    }

    #[test]
    fn fallback_for_missing_quote() {
        let r = record("M1", FairnessVerdict::Indeterminate, FairnessBasis::NoQuote);
        assert!(fallback_commentary(&r).contains("No quoted price"));
    }

    #[tokio::test]
    async fn failures_degrade_to_fallback_per_record() {
        let generator = FlakyGenerator {
            calls: AtomicUsize::new(0),
        };
        let mut records = vec![
            record("M1", FairnessVerdict::Acceptable, FairnessBasis::RecentOrder),
            record("M2", FairnessVerdict::Unacceptable, FairnessBasis::NegotiationTarget),
            record("M3", FairnessVerdict::Excellent, FairnessBasis::NegotiationTarget),
        ];
        let generated = annotate_with_fallback(&generator, &mut records, Duration::from_millis(1)).await;

        assert_eq!(generated, 2);
        assert_eq!(records[0].commentary.as_deref(), Some("generated for M1"));
        assert!(records[1]
            .commentary
            .as_deref()
            .is_some_and(|t| t.contains("request a revised quote near 900")));
        assert_eq!(records[2].commentary.as_deref(), Some("generated for M3"));
    }

    #[tokio::test]
    async fn disabled_generator_fills_every_record() {
        let mut records = vec![record("M1", FairnessVerdict::Excellent, FairnessBasis::NegotiationTarget)];
        let generated = annotate_with_fallback(&DisabledCommentary, &mut records, Duration::ZERO).await;
        assert_eq!(generated, 0);
        assert!(records[0].commentary.as_deref().is_some_and(|t| t.contains("proceed")));
    }
}
