use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use pricewatch_adapters::{load_record_store, CommentaryError, CommentaryGenerator};
use pricewatch_core::{FairnessBasis, FairnessRecord, FairnessVerdict};
use pricewatch_pipeline::trend::Alignment;
use pricewatch_pipeline::{PipelineConfig, ValidationPipeline};
use serde_json::json;

fn write_table(dir: &Path, file: &str, value: serde_json::Value) {
    std::fs::write(dir.join(file), serde_json::to_vec_pretty(&value).expect("serialize")).expect("write table");
}

fn seed_dataset(dir: &Path) {
    write_table(
        dir,
        "price_table.json",
        json!([
            {
                "valve_type_key": "VGBASW3A0",
                "body_unit_price": "150",
                "reference_quantity": 1,
                "vendor_name": "contract-vendor",
                "options": { "nameplate": 10, "lock": 20, "indicator": null }
            }
        ]),
    );
    write_table(
        dir,
        "performance.json",
        json!([
            {
                "material_id": "M1",
                "description": "GATE 50A 10K TR LOCK",
                "valve_type": "VGBASW3A0A",
                "ordered_quantity": 2,
                "order_amount": 380,
                "order_date": "2024-01-15",
                "vendor_name": "Acme"
            },
            {
                "material_id": "T1",
                "description": "GATE 50A 10K BC6",
                "valve_type": "VGBASW3A0A",
                "ordered_quantity": 1,
                "order_amount": 500,
                "order_date": "2024-01-10",
                "vendor_name": "Acme"
            },
            {
                "material_id": "T2",
                "description": "GATE 50A 10K BC6",
                "valve_type": "VGBASW3A0A",
                "ordered_quantity": "1",
                "order_amount": 500,
                "order_date": "2024-02-10",
                "vendor_name": "Acme"
            }
        ]),
    );
    write_table(
        dir,
        "quotes.json",
        json!([
            {
                "material_id": "M1",
                "description": "GATE 50A 10K TR LOCK",
                "quantity": 2,
                "quoted_price": 300,
                "vendor_name": "Acme"
            }
        ]),
    );
    write_table(
        dir,
        "index_series.json",
        json!([
            { "month": "2024-01", "copper": 1000, "tin": 0 },
            { "month": "2024-02", "copper": 900, "tin": 0 }
        ]),
    );
}

struct EchoGenerator;

#[async_trait]
impl CommentaryGenerator for EchoGenerator {
    fn name(&self) -> &'static str {
        "echo"
    }

    async fn generate(&self, record: &FairnessRecord) -> Result<String, CommentaryError> {
        Ok(format!("{} is {}", record.material_id, record.verdict.as_str()))
    }
}

#[tokio::test]
async fn full_run_over_directory_dataset() {
    let dir = tempfile::tempdir().expect("tempdir");
    seed_dataset(dir.path());

    let store = load_record_store(dir.path()).expect("load dataset");
    let config = PipelineConfig {
        commentary_delay: Duration::ZERO,
        ..PipelineConfig::default()
    };
    let pipeline = ValidationPipeline::new(store, config).with_commentary(Box::new(EchoGenerator));
    let report = pipeline.run_with_commentary().await;

    assert_eq!(report.counts.price_rows, 1);
    assert_eq!(report.counts.performance_rows, 3);

    // Two distinct (type code, description) pairs; the newer BC6 order represents its pair.
    assert_eq!(report.stage_a1.results.len(), 2);
    assert_eq!(report.stage_a1.summary.matched, 2);
    assert_eq!(report.stage_a2.results[1].item.material_id, "T2");

    let contract = &report.stage_b1.results[0];
    assert_eq!(contract.quote.valve_type.as_deref(), Some("VGBASW3A0A"));
    assert_eq!(contract.contract.body_price, 300.0);
    assert_eq!(contract.contract.option_price, 60.0);
    assert_eq!(contract.contract.total, 360.0);

    let history = &report.stage_b2.results[0];
    assert_eq!(history.history.matched_material_id.as_deref(), Some("M1"));
    assert_eq!(history.history.expected_price, 380.0);

    let fairness = &report.fairness.results[0];
    assert_eq!(fairness.verdict, FairnessVerdict::Excellent);
    assert_eq!(fairness.basis, FairnessBasis::NegotiationTarget);
    assert_eq!(fairness.commentary.as_deref(), Some("M1 is excellent"));

    assert_eq!(report.trend.points.len(), 2);
    let leg = &report.trend.comparisons[0];
    assert_eq!(leg.alignment, Alignment::Caution);
    let estimate = leg.estimated_gain_loss.expect("index on both months");
    assert!((estimate + 50.0).abs() < 1e-6, "estimate {estimate}");
}

#[test]
fn missing_required_table_is_fatal() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_table(dir.path(), "price_table.json", json!([]));
    let err = load_record_store(dir.path()).expect_err("performance table is required");
    assert!(err.to_string().contains("performance"));
}

#[test]
fn sync_run_serializes_to_json() {
    let dir = tempfile::tempdir().expect("tempdir");
    seed_dataset(dir.path());
    let store = load_record_store(dir.path()).expect("load dataset");
    let report = ValidationPipeline::new(store, PipelineConfig::default()).run();
    let value = serde_json::to_value(&report).expect("serialize report");
    assert_eq!(value["fairness"]["summary"]["verdicts"]["excellent"], 1);
    assert_eq!(value["trend"]["comparisons"][0]["alignment"], "caution");
    assert!(value["fairness"]["results"][0]["commentary"].is_null());
}
