use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use pricewatch_adapters::load_record_store;
use pricewatch_pipeline::{build_commentary_generator, PipelineConfig, ValidationPipeline};
use pricewatch_storage::SecondaryIndexMode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "pricewatch")]
#[command(about = "Valve purchase price validation")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every stage and print the report as JSON.
    Validate(ValidateArgs),
    /// Print the vendor price trend against the copper/tin index.
    Trend(TrendArgs),
    /// Serve the JSON API.
    Serve,
}

#[derive(Debug, Args, Default)]
struct DatasetArgs {
    /// Dataset directory or bundle file; overrides PRICEWATCH_DATASET.
    #[arg(long)]
    dataset: Option<PathBuf>,
    /// `type_prefix` or `full_type_code`.
    #[arg(long, value_parser = parse_secondary_index)]
    secondary_index: Option<SecondaryIndexMode>,
}

#[derive(Debug, Args, Default)]
struct ValidateArgs {
    #[command(flatten)]
    dataset: DatasetArgs,
    /// Skip line-item cause analysis for quotes.
    #[arg(long)]
    no_deep_analysis: bool,
    /// Only rule-based commentary, even when an endpoint is configured.
    #[arg(long)]
    no_commentary: bool,
    #[arg(long)]
    pretty: bool,
}

#[derive(Debug, Args)]
struct TrendArgs {
    #[command(flatten)]
    dataset: DatasetArgs,
    /// Full type code of the tracked product family.
    #[arg(long)]
    type_code: Option<String>,
    #[arg(long)]
    vendor: Option<String>,
    #[arg(long)]
    pretty: bool,
}

fn parse_secondary_index(value: &str) -> Result<SecondaryIndexMode, String> {
    SecondaryIndexMode::parse(value).ok_or_else(|| format!("unknown secondary index mode {value:?}"))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true).with_writer(std::io::stderr))
        .init();
}

fn config_with(args: &DatasetArgs) -> Result<PipelineConfig> {
    let mut config = PipelineConfig::load()?;
    if let Some(path) = &args.dataset {
        config.dataset_path = path.clone();
    }
    if let Some(mode) = args.secondary_index {
        config.secondary_index = mode;
    }
    Ok(config)
}

fn print_json<T: serde::Serialize>(value: &T, pretty: bool) -> Result<()> {
    let text = if pretty {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    }
    .context("serializing output")?;
    println!("{text}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli
        .command
        .unwrap_or_else(|| Commands::Validate(ValidateArgs::default()))
    {
        Commands::Validate(args) => {
            let mut config = config_with(&args.dataset)?;
            if args.no_deep_analysis {
                config.deep_analysis = false;
            }
            let store = load_record_store(&config.dataset_path)
                .with_context(|| format!("loading dataset {}", config.dataset_path.display()))?;
            let generator = if args.no_commentary {
                None
            } else {
                build_commentary_generator(&config)?
            };
            let mut pipeline = ValidationPipeline::new(store, config);
            if let Some(generator) = generator {
                pipeline = pipeline.with_commentary(generator);
            }
            let report = pipeline.run_with_commentary().await;
            print_json(&report, args.pretty)?;
        }
        Commands::Trend(args) => {
            let mut config = config_with(&args.dataset)?;
            if let Some(type_code) = args.type_code {
                config.trend.type_code = type_code;
            }
            let store = load_record_store(&config.dataset_path)
                .with_context(|| format!("loading dataset {}", config.dataset_path.display()))?;
            let mut report = ValidationPipeline::new(store, config).trend();
            if let Some(vendor) = args.vendor {
                report.points.retain(|p| p.vendor_name == vendor);
                report.comparisons.retain(|c| c.vendor_name == vendor);
            }
            print_json(&report, args.pretty)?;
        }
        Commands::Serve => {
            pricewatch_web::serve_from_env().await?;
        }
    }

    Ok(())
}
