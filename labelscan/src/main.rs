use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use labelscan::config::{parse_backend_order, Config};
use labelscan::ocr::{ExtractOptions, OcrService};

#[derive(Parser)]
#[command(name = "labelscan")]
#[command(about = "Extract structured text from a product label photo")]
struct Args {
    /// PNG or JPEG image of the label
    image: PathBuf,

    /// Fallback chain for this run, e.g. `--backends local,cloud`
    #[arg(long)]
    backends: Option<String>,

    /// Abort after this many seconds
    #[arg(long)]
    timeout: Option<f64>,

    /// Skip the result cache
    #[arg(long)]
    no_cache: bool,

    /// Pretty-print the JSON result
    #[arg(long)]
    pretty: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    dotenvy::dotenv().ok();

    // LOG_FORMAT=json switches stderr logs to one JSON object per line
    let json_logs = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "labelscan=info".into()),
        )
        .with((!json_logs).then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr)))
        .with(json_logs.then(|| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
        }))
        .init();

    let config = Config::from_env().context("Invalid OCR configuration")?;

    tracing::info!(
        "Initializing OCR service (backends: {})...",
        config.ocr.backend_order().join(" -> ")
    );
    let service = OcrService::from_config(&config)?;
    for status in service.backend_status() {
        if !status.available {
            tracing::warn!(
                "OCR backend '{}' unavailable - {}",
                status.id,
                status.reason.unwrap_or_default()
            );
        }
    }

    let image = tokio::fs::read(&args.image)
        .await
        .with_context(|| format!("Failed to read {}", args.image.display()))?;

    let timeout = args
        .timeout
        .map(Duration::try_from_secs_f64)
        .transpose()
        .context("--timeout must be a positive number of seconds")?;

    let cancel_token = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel_token.clone()));

    let options = ExtractOptions {
        timeout,
        cancel: Some(cancel_token),
        bypass_cache: args.no_cache,
        backends: args.backends.as_deref().map(parse_backend_order),
    };

    let result = service.extract_text_with(&image, options).await?;

    if !service.is_confident(&result) {
        tracing::warn!(
            "Confidence {:.2} is below the configured threshold {:.2}",
            result.confidence(),
            service.config().confidence_threshold()
        );
    }

    let output = if args.pretty {
        serde_json::to_string_pretty(&result)?
    } else {
        serde_json::to_string(&result)?
    };
    println!("{output}");

    Ok(())
}

async fn shutdown_signal(cancel_token: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!("Interrupt received, cancelling OCR request...");
        cancel_token.cancel();
    }
}
