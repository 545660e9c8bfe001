use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use marketflow::config::AppConfig;
use marketflow::error::AppError;
use marketflow::pipeline::{CancelSignal, Orchestrator, RequestInput, RunOutcome};
use marketflow::report::render_markdown;
use marketflow::shutdown::cancel_on_shutdown;

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Markdown,
    Json,
}

#[derive(Parser)]
#[command(name = "marketflow", about = "Generate a marketing strategy report")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Request file (TOML or JSON) instead of the inline flags
    #[arg(short, long, conflicts_with_all = ["company", "industry", "description"])]
    input: Option<PathBuf>,

    /// Company website domain
    #[arg(long, required_unless_present = "input")]
    company: Option<String>,

    #[arg(long, required_unless_present = "input")]
    industry: Option<String>,

    /// Project description (at least 50 characters)
    #[arg(long, required_unless_present = "input")]
    description: Option<String>,

    #[arg(long)]
    target_market: Option<String>,

    #[arg(long)]
    goals: Option<String>,

    /// Write the report here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "markdown")]
    format: OutputFormat,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

impl Cli {
    fn request(&self) -> anyhow::Result<RequestInput> {
        let input = match &self.input {
            Some(path) => read_request(path)
                .with_context(|| format!("Failed to load request from {}", path.display()))?,
            None => RequestInput {
                company_domain: self.company.clone().unwrap_or_default(),
                industry: self.industry.clone().unwrap_or_default(),
                project_description: self.description.clone().unwrap_or_default(),
                target_market: self.target_market.clone(),
                goals: self.goals.clone(),
            },
        };
        input.validate()?;
        Ok(input)
    }
}

/// TOML when the extension says so, JSON otherwise.
fn read_request(path: &Path) -> marketflow::error::Result<RequestInput> {
    let raw = std::fs::read_to_string(path)?;
    let input = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => toml::from_str(&raw)?,
        _ => serde_json::from_str(&raw)?,
    };
    Ok(input)
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    // Logs go to stderr so stdout carries only the report.
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = AppConfig::load(cli.config.as_deref())?;
    let input = cli.request()?;

    tracing::info!(
        company = %input.company_domain,
        industry = %input.industry,
        model = %config.generation.model,
        "Starting Marketflow"
    );

    let orchestrator = Orchestrator::from_config(&config)?;

    let cancel = CancelSignal::new();
    let signal_task = cancel_on_shutdown(cancel.clone());
    let report = orchestrator.run(input, &cancel).await;
    signal_task.abort();

    let rendered = match cli.format {
        OutputFormat::Markdown => render_markdown(&report),
        OutputFormat::Json => serde_json::to_string_pretty(&report)?,
    };

    match &cli.output {
        Some(path) => {
            std::fs::write(path, rendered)
                .with_context(|| format!("Failed to write report to {}", path.display()))?;
            tracing::info!(path = %path.display(), "Report written");
        }
        None => println!("{rendered}"),
    }

    if report.outcome == RunOutcome::TotalFailure {
        return Err(AppError::TotalFailure.into());
    }

    Ok(())
}
