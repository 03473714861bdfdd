//! ai-insight - incremental AI ecosystem tracker
//!
//! Collects repositories, models and papers from GitHub, Hugging Face,
//! arXiv and vendor model listings, keeps their history in a local memory
//! store, analyzes new and changed items with an LLM and writes JSON
//! trend and model reports.
//!
//! Exit codes:
//!   0 - Run completed with every stage ok
//!   1 - Fatal error (store unavailable, invalid configuration, ...)
//!   2 - Run completed partially (a source, analysis or report failed, or cancelled)

mod analysis;
mod cli;
mod collector;
mod config;
mod error;
mod fingerprint;
mod llm;
mod models;
mod pipeline;
mod report;
mod retry;
mod sources;
mod store;
#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use cli::Args;
use collector::Collector;
use config::{Config, DEFAULT_CONFIG_FILE};
use indicatif::{ProgressBar, ProgressStyle};
use models::{RunRecord, RunStatus, Stage};
use pipeline::Pipeline;
use report::JsonFileSink;
use std::sync::Arc;
use std::time::Duration;
use store::{JournalStore, MemoryStore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse_args();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // Handle --init-config early (no logging needed)
    if args.init_config {
        return handle_init_config();
    }

    init_logging(&args);

    info!("ai-insight v{}", env!("CARGO_PKG_VERSION"));
    debug!("Arguments: {:?}", args);

    let outcome = if args.status {
        show_status(&args).await
    } else {
        run(args).await
    };

    match outcome {
        Ok(exit_code) => std::process::exit(exit_code),
        Err(e) => {
            error!("Run failed: {:#}", e);
            eprintln!("\n❌ Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Handle --init-config: generate a default .ai-insight.toml.
fn handle_init_config() -> Result<()> {
    let path = std::path::Path::new(DEFAULT_CONFIG_FILE);

    if path.exists() {
        eprintln!(
            "⚠️  {} already exists. Remove it first or edit it manually.",
            DEFAULT_CONFIG_FILE
        );
        std::process::exit(1);
    }

    let content = Config::default_toml();
    std::fs::write(path, &content)
        .with_context(|| format!("Failed to write {}", DEFAULT_CONFIG_FILE))?;

    println!("✅ Created {} with default settings.", DEFAULT_CONFIG_FILE);
    println!("   Edit it to choose sources, the LLM provider, and pipeline limits.");
    Ok(())
}

/// Initialize logging based on verbosity settings, or `RUST_LOG` when set.
fn init_logging(args: &Args) {
    let installed = if std::env::var_os("RUST_LOG").is_some() {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(EnvFilter::from_default_env())
            .with_target(false)
            .compact()
            .finish();
        tracing::subscriber::set_global_default(subscriber)
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(args.log_level())
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .finish();
        tracing::subscriber::set_global_default(subscriber)
    };

    if let Err(e) = installed {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

/// Load the config file, fill secrets from the environment, apply CLI
/// overrides and validate the result.
fn prepare_config(args: &Args) -> Result<Config> {
    let mut config = match args.config {
        Some(ref path) => {
            info!("Loading config from: {}", path.display());
            Config::load(path)?
        }
        None => match Config::load_default()? {
            Some(config) => {
                info!("Loaded default config from {}", DEFAULT_CONFIG_FILE);
                config
            }
            None => {
                debug!("No config file found, using defaults");
                Config::default()
            }
        },
    };

    config.apply_env();
    config.merge_with_args(args);
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn open_store(config: &Config) -> Result<JournalStore> {
    JournalStore::open(&config.memory.data_dir).with_context(|| {
        format!(
            "Failed to open memory store at {}",
            config.memory.data_dir.display()
        )
    })
}

/// Run the pipeline once. Returns the exit code for the run's status.
async fn run(args: Args) -> Result<i32> {
    let config = prepare_config(&args)?;
    let mode = args.run_mode();

    let store: Arc<dyn MemoryStore> = Arc::new(open_store(&config)?);

    let http = sources::http_client(Duration::from_secs(config.pipeline.fetch_timeout_seconds))
        .context("Failed to create HTTP client")?;
    let adapters = sources::build_adapters(&config.sources, &http);
    let llm = llm::build_client(&config.llm).context("Failed to set up the LLM client")?;
    let sink = Arc::new(JsonFileSink::new(&config.general.reports_dir));

    println!("🚀 Starting {} run", mode);
    println!("   Sources: {}", adapters.len());
    println!("   Model: {} ({})", llm.model(), config.llm.provider);
    println!("   Memory: {}", config.memory.data_dir.display());

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing the current stage");
            on_signal.cancel();
        }
    });

    let collector = Collector::new(store.clone(), adapters, config.collector_config());
    let analyzer = analysis::Analyzer::new(store.clone(), llm, config.analyzer_config());
    let pipeline = Pipeline::new(
        store,
        collector,
        analyzer,
        sink,
        config.pipeline_settings(),
        cancel,
    );

    let spinner = if args.quiet { None } else { Some(spinner()) };
    let run = pipeline.run_pipeline(mode).await;
    if let Some(pb) = spinner {
        pb.finish_and_clear();
    }

    print_summary(&run, &config);
    Ok(run.status.exit_code())
}

fn spinner() -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message("running pipeline...");
    pb.enable_steady_tick(Duration::from_millis(120));
    pb
}

fn print_summary(run: &RunRecord, config: &Config) {
    let icon = match run.status {
        RunStatus::Ok => "✅",
        RunStatus::Partial => "⚠️ ",
        RunStatus::Running | RunStatus::FailedFatal => "❌",
    };

    println!("\n📊 Run Summary ({}):", run.run_id);
    for stage in Stage::ALL {
        let Some(report) = run.stage_statuses.get(&stage) else {
            continue;
        };
        match report.detail {
            Some(ref detail) => println!(
                "   {:<10} {} ({})",
                stage.to_string(),
                report.status,
                detail
            ),
            None => println!("   {:<10} {}", stage.to_string(), report.status),
        }
    }
    for (source, report) in &run.sources {
        println!(
            "   - {}: {:?}, {} new, {} changed, {} unchanged",
            source, report.status, report.new, report.changed, report.unchanged
        );
    }
    println!(
        "   Collected: {} | Analyzed: {} | Failed: {}",
        run.collected_count, run.analyzed_count, run.failed_count
    );
    if let Some(ref err) = run.error {
        println!("   Error: {}", err);
    }
    if run.cancelled {
        println!("   Cancelled before all stages ran");
    }
    println!(
        "\n{} Run {}. Reports in: {}",
        icon,
        run.status,
        config.general.reports_dir.display()
    );
}

/// Handle --status: list the most recent runs.
async fn show_status(args: &Args) -> Result<i32> {
    let config = prepare_config(args)?;
    let store = open_store(&config)?;

    let runs = store.recent_runs(10).await?;
    if let Some(path) = store.journal_path() {
        println!("📚 Memory store: {}", path.display());
    }
    if runs.is_empty() {
        println!("   No runs recorded yet.");
        return Ok(0);
    }

    for run in &runs {
        println!(
            "   {}  {:<13} {:<12} collected {:>4}  analyzed {:>4}  failed {:>3}  {}",
            run.run_id,
            run.mode.to_string(),
            run.status.to_string(),
            run.collected_count,
            run.analyzed_count,
            run.failed_count,
            run.started_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    if let Some(last) = store.last_successful_run().await? {
        println!("\n   Last successful run: {}", last.run_id);
    }
    Ok(0)
}
