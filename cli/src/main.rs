use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::BufReader;
use tracing::{error, info, warn};

use bqtarget_kernel::adapters::local::LocalWarehouse;
use bqtarget_kernel::config::{ConfigError, TargetConfig};
use bqtarget_kernel::pipeline::Pipeline;
use bqtarget_kernel::provision::TableProvisioner;
use bqtarget_kernel::sync_schema::{sync_catalog, Catalog, SyncOptions};

mod exit_codes;
mod logging;

use exit_codes::ExitCode;

/// Singer target that loads tap output into BigQuery-style tables
#[derive(Parser, Debug)]
#[command(name = "bqtarget")]
#[command(about = "Singer target: stream records into warehouse tables", long_about = None)]
struct Cli {
    /// Path to the target config JSON
    #[arg(short, long)]
    config: PathBuf,

    /// Sync table schemas from a catalog instead of reading records
    #[arg(short, long)]
    schema: Option<PathBuf>,

    /// With --schema: print the plan without changing any table
    #[arg(short, long)]
    dryrun: bool,

    /// With --schema: skip incompatible columns instead of failing
    #[arg(short = 'i', long)]
    continue_on_incompatible: bool,

    /// With --schema: only these streams (comma separated)
    #[arg(short, long, value_delimiter = ',')]
    tables: Option<Vec<String>>,

    /// DEBUG, INFO, WARNING, ERROR or CRITICAL
    #[arg(short, long, default_value = "INFO")]
    loglevel: String,
}

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    logging::init_logging(&cli.loglevel);

    match run(cli) {
        Ok(()) => ExitCode::Success.into(),
        Err(err) => {
            let code = ExitCode::for_error(&err);
            error!(code = code.code_name(), "{err:#}");
            code.into()
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    // ----------------------------
    // Load config
    // ----------------------------
    let config = TargetConfig::load(&cli.config)?;
    let warehouse_dir = config
        .warehouse_dir
        .clone()
        .ok_or(ConfigError::Missing("warehouse_dir"))?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("starting async runtime")?;

    runtime.block_on(async move {
        match &cli.schema {
            Some(catalog) => sync(&cli, &config, &warehouse_dir, catalog).await,
            None => ingest(config, warehouse_dir).await,
        }
    })
}

async fn ingest(config: TargetConfig, warehouse_dir: PathBuf) -> Result<()> {
    let warehouse = Arc::new(LocalWarehouse::new(warehouse_dir));
    let pipeline = Pipeline::new(config, warehouse)?;

    // ----------------------------
    // Run: stdin in, STATE lines out
    // ----------------------------
    let input = BufReader::new(tokio::io::stdin());
    let summary = pipeline
        .run(input, std::io::stdout(), shutdown_signal())
        .await?;

    info!(
        summary = %serde_json::to_string(&summary)?,
        "run summary"
    );
    Ok(())
}

async fn sync(cli: &Cli, config: &TargetConfig, warehouse_dir: &Path, catalog: &Path) -> Result<()> {
    // ----------------------------
    // Load catalog
    // ----------------------------
    let data = fs::read_to_string(catalog)
        .with_context(|| format!("reading catalog {}", catalog.display()))?;
    let catalog: Catalog = serde_json::from_str(&data)
        .with_context(|| format!("parsing catalog {}", catalog.display()))?;

    let provisioner = TableProvisioner::new(
        Arc::new(LocalWarehouse::new(warehouse_dir)),
        config.dataset(),
        config.table_naming(),
        config.write_timeout(),
    );
    if !cli.dryrun {
        provisioner.ensure_dataset(&config.location).await?;
    }

    // ----------------------------
    // Plan and apply
    // ----------------------------
    let options = SyncOptions {
        tables: cli.tables.clone(),
        dry_run: cli.dryrun,
        continue_on_incompatible: cli.continue_on_incompatible,
    };
    let plan = sync_catalog(
        &provisioner,
        &catalog,
        config.partition().as_ref(),
        &config.type_names(),
        &options,
    )
    .await?;

    // ----------------------------
    // Output
    // ----------------------------
    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
