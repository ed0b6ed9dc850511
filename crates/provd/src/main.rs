//! provd — the provgrid daemon.
//!
//! # Usage
//!
//! ```text
//! provd run --config provgrid.toml --data-dir /var/lib/provgrid --catalog ./catalog
//! provd resolve --catalog ./catalog --tenant acme --template hadoop
//! provd check-config --config provgrid.toml
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use provd::{Catalog, HttpProvisioner};
use provgrid_core::ProvgridConfig;
use provgrid_scheduler::{LoggingCallback, Orchestrator};
use provgrid_state::StateStore;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,provd=debug,provgrid=debug";

#[derive(Parser)]
#[command(name = "provd", about = "provgrid cluster provisioning daemon")]
struct Cli {
    /// Log as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane until interrupted.
    Run {
        /// Configuration file. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Data directory; overrides `[store] path` with `<dir>/provgrid.redb`.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Catalog directory to seed before starting.
        #[arg(long)]
        catalog: Option<PathBuf>,
    },

    /// Print a resolved template from a catalog directory.
    Resolve {
        #[arg(long)]
        catalog: PathBuf,

        #[arg(long)]
        tenant: String,

        #[arg(long)]
        template: String,

        /// Configuration file providing `[template] mandatory_order`.
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Validate a configuration file and print it with defaults filled in.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Run {
            config,
            data_dir,
            catalog,
        } => run(config.as_deref(), data_dir, catalog.as_deref()).await,
        Command::Resolve {
            catalog,
            tenant,
            template,
            config,
        } => resolve(&catalog, &tenant, &template, config.as_deref()),
        Command::CheckConfig { config } => check_config(&config),
    }
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<ProvgridConfig> {
    match path {
        Some(path) => ProvgridConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(ProvgridConfig::default()),
    }
}

async fn run(
    config_path: Option<&Path>,
    data_dir: Option<PathBuf>,
    catalog_dir: Option<&Path>,
) -> anyhow::Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(dir) = data_dir {
        config.store.path = dir.join("provgrid.redb");
    }
    info!(store = %config.store.path.display(), "provd starting");

    if let Some(parent) = config.store.path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let state = StateStore::open(&config.store.path)
        .with_context(|| format!("opening store {}", config.store.path.display()))?;
    info!(path = %config.store.path.display(), "state store opened");

    let catalog = match catalog_dir {
        Some(dir) => {
            let catalog = Catalog::load(dir)
                .with_context(|| format!("loading catalog {}", dir.display()))?;
            catalog.seed(&state)?;
            Some(catalog)
        }
        None => None,
    };

    let provisioner = Arc::new(HttpProvisioner::default());
    let orchestrator = Orchestrator::new(
        state.clone(),
        &config,
        provisioner,
        Arc::new(LoggingCallback),
    )?;

    if let Some(catalog) = catalog {
        for registration in catalog.workers {
            let id = registration.id.clone();
            if let Err(e) = orchestrator.register_worker(registration) {
                warn!(worker_id = %id, error = %e, "skipping catalog worker");
            }
        }
    }

    orchestrator.recover().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runner = orchestrator.clone();
    let loops = tokio::spawn(async move { runner.run(shutdown_rx).await });

    tokio::signal::ctrl_c()
        .await
        .context("installing Ctrl-C handler")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    if let Err(e) = loops.await {
        warn!(error = %e, "background loops ended abnormally");
    }
    info!("provd stopped");
    Ok(())
}

fn resolve(
    catalog_dir: &Path,
    tenant: &str,
    template: &str,
    config_path: Option<&Path>,
) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let catalog = Catalog::load(catalog_dir)
        .with_context(|| format!("loading catalog {}", catalog_dir.display()))?;
    let resolved = catalog
        .resolve(tenant, template, config.template.mandatory_order)
        .with_context(|| format!("resolving {tenant}/{template}"))?;
    println!("{}", serde_json::to_string_pretty(&resolved)?);
    Ok(())
}

fn check_config(path: &Path) -> anyhow::Result<()> {
    let config = load_config(Some(path))?;
    print!("{}", config.to_toml_string()?);
    Ok(())
}
