//! reconciler CLI: watch a manifest directory and keep deployments in step.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use reconcile_rs::config::Config;
use reconcile_rs::engine::Controller;
use reconcile_rs::fault::RecordingFaultSink;
use reconcile_rs::handler::{DeploymentHandler, DeploymentRegistry};
use reconcile_rs::informer::dir::load_manifests;
use reconcile_rs::informer::{DirectorySource, Store};
use reconcile_rs::model::Resource;
use reconcile_rs::model::service::HttpService;
use reconcile_rs::telemetry::{TelemetryConfig, init_telemetry};

#[derive(Parser)]
#[command(name = "reconciler", about = "Level-triggered HttpService controller")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the controller until Ctrl-C
    Run {
        /// Directory of HttpService TOML manifests
        #[arg(long)]
        resources: Option<PathBuf>,
        /// Number of dispatcher workers
        #[arg(long)]
        workers: Option<usize>,
        /// Retries before a key is given up on
        #[arg(long)]
        max_retries: Option<u32>,
        /// First retry delay in milliseconds
        #[arg(long)]
        backoff_base_ms: Option<u64>,
        /// Maximum retry delay in milliseconds
        #[arg(long)]
        backoff_cap_ms: Option<u64>,
        /// How often the manifest directory is re-listed
        #[arg(long)]
        poll_interval_ms: Option<u64>,
    },
    /// Parse every manifest and report problems without running
    Validate {
        /// Directory of HttpService TOML manifests
        #[arg(long)]
        resources: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let mut config = Config::from_env()?;

    match cli.command {
        Command::Run {
            resources,
            workers,
            max_retries,
            backoff_base_ms,
            backoff_cap_ms,
            poll_interval_ms,
        } => {
            if let Some(dir) = resources {
                config.resource_dir = Some(dir);
            }
            if let Some(n) = workers {
                config.controller.workers = n;
            }
            if let Some(n) = max_retries {
                config.controller.max_retries = n;
            }
            if let Some(ms) = backoff_base_ms {
                config.controller.backoff_base = Duration::from_millis(ms);
            }
            if let Some(ms) = backoff_cap_ms {
                config.controller.backoff_cap = Duration::from_millis(ms);
            }
            if let Some(ms) = poll_interval_ms {
                config.poll_interval = Duration::from_millis(ms);
            }
            config.validate()?;
            cmd_run(config).await
        }
        Command::Validate { resources } => {
            let dir = resources
                .or(config.resource_dir)
                .ok_or_else(|| anyhow::anyhow!("no resource dir: pass --resources or set RECONCILE_RESOURCE_DIR"))?;
            cmd_validate(dir)
        }
    }
}

async fn cmd_run(config: Config) -> anyhow::Result<()> {
    let dir = config
        .resource_dir
        .clone()
        .ok_or_else(|| anyhow::anyhow!("no resource dir: pass --resources or set RECONCILE_RESOURCE_DIR"))?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "reconciler".to_string(),
        default_filter: config.log_level.clone(),
    })?;

    let store = Arc::new(Store::<HttpService>::new());
    let source = Arc::new(DirectorySource::new(&dir, config.poll_interval, Arc::clone(&store)));
    let registry = Arc::new(DeploymentRegistry::new());
    let handler = Arc::new(DeploymentHandler::new(Arc::clone(&registry)));
    let faults = Arc::new(RecordingFaultSink::new());

    let controller = Controller::<HttpService>::new(config.controller.clone(), source, store, handler)?
        .with_fault_sink(faults.clone());

    controller
        .run(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;

    let deployments = registry.list();
    println!("{:<32}  {:<24}  {:<5}  {:<5}  VERSION", "KEY", "IMAGE", "GET", "PUT");
    println!("{}", "-".repeat(80));
    for d in &deployments {
        println!(
            "{:<32}  {:<24}  {:<5}  {:<5}  {}",
            d.key().to_string(),
            d.image,
            d.get_enabled(),
            d.put_enabled(),
            d.metadata.resource_version
        );
    }
    println!("\n{} deployment(s)", deployments.len());

    if !faults.is_empty() {
        println!("\nFaults:");
        for (at, fault) in faults.timeline() {
            println!(
                "  {}  {}",
                at.format("%Y-%m-%d %H:%M:%S"),
                serde_json::to_string(&fault)?
            );
        }
    }
    Ok(())
}

fn cmd_validate(dir: PathBuf) -> anyhow::Result<()> {
    let listing = load_manifests::<HttpService>(&dir)?;

    for (path, svc) in &listing.objects {
        println!(
            "ok     {:<32}  {}  (image {}, access mode {})",
            svc.key().to_string(),
            path.display(),
            svc.spec.image,
            svc.spec.access_mode
        );
    }
    for err in &listing.errors {
        println!("error  {err}");
    }

    println!(
        "\n{} valid, {} invalid",
        listing.objects.len(),
        listing.errors.len()
    );
    if !listing.errors.is_empty() {
        anyhow::bail!("{} manifest(s) failed to parse", listing.errors.len());
    }
    Ok(())
}
