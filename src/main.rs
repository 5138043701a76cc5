//! Entropy Feeder CLI
//!
//! Runs the feeder daemon, probes configured sources, or prints the
//! effective configuration.

use clap::{Parser, Subcommand};
use entropy_feeder::{
    config::{FileConfig, SourceConfig},
    feedback::{KernelFeedback, LinuxPoolDevice, MockPoolDevice, SharedPoolDevice},
    metrics::MetricsRegistry,
    scheduler::Scheduler,
    source::KernelPoolSource,
    AcceptedSample, Credential, EntropySample, EntropySource, SourceError,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Bytes read from each source by `probe`.
const PROBE_LEN: usize = 32;

/// Feeds hardware entropy sources into the kernel pool
#[derive(Parser)]
#[command(name = "entropy-feeder")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the feeder until interrupted
    Run {
        /// Path to the TOML configuration file
        #[arg(long, short, default_value = "/etc/entropy-feeder.toml")]
        config: PathBuf,

        /// Feed an in-memory pool instead of the kernel
        #[arg(long)]
        dry_run: bool,
    },

    /// Open every configured source once and read a test sample
    Probe {
        #[arg(long, short, default_value = "/etc/entropy-feeder.toml")]
        config: PathBuf,
    },

    /// Validate the configuration and print it with secrets masked
    CheckConfig {
        #[arg(long, short, default_value = "/etc/entropy-feeder.toml")]
        config: PathBuf,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Run { config, dry_run } => run(&config, dry_run),
        Commands::Probe { config } => probe(&config),
        Commands::CheckConfig { config } => check_config(&config),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn load(path: &Path) -> Result<FileConfig, String> {
    FileConfig::from_file(path).map_err(|e| format!("{}: {}", path.display(), e))
}

fn run(path: &Path, dry_run: bool) -> Result<(), String> {
    let config = load(path)?;
    info!("Entropy Feeder v{}", entropy_feeder::VERSION);

    let device = if dry_run {
        warn!("Dry run: feeding an in-memory pool");
        SharedPoolDevice::new(MockPoolDevice::new(0, 256))
    } else {
        let device = LinuxPoolDevice::open(&config.feedback.device_path).map_err(|e| {
            format!(
                "cannot open {}: {}",
                config.feedback.device_path.display(),
                e
            )
        })?;
        SharedPoolDevice::new(device)
    };

    let feedback = KernelFeedback::new(device.clone(), &config.feedback);
    let pool = KernelPoolSource::new(device);
    let sources = config.build_sources().map_err(|e| e.to_string())?;
    if sources.is_empty() {
        warn!("No sources configured; only the pool estimate will be tracked");
    }

    let registry = Arc::new(MetricsRegistry::new().map_err(|e| e.to_string())?);
    let mut scheduler = Scheduler::new(
        config.scheduler.clone(),
        sources,
        config.accountant(),
        feedback,
        pool,
    )
    .map_err(|e| e.to_string())?
    .with_metrics(Arc::clone(&registry));

    let handle = scheduler.handle();
    if let Err(e) = ctrlc::set_handler(move || handle.shutdown()) {
        warn!(error = %e, "Failed to install signal handler");
    }

    serve_metrics(config.metrics.port, registry);

    scheduler.run();

    let stats = scheduler.feedback().stats();
    info!(
        accounted_bits = stats.accounted_bits,
        unaccounted_bytes = stats.unaccounted_bytes,
        reseeds = stats.reseeds,
        "Feeder stopped"
    );
    for status in scheduler.status() {
        info!(
            source = %status.id,
            state = %status.state,
            reads = status.reads,
            accounted_bits = status.accounted_bits,
            last_success = ?status.last_success.map(|t| t.to_rfc3339()),
            "Final source status"
        );
    }
    Ok(())
}

#[cfg(feature = "metrics")]
fn serve_metrics(port: u16, registry: Arc<MetricsRegistry>) {
    use entropy_feeder::metrics::{MetricsServer, MetricsServerConfig};

    if port == 0 {
        return;
    }
    std::thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                tracing::error!(error = %e, "Failed to start metrics runtime");
                return;
            }
        };
        let server = MetricsServer::new(MetricsServerConfig::with_port(port), registry);
        if let Err(e) = runtime.block_on(server.run()) {
            tracing::error!(error = %e, "Metrics server stopped");
        }
    });
}

#[cfg(not(feature = "metrics"))]
fn serve_metrics(port: u16, _registry: Arc<MetricsRegistry>) {
    if port != 0 {
        warn!(port, "Built without the metrics feature; exporter disabled");
    }
}

fn probe(path: &Path) -> Result<(), String> {
    let config = load(path)?;
    let mut accountant = config.accountant();

    println!(
        "{:<16} {:<16} {:<10} {:>6} {:>8}  result",
        "source", "kind", "trust", "bytes", "credit"
    );
    let mut failed = 0;
    for source in &config.sources {
        match probe_source(source) {
            Ok((sample, details)) => {
                let bytes = sample.len();
                let (credit, verdict): (String, String) = match accountant.accept(sample) {
                    Ok(AcceptedSample::Accounted { bits, .. }) => (bits.to_string(), "ok".into()),
                    Ok(AcceptedSample::Unaccounted { reason, .. }) => {
                        ("0".into(), format!("uncredited ({:?})", reason))
                    }
                    Err(e) => ("0".into(), e.to_string()),
                };
                println!(
                    "{:<16} {:<16} {:<10} {:>6} {:>8}  {}",
                    source.id,
                    source.settings.kind(),
                    format!("{:?}", source.trust),
                    bytes,
                    credit,
                    verdict
                );
                for (key, value) in details {
                    println!("    {}: {}", key, value);
                }
            }
            Err(e) => {
                failed += 1;
                println!(
                    "{:<16} {:<16} {:<10} {:>6} {:>8}  FAILED: {}",
                    source.id,
                    source.settings.kind(),
                    format!("{:?}", source.trust),
                    "-",
                    "-",
                    e
                );
            }
        }
    }

    if failed > 0 {
        return Err(format!("{} of {} sources failed", failed, config.sources.len()));
    }
    Ok(())
}

type ProbeResult = (EntropySample, Vec<(String, String)>);

fn probe_source(config: &SourceConfig) -> Result<ProbeResult, String> {
    let mut source = config.build_source().map_err(|e| e.to_string())?;
    let credential = config.credential().map_err(|e| e.to_string())?;

    let result = sample_once(source.as_mut(), credential.as_ref());
    source.close();
    result.map_err(|e| e.to_string())
}

fn sample_once(
    source: &mut dyn EntropySource,
    credential: Option<&Credential>,
) -> Result<ProbeResult, SourceError> {
    source.open()?;
    let details = source.describe();
    if let Some(credential) = credential {
        source.authenticate(credential)?;
    }
    let sample = source.read(PROBE_LEN)?;
    Ok((sample, details))
}

fn check_config(path: &Path) -> Result<(), String> {
    let config = load(path)?;
    let rendered = config.to_redacted_toml().map_err(|e| e.to_string())?;
    println!("{}", rendered);
    info!(sources = config.sources.len(), "Configuration is valid");
    Ok(())
}
