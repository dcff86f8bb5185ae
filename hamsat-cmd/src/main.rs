mod import;
mod sink;

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use hamsat::queue::{Dispatcher, DispatcherConfig, ForwardingQueue};
use hamsat::server::{ConnectionServer, ServerConfig};
use hamsat::spacecraft::SpacecraftRegistry;

#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Directory of spacecraft descriptor files and their layout CSVs.
    #[arg(short, long, default_value = "spacecraft", value_name = "dir")]
    spacecraft_dir: PathBuf,

    /// Working directory for payload and queue files.
    #[arg(short, long, default_value = "data", value_name = "dir")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the telemetry ingestion server.
    ///
    /// Accepts producer connections and decodes their frames against the
    /// loaded spacecraft configurations. Frames from forwarding-flagged
    /// spacecraft are also relayed to their downstream servers.
    Serve {
        /// Frame ingestion port.
        #[arg(short, long, default_value_t = 41042)]
        port: u16,

        /// Address to bind.
        #[arg(long, default_value = "0.0.0.0")]
        bind: String,

        /// Maximum simultaneous connection workers.
        #[arg(long, default_value_t = 100)]
        pool_size: usize,
    },
    /// Bulk-import captured raw frame files into the payload store.
    ///
    /// Every regular file in the directory is treated as one raw frame.
    Import {
        /// Directory of raw frame files.
        dir: PathBuf,
    },
    /// List the loaded spacecraft configurations.
    Spacecraft,
}

fn main() {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_env_filter(
            EnvFilter::try_from_env("HAMSAT_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(&cli) {
        error!("{err:#}");
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<()> {
    match &cli.command {
        Commands::Serve {
            port,
            bind,
            pool_size,
        } => serve(cli, bind, *port, *pool_size),
        Commands::Import { dir } => {
            let registry = load_registry(cli)?;
            let sink = open_sink(cli)?;
            import::import_dir(dir, &registry, &sink)
        }
        Commands::Spacecraft => {
            let registry = load_registry(cli)?;
            for sc in registry.all() {
                let forward = sc
                    .forward
                    .as_ref()
                    .map_or_else(|| "-".to_string(), |t| format!("{}:{}", t.host, t.port));
                println!(
                    "{:>3}  {:<16} {:>7} kHz  {:?}/{:?}  forward={forward}",
                    sc.id, sc.name, sc.downlink_freq_khz, sc.family, sc.class
                );
            }
            Ok(())
        }
    }
}

fn load_registry(cli: &Cli) -> Result<Arc<SpacecraftRegistry>> {
    let registry = SpacecraftRegistry::load_dir(&cli.spacecraft_dir).with_context(|| {
        format!(
            "loading spacecraft configurations from {}",
            cli.spacecraft_dir.display()
        )
    })?;
    info!(count = registry.len(), "spacecraft configurations loaded");
    Ok(Arc::new(registry))
}

fn open_sink(cli: &Cli) -> Result<sink::JsonlSink> {
    let payload_dir = cli.data_dir.join("payloads");
    fs::create_dir_all(&payload_dir)
        .with_context(|| format!("creating payload directory {}", payload_dir.display()))?;
    Ok(sink::JsonlSink::new(payload_dir))
}

fn serve(cli: &Cli, bind: &str, port: u16, pool_size: usize) -> Result<()> {
    info!("hamsat {}", env!("CARGO_PKG_VERSION"));

    let registry = load_registry(cli)?;
    let sink = Arc::new(open_sink(cli)?);
    let queue_dir = cli.data_dir.join("queue");
    let queue = Arc::new(
        ForwardingQueue::open(&queue_dir)
            .with_context(|| format!("opening forwarding queue in {}", queue_dir.display()))?,
    );

    let config = ServerConfig::builder()
        .bind_addr(bind.to_string())
        .port(port)
        .pool_size(pool_size)
        .build();
    let server = match ConnectionServer::bind(config, registry.clone(), sink, queue.clone()) {
        Ok(server) => server,
        Err(err) => {
            error!(%err, port, "could not listen on port");
            std::process::exit(-1);
        }
    };

    let dispatcher = Dispatcher::start(queue, registry, DispatcherConfig::default());
    let zult = server.serve();
    dispatcher.shutdown();
    zult.context("server loop failed")
}
