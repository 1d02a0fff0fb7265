mod config;
mod connection;
mod fatal;
mod queue;
mod registry;
mod server;
mod shutdown;
mod signals;
mod stats;
mod worker;

use clap::Parser;
use config::{ServerConfig, PORT_MIN};
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// A TCP server that hands each accepted client to a worker thread and
/// spools the client's bytes into `<address>_<port>.out`. Ctrl-C stops
/// accepting, waits for every worker, and exits.
#[derive(Parser, Debug)]
#[command(name = "tcpspool", version, about)]
pub struct Cli {
    /// Port to listen on (must be greater than 1023)
    #[arg(value_name = "PORT")]
    port: Option<u16>,

    /// Config file path
    #[arg(short, long, default_value = "tcpspool.toml")]
    config: PathBuf,

    /// Address to bind (overrides config)
    #[arg(short, long)]
    bind: Option<IpAddr>,

    /// Idle worker threads kept ready (overrides config)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Directory for client output files (overrides config)
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Maximum bytes per read from a client (overrides config)
    #[arg(long)]
    buffer_size: Option<usize>,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (queue and registry activity)
    #[arg(short, long)]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long)]
    quiet: bool,
}

impl Cli {
    /// Apply command-line overrides on top of the file configuration.
    fn apply(&self, config: &mut ServerConfig) {
        if let Some(port) = self.port {
            config.listen.port = port;
        }
        if let Some(bind) = self.bind {
            config.listen.bind = bind;
        }
        if let Some(workers) = self.workers {
            config.workers.pool_size = workers;
        }
        if let Some(dir) = &self.output_dir {
            config.output.dir = dir.clone();
        }
        if let Some(size) = self.buffer_size {
            config.output.buffer_size = size;
        }
    }

    fn default_filter(&self) -> &'static str {
        if self.verbose {
            "debug"
        } else if self.quiet {
            "warn"
        } else {
            "info"
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.default_filter()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    let mut config = match ServerConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };
    cli.apply(&mut config);
    if let Err(e) = config.validate() {
        eprintln!("error: {e}");
        eprintln!("usage: tcpspool [OPTIONS] <PORT>   (PORT > {PORT_MIN})");
        return ExitCode::FAILURE;
    }

    if cli.dry_run {
        println!("{config:#?}");
        println!("Dry run mode — config validated, not running.");
        return ExitCode::SUCCESS;
    }

    let mut server = match server::Server::initialize(&config) {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(error = %e, "failed to start");
            return ExitCode::FAILURE;
        }
    };
    tracing::info!(
        port = config.listen.port,
        workers = config.workers.pool_size,
        output = %config.output.dir.display(),
        "tcpspool v{} started",
        env!("CARGO_PKG_VERSION")
    );

    let result = server.run();
    if let Err(e) = &result {
        tracing::error!(error = %e, "accept loop failed");
    }
    server.shutdown_and_join();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(_) => ExitCode::FAILURE,
    }
}
