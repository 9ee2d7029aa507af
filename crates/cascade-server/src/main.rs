use cascade_core::{Engine, EngineOptions};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "cascade-server", about = "Cascade environment pipeline API server")]
struct Cli {
    /// Port to listen on.
    #[arg(long, default_value_t = 8246)]
    port: u16,

    /// Directory holding the pipeline store.
    #[arg(long, default_value = "./cascade-data")]
    data_dir: PathBuf,

    /// Adapter set to use: `mock` or `command`.
    #[arg(long, default_value = "mock")]
    adapters: String,

    /// TOML config for the command adapter set.
    #[arg(long)]
    adapter_config: Option<PathBuf>,

    /// Worker threads executing promotion jobs.
    #[arg(long, default_value_t = 2)]
    workers: usize,

    /// Queued jobs accepted before promotions get 429.
    #[arg(long, default_value_t = 8)]
    queue_depth: usize,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let adapters =
        match cascade_adapters::select_adapters(&cli.adapters, cli.adapter_config.as_deref()) {
            Ok(set) => set,
            Err(e) => {
                eprintln!("adapter setup failed: {e}");
                std::process::exit(1);
            }
        };
    if !adapters.runtime.available() {
        eprintln!(
            "runtime adapter '{}' is not available on this host",
            adapters.runtime.name()
        );
        std::process::exit(1);
    }

    let options = EngineOptions {
        workers: cli.workers,
        queue_depth: cli.queue_depth,
        lock_timeout: Duration::from_millis(500),
    };
    let engine = match Engine::open(&cli.data_dir, adapters, options) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("failed to open pipeline store: {e}");
            std::process::exit(1);
        }
    };

    let addr = format!("0.0.0.0:{}", cli.port);
    let server = match tiny_http::Server::http(&addr) {
        Ok(server) => Arc::new(server),
        Err(e) => {
            eprintln!("failed to bind {addr}: {e}");
            std::process::exit(1);
        }
    };

    info!("starting cascade-server on {addr}");
    info!("store: {}, adapters: {}", cli.data_dir.display(), cli.adapters);

    let srv = Arc::clone(&server);
    if let Err(e) = ctrlc::set_handler(move || srv.unblock()) {
        eprintln!("failed to install signal handler: {e}");
        std::process::exit(1);
    }

    cascade_server::run_server(&engine, &server);
    info!("shutting down");
}
