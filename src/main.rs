//! codestash: store codebase snapshots over HTTP and serve them back as
//! single files or zip archives.

mod protocol;
mod server;
mod storage;

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use storage::config::StorageConfig;
use storage::StorageService;

#[derive(Parser, Debug)]
#[command(name = "codestash", version, about, long_about = None)]
struct Cli {
    /// Port to listen on
    #[arg(short, long, env = "PORT", default_value_t = 8081)]
    port: u16,

    /// Directory holding one sub-directory per stored codebase
    #[arg(long, env = "STORAGE_ROOT", default_value = "./storage")]
    storage_root: PathBuf,

    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Enable verbose output. Repeat for more verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // RUST_LOG wins over -v
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| match cli.verbose {
        0 => EnvFilter::new("info"),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = std::fs::create_dir_all(&cli.storage_root) {
        tracing::error!(
            "Failed to create storage directory {}: {}",
            cli.storage_root.display(),
            e
        );
        return ExitCode::FAILURE;
    }

    let service = Arc::new(StorageService::new(StorageConfig::with_root(
        cli.storage_root,
    )));
    let addr = SocketAddr::new(cli.bind, cli.port);

    match server::run(addr, service).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("Storage server failed on {}: {}", addr, e);
            ExitCode::FAILURE
        }
    }
}
