//! skuad - the skua orchestration daemon
//!
//! Usage:
//!   skuad <working-dir> <cacert> <cert> <key> [--verbosity debug]

use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use skua::daemon::{self, DaemonConfig};
use skua::vm::MonitorLauncher;

#[derive(Parser, Debug)]
#[clap(version, about = "Certificate-driven orchestration daemon for unikernel micro-VMs")]
struct Args {
    /// Directory holding the helper sockets and per-VM image files
    working_dir: PathBuf,
    /// CA certificate anchoring every client chain (PEM, exactly one)
    cacert: PathBuf,
    /// Server certificate presented to clients (PEM)
    cert: PathBuf,
    /// Server private key (PEM)
    key: PathBuf,
    /// Log verbosity: error, warn, info, debug, trace
    #[clap(long, default_value = "info")]
    verbosity: String,
    /// Unikernel monitor binary used to boot guests
    #[clap(long, env = "SKUA_MONITOR", default_value = "ukvm-bin")]
    monitor: PathBuf,
    /// TCP port for the TLS listener
    #[clap(long, default_value_t = daemon::LISTEN_PORT)]
    port: u16,
}

fn init_logging(verbosity: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("skua={0},skuad={0}", verbosity)));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(&args.verbosity);

    if !args.working_dir.is_dir() {
        error!("working directory {:?} does not exist", args.working_dir);
        exit(1);
    }

    let config = DaemonConfig {
        workdir: args.working_dir,
        cacert: args.cacert,
        cert: args.cert,
        key: args.key,
        port: args.port,
    };
    let launcher = Arc::new(MonitorLauncher::new(args.monitor));

    if let Err(e) = daemon::run(config, launcher).await {
        error!("{}", e);
        exit(1);
    }
}
