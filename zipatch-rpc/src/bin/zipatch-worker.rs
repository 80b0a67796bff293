//! Worker subprocess: serves the patch engine protocol on stdin/stdout
//!
//! Logs go to stderr so they never mix with protocol frames.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use zipatch_rpc::WorkerSession;

#[derive(Parser)]
#[command(
    name = "zipatch-worker",
    version,
    about = "Patch engine worker serving framed requests on stdin/stdout"
)]
struct Args {
    /// Log filter, e.g. "info" or "zipatch_install=debug"
    #[arg(long, default_value = "info", env = "ZIPATCH_LOG")]
    log: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&args.log)?)
        .with_writer(std::io::stderr)
        .init();

    WorkerSession::run(tokio::io::stdin(), tokio::io::stdout()).await?;
    Ok(())
}
