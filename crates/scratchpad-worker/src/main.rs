//! Scratchpad worker process.
//!
//! Launched by the host as `scratchpad-worker <endpoint> <handshake>`. Binds
//! a Unix socket at `endpoint`, writes `ready <pid>` into the host's handshake
//! file, then serves the host's calls until it disconnects.

use std::path::PathBuf;

use clap::Parser;
use scratchpad_core::{BatchConfig, FsReferenceResolver, PadCompiler, WorkerService, serve};

#[derive(Parser)]
#[command(name = "scratchpad-worker")]
#[command(about = "Script execution worker for the Scratchpad host")]
#[command(version)]
struct Args {
    /// Socket path to listen on
    endpoint: PathBuf,

    /// Handshake file to signal once listening
    handshake: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Logs go to stderr, which the host inherits.
    let filter = if args.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let service =
        WorkerService::new(PadCompiler::new(), FsReferenceResolver, BatchConfig::default())?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve(&args.endpoint, &args.handshake, service))?;

    tracing::debug!("Worker {} exiting", std::process::id());
    Ok(())
}
