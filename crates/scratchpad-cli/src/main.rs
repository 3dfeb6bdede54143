//! Scratchpad CLI - run pad scripts in an isolated worker process.

mod colors;
mod output;
mod repl;
mod run;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use scratchpad_core::HostConfig;

#[derive(Parser)]
#[command(name = "scratchpad")]
#[command(about = "Run pad scripts in an isolated worker process")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to a JSON host config
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Print dump events as JSON lines
    #[arg(long, global = true)]
    json: bool,

    /// Module scripts may call into (repeatable; replaces the configured list)
    #[arg(long = "import", global = true)]
    imports: Vec<String>,

    /// Script file loaded ahead of every execution (repeatable)
    #[arg(long = "reference", global = true)]
    references: Vec<String>,

    /// Worker binary to launch
    #[arg(long, global = true)]
    worker: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a script file once
    Run {
        /// Path to the script (.pad file)
        file: PathBuf,
    },

    /// Start an interactive session
    Repl,
}

impl Cli {
    fn host_config(&self) -> anyhow::Result<HostConfig> {
        let mut config = match &self.config {
            Some(path) => HostConfig::load(path)?,
            None => HostConfig::default(),
        };

        if !self.imports.is_empty() {
            config.imports = self.imports.clone();
        }
        config.references.extend(self.references.iter().cloned());
        if let Some(worker) = &self.worker {
            config.worker_path = Some(worker.clone());
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
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

    // Workers must not outlive an interrupted CLI.
    tokio::spawn(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            scratchpad_core::kill_tracked_workers();
            std::process::exit(130);
        }
    });

    // Helper to format scratchpad-core errors with recovery hints
    let format_error = |err: anyhow::Error| -> anyhow::Error {
        if let Some(core_err) = err.downcast_ref::<scratchpad_core::Error>() {
            anyhow::anyhow!("{}", core_err.with_hint())
        } else {
            err
        }
    };

    let config = cli.host_config().map_err(format_error)?;

    match cli.command {
        Commands::Run { file } => {
            run::execute(&file, config, cli.json)
                .await
                .map_err(format_error)?;
        }

        Commands::Repl => {
            repl::execute(config, cli.json).await.map_err(format_error)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config() {
        let cli = Cli::parse_from([
            "scratchpad",
            "--import",
            "math",
            "--reference",
            "lib.pad",
            "--worker",
            "/opt/worker",
            "run",
            "main.pad",
        ]);
        let config = cli.host_config().unwrap();

        assert_eq!(config.imports, vec!["math"]);
        assert_eq!(config.references, vec!["lib.pad"]);
        assert_eq!(config.worker_path, Some(PathBuf::from("/opt/worker")));
        assert!(matches!(cli.command, Commands::Run { .. }));
    }

    #[test]
    fn test_defaults_without_flags() {
        let cli = Cli::parse_from(["scratchpad", "repl"]);
        let config = cli.host_config().unwrap();
        assert_eq!(config.imports, vec!["math", "text"]);
        assert!(config.references.is_empty());
    }
}
