//! Run command implementation.
//!
//! Executes one script file in a fresh worker and prints what it dumps.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use scratchpad_core::{ExecutionHost, HostConfig};

use crate::colors;
use crate::output::TerminalSink;

/// Run a script file.
pub async fn execute(file: &Path, config: HostConfig, json: bool) -> anyhow::Result<()> {
    let code = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;

    let start = Instant::now();
    let sink = Arc::new(TerminalSink::new(json));
    let host = ExecutionHost::new(config, sink.clone())?;

    host.execute(&code).await?;
    host.shutdown();

    let summary = sink.take_summary();
    if !json {
        let color = if summary.errors > 0 {
            colors::RED
        } else {
            colors::GREEN
        };
        eprintln!(
            "\n{}Finished{} {} in {:.2}s ({} value(s), {} warning(s), {} error(s))",
            color,
            colors::RESET,
            file.display(),
            start.elapsed().as_secs_f64(),
            summary.values,
            summary.warnings,
            summary.errors
        );
    }

    if summary.errors > 0 {
        anyhow::bail!("{} reported {} error(s)", file.display(), summary.errors);
    }
    Ok(())
}
