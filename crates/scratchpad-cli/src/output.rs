//! Terminal rendering of dump events.

use std::io::{self, Write};
use std::sync::{Mutex, PoisonError};

use scratchpad_core::{DumpEvent, DumpPayload, DumpSink, Severity};

use crate::colors;

/// Counts of what a run produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Summary {
    pub values: usize,
    pub warnings: usize,
    pub errors: usize,
}

/// Prints every batch to stdout, colored or as JSON lines.
pub struct TerminalSink {
    json: bool,
    summary: Mutex<Summary>,
}

impl TerminalSink {
    pub fn new(json: bool) -> Self {
        Self {
            json,
            summary: Mutex::new(Summary::default()),
        }
    }

    /// Return and reset the counts since the last call.
    pub fn take_summary(&self) -> Summary {
        std::mem::take(&mut *self.summary.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn record(&self, event: &DumpEvent) {
        let mut summary = self.summary.lock().unwrap_or_else(PoisonError::into_inner);
        match &event.payload {
            DumpPayload::Value(_) => summary.values += 1,
            DumpPayload::Diagnostic(d) if d.severity == Severity::Error => summary.errors += 1,
            DumpPayload::Diagnostic(d) if d.severity == Severity::Warning => summary.warnings += 1,
            DumpPayload::Diagnostic(_) => {}
            DumpPayload::Error(_) => summary.errors += 1,
        }
    }
}

impl DumpSink for TerminalSink {
    fn on_batch(&self, batch: Vec<DumpEvent>) {
        let mut out = io::stdout().lock();
        for event in &batch {
            self.record(event);
            let written = if self.json {
                serde_json::to_writer(&mut out, event)
                    .map_err(io::Error::from)
                    .and_then(|()| writeln!(out))
            } else {
                print_event(&mut out, event)
            };
            if let Err(e) = written {
                tracing::warn!("Failed to write output: {}", e);
                return;
            }
        }
        out.flush().ok();
    }
}

/// Write one event in human-readable form.
pub fn print_event(out: &mut impl Write, event: &DumpEvent) -> io::Result<()> {
    if let Some(header) = &event.header {
        writeln!(out, "{}{}:{}", colors::CYAN, header, colors::RESET)?;
    }

    match &event.payload {
        DumpPayload::Value(value) => writeln!(
            out,
            "{}  {}{}{}",
            value.text,
            colors::DIM,
            value.type_name,
            colors::RESET
        ),
        DumpPayload::Diagnostic(diagnostic) => {
            let color = match diagnostic.severity {
                Severity::Error => colors::RED,
                Severity::Warning => colors::YELLOW,
                Severity::Info => colors::DIM,
            };
            write!(out, "{}{}{}", color, diagnostic.severity, colors::RESET)?;
            if let Some(location) = &diagnostic.location {
                write!(out, " at {}", location)?;
            }
            writeln!(out, ": {}", diagnostic.message)
        }
        DumpPayload::Error(error) => {
            write!(
                out,
                "{}{}{}{}: {}",
                colors::BOLD,
                colors::RED,
                error.kind,
                colors::RESET,
                error.message
            )?;
            if let Some(location) = &error.location {
                write!(out, " {}(at {}){}", colors::DIM, location, colors::RESET)?;
            }
            writeln!(out)
        }
    }
}
