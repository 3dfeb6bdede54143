//! Output events produced by running scripts.
//!
//! A [`DumpEvent`] is one unit of output destined for display on the host.
//! Events are immutable once created and cross the process boundary in
//! batches.

use std::fmt;

use rkyv::{Archive, Deserialize, Serialize};

/// One unit of script output.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize, serde::Serialize)]
pub struct DumpEvent {
    /// Optional caption shown above the value.
    pub header: Option<String>,
    /// What was produced.
    pub payload: DumpPayload,
}

/// The body of a dump event.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DumpPayload {
    /// A value rendered by the worker.
    Value(RenderedValue),
    /// A compiler or resolver diagnostic.
    Diagnostic(DiagnosticRecord),
    /// An exception captured while running the script.
    Error(ErrorRecord),
}

/// A value already rendered to text inside the worker.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize, serde::Serialize)]
pub struct RenderedValue {
    /// Script-level type name (`int`, `string`, ...).
    pub type_name: String,
    /// Display text.
    pub text: String,
}

/// Severity of a diagnostic.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize, serde::Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

/// A position in script source.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize, serde::Serialize)]
pub struct Location {
    /// Source name for preludes; `None` for the submitted code.
    pub source: Option<String>,
    /// Line number (1-indexed).
    pub line: u32,
    /// Column number (1-indexed).
    pub column: u32,
}

/// A diagnostic produced while compiling or resolving references.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize, serde::Serialize)]
pub struct DiagnosticRecord {
    pub severity: Severity,
    pub message: String,
    pub location: Option<Location>,
}

/// A runtime exception captured by the worker.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize, serde::Serialize)]
pub struct ErrorRecord {
    /// Exception kind (`DivideByZero`, `Thrown`, `Panic`, ...).
    pub kind: String,
    pub message: String,
    pub location: Option<Location>,
}

impl DumpEvent {
    /// A value without a header.
    pub fn value(type_name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            header: None,
            payload: DumpPayload::Value(RenderedValue {
                type_name: type_name.into(),
                text: text.into(),
            }),
        }
    }

    /// Attach a header.
    pub fn with_header(mut self, header: impl Into<String>) -> Self {
        self.header = Some(header.into());
        self
    }

    pub fn diagnostic(record: DiagnosticRecord) -> Self {
        Self {
            header: None,
            payload: DumpPayload::Diagnostic(record),
        }
    }

    pub fn error(record: ErrorRecord) -> Self {
        Self {
            header: None,
            payload: DumpPayload::Error(record),
        }
    }

    /// Upper estimate of this event's encoded size on the wire.
    pub fn encoded_size_hint(&self) -> usize {
        const OVERHEAD: usize = 64;
        let header = self.header.as_ref().map_or(0, String::len);
        let location = |l: &Option<Location>| {
            l.as_ref()
                .map_or(0, |l| l.source.as_ref().map_or(0, String::len) + 16)
        };
        let body = match &self.payload {
            DumpPayload::Value(v) => v.type_name.len() + v.text.len(),
            DumpPayload::Diagnostic(d) => d.message.len() + location(&d.location),
            DumpPayload::Error(e) => e.kind.len() + e.message.len() + location(&e.location),
        };
        OVERHEAD + header + body
    }

    /// Returns the rendered value, if this event carries one.
    pub fn as_value(&self) -> Option<&RenderedValue> {
        match &self.payload {
            DumpPayload::Value(value) => Some(value),
            _ => None,
        }
    }
}

impl DiagnosticRecord {
    pub fn error(message: impl Into<String>, location: Option<Location>) -> Self {
        Self {
            severity: Severity::Error,
            message: message.into(),
            location,
        }
    }

    pub fn warning(message: impl Into<String>, location: Option<Location>) -> Self {
        Self {
            severity: Severity::Warning,
            message: message.into(),
            location,
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "error"),
            Severity::Warning => write!(f, "warning"),
            Severity::Info => write!(f, "info"),
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(source) => write!(f, "{}:{}:{}", source, self.line, self.column),
            None => write!(f, "{}:{}", self.line, self.column),
        }
    }
}

impl fmt::Display for DiagnosticRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(location) => write!(f, "{} at {}: {}", self.severity, location, self.message),
            None => write!(f, "{}: {}", self.severity, self.message),
        }
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(location) = &self.location {
            write!(f, " (at {})", location)?;
        }
        Ok(())
    }
}
