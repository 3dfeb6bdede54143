//! Host configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::protocol::InitializeParams;
use crate::resolver::ResolverConfig;

/// Default per-attempt wait for the worker handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 5_000;

/// Default number of slots tried before giving up.
pub const DEFAULT_MAX_ATTEMPTS: usize = 2;

/// Settings for an [`ExecutionHost`](crate::host::ExecutionHost).
///
/// Every field has a default, so a config file only needs the keys it
/// changes:
///
/// ```json
/// { "references": ["lib/consts.pad"], "imports": ["math"] }
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Explicit worker binary; discovered when unset.
    pub worker_path: Option<PathBuf>,
    /// Directory the worker runs in and resolves references against.
    pub working_directory: PathBuf,
    /// Where handshake files and sockets are created.
    pub runtime_dir: Option<PathBuf>,
    /// Script files loaded ahead of every execution.
    pub references: Vec<String>,
    /// Modules scripts may call into.
    pub imports: Vec<String>,
    pub resolver: ResolverConfig,
    pub handshake_timeout_ms: u64,
    pub max_attempts: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            worker_path: None,
            working_directory: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            runtime_dir: None,
            references: Vec::new(),
            imports: vec!["math".to_string(), "text".to_string()],
            resolver: ResolverConfig::default(),
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl HostConfig {
    /// Load a JSON config file. Relative paths in it stay relative to the
    /// process working directory.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|e| {
            Error::Config(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::Config("max_attempts must be at least 1".to_string()));
        }
        if self.handshake_timeout_ms == 0 {
            return Err(Error::Config(
                "handshake_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Parameters sent with the one-time `Initialize` call.
    pub fn initialize_params(&self) -> InitializeParams {
        InitializeParams {
            references: self.references.clone(),
            imports: self.imports.clone(),
            resolver: self.resolver.clone(),
            working_directory: self.working_directory.to_string_lossy().to_string(),
        }
    }
}
