//! Filesystem locations used by the host.
//!
//! The worker binary is located the same way from the CLI and from tests, and
//! every handshake file and socket lives in a private runtime directory.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Environment variable overriding worker discovery.
pub const WORKER_PATH_ENV: &str = "SCRATCHPAD_WORKER_PATH";

const WORKER_NAME: &str = if cfg!(windows) {
    "scratchpad-worker.exe"
} else {
    "scratchpad-worker"
};

/// Find the scratchpad-worker binary.
///
/// Looks in the following order:
/// 1. The configured path, if any
/// 2. `SCRATCHPAD_WORKER_PATH` environment variable
/// 3. Same directory as the current executable
/// 4. System PATH
/// 5. `target/debug` or `target/release` during development
pub fn find_worker_binary(configured: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = configured {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        return Err(Error::WorkerNotFound(format!(
            "configured worker path '{}' does not exist",
            path.display()
        )));
    }

    if let Ok(path) = std::env::var(WORKER_PATH_ENV) {
        let path = PathBuf::from(path);
        if path.is_file() {
            return Ok(path);
        }
    }

    if let Ok(exe_path) = std::env::current_exe()
        && let Some(exe_dir) = exe_path.parent()
    {
        let worker_path = exe_dir.join(WORKER_NAME);
        if worker_path.is_file() {
            return Ok(worker_path);
        }
        // Test binaries live one level down, in target/<profile>/deps.
        if let Some(profile_dir) = exe_dir.parent() {
            let worker_path = profile_dir.join(WORKER_NAME);
            if worker_path.is_file() {
                return Ok(worker_path);
            }
        }
    }

    if let Ok(path) = which::which(WORKER_NAME) {
        return Ok(path);
    }

    if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
        for profile in ["debug", "release"] {
            let path = PathBuf::from(&manifest_dir)
                .join("..")
                .join("..")
                .join("target")
                .join(profile)
                .join(WORKER_NAME);
            if path.is_file() {
                return Ok(path.canonicalize().unwrap_or(path));
            }
        }
    }

    Err(Error::WorkerNotFound(format!(
        "could not find {}; set {} or ensure it's in PATH",
        WORKER_NAME, WORKER_PATH_ENV
    )))
}

/// Directory holding handshake files and sockets, created if missing.
///
/// Defaults to `$XDG_RUNTIME_DIR/scratchpad`, falling back to the system
/// temp directory.
pub fn runtime_dir(configured: Option<&Path>) -> Result<PathBuf> {
    let dir = match configured {
        Some(dir) => dir.to_path_buf(),
        None => dirs::runtime_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("scratchpad"),
    };

    fs::create_dir_all(&dir)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if configured.is_none() {
            fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))?;
        }
    }

    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_configured_worker_path_must_exist() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let missing = temp.path().join("nope");

        let err = find_worker_binary(Some(&missing)).unwrap_err();
        assert!(matches!(err, Error::WorkerNotFound(_)));
    }

    #[test]
    fn test_configured_worker_path_is_used() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let worker = temp.path().join("worker");
        fs::write(&worker, "").expect("Failed to write worker stub");

        assert_eq!(find_worker_binary(Some(&worker)).unwrap(), worker);
    }

    #[test]
    fn test_runtime_dir_is_created() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let dir = temp.path().join("run").join("scratchpad");

        let created = runtime_dir(Some(&dir)).expect("Failed to create runtime dir");
        assert_eq!(created, dir);
        assert!(dir.is_dir());
    }
}
