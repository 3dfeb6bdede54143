//! Reference resolution for worker initialization.
//!
//! References name script files whose bindings are made available to every
//! execution. The resolver turns them into prelude sources and reports the
//! ones it cannot find as warnings.

use std::path::{Path, PathBuf};

use rkyv::{Archive, Deserialize, Serialize};

use crate::dump::DiagnosticRecord;

/// Resolver settings sent with `Initialize`.
#[derive(
    Debug,
    Clone,
    Default,
    PartialEq,
    Eq,
    Archive,
    Serialize,
    Deserialize,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(default)]
pub struct ResolverConfig {
    /// Extra directories searched after the working directory.
    pub search_paths: Vec<String>,
}

/// A resolved reference: script text compiled ahead of user code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreludeSource {
    /// Name used in diagnostics (the reference as written).
    pub name: String,
    pub text: String,
}

/// Output of a resolver run.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub preludes: Vec<PreludeSource>,
    pub diagnostics: Vec<DiagnosticRecord>,
}

/// Resolves references into prelude sources.
pub trait ReferenceResolver: Send + Sync {
    fn resolve(
        &self,
        references: &[String],
        working_directory: &Path,
        config: &ResolverConfig,
    ) -> Resolution;
}

/// Resolves references as files on the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsReferenceResolver;

impl FsReferenceResolver {
    fn locate(
        reference: &str,
        working_directory: &Path,
        config: &ResolverConfig,
    ) -> Option<PathBuf> {
        let candidate = Path::new(reference);
        if candidate.is_absolute() {
            return candidate.is_file().then(|| candidate.to_path_buf());
        }

        std::iter::once(working_directory.to_path_buf())
            .chain(config.search_paths.iter().map(PathBuf::from))
            .map(|dir| dir.join(candidate))
            .find(|path| path.is_file())
    }
}

impl ReferenceResolver for FsReferenceResolver {
    fn resolve(
        &self,
        references: &[String],
        working_directory: &Path,
        config: &ResolverConfig,
    ) -> Resolution {
        let mut resolution = Resolution::default();

        for reference in references {
            let Some(path) = Self::locate(reference, working_directory, config) else {
                resolution.diagnostics.push(DiagnosticRecord::warning(
                    format!("reference `{}` could not be resolved", reference),
                    None,
                ));
                continue;
            };

            match std::fs::read_to_string(&path) {
                Ok(text) => {
                    tracing::debug!("Resolved reference {} to {}", reference, path.display());
                    resolution.preludes.push(PreludeSource {
                        name: reference.clone(),
                        text,
                    });
                }
                Err(e) => resolution.diagnostics.push(DiagnosticRecord::warning(
                    format!("reference `{}` could not be read: {}", reference, e),
                    None,
                )),
            }
        }

        resolution
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dump::Severity;

    #[test]
    fn test_resolves_relative_to_working_directory() {
        let temp = tempfile::TempDir::new().unwrap();
        std::fs::write(temp.path().join("consts.pad"), "let answer = 42;").unwrap();

        let resolution = FsReferenceResolver.resolve(
            &["consts.pad".to_string()],
            temp.path(),
            &ResolverConfig::default(),
        );

        assert!(resolution.diagnostics.is_empty());
        assert_eq!(resolution.preludes.len(), 1);
        assert_eq!(resolution.preludes[0].name, "consts.pad");
        assert_eq!(resolution.preludes[0].text, "let answer = 42;");
    }

    #[test]
    fn test_falls_back_to_search_paths() {
        let work = tempfile::TempDir::new().unwrap();
        let lib = tempfile::TempDir::new().unwrap();
        std::fs::write(lib.path().join("greet.pad"), "let greeting = \"hi\";").unwrap();

        let config = ResolverConfig {
            search_paths: vec![lib.path().to_string_lossy().to_string()],
        };
        let resolution =
            FsReferenceResolver.resolve(&["greet.pad".to_string()], work.path(), &config);

        assert_eq!(resolution.preludes.len(), 1);
    }

    #[test]
    fn test_missing_reference_is_a_warning() {
        let temp = tempfile::TempDir::new().unwrap();
        let resolution = FsReferenceResolver.resolve(
            &["nope.pad".to_string()],
            temp.path(),
            &ResolverConfig::default(),
        );

        assert!(resolution.preludes.is_empty());
        assert_eq!(resolution.diagnostics.len(), 1);
        assert_eq!(resolution.diagnostics[0].severity, Severity::Warning);
        assert!(resolution.diagnostics[0].message.contains("nope.pad"));
    }
}
