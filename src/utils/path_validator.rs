use crate::error::{CraftsbotError, Result};
use std::path::{Path, PathBuf};

/// Path checks for build contexts declared through `workdir`.
pub struct PathValidator;

impl PathValidator {
    /// Resolves a `workdir` against the directory holding the craftsbot file and
    /// canonicalises it. The result must be an existing directory.
    pub fn validate_workdir(image: &str, workdir: &Path, base_dir: &Path) -> Result<PathBuf> {
        let joined = if workdir.is_absolute() {
            workdir.to_path_buf()
        } else {
            base_dir.join(workdir)
        };

        let canonical = joined.canonicalize().map_err(|e| CraftsbotError::InvalidWorkdir {
            image: image.to_string(),
            reason: format!("'{}': {e}", joined.display()),
        })?;

        if !canonical.is_dir() {
            return Err(CraftsbotError::InvalidWorkdir {
                image: image.to_string(),
                reason: format!("'{}' is not a directory", canonical.display()),
            });
        }

        const FORBIDDEN: &[&str] = &["/etc", "/sys", "/proc", "/dev", "/boot"];

        for forbidden in FORBIDDEN {
            let forbidden_path = Path::new(forbidden);
            let inside = canonical.starts_with(forbidden_path)
                || forbidden_path
                    .canonicalize()
                    .map(|f| canonical.starts_with(f))
                    .unwrap_or(false);

            if inside {
                return Err(CraftsbotError::InvalidWorkdir {
                    image: image.to_string(),
                    reason: format!("system directory '{}' cannot be a build context", forbidden),
                });
            }
        }

        Ok(canonical)
    }

    /// Ensures the file path resides inside the provided base directory.
    pub fn validate_file_path(
        file_path: impl AsRef<Path>,
        base_dir: impl AsRef<Path>,
    ) -> Result<PathBuf> {
        let file_path = file_path.as_ref();
        let base_dir = base_dir.as_ref();

        let canonical_file = file_path.canonicalize().map_err(|e| {
            CraftsbotError::Io(std::io::Error::new(
                e.kind(),
                format!("invalid file path '{}': {e}", file_path.display()),
            ))
        })?;

        let canonical_base = base_dir.canonicalize()?;

        if !canonical_file.starts_with(&canonical_base) {
            return Err(CraftsbotError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!(
                    "'{}' is outside the build context '{}'",
                    canonical_file.display(),
                    canonical_base.display()
                ),
            )));
        }

        Ok(canonical_file)
    }
}
