//! Loads provider private keys from an allow-listed set of directories.
//!
//! Paths are resolved lexically against the working directory and then
//! checked for containment component by component. A sibling directory that
//! merely shares a name prefix with an allowed base (`config-evil` next to
//! `config`) is never accepted.

use crate::error::{BankingError, Result};
use secrecy::{Secret, SecretString};
use std::path::{Component, Path, PathBuf};

const PEM_BEGIN: &str = "-----BEGIN";
const PEM_END: &str = "-----END";

/// Resolves and loads key files that must live under one of `bases`.
#[derive(Debug, Clone)]
pub struct KeyLoader {
    cwd: PathBuf,
    bases: Vec<PathBuf>,
}

impl KeyLoader {
    /// Build a loader rooted at `cwd`; relative bases are resolved against it.
    pub fn new(cwd: impl Into<PathBuf>, bases: &[PathBuf]) -> Self {
        let cwd = cwd.into();
        let bases = bases
            .iter()
            .map(|base| normalize_path(&cwd, base))
            .collect();
        Self { cwd, bases }
    }

    /// Build a loader rooted at the process working directory.
    pub fn from_current_dir(bases: &[PathBuf]) -> Result<Self> {
        let cwd = std::env::current_dir().map_err(|e| {
            BankingError::Configuration(format!("cannot determine working directory: {}", e))
        })?;
        Ok(Self::new(cwd, bases))
    }

    pub fn bases(&self) -> &[PathBuf] {
        &self.bases
    }

    /// Resolve `path` and require it to sit strictly inside an allowed base.
    pub fn validate_config_path(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let resolved = normalize_path(&self.cwd, path.as_ref());

        if self.bases.iter().any(|base| is_descendant(base, &resolved)) {
            Ok(resolved)
        } else {
            tracing::error!(
                allowed = %self.allowed_display(),
                "Rejected key path outside the allowed directories"
            );
            Err(BankingError::PathSecurity {
                allowed: self.allowed_display(),
            })
        }
    }

    /// Validate, read and sanity-check a PEM private key.
    pub fn load_private_key(&self, path: impl AsRef<Path>) -> Result<SecretString> {
        let resolved = self.validate_config_path(path)?;

        if !resolved.is_file() {
            return Err(BankingError::KeyNotFound);
        }

        self.check_symlink_target(&resolved)?;

        let contents = std::fs::read_to_string(&resolved).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => BankingError::KeyNotFound,
            std::io::ErrorKind::InvalidData => {
                BankingError::MalformedKey("key file is not valid UTF-8".to_string())
            }
            _ => BankingError::Configuration(format!("cannot read private key: {}", e.kind())),
        })?;

        if !looks_like_pem(&contents) {
            return Err(BankingError::MalformedKey(
                "missing PEM BEGIN/END markers".to_string(),
            ));
        }

        tracing::info!("Provider private key loaded");
        Ok(Secret::new(contents))
    }

    // A link inside an allowed base must not point outside of it.
    fn check_symlink_target(&self, resolved: &Path) -> Result<()> {
        let canonical = resolved.canonicalize().map_err(|_| BankingError::KeyNotFound)?;
        let contained = self
            .bases
            .iter()
            .filter_map(|base| base.canonicalize().ok())
            .any(|base| is_descendant(&base, &canonical));

        if contained {
            Ok(())
        } else {
            tracing::error!(
                allowed = %self.allowed_display(),
                "Rejected key path resolving outside the allowed directories"
            );
            Err(BankingError::PathSecurity {
                allowed: self.allowed_display(),
            })
        }
    }

    fn allowed_display(&self) -> String {
        self.bases
            .iter()
            .map(|base| {
                base.strip_prefix(&self.cwd)
                    .unwrap_or(base)
                    .display()
                    .to_string()
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

fn looks_like_pem(contents: &str) -> bool {
    let trimmed = contents.trim();
    trimmed.starts_with(PEM_BEGIN) && trimmed.contains(PEM_END)
}

/// Make `path` absolute against `cwd` and fold `.` and `..` without touching the filesystem.
pub fn normalize_path(cwd: &Path, path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    };

    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::Prefix(prefix) => normalized.push(prefix.as_os_str()),
            Component::RootDir => normalized.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                // `..` at the root stays at the root.
                normalized.pop();
            }
            Component::Normal(part) => normalized.push(part),
        }
    }
    normalized
}

/// Path from `base` to `target`, using `..` segments when `target` is not below `base`.
pub fn relative_path(base: &Path, target: &Path) -> PathBuf {
    let base_parts: Vec<Component> = base.components().collect();
    let target_parts: Vec<Component> = target.components().collect();

    let common = base_parts
        .iter()
        .zip(target_parts.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut relative = PathBuf::new();
    for _ in common..base_parts.len() {
        relative.push(Component::ParentDir.as_os_str());
    }
    for part in &target_parts[common..] {
        relative.push(part.as_os_str());
    }
    relative
}

/// `target` is a strict descendant of `base`: the relative path is non-empty
/// and does not start by leaving `base`.
pub fn is_descendant(base: &Path, target: &Path) -> bool {
    let relative = relative_path(base, target);
    match relative.components().next() {
        None => false,
        Some(Component::ParentDir) => false,
        Some(Component::Prefix(_)) | Some(Component::RootDir) => false,
        Some(_) => true,
    }
}
