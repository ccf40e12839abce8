//! Confinement contexts for path validation.
//!
//! Every filesystem request the broker serves is resolved through a
//! [`Confinement`] built from the canonicalized storage root. Paths are
//! checked lexically for `..` components, joined to the caller's base
//! directory, canonicalized, and prefix-checked against that base. A path
//! that escapes is rejected before any filesystem operation runs.
//!
//! This replaces per-request chroot and effective-uid switching: containment
//! is enforced by path resolution alone, so the broker process itself must
//! not follow untrusted symlinks outside the root (canonicalization resolves
//! them and the prefix check catches escapes).

use std::path::{Component, Path, PathBuf};

use protocol::CallerIdentity;
use thiserror::Error;

/// Errors raised during path confinement.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Path contains a `..` component.
    #[error("path contains parent directory components: {0}")]
    ParentComponent(String),

    /// Resolved path escapes the confinement base.
    #[error("path escapes confinement: {0}")]
    Escape(String),

    /// Path does not exist.
    #[error("no such file or directory: {0}")]
    NotFound(String),

    /// Underlying I/O failure during resolution.
    #[error("path resolution failed for {path}: {source}")]
    Io {
        /// The offending path.
        path: String,
        /// The underlying error.
        source: std::io::Error,
    },
}

/// Result type for sandbox operations.
pub type Result<T> = std::result::Result<T, SandboxError>;

/// A confinement context rooted at the canonicalized storage root.
#[derive(Debug, Clone)]
pub struct Confinement {
    root: PathBuf,
}

impl Confinement {
    /// Create a confinement for the given storage root.
    ///
    /// The root must exist; it is canonicalized once here so later prefix
    /// checks compare canonical paths.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let root = root.canonicalize().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => SandboxError::NotFound(root.display().to_string()),
            _ => SandboxError::Io {
                path: root.display().to_string(),
                source: e,
            },
        })?;
        Ok(Self { root })
    }

    /// The canonical storage root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute home directory of the caller.
    pub fn home_dir(&self, caller: &CallerIdentity) -> PathBuf {
        self.root.join(&caller.home)
    }

    /// Resolve an existing path inside the caller's home directory.
    ///
    /// A path starting with `/` is taken relative to the home directory;
    /// otherwise it is relative to home + workdir.
    pub fn resolve(&self, caller: &CallerIdentity, path: &str) -> Result<PathBuf> {
        let base = self.home_dir(caller);
        self.resolve_in(&base, caller, path)
    }

    /// Resolve an existing path for listing.
    ///
    /// Listings may browse the shared storage root itself, so an absolute
    /// path is taken relative to the root rather than the caller's home.
    pub fn resolve_shared(&self, caller: &CallerIdentity, path: &str) -> Result<PathBuf> {
        reject_parent_components(path)?;

        let joined = if let Some(stripped) = path.strip_prefix('/') {
            self.root.join(stripped)
        } else {
            self.home_dir(caller)
                .join(relative_workdir(&caller.workdir))
                .join(path)
        };

        let canonical = canonicalize(&joined)?;
        if !canonical.starts_with(&self.root) {
            return Err(SandboxError::Escape(path.to_string()));
        }
        Ok(canonical)
    }

    /// Resolve a path for creating a new entry inside the caller's home.
    ///
    /// The parent directory must exist and be inside the confinement; the
    /// final component need not exist.
    pub fn resolve_for_creation(&self, caller: &CallerIdentity, path: &str) -> Result<PathBuf> {
        reject_parent_components(path)?;

        let base = self.home_dir(caller);
        let joined = join_request_path(&base, caller, path);

        let name = joined
            .file_name()
            .ok_or_else(|| SandboxError::Escape(path.to_string()))?
            .to_os_string();
        let parent = joined
            .parent()
            .ok_or_else(|| SandboxError::Escape(path.to_string()))?;

        let canonical_parent = canonicalize(parent)?;
        if !canonical_parent.starts_with(&base) {
            return Err(SandboxError::Escape(path.to_string()));
        }
        Ok(canonical_parent.join(name))
    }

    fn resolve_in(&self, base: &Path, caller: &CallerIdentity, path: &str) -> Result<PathBuf> {
        reject_parent_components(path)?;

        let joined = join_request_path(base, caller, path);
        let canonical = canonicalize(&joined)?;
        if !canonical.starts_with(base) {
            return Err(SandboxError::Escape(path.to_string()));
        }
        Ok(canonical)
    }

    /// Express `path` relative to the caller's home directory, with a
    /// leading `/`. Used to report the workdir after a `cd`.
    pub fn workdir_of(&self, caller: &CallerIdentity, path: &Path) -> String {
        let home = self.home_dir(caller);
        match path.strip_prefix(&home) {
            Ok(rel) if rel.as_os_str().is_empty() => "/".to_string(),
            Ok(rel) => format!("/{}", rel.display()),
            Err(_) => "/".to_string(),
        }
    }
}

/// Strip the leading `/` from a stored workdir so it joins cleanly.
fn relative_workdir(workdir: &str) -> &str {
    workdir.strip_prefix('/').unwrap_or(workdir)
}

fn join_request_path(base: &Path, caller: &CallerIdentity, path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix('/') {
        base.join(stripped)
    } else {
        base.join(relative_workdir(&caller.workdir)).join(path)
    }
}

fn reject_parent_components(path: &str) -> Result<()> {
    let has_parent = Path::new(path)
        .components()
        .any(|c| matches!(c, Component::ParentDir));
    if has_parent {
        return Err(SandboxError::ParentComponent(path.to_string()));
    }
    Ok(())
}

fn canonicalize(path: &Path) -> Result<PathBuf> {
    path.canonicalize().map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => SandboxError::NotFound(path.display().to_string()),
        _ => SandboxError::Io {
            path: path.display().to_string(),
            source: e,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn caller() -> CallerIdentity {
        CallerIdentity {
            uid: 1000,
            gid: 1000,
            username: "alice".to_string(),
            home: "alice".to_string(),
            workdir: "/".to_string(),
        }
    }

    fn setup() -> (TempDir, Confinement) {
        let temp = TempDir::new().unwrap();
        fs::create_dir(temp.path().join("alice")).unwrap();
        fs::create_dir(temp.path().join("bob")).unwrap();
        let confinement = Confinement::new(temp.path()).unwrap();
        (temp, confinement)
    }

    #[test]
    fn test_new_missing_root() {
        let result = Confinement::new("/nonexistent/removault/root");
        assert!(matches!(result, Err(SandboxError::NotFound(_))));
    }

    #[test]
    fn test_resolve_inside_home() {
        let (_temp, confinement) = setup();
        let caller = caller();
        fs::write(confinement.home_dir(&caller).join("a.txt"), "x").unwrap();

        let resolved = confinement.resolve(&caller, "a.txt").unwrap();
        assert!(resolved.starts_with(confinement.home_dir(&caller)));
        assert!(resolved.ends_with("a.txt"));
    }

    #[test]
    fn test_resolve_absolute_is_home_relative() {
        let (_temp, confinement) = setup();
        let caller = caller();
        fs::create_dir(confinement.home_dir(&caller).join("docs")).unwrap();

        let resolved = confinement.resolve(&caller, "/docs").unwrap();
        assert_eq!(resolved, confinement.home_dir(&caller).join("docs"));
    }

    #[test]
    fn test_resolve_uses_workdir() {
        let (_temp, confinement) = setup();
        let mut caller = caller();
        fs::create_dir_all(confinement.home_dir(&caller).join("docs/inner")).unwrap();
        caller.workdir = "/docs".to_string();

        let resolved = confinement.resolve(&caller, "inner").unwrap();
        assert_eq!(resolved, confinement.home_dir(&caller).join("docs/inner"));
    }

    #[test]
    fn test_resolve_rejects_parent_components() {
        let (_temp, confinement) = setup();
        let result = confinement.resolve(&caller(), "../bob/secret.txt");
        assert!(matches!(result, Err(SandboxError::ParentComponent(_))));
    }

    #[test]
    fn test_resolve_rejects_symlink_escape() {
        let (temp, confinement) = setup();
        let caller = caller();
        let outside = TempDir::new().unwrap();
        fs::write(outside.path().join("secret"), "s").unwrap();
        std::os::unix::fs::symlink(
            outside.path().join("secret"),
            temp.path().join("alice/link"),
        )
        .unwrap();

        let result = confinement.resolve(&caller, "link");
        assert!(matches!(result, Err(SandboxError::Escape(_))));
    }

    #[test]
    fn test_resolve_missing_path() {
        let (_temp, confinement) = setup();
        let result = confinement.resolve(&caller(), "ghost.txt");
        assert!(matches!(result, Err(SandboxError::NotFound(_))));
    }

    #[test]
    fn test_resolve_shared_allows_other_homes() {
        let (_temp, confinement) = setup();
        let resolved = confinement.resolve_shared(&caller(), "/bob").unwrap();
        assert_eq!(resolved, confinement.root().join("bob"));
    }

    #[test]
    fn test_resolve_shared_rejects_parent_components() {
        let (_temp, confinement) = setup();
        let result = confinement.resolve_shared(&caller(), "/../etc");
        assert!(matches!(result, Err(SandboxError::ParentComponent(_))));
    }

    #[test]
    fn test_resolve_for_creation() {
        let (_temp, confinement) = setup();
        let caller = caller();

        let resolved = confinement.resolve_for_creation(&caller, "new.txt").unwrap();
        assert_eq!(resolved, confinement.home_dir(&caller).join("new.txt"));
    }

    #[test]
    fn test_resolve_for_creation_missing_parent() {
        let (_temp, confinement) = setup();
        let result = confinement.resolve_for_creation(&caller(), "ghost/new.txt");
        assert!(matches!(result, Err(SandboxError::NotFound(_))));
    }

    #[test]
    fn test_resolve_for_creation_rejects_parent_components() {
        let (_temp, confinement) = setup();
        let result = confinement.resolve_for_creation(&caller(), "../escape.txt");
        assert!(matches!(result, Err(SandboxError::ParentComponent(_))));
    }

    #[test]
    fn test_workdir_of() {
        let (_temp, confinement) = setup();
        let caller = caller();
        let home = confinement.home_dir(&caller);

        assert_eq!(confinement.workdir_of(&caller, &home), "/");
        assert_eq!(confinement.workdir_of(&caller, &home.join("docs")), "/docs");
    }
}
