//! Path sandbox
//!
//! Authorizes file paths against the directories the server was launched
//! with. Every check hits the filesystem again; nothing is cached because
//! files and symlinks can change between calls.

use std::path::{Component, Path, PathBuf};

use crate::error::SandboxError;

#[derive(Debug, Clone)]
pub struct PathSandbox {
    allowed: Vec<PathBuf>,
}

impl PathSandbox {
    pub fn new<I, P>(dirs: I) -> Result<Self, SandboxError>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let allowed: Vec<PathBuf> = dirs.into_iter().map(|d| resolve(d.as_ref())).collect();
        if allowed.is_empty() {
            return Err(SandboxError::NoAllowedDirectories);
        }

        for dir in &allowed {
            if !dir.is_dir() {
                tracing::warn!("Allowed directory does not exist: {}", dir.display());
            }
        }

        Ok(Self { allowed })
    }

    pub fn allowed_dirs(&self) -> &[PathBuf] {
        &self.allowed
    }

    /// Resolve `path` and check it is a proper descendant of an allowed
    /// directory that exists on disk.
    pub fn authorize(&self, path: &Path) -> Result<PathBuf, SandboxError> {
        let resolved = resolve(path);

        let contained = self
            .allowed
            .iter()
            .any(|dir| resolved != *dir && resolved.starts_with(dir));
        if !contained {
            return Err(SandboxError::NotAllowed(resolved));
        }

        if !resolved.exists() {
            return Err(SandboxError::NotFound(resolved));
        }

        Ok(resolved)
    }
}

/// Symlink hops followed before a dangling chain is left unresolved
const MAX_LINK_HOPS: usize = 40;

/// Absolute, symlink-resolved form of `path`.
///
/// Paths that do not exist are walked one component at a time: every
/// existing prefix is canonicalized (dangling links are followed to their
/// target) before the next `..` is applied, and the missing tail is
/// appended as-is.
pub fn resolve(path: &Path) -> PathBuf {
    resolve_with_budget(path, MAX_LINK_HOPS)
}

fn resolve_with_budget(path: &Path, hops: usize) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().unwrap_or_default().join(path)
    };

    if let Ok(canonical) = std::fs::canonicalize(&absolute) {
        return canonical;
    }

    let mut resolved = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => resolved.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                resolved.pop();
            }
            Component::Normal(name) => {
                let candidate = resolved.join(name);
                resolved = match std::fs::canonicalize(&candidate) {
                    Ok(canonical) => canonical,
                    Err(_) => follow_dangling(&candidate, hops).unwrap_or(candidate),
                };
            }
        }
    }
    resolved
}

/// Target of a symlink whose own target is missing, resolved the same way.
fn follow_dangling(link: &Path, hops: usize) -> Option<PathBuf> {
    if hops == 0 {
        return None;
    }
    let target = std::fs::read_link(link).ok()?;
    let target = match link.parent() {
        Some(parent) if target.is_relative() => parent.join(target),
        _ => target,
    };
    Some(resolve_with_budget(&target, hops - 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        root: PathBuf,
        repo: PathBuf,
        sandbox: PathSandbox,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        let repo = root.join("repo");
        std::fs::create_dir_all(repo.join("src")).unwrap();
        std::fs::write(repo.join("src/a.py"), "x = 1\n").unwrap();
        std::fs::create_dir_all(root.join("repo2")).unwrap();
        std::fs::write(root.join("repo2/b.py"), "y = 2\n").unwrap();
        std::fs::write(root.join("outside.py"), "z = 3\n").unwrap();
        let sandbox = PathSandbox::new([&repo]).unwrap();
        Fixture {
            _tmp: tmp,
            root,
            repo,
            sandbox,
        }
    }

    #[test]
    fn test_existing_descendant_is_authorized() {
        let f = fixture();
        let resolved = f.sandbox.authorize(&f.repo.join("src/a.py")).unwrap();
        assert_eq!(resolved, f.repo.join("src/a.py"));
    }

    #[test]
    fn test_dot_segments_are_resolved() {
        let f = fixture();
        let resolved = f
            .sandbox
            .authorize(&f.repo.join("src/./../src/a.py"))
            .unwrap();
        assert_eq!(resolved, f.repo.join("src/a.py"));
    }

    #[test]
    fn test_allowed_directory_itself_is_not_allowed() {
        let f = fixture();
        let err = f.sandbox.authorize(&f.repo).unwrap_err();
        assert!(matches!(err, SandboxError::NotAllowed(_)));
    }

    #[test]
    fn test_path_outside_is_not_allowed() {
        let f = fixture();
        let err = f.sandbox.authorize(&f.root.join("outside.py")).unwrap_err();
        assert!(matches!(err, SandboxError::NotAllowed(_)));
    }

    #[test]
    fn test_traversal_is_not_allowed() {
        let f = fixture();
        let err = f
            .sandbox
            .authorize(&f.repo.join("src/../../outside.py"))
            .unwrap_err();
        assert!(matches!(err, SandboxError::NotAllowed(p) if p == f.root.join("outside.py")));
    }

    #[test]
    fn test_sibling_with_common_prefix_is_not_allowed() {
        let f = fixture();
        let err = f.sandbox.authorize(&f.root.join("repo2/b.py")).unwrap_err();
        assert!(matches!(err, SandboxError::NotAllowed(_)));
    }

    #[test]
    fn test_missing_file_inside_is_not_found() {
        let f = fixture();
        let err = f
            .sandbox
            .authorize(&f.repo.join("src/missing/../gone.py"))
            .unwrap_err();
        assert!(matches!(err, SandboxError::NotFound(p) if p == f.repo.join("src/gone.py")));
    }

    #[test]
    fn test_missing_file_outside_is_not_allowed() {
        let f = fixture();
        let err = f.sandbox.authorize(&f.root.join("nowhere.py")).unwrap_err();
        assert!(matches!(err, SandboxError::NotAllowed(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escaping_sandbox_is_not_allowed() {
        let f = fixture();
        let link = f.repo.join("src/escape.py");
        std::os::unix::fs::symlink(f.root.join("outside.py"), &link).unwrap();
        let err = f.sandbox.authorize(&link).unwrap_err();
        assert!(matches!(err, SandboxError::NotAllowed(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_dangling_symlink_escaping_sandbox_is_not_allowed() {
        let f = fixture();
        let link = f.repo.join("src/dangling.py");
        std::os::unix::fs::symlink(f.root.join("nowhere.py"), &link).unwrap();
        let err = f.sandbox.authorize(&link).unwrap_err();
        assert!(matches!(err, SandboxError::NotAllowed(p) if p == f.root.join("nowhere.py")));
    }

    #[cfg(unix)]
    #[test]
    fn test_parent_of_symlinked_dir_is_taken_after_resolving() {
        let f = fixture();
        std::fs::create_dir_all(f.root.join("elsewhere/deep")).unwrap();
        let link = f.repo.join("src/outlink");
        std::os::unix::fs::symlink(f.root.join("elsewhere/deep"), &link).unwrap();

        // outlink/.. is elsewhere/, not src/
        let err = f
            .sandbox
            .authorize(&link.join("../ghost.py"))
            .unwrap_err();
        assert!(
            matches!(err, SandboxError::NotAllowed(p) if p == f.root.join("elsewhere/ghost.py"))
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_loop_inside_sandbox_is_not_found() {
        let f = fixture();
        let a = f.repo.join("src/loop_a");
        let b = f.repo.join("src/loop_b");
        std::os::unix::fs::symlink(&b, &a).unwrap();
        std::os::unix::fs::symlink(&a, &b).unwrap();
        let err = f.sandbox.authorize(&a.join("x.py")).unwrap_err();
        assert!(matches!(err, SandboxError::NotFound(_)));
    }

    #[test]
    fn test_second_allowed_directory() {
        let f = fixture();
        let sandbox = PathSandbox::new([f.repo.clone(), f.root.join("repo2")]).unwrap();
        assert!(sandbox.authorize(&f.root.join("repo2/b.py")).is_ok());
        assert_eq!(sandbox.allowed_dirs().len(), 2);
    }

    #[test]
    fn test_empty_allow_list_is_rejected() {
        let err = PathSandbox::new(Vec::<PathBuf>::new()).unwrap_err();
        assert!(matches!(err, SandboxError::NoAllowedDirectories));
    }

    #[test]
    fn test_recheck_sees_filesystem_changes() {
        let f = fixture();
        let path = f.repo.join("src/late.py");
        assert!(matches!(
            f.sandbox.authorize(&path),
            Err(SandboxError::NotFound(_))
        ));
        std::fs::write(&path, "").unwrap();
        assert!(f.sandbox.authorize(&path).is_ok());
    }
}
