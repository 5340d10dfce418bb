//! Namespace handles: `<netns dir>/<sandbox id>` → sandbox namespace path.

use std::path::{Path, PathBuf};

use podbridge_common::error::{PodbridgeError, Result};
use podbridge_common::types::SandboxId;

/// Returns where the handle for `id` lives inside `dir`.
#[must_use]
pub fn handle_path(dir: &Path, id: &SandboxId) -> PathBuf {
    dir.join(id.as_str())
}

/// Publishes the handle for `id`, pointing at `target`.
///
/// Creates `dir` if needed. A stale handle left behind by an earlier
/// sandbox with the same identifier is replaced.
///
/// # Errors
///
/// Returns an error if the directory or the symbolic link cannot be created.
pub fn publish_handle(dir: &Path, id: &SandboxId, target: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dir).map_err(|e| PodbridgeError::io(dir, e))?;
    let path = handle_path(dir, id);

    match std::fs::read_link(&path) {
        Ok(existing) if existing == target => {
            tracing::debug!(handle = %path.display(), "namespace handle already published");
            return Ok(path);
        }
        Ok(existing) => {
            tracing::warn!(
                handle = %path.display(),
                stale = %existing.display(),
                "replacing stale namespace handle"
            );
            std::fs::remove_file(&path).map_err(|e| PodbridgeError::io(&path, e))?;
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(PodbridgeError::io(&path, e)),
    }

    std::os::unix::fs::symlink(target, &path).map_err(|e| PodbridgeError::io(&path, e))?;
    tracing::info!(handle = %path.display(), target = %target.display(), "namespace handle published");
    Ok(path)
}

/// Removes the handle for `id`. A missing handle is not an error.
///
/// # Errors
///
/// Returns an error if the handle exists but cannot be removed.
pub fn remove_handle(dir: &Path, id: &SandboxId) -> Result<()> {
    let path = handle_path(dir, id);
    match std::fs::remove_file(&path) {
        Ok(()) => {
            tracing::info!(handle = %path.display(), "namespace handle removed");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(handle = %path.display(), "namespace handle already absent");
            Ok(())
        }
        Err(e) => Err(PodbridgeError::io(&path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox(id: &str) -> SandboxId {
        SandboxId::new(id).expect("sandbox id")
    }

    #[test]
    fn publish_creates_symlink_to_target() {
        let dir = tempfile::tempdir().expect("tempdir");
        let netns_dir = dir.path().join("netns");
        let target = Path::new("/proc/4242/ns/net");

        let path = publish_handle(&netns_dir, &sandbox("abc"), target).expect("publish");

        assert_eq!(path, netns_dir.join("abc"));
        assert_eq!(std::fs::read_link(&path).expect("read_link"), target);
    }

    #[test]
    fn publish_is_idempotent_for_same_target() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = Path::new("/proc/1/ns/net");
        let _ = publish_handle(dir.path(), &sandbox("abc"), target).expect("first");
        let _ = publish_handle(dir.path(), &sandbox("abc"), target).expect("second");
        assert_eq!(std::fs::read_link(dir.path().join("abc")).expect("read_link"), target);
    }

    #[test]
    fn publish_replaces_stale_handle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let _ = publish_handle(dir.path(), &sandbox("abc"), Path::new("/proc/1/ns/net")).expect("old");
        let _ = publish_handle(dir.path(), &sandbox("abc"), Path::new("/proc/2/ns/net")).expect("new");
        assert_eq!(
            std::fs::read_link(dir.path().join("abc")).expect("read_link"),
            Path::new("/proc/2/ns/net")
        );
    }

    #[test]
    fn remove_deletes_handle_and_tolerates_absence() {
        let dir = tempfile::tempdir().expect("tempdir");
        let _ = publish_handle(dir.path(), &sandbox("abc"), Path::new("/proc/1/ns/net")).expect("publish");

        remove_handle(dir.path(), &sandbox("abc")).expect("remove");
        assert!(std::fs::symlink_metadata(dir.path().join("abc")).is_err());

        remove_handle(dir.path(), &sandbox("abc")).expect("remove again");
    }
}
