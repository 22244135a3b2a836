use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use eyre::Result;
use tracing::*;

use crate::util::BuildError;

/// A scratch directory that is removed when dropped.
pub struct TempDir {
    path: PathBuf,
}

impl TempDir {
    pub async fn new() -> Result<TempDir> {
        Self::new_in(&std::env::temp_dir()).await
    }

    /// Create the directory under `parent`, so a later rename out of it
    /// never crosses a filesystem boundary.
    pub async fn new_in(parent: &Path) -> Result<TempDir> {
        let path = parent.join(format!(".debstage-workdir-{}", rand::random::<u64>()));
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(BuildError::fs(&path))?;

        Ok(TempDir { path })
    }

    pub fn path_view(&self) -> PathBuf {
        self.path.clone()
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        debug!("dropping temp dir {:?}", self.path);
        if self.path.exists() {
            if let Err(e) = std::fs::remove_dir_all(&self.path) {
                warn!("could not remove temp dir {:?}: {e}", self.path);
            }
        }
    }
}

impl AsRef<Path> for TempDir {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

/// `mkdir -p`, tolerating directories that already exist.
pub async fn ensure_dir(path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(BuildError::fs(path))?;
    Ok(())
}

/// Copy `src` to `dest` byte-for-byte and set `mode` on the result. The
/// parent of `dest` must already exist.
pub async fn install_file(src: &Path, dest: &Path, mode: u32) -> Result<()> {
    if tokio::fs::metadata(src).await.is_err() {
        return Err(BuildError::MissingSource { path: src.into() }.into());
    }

    debug!("install {src:?} -> {dest:?} ({mode:o})");
    tokio::fs::copy(src, dest)
        .await
        .map_err(BuildError::fs(dest))?;
    set_mode(dest, mode).await
}

pub async fn set_mode(path: &Path, mode: u32) -> Result<()> {
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .await
        .map_err(BuildError::fs(path))?;
    Ok(())
}

pub async fn mode_of(path: &Path) -> Result<u32> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(BuildError::fs(path))?;
    Ok(metadata.permissions().mode() & 0o7777)
}

pub async fn exists(path: &Path) -> bool {
    tokio::fs::symlink_metadata(path).await.is_ok()
}

/// Remove a file or a whole directory tree. Returns whether anything was
/// there; an absent path is not an error.
pub async fn remove_path(path: &Path) -> Result<bool> {
    let metadata = match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(BuildError::Filesystem { path: path.into(), source: e }.into()),
    };

    let result = if metadata.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };

    match result {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(BuildError::Filesystem { path: path.into(), source: e }.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[ctor::ctor]
    fn init() {
        crate::util::test_init();
    }

    #[tokio::test]
    async fn test_install_file_sets_mode() -> Result<()> {
        let tmp = TempDir::new().await?;
        let src = tmp.path_view().join("src");
        let dest = tmp.path_view().join("dest");
        tokio::fs::write(&src, "#!/bin/sh\n").await?;
        set_mode(&src, 0o600).await?;

        install_file(&src, &dest, 0o755).await?;

        assert_eq!(tokio::fs::read(&dest).await?, b"#!/bin/sh\n");
        assert_eq!(mode_of(&dest).await?, 0o755);

        Ok(())
    }

    #[tokio::test]
    async fn test_install_missing_source() -> Result<()> {
        let tmp = TempDir::new().await?;
        let err = install_file(
            &tmp.path_view().join("missing"),
            &tmp.path_view().join("dest"),
            0o644,
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::MissingSource { .. })
        ));
        assert!(!exists(&tmp.path_view().join("dest")).await);

        Ok(())
    }

    #[tokio::test]
    async fn test_remove_path_is_idempotent() -> Result<()> {
        let tmp = TempDir::new().await?;
        let dir = tmp.path_view().join("a/b");
        ensure_dir(&dir).await?;
        ensure_dir(&dir).await?;
        tokio::fs::write(dir.join("file"), "x").await?;

        assert!(remove_path(&tmp.path_view().join("a")).await?);
        assert!(!remove_path(&tmp.path_view().join("a")).await?);
        assert!(!exists(&dir).await);

        Ok(())
    }

    #[tokio::test]
    async fn test_temp_dir_is_removed_on_drop() -> Result<()> {
        let path = {
            let tmp = TempDir::new().await?;
            assert!(exists(tmp.as_ref()).await);
            tmp.path_view()
        };
        assert!(!exists(&path).await);

        Ok(())
    }
}
