//! Placing the package's files straight onto a live filesystem, without
//! building a package.
//!
//! Paths come from the same placements the staging tree uses, rooted at
//! `DESTDIR` instead of the build root, so a direct install and a package
//! install put every file in the same place. The configuration file is
//! written under its final name and overwrites whatever was there.

use std::path::PathBuf;

use eyre::Result;
use tracing::*;

use crate::fs::{ensure_dir, install_file, remove_path};
use crate::util::config::BuildParameters;
use crate::util::process;
use crate::util::BuildError;

/// Install every file, creating directories first. Returns the paths written.
pub async fn install(params: &BuildParameters) -> Result<Vec<PathBuf>> {
    let layout = params.installed_layout();
    info!("installing into {}", params.install_root.display());

    for dir in [&layout.bin_dir, &layout.conf_dir, &layout.systemd_dir] {
        ensure_dir(dir).await?;
    }

    let mut written = vec![];
    for placement in params.placements(&layout) {
        install_file(&placement.source, &placement.dest, placement.mode).await?;
        info!("installed {:?} at {}", placement.kind, placement.dest.display());
        written.push(placement.dest);
    }

    Ok(written)
}

/// Remove exactly the files [`install`] writes. Paths that are already gone
/// are skipped. Returns the paths that were actually removed.
pub async fn uninstall(params: &BuildParameters) -> Result<Vec<PathBuf>> {
    let mut removed = vec![];
    for placement in params.placements(&params.installed_layout()) {
        if remove_path(&placement.dest).await? {
            info!("removed {}", placement.dest.display());
            removed.push(placement.dest);
        } else {
            debug!("{} already absent", placement.dest.display());
        }
    }

    Ok(removed)
}

/// Ask the service manager to reread its unit files. Files already placed
/// are left alone if this fails.
pub async fn reload(params: &BuildParameters) -> Result<()> {
    let output = process::run(&params.service_manager).await?;
    if !output.success() {
        return Err(BuildError::ServiceManager {
            command: output.command.clone(),
            status: output.status.to_string(),
            output: output.diagnostics(),
        }
        .into());
    }

    info!("`{}` done", output.command);
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::artifact::staging;
    use crate::artifact::staging::tests::fixture;
    use crate::fs::{exists, mode_of, TempDir};
    use crate::util::walk_files;

    use super::*;

    #[ctor::ctor]
    fn init() {
        crate::util::test_init();
    }

    #[tokio::test]
    async fn test_install_writes_bare_config() -> Result<()> {
        let tmp = TempDir::new().await?;
        let params = fixture(tmp.as_ref()).await?;
        let root = tmp.path_view().join("root");

        let written = install(&params).await?;

        assert_eq!(
            written,
            vec![
                root.join("usr/bin/p"),
                root.join("etc/p.env"),
                root.join("etc/systemd/system/p.service"),
            ]
        );
        assert_eq!(mode_of(&root.join("usr/bin/p")).await?, 0o755);
        assert_eq!(mode_of(&root.join("etc/p.env")).await?, 0o644);
        assert!(!exists(&root.join("etc/p.env.new")).await);

        Ok(())
    }

    #[tokio::test]
    async fn test_install_overwrites_existing_config() -> Result<()> {
        let tmp = TempDir::new().await?;
        let params = fixture(tmp.as_ref()).await?;
        let config = tmp.path_view().join("root/etc/p.env");
        ensure_dir(config.parent().unwrap()).await?;
        tokio::fs::write(&config, "AWG_EXPORTER_OPS_MODE=oneshot\n").await?;

        install(&params).await?;

        assert_eq!(
            tokio::fs::read_to_string(&config).await?,
            "AWG_EXPORTER_OPS_MODE=http\n"
        );

        Ok(())
    }

    #[tokio::test]
    async fn test_install_mirrors_staging() -> Result<()> {
        let tmp = TempDir::new().await?;
        let params = fixture(tmp.as_ref()).await?;
        let root = tmp.path_view().join("root");

        let tree = staging::build(&params).await?;
        install(&params).await?;

        let installed: Vec<PathBuf> = walk_files(&root)
            .await?
            .into_iter()
            .map(|p| p.strip_prefix(&root).unwrap().to_path_buf())
            .collect();
        assert_eq!(tree.files().await?, installed);

        Ok(())
    }

    #[tokio::test]
    async fn test_uninstall_removes_only_installed_files() -> Result<()> {
        let tmp = TempDir::new().await?;
        let params = fixture(tmp.as_ref()).await?;
        let root = tmp.path_view().join("root");
        let neighbour = root.join("etc/systemd/system/other.service");

        let written = install(&params).await?;
        tokio::fs::write(&neighbour, "[Unit]\n").await?;

        let removed = uninstall(&params).await?;

        assert_eq!(removed, written);
        for path in &written {
            assert!(!exists(path).await);
        }
        assert!(exists(&neighbour).await);
        assert!(exists(&root.join("usr/bin")).await);

        assert!(uninstall(&params).await?.is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn test_reload_runs_service_manager() -> Result<()> {
        let tmp = TempDir::new().await?;
        let mut params = fixture(tmp.as_ref()).await?;
        let marker = tmp.path_view().join("reloaded");
        params.service_manager = vec![
            "sh".into(),
            "-c".into(),
            format!("touch {}", marker.display()),
        ];

        reload(&params).await?;

        assert!(exists(&marker).await);

        Ok(())
    }

    #[tokio::test]
    async fn test_reload_failure_keeps_files() -> Result<()> {
        let tmp = TempDir::new().await?;
        let mut params = fixture(tmp.as_ref()).await?;
        params.service_manager = vec![
            "sh".into(),
            "-c".into(),
            "echo 'Failed to connect to bus' >&2; exit 1".into(),
        ];
        let written = install(&params).await?;

        let err = reload(&params).await.unwrap_err();

        match err.downcast_ref::<BuildError>() {
            Some(BuildError::ServiceManager { output, .. }) => {
                assert_eq!(output, "Failed to connect to bus\n")
            }
            other => panic!("expected a service manager error, got {other:?}"),
        }
        for path in &written {
            assert!(exists(path).await);
        }

        Ok(())
    }
}
