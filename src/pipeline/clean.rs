use eyre::Result;
use tracing::*;

use crate::fs::remove_path;
use crate::util::config::BuildParameters;

/// Remove the staging tree, the archiver's intermediate output, any partly
/// copied package, and any package already built for this name, version and
/// architecture. Safe to run when none of them exist.
pub async fn clean(params: &BuildParameters) -> Result<()> {
    if remove_path(&params.build_root).await? {
        info!("removed staging tree {}", params.build_root.display());
    }
    for leftover in [params.archiver_output(), params.partial_artifact_path()] {
        if remove_path(&leftover).await? {
            debug!("removed {}", leftover.display());
        }
    }
    remove_artifact(params).await
}

pub async fn remove_artifact(params: &BuildParameters) -> Result<()> {
    let artifact = params.artifact_path();
    if remove_path(&artifact).await? {
        info!("removed previous package {}", artifact.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::artifact::staging;
    use crate::artifact::staging::tests::fixture;
    use crate::fs::{exists, TempDir};

    use super::*;

    #[ctor::ctor]
    fn init() {
        crate::util::test_init();
    }

    #[tokio::test]
    async fn test_clean_removes_everything() -> Result<()> {
        let tmp = TempDir::new().await?;
        let params = fixture(tmp.as_ref()).await?;
        staging::build(&params).await?;
        tokio::fs::write(params.archiver_output(), b"half").await?;
        tokio::fs::write(params.artifact_path(), b"old").await?;
        tokio::fs::write(params.partial_artifact_path(), b"half copied").await?;

        clean(&params).await?;

        assert!(!exists(&params.build_root).await);
        assert!(!exists(&params.archiver_output()).await);
        assert!(!exists(&params.artifact_path()).await);
        assert!(!exists(&params.partial_artifact_path()).await);
        // sources are untouched
        assert!(exists(&params.sources.program).await);

        Ok(())
    }

    #[tokio::test]
    async fn test_clean_is_idempotent() -> Result<()> {
        let tmp = TempDir::new().await?;
        let params = fixture(tmp.as_ref()).await?;

        clean(&params).await?;
        clean(&params).await?;

        assert!(!exists(&params.build_root).await);

        Ok(())
    }

    #[tokio::test]
    async fn test_other_versions_survive() -> Result<()> {
        let tmp = TempDir::new().await?;
        let params = fixture(tmp.as_ref()).await?;
        let other = params.output_dir.join("p_1.2.2_amd64.deb");
        tokio::fs::write(&other, b"previous release").await?;

        clean(&params).await?;

        assert!(exists(&other).await);

        Ok(())
    }
}
