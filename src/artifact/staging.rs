use std::path::{Path, PathBuf};

use eyre::{eyre, Result};
use tracing::*;

use crate::fs::{ensure_dir, exists, install_file};
use crate::util::config::BuildParameters;
use crate::util::{walk_files, BuildError};

use super::Artifact;

/// A directory mirroring the install-time filesystem, ready for archiving.
#[derive(Debug, Clone)]
pub struct StagingTree {
    pub name: String,
    pub root: PathBuf,
    pub conffile: PathBuf,
}

impl StagingTree {
    pub fn for_params(params: &BuildParameters) -> Self {
        StagingTree {
            name: format!("{}-staging", params.package_name),
            root: params.build_root.clone(),
            conffile: params.staged_conffile(),
        }
    }

    /// Files in the tree, relative to its root.
    pub async fn files(&self) -> Result<Vec<PathBuf>> {
        Ok(walk_files(&self.root)
            .await?
            .into_iter()
            .filter_map(|p| p.strip_prefix(&self.root).ok().map(Path::to_path_buf))
            .collect())
    }
}

#[async_trait::async_trait]
impl Artifact for StagingTree {
    fn name(&self) -> &str {
        &self.name
    }

    fn path(&self) -> &Path {
        &self.root
    }

    async fn validate(&self) -> Result<()> {
        if !exists(&self.conffile).await {
            return Err(eyre!(
                "staging tree {:?} has no conffile at {:?}",
                self.root,
                self.conffile
            ));
        }
        Ok(())
    }
}

/// Create the metadata and install directories under the build root, then
/// copy every source into place with its mode. Directories all exist before
/// the first copy. A failure leaves whatever was staged so far for the next
/// clean to remove.
pub async fn build(params: &BuildParameters) -> Result<StagingTree> {
    info!("staging into {}", params.build_root.display());

    for dir in [
        params.metadata_dir(),
        params.bin_dir.clone(),
        params.conf_dir.clone(),
        params.systemd_dir.clone(),
    ] {
        debug!("creating {dir:?}");
        ensure_dir(&dir).await?;
    }

    for placement in params.placements(&params.staged_layout()) {
        install_file(&placement.source, &placement.dest, placement.mode).await?;
    }

    Ok(StagingTree::for_params(params))
}

/// Rename the staged runtime configuration to its `.new` name, so the
/// installed system reconciles it against any existing file.
pub async fn mark_conffile(params: &BuildParameters) -> Result<PathBuf> {
    let bare = params.staged_config();
    let marked = params.staged_conffile();
    debug!("marking conffile {bare:?} -> {marked:?}");
    tokio::fs::rename(&bare, &marked)
        .await
        .map_err(BuildError::fs(&bare))?;
    Ok(marked)
}
