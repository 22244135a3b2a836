use std::path::{Path, PathBuf};

use eyre::{eyre, Result};
use nix::errno::Errno;
use tracing::*;

use crate::fs::{ensure_dir, exists, remove_path};
use crate::pipeline::Pipeline;
use crate::util::config::BuildParameters;
use crate::util::process;
use crate::util::BuildError;

use super::{Artifact, ArtifactProducer};

/// A Debian package at its deterministic `{name}_{version}_{arch}.deb` path.
#[derive(Debug, Clone)]
pub struct DebArtifact {
    pub name: String,
    pub path: PathBuf,
}

impl DebArtifact {
    pub fn for_params(params: &BuildParameters) -> Self {
        DebArtifact {
            name: params.artifact_name(),
            path: params.artifact_path(),
        }
    }
}

#[async_trait::async_trait]
impl Artifact for DebArtifact {
    fn name(&self) -> &str {
        &self.name
    }

    fn path(&self) -> &Path {
        &self.path
    }

    async fn validate(&self) -> Result<()> {
        let metadata = tokio::fs::metadata(&self.path)
            .await
            .map_err(|e| eyre!("package {:?} is missing: {e}", self.path))?;
        if !metadata.is_file() {
            return Err(eyre!("package {:?} is not a regular file", self.path));
        }
        Ok(())
    }
}

/// Builds the package on this machine by running the whole pipeline.
#[derive(Debug, Clone)]
pub struct DebProducer {
    pub name: String,
    pub report_file: Option<PathBuf>,
}

#[async_trait::async_trait]
impl ArtifactProducer for DebProducer {
    type Output = DebArtifact;

    fn name(&self) -> &str {
        &self.name
    }

    async fn produce(&self, params: &BuildParameters) -> Result<DebArtifact> {
        let output = Pipeline::package()
            .report_to(self.report_file.clone())
            .run(params)
            .await?;
        output
            .deb
            .ok_or_else(|| eyre!("pipeline finished without producing a package"))
    }
}

/// Run the archiver over the staging tree, then move its output onto the
/// deterministic artifact path. Nothing lands at that path unless the
/// archiver succeeded.
pub async fn archive(params: &BuildParameters) -> Result<DebArtifact> {
    let intermediate = params.archiver_output();
    let mut argv = params.archiver.clone();
    argv.push(params.build_root.to_string_lossy().to_string());
    argv.push(intermediate.to_string_lossy().to_string());

    info!("archiving {}", params.build_root.display());
    let output = process::run(&argv)
        .await
        .map_err(|e| BuildError::Archiver {
            command: argv.join(" "),
            status: "not started".into(),
            output: e.to_string(),
        })?;

    if !output.success() {
        remove_path(&intermediate).await?;
        return Err(BuildError::Archiver {
            command: output.command.clone(),
            status: output.status.to_string(),
            output: output.diagnostics(),
        }
        .into());
    }
    for line in output.stdout.lines() {
        info!("archiver: {line}");
    }

    if !exists(&intermediate).await {
        return Err(BuildError::Archiver {
            command: output.command,
            status: output.status.to_string(),
            output: format!("no package was written to {}", intermediate.display()),
        }
        .into());
    }

    let artifact = DebArtifact::for_params(params);
    ensure_dir(&params.output_dir).await?;
    relocate(&intermediate, &artifact.path, &params.partial_artifact_path()).await?;
    info!("wrote {}", artifact.path.display());

    Ok(artifact)
}

async fn relocate(src: &Path, dest: &Path, partial: &Path) -> Result<()> {
    debug!("moving {src:?} -> {dest:?}");
    match tokio::fs::rename(src, dest).await {
        Ok(()) => return Ok(()),
        Err(e) if e.raw_os_error() == Some(Errno::EXDEV as i32) => {}
        Err(e) => return Err(BuildError::Filesystem { path: dest.into(), source: e }.into()),
    }

    // Different filesystems: copy beside the destination, then rename.
    debug!("{src:?} is on another filesystem, copying through {partial:?}");
    let copied = match tokio::fs::copy(src, partial).await {
        Ok(_) => tokio::fs::rename(partial, dest)
            .await
            .map_err(BuildError::fs(dest)),
        Err(e) => Err(BuildError::Filesystem { path: partial.into(), source: e }),
    };
    if let Err(e) = copied {
        remove_path(partial).await?;
        return Err(e.into());
    }
    remove_path(src).await?;
    Ok(())
}
