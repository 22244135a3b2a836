use std::path::{Path, PathBuf};

use eyre::Result;
use strum::Display;
use thiserror::Error;
use tracing::*;

pub mod config;
pub mod process;

/// The steps of the container build that can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum ContainerStep {
    Connect,
    BuildImage,
    CreateInstance,
    CopyArtifact,
    RemoveInstance,
}

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("required source {path:?} does not exist")]
    MissingSource { path: PathBuf },

    #[error("archiver `{command}` failed ({status}):\n{output}")]
    Archiver {
        command: String,
        status: String,
        output: String,
    },

    #[error("filesystem operation on {path:?} failed: {source}")]
    Filesystem {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("container {step} failed: {message}")]
    Container { step: ContainerStep, message: String },

    #[error("stage `{stage}`: {reason}")]
    StageOrder { stage: String, reason: String },

    #[error("service manager `{command}` failed ({status}):\n{output}")]
    ServiceManager {
        command: String,
        status: String,
        output: String,
    },
}

impl BuildError {
    pub fn fs<P: Into<PathBuf>>(path: P) -> impl FnOnce(std::io::Error) -> BuildError {
        let path = path.into();
        move |source| BuildError::Filesystem { path, source }
    }
}

/// Every regular file or symlink below `root`, sorted.
#[async_recursion::async_recursion]
pub async fn walk_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    debug!("walking {root:?}");

    let mut read_dir = tokio::fs::read_dir(root)
        .await
        .map_err(BuildError::fs(root))?;
    while let Some(entry) = read_dir.next_entry().await? {
        let file_type = entry.file_type().await?;
        if file_type.is_dir() {
            let mut sub_paths = walk_files(&entry.path()).await?;
            paths.append(&mut sub_paths);
        } else {
            paths.push(entry.path());
        }
    }

    paths.sort();
    Ok(paths)
}

#[cfg(test)]
pub fn test_init() {
    std::env::set_var("RUST_BACKTRACE", "full");
    let _ = color_eyre::install();
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}
