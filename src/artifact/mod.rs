use std::path::Path;

use eyre::Result;

use crate::util::config::BuildParameters;

pub mod context;
pub mod control;
pub mod deb;
pub mod docker;
pub mod hook;
pub mod staging;

/// An artifact is the result of some build step that lives on disk.
#[async_trait::async_trait]
pub trait Artifact: Send + Sync {
    fn name(&self) -> &str;

    fn path(&self) -> &Path;

    /// Check that what's on disk still matches what was produced.
    async fn validate(&self) -> Result<()>;
}

/// An artifact producer turns a parameter set into an artifact.
#[async_trait::async_trait]
pub trait ArtifactProducer {
    type Output: Artifact;

    fn name(&self) -> &str;

    async fn produce(&self, params: &BuildParameters) -> Result<Self::Output>;
}
