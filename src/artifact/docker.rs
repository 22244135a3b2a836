use std::collections::HashMap;
use std::path::{Path, PathBuf};

use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, RemoveContainerOptions,
};
use bollard::image::BuildImageOptions;
use bollard::Docker;
use eyre::{eyre, Result};
use futures_util::TryStreamExt;
use regex::Regex;
use strum::Display;
use tokio_tar::Archive;
use tracing::*;

use crate::fs::{ensure_dir, exists, TempDir};
use crate::pipeline::clean;
use crate::util::config::BuildParameters;
use crate::util::{BuildError, ContainerStep};

use super::context::ContextFilter;
use super::deb::DebArtifact;
use super::{Artifact, ArtifactProducer};

/// A created container instance. Must be handed back to
/// [`ContainerEngine::remove_instance`] once it has been used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum ContainerState {
    ImageBuilt,
    InstanceCreated,
    ArtifactCopied,
    InstanceRemoved,
}

/// Everything needed to build the builder image for one parameter set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageBuild {
    pub context: PathBuf,
    pub dockerfile: String,
    pub tag: String,
    /// Passed as `--build-arg`s so the in-image build uses the caller's
    /// name, version and architecture.
    pub build_args: HashMap<String, String>,
    /// Paths kept out of the context tarball.
    pub excluded: Vec<PathBuf>,
    /// Packages directly inside this directory are kept out of the context.
    pub package_dir: PathBuf,
}

impl ImageBuild {
    pub fn for_params(params: &BuildParameters, tag: String) -> Self {
        ImageBuild {
            context: params.container.context.clone(),
            dockerfile: params.container.dockerfile.clone(),
            tag,
            build_args: params.container_build_args(),
            excluded: vec![params.build_root.clone()],
            package_dir: params.output_dir.clone(),
        }
    }
}

/// The operations the container runner needs from a container engine.
#[async_trait::async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn build_image(&self, build: &ImageBuild) -> Result<()>;

    /// Create, but do not start, an instance of `image`.
    async fn create_instance(&self, image: &str) -> Result<ContainerHandle>;

    /// Copy the file at `src` inside the instance into `dest_dir`, returning
    /// the path it was written to.
    async fn copy_out(&self, handle: &ContainerHandle, src: &Path, dest_dir: &Path)
        -> Result<PathBuf>;

    async fn remove_instance(&self, handle: &ContainerHandle) -> Result<()>;
}

fn container_err<E: std::fmt::Display>(step: ContainerStep) -> impl FnOnce(E) -> BuildError {
    move |e| BuildError::Container {
        step,
        message: e.to_string(),
    }
}

/// Talks to the local Docker daemon.
pub struct BollardEngine {
    docker: Docker,
}

impl BollardEngine {
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(container_err(ContainerStep::Connect))?;
        Ok(Self { docker })
    }
}

#[async_trait::async_trait]
impl ContainerEngine for BollardEngine {
    async fn build_image(&self, build: &ImageBuild) -> Result<()> {
        info!("building image {} from {}", build.tag, build.context.display());
        let context_tar = ContextFilter::load(&build.context, &build.excluded, &build.package_dir)
            .await?
            .tar()
            .await?;

        let options = BuildImageOptions {
            dockerfile: build.dockerfile.clone(),
            t: build.tag.clone(),
            buildargs: build.build_args.clone(),
            rm: true,
            ..Default::default()
        };
        let progress: Vec<_> = self
            .docker
            .build_image(options, None, Some(hyper::Body::from(context_tar)))
            .try_collect()
            .await
            .map_err(container_err(ContainerStep::BuildImage))?;

        for step in progress {
            if let Some(stream) = step.stream {
                for line in stream.lines().filter(|l| !l.trim().is_empty()) {
                    info!("docker build: {line}");
                }
            }
            if let Some(error) = step.error {
                return Err(BuildError::Container {
                    step: ContainerStep::BuildImage,
                    message: error,
                }
                .into());
            }
        }

        Ok(())
    }

    async fn create_instance(&self, image: &str) -> Result<ContainerHandle> {
        let response = self
            .docker
            .create_container(
                None::<CreateContainerOptions<String>>,
                Config {
                    image: Some(image.to_string()),
                    ..Default::default()
                },
            )
            .await
            .map_err(container_err(ContainerStep::CreateInstance))?;
        for warning in response.warnings {
            warn!("docker create: {warning}");
        }

        Ok(ContainerHandle { id: response.id })
    }

    async fn copy_out(
        &self,
        handle: &ContainerHandle,
        src: &Path,
        dest_dir: &Path,
    ) -> Result<PathBuf> {
        let file_name = src
            .file_name()
            .ok_or_else(|| eyre!("{src:?} does not name a file"))?;

        let chunks: Vec<_> = self
            .docker
            .download_from_container(
                &handle.id,
                Some(DownloadFromContainerOptions {
                    path: src.to_string_lossy().to_string(),
                }),
            )
            .try_collect()
            .await
            .map_err(container_err(ContainerStep::CopyArtifact))?;
        let mut tarball = Vec::new();
        for chunk in &chunks {
            tarball.extend_from_slice(chunk);
        }
        debug!("downloaded {} bytes from {}", tarball.len(), handle.id);

        // The daemon hands back a tar holding just the requested file.
        let mut archive = Archive::new(tarball.as_slice());
        archive
            .unpack(dest_dir)
            .await
            .map_err(container_err(ContainerStep::CopyArtifact))?;

        let extracted = dest_dir.join(file_name);
        if !exists(&extracted).await {
            return Err(BuildError::Container {
                step: ContainerStep::CopyArtifact,
                message: format!("{src:?} was not in the archive the daemon returned"),
            }
            .into());
        }
        Ok(extracted)
    }

    async fn remove_instance(&self, handle: &ContainerHandle) -> Result<()> {
        self.docker
            .remove_container(
                &handle.id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(container_err(ContainerStep::RemoveInstance))?;
        Ok(())
    }
}

/// Runs the whole pipeline inside a container image and pulls the package out
/// of a throwaway instance.
///
/// The instance is removed on every path once it exists, including when the
/// copy fails. If removal fails as well, the copy error is the one returned.
pub struct DockerProducer<E: ContainerEngine> {
    pub name: String,
    pub engine: E,
}

impl<E: ContainerEngine> DockerProducer<E> {
    pub fn new<S: Into<String>>(name: S, engine: E) -> Self {
        Self {
            name: name.into(),
            engine,
        }
    }

    pub fn validate(&self, params: &BuildParameters) -> Result<String> {
        let image = normalize_image_name(&params.container.image);
        let image_regex = Regex::new(
            r"^(?:[a-z0-9]+(?:[._-][a-z0-9]+)*(?::[0-9]+)?/)*[a-z0-9]+(?:[._-][a-z0-9]+)*:[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}$",
        )?;
        if !image_regex.is_match(&image) {
            return Err(eyre!(
                "docker image name {image:?} is invalid, must match {image_regex}"
            ));
        }
        Ok(image)
    }
}

#[async_trait::async_trait]
impl<E: ContainerEngine> ArtifactProducer for DockerProducer<E> {
    type Output = DebArtifact;

    fn name(&self) -> &str {
        &self.name
    }

    async fn produce(&self, params: &BuildParameters) -> Result<DebArtifact> {
        let image = self.validate(params)?;
        let artifact = DebArtifact::for_params(params);
        clean::remove_artifact(params).await?;

        self.engine
            .build_image(&ImageBuild::for_params(params, image.clone()))
            .await?;
        info!("container: {}", ContainerState::ImageBuilt);

        ensure_dir(&params.output_dir).await?;
        let scratch = TempDir::new_in(&params.output_dir).await?;

        let handle = self.engine.create_instance(&image).await?;
        info!("container: {} ({})", ContainerState::InstanceCreated, handle.id);

        let src = params.container.workdir.join(&artifact.name);
        let copied = self
            .engine
            .copy_out(&handle, &src, scratch.as_ref())
            .await;
        if copied.is_ok() {
            info!("container: {}", ContainerState::ArtifactCopied);
        }

        let removed = self.engine.remove_instance(&handle).await;
        match (copied, removed) {
            (Ok(extracted), Ok(())) => {
                info!("container: {}", ContainerState::InstanceRemoved);
                tokio::fs::rename(&extracted, &artifact.path)
                    .await
                    .map_err(BuildError::fs(&artifact.path))?;
            }
            (Ok(_), Err(e)) => return Err(e),
            (Err(e), Ok(())) => {
                info!("container: {}", ContainerState::InstanceRemoved);
                return Err(e);
            }
            (Err(e), Err(removal)) => {
                error!("could not remove container {}: {removal}", handle.id);
                return Err(e);
            }
        }

        artifact.validate().await?;
        info!("wrote {}", artifact.path.display());
        Ok(artifact)
    }
}

/// Add the implicit `latest` tag when none is given.
fn normalize_image_name(name: &str) -> String {
    let last = name.rsplit('/').next().unwrap_or(name);
    if last.contains(':') {
        name.to_string()
    } else {
        format!("{name}:latest")
    }
}
