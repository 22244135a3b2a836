use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use tracing::*;
use tracing_subscriber::EnvFilter;

use debstage::artifact::deb::DebProducer;
use debstage::artifact::docker::{BollardEngine, DockerProducer};
use debstage::artifact::ArtifactProducer;
use debstage::install;
use debstage::pipeline::{self, Pipeline};
use debstage::util::config::{ConfigResolver, DEFAULT_CONFIG_FILE};

#[derive(Parser)]
#[command(name = "debstage")]
#[command(about = "Stage, package and install a systemd service as a Debian package")]
struct Cli {
    /// YAML include file. Skipped when the default is absent.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// dotenv-style include file, applied over the YAML file.
    #[arg(short, long, global = true)]
    envfile: Option<PathBuf>,

    /// Override a parameter, e.g. `--set VERSION=1.2.3`. Wins over everything.
    #[arg(short, long, global = true, value_parser = parse_binding)]
    set: Vec<(String, String)>,

    /// Write the absolute path of the built package to this file.
    #[arg(long, global = true)]
    report: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy the program, config and unit onto DESTDIR
    Install,
    /// Remove exactly what `install` writes
    Uninstall,
    /// Ask the service manager to reread unit files
    Reload,
    /// Build the package, in a container when DOCKER_BUILD is set
    BuildPackage,
    /// Remove the staging tree and any previous package
    CleanStaging,
    /// Stage everything but stop before archiving
    StagePackage,
    /// Build the package inside a container image
    BuildPackageInContainer,
    /// Print every resolved parameter
    ShowConfig,
}

fn parse_binding(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {raw:?}")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    debug!("starting debstage");

    let cli = Cli::parse();

    let mut resolver = ConfigResolver::new();
    match &cli.config {
        Some(path) => resolver = resolver.with_config_file(path).await?,
        None => {
            let default = PathBuf::from(DEFAULT_CONFIG_FILE);
            if default.exists() {
                resolver = resolver.with_config_file(&default).await?;
            }
        }
    }
    if let Some(path) = &cli.envfile {
        resolver = resolver.with_env_file(path)?;
    }
    let params = resolver
        .with_env_vars(std::env::vars_os())
        .with_bindings(cli.set.clone())
        .resolve();

    match cli.command {
        Commands::Install => {
            let written = install::install(&params).await?;
            info!("installed {} files", written.len());
        }
        Commands::Uninstall => {
            let removed = install::uninstall(&params).await?;
            info!("removed {} files", removed.len());
        }
        Commands::Reload => install::reload(&params).await?,
        Commands::CleanStaging => {
            Pipeline::clean().run(&params).await?;
        }
        Commands::StagePackage => {
            Pipeline::stage().run(&params).await?;
        }
        Commands::BuildPackage if !params.container.enabled => {
            let producer = DebProducer {
                name: params.artifact_name(),
                report_file: cli.report.clone(),
            };
            let deb = producer.produce(&params).await?;
            info!("built {}", deb.path.display());
        }
        Commands::BuildPackage | Commands::BuildPackageInContainer => {
            let producer = DockerProducer::new(params.artifact_name(), BollardEngine::connect()?);
            let deb = producer.produce(&params).await?;
            if let Some(report) = &cli.report {
                pipeline::write_report(report, Some(&deb)).await?;
            }
            info!("built {}", deb.path.display());
        }
        Commands::ShowConfig => {
            for (key, value) in params.describe() {
                info!("--> {key}: {value}");
            }
        }
    }

    Ok(())
}
