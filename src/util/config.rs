use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use eyre::{eyre, Result};
use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::*;

pub const DEFAULT_CONFIG_FILE: &str = "./debstage.yaml";

/// Name of the reserved metadata directory at the top of a staging tree.
pub const METADATA_DIR: &str = "DEBIAN";

/// Suffix marking a shipped configuration file as a fresh default.
pub const CONFFILE_SUFFIX: &str = ".new";

pub const PROGRAM_MODE: u32 = 0o755;
pub const DATA_MODE: u32 = 0o644;
pub const HOOK_MODE: u32 = 0o755;

/// Keys understood by [`ConfigResolver`].
pub mod keys {
    pub const PACKAGE_NAME: &str = "PACKAGE_NAME";
    pub const VERSION: &str = "VERSION";
    pub const ARCH: &str = "ARCH";
    pub const BUILD_DIR: &str = "BUILD_DIR";
    pub const OUTPUT_DIR: &str = "OUTPUT_DIR";
    pub const BIN_DIR: &str = "BIN_DIR";
    pub const CONF_DIR: &str = "CONF_DIR";
    pub const SYSTEMD_DIR: &str = "SYSTEMD_DIR";
    pub const DESTDIR: &str = "DESTDIR";
    pub const PROGRAM_SRC: &str = "PROGRAM_SRC";
    pub const CONFIG_SRC: &str = "CONFIG_SRC";
    pub const UNIT_SRC: &str = "UNIT_SRC";
    pub const CONTROL_TEMPLATE: &str = "CONTROL_TEMPLATE";
    pub const POSTINST_SRC: &str = "POSTINST_SRC";
    pub const ARCHIVER: &str = "ARCHIVER";
    pub const SYSTEMCTL: &str = "SYSTEMCTL";
    pub const DOCKER_BUILD: &str = "DOCKER_BUILD";
    pub const DOCKERFILE: &str = "DOCKERFILE";
    pub const DOCKER_CONTEXT: &str = "DOCKER_CONTEXT";
    pub const DOCKER_IMAGE: &str = "DOCKER_IMAGE";
    pub const DOCKER_WORKDIR: &str = "DOCKER_WORKDIR";
}

const DEFAULT_PACKAGE_NAME: &str = "amneziawg-exporter";
const DEFAULT_VERSION: &str = "0.1.0";
const DEFAULT_ARCH: &str = "all";
const DEFAULT_ARCHIVER: &str = "dpkg-deb --root-owner-group --build";
const DEFAULT_SYSTEMCTL: &str = "systemctl daemon-reload";

/// Where things live on an installed system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallLayout {
    pub bin_dir: PathBuf,
    pub conf_dir: PathBuf,
    pub systemd_dir: PathBuf,
}

impl InstallLayout {
    /// The same layout with every directory moved below `root`.
    pub fn under(&self, root: &Path) -> InstallLayout {
        InstallLayout {
            bin_dir: prefixed(root, &self.bin_dir),
            conf_dir: prefixed(root, &self.conf_dir),
            systemd_dir: prefixed(root, &self.systemd_dir),
        }
    }
}

/// Join `path` onto `root` even when `path` is absolute.
pub fn prefixed(root: &Path, path: &Path) -> PathBuf {
    root.join(path.strip_prefix("/").unwrap_or(path))
}

#[derive(Debug, Clone)]
pub struct SourceFiles {
    pub program: PathBuf,
    pub config: PathBuf,
    pub unit: PathBuf,
    pub control_template: PathBuf,
    pub postinst: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ContainerSettings {
    pub enabled: bool,
    pub dockerfile: String,
    pub context: PathBuf,
    pub image: String,
    pub workdir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementKind {
    Program,
    Config,
    Unit,
}

/// One source file and the place it ends up, with its mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub kind: PlacementKind,
    pub source: PathBuf,
    pub dest: PathBuf,
    pub mode: u32,
}

/// The frozen parameter set every stage works from. Built once by
/// [`ConfigResolver::resolve`] and only ever handed out by reference.
#[derive(Debug, Clone)]
pub struct BuildParameters {
    pub package_name: String,
    pub version: String,
    pub architecture: String,
    pub build_root: PathBuf,
    /// `bin_dir`, `conf_dir` and `systemd_dir` are `layout` prefixed with
    /// `build_root`.
    pub bin_dir: PathBuf,
    pub conf_dir: PathBuf,
    pub systemd_dir: PathBuf,
    pub output_dir: PathBuf,
    pub layout: InstallLayout,
    pub install_root: PathBuf,
    pub sources: SourceFiles,
    pub archiver: Vec<String>,
    pub service_manager: Vec<String>,
    pub container: ContainerSettings,
}

impl BuildParameters {
    pub fn staged_layout(&self) -> InstallLayout {
        InstallLayout {
            bin_dir: self.bin_dir.clone(),
            conf_dir: self.conf_dir.clone(),
            systemd_dir: self.systemd_dir.clone(),
        }
    }

    pub fn installed_layout(&self) -> InstallLayout {
        self.layout.under(&self.install_root)
    }

    pub fn metadata_dir(&self) -> PathBuf {
        self.build_root.join(METADATA_DIR)
    }

    pub fn control_path(&self) -> PathBuf {
        self.metadata_dir().join("control")
    }

    pub fn postinst_path(&self) -> PathBuf {
        self.metadata_dir().join("postinst")
    }

    pub fn config_file_name(&self) -> String {
        format!("{}.env", self.package_name)
    }

    pub fn unit_file_name(&self) -> String {
        format!("{}.service", self.package_name)
    }

    /// The staged runtime configuration under its install-time name.
    pub fn staged_config(&self) -> PathBuf {
        self.conf_dir.join(self.config_file_name())
    }

    /// The staged runtime configuration after the conffile rename.
    pub fn staged_conffile(&self) -> PathBuf {
        with_suffix(&self.staged_config(), CONFFILE_SUFFIX)
    }

    pub fn artifact_name(&self) -> String {
        format!(
            "{}_{}_{}.deb",
            self.package_name, self.version, self.architecture
        )
    }

    pub fn artifact_path(&self) -> PathBuf {
        self.output_dir.join(self.artifact_name())
    }

    /// Where the archiver writes its output: beside the staging directory,
    /// named after it with `.deb` appended.
    pub fn archiver_output(&self) -> PathBuf {
        match (self.build_root.parent(), self.build_root.file_name()) {
            (Some(parent), Some(name)) => {
                let mut name = name.to_owned();
                name.push(".deb");
                parent.join(name)
            }
            _ => with_suffix(&self.build_root, ".deb"),
        }
    }

    /// Scratch name used while copying the package across filesystems.
    pub fn partial_artifact_path(&self) -> PathBuf {
        with_suffix(&self.artifact_path(), ".partial")
    }

    /// The bindings an in-container build needs to produce the same package.
    pub fn container_build_args(&self) -> HashMap<String, String> {
        HashMap::from([
            (keys::PACKAGE_NAME.to_string(), self.package_name.clone()),
            (keys::VERSION.to_string(), self.version.clone()),
            (keys::ARCH.to_string(), self.architecture.clone()),
        ])
    }

    pub fn placements(&self, layout: &InstallLayout) -> Vec<Placement> {
        vec![
            Placement {
                kind: PlacementKind::Program,
                source: self.sources.program.clone(),
                dest: layout.bin_dir.join(&self.package_name),
                mode: PROGRAM_MODE,
            },
            Placement {
                kind: PlacementKind::Config,
                source: self.sources.config.clone(),
                dest: layout.conf_dir.join(self.config_file_name()),
                mode: DATA_MODE,
            },
            Placement {
                kind: PlacementKind::Unit,
                source: self.sources.unit.clone(),
                dest: layout.systemd_dir.join(self.unit_file_name()),
                mode: DATA_MODE,
            },
        ]
    }

    /// Every resolved parameter as `(key, value)`, for display.
    pub fn describe(&self) -> Vec<(&'static str, String)> {
        let path = |p: &Path| p.display().to_string();
        vec![
            (keys::PACKAGE_NAME, self.package_name.clone()),
            (keys::VERSION, self.version.clone()),
            (keys::ARCH, self.architecture.clone()),
            (keys::BUILD_DIR, path(&self.build_root)),
            (keys::OUTPUT_DIR, path(&self.output_dir)),
            (keys::BIN_DIR, path(&self.layout.bin_dir)),
            (keys::CONF_DIR, path(&self.layout.conf_dir)),
            (keys::SYSTEMD_DIR, path(&self.layout.systemd_dir)),
            (keys::DESTDIR, path(&self.install_root)),
            (keys::PROGRAM_SRC, path(&self.sources.program)),
            (keys::CONFIG_SRC, path(&self.sources.config)),
            (keys::UNIT_SRC, path(&self.sources.unit)),
            (keys::CONTROL_TEMPLATE, path(&self.sources.control_template)),
            (keys::POSTINST_SRC, path(&self.sources.postinst)),
            (keys::ARCHIVER, self.archiver.join(" ")),
            (keys::SYSTEMCTL, self.service_manager.join(" ")),
            (keys::DOCKER_BUILD, self.container.enabled.to_string()),
            (keys::DOCKERFILE, self.container.dockerfile.clone()),
            (keys::DOCKER_CONTEXT, path(&self.container.context)),
            (keys::DOCKER_IMAGE, self.container.image.clone()),
            (keys::DOCKER_WORKDIR, path(&self.container.workdir)),
        ]
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Collects environment-style bindings from any number of sources. Later
/// bindings override earlier ones; anything unbound falls back to a default.
#[derive(Debug, Clone, Default)]
pub struct ConfigResolver {
    bindings: HashMap<String, String>,
}

impl ConfigResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.bindings.insert(key.into(), value.into());
        self
    }

    pub fn with_bindings<I, K, V>(mut self, bindings: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (key, value) in bindings {
            self.bindings.insert(key.into(), value.into());
        }
        self
    }

    /// Layer environment variables on top of the current bindings. Entries
    /// whose key or value is not valid Unicode are skipped.
    pub fn with_env_vars<I>(self, vars: I) -> Self
    where
        I: IntoIterator<Item = (OsString, OsString)>,
    {
        let bindings: Vec<(String, String)> = vars
            .into_iter()
            .filter_map(|(key, value)| match (key.into_string(), value.into_string()) {
                (Ok(key), Ok(value)) => Some((key, value)),
                (key, _) => {
                    debug!("skipping non-unicode environment variable {key:?}");
                    None
                }
            })
            .collect();
        self.with_bindings(bindings)
    }

    /// Layer a YAML include file on top of the current bindings.
    pub async fn with_config_file(self, path: &Path) -> Result<Self> {
        info!("loading config from {}", path.display());
        let mut file = File::open(path)
            .await
            .map_err(|e| eyre!("cannot open config file {}: {e}", path.display()))?;
        let mut config_str = String::new();
        file.read_to_string(&mut config_str).await?;

        let config: InternalConfig = serde_yaml::from_str(&config_str)?;
        Ok(self.with_bindings(config.into_bindings()))
    }

    /// Layer a dotenv-style include file on top of the current bindings. The
    /// process environment is left untouched.
    pub fn with_env_file(self, path: &Path) -> Result<Self> {
        info!("loading bindings from {}", path.display());
        let mut bindings = vec![];
        for item in dotenvy::from_path_iter(path)? {
            bindings.push(item?);
        }
        Ok(self.with_bindings(bindings))
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.bindings.get(key).map(String::as_str)
    }

    fn string_or(&self, key: &str, default: impl FnOnce() -> String) -> String {
        self.get(key).map(str::to_string).unwrap_or_else(default)
    }

    fn path_or(&self, key: &str, default: impl FnOnce() -> String) -> PathBuf {
        PathBuf::from(self.string_or(key, default))
    }

    fn command_or(&self, key: &str, default: &str) -> Vec<String> {
        self.get(key)
            .unwrap_or(default)
            .split_whitespace()
            .map(str::to_string)
            .collect()
    }

    /// Produce the parameter set. Never fails and never validates: whatever
    /// was bound ends up in names and metadata as-is.
    pub fn resolve(&self) -> BuildParameters {
        let package_name = self.string_or(keys::PACKAGE_NAME, || DEFAULT_PACKAGE_NAME.into());
        let version = self.string_or(keys::VERSION, || DEFAULT_VERSION.into());
        let architecture = self.string_or(keys::ARCH, || DEFAULT_ARCH.into());

        let build_root = self.path_or(keys::BUILD_DIR, || {
            format!("build/{package_name}_{version}")
        });
        let layout = InstallLayout {
            bin_dir: self.path_or(keys::BIN_DIR, || "/usr/bin".into()),
            conf_dir: self.path_or(keys::CONF_DIR, || "/etc".into()),
            systemd_dir: self.path_or(keys::SYSTEMD_DIR, || "/etc/systemd/system".into()),
        };
        let staged = layout.under(&build_root);

        let sources = SourceFiles {
            program: self.path_or(keys::PROGRAM_SRC, || "exporter.py".into()),
            config: self.path_or(keys::CONFIG_SRC, || "config.env".into()),
            unit: self.path_or(keys::UNIT_SRC, || {
                format!("packaging/{package_name}.service")
            }),
            control_template: self.path_or(keys::CONTROL_TEMPLATE, || "packaging/control".into()),
            postinst: self.path_or(keys::POSTINST_SRC, || "packaging/postinst".into()),
        };

        let container = ContainerSettings {
            enabled: self.get(keys::DOCKER_BUILD).map(is_truthy).unwrap_or(false),
            dockerfile: self.string_or(keys::DOCKERFILE, || "Dockerfile".into()),
            context: self.path_or(keys::DOCKER_CONTEXT, || ".".into()),
            image: self.string_or(keys::DOCKER_IMAGE, || {
                format!(
                    "{}:{}",
                    image_component(&format!("{package_name}-builder")),
                    image_component(&version)
                )
            }),
            workdir: self.path_or(keys::DOCKER_WORKDIR, || "/build".into()),
        };

        BuildParameters {
            bin_dir: staged.bin_dir,
            conf_dir: staged.conf_dir,
            systemd_dir: staged.systemd_dir,
            output_dir: self.path_or(keys::OUTPUT_DIR, || ".".into()),
            install_root: self.path_or(keys::DESTDIR, || "/".into()),
            archiver: self.command_or(keys::ARCHIVER, DEFAULT_ARCHIVER),
            service_manager: self.command_or(keys::SYSTEMCTL, DEFAULT_SYSTEMCTL),
            package_name,
            version,
            architecture,
            build_root,
            layout,
            sources,
            container,
        }
    }
}

pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Lowercase and squash anything a Docker repository or tag can't hold.
fn image_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.to_ascii_lowercase().chars() {
        if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
            out.push(c);
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    let out = out.trim_matches(|c| matches!(c, '.' | '_' | '-'));
    if out.is_empty() {
        "latest".into()
    } else {
        out.into()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PackageMetadata {
    name: Option<String>,
    version: Option<String>,
    arch: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct BuildSection {
    root: Option<PathBuf>,
    output: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LayoutSection {
    bin_dir: Option<PathBuf>,
    conf_dir: Option<PathBuf>,
    systemd_dir: Option<PathBuf>,
    destdir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SourcesSection {
    program: Option<PathBuf>,
    config: Option<PathBuf>,
    unit: Option<PathBuf>,
    control: Option<PathBuf>,
    postinst: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ToolsSection {
    archiver: Option<String>,
    systemctl: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ContainerSection {
    enabled: Option<bool>,
    dockerfile: Option<String>,
    context: Option<PathBuf>,
    image: Option<String>,
    workdir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct InternalConfig {
    #[serde(default)]
    metadata: PackageMetadata,
    #[serde(default)]
    build: BuildSection,
    #[serde(default)]
    layout: LayoutSection,
    #[serde(default)]
    sources: SourcesSection,
    #[serde(default)]
    tools: ToolsSection,
    #[serde(default)]
    container: ContainerSection,
}

impl InternalConfig {
    fn into_bindings(self) -> Vec<(&'static str, String)> {
        let path = |p: PathBuf| p.to_string_lossy().to_string();
        let entries: Vec<(&'static str, Option<String>)> = vec![
            (keys::PACKAGE_NAME, self.metadata.name),
            (keys::VERSION, self.metadata.version),
            (keys::ARCH, self.metadata.arch),
            (keys::BUILD_DIR, self.build.root.map(path)),
            (keys::OUTPUT_DIR, self.build.output.map(path)),
            (keys::BIN_DIR, self.layout.bin_dir.map(path)),
            (keys::CONF_DIR, self.layout.conf_dir.map(path)),
            (keys::SYSTEMD_DIR, self.layout.systemd_dir.map(path)),
            (keys::DESTDIR, self.layout.destdir.map(path)),
            (keys::PROGRAM_SRC, self.sources.program.map(path)),
            (keys::CONFIG_SRC, self.sources.config.map(path)),
            (keys::UNIT_SRC, self.sources.unit.map(path)),
            (keys::CONTROL_TEMPLATE, self.sources.control.map(path)),
            (keys::POSTINST_SRC, self.sources.postinst.map(path)),
            (keys::ARCHIVER, self.tools.archiver),
            (keys::SYSTEMCTL, self.tools.systemctl),
            (
                keys::DOCKER_BUILD,
                self.container.enabled.map(|e| e.to_string()),
            ),
            (keys::DOCKERFILE, self.container.dockerfile),
            (keys::DOCKER_CONTEXT, self.container.context.map(path)),
            (keys::DOCKER_IMAGE, self.container.image),
            (keys::DOCKER_WORKDIR, self.container.workdir.map(path)),
        ];

        entries
            .into_iter()
            .filter_map(|(key, value)| value.map(|v| (key, v)))
            .collect()
    }
}
