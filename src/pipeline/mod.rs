use std::path::{Path, PathBuf};

use eyre::Result;
use strum::{Display, EnumIter, IntoEnumIterator};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::*;

use crate::artifact::deb::{self, DebArtifact};
use crate::artifact::staging::{self, StagingTree};
use crate::artifact::{control, hook, Artifact};
use crate::fs::{exists, mode_of};
use crate::util::config::BuildParameters;
use crate::util::BuildError;

pub mod clean;

/// The build stages, in the only order they may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter)]
#[strum(serialize_all = "kebab-case")]
pub enum Stage {
    Clean,
    StageTree,
    Control,
    Hook,
    Conffile,
    Archive,
}

impl Stage {
    fn violation(&self, reason: String) -> eyre::Report {
        BuildError::StageOrder {
            stage: self.to_string(),
            reason,
        }
        .into()
    }

    async fn require_present(&self, path: &Path, what: &str) -> Result<()> {
        if exists(path).await {
            Ok(())
        } else {
            Err(self.violation(format!("{what} {} is missing", path.display())))
        }
    }

    async fn require_absent(&self, path: &Path, what: &str) -> Result<()> {
        if exists(path).await {
            Err(self.violation(format!("{what} {} still exists", path.display())))
        } else {
            Ok(())
        }
    }

    async fn precondition(&self, params: &BuildParameters) -> Result<()> {
        match self {
            Stage::Clean => Ok(()),
            Stage::StageTree => {
                self.require_absent(&params.build_root, "staging tree")
                    .await
            }
            Stage::Control | Stage::Hook => {
                self.require_present(&params.metadata_dir(), "metadata directory")
                    .await
            }
            Stage::Conffile => {
                self.require_present(&params.staged_config(), "staged configuration")
                    .await
            }
            Stage::Archive => {
                self.require_present(&params.control_path(), "control descriptor")
                    .await?;
                self.require_present(&params.staged_conffile(), "conffile")
                    .await?;
                self.require_absent(&params.staged_config(), "unmarked configuration")
                    .await
            }
        }
    }

    async fn postcondition(&self, params: &BuildParameters) -> Result<()> {
        match self {
            Stage::Clean => {
                self.require_absent(&params.build_root, "staging tree")
                    .await?;
                self.require_absent(&params.archiver_output(), "archiver output")
                    .await?;
                self.require_absent(&params.partial_artifact_path(), "partial package")
                    .await?;
                self.require_absent(&params.artifact_path(), "package")
                    .await
            }
            Stage::StageTree => {
                for placement in params.placements(&params.staged_layout()) {
                    self.require_present(&placement.dest, "staged file").await?;
                }
                Ok(())
            }
            Stage::Control => {
                self.require_present(&params.control_path(), "control descriptor")
                    .await
            }
            Stage::Hook => {
                let hook = params.postinst_path();
                self.require_present(&hook, "postinst hook").await?;
                if mode_of(&hook).await? & 0o111 == 0 {
                    return Err(self.violation(format!("{} is not executable", hook.display())));
                }
                Ok(())
            }
            Stage::Conffile => {
                self.require_present(&params.staged_conffile(), "conffile")
                    .await?;
                self.require_absent(&params.staged_config(), "unmarked configuration")
                    .await
            }
            Stage::Archive => {
                self.require_present(&params.artifact_path(), "package")
                    .await?;
                self.require_absent(&params.archiver_output(), "archiver output")
                    .await
            }
        }
    }
}

/// What a pipeline run left behind.
#[derive(Debug, Default)]
pub struct PipelineOutput {
    pub staging: Option<StagingTree>,
    pub deb: Option<DebArtifact>,
}

/// An ordered list of stages run against one parameter set. Each stage's
/// precondition is checked before it runs and its postcondition after, so a
/// stage that runs out of order fails instead of producing a broken package.
pub struct Pipeline {
    stages: Vec<Stage>,
    report_file: Option<PathBuf>,
}

impl Pipeline {
    pub fn new(stages: Vec<Stage>) -> Self {
        Self {
            stages,
            report_file: None,
        }
    }

    pub fn clean() -> Self {
        Self::new(vec![Stage::Clean])
    }

    /// Everything up to, but not including, the archiver.
    pub fn stage() -> Self {
        Self::new(Stage::iter().take_while(|s| *s != Stage::Archive).collect())
    }

    pub fn package() -> Self {
        Self::new(Stage::iter().collect())
    }

    /// Write the path of the produced package to `report_file`.
    pub fn report_to(mut self, report_file: Option<PathBuf>) -> Self {
        self.report_file = report_file;
        self
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub async fn run(&self, params: &BuildParameters) -> Result<PipelineOutput> {
        info!("running pipeline with {} steps!", self.stages.len());
        let mut output = PipelineOutput::default();

        for (i, stage) in self.stages.iter().enumerate() {
            info!("* step {}: {}", i + 1, stage);
            stage.precondition(params).await?;

            match stage {
                Stage::Clean => clean::clean(params).await?,
                Stage::StageTree => output.staging = Some(staging::build(params).await?),
                Stage::Control => {
                    control::assemble(params).await?;
                }
                Stage::Hook => {
                    hook::install_postinst(params).await?;
                }
                Stage::Conffile => {
                    staging::mark_conffile(params).await?;
                }
                Stage::Archive => output.deb = Some(deb::archive(params).await?),
            }

            stage.postcondition(params).await?;
        }

        if let Some(tree) = &output.staging {
            if self.stages.contains(&Stage::Conffile) {
                tree.validate().await?;
            }
            debug!("staged {} files", tree.files().await?.len());
        }
        if let Some(deb) = &output.deb {
            deb.validate().await?;
            info!("* created artifact: {}", deb.name());
        }

        if let Some(report_file) = &self.report_file {
            write_report(report_file, output.deb.as_ref()).await?;
        }

        Ok(output)
    }
}

/// Write the absolute path of `deb`, if any, to `report_file`.
pub async fn write_report(report_file: &Path, deb: Option<&DebArtifact>) -> Result<()> {
    let mut report = String::new();
    if let Some(deb) = deb {
        let path = tokio::fs::canonicalize(&deb.path)
            .await
            .map_err(BuildError::fs(&deb.path))?;
        report.push_str(&format!("{}\n", path.display()));
    }

    let mut file = File::create(report_file)
        .await
        .map_err(BuildError::fs(report_file))?;
    file.write_all(report.as_bytes()).await?;

    info!("wrote report to {}", report_file.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use crate::artifact::staging::tests::fixture;
    use crate::fs::TempDir;

    use super::*;

    #[ctor::ctor]
    fn init() {
        crate::util::test_init();
    }

    async fn snapshot(root: &Path) -> Result<BTreeMap<PathBuf, Vec<u8>>> {
        let mut contents = BTreeMap::new();
        for path in crate::util::walk_files(root).await? {
            let data = tokio::fs::read(&path).await?;
            contents.insert(path.strip_prefix(root)?.to_path_buf(), data);
        }
        Ok(contents)
    }

    fn stage_of(err: &eyre::Report) -> Option<String> {
        match err.downcast_ref::<BuildError>() {
            Some(BuildError::StageOrder { stage, .. }) => Some(stage.clone()),
            _ => None,
        }
    }

    #[test]
    fn test_stage_lists() {
        assert_eq!(Pipeline::clean().stages(), &[Stage::Clean]);
        assert_eq!(
            Pipeline::stage().stages(),
            &[
                Stage::Clean,
                Stage::StageTree,
                Stage::Control,
                Stage::Hook,
                Stage::Conffile
            ]
        );
        assert_eq!(Pipeline::package().stages().len(), 6);
        assert_eq!(Stage::StageTree.to_string(), "stage-tree");
    }

    #[tokio::test]
    async fn test_rebuild_is_idempotent() -> Result<()> {
        let tmp = TempDir::new().await?;
        let params = fixture(tmp.as_ref()).await?;

        let first = Pipeline::package().run(&params).await?;
        let first_tree = snapshot(&params.build_root).await?;
        let second = Pipeline::package().run(&params).await?;
        let second_tree = snapshot(&params.build_root).await?;

        assert_eq!(first_tree, second_tree);
        assert_eq!(
            first.deb.map(|d| d.path),
            second.deb.map(|d| d.path)
        );
        assert!(exists(&params.artifact_path()).await);

        Ok(())
    }

    #[tokio::test]
    async fn test_staging_marks_conffile() -> Result<()> {
        let tmp = TempDir::new().await?;
        let params = fixture(tmp.as_ref()).await?;

        let output = Pipeline::stage().run(&params).await?;

        assert!(output.deb.is_none());
        let files = output.staging.unwrap().files().await?;
        assert!(files.contains(&PathBuf::from("etc/p.env.new")));
        assert!(!files.contains(&PathBuf::from("etc/p.env")));
        assert!(files.contains(&PathBuf::from("DEBIAN/control")));
        assert!(files.contains(&PathBuf::from("DEBIAN/postinst")));
        assert!(!exists(&params.artifact_path()).await);

        Ok(())
    }

    #[tokio::test]
    async fn test_archive_before_conffile_is_caught() -> Result<()> {
        let tmp = TempDir::new().await?;
        let params = fixture(tmp.as_ref()).await?;

        let pipeline = Pipeline::new(vec![
            Stage::Clean,
            Stage::StageTree,
            Stage::Control,
            Stage::Hook,
            Stage::Archive,
        ]);
        let err = pipeline.run(&params).await.unwrap_err();

        assert_eq!(stage_of(&err).as_deref(), Some("archive"));
        assert!(!exists(&params.artifact_path()).await);

        Ok(())
    }

    #[tokio::test]
    async fn test_control_before_staging_is_caught() -> Result<()> {
        let tmp = TempDir::new().await?;
        let params = fixture(tmp.as_ref()).await?;

        let err = Pipeline::new(vec![Stage::Clean, Stage::Control])
            .run(&params)
            .await
            .unwrap_err();

        assert_eq!(stage_of(&err).as_deref(), Some("control"));

        Ok(())
    }

    #[tokio::test]
    async fn test_staging_without_clean_is_caught() -> Result<()> {
        let tmp = TempDir::new().await?;
        let params = fixture(tmp.as_ref()).await?;
        Pipeline::stage().run(&params).await?;

        let err = Pipeline::new(vec![Stage::StageTree])
            .run(&params)
            .await
            .unwrap_err();

        assert_eq!(stage_of(&err).as_deref(), Some("stage-tree"));

        Ok(())
    }

    #[tokio::test]
    async fn test_failed_build_recovers_on_rerun() -> Result<()> {
        let tmp = TempDir::new().await?;
        let mut params = fixture(tmp.as_ref()).await?;
        let good_archiver = params.archiver.clone();
        params.archiver = vec!["false".into()];

        let err = Pipeline::package().run(&params).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::Archiver { .. })
        ));
        assert!(!exists(&params.artifact_path()).await);
        assert!(exists(&params.build_root).await);

        params.archiver = good_archiver;
        let output = Pipeline::package().run(&params).await?;
        assert_eq!(output.deb.unwrap().path, params.artifact_path());

        Ok(())
    }

    #[tokio::test]
    async fn test_build_root_with_trailing_separator() -> Result<()> {
        let tmp = TempDir::new().await?;
        let mut params = fixture(tmp.as_ref()).await?;
        params.build_root = PathBuf::from(format!("{}/", params.build_root.display()));

        Pipeline::package().run(&params).await?;

        assert_eq!(params.archiver_output(), tmp.path_view().join("stage.deb"));
        assert!(exists(&params.artifact_path()).await);
        let staged = crate::util::walk_files(&params.build_root).await?;
        assert!(staged
            .iter()
            .all(|p| p.extension().map_or(true, |ext| ext != "deb")));

        Ok(())
    }

    #[tokio::test]
    async fn test_report_file() -> Result<()> {
        let tmp = TempDir::new().await?;
        let params = fixture(tmp.as_ref()).await?;
        let report = tmp.path_view().join("report.txt");

        Pipeline::package()
            .report_to(Some(report.clone()))
            .run(&params)
            .await?;

        let expected = tokio::fs::canonicalize(params.artifact_path()).await?;
        assert_eq!(
            tokio::fs::read_to_string(&report).await?,
            format!("{}\n", expected.display())
        );

        Ok(())
    }
}
