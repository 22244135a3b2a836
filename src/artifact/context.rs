//! The tarball of the build context sent to the container engine.
//!
//! Entries matched by the context's `.dockerignore` are left out, as are
//! `target/`, `.git/`, the staging tree, scratch directories and packages
//! already sitting in the output directory. `!` exceptions in
//! `.dockerignore` are not supported and are skipped with a warning.

use std::path::{Path, PathBuf};

use eyre::Result;
use regex::Regex;
use tokio_tar::Builder;
use tracing::*;

use crate::fs::exists;
use crate::util::BuildError;

const ALWAYS_IGNORED: &[&str] = &["target", ".git"];
const SCRATCH_PREFIX: &str = ".debstage-workdir-";

/// Decides which paths under a context directory are sent to the daemon.
#[derive(Debug)]
pub struct ContextFilter {
    root: PathBuf,
    ignored: Vec<Regex>,
    package_dir: Option<PathBuf>,
}

impl ContextFilter {
    /// `excluded` paths are dropped if they fall inside the context. Packages
    /// directly inside `package_dir` are dropped too.
    pub async fn load(context: &Path, excluded: &[PathBuf], package_dir: &Path) -> Result<Self> {
        let root = tokio::fs::canonicalize(context)
            .await
            .map_err(BuildError::fs(context))?;

        let mut ignored = vec![];
        for name in ALWAYS_IGNORED {
            ignored.push(literal(Path::new(name))?);
        }
        for path in excluded {
            if let Some(rel) = relative_to(&root, path).await {
                if !rel.as_os_str().is_empty() {
                    ignored.push(literal(&rel)?);
                }
            }
        }

        let dockerignore = root.join(".dockerignore");
        if exists(&dockerignore).await {
            let text = tokio::fs::read_to_string(&dockerignore)
                .await
                .map_err(BuildError::fs(&dockerignore))?;
            for line in text.lines().map(str::trim) {
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                if line.starts_with('!') {
                    warn!(".dockerignore exception {line:?} is not supported, ignoring it");
                    continue;
                }
                ignored.push(glob(line)?);
            }
        }

        Ok(ContextFilter {
            package_dir: relative_to(&root, package_dir).await,
            root,
            ignored,
        })
    }

    pub fn skips(&self, rel: &Path) -> bool {
        let name = rel.to_string_lossy();
        if self.ignored.iter().any(|re| re.is_match(&name)) {
            return true;
        }
        if rel
            .file_name()
            .map_or(false, |n| n.to_string_lossy().starts_with(SCRATCH_PREFIX))
        {
            return true;
        }
        rel.extension().map_or(false, |ext| ext == "deb")
            && self.package_dir.as_deref() == rel.parent()
    }

    /// Every file that goes into the context, relative to its root, sorted.
    pub async fn files(&self) -> Result<Vec<PathBuf>> {
        let mut files = vec![];
        self.collect(Path::new(""), &mut files).await?;
        files.sort();
        Ok(files)
    }

    #[async_recursion::async_recursion]
    async fn collect(&self, rel: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
        let dir = self.root.join(rel);
        let mut read_dir = tokio::fs::read_dir(&dir)
            .await
            .map_err(BuildError::fs(&dir))?;
        while let Some(entry) = read_dir.next_entry().await? {
            let rel = rel.join(entry.file_name());
            if self.skips(&rel) {
                debug!("leaving {rel:?} out of the build context");
                continue;
            }
            if entry.file_type().await?.is_dir() {
                self.collect(&rel, files).await?;
            } else {
                files.push(rel);
            }
        }
        Ok(())
    }

    /// Tar up every file that passes the filter.
    pub async fn tar(&self) -> Result<Vec<u8>> {
        let mut builder = Builder::new(Vec::new());
        builder.follow_symlinks(false);
        for rel in self.files().await? {
            let path = self.root.join(&rel);
            builder
                .append_path_with_name(&path, &rel)
                .await
                .map_err(BuildError::fs(&path))?;
        }
        Ok(builder.into_inner().await?)
    }
}

async fn relative_to(root: &Path, path: &Path) -> Option<PathBuf> {
    let path = tokio::fs::canonicalize(path).await.ok()?;
    path.strip_prefix(root).ok().map(Path::to_path_buf)
}

/// Matches `path` and anything below it.
fn literal(path: &Path) -> Result<Regex> {
    Ok(Regex::new(&format!(
        "^{}(/.*)?$",
        regex::escape(&path.to_string_lossy())
    ))?)
}

/// A `.dockerignore` pattern: `*` and `?` stay within one path segment,
/// `**` crosses any number of them, including none. A match also covers
/// everything below it.
fn glob(pattern: &str) -> Result<Regex> {
    let pattern = pattern
        .trim_start_matches("./")
        .trim_start_matches('/')
        .trim_end_matches('/');
    let mut re = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                if chars.peek() == Some(&'/') {
                    chars.next();
                    re.push_str("(.*/)?");
                } else {
                    re.push_str(".*");
                }
            }
            '*' => re.push_str("[^/]*"),
            '?' => re.push_str("[^/]"),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push_str("(/.*)?$");
    Ok(Regex::new(&re)?)
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;
    use indoc::indoc;
    use tokio_tar::Archive;

    use crate::fs::{ensure_dir, TempDir};

    use super::*;

    #[ctor::ctor]
    fn init() {
        crate::util::test_init();
    }

    async fn touch(root: &Path, rel: &str) -> Result<()> {
        let path = root.join(rel);
        ensure_dir(path.parent().unwrap()).await?;
        tokio::fs::write(&path, rel).await?;
        Ok(())
    }

    async fn entry_names(tar: Vec<u8>) -> Result<Vec<String>> {
        let mut archive = Archive::new(tar.as_slice());
        let mut entries = archive.entries()?;
        let mut names = vec![];
        while let Some(entry) = entries.next().await {
            names.push(entry?.path()?.to_string_lossy().to_string());
        }
        names.sort();
        Ok(names)
    }

    #[tokio::test]
    async fn test_context_leaves_out_build_outputs() -> Result<()> {
        let tmp = TempDir::new().await?;
        let root = tmp.path_view();
        for rel in [
            "Dockerfile",
            "exporter.py",
            "packaging/control",
            "target/debug/debstage",
            ".git/HEAD",
            "build/p_1.2.3/usr/bin/p",
            "p_1.2.2_amd64.deb",
            ".debstage-workdir-42/p_1.2.3_amd64.deb",
            "vendor/keep.deb",
        ] {
            touch(&root, rel).await?;
        }

        let filter =
            ContextFilter::load(&root, &[root.join("build/p_1.2.3")], &root).await?;
        let names = entry_names(filter.tar().await?).await?;

        assert_eq!(
            names,
            vec![
                "Dockerfile",
                "exporter.py",
                "packaging/control",
                "vendor/keep.deb"
            ]
        );

        Ok(())
    }

    #[tokio::test]
    async fn test_context_honors_dockerignore() -> Result<()> {
        let tmp = TempDir::new().await?;
        let root = tmp.path_view();
        for rel in [
            "Dockerfile",
            "notes.md",
            "docs/guide.md",
            "tmp/scratch",
            "packaging/control",
            "packaging/control.orig",
        ] {
            touch(&root, rel).await?;
        }
        tokio::fs::write(
            root.join(".dockerignore"),
            indoc! {"
                # editor leftovers
                **/*.orig
                *.md
                /tmp/
                !docs/guide.md
            "},
        )
        .await?;

        let filter = ContextFilter::load(&root, &[], &root.join("out")).await?;
        let files = filter.files().await?;

        assert_eq!(
            files,
            vec![
                PathBuf::from(".dockerignore"),
                PathBuf::from("Dockerfile"),
                PathBuf::from("docs/guide.md"),
                PathBuf::from("packaging/control"),
            ]
        );

        Ok(())
    }

    #[test]
    fn test_glob_segments() -> Result<()> {
        let re = glob("*.md")?;
        assert!(re.is_match("notes.md"));
        assert!(!re.is_match("docs/guide.md"));

        let re = glob("**/*.orig")?;
        assert!(re.is_match("a/b/c.orig"));
        assert!(re.is_match("c.orig"));

        let re = glob("build")?;
        assert!(re.is_match("build/x/y"));
        assert!(!re.is_match("builder"));

        Ok(())
    }
}
