use std::path::PathBuf;

use eyre::Result;
use tracing::*;

use crate::fs::install_file;
use crate::util::config::{BuildParameters, HOOK_MODE};

/// Copy the post-install script into the metadata directory, executable.
pub async fn install_postinst(params: &BuildParameters) -> Result<PathBuf> {
    let dest = params.postinst_path();
    info!("installing postinst hook from {}", params.sources.postinst.display());
    install_file(&params.sources.postinst, &dest, HOOK_MODE).await?;
    Ok(dest)
}
