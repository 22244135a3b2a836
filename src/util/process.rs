//! Running external tools with their diagnostics captured.

use std::process::{ExitStatus, Stdio};

use eyre::{eyre, Result};
use itertools::Itertools;
use tokio::process::Command;
use tracing::*;

#[derive(Debug)]
pub struct CommandOutput {
    pub command: String,
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// stderr followed by stdout, exactly as the tool wrote them.
    pub fn diagnostics(&self) -> String {
        let mut out = self.stderr.clone();
        if !self.stdout.is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&self.stdout);
        }
        out
    }
}

/// Run `argv` to completion. Only a failure to spawn is an error here; callers
/// decide what a non-zero exit means.
pub async fn run(argv: &[String]) -> Result<CommandOutput> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| eyre!("cannot run an empty command"))?;
    let command = argv.iter().join(" ");
    debug!("running `{command}`");

    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| eyre!("failed to execute `{program}`: {e}. Is it installed?"))?;

    let output = CommandOutput {
        command,
        status: output.status,
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    };
    debug!("`{}` exited with {}", output.command, output.status);

    Ok(output)
}
