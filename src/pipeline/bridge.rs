//! Legacy-format bridging (`.doc` → `.docx`, `.xls` → `.xlsx`).
//!
//! The conversion engine has no native reader for the binary Office 97–2003
//! formats, so they are converted first by an external tool. The bridge writes
//! into a scoped workspace directory; [`BridgedFile`] owns that workspace and
//! removes it on drop, which covers success, failure and panics alike.

use crate::error::DocBundleError;
use crate::pipeline::input::DocumentFormat;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Converts a legacy document into a modern format.
#[async_trait]
pub trait FormatBridge: Send + Sync {
    /// Convert `input` to `target`, writing the result inside `workspace`.
    ///
    /// Returns the path of the converted file.
    async fn convert(
        &self,
        input: &Path,
        target: DocumentFormat,
        workspace: &Path,
    ) -> Result<PathBuf, DocBundleError>;
}

/// A bridged file together with the workspace that holds it.
///
/// Dropping the value deletes the workspace and everything in it.
#[derive(Debug)]
pub struct BridgedFile {
    path: PathBuf,
    workspace: TempDir,
}

impl BridgedFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn workspace(&self) -> &Path {
        self.workspace.path()
    }
}

/// Run `bridge` for `input` inside a fresh workspace under `scratch_root`.
pub async fn bridge_into_workspace(
    bridge: &dyn FormatBridge,
    input: &Path,
    target: DocumentFormat,
    scratch_root: &Path,
) -> Result<BridgedFile, DocBundleError> {
    let workspace = tempfile::Builder::new()
        .prefix(".bridge-")
        .tempdir_in(scratch_root)
        .map_err(|e| DocBundleError::Allocation {
            path: scratch_root.to_path_buf(),
            source: e,
        })?;

    let path = bridge.convert(input, target, workspace.path()).await?;
    Ok(BridgedFile { path, workspace })
}

/// LibreOffice headless converter.
///
/// Every invocation gets its own user profile inside the workspace; two
/// `soffice` processes sharing a profile block each other.
#[derive(Debug, Clone)]
pub struct SofficeBridge {
    program: PathBuf,
    timeout: Duration,
}

impl SofficeBridge {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    fn tool_name(&self) -> String {
        self.program.display().to_string()
    }
}

#[async_trait]
impl FormatBridge for SofficeBridge {
    async fn convert(
        &self,
        input: &Path,
        target: DocumentFormat,
        workspace: &Path,
    ) -> Result<PathBuf, DocBundleError> {
        let profile = workspace.join("profile");
        info!(
            "Bridging {} to .{} with {}",
            input.display(),
            target.extension(),
            self.tool_name()
        );

        let mut cmd = Command::new(&self.program);
        cmd.arg("--headless")
            .arg(format!("-env:UserInstallation=file://{}", profile.display()))
            .arg("--convert-to")
            .arg(target.extension())
            .arg("--outdir")
            .arg(workspace)
            .arg(input)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| DocBundleError::ConversionBridge {
            tool: self.tool_name(),
            diagnostic: format!("failed to launch: {e}"),
        })?;

        // Dropping the `wait_with_output` future on timeout kills the child.
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| DocBundleError::ConversionBridge {
                tool: self.tool_name(),
                diagnostic: e.to_string(),
            })?,
            Err(_) => {
                warn!("Bridge timed out after {}s", self.timeout.as_secs());
                return Err(DocBundleError::BridgeTimeout {
                    tool: self.tool_name(),
                    secs: self.timeout.as_secs(),
                });
            }
        };

        let diagnostic = diagnostic_of(&output.stdout, &output.stderr);
        if !output.status.success() {
            return Err(DocBundleError::ConversionBridge {
                tool: self.tool_name(),
                diagnostic: format!("exited with {}: {}", output.status, diagnostic),
            });
        }

        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document".to_string());
        let converted = workspace.join(format!("{stem}.{}", target.extension()));
        if !converted.is_file() {
            return Err(DocBundleError::ConversionBridge {
                tool: self.tool_name(),
                diagnostic: format!("no output produced at {}: {}", converted.display(), diagnostic),
            });
        }

        debug!("Bridged file: {}", converted.display());
        Ok(converted)
    }
}

fn diagnostic_of(stdout: &[u8], stderr: &[u8]) -> String {
    let stderr = String::from_utf8_lossy(stderr);
    let stdout = String::from_utf8_lossy(stdout);
    match (stderr.trim(), stdout.trim()) {
        ("", "") => "no diagnostic output".to_string(),
        (err, "") => err.to_string(),
        ("", out) => out.to_string(),
        (err, out) => format!("{err}\n{out}"),
    }
}
