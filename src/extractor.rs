//! Symbol extraction.
//!
//! Extraction is delegated to an external tool (typically `ipsw`) run as a
//! child process. The tool is configured as a command plus argument
//! template:
//!
//! ```toml
//! [extractor]
//! command = "ipsw"
//! args = ["kernel", "symbols", "--json", "--output", "{output}", "{firmware}"]
//! timeout_secs = 1800
//! ```
//!
//! `{firmware}` is replaced by the local path of the firmware image. When
//! `{output}` appears, it is replaced by a file in the scan's work directory
//! and the symbols are read from that file; otherwise they are read from the
//! tool's stdout. See [`crate::symbols::parse_symbol_output`] for accepted
//! formats.
//!
//! The child is killed if it outlives the configured timeout.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::config::{ExtractorConfig, FIRMWARE_PLACEHOLDER, OUTPUT_PLACEHOLDER};
use crate::error::ExtractError;
use crate::models::ExtractedSymbol;
use crate::symbols::parse_symbol_output;

/// Turns a firmware image into a symbol list.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Extract symbols from `firmware`. `work_dir` exists and is private to
    /// this extraction; it is removed afterwards.
    async fn extract(
        &self,
        firmware: &Path,
        work_dir: &Path,
    ) -> Result<Vec<ExtractedSymbol>, ExtractError>;
}

pub struct CommandExtractor {
    command: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandExtractor {
    pub fn new(config: &ExtractorConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            timeout: config.timeout(),
        }
    }

    /// Substitute placeholders, returning the arguments and the output file
    /// if the template asks for one.
    fn render_args(&self, firmware: &Path, work_dir: &Path) -> (Vec<String>, Option<PathBuf>) {
        let output_path = work_dir.join("symbols.out");
        let mut uses_output = false;
        let args = self
            .args
            .iter()
            .map(|arg| {
                if arg.contains(OUTPUT_PLACEHOLDER) {
                    uses_output = true;
                }
                arg.replace(FIRMWARE_PLACEHOLDER, &firmware.to_string_lossy())
                    .replace(OUTPUT_PLACEHOLDER, &output_path.to_string_lossy())
            })
            .collect();
        (args, uses_output.then_some(output_path))
    }
}

#[async_trait]
impl Extractor for CommandExtractor {
    async fn extract(
        &self,
        firmware: &Path,
        work_dir: &Path,
    ) -> Result<Vec<ExtractedSymbol>, ExtractError> {
        // The child runs inside work_dir, so relative paths must be made absolute.
        let firmware = absolute(firmware).await;
        let work_dir = absolute(work_dir).await;
        let (args, output_file) = self.render_args(&firmware, &work_dir);

        tracing::debug!(command = %self.command, ?args, "running extractor");
        let child = Command::new(&self.command)
            .args(&args)
            .current_dir(&work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(ExtractError::Spawn)?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ExtractError::Timeout(self.timeout))?
            .map_err(ExtractError::Spawn)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ExtractError::ToolFailed {
                status: output.status.to_string(),
                stderr: stderr.trim().chars().take(2000).collect(),
            });
        }

        let text = match output_file {
            Some(path) => tokio::fs::read_to_string(&path).await.map_err(|e| {
                ExtractError::Output(format!("cannot read {}: {}", path.display(), e))
            })?,
            None => String::from_utf8_lossy(&output.stdout).into_owned(),
        };

        parse_symbol_output(&text)
    }
}

async fn absolute(path: &Path) -> PathBuf {
    tokio::fs::canonicalize(path)
        .await
        .unwrap_or_else(|_| path.to_path_buf())
}
