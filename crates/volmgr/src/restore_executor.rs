//! Restore executor that shells out to the storage engine's restore tool.

use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use volmgr_core::{RestoreExecutor, RestoreIntent};

/// Runs `<program> <volume> <backup> <source>` and treats a non-zero exit as
/// a failed restore. The last line of stderr becomes the failure reason.
#[derive(Clone, Debug)]
pub struct CommandRestoreExecutor {
    program: PathBuf,
}

impl CommandRestoreExecutor {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl RestoreExecutor for CommandRestoreExecutor {
    async fn execute(&self, intent: &RestoreIntent) -> anyhow::Result<()> {
        tracing::info!(
            restore = %intent.key(),
            program = %self.program.display(),
            "starting restore command"
        );
        let output = tokio::process::Command::new(&self.program)
            .arg(&intent.spec.volume_name)
            .arg(&intent.spec.backup_name)
            .arg(&intent.spec.restore_source)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("spawn {}", self.program.display()))?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = stderr.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
        anyhow::bail!("restore command exited with {}: {}", output.status, detail.trim())
    }
}
