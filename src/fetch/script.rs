use super::{FetchWorker, WorkItem};
use crate::config::FetchConfig;
use crate::error::BatchError;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Runs `{program} {script} {selector} {code} {artifact}` per item.
///
/// The child is killed if the surrounding future is dropped, so a timeout or
/// an interrupt never leaves it running.
pub struct ScriptWorker {
    program: String,
    script: PathBuf,
}

impl ScriptWorker {
    pub fn new(config: &FetchConfig) -> Result<Self> {
        let script = config
            .script
            .canonicalize()
            .map_err(|_| BatchError::WorkerMissing(config.script.clone()))?;
        Ok(Self {
            program: config.program.clone(),
            script,
        })
    }
}

#[async_trait]
impl FetchWorker for ScriptWorker {
    async fn fetch(&self, item: &WorkItem) -> Result<()> {
        let mut cmd = Command::new(&self.program);
        cmd.arg(&self.script)
            .arg(item.data_type.spec().code)
            .arg(&item.code)
            .arg(&item.artifact)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = item.artifact.parent() {
            cmd.current_dir(dir);
        }

        debug!("{} {}: running {} {:?}", item.code, item.name, self.program, self.script);
        let output = cmd
            .output()
            .await
            .with_context(|| format!("Failed to spawn {}", self.program))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: Vec<&str> = stderr.lines().rev().take(3).collect();
            bail!(
                "worker exited with {}: {}",
                output.status,
                tail.into_iter().rev().collect::<Vec<_>>().join(" | ")
            );
        }
        Ok(())
    }
}
