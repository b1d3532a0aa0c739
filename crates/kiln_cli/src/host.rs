//! Unsandboxed host runner.
//!
//! Stages the request under a temporary directory and runs each command
//! with `sh -c`. There is no isolation: the sandbox paths in commands and
//! environment values are rewritten to their staged host locations, and
//! commands see the host filesystem.

use crate::fs_tree::{host_path, read_tree, write_tree};
use async_trait::async_trait;
use kiln_runtime::{SandboxError, SandboxOutput, SandboxRequest, SandboxRunner};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Runs build commands directly on the host
#[derive(Debug, Clone)]
pub struct HostSandbox {
    shell: String,
    scratch: Option<PathBuf>,
}

impl Default for HostSandbox {
    fn default() -> Self {
        Self::new()
    }
}

impl HostSandbox {
    /// Runner using `sh` and the system temp directory
    #[must_use]
    pub fn new() -> Self {
        Self {
            shell: "sh".to_string(),
            scratch: None,
        }
    }

    /// Stage builds under `dir`
    #[must_use]
    pub fn with_scratch(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch = Some(dir.into());
        self
    }

    fn staging_dir(&self) -> std::io::Result<tempfile::TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("kiln-build-");
        match &self.scratch {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                builder.tempdir_in(dir)
            }
            None => builder.tempdir(),
        }
    }
}

/// Replaces sandbox paths with host paths, longest first
struct Rewriter {
    pairs: Vec<(String, String)>,
}

impl Rewriter {
    fn new(root: &Path, sandbox_paths: &[&str]) -> Self {
        let mut pairs: Vec<(String, String)> = sandbox_paths
            .iter()
            .filter(|p| !p.trim_matches('/').is_empty())
            .map(|p| {
                let from = p.trim_end_matches('/').to_string();
                let to = host_path(root, &from).to_string_lossy().into_owned();
                (from, to)
            })
            .collect();
        pairs.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        pairs.dedup();
        Self { pairs }
    }

    fn apply(&self, text: &str) -> String {
        let mut out = text.to_string();
        for (from, to) in &self.pairs {
            out = out.replace(from.as_str(), to);
        }
        out
    }
}

#[async_trait]
impl SandboxRunner for HostSandbox {
    async fn run(&self, request: SandboxRequest, cancel: CancellationToken) -> Result<SandboxOutput, SandboxError> {
        let staging = self.staging_dir()?;
        let root = staging.path().to_path_buf();
        let staged = request.staged_root()?;
        {
            let root = root.clone();
            tokio::task::spawn_blocking(move || write_tree(&root, &staged))
                .await
                .map_err(|e| SandboxError::Io { reason: e.to_string() })??;
        }

        let source_dir = host_path(&root, &request.source_directory);
        let output_dir = host_path(&root, &request.output_directory);
        tokio::fs::create_dir_all(&source_dir).await?;
        tokio::fs::create_dir_all(&output_dir).await?;

        let rewriter = Rewriter::new(
            &root,
            &[request.source_directory.as_str(), request.output_directory.as_str()],
        );
        let environment: Vec<(String, String)> = request
            .environment
            .iter()
            .map(|(k, v)| (k.clone(), rewriter.apply(v)))
            .collect();

        tracing::debug!(
            element = %request.element,
            root = %root.display(),
            commands = request.command_count(),
            "running on host"
        );

        let mut log = String::new();
        for group in &request.commands {
            for command in &group.commands {
                log.push_str(&format!("+ {}\n", command));
                let child = Command::new(&self.shell)
                    .arg("-c")
                    .arg(rewriter.apply(command))
                    .current_dir(&source_dir)
                    .env_clear()
                    .envs(environment.iter().map(|(k, v)| (k.as_str(), v.as_str())))
                    .stdin(Stdio::null())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped())
                    .kill_on_drop(true)
                    .spawn()?;

                let output = tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Err(SandboxError::Cancelled),
                    output = child.wait_with_output() => output?,
                };
                log.push_str(&String::from_utf8_lossy(&output.stdout));
                log.push_str(&String::from_utf8_lossy(&output.stderr));

                if !output.status.success() {
                    return Err(SandboxError::CommandFailed {
                        group: group.name.clone(),
                        command: command.clone(),
                        status: output.status.code(),
                        log,
                    });
                }
            }
        }

        let files = tokio::task::spawn_blocking(move || read_tree(&output_dir))
            .await
            .map_err(|e| SandboxError::Io { reason: e.to_string() })??;
        Ok(SandboxOutput { files, log })
    }
}
