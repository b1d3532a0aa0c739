//! The sandbox runner contract.

use async_trait::async_trait;
use indexmap::IndexMap;
use kiln_core::{CoreError, CoreResult, FileTree};
use kiln_plan::CommandGroup;
use tokio_util::sync::CancellationToken;

/// Everything needed to run one element's commands
#[derive(Debug, Clone)]
pub struct SandboxRequest {
    /// Element identity, for logs
    pub element: String,
    /// Build scope artifacts, staged at `/`
    pub root: FileTree,
    /// Fetched sources
    pub sources: FileTree,
    /// Absolute directory sources are staged into; commands run here
    pub source_directory: String,
    /// Absolute directory collected as output
    pub output_directory: String,
    /// Command groups, in order
    pub commands: Vec<CommandGroup>,
    /// Process environment
    pub environment: IndexMap<String, String>,
}

impl SandboxRequest {
    /// The root tree with sources placed at the source directory
    ///
    /// # Errors
    ///
    /// Returns error if the source directory is not a valid tree path
    pub fn staged_root(&self) -> CoreResult<FileTree> {
        let mut root = self.root.clone();
        root.overlay(&self.sources.prefixed(&self.source_directory)?);
        Ok(root)
    }

    /// Number of commands across all groups
    #[must_use]
    pub fn command_count(&self) -> usize {
        self.commands.iter().map(|g| g.commands.len()).sum()
    }
}

/// What a successful run produced
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SandboxOutput {
    /// Files under the output directory, relative to it
    pub files: FileTree,
    /// Combined command output
    pub log: String,
}

/// Sandbox errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SandboxError {
    /// A command exited unsuccessfully
    #[error("{group}: '{command}' failed with {}", status.map_or_else(|| "a signal".to_string(), |c| format!("exit status {}", c)))]
    CommandFailed {
        /// Command group
        group: String,
        /// The command
        command: String,
        /// Exit code, if not killed by a signal
        status: Option<i32>,
        /// Output up to the failure
        log: String,
    },

    /// Staging or collection failed
    #[error("sandbox I/O error: {reason}")]
    Io {
        /// OS message
        reason: String,
    },

    /// A path in the request is not usable
    #[error(transparent)]
    Tree(#[from] CoreError),

    /// The run was cancelled
    #[error("sandbox run cancelled")]
    Cancelled,
}

impl From<std::io::Error> for SandboxError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            reason: err.to_string(),
        }
    }
}

/// Isolated command execution
#[async_trait]
pub trait SandboxRunner: Send + Sync {
    /// Stage the request, run its commands and collect the output directory
    ///
    /// Implementations stop promptly once `cancel` fires and return
    /// [`SandboxError::Cancelled`].
    async fn run(&self, request: SandboxRequest, cancel: CancellationToken) -> Result<SandboxOutput, SandboxError>;
}
