//! Resolution of per-project workspace directories
//!
//! The lifecycle controller never invents host paths on its own: a
//! [`WorkspaceProvider`] maps a validated project id to the host directory
//! that gets bind-mounted into the sandbox, and refuses anything that is
//! missing or falls outside the configured root.

use crate::error::{Result, SandboxError};
use crate::ident::ProjectId;
use std::path::{Path, PathBuf};

/// Maps a project to its host-side workspace directory
pub trait WorkspaceProvider: Send + Sync {
    /// Resolve the workspace directory for a project.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::WorkspaceUnavailable`] when the directory does
    /// not exist or resolves outside the provider's root.
    fn workspace_dir(&self, project: &ProjectId) -> Result<PathBuf>;
}

/// Workspace provider backed by a single root directory, one subdirectory per
/// project id
#[derive(Debug, Clone)]
pub struct RootWorkspaces {
    root: PathBuf,
}

impl RootWorkspaces {
    /// Create a provider rooted at `root`
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The configured root directory
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl WorkspaceProvider for RootWorkspaces {
    fn workspace_dir(&self, project: &ProjectId) -> Result<PathBuf> {
        let dir = self.root.join(project.as_str());

        // The id format already excludes separators; this guards the join
        // against future format loosening.
        if !dir.starts_with(&self.root) {
            return Err(SandboxError::WorkspaceUnavailable {
                project: project.to_string(),
                reason: "resolved path escapes workspace root".to_string(),
            });
        }

        if !dir.is_dir() {
            return Err(SandboxError::WorkspaceUnavailable {
                project: project.to_string(),
                reason: format!("no workspace directory at {}", dir.display()),
            });
        }

        Ok(dir)
    }
}
