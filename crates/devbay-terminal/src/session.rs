//! Terminal session handles and close reasons

use bytes::Bytes;
use devbay_sandbox::{AttachError, ProjectId, SandboxError};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Opaque handle for one active terminal session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub(crate) fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Authenticated user identity, resolved by the caller before `open`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserId(String);

impl UserId {
    /// Wrap an already-authenticated user identifier
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why a terminal session closed.
///
/// A fixed enumeration so clients render an accurate status without string
/// matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The client disconnected; the sandbox is left running
    Normal,
    /// A per-project or per-user session cap was exceeded
    PolicyViolation,
    /// The shell process inside the sandbox exited
    ShellExited,
    /// The caller is not allowed to use this project
    Unauthorized,
    /// The project does not exist or has no workspace
    ProjectNotFound,
    /// Too many session opens in a short window
    RateLimited,
    /// The sandbox or its engine could not be reached
    SandboxUnavailable,
}

impl CloseReason {
    /// Stable wire identifier for this reason
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::PolicyViolation => "policy_violation",
            Self::ShellExited => "shell_exited",
            Self::Unauthorized => "unauthorized",
            Self::ProjectNotFound => "project_not_found",
            Self::RateLimited => "rate_limited",
            Self::SandboxUnavailable => "sandbox_unavailable",
        }
    }
}

/// Something the client side of a session must react to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Shell output bytes, passed through unmodified
    Data(Bytes),
    /// The session is over; no further events follow
    Closed(CloseReason),
}

/// The relay behind a session has shut down
#[derive(Debug, Clone, Copy, Error)]
#[error("terminal session is closed")]
pub struct SessionGone;

/// Client-facing half of an open terminal session.
///
/// Dropping the session counts as a client disconnect: tracking state is
/// released and the sandbox is left running for reconnection.
#[derive(Debug)]
pub struct TerminalSession {
    pub(crate) id: SessionId,
    pub(crate) project: ProjectId,
    pub(crate) user: UserId,
    pub(crate) input: mpsc::Sender<Bytes>,
    pub(crate) events: mpsc::Receiver<SessionEvent>,
}

impl TerminalSession {
    /// This session's handle
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Owning project
    #[must_use]
    pub fn project(&self) -> &ProjectId {
        &self.project
    }

    /// Owning user
    #[must_use]
    pub fn user(&self) -> &UserId {
        &self.user
    }

    /// Send client bytes toward the shell.
    ///
    /// # Errors
    ///
    /// Fails once the session has closed for any reason.
    pub async fn send(&self, data: Bytes) -> Result<(), SessionGone> {
        self.input.send(data).await.map_err(|_| SessionGone)
    }

    /// Receive the next event; `None` after [`SessionEvent::Closed`] has been
    /// delivered
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    /// Close the session from the client side.
    ///
    /// Equivalent to dropping it: tracking state is released and the sandbox
    /// is left running.
    pub fn close(self) {}
}

/// Why an `open` call was refused
#[derive(Debug, Error)]
pub enum OpenError {
    /// The project already has the maximum number of sessions
    #[error("project {project} is at its session cap")]
    ProjectCapReached {
        /// The project at its cap
        project: ProjectId,
    },

    /// The user already has the maximum number of sessions
    #[error("user {user} is at their session cap")]
    UserCapReached {
        /// The user at their cap
        user: UserId,
    },

    /// The lifecycle controller could not produce a running sandbox
    #[error(transparent)]
    Lifecycle(#[from] SandboxError),

    /// The attach handshake failed
    #[error(transparent)]
    Attach(#[from] AttachError),
}

impl OpenError {
    /// The close reason a client should be shown for this rejection
    #[must_use]
    pub fn close_reason(&self) -> CloseReason {
        match self {
            Self::ProjectCapReached { .. } | Self::UserCapReached { .. } => {
                CloseReason::PolicyViolation
            }
            Self::Lifecycle(
                SandboxError::InvalidProjectId { .. } | SandboxError::WorkspaceUnavailable { .. },
            ) => CloseReason::ProjectNotFound,
            Self::Lifecycle(_) | Self::Attach(_) => CloseReason::SandboxUnavailable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_reason_wire_names() {
        assert_eq!(CloseReason::PolicyViolation.as_str(), "policy_violation");
        assert_eq!(CloseReason::ShellExited.as_str(), "shell_exited");
        assert_eq!(CloseReason::SandboxUnavailable.as_str(), "sandbox_unavailable");
    }

    #[test]
    fn test_cap_rejections_are_policy_violations() {
        let err = OpenError::ProjectCapReached {
            project: "a3f1c9d2-4b68-4f0e-9a71-2c54de8b1f03".parse().unwrap(),
        };
        assert_eq!(err.close_reason(), CloseReason::PolicyViolation);

        let err = OpenError::UserCapReached {
            user: UserId::new("u1"),
        };
        assert_eq!(err.close_reason(), CloseReason::PolicyViolation);
    }

    #[test]
    fn test_missing_project_maps_to_not_found() {
        let err = OpenError::Lifecycle(SandboxError::InvalidProjectId {
            id: "nope".to_string(),
        });
        assert_eq!(err.close_reason(), CloseReason::ProjectNotFound);

        let err = OpenError::Lifecycle(SandboxError::WorkspaceUnavailable {
            project: "p".to_string(),
            reason: "missing".to_string(),
        });
        assert_eq!(err.close_reason(), CloseReason::ProjectNotFound);
    }

    #[test]
    fn test_attach_failure_maps_to_unavailable() {
        let err = OpenError::Attach(AttachError::Rejected { status: 404 });
        assert_eq!(err.close_reason(), CloseReason::SandboxUnavailable);
    }
}
