//! Error types for sandbox lifecycle and attach operations

use thiserror::Error;

/// Errors from the sandbox lifecycle controller.
///
/// `Clone` because concurrent `get_or_create` callers for the same project all
/// receive the outcome of a single shared creation future.
#[derive(Debug, Clone, Error)]
pub enum SandboxError {
    /// Requested runtime kind is not in the allowed set
    #[error("invalid runtime kind: {kind}")]
    InvalidRuntime {
        /// The rejected runtime string
        kind: String,
    },

    /// Project identifier does not match the strict identifier format
    #[error("invalid project id: {id}")]
    InvalidProjectId {
        /// The rejected identifier
        id: String,
    },

    /// Configuration is out of range or inconsistent
    #[error("invalid configuration: {message}")]
    InvalidConfiguration {
        /// What is wrong with the configuration
        message: String,
    },

    /// The engine control socket cannot be reached or used
    #[error("engine unavailable: {reason}")]
    EngineUnavailable {
        /// Underlying connection failure
        reason: String,
    },

    /// A genuine engine failure on a lifecycle operation
    #[error("engine {op} failed: {reason}")]
    Engine {
        /// Lifecycle operation that failed (create, start, stop, ...)
        op: String,
        /// Engine-reported reason
        reason: String,
    },

    /// Workspace directory for the project is missing or escapes the root
    #[error("workspace unavailable for project {project}: {reason}")]
    WorkspaceUnavailable {
        /// Project identifier
        project: String,
        /// Why the workspace cannot be used
        reason: String,
    },

    /// Sandbox exists but is not in the running state when it must be
    #[error("sandbox for project {project} is not running")]
    NotRunning {
        /// Project identifier
        project: String,
    },
}

impl SandboxError {
    /// Create an `InvalidConfiguration` error
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            message: message.into(),
        }
    }

    /// Create an `Engine` error for a named lifecycle operation
    #[must_use]
    pub fn engine(op: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Engine {
            op: op.into(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for sandbox lifecycle operations
pub type Result<T> = std::result::Result<T, SandboxError>;

/// Attach protocol failures.
///
/// Distinct from [`SandboxError`]: these surface as terminal-open rejections,
/// never as lifecycle errors.
#[derive(Debug, Error)]
pub enum AttachError {
    /// The control socket could not be opened or used
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The engine answered the upgrade request with a non-1xx status
    #[error("attach rejected by engine: status {status}")]
    Rejected {
        /// HTTP status code from the engine
        status: u16,
    },

    /// No complete upgrade header arrived within the bounded window
    #[error("timed out waiting for upgrade header")]
    UpgradeTimeout,

    /// The transport closed before the upgrade header completed
    #[error("transport closed before upgrade header completed")]
    PrematureClose,
}
