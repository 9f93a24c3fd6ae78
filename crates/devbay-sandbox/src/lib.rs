//! Sandbox lifecycle management for devbay workspaces
//!
//! Each project gets at most one sandbox: an engine-managed container running
//! a long-lived interactive shell inside a fixed resource and security
//! envelope, with the project's workspace directory bind-mounted in. This
//! crate owns the full lifecycle (create, start, stop, remove, idle reaping)
//! and the raw attach protocol that turns the engine control socket into a
//! bidirectional shell byte stream.
//!
//! Entry points: [`SandboxManager`] for lifecycle, [`AttachClient`] for shell
//! transport.

pub mod attach;
pub mod config;
pub mod engine;
pub mod error;
pub mod ident;
pub mod lifecycle;
pub mod workspace;

pub use attach::{AttachClient, AttachConnector, SandboxStream, ShellIo};
pub use config::{NetworkPolicy, RuntimeKind, SandboxConfig};
pub use engine::{
    DockerGateway, EngineError, EngineErrorKind, EngineGateway, MockEngine, SandboxInspect,
    SandboxSpec,
};
pub use error::{AttachError, Result, SandboxError};
pub use ident::ProjectId;
pub use lifecycle::{PreviewEndpoint, SandboxHandle, SandboxManager, SandboxStatus};
pub use workspace::{RootWorkspaces, WorkspaceProvider};
