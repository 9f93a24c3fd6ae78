//! Interactive terminal sessions over attached sandbox shells
//!
//! Sits on top of `devbay-sandbox`: for each inbound shell connection the
//! [`SessionRegistry`] resolves a running sandbox, attaches to its shell, and
//! relays bytes in both directions while enforcing per-project and per-user
//! session caps. Every termination path (client disconnect, shell exit,
//! eviction) releases all tracking state and delivers a typed
//! [`CloseReason`] to the client.

pub mod config;
pub mod registry;
pub mod session;

pub use config::{ConfigError, TerminalConfig};
pub use registry::{SessionRegistry, HEARTBEAT_PAYLOAD};
pub use session::{
    CloseReason, OpenError, SessionEvent, SessionGone, SessionId, TerminalSession, UserId,
};
