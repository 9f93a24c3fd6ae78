//! Configuration for the sandbox subsystem
//!
//! All values are validated eagerly at construction, never per-request.

use crate::error::SandboxError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

// =============================================================================
// Default value functions for serde
// =============================================================================

fn default_engine_socket() -> PathBuf {
    PathBuf::from("/var/run/docker.sock")
}

const fn default_network() -> NetworkPolicy {
    NetworkPolicy::Bridge
}

const fn default_preview_port() -> u16 {
    3000
}

const fn default_idle_timeout() -> Duration {
    Duration::from_secs(600)
}

const fn default_reap_interval() -> Duration {
    Duration::from_secs(60)
}

const fn default_stop_grace() -> Duration {
    Duration::from_secs(10)
}

const fn default_attach_timeout() -> Duration {
    Duration::from_secs(5)
}

const fn default_memory_bytes() -> i64 {
    512 * 1024 * 1024
}

const fn default_nano_cpus() -> i64 {
    // Half a CPU (Docker uses nano-CPUs: 1 CPU = 1e9)
    500_000_000
}

const fn default_pids_limit() -> i64 {
    128
}

// =============================================================================
// Network policy
// =============================================================================

/// Network policy for sandboxes, validated against this closed allow-list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkPolicy {
    /// Fully isolated, no network interface
    None,
    /// Default bridge network
    Bridge,
    /// Host networking (trusted single-tenant deployments only)
    Host,
}

impl NetworkPolicy {
    /// Engine-side network mode string
    #[must_use]
    pub const fn as_mode(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Bridge => "bridge",
            Self::Host => "host",
        }
    }
}

impl FromStr for NetworkPolicy {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "bridge" => Ok(Self::Bridge),
            "host" => Ok(Self::Host),
            other => Err(SandboxError::config(format!(
                "network policy must be one of none/bridge/host, got {other:?}"
            ))),
        }
    }
}

// =============================================================================
// Runtime kinds
// =============================================================================

/// Runtime environments a project can request for its sandbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    Node,
    Python,
    Bun,
}

impl RuntimeKind {
    /// Pinned image for this runtime
    #[must_use]
    pub const fn image(self) -> &'static str {
        match self {
            Self::Node => "node:20-bookworm-slim",
            Self::Python => "python:3.12-slim-bookworm",
            Self::Bun => "oven/bun:1-slim",
        }
    }

    /// Canonical name, also written into the sandbox environment so a running
    /// sandbox records which runtime it was created for
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Node => "node",
            Self::Python => "python",
            Self::Bun => "bun",
        }
    }
}

impl FromStr for RuntimeKind {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "node" => Ok(Self::Node),
            "python" => Ok(Self::Python),
            "bun" => Ok(Self::Bun),
            other => Err(SandboxError::InvalidRuntime {
                kind: other.to_string(),
            }),
        }
    }
}

// =============================================================================
// Sandbox configuration
// =============================================================================

/// Configuration for the sandbox lifecycle controller and attach client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Path to the engine control socket
    #[serde(default = "default_engine_socket")]
    pub engine_socket: PathBuf,

    /// Network policy applied to every sandbox
    #[serde(default = "default_network")]
    pub network: NetworkPolicy,

    /// Internal port the sandboxed app serves its preview on
    #[serde(default = "default_preview_port")]
    pub preview_port: u16,

    /// Sandboxes unused for longer than this are stopped by the reaper
    #[serde(default = "default_idle_timeout", with = "duration_serde")]
    pub idle_timeout: Duration,

    /// How often the idle reaper scans the tracking table
    #[serde(default = "default_reap_interval", with = "duration_serde")]
    pub reap_interval: Duration,

    /// Grace period for graceful stops before the caller proceeds regardless
    #[serde(default = "default_stop_grace", with = "duration_serde")]
    pub stop_grace: Duration,

    /// Bounded wait for the attach upgrade header
    #[serde(default = "default_attach_timeout", with = "duration_serde")]
    pub attach_timeout: Duration,

    /// Memory cap per sandbox in bytes
    #[serde(default = "default_memory_bytes")]
    pub memory_bytes: i64,

    /// CPU cap per sandbox in nano-CPUs (1 CPU = 1e9)
    #[serde(default = "default_nano_cpus")]
    pub nano_cpus: i64,

    /// Process count cap per sandbox
    #[serde(default = "default_pids_limit")]
    pub pids_limit: i64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            engine_socket: default_engine_socket(),
            network: default_network(),
            preview_port: default_preview_port(),
            idle_timeout: default_idle_timeout(),
            reap_interval: default_reap_interval(),
            stop_grace: default_stop_grace(),
            attach_timeout: default_attach_timeout(),
            memory_bytes: default_memory_bytes(),
            nano_cpus: default_nano_cpus(),
            pids_limit: default_pids_limit(),
        }
    }
}

impl SandboxConfig {
    /// Load configuration from `DEVBAY_*` environment variables, falling back
    /// to defaults for anything unset.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` if a variable is present but malformed,
    /// or if the resulting configuration fails [`validate`](Self::validate).
    pub fn from_env() -> Result<Self, SandboxError> {
        let mut config = Self::default();

        if let Some(v) = env_var("DEVBAY_ENGINE_SOCKET") {
            config.engine_socket = PathBuf::from(v);
        }
        if let Some(v) = env_var("DEVBAY_NETWORK_POLICY") {
            config.network = v.parse()?;
        }
        if let Some(v) = env_var("DEVBAY_PREVIEW_PORT") {
            config.preview_port = v
                .parse()
                .map_err(|_| SandboxError::config(format!("invalid DEVBAY_PREVIEW_PORT: {v}")))?;
        }
        if let Some(v) = env_var("DEVBAY_IDLE_TIMEOUT") {
            config.idle_timeout = parse_duration(&v).map_err(SandboxError::config)?;
        }
        if let Some(v) = env_var("DEVBAY_REAP_INTERVAL") {
            config.reap_interval = parse_duration(&v).map_err(SandboxError::config)?;
        }
        if let Some(v) = env_var("DEVBAY_STOP_GRACE") {
            config.stop_grace = parse_duration(&v).map_err(SandboxError::config)?;
        }
        if let Some(v) = env_var("DEVBAY_ATTACH_TIMEOUT") {
            config.attach_timeout = parse_duration(&v).map_err(SandboxError::config)?;
        }
        if let Some(v) = env_var("DEVBAY_MEMORY_BYTES") {
            config.memory_bytes = v
                .parse()
                .map_err(|_| SandboxError::config(format!("invalid DEVBAY_MEMORY_BYTES: {v}")))?;
        }
        if let Some(v) = env_var("DEVBAY_NANO_CPUS") {
            config.nano_cpus = v
                .parse()
                .map_err(|_| SandboxError::config(format!("invalid DEVBAY_NANO_CPUS: {v}")))?;
        }
        if let Some(v) = env_var("DEVBAY_PIDS_LIMIT") {
            config.pids_limit = v
                .parse()
                .map_err(|_| SandboxError::config(format!("invalid DEVBAY_PIDS_LIMIT: {v}")))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` if:
    /// - `preview_port` is 0
    /// - any duration is zero
    /// - the resource envelope is non-positive or absurdly small
    pub fn validate(&self) -> Result<(), SandboxError> {
        if self.preview_port == 0 {
            return Err(SandboxError::config("preview_port must be in 1-65535"));
        }

        if self.idle_timeout.is_zero() {
            return Err(SandboxError::config("idle_timeout must be > 0"));
        }
        if self.reap_interval.is_zero() {
            return Err(SandboxError::config("reap_interval must be > 0"));
        }
        if self.stop_grace.is_zero() {
            return Err(SandboxError::config("stop_grace must be > 0"));
        }
        if self.attach_timeout.is_zero() {
            return Err(SandboxError::config("attach_timeout must be > 0"));
        }

        if self.memory_bytes < 16 * 1024 * 1024 {
            return Err(SandboxError::config(format!(
                "memory_bytes must be >= 16MiB, got {}",
                self.memory_bytes
            )));
        }
        if self.nano_cpus <= 0 {
            return Err(SandboxError::config("nano_cpus must be > 0"));
        }
        if self.pids_limit <= 0 {
            return Err(SandboxError::config("pids_limit must be > 0"));
        }

        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Parse a duration string: plain seconds or `ms`/`s`/`m`/`h` suffixed
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    if let Some(num_str) = s.strip_suffix("ms") {
        let num: u64 = num_str
            .trim()
            .parse()
            .map_err(|_| format!("invalid duration number: {num_str}"))?;
        return Ok(Duration::from_millis(num));
    }

    if let Some(num_str) = s.strip_suffix('s') {
        let num: u64 = num_str
            .trim()
            .parse()
            .map_err(|_| format!("invalid duration number: {num_str}"))?;
        return Ok(Duration::from_secs(num));
    }

    if let Some(num_str) = s.strip_suffix('m') {
        let num: u64 = num_str
            .trim()
            .parse()
            .map_err(|_| format!("invalid duration number: {num_str}"))?;
        return Ok(Duration::from_secs(num * 60));
    }

    if let Some(num_str) = s.strip_suffix('h') {
        let num: u64 = num_str
            .trim()
            .parse()
            .map_err(|_| format!("invalid duration number: {num_str}"))?;
        return Ok(Duration::from_secs(num * 3600));
    }

    Err(format!("invalid duration format: {s}"))
}

// =============================================================================
// duration_serde module for Duration serialization
// =============================================================================

mod duration_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = format!("{}s", duration.as_secs());
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        super::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
