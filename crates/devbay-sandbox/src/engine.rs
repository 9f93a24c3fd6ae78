//! Engine-facing gateway for sandbox lifecycle operations
//!
//! Defines the [`EngineGateway`] trait the lifecycle controller talks to, the
//! Docker implementation backed by bollard, and an in-memory mock for tests.
//!
//! The gateway translates engine responses into a typed [`EngineErrorKind`] so
//! callers branch on a kind ("not found" vs genuine failure) rather than on a
//! numeric status code.

use crate::config::SandboxConfig;
use bollard::models::{ContainerCreateBody, HostConfig, PortBinding};
use bollard::query_parameters::{
    CreateContainerOptions, CreateImageOptions, InspectContainerOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::Docker;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;

/// Classification of engine failures, used instead of raw status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineErrorKind {
    /// The named sandbox does not exist
    NotFound,
    /// The operation conflicts with current engine state (e.g. name in use)
    Conflict,
    /// The sandbox is already in the requested state
    NotModified,
    /// The control socket is unreachable or the daemon is not responding
    Unavailable,
    /// Any other engine-reported failure
    Other,
}

/// A typed engine failure
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct EngineError {
    /// Failure classification
    pub kind: EngineErrorKind,
    /// Engine-reported message
    pub message: String,
}

impl EngineError {
    fn new(kind: EngineErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Result type alias for engine gateway operations
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Desired configuration for a sandbox about to be created
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxSpec {
    /// Image the sandbox runs
    pub image: String,
    /// Environment entries in `KEY=value` form
    pub env: Vec<String>,
    /// Engine network mode string
    pub network_mode: String,
    /// Host directory bind-mounted at the fixed in-sandbox workspace path
    pub workspace_dir: PathBuf,
    /// Internal port published to an ephemeral loopback host port
    pub preview_port: u16,
    /// Memory cap in bytes
    pub memory_bytes: i64,
    /// CPU cap in nano-CPUs
    pub nano_cpus: i64,
    /// Process count cap
    pub pids_limit: i64,
}

impl SandboxSpec {
    /// Build the fixed resource envelope from configuration
    #[must_use]
    pub fn from_config(
        config: &SandboxConfig,
        image: impl Into<String>,
        env: Vec<String>,
        workspace_dir: PathBuf,
    ) -> Self {
        Self {
            image: image.into(),
            env,
            network_mode: config.network.as_mode().to_string(),
            workspace_dir,
            preview_port: config.preview_port,
            memory_bytes: config.memory_bytes,
            nano_cpus: config.nano_cpus,
            pids_limit: config.pids_limit,
        }
    }
}

/// Observed state of an existing sandbox, read from the engine on demand
#[derive(Debug, Clone)]
pub struct SandboxInspect {
    /// Engine-assigned identifier (needed for attach, never for lifecycle)
    pub engine_id: String,
    /// Whether the main process is currently running
    pub running: bool,
    /// Recorded network mode
    pub network_mode: String,
    /// Recorded environment entries
    pub env: Vec<String>,
    /// Internal ports configured for publishing
    pub internal_ports: Vec<u16>,
    /// Host port the preview port is currently published on, if any
    pub published_port: Option<u16>,
}

/// Abstract gateway to the container engine
///
/// The lifecycle controller depends only on this trait; tests use
/// [`MockEngine`], production uses [`DockerGateway`].
#[async_trait::async_trait]
pub trait EngineGateway: Send + Sync {
    /// Verify the control socket is reachable and the daemon responds
    async fn ping(&self) -> EngineResult<()>;

    /// Ensure an image is present locally, pulling it if absent
    async fn pull_image(&self, image: &str) -> EngineResult<()>;

    /// Inspect a sandbox by name; `Ok(None)` when it does not exist
    async fn inspect_sandbox(&self, name: &str) -> EngineResult<Option<SandboxInspect>>;

    /// Create a sandbox and return its engine-assigned id
    async fn create_sandbox(&self, name: &str, spec: &SandboxSpec) -> EngineResult<String>;

    /// Start a created or stopped sandbox
    async fn start_sandbox(&self, name: &str) -> EngineResult<()>;

    /// Gracefully stop a sandbox within the grace period
    async fn stop_sandbox(&self, name: &str, grace: Duration) -> EngineResult<()>;

    /// Forcefully remove a sandbox regardless of running state
    async fn remove_sandbox(&self, name: &str) -> EngineResult<()>;
}

// =============================================================================
// Docker gateway
// =============================================================================

/// Fixed in-sandbox workspace mount point
pub const WORKSPACE_MOUNT: &str = "/workspace";

/// Scratch tmpfs carved out of the otherwise read-only root filesystem
const SCRATCH_TMPFS: (&str, &str) = ("/tmp", "rw,noexec,nosuid,size=64m");

/// Non-root execution identity inside every sandbox
const SANDBOX_USER: &str = "1000:1000";

/// Docker-backed engine gateway
pub struct DockerGateway {
    docker: Docker,
}

impl std::fmt::Debug for DockerGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerGateway").finish_non_exhaustive()
    }
}

impl DockerGateway {
    /// Connect to the engine control socket and verify it responds
    ///
    /// # Errors
    ///
    /// Returns `EngineErrorKind::Unavailable` if the socket cannot be opened
    /// or the daemon does not answer the ping.
    pub async fn connect(socket: &std::path::Path) -> EngineResult<Self> {
        let docker = Docker::connect_with_socket(
            &socket.to_string_lossy(),
            120,
            bollard::API_DEFAULT_VERSION,
        )
        .map_err(|e| EngineError::new(EngineErrorKind::Unavailable, e.to_string()))?;

        docker
            .ping()
            .await
            .map_err(|e| EngineError::new(EngineErrorKind::Unavailable, e.to_string()))?;

        tracing::info!(socket = %socket.display(), "connected to container engine");
        Ok(Self { docker })
    }

    /// Wrap a pre-configured bollard client
    #[must_use]
    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }
}

/// Map a bollard error to a typed engine error
fn map_engine_error(err: bollard::errors::Error) -> EngineError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message,
            ..
        } => {
            let kind = match status_code {
                304 => EngineErrorKind::NotModified,
                404 => EngineErrorKind::NotFound,
                409 => EngineErrorKind::Conflict,
                _ => EngineErrorKind::Other,
            };
            EngineError::new(kind, message)
        }
        other => EngineError::new(EngineErrorKind::Unavailable, other.to_string()),
    }
}

/// Build the host-side configuration for a sandbox
fn build_host_config(spec: &SandboxSpec) -> HostConfig {
    let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
    // Ephemeral host port, chosen by the engine, loopback only
    port_bindings.insert(
        format!("{}/tcp", spec.preview_port),
        Some(vec![PortBinding {
            host_ip: Some("127.0.0.1".to_string()),
            host_port: Some("0".to_string()),
        }]),
    );

    let mut tmpfs = HashMap::new();
    tmpfs.insert(SCRATCH_TMPFS.0.to_string(), SCRATCH_TMPFS.1.to_string());

    HostConfig {
        memory: Some(spec.memory_bytes),
        nano_cpus: Some(spec.nano_cpus),
        pids_limit: Some(spec.pids_limit),
        readonly_rootfs: Some(true),
        tmpfs: Some(tmpfs),
        cap_drop: Some(vec!["ALL".to_string()]),
        security_opt: Some(vec!["no-new-privileges:true".to_string()]),
        network_mode: Some(spec.network_mode.clone()),
        binds: Some(vec![format!(
            "{}:{}",
            spec.workspace_dir.display(),
            WORKSPACE_MOUNT
        )]),
        port_bindings: Some(port_bindings),
        ..Default::default()
    }
}

/// Parse an image reference into name and tag
fn parse_image_ref(image: &str) -> (&str, &str) {
    if image.contains('@') {
        return (image, "");
    }

    if let Some((name, tag)) = image.rsplit_once(':') {
        // A '/' after the ':' means the ':' belongs to a registry port
        if !tag.contains('/') {
            return (name, tag);
        }
    }

    (image, "latest")
}

/// Pull the published host port for an internal port out of an inspect response
fn published_host_port(
    ports: Option<&HashMap<String, Option<Vec<PortBinding>>>>,
    internal_port: u16,
) -> Option<u16> {
    let bindings = ports?.get(&format!("{internal_port}/tcp"))?.as_ref()?;
    bindings
        .iter()
        .find_map(|b| b.host_port.as_ref())
        .and_then(|p| p.parse().ok())
}

#[async_trait::async_trait]
impl EngineGateway for DockerGateway {
    async fn ping(&self) -> EngineResult<()> {
        self.docker.ping().await.map_err(map_engine_error)?;
        Ok(())
    }

    async fn pull_image(&self, image: &str) -> EngineResult<()> {
        // IfNotPresent semantics: skip the pull when the image is local
        if self.docker.inspect_image(image).await.is_ok() {
            tracing::debug!(image = %image, "image already present, skipping pull");
            return Ok(());
        }

        let (name, tag) = parse_image_ref(image);
        tracing::info!(image = %image, "pulling image");

        let options = CreateImageOptions {
            from_image: Some(name.to_string()),
            tag: if tag.is_empty() {
                None
            } else {
                Some(tag.to_string())
            },
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            result.map_err(map_engine_error)?;
        }

        tracing::info!(image = %image, "image pulled");
        Ok(())
    }

    async fn inspect_sandbox(&self, name: &str) -> EngineResult<Option<SandboxInspect>> {
        let inspect = match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => inspect,
            Err(e) => {
                let mapped = map_engine_error(e);
                if mapped.kind == EngineErrorKind::NotFound {
                    return Ok(None);
                }
                return Err(mapped);
            }
        };

        let engine_id = inspect.id.unwrap_or_else(|| name.to_string());
        let running = inspect
            .state
            .as_ref()
            .and_then(|s| s.running)
            .unwrap_or(false);
        let host_config = inspect.host_config;
        let network_mode = host_config
            .as_ref()
            .and_then(|h| h.network_mode.clone())
            .unwrap_or_default();
        let env = inspect
            .config
            .and_then(|c| c.env)
            .unwrap_or_default();
        let internal_ports: Vec<u16> = host_config
            .and_then(|h| h.port_bindings)
            .map(|bindings| {
                bindings
                    .keys()
                    .filter_map(|key| key.strip_suffix("/tcp").and_then(|p| p.parse().ok()))
                    .collect()
            })
            .unwrap_or_default();
        let published_port = inspect
            .network_settings
            .and_then(|n| n.ports)
            .and_then(|ports| {
                internal_ports
                    .first()
                    .and_then(|p| published_host_port(Some(&ports), *p))
            });

        Ok(Some(SandboxInspect {
            engine_id,
            running,
            network_mode,
            env,
            internal_ports,
            published_port,
        }))
    }

    async fn create_sandbox(&self, name: &str, spec: &SandboxSpec) -> EngineResult<String> {
        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            env: if spec.env.is_empty() {
                None
            } else {
                Some(spec.env.clone())
            },
            // Long-lived interactive shell as the main process; the attach
            // client connects to its combined stdio
            cmd: Some(vec!["/bin/sh".to_string()]),
            user: Some(SANDBOX_USER.to_string()),
            working_dir: Some(WORKSPACE_MOUNT.to_string()),
            tty: Some(true),
            open_stdin: Some(true),
            exposed_ports: Some(
                [(format!("{}/tcp", spec.preview_port), Default::default())]
                    .into_iter()
                    .collect(),
            ),
            host_config: Some(build_host_config(spec)),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: Some(name.to_string()),
            ..Default::default()
        };

        tracing::info!(sandbox = %name, image = %spec.image, "creating sandbox");

        let response = self
            .docker
            .create_container(Some(options), body)
            .await
            .map_err(map_engine_error)?;

        tracing::info!(sandbox = %name, engine_id = %response.id, "sandbox created");
        Ok(response.id)
    }

    async fn start_sandbox(&self, name: &str) -> EngineResult<()> {
        tracing::info!(sandbox = %name, "starting sandbox");

        match self
            .docker
            .start_container(name, None::<StartContainerOptions>)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => {
                let mapped = map_engine_error(e);
                // Already running is the desired state, not a failure
                if mapped.kind == EngineErrorKind::NotModified {
                    return Ok(());
                }
                Err(mapped)
            }
        }
    }

    async fn stop_sandbox(&self, name: &str, grace: Duration) -> EngineResult<()> {
        tracing::info!(sandbox = %name, grace = ?grace, "stopping sandbox");

        let options = StopContainerOptions {
            t: Some(grace.as_secs() as i32),
            signal: None,
        };

        match self.docker.stop_container(name, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let mapped = map_engine_error(e);
                // Already stopped is success
                if mapped.kind == EngineErrorKind::NotModified {
                    return Ok(());
                }
                Err(mapped)
            }
        }
    }

    async fn remove_sandbox(&self, name: &str) -> EngineResult<()> {
        tracing::info!(sandbox = %name, "removing sandbox");

        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        self.docker
            .remove_container(name, Some(options))
            .await
            .map_err(map_engine_error)?;
        Ok(())
    }
}

// =============================================================================
// Mock engine
// =============================================================================

/// In-memory sandbox record held by [`MockEngine`]
#[derive(Debug, Clone)]
pub struct MockSandbox {
    /// Fake engine id
    pub engine_id: String,
    /// Spec the sandbox was created with
    pub spec: SandboxSpec,
    /// Running flag
    pub running: bool,
    /// Host port assigned at creation
    pub published_port: u16,
}

/// In-memory engine for tests and development
///
/// Records call counts so tests can assert on how often the engine was
/// actually touched (e.g. exactly one create for concurrent callers).
#[derive(Debug, Default)]
pub struct MockEngine {
    sandboxes: tokio::sync::RwLock<HashMap<String, MockSandbox>>,
    create_calls: AtomicUsize,
    stop_calls: AtomicUsize,
    remove_calls: AtomicUsize,
    pull_calls: AtomicUsize,
    fail_create: AtomicBool,
    next_port: AtomicU16,
    create_delay: Option<Duration>,
}

impl MockEngine {
    /// Create a mock engine
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_port: AtomicU16::new(0),
            ..Default::default()
        }
    }

    /// Create a mock engine whose create calls take `delay` to settle,
    /// widening race windows in concurrency tests
    #[must_use]
    pub fn with_create_delay(delay: Duration) -> Self {
        Self {
            create_delay: Some(delay),
            ..Self::new()
        }
    }

    /// Make subsequent create calls fail
    pub fn fail_next_creates(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Number of create calls observed
    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    /// Number of stop calls observed
    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    /// Number of remove calls observed
    pub fn remove_calls(&self) -> usize {
        self.remove_calls.load(Ordering::SeqCst)
    }

    /// Number of pull calls observed
    pub fn pull_calls(&self) -> usize {
        self.pull_calls.load(Ordering::SeqCst)
    }

    /// Snapshot of a sandbox record
    pub async fn sandbox(&self, name: &str) -> Option<MockSandbox> {
        self.sandboxes.read().await.get(name).cloned()
    }

    /// Whether the named sandbox exists and is running
    pub async fn is_running(&self, name: &str) -> bool {
        self.sandboxes
            .read()
            .await
            .get(name)
            .is_some_and(|s| s.running)
    }
}

#[async_trait::async_trait]
impl EngineGateway for MockEngine {
    async fn ping(&self) -> EngineResult<()> {
        Ok(())
    }

    async fn pull_image(&self, _image: &str) -> EngineResult<()> {
        self.pull_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn inspect_sandbox(&self, name: &str) -> EngineResult<Option<SandboxInspect>> {
        let sandboxes = self.sandboxes.read().await;
        Ok(sandboxes.get(name).map(|s| SandboxInspect {
            engine_id: s.engine_id.clone(),
            running: s.running,
            network_mode: s.spec.network_mode.clone(),
            env: s.spec.env.clone(),
            internal_ports: vec![s.spec.preview_port],
            published_port: s.running.then_some(s.published_port),
        }))
    }

    async fn create_sandbox(&self, name: &str, spec: &SandboxSpec) -> EngineResult<String> {
        if let Some(delay) = self.create_delay {
            tokio::time::sleep(delay).await;
        }

        let n = self.create_calls.fetch_add(1, Ordering::SeqCst);

        if self.fail_create.load(Ordering::SeqCst) {
            return Err(EngineError::new(
                EngineErrorKind::Other,
                "mock create failure",
            ));
        }

        let mut sandboxes = self.sandboxes.write().await;
        if sandboxes.contains_key(name) {
            return Err(EngineError::new(
                EngineErrorKind::Conflict,
                format!("sandbox name {name} already in use"),
            ));
        }

        let engine_id = format!("mock-{n}");
        let published_port = 32768 + self.next_port.fetch_add(1, Ordering::SeqCst);
        sandboxes.insert(
            name.to_string(),
            MockSandbox {
                engine_id: engine_id.clone(),
                spec: spec.clone(),
                running: false,
                published_port,
            },
        );
        Ok(engine_id)
    }

    async fn start_sandbox(&self, name: &str) -> EngineResult<()> {
        let mut sandboxes = self.sandboxes.write().await;
        match sandboxes.get_mut(name) {
            Some(s) => {
                s.running = true;
                Ok(())
            }
            None => Err(EngineError::new(
                EngineErrorKind::NotFound,
                format!("no such sandbox: {name}"),
            )),
        }
    }

    async fn stop_sandbox(&self, name: &str, _grace: Duration) -> EngineResult<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        let mut sandboxes = self.sandboxes.write().await;
        match sandboxes.get_mut(name) {
            Some(s) => {
                s.running = false;
                Ok(())
            }
            None => Err(EngineError::new(
                EngineErrorKind::NotFound,
                format!("no such sandbox: {name}"),
            )),
        }
    }

    async fn remove_sandbox(&self, name: &str) -> EngineResult<()> {
        self.remove_calls.fetch_add(1, Ordering::SeqCst);
        let mut sandboxes = self.sandboxes.write().await;
        match sandboxes.remove(name) {
            Some(_) => Ok(()),
            None => Err(EngineError::new(
                EngineErrorKind::NotFound,
                format!("no such sandbox: {name}"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkPolicy;

    fn test_spec() -> SandboxSpec {
        SandboxSpec {
            image: "node:20-bookworm-slim".to_string(),
            env: vec!["DEVBAY_RUNTIME=node".to_string()],
            network_mode: NetworkPolicy::Bridge.as_mode().to_string(),
            workspace_dir: PathBuf::from("/srv/workspaces/p1"),
            preview_port: 3000,
            memory_bytes: 512 * 1024 * 1024,
            nano_cpus: 500_000_000,
            pids_limit: 128,
        }
    }

    #[test]
    fn test_parse_image_ref() {
        assert_eq!(parse_image_ref("node:20"), ("node", "20"));
        assert_eq!(parse_image_ref("node"), ("node", "latest"));
        assert_eq!(
            parse_image_ref("localhost:5000/node:20"),
            ("localhost:5000/node", "20")
        );
        let digest = "node@sha256:abc123";
        assert_eq!(parse_image_ref(digest), (digest, ""));
    }

    #[test]
    fn test_host_config_envelope() {
        let spec = test_spec();
        let host = build_host_config(&spec);

        assert_eq!(host.memory, Some(spec.memory_bytes));
        assert_eq!(host.nano_cpus, Some(spec.nano_cpus));
        assert_eq!(host.pids_limit, Some(spec.pids_limit));
        assert_eq!(host.readonly_rootfs, Some(true));
        assert_eq!(host.cap_drop, Some(vec!["ALL".to_string()]));
        assert_eq!(host.network_mode.as_deref(), Some("bridge"));
        assert_eq!(
            host.binds,
            Some(vec!["/srv/workspaces/p1:/workspace".to_string()])
        );

        let bindings = host.port_bindings.unwrap();
        let preview = bindings.get("3000/tcp").unwrap().as_ref().unwrap();
        assert_eq!(preview[0].host_ip.as_deref(), Some("127.0.0.1"));
        assert_eq!(preview[0].host_port.as_deref(), Some("0"));
    }

    #[test]
    fn test_published_host_port() {
        let mut ports: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        ports.insert(
            "3000/tcp".to_string(),
            Some(vec![PortBinding {
                host_ip: Some("127.0.0.1".to_string()),
                host_port: Some("49321".to_string()),
            }]),
        );

        assert_eq!(published_host_port(Some(&ports), 3000), Some(49321));
        assert_eq!(published_host_port(Some(&ports), 8080), None);
        assert_eq!(published_host_port(None, 3000), None);
    }

    #[tokio::test]
    async fn test_mock_engine_lifecycle() {
        let engine = MockEngine::new();
        let spec = test_spec();

        assert!(engine.inspect_sandbox("devbay-x").await.unwrap().is_none());

        let id = engine.create_sandbox("devbay-x", &spec).await.unwrap();
        assert_eq!(id, "mock-0");
        assert_eq!(engine.create_calls(), 1);

        let inspect = engine.inspect_sandbox("devbay-x").await.unwrap().unwrap();
        assert!(!inspect.running);
        assert_eq!(inspect.published_port, None);

        engine.start_sandbox("devbay-x").await.unwrap();
        let inspect = engine.inspect_sandbox("devbay-x").await.unwrap().unwrap();
        assert!(inspect.running);
        assert!(inspect.published_port.is_some());

        engine
            .stop_sandbox("devbay-x", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!engine.is_running("devbay-x").await);

        engine.remove_sandbox("devbay-x").await.unwrap();
        assert!(engine.inspect_sandbox("devbay-x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mock_engine_duplicate_create_conflicts() {
        let engine = MockEngine::new();
        let spec = test_spec();

        engine.create_sandbox("devbay-x", &spec).await.unwrap();
        let err = engine.create_sandbox("devbay-x", &spec).await.unwrap_err();
        assert_eq!(err.kind, EngineErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_mock_engine_missing_sandbox_is_not_found() {
        let engine = MockEngine::new();

        let err = engine
            .stop_sandbox("devbay-x", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind, EngineErrorKind::NotFound);

        let err = engine.remove_sandbox("devbay-x").await.unwrap_err();
        assert_eq!(err.kind, EngineErrorKind::NotFound);
    }
}
