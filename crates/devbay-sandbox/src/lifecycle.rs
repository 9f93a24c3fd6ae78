//! Sandbox lifecycle controller
//!
//! [`SandboxManager`] owns every lifecycle decision: reconciling a project's
//! sandbox to the running state, deduplicating concurrent creations, stopping
//! and removing sandboxes, and reaping idle ones in the background.
//!
//! Reconciliation is name-based and idempotent. The sandbox name is derived
//! from the project id, so a lookup after a crash finds whatever an earlier
//! process left behind and converges it instead of leaking a duplicate.

use crate::attach::AttachClient;
use crate::config::{RuntimeKind, SandboxConfig};
use crate::engine::{EngineError, EngineErrorKind, EngineGateway, SandboxInspect, SandboxSpec};
use crate::error::{Result, SandboxError};
use crate::ident::ProjectId;
use crate::workspace::WorkspaceProvider;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Environment variable telling the sandboxed process which runtime it is
const RUNTIME_ENV: &str = "DEVBAY_RUNTIME";

/// A running sandbox, as returned by reconciliation
#[derive(Debug, Clone)]
pub struct SandboxHandle {
    /// Owning project
    pub project: ProjectId,
    /// Deterministic engine-side name
    pub name: String,
    /// Engine-assigned id, required by the attach protocol
    pub engine_id: String,
}

/// Point-in-time existence and run state of a project's sandbox
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SandboxStatus {
    /// Whether a sandbox with the project's name exists
    pub exists: bool,
    /// Whether its main process is running
    pub running: bool,
}

/// Where a project's preview server can currently be reached
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewEndpoint {
    /// Whether the endpoint is reachable right now
    pub available: bool,
    /// Loopback URL when available
    pub url: Option<String>,
    /// In-sandbox port the preview server listens on
    pub internal_port: u16,
    /// Host port it is published on, when running
    pub published_port: Option<u16>,
}

/// One deduplicated reconciliation in flight for a project
type CreationFuture = Shared<BoxFuture<'static, Result<SandboxHandle>>>;

/// Lifecycle controller for all sandboxes managed by this process
pub struct SandboxManager {
    config: SandboxConfig,
    engine: Arc<dyn EngineGateway>,
    workspaces: Arc<dyn WorkspaceProvider>,
    /// In-flight reconciliations, at most one per project
    creations: Mutex<HashMap<ProjectId, CreationFuture>>,
    /// Last observed activity per project, consulted by the reaper
    last_used: DashMap<ProjectId, Instant>,
    shutdown: Notify,
}

impl SandboxManager {
    /// Create a manager after validating configuration and verifying the
    /// engine responds.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::InvalidConfiguration`] for bad config and
    /// [`SandboxError::EngineUnavailable`] when the engine does not answer.
    pub async fn new(
        config: SandboxConfig,
        engine: Arc<dyn EngineGateway>,
        workspaces: Arc<dyn WorkspaceProvider>,
    ) -> Result<Self> {
        config.validate()?;

        engine
            .ping()
            .await
            .map_err(|e| SandboxError::EngineUnavailable { reason: e.message })?;

        Ok(Self {
            config,
            engine,
            workspaces,
            creations: Mutex::new(HashMap::new()),
            last_used: DashMap::new(),
            shutdown: Notify::new(),
        })
    }

    /// The manager's configuration
    #[must_use]
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Attach protocol client for the engine this manager talks to
    #[must_use]
    pub fn attach_client(&self) -> AttachClient {
        AttachClient::new(&self.config.engine_socket, self.config.attach_timeout)
    }

    /// Reconcile the project's sandbox to running and return its handle.
    ///
    /// Concurrent calls for the same project share a single reconciliation:
    /// exactly one engine create happens and every caller receives its
    /// outcome, success or error. Once that reconciliation settles, later
    /// calls observe current engine state afresh.
    pub async fn get_or_create(
        self: &Arc<Self>,
        project: &ProjectId,
        runtime: RuntimeKind,
    ) -> Result<SandboxHandle> {
        let fut = {
            let mut creations = self.creations.lock();
            match creations.get(project) {
                Some(existing) => existing.clone(),
                None => {
                    let this = Arc::clone(self);
                    let id = project.clone();
                    let fut = async move { this.ensure_running(&id, runtime).await }
                        .boxed()
                        .shared();
                    creations.insert(project.clone(), fut.clone());
                    fut
                }
            }
        };

        let result = fut.clone().await;

        // Drop the settled entry so future calls re-reconcile. A newer
        // in-flight future registered meanwhile must stay.
        {
            let mut creations = self.creations.lock();
            if creations.get(project).is_some_and(|cur| cur.ptr_eq(&fut)) {
                creations.remove(project);
            }
        }

        result
    }

    /// One full reconciliation pass for a project
    async fn ensure_running(
        &self,
        project: &ProjectId,
        runtime: RuntimeKind,
    ) -> Result<SandboxHandle> {
        let name = project.sandbox_name();
        let workspace_dir = self.workspaces.workspace_dir(project)?;

        let env = vec![
            format!("{RUNTIME_ENV}={}", runtime.as_str()),
            format!("PORT={}", self.config.preview_port),
        ];
        let spec = SandboxSpec::from_config(&self.config, runtime.image(), env, workspace_dir);

        let existing = self
            .engine
            .inspect_sandbox(&name)
            .await
            .map_err(|e| map_engine("inspect", e))?;

        if let Some(existing) = existing {
            if drifted(&existing, &spec) {
                tracing::warn!(
                    project = %project,
                    sandbox = %name,
                    "sandbox configuration drifted, recreating"
                );
                self.engine
                    .remove_sandbox(&name)
                    .await
                    .map_err(|e| map_engine("remove", e))?;
            } else {
                if !existing.running {
                    self.engine
                        .start_sandbox(&name)
                        .await
                        .map_err(|e| map_engine("start", e))?;
                    tracing::info!(project = %project, sandbox = %name, "sandbox restarted");
                }
                self.touch(project);
                return Ok(SandboxHandle {
                    project: project.clone(),
                    name,
                    engine_id: existing.engine_id,
                });
            }
        }

        self.engine
            .pull_image(&spec.image)
            .await
            .map_err(|e| map_engine("pull", e))?;
        let engine_id = self
            .engine
            .create_sandbox(&name, &spec)
            .await
            .map_err(|e| map_engine("create", e))?;
        self.engine
            .start_sandbox(&name)
            .await
            .map_err(|e| map_engine("start", e))?;

        tracing::info!(
            project = %project,
            sandbox = %name,
            runtime = runtime.as_str(),
            "sandbox created and started"
        );

        self.touch(project);
        Ok(SandboxHandle {
            project: project.clone(),
            name,
            engine_id,
        })
    }

    /// Stop the project's sandbox, keeping it on disk for a fast restart.
    ///
    /// Idempotent: a missing or already-stopped sandbox is success. Idle
    /// tracking is cleared even when the engine call fails, so a broken
    /// sandbox cannot pin the reaper's attention forever.
    pub async fn stop(&self, project: &ProjectId) -> Result<()> {
        self.last_used.remove(project);

        let name = project.sandbox_name();
        match self
            .engine
            .stop_sandbox(&name, self.config.stop_grace)
            .await
        {
            Ok(()) => {
                tracing::info!(project = %project, sandbox = %name, "sandbox stopped");
                Ok(())
            }
            Err(e) if e.kind == EngineErrorKind::NotFound => Ok(()),
            Err(e) => Err(map_engine("stop", e)),
        }
    }

    /// Remove the project's sandbox entirely, running or not.
    ///
    /// Idempotent: a missing sandbox is success. Also discards any settled
    /// creation entry so the next `get_or_create` starts clean.
    pub async fn remove(&self, project: &ProjectId) -> Result<()> {
        self.last_used.remove(project);
        self.creations.lock().remove(project);

        let name = project.sandbox_name();
        match self.engine.remove_sandbox(&name).await {
            Ok(()) => {
                tracing::info!(project = %project, sandbox = %name, "sandbox removed");
                Ok(())
            }
            Err(e) if e.kind == EngineErrorKind::NotFound => Ok(()),
            Err(e) => Err(map_engine("remove", e)),
        }
    }

    /// Report existence and run state without changing anything
    pub async fn status(&self, project: &ProjectId) -> Result<SandboxStatus> {
        let inspect = self
            .engine
            .inspect_sandbox(&project.sandbox_name())
            .await
            .map_err(|e| map_engine("inspect", e))?;

        Ok(match inspect {
            Some(i) => SandboxStatus {
                exists: true,
                running: i.running,
            },
            None => SandboxStatus {
                exists: false,
                running: false,
            },
        })
    }

    /// Where the project's preview server can be reached right now.
    ///
    /// The published host port is re-read from the engine on every call; it
    /// changes whenever the sandbox restarts, so it is never cached.
    pub async fn preview_endpoint(&self, project: &ProjectId) -> Result<PreviewEndpoint> {
        let inspect = self
            .engine
            .inspect_sandbox(&project.sandbox_name())
            .await
            .map_err(|e| map_engine("inspect", e))?;

        let internal_port = self.config.preview_port;
        let published_port = inspect
            .as_ref()
            .filter(|i| i.running)
            .and_then(|i| i.published_port);

        Ok(PreviewEndpoint {
            available: published_port.is_some(),
            url: published_port.map(|p| format!("http://127.0.0.1:{p}")),
            internal_port,
            published_port,
        })
    }

    /// Record activity for a project, deferring its idle reap
    pub fn mark_used(&self, project: &ProjectId) {
        self.touch(project);
    }

    /// Projects currently tracked for idle reaping
    #[must_use]
    pub fn tracked_projects(&self) -> Vec<ProjectId> {
        self.last_used.iter().map(|e| e.key().clone()).collect()
    }

    fn touch(&self, project: &ProjectId) {
        self.last_used.insert(project.clone(), Instant::now());
    }

    /// Stop every tracked sandbox idle for at least the configured timeout
    pub async fn reap_idle(&self) {
        let now = Instant::now();
        let stale: Vec<ProjectId> = self
            .last_used
            .iter()
            .filter(|e| now.duration_since(*e.value()) >= self.config.idle_timeout)
            .map(|e| e.key().clone())
            .collect();

        for project in stale {
            tracing::info!(project = %project, "reaping idle sandbox");
            if let Err(e) = self.stop(&project).await {
                tracing::warn!(project = %project, error = %e, "failed to reap idle sandbox");
            }
        }
    }

    /// Spawn the background reaper; runs until [`SandboxManager::shutdown`]
    pub fn spawn_reaper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tracing::debug!(
                interval = ?this.config.reap_interval,
                idle_timeout = ?this.config.idle_timeout,
                "idle reaper started"
            );
            loop {
                tokio::select! {
                    () = this.shutdown.notified() => {
                        tracing::debug!("idle reaper stopping");
                        break;
                    }
                    () = tokio::time::sleep(this.config.reap_interval) => {
                        this.reap_idle().await;
                    }
                }
            }
        })
    }

    /// Ask the background reaper to exit
    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }
}

/// Whether an existing sandbox no longer matches its desired configuration
fn drifted(existing: &SandboxInspect, desired: &SandboxSpec) -> bool {
    if existing.network_mode != desired.network_mode {
        return true;
    }
    if !desired.env.iter().all(|e| existing.env.contains(e)) {
        return true;
    }
    if !existing.internal_ports.contains(&desired.preview_port) {
        return true;
    }
    false
}

/// Translate a typed engine failure into a lifecycle error
fn map_engine(op: &str, err: EngineError) -> SandboxError {
    match err.kind {
        EngineErrorKind::Unavailable => SandboxError::EngineUnavailable {
            reason: err.message,
        },
        _ => SandboxError::engine(op, err.message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkPolicy;
    use crate::engine::MockEngine;
    use crate::workspace::RootWorkspaces;
    use std::time::Duration;

    const PROJECT: &str = "a3f1c9d2-4b68-4f0e-9a71-2c54de8b1f03";

    struct Fixture {
        manager: Arc<SandboxManager>,
        engine: Arc<MockEngine>,
        _root: tempfile::TempDir,
    }

    async fn fixture_with(config: SandboxConfig, engine: Arc<MockEngine>) -> Fixture {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join(PROJECT)).unwrap();
        let workspaces = Arc::new(RootWorkspaces::new(root.path()));

        let manager = Arc::new(
            SandboxManager::new(config, engine.clone(), workspaces)
                .await
                .unwrap(),
        );
        Fixture {
            manager,
            engine,
            _root: root,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(SandboxConfig::default(), Arc::new(MockEngine::new())).await
    }

    fn project() -> ProjectId {
        PROJECT.parse().unwrap()
    }

    #[tokio::test]
    async fn test_create_then_reuse() {
        let fx = fixture().await;
        let project = project();

        let handle = fx
            .manager
            .get_or_create(&project, RuntimeKind::Node)
            .await
            .unwrap();
        assert_eq!(handle.name, format!("devbay-{PROJECT}"));
        assert!(fx.engine.is_running(&handle.name).await);
        assert_eq!(fx.engine.create_calls(), 1);
        assert_eq!(fx.engine.pull_calls(), 1);

        let again = fx
            .manager
            .get_or_create(&project, RuntimeKind::Node)
            .await
            .unwrap();
        assert_eq!(again.engine_id, handle.engine_id);
        assert_eq!(fx.engine.create_calls(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_create() {
        let engine = Arc::new(MockEngine::with_create_delay(Duration::from_millis(50)));
        let fx = fixture_with(SandboxConfig::default(), engine).await;
        let project = project();

        let mut tasks = Vec::new();
        for _ in 0..5 {
            let manager = fx.manager.clone();
            let project = project.clone();
            tasks.push(tokio::spawn(async move {
                manager.get_or_create(&project, RuntimeKind::Node).await
            }));
        }

        let mut engine_ids = Vec::new();
        for task in tasks {
            engine_ids.push(task.await.unwrap().unwrap().engine_id);
        }

        assert_eq!(fx.engine.create_calls(), 1);
        assert!(engine_ids.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn test_creation_failure_reaches_all_callers_then_clears() {
        let engine = Arc::new(MockEngine::with_create_delay(Duration::from_millis(20)));
        engine.fail_next_creates(true);
        let fx = fixture_with(SandboxConfig::default(), engine).await;
        let project = project();

        let a = {
            let manager = fx.manager.clone();
            let project = project.clone();
            tokio::spawn(async move { manager.get_or_create(&project, RuntimeKind::Node).await })
        };
        let b = {
            let manager = fx.manager.clone();
            let project = project.clone();
            tokio::spawn(async move { manager.get_or_create(&project, RuntimeKind::Node).await })
        };

        assert!(a.await.unwrap().is_err());
        assert!(b.await.unwrap().is_err());

        // The settled failure must not be cached
        fx.engine.fail_next_creates(false);
        fx.manager
            .get_or_create(&project, RuntimeKind::Node)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_stopped_sandbox_is_restarted_not_recreated() {
        let fx = fixture().await;
        let project = project();

        let handle = fx
            .manager
            .get_or_create(&project, RuntimeKind::Node)
            .await
            .unwrap();
        fx.manager.stop(&project).await.unwrap();
        assert!(!fx.engine.is_running(&handle.name).await);

        fx.manager
            .get_or_create(&project, RuntimeKind::Node)
            .await
            .unwrap();
        assert!(fx.engine.is_running(&handle.name).await);
        assert_eq!(fx.engine.create_calls(), 1);
    }

    #[tokio::test]
    async fn test_drifted_sandbox_is_recreated() {
        let engine = Arc::new(MockEngine::new());
        let fx = fixture_with(SandboxConfig::default(), engine.clone()).await;
        let project = project();
        fx.manager
            .get_or_create(&project, RuntimeKind::Node)
            .await
            .unwrap();

        // Same engine, new manager with a different network policy
        let mut changed = SandboxConfig::default();
        changed.network = NetworkPolicy::None;
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join(PROJECT)).unwrap();
        let manager = Arc::new(
            SandboxManager::new(changed, engine.clone(), Arc::new(RootWorkspaces::new(root.path())))
                .await
                .unwrap(),
        );

        manager
            .get_or_create(&project, RuntimeKind::Node)
            .await
            .unwrap();
        assert_eq!(engine.remove_calls(), 1);
        assert_eq!(engine.create_calls(), 2);

        let sandbox = engine.sandbox(&project.sandbox_name()).await.unwrap();
        assert_eq!(sandbox.spec.network_mode, "none");
    }

    #[tokio::test]
    async fn test_runtime_change_recreates() {
        let fx = fixture().await;
        let project = project();

        fx.manager
            .get_or_create(&project, RuntimeKind::Node)
            .await
            .unwrap();
        fx.manager
            .get_or_create(&project, RuntimeKind::Python)
            .await
            .unwrap();

        assert_eq!(fx.engine.create_calls(), 2);
        let sandbox = fx.engine.sandbox(&project.sandbox_name()).await.unwrap();
        assert!(sandbox.spec.env.contains(&"DEVBAY_RUNTIME=python".to_string()));
    }

    #[tokio::test]
    async fn test_missing_workspace_fails_before_engine_calls() {
        let root = tempfile::tempdir().unwrap();
        let engine = Arc::new(MockEngine::new());
        let manager = Arc::new(
            SandboxManager::new(
                SandboxConfig::default(),
                engine.clone(),
                Arc::new(RootWorkspaces::new(root.path())),
            )
            .await
            .unwrap(),
        );

        let err = manager
            .get_or_create(&project(), RuntimeKind::Node)
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::WorkspaceUnavailable { .. }));
        assert_eq!(engine.create_calls(), 0);
    }

    #[tokio::test]
    async fn test_stop_and_remove_are_idempotent() {
        let fx = fixture().await;
        let project = project();

        // Nothing exists yet
        fx.manager.stop(&project).await.unwrap();
        fx.manager.remove(&project).await.unwrap();

        fx.manager
            .get_or_create(&project, RuntimeKind::Node)
            .await
            .unwrap();
        fx.manager.stop(&project).await.unwrap();
        fx.manager.stop(&project).await.unwrap();
        fx.manager.remove(&project).await.unwrap();
        fx.manager.remove(&project).await.unwrap();

        let status = fx.manager.status(&project).await.unwrap();
        assert!(!status.exists);
    }

    #[tokio::test]
    async fn test_status_reflects_engine_state() {
        let fx = fixture().await;
        let project = project();

        assert_eq!(
            fx.manager.status(&project).await.unwrap(),
            SandboxStatus {
                exists: false,
                running: false
            }
        );

        fx.manager
            .get_or_create(&project, RuntimeKind::Node)
            .await
            .unwrap();
        assert_eq!(
            fx.manager.status(&project).await.unwrap(),
            SandboxStatus {
                exists: true,
                running: true
            }
        );

        fx.manager.stop(&project).await.unwrap();
        assert_eq!(
            fx.manager.status(&project).await.unwrap(),
            SandboxStatus {
                exists: true,
                running: false
            }
        );
    }

    #[tokio::test]
    async fn test_preview_endpoint_tracks_run_state() {
        let fx = fixture().await;
        let project = project();

        let endpoint = fx.manager.preview_endpoint(&project).await.unwrap();
        assert!(!endpoint.available);
        assert_eq!(endpoint.url, None);
        assert_eq!(endpoint.internal_port, 3000);

        fx.manager
            .get_or_create(&project, RuntimeKind::Node)
            .await
            .unwrap();
        let endpoint = fx.manager.preview_endpoint(&project).await.unwrap();
        assert!(endpoint.available);
        let port = endpoint.published_port.unwrap();
        assert_eq!(endpoint.url.as_deref(), Some(&*format!("http://127.0.0.1:{port}")));

        fx.manager.stop(&project).await.unwrap();
        let endpoint = fx.manager.preview_endpoint(&project).await.unwrap();
        assert!(!endpoint.available);
        assert_eq!(endpoint.published_port, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_stops_idle_spares_fresh() {
        let mut config = SandboxConfig::default();
        config.idle_timeout = Duration::from_secs(60);
        let fx = fixture_with(config, Arc::new(MockEngine::new())).await;
        let project = project();

        let handle = fx
            .manager
            .get_or_create(&project, RuntimeKind::Node)
            .await
            .unwrap();

        // Fresh activity, no reap
        tokio::time::advance(Duration::from_secs(30)).await;
        fx.manager.reap_idle().await;
        assert!(fx.engine.is_running(&handle.name).await);

        // mark_used resets the clock
        fx.manager.mark_used(&project);
        tokio::time::advance(Duration::from_secs(45)).await;
        fx.manager.reap_idle().await;
        assert!(fx.engine.is_running(&handle.name).await);

        tokio::time::advance(Duration::from_secs(30)).await;
        fx.manager.reap_idle().await;
        assert!(!fx.engine.is_running(&handle.name).await);
        assert!(fx.manager.tracked_projects().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_reaper_runs_and_shuts_down() {
        let mut config = SandboxConfig::default();
        config.idle_timeout = Duration::from_secs(60);
        config.reap_interval = Duration::from_secs(10);
        let fx = fixture_with(config, Arc::new(MockEngine::new())).await;
        let project = project();

        let handle = fx
            .manager
            .get_or_create(&project, RuntimeKind::Node)
            .await
            .unwrap();
        let reaper = fx.manager.spawn_reaper();
        // Let the spawned reaper register its interval timer before advancing
        tokio::task::yield_now().await;

        tokio::time::advance(Duration::from_secs(90)).await;
        // Let the reaper tick observe the advanced clock
        tokio::task::yield_now().await;
        assert!(!fx.engine.is_running(&handle.name).await);

        fx.manager.shutdown();
        reaper.await.unwrap();
    }
}
