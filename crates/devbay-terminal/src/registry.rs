//! Terminal session registry
//!
//! One [`SessionRegistry`] per process wires browser-facing terminal
//! connections to attached sandbox shells. It enforces per-project and
//! per-user session caps before touching the engine, tracks every live
//! session in by-project and by-user indexes, and runs one relay task per
//! session until either side closes.
//!
//! All three tables live behind a single lock and every mutation happens
//! under one acquisition, so a cap check and its reservation are atomic.

use crate::config::{ConfigError, TerminalConfig};
use crate::session::{
    CloseReason, OpenError, SessionEvent, SessionId, TerminalSession, UserId,
};
use bytes::Bytes;
use devbay_sandbox::{
    AttachConnector, ProjectId, RuntimeKind, SandboxError, SandboxManager, ShellIo,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};

/// Reserved client payload answered locally and never forwarded to the shell
pub const HEARTBEAT_PAYLOAD: &[u8] = b"__devbay_ping__";

/// Client-to-shell channel depth
const INPUT_BUFFER: usize = 64;

/// Shell-to-client channel depth
const EVENT_BUFFER: usize = 256;

/// Read chunk size for shell output
const RELAY_BUF: usize = 8 * 1024;

struct SessionRecord {
    project: ProjectId,
    user: UserId,
    /// Taken by cap-enforcement eviction; the relay holds the receiver
    evict: Option<oneshot::Sender<CloseReason>>,
}

#[derive(Default)]
struct Tables {
    sessions: HashMap<SessionId, SessionRecord>,
    by_project: HashMap<ProjectId, HashSet<SessionId>>,
    by_user: HashMap<UserId, HashSet<SessionId>>,
}

/// Registry of live terminal sessions
pub struct SessionRegistry {
    manager: Arc<SandboxManager>,
    connector: Arc<dyn AttachConnector>,
    config: TerminalConfig,
    tables: Mutex<Tables>,
}

impl SessionRegistry {
    /// Create a registry after validating its configuration.
    ///
    /// # Errors
    ///
    /// Fails when either session cap is zero.
    pub fn new(
        manager: Arc<SandboxManager>,
        connector: Arc<dyn AttachConnector>,
        config: TerminalConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            manager,
            connector,
            config,
            tables: Mutex::new(Tables::default()),
        })
    }

    /// Open a terminal session for a project on behalf of a user.
    ///
    /// Caps are checked and the session slot reserved before any engine work;
    /// a rejected open leaves no tracking state behind. On success a relay
    /// task runs until the client disconnects, the shell exits, or the
    /// session is evicted.
    pub async fn open(
        self: &Arc<Self>,
        project: &ProjectId,
        user: &UserId,
        runtime: RuntimeKind,
    ) -> Result<TerminalSession, OpenError> {
        let (id, evict_rx) = self.reserve(project, user)?;

        let io = match self.open_shell(project, runtime).await {
            Ok(io) => io,
            Err(e) => {
                self.release(id);
                tracing::warn!(
                    project = %project,
                    user = %user,
                    reason = e.close_reason().as_str(),
                    error = %e,
                    "terminal open rejected"
                );
                return Err(e);
            }
        };

        let (input_tx, input_rx) = mpsc::channel(INPUT_BUFFER);
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);

        tokio::spawn(Arc::clone(self).relay(id, project.clone(), io, input_rx, events_tx, evict_rx));

        tracing::info!(session = %id, project = %project, user = %user, "terminal session opened");
        Ok(TerminalSession {
            id,
            project: project.clone(),
            user: user.clone(),
            input: input_tx,
            events: events_rx,
        })
    }

    /// Live session count for a project
    #[must_use]
    pub fn session_count_for_project(&self, project: &ProjectId) -> usize {
        self.tables
            .lock()
            .by_project
            .get(project)
            .map_or(0, HashSet::len)
    }

    /// Live session count for a user
    #[must_use]
    pub fn session_count_for_user(&self, user: &UserId) -> usize {
        self.tables.lock().by_user.get(user).map_or(0, HashSet::len)
    }

    /// Ask one session's relay to close with the given reason; returns false
    /// when the session is already gone
    pub fn evict_session(&self, id: SessionId, reason: CloseReason) -> bool {
        let sender = {
            let mut tables = self.tables.lock();
            tables.sessions.get_mut(&id).and_then(|r| r.evict.take())
        };
        match sender {
            Some(tx) => tx.send(reason).is_ok(),
            None => false,
        }
    }

    /// Evict every session of a project, returning how many were signalled
    pub fn evict_project(&self, project: &ProjectId, reason: CloseReason) -> usize {
        let senders: Vec<_> = {
            let mut tables = self.tables.lock();
            let ids: Vec<SessionId> = tables
                .by_project
                .get(project)
                .map(|set| set.iter().copied().collect())
                .unwrap_or_default();
            ids.into_iter()
                .filter_map(|id| tables.sessions.get_mut(&id).and_then(|r| r.evict.take()))
                .collect()
        };

        // A receiver that is already gone means that relay is mid-teardown
        senders
            .into_iter()
            .filter(|tx| !tx.is_closed())
            .filter_map(|tx| tx.send(reason).ok())
            .count()
    }

    /// Atomically check both caps and reserve a session slot
    fn reserve(
        &self,
        project: &ProjectId,
        user: &UserId,
    ) -> Result<(SessionId, oneshot::Receiver<CloseReason>), OpenError> {
        let mut tables = self.tables.lock();

        let project_count = tables.by_project.get(project).map_or(0, HashSet::len);
        if project_count >= self.config.max_sessions_per_project {
            return Err(OpenError::ProjectCapReached {
                project: project.clone(),
            });
        }

        let user_count = tables.by_user.get(user).map_or(0, HashSet::len);
        if user_count >= self.config.max_sessions_per_user {
            return Err(OpenError::UserCapReached { user: user.clone() });
        }

        let id = SessionId::generate();
        let (evict_tx, evict_rx) = oneshot::channel();
        tables.sessions.insert(
            id,
            SessionRecord {
                project: project.clone(),
                user: user.clone(),
                evict: Some(evict_tx),
            },
        );
        tables.by_project.entry(project.clone()).or_default().insert(id);
        tables.by_user.entry(user.clone()).or_default().insert(id);

        Ok((id, evict_rx))
    }

    /// Drop a session from all tables; safe to call from any teardown path,
    /// including repeatedly
    fn release(&self, id: SessionId) {
        let mut tables = self.tables.lock();
        let Some(record) = tables.sessions.remove(&id) else {
            return;
        };

        if let Some(set) = tables.by_project.get_mut(&record.project) {
            set.remove(&id);
            if set.is_empty() {
                tables.by_project.remove(&record.project);
            }
        }
        if let Some(set) = tables.by_user.get_mut(&record.user) {
            set.remove(&id);
            if set.is_empty() {
                tables.by_user.remove(&record.user);
            }
        }
    }

    /// Produce an attached shell for a running sandbox
    async fn open_shell(
        &self,
        project: &ProjectId,
        runtime: RuntimeKind,
    ) -> Result<Box<dyn ShellIo>, OpenError> {
        let handle = self.manager.get_or_create(project, runtime).await?;

        let status = self.manager.status(project).await?;
        if !status.running {
            return Err(OpenError::Lifecycle(SandboxError::NotRunning {
                project: project.to_string(),
            }));
        }

        let io = self.connector.attach_shell(&handle.engine_id).await?;
        self.manager.mark_used(project);
        Ok(io)
    }

    /// Per-session relay: shell output to events, client input to the shell,
    /// until either side ends or the session is evicted
    async fn relay(
        self: Arc<Self>,
        id: SessionId,
        project: ProjectId,
        io: Box<dyn ShellIo>,
        mut input_rx: mpsc::Receiver<Bytes>,
        events_tx: mpsc::Sender<SessionEvent>,
        mut evict_rx: oneshot::Receiver<CloseReason>,
    ) {
        let (mut shell_out, mut shell_in) = tokio::io::split(io);
        let mut buf = vec![0u8; RELAY_BUF];

        let reason = loop {
            tokio::select! {
                read = shell_out.read(&mut buf) => match read {
                    Ok(0) => break CloseReason::ShellExited,
                    Ok(n) => {
                        let chunk = Bytes::copy_from_slice(&buf[..n]);
                        if events_tx.send(SessionEvent::Data(chunk)).await.is_err() {
                            break CloseReason::Normal;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(session = %id, error = %e, "shell stream error");
                        break CloseReason::ShellExited;
                    }
                },
                input = input_rx.recv() => match input {
                    None => break CloseReason::Normal,
                    Some(data) if data.as_ref() == HEARTBEAT_PAYLOAD => {}
                    Some(data) => {
                        if shell_in.write_all(&data).await.is_err() {
                            break CloseReason::ShellExited;
                        }
                    }
                },
                evicted = &mut evict_rx => {
                    break evicted.unwrap_or(CloseReason::Normal);
                }
            }
        };

        // An open-looking but mute connection is never acceptable: always
        // deliver the close reason before the tables forget the session.
        let _ = events_tx.send(SessionEvent::Closed(reason)).await;
        self.release(id);
        let _ = shell_in.shutdown().await;

        // A dead shell means the sandbox is no longer useful; a client
        // disconnect leaves it running for reconnection.
        if reason == CloseReason::ShellExited {
            if let Err(e) = self.manager.stop(&project).await {
                tracing::warn!(project = %project, error = %e, "failed to stop sandbox after shell exit");
            }
        }

        tracing::info!(
            session = %id,
            project = %project,
            reason = reason.as_str(),
            "terminal session closed"
        );
    }
}
