//! Import registry/supervisor.
//!
//! Tracks all in-flight and recently finished import sessions, keyed by
//! synthetic session id. Enforces one active import per actor, supports
//! cancellation (idempotent) and workspace-wide bulk cancellation, and
//! periodically purges finished sessions older than the retention window.
//!
//! The registry is an explicit supervisor object injected into request
//! handlers at startup - process-local state, not the durable store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use uuid::Uuid;

use crate::error::{GantryError, Result};
use crate::storage::SqliteStorage;

use super::context::{ImportContext, ImportEnv, ImportRequest, ImportStatus, Outcome};
use super::pipeline;
use super::staging::lock;

/// How long finished sessions are retained before the sweep purges them.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);
/// How often the background sweep runs.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Supervisor for import sessions.
pub struct ImportRegistry {
    sessions: Mutex<HashMap<Uuid, Arc<ImportContext>>>,
    retention: Duration,
    shutdown: AtomicBool,
    sweeper: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl ImportRegistry {
    /// Create a registry with the default retention window.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_retention(DEFAULT_RETENTION)
    }

    /// Create a registry with a custom retention window.
    #[must_use]
    pub fn with_retention(retention: Duration) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            retention,
            shutdown: AtomicBool::new(false),
            sweeper: Mutex::new(None),
        })
    }

    /// Start the background sweep thread. Call once at startup.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) -> Result<()> {
        let registry = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("import-sweep".to_string())
            .spawn(move || {
                while !registry.shutdown.load(Ordering::Acquire) {
                    // Sleep in short slices so shutdown is prompt.
                    let mut remaining = interval;
                    while !remaining.is_zero() && !registry.shutdown.load(Ordering::Acquire) {
                        let slice = remaining.min(Duration::from_millis(50));
                        std::thread::sleep(slice);
                        remaining = remaining.saturating_sub(slice);
                    }
                    if registry.shutdown.load(Ordering::Acquire) {
                        break;
                    }
                    registry.sweep();
                }
            })?;
        *lock(&self.sweeper) = Some(handle);
        Ok(())
    }

    /// Stop the sweep thread.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = lock(&self.sweeper).take() {
            let _ = handle.join();
        }
    }

    /// Create a session and start its pipeline on a background thread.
    ///
    /// # Errors
    ///
    /// Returns [`GantryError::AlreadyImporting`] if the actor already has a
    /// non-finished import, or an I/O error if the session thread cannot be
    /// spawned.
    pub fn begin_import(
        &self,
        request: ImportRequest,
        env: ImportEnv,
        storage: SqliteStorage,
    ) -> Result<Uuid> {
        let ctx = {
            let mut sessions = lock(&self.sessions);
            if sessions
                .values()
                .any(|session| session.actor == request.actor && !session.is_finished())
            {
                return Err(GantryError::AlreadyImporting {
                    actor: request.actor,
                });
            }
            let ctx = Arc::new(ImportContext::new(request, env, storage));
            sessions.insert(ctx.id, Arc::clone(&ctx));
            ctx
        };

        let id = ctx.id;
        std::thread::Builder::new()
            .name(format!("import-{id}"))
            .spawn(move || run_session(&ctx))?;

        tracing::info!(session = %id, "import session created");
        Ok(id)
    }

    /// Status read-back for one session.
    ///
    /// # Errors
    ///
    /// Returns [`GantryError::SessionNotFound`] for unknown ids.
    pub fn status(&self, id: Uuid) -> Result<ImportStatus> {
        lock(&self.sessions)
            .get(&id)
            .map(|session| session.status())
            .ok_or_else(|| GantryError::SessionNotFound { id: id.to_string() })
    }

    /// The underlying session handle, for embedding applications.
    #[must_use]
    pub fn session(&self, id: Uuid) -> Option<Arc<ImportContext>> {
        lock(&self.sessions).get(&id).cloned()
    }

    /// All sessions for one actor, oldest first.
    #[must_use]
    pub fn list_for_actor(&self, actor: &str) -> Vec<ImportStatus> {
        let mut statuses: Vec<ImportStatus> = lock(&self.sessions)
            .values()
            .filter(|session| session.actor == actor)
            .map(|session| session.status())
            .collect();
        statuses.sort_by_key(|status| status.started_at);
        statuses
    }

    /// All non-finished sessions, oldest first, with actor detail attached.
    #[must_use]
    pub fn list_active(&self) -> Vec<ImportStatus> {
        let mut statuses: Vec<ImportStatus> = lock(&self.sessions)
            .values()
            .filter(|session| !session.is_finished())
            .map(|session| session.status())
            .collect();
        statuses.sort_by_key(|status| status.started_at);
        statuses
    }

    /// Cancel a session. Idempotent: cancelling an already-finished session
    /// is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`GantryError::SessionNotFound`] for unknown ids.
    pub fn cancel(&self, id: Uuid) -> Result<()> {
        let session = lock(&self.sessions)
            .get(&id)
            .cloned()
            .ok_or_else(|| GantryError::SessionNotFound { id: id.to_string() })?;
        session.cancel();
        Ok(())
    }

    /// Cancel every active session targeting a workspace (e.g. on workspace
    /// deletion). Returns how many sessions were cancelled.
    pub fn cancel_workspace(&self, workspace_id: Uuid) -> usize {
        let targets: Vec<Arc<ImportContext>> = lock(&self.sessions)
            .values()
            .filter(|session| session.workspace_id == workspace_id && !session.is_finished())
            .cloned()
            .collect();
        for session in &targets {
            session.cancel();
        }
        targets.len()
    }

    /// Purge finished sessions older than the retention window.
    pub fn sweep(&self) {
        let retention = chrono::Duration::from_std(self.retention)
            .unwrap_or_else(|_| chrono::Duration::hours(24));
        let cutoff = chrono::Utc::now() - retention;

        let mut sessions = lock(&self.sessions);
        let before = sessions.len();
        sessions.retain(|_, session| {
            session
                .finished_at()
                .is_none_or(|finished_at| finished_at > cutoff)
        });
        let purged = before - sessions.len();
        if purged > 0 {
            tracing::debug!(purged, "swept finished import sessions");
        }
    }

    /// Block until the session reaches a terminal state or `timeout`
    /// elapses; returns the final status.
    ///
    /// # Errors
    ///
    /// Returns [`GantryError::SessionNotFound`] for unknown ids, or a config
    /// error on timeout.
    pub fn wait_finished(&self, id: Uuid, timeout: Duration) -> Result<ImportStatus> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let status = self.status(id)?;
            if status.finished {
                return Ok(status);
            }
            if std::time::Instant::now() >= deadline {
                return Err(GantryError::Config(format!(
                    "import session {id} still running after {timeout:?}"
                )));
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

impl Drop for ImportRegistry {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = lock(&self.sweeper).take() {
            let _ = handle.join();
        }
    }
}

fn run_session(ctx: &Arc<ImportContext>) {
    let result = pipeline::run_pipeline(ctx);
    let outcome = match result {
        Ok(()) => Outcome::Finished,
        Err(e) if e.is_cancelled() => Outcome::Cancelled,
        Err(e) => {
            tracing::error!(session = %ctx.id, error = %e, "import failed");
            Outcome::Failed(e.to_string())
        }
    };
    // A cancel may have recorded the terminal state already; finish() is a
    // no-op in that case.
    ctx.finish(outcome);

    let terminal = ctx
        .outcome()
        .map_or("finished", |outcome| outcome.name());
    ctx.notifier()
        .import_finished(&ctx.source_project, &ctx.actor, terminal);
}
