//! Fire-and-forget notification boundary.
//!
//! Import start/finish messages are best-effort: a failing notifier is
//! logged and never fails a pipeline step, so the trait is infallible by
//! construction and implementations swallow their own errors.

/// Outbound notifications emitted around an import session.
pub trait Notifier: Send + Sync {
    /// An import of `source_project` was started by `actor`.
    fn import_started(&self, source_project: &str, actor: &str);

    /// The import reached a terminal state (`finished`, `failed`, or
    /// `cancelled`).
    fn import_finished(&self, source_project: &str, actor: &str, outcome: &str);
}

/// Default notifier: writes structured log events.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn import_started(&self, source_project: &str, actor: &str) {
        tracing::info!(project = %source_project, actor = %actor, "import started");
    }

    fn import_finished(&self, source_project: &str, actor: &str, outcome: &str) {
        tracing::info!(
            project = %source_project,
            actor = %actor,
            outcome = %outcome,
            "import finished"
        );
    }
}
