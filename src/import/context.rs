//! Import session state.
//!
//! One [`ImportContext`] exists per migration run. It owns every staging
//! collection, the remote/blob/notifier handles, the target storage, and the
//! scalar progress counters, and it is the only state shared across
//! concurrent pipeline sub-tasks. Every accessor is internally synchronized;
//! callers never take locks of their own.
//!
//! Cancellation is cooperative: `cancel()` flips the finished flag and every
//! pipeline step polls [`ImportContext::check_cancelled`] at its natural
//! checkpoints. In-flight blocking calls are allowed to complete.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::blob::BlobStore;
use crate::config::ImportSettings;
use crate::error::{GantryError, Result};
use crate::model::{
    Comment, FileAsset, Issue, IssueAssignee, IssueLabel, IssueLink, IssueRelation, IssueRelease,
    IssueState, IssueWatcher, Label, Membership, Project, ProjectMember, Release, RelationKind,
    User,
};
use crate::notify::Notifier;
use crate::remote::RemoteTracker;
use crate::storage::SqliteStorage;

use super::staging::{
    AppendList, ChildOrderCounter, DerivedMap, ResolveMap, SharedMap, SharedSet, lock,
};

/// Pipeline stage, for progress reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Fetch,
    Issues,
    Attachments,
    Users,
    Commit,
}

impl Stage {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::Issues => "issues",
            Self::Attachments => "attachments",
            Self::Users => "users",
            Self::Commit => "db",
        }
    }

    /// Weighted progress window for this stage.
    const fn window(self) -> (u8, u8) {
        match self {
            Self::Fetch => (0, 20),
            Self::Issues => (20, 40),
            Self::Attachments => (40, 60),
            Self::Users => (60, 80),
            Self::Commit => (80, 100),
        }
    }
}

/// Terminal state of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Finished,
    Failed(String),
    Cancelled,
}

impl Outcome {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Finished => "finished",
            Self::Failed(_) => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Error text surfaced through the status API; empty on success.
    #[must_use]
    pub fn error_text(&self) -> String {
        match self {
            Self::Finished => String::new(),
            Self::Failed(message) => message.clone(),
            Self::Cancelled => "import cancelled".to_string(),
        }
    }
}

/// Scalar progress counters, all updated with relaxed atomic increments.
#[derive(Debug, Default)]
pub struct Counters {
    pub issues_total: AtomicUsize,
    pub issues_fetched: AtomicUsize,
    pub issues_mapped: AtomicUsize,
    pub attachments_total: AtomicUsize,
    pub attachments_done: AtomicUsize,
    pub users_total: AtomicUsize,
    pub users_done: AtomicUsize,
    pub db_steps_total: AtomicUsize,
    pub db_steps_done: AtomicUsize,
}

impl Counters {
    pub fn incr(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set(counter: &AtomicUsize, value: usize) {
        counter.store(value, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            issues_total: self.issues_total.load(Ordering::Relaxed),
            issues_fetched: self.issues_fetched.load(Ordering::Relaxed),
            issues_mapped: self.issues_mapped.load(Ordering::Relaxed),
            attachments_total: self.attachments_total.load(Ordering::Relaxed),
            attachments_done: self.attachments_done.load(Ordering::Relaxed),
            users_total: self.users_total.load(Ordering::Relaxed),
            users_done: self.users_done.load(Ordering::Relaxed),
            db_steps_total: self.db_steps_total.load(Ordering::Relaxed),
            db_steps_done: self.db_steps_done.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time counter values for status read-back.
#[derive(Debug, Clone, Serialize)]
pub struct CounterSnapshot {
    pub issues_total: usize,
    pub issues_fetched: usize,
    pub issues_mapped: usize,
    pub attachments_total: usize,
    pub attachments_done: usize,
    pub users_total: usize,
    pub users_done: usize,
    pub db_steps_total: usize,
    pub db_steps_done: usize,
}

/// Where an attachment's bytes come from.
#[derive(Debug, Clone)]
pub enum AttachmentSource {
    /// A first-class attachment on the remote tracker.
    Remote { id: String, content_url: String },
    /// An arbitrary external URL discovered in rich text.
    External { url: String },
}

impl AttachmentSource {
    /// Staging dedup key: attachment id when available, else the full URL.
    #[must_use]
    pub fn dedup_key(&self) -> String {
        match self {
            Self::Remote { id, .. } => format!("id:{id}"),
            Self::External { url } => format!("url:{url}"),
        }
    }

    #[must_use]
    pub fn url(&self) -> &str {
        match self {
            Self::Remote { content_url, .. } => content_url,
            Self::External { url } => url,
        }
    }
}

/// A transient record describing one attachment pending transfer.
#[derive(Debug, Clone)]
pub struct AttachmentDescriptor {
    /// Freshly generated destination storage id.
    pub asset_id: Uuid,
    pub source: AttachmentSource,
    pub issue_id: Uuid,
    pub comment_id: Option<Uuid>,
    pub name: String,
    pub content_type: String,
    pub declared_size: u64,
}

/// An attachment that exhausted every transfer attempt.
#[derive(Debug, Clone, Serialize)]
pub struct BadAttachment {
    pub name: String,
    pub source_key: String,
    pub reason: String,
}

/// A relation whose target issue was not yet mapped at discovery time.
/// Resolved (or dropped) by the deferred-resolution step.
#[derive(Debug, Clone)]
pub struct PendingRelation {
    pub kind: RelationKind,
    /// Source key of the issue on the other end.
    pub target_key: String,
    /// Target-side id of the issue the relation was discovered on.
    pub local_id: Uuid,
    /// True when the local issue points outward (for blocks: local blocks
    /// target).
    pub outward: bool,
}

/// Parameters for creating a session.
#[derive(Debug, Clone)]
pub struct ImportRequest {
    pub actor: String,
    pub workspace_id: Uuid,
    pub source_project: String,
}

/// External collaborators handed to a session at creation.
pub struct ImportEnv {
    pub remote: Arc<dyn RemoteTracker>,
    pub blobs: Arc<dyn BlobStore>,
    pub notifier: Arc<dyn Notifier>,
    pub settings: ImportSettings,
}

/// Status read-back for one session.
#[derive(Debug, Clone, Serialize)]
pub struct ImportStatus {
    pub id: Uuid,
    pub actor: String,
    pub workspace_id: Uuid,
    pub source_project: String,
    pub stage: String,
    /// Weighted percentage: fetch 0-20, mapping 20-40, attachments 40-60,
    /// users 60-80, db commit 80-100.
    pub progress: u8,
    pub finished: bool,
    /// Terminal error; empty while running and on success.
    pub error: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub counters: CounterSnapshot,
    pub bad_attachments: Vec<BadAttachment>,
}

/// Mutable aggregate for one import run. See module docs.
pub struct ImportContext {
    pub id: Uuid,
    pub actor: String,
    pub workspace_id: Uuid,
    pub source_project: String,

    remote: Arc<dyn RemoteTracker>,
    blobs: Arc<dyn BlobStore>,
    notifier: Arc<dyn Notifier>,
    storage: Mutex<SqliteStorage>,
    settings: ImportSettings,

    started_at: DateTime<Utc>,
    finished_at: Mutex<Option<DateTime<Utc>>>,
    stage: Mutex<Stage>,
    finished: AtomicBool,
    outcome: Mutex<Option<Outcome>>,
    pub counters: Counters,

    // Staging, all keyed by source-system identifiers.
    users: ResolveMap<String, User>,
    states: ResolveMap<String, IssueState>,
    issue_ids: ResolveMap<String, Uuid>,
    issues: SharedMap<String, Issue>,
    mapping_guard: SharedSet<String>,
    labels: ResolveMap<String, Label>,
    releases: ResolveMap<String, Release>,
    comments: SharedMap<String, Comment>,
    links: AppendList<IssueLink>,
    issue_labels: DerivedMap<IssueLabel>,
    relations: DerivedMap<IssueRelation>,
    pending_relations: AppendList<PendingRelation>,
    assignees: DerivedMap<IssueAssignee>,
    watchers: DerivedMap<IssueWatcher>,
    issue_releases: DerivedMap<IssueRelease>,
    attachments: SharedMap<String, AttachmentDescriptor>,
    stored_assets: SharedMap<Uuid, FileAsset>,
    asset_ids: AppendList<Uuid>,
    bad_attachments: AppendList<BadAttachment>,
    child_order: ChildOrderCounter,
    memberships: AppendList<Membership>,
    project_members: AppendList<ProjectMember>,
    link_type_names: SharedMap<String, String>,
    project: Mutex<Option<Project>>,
}

impl ImportContext {
    #[must_use]
    pub fn new(request: ImportRequest, env: ImportEnv, storage: SqliteStorage) -> Self {
        Self {
            id: Uuid::new_v4(),
            actor: request.actor,
            workspace_id: request.workspace_id,
            source_project: request.source_project,
            remote: env.remote,
            blobs: env.blobs,
            notifier: env.notifier,
            storage: Mutex::new(storage),
            settings: env.settings,
            started_at: Utc::now(),
            finished_at: Mutex::new(None),
            stage: Mutex::new(Stage::Fetch),
            finished: AtomicBool::new(false),
            outcome: Mutex::new(None),
            counters: Counters::default(),
            users: ResolveMap::new(),
            states: ResolveMap::new(),
            issue_ids: ResolveMap::new(),
            issues: SharedMap::new(),
            mapping_guard: SharedSet::new(),
            labels: ResolveMap::new(),
            releases: ResolveMap::new(),
            comments: SharedMap::new(),
            links: AppendList::new(),
            issue_labels: DerivedMap::new(|row: &IssueLabel| {
                format!("{}:{}", row.issue_id, row.label_id)
            }),
            relations: DerivedMap::new(IssueRelation::natural_key),
            pending_relations: AppendList::new(),
            assignees: DerivedMap::new(|row: &IssueAssignee| {
                format!("{}:{}", row.issue_id, row.user_id)
            }),
            watchers: DerivedMap::new(|row: &IssueWatcher| {
                format!("{}:{}", row.issue_id, row.user_id)
            }),
            issue_releases: DerivedMap::new(|row: &IssueRelease| {
                format!("{}:{}", row.issue_id, row.release_id)
            }),
            attachments: SharedMap::new(),
            stored_assets: SharedMap::new(),
            asset_ids: AppendList::new(),
            bad_attachments: AppendList::new(),
            child_order: ChildOrderCounter::new(),
            memberships: AppendList::new(),
            project_members: AppendList::new(),
            link_type_names: SharedMap::new(),
            project: Mutex::new(None),
        }
    }

    // --- collaborators ----------------------------------------------------

    #[must_use]
    pub fn remote(&self) -> &dyn RemoteTracker {
        self.remote.as_ref()
    }

    #[must_use]
    pub fn blobs(&self) -> &dyn BlobStore {
        self.blobs.as_ref()
    }

    #[must_use]
    pub fn notifier(&self) -> &dyn Notifier {
        self.notifier.as_ref()
    }

    /// Lock the target storage handle.
    pub fn storage(&self) -> MutexGuard<'_, SqliteStorage> {
        lock(&self.storage)
    }

    #[must_use]
    pub const fn settings(&self) -> &ImportSettings {
        &self.settings
    }

    // --- lifecycle --------------------------------------------------------

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Cooperative cancellation checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`GantryError::Cancelled`] once the session is finished.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_finished() {
            return Err(GantryError::Cancelled);
        }
        Ok(())
    }

    /// Cancel the session: records the cancelled outcome and best-effort
    /// deletes every blob transferred so far. Idempotent; cancelling a
    /// finished session is a no-op.
    pub fn cancel(&self) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        *lock(&self.outcome) = Some(Outcome::Cancelled);
        *lock(&self.finished_at) = Some(Utc::now());

        for asset_id in self.asset_ids.snapshot() {
            if let Err(e) = self.blobs.delete(asset_id) {
                tracing::warn!(session = %self.id, asset = %asset_id, error = %e,
                    "failed to clean up blob after cancel");
            }
        }
        tracing::info!(session = %self.id, "import cancelled");
    }

    /// Record a terminal outcome. No-op when the session already finished
    /// (a cancel won the race).
    pub fn finish(&self, outcome: Outcome) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        *lock(&self.outcome) = Some(outcome);
        *lock(&self.finished_at) = Some(Utc::now());
    }

    #[must_use]
    pub fn outcome(&self) -> Option<Outcome> {
        lock(&self.outcome).clone()
    }

    pub fn set_stage(&self, stage: Stage) {
        *lock(&self.stage) = stage;
    }

    #[must_use]
    pub fn stage(&self) -> Stage {
        *lock(&self.stage)
    }

    // --- staging accessors ------------------------------------------------

    #[must_use]
    pub const fn users(&self) -> &ResolveMap<String, User> {
        &self.users
    }

    #[must_use]
    pub const fn states(&self) -> &ResolveMap<String, IssueState> {
        &self.states
    }

    /// Source issue key -> target issue id. The resolver for this map must
    /// stay allocation-only (no I/O, no re-entry): see `import::mapper`.
    #[must_use]
    pub const fn issue_ids(&self) -> &ResolveMap<String, Uuid> {
        &self.issue_ids
    }

    #[must_use]
    pub const fn issues(&self) -> &SharedMap<String, Issue> {
        &self.issues
    }

    /// Claim a source issue key for mapping. The first caller gets `true`
    /// and must stage the issue; later callers skip.
    pub fn claim_issue(&self, source_key: &str) -> bool {
        self.mapping_guard.insert(source_key.to_string())
    }

    /// Release a claim after a failed mapping so nothing half-staged keeps
    /// the key reserved.
    pub fn release_issue_claim(&self, source_key: &str) {
        self.mapping_guard.remove(&source_key.to_string());
    }

    #[must_use]
    pub const fn labels(&self) -> &ResolveMap<String, Label> {
        &self.labels
    }

    #[must_use]
    pub const fn releases(&self) -> &ResolveMap<String, Release> {
        &self.releases
    }

    #[must_use]
    pub const fn comments(&self) -> &SharedMap<String, Comment> {
        &self.comments
    }

    #[must_use]
    pub const fn links(&self) -> &AppendList<IssueLink> {
        &self.links
    }

    #[must_use]
    pub const fn issue_labels(&self) -> &DerivedMap<IssueLabel> {
        &self.issue_labels
    }

    #[must_use]
    pub const fn relations(&self) -> &DerivedMap<IssueRelation> {
        &self.relations
    }

    #[must_use]
    pub const fn pending_relations(&self) -> &AppendList<PendingRelation> {
        &self.pending_relations
    }

    #[must_use]
    pub const fn assignees(&self) -> &DerivedMap<IssueAssignee> {
        &self.assignees
    }

    #[must_use]
    pub const fn watchers(&self) -> &DerivedMap<IssueWatcher> {
        &self.watchers
    }

    #[must_use]
    pub const fn issue_releases(&self) -> &DerivedMap<IssueRelease> {
        &self.issue_releases
    }

    #[must_use]
    pub const fn attachments(&self) -> &SharedMap<String, AttachmentDescriptor> {
        &self.attachments
    }

    #[must_use]
    pub const fn stored_assets(&self) -> &SharedMap<Uuid, FileAsset> {
        &self.stored_assets
    }

    #[must_use]
    pub const fn asset_ids(&self) -> &AppendList<Uuid> {
        &self.asset_ids
    }

    #[must_use]
    pub const fn bad_attachments(&self) -> &AppendList<BadAttachment> {
        &self.bad_attachments
    }

    #[must_use]
    pub const fn child_order(&self) -> &ChildOrderCounter {
        &self.child_order
    }

    #[must_use]
    pub const fn memberships(&self) -> &AppendList<Membership> {
        &self.memberships
    }

    #[must_use]
    pub const fn project_members(&self) -> &AppendList<ProjectMember> {
        &self.project_members
    }

    /// Link-type id -> display name, filled by the metadata step.
    #[must_use]
    pub const fn link_type_names(&self) -> &SharedMap<String, String> {
        &self.link_type_names
    }

    pub fn set_project(&self, project: Project) {
        *lock(&self.project) = Some(project);
    }

    #[must_use]
    pub fn project(&self) -> Option<Project> {
        lock(&self.project).clone()
    }

    /// Register an attachment for transfer, deduplicating by source id/URL.
    /// Returns the destination asset id (existing one on a duplicate).
    pub fn register_attachment(
        &self,
        source: AttachmentSource,
        issue_id: Uuid,
        comment_id: Option<Uuid>,
        name: String,
        content_type: String,
        declared_size: u64,
    ) -> Uuid {
        let key = source.dedup_key();
        let descriptor = self.attachments.get_or_insert_with(key, || {
            AttachmentDescriptor {
                asset_id: Uuid::new_v4(),
                source,
                issue_id,
                comment_id,
                name,
                content_type,
                declared_size,
            }
        });
        descriptor.asset_id
    }

    /// Record a successfully transferred blob for durable persistence and
    /// cleanup-on-cancel.
    pub fn record_stored_asset(&self, asset: FileAsset) {
        self.asset_ids.push(asset.id);
        self.stored_assets.insert(asset.id, asset);
    }

    // --- status -----------------------------------------------------------

    /// Weighted progress percentage.
    #[must_use]
    pub fn progress_percent(&self) -> u8 {
        if matches!(self.outcome(), Some(Outcome::Finished)) {
            return 100;
        }
        let stage = self.stage();
        let (base, end) = stage.window();
        let width = f64::from(end - base);
        let c = self.counters.snapshot();

        let fraction = match stage {
            Stage::Fetch => 0.0,
            Stage::Issues => ratio(c.issues_mapped, c.issues_total),
            Stage::Attachments => ratio(c.attachments_done, c.attachments_total),
            Stage::Users => ratio(c.users_done, c.users_total),
            Stage::Commit => ratio(c.db_steps_done, c.db_steps_total),
        };

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let percent = base + (width * fraction) as u8;
        percent.min(end)
    }

    /// Point-in-time status for the read-back API.
    #[must_use]
    pub fn status(&self) -> ImportStatus {
        let error = self.outcome().map(|o| o.error_text()).unwrap_or_default();
        ImportStatus {
            id: self.id,
            actor: self.actor.clone(),
            workspace_id: self.workspace_id,
            source_project: self.source_project.clone(),
            stage: self.stage().as_str().to_string(),
            progress: self.progress_percent(),
            finished: self.is_finished(),
            error,
            started_at: self.started_at,
            finished_at: *lock(&self.finished_at),
            counters: self.counters.snapshot(),
            bad_attachments: self.bad_attachments.snapshot(),
        }
    }

    #[must_use]
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        *lock(&self.finished_at)
    }
}

fn ratio(done: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        (done as f64 / total as f64).min(1.0)
    }
}

impl std::fmt::Debug for ImportContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImportContext")
            .field("id", &self.id)
            .field("actor", &self.actor)
            .field("source_project", &self.source_project)
            .field("stage", &self.stage())
            .field("finished", &self.is_finished())
            .finish_non_exhaustive()
    }
}
