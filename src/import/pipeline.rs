//! Pipeline steps and driver.
//!
//! A fixed ordered list of steps, each `fn(&ImportContext) -> Result<()>`.
//! The driver runs them strictly sequentially, checking the finished flag
//! before each; a step error or cancellation aborts the remaining steps.
//!
//! The staging is deliberate: several steps have data dependencies that can
//! only be satisfied after a full pass over the issues completes (e.g. a
//! "blocked by" relation referencing an issue that was not yet mapped when
//! the relation was discovered).

use std::collections::HashSet;

use chrono::Utc;
use uuid::Uuid;

use crate::blob::BlobMetadata;
use crate::error::Result;
use crate::model::{
    FileAsset, IssueRelation, IssueState, Membership, Project, ProjectMember, Role,
};

use super::commit;
use super::context::{Counters, ImportContext, Stage};
use super::mapper;
use super::transfer;

/// One pipeline step.
pub struct Step {
    pub name: &'static str,
    pub stage: Stage,
    pub run: fn(&ImportContext) -> Result<()>,
}

/// The fixed step order.
pub const STEPS: &[Step] = &[
    Step {
        name: "fetch_users",
        stage: Stage::Fetch,
        run: fetch_users,
    },
    Step {
        name: "fetch_project",
        stage: Stage::Fetch,
        run: fetch_project,
    },
    Step {
        name: "notify_started",
        stage: Stage::Fetch,
        run: notify_started,
    },
    Step {
        name: "fetch_and_map_issues",
        stage: Stage::Issues,
        run: fetch_and_map_issues,
    },
    Step {
        name: "transfer_attachments",
        stage: Stage::Attachments,
        run: transfer::transfer_attachments,
    },
    Step {
        name: "resolve_deferred",
        stage: Stage::Attachments,
        run: resolve_deferred,
    },
    Step {
        name: "prepare_memberships",
        stage: Stage::Users,
        run: prepare_memberships,
    },
    Step {
        name: "import_avatars",
        stage: Stage::Users,
        run: import_avatars,
    },
    Step {
        name: "commit",
        stage: Stage::Commit,
        run: commit::commit_import,
    },
];

/// Run every step in order. Returns the first error; the caller records the
/// terminal outcome.
///
/// # Errors
///
/// Propagates the first step failure or cancellation.
pub fn run_pipeline(ctx: &ImportContext) -> Result<()> {
    for step in STEPS {
        ctx.check_cancelled()?;
        ctx.set_stage(step.stage);
        tracing::debug!(session = %ctx.id, step = step.name, "running pipeline step");
        (step.run)(ctx)?;
    }
    Ok(())
}

/// Fetch every user assignable in the source project, deduplicating by
/// email, and pre-seed the user resolve-map.
fn fetch_users(ctx: &ImportContext) -> Result<()> {
    let page_size = ctx.settings().page_size;
    let mut start_at = 0;
    let mut seen_emails: HashSet<String> = HashSet::new();

    loop {
        ctx.check_cancelled()?;
        let page = ctx
            .remote()
            .assignable_users(&ctx.source_project, start_at, page_size)?;

        for remote_user in &page.items {
            let user = mapper::user_from_remote(remote_user);
            if !seen_emails.insert(user.email.clone()) {
                continue;
            }
            ctx.users()
                .get_or_resolve(&remote_user.account_id, || Ok(user))?;
        }
        Counters::set(&ctx.counters.users_total, ctx.users().len());

        if page.is_last() {
            break;
        }
        start_at = page.next_start();
    }

    tracing::info!(session = %ctx.id, users = ctx.users().len(), "fetched project users");
    Ok(())
}

/// Fetch project metadata, pre-seed the state resolve-map from the status
/// enumeration, and remember link-type display names.
fn fetch_project(ctx: &ImportContext) -> Result<()> {
    let remote_project = ctx.remote().project(&ctx.source_project)?;

    let project = Project {
        id: Uuid::new_v4(),
        workspace_id: ctx.workspace_id,
        key: remote_project.key.clone(),
        name: remote_project.name,
        description: remote_project.description.unwrap_or_default(),
        source_key: remote_project.key,
        created_at: Utc::now(),
    };
    let project_id = project.id;
    ctx.set_project(project);

    for status in ctx.remote().statuses(&ctx.source_project)? {
        ctx.states().get_or_resolve(&status.id, || {
            Ok(IssueState {
                id: Uuid::new_v4(),
                project_id,
                name: status.name.clone(),
                kind: mapper::state_kind_of(status.category),
                color: mapper::color_for(&status.name),
                source_id: status.id.clone(),
            })
        })?;
    }

    for link_type in ctx.remote().link_types()? {
        ctx.link_type_names().insert(link_type.id, link_type.name);
    }

    Ok(())
}

/// Best-effort "import started" notification; never fatal.
#[allow(clippy::unnecessary_wraps)]
fn notify_started(ctx: &ImportContext) -> Result<()> {
    ctx.notifier().import_started(&ctx.source_project, &ctx.actor);
    Ok(())
}

/// Fetch all issues page by page and map each one. A mapping failure drops
/// that issue and continues; a fetch failure aborts the pipeline.
fn fetch_and_map_issues(ctx: &ImportContext) -> Result<()> {
    let page_size = ctx.settings().page_size;
    let mut start_at = 0;

    loop {
        ctx.check_cancelled()?;
        let page = ctx
            .remote()
            .search_issues(&ctx.source_project, start_at, page_size)?;
        Counters::set(
            &ctx.counters.issues_total,
            usize::try_from(page.total).unwrap_or(usize::MAX),
        );

        for remote_issue in &page.items {
            ctx.check_cancelled()?;
            Counters::incr(&ctx.counters.issues_fetched);
            match mapper::map_issue(ctx, remote_issue) {
                Ok(()) => Counters::incr(&ctx.counters.issues_mapped),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        session = %ctx.id,
                        issue = %remote_issue.key,
                        error = %e,
                        "issue mapping failed; dropping issue"
                    );
                }
            }
        }

        if page.is_last() {
            break;
        }
        start_at = page.next_start();
    }

    tracing::info!(
        session = %ctx.id,
        mapped = ctx.issues().len(),
        "mapped project issues"
    );
    Ok(())
}

/// Resolve deferred cross-issue work now that the full pass is done:
/// fetch-and-map issues that were only ever forward-referenced, then turn
/// pending relations into concrete rows. A relation whose target still
/// cannot be mapped is dropped, never committed with a dangling id.
fn resolve_deferred(ctx: &ImportContext) -> Result<()> {
    for (source_key, _) in ctx.issue_ids().snapshot() {
        if ctx.issues().contains(&source_key) {
            continue;
        }
        ctx.check_cancelled()?;
        let mapped = ctx
            .remote()
            .issue(&source_key)
            .and_then(|remote_issue| mapper::map_issue(ctx, &remote_issue));
        match mapped {
            Ok(()) => {
                Counters::incr(&ctx.counters.issues_mapped);
                tracing::debug!(session = %ctx.id, issue = %source_key,
                    "imported forward-referenced issue");
            }
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                tracing::warn!(session = %ctx.id, issue = %source_key, error = %e,
                    "forward-referenced issue could not be imported; relations to it will be dropped");
            }
        }
    }

    let mut resolved = 0usize;
    let mut dropped = 0usize;
    for pending in ctx.pending_relations().drain() {
        let Some(target) = ctx.issues().get(&pending.target_key) else {
            dropped += 1;
            continue;
        };
        let (issue_id, related_id) = if pending.outward {
            (pending.local_id, target.id)
        } else {
            (target.id, pending.local_id)
        };
        if issue_id == related_id {
            continue;
        }
        ctx.relations().insert(IssueRelation {
            issue_id,
            related_id,
            kind: pending.kind,
        });
        resolved += 1;
    }

    tracing::info!(session = %ctx.id, resolved, dropped, "resolved deferred relations");
    Ok(())
}

/// Compute workspace membership (create-if-absent against the target store)
/// and project membership rows for every discovered user.
fn prepare_memberships(ctx: &ImportContext) -> Result<()> {
    let Some(project) = ctx.project() else {
        return Ok(());
    };

    let users = ctx.users().values();
    Counters::set(&ctx.counters.users_total, users.len());

    let storage = ctx.storage();
    for user in users {
        ctx.check_cancelled()?;
        if !storage.has_membership(ctx.workspace_id, user.id)? {
            ctx.memberships().push(Membership {
                workspace_id: ctx.workspace_id,
                user_id: user.id,
                role: Role::Member,
            });
        }
        ctx.project_members().push(ProjectMember {
            project_id: project.id,
            user_id: user.id,
            role: Role::Member,
        });
        Counters::incr(&ctx.counters.users_done);
    }
    Ok(())
}

/// Import user avatars into blob storage. Best-effort per user; a failed
/// avatar download never fails the import.
fn import_avatars(ctx: &ImportContext) -> Result<()> {
    if !ctx.settings().import_avatars {
        return Ok(());
    }

    for (account_id, mut user) in ctx.users().snapshot() {
        ctx.check_cancelled()?;
        let Some(url) = user.avatar_url.clone() else {
            continue;
        };

        let fetched = ctx.remote().fetch_content(&url);
        let (bytes, content_type) = match fetched {
            Ok(ok) => ok,
            Err(e) => {
                tracing::debug!(session = %ctx.id, user = %user.name, error = %e,
                    "avatar download failed");
                continue;
            }
        };

        let asset_id = Uuid::new_v4();
        let content_type =
            content_type.unwrap_or_else(|| "application/octet-stream".to_string());
        let metadata = BlobMetadata {
            workspace_id: ctx.workspace_id,
            project_id: ctx.project().map(|p| p.id),
            issue_id: None,
            comment_id: None,
            source: format!("avatar:{account_id}"),
        };

        match ctx.blobs().save(
            &mut bytes.as_slice(),
            bytes.len() as u64,
            asset_id,
            &content_type,
            &metadata,
        ) {
            Ok(stored) => {
                ctx.record_stored_asset(FileAsset {
                    id: stored.id,
                    workspace_id: ctx.workspace_id,
                    name: format!("avatar-{}", user.source_id),
                    content_type,
                    size: i64::try_from(stored.size).unwrap_or(i64::MAX),
                    content_hash: Some(stored.content_hash),
                    created_at: Utc::now(),
                });
                user.avatar_asset_id = Some(asset_id);
                ctx.users().insert(account_id, user);
            }
            Err(e) => {
                tracing::debug!(session = %ctx.id, user = %user.name, error = %e,
                    "avatar store failed");
            }
        }
    }
    Ok(())
}
