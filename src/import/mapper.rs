//! Entity mappers: one source entity in, one target-shaped entity staged.
//!
//! Mapping is idempotent per source key (a claim guard makes re-mapping a
//! no-op) and resolves every cross-reference through the session's
//! resolve-maps. Users and states fetch-or-fabricate from the remote API
//! inside their resolvers; the issue-id map only allocates UUIDs so parent
//! chains can never re-enter a held lock.
//!
//! Sub-mappers for a single issue (links, attachments, comments, labels,
//! assignees/watchers, releases) run as scoped threads joined before the
//! issue counts as mapped; the first failure fails the whole issue.

use serde_json::json;
use uuid::Uuid;

use crate::error::{GantryError, Result};
use crate::model::{
    Comment, Issue, IssueAssignee, IssueLabel, IssueLink, IssueRelease, IssueState, IssueWatcher,
    Label, Release, RelationKind, StateKind, User,
};
use crate::remote::{RemoteIssue, RemoteStatusCategory, RemoteUser};

use super::context::{AttachmentSource, ImportContext, PendingRelation};
use super::rewrite::{RewriteScope, rewrite_document};

/// Label/state color palette; picked deterministically by name.
const COLORS: &[&str] = &[
    "#4c9aff", "#57d9a3", "#ffab00", "#ff5630", "#6554c0", "#00b8d9", "#36b37e", "#ff7452",
];

pub(crate) fn color_for(name: &str) -> String {
    let sum: usize = name.bytes().map(usize::from).sum();
    COLORS[sum % COLORS.len()].to_string()
}

/// An empty local rich-text document.
pub(crate) fn empty_doc() -> String {
    json!({"type": "doc", "content": []}).to_string()
}

/// Target state kind for a remote status category.
pub(crate) const fn state_kind_of(category: RemoteStatusCategory) -> StateKind {
    match category {
        RemoteStatusCategory::Todo => StateKind::Unstarted,
        RemoteStatusCategory::InProgress => StateKind::Started,
        RemoteStatusCategory::Done => StateKind::Completed,
    }
}

/// Build a target user from a remote account, assigning a fresh id.
pub(crate) fn user_from_remote(remote: &RemoteUser) -> User {
    let email = remote.email.clone().unwrap_or_else(|| {
        // Deactivated cloud accounts hide their email; synthesize a stable,
        // obviously-invalid one so membership rows still dedup by address.
        format!("{}@imported.invalid", remote.account_id)
    });
    User {
        id: Uuid::new_v4(),
        source_id: remote.account_id.clone(),
        name: remote.display_name.clone(),
        email,
        avatar_url: remote.avatar_url.clone(),
        avatar_asset_id: None,
    }
}

/// Resolve a user by remote account id, fetching or fabricating on a miss.
pub(crate) fn resolve_user(ctx: &ImportContext, account_id: &str) -> Result<User> {
    ctx.users()
        .get_or_resolve(&account_id.to_string(), || {
            match ctx.remote().user(account_id)? {
                Some(remote) => Ok(user_from_remote(&remote)),
                None => {
                    tracing::debug!(account = %account_id, "fabricating placeholder for deleted user");
                    Ok(User {
                        id: Uuid::new_v4(),
                        source_id: account_id.to_string(),
                        name: format!("Former user ({account_id})"),
                        email: format!("{account_id}@imported.invalid"),
                        avatar_url: None,
                        avatar_asset_id: None,
                    })
                }
            }
        })
}

/// Resolve a workflow state by remote status id. Normally pre-seeded by the
/// metadata step; fabricated from the status name when the remote uses a
/// status it never enumerated.
pub(crate) fn resolve_state(
    ctx: &ImportContext,
    status_id: &str,
    status_name: &str,
) -> Result<IssueState> {
    let project = ctx
        .project()
        .ok_or_else(|| GantryError::mapping(status_id, "project metadata not fetched yet"))?;
    ctx.states().get_or_resolve(&status_id.to_string(), || {
        Ok(IssueState {
            id: Uuid::new_v4(),
            project_id: project.id,
            name: status_name.to_string(),
            kind: StateKind::Backlog,
            color: color_for(status_name),
            source_id: status_id.to_string(),
        })
    })
}

fn resolve_label(ctx: &ImportContext, name: &str) -> Result<Label> {
    let project = ctx
        .project()
        .ok_or_else(|| GantryError::mapping(name, "project metadata not fetched yet"))?;
    ctx.labels().get_or_resolve(&name.to_string(), || {
        Ok(Label {
            id: Uuid::new_v4(),
            project_id: project.id,
            name: name.to_string(),
            color: color_for(name),
        })
    })
}

fn resolve_release(ctx: &ImportContext, name: &str) -> Result<Release> {
    let project = ctx
        .project()
        .ok_or_else(|| GantryError::mapping(name, "project metadata not fetched yet"))?;
    ctx.releases().get_or_resolve(&name.to_string(), || {
        Ok(Release {
            id: Uuid::new_v4(),
            project_id: project.id,
            name: name.to_string(),
            released: false,
        })
    })
}

/// Map one remote issue into the staging collections.
///
/// Idempotent: mapping an already-mapped key is a no-op. A failure drops the
/// claim so a later attempt (e.g. the deferred-resolution step) can retry.
///
/// # Errors
///
/// Returns a mapping error when any reference resolution or sub-mapper
/// fails; the caller decides whether that is fatal.
pub fn map_issue(ctx: &ImportContext, remote: &RemoteIssue) -> Result<()> {
    if !ctx.claim_issue(&remote.key) {
        return Ok(());
    }
    let result = map_issue_inner(ctx, remote);
    if result.is_err() {
        ctx.release_issue_claim(&remote.key);
    }
    result
}

fn map_issue_inner(ctx: &ImportContext, remote: &RemoteIssue) -> Result<()> {
    let project = ctx
        .project()
        .ok_or_else(|| GantryError::mapping(&remote.key, "project metadata not fetched yet"))?;

    let issue_id = ctx
        .issue_ids()
        .get_or_resolve(&remote.key, || Ok(Uuid::new_v4()))?;

    let state = resolve_state(ctx, &remote.status_id, &remote.status_name)?;
    let created_by = match &remote.reporter_account_id {
        Some(account) => Some(resolve_user(ctx, account)?.id),
        None => None,
    };

    // A parent gets its target id allocated here even if it has not been
    // fetched yet; the deferred-resolution step repairs truly missing ones.
    let parent_id = match &remote.parent_key {
        Some(parent_key) => Some(
            ctx.issue_ids()
                .get_or_resolve(parent_key, || Ok(Uuid::new_v4()))?,
        ),
        None => None,
    };
    let sort_order = parent_id.map_or(0, |parent| ctx.child_order().next(parent));

    let description = remote.description.as_ref().map_or_else(empty_doc, |doc| {
        rewrite_document(
            ctx,
            RewriteScope {
                issue_id,
                comment_id: None,
            },
            doc,
        )
    });

    // The store enforces a 500-character title ceiling.
    let title = if remote.summary.chars().count() > 500 {
        remote.summary.chars().take(497).collect::<String>() + "..."
    } else {
        remote.summary.clone()
    };

    let issue = Issue {
        id: issue_id,
        project_id: project.id,
        number: remote.key_number(),
        title,
        description,
        state_id: state.id,
        priority: ctx.settings().priorities.translate(remote.priority_id.as_deref()),
        parent_id,
        sort_order,
        created_by,
        created_at: remote.created,
        updated_at: remote.updated,
        source_key: remote.key.clone(),
    };

    run_sub_mappers(ctx, issue_id, remote)?;

    ctx.issues().insert(remote.key.clone(), issue);
    Ok(())
}

/// Run the per-issue sub-mappers concurrently and join them; the first
/// error fails the issue.
fn run_sub_mappers(ctx: &ImportContext, issue_id: Uuid, remote: &RemoteIssue) -> Result<()> {
    std::thread::scope(|s| {
        let handles = [
            s.spawn(|| map_links(ctx, issue_id, remote)),
            s.spawn(|| map_attachments(ctx, issue_id, remote)),
            s.spawn(|| map_comments(ctx, issue_id, remote)),
            s.spawn(|| map_labels(ctx, issue_id, remote)),
            s.spawn(|| map_people(ctx, issue_id, remote)),
            s.spawn(|| map_releases(ctx, issue_id, remote)),
        ];

        let mut first_error = None;
        for handle in handles {
            let joined = handle.join().map_err(|_| {
                GantryError::mapping(&remote.key, "sub-mapper panicked")
            });
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) | Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    })
}

fn map_links(ctx: &ImportContext, issue_id: Uuid, remote: &RemoteIssue) -> Result<()> {
    let base = ctx.settings().remote.base_url.trim_end_matches('/').to_string();

    for link in &remote.links {
        let is_blocks = ctx
            .settings()
            .blocks_link_types
            .contains(&link.link_type_id);

        if link.target_project_key != ctx.source_project {
            // Cross-project target: never resolved locally, preserved as an
            // external hyperlink.
            let type_name = ctx
                .link_type_names()
                .get(&link.link_type_id)
                .unwrap_or_else(|| link.link_type_name.clone());
            ctx.links().push(IssueLink {
                id: Uuid::new_v4(),
                issue_id,
                title: format!("{type_name}: {}", link.target_key),
                url: format!("{base}/browse/{}", link.target_key),
            });
            continue;
        }

        let kind = if is_blocks {
            RelationKind::Blocks
        } else {
            RelationKind::Relates
        };
        ctx.pending_relations().push(PendingRelation {
            kind,
            target_key: link.target_key.clone(),
            local_id: issue_id,
            outward: link.outward,
        });
    }
    Ok(())
}

fn map_attachments(ctx: &ImportContext, issue_id: Uuid, remote: &RemoteIssue) -> Result<()> {
    for attachment in &remote.attachments {
        ctx.register_attachment(
            AttachmentSource::Remote {
                id: attachment.id.clone(),
                content_url: attachment.content_url.clone(),
            },
            issue_id,
            None,
            attachment.filename.clone(),
            attachment.mime_type.clone(),
            attachment.size,
        );
    }
    Ok(())
}

fn map_comments(ctx: &ImportContext, issue_id: Uuid, remote: &RemoteIssue) -> Result<()> {
    for remote_comment in &remote.comments {
        if ctx.comments().contains(&remote_comment.id) {
            continue;
        }
        let comment_id = Uuid::new_v4();
        let author_id = match &remote_comment.author_account_id {
            Some(account) => Some(resolve_user(ctx, account)?.id),
            None => None,
        };
        let body = remote_comment.body.as_ref().map_or_else(empty_doc, |doc| {
            rewrite_document(
                ctx,
                RewriteScope {
                    issue_id,
                    comment_id: Some(comment_id),
                },
                doc,
            )
        });
        ctx.comments().insert(
            remote_comment.id.clone(),
            Comment {
                id: comment_id,
                issue_id,
                author_id,
                body,
                created_at: remote_comment.created,
                updated_at: remote_comment.updated,
                source_id: remote_comment.id.clone(),
            },
        );
    }
    Ok(())
}

fn map_labels(ctx: &ImportContext, issue_id: Uuid, remote: &RemoteIssue) -> Result<()> {
    for name in &remote.labels {
        let label = resolve_label(ctx, name)?;
        ctx.issue_labels().insert(IssueLabel {
            issue_id,
            label_id: label.id,
        });
    }
    Ok(())
}

/// Assignee and watcher rows for one issue.
fn map_people(ctx: &ImportContext, issue_id: Uuid, remote: &RemoteIssue) -> Result<()> {
    if let Some(account) = &remote.assignee_account_id {
        let user = resolve_user(ctx, account)?;
        ctx.assignees().insert(IssueAssignee {
            issue_id,
            user_id: user.id,
        });
    }

    for account in ctx.remote().watchers(&remote.key)? {
        let user = resolve_user(ctx, &account)?;
        ctx.watchers().insert(IssueWatcher {
            issue_id,
            user_id: user.id,
        });
    }
    Ok(())
}

fn map_releases(ctx: &ImportContext, issue_id: Uuid, remote: &RemoteIssue) -> Result<()> {
    for name in &remote.fix_versions {
        let release = resolve_release(ctx, name)?;
        ctx.issue_releases().insert(IssueRelease {
            issue_id,
            release_id: release.id,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn color_is_deterministic_and_in_palette() {
        assert_eq!(color_for("infra"), color_for("infra"));
        assert!(COLORS.contains(&color_for("anything").as_str()));
    }

    #[test]
    fn state_kinds_follow_categories() {
        assert_eq!(state_kind_of(RemoteStatusCategory::Todo), StateKind::Unstarted);
        assert_eq!(
            state_kind_of(RemoteStatusCategory::InProgress),
            StateKind::Started
        );
        assert_eq!(state_kind_of(RemoteStatusCategory::Done), StateKind::Completed);
    }

    #[test]
    fn missing_email_is_synthesized() {
        let remote = RemoteUser {
            account_id: "abc123".to_string(),
            display_name: "Ada".to_string(),
            email: None,
            avatar_url: None,
            active: false,
        };
        let user = user_from_remote(&remote);
        assert_eq!(user.email, "abc123@imported.invalid");
        assert_eq!(user.source_id, "abc123");
    }
}
