//! Transactional commit stage.
//!
//! Flushes the entire staged graph into `SQLite` as one indivisible
//! transaction. Sub-steps run in strict dependency order; any failure rolls
//! everything back and the import is marked failed, so the store never holds
//! a partial import.
//!
//! Issues are inserted parent-before-child (the self-referencing foreign key
//! rejects anything else); rows staged for issues that were ultimately
//! dropped are filtered out here rather than committed dangling.

use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use crate::error::{GantryError, Result};
use crate::model::{Attachment, Issue, IssueState};
use crate::storage::sqlite;

use super::context::{Counters, ImportContext};

/// Order issues so every parent precedes its children, and clear parent
/// references that point outside the set (their relation was already
/// dropped by the deferred-resolution step).
#[must_use]
pub fn order_for_insert(mut issues: Vec<Issue>) -> Vec<Issue> {
    let known: HashSet<Uuid> = issues.iter().map(|issue| issue.id).collect();
    for issue in &mut issues {
        if let Some(parent) = issue.parent_id {
            if !known.contains(&parent) {
                tracing::warn!(
                    issue = %issue.source_key,
                    "dropping parent reference to an issue that was not imported"
                );
                issue.parent_id = None;
                issue.sort_order = 0;
            }
        }
    }

    let parents: HashMap<Uuid, Option<Uuid>> = issues
        .iter()
        .map(|issue| (issue.id, issue.parent_id))
        .collect();

    let mut depths: HashMap<Uuid, usize> = HashMap::new();
    for issue in &issues {
        depth_of(issue.id, &parents, &mut depths);
    }

    issues.sort_by(|a, b| {
        depths
            .get(&a.id)
            .cmp(&depths.get(&b.id))
            .then_with(|| a.number.cmp(&b.number))
            .then_with(|| a.source_key.cmp(&b.source_key))
    });
    issues
}

fn depth_of(
    id: Uuid,
    parents: &HashMap<Uuid, Option<Uuid>>,
    depths: &mut HashMap<Uuid, usize>,
) -> usize {
    if let Some(&depth) = depths.get(&id) {
        return depth;
    }
    // Walk up toward the root; a malformed parent cycle terminates at the
    // chain length instead of looping.
    let mut chain = Vec::new();
    let mut current = id;
    let depth = loop {
        match parents.get(&current).copied().flatten() {
            Some(parent) if !chain.contains(&parent) => {
                if let Some(&d) = depths.get(&parent) {
                    break d + 1 + chain.len();
                }
                chain.push(current);
                current = parent;
            }
            _ => break chain.len(),
        }
    };
    // Backfill the walked chain.
    let mut d = depth;
    depths.insert(id, depth);
    for ancestor in chain {
        depths.insert(ancestor, d);
        d = d.saturating_sub(1);
    }
    depths.insert(current, d);
    depth
}

/// Resolve duplicate state names by renaming with the color distinguisher.
fn dedupe_states(mut states: Vec<IssueState>) -> Vec<IssueState> {
    states.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.source_id.cmp(&b.source_id)));
    let mut seen: HashSet<String> = HashSet::new();
    for state in &mut states {
        if !seen.insert(state.name.clone()) {
            let renamed = format!("{} ({})", state.name, state.color);
            state.name = if seen.insert(renamed.clone()) {
                renamed
            } else {
                format!("{} ({})", state.name, state.source_id)
            };
            seen.insert(state.name.clone());
        }
    }
    states
}

/// Commit the staged graph. One transaction; sub-steps in dependency order.
///
/// # Errors
///
/// Any sub-step failure aborts and rolls back the whole transaction;
/// cancellation observed between sub-steps does the same.
#[allow(clippy::too_many_lines)]
pub fn commit_import(ctx: &ImportContext) -> Result<()> {
    let project = ctx
        .project()
        .ok_or_else(|| GantryError::Config("commit without project metadata".to_string()))?;

    // Assemble everything outside the transaction.
    let users = ctx.users().values();
    let memberships = ctx.memberships().snapshot();
    let project_members = ctx.project_members().snapshot();
    let states = dedupe_states(ctx.states().values());
    let labels = ctx.labels().values();
    let releases = ctx.releases().values();

    let issues = order_for_insert(ctx.issues().values());
    let staged_issues: HashSet<Uuid> = issues.iter().map(|issue| issue.id).collect();

    // Rows staged for issues that were dropped during mapping must not be
    // committed with dangling references.
    let links: Vec<_> = ctx
        .links()
        .snapshot()
        .into_iter()
        .filter(|link| staged_issues.contains(&link.issue_id))
        .collect();
    let comments: Vec<_> = ctx
        .comments()
        .values()
        .into_iter()
        .filter(|comment| staged_issues.contains(&comment.issue_id))
        .collect();
    let issue_labels: Vec<_> = ctx
        .issue_labels()
        .values()
        .into_iter()
        .filter(|row| staged_issues.contains(&row.issue_id))
        .collect();
    let relations: Vec<_> = ctx
        .relations()
        .values()
        .into_iter()
        .filter(|row| {
            staged_issues.contains(&row.issue_id) && staged_issues.contains(&row.related_id)
        })
        .collect();
    let assignees: Vec<_> = ctx
        .assignees()
        .values()
        .into_iter()
        .filter(|row| staged_issues.contains(&row.issue_id))
        .collect();
    let watchers: Vec<_> = ctx
        .watchers()
        .values()
        .into_iter()
        .filter(|row| staged_issues.contains(&row.issue_id))
        .collect();
    let issue_releases: Vec<_> = ctx
        .issue_releases()
        .values()
        .into_iter()
        .filter(|row| staged_issues.contains(&row.issue_id))
        .collect();

    // Only successfully transferred attachments reach the store; quarantined
    // descriptors are reported, never committed.
    let file_assets = ctx.stored_assets().values();
    let stored_ids: HashSet<Uuid> = file_assets.iter().map(|asset| asset.id).collect();
    let attachments: Vec<Attachment> = ctx
        .attachments()
        .values()
        .into_iter()
        .filter(|descriptor| {
            stored_ids.contains(&descriptor.asset_id)
                && staged_issues.contains(&descriptor.issue_id)
        })
        .map(|descriptor| Attachment {
            id: Uuid::new_v4(),
            issue_id: descriptor.issue_id,
            comment_id: descriptor.comment_id,
            asset_id: descriptor.asset_id,
            name: descriptor.name,
        })
        .collect();

    Counters::set(&ctx.counters.db_steps_total, 15);
    tracing::info!(
        session = %ctx.id,
        issues = issues.len(),
        users = users.len(),
        attachments = attachments.len(),
        "committing import"
    );

    let mut storage = ctx.storage();
    storage.with_transaction(|tx| {
        let mut step = |result: Result<()>| -> Result<()> {
            ctx.check_cancelled()?;
            result?;
            Counters::incr(&ctx.counters.db_steps_done);
            Ok(())
        };

        step(sqlite::insert_users(tx, &users))?;
        step(sqlite::insert_memberships(tx, &memberships))?;
        step(sqlite::insert_project(tx, &project))?;
        step(sqlite::insert_project_members(tx, &project_members))?;
        step(sqlite::insert_states(tx, &states))?;
        step(sqlite::insert_labels(tx, &labels))?;
        step(sqlite::insert_releases(tx, &releases))?;
        step(sqlite::insert_issues(tx, &issues))?;
        step(sqlite::insert_links(tx, &links))?;
        step(sqlite::insert_comments(tx, &comments))?;
        step(sqlite::insert_issue_labels(tx, &issue_labels))?;
        step(sqlite::insert_relations(tx, &relations))?;
        step(sqlite::insert_assignees(tx, &assignees).and_then(|()| {
            sqlite::insert_watchers(tx, &watchers)
        }))?;
        step(sqlite::insert_issue_releases(tx, &issue_releases))?;
        step(sqlite::insert_file_assets(tx, &file_assets).and_then(|()| {
            sqlite::insert_attachments(tx, &attachments)
        }))?;

        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Priority, StateKind};
    use chrono::Utc;

    fn issue(key: &str, id: Uuid, parent: Option<Uuid>) -> Issue {
        Issue {
            id,
            project_id: Uuid::new_v4(),
            number: key
                .rsplit('-')
                .next()
                .and_then(|n| n.parse().ok())
                .unwrap_or(0),
            title: key.to_string(),
            description: String::new(),
            state_id: Uuid::new_v4(),
            priority: Priority::None,
            parent_id: parent,
            sort_order: 0,
            created_by: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            source_key: key.to_string(),
        }
    }

    fn assert_parents_first(ordered: &[Issue]) {
        let mut seen = HashSet::new();
        for item in ordered {
            if let Some(parent) = item.parent_id {
                assert!(
                    seen.contains(&parent),
                    "{} inserted before its parent",
                    item.source_key
                );
            }
            seen.insert(item.id);
        }
    }

    #[test]
    fn parents_precede_children() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        // Deliberately pass children first.
        let ordered = order_for_insert(vec![
            issue("P-3", c, Some(b)),
            issue("P-2", b, Some(a)),
            issue("P-1", a, None),
        ]);
        assert_parents_first(&ordered);
        assert_eq!(ordered[0].id, a);
        assert_eq!(ordered[2].id, c);
    }

    #[test]
    fn unknown_parent_reference_is_cleared() {
        let a = Uuid::new_v4();
        let ghost = Uuid::new_v4();
        let ordered = order_for_insert(vec![issue("P-1", a, Some(ghost))]);
        assert_eq!(ordered[0].parent_id, None);
    }

    #[test]
    fn siblings_keep_number_order() {
        let parent = Uuid::new_v4();
        let ordered = order_for_insert(vec![
            issue("P-9", Uuid::new_v4(), Some(parent)),
            issue("P-1", parent, None),
            issue("P-4", Uuid::new_v4(), Some(parent)),
        ]);
        assert_parents_first(&ordered);
        assert_eq!(ordered[1].number, 4);
        assert_eq!(ordered[2].number, 9);
    }

    #[test]
    fn duplicate_states_are_renamed_not_dropped() {
        let project = Uuid::new_v4();
        let make = |name: &str, color: &str, source: &str| IssueState {
            id: Uuid::new_v4(),
            project_id: project,
            name: name.to_string(),
            kind: StateKind::Unstarted,
            color: color.to_string(),
            source_id: source.to_string(),
        };

        let deduped = dedupe_states(vec![
            make("Open", "#111111", "1"),
            make("Open", "#222222", "2"),
            make("Done", "#333333", "3"),
        ]);
        assert_eq!(deduped.len(), 3);
        let names: HashSet<_> = deduped.iter().map(|s| s.name.clone()).collect();
        assert_eq!(names.len(), 3, "names must be unique after dedup");
        assert!(names.contains("Open"));
        assert!(names.contains("Open (#222222)"));
    }
}
