//! `SQLite` storage implementation.
//!
//! The commit stage calls the `insert_*` batch functions inside one
//! transaction obtained from [`SqliteStorage::with_transaction`]; the query
//! methods on [`SqliteStorage`] serve pipeline existence checks and tests.

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction};
use uuid::Uuid;

use crate::error::{GantryError, Result};
use crate::model::{
    Attachment, Comment, FileAsset, Issue, IssueAssignee, IssueLabel, IssueLink, IssueRelation,
    IssueRelease, IssueState, IssueWatcher, Label, Membership, Priority, Project, ProjectMember,
    Release, RelationKind, User,
};
use crate::storage::schema::apply_schema;

/// SQLite-based storage backend.
#[derive(Debug)]
pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    /// Open a new connection to the database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established or schema
    /// application fails.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        apply_schema(&conn)?;
        Ok(Self { conn })
    }

    /// Open an in-memory database for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        apply_schema(&conn)?;
        Ok(Self { conn })
    }

    /// Run `f` inside one immediate transaction; commit on `Ok`, roll back
    /// on `Err`. The commit stage runs entirely inside a single call.
    ///
    /// # Errors
    ///
    /// Propagates `f`'s error after rolling back, or the commit error.
    pub fn with_transaction<F, R>(&mut self, f: F) -> Result<R>
    where
        F: FnOnce(&Transaction<'_>) -> Result<R>,
    {
        let tx = self
            .conn
            .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    /// Create a workspace row if it does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub fn ensure_workspace(&self, id: Uuid, name: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO workspaces (id, name) VALUES (?, ?)",
            rusqlite::params![id.to_string(), name],
        )?;
        Ok(())
    }

    /// True if the user already holds a membership in the workspace.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn has_membership(&self, workspace_id: Uuid, user_id: Uuid) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM memberships WHERE workspace_id = ? AND user_id = ?",
                rusqlite::params![workspace_id.to_string(), user_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Fetch one issue by its source-system key.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a stored value is malformed.
    pub fn issue_by_source_key(&self, source_key: &str) -> Result<Option<Issue>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, project_id, number, title, description, state_id, priority,
                        parent_id, sort_order, created_by, created_at, updated_at, source_key
                 FROM issues WHERE source_key = ?",
                [source_key],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, Option<String>>(7)?,
                        row.get::<_, i64>(8)?,
                        row.get::<_, Option<String>>(9)?,
                        row.get::<_, String>(10)?,
                        row.get::<_, String>(11)?,
                        row.get::<_, String>(12)?,
                    ))
                },
            )
            .optional()?;

        row.map(
            |(
                id,
                project_id,
                number,
                title,
                description,
                state_id,
                priority,
                parent_id,
                sort_order,
                created_by,
                created_at,
                updated_at,
                source_key,
            )| {
                Ok(Issue {
                    id: parse_uuid(&id)?,
                    project_id: parse_uuid(&project_id)?,
                    number,
                    title,
                    description,
                    state_id: parse_uuid(&state_id)?,
                    priority: priority
                        .parse::<Priority>()
                        .map_err(GantryError::Config)?,
                    parent_id: parent_id.as_deref().map(parse_uuid).transpose()?,
                    sort_order,
                    created_by: created_by.as_deref().map(parse_uuid).transpose()?,
                    created_at: parse_time(&created_at)?,
                    updated_at: parse_time(&updated_at)?,
                    source_key,
                })
            },
        )
        .transpose()
    }

    /// All relation rows, for verification and read-back.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a stored value is malformed.
    pub fn relations(&self) -> Result<Vec<IssueRelation>> {
        let mut stmt = self
            .conn
            .prepare("SELECT issue_id, related_id, kind FROM issue_relations")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut relations = Vec::new();
        for row in rows {
            let (issue_id, related_id, kind) = row?;
            relations.push(IssueRelation {
                issue_id: parse_uuid(&issue_id)?,
                related_id: parse_uuid(&related_id)?,
                kind: match kind.as_str() {
                    "blocks" => RelationKind::Blocks,
                    _ => RelationKind::Relates,
                },
            });
        }
        Ok(relations)
    }

    /// Membership user ids for a workspace.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a stored value is malformed.
    pub fn membership_user_ids(&self, workspace_id: Uuid) -> Result<Vec<Uuid>> {
        let mut stmt = self
            .conn
            .prepare("SELECT user_id FROM memberships WHERE workspace_id = ?")?;
        let rows = stmt.query_map([workspace_id.to_string()], |row| row.get::<_, String>(0))?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(parse_uuid(&row?)?);
        }
        Ok(ids)
    }

    fn count(&self, sql: &str) -> Result<usize> {
        let n: i64 = self.conn.query_row(sql, [], |row| row.get(0))?;
        Ok(usize::try_from(n).unwrap_or(0))
    }

    /// Total committed issues.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn issue_count(&self) -> Result<usize> {
        self.count("SELECT COUNT(*) FROM issues")
    }

    /// Total committed users.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn user_count(&self) -> Result<usize> {
        self.count("SELECT COUNT(*) FROM users")
    }

    /// Total committed comments.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn comment_count(&self) -> Result<usize> {
        self.count("SELECT COUNT(*) FROM comments")
    }

    /// Total committed attachment rows.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn attachment_count(&self) -> Result<usize> {
        self.count("SELECT COUNT(*) FROM attachments")
    }

    /// Total committed label rows.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn label_count(&self) -> Result<usize> {
        self.count("SELECT COUNT(*) FROM labels")
    }
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| GantryError::Config(format!("malformed uuid '{raw}': {e}")))
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| GantryError::Config(format!("malformed timestamp '{raw}': {e}")))
}

// --- commit-stage batch inserts -------------------------------------------

/// Insert user rows.
///
/// # Errors
///
/// Returns an error on any constraint violation or database failure.
pub fn insert_users(tx: &Transaction<'_>, users: &[User]) -> Result<()> {
    let mut stmt = tx.prepare(
        "INSERT INTO users (id, source_id, name, email, avatar_url, avatar_asset_id)
         VALUES (?, ?, ?, ?, ?, ?)",
    )?;
    for user in users {
        stmt.execute(rusqlite::params![
            user.id.to_string(),
            user.source_id,
            user.name,
            user.email,
            user.avatar_url,
            user.avatar_asset_id.map(|id| id.to_string()),
        ])?;
    }
    Ok(())
}

/// Insert membership rows; duplicates are treated as success.
///
/// # Errors
///
/// Returns an error on database failure.
pub fn insert_memberships(tx: &Transaction<'_>, memberships: &[Membership]) -> Result<()> {
    let mut stmt = tx.prepare(
        "INSERT OR IGNORE INTO memberships (workspace_id, user_id, role) VALUES (?, ?, ?)",
    )?;
    for membership in memberships {
        stmt.execute(rusqlite::params![
            membership.workspace_id.to_string(),
            membership.user_id.to_string(),
            membership.role.as_str(),
        ])?;
    }
    Ok(())
}

/// Insert the project row.
///
/// # Errors
///
/// Returns an error on database failure.
pub fn insert_project(tx: &Transaction<'_>, project: &Project) -> Result<()> {
    tx.execute(
        "INSERT INTO projects (id, workspace_id, key, name, description, source_key, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            project.id.to_string(),
            project.workspace_id.to_string(),
            project.key,
            project.name,
            project.description,
            project.source_key,
            project.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Insert project member rows; duplicates are treated as success.
///
/// # Errors
///
/// Returns an error on database failure.
pub fn insert_project_members(tx: &Transaction<'_>, members: &[ProjectMember]) -> Result<()> {
    let mut stmt = tx.prepare(
        "INSERT OR IGNORE INTO project_members (project_id, user_id, role) VALUES (?, ?, ?)",
    )?;
    for member in members {
        stmt.execute(rusqlite::params![
            member.project_id.to_string(),
            member.user_id.to_string(),
            member.role.as_str(),
        ])?;
    }
    Ok(())
}

/// Insert workflow state rows.
///
/// # Errors
///
/// Returns an error on any constraint violation or database failure.
pub fn insert_states(tx: &Transaction<'_>, states: &[IssueState]) -> Result<()> {
    let mut stmt = tx.prepare(
        "INSERT INTO issue_states (id, project_id, name, kind, color, source_id)
         VALUES (?, ?, ?, ?, ?, ?)",
    )?;
    for state in states {
        stmt.execute(rusqlite::params![
            state.id.to_string(),
            state.project_id.to_string(),
            state.name,
            state.kind.as_str(),
            state.color,
            state.source_id,
        ])?;
    }
    Ok(())
}

/// Insert label rows; duplicates are treated as success.
///
/// # Errors
///
/// Returns an error on database failure.
pub fn insert_labels(tx: &Transaction<'_>, labels: &[Label]) -> Result<()> {
    let mut stmt = tx.prepare(
        "INSERT OR IGNORE INTO labels (id, project_id, name, color) VALUES (?, ?, ?, ?)",
    )?;
    for label in labels {
        stmt.execute(rusqlite::params![
            label.id.to_string(),
            label.project_id.to_string(),
            label.name,
            label.color,
        ])?;
    }
    Ok(())
}

/// Insert release rows; duplicates are treated as success.
///
/// # Errors
///
/// Returns an error on database failure.
pub fn insert_releases(tx: &Transaction<'_>, releases: &[Release]) -> Result<()> {
    let mut stmt = tx.prepare(
        "INSERT OR IGNORE INTO releases (id, project_id, name, released) VALUES (?, ?, ?, ?)",
    )?;
    for release in releases {
        stmt.execute(rusqlite::params![
            release.id.to_string(),
            release.project_id.to_string(),
            release.name,
            i64::from(release.released),
        ])?;
    }
    Ok(())
}

/// Insert issue rows in the given order. Callers must order parents before
/// children or the self-referencing foreign key rejects the insert.
///
/// # Errors
///
/// Returns an error on any constraint violation or database failure.
pub fn insert_issues(tx: &Transaction<'_>, issues: &[Issue]) -> Result<()> {
    let mut stmt = tx.prepare(
        "INSERT INTO issues (id, project_id, number, title, description, state_id,
                             priority, parent_id, sort_order, created_by,
                             created_at, updated_at, source_key)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )?;
    for issue in issues {
        stmt.execute(rusqlite::params![
            issue.id.to_string(),
            issue.project_id.to_string(),
            issue.number,
            issue.title,
            issue.description,
            issue.state_id.to_string(),
            issue.priority.as_str(),
            issue.parent_id.map(|id| id.to_string()),
            issue.sort_order,
            issue.created_by.map(|id| id.to_string()),
            issue.created_at.to_rfc3339(),
            issue.updated_at.to_rfc3339(),
            issue.source_key,
        ])?;
    }
    Ok(())
}

/// Insert external hyperlink rows.
///
/// # Errors
///
/// Returns an error on database failure.
pub fn insert_links(tx: &Transaction<'_>, links: &[IssueLink]) -> Result<()> {
    let mut stmt =
        tx.prepare("INSERT INTO issue_links (id, issue_id, title, url) VALUES (?, ?, ?, ?)")?;
    for link in links {
        stmt.execute(rusqlite::params![
            link.id.to_string(),
            link.issue_id.to_string(),
            link.title,
            link.url,
        ])?;
    }
    Ok(())
}

/// Insert comment rows.
///
/// # Errors
///
/// Returns an error on database failure.
pub fn insert_comments(tx: &Transaction<'_>, comments: &[Comment]) -> Result<()> {
    let mut stmt = tx.prepare(
        "INSERT INTO comments (id, issue_id, author_id, body, created_at, updated_at, source_id)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )?;
    for comment in comments {
        stmt.execute(rusqlite::params![
            comment.id.to_string(),
            comment.issue_id.to_string(),
            comment.author_id.map(|id| id.to_string()),
            comment.body,
            comment.created_at.to_rfc3339(),
            comment.updated_at.to_rfc3339(),
            comment.source_id,
        ])?;
    }
    Ok(())
}

/// Insert issue/label link rows; duplicates are treated as success.
///
/// # Errors
///
/// Returns an error on database failure.
pub fn insert_issue_labels(tx: &Transaction<'_>, rows: &[IssueLabel]) -> Result<()> {
    let mut stmt =
        tx.prepare("INSERT OR IGNORE INTO issue_labels (issue_id, label_id) VALUES (?, ?)")?;
    for row in rows {
        stmt.execute(rusqlite::params![
            row.issue_id.to_string(),
            row.label_id.to_string(),
        ])?;
    }
    Ok(())
}

/// Insert relation rows; duplicates are treated as success.
///
/// # Errors
///
/// Returns an error on database failure.
pub fn insert_relations(tx: &Transaction<'_>, relations: &[IssueRelation]) -> Result<()> {
    let mut stmt = tx.prepare(
        "INSERT OR IGNORE INTO issue_relations (issue_id, related_id, kind) VALUES (?, ?, ?)",
    )?;
    for relation in relations {
        stmt.execute(rusqlite::params![
            relation.issue_id.to_string(),
            relation.related_id.to_string(),
            relation.kind.as_str(),
        ])?;
    }
    Ok(())
}

/// Insert assignee rows; duplicates are treated as success.
///
/// # Errors
///
/// Returns an error on database failure.
pub fn insert_assignees(tx: &Transaction<'_>, rows: &[IssueAssignee]) -> Result<()> {
    let mut stmt =
        tx.prepare("INSERT OR IGNORE INTO issue_assignees (issue_id, user_id) VALUES (?, ?)")?;
    for row in rows {
        stmt.execute(rusqlite::params![
            row.issue_id.to_string(),
            row.user_id.to_string(),
        ])?;
    }
    Ok(())
}

/// Insert watcher rows; duplicates are treated as success.
///
/// # Errors
///
/// Returns an error on database failure.
pub fn insert_watchers(tx: &Transaction<'_>, rows: &[IssueWatcher]) -> Result<()> {
    let mut stmt =
        tx.prepare("INSERT OR IGNORE INTO issue_watchers (issue_id, user_id) VALUES (?, ?)")?;
    for row in rows {
        stmt.execute(rusqlite::params![
            row.issue_id.to_string(),
            row.user_id.to_string(),
        ])?;
    }
    Ok(())
}

/// Insert issue/release link rows; duplicates are treated as success.
///
/// # Errors
///
/// Returns an error on database failure.
pub fn insert_issue_releases(tx: &Transaction<'_>, rows: &[IssueRelease]) -> Result<()> {
    let mut stmt =
        tx.prepare("INSERT OR IGNORE INTO issue_releases (issue_id, release_id) VALUES (?, ?)")?;
    for row in rows {
        stmt.execute(rusqlite::params![
            row.issue_id.to_string(),
            row.release_id.to_string(),
        ])?;
    }
    Ok(())
}

/// Insert file asset rows.
///
/// # Errors
///
/// Returns an error on database failure.
pub fn insert_file_assets(tx: &Transaction<'_>, assets: &[FileAsset]) -> Result<()> {
    let mut stmt = tx.prepare(
        "INSERT INTO file_assets (id, workspace_id, name, content_type, size, content_hash, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )?;
    for asset in assets {
        stmt.execute(rusqlite::params![
            asset.id.to_string(),
            asset.workspace_id.to_string(),
            asset.name,
            asset.content_type,
            asset.size,
            asset.content_hash,
            asset.created_at.to_rfc3339(),
        ])?;
    }
    Ok(())
}

/// Insert attachment rows.
///
/// # Errors
///
/// Returns an error on database failure.
pub fn insert_attachments(tx: &Transaction<'_>, attachments: &[Attachment]) -> Result<()> {
    let mut stmt = tx.prepare(
        "INSERT INTO attachments (id, issue_id, comment_id, asset_id, name)
         VALUES (?, ?, ?, ?, ?)",
    )?;
    for attachment in attachments {
        stmt.execute(rusqlite::params![
            attachment.id.to_string(),
            attachment.issue_id.to_string(),
            attachment.comment_id.map(|id| id.to_string()),
            attachment.asset_id.to_string(),
            attachment.name,
        ])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_applies_twice() {
        let storage = SqliteStorage::open_memory().unwrap();
        apply_schema(&storage.conn).unwrap();
    }

    #[test]
    fn foreign_keys_are_enforced() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let orphan_comment = Comment {
            id: Uuid::new_v4(),
            issue_id: Uuid::new_v4(),
            author_id: None,
            body: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            source_id: "1".to_string(),
        };
        let result =
            storage.with_transaction(|tx| insert_comments(tx, std::slice::from_ref(&orphan_comment)));
        assert!(result.is_err(), "comment without issue must be rejected");
    }

    #[test]
    fn membership_insert_is_idempotent() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let workspace = Uuid::new_v4();
        storage.ensure_workspace(workspace, "test").unwrap();

        let user = User {
            id: Uuid::new_v4(),
            source_id: "acc".to_string(),
            name: "Ada".to_string(),
            email: "ada@example.com".to_string(),
            avatar_url: None,
            avatar_asset_id: None,
        };
        let membership = Membership {
            workspace_id: workspace,
            user_id: user.id,
            role: crate::model::Role::Member,
        };

        storage
            .with_transaction(|tx| {
                insert_users(tx, std::slice::from_ref(&user))?;
                insert_memberships(tx, &[membership.clone(), membership.clone()])
            })
            .unwrap();

        assert_eq!(storage.membership_user_ids(workspace).unwrap().len(), 1);
        assert!(storage.has_membership(workspace, user.id).unwrap());
    }
}
