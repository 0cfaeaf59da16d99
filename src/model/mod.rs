//! Target-side data types for `gantry`.
//!
//! These are the shapes the import pipeline stages in memory and the commit
//! stage writes to `SQLite`. Every entity carries a freshly generated UUID;
//! source-system identifiers are retained in `source_*` fields so re-imports
//! and permalink rewrites can find entities by origin.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Workspace/project membership role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Member,
    Guest,
}

impl Role {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Member => "member",
            Self::Guest => "guest",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(input: &str) -> std::result::Result<Self, Self::Err> {
        match input {
            "admin" => Ok(Self::Admin),
            "member" => Ok(Self::Member),
            "guest" => Ok(Self::Guest),
            other => Err(format!("invalid role: {other}")),
        }
    }
}

/// Workflow state category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateKind {
    Backlog,
    Unstarted,
    Started,
    Completed,
    Cancelled,
}

impl StateKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Backlog => "backlog",
            Self::Unstarted => "unstarted",
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for StateKind {
    type Err = String;

    fn from_str(input: &str) -> std::result::Result<Self, Self::Err> {
        match input {
            "backlog" => Ok(Self::Backlog),
            "unstarted" => Ok(Self::Unstarted),
            "started" => Ok(Self::Started),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("invalid state kind: {other}")),
        }
    }
}

/// Issue priority on the target side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Urgent,
    High,
    Medium,
    Low,
    #[default]
    None,
}

impl Priority {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Urgent => "urgent",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
            Self::None => "none",
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(input: &str) -> std::result::Result<Self, Self::Err> {
        match input {
            "urgent" => Ok(Self::Urgent),
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            "none" => Ok(Self::None),
            other => Err(format!("invalid priority: {other}")),
        }
    }
}

/// Relation kind between two issues in the same project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationKind {
    /// `issue_id` blocks `related_id`.
    Blocks,
    Relates,
}

impl RelationKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Blocks => "blocks",
            Self::Relates => "relates",
        }
    }
}

/// A user account in the target system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    /// Source-system account id this user was imported from.
    pub source_id: String,
    pub name: String,
    pub email: String,
    pub avatar_url: Option<String>,
    /// Blob id of the imported avatar, set by the avatar step.
    pub avatar_asset_id: Option<Uuid>,
}

/// Workspace membership row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Membership {
    pub workspace_id: Uuid,
    pub user_id: Uuid,
    pub role: Role,
}

/// A project in the target system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub key: String,
    pub name: String,
    pub description: String,
    pub source_key: String,
    pub created_at: DateTime<Utc>,
}

/// Project membership row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectMember {
    pub project_id: Uuid,
    pub user_id: Uuid,
    pub role: Role,
}

/// A workflow state within a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueState {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub kind: StateKind,
    pub color: String,
    pub source_id: String,
}

/// A label within a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Label {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub color: String,
}

/// An issue in the target system.
///
/// Assignees, watchers, labels, and relations live in separate rows; the
/// issue itself carries only single-valued fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub id: Uuid,
    pub project_id: Uuid,
    /// Sequence number within the project, taken from the source key suffix.
    pub number: i64,
    pub title: String,
    /// Rewritten rich-text document, serialized JSON.
    pub description: String,
    pub state_id: Uuid,
    pub priority: Priority,
    pub parent_id: Option<Uuid>,
    /// Sibling order under `parent_id`; 0 when the issue has no parent.
    pub sort_order: i64,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub source_key: String,
}

/// An external hyperlink attached to an issue (cross-project link targets
/// are preserved this way rather than resolved to local ids).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueLink {
    pub id: Uuid,
    pub issue_id: Uuid,
    pub title: String,
    pub url: String,
}

/// A same-project relation row between two issues.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueRelation {
    pub issue_id: Uuid,
    pub related_id: Uuid,
    pub kind: RelationKind,
}

impl IssueRelation {
    /// Natural composite key, used for staging dedup.
    #[must_use]
    pub fn natural_key(&self) -> String {
        format!("{}:{}:{}", self.kind.as_str(), self.issue_id, self.related_id)
    }
}

/// Issue/label link row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueLabel {
    pub issue_id: Uuid,
    pub label_id: Uuid,
}

/// Issue assignee row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueAssignee {
    pub issue_id: Uuid,
    pub user_id: Uuid,
}

/// Issue watcher row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueWatcher {
    pub issue_id: Uuid,
    pub user_id: Uuid,
}

/// A comment on an issue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub id: Uuid,
    pub issue_id: Uuid,
    pub author_id: Option<Uuid>,
    /// Rewritten rich-text document, serialized JSON.
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub source_id: String,
}

/// A release (fix version) within a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Release {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub released: bool,
}

/// Issue/release link row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueRelease {
    pub issue_id: Uuid,
    pub release_id: Uuid,
}

/// A stored blob's durable record: one row per object-storage entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileAsset {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub name: String,
    pub content_type: String,
    pub size: i64,
    pub content_hash: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// An attachment row binding a file asset to an issue (and optionally to a
/// specific comment).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub id: Uuid,
    pub issue_id: Uuid,
    pub comment_id: Option<Uuid>,
    pub asset_id: Uuid,
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_round_trips() {
        for kind in [
            StateKind::Backlog,
            StateKind::Unstarted,
            StateKind::Started,
            StateKind::Completed,
            StateKind::Cancelled,
        ] {
            assert_eq!(kind.as_str().parse::<StateKind>().unwrap(), kind);
        }
        for priority in [
            Priority::Urgent,
            Priority::High,
            Priority::Medium,
            Priority::Low,
            Priority::None,
        ] {
            assert_eq!(priority.as_str().parse::<Priority>().unwrap(), priority);
        }
        for role in [Role::Admin, Role::Member, Role::Guest] {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
    }

    #[test]
    fn relation_natural_key_includes_kind_and_both_ids() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let relation = IssueRelation {
            issue_id: a,
            related_id: b,
            kind: RelationKind::Blocks,
        };
        assert_eq!(relation.natural_key(), format!("blocks:{a}:{b}"));
    }
}
