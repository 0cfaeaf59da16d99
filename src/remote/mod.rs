//! Remote tracker API boundary.
//!
//! [`RemoteTracker`] is the only surface the import pipeline sees; the
//! production implementation lives in [`http`], tests inject fakes. All calls
//! are blocking and may fail with transient errors - the pipeline treats
//! those as step-fatal except attachment downloads, which retry.

pub mod http;

pub use http::HttpRemote;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::Result;

/// One page of a paginated listing.
#[derive(Debug, Clone)]
pub struct RemotePage<T> {
    pub items: Vec<T>,
    /// Zero-based offset of the first item in this page.
    pub start_at: u64,
    /// Total items across all pages, as reported by the remote.
    pub total: u64,
}

impl<T> RemotePage<T> {
    /// Offset of the page after this one.
    #[must_use]
    pub fn next_start(&self) -> u64 {
        self.start_at + self.items.len() as u64
    }

    /// True if this is the final page.
    #[must_use]
    pub fn is_last(&self) -> bool {
        self.items.is_empty() || self.next_start() >= self.total
    }
}

/// A user account on the remote tracker.
#[derive(Debug, Clone)]
pub struct RemoteUser {
    pub account_id: String,
    pub display_name: String,
    pub email: Option<String>,
    pub avatar_url: Option<String>,
    pub active: bool,
}

/// Remote project metadata.
#[derive(Debug, Clone)]
pub struct RemoteProject {
    pub key: String,
    pub name: String,
    pub description: Option<String>,
}

/// Workflow status category on the remote tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteStatusCategory {
    Todo,
    InProgress,
    Done,
}

/// A workflow status on the remote tracker.
#[derive(Debug, Clone)]
pub struct RemoteStatus {
    pub id: String,
    pub name: String,
    pub category: RemoteStatusCategory,
}

/// A link type on the remote tracker (e.g. "Blocks", "Relates").
#[derive(Debug, Clone)]
pub struct RemoteLinkType {
    pub id: String,
    pub name: String,
    pub outward: String,
    pub inward: String,
}

/// An attachment reference on a remote issue.
#[derive(Debug, Clone)]
pub struct RemoteAttachment {
    pub id: String,
    pub filename: String,
    pub mime_type: String,
    pub size: u64,
    /// URL the raw bytes can be fetched from.
    pub content_url: String,
}

/// A comment on a remote issue. The body is the tracker's rich-text
/// document tree.
#[derive(Debug, Clone)]
pub struct RemoteComment {
    pub id: String,
    pub author_account_id: Option<String>,
    pub body: Option<Value>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

/// A typed link from one remote issue to another.
#[derive(Debug, Clone)]
pub struct RemoteIssueLink {
    pub link_type_id: String,
    pub link_type_name: String,
    /// Key of the issue on the other end.
    pub target_key: String,
    /// Project key of the target issue.
    pub target_project_key: String,
    /// True when this issue points outward at the target (for a "blocks"
    /// type: this issue blocks the target).
    pub outward: bool,
}

/// A full remote issue as returned by search or single-issue fetch.
#[derive(Debug, Clone)]
pub struct RemoteIssue {
    pub id: String,
    pub key: String,
    pub project_key: String,
    pub summary: String,
    /// Rich-text document tree, when the issue has a description.
    pub description: Option<Value>,
    pub status_id: String,
    pub status_name: String,
    pub priority_id: Option<String>,
    pub reporter_account_id: Option<String>,
    pub assignee_account_id: Option<String>,
    pub parent_key: Option<String>,
    pub labels: Vec<String>,
    pub fix_versions: Vec<String>,
    pub attachments: Vec<RemoteAttachment>,
    pub comments: Vec<RemoteComment>,
    pub links: Vec<RemoteIssueLink>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl RemoteIssue {
    /// Numeric suffix of the issue key ("GAN-42" -> 42), used as the target
    /// issue number. Falls back to 0 when the key has no numeric suffix.
    #[must_use]
    pub fn key_number(&self) -> i64 {
        self.key
            .rsplit('-')
            .next()
            .and_then(|suffix| suffix.parse().ok())
            .unwrap_or(0)
    }
}

/// The remote tracker API consumed by the import pipeline.
///
/// Object-safe so sessions can hold `Arc<dyn RemoteTracker>` and tests can
/// inject fakes.
pub trait RemoteTracker: Send + Sync {
    /// Fetch project metadata.
    ///
    /// # Errors
    ///
    /// Returns a remote error if the project does not exist or the call fails.
    fn project(&self, key: &str) -> Result<RemoteProject>;

    /// One page of users assignable in the project.
    ///
    /// # Errors
    ///
    /// Returns a remote error if the call fails.
    fn assignable_users(
        &self,
        project_key: &str,
        start_at: u64,
        max_results: u64,
    ) -> Result<RemotePage<RemoteUser>>;

    /// Look up a single user by account id. `Ok(None)` when the account is
    /// gone (deleted users are fabricated by the mapper).
    ///
    /// # Errors
    ///
    /// Returns a remote error if the call fails for any other reason.
    fn user(&self, account_id: &str) -> Result<Option<RemoteUser>>;

    /// One page of the project's issues, oldest first.
    ///
    /// # Errors
    ///
    /// Returns a remote error if the call fails.
    fn search_issues(
        &self,
        project_key: &str,
        start_at: u64,
        max_results: u64,
    ) -> Result<RemotePage<RemoteIssue>>;

    /// Fetch one issue by key.
    ///
    /// # Errors
    ///
    /// Returns a remote error if the issue does not exist or the call fails.
    fn issue(&self, key: &str) -> Result<RemoteIssue>;

    /// Enumerate the tracker's link types.
    ///
    /// # Errors
    ///
    /// Returns a remote error if the call fails.
    fn link_types(&self) -> Result<Vec<RemoteLinkType>>;

    /// Enumerate workflow statuses used by the project.
    ///
    /// # Errors
    ///
    /// Returns a remote error if the call fails.
    fn statuses(&self, project_key: &str) -> Result<Vec<RemoteStatus>>;

    /// Account ids watching an issue.
    ///
    /// # Errors
    ///
    /// Returns a remote error if the call fails.
    fn watchers(&self, issue_key: &str) -> Result<Vec<String>>;

    /// Fetch raw bytes from an attachment content URL or an arbitrary
    /// external URL. Returns the bytes and the content type when known.
    ///
    /// # Errors
    ///
    /// Returns a remote error if the fetch fails; callers decide whether to
    /// retry.
    fn fetch_content(&self, url: &str) -> Result<(Vec<u8>, Option<String>)>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_arithmetic() {
        let page = RemotePage {
            items: vec![1, 2, 3],
            start_at: 0,
            total: 5,
        };
        assert_eq!(page.next_start(), 3);
        assert!(!page.is_last());

        let last = RemotePage {
            items: vec![4, 5],
            start_at: 3,
            total: 5,
        };
        assert!(last.is_last());

        let empty: RemotePage<i32> = RemotePage {
            items: vec![],
            start_at: 0,
            total: 0,
        };
        assert!(empty.is_last());
    }

    #[test]
    fn key_number_parses_suffix() {
        let mut issue = RemoteIssue {
            id: "1".to_string(),
            key: "GAN-42".to_string(),
            project_key: "GAN".to_string(),
            summary: String::new(),
            description: None,
            status_id: "1".to_string(),
            status_name: "Open".to_string(),
            priority_id: None,
            reporter_account_id: None,
            assignee_account_id: None,
            parent_key: None,
            labels: vec![],
            fix_versions: vec![],
            attachments: vec![],
            comments: vec![],
            links: vec![],
            created: Utc::now(),
            updated: Utc::now(),
        };
        assert_eq!(issue.key_number(), 42);
        issue.key = "weird".to_string();
        assert_eq!(issue.key_number(), 0);
    }
}
