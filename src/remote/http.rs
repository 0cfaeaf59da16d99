//! Blocking HTTP implementation of [`RemoteTracker`].
//!
//! Speaks the Jira-style REST surface: paginated issue search with expanded
//! fields, single-issue fetch, user lookup, project metadata, link-type and
//! status enumeration, watcher lists, and raw content byte fetch.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::Value;

use crate::config::RemoteSettings;
use crate::error::{GantryError, Result};

use super::{
    RemoteAttachment, RemoteComment, RemoteIssue, RemoteIssueLink, RemoteLinkType, RemotePage,
    RemoteProject, RemoteStatus, RemoteStatusCategory, RemoteTracker, RemoteUser,
};

const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Fields requested on every issue search/fetch.
const ISSUE_FIELDS: &str = "summary,description,status,priority,reporter,assignee,parent,labels,fixVersions,attachment,comment,issuelinks,created,updated";

/// Production remote tracker client.
pub struct HttpRemote {
    client: Client,
    base_url: String,
    user: Option<String>,
    token: Option<String>,
}

impl HttpRemote {
    /// Build a client from settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying HTTP client cannot be constructed.
    pub fn new(settings: &RemoteSettings) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("gantry/", env!("CARGO_PKG_VERSION")))
            .timeout(HTTP_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            user: settings.user.clone(),
            token: settings.token.clone(),
        })
    }

    fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let url = format!("{}{path}", self.base_url);
        let mut request = self.client.get(&url).query(query);
        if let Some(user) = &self.user {
            request = request.basic_auth(user, self.token.as_deref());
        }

        let response = request.send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(GantryError::remote(format!(
                "GET {path} returned {status}"
            )));
        }
        Ok(response.json()?)
    }
}

impl RemoteTracker for HttpRemote {
    fn project(&self, key: &str) -> Result<RemoteProject> {
        let wire: WireProject = self.get_json(&format!("/rest/api/3/project/{key}"), &[])?;
        Ok(RemoteProject {
            key: wire.key,
            name: wire.name,
            description: wire.description.filter(|d| !d.is_empty()),
        })
    }

    fn assignable_users(
        &self,
        project_key: &str,
        start_at: u64,
        max_results: u64,
    ) -> Result<RemotePage<RemoteUser>> {
        let wire: Vec<WireUser> = self.get_json(
            "/rest/api/3/user/assignable/search",
            &[
                ("project", project_key.to_string()),
                ("startAt", start_at.to_string()),
                ("maxResults", max_results.to_string()),
            ],
        )?;

        let items: Vec<RemoteUser> = wire.into_iter().map(WireUser::into_remote).collect();
        // This endpoint reports no total; synthesize one so a full page keeps
        // the pagination loop going and a short page terminates it.
        let total = if items.len() as u64 == max_results {
            start_at + items.len() as u64 + 1
        } else {
            start_at + items.len() as u64
        };
        Ok(RemotePage {
            items,
            start_at,
            total,
        })
    }

    fn user(&self, account_id: &str) -> Result<Option<RemoteUser>> {
        let url = format!("{}/rest/api/3/user", self.base_url);
        let mut request = self
            .client
            .get(&url)
            .query(&[("accountId", account_id)]);
        if let Some(user) = &self.user {
            request = request.basic_auth(user, self.token.as_deref());
        }

        let response = request.send()?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(GantryError::remote(format!(
                "GET /rest/api/3/user returned {status}"
            )));
        }
        let wire: WireUser = response.json()?;
        Ok(Some(wire.into_remote()))
    }

    fn search_issues(
        &self,
        project_key: &str,
        start_at: u64,
        max_results: u64,
    ) -> Result<RemotePage<RemoteIssue>> {
        let wire: WireSearch = self.get_json(
            "/rest/api/3/search",
            &[
                (
                    "jql",
                    format!("project = \"{project_key}\" ORDER BY created ASC"),
                ),
                ("startAt", start_at.to_string()),
                ("maxResults", max_results.to_string()),
                ("fields", ISSUE_FIELDS.to_string()),
            ],
        )?;

        Ok(RemotePage {
            items: wire
                .issues
                .into_iter()
                .map(WireIssue::into_remote)
                .collect(),
            start_at: wire.start_at,
            total: wire.total,
        })
    }

    fn issue(&self, key: &str) -> Result<RemoteIssue> {
        let wire: WireIssue = self.get_json(
            &format!("/rest/api/3/issue/{key}"),
            &[("fields", ISSUE_FIELDS.to_string())],
        )?;
        Ok(wire.into_remote())
    }

    fn link_types(&self) -> Result<Vec<RemoteLinkType>> {
        let wire: WireLinkTypes = self.get_json("/rest/api/3/issueLinkType", &[])?;
        Ok(wire
            .issue_link_types
            .into_iter()
            .map(|t| RemoteLinkType {
                id: t.id,
                name: t.name,
                outward: t.outward,
                inward: t.inward,
            })
            .collect())
    }

    fn statuses(&self, project_key: &str) -> Result<Vec<RemoteStatus>> {
        // The endpoint groups statuses by issue type; flatten and dedup.
        let wire: Vec<WireIssueTypeStatuses> =
            self.get_json(&format!("/rest/api/3/project/{project_key}/statuses"), &[])?;

        let mut seen = std::collections::HashSet::new();
        let mut statuses = Vec::new();
        for group in wire {
            for status in group.statuses {
                if seen.insert(status.id.clone()) {
                    statuses.push(status.into_remote());
                }
            }
        }
        Ok(statuses)
    }

    fn watchers(&self, issue_key: &str) -> Result<Vec<String>> {
        let wire: WireWatchers =
            self.get_json(&format!("/rest/api/3/issue/{issue_key}/watchers"), &[])?;
        Ok(wire
            .watchers
            .into_iter()
            .map(|w| w.account_id)
            .collect())
    }

    fn fetch_content(&self, url: &str) -> Result<(Vec<u8>, Option<String>)> {
        let mut request = self.client.get(url);
        // Only authenticate against our own tracker; never leak credentials
        // to arbitrary external hosts found in rich text.
        if url.starts_with(&self.base_url) {
            if let Some(user) = &self.user {
                request = request.basic_auth(user, self.token.as_deref());
            }
        }

        let response = request.send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(GantryError::remote(format!(
                "GET {url} returned {status}"
            )));
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);
        Ok((response.bytes()?.to_vec(), content_type))
    }
}

/// Parse the tracker's timestamp format (RFC 3339 or the legacy
/// `%Y-%m-%dT%H:%M:%S%.3f%z` shape). Falls back to now on garbage rather
/// than failing a whole issue over one bad timestamp.
fn parse_time(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.3f%z"))
        .map_or_else(
            |_| {
                tracing::warn!(raw, "unparseable remote timestamp");
                Utc::now()
            },
            |dt| dt.with_timezone(&Utc),
        )
}

fn project_key_of(issue_key: &str) -> String {
    issue_key
        .rsplit_once('-')
        .map_or(issue_key, |(prefix, _)| prefix)
        .to_string()
}

// --- wire types -----------------------------------------------------------

#[derive(Debug, Deserialize)]
struct WireProject {
    key: String,
    name: String,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireUser {
    account_id: String,
    display_name: String,
    #[serde(default)]
    email_address: Option<String>,
    #[serde(default)]
    avatar_urls: Option<HashMap<String, String>>,
    #[serde(default = "default_true")]
    active: bool,
}

const fn default_true() -> bool {
    true
}

impl WireUser {
    fn into_remote(self) -> RemoteUser {
        let avatar_url = self
            .avatar_urls
            .as_ref()
            .and_then(|urls| urls.get("48x48").cloned());
        RemoteUser {
            account_id: self.account_id,
            display_name: self.display_name,
            email: self.email_address,
            avatar_url,
            active: self.active,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireSearch {
    start_at: u64,
    total: u64,
    issues: Vec<WireIssue>,
}

#[derive(Debug, Deserialize)]
struct WireIssue {
    id: String,
    key: String,
    fields: WireFields,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireFields {
    summary: String,
    #[serde(default)]
    description: Option<Value>,
    status: WireStatus,
    #[serde(default)]
    priority: Option<WireIdRef>,
    #[serde(default)]
    reporter: Option<WireUser>,
    #[serde(default)]
    assignee: Option<WireUser>,
    #[serde(default)]
    parent: Option<WireParentRef>,
    #[serde(default)]
    labels: Vec<String>,
    #[serde(default)]
    fix_versions: Vec<WireNameRef>,
    #[serde(default)]
    attachment: Vec<WireAttachment>,
    #[serde(default)]
    comment: Option<WireCommentBlock>,
    #[serde(default)]
    issuelinks: Vec<WireLink>,
    created: String,
    updated: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireStatus {
    id: String,
    name: String,
    #[serde(default)]
    status_category: Option<WireStatusCategory>,
}

impl WireStatus {
    fn into_remote(self) -> RemoteStatus {
        let category = self
            .status_category
            .map_or(RemoteStatusCategory::Todo, |c| match c.key.as_str() {
                "indeterminate" => RemoteStatusCategory::InProgress,
                "done" => RemoteStatusCategory::Done,
                _ => RemoteStatusCategory::Todo,
            });
        RemoteStatus {
            id: self.id,
            name: self.name,
            category,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireStatusCategory {
    key: String,
}

#[derive(Debug, Deserialize)]
struct WireIdRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct WireNameRef {
    name: String,
}

#[derive(Debug, Deserialize)]
struct WireParentRef {
    key: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireAttachment {
    id: String,
    filename: String,
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default)]
    size: u64,
    content: String,
}

#[derive(Debug, Deserialize)]
struct WireCommentBlock {
    #[serde(default)]
    comments: Vec<WireComment>,
}

#[derive(Debug, Deserialize)]
struct WireComment {
    id: String,
    #[serde(default)]
    author: Option<WireUser>,
    #[serde(default)]
    body: Option<Value>,
    created: String,
    updated: String,
}

#[derive(Debug, Deserialize)]
struct WireLink {
    #[serde(rename = "type")]
    link_type: WireLinkTypeRef,
    #[serde(rename = "outwardIssue")]
    outward_issue: Option<WireLinkedIssue>,
    #[serde(rename = "inwardIssue")]
    inward_issue: Option<WireLinkedIssue>,
}

#[derive(Debug, Deserialize)]
struct WireLinkTypeRef {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct WireLinkedIssue {
    key: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireLinkTypes {
    issue_link_types: Vec<WireLinkTypeFull>,
}

#[derive(Debug, Deserialize)]
struct WireLinkTypeFull {
    id: String,
    name: String,
    outward: String,
    inward: String,
}

#[derive(Debug, Deserialize)]
struct WireIssueTypeStatuses {
    #[serde(default)]
    statuses: Vec<WireStatus>,
}

#[derive(Debug, Deserialize)]
struct WireWatchers {
    #[serde(default)]
    watchers: Vec<WireWatcher>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireWatcher {
    account_id: String,
}

impl WireIssue {
    fn into_remote(self) -> RemoteIssue {
        let project_key = project_key_of(&self.key);
        let fields = self.fields;

        let links = fields
            .issuelinks
            .into_iter()
            .filter_map(|link| {
                let (target, outward) = match (link.outward_issue, link.inward_issue) {
                    (Some(target), _) => (target, true),
                    (None, Some(target)) => (target, false),
                    (None, None) => return None,
                };
                Some(RemoteIssueLink {
                    link_type_id: link.link_type.id,
                    link_type_name: link.link_type.name,
                    target_project_key: project_key_of(&target.key),
                    target_key: target.key,
                    outward,
                })
            })
            .collect();

        RemoteIssue {
            id: self.id,
            key: self.key,
            project_key,
            summary: fields.summary,
            description: fields.description,
            status_id: fields.status.id,
            status_name: fields.status.name,
            priority_id: fields.priority.map(|p| p.id),
            reporter_account_id: fields.reporter.map(|u| u.account_id),
            assignee_account_id: fields.assignee.map(|u| u.account_id),
            parent_key: fields.parent.map(|p| p.key),
            labels: fields.labels,
            fix_versions: fields.fix_versions.into_iter().map(|v| v.name).collect(),
            attachments: fields
                .attachment
                .into_iter()
                .map(|a| RemoteAttachment {
                    id: a.id,
                    filename: a.filename,
                    mime_type: a
                        .mime_type
                        .unwrap_or_else(|| "application/octet-stream".to_string()),
                    size: a.size,
                    content_url: a.content,
                })
                .collect(),
            comments: fields
                .comment
                .map(|block| {
                    block
                        .comments
                        .into_iter()
                        .map(|c| RemoteComment {
                            id: c.id,
                            author_account_id: c.author.map(|a| a.account_id),
                            body: c.body,
                            created: parse_time(&c.created),
                            updated: parse_time(&c.updated),
                        })
                        .collect()
                })
                .unwrap_or_default(),
            links,
            created: parse_time(&fields.created),
            updated: parse_time(&fields.updated),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_time_accepts_both_formats() {
        let rfc = parse_time("2024-03-01T10:15:30+00:00");
        let legacy = parse_time("2024-03-01T10:15:30.000+0000");
        assert_eq!(rfc, legacy);
    }

    #[test]
    fn project_key_strips_numeric_suffix() {
        assert_eq!(project_key_of("GAN-42"), "GAN");
        assert_eq!(project_key_of("A-B-3"), "A-B");
        assert_eq!(project_key_of("nokey"), "nokey");
    }

    #[test]
    fn wire_issue_maps_links_and_attachments() {
        let raw = serde_json::json!({
            "id": "10001",
            "key": "GAN-2",
            "fields": {
                "summary": "Child task",
                "status": {"id": "3", "name": "In Progress",
                           "statusCategory": {"key": "indeterminate"}},
                "priority": {"id": "2"},
                "parent": {"key": "GAN-1"},
                "labels": ["infra"],
                "attachment": [{
                    "id": "900", "filename": "log.txt",
                    "mimeType": "text/plain", "size": 120,
                    "content": "https://remote.example.com/secure/attachment/900"
                }],
                "issuelinks": [{
                    "type": {"id": "10000", "name": "Blocks"},
                    "outwardIssue": {"key": "OTHER-7"}
                }],
                "created": "2024-03-01T10:15:30.000+0000",
                "updated": "2024-03-02T11:00:00.000+0000"
            }
        });
        let wire: WireIssue = serde_json::from_value(raw).unwrap();
        let issue = wire.into_remote();

        assert_eq!(issue.project_key, "GAN");
        assert_eq!(issue.parent_key.as_deref(), Some("GAN-1"));
        assert_eq!(issue.priority_id.as_deref(), Some("2"));
        assert_eq!(issue.attachments.len(), 1);
        assert_eq!(issue.links.len(), 1);
        assert_eq!(issue.links[0].target_project_key, "OTHER");
        assert!(issue.links[0].outward);
        assert_eq!(issue.key_number(), 2);
    }
}
