//! Shared fixtures for integration tests: an in-memory remote tracker, a
//! recording blob store, and the synthetic source project used by the
//! round-trip tests (A parent, B child of A, C blocks B, two users, one
//! label).

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::io::Read as _;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use serde_json::json;
use uuid::Uuid;

use gantry::blob::{BlobMetadata, BlobStore, StoredBlob};
use gantry::config::{ImportSettings, TransferSettings};
use gantry::error::{GantryError, Result};
use gantry::import::{ImportEnv, ImportRequest};
use gantry::notify::Notifier;
use gantry::remote::{
    RemoteAttachment, RemoteComment, RemoteIssue, RemoteIssueLink, RemoteLinkType, RemotePage,
    RemoteProject, RemoteStatus, RemoteStatusCategory, RemoteTracker, RemoteUser,
};

pub const BASE_URL: &str = "https://remote.example.com";
pub const PROJECT_KEY: &str = "SRC";
pub const BLOCKS_TYPE: &str = "10000";

/// In-memory remote tracker.
pub struct FakeRemote {
    pub project: RemoteProject,
    pub users: Vec<RemoteUser>,
    pub issues: Mutex<HashMap<String, RemoteIssue>>,
    pub statuses: Vec<RemoteStatus>,
    pub link_types: Vec<RemoteLinkType>,
    pub watchers: HashMap<String, Vec<String>>,
    pub content: Mutex<HashMap<String, Vec<u8>>>,
    /// URLs whose fetch always fails.
    pub failing_urls: Mutex<HashSet<String>>,
    /// Artificial latency applied to every remote call.
    pub delay: Duration,
    pub fetch_calls: AtomicUsize,
}

impl FakeRemote {
    pub fn new(issues: Vec<RemoteIssue>) -> Self {
        let issues = issues
            .into_iter()
            .map(|issue| (issue.key.clone(), issue))
            .collect();
        Self {
            project: RemoteProject {
                key: PROJECT_KEY.to_string(),
                name: "Source Project".to_string(),
                description: Some("imported fixture".to_string()),
            },
            users: vec![remote_user("acct-alice", "Alice", "alice@example.com"),
                        remote_user("acct-bob", "Bob", "bob@example.com")],
            issues: Mutex::new(issues),
            statuses: vec![RemoteStatus {
                id: "1".to_string(),
                name: "Open".to_string(),
                category: RemoteStatusCategory::Todo,
            }],
            link_types: vec![RemoteLinkType {
                id: BLOCKS_TYPE.to_string(),
                name: "Blocks".to_string(),
                outward: "blocks".to_string(),
                inward: "is blocked by".to_string(),
            }],
            watchers: HashMap::new(),
            content: Mutex::new(HashMap::new()),
            failing_urls: Mutex::new(HashSet::new()),
            delay: Duration::ZERO,
            fetch_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn set_content(&self, url: &str, bytes: &[u8]) {
        self.content
            .lock()
            .unwrap()
            .insert(url.to_string(), bytes.to_vec());
    }

    pub fn fail_url(&self, url: &str) {
        self.failing_urls.lock().unwrap().insert(url.to_string());
    }

    fn pause(&self) {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
    }
}

impl RemoteTracker for FakeRemote {
    fn project(&self, key: &str) -> Result<RemoteProject> {
        if key == self.project.key {
            Ok(self.project.clone())
        } else {
            Err(GantryError::remote(format!("project {key} not found")))
        }
    }

    fn assignable_users(
        &self,
        _project_key: &str,
        start_at: u64,
        max_results: u64,
    ) -> Result<RemotePage<RemoteUser>> {
        self.pause();
        let start = usize::try_from(start_at).unwrap();
        let end = (start + usize::try_from(max_results).unwrap()).min(self.users.len());
        Ok(RemotePage {
            items: self.users.get(start..end).unwrap_or_default().to_vec(),
            start_at,
            total: self.users.len() as u64,
        })
    }

    fn user(&self, account_id: &str) -> Result<Option<RemoteUser>> {
        Ok(self
            .users
            .iter()
            .find(|user| user.account_id == account_id)
            .cloned())
    }

    fn search_issues(
        &self,
        _project_key: &str,
        start_at: u64,
        max_results: u64,
    ) -> Result<RemotePage<RemoteIssue>> {
        self.pause();
        let mut all: Vec<RemoteIssue> = self.issues.lock().unwrap().values().cloned().collect();
        all.sort_by_key(RemoteIssue::key_number);

        let start = usize::try_from(start_at).unwrap();
        let end = (start + usize::try_from(max_results).unwrap()).min(all.len());
        Ok(RemotePage {
            items: all.get(start..end).unwrap_or_default().to_vec(),
            start_at,
            total: all.len() as u64,
        })
    }

    fn issue(&self, key: &str) -> Result<RemoteIssue> {
        self.issues
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| GantryError::remote(format!("issue {key} not found")))
    }

    fn link_types(&self) -> Result<Vec<RemoteLinkType>> {
        Ok(self.link_types.clone())
    }

    fn statuses(&self, _project_key: &str) -> Result<Vec<RemoteStatus>> {
        Ok(self.statuses.clone())
    }

    fn watchers(&self, issue_key: &str) -> Result<Vec<String>> {
        Ok(self.watchers.get(issue_key).cloned().unwrap_or_default())
    }

    fn fetch_content(&self, url: &str) -> Result<(Vec<u8>, Option<String>)> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.pause();
        if self.failing_urls.lock().unwrap().contains(url) {
            return Err(GantryError::remote(format!("GET {url} returned 503")));
        }
        let bytes = self
            .content
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .unwrap_or_else(|| b"fixture-bytes".to_vec());
        Ok((bytes, Some("application/octet-stream".to_string())))
    }
}

/// Blob store that records saves and deletes instead of touching disk.
#[derive(Default)]
pub struct MemoryBlobStore {
    pub saved: Mutex<Vec<Uuid>>,
    pub deleted: Mutex<Vec<Uuid>>,
}

impl MemoryBlobStore {
    pub fn saved_ids(&self) -> Vec<Uuid> {
        self.saved.lock().unwrap().clone()
    }

    pub fn deleted_ids(&self) -> Vec<Uuid> {
        self.deleted.lock().unwrap().clone()
    }
}

impl BlobStore for MemoryBlobStore {
    fn save(
        &self,
        reader: &mut dyn std::io::Read,
        _size: u64,
        dest: Uuid,
        _content_type: &str,
        _metadata: &BlobMetadata,
    ) -> Result<StoredBlob> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        self.saved.lock().unwrap().push(dest);
        Ok(StoredBlob {
            id: dest,
            size: bytes.len() as u64,
            content_hash: format!("{:x}", bytes.len()),
        })
    }

    fn delete(&self, dest: Uuid) -> Result<()> {
        self.deleted.lock().unwrap().push(dest);
        Ok(())
    }
}

/// Notifier that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn import_started(&self, _source_project: &str, _actor: &str) {}
    fn import_finished(&self, _source_project: &str, _actor: &str, _outcome: &str) {}
}

/// A remote issue with fixture defaults.
pub fn basic_issue(key: &str, title: &str) -> RemoteIssue {
    RemoteIssue {
        id: key.to_string(),
        key: key.to_string(),
        project_key: PROJECT_KEY.to_string(),
        summary: title.to_string(),
        description: Some(json!({
            "type": "doc",
            "content": [{"type": "paragraph",
                         "content": [{"type": "text", "text": title}]}],
        })),
        status_id: "1".to_string(),
        status_name: "Open".to_string(),
        priority_id: Some("3".to_string()),
        reporter_account_id: Some("acct-alice".to_string()),
        assignee_account_id: None,
        parent_key: None,
        labels: vec![],
        fix_versions: vec![],
        attachments: vec![],
        comments: vec![],
        links: vec![],
        created: Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap(),
        updated: Utc.with_ymd_and_hms(2024, 3, 2, 10, 0, 0).unwrap(),
    }
}

pub fn remote_user(account_id: &str, name: &str, email: &str) -> RemoteUser {
    RemoteUser {
        account_id: account_id.to_string(),
        display_name: name.to_string(),
        email: Some(email.to_string()),
        avatar_url: None,
        active: true,
    }
}

pub fn blocks_link(target_key: &str, outward: bool) -> RemoteIssueLink {
    RemoteIssueLink {
        link_type_id: BLOCKS_TYPE.to_string(),
        link_type_name: "Blocks".to_string(),
        target_key: target_key.to_string(),
        target_project_key: target_key
            .rsplit_once('-')
            .map_or(target_key, |(prefix, _)| prefix)
            .to_string(),
        outward,
    }
}

pub fn attachment(id: &str, filename: &str) -> RemoteAttachment {
    RemoteAttachment {
        id: id.to_string(),
        filename: filename.to_string(),
        mime_type: "text/plain".to_string(),
        size: 13,
        content_url: format!("{BASE_URL}/secure/attachment/{id}"),
    }
}

pub fn comment(id: &str, author: &str, text: &str) -> RemoteComment {
    RemoteComment {
        id: id.to_string(),
        author_account_id: Some(author.to_string()),
        body: Some(json!({
            "type": "doc",
            "content": [{"type": "paragraph",
                         "content": [{"type": "text", "text": text}]}],
        })),
        created: Utc.with_ymd_and_hms(2024, 3, 3, 9, 0, 0).unwrap(),
        updated: Utc.with_ymd_and_hms(2024, 3, 3, 9, 0, 0).unwrap(),
    }
}

/// Synthetic source project: A parent, B child of A, C blocks B, two users,
/// one label on A, one attachment and one comment on B.
pub fn fixture_issues() -> Vec<RemoteIssue> {
    let mut a = basic_issue("SRC-1", "A: parent epic");
    a.labels = vec!["infra".to_string()];

    let mut b = basic_issue("SRC-2", "B: child of A");
    b.parent_key = Some("SRC-1".to_string());
    b.assignee_account_id = Some("acct-bob".to_string());
    b.attachments = vec![attachment("900", "log.txt")];
    b.comments = vec![comment("5000", "acct-alice", "looks good")];

    let mut c = basic_issue("SRC-3", "C: blocks B");
    c.links = vec![blocks_link("SRC-2", true)];

    vec![a, b, c]
}

/// Fast-retry settings pointed at the fake remote.
pub fn test_settings() -> ImportSettings {
    let mut settings = ImportSettings::default();
    settings.remote.base_url = BASE_URL.to_string();
    settings.blocks_link_types = vec![BLOCKS_TYPE.to_string()];
    settings.transfer = TransferSettings {
        workers: 2,
        attempts: 2,
        retry_delay_ms: 1,
    };
    settings.page_size = 2;
    settings.import_avatars = false;
    settings
}

pub fn test_env(remote: Arc<FakeRemote>, blobs: Arc<MemoryBlobStore>) -> ImportEnv {
    ImportEnv {
        remote,
        blobs,
        notifier: Arc::new(NullNotifier),
        settings: test_settings(),
    }
}

pub fn test_request(workspace_id: Uuid, actor: &str) -> ImportRequest {
    ImportRequest {
        actor: actor.to_string(),
        workspace_id,
        source_project: PROJECT_KEY.to_string(),
    }
}
