//! Rich-text rewriting rules, exercised against a live session context.

mod common;

use std::sync::Arc;

use chrono::Utc;
use serde_json::{Value, json};
use uuid::Uuid;

use common::{FakeRemote, MemoryBlobStore, test_env, test_request};
use gantry::import::rewrite::{RewriteScope, rewrite_document};
use gantry::import::ImportContext;
use gantry::model::{Comment, Project};
use gantry::storage::SqliteStorage;

fn context() -> ImportContext {
    let workspace_id = Uuid::new_v4();
    let remote = Arc::new(FakeRemote::new(vec![]));
    let ctx = ImportContext::new(
        test_request(workspace_id, "alice"),
        test_env(remote, Arc::new(MemoryBlobStore::default())),
        SqliteStorage::open_memory().unwrap(),
    );
    ctx.set_project(Project {
        id: Uuid::new_v4(),
        workspace_id,
        key: "SRC".to_string(),
        name: "Source".to_string(),
        description: String::new(),
        source_key: "SRC".to_string(),
        created_at: Utc::now(),
    });
    ctx
}

fn scope() -> RewriteScope {
    RewriteScope {
        issue_id: Uuid::new_v4(),
        comment_id: None,
    }
}

fn rewrite(ctx: &ImportContext, doc: Value) -> Value {
    let rewritten = rewrite_document(ctx, scope(), &doc);
    serde_json::from_str(&rewritten).unwrap()
}

fn doc_with(content: Value) -> Value {
    json!({"type": "doc", "version": 1, "content": [content]})
}

#[test]
fn emoticons_are_removed_and_code_blocks_normalized() {
    let ctx = context();
    let out = rewrite(
        &ctx,
        json!({"type": "doc", "content": [
            {"type": "emoji", "attrs": {"shortName": ":tada:"}},
            {"type": "codeBlock", "attrs": {"language": "rust"},
             "content": [{"type": "text", "text": "fn main() {}"}]},
        ]}),
    );

    let content = out["content"].as_array().unwrap();
    assert_eq!(content.len(), 1, "the emoji node is dropped");
    assert_eq!(content[0]["type"], "pre");
    assert_eq!(content[0]["attrs"]["language"], "rust");
}

#[test]
fn color_marks_are_normalized() {
    let ctx = context();
    let out = rewrite(
        &ctx,
        doc_with(json!({"type": "paragraph", "content": [
            {"type": "text", "text": "hot",
             "marks": [{"type": "textColor", "attrs": {"color": "#ff5630"}}]},
        ]})),
    );

    let mark = &out["content"][0]["content"][0]["marks"][0];
    assert_eq!(mark["type"], "color");
    assert_eq!(mark["attrs"]["color"], "#ff5630");
}

#[test]
fn mentions_resolve_through_the_user_map() {
    let ctx = context();
    let out = rewrite(
        &ctx,
        doc_with(json!({"type": "paragraph", "content": [
            {"type": "mention", "attrs": {"id": "acct-alice", "text": "@Alice"}},
        ]})),
    );

    let mention = &out["content"][0]["content"][0];
    assert_eq!(mention["type"], "mention");
    assert_eq!(mention["attrs"]["label"], "Alice");

    // The same account resolved again maps to the same target user.
    let user = ctx.users().get(&"acct-alice".to_string()).unwrap();
    assert_eq!(mention["attrs"]["user_id"], json!(user.id));
}

#[test]
fn same_project_issue_links_become_deep_links() {
    let ctx = context();
    let href = format!("{}/browse/SRC-7", common::BASE_URL);
    let out = rewrite(
        &ctx,
        doc_with(json!({"type": "paragraph", "content": [
            {"type": "text", "text": "see SRC-7",
             "marks": [{"type": "link", "attrs": {"href": href}}]},
        ]})),
    );

    let allocated = ctx.issue_ids().get(&"SRC-7".to_string()).unwrap();
    let mark = &out["content"][0]["content"][0]["marks"][0];
    assert_eq!(mark["attrs"]["href"], format!("/issues/{allocated}"));
}

#[test]
fn cross_project_links_stay_external_with_annotations() {
    let ctx = context();
    let href = format!("{}/browse/OTHER-9", common::BASE_URL);
    let out = rewrite(
        &ctx,
        doc_with(json!({"type": "paragraph", "content": [
            {"type": "text", "text": "elsewhere",
             "marks": [{"type": "link", "attrs": {"href": href}}]},
        ]})),
    );

    let mark = &out["content"][0]["content"][0]["marks"][0];
    assert_eq!(mark["attrs"]["href"], href);
    assert_eq!(mark["attrs"]["source_project"], "OTHER");
    assert_eq!(mark["attrs"]["source_issue"], "OTHER-9");
    assert!(ctx.issue_ids().get(&"OTHER-9".to_string()).is_none());
}

#[test]
fn comment_permalinks_deep_link_only_when_imported() {
    let ctx = context();
    let href = format!(
        "{}/browse/SRC-7?focusedCommentId=123",
        common::BASE_URL
    );
    let doc = doc_with(json!({"type": "paragraph", "content": [
        {"type": "text", "text": "discussion",
         "marks": [{"type": "link", "attrs": {"href": href}}]},
    ]}));

    // Not imported yet: preserved external, annotated.
    let out = rewrite(&ctx, doc.clone());
    let mark = &out["content"][0]["content"][0]["marks"][0];
    assert_eq!(mark["attrs"]["href"], href);
    assert_eq!(mark["attrs"]["source_issue"], "SRC-7");

    // Stage the comment, rewrite again: internal deep link.
    let issue_id = Uuid::new_v4();
    let comment_id = Uuid::new_v4();
    ctx.comments().insert(
        "123".to_string(),
        Comment {
            id: comment_id,
            issue_id,
            author_id: None,
            body: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            source_id: "123".to_string(),
        },
    );
    let out = rewrite(&ctx, doc);
    let mark = &out["content"][0]["content"][0]["marks"][0];
    assert_eq!(
        mark["attrs"]["href"],
        format!("/issues/{issue_id}#comment-{comment_id}")
    );
}

#[test]
fn inline_images_register_deduplicated_descriptors() {
    let ctx = context();
    let media = json!({"type": "mediaSingle", "content": [
        {"type": "media", "attrs": {"type": "file", "id": "900", "width": 320}},
    ]});

    let out = rewrite(&ctx, doc_with(media.clone()));
    assert_eq!(ctx.attachments().len(), 1);

    let group = &out["content"][0];
    assert_eq!(group["type"], "image_group");
    let image = &group["content"][0];
    assert_eq!(image["type"], "image");
    assert_eq!(image["attrs"]["width"], 320);

    let descriptor = &ctx.attachments().values()[0];
    assert_eq!(
        image["attrs"]["src"],
        format!("/assets/{}", descriptor.asset_id)
    );

    // The same source id seen again does not register a second descriptor.
    let again = rewrite(&ctx, doc_with(media));
    assert_eq!(ctx.attachments().len(), 1);
    assert_eq!(
        again["content"][0]["content"][0]["attrs"]["src"],
        format!("/assets/{}", descriptor.asset_id)
    );
}
