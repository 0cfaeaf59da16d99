//! Rich-text rewriter.
//!
//! Walks the remote tracker's JSON document tree depth-first and produces
//! the local markup model: formatting normalized, decorative icons dropped,
//! mentions and permalinks resolved through the session's resolve-maps, and
//! inline images registered as attachment descriptors pointing at their
//! eventual storage path.
//!
//! A rewrite failure is scoped to one document: the error is logged and the
//! document is passed through unmodified. Rewriting never fails a pipeline
//! step.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::error::Result;

use super::context::{AttachmentSource, ImportContext};
use super::mapper;

/// Path of an issue permalink under the remote base URL.
static BROWSE_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^/browse/([A-Za-z][A-Za-z0-9_]*-\d+)(?:\?(.*))?$").expect("browse path regex")
});

/// `focusedCommentId` query parameter of a comment permalink.
static COMMENT_PARAM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|&)focusedCommentId=(\d+)").expect("comment param regex"));

/// What the rewritten nodes belong to, for attachment registration.
#[derive(Debug, Clone, Copy)]
pub struct RewriteScope {
    pub issue_id: Uuid,
    pub comment_id: Option<Uuid>,
}

/// Rewrite one document, returning the serialized local document.
///
/// Falls back to the original serialized document when rewriting fails.
pub fn rewrite_document(ctx: &ImportContext, scope: RewriteScope, doc: &Value) -> String {
    match rewrite_root(ctx, scope, doc) {
        Ok(rewritten) => rewritten.to_string(),
        Err(e) => {
            tracing::warn!(
                session = %ctx.id,
                issue = %scope.issue_id,
                error = %e,
                "rich-text rewrite failed; keeping original document"
            );
            doc.to_string()
        }
    }
}

fn rewrite_root(ctx: &ImportContext, scope: RewriteScope, doc: &Value) -> Result<Value> {
    // Some remote fields carry plain strings instead of document trees.
    if let Some(text) = doc.as_str() {
        return Ok(json!({
            "type": "doc",
            "content": [{"type": "paragraph", "content": [{"type": "text", "text": text}]}],
        }));
    }

    Ok(json!({
        "type": "doc",
        "content": rewrite_children(ctx, scope, doc)?,
    }))
}

fn rewrite_children(ctx: &ImportContext, scope: RewriteScope, node: &Value) -> Result<Vec<Value>> {
    let mut out = Vec::new();
    if let Some(children) = node.get("content").and_then(Value::as_array) {
        for child in children {
            if let Some(rewritten) = rewrite_node(ctx, scope, child)? {
                out.push(rewritten);
            }
        }
    }
    Ok(out)
}

fn rewrite_node(ctx: &ImportContext, scope: RewriteScope, node: &Value) -> Result<Option<Value>> {
    let Some(node_type) = node.get("type").and_then(Value::as_str) else {
        return Ok(Some(node.clone()));
    };

    match node_type {
        // Decorative icons carry no content worth keeping.
        "emoji" | "emoticon" => Ok(None),

        "codeBlock" => {
            let language = node
                .pointer("/attrs/language")
                .and_then(Value::as_str)
                .unwrap_or("");
            Ok(Some(json!({
                "type": "pre",
                "attrs": {"language": language},
                "content": rewrite_children(ctx, scope, node)?,
            })))
        }

        "mention" => {
            let Some(account_id) = node.pointer("/attrs/id").and_then(Value::as_str) else {
                return Ok(None);
            };
            let user = mapper::resolve_user(ctx, account_id)?;
            Ok(Some(json!({
                "type": "mention",
                "attrs": {"user_id": user.id, "label": user.name},
            })))
        }

        "media" => rewrite_media(ctx, scope, node),

        "mediaSingle" | "mediaGroup" => {
            let children = rewrite_children(ctx, scope, node)?;
            if children.is_empty() {
                return Ok(None);
            }
            Ok(Some(json!({"type": "image_group", "content": children})))
        }

        "inlineCard" => {
            let Some(url) = node.pointer("/attrs/url").and_then(Value::as_str) else {
                return Ok(None);
            };
            let link = rewrite_href(ctx, url)?;
            Ok(Some(json!({
                "type": "text",
                "text": link.label.clone().unwrap_or_else(|| url.to_string()),
                "marks": [link.into_mark()],
            })))
        }

        "text" => Ok(Some(rewrite_text(ctx, node)?)),

        // Structural nodes pass through with rewritten children.
        _ => {
            let mut rewritten = json!({"type": node_type});
            if let Some(attrs) = node.get("attrs") {
                rewritten["attrs"] = attrs.clone();
            }
            if let Some(text) = node.get("text") {
                rewritten["text"] = text.clone();
            }
            let children = rewrite_children(ctx, scope, node)?;
            if !children.is_empty() {
                rewritten["content"] = Value::Array(children);
            }
            Ok(Some(rewritten))
        }
    }
}

fn rewrite_text(ctx: &ImportContext, node: &Value) -> Result<Value> {
    let text = node.get("text").and_then(Value::as_str).unwrap_or("");
    let mut rewritten = json!({"type": "text", "text": text});

    let Some(marks) = node.get("marks").and_then(Value::as_array) else {
        return Ok(rewritten);
    };

    let mut out_marks = Vec::new();
    for mark in marks {
        let mark_type = mark.get("type").and_then(Value::as_str).unwrap_or("");
        match mark_type {
            "textColor" => {
                let color = mark
                    .pointer("/attrs/color")
                    .and_then(Value::as_str)
                    .unwrap_or("#172b4d");
                out_marks.push(json!({"type": "color", "attrs": {"color": color}}));
            }
            "link" => {
                let href = mark
                    .pointer("/attrs/href")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                out_marks.push(rewrite_href(ctx, href)?.into_mark());
            }
            _ => out_marks.push(mark.clone()),
        }
    }
    if !out_marks.is_empty() {
        rewritten["marks"] = Value::Array(out_marks);
    }
    Ok(rewritten)
}

/// A rewritten hyperlink.
struct RewrittenLink {
    href: String,
    /// Best-effort resolved source identifiers, kept on external links so a
    /// reader can still tell what the link pointed at.
    annotations: Option<(String, String)>,
    label: Option<String>,
}

impl RewrittenLink {
    fn external(href: &str) -> Self {
        Self {
            href: href.to_string(),
            annotations: None,
            label: None,
        }
    }

    fn into_mark(self) -> Value {
        let mut attrs = json!({"href": self.href});
        if let Some((project, issue)) = self.annotations {
            attrs["source_project"] = Value::String(project);
            attrs["source_issue"] = Value::String(issue);
        }
        json!({"type": "link", "attrs": attrs})
    }
}

/// Rewrite a permalink to a local deep link where possible.
///
/// Same-project issue permalinks become `/issues/<id>`; comment permalinks
/// become `/issues/<id>#comment-<id>` when the comment was imported this
/// session, otherwise the external link is kept and annotated. Cross-project
/// links always stay external.
fn rewrite_href(ctx: &ImportContext, href: &str) -> Result<RewrittenLink> {
    let base = ctx.settings().remote.base_url.trim_end_matches('/');
    let Some(path) = href.strip_prefix(base).filter(|_| !base.is_empty()) else {
        return Ok(RewrittenLink::external(href));
    };
    let Some(captures) = BROWSE_PATH.captures(path) else {
        return Ok(RewrittenLink::external(href));
    };

    let issue_key = captures.get(1).map_or("", |m| m.as_str()).to_string();
    let issue_project = issue_key
        .rsplit_once('-')
        .map_or(issue_key.as_str(), |(prefix, _)| prefix)
        .to_string();
    let query = captures.get(2).map_or("", |m| m.as_str());
    let comment_id = COMMENT_PARAM
        .captures(query)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string());

    let same_project = issue_project == ctx.source_project;

    if let Some(comment_source_id) = comment_id {
        if same_project {
            if let Some(comment) = ctx.comments().get(&comment_source_id) {
                return Ok(RewrittenLink {
                    href: format!("/issues/{}#comment-{}", comment.issue_id, comment.id),
                    annotations: None,
                    label: Some(issue_key),
                });
            }
        }
        // Comment not imported in this session: preserve the external link,
        // annotated with what we could resolve.
        return Ok(RewrittenLink {
            href: href.to_string(),
            annotations: Some((issue_project, issue_key)),
            label: None,
        });
    }

    if same_project {
        let issue_id = ctx
            .issue_ids()
            .get_or_resolve(&issue_key, || Ok(Uuid::new_v4()))?;
        return Ok(RewrittenLink {
            href: format!("/issues/{issue_id}"),
            annotations: None,
            label: Some(issue_key),
        });
    }

    Ok(RewrittenLink {
        href: href.to_string(),
        annotations: Some((issue_project, issue_key)),
        label: None,
    })
}

fn rewrite_media(
    ctx: &ImportContext,
    scope: RewriteScope,
    node: &Value,
) -> Result<Option<Value>> {
    let attrs = node.get("attrs").cloned().unwrap_or_else(|| json!({}));
    let media_kind = attrs.get("type").and_then(Value::as_str).unwrap_or("file");

    let (source, name) = match media_kind {
        "external" => {
            let Some(url) = attrs.get("url").and_then(Value::as_str) else {
                return Ok(None);
            };
            let name = url
                .rsplit('/')
                .next()
                .filter(|n| !n.is_empty())
                .unwrap_or("image")
                .to_string();
            (
                AttachmentSource::External {
                    url: url.to_string(),
                },
                name,
            )
        }
        _ => {
            let Some(id) = attrs.get("id").and_then(Value::as_str) else {
                return Ok(None);
            };
            let base = ctx.settings().remote.base_url.trim_end_matches('/');
            let name = attrs
                .get("alt")
                .and_then(Value::as_str)
                .map_or_else(|| format!("attachment-{id}"), ToString::to_string);
            (
                AttachmentSource::Remote {
                    id: id.to_string(),
                    content_url: format!("{base}/rest/api/3/attachment/content/{id}"),
                },
                name,
            )
        }
    };

    // Width from markup when present, otherwise probed from the image bytes.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let width = attrs
        .get("width")
        .and_then(Value::as_u64)
        .map(|w| w as u32)
        .or_else(|| probe_image_width(ctx, source.url()));

    let asset_id = ctx.register_attachment(
        source,
        scope.issue_id,
        scope.comment_id,
        name.clone(),
        "application/octet-stream".to_string(),
        0,
    );

    let mut image_attrs = json!({"src": format!("/assets/{asset_id}"), "alt": name});
    if let Some(w) = width {
        image_attrs["width"] = Value::from(w);
    }
    Ok(Some(json!({"type": "image", "attrs": image_attrs})))
}

/// Fetch an image and decode just enough of its header to learn the width.
/// Any failure leaves the width unset.
fn probe_image_width(ctx: &ImportContext, url: &str) -> Option<u32> {
    match ctx.remote().fetch_content(url) {
        Ok((bytes, _)) => decode_image_width(&bytes),
        Err(e) => {
            tracing::debug!(url, error = %e, "image width probe failed");
            None
        }
    }
}

/// Decode the pixel width from PNG, GIF, or JPEG header bytes.
#[must_use]
pub fn decode_image_width(bytes: &[u8]) -> Option<u32> {
    // PNG: 8-byte signature, IHDR width at offset 16.
    if bytes.len() >= 24 && bytes.starts_with(&[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a]) {
        return Some(u32::from_be_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]));
    }

    // GIF: logical screen width at offset 6, little endian.
    if bytes.len() >= 10 && (bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a")) {
        return Some(u32::from(u16::from_le_bytes([bytes[6], bytes[7]])));
    }

    // JPEG: scan segments for a start-of-frame marker.
    if bytes.len() >= 4 && bytes[0] == 0xff && bytes[1] == 0xd8 {
        let mut i = 2;
        while i + 9 < bytes.len() {
            if bytes[i] != 0xff {
                return None;
            }
            let marker = bytes[i + 1];
            // SOF0..SOF15, excluding DHT/JPG/DAC.
            if (0xc0..=0xcf).contains(&marker) && ![0xc4, 0xc8, 0xcc].contains(&marker) {
                return Some(u32::from(u16::from_be_bytes([bytes[i + 7], bytes[i + 8]])));
            }
            let len = usize::from(u16::from_be_bytes([bytes[i + 2], bytes[i + 3]]));
            i += 2 + len;
        }
    }

    None
}
