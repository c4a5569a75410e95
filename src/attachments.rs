//! Inline attachments in pull-request and comment bodies.
//!
//! Bitbucket Server stores uploads per repository and links them from
//! markdown as `attachment:<repoId>/<id>%2F<name>`. On export each link is
//! rewritten to `<repository url>/attachments/<id>/<name>`, the blob is
//! downloaded once and stored as `attachments/<hash>.<ext>`, and an
//! `attachment` record ties it to its parent.

use anyhow::Result;
use reqwest::StatusCode;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::ops::Range;
use std::path::Path;

use crate::bitbucket::{RepositoryApi, ResourceError};
use crate::client::ApiError;
use crate::dispatch::Dispatcher;
use crate::models::EntityKind;

const SCHEME: &str = "attachment:";

/// One `attachment:` link found in a body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentLink {
    /// Byte range of the whole link in the body.
    pub span: Range<usize>,
    pub repo_id: String,
    pub id: String,
    pub name: String,
}

impl AttachmentLink {
    pub fn url(&self, repository_url: &str) -> String {
        format!("{}/attachments/{}/{}", repository_url, self.id, self.name)
    }
}

/// Scan a markdown body for attachment links. A link ends at whitespace,
/// a closing bracket or a quote.
pub fn find_links(body: &str) -> Vec<AttachmentLink> {
    let mut links = Vec::new();
    let mut offset = 0;

    while let Some(pos) = body[offset..].find(SCHEME) {
        let start = offset + pos;
        let target_start = start + SCHEME.len();
        let target_len = body[target_start..]
            .find(|c: char| c.is_whitespace() || matches!(c, ')' | ']' | '"' | '\'' | '>'))
            .unwrap_or(body.len() - target_start);
        let end = target_start + target_len;

        if let Some((repo_id, id, name)) = parse_target(&body[target_start..end]) {
            links.push(AttachmentLink {
                span: start..end,
                repo_id,
                id,
                name,
            });
        }
        offset = end.max(target_start);
    }

    links
}

/// `<repoId>/<id>%2F<name>`
fn parse_target(target: &str) -> Option<(String, String, String)> {
    let (repo_id, path) = target.split_once('/')?;
    let sep = path.find("%2F").or_else(|| path.find("%2f"))?;
    let id = &path[..sep];
    let name = &path[sep + 3..];

    if repo_id.is_empty() || id.is_empty() || name.is_empty() {
        return None;
    }
    Some((repo_id.to_string(), id.to_string(), name.to_string()))
}

/// Replace every attachment link with its repository URL.
pub fn rewrite_body(body: &str, links: &[AttachmentLink], repository_url: &str) -> String {
    let mut out = String::with_capacity(body.len());
    let mut last = 0;
    for link in links {
        out.push_str(&body[last..link.span.start]);
        out.push_str(&link.url(repository_url));
        last = link.span.end;
    }
    out.push_str(&body[last..]);
    out
}

/// `<first 32 hex chars of sha256(url)>.<ext>`
pub fn asset_file_name(url: &str, name: &str) -> String {
    let digest = hex::encode(Sha256::digest(url.as_bytes()));
    let stem = &digest[..32];
    match Path::new(name).extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{}.{}", stem, ext.to_ascii_lowercase()),
        None => stem.to_string(),
    }
}

/// Where the attachments of one body hang off.
pub struct AttachmentParent<'a> {
    pub kind: EntityKind,
    pub model: &'a Value,
    pub user: &'a Value,
    pub created_date: i64,
}

/// Download, store and record the attachments linked from `body`, and
/// return the body with the links rewritten.
///
/// An attachment the server no longer has is logged and left out.
pub async fn export_attachments(
    repository: &RepositoryApi<'_>,
    dispatcher: &mut Dispatcher,
    repository_url: &str,
    body: &str,
    parent: &AttachmentParent<'_>,
) -> Result<String> {
    let links = find_links(body);
    if links.is_empty() {
        return Ok(body.to_string());
    }

    let parent_url = dispatcher.url_for(parent.kind, parent.model)?;
    let mut downloaded = HashSet::new();

    for link in &links {
        let url = link.url(repository_url);
        if !downloaded.insert(url.clone()) || dispatcher.archive().is_seen(EntityKind::Attachment, &url) {
            continue;
        }

        let (bytes, content_type) = match repository.attachment(&link.id).await {
            Ok(found) => found,
            Err(ResourceError::Api(ApiError::Status { status, .. })) if status == StatusCode::NOT_FOUND => {
                tracing::warn!(%url, "attachment not found, skipping");
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        let file_name = asset_file_name(&url, &link.name);
        dispatcher.archive().save_attachment(&bytes, &[file_name.as_str()])?;

        let model = json!({
            "url": url,
            "parent_type": parent.kind.as_str(),
            "parent_url": parent_url,
            "user": parent.user,
            "created_date": parent.created_date,
            "asset_url": format!("tarball://root/attachments/{}", file_name),
            "name": link.name,
            "content_type": content_type,
        });
        dispatcher.serialize(EntityKind::Attachment, &model)?;
    }

    Ok(rewrite_body(body, &links, repository_url))
}
