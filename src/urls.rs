//! Canonical URLs for archived records.
//!
//! Every record is identified by a URL derived from its source data. The
//! URL is written into the record and is the dedup key of the
//! [`SeenCache`](crate::dispatch::SeenCache).
//!
//! | Kind | Model | URL |
//! |------|-------|-----|
//! | `user`, `organization`, `pull_request` | raw resource | `links.self[0].href` |
//! | `repository` | raw resource | self link without `/browse` |
//! | `issue_comment` | `{pull_request, comment}` | `<pr>/overview?commentId=<id>` |
//! | `pull_request_review_comment` | `{pull_request, comment}` | `<pr>/overview?commentId=<id>#r<id>` |
//! | `pull_request_review` | `{pull_request, activity, commit_id}` | `<pr>#<author>-<commit>` or `<pr>#<activity id>` |
//! | `issue_event` | `{pull_request, activity}` | `<pr>#event-<activity id>` |
//! | `release` | tag + `repository` | `<repo>?at=refs/tags/<displayId>` |
//! | `team` | `{name, project, ...}` | `<origin>/admin/groups/view?name=<name>#<projectKey>` |
//! | `protected_branch` | `{repository, branch_name, ...}` | `<origin>/plugins/servlet/branch-permissions/<KEY>/<slug>#<branch>` |
//! | `attachment` | `{url, ...}` | `url` |

use reqwest::Url;
use serde_json::{json, Value};
use thiserror::Error;

use crate::models::{self_link, Activity, EntityKind};

#[derive(Debug, Error)]
pub enum UrlError {
    #[error("{kind} is missing `{field}`")]
    MissingField { kind: EntityKind, field: &'static str },

    #[error("{kind} has an unparseable URL: {url}")]
    Unparseable { kind: EntityKind, url: String },
}

/// Canonical URL lookup, injected into the dispatcher.
pub trait UrlLookup: Send + Sync {
    fn url_for(&self, kind: EntityKind, model: &Value) -> Result<String, UrlError>;

    /// Template map written to `urls.json`.
    fn templates(&self) -> Value;
}

/// The Bitbucket Server URL scheme.
#[derive(Debug, Default, Clone, Copy)]
pub struct ModelUrls;

impl UrlLookup for ModelUrls {
    fn url_for(&self, kind: EntityKind, model: &Value) -> Result<String, UrlError> {
        match kind {
            EntityKind::User | EntityKind::Organization | EntityKind::PullRequest => {
                link(kind, model)
            }
            EntityKind::Repository => repository_url(model),
            EntityKind::IssueComment => {
                let comment_id = id_of(kind, model.get("comment"), "comment.id")?;
                let mut url = pull_request_url(kind, model)?;
                push_overview(kind, &mut url)?;
                url.query_pairs_mut().append_pair("commentId", &comment_id);
                Ok(url.to_string())
            }
            EntityKind::PullRequestReviewComment => {
                let comment_id = id_of(kind, model.get("comment"), "comment.id")?;
                let mut url = pull_request_url(kind, model)?;
                push_overview(kind, &mut url)?;
                url.query_pairs_mut().append_pair("commentId", &comment_id);
                url.set_fragment(Some(&format!("r{}", comment_id)));
                Ok(url.to_string())
            }
            EntityKind::PullRequestReview => {
                let mut url = pull_request_url(kind, model)?;
                url.set_fragment(Some(&review_fragment(model)?));
                Ok(url.to_string())
            }
            EntityKind::IssueEvent => {
                let activity_id = id_of(kind, model.get("activity"), "activity.id")?;
                let mut url = pull_request_url(kind, model)?;
                url.set_fragment(Some(&format!("event-{}", activity_id)));
                Ok(url.to_string())
            }
            EntityKind::Release => {
                let repository = model.get("repository").ok_or(UrlError::MissingField {
                    kind,
                    field: "repository",
                })?;
                let display_id = str_field(kind, model, "displayId")?;
                let mut url = parse(kind, &repository_url(repository)?)?;
                // Only the tag name is form-encoded, the ref prefix stays literal.
                url.set_query(None);
                url.query_pairs_mut().append_pair("at", display_id);
                let tag = url
                    .query()
                    .and_then(|query| query.strip_prefix("at="))
                    .unwrap_or_default()
                    .to_string();
                url.set_query(Some(&format!("at=refs/tags/{}", tag)));
                Ok(url.to_string())
            }
            EntityKind::Team => {
                let name = str_field(kind, model, "name")?;
                let project = model.get("project").ok_or(UrlError::MissingField {
                    kind,
                    field: "project",
                })?;
                let project_key = str_field(kind, project, "key")?;
                let mut url = parse(kind, &link(kind, project)?)?;
                url.set_path("/admin/groups/view");
                url.set_query(None);
                url.query_pairs_mut().append_pair("name", name);
                url.set_fragment(Some(project_key));
                Ok(url.to_string())
            }
            EntityKind::ProtectedBranch => {
                let repository = model.get("repository").ok_or(UrlError::MissingField {
                    kind,
                    field: "repository",
                })?;
                let branch = str_field(kind, model, "branch_name")?;
                let project_key = repository
                    .pointer("/project/key")
                    .and_then(Value::as_str)
                    .ok_or(UrlError::MissingField {
                        kind,
                        field: "repository.project.key",
                    })?;
                let slug = str_field(kind, repository, "slug")?;

                // There is no page per branch, so the branch name is the fragment.
                let raw = repository_url(repository)?;
                let mut url = parse(kind, &raw)?;
                url.set_query(None);
                url.path_segments_mut()
                    .map_err(|_| unparseable(kind, &raw))?
                    .clear()
                    .extend(["plugins", "servlet", "branch-permissions", project_key, slug]);
                url.set_fragment(Some(branch));
                Ok(url.to_string())
            }
            EntityKind::Attachment => Ok(str_field(kind, model, "url")?.to_string()),
        }
    }

    fn templates(&self) -> Value {
        let repo = "{scheme}://{host}/projects/{owner}/repos/{repository}";
        let pr = format!("{}/pull-requests/{{number}}", repo);
        json!({
            "user": "{scheme}://{host}/users/{user}",
            "organization": "{scheme}://{host}/projects/{organization}",
            "team": "{scheme}://{host}/admin/groups/view?name={team}#{organization}",
            "repository": repo,
            "release": format!("{}?at=refs/tags/{{release}}", repo),
            "protected_branch": "{scheme}://{host}/plugins/servlet/branch-permissions/{owner}/{repository}#{protected_branch}",
            "attachment": format!("{}/attachments/{{attachment}}", repo),
            "pull_request": pr.clone(),
            "pull_request_review": format!("{}#{{review}}", pr),
            "pull_request_review_comment": format!(
                "{}/overview?commentId={{pull_request_review_comment}}#r{{pull_request_review_comment}}",
                pr
            ),
            "issue_comment": format!("{}/overview?commentId={{issue_comment}}", pr),
            "issue_event": format!("{}#event-{{event}}", pr),
        })
    }
}

fn push_overview(kind: EntityKind, url: &mut Url) -> Result<(), UrlError> {
    let raw = url.to_string();
    url.path_segments_mut()
        .map_err(|_| unparseable(kind, &raw))?
        .pop_if_empty()
        .push("overview");
    Ok(())
}

fn link(kind: EntityKind, model: &Value) -> Result<String, UrlError> {
    self_link(model)
        .map(str::to_string)
        .ok_or(UrlError::MissingField {
            kind,
            field: "links.self",
        })
}

fn repository_url(model: &Value) -> Result<String, UrlError> {
    let href = link(EntityKind::Repository, model)?;
    Ok(href.strip_suffix("/browse").unwrap_or(&href).to_string())
}

fn pull_request_url(kind: EntityKind, model: &Value) -> Result<Url, UrlError> {
    let pull_request = model.get("pull_request").ok_or(UrlError::MissingField {
        kind,
        field: "pull_request",
    })?;
    parse(kind, &link(kind, pull_request)?)
}

/// `<author>-<commit>` for a grouped diff-comment review, else the
/// activity id.
fn review_fragment(model: &Value) -> Result<String, UrlError> {
    let kind = EntityKind::PullRequestReview;
    let raw = model.get("activity").ok_or(UrlError::MissingField {
        kind,
        field: "activity",
    })?;
    let activity_id = id_of(kind, Some(raw), "activity.id")?;

    let is_diff_group = Activity::parse(raw.clone())
        .map(|a| a.is_diff_comment() || a.is_file_comment())
        .unwrap_or(false);
    if !is_diff_group {
        return Ok(activity_id);
    }

    let author = raw
        .pointer("/comment/author/slug")
        .or_else(|| raw.pointer("/user/slug"))
        .and_then(Value::as_str)
        .ok_or(UrlError::MissingField {
            kind,
            field: "activity.comment.author.slug",
        })?;
    let commit_id = model.get("commit_id").and_then(Value::as_str).unwrap_or("");
    Ok(format!("{}-{}", author, commit_id))
}

fn id_of(kind: EntityKind, model: Option<&Value>, field: &'static str) -> Result<String, UrlError> {
    match model.and_then(|m| m.get("id")) {
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(Value::String(s)) => Ok(s.clone()),
        _ => Err(UrlError::MissingField { kind, field }),
    }
}

fn str_field<'a>(kind: EntityKind, model: &'a Value, field: &'static str) -> Result<&'a str, UrlError> {
    model
        .get(field)
        .and_then(Value::as_str)
        .ok_or(UrlError::MissingField { kind, field })
}

fn parse(kind: EntityKind, url: &str) -> Result<Url, UrlError> {
    Url::parse(url).map_err(|_| unparseable(kind, url))
}

fn unparseable(kind: EntityKind, url: &str) -> UrlError {
    UrlError::Unparseable {
        kind,
        url: url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PR: &str = "https://bbs.example.com/projects/MIGR/repos/hugo/pull-requests/1";

    fn pull_request() -> Value {
        json!({"id": 1, "links": {"self": [{"href": PR}]}})
    }

    #[test]
    fn self_link_kinds() {
        let user = json!({"links": {"self": [{"href": "https://bbs.example.com/users/ann"}]}});
        assert_eq!(
            ModelUrls.url_for(EntityKind::User, &user).unwrap(),
            "https://bbs.example.com/users/ann"
        );
        assert!(matches!(
            ModelUrls.url_for(EntityKind::User, &json!({})),
            Err(UrlError::MissingField { .. })
        ));
    }

    #[test]
    fn repository_drops_browse() {
        let repo = json!({"links": {"self": [{"href": "https://bbs.example.com/projects/MIGR/repos/hugo/browse"}]}});
        assert_eq!(
            ModelUrls.url_for(EntityKind::Repository, &repo).unwrap(),
            "https://bbs.example.com/projects/MIGR/repos/hugo"
        );
    }

    #[test]
    fn comment_urls() {
        let model = json!({"pull_request": pull_request(), "comment": {"id": 42}});
        assert_eq!(
            ModelUrls.url_for(EntityKind::IssueComment, &model).unwrap(),
            format!("{}/overview?commentId=42", PR)
        );
        assert_eq!(
            ModelUrls
                .url_for(EntityKind::PullRequestReviewComment, &model)
                .unwrap(),
            format!("{}/overview?commentId=42#r42", PR)
        );
    }

    #[test]
    fn review_urls() {
        let grouped = json!({
            "pull_request": pull_request(),
            "commit_id": "abc123",
            "activity": {
                "id": 7, "createdDate": 1, "action": "COMMENTED", "commentAction": "ADDED",
                "comment": {"id": 9, "author": {"slug": "ann"}},
                "commentAnchor": {"path": "a.rs", "line": 1}
            }
        });
        assert_eq!(
            ModelUrls.url_for(EntityKind::PullRequestReview, &grouped).unwrap(),
            format!("{}#ann-abc123", PR)
        );

        let approval = json!({
            "pull_request": pull_request(),
            "commit_id": "abc123",
            "activity": {"id": 8, "createdDate": 1, "action": "APPROVED"}
        });
        assert_eq!(
            ModelUrls.url_for(EntityKind::PullRequestReview, &approval).unwrap(),
            format!("{}#8", PR)
        );
    }

    #[test]
    fn issue_event_url() {
        let model = json!({"pull_request": pull_request(), "activity": {"id": 11}});
        assert_eq!(
            ModelUrls.url_for(EntityKind::IssueEvent, &model).unwrap(),
            format!("{}#event-11", PR)
        );
    }

    #[test]
    fn release_url_encodes_only_the_tag_name() {
        let repository = json!({"links": {"self": [{"href": "https://bbs.example.com/projects/MIGR/repos/hugo/browse"}]}});
        let tag = json!({"displayId": "v1.0 beta", "repository": repository});
        assert_eq!(
            ModelUrls.url_for(EntityKind::Release, &tag).unwrap(),
            "https://bbs.example.com/projects/MIGR/repos/hugo?at=refs/tags/v1.0+beta"
        );

        let nested = json!({"displayId": "release/2.0&rc", "repository": repository});
        assert_eq!(
            ModelUrls.url_for(EntityKind::Release, &nested).unwrap(),
            "https://bbs.example.com/projects/MIGR/repos/hugo?at=refs/tags/release%2F2.0%26rc"
        );
    }

    #[test]
    fn team_url() {
        let team = json!({
            "name": "Core Devs",
            "project": {"key": "MIGR", "links": {"self": [{"href": "https://bbs.example.com/projects/MIGR"}]}}
        });
        assert_eq!(
            ModelUrls.url_for(EntityKind::Team, &team).unwrap(),
            "https://bbs.example.com/admin/groups/view?name=Core+Devs#MIGR"
        );
    }

    #[test]
    fn protected_branch_url() {
        let model = json!({
            "branch_name": "release/1.0",
            "repository": {
                "slug": "hugo",
                "project": {"key": "MIGR"},
                "links": {"self": [{"href": "https://bbs.example.com/projects/MIGR/repos/hugo/browse"}]}
            }
        });
        assert_eq!(
            ModelUrls.url_for(EntityKind::ProtectedBranch, &model).unwrap(),
            "https://bbs.example.com/plugins/servlet/branch-permissions/MIGR/hugo#release/1.0"
        );
        assert!(matches!(
            ModelUrls.url_for(EntityKind::ProtectedBranch, &json!({"branch_name": "master"})),
            Err(UrlError::MissingField { field: "repository", .. })
        ));
    }

    #[test]
    fn templates_cover_every_kind() {
        let templates = ModelUrls.templates();
        for kind in EntityKind::ALL {
            assert!(templates.get(kind.as_str()).is_some(), "{kind}");
        }
    }
}
