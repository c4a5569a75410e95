//! Record shaping and validation.
//!
//! A [`Transformer`] turns a Bitbucket Server resource (or a composite
//! model built by the exporter) into the archive record for one
//! [`EntityKind`]. Every record carries `type` and `url`; cross-references
//! to other records are their canonical URLs. Epoch-millisecond timestamps
//! become RFC 3339 strings.
//!
//! Missing required data (an author, a user, a comment body, a timestamp)
//! is a [`ValidationError`]; the dispatcher logs it and skips the record.

use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::branch_permissions::RestrictionKind;
use crate::models::{Activity, ActivityAction, EntityKind};
use crate::urls::{UrlError, UrlLookup};

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("{kind} is invalid: {field} can't be blank")]
    Blank { kind: EntityKind, field: String },

    #[error("{kind} is invalid: {field} {reason}")]
    Invalid {
        kind: EntityKind,
        field: String,
        reason: String,
    },

    #[error(transparent)]
    Url(#[from] UrlError),
}

pub trait Transformer: Send + Sync {
    fn transform(
        &self,
        kind: EntityKind,
        model: &Value,
        urls: &dyn UrlLookup,
    ) -> Result<Value, ValidationError>;
}

/// Record layout for a migration import.
#[derive(Debug, Clone)]
pub struct DefaultTransformer {
    /// `created_at` for resources the server does not timestamp.
    created_at: String,
}

impl Default for DefaultTransformer {
    fn default() -> Self {
        Self::at(Utc::now())
    }
}

impl DefaultTransformer {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            created_at: now.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

impl Transformer for DefaultTransformer {
    fn transform(
        &self,
        kind: EntityKind,
        model: &Value,
        urls: &dyn UrlLookup,
    ) -> Result<Value, ValidationError> {
        let url = urls.url_for(kind, model)?;
        let f = Fields { kind, model, urls };

        let body = match kind {
            EntityKind::User => self.user(&f)?,
            EntityKind::Organization => self.organization(&f)?,
            EntityKind::Team => self.team(&f)?,
            EntityKind::Repository => self.repository(&f)?,
            EntityKind::PullRequest => pull_request(&f)?,
            EntityKind::PullRequestReview => pull_request_review(&f)?,
            EntityKind::PullRequestReviewComment => pull_request_review_comment(&f)?,
            EntityKind::IssueComment => issue_comment(&f)?,
            EntityKind::IssueEvent => issue_event(&f)?,
            EntityKind::Release => release(&f)?,
            EntityKind::ProtectedBranch => protected_branch(&f)?,
            EntityKind::Attachment => attachment(&f)?,
        };

        let mut record = Map::new();
        record.insert("type".to_string(), Value::from(kind.as_str()));
        record.insert("url".to_string(), Value::from(url));
        if let Value::Object(fields) = body {
            record.extend(fields);
        }
        Ok(Value::Object(record))
    }
}

impl DefaultTransformer {
    fn user(&self, f: &Fields) -> Result<Value, ValidationError> {
        let emails: Vec<Value> = f
            .opt_str("/emailAddress")
            .map(|address| json!({ "address": address, "primary": true }))
            .into_iter()
            .collect();

        Ok(json!({
            "login": f.str("/slug")?,
            "name": f.opt_str("/displayName").unwrap_or_else(|| f.opt_str("/name").unwrap_or("")),
            "company": null,
            "website": null,
            "location": null,
            "emails": emails,
            "created_at": self.created_at,
        }))
    }

    fn organization(&self, f: &Fields) -> Result<Value, ValidationError> {
        let mut members = Vec::new();
        for member in f.opt_array("/members") {
            let user = member.get("user").ok_or_else(|| blank(f.kind, "/members/user"))?;
            let role = match member.get("permission").and_then(Value::as_str) {
                Some("PROJECT_ADMIN") => "admin",
                _ => "direct_member",
            };
            members.push(json!({
                "user": f.urls.url_for(EntityKind::User, user)?,
                "role": role,
                "state": "active",
            }));
        }

        Ok(json!({
            "login": f.str("/key")?,
            "name": f.str("/name")?,
            "description": f.opt_str("/description").unwrap_or(""),
            "website": null,
            "location": null,
            "email": null,
            "members": members,
            "created_at": self.created_at,
        }))
    }

    /// Teams from branch permissions carry no permission and no
    /// repositories.
    fn team(&self, f: &Fields) -> Result<Value, ValidationError> {
        let repositories = f.array("/repositories")?;
        let access = match f.opt_str("/permission") {
            Some(permission) => access_level(permission).ok_or_else(|| ValidationError::Invalid {
                kind: f.kind,
                field: "permission".to_string(),
                reason: format!("{} is not a known permission", permission),
            })?,
            None if repositories.is_empty() => "pull",
            None => return Err(blank(f.kind, "/permission")),
        };

        let repositories: Vec<Value> = repositories
            .iter()
            .map(|repository| json!({ "repository": repository, "access": access }))
            .collect();
        let members: Vec<Value> = f
            .array("/members")?
            .iter()
            .map(|member| json!({ "user": member, "role": "member" }))
            .collect();

        Ok(json!({
            "organization": f.url_of(EntityKind::Organization, "/project")?,
            "name": f.str("/name")?,
            "permissions": repositories,
            "members": members,
            "created_at": self.created_at,
        }))
    }

    fn repository(&self, f: &Fields) -> Result<Value, ValidationError> {
        let project_key = f.str("/project/key")?;
        let slug = f.str("/slug")?;
        let repo_public = f
            .get("/public")?
            .as_bool()
            .ok_or_else(|| ValidationError::Invalid {
                kind: f.kind,
                field: "public".to_string(),
                reason: "must be true or false".to_string(),
            })?;
        let project_public = f
            .opt("/project/public")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let mut collaborators = Vec::new();
        for member in f.array("/collaborators")? {
            let user = member
                .get("user")
                .ok_or_else(|| blank(f.kind, "/collaborators/user"))?;
            let permission = member.get("permission").and_then(Value::as_str).unwrap_or("");
            collaborators.push(json!({
                "user": f.urls.url_for(EntityKind::User, user)?,
                "permission": access_level(permission).unwrap_or("pull"),
            }));
        }

        let public_keys: Vec<Value> = f
            .opt_array("/access_keys")
            .iter()
            .map(|access_key| {
                let text = access_key.pointer("/key/text").and_then(Value::as_str);
                json!({
                    "title": access_key.pointer("/key/label"),
                    "key": text,
                    "read_only": access_key.get("permission").and_then(Value::as_str) == Some("REPO_READ"),
                    "fingerprint": text.and_then(ssh_fingerprint),
                    "created_at": self.created_at,
                })
            })
            .collect();

        Ok(json!({
            "owner": f.url_of(EntityKind::Organization, "/project")?,
            "name": slug,
            "description": f.opt_str("/description").unwrap_or(""),
            "private": !(project_public || repo_public),
            "has_issues": false,
            "has_wiki": false,
            "has_downloads": false,
            "labels": [],
            "collaborators": collaborators,
            "created_at": self.created_at,
            "git_url": format!("tarball://root/repositories/{}/{}.git", project_key, slug),
            "default_branch": f.opt_str("/default_branch").unwrap_or("master"),
            "public_keys": public_keys,
        }))
    }
}

fn pull_request(f: &Fields) -> Result<Value, ValidationError> {
    let state = f.str("/state")?;
    let updated_at = f.timestamp("/updatedDate")?;
    let owner = f.url_of(EntityKind::Organization, "/owner")?;
    let repository = f.url_of(EntityKind::Repository, "/repository")?;

    let merged_at = (state == "MERGED").then(|| updated_at.clone());
    let closed_at = matches!(state, "MERGED" | "DECLINED").then(|| updated_at.clone());

    Ok(json!({
        "user": f.url_of(EntityKind::User, "/author/user")?,
        "repository": repository,
        "title": f.opt_str("/title").unwrap_or(""),
        "body": f.opt_str("/description").unwrap_or(""),
        "base": {
            "ref": f.str("/toRef/displayId")?,
            "sha": f.str("/toRef/latestCommit")?,
            "user": owner,
            "repo": repository,
        },
        "head": {
            "ref": f.str("/fromRef/displayId")?,
            "sha": f.str("/fromRef/latestCommit")?,
            "user": owner,
            "repo": repository,
        },
        "labels": [],
        "merged_at": merged_at,
        "closed_at": closed_at,
        "created_at": f.timestamp("/createdDate")?,
    }))
}

fn issue_comment(f: &Fields) -> Result<Value, ValidationError> {
    Ok(json!({
        "issue": f.url_of(EntityKind::PullRequest, "/pull_request")?,
        "user": f.url_of(EntityKind::User, "/comment/author")?,
        "body": f.text("/comment/text")?,
        "formatter": "markdown",
        "created_at": f.timestamp("/comment/createdDate")?,
    }))
}

fn pull_request_review(f: &Fields) -> Result<Value, ValidationError> {
    let raw = f.get("/activity")?;
    let activity = Activity::parse(raw.clone()).map_err(|e| ValidationError::Invalid {
        kind: f.kind,
        field: "activity".to_string(),
        reason: e.to_string(),
    })?;
    let state = match activity.action {
        ActivityAction::Approved => "approved",
        ActivityAction::Reviewed => "changes_requested",
        ActivityAction::Unapproved => "dismissed",
        _ => "commented",
    };

    Ok(json!({
        "pull_request": f.url_of(EntityKind::PullRequest, "/pull_request")?,
        "user": f.url_of(EntityKind::User, "/activity/user")?,
        "body": "",
        "head_sha": f.opt_str("/commit_id"),
        "state": state,
        "created_at": f.timestamp("/activity/createdDate")?,
    }))
}

fn pull_request_review_comment(f: &Fields) -> Result<Value, ValidationError> {
    let side = match f.opt_str("/anchor/lineType") {
        Some("REMOVED") => "LEFT",
        _ => "RIGHT",
    };

    Ok(json!({
        "pull_request": f.url_of(EntityKind::PullRequest, "/pull_request")?,
        "pull_request_review": f.str("/review")?,
        "in_reply_to": f.opt_str("/in_reply_to"),
        "user": f.url_of(EntityKind::User, "/comment/author")?,
        "body": f.text("/comment/text")?,
        "path": f.str("/anchor/path")?,
        "line": f.opt("/anchor/line"),
        "side": side,
        "commit_id": f.opt_str("/commit_id"),
        "formatter": "markdown",
        "created_at": f.timestamp("/comment/createdDate")?,
    }))
}

fn issue_event(f: &Fields) -> Result<Value, ValidationError> {
    let event = match f.str("/activity/action")? {
        "MERGED" => "merged",
        "DECLINED" => "closed",
        "REOPENED" => "reopened",
        other => {
            return Err(ValidationError::Invalid {
                kind: f.kind,
                field: "activity.action".to_string(),
                reason: format!("{} is not an issue event", other),
            })
        }
    };

    Ok(json!({
        "pull_request": f.url_of(EntityKind::PullRequest, "/pull_request")?,
        "actor": f.url_of(EntityKind::User, "/activity/user")?,
        "event": event,
        "commit_id": f.opt_str("/activity/commit/id"),
        "created_at": f.timestamp("/activity/createdDate")?,
    }))
}

fn release(f: &Fields) -> Result<Value, ValidationError> {
    let display_id = f.str("/displayId")?;
    let published_at = f.timestamp("/commit/authorTimestamp")?;

    Ok(json!({
        "repository": f.url_of(EntityKind::Repository, "/repository")?,
        "user": f.url_of(EntityKind::User, "/user")?,
        "name": display_id,
        "tag_name": display_id,
        "body": "",
        "state": "published",
        "pending_tag": display_id,
        "prerelease": false,
        "target_commitish": f.opt_str("/commit/id").unwrap_or("master"),
        "release_assets": [],
        "published_at": published_at,
        "created_at": published_at,
    }))
}

fn protected_branch(f: &Fields) -> Result<Value, ValidationError> {
    let project = f.get("/repository/project")?;
    let mut kinds = Vec::new();
    let mut user_urls: Vec<String> = Vec::new();
    let mut team_urls: Vec<String> = Vec::new();

    for restriction in f.array("/restrictions")? {
        let Some(kind) = RestrictionKind::of(restriction) else {
            continue;
        };
        kinds.push(kind);
        if kind != RestrictionKind::ReadOnly {
            continue;
        }

        // Exempt users and groups of a read-only restriction may still push.
        for user in restriction
            .get("users")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let url = f.urls.url_for(EntityKind::User, user)?;
            if !user_urls.contains(&url) {
                user_urls.push(url);
            }
        }
        for group in restriction
            .get("groups")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
        {
            let team = json!({ "name": group, "project": project });
            let url = f.urls.url_for(EntityKind::Team, &team)?;
            if !team_urls.contains(&url) {
                team_urls.push(url);
            }
        }
    }

    let enforced = |kind: RestrictionKind| if kinds.contains(&kind) { 2 } else { 0 };
    let pull_request_reviews = if kinds.contains(&RestrictionKind::PullRequestOnly) {
        "everyone"
    } else {
        "off"
    };

    Ok(json!({
        "name": f.str("/branch_name")?,
        "creator_url": f.url_of(EntityKind::User, "/creator")?,
        "repository_url": f.url_of(EntityKind::Repository, "/repository")?,
        "admin_enforced": true,
        "block_deletions_enforcement_level": enforced(RestrictionKind::NoDeletes),
        "block_force_pushes_enforcement_level": enforced(RestrictionKind::FastForwardOnly),
        "dismiss_stale_reviews_on_push": false,
        "pull_request_reviews_enforcement_level": pull_request_reviews,
        "require_code_owner_review": false,
        "required_status_checks_enforcement_level": "off",
        "strict_required_status_checks_policy": false,
        "authorized_actors_only": kinds.contains(&RestrictionKind::ReadOnly),
        "authorized_user_urls": user_urls,
        "authorized_team_urls": team_urls,
        "dismissal_restricted_user_urls": [],
        "dismissal_restricted_team_urls": [],
        "required_status_checks": [],
    }))
}

fn attachment(f: &Fields) -> Result<Value, ValidationError> {
    let parent_type = f.str("/parent_type")?;
    let mut record = Map::new();
    record.insert(parent_type.to_string(), Value::from(f.str("/parent_url")?));
    record.insert(
        "user".to_string(),
        Value::from(f.url_of(EntityKind::User, "/user")?),
    );
    record.insert("asset_name".to_string(), Value::from(f.str("/name")?));
    record.insert(
        "asset_content_type".to_string(),
        Value::from(f.opt_str("/content_type").unwrap_or("application/octet-stream")),
    );
    record.insert("asset_url".to_string(), Value::from(f.str("/asset_url")?));
    record.insert(
        "created_at".to_string(),
        Value::from(f.timestamp("/created_date")?),
    );
    Ok(Value::Object(record))
}

struct Fields<'a> {
    kind: EntityKind,
    model: &'a Value,
    urls: &'a dyn UrlLookup,
}

impl<'a> Fields<'a> {
    fn opt(&self, pointer: &str) -> Option<&'a Value> {
        self.model.pointer(pointer).filter(|v| !v.is_null())
    }

    fn get(&self, pointer: &str) -> Result<&'a Value, ValidationError> {
        self.opt(pointer).ok_or_else(|| blank(self.kind, pointer))
    }

    fn opt_str(&self, pointer: &str) -> Option<&'a str> {
        self.opt(pointer).and_then(Value::as_str)
    }

    /// A non-empty string.
    fn str(&self, pointer: &str) -> Result<&'a str, ValidationError> {
        self.opt_str(pointer)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| blank(self.kind, pointer))
    }

    /// A string that must be present but may be empty.
    fn text(&self, pointer: &str) -> Result<&'a str, ValidationError> {
        self.get(pointer)?
            .as_str()
            .ok_or_else(|| blank(self.kind, pointer))
    }

    fn array(&self, pointer: &str) -> Result<&'a Vec<Value>, ValidationError> {
        self.get(pointer)?
            .as_array()
            .ok_or_else(|| ValidationError::Invalid {
                kind: self.kind,
                field: field_name(pointer),
                reason: "must be a list".to_string(),
            })
    }

    fn opt_array(&self, pointer: &str) -> Vec<&'a Value> {
        self.opt(pointer)
            .and_then(Value::as_array)
            .map(|values| values.iter().collect())
            .unwrap_or_default()
    }

    fn timestamp(&self, pointer: &str) -> Result<String, ValidationError> {
        let millis = self
            .get(pointer)?
            .as_i64()
            .ok_or_else(|| ValidationError::Invalid {
                kind: self.kind,
                field: field_name(pointer),
                reason: "is not a timestamp".to_string(),
            })?;
        format_millis(millis).ok_or_else(|| ValidationError::Invalid {
            kind: self.kind,
            field: field_name(pointer),
            reason: format!("{} is out of range", millis),
        })
    }

    /// Canonical URL of the nested model at `pointer`.
    fn url_of(&self, kind: EntityKind, pointer: &str) -> Result<String, ValidationError> {
        let model = self.get(pointer)?;
        Ok(self.urls.url_for(kind, model)?)
    }
}

fn blank(kind: EntityKind, pointer: &str) -> ValidationError {
    ValidationError::Blank {
        kind,
        field: field_name(pointer),
    }
}

/// `/author/user` → `author.user`
fn field_name(pointer: &str) -> String {
    pointer.trim_start_matches('/').replace('/', ".")
}

/// Epoch milliseconds as RFC 3339, second precision, `Z` suffix.
pub fn format_millis(millis: i64) -> Option<String> {
    DateTime::from_timestamp_millis(millis).map(|dt| dt.to_rfc3339_opts(SecondsFormat::Secs, true))
}

fn access_level(permission: &str) -> Option<&'static str> {
    match permission {
        "PROJECT_READ" | "REPO_READ" => Some("pull"),
        "PROJECT_WRITE" | "REPO_WRITE" => Some("push"),
        "PROJECT_ADMIN" | "REPO_ADMIN" => Some("admin"),
        _ => None,
    }
}

/// OpenSSH-style `SHA256:<base64>` fingerprint of a public key line.
fn ssh_fingerprint(key: &str) -> Option<String> {
    let blob = key.split_whitespace().nth(1)?;
    let decoded = base64::engine::general_purpose::STANDARD.decode(blob).ok()?;
    let digest = Sha256::digest(&decoded);
    Some(format!(
        "SHA256:{}",
        base64::engine::general_purpose::STANDARD_NO_PAD.encode(digest)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::urls::ModelUrls;

    const HOST: &str = "https://bbs.example.com";

    fn transformer() -> DefaultTransformer {
        DefaultTransformer::at(DateTime::from_timestamp(1_500_000_000, 0).unwrap())
    }

    fn user(slug: &str) -> Value {
        json!({
            "name": slug,
            "slug": slug,
            "displayName": slug.to_uppercase(),
            "emailAddress": format!("{}@example.com", slug),
            "links": {"self": [{"href": format!("{}/users/{}", HOST, slug)}]}
        })
    }

    fn project() -> Value {
        json!({
            "key": "MIGR",
            "name": "Migration",
            "public": false,
            "links": {"self": [{"href": format!("{}/projects/MIGR", HOST)}]}
        })
    }

    fn repository() -> Value {
        json!({
            "slug": "hugo",
            "public": false,
            "project": project(),
            "links": {"self": [{"href": format!("{}/projects/MIGR/repos/hugo/browse", HOST)}]}
        })
    }

    fn pull_request() -> Value {
        json!({
            "id": 1,
            "title": "Add a thing",
            "description": "Body",
            "state": "MERGED",
            "createdDate": 1_500_000_000_000i64,
            "updatedDate": 1_500_000_060_000i64,
            "author": {"user": user("ann")},
            "fromRef": {"displayId": "feature", "latestCommit": "f00"},
            "toRef": {"displayId": "master", "latestCommit": "ba4"},
            "repository": repository(),
            "owner": project(),
            "links": {"self": [{"href": format!("{}/projects/MIGR/repos/hugo/pull-requests/1", HOST)}]}
        })
    }

    #[test]
    fn formats_millis() {
        assert_eq!(
            format_millis(1_500_000_000_000).as_deref(),
            Some("2017-07-14T02:40:00Z")
        );
    }

    #[test]
    fn user_record() {
        let record = transformer()
            .transform(EntityKind::User, &user("ann"), &ModelUrls)
            .unwrap();
        assert_eq!(record["type"], "user");
        assert_eq!(record["url"], format!("{}/users/ann", HOST));
        assert_eq!(record["login"], "ann");
        assert_eq!(record["name"], "ANN");
        assert_eq!(record["emails"][0]["address"], "ann@example.com");
        assert_eq!(record["created_at"], "2017-07-14T02:40:00Z");
    }

    #[test]
    fn pull_request_record() {
        let record = transformer()
            .transform(EntityKind::PullRequest, &pull_request(), &ModelUrls)
            .unwrap();
        assert_eq!(record["user"], format!("{}/users/ann", HOST));
        assert_eq!(record["repository"], format!("{}/projects/MIGR/repos/hugo", HOST));
        assert_eq!(record["base"]["ref"], "master");
        assert_eq!(record["head"]["sha"], "f00");
        assert_eq!(record["merged_at"], "2017-07-14T02:41:00Z");
        assert_eq!(record["closed_at"], "2017-07-14T02:41:00Z");
    }

    #[test]
    fn pull_request_without_author_is_invalid() {
        let mut model = pull_request();
        model["author"] = Value::Null;
        let err = transformer()
            .transform(EntityKind::PullRequest, &model, &ModelUrls)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "pull_request is invalid: author.user can't be blank"
        );
    }

    #[test]
    fn comment_without_timestamp_is_invalid() {
        let model = json!({
            "pull_request": pull_request(),
            "comment": {"id": 3, "text": "hi", "author": user("bob")}
        });
        let err = transformer()
            .transform(EntityKind::IssueComment, &model, &ModelUrls)
            .unwrap_err();
        assert!(matches!(err, ValidationError::Blank { .. }));
    }

    #[test]
    fn repository_record() {
        let mut model = repository();
        model["collaborators"] = json!([{"user": user("ann"), "permission": "REPO_WRITE"}]);
        model["access_keys"] = json!([{
            "key": {"label": "deploy", "text": "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIGj1 deploy@host"},
            "permission": "REPO_READ"
        }]);

        let record = transformer()
            .transform(EntityKind::Repository, &model, &ModelUrls)
            .unwrap();
        assert_eq!(record["git_url"], "tarball://root/repositories/MIGR/hugo.git");
        assert_eq!(record["private"], true);
        assert_eq!(record["owner"], format!("{}/projects/MIGR", HOST));
        assert_eq!(record["collaborators"][0]["permission"], "push");
        assert_eq!(record["public_keys"][0]["read_only"], true);
        assert!(record["public_keys"][0]["fingerprint"]
            .as_str()
            .unwrap()
            .starts_with("SHA256:"));
    }

    #[test]
    fn team_record_maps_permissions() {
        let model = json!({
            "name": "devs",
            "project": project(),
            "permission": "REPO_ADMIN",
            "members": [format!("{}/users/ann", HOST)],
            "repositories": [format!("{}/projects/MIGR/repos/hugo", HOST)]
        });
        let record = transformer()
            .transform(EntityKind::Team, &model, &ModelUrls)
            .unwrap();
        assert_eq!(record["permissions"][0]["access"], "admin");
        assert_eq!(record["members"][0]["role"], "member");

        let mut bad = model.clone();
        bad["permission"] = json!("SUPERUSER");
        assert!(matches!(
            transformer().transform(EntityKind::Team, &bad, &ModelUrls),
            Err(ValidationError::Invalid { .. })
        ));
    }

    #[test]
    fn branch_permission_team_has_no_permissions() {
        let model = json!({
            "name": "QA",
            "project": project(),
            "permission": null,
            "members": [format!("{}/users/bob", HOST)],
            "repositories": []
        });
        let record = transformer()
            .transform(EntityKind::Team, &model, &ModelUrls)
            .unwrap();
        assert_eq!(record["permissions"], json!([]));
        assert_eq!(record["members"][0]["user"], format!("{}/users/bob", HOST));

        let mut orphan = model.clone();
        orphan["repositories"] = json!([format!("{}/projects/MIGR/repos/hugo", HOST)]);
        assert!(matches!(
            transformer().transform(EntityKind::Team, &orphan, &ModelUrls),
            Err(ValidationError::Blank { .. })
        ));
    }

    #[test]
    fn protected_branch_record() {
        let matcher = json!({"id": "refs/heads/master", "displayId": "master", "type": {"id": "BRANCH"}});
        let model = json!({
            "repository": repository(),
            "branch_name": "master",
            "creator": user("ann"),
            "restrictions": [
                {"id": 1, "type": "read-only", "matcher": matcher, "users": [user("bob")], "groups": ["QA"]},
                {"id": 2, "type": "no-deletes", "matcher": matcher, "users": [user("ann")], "groups": []},
                {"id": 3, "type": "merge-check", "matcher": matcher}
            ]
        });
        let record = transformer()
            .transform(EntityKind::ProtectedBranch, &model, &ModelUrls)
            .unwrap();

        assert_eq!(record["type"], "protected_branch");
        assert_eq!(
            record["url"],
            format!("{}/plugins/servlet/branch-permissions/MIGR/hugo#master", HOST)
        );
        assert_eq!(record["name"], "master");
        assert_eq!(record["creator_url"], format!("{}/users/ann", HOST));
        assert_eq!(record["repository_url"], format!("{}/projects/MIGR/repos/hugo", HOST));
        assert_eq!(record["authorized_actors_only"], true);
        assert_eq!(record["authorized_user_urls"], json!([format!("{}/users/bob", HOST)]));
        assert_eq!(
            record["authorized_team_urls"],
            json!([format!("{}/admin/groups/view?name=QA#MIGR", HOST)])
        );
        assert_eq!(record["block_deletions_enforcement_level"], 2);
        assert_eq!(record["block_force_pushes_enforcement_level"], 0);
        assert_eq!(record["pull_request_reviews_enforcement_level"], "off");
    }

    #[test]
    fn review_before_every_commit_has_no_head_sha() {
        let model = json!({
            "pull_request": pull_request(),
            "commit_id": null,
            "activity": {"id": 5, "createdDate": 1_500_000_000_000i64, "action": "APPROVED", "user": user("bob")}
        });
        let record = transformer()
            .transform(EntityKind::PullRequestReview, &model, &ModelUrls)
            .unwrap();
        assert_eq!(record["state"], "approved");
        assert!(record["head_sha"].is_null());

        let mut with_commit = model.clone();
        with_commit["commit_id"] = json!("abc123");
        let record = transformer()
            .transform(EntityKind::PullRequestReview, &with_commit, &ModelUrls)
            .unwrap();
        assert_eq!(record["head_sha"], "abc123");
    }

    #[test]
    fn review_comment_without_commit() {
        let model = json!({
            "pull_request": pull_request(),
            "comment": {"id": 9, "text": "nit", "createdDate": 1_500_000_000_000i64, "author": user("bob")},
            "anchor": {"path": "README.md", "line": 3, "lineType": "REMOVED"},
            "commit_id": null,
            "review": format!("{}/projects/MIGR/repos/hugo/pull-requests/1#bob-", HOST),
            "in_reply_to": null
        });
        let record = transformer()
            .transform(EntityKind::PullRequestReviewComment, &model, &ModelUrls)
            .unwrap();
        assert!(record["commit_id"].is_null());
        assert_eq!(record["side"], "LEFT");
        assert_eq!(record["path"], "README.md");
    }

    #[test]
    fn issue_event_record() {
        let model = json!({
            "pull_request": pull_request(),
            "activity": {"id": 6, "createdDate": 1_500_000_000_000i64, "action": "DECLINED", "user": user("bob")}
        });
        let record = transformer()
            .transform(EntityKind::IssueEvent, &model, &ModelUrls)
            .unwrap();
        assert_eq!(record["event"], "closed");
        assert_eq!(record["actor"], format!("{}/users/bob", HOST));
    }
}
