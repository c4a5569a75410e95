//! Core data models used throughout the exporter.
//!
//! [`EntityKind`] is the closed set of record types that end up in the
//! archive. [`Activity`] and [`Commit`] are typed views over the pieces of
//! the pull-request API that the commit-correlation engine reads; the raw
//! JSON is kept alongside so it can still be handed to a transformer.

use serde::Deserialize;
use serde_json::Value;
use std::fmt;

/// Archived record types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKind {
    User,
    Organization,
    Team,
    Repository,
    PullRequest,
    PullRequestReview,
    PullRequestReviewComment,
    IssueComment,
    IssueEvent,
    Release,
    ProtectedBranch,
    Attachment,
}

impl EntityKind {
    pub const ALL: [EntityKind; 12] = [
        EntityKind::User,
        EntityKind::Organization,
        EntityKind::Team,
        EntityKind::Repository,
        EntityKind::PullRequest,
        EntityKind::PullRequestReview,
        EntityKind::PullRequestReviewComment,
        EntityKind::IssueComment,
        EntityKind::IssueEvent,
        EntityKind::Release,
        EntityKind::ProtectedBranch,
        EntityKind::Attachment,
    ];

    /// Singular snake-case name, used as the record `type` and in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::User => "user",
            EntityKind::Organization => "organization",
            EntityKind::Team => "team",
            EntityKind::Repository => "repository",
            EntityKind::PullRequest => "pull_request",
            EntityKind::PullRequestReview => "pull_request_review",
            EntityKind::PullRequestReviewComment => "pull_request_review_comment",
            EntityKind::IssueComment => "issue_comment",
            EntityKind::IssueEvent => "issue_event",
            EntityKind::Release => "release",
            EntityKind::ProtectedBranch => "protected_branch",
            EntityKind::Attachment => "attachment",
        }
    }

    /// Shard file prefix (`repository` → `repositories`).
    pub fn plural(&self) -> String {
        pluralize(self.as_str())
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const IRREGULAR_PLURALS: &[(&str, &str)] = &[
    ("person", "people"),
    ("mouse", "mice"),
    ("child", "children"),
    ("man", "men"),
    ("woman", "women"),
];

/// English pluralization for snake_case names; only the last word changes.
pub fn pluralize(word: &str) -> String {
    let (head, last) = match word.rfind('_') {
        Some(idx) => word.split_at(idx + 1),
        None => ("", word),
    };

    if let Some((_, plural)) = IRREGULAR_PLURALS.iter().find(|(s, _)| *s == last) {
        return format!("{}{}", head, plural);
    }

    let plural_last = if let Some(stem) = last.strip_suffix('y') {
        match stem.chars().last() {
            Some(c) if !"aeiou".contains(c) => format!("{}ies", stem),
            _ => format!("{}s", last),
        }
    } else if ["s", "x", "z", "ch", "sh"].iter().any(|s| last.ends_with(s)) {
        format!("{}es", last)
    } else {
        format!("{}s", last)
    };

    format!("{}{}", head, plural_last)
}

/// A pull-request commit as far as the timeline cares.
#[derive(Debug, Clone, Deserialize)]
pub struct Commit {
    pub id: String,
    #[serde(rename = "authorTimestamp")]
    pub author_timestamp: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserRef {
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommentAnchor {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub line: Option<i64>,
    #[serde(rename = "lineType", default)]
    pub line_type: Option<String>,
    #[serde(rename = "fileType", default)]
    pub file_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivityAction {
    Commented,
    Approved,
    Unapproved,
    Reviewed,
    Merged,
    Declined,
    Reopened,
    Opened,
    Rescoped,
    Updated,
    #[serde(other)]
    Other,
}

/// A pull-request activity, typed for correlation with the raw JSON kept.
#[derive(Debug, Clone, Deserialize)]
pub struct Activity {
    pub id: i64,
    #[serde(rename = "createdDate")]
    pub created_date: i64,
    #[serde(default)]
    pub user: Option<UserRef>,
    pub action: ActivityAction,
    #[serde(rename = "commentAction", default)]
    pub comment_action: Option<String>,
    #[serde(rename = "commentAnchor", default)]
    pub comment_anchor: Option<CommentAnchor>,
    #[serde(skip)]
    pub raw: Value,
}

impl Activity {
    pub fn parse(raw: Value) -> Result<Self, serde_json::Error> {
        let mut activity: Activity = serde_json::from_value(raw.clone())?;
        activity.raw = raw;
        Ok(activity)
    }

    /// Slug of the acting user, the grouping key for synthetic reviews.
    pub fn author_slug(&self) -> Option<&str> {
        self.user.as_ref().and_then(|u| u.slug.as_deref())
    }

    fn added_comment(&self) -> bool {
        self.action == ActivityAction::Commented
            && self.comment_action.as_deref() == Some("ADDED")
    }

    /// Top-level conversation comment (no diff anchor).
    pub fn is_comment(&self) -> bool {
        self.added_comment() && self.comment_anchor.is_none()
    }

    /// Comment anchored to a line of the diff.
    pub fn is_diff_comment(&self) -> bool {
        self.added_comment()
            && self
                .comment_anchor
                .as_ref()
                .is_some_and(|anchor| anchor.line.is_some())
    }

    /// Comment anchored to a file but not a line.
    pub fn is_file_comment(&self) -> bool {
        self.added_comment()
            && self
                .comment_anchor
                .as_ref()
                .is_some_and(|anchor| anchor.line.is_none())
    }

    pub fn is_review(&self) -> bool {
        matches!(
            self.action,
            ActivityAction::Approved | ActivityAction::Unapproved | ActivityAction::Reviewed
        )
    }

    pub fn is_issue_event(&self) -> bool {
        matches!(
            self.action,
            ActivityAction::Merged | ActivityAction::Declined | ActivityAction::Reopened
        )
    }
}

/// Follow `links.self[0].href`, the identity link every top-level
/// Bitbucket Server resource carries.
pub fn self_link(model: &Value) -> Option<&str> {
    model
        .pointer("/links/self/0/href")
        .and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pluralizes_entity_kinds() {
        assert_eq!(EntityKind::User.plural(), "users");
        assert_eq!(EntityKind::Repository.plural(), "repositories");
        assert_eq!(EntityKind::PullRequestReview.plural(), "pull_request_reviews");
        assert_eq!(EntityKind::IssueComment.plural(), "issue_comments");
        assert_eq!(EntityKind::Attachment.plural(), "attachments");
        assert_eq!(EntityKind::ProtectedBranch.plural(), "protected_branches");
    }

    #[test]
    fn pluralizes_irregular_and_sibilant_words() {
        assert_eq!(pluralize("mouse"), "mice");
        assert_eq!(pluralize("protected_branch"), "protected_branches");
        assert_eq!(pluralize("key"), "keys");
        assert_eq!(pluralize("box"), "boxes");
    }

    #[test]
    fn classifies_activities() {
        let diff = Activity::parse(json!({
            "id": 1, "createdDate": 10, "action": "COMMENTED", "commentAction": "ADDED",
            "user": {"slug": "ann"},
            "commentAnchor": {"path": "README.md", "line": 3}
        }))
        .unwrap();
        assert!(diff.is_diff_comment());
        assert!(!diff.is_file_comment());
        assert!(!diff.is_comment());
        assert_eq!(diff.author_slug(), Some("ann"));

        let file = Activity::parse(json!({
            "id": 2, "createdDate": 10, "action": "COMMENTED", "commentAction": "ADDED",
            "commentAnchor": {"path": "README.md"}
        }))
        .unwrap();
        assert!(file.is_file_comment());
        assert_eq!(file.author_slug(), None);

        let edited = Activity::parse(json!({
            "id": 3, "createdDate": 10, "action": "COMMENTED", "commentAction": "EDITED"
        }))
        .unwrap();
        assert!(!edited.is_comment());

        let approved =
            Activity::parse(json!({"id": 4, "createdDate": 10, "action": "APPROVED"})).unwrap();
        assert!(approved.is_review());

        let merged =
            Activity::parse(json!({"id": 5, "createdDate": 10, "action": "MERGED"})).unwrap();
        assert!(merged.is_issue_event());

        let unknown =
            Activity::parse(json!({"id": 6, "createdDate": 10, "action": "AUTO_MERGE"})).unwrap();
        assert_eq!(unknown.action, ActivityAction::Other);
    }
}
