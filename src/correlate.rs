//! Commit correlation for pull-request activity.
//!
//! Bitbucket Server activities carry a timestamp but no commit, while the
//! archive anchors reviews and diff comments to a commit id. The commit
//! that was current at time `T` is the newest commit whose author
//! timestamp is `<= T`.
//!
//! Diff and file comments are grouped by `(author slug, resolved commit)`
//! into synthetic reviews. Explicit review activities (approve, unapprove,
//! needs-work) each become their own review.

use std::collections::HashMap;

use crate::models::{Activity, Commit};

/// `(author timestamp, commit id)` pairs, newest first.
#[derive(Debug, Clone, Default)]
pub struct CommitTimeline {
    entries: Vec<(i64, String)>,
}

impl CommitTimeline {
    /// Commits sharing a timestamp collapse to the smallest id.
    pub fn new(commits: &[Commit]) -> Self {
        let mut entries: Vec<(i64, String)> = commits
            .iter()
            .map(|c| (c.author_timestamp, c.id.clone()))
            .collect();
        entries.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        entries.dedup_by_key(|entry| entry.0);
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The commit current at `timestamp`, if any commit predates it.
    pub fn commit_at(&self, timestamp: i64) -> Option<&str> {
        self.entries
            .iter()
            .find(|(ts, _)| *ts <= timestamp)
            .map(|(_, id)| id.as_str())
    }
}

/// Diff comments sharing an author and a resolved commit.
#[derive(Debug)]
pub struct ReviewGroup<'a> {
    pub author: Option<String>,
    pub commit_id: Option<String>,
    /// Earliest activity in the group; the first one wins ties.
    pub representative: &'a Activity,
    /// Members in activity order.
    pub comments: Vec<&'a Activity>,
}

#[derive(Debug)]
pub struct ExplicitReview<'a> {
    pub commit_id: Option<String>,
    pub activity: &'a Activity,
}

/// Group line and file comments into synthetic reviews, in first-seen
/// order of their `(author, commit)` key.
pub fn group_diff_comments<'a>(
    timeline: &CommitTimeline,
    activities: &'a [Activity],
) -> Vec<ReviewGroup<'a>> {
    let mut groups: Vec<ReviewGroup<'a>> = Vec::new();
    let mut index: HashMap<(Option<String>, Option<String>), usize> = HashMap::new();

    for activity in activities
        .iter()
        .filter(|a| a.is_diff_comment() || a.is_file_comment())
    {
        let author = activity.author_slug().map(str::to_string);
        let commit_id = timeline.commit_at(activity.created_date).map(str::to_string);
        let key = (author.clone(), commit_id.clone());

        match index.get(&key) {
            Some(&i) => {
                let group = &mut groups[i];
                if activity.created_date < group.representative.created_date {
                    group.representative = activity;
                }
                group.comments.push(activity);
            }
            None => {
                index.insert(key, groups.len());
                groups.push(ReviewGroup {
                    author,
                    commit_id,
                    representative: activity,
                    comments: vec![activity],
                });
            }
        }
    }

    groups
}

/// One review per approve/unapprove/needs-work activity.
pub fn explicit_reviews<'a>(
    timeline: &CommitTimeline,
    activities: &'a [Activity],
) -> Vec<ExplicitReview<'a>> {
    activities
        .iter()
        .filter(|a| a.is_review())
        .map(|activity| ExplicitReview {
            commit_id: timeline.commit_at(activity.created_date).map(str::to_string),
            activity,
        })
        .collect()
}
