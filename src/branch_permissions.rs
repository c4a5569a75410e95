//! Branch restrictions resolved to concrete branches.
//!
//! Bitbucket Server attaches a restriction to a matcher rather than to a
//! branch:
//!
//! | Matcher type | Matches |
//! |--------------|---------|
//! | `BRANCH` | the branch whose ref id or display id is the matcher id |
//! | `PATTERN` | branches whose display id (or ref id) fits the glob |
//! | `MODEL_BRANCH` | the branching model's `development` or `production` branch |
//! | `MODEL_CATEGORY` | branches starting with the branch type's prefix |
//!
//! [`protected_branches`] expands every restriction over the repository's
//! branches and groups the result per branch, in branch order.

use serde_json::Value;

/// Restriction types that have an archive counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestrictionKind {
    ReadOnly,
    NoDeletes,
    FastForwardOnly,
    PullRequestOnly,
}

impl RestrictionKind {
    pub fn of(restriction: &Value) -> Option<Self> {
        match restriction.get("type").and_then(Value::as_str)? {
            "read-only" => Some(Self::ReadOnly),
            "no-deletes" => Some(Self::NoDeletes),
            "fast-forward-only" => Some(Self::FastForwardOnly),
            "pull-request-only" => Some(Self::PullRequestOnly),
            _ => None,
        }
    }
}

/// A branch and the restrictions that apply to it.
#[derive(Debug)]
pub struct ProtectedBranch<'a> {
    pub name: String,
    pub restrictions: Vec<&'a Value>,
}

pub fn protected_branches<'a>(
    restrictions: &'a [Value],
    branches: &[Value],
    model: Option<&Value>,
) -> Vec<ProtectedBranch<'a>> {
    let known: Vec<&Value> = restrictions
        .iter()
        .filter(|restriction| {
            let known = RestrictionKind::of(restriction).is_some();
            if !known {
                tracing::warn!(
                    restriction = ?restriction.get("id"),
                    kind = ?restriction.get("type"),
                    "unsupported branch restriction, skipping"
                );
            }
            known
        })
        .collect();

    let mut protected = Vec::new();
    for branch in branches {
        let Some(display_id) = branch.get("displayId").and_then(Value::as_str) else {
            continue;
        };
        let ref_id = branch.get("id").and_then(Value::as_str).unwrap_or_default();

        let matching: Vec<&Value> = known
            .iter()
            .copied()
            .filter(|restriction| matches_branch(restriction, ref_id, display_id, model))
            .collect();
        if !matching.is_empty() {
            protected.push(ProtectedBranch {
                name: display_id.to_string(),
                restrictions: matching,
            });
        }
    }
    protected
}

/// Group names named by any restriction, first occurrence first.
pub fn restricted_groups(restrictions: &[Value]) -> Vec<String> {
    let mut groups: Vec<String> = Vec::new();
    for name in restrictions
        .iter()
        .filter_map(|restriction| restriction.get("groups").and_then(Value::as_array))
        .flatten()
        .filter_map(Value::as_str)
    {
        if !groups.iter().any(|g| g == name) {
            groups.push(name.to_string());
        }
    }
    groups
}

fn matches_branch(restriction: &Value, ref_id: &str, display_id: &str, model: Option<&Value>) -> bool {
    let Some(matcher) = restriction.get("matcher") else {
        return false;
    };
    let id = matcher.get("id").and_then(Value::as_str).unwrap_or_default();

    match matcher.pointer("/type/id").and_then(Value::as_str) {
        Some("BRANCH") => id == ref_id || id == display_id,
        Some("PATTERN") => glob_match(id, display_id) || glob_match(id, ref_id),
        Some("MODEL_BRANCH") => model
            .and_then(|m| m.pointer(&format!("/{}/id", id.to_lowercase())))
            .and_then(Value::as_str)
            .is_some_and(|model_ref| model_ref == ref_id),
        Some("MODEL_CATEGORY") => model
            .and_then(|m| m.get("types"))
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter(|t| t.get("id").and_then(Value::as_str) == Some(id))
            .filter_map(|t| t.get("prefix").and_then(Value::as_str))
            .any(|prefix| !prefix.is_empty() && display_id.starts_with(prefix)),
        _ => false,
    }
}

/// `*` matches any run of characters (slashes included), `?` exactly one.
fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            backtrack = Some((p, t));
            p += 1;
        } else if let Some((star, from)) = backtrack {
            p = star + 1;
            t = from + 1;
            backtrack = Some((star, from + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|c| *c == '*')
}
