//! Export orchestration.
//!
//! An [`ExportJob`] is one run against one server producing one archive.
//! Repositories are exported one at a time:
//!
//! 1. The export user, then the owning project as an organization with its
//!    members (or, for a `~user` project, the owning user).
//! 2. Collaborators and access keys, folded into the repository record.
//! 3. `git clone --mirror` into the staging tree.
//! 4. Optional models: `teams` (one team per group permission, plus one per
//!    group named in a branch restriction) and `pull_requests` (pull
//!    requests that have at least one commit).
//! 5. Tags as releases, branch restrictions as protected branches, then the
//!    repository record itself.
//! 6. Pull requests, oldest first: author, attachments, the pull request,
//!    comment threads, synthetic reviews, diff comments, explicit reviews
//!    and issue events.
//!
//! Records that fail validation are logged and skipped by the
//! [`Dispatcher`]. Network and I/O errors abort the job, and dropping the
//! job removes its staging directory.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::archive::ArchiveBuilder;
use crate::attachments::{export_attachments, AttachmentParent};
use crate::bitbucket::{BitbucketServer, RepositoryApi};
use crate::branch_permissions::{protected_branches, restricted_groups};
use crate::client::ApiClient;
use crate::config::Config;
use crate::correlate::{explicit_reviews, group_diff_comments, CommitTimeline};
use crate::dispatch::{Dispatcher, KindStats, Outcome};
use crate::git::{GitCli, RepoMirror};
use crate::models::{Activity, Commit, EntityKind};
use crate::progress::{ExportPhase, ExportProgressEvent, ExportProgressReporter, NoProgress};
use crate::serializers::DefaultTransformer;
use crate::urls::{ModelUrls, UrlLookup};

static NULL: Value = Value::Null;

/// Export stages that can be switched on per job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum OptionalModel {
    #[value(name = "pull_requests")]
    PullRequests,
    Teams,
}

/// `KEY/slug`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoRef {
    pub project: String,
    pub slug: String,
}

impl FromStr for RepoRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((project, slug)) if !project.is_empty() && !slug.is_empty() && !slug.contains('/') => {
                Ok(Self {
                    project: project.to_string(),
                    slug: slug.to_string(),
                })
            }
            _ => Err(format!("expected KEY/slug, got '{}'", s)),
        }
    }
}

impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.project, self.slug)
    }
}

#[derive(Debug)]
pub struct ExportSummary {
    pub repositories: Vec<RepoRef>,
    pub stats: BTreeMap<EntityKind, KindStats>,
    /// `None` when nothing was written.
    pub archive: Option<PathBuf>,
}

impl ExportSummary {
    pub fn serialized(&self, kind: EntityKind) -> u64 {
        self.stats.get(&kind).map(|s| s.serialized).unwrap_or(0)
    }

    pub fn total_invalid(&self) -> u64 {
        self.stats.values().map(|s| s.invalid).sum()
    }
}

pub struct ExportJob {
    server: BitbucketServer,
    dispatcher: Dispatcher,
    models: Vec<OptionalModel>,
    progress: Box<dyn ExportProgressReporter>,
    exported: Vec<RepoRef>,
}

impl ExportJob {
    /// A job that mirrors repositories with the `git` binary.
    pub fn from_config(config: &Config) -> Result<Self> {
        let client = ApiClient::from_config(&config.server)?;
        let mirror = GitCli::new(config.server.ssl_verify, client.authorization_header());
        Self::with_client(client, config, Box::new(mirror))
    }

    pub fn new(config: &Config, mirror: Box<dyn RepoMirror>) -> Result<Self> {
        let client = ApiClient::from_config(&config.server)?;
        Self::with_client(client, config, mirror)
    }

    pub fn with_client(
        client: ApiClient,
        config: &Config,
        mirror: Box<dyn RepoMirror>,
    ) -> Result<Self> {
        let urls = ModelUrls;
        let archive = ArchiveBuilder::new(
            config.export.staging_root.as_deref(),
            mirror,
            urls.templates(),
        )?;
        let dispatcher = Dispatcher::new(
            archive,
            Box::new(urls),
            Box::new(DefaultTransformer::default()),
        );

        let mut models = Vec::new();
        for model in &config.export.models {
            if !models.contains(model) {
                models.push(*model);
            }
        }

        Ok(Self {
            server: BitbucketServer::new(client),
            dispatcher,
            models,
            progress: Box::new(NoProgress),
            exported: Vec::new(),
        })
    }

    pub fn with_progress(mut self, progress: Box<dyn ExportProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Export every repository of a project.
    pub async fn export_project(&mut self, key: &str) -> Result<()> {
        let repositories = self
            .server
            .project(key)
            .repositories()
            .await
            .with_context(|| format!("Failed to list repositories of project {}", key))?;

        for repository in repositories {
            let slug = repository
                .get("slug")
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow!("Repository in project {} has no slug", key))?;
            let target = RepoRef {
                project: key.to_string(),
                slug: slug.to_string(),
            };
            self.export_repository(&target).await?;
        }
        Ok(())
    }

    /// Export one repository. A repository already exported by this job is
    /// skipped.
    pub async fn export_repository(&mut self, target: &RepoRef) -> Result<()> {
        if self.exported.contains(target) {
            tracing::info!(repository = %target, "already exported");
            return Ok(());
        }

        let Self {
            server,
            dispatcher,
            models,
            progress,
            exported,
        } = self;
        let server: &BitbucketServer = server;

        tracing::info!(repository = %target, "exporting repository");
        let mut exporter = RepositoryExporter {
            server,
            repo: server.project(&target.project).repository(&target.slug),
            dispatcher,
            models: models.as_slice(),
            progress: &**progress,
            name: target.to_string(),
        };
        exporter
            .export()
            .await
            .with_context(|| format!("Failed to export repository {}", target))?;

        exported.push(target.clone());
        Ok(())
    }

    /// Package the archive (if anything was written) and report.
    pub fn finish(self, output: &Path) -> Result<ExportSummary> {
        let stats = self.dispatcher.stats().clone();
        let archive = self.dispatcher.into_archive();

        let written = if archive.is_used() {
            archive.finalize(output)?;
            Some(output.to_path_buf())
        } else {
            tracing::warn!("nothing was exported, no archive written");
            None
        };

        Ok(ExportSummary {
            repositories: self.exported,
            stats,
            archive: written,
        })
    }
}

/// Export the given projects and repositories into one archive at `output`.
pub async fn run_export(
    config: &Config,
    projects: &[String],
    repositories: &[RepoRef],
    output: &Path,
    progress: Box<dyn ExportProgressReporter>,
) -> Result<ExportSummary> {
    let mut job = ExportJob::from_config(config)?.with_progress(progress);

    for key in projects {
        job.export_project(key).await?;
    }
    for repository in repositories {
        job.export_repository(repository).await?;
    }

    job.finish(output)
}

struct PendingPullRequest {
    id: u64,
    created_date: i64,
    model: Value,
    commits: Vec<Commit>,
}

struct RepositoryExporter<'a> {
    server: &'a BitbucketServer,
    repo: RepositoryApi<'a>,
    dispatcher: &'a mut Dispatcher,
    models: &'a [OptionalModel],
    progress: &'a dyn ExportProgressReporter,
    name: String,
}

impl RepositoryExporter<'_> {
    fn phase(&self, phase: ExportPhase) {
        self.progress.report(ExportProgressEvent::Phase {
            repository: self.name.clone(),
            phase,
        });
    }

    async fn export(&mut self) -> Result<()> {
        self.phase(ExportPhase::Metadata);

        let user_name = self.server.authenticated_user().await?;
        let export_user = self.server.user(&user_name).await?;
        self.dispatcher.serialize(EntityKind::User, &export_user)?;

        let project = self.export_project().await?;

        let repository = self.repo.repository().await?;
        let collaborators = self.repo.team_members().await?;
        for collaborator in &collaborators {
            if let Some(user) = collaborator.get("user") {
                self.dispatcher.serialize(EntityKind::User, user)?;
            }
        }
        let access_keys = self.repo.access_keys().await?;
        let repository = with_fields(
            repository,
            vec![
                ("owner", project.clone()),
                ("collaborators", Value::Array(collaborators)),
                ("access_keys", Value::Array(access_keys)),
            ],
        );

        self.phase(ExportPhase::Mirroring);
        self.dispatcher
            .archive()
            .mirror_repository(&repository, Some(user_name.as_str()))
            .await?;

        let restrictions = self.repo.branch_permissions().await?;

        let mut pull_requests = Vec::new();
        let models = self.models;
        for model in models {
            match model {
                OptionalModel::Teams => self.export_teams(&repository, &restrictions).await?,
                OptionalModel::PullRequests => pull_requests = self.prepare_pull_requests().await?,
            }
        }

        self.phase(ExportPhase::Tags);
        self.export_tags(&repository, &export_user).await?;

        self.phase(ExportPhase::BranchPermissions);
        self.export_protected_branches(&repository, &export_user, &restrictions)
            .await?;

        self.dispatcher.serialize(EntityKind::Repository, &repository)?;
        let repository_url = self.dispatcher.url_for(EntityKind::Repository, &repository)?;

        pull_requests.sort_by_key(|pr| pr.created_date);
        let total = pull_requests.len() as u64;
        for (i, pending) in pull_requests.into_iter().enumerate() {
            self.export_pull_request(pending, &repository, &project, &repository_url)
                .await?;
            self.progress.report(ExportProgressEvent::PullRequests {
                repository: self.name.clone(),
                n: i as u64 + 1,
                total,
            });
        }

        Ok(())
    }

    /// The owning project, archived as an organization with its members,
    /// or as its owner for a personal project.
    async fn export_project(&mut self) -> Result<Value> {
        let project_api = self.repo.project();
        let project = project_api.project().await?;

        if project_api.is_user_project() {
            if let Some(owner) = project.get("owner") {
                self.dispatcher.serialize(EntityKind::User, owner)?;
            }
            return Ok(project);
        }

        let members = project_api.members().await?;
        let organization = with_fields(
            project.clone(),
            vec![("members", Value::Array(members.clone()))],
        );
        self.dispatcher
            .serialize(EntityKind::Organization, &organization)?;

        for member in &members {
            if let Some(user) = member.get("user") {
                self.dispatcher.serialize(EntityKind::User, user)?;
            }
        }

        Ok(project)
    }

    /// One team per group permission, then one per group named in a branch
    /// restriction. The latter have no permission and no repositories.
    async fn export_teams(&mut self, repository: &Value, restrictions: &[Value]) -> Result<()> {
        self.phase(ExportPhase::Teams);

        let access = self.repo.group_access().await?;
        let restricted = restricted_groups(restrictions);
        if access.is_empty() && restricted.is_empty() {
            return Ok(());
        }

        let repository_url = self.dispatcher.url_for(EntityKind::Repository, repository)?;

        if !access.is_empty() {
            let names: Vec<String> = self
                .server
                .groups()
                .await?
                .iter()
                .filter_map(|g| g.get("name").and_then(Value::as_str).map(str::to_string))
                .collect();

            for entry in &access {
                let Some(reported) = entry.pointer("/group/name").and_then(Value::as_str) else {
                    continue;
                };
                let name = proper_group_name(&names, reported);
                let permission = entry.get("permission").cloned().unwrap_or(Value::Null);
                self.export_team(&name, repository, permission, vec![repository_url.clone()])
                    .await?;
            }
        }

        for name in &restricted {
            self.export_team(name, repository, Value::Null, Vec::new())
                .await?;
        }

        Ok(())
    }

    async fn export_team(
        &mut self,
        name: &str,
        repository: &Value,
        permission: Value,
        repositories: Vec<String>,
    ) -> Result<()> {
        let mut member_urls = Vec::new();
        for member in self.server.group_members(name).await? {
            match self.dispatcher.serialize(EntityKind::User, &member)? {
                Outcome::Invalid(_) => {}
                _ => member_urls.push(self.dispatcher.url_for(EntityKind::User, &member)?),
            }
        }

        let team = json!({
            "name": name,
            "project": repository.get("project"),
            "permission": permission,
            "members": member_urls,
            "repositories": repositories,
        });
        self.dispatcher.serialize(EntityKind::Team, &team)?;
        Ok(())
    }

    /// Branch restrictions, one protected branch per restricted branch.
    /// Repositories without a branch (empty ones) have nothing to protect.
    async fn export_protected_branches(
        &mut self,
        repository: &Value,
        export_user: &Value,
        restrictions: &[Value],
    ) -> Result<()> {
        if restrictions.is_empty() {
            return Ok(());
        }
        let branches = self.repo.branches().await?;
        if branches.is_empty() {
            return Ok(());
        }
        let model = self.repo.branch_model().await?;

        for restriction in restrictions {
            for user in restriction
                .get("users")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                self.dispatcher.serialize(EntityKind::User, user)?;
            }
        }

        for branch in protected_branches(restrictions, &branches, model.as_ref()) {
            let protected = json!({
                "repository": repository,
                "branch_name": branch.name,
                "creator": export_user,
                "restrictions": branch.restrictions,
            });
            self.dispatcher
                .serialize(EntityKind::ProtectedBranch, &protected)?;
        }

        Ok(())
    }

    async fn prepare_pull_requests(&self) -> Result<Vec<PendingPullRequest>> {
        self.phase(ExportPhase::PreparingPullRequests);

        let mut pending = Vec::new();
        for model in self.repo.pull_requests().await? {
            let Some(id) = model.get("id").and_then(Value::as_u64) else {
                tracing::warn!(repository = %self.name, "pull request without an id, skipping");
                continue;
            };

            let commits = self.repo.pull_request(id).commits().await?;
            if commits.is_empty() {
                tracing::warn!(
                    repository = %self.name,
                    pull_request = id,
                    "was skipped because the PR has no diff"
                );
                continue;
            }

            pending.push(PendingPullRequest {
                id,
                created_date: model.get("createdDate").and_then(Value::as_i64).unwrap_or(0),
                model,
                commits,
            });
        }

        Ok(pending)
    }

    /// Tags become releases attributed to the export user.
    async fn export_tags(&mut self, repository: &Value, export_user: &Value) -> Result<()> {
        for tag in self.repo.tags().await? {
            let commit = match tag.get("latestCommit").and_then(Value::as_str) {
                Some(id) => self.repo.commit(id).await?,
                None => Value::Null,
            };
            let release = with_fields(
                tag,
                vec![
                    ("repository", repository.clone()),
                    ("user", export_user.clone()),
                    ("commit", commit),
                ],
            );
            self.dispatcher.serialize(EntityKind::Release, &release)?;
        }
        Ok(())
    }

    async fn export_pull_request(
        &mut self,
        pending: PendingPullRequest,
        repository: &Value,
        project: &Value,
        repository_url: &str,
    ) -> Result<()> {
        let PendingPullRequest {
            id, model, commits, ..
        } = pending;

        let mut pull_request = with_fields(
            model,
            vec![("repository", repository.clone()), ("owner", project.clone())],
        );

        let author = pull_request.pointer("/author/user").cloned();
        if let Some(author) = &author {
            self.dispatcher.serialize(EntityKind::User, author)?;
        }

        let description = text_of(&pull_request, "description");
        let rewritten = export_attachments(
            &self.repo,
            self.dispatcher,
            repository_url,
            &description,
            &AttachmentParent {
                kind: EntityKind::PullRequest,
                model: &pull_request,
                user: author.as_ref().unwrap_or(&NULL),
                created_date: pull_request
                    .get("createdDate")
                    .and_then(Value::as_i64)
                    .unwrap_or(0),
            },
        )
        .await?;
        if let Some(object) = pull_request.as_object_mut() {
            object.insert("description".to_string(), Value::String(rewritten));
        }

        if !self
            .dispatcher
            .serialize(EntityKind::PullRequest, &pull_request)?
            .is_new()
        {
            tracing::warn!(
                repository = %self.name,
                pull_request = id,
                "pull request not exported, skipping its activity"
            );
            return Ok(());
        }

        // Enough of the pull request for canonical URLs of its children.
        let pr_ref = json!({ "id": id, "links": pull_request.get("links") });

        let activities: Vec<Activity> = self
            .repo
            .pull_request(id)
            .activities()
            .await?
            .into_iter()
            .filter_map(|raw| match Activity::parse(raw) {
                Ok(activity) => Some(activity),
                Err(error) => {
                    tracing::warn!(pull_request = id, %error, "unreadable activity, skipping");
                    None
                }
            })
            .collect();
        let timeline = CommitTimeline::new(&commits);

        for activity in &activities {
            if let Some(user) = activity.raw.get("user") {
                self.dispatcher.serialize(EntityKind::User, user)?;
            }
        }

        for activity in activities.iter().filter(|a| a.is_comment()) {
            if let Some(comment) = activity.raw.get("comment") {
                self.export_comment_thread(&pr_ref, comment, repository_url)
                    .await?;
            }
        }

        // One synthetic review per (author, commit) group of diff comments.
        let mut review_of: HashMap<i64, (Option<String>, String)> = HashMap::new();
        for group in group_diff_comments(&timeline, &activities) {
            let review = json!({
                "pull_request": pr_ref,
                "activity": group.representative.raw,
                "commit_id": group.commit_id,
            });
            if group.commit_id.is_none() {
                tracing::warn!(
                    pull_request = id,
                    activity = group.representative.id,
                    "diff comments predate every commit, review has no head commit"
                );
            }
            if let Outcome::Invalid(reason) = self
                .dispatcher
                .serialize(EntityKind::PullRequestReview, &review)?
            {
                tracing::warn!(
                    pull_request = id,
                    comments = group.comments.len(),
                    %reason,
                    "review not exported, skipping its diff comments"
                );
                continue;
            }
            let review_url = self
                .dispatcher
                .url_for(EntityKind::PullRequestReview, &review)?;
            for comment in &group.comments {
                review_of.insert(comment.id, (group.commit_id.clone(), review_url.clone()));
            }
        }

        for activity in activities
            .iter()
            .filter(|a| a.is_diff_comment() || a.is_file_comment())
        {
            let Some((commit_id, review_url)) = review_of.get(&activity.id) else {
                tracing::warn!(
                    pull_request = id,
                    activity = activity.id,
                    "diff comment has no review, skipping"
                );
                continue;
            };
            let Some(comment) = activity.raw.get("comment") else {
                continue;
            };
            let thread = ReviewThread {
                pr_ref: &pr_ref,
                anchor: activity.raw.get("commentAnchor").unwrap_or(&NULL),
                commit_id: commit_id.as_deref(),
                review_url,
            };
            self.export_review_thread(&thread, comment, repository_url)
                .await?;
        }

        for review in explicit_reviews(&timeline, &activities) {
            let model = json!({
                "pull_request": pr_ref,
                "activity": review.activity.raw,
                "commit_id": review.commit_id,
            });
            self.dispatcher
                .serialize(EntityKind::PullRequestReview, &model)?;
        }

        for activity in activities.iter().filter(|a| a.is_issue_event()) {
            let model = json!({ "pull_request": pr_ref, "activity": activity.raw });
            self.dispatcher.serialize(EntityKind::IssueEvent, &model)?;
        }

        Ok(())
    }

    /// A top-level comment and its replies, depth first. Replies of a
    /// comment that was not archived are dropped.
    async fn export_comment_thread(
        &mut self,
        pr_ref: &Value,
        root: &Value,
        repository_url: &str,
    ) -> Result<()> {
        let mut stack = vec![root.clone()];

        while let Some(mut comment) = stack.pop() {
            let replies = take_replies(&mut comment);
            let author = comment.get("author").cloned().unwrap_or(Value::Null);
            if !author.is_null() {
                self.dispatcher.serialize(EntityKind::User, &author)?;
            }

            let text = text_of(&comment, "text");
            let created_date = comment.get("createdDate").and_then(Value::as_i64).unwrap_or(0);
            let mut model = json!({ "pull_request": pr_ref, "comment": comment });

            let rewritten = export_attachments(
                &self.repo,
                self.dispatcher,
                repository_url,
                &text,
                &AttachmentParent {
                    kind: EntityKind::IssueComment,
                    model: &model,
                    user: &author,
                    created_date,
                },
            )
            .await?;
            if let Some(text) = model.pointer_mut("/comment/text") {
                *text = Value::String(rewritten);
            }

            if self
                .dispatcher
                .serialize(EntityKind::IssueComment, &model)?
                .is_new()
            {
                stack.extend(replies.into_iter().rev());
            }
        }

        Ok(())
    }

    /// A diff comment and its replies, all attached to the same review.
    async fn export_review_thread(
        &mut self,
        thread: &ReviewThread<'_>,
        root: &Value,
        repository_url: &str,
    ) -> Result<()> {
        let mut stack: Vec<(Value, Option<String>)> = vec![(root.clone(), None)];

        while let Some((mut comment, in_reply_to)) = stack.pop() {
            let replies = take_replies(&mut comment);
            let author = comment.get("author").cloned().unwrap_or(Value::Null);
            if !author.is_null() {
                self.dispatcher.serialize(EntityKind::User, &author)?;
            }

            let text = text_of(&comment, "text");
            let created_date = comment.get("createdDate").and_then(Value::as_i64).unwrap_or(0);
            let mut model = json!({
                "pull_request": thread.pr_ref,
                "comment": comment,
                "anchor": thread.anchor,
                "commit_id": thread.commit_id,
                "review": thread.review_url,
                "in_reply_to": in_reply_to,
            });

            let rewritten = export_attachments(
                &self.repo,
                self.dispatcher,
                repository_url,
                &text,
                &AttachmentParent {
                    kind: EntityKind::PullRequestReviewComment,
                    model: &model,
                    user: &author,
                    created_date,
                },
            )
            .await?;
            if let Some(text) = model.pointer_mut("/comment/text") {
                *text = Value::String(rewritten);
            }

            if self
                .dispatcher
                .serialize(EntityKind::PullRequestReviewComment, &model)?
                .is_new()
            {
                let url = self
                    .dispatcher
                    .url_for(EntityKind::PullRequestReviewComment, &model)?;
                stack.extend(
                    replies
                        .into_iter()
                        .rev()
                        .map(|reply| (reply, Some(url.clone()))),
                );
            }
        }

        Ok(())
    }
}

struct ReviewThread<'a> {
    pr_ref: &'a Value,
    anchor: &'a Value,
    commit_id: Option<&'a str>,
    review_url: &'a str,
}

fn with_fields(mut value: Value, fields: Vec<(&str, Value)>) -> Value {
    if let Some(object) = value.as_object_mut() {
        for (key, field) in fields {
            object.insert(key.to_string(), field);
        }
    }
    value
}

fn text_of(model: &Value, field: &str) -> String {
    model
        .get(field)
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string()
}

/// Detach a comment's nested `comments` (its replies).
fn take_replies(comment: &mut Value) -> Vec<Value> {
    match comment.as_object_mut().and_then(|o| o.remove("comments")) {
        Some(Value::Array(replies)) => replies,
        _ => Vec::new(),
    }
}

/// Group permissions report lower-cased names; the server matches group
/// names case-insensitively, so recover the proper casing from the group
/// list when possible.
fn proper_group_name(names: &[String], reported: &str) -> String {
    names
        .iter()
        .find(|name| name.to_lowercase() == reported.to_lowercase())
        .cloned()
        .unwrap_or_else(|| reported.to_string())
}
