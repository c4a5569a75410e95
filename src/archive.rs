//! Staging area and packaging for one export job.
//!
//! The [`ArchiveBuilder`] owns a temporary staging directory and everything
//! written into it:
//!
//! ```text
//! <staging>/
//!   users_000001.json ...          one ShardWriter per entity kind
//!   repositories/<KEY>/<slug>.git  bare mirrors
//!   attachments/<hash>.<ext>       downloaded attachment blobs
//!   urls.json                      URL template map
//!   schema.json                    {"version": "1.2.0"}
//! ```
//!
//! [`ArchiveBuilder::finalize`] packs the tree into a `.tar.gz` and removes
//! the staging directory. If the job fails before that, dropping the
//! builder removes it as well.

use anyhow::{anyhow, Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::Url;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

use crate::dispatch::SeenCache;
use crate::git::RepoMirror;
use crate::models::EntityKind;
use crate::writer::ShardWriter;

pub const SCHEMA_VERSION: &str = "1.2.0";

pub struct ArchiveBuilder {
    staging: TempDir,
    writers: BTreeMap<EntityKind, ShardWriter>,
    seen: SeenCache,
    mirror: Arc<dyn RepoMirror>,
    templates: Value,
}

impl ArchiveBuilder {
    /// Create the staging directory under `staging_root`, or the system
    /// temp dir when `None`.
    pub fn new(
        staging_root: Option<&Path>,
        mirror: Box<dyn RepoMirror>,
        templates: Value,
    ) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("bbs-export");
        let staging = match staging_root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        }
        .with_context(|| "Failed to create staging directory")?;

        tracing::debug!(staging = %staging.path().display(), "created staging directory");

        Ok(Self {
            staging,
            writers: BTreeMap::new(),
            seen: SeenCache::default(),
            mirror: Arc::from(mirror),
            templates,
        })
    }

    pub fn staging_dir(&self) -> &Path {
        self.staging.path()
    }

    pub fn write(&mut self, kind: EntityKind, record: Value) -> Result<()> {
        self.writer_for(kind).add(record)
    }

    fn writer_for(&mut self, kind: EntityKind) -> &mut ShardWriter {
        let dir = self.staging.path();
        self.writers
            .entry(kind)
            .or_insert_with(|| ShardWriter::new(dir, kind))
    }

    pub fn is_seen(&self, kind: EntityKind, url: &str) -> bool {
        self.seen.contains(kind, url)
    }

    pub fn mark_seen(&mut self, kind: EntityKind, url: String) {
        self.seen.insert(kind, url);
    }

    /// True once any record has been written.
    pub fn is_used(&self) -> bool {
        !self.writers.is_empty()
    }

    /// Records written per kind.
    pub fn record_counts(&self) -> BTreeMap<EntityKind, u64> {
        self.writers
            .iter()
            .map(|(kind, writer)| (*kind, writer.records()))
            .collect()
    }

    /// Store a blob under `attachments/<segments...>`, creating parents.
    pub fn save_attachment(&self, data: &[u8], segments: &[&str]) -> Result<PathBuf> {
        let mut target = self.staging.path().join("attachments");
        target.extend(segments);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        std::fs::write(&target, data)
            .with_context(|| format!("Failed to write attachment: {}", target.display()))?;
        Ok(target)
    }

    /// `<staging>/repositories/<KEY>/<slug>.git`
    pub fn repo_path(&self, project_key: &str, slug: &str) -> PathBuf {
        self.staging
            .path()
            .join("repositories")
            .join(project_key)
            .join(format!("{}.git", slug))
    }

    /// Mirror the repository's git data into the staging tree. The clone
    /// runs on the blocking pool.
    pub async fn mirror_repository(
        &self,
        repository: &Value,
        user: Option<&str>,
    ) -> Result<PathBuf> {
        let project_key = repository
            .pointer("/project/key")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("Repository is missing project.key"))?;
        let slug = repository
            .get("slug")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("Repository is missing slug"))?;
        let url = repo_clone_url(repository, user)
            .ok_or_else(|| anyhow!("Repository {}/{} has no http clone link", project_key, slug))?;

        let target = self.repo_path(project_key, slug);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let mirror = Arc::clone(&self.mirror);
        let destination = target.clone();
        tokio::task::spawn_blocking(move || mirror.clone_mirror(&url, &destination))
            .await
            .with_context(|| format!("Mirroring {}/{} did not complete", project_key, slug))??;
        Ok(target)
    }

    fn write_json_file(&self, name: &str, contents: &Value) -> Result<()> {
        let path = self.staging.path().join(name);
        let json = serde_json::to_string_pretty(contents)?;
        std::fs::write(&path, json)
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    /// Close all writers, write `urls.json` and `schema.json`, pack the
    /// staging tree into `output` and delete it.
    pub fn finalize(mut self, output: &Path) -> Result<()> {
        for writer in self.writers.values_mut() {
            writer.close()?;
        }

        self.write_json_file("urls.json", &self.templates)?;
        self.write_json_file("schema.json", &json!({ "version": SCHEMA_VERSION }))?;

        pack(self.staging.path(), output)?;

        let staging = self.staging.path().to_path_buf();
        self.staging
            .close()
            .with_context(|| format!("Failed to remove staging directory: {}", staging.display()))?;

        tracing::info!(output = %output.display(), "archive written");
        Ok(())
    }
}

/// The repository's `http` clone link with `user` as the URL user name.
pub fn repo_clone_url(repository: &Value, user: Option<&str>) -> Option<String> {
    let href = repository
        .pointer("/links/clone")?
        .as_array()?
        .iter()
        .find(|link| link.get("name").and_then(Value::as_str) == Some("http"))?
        .get("href")?
        .as_str()?;

    let mut url = Url::parse(href).ok()?;
    if let Some(user) = user {
        url.set_username(user).ok()?;
    }
    Some(url.to_string())
}

fn pack(staging: &Path, output: &Path) -> Result<()> {
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    let file = File::create(output)
        .with_context(|| format!("Failed to create archive: {}", output.display()))?;
    let mut tar = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    tar.append_dir_all(".", staging)
        .with_context(|| format!("Failed to pack {}", staging.display()))?;
    tar.into_inner()?.finish()?;
    Ok(())
}
