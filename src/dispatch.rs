//! Serialize-and-deduplicate dispatch.
//!
//! Every record headed for the archive goes through
//! [`Dispatcher::serialize`]:
//!
//! 1. Compute the canonical URL. If that fails the record is `Invalid`.
//! 2. If `(kind, url)` is in the [`SeenCache`], return `AlreadySerialized`
//!    without touching the transformer or the writer.
//! 3. Transform. A validation failure is logged and returned as `Invalid`.
//! 4. Write, mark seen, return `Serialized`.
//!
//! Only I/O failures are errors; validation problems never abort a job.

use anyhow::Result;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::archive::ArchiveBuilder;
use crate::models::EntityKind;
use crate::serializers::Transformer;
use crate::urls::{UrlError, UrlLookup};

/// Canonical URLs archived so far, per kind.
#[derive(Debug, Default)]
pub struct SeenCache {
    seen: HashMap<EntityKind, HashSet<String>>,
}

impl SeenCache {
    pub fn contains(&self, kind: EntityKind, url: &str) -> bool {
        self.seen.get(&kind).is_some_and(|urls| urls.contains(url))
    }

    /// Returns false if the URL was already present.
    pub fn insert(&mut self, kind: EntityKind, url: String) -> bool {
        self.seen.entry(kind).or_default().insert(url)
    }

    pub fn len(&self) -> usize {
        self.seen.values().map(HashSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result of one [`Dispatcher::serialize`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Serialized,
    AlreadySerialized,
    Invalid(String),
}

impl Outcome {
    /// True when this call wrote the record.
    pub fn is_new(&self) -> bool {
        matches!(self, Outcome::Serialized)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct KindStats {
    pub serialized: u64,
    pub skipped: u64,
    pub invalid: u64,
}

pub struct Dispatcher {
    archive: ArchiveBuilder,
    urls: Box<dyn UrlLookup>,
    transformer: Box<dyn Transformer>,
    stats: BTreeMap<EntityKind, KindStats>,
}

impl Dispatcher {
    pub fn new(
        archive: ArchiveBuilder,
        urls: Box<dyn UrlLookup>,
        transformer: Box<dyn Transformer>,
    ) -> Self {
        Self {
            archive,
            urls,
            transformer,
            stats: BTreeMap::new(),
        }
    }

    pub fn serialize(&mut self, kind: EntityKind, model: &Value) -> Result<Outcome> {
        let url = match self.urls.url_for(kind, model) {
            Ok(url) => url,
            Err(error) => {
                tracing::warn!(%kind, %error, "record has no canonical url, skipping");
                self.stats.entry(kind).or_default().invalid += 1;
                return Ok(Outcome::Invalid(error.to_string()));
            }
        };

        if self.archive.is_seen(kind, &url) {
            tracing::info!(%kind, %url, "already serialized");
            self.stats.entry(kind).or_default().skipped += 1;
            return Ok(Outcome::AlreadySerialized);
        }

        let record = match self.transformer.transform(kind, model, self.urls.as_ref()) {
            Ok(record) => record,
            Err(error) => {
                tracing::warn!(%kind, %url, %error, "invalid record, skipping");
                self.stats.entry(kind).or_default().invalid += 1;
                return Ok(Outcome::Invalid(error.to_string()));
            }
        };

        self.archive.write(kind, record)?;
        self.archive.mark_seen(kind, url.clone());
        self.stats.entry(kind).or_default().serialized += 1;
        tracing::info!(%kind, %url, "serialized to json");

        Ok(Outcome::Serialized)
    }

    /// Canonical URL of `model`, for cross-references built by callers.
    pub fn url_for(&self, kind: EntityKind, model: &Value) -> Result<String, UrlError> {
        self.urls.url_for(kind, model)
    }

    pub fn stats(&self) -> &BTreeMap<EntityKind, KindStats> {
        &self.stats
    }

    pub fn archive(&self) -> &ArchiveBuilder {
        &self.archive
    }

    pub fn into_archive(self) -> ArchiveBuilder {
        self.archive
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::RepoMirror;
    use crate::serializers::{DefaultTransformer, ValidationError};
    use crate::urls::ModelUrls;
    use serde_json::json;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct NoMirror;

    impl RepoMirror for NoMirror {
        fn clone_mirror(&self, _url: &str, _target: &Path) -> Result<()> {
            Ok(())
        }
    }

    /// Counts calls, then delegates.
    struct CountingTransformer {
        calls: Arc<AtomicUsize>,
    }

    impl Transformer for CountingTransformer {
        fn transform(
            &self,
            kind: EntityKind,
            model: &Value,
            urls: &dyn UrlLookup,
        ) -> Result<Value, ValidationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            DefaultTransformer::default().transform(kind, model, urls)
        }
    }

    fn dispatcher(root: &Path, calls: Arc<AtomicUsize>) -> Dispatcher {
        let archive = ArchiveBuilder::new(Some(root), Box::new(NoMirror), json!({})).unwrap();
        Dispatcher::new(
            archive,
            Box::new(ModelUrls),
            Box::new(CountingTransformer { calls }),
        )
    }

    fn user(slug: &str) -> Value {
        json!({
            "slug": slug,
            "name": slug,
            "links": {"self": [{"href": format!("https://bbs.example.com/users/{}", slug)}]}
        })
    }

    #[test]
    fn seen_cache_tracks_kinds_separately() {
        let mut cache = SeenCache::default();
        assert!(cache.is_empty());
        assert!(cache.insert(EntityKind::User, "a".to_string()));
        assert!(!cache.insert(EntityKind::User, "a".to_string()));
        assert!(cache.insert(EntityKind::Team, "a".to_string()));
        assert!(cache.contains(EntityKind::User, "a"));
        assert!(!cache.contains(EntityKind::Release, "a"));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn second_serialize_is_skipped() {
        let tmp = tempfile::TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut dispatcher = dispatcher(tmp.path(), calls.clone());

        assert_eq!(
            dispatcher.serialize(EntityKind::User, &user("ann")).unwrap(),
            Outcome::Serialized
        );
        assert_eq!(
            dispatcher.serialize(EntityKind::User, &user("ann")).unwrap(),
            Outcome::AlreadySerialized
        );

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.archive().record_counts()[&EntityKind::User], 1);
        assert_eq!(
            dispatcher.stats()[&EntityKind::User],
            KindStats {
                serialized: 1,
                skipped: 1,
                invalid: 0
            }
        );
    }

    #[test]
    fn invalid_record_is_not_written_or_marked_seen() {
        let tmp = tempfile::TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut dispatcher = dispatcher(tmp.path(), calls.clone());

        let mut broken = user("bob");
        broken["slug"] = Value::Null;

        let outcome = dispatcher.serialize(EntityKind::User, &broken).unwrap();
        assert!(matches!(outcome, Outcome::Invalid(ref msg) if msg.contains("slug")));
        assert!(!dispatcher.archive().is_used());
        assert!(!dispatcher
            .archive()
            .is_seen(EntityKind::User, "https://bbs.example.com/users/bob"));

        assert!(dispatcher.serialize(EntityKind::User, &user("bob")).unwrap().is_new());
    }

    #[test]
    fn missing_url_is_invalid_without_transforming() {
        let tmp = tempfile::TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut dispatcher = dispatcher(tmp.path(), calls.clone());

        let outcome = dispatcher
            .serialize(EntityKind::User, &json!({"slug": "nobody"}))
            .unwrap();
        assert!(matches!(outcome, Outcome::Invalid(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
