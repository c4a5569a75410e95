//! # bbs-export
//!
//! Export Bitbucket Server projects, repositories and pull requests into a
//! migration archive.
//!
//! The exporter walks the REST API one repository at a time, mirrors each
//! git repository, and writes every user, project, repository, team,
//! release, protected branch, pull request, comment, review, event and
//! attachment as JSON records. Everything lands in a staging directory that is packed into a
//! single `.tar.gz` at the end.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌────────────┐   ┌──────────────┐   ┌───────────┐
//! │ Bitbucket    │──▶│  Exporter  │──▶│  Dispatcher  │──▶│  Archive  │
//! │ REST client  │   │ repo / PR  │   │ url+dedup+   │   │ shards +  │
//! │ (paginated)  │   │ walkers    │   │ transform    │   │ git + tgz │
//! └──────────────┘   └────────────┘   └──────────────┘   └───────────┘
//! ```
//!
//! ## Archive layout
//!
//! ```text
//! schema.json                       {"version": "1.2.0"}
//! urls.json                         URL templates
//! users_000001.json                 100 records per shard
//! pull_requests_000001.json
//! ...
//! repositories/<KEY>/<slug>.git     bare mirrors
//! attachments/<hash>.<ext>          attachment blobs
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and credential environment variables |
//! | [`client`] | HTTP client: auth, timeouts, retries, pagination, caching |
//! | [`bitbucket`] | Typed resource handles over the client |
//! | [`models`] | Entity kinds and typed views of API payloads |
//! | [`urls`] | Canonical record URLs |
//! | [`serializers`] | API payload to archive record transformation |
//! | [`correlate`] | Commit timelines and review grouping |
//! | [`branch_permissions`] | Branch restrictions resolved per branch |
//! | [`dispatch`] | Serialize-and-deduplicate dispatch |
//! | [`writer`] | Sharded JSON writer |
//! | [`archive`] | Staging directory, mirroring and packaging |
//! | [`git`] | `git clone --mirror` |
//! | [`attachments`] | Attachment links, downloads and rewriting |
//! | [`export`] | Export orchestration |
//! | [`progress`] | Progress reporting on stderr |

pub mod archive;
pub mod attachments;
pub mod bitbucket;
pub mod branch_permissions;
pub mod client;
pub mod config;
pub mod correlate;
pub mod dispatch;
pub mod export;
pub mod git;
pub mod models;
pub mod progress;
pub mod serializers;
pub mod urls;
pub mod writer;
