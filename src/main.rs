//! # bbs-export CLI
//!
//! ## Usage
//!
//! ```bash
//! bbs-export --config ./config/bbs-export.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `bbs-export export` | Export repositories into a `.tar.gz` archive |
//! | `bbs-export repos` | List the repositories of a project |
//!
//! ## Examples
//!
//! ```bash
//! # One repository, default models
//! bbs-export export --repo MIGR/hugo --output migration.tar.gz
//!
//! # A whole project plus a personal repository, teams only
//! bbs-export export --project MIGR --repo ~ANN/dotfiles \
//!     --models teams --output migration.tar.gz
//!
//! # Machine-readable progress
//! bbs-export export --repo MIGR/hugo --output out.tar.gz --progress json
//! ```
//!
//! Logs go to stderr and honour `RUST_LOG` (default `info`).

use anyhow::bail;
use bbs_export::bitbucket::BitbucketServer;
use bbs_export::client::ApiClient;
use bbs_export::config;
use bbs_export::export::{run_export, OptionalModel, RepoRef};
use bbs_export::progress::ProgressMode;
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Export Bitbucket Server data into a migration archive.
///
/// Credentials come from the config file or from `BITBUCKET_SERVER_API_TOKEN`,
/// `BITBUCKET_SERVER_API_USERNAME` and `BITBUCKET_SERVER_API_PASSWORD`.
#[derive(Parser)]
#[command(name = "bbs-export", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/bbs-export.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Export repositories into a `.tar.gz` archive.
    Export {
        /// Repository to export, as `KEY/slug`. Repeatable.
        #[arg(long = "repo")]
        repos: Vec<RepoRef>,

        /// Export every repository of this project. Repeatable.
        #[arg(long = "project")]
        projects: Vec<String>,

        /// Archive path to write.
        #[arg(long)]
        output: PathBuf,

        /// Optional models to export; overrides `export.models`.
        #[arg(long, value_enum, value_delimiter = ',')]
        models: Option<Vec<OptionalModel>>,

        /// Progress on stderr. Defaults to `human` on a TTY, else `off`.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// List the repositories of a project.
    Repos {
        /// Project key.
        #[arg(long)]
        project: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Export {
            repos,
            projects,
            output,
            models,
            progress,
        } => {
            if repos.is_empty() && projects.is_empty() {
                bail!("Nothing to export: pass --repo KEY/slug or --project KEY");
            }
            if let Some(models) = models {
                cfg.export.models = models;
            }
            let mode = progress.unwrap_or_else(ProgressMode::default_for_tty);

            let summary = run_export(&cfg, &projects, &repos, &output, mode.reporter()).await?;

            println!("Export complete:");
            for repository in &summary.repositories {
                println!("  repository: {}", repository);
            }
            for (kind, stats) in &summary.stats {
                println!(
                    "  {:<28} {:>7} written  {:>7} duplicate  {:>5} invalid",
                    kind.plural(),
                    stats.serialized,
                    stats.skipped,
                    stats.invalid
                );
            }
            match &summary.archive {
                Some(path) => println!("  archive: {}", path.display()),
                None => println!("  archive: (nothing exported)"),
            }
            println!("ok");
        }
        Commands::Repos { project } => {
            let server = BitbucketServer::new(ApiClient::from_config(&cfg.server)?);
            let repositories = server.project(&project).repositories().await?;
            for repository in &repositories {
                let slug = repository.get("slug").and_then(Value::as_str).unwrap_or("?");
                let name = repository.get("name").and_then(Value::as_str).unwrap_or("");
                println!("{}/{}  {}", project, slug, name);
            }
            println!("{} repositories", repositories.len());
        }
    }

    Ok(())
}
