//! Repository mirroring through the `git` binary.

use anyhow::{bail, Context, Result};
use std::path::Path;
use std::process::Command;

/// Produces a bare mirror of a remote repository at `target`.
///
/// Implementations may block. The archive builder calls them from
/// `tokio::task::spawn_blocking`.
pub trait RepoMirror: Send + Sync {
    fn clone_mirror(&self, url: &str, target: &Path) -> Result<()>;
}

/// `git clone --mirror`, with an optional `Authorization` header and TLS
/// verification switch passed as per-command config.
#[derive(Clone, Default)]
pub struct GitCli {
    ssl_verify: bool,
    auth_header: Option<String>,
}

impl std::fmt::Debug for GitCli {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitCli")
            .field("ssl_verify", &self.ssl_verify)
            .field("auth_header", &self.auth_header.as_ref().map(|_| "*******"))
            .finish()
    }
}

impl GitCli {
    /// `auth_header` is the full header value, e.g. `Bearer <token>`.
    pub fn new(ssl_verify: bool, auth_header: Option<String>) -> Self {
        Self {
            ssl_verify,
            auth_header,
        }
    }

    fn args(&self, url: &str, target: &Path) -> Vec<String> {
        let mut args = Vec::new();
        if !self.ssl_verify {
            args.push("-c".to_string());
            args.push("http.sslVerify=false".to_string());
        }
        if let Some(header) = &self.auth_header {
            args.push("-c".to_string());
            args.push(format!("http.extraHeader=Authorization: {}", header));
        }
        args.push("clone".to_string());
        args.push("--mirror".to_string());
        args.push(url.to_string());
        args.push(target.to_string_lossy().into_owned());
        args
    }
}

impl RepoMirror for GitCli {
    fn clone_mirror(&self, url: &str, target: &Path) -> Result<()> {
        tracing::info!(%url, target = %target.display(), "mirroring repository");

        let output = Command::new("git")
            .args(self.args(url, target))
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()
            .with_context(|| "Failed to execute 'git clone'. Is git installed?")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("git clone failed: {}", stderr.trim());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_mirror_args() {
        let git = GitCli::new(true, None);
        assert_eq!(
            git.args("https://bbs.example.com/scm/migr/hugo.git", Path::new("/tmp/hugo.git")),
            vec![
                "clone",
                "--mirror",
                "https://bbs.example.com/scm/migr/hugo.git",
                "/tmp/hugo.git"
            ]
        );
    }

    #[test]
    fn auth_and_ssl_args_come_first() {
        let git = GitCli::new(false, Some("Bearer abc".to_string()));
        let args = git.args("https://x/scm/a/b.git", Path::new("b.git"));
        assert_eq!(
            &args[..4],
            &[
                "-c",
                "http.sslVerify=false",
                "-c",
                "http.extraHeader=Authorization: Bearer abc"
            ]
        );
        assert_eq!(args[4], "clone");
    }

    #[test]
    fn debug_hides_header() {
        let git = GitCli::new(true, Some("Bearer secret".to_string()));
        assert!(!format!("{:?}", git).contains("secret"));
    }

    #[test]
    fn clone_of_missing_repository_fails() {
        let tmp = tempfile::TempDir::new().unwrap();
        let missing = tmp.path().join("does-not-exist.git");
        let target = tmp.path().join("mirror.git");
        let result = GitCli::new(true, None).clone_mirror(&missing.to_string_lossy(), &target);
        assert!(result.is_err());
    }
}
