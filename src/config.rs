use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::export::OptionalModel;

pub const TOKEN_ENV: &str = "BITBUCKET_SERVER_API_TOKEN";
pub const USERNAME_ENV: &str = "BITBUCKET_SERVER_API_USERNAME";
pub const PASSWORD_ENV: &str = "BITBUCKET_SERVER_API_PASSWORD";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub export: ExportConfig,
}

#[derive(Deserialize, Clone)]
pub struct ServerConfig {
    pub base_url: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub read_timeout_secs: Option<u64>,
    #[serde(default)]
    pub open_timeout_secs: Option<u64>,
    #[serde(default)]
    pub retries: Option<u32>,
    #[serde(default = "default_true")]
    pub ssl_verify: bool,
    #[serde(default = "default_true")]
    pub http_cache: bool,
}

// Hand-written so credentials never reach logs.
impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "*******"))
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "*******"))
            .field("read_timeout_secs", &self.read_timeout_secs)
            .field("open_timeout_secs", &self.open_timeout_secs)
            .field("retries", &self.retries)
            .field("ssl_verify", &self.ssl_verify)
            .field("http_cache", &self.http_cache)
            .finish()
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExportConfig {
    /// Parent directory for the staging tree. Defaults to the system temp dir.
    #[serde(default)]
    pub staging_root: Option<PathBuf>,
    #[serde(default = "default_models")]
    pub models: Vec<OptionalModel>,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            staging_root: None,
            models: default_models(),
        }
    }
}

fn default_models() -> Vec<OptionalModel> {
    vec![OptionalModel::PullRequests, OptionalModel::Teams]
}

impl Config {
    /// A config pointing at `base_url` with everything else defaulted.
    pub fn for_server(base_url: &str) -> Self {
        Self {
            server: ServerConfig {
                base_url: base_url.to_string(),
                token: None,
                user: None,
                password: None,
                read_timeout_secs: None,
                open_timeout_secs: None,
                retries: None,
                ssl_verify: true,
                http_cache: true,
            },
            export: ExportConfig::default(),
        }
    }

    /// Fill credentials that the file leaves out from the environment.
    pub fn apply_env_credentials(&mut self) {
        if self.server.token.is_none() {
            self.server.token = std::env::var(TOKEN_ENV).ok();
        }
        if self.server.user.is_none() {
            self.server.user = std::env::var(USERNAME_ENV).ok();
        }
        if self.server.password.is_none() {
            self.server.password = std::env::var(PASSWORD_ENV).ok();
        }
    }
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if config.server.base_url.trim().is_empty() {
        anyhow::bail!("server.base_url must not be empty");
    }

    if config.server.read_timeout_secs == Some(0) {
        anyhow::bail!("server.read_timeout_secs must be > 0");
    }

    if config.server.open_timeout_secs == Some(0) {
        anyhow::bail!("server.open_timeout_secs must be > 0");
    }

    if let Some(root) = &config.export.staging_root {
        if !root.is_dir() {
            anyhow::bail!(
                "export.staging_root '{}' is not a directory",
                root.display()
            );
        }
    }

    Ok(config)
}

/// Load and validate the TOML config. Credentials are not required here;
/// the API client reports them missing on its first request.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config = parse_config(&content)?;
    config.apply_env_credentials();
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config_with_defaults() {
        let config = parse_config(
            r#"
[server]
base_url = "https://bitbucket.example.com"
"#,
        )
        .unwrap();

        assert!(config.server.ssl_verify);
        assert!(config.server.http_cache);
        assert_eq!(config.server.retries, None);
        assert_eq!(
            config.export.models,
            vec![OptionalModel::PullRequests, OptionalModel::Teams]
        );
    }

    #[test]
    fn parses_full_config() {
        let config = parse_config(
            r#"
[server]
base_url = "https://bitbucket.example.com"
token = "secret-token"
read_timeout_secs = 300
open_timeout_secs = 30
retries = 5
ssl_verify = false
http_cache = false

[export]
models = ["teams"]
"#,
        )
        .unwrap();

        assert_eq!(config.server.retries, Some(5));
        assert_eq!(config.server.read_timeout_secs, Some(300));
        assert!(!config.server.ssl_verify);
        assert_eq!(config.export.models, vec![OptionalModel::Teams]);
    }

    #[test]
    fn rejects_zero_timeout() {
        let err = parse_config(
            r#"
[server]
base_url = "https://bitbucket.example.com"
read_timeout_secs = 0
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("read_timeout_secs"));
    }

    #[test]
    fn rejects_unknown_model() {
        assert!(parse_config(
            r#"
[server]
base_url = "https://bitbucket.example.com"

[export]
models = ["wikis"]
"#,
        )
        .is_err());
    }

    #[test]
    fn debug_masks_credentials() {
        let mut config = Config::for_server("https://bitbucket.example.com");
        config.server.token = Some("hunter2".to_string());
        config.server.password = Some("hackme".to_string());

        let debug = format!("{:?}", config);
        assert!(!debug.contains("hunter2"));
        assert!(!debug.contains("hackme"));
        assert!(debug.contains("*******"));
    }
}
