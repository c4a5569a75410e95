//! Typed access to Bitbucket Server resources.
//!
//! [`BitbucketServer`] is the entry point. Project, repository and pull
//! request handles borrow its [`ApiClient`] and only know how to build
//! their paths:
//!
//! | Handle | Path |
//! |--------|------|
//! | [`ProjectApi`] | `projects/<KEY>` |
//! | [`RepositoryApi`] | `projects/<KEY>/repos/<slug>` |
//! | [`PullRequestApi`] | `projects/<KEY>/repos/<slug>/pull-requests/<id>` |

use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;

use crate::client::{ApiClient, ApiError, ApiRoot};
use crate::models::Commit;

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("Could not find user with username: {0}")]
    UserNotFound(String),

    #[error("Server did not report an authenticated user")]
    NoAuthenticatedUser,

    #[error("Unexpected response for {what}: {reason}")]
    Unexpected { what: String, reason: String },
}

#[derive(Debug)]
pub struct BitbucketServer {
    client: ApiClient,
}

impl BitbucketServer {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }

    /// The configured user name, else the `X-AUSERNAME` header the server
    /// returns for `HEAD application-properties`.
    pub async fn authenticated_user(&self) -> Result<String, ResourceError> {
        if let Some(user) = self.client.user() {
            return Ok(user.to_string());
        }

        let headers = self.client.head(&["application-properties"], &[]).await?;
        headers
            .get("X-AUSERNAME")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string())
            .ok_or(ResourceError::NoAuthenticatedUser)
    }

    /// Exact-name lookup through `users?filter=<name>`.
    pub async fn user(&self, name: &str) -> Result<Value, ResourceError> {
        let users = self
            .client
            .fetch_all(&["users"], &[("filter", name.to_string())])
            .await?;

        users
            .into_iter()
            .find(|user| user.get("name").and_then(Value::as_str) == Some(name))
            .ok_or_else(|| ResourceError::UserNotFound(name.to_string()))
    }

    pub async fn groups(&self) -> Result<Vec<Value>, ResourceError> {
        Ok(self.client.fetch_all(&["admin", "groups"], &[]).await?)
    }

    pub async fn group_members(&self, name: &str) -> Result<Vec<Value>, ResourceError> {
        Ok(self
            .client
            .fetch_all(
                &["admin", "groups", "more-members"],
                &[("context", name.to_string())],
            )
            .await?)
    }

    pub fn project(&self, key: &str) -> ProjectApi<'_> {
        ProjectApi {
            client: &self.client,
            key: key.to_string(),
        }
    }
}

pub struct ProjectApi<'a> {
    client: &'a ApiClient,
    key: String,
}

impl<'a> ProjectApi<'a> {
    /// Personal projects have keys like `~ANN`.
    pub fn is_user_project(&self) -> bool {
        self.key.starts_with('~')
    }

    fn path<'b>(&'b self, rest: &[&'b str]) -> Vec<&'b str> {
        let mut path = vec!["projects", self.key.as_str()];
        path.extend_from_slice(rest);
        path
    }

    pub async fn project(&self) -> Result<Value, ResourceError> {
        Ok(self.client.fetch_one(&self.path(&[]), &[]).await?)
    }

    pub async fn members(&self) -> Result<Vec<Value>, ResourceError> {
        Ok(self
            .client
            .fetch_all(&self.path(&["permissions", "users"]), &[])
            .await?)
    }

    pub async fn repositories(&self) -> Result<Vec<Value>, ResourceError> {
        Ok(self.client.fetch_all(&self.path(&["repos"]), &[]).await?)
    }

    pub fn repository(&self, slug: &str) -> RepositoryApi<'a> {
        RepositoryApi {
            client: self.client,
            project_key: self.key.clone(),
            slug: slug.to_string(),
        }
    }
}

pub struct RepositoryApi<'a> {
    client: &'a ApiClient,
    project_key: String,
    slug: String,
}

impl<'a> RepositoryApi<'a> {
    pub fn project(&self) -> ProjectApi<'a> {
        ProjectApi {
            client: self.client,
            key: self.project_key.clone(),
        }
    }

    fn path<'b>(&'b self, rest: &[&'b str]) -> Vec<&'b str> {
        let mut path = vec![
            "projects",
            self.project_key.as_str(),
            "repos",
            self.slug.as_str(),
        ];
        path.extend_from_slice(rest);
        path
    }

    pub async fn repository(&self) -> Result<Value, ResourceError> {
        Ok(self.client.fetch_one(&self.path(&[]), &[]).await?)
    }

    /// Users with direct repository permissions.
    pub async fn team_members(&self) -> Result<Vec<Value>, ResourceError> {
        Ok(self
            .client
            .fetch_all(&self.path(&["permissions", "users"]), &[])
            .await?)
    }

    /// Group permissions. The server reports group names in lower case.
    pub async fn group_access(&self) -> Result<Vec<Value>, ResourceError> {
        Ok(self
            .client
            .fetch_all(&self.path(&["permissions", "groups"]), &[])
            .await?)
    }

    /// SSH access keys, from the `rest/keys/1.0` API.
    pub async fn access_keys(&self) -> Result<Vec<Value>, ResourceError> {
        Ok(self
            .client
            .fetch_all_at(ApiRoot::Keys, &self.path(&["ssh"]), &[])
            .await?)
    }

    pub async fn branches(&self) -> Result<Vec<Value>, ResourceError> {
        Ok(self.client.fetch_all(&self.path(&["branches"]), &[]).await?)
    }

    /// Branch restrictions from the `rest/branch-permissions/2.0` API. A
    /// server without the branch permissions plugin answers 404, which
    /// yields an empty list.
    pub async fn branch_permissions(&self) -> Result<Vec<Value>, ResourceError> {
        match self
            .client
            .fetch_all_at(ApiRoot::BranchPermissions, &self.path(&["restrictions"]), &[])
            .await
        {
            Ok(values) => Ok(values),
            Err(e) if e.status() == Some(StatusCode::NOT_FOUND) => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// The branching model (development and production branches, branch
    /// type prefixes). `None` when the repository has none, e.g. because
    /// it is empty.
    pub async fn branch_model(&self) -> Result<Option<Value>, ResourceError> {
        match self
            .client
            .fetch_one_at(ApiRoot::BranchUtils, &self.path(&["branchmodel"]), &[])
            .await
        {
            Ok(model) => Ok(Some(model)),
            Err(e)
                if e.status() == Some(StatusCode::NOT_FOUND)
                    || e.status() == Some(StatusCode::CONFLICT) =>
            {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn tags(&self) -> Result<Vec<Value>, ResourceError> {
        Ok(self.client.fetch_all(&self.path(&["tags"]), &[]).await?)
    }

    pub async fn commit(&self, id: &str) -> Result<Value, ResourceError> {
        Ok(self
            .client
            .fetch_one(&self.path(&["commits", id]), &[])
            .await?)
    }

    /// Pull requests in every state.
    pub async fn pull_requests(&self) -> Result<Vec<Value>, ResourceError> {
        Ok(self
            .client
            .fetch_all(&self.path(&["pull-requests"]), &[("state", "ALL".to_string())])
            .await?)
    }

    pub fn pull_request(&self, id: u64) -> PullRequestApi<'a> {
        PullRequestApi {
            client: self.client,
            project_key: self.project_key.clone(),
            slug: self.slug.clone(),
            id: id.to_string(),
        }
    }

    /// Raw attachment bytes and content type.
    pub async fn attachment(&self, id: &str) -> Result<(Vec<u8>, Option<String>), ResourceError> {
        Ok(self
            .client
            .fetch_bytes(ApiRoot::Latest, &self.path(&["attachments", id]))
            .await?)
    }
}

pub struct PullRequestApi<'a> {
    client: &'a ApiClient,
    project_key: String,
    slug: String,
    id: String,
}

impl PullRequestApi<'_> {
    fn path<'b>(&'b self, rest: &[&'b str]) -> Vec<&'b str> {
        let mut path = vec![
            "projects",
            self.project_key.as_str(),
            "repos",
            self.slug.as_str(),
            "pull-requests",
            self.id.as_str(),
        ];
        path.extend_from_slice(rest);
        path
    }

    /// Commits on the pull request. A 404 (e.g. the source branch is gone)
    /// yields an empty list.
    pub async fn commits(&self) -> Result<Vec<Commit>, ResourceError> {
        let values = match self.client.fetch_all(&self.path(&["commits"]), &[]).await {
            Ok(values) => values,
            Err(e) if e.status() == Some(StatusCode::NOT_FOUND) => {
                tracing::debug!(pull_request = %self.id, "commits not found, treating as empty");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        values
            .into_iter()
            .map(|value| {
                serde_json::from_value(value).map_err(|e| ResourceError::Unexpected {
                    what: format!("pull request {} commits", self.id),
                    reason: e.to_string(),
                })
            })
            .collect()
    }

    pub async fn activities(&self) -> Result<Vec<Value>, ResourceError> {
        Ok(self
            .client
            .fetch_all(&self.path(&["activities"]), &[])
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientOptions;

    fn server() -> BitbucketServer {
        BitbucketServer::new(ApiClient::new("https://bbs.example.com", ClientOptions::default()).unwrap())
    }

    #[test]
    fn recognizes_user_projects() {
        let server = server();
        assert!(server.project("~ANN").is_user_project());
        assert!(!server.project("MIGR").is_user_project());
    }

    #[test]
    fn builds_nested_paths() {
        let server = server();
        let project = server.project("MIGR");
        let repository = project.repository("hugo");
        assert_eq!(
            repository.path(&["tags"]),
            vec!["projects", "MIGR", "repos", "hugo", "tags"]
        );
        assert_eq!(
            repository.pull_request(7).path(&["activities"]),
            vec!["projects", "MIGR", "repos", "hugo", "pull-requests", "7", "activities"]
        );
    }

    #[test]
    fn user_not_found_message() {
        assert_eq!(
            ResourceError::UserNotFound("ghost".to_string()).to_string(),
            "Could not find user with username: ghost"
        );
    }
}
