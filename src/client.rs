//! Bitbucket Server REST API client.
//!
//! A thin, resilient layer over `reqwest`:
//!
//! - **Authentication**: bearer token when configured, otherwise HTTP basic.
//!   Credentials are checked lazily, so a client without any can still be
//!   built; its first request fails with [`ApiError::MissingCredentials`].
//! - **Pagination**: [`ApiClient::fetch_all`] follows the server's
//!   `isLastPage` / `nextPageStart` protocol with `limit=250`, concatenating
//!   `values` in page order.
//! - **Retries**: timeouts on GET/HEAD are retried up to `retries` times
//!   with exponential backoff (1s, 2s, 4s, ... capped at 32s). Connection
//!   failures are returned unchanged.
//! - **Error enrichment**: 4xx/5xx responses become [`ApiError::Status`]
//!   with the status, URL, and any `errors[].message` from a JSON body.
//! - **Instrumentation**: every call runs through an injected
//!   [`RequestHook`]; the default [`PassThrough`] does nothing.
//! - **Caching**: GET JSON bodies are kept in memory for
//!   [`CACHE_MAX_AGE`] when enabled. The server sends `no-cache`, so this
//!   is the client's own policy.

use base64::Engine;
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use reqwest::{Method, Response, StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::config::ServerConfig;

/// Records requested per page.
pub const PAGE_LIMIT: u32 = 250;

/// Freshness window for cached GET responses (`max-age=3600`).
pub const CACHE_MAX_AGE: Duration = Duration::from_secs(3600);

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0} is not a valid URL!")]
    InvalidBaseUrl(String),

    #[error(
        "Must define `BITBUCKET_SERVER_API_TOKEN` or `BITBUCKET_SERVER_API_USERNAME` AND `BITBUCKET_SERVER_API_PASSWORD`"
    )]
    MissingCredentials,

    /// Connection and transport-security failures, message untouched.
    #[error(transparent)]
    Transport(#[from] reqwest::Error),

    #[error("{message}")]
    Timeout {
        message: String,
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{message}")]
    Status {
        status: StatusCode,
        url: String,
        message: String,
    },

    #[error("Malformed page from {url}: {reason}")]
    MalformedPage { url: String, reason: String },

    #[error("Invalid JSON response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

impl ApiError {
    /// HTTP status for [`ApiError::Status`], so callers can swallow e.g. 404s.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Which REST root a path is relative to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiRoot {
    /// `rest/api/1.0`
    Core,
    /// `rest/api/latest`
    Latest,
    /// `rest/keys/1.0`
    Keys,
    /// `rest/branch-permissions/2.0`
    BranchPermissions,
    /// `rest/branch-utils/1.0`
    BranchUtils,
}

impl ApiRoot {
    fn segments(&self) -> &'static [&'static str] {
        match self {
            ApiRoot::Core => &["rest", "api", "1.0"],
            ApiRoot::Latest => &["rest", "api", "latest"],
            ApiRoot::Keys => &["rest", "keys", "1.0"],
            ApiRoot::BranchPermissions => &["rest", "branch-permissions", "2.0"],
            ApiRoot::BranchUtils => &["rest", "branch-utils", "1.0"],
        }
    }
}

/// An in-flight request as seen by a [`RequestHook`].
pub type ResponseFuture<'a> = Pin<Box<dyn Future<Output = Result<Response, ApiError>> + Send + 'a>>;

/// Wraps every outbound call, e.g. for tracing or metrics.
///
/// Implementations receive the method, the full URL and the request
/// future (retries included), and must return a future that resolves to
/// the same result.
pub trait RequestHook: Send + Sync {
    fn around<'a>(&'a self, method: &Method, url: &str, request: ResponseFuture<'a>)
        -> ResponseFuture<'a>;
}

/// The default hook: returns the request untouched.
pub struct PassThrough;

impl RequestHook for PassThrough {
    fn around<'a>(
        &'a self,
        _method: &Method,
        _url: &str,
        request: ResponseFuture<'a>,
    ) -> ResponseFuture<'a> {
        request
    }
}

/// Logs method, URL, status and elapsed time of each call at debug level.
pub struct TracingHook;

impl RequestHook for TracingHook {
    fn around<'a>(
        &'a self,
        method: &Method,
        url: &str,
        request: ResponseFuture<'a>,
    ) -> ResponseFuture<'a> {
        let method = method.clone();
        let url = url.to_string();
        Box::pin(async move {
            let started = Instant::now();
            let result = request.await;
            let elapsed_ms = started.elapsed().as_millis() as u64;
            match &result {
                Ok(response) => tracing::debug!(
                    %method,
                    %url,
                    status = response.status().as_u16(),
                    elapsed_ms,
                    "request"
                ),
                Err(error) => tracing::debug!(%method, %url, %error, elapsed_ms, "request failed"),
            }
            result
        })
    }
}

#[derive(Clone)]
enum Auth {
    Bearer(String),
    Basic { user: String, password: String },
}

impl Auth {
    /// Bearer wins over basic when both are configured.
    fn from_parts(token: Option<&str>, user: Option<&str>, password: Option<&str>) -> Option<Self> {
        match (token, user, password) {
            (Some(token), _, _) => Some(Auth::Bearer(token.to_string())),
            (None, Some(user), Some(password)) => Some(Auth::Basic {
                user: user.to_string(),
                password: password.to_string(),
            }),
            _ => None,
        }
    }
}

/// Construction options. [`ClientOptions::from_config`] maps the `[server]`
/// table; tests build these directly.
#[derive(Clone)]
pub struct ClientOptions {
    pub token: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub read_timeout: Option<Duration>,
    pub open_timeout: Option<Duration>,
    pub retries: u32,
    pub ssl_verify: bool,
    pub http_cache: bool,
    pub hook: Arc<dyn RequestHook>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            token: None,
            user: None,
            password: None,
            read_timeout: None,
            open_timeout: None,
            retries: 0,
            ssl_verify: true,
            http_cache: false,
            hook: Arc::new(PassThrough),
        }
    }
}

impl ClientOptions {
    pub fn from_config(server: &ServerConfig) -> Self {
        Self {
            token: server.token.clone(),
            user: server.user.clone(),
            password: server.password.clone(),
            read_timeout: server.read_timeout_secs.map(Duration::from_secs),
            open_timeout: server.open_timeout_secs.map(Duration::from_secs),
            retries: server.retries.unwrap_or(0),
            ssl_verify: server.ssl_verify,
            http_cache: server.http_cache,
            hook: Arc::new(TracingHook),
        }
    }
}

struct ResponseCache {
    max_age: Duration,
    entries: HashMap<String, (Instant, Value)>,
}

impl ResponseCache {
    fn new(max_age: Duration) -> Self {
        Self {
            max_age,
            entries: HashMap::new(),
        }
    }

    fn get(&self, url: &str) -> Option<Value> {
        let (stored_at, body) = self.entries.get(url)?;
        if stored_at.elapsed() < self.max_age {
            Some(body.clone())
        } else {
            None
        }
    }

    fn put(&mut self, url: String, body: Value) {
        self.entries.insert(url, (Instant::now(), body));
    }
}

#[derive(Deserialize)]
struct Page {
    values: Vec<Value>,
    #[serde(rename = "isLastPage")]
    is_last_page: bool,
    #[serde(rename = "nextPageStart", default)]
    next_page_start: Option<u64>,
}

pub struct ApiClient {
    base_url: Url,
    user: Option<String>,
    auth: Option<Auth>,
    retries: u32,
    http: reqwest::Client,
    hook: Arc<dyn RequestHook>,
    cache: Option<Mutex<ResponseCache>>,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let auth = match &self.auth {
            Some(Auth::Bearer(_)) => "Bearer *******".to_string(),
            Some(Auth::Basic { user, .. }) => format!("Basic {}:*******", user),
            None => "none".to_string(),
        };
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url.as_str())
            .field("auth", &auth)
            .field("retries", &self.retries)
            .field("cache", &self.cache.is_some())
            .finish()
    }
}

impl ApiClient {
    /// Build a client. Fails only on a malformed base URL.
    pub fn new(base_url: &str, options: ClientOptions) -> Result<Self, ApiError> {
        let parsed = Url::parse(base_url)
            .ok()
            .filter(|url| matches!(url.scheme(), "http" | "https") && url.has_host())
            .ok_or_else(|| ApiError::InvalidBaseUrl(base_url.to_string()))?;

        let mut builder = reqwest::Client::builder().danger_accept_invalid_certs(!options.ssl_verify);
        if let Some(timeout) = options.read_timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(timeout) = options.open_timeout {
            builder = builder.connect_timeout(timeout);
        }
        let http = builder.build()?;

        Ok(Self {
            base_url: parsed,
            auth: Auth::from_parts(
                options.token.as_deref(),
                options.user.as_deref(),
                options.password.as_deref(),
            ),
            user: options.user,
            retries: options.retries,
            http,
            hook: options.hook,
            cache: options
                .http_cache
                .then(|| Mutex::new(ResponseCache::new(CACHE_MAX_AGE))),
        })
    }

    pub fn from_config(server: &ServerConfig) -> Result<Self, ApiError> {
        Self::new(&server.base_url, ClientOptions::from_config(server))
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// The configured user name, if any.
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// `Authorization` header value for tools outside this client (git).
    pub fn authorization_header(&self) -> Option<String> {
        match self.auth.as_ref()? {
            Auth::Bearer(token) => Some(format!("Bearer {}", token)),
            Auth::Basic { user, password } => {
                let encoded = base64::engine::general_purpose::STANDARD
                    .encode(format!("{}:{}", user, password));
                Some(format!("Basic {}", encoded))
            }
        }
    }

    /// Build `{base}/{root}/{path...}?{query}`, percent-encoding each segment.
    pub fn encode_url(
        &self,
        root: ApiRoot,
        path: &[&str],
        query: &[(&str, String)],
    ) -> Result<Url, ApiError> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| ApiError::InvalidBaseUrl(self.base_url.to_string()))?;
            segments.pop_if_empty();
            segments.extend(root.segments());
            segments.extend(path);
        }
        if !query.is_empty() {
            url.query_pairs_mut()
                .extend_pairs(query.iter().map(|(k, v)| (*k, v.as_str())));
        }
        Ok(url)
    }

    /// GET a single record or an unpaginated collection under `rest/api/1.0`.
    pub async fn fetch_one(&self, path: &[&str], query: &[(&str, String)]) -> Result<Value, ApiError> {
        self.fetch_one_at(ApiRoot::Core, path, query).await
    }

    pub async fn fetch_one_at(
        &self,
        root: ApiRoot,
        path: &[&str],
        query: &[(&str, String)],
    ) -> Result<Value, ApiError> {
        let url = self.encode_url(root, path, query)?;
        self.get_json(url).await
    }

    /// GET every page of a paginated collection under `rest/api/1.0`.
    pub async fn fetch_all(
        &self,
        path: &[&str],
        query: &[(&str, String)],
    ) -> Result<Vec<Value>, ApiError> {
        self.fetch_all_at(ApiRoot::Core, path, query).await
    }

    pub async fn fetch_all_at(
        &self,
        root: ApiRoot,
        path: &[&str],
        query: &[(&str, String)],
    ) -> Result<Vec<Value>, ApiError> {
        let mut values = Vec::new();
        let mut start: Option<u64> = None;

        loop {
            let mut params = query.to_vec();
            params.push(("limit", PAGE_LIMIT.to_string()));
            if let Some(start) = start {
                params.push(("start", start.to_string()));
            }

            let url = self.encode_url(root, path, &params)?;
            let url_string = url.to_string();
            let body = self.get_json(url).await?;
            let page: Page = serde_json::from_value(body).map_err(|e| ApiError::MalformedPage {
                url: url_string.clone(),
                reason: e.to_string(),
            })?;

            values.extend(page.values);

            if page.is_last_page {
                break;
            }
            match page.next_page_start {
                Some(next) => start = Some(next),
                None => {
                    return Err(ApiError::MalformedPage {
                        url: url_string,
                        reason: "nextPageStart missing on a non-final page".to_string(),
                    })
                }
            }
        }

        Ok(values)
    }

    /// HEAD under `rest/api/1.0`, returning the response headers.
    pub async fn head(&self, path: &[&str], query: &[(&str, String)]) -> Result<HeaderMap, ApiError> {
        let url = self.encode_url(ApiRoot::Core, path, query)?;
        let response = self.execute(Method::HEAD, url).await?;
        Ok(response.headers().clone())
    }

    /// GET raw bytes plus the response content type. Never cached.
    pub async fn fetch_bytes(
        &self,
        root: ApiRoot,
        path: &[&str],
    ) -> Result<(Vec<u8>, Option<String>), ApiError> {
        let url = self.encode_url(root, path, &[])?;
        let response = self.execute(Method::GET, url).await?;
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());
        let bytes = response.bytes().await?;
        Ok((bytes.to_vec(), content_type))
    }

    async fn get_json(&self, url: Url) -> Result<Value, ApiError> {
        if let Some(cached) = self.cached(url.as_str()) {
            tracing::trace!(url = %url, "cache hit");
            return Ok(cached);
        }

        let url_string = url.to_string();
        let response = self.execute(Method::GET, url).await?;
        let body: Value = response.json().await.map_err(|source| ApiError::Decode {
            url: url_string.clone(),
            source,
        })?;

        self.store(url_string, &body);
        Ok(body)
    }

    fn cached(&self, url: &str) -> Option<Value> {
        let cache = self.cache.as_ref()?.lock().ok()?;
        cache.get(url)
    }

    fn store(&self, url: String, body: &Value) {
        if let Some(cache) = &self.cache {
            if let Ok(mut cache) = cache.lock() {
                cache.put(url, body.clone());
            }
        }
    }

    async fn execute(&self, method: Method, url: Url) -> Result<Response, ApiError> {
        let auth = self.auth.as_ref().ok_or(ApiError::MissingCredentials)?;
        let url_string = url.to_string();
        let request = Box::pin(self.send_with_retries(method.clone(), url, auth));
        self.hook.around(&method, &url_string, request).await
    }

    async fn send_with_retries(
        &self,
        method: Method,
        url: Url,
        auth: &Auth,
    ) -> Result<Response, ApiError> {
        let mut attempt: u32 = 0;

        loop {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let request = self.http.request(method.clone(), url.clone());
            let request = match auth {
                Auth::Bearer(token) => request.bearer_auth(token),
                Auth::Basic { user, password } => request.basic_auth(user, Some(password)),
            };

            match request.send().await {
                Ok(response) => return check_status(&method, &url, response).await,
                Err(e) if e.is_timeout() && attempt < self.retries => {
                    tracing::debug!(%method, url = %url, attempt, "request timed out, retrying");
                    attempt += 1;
                }
                Err(e) if e.is_timeout() => {
                    return Err(ApiError::Timeout {
                        message: timeout_message(self.retries, &method, url.as_str()),
                        url: url.to_string(),
                        source: e,
                    })
                }
                Err(e) => return Err(ApiError::Transport(e)),
            }
        }
    }
}

async fn check_status(method: &Method, url: &Url, response: Response) -> Result<Response, ApiError> {
    let status = response.status();
    if !(status.is_client_error() || status.is_server_error()) {
        return Ok(response);
    }

    let body = response.bytes().await.unwrap_or_default();
    Err(ApiError::Status {
        status,
        url: url.to_string(),
        message: status_message(status, method, url.as_str(), &body),
    })
}

fn timeout_message(retries: u32, method: &Method, url: &str) -> String {
    if retries > 0 {
        format!("Timed out {} times during {} to {}", retries, method, url)
    } else {
        format!("Timed out during {} to {}", method, url)
    }
}

/// `"404 on GET to <url>"`, plus the server's `errors[].message` values.
fn status_message(status: StatusCode, method: &Method, url: &str, body: &[u8]) -> String {
    let mut message = format!("{} on {} to {}", status.as_u16(), method, url);

    let errors = serde_json::from_slice::<Value>(body).ok().and_then(|json| {
        json.get("errors").and_then(Value::as_array).map(|errors| {
            errors
                .iter()
                .filter_map(|e| e.get("message").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join(" ")
        })
    });

    if let Some(errors) = errors {
        message.push_str(": ");
        message.push_str(&errors);
    }

    message
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base_url: &str) -> ApiClient {
        ApiClient::new(
            base_url,
            ClientOptions {
                user: Some("unit-test".to_string()),
                password: Some("hackme".to_string()),
                ..ClientOptions::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn encodes_limit_and_start() {
        let client = client("https://example.com");
        let url = client
            .encode_url(
                ApiRoot::Core,
                &["some", "path"],
                &[("limit", "1000".to_string()), ("start", "25".to_string())],
            )
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://example.com/rest/api/1.0/some/path?limit=1000&start=25"
        );
    }

    #[test]
    fn keeps_base_path_prefix_and_escapes_segments() {
        let client = client("https://example.com/bitbucket/");
        let url = client
            .encode_url(ApiRoot::Core, &["users", "has@weird/slug"], &[])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://example.com/bitbucket/rest/api/1.0/users/has@weird%2Fslug"
        );
    }

    #[test]
    fn plugin_roots_sit_beside_the_core_api() {
        let client = client("https://example.com");
        let url = client
            .encode_url(ApiRoot::BranchPermissions, &["projects", "MIGR", "restrictions"], &[])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://example.com/rest/branch-permissions/2.0/projects/MIGR/restrictions"
        );
        let url = client
            .encode_url(ApiRoot::BranchUtils, &["branchmodel"], &[])
            .unwrap();
        assert_eq!(url.as_str(), "https://example.com/rest/branch-utils/1.0/branchmodel");
    }

    #[test]
    fn rejects_non_http_base_url() {
        let err = ApiClient::new("ssh://example.com", ClientOptions::default()).unwrap_err();
        assert_eq!(err.to_string(), "ssh://example.com is not a valid URL!");
    }

    #[test]
    fn bearer_preferred_over_basic() {
        let auth = Auth::from_parts(Some("token"), Some("user"), Some("pass"));
        assert!(matches!(auth, Some(Auth::Bearer(_))));

        let auth = Auth::from_parts(None, Some("user"), Some("pass"));
        assert!(matches!(auth, Some(Auth::Basic { .. })));

        assert!(Auth::from_parts(None, Some("user"), None).is_none());
        assert!(Auth::from_parts(None, None, Some("pass")).is_none());
    }

    #[test]
    fn debug_masks_password_and_token() {
        let basic = client("https://example.com");
        let debug = format!("{:?}", basic);
        assert!(!debug.contains("hackme"));
        assert!(debug.contains("*******"));

        let bearer = ApiClient::new(
            "https://example.com",
            ClientOptions {
                token: Some("123456".to_string()),
                ..ClientOptions::default()
            },
        )
        .unwrap();
        assert!(!format!("{:?}", bearer).contains("123456"));
    }

    #[test]
    fn status_message_includes_server_errors() {
        let body = br#"{"errors":[{"message":"Project FOO does not exist."},{"message":"Try again."}]}"#;
        let message = status_message(
            StatusCode::NOT_FOUND,
            &Method::GET,
            "https://example.com/rest/api/1.0/projects/FOO",
            body,
        );
        assert_eq!(
            message,
            "404 on GET to https://example.com/rest/api/1.0/projects/FOO: Project FOO does not exist. Try again."
        );
    }

    #[test]
    fn status_message_without_json_body() {
        let message = status_message(
            StatusCode::INTERNAL_SERVER_ERROR,
            &Method::GET,
            "https://example.com/x",
            b"<html>oops</html>",
        );
        assert_eq!(message, "500 on GET to https://example.com/x");
    }

    #[test]
    fn timeout_message_mentions_retries() {
        assert_eq!(
            timeout_message(5, &Method::GET, "https://example.com/x"),
            "Timed out 5 times during GET to https://example.com/x"
        );
        assert_eq!(
            timeout_message(0, &Method::GET, "https://example.com/x"),
            "Timed out during GET to https://example.com/x"
        );
    }

    #[test]
    fn cache_entries_expire() {
        let mut cache = ResponseCache::new(Duration::from_secs(3600));
        cache.put("a".to_string(), serde_json::json!({"k": 1}));
        assert_eq!(cache.get("a"), Some(serde_json::json!({"k": 1})));
        assert_eq!(cache.get("b"), None);

        let mut expired = ResponseCache::new(Duration::ZERO);
        expired.put("a".to_string(), serde_json::json!(1));
        assert_eq!(expired.get("a"), None);
    }
}
