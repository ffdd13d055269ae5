//! Transport seam
//!
//! The interactive (browser-like) and direct (HTTP-like) sessions are opaque
//! collaborators. This module only fixes the shapes the executor and the
//! retry coordinators need: a request/response model for direct sessions,
//! a minimal interactive surface, and the factory the executor constructs
//! exactly one session from.

use crate::context::ExecutionContext;
use crate::error::TransportError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Request method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Head,
    Options,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    /// Methods that change server state
    pub const STATE_CHANGING: [Method; 4] = [Method::Post, Method::Put, Method::Patch, Method::Delete];

    /// Check if method changes server state
    #[inline]
    #[must_use]
    pub fn is_state_changing(self) -> bool {
        Self::STATE_CHANGING.contains(&self)
    }

    /// Canonical upper-case name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Header map with case-insensitive names
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Headers(BTreeMap<String, String>);

impl<'de> Deserialize<'de> for Headers {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        BTreeMap::<String, String>::deserialize(deserializer).map(|m| m.into_iter().collect())
    }
}

impl Headers {
    /// Create empty header map
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a header
    pub fn insert(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.0.insert(name.as_ref().to_ascii_lowercase(), value.into());
    }

    /// Look up a header
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// Check for a header
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(&name.to_ascii_lowercase())
    }

    /// Iterate `(lower-case name, value)` pairs
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of headers
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// No headers
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Self::new();
        for (k, v) in iter {
            headers.insert(k, v);
        }
        headers
    }
}

/// Request body
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum RequestBody {
    /// No body
    #[default]
    Empty,
    /// JSON document
    Json(serde_json::Value),
    /// URL-encoded form fields
    Form(BTreeMap<String, String>),
}

/// Request issued through a direct session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectRequest {
    /// Method
    pub method: Method,
    /// Absolute URL or path relative to the run target
    pub url: String,
    /// Request headers
    pub headers: Headers,
    /// Request cookies
    pub cookies: BTreeMap<String, String>,
    /// Query parameters
    pub query: Vec<(String, String)>,
    /// Body
    pub body: RequestBody,
}

impl DirectRequest {
    /// Create request
    #[must_use]
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Headers::new(),
            cookies: BTreeMap::new(),
            query: Vec::new(),
            body: RequestBody::Empty,
        }
    }

    /// GET request
    #[inline]
    #[must_use]
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    /// POST request
    #[inline]
    #[must_use]
    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::Post, url)
    }

    /// With header
    #[inline]
    #[must_use]
    pub fn header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// With query parameter
    #[inline]
    #[must_use]
    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    /// With JSON body
    #[inline]
    #[must_use]
    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.body = RequestBody::Json(body);
        self
    }

    /// With form body
    #[inline]
    #[must_use]
    pub fn form(mut self, fields: BTreeMap<String, String>) -> Self {
        self.body = RequestBody::Form(fields);
        self
    }
}

/// Response returned by a direct session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectResponse {
    /// Status code
    pub status: u16,
    /// Response headers
    pub headers: Headers,
    /// Cookies set by the response
    pub cookies: BTreeMap<String, String>,
    /// Raw body
    pub body: String,
    /// Final URL
    pub url: String,
}

impl DirectResponse {
    /// Create response with empty headers and body
    #[must_use]
    pub fn new(status: u16, url: impl Into<String>) -> Self {
        Self {
            status,
            headers: Headers::new(),
            cookies: BTreeMap::new(),
            body: String::new(),
            url: url.into(),
        }
    }

    /// With header
    #[inline]
    #[must_use]
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// With cookie
    #[inline]
    #[must_use]
    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.insert(name.into(), value.into());
        self
    }

    /// With body
    #[inline]
    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// 2xx status
    #[inline]
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Header value
    #[inline]
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// Cookie value
    #[inline]
    #[must_use]
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    /// Parse body as JSON
    pub fn json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_str(&self.body)
    }

    /// Metadata kept in the execution context
    #[must_use]
    pub fn meta(&self) -> ResponseMeta {
        ResponseMeta {
            status: self.status,
            headers: self.headers.clone(),
            url: self.url.clone(),
        }
    }
}

/// Last-response metadata stored in the execution context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseMeta {
    /// Status code
    pub status: u16,
    /// Response headers
    pub headers: Headers,
    /// Final URL
    pub url: String,
}

/// Browser-like session
#[async_trait::async_trait]
pub trait InteractiveSession: Send {
    /// Navigate to URL
    async fn navigate(&mut self, url: &str) -> Result<(), TransportError>;

    /// URL currently loaded
    fn current_url(&self) -> Option<String>;

    /// Set a cookie for the given domain
    async fn set_cookie(
        &mut self,
        name: &str,
        value: &str,
        domain: Option<&str>,
    ) -> Result<(), TransportError>;

    /// Current page source
    async fn page_source(&mut self) -> Result<String, TransportError>;

    /// Header of the last document response, when the session can observe it
    fn response_header(&self, _name: &str) -> Option<String> {
        None
    }

    /// Release the session
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// HTTP-like session
#[async_trait::async_trait]
pub trait DirectSession: Send {
    /// Send one request; the URL is already absolute
    async fn send(&mut self, request: &DirectRequest) -> Result<DirectResponse, TransportError>;

    /// Release the session
    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Constructs sessions for a run
///
/// The executor calls exactly one of these per run, chosen by the
/// procedure's mode. The context is passed so implementations can honor a
/// proxy assignment.
#[async_trait::async_trait]
pub trait TransportFactory: Send + Sync {
    /// Construct an interactive session
    async fn interactive(
        &self,
        context: &ExecutionContext,
    ) -> Result<Box<dyn InteractiveSession>, TransportError>;

    /// Construct a direct session
    async fn direct(&self, context: &ExecutionContext)
        -> Result<Box<dyn DirectSession>, TransportError>;
}

/// Resolve `url` against `base` unless it is already absolute
#[must_use]
pub fn resolve_url(base: &str, url: &str) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        return url.to_string();
    }
    if url.is_empty() {
        return base.to_string();
    }
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        url.trim_start_matches('/')
    )
}

/// `scheme://host[:port]` part of a URL
#[must_use]
pub fn origin(url: &str) -> &str {
    let after_scheme = url.find("://").map_or(0, |i| i + 3);
    match url[after_scheme..].find('/') {
        Some(i) => &url[..after_scheme + i],
        None => url,
    }
}

/// Host part of a URL, without port
#[must_use]
pub fn host(url: &str) -> Option<&str> {
    let origin = origin(url);
    let after_scheme = origin.find("://").map_or(0, |i| i + 3);
    let authority = &origin[after_scheme..];
    let host = authority.split(':').next().unwrap_or(authority);
    (!host.is_empty()).then_some(host)
}
