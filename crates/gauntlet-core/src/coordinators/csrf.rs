//! CSRF token coordination
//!
//! Tokens are extracted from responses, stored in the run's
//! [`ExecutionContext`] and injected into requests whose method requires
//! one. The coordinator holds configuration only; all state lives in the
//! context it is handed.

use crate::context::ExecutionContext;
use crate::transport::{self, DirectRequest, DirectResponse, Method, RequestBody};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Where a token is read from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum TokenSource {
    /// Cookie set by the response
    Cookie(String),
    /// Response header
    Header(String),
    /// JSON body field by dot path, e.g. `data.items.0.token`
    Body(String),
}

/// Where a token is written to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum TokenTarget {
    /// Request header
    Header(String),
    /// Top-level JSON or form field
    Body(String),
}

/// CSRF configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsrfConfig {
    /// Extraction sources, tried in order
    pub sources: Vec<TokenSource>,
    /// Injection target
    pub target: TokenTarget,
    /// Methods that carry a token
    pub methods: BTreeSet<Method>,
    /// Re-extract from every response
    pub auto_extract: bool,
    /// Endpoint fetched to refresh the token; the run target when unset
    pub refresh_endpoint: Option<String>,
    /// Statuses treated as token rejection
    pub failure_statuses: BTreeSet<u16>,
}

impl Default for CsrfConfig {
    fn default() -> Self {
        Self {
            sources: vec![
                TokenSource::Cookie("csrftoken".to_string()),
                TokenSource::Header("X-CSRF-Token".to_string()),
            ],
            target: TokenTarget::Header("X-CSRF-Token".to_string()),
            methods: Method::STATE_CHANGING.into_iter().collect(),
            auto_extract: true,
            refresh_endpoint: None,
            failure_statuses: [403, 419].into_iter().collect(),
        }
    }
}

impl CsrfConfig {
    /// Django: `csrftoken` cookie, `X-CSRFToken` header
    #[must_use]
    pub fn django() -> Self {
        Self {
            sources: vec![TokenSource::Cookie("csrftoken".to_string())],
            target: TokenTarget::Header("X-CSRFToken".to_string()),
            ..Self::default()
        }
    }

    /// Laravel: `XSRF-TOKEN` cookie, `X-XSRF-TOKEN` header
    #[must_use]
    pub fn laravel() -> Self {
        Self {
            sources: vec![TokenSource::Cookie("XSRF-TOKEN".to_string())],
            target: TokenTarget::Header("X-XSRF-TOKEN".to_string()),
            ..Self::default()
        }
    }

    /// With extraction sources
    #[inline]
    #[must_use]
    pub fn with_sources(mut self, sources: Vec<TokenSource>) -> Self {
        self.sources = sources;
        self
    }

    /// With injection target
    #[inline]
    #[must_use]
    pub fn with_target(mut self, target: TokenTarget) -> Self {
        self.target = target;
        self
    }

    /// With methods that carry a token
    #[inline]
    #[must_use]
    pub fn with_methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.methods = methods.into_iter().collect();
        self
    }

    /// With auto-extract flag
    #[inline]
    #[must_use]
    pub fn with_auto_extract(mut self, auto_extract: bool) -> Self {
        self.auto_extract = auto_extract;
        self
    }

    /// With refresh endpoint
    #[inline]
    #[must_use]
    pub fn with_refresh_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.refresh_endpoint = Some(endpoint.into());
        self
    }

    /// With rejection statuses
    #[inline]
    #[must_use]
    pub fn with_failure_statuses(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
        self.failure_statuses = statuses.into_iter().collect();
        self
    }
}

/// Applies a [`CsrfConfig`] to requests and responses
#[derive(Debug, Clone, Default)]
pub struct CsrfCoordinator {
    config: CsrfConfig,
}

impl CsrfCoordinator {
    /// Create coordinator
    #[inline]
    #[must_use]
    pub fn new(config: CsrfConfig) -> Self {
        Self { config }
    }

    /// Configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &CsrfConfig {
        &self.config
    }

    /// Check if `method` carries a token
    #[inline]
    #[must_use]
    pub fn requires_token(&self, method: Method) -> bool {
        self.config.methods.contains(&method)
    }

    /// Check if `status` signals token rejection
    #[inline]
    #[must_use]
    pub fn is_protocol_failure(&self, status: u16) -> bool {
        self.config.failure_statuses.contains(&status)
    }

    /// Absolute URL of the refresh call
    #[must_use]
    pub fn refresh_url(&self, target: &str) -> String {
        match &self.config.refresh_endpoint {
            Some(endpoint) => transport::resolve_url(target, endpoint),
            None => target.to_string(),
        }
    }

    /// First token found in the configured sources
    #[must_use]
    pub fn extract(&self, response: &DirectResponse) -> Option<String> {
        self.config.sources.iter().find_map(|source| match source {
            TokenSource::Cookie(name) => response.cookie(name).map(str::to_string),
            TokenSource::Header(name) => response.header(name).map(str::to_string),
            TokenSource::Body(path) => {
                let body = response.json().ok()?;
                lookup_path(&body, path)
            }
        })
    }

    /// Store a token from `response` if auto-extract is on
    pub fn observe(&self, response: &DirectResponse, context: &mut ExecutionContext) {
        if self.config.auto_extract {
            self.refresh_from(response, context);
        }
    }

    /// Store a token from `response` unconditionally
    ///
    /// # Returns
    /// `true` if a token was found
    pub fn refresh_from(&self, response: &DirectResponse, context: &mut ExecutionContext) -> bool {
        match self.extract(response) {
            Some(token) => {
                tracing::trace!(status = response.status, "csrf token stored");
                context.set_csrf_token(token);
                true
            }
            None => false,
        }
    }

    /// Inject the stored token if the method requires one
    pub fn inject(&self, request: &mut DirectRequest, context: &ExecutionContext) {
        if !self.requires_token(request.method) {
            return;
        }
        let Some(token) = context.csrf_token() else {
            return;
        };
        match &self.config.target {
            TokenTarget::Header(name) => request.headers.insert(name, token),
            TokenTarget::Body(field) => match &mut request.body {
                RequestBody::Json(serde_json::Value::Object(map)) => {
                    map.insert(field.clone(), serde_json::Value::String(token.to_string()));
                }
                RequestBody::Json(_) => {
                    tracing::warn!(field = %field, "csrf body field needs a JSON object body");
                }
                RequestBody::Form(fields) => {
                    fields.insert(field.clone(), token.to_string());
                }
                RequestBody::Empty => {
                    request.body =
                        RequestBody::Form(BTreeMap::from([(field.clone(), token.to_string())]));
                }
            },
        }
    }
}

/// Resolve a dot path with numeric list indices
fn lookup_path(value: &serde_json::Value, path: &str) -> Option<String> {
    let mut current = value;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        current = match current {
            serde_json::Value::Object(map) => map.get(segment)?,
            serde_json::Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    match current {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
